//! Public-key authentication against the authorisation endpoint.
use russh::keys::ssh_key::PublicKey;
use xmlrpc::{Request, Value};

/// The identity a successful authentication hands to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Avatar {
    pub username: String,
    pub user_id: i64,
}

/// Key lookup seam. The SSH machinery itself is a library concern; the one
/// thing this service fixes is how an offered key resolves to an avatar.
pub trait KeyAuth: Send + Sync {
    /// Authenticate `username` offering `key`.
    fn authenticate(&self, username: &str, key: &PublicKey) -> Option<Avatar>;
}

/// Asks the authorisation endpoint for the user's registered keys and
/// matches the offered one against them.
#[derive(Debug, Clone)]
pub struct AuthServer {
    endpoint: String,
}

impl AuthServer {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

/// The base64 blob of an offered key, as the endpoint stores it.
fn key_blob(key: &PublicKey) -> Option<String> {
    let openssh = key.to_openssh().ok()?;
    openssh.split_whitespace().nth(1).map(ToOwned::to_owned)
}

impl KeyAuth for AuthServer {
    fn authenticate(&self, username: &str, key: &PublicKey) -> Option<Avatar> {
        let reply = Request::new("getUserAndSSHKeys")
            .arg(username)
            .call_url(self.endpoint.as_str())
            .map_err(|e| tracing::warn!("key lookup for {username} failed: {e}"))
            .ok()?;
        let user_id = reply
            .get("id")
            .and_then(|v| v.as_i64().or_else(|| v.as_i32().map(i64::from)))?;
        let name = reply.get("name").and_then(Value::as_str)?.to_owned();

        let offered = key_blob(key)?;
        let registered = reply.get("keys").and_then(Value::as_array)?;
        let matched = registered.iter().any(|entry| {
            entry
                .as_array()
                .and_then(|pair| pair.get(1))
                .and_then(Value::as_str)
                .is_some_and(|text| text == offered)
        });
        matched.then_some(Avatar {
            username: name,
            user_id,
        })
    }
}
