//! Client for the authorisation service.
//!
//! The service is a Launchpad-style XML-RPC endpoint; it owns the mapping
//! from externally meaningful repository paths to storage paths, caller
//! authentication, per-ref write permissions and push notification.
use std::collections::BTreeMap;
use std::time::Duration;

use xmlrpc::{Request as XmlRpcRequest, Value};

use crate::auth::AuthParams;
use crate::error::ErrorKind;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A fault returned by the service.
    #[error("{message}")]
    Fault { code: i32, message: String },
    /// The endpoint could not be reached or replied garbage.
    #[error("authorisation service unavailable: {0}")]
    Transport(String),
    /// The call exceeded the configured timeout.
    #[error("authorisation service timed out")]
    Timeout,
    /// The reply did not have the documented shape.
    #[error("unexpected authorisation service reply: {0}")]
    UnexpectedReply(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Fault { code, .. } => ErrorKind::from_fault_code(*code),
            Error::Timeout => ErrorKind::GatewayTimeout,
            Error::Transport(_) | Error::UnexpectedReply(_) => {
                ErrorKind::InternalServerError
            }
        }
    }
}

/// Access being requested from [`VirtInfo::translate_path`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Read,
    Write,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
        }
    }
}

/// Reply of a successful path translation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Translated {
    /// Opaque path under the repository root.
    pub path: String,
    pub writable: Option<bool>,
    /// Unconsumed path suffix; anything truthy means the repository itself
    /// does not exist.
    pub trailing: Option<String>,
    /// Present when the repository should be created before use. Nil values
    /// have already been dropped.
    pub creation_params: Option<BTreeMap<String, String>>,
}

/// A successfully authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub uid: i64,
}

/// The authorisation service method set.
///
/// Implementations are blocking; async callers go through [`timed`].
pub trait VirtInfo: Send + Sync {
    fn translate_path(
        &self,
        pathname: &str,
        permission: Permission,
        auth: &AuthParams,
    ) -> Result<Translated, Error>;

    fn authenticate_with_password(
        &self,
        user: &str,
        password: &str,
    ) -> Result<Credentials, Error>;

    /// Look up the permission tokens for each of `refs` (opaque bytes;
    /// base64 on the wire both ways).
    fn check_ref_permissions(
        &self,
        path: &str,
        refs: &[Vec<u8>],
        auth: &AuthParams,
    ) -> Result<Vec<(Vec<u8>, Vec<String>)>, Error>;

    fn notify(&self, path: &str) -> Result<(), Error>;

    fn confirm_repo_creation(&self, path: &str, auth: &AuthParams) -> Result<(), Error>;

    fn abort_repo_creation(&self, path: &str, auth: &AuthParams) -> Result<(), Error>;

    fn get_merge_proposal_url(
        &self,
        path: &str,
        branch: &str,
        auth: &AuthParams,
    ) -> Result<Option<String>, Error>;
}

/// Run a blocking authorisation call off the async runtime, bounded by the
/// configured timeout. Expiry surfaces as [`Error::Timeout`], which renders
/// as `GATEWAY_TIMEOUT` on the wire.
pub async fn timed<T, F>(timeout: Duration, call: F) -> Result<T, Error>
where
    F: FnOnce() -> Result<T, Error> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(call)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(Error::Transport(join.to_string())),
        Err(_) => Err(Error::Timeout),
    }
}

/// XML-RPC client for the real service.
#[derive(Debug, Clone)]
pub struct Client {
    endpoint: String,
}

impl Client {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    fn call(&self, request: XmlRpcRequest<'_>) -> Result<Value, Error> {
        request.call_url(self.endpoint.as_str()).map_err(|e| {
            if let Some(fault) = e.fault() {
                Error::Fault {
                    code: fault.fault_code,
                    message: fault.fault_string.clone(),
                }
            } else {
                Error::Transport(e.to_string())
            }
        })
    }
}

fn auth_value(auth: &AuthParams) -> Value {
    let mut fields = BTreeMap::new();
    if let Some(user) = &auth.user {
        fields.insert("user".into(), Value::from(user.as_str()));
    }
    if let Some(uid) = auth.uid {
        fields.insert("uid".into(), Value::Int64(uid));
    }
    for (key, value) in &auth.extra {
        fields.insert(key.clone(), Value::from(value.as_str()));
    }
    if auth.can_authenticate {
        fields.insert("can-authenticate".into(), Value::Bool(true));
    }
    if let Some(request_id) = &auth.request_id {
        fields.insert("request-id".into(), Value::from(request_id.as_str()));
    }
    Value::Struct(fields)
}

fn unexpected(method: &str, value: &Value) -> Error {
    Error::UnexpectedReply(format!("{method} returned {value:?}"))
}

impl VirtInfo for Client {
    fn translate_path(
        &self,
        pathname: &str,
        permission: Permission,
        auth: &AuthParams,
    ) -> Result<Translated, Error> {
        let reply = self.call(
            XmlRpcRequest::new("translatePath")
                .arg(pathname)
                .arg(permission.as_str())
                .arg(auth_value(auth)),
        )?;
        let path = reply
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| unexpected("translatePath", &reply))?
            .to_owned();
        let creation_params = reply.get("creation_params").and_then(Value::as_struct).map(
            |fields| {
                fields
                    .iter()
                    .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_owned())))
                    .collect()
            },
        );
        Ok(Translated {
            path,
            writable: reply.get("writable").and_then(Value::as_bool),
            trailing: reply
                .get("trailing")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
            creation_params,
        })
    }

    fn authenticate_with_password(
        &self,
        user: &str,
        password: &str,
    ) -> Result<Credentials, Error> {
        let reply = self.call(
            XmlRpcRequest::new("authenticateWithPassword")
                .arg(user)
                .arg(password),
        )?;
        let user = reply
            .get("user")
            .and_then(Value::as_str)
            .ok_or_else(|| unexpected("authenticateWithPassword", &reply))?
            .to_owned();
        let uid = reply
            .get("uid")
            .and_then(|v| v.as_i64().or_else(|| v.as_i32().map(i64::from)))
            .ok_or_else(|| unexpected("authenticateWithPassword", &reply))?;
        Ok(Credentials { user, uid })
    }

    fn check_ref_permissions(
        &self,
        path: &str,
        refs: &[Vec<u8>],
        auth: &AuthParams,
    ) -> Result<Vec<(Vec<u8>, Vec<String>)>, Error> {
        let paths = Value::Array(refs.iter().map(|r| Value::Base64(r.clone())).collect());
        let reply = self.call(
            XmlRpcRequest::new("checkRefPermissions")
                .arg(path)
                .arg(paths)
                .arg(auth_value(auth)),
        )?;
        let pairs = reply
            .as_array()
            .ok_or_else(|| unexpected("checkRefPermissions", &reply))?;
        let mut permissions = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let (name, perms) = pair
                .as_array()
                .and_then(|p| match p {
                    [name, perms] => Some((name.as_bytes()?, perms.as_array()?)),
                    _ => None,
                })
                .ok_or_else(|| unexpected("checkRefPermissions", &reply))?;
            let perms = perms
                .iter()
                .map(|p| {
                    p.as_str()
                        .map(ToOwned::to_owned)
                        .ok_or_else(|| unexpected("checkRefPermissions", &reply))
                })
                .collect::<Result<_, _>>()?;
            permissions.push((name.to_vec(), perms));
        }
        Ok(permissions)
    }

    fn notify(&self, path: &str) -> Result<(), Error> {
        self.call(XmlRpcRequest::new("notify").arg(path))?;
        Ok(())
    }

    fn confirm_repo_creation(&self, path: &str, auth: &AuthParams) -> Result<(), Error> {
        self.call(
            XmlRpcRequest::new("confirmRepoCreation")
                .arg(path)
                .arg(auth_value(auth)),
        )?;
        Ok(())
    }

    fn abort_repo_creation(&self, path: &str, auth: &AuthParams) -> Result<(), Error> {
        self.call(
            XmlRpcRequest::new("abortRepoCreation")
                .arg(path)
                .arg(auth_value(auth)),
        )?;
        Ok(())
    }

    fn get_merge_proposal_url(
        &self,
        path: &str,
        branch: &str,
        auth: &AuthParams,
    ) -> Result<Option<String>, Error> {
        let reply = self.call(
            XmlRpcRequest::new("getMergeProposalURL")
                .arg(path)
                .arg(branch)
                .arg(auth_value(auth)),
        )?;
        Ok(reply.as_str().map(ToOwned::to_owned))
    }
}
