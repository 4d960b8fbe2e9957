//! Hook RPC server.
//!
//! `git` hook processes spawned by the backend call back into the server
//! over a local stream socket, speaking netstring-framed JSON objects. Every
//! push attempt registers an unguessable key mapping to the repository path
//! and the caller's auth params; the hooks present that key on every call.
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use turnip::auth::AuthParams;
use turnip::virtinfo::{self, VirtInfo};

/// Encode a netstring frame: `<decimal length> ":" <payload> ","`.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut frame = payload.len().to_string().into_bytes();
    frame.push(b':');
    frame.extend_from_slice(payload);
    frame.push(b',');
    frame
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("invalid netstring length")]
    InvalidLength,
    #[error("unterminated netstring")]
    Unterminated,
}

/// Netstring stream deserializer.
#[derive(Debug, Default)]
pub struct Netstrings {
    unparsed: Vec<u8>,
}

impl Netstrings {
    pub fn input(&mut self, bytes: &[u8]) {
        self.unparsed.extend_from_slice(bytes);
    }

    /// Decode and return the next frame payload. Returns [`None`] if the
    /// buffer does not yet hold a complete frame.
    pub fn next_message(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let Some(colon) = self.unparsed.iter().position(|b| *b == b':') else {
            if self.unparsed.len() > 10 || self.unparsed.iter().any(|b| !b.is_ascii_digit())
            {
                return Err(FrameError::InvalidLength);
            }
            return Ok(None);
        };
        let length = std::str::from_utf8(&self.unparsed[..colon])
            .ok()
            .filter(|s| !s.is_empty() && s.len() <= 10)
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or(FrameError::InvalidLength)?;
        let end = colon + 1 + length;
        if self.unparsed.len() <= end {
            return Ok(None);
        }
        if self.unparsed[end] != b',' {
            return Err(FrameError::Unterminated);
        }
        let payload = self.unparsed[colon + 1..end].to_vec();
        self.unparsed.drain(..=end);
        Ok(Some(payload))
    }

    /// Throw away buffered bytes, resynchronising after a framing error.
    pub fn clear(&mut self) {
        self.unparsed.clear();
    }
}

#[derive(Debug, thiserror::Error)]
enum OpError {
    #[error("Unknown key")]
    UnknownKey,
    #[error("{0}")]
    Args(&'static str),
    #[error("{0}")]
    Virt(#[from] virtinfo::Error),
}

#[derive(Debug, Clone)]
struct Session {
    path: String,
    auth: AuthParams,
    /// Permission tokens already fetched for this push, by ref.
    permissions: HashMap<Vec<u8>, Vec<String>>,
}

/// Registry of active pushes and the operations the hooks may invoke.
pub struct Handler {
    virtinfo: Arc<dyn VirtInfo>,
    virtinfo_timeout: Duration,
    sessions: Mutex<HashMap<String, Session>>,
}

impl Handler {
    pub fn new(virtinfo: Arc<dyn VirtInfo>, virtinfo_timeout: Duration) -> Self {
        Self {
            virtinfo,
            virtinfo_timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Register a per-push key. The key lives until [`Handler::unregister_key`].
    pub fn register_key(&self, key: &str, path: &str, auth: AuthParams) {
        self.sessions.lock().unwrap().insert(
            key.to_owned(),
            Session {
                path: path.to_owned(),
                auth,
                permissions: HashMap::new(),
            },
        );
    }

    pub fn unregister_key(&self, key: &str) {
        self.sessions.lock().unwrap().remove(key);
    }

    /// Whether a key is currently registered.
    pub fn is_registered(&self, key: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(key)
    }

    /// Tell the authorisation service a repository changed.
    pub async fn notify(&self, path: &str) -> Result<(), virtinfo::Error> {
        let virtinfo = self.virtinfo.clone();
        let path = path.to_owned();
        virtinfo::timed(self.virtinfo_timeout, move || virtinfo.notify(&path)).await
    }

    fn session(&self, key: &str) -> Result<Session, OpError> {
        self.sessions
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or(OpError::UnknownKey)
    }

    async fn check_ref_permissions(
        &self,
        key: &str,
        refs: Vec<Vec<u8>>,
    ) -> Result<Vec<(Vec<u8>, Vec<String>)>, OpError> {
        let session = self.session(key)?;
        let misses: Vec<Vec<u8>> = refs
            .iter()
            .filter(|r| !session.permissions.contains_key(*r))
            .cloned()
            .collect();
        let mut permissions = session.permissions;
        if !misses.is_empty() {
            let virtinfo = self.virtinfo.clone();
            let path = session.path.clone();
            let auth = session.auth.clone();
            let fetched = virtinfo::timed(self.virtinfo_timeout, move || {
                virtinfo.check_ref_permissions(&path, &misses, &auth)
            })
            .await?;
            permissions.extend(fetched);
            if let Some(session) = self.sessions.lock().unwrap().get_mut(key) {
                session.permissions = permissions.clone();
            }
        }
        Ok(refs
            .into_iter()
            .map(|r| {
                let perms = permissions.get(&r).cloned().unwrap_or_default();
                (r, perms)
            })
            .collect())
    }

    async fn notify_push(
        &self,
        key: &str,
        loose_object_count: Option<u64>,
        pack_count: Option<u64>,
    ) -> Result<(), OpError> {
        let session = self.session(key)?;
        tracing::debug!(
            path = %session.path,
            loose_object_count,
            pack_count,
            "push notification"
        );
        self.notify(&session.path).await?;
        Ok(())
    }

    async fn get_mp_url(&self, key: &str, branch: &str) -> Result<Option<String>, OpError> {
        let session = self.session(key)?;
        let virtinfo = self.virtinfo.clone();
        let branch = branch.to_owned();
        Ok(virtinfo::timed(self.virtinfo_timeout, move || {
            virtinfo.get_merge_proposal_url(&session.path, &branch, &session.auth)
        })
        .await?)
    }
}

fn invalid_command() -> Value {
    json!({"error": "Command must be a JSON object"})
}

/// Handle one decoded message, producing the reply object.
pub async fn dispatch(handler: &Handler, message: &[u8]) -> Value {
    let Ok(value) = serde_json::from_slice::<Value>(message) else {
        return invalid_command();
    };
    let Some(request) = value.as_object() else {
        return invalid_command();
    };
    let Some(op) = request
        .get("op")
        .and_then(Value::as_str)
        .filter(|op| !op.is_empty())
    else {
        return json!({"error": "No op specified"});
    };
    let result = match op {
        "check_ref_permissions" => check_ref_permissions_op(handler, request).await,
        "notify_push" => notify_push_op(handler, request).await,
        "get_mp_url" => get_mp_url_op(handler, request).await,
        other => return json!({"error": format!("Unknown op: {other}")}),
    };
    match result {
        Ok(value) => json!({"result": value}),
        Err(e) => json!({"error": e.to_string()}),
    }
}

fn key_arg(request: &Map<String, Value>) -> Result<&str, OpError> {
    request
        .get("key")
        .and_then(Value::as_str)
        .ok_or(OpError::Args("No key specified"))
}

async fn check_ref_permissions_op(
    handler: &Handler,
    request: &Map<String, Value>,
) -> Result<Value, OpError> {
    let key = key_arg(request)?;
    let paths = request
        .get("paths")
        .and_then(Value::as_array)
        .ok_or(OpError::Args("No paths specified"))?;
    let refs = paths
        .iter()
        .map(|p| {
            p.as_str()
                .and_then(|s| BASE64.decode(s).ok())
                .ok_or(OpError::Args("Paths must be base64"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let permissions = handler.check_ref_permissions(key, refs).await?;
    let mut reply = Map::new();
    for (name, perms) in permissions {
        reply.insert(BASE64.encode(&name), json!(perms));
    }
    Ok(Value::Object(reply))
}

async fn notify_push_op(
    handler: &Handler,
    request: &Map<String, Value>,
) -> Result<Value, OpError> {
    let key = key_arg(request)?;
    let loose = request.get("loose_object_count").and_then(Value::as_u64);
    let packs = request.get("pack_count").and_then(Value::as_u64);
    handler.notify_push(key, loose, packs).await?;
    Ok(Value::Null)
}

async fn get_mp_url_op(
    handler: &Handler,
    request: &Map<String, Value>,
) -> Result<Value, OpError> {
    let key = key_arg(request)?;
    let branch = request
        .get("branch")
        .and_then(Value::as_str)
        .ok_or(OpError::Args("No branch specified"))?;
    match handler.get_mp_url(key, branch).await? {
        Some(url) => Ok(Value::String(url)),
        None => Ok(Value::Null),
    }
}

/// Accept hook connections forever.
pub async fn serve(listener: UnixListener, handler: Arc<Handler>) -> io::Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = connection(stream, handler).await {
                tracing::debug!("hook connection ended: {e}");
            }
        });
    }
}

async fn connection(mut stream: UnixStream, handler: Arc<Handler>) -> io::Result<()> {
    let mut frames = Netstrings::default();
    let mut buf = [0u8; 4096];
    loop {
        loop {
            match frames.next_message() {
                Ok(Some(message)) => {
                    let reply = dispatch(&handler, &message).await;
                    stream.write_all(&encode(reply.to_string().as_bytes())).await?;
                }
                Ok(None) => break,
                Err(_) => {
                    frames.clear();
                    stream
                        .write_all(&encode(invalid_command().to_string().as_bytes()))
                        .await?;
                    break;
                }
            }
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        frames.input(&buf[..n]);
    }
}
