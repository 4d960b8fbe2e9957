//! The virtualisation proxy.
//!
//! Sits between the frontends and the backend: translates the external
//! repository path through the authorisation service, gates writes on the
//! translated reply, lazily creates repositories that the service says
//! should exist, and then forwards the rewritten request downstream.
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::Instrument as _;

use turnip::auth::AuthParams;
use turnip::error::{ErrorKind, VirtError};
use turnip::request::{params, Command, Request};
use turnip::virtinfo::{self, Permission, VirtInfo};

use crate::proxy::{self, ClientRequest};

pub struct VirtProxy {
    /// Backend address, `host:port`.
    pub backend: String,
    pub virtinfo: Arc<dyn VirtInfo>,
    pub virtinfo_timeout: Duration,
}

impl VirtProxy {
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let proxy = self.clone();
            tokio::spawn(async move {
                tracing::debug!(%addr, "connection accepted");
                if let Err(e) = proxy.handle(stream).await {
                    tracing::debug!(%addr, "connection ended: {e}");
                }
            });
        }
    }

    async fn handle(&self, stream: TcpStream) -> io::Result<()> {
        let Some(client) = proxy::read_request(stream).await? else {
            return Ok(());
        };
        let request_id = client.request.request_id();
        let span = tracing::info_span!(
            "request",
            id = request_id.as_deref().unwrap_or_default()
        );
        self.process(client).instrument(span).await
    }

    async fn process(&self, client: ClientRequest) -> io::Result<()> {
        let ClientRequest {
            request,
            read,
            mut write,
            leftover,
        } = client;
        tracing::info!("request received: {request}");

        let permission = if request.command == Command::UploadPack {
            Permission::Read
        } else {
            Permission::Write
        };
        let auth =
            AuthParams::from_params(&request.params, request.request_id().as_deref());

        let translated = {
            let virtinfo = self.virtinfo.clone();
            let pathname = String::from_utf8_lossy(&request.pathname).into_owned();
            let auth = auth.clone();
            virtinfo::timed(self.virtinfo_timeout, move || {
                virtinfo.translate_path(&pathname, permission, &auth)
            })
            .await
        };
        let translated = match translated {
            Ok(translated) => translated,
            Err(e) => return die_virt(&mut write, virt_error(e)).await,
        };
        tracing::info!("translation result: {translated:?}");

        if translated.trailing.as_deref().is_some_and(|t| !t.is_empty()) {
            return die_virt(
                &mut write,
                VirtError::new(ErrorKind::NotFound, "Repository does not exist."),
            )
            .await;
        }
        if permission == Permission::Write && translated.writable == Some(false) {
            return proxy::die(&mut write, b"Repository is read-only").await;
        }

        let mut requests = Vec::with_capacity(2);
        if let Some(creation_params) = &translated.creation_params {
            if self.should_create(&request, permission) {
                // The caller's parameters win over the creation set.
                let mut merged: turnip::request::Params = creation_params
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone().into_bytes()))
                    .collect();
                merged.extend(request.params.clone());
                let create = Request::new(
                    Command::CreateRepo,
                    translated.path.as_bytes().to_vec(),
                    merged,
                );
                requests.push(create);
            }
        }
        requests.push(Request::new(
            request.command.clone(),
            translated.path.as_bytes().to_vec(),
            request.params.clone(),
        ));
        let mut encoded = Vec::with_capacity(requests.len());
        for request in &requests {
            match request.encode() {
                Ok(bytes) => encoded.push(bytes),
                Err(e) => {
                    return die_virt(
                        &mut write,
                        VirtError::new(ErrorKind::InternalServerError, e.to_string()),
                    )
                    .await
                }
            }
        }

        let backend = match TcpStream::connect(&self.backend).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("backend connection failed: {e}");
                return proxy::die(&mut write, b"Backend connection failed.").await;
            }
        };
        tracing::info!("forwarding request to backend");
        proxy::splice((read, write), leftover, backend, encoded, |_| None).await
    }

    /// Stateful transports always create missing repositories; stateless
    /// RPC only does so at the advertise-refs stage of a write, when the
    /// push is about to need it.
    fn should_create(&self, request: &Request, permission: Permission) -> bool {
        let stateless = request.params.contains_key(params::STATELESS_RPC);
        let advertise = request.params.contains_key(params::ADVERTISE_REFS);
        !stateless || (advertise && permission == Permission::Write)
    }
}

fn virt_error(e: virtinfo::Error) -> VirtError {
    match e {
        virtinfo::Error::Fault { code, message } => {
            VirtError::new(ErrorKind::from_fault_code(code), message)
        }
        virtinfo::Error::Timeout => VirtError::new(
            ErrorKind::GatewayTimeout,
            "Path translation timed out.",
        ),
        other => VirtError::new(ErrorKind::InternalServerError, other.to_string()),
    }
}

async fn die_virt(
    write: &mut tokio::net::tcp::OwnedWriteHalf,
    error: VirtError,
) -> io::Result<()> {
    use tokio::io::AsyncWriteExt as _;

    tracing::info!("dying: {error}");
    let payload = error.to_packet_payload();
    let pkt = turnip::pktline::encode(Some(&payload))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    write.write_all(&pkt).await?;
    write.shutdown().await
}
