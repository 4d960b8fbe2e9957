//! The anonymous pack frontend.
//!
//! Speaks the stock `git://` wire protocol. Anything beyond the vanilla
//! request parameters is rejected before the proxy chain is dialled, every
//! connection gets a fresh request id, and the internal error kinds the
//! virt proxy emits are stripped before they reach the client.
use std::io;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::Instrument as _;
use uuid::Uuid;

use turnip::error::strip_virt_kind;
use turnip::request::{params, Request, SAFE_PARAMS};

use crate::proxy::{self, ClientRequest};

pub struct Frontend {
    /// Virt proxy address, `host:port`.
    pub backend: String,
}

impl Frontend {
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let frontend = self.clone();
            tokio::spawn(async move {
                tracing::debug!(%addr, "connection accepted");
                if let Err(e) = frontend.handle(stream).await {
                    tracing::debug!(%addr, "connection ended: {e}");
                }
            });
        }
    }

    async fn handle(&self, stream: TcpStream) -> io::Result<()> {
        let Some(client) = proxy::read_request(stream).await? else {
            return Ok(());
        };
        let request_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("request", id = %request_id);
        self.process(client, request_id).instrument(span).await
    }

    async fn process(&self, client: ClientRequest, request_id: String) -> io::Result<()> {
        let ClientRequest {
            mut request,
            read,
            mut write,
            leftover,
        } = client;
        tracing::info!("request received: {request}");

        if request
            .params
            .keys()
            .any(|name| !SAFE_PARAMS.contains(&name.as_str()))
        {
            return proxy::die(&mut write, b"Illegal request parameters").await;
        }
        request
            .params
            .insert(params::REQUEST_ID.to_owned(), request_id.into_bytes());

        let encoded = match request.encode() {
            Ok(encoded) => encoded,
            Err(e) => return proxy::die(&mut write, e.to_string().as_bytes()).await,
        };
        let backend = match TcpStream::connect(&self.backend).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("backend connection failed: {e}");
                return proxy::die(&mut write, b"Backend connection failed.").await;
            }
        };
        tracing::info!("forwarding request to backend");
        proxy::splice((read, write), leftover, backend, vec![encoded], strip_virt_kind)
            .await
    }
}
