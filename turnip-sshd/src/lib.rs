//! Git smart SSH frontend.
//!
//! A russh-based server that authenticates callers by public key against
//! the authorisation endpoint and bridges `git-upload-pack`,
//! `git-receive-pack` and `turnip-set-symbolic-ref` exec requests onto the
//! pack proxy chain, injecting the avatar's identity into the forwarded
//! request. Subsystems are refused; the session is exec-only.
pub mod auth;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand_core::OsRng;
use russh::keys::ssh_key::PublicKey;
use russh::server::{Auth, Msg, Server as _, Session};
use russh::{Channel, ChannelId, CryptoVec};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

use turnip::error::strip_virt_kind;
use turnip::pktline::{self, Packet, Pktlines};
use turnip::request::{params, Command, Params, Request};

use crate::auth::{Avatar, KeyAuth};

const ALLOWED_SERVICES: &[&str] = &[
    "git-upload-pack",
    "git-receive-pack",
    "turnip-set-symbolic-ref",
];

#[derive(Debug, Clone)]
pub struct Options {
    pub listen: String,
    /// Virt proxy address, `host:port`.
    pub backend: String,
    pub authserver_endpoint: String,
    pub host_key: Option<PathBuf>,
}

/// Run the server.
pub async fn run(options: Options) -> anyhow::Result<()> {
    use anyhow::Context as _;

    let key = match &options.host_key {
        Some(path) => russh::keys::PrivateKey::read_openssh_file(path)
            .with_context(|| format!("reading host key {}", path.display()))?,
        None => {
            tracing::warn!("no --host-key given; generating an ephemeral one");
            russh::keys::PrivateKey::random(&mut OsRng, russh::keys::Algorithm::Ed25519)
                .context("generating host key")?
        }
    };
    let config = russh::server::Config {
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::ZERO),
        keys: vec![key],
        ..Default::default()
    };

    let socket = TcpListener::bind(&options.listen)
        .await
        .with_context(|| format!("binding {}", options.listen))?;
    tracing::info!("listening on {}", options.listen);
    tracing::info!("forwarding to virt proxy at {}", options.backend);

    let mut server = SshServer {
        backend: options.backend,
        auth: Arc::new(auth::AuthServer::new(options.authserver_endpoint)),
    };
    server.run_on_socket(Arc::new(config), &socket).await?;
    Ok(())
}

pub struct SshServer {
    pub backend: String,
    pub auth: Arc<dyn KeyAuth>,
}

impl russh::server::Server for SshServer {
    type Handler = SshSession;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> SshSession {
        tracing::debug!("connection from {peer:?}");
        SshSession {
            backend: self.backend.clone(),
            auth: self.auth.clone(),
            avatar: None,
            env: HashMap::new(),
            channels: HashMap::new(),
        }
    }
}

pub struct SshSession {
    backend: String,
    auth: Arc<dyn KeyAuth>,
    avatar: Option<Avatar>,
    env: HashMap<String, String>,
    /// Write side of the backend connection, per open channel.
    channels: HashMap<ChannelId, OwnedWriteHalf>,
}

impl SshSession {
    /// Version from the client's `GIT_PROTOCOL` environment, defaulting to 0.
    fn protocol_version(&self) -> String {
        self.env
            .get("GIT_PROTOCOL")
            .and_then(|value| value.strip_prefix("version="))
            .unwrap_or("0")
            .to_owned()
    }

    /// Report an error on the channel's stderr and finish it.
    fn refuse(
        &self,
        session: &mut Session,
        channel: ChannelId,
        message: &[u8],
    ) -> Result<(), russh::Error> {
        session.channel_success(channel)?;
        session.extended_data(channel, 1, CryptoVec::from(message))?;
        session.exit_status_request(channel, 1)?;
        session.close(channel)?;
        Ok(())
    }
}

impl russh::server::Handler for SshSession {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let auth = self.auth.clone();
        let user = user.to_owned();
        let key = public_key.clone();
        let avatar = tokio::task::spawn_blocking(move || auth.authenticate(&user, &key))
            .await
            .unwrap_or(None);
        match avatar {
            Some(avatar) => {
                tracing::info!("authenticated {} ({})", avatar.username, avatar.user_id);
                self.avatar = Some(avatar);
                Ok(Auth::Accept)
            }
            None => Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            }),
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("refusing subsystem {name}");
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn env_request(
        &mut self,
        _channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.env
            .insert(variable_name.to_owned(), variable_value.to_owned());
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let line = String::from_utf8_lossy(data).into_owned();
        tracing::info!("exec request: {line}");
        let (service, pathname) = match parse_exec(&line) {
            Ok(parsed) => parsed,
            Err(message) => return self.refuse(session, channel, &message),
        };
        let Some(avatar) = self.avatar.clone() else {
            session.channel_failure(channel)?;
            return Ok(());
        };

        let mut request_params = Params::new();
        request_params.insert(
            params::AUTHENTICATED_USER.to_owned(),
            avatar.username.into_bytes(),
        );
        request_params.insert(
            params::AUTHENTICATED_UID.to_owned(),
            avatar.user_id.to_string().into_bytes(),
        );
        request_params.insert(
            params::REQUEST_ID.to_owned(),
            Uuid::new_v4().to_string().into_bytes(),
        );
        request_params.insert(
            params::VERSION.to_owned(),
            self.protocol_version().into_bytes(),
        );
        let request = Request::new(service, pathname.into_bytes(), request_params);
        let payload = match request.encode().map(|p| pktline::encode(Some(&p))) {
            Ok(Ok(payload)) => payload,
            _ => return self.refuse(session, channel, b"ERR Invalid request.\r\n"),
        };

        let stream = match TcpStream::connect(&self.backend).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("backend connection failed: {e}");
                return self.refuse(session, channel, b"ERR Backend connection failed.\r\n");
            }
        };
        let (read, mut write) = stream.into_split();
        if write.write_all(&payload).await.is_err() {
            return self.refuse(session, channel, b"ERR Backend connection failed.\r\n");
        }
        self.channels.insert(channel, write);
        tokio::spawn(pump_backend(session.handle(), channel, read));
        session.channel_success(channel)?;
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let failed = match self.channels.get_mut(&channel) {
            Some(write) => write.write_all(data).await.is_err(),
            None => false,
        };
        if failed {
            tracing::debug!("backend write failed; dropping channel data");
            self.channels.remove(&channel);
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Forward the half-close so the backend's git sees EOF on stdin.
        if let Some(mut write) = self.channels.remove(&channel) {
            write.shutdown().await.ok();
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }
}

/// Parse an exec command line. `git <subcmd>` is accepted as if the caller
/// said `git-<subcmd>`, matching the behaviour of `git shell`.
fn parse_exec(line: &str) -> Result<(Command, String), Vec<u8>> {
    let words = shlex::split(line).unwrap_or_default();
    let (service, args) = match words.split_first() {
        Some((first, rest)) if first.as_str() == "git" && !rest.is_empty() => {
            (format!("git-{}", rest[0]), &rest[1..])
        }
        Some((first, rest)) => (first.clone(), rest),
        None => return Err(b"ERR Unsupported service.\n".to_vec()),
    };
    if !ALLOWED_SERVICES.contains(&service.as_str()) {
        return Err(b"ERR Unsupported service.\n".to_vec());
    }
    let Some(pathname) = args.first() else {
        return Err(format!("ERR {service} requires an argument.\r\n").into_bytes());
    };
    Ok((Command::from_bytes(service.as_bytes()), pathname.clone()))
}

/// Forward backend bytes to the channel. The first packet is inspected so
/// virt errors reach the client as ordinary errors; the kind is of no use
/// over SSH.
async fn pump_backend(
    handle: russh::server::Handle,
    channel: ChannelId,
    mut read: OwnedReadHalf,
) {
    let mut pkts = Pktlines::new();
    let mut buf = [0u8; 32768];
    let mut first = None;
    let mut eof = false;
    loop {
        match pkts.next_packet() {
            Ok(Some(packet)) => {
                first = Some(packet);
                break;
            }
            Ok(None) => match read.read(&mut buf).await {
                Ok(0) | Err(_) => {
                    eof = true;
                    break;
                }
                Ok(n) => pkts.input(&buf[..n]),
            },
            Err(_) => {
                eof = true;
                break;
            }
        }
    }

    if let Some(packet) = first {
        let bytes = match &packet {
            Packet::Data(payload) => {
                let payload = strip_virt_kind(payload).unwrap_or_else(|| payload.clone());
                pktline::encode(Some(&payload)).unwrap_or_default()
            }
            Packet::Flush => pktline::FLUSH.to_vec(),
        };
        let mut open = handle.data(channel, CryptoVec::from(&bytes[..])).await.is_ok();
        let tail = pkts.unparsed();
        if open && !tail.is_empty() {
            open = handle.data(channel, CryptoVec::from(&tail[..])).await.is_ok();
        }
        if open && !eof {
            loop {
                match read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if handle.data(channel, CryptoVec::from(&buf[..n])).await.is_err()
                        {
                            break;
                        }
                    }
                }
            }
        }
    }

    handle.exit_status_request(channel, 0).await.ok();
    handle.eof(channel).await.ok();
    handle.close(channel).await.ok();
}

pub mod logger {
    pub use turnip::logger::init;
}
