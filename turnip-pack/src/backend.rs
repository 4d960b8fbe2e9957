//! The pack backend.
//!
//! Terminates turnip-flavoured pack connections against the repository
//! store, spawning the reference `git` for the transfer itself. Writes get
//! the hook environment wired up so policy decisions flow back through the
//! hook RPC socket.
use std::ffi::OsString;
use std::io;
use std::os::unix::ffi::OsStringExt as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bstr::BStr;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::Instrument as _;
use uuid::Uuid;

use turnip::auth::AuthParams;
use turnip::error;
use turnip::pktline::{self, Packet, Pktlines};
use turnip::request::{params, Command, Request};
use turnip::store;
use turnip::virtinfo::{self, VirtInfo};

use crate::git::{self, GitChild};
use crate::hookrpc;
use crate::metrics;

pub struct Backend {
    pub root: PathBuf,
    pub virtinfo: Arc<dyn VirtInfo>,
    pub virtinfo_timeout: Duration,
    pub hookrpc: Arc<hookrpc::Handler>,
    pub hookrpc_sock: PathBuf,
    pub git_wrapper: PathBuf,
    pub metrics: Arc<dyn metrics::Sink>,
    /// Deployment label attached to resource-usage gauges.
    pub environment: String,
}

#[derive(Debug, thiserror::Error)]
enum CreateError {
    #[error(transparent)]
    Store(#[from] store::Error),
    #[error(transparent)]
    Virt(#[from] virtinfo::Error),
}

enum Incoming {
    Packet(Packet),
    Eof,
    Invalid,
}

struct Connection {
    read: OwnedReadHalf,
    write: OwnedWriteHalf,
    pkts: Pktlines,
}

impl Connection {
    async fn next(&mut self) -> io::Result<Incoming> {
        loop {
            match self.pkts.next_packet() {
                Ok(Some(packet)) => return Ok(Incoming::Packet(packet)),
                Ok(None) => {}
                Err(_) => return Ok(Incoming::Invalid),
            }
            let mut buf = [0u8; 8192];
            let n = self.read.read(&mut buf).await?;
            if n == 0 {
                return Ok(Incoming::Eof);
            }
            self.pkts.input(&buf[..n]);
        }
    }

    async fn send_packet(&mut self, payload: &[u8]) -> io::Result<()> {
        send_packet(&mut self.write, payload).await
    }

    /// Send `ERR <message>` and close.
    async fn die(&mut self, message: &[u8]) -> io::Result<()> {
        tracing::info!("dying: {}", BStr::new(message));
        self.send_packet(&error::err_line(message)).await?;
        self.write.shutdown().await
    }
}

async fn send_packet(write: &mut OwnedWriteHalf, payload: &[u8]) -> io::Result<()> {
    let pkt = pktline::encode(Some(payload))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    write.write_all(&pkt).await
}

/// Cap a message so it still fits a single error packet.
fn truncate_for_packet(mut message: Vec<u8>) -> Vec<u8> {
    let limit = pktline::MAX_PAYLOAD - 32;
    if message.len() > limit {
        message.truncate(limit);
    }
    message
}

impl Backend {
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let backend = self.clone();
            tokio::spawn(async move {
                tracing::debug!(%addr, "connection accepted");
                if let Err(e) = backend.handle(stream).await {
                    tracing::debug!(%addr, "connection ended: {e}");
                }
            });
        }
    }

    async fn handle(&self, stream: TcpStream) -> io::Result<()> {
        let (read, write) = stream.into_split();
        let mut conn = Connection {
            read,
            write,
            pkts: Pktlines::new(),
        };
        // `turnip-create-repo` resets the machine to await another request
        // on the same connection; every other command consumes it.
        loop {
            let data = match conn.next().await? {
                Incoming::Eof => return Ok(()),
                Incoming::Invalid => return conn.die(b"Invalid pkt-line").await,
                Incoming::Packet(Packet::Flush) => {
                    return conn.die(b"Bad request: flush-pkt instead").await
                }
                Incoming::Packet(Packet::Data(data)) => data,
            };
            let request = match Request::decode(&data) {
                Ok(request) => request,
                Err(e) => return conn.die(e.to_string().as_bytes()).await,
            };
            let request_id = request.request_id();
            let span = tracing::info_span!(
                "request",
                id = request_id.as_deref().unwrap_or_default()
            );
            match self.dispatch(conn, request).instrument(span).await? {
                Some(open) => conn = open,
                None => return Ok(()),
            }
        }
    }

    /// Run one request. Returns the connection when it should await the
    /// next request, `None` once it has been consumed.
    async fn dispatch(
        &self,
        mut conn: Connection,
        request: Request,
    ) -> io::Result<Option<Connection>> {
        tracing::info!("request received: {request}");
        let auth = AuthParams::from_params(&request.params, request.request_id().as_deref());
        match request.command {
            Command::CreateRepo => {
                match self.create_repo(&request, &auth).await {
                    Ok(()) => {}
                    Err(CreateError::Store(store::Error::AlreadyExists)) => {
                        // Not fatal: report it and await the next request.
                        conn.send_packet(&error::err_line(
                            b"Could not create repository: repository already exists",
                        ))
                        .await?;
                    }
                    Err(e) => {
                        conn.die(format!("Could not create repository: {e}").as_bytes())
                            .await?;
                        return Ok(None);
                    }
                }
                Ok(Some(conn))
            }
            Command::SetSymbolicRef => {
                self.set_symbolic_ref(conn, &request, auth).await?;
                Ok(None)
            }
            Command::UploadPack | Command::ReceivePack => {
                self.run_git(conn, request, auth).await?;
                Ok(None)
            }
            Command::Other(_) => {
                conn.die(b"Unsupported command in request").await?;
                Ok(None)
            }
        }
    }

    async fn create_repo(&self, request: &Request, auth: &AuthParams) -> Result<(), CreateError> {
        let raw_pathname = String::from_utf8_lossy(&request.pathname).into_owned();
        let path = store::compose_path(&self.root, &request.pathname)?;
        let clone_from = match request.params.get(params::CLONE_FROM) {
            Some(source) if !source.is_empty() => {
                Some(store::compose_path(&self.root, source)?)
            }
            _ => None,
        };
        tracing::info!(
            "creating repository {}, clone of {:?}",
            path.display(),
            clone_from
        );
        store::init(&path, clone_from.as_deref(), false)?;

        let confirmed = {
            let virtinfo = self.virtinfo.clone();
            let pathname = raw_pathname.clone();
            let auth = auth.clone();
            virtinfo::timed(self.virtinfo_timeout, move || {
                virtinfo.confirm_repo_creation(&pathname, &auth)
            })
            .await
        };
        if let Err(e) = confirmed {
            tracing::error!("aborting creation of {raw_pathname}: {e}");
            let aborted = {
                let virtinfo = self.virtinfo.clone();
                let pathname = raw_pathname.clone();
                let auth = auth.clone();
                virtinfo::timed(self.virtinfo_timeout, move || {
                    virtinfo.abort_repo_creation(&pathname, &auth)
                })
                .await
            };
            if let Err(abort) = aborted {
                tracing::error!("abortRepoCreation for {raw_pathname} failed: {abort}");
            }
            if let Err(delete) = store::delete(&path) {
                tracing::error!("deleting {} failed: {delete}", path.display());
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Write-mode plumbing: repository config and hooks, plus a registered
    /// key linking the spawned child back to the hook RPC socket.
    fn prepare_write(
        &self,
        path: &Path,
        raw_pathname: &str,
        auth: AuthParams,
    ) -> Result<(String, Vec<(&'static str, OsString)>), store::Error> {
        store::ensure_config(path)?;
        let key = Uuid::new_v4().to_string();
        self.hookrpc.register_key(&key, raw_pathname, auth);
        store::ensure_hooks(path)?;
        let env = vec![
            (
                "TURNIP_HOOK_RPC_SOCK",
                self.hookrpc_sock.clone().into_os_string(),
            ),
            ("TURNIP_HOOK_RPC_KEY", OsString::from(key.clone())),
        ];
        Ok((key, env))
    }

    async fn set_symbolic_ref(
        &self,
        mut conn: Connection,
        request: &Request,
        auth: AuthParams,
    ) -> io::Result<()> {
        // The argument arrives as one more packet: `<name> SP <target>`.
        let data = match conn.next().await? {
            Incoming::Eof => return Ok(()),
            Incoming::Invalid => return conn.die(b"Invalid pkt-line").await,
            Incoming::Packet(Packet::Flush) => {
                return conn.die(b"Bad request: flush-pkt instead").await
            }
            Incoming::Packet(Packet::Data(data)) => data,
        };
        let Some(sp) = data.iter().position(|b| *b == b' ') else {
            return conn.die(b"Invalid set-symbolic-ref-line").await;
        };
        let (name, target) = (&data[..sp], &data[sp + 1..]);
        // We use "git symbolic-ref" because it gives us locking and reflog
        // handling, and it refuses to point HEAD outside of refs/.
        if name != b"HEAD" {
            return conn.die(b"Symbolic ref name must be \"HEAD\"").await;
        }
        if target.starts_with(b"-") {
            return conn
                .die(b"Symbolic ref target may not start with \"-\"")
                .await;
        }
        if target.contains(&b' ') {
            return conn.die(b"Symbolic ref target may not contain \" \"").await;
        }

        let path = match store::compose_path(&self.root, &request.pathname) {
            Ok(path) => path,
            Err(e) => return conn.die(e.to_string().as_bytes()).await,
        };
        let raw_pathname = String::from_utf8_lossy(&request.pathname).into_owned();
        let (key, env) = match self.prepare_write(&path, &raw_pathname, auth) {
            Ok(prepared) => prepared,
            Err(e) => return conn.die(e.to_string().as_bytes()).await,
        };

        let args: Vec<OsString> = vec![
            "-C".into(),
            path.into_os_string(),
            "symbolic-ref".into(),
            OsString::from_vec(name.to_vec()),
            OsString::from_vec(target.to_vec()),
        ];
        tracing::info!("spawning git symbolic-ref for {raw_pathname}");
        let result = self
            .finish_symbolic_ref(&mut conn, &request.command, &raw_pathname, args, env)
            .await;
        self.hookrpc.unregister_key(&key);
        result
    }

    async fn finish_symbolic_ref(
        &self,
        conn: &mut Connection,
        command: &Command,
        raw_pathname: &str,
        args: Vec<OsString>,
        env: Vec<(&'static str, OsString)>,
    ) -> io::Result<()> {
        let GitChild { mut child, rusage } = match git::spawn(&self.git_wrapper, &args, &env)
        {
            Ok(child) => child,
            Err(e) => return conn.die(format!("backend error: {e}").as_bytes()).await,
        };
        drop(child.stdin.take());
        let output = child.wait_with_output().await?;
        if !output.stderr.is_empty() {
            tracing::info!(
                "git symbolic-ref wrote to stderr: {}",
                BStr::new(&output.stderr)
            );
        }
        if let Some(usage) = rusage.read().await {
            metrics::emit_resource_usage(
                &*self.metrics,
                command,
                raw_pathname,
                &self.environment,
                &usage,
            );
        }
        if output.status.success() {
            match self.hookrpc.notify(raw_pathname).await {
                Ok(()) => {
                    conn.send_packet(b"ACK HEAD\n").await?;
                    conn.write.shutdown().await
                }
                Err(e) => conn.die(e.to_string().as_bytes()).await,
            }
        } else {
            let code = output.status.code().unwrap_or(-1);
            conn.die(format!("git symbolic-ref exited with status {code}").as_bytes())
                .await
        }
    }

    async fn run_git(
        &self,
        mut conn: Connection,
        request: Request,
        auth: AuthParams,
    ) -> io::Result<()> {
        let path = match store::compose_path(&self.root, &request.pathname) {
            Ok(path) => path,
            Err(e) => return conn.die(e.to_string().as_bytes()).await,
        };
        let raw_pathname = String::from_utf8_lossy(&request.pathname).into_owned();
        let mut request_params = request.params.clone();

        let version = request_params
            .get(params::VERSION)
            .cloned()
            .unwrap_or_else(|| b"0".to_vec());
        if version == b"2" {
            // Protocol v2 negotiates ref listing in-stream.
            request_params.remove(params::ADVERTISE_REFS);
        }
        let git_protocol = format!("version={}", String::from_utf8_lossy(&version));

        let subcmd = match request.command {
            Command::UploadPack => "upload-pack",
            Command::ReceivePack => "receive-pack",
            _ => unreachable!("only transfer commands spawn git"),
        };
        let mut args: Vec<OsString> = vec![subcmd.into()];
        if request_params.remove(params::STATELESS_RPC).is_some() {
            args.push("--stateless-rpc".into());
        }
        if request_params.remove(params::ADVERTISE_REFS).is_some() {
            args.push("--advertise-refs".into());
        }
        args.push(path.clone().into_os_string());

        let mut env: Vec<(&'static str, OsString)> =
            vec![("GIT_PROTOCOL", git_protocol.into())];
        let mut hook_key = None;
        if request.command == Command::ReceivePack {
            match self.prepare_write(&path, &raw_pathname, auth) {
                Ok((key, hook_env)) => {
                    env.extend(hook_env);
                    hook_key = Some(key);
                }
                Err(e) => return conn.die(e.to_string().as_bytes()).await,
            }
        }

        tracing::info!("spawning git {subcmd} for {raw_pathname}");
        let result = self
            .proxy_child(conn, &request.command, &raw_pathname, args, env)
            .await;
        if let Some(key) = hook_key {
            self.hookrpc.unregister_key(&key);
        }
        result
    }

    /// Wire the spawned child to the connection: client bytes to stdin
    /// (half-close forwarded), stdout back verbatim, stderr and exit status
    /// folded into error packets per the rules above.
    async fn proxy_child(
        &self,
        mut conn: Connection,
        command: &Command,
        raw_pathname: &str,
        args: Vec<OsString>,
        env: Vec<(&'static str, OsString)>,
    ) -> io::Result<()> {
        let GitChild { mut child, rusage } = match git::spawn(&self.git_wrapper, &args, &env)
        {
            Ok(child) => child,
            Err(e) => return conn.die(format!("backend error: {e}").as_bytes()).await,
        };
        let mut stdin = child.stdin.take().unwrap();
        let mut stdout = child.stdout.take().unwrap();
        let mut stderr = child.stderr.take().unwrap();

        let Connection {
            mut read,
            write: mut client_write,
            mut pkts,
        } = conn;
        // Bytes that arrived with (or right after) the request packet.
        let leftover = pkts.unparsed();

        let client_to_git = tokio::spawn(async move {
            if !leftover.is_empty() && stdin.write_all(&leftover).await.is_err() {
                return;
            }
            let mut buf = [0u8; 65536];
            loop {
                match read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stdin.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            // Dropping stdin forwards the client's half-close to git.
        });

        let stderr_pump = tokio::spawn(async move {
            let mut buffer = Vec::new();
            stderr.read_to_end(&mut buffer).await.ok();
            buffer
        });

        // Pump stdout until EOF; whether anything was produced decides how
        // stderr and a non-zero exit are reported.
        let mut produced = false;
        let mut client_gone = false;
        let mut buf = [0u8; 65536];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    produced = true;
                    if client_write.write_all(&buf[..n]).await.is_err() {
                        client_gone = true;
                        break;
                    }
                }
            }
        }
        if client_gone {
            child.start_kill().ok();
        }

        let err_buffer = stderr_pump.await.unwrap_or_default();
        let status = child.wait().await?;
        client_to_git.abort();

        if !err_buffer.is_empty() && !client_gone {
            if !produced {
                tracing::info!(
                    "git wrote to stderr with no stdout; returning to client: {}",
                    BStr::new(&err_buffer)
                );
                let message = truncate_for_packet(err_buffer);
                send_packet(&mut client_write, &error::err_line(&message))
                    .await
                    .ok();
            } else {
                tracing::info!("git wrote to stderr: {}", BStr::new(&err_buffer));
            }
        }
        if !status.success() && !produced && !client_gone {
            let code = status.code().unwrap_or(-1);
            tracing::info!("git exited {code} with no output; synthesising an error");
            send_packet(
                &mut client_write,
                &error::err_line(format!("backend exited {code}").as_bytes()),
            )
            .await
            .ok();
        }

        if let Some(usage) = rusage.read().await {
            metrics::emit_resource_usage(
                &*self.metrics,
                command,
                raw_pathname,
                &self.environment,
                &usage,
            );
        }
        client_write.shutdown().await.ok();
        Ok(())
    }
}
