use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::{env, fs, process};

use anyhow::Context as _;
use tokio::net::{TcpListener, UnixListener};

use turnip::{logger, virtinfo};
use turnip_pack::backend::Backend;
use turnip_pack::{git, hookrpc, metrics};

pub const NAME: &str = "turnip-pack-backend";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HEAD: &str = env!("GIT_HEAD");

pub const HELP_MSG: &str = r#"
Usage

   turnip-pack-backend [<option>...]

Options

    --listen            <address>   Address to listen on (default 127.0.0.1:9419)
    --root              <path>      Repository root (or REPO_STORE)
    --virtinfo-endpoint <url>       Authorisation service endpoint (or VIRTINFO_ENDPOINT)
    --virtinfo-timeout  <seconds>   Authorisation call timeout (or VIRTINFO_TIMEOUT, default 15)
    --hookrpc-sock      <path>      Hook RPC socket path (or HOOKRPC_SOCK)
    --git-wrapper       <path>      turnip-git-wrapper executable (default: next to this binary)
    --environment       <name>      Label attached to metrics (or STATSD_ENVIRONMENT)
    --version                       Print program version
    --help                          Print help
"#;

#[derive(Debug)]
struct Options {
    listen: String,
    root: PathBuf,
    virtinfo_endpoint: String,
    virtinfo_timeout: Duration,
    hookrpc_sock: PathBuf,
    git_wrapper: Option<PathBuf>,
    environment: String,
}

impl Options {
    fn from_env() -> Result<Self, anyhow::Error> {
        use lexopt::prelude::*;

        let mut parser = lexopt::Parser::from_env();
        let mut listen = None;
        let mut root = env::var("REPO_STORE").ok().map(PathBuf::from);
        let mut virtinfo_endpoint = env::var("VIRTINFO_ENDPOINT").ok();
        let mut virtinfo_timeout = env::var("VIRTINFO_TIMEOUT").ok();
        let mut hookrpc_sock = env::var("HOOKRPC_SOCK").ok().map(PathBuf::from);
        let mut git_wrapper = None;
        let mut environment = env::var("STATSD_ENVIRONMENT").ok();

        while let Some(arg) = parser.next()? {
            match arg {
                Long("listen") => listen = Some(parser.value()?.parse()?),
                Long("root") => root = Some(PathBuf::from(parser.value()?)),
                Long("virtinfo-endpoint") => {
                    virtinfo_endpoint = Some(parser.value()?.parse()?)
                }
                Long("virtinfo-timeout") => {
                    virtinfo_timeout = Some(parser.value()?.parse()?)
                }
                Long("hookrpc-sock") => hookrpc_sock = Some(PathBuf::from(parser.value()?)),
                Long("git-wrapper") => git_wrapper = Some(PathBuf::from(parser.value()?)),
                Long("environment") => environment = Some(parser.value()?.parse()?),
                Long("help") | Short('h') => {
                    println!("{HELP_MSG}");
                    process::exit(0);
                }
                Long("version") => {
                    println!("{NAME} {VERSION} ({GIT_HEAD})");
                    process::exit(0);
                }
                _ => anyhow::bail!(arg.unexpected()),
            }
        }

        Ok(Self {
            listen: listen.unwrap_or_else(|| "127.0.0.1:9419".to_owned()),
            root: root.context("a repository root is required (--root or REPO_STORE)")?,
            virtinfo_endpoint: virtinfo_endpoint.context(
                "an authorisation endpoint is required (--virtinfo-endpoint or VIRTINFO_ENDPOINT)",
            )?,
            virtinfo_timeout: Duration::from_secs(
                virtinfo_timeout.map(|t| t.parse()).transpose()?.unwrap_or(15),
            ),
            hookrpc_sock: hookrpc_sock
                .unwrap_or_else(|| env::temp_dir().join("turnip-hookrpc.sock")),
            git_wrapper,
            environment: environment.unwrap_or_default(),
        })
    }
}

#[tokio::main]
async fn main() {
    logger::init();

    if let Err(err) = execute().await {
        tracing::error!("Fatal: {err:#}");
        process::exit(1);
    }
}

async fn execute() -> anyhow::Result<()> {
    let options = Options::from_env()?;

    tracing::info!("version {VERSION}-{GIT_HEAD}");
    tracing::info!("repository root {}", options.root.display());

    let virtinfo: Arc<dyn virtinfo::VirtInfo> =
        Arc::new(virtinfo::Client::new(options.virtinfo_endpoint.clone()));
    let hookrpc = Arc::new(hookrpc::Handler::new(
        virtinfo.clone(),
        options.virtinfo_timeout,
    ));

    // A stale socket from a previous run refuses to bind.
    fs::remove_file(&options.hookrpc_sock).ok();
    let hook_listener = UnixListener::bind(&options.hookrpc_sock)
        .with_context(|| format!("binding {}", options.hookrpc_sock.display()))?;
    tracing::info!("hook RPC socket at {}", options.hookrpc_sock.display());
    tokio::spawn(hookrpc::serve(hook_listener, hookrpc.clone()));

    let listener = TcpListener::bind(&options.listen)
        .await
        .with_context(|| format!("binding {}", options.listen))?;
    tracing::info!("listening on {}", options.listen);

    let backend = Arc::new(Backend {
        root: options.root,
        virtinfo,
        virtinfo_timeout: options.virtinfo_timeout,
        hookrpc,
        hookrpc_sock: options.hookrpc_sock,
        git_wrapper: git::wrapper_path(options.git_wrapper.as_deref()),
        metrics: Arc::new(metrics::LogSink),
        environment: options.environment,
    });
    backend.serve(listener).await?;
    Ok(())
}
