use std::sync::Arc;
use std::time::Duration;
use std::{env, process};

use anyhow::Context as _;
use tokio::net::TcpListener;

use turnip::{logger, virtinfo};
use turnip_pack::virt::VirtProxy;

pub const NAME: &str = "turnip-pack-virt";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HEAD: &str = env!("GIT_HEAD");

pub const HELP_MSG: &str = r#"
Usage

   turnip-pack-virt [<option>...]

Options

    --listen            <address>   Address to listen on (default 127.0.0.1:9420)
    --backend           <address>   Pack backend address (default 127.0.0.1:9419)
    --virtinfo-endpoint <url>       Authorisation service endpoint (or VIRTINFO_ENDPOINT)
    --virtinfo-timeout  <seconds>   Authorisation call timeout (or VIRTINFO_TIMEOUT, default 15)
    --version                       Print program version
    --help                          Print help
"#;

#[derive(Debug)]
struct Options {
    listen: String,
    backend: String,
    virtinfo_endpoint: String,
    virtinfo_timeout: Duration,
}

impl Options {
    fn from_env() -> Result<Self, anyhow::Error> {
        use lexopt::prelude::*;

        let mut parser = lexopt::Parser::from_env();
        let mut listen = None;
        let mut backend = None;
        let mut virtinfo_endpoint = env::var("VIRTINFO_ENDPOINT").ok();
        let mut virtinfo_timeout = env::var("VIRTINFO_TIMEOUT").ok();

        while let Some(arg) = parser.next()? {
            match arg {
                Long("listen") => listen = Some(parser.value()?.parse()?),
                Long("backend") => backend = Some(parser.value()?.parse()?),
                Long("virtinfo-endpoint") => {
                    virtinfo_endpoint = Some(parser.value()?.parse()?)
                }
                Long("virtinfo-timeout") => {
                    virtinfo_timeout = Some(parser.value()?.parse()?)
                }
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
            listen: listen.unwrap_or_else(|| "127.0.0.1:9420".to_owned()),
            backend: backend.unwrap_or_else(|| "127.0.0.1:9419".to_owned()),
            virtinfo_endpoint: virtinfo_endpoint.context(
                "an authorisation endpoint is required (--virtinfo-endpoint or VIRTINFO_ENDPOINT)",
            )?,
            virtinfo_timeout: Duration::from_secs(
                virtinfo_timeout.map(|t| t.parse()).transpose()?.unwrap_or(15),
            ),
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

    let listener = TcpListener::bind(&options.listen)
        .await
        .with_context(|| format!("binding {}", options.listen))?;
    tracing::info!("listening on {}", options.listen);
    tracing::info!("forwarding to backend at {}", options.backend);

    let proxy = Arc::new(VirtProxy {
        backend: options.backend,
        virtinfo: Arc::new(virtinfo::Client::new(options.virtinfo_endpoint)),
        virtinfo_timeout: options.virtinfo_timeout,
    });
    proxy.serve(listener).await?;
    Ok(())
}
