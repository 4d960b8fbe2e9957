use std::process;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::net::TcpListener;

use turnip::logger;
use turnip_pack::frontend::Frontend;

pub const NAME: &str = "turnip-pack-frontend";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HEAD: &str = env!("GIT_HEAD");

pub const HELP_MSG: &str = r#"
Usage

   turnip-pack-frontend [<option>...]

Options

    --listen   <address>   Address to listen on (default 0.0.0.0:9418)
    --backend  <address>   Virt proxy address (default 127.0.0.1:9420)
    --version              Print program version
    --help                 Print help
"#;

#[derive(Debug)]
struct Options {
    listen: String,
    backend: String,
}

impl Options {
    fn from_env() -> Result<Self, anyhow::Error> {
        use lexopt::prelude::*;

        let mut parser = lexopt::Parser::from_env();
        let mut listen = None;
        let mut backend = None;

        while let Some(arg) = parser.next()? {
            match arg {
                Long("listen") => listen = Some(parser.value()?.parse()?),
                Long("backend") => backend = Some(parser.value()?.parse()?),
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
            listen: listen.unwrap_or_else(|| "0.0.0.0:9418".to_owned()),
            backend: backend.unwrap_or_else(|| "127.0.0.1:9420".to_owned()),
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
    tracing::info!("forwarding to virt proxy at {}", options.backend);

    let frontend = Arc::new(Frontend {
        backend: options.backend,
    });
    frontend.serve(listener).await?;
    Ok(())
}
