use std::{env, process};

use turnip_httpd as httpd;

pub const NAME: &str = "turnip-httpd";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HEAD: &str = env!("GIT_HEAD");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = parse_options()?;

    httpd::logger::init();
    tracing::info!("version {VERSION}-{GIT_HEAD}");

    match httpd::run(options).await {
        Ok(()) => {}
        Err(err) => {
            tracing::error!("Fatal: {err:#}");
            process::exit(1);
        }
    }
    Ok(())
}

/// Parse command-line arguments into HTTP options.
fn parse_options() -> Result<httpd::Options, anyhow::Error> {
    use anyhow::Context as _;
    use lexopt::prelude::*;

    let mut parser = lexopt::Parser::from_env();
    let mut listen = None;
    let mut backend = None;
    let mut virtinfo_endpoint = env::var("VIRTINFO_ENDPOINT").ok();

    while let Some(arg) = parser.next()? {
        match arg {
            Long("listen") => {
                listen = Some(parser.value()?.parse()?);
            }
            Long("backend") => {
                backend = Some(parser.value()?.parse()?);
            }
            Long("virtinfo-endpoint") => {
                virtinfo_endpoint = Some(parser.value()?.parse()?);
            }
            Long("help") | Short('h') => {
                println!(
                    "usage: turnip-httpd [--listen <addr>] [--backend <addr>] [--virtinfo-endpoint <url>]"
                );
                process::exit(0);
            }
            Long("version") => {
                println!("{NAME} {VERSION} ({GIT_HEAD})");
                process::exit(0);
            }
            _ => anyhow::bail!(arg.unexpected()),
        }
    }
    Ok(httpd::Options {
        listen: listen.unwrap_or_else(|| ([0, 0, 0, 0], 9421).into()),
        backend: backend.unwrap_or_else(|| "127.0.0.1:9420".to_owned()),
        virtinfo_endpoint: virtinfo_endpoint.context(
            "an authorisation endpoint is required (--virtinfo-endpoint or VIRTINFO_ENDPOINT)",
        )?,
    })
}
