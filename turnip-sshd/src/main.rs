use std::path::PathBuf;
use std::{env, process};

use anyhow::Context as _;

use turnip_sshd as sshd;

pub const NAME: &str = "turnip-sshd";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HEAD: &str = env!("GIT_HEAD");

pub const HELP_MSG: &str = r#"
Usage

   turnip-sshd [<option>...]

Options

    --listen              <address>   Address to listen on (default 0.0.0.0:9422)
    --backend             <address>   Virt proxy address (default 127.0.0.1:9420)
    --authserver-endpoint <url>       Authentication endpoint (or AUTHENTICATION_ENDPOINT)
    --host-key            <path>      OpenSSH host key file (ephemeral if absent)
    --version                         Print program version
    --help                            Print help
"#;

fn parse_options() -> Result<sshd::Options, anyhow::Error> {
    use lexopt::prelude::*;

    let mut parser = lexopt::Parser::from_env();
    let mut listen = None;
    let mut backend = None;
    let mut authserver_endpoint = env::var("AUTHENTICATION_ENDPOINT").ok();
    let mut host_key = None;

    while let Some(arg) = parser.next()? {
        match arg {
            Long("listen") => listen = Some(parser.value()?.parse()?),
            Long("backend") => backend = Some(parser.value()?.parse()?),
            Long("authserver-endpoint") => {
                authserver_endpoint = Some(parser.value()?.parse()?)
            }
            Long("host-key") => host_key = Some(PathBuf::from(parser.value()?)),
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
    Ok(sshd::Options {
        listen: listen.unwrap_or_else(|| "0.0.0.0:9422".to_owned()),
        backend: backend.unwrap_or_else(|| "127.0.0.1:9420".to_owned()),
        authserver_endpoint: authserver_endpoint.context(
            "an authentication endpoint is required (--authserver-endpoint or AUTHENTICATION_ENDPOINT)",
        )?,
        host_key,
    })
}

#[tokio::main]
async fn main() {
    sshd::logger::init();

    let result = parse_options().map(sshd::run);
    let result = match result {
        Ok(run) => {
            tracing::info!("version {VERSION}-{GIT_HEAD}");
            run.await
        }
        Err(e) => Err(e),
    };
    if let Err(err) = result {
        tracing::error!("Fatal: {err:#}");
        process::exit(1);
    }
}
