//! nimbus-client — script-driven client binary.

use anyhow::{Context, Result};
use clap::Parser;

use nimbus_client::{script, Session};
use nimbus_core::wire;
use nimbus_core::NimbusConfig;

#[derive(Parser, Debug)]
#[command(name = "nimbus-client", about = "nimbus BDD client")]
struct Args {
    /// Controller host.
    #[arg(short = 'H', long, default_value = "localhost")]
    host: String,

    /// Controller port.
    #[arg(short = 'P', long, default_value_t = wire::CONTROLLER_PORT)]
    port: u16,

    /// Command script; stdin when omitted.
    #[arg(short = 'f', long)]
    file: Option<std::path::PathBuf>,

    /// Prefer a router on a local interface.
    #[arg(short = 'r', long)]
    local_router: bool,

    /// Chaining mode of an external shadow backend; accepted for
    /// command-line compatibility, unused by the core engine.
    #[arg(short = 'C', long)]
    chain: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    if let Some(chain) = &args.chain {
        tracing::debug!(chain, "chaining option ignored without a shadow backend");
    }

    let config = NimbusConfig::load().context("configuration invalid")?;

    let text = match &args.file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("cannot read script {}", path.display()))?,
        None => {
            use std::io::Read;
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("cannot read stdin")?;
            buf
        }
    };

    let mut session = Session::connect(&args.host, args.port, args.local_router, config.conjunct)
        .await
        .with_context(|| format!("cannot join fleet at {}:{}", args.host, args.port))?;

    script::run_script(&mut session, &text).await
}
