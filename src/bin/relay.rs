//! Relay binary (node A)

use anyhow::Result;
use clap::Parser;
use mailpipe::config::Config;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// SMTP-disguised tunnel relay
#[derive(Parser, Debug)]
#[command(name = "mailpipe-relay")]
#[command(about = "Forwards local listeners to remote targets over an SMTP-disguised tunnel")]
#[command(version = mailpipe::VERSION)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "relay.yaml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::from_file(&args.config).unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    let rules = config.forward_rules().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });
    if rules.is_empty() {
        eprintln!("Error: no forwards configured in {}", args.config.display());
        std::process::exit(1);
    }
    if let Err(e) = config.client.validate() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    info!("mailpipe relay {}", mailpipe::VERSION);
    info!(
        "server: {}:{}",
        config.client.server_host, config.client.server_port
    );

    mailpipe::relay::run_relay(config.client, rules).await?;
    Ok(())
}
