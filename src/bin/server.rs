//! Server binary (node B)

use anyhow::Result;
use clap::Parser;
use mailpipe::config::{load_users, Config};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// SMTP-disguised tunnel server
#[derive(Parser, Debug)]
#[command(name = "mailpipe-server")]
#[command(about = "Authenticates relays and dials targets on their behalf")]
#[command(version = mailpipe::VERSION)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "server.yaml")]
    config: PathBuf,

    /// Users file, overriding server.users_file
    #[arg(short, long)]
    users: Option<PathBuf>,

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
    let server = config.server;

    if !std::path::Path::new(&server.cert_file).exists() {
        eprintln!("Error: certificate file not found: {}", server.cert_file);
        eprintln!("Generate one with: mailpipe-gen-certs --hostname {}", server.hostname);
        std::process::exit(1);
    }
    if !std::path::Path::new(&server.key_file).exists() {
        eprintln!("Error: key file not found: {}", server.key_file);
        eprintln!("Generate one with: mailpipe-gen-certs --hostname {}", server.hostname);
        std::process::exit(1);
    }

    let users_file = args
        .users
        .unwrap_or_else(|| PathBuf::from(&server.users_file));
    let users = load_users(&users_file).unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });
    if users.is_empty() {
        eprintln!("Error: no users configured in {}", users_file.display());
        eprintln!("Add one like:");
        eprintln!();
        eprintln!("users:");
        eprintln!("  alice:");
        eprintln!("    secret: 'shared-secret-here'");
        std::process::exit(1);
    }

    info!("mailpipe server {}", mailpipe::VERSION);
    mailpipe::server::run_server(server, users).await?;
    Ok(())
}
