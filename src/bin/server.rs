//! Webmask Server
//!
//! Runs the obfuscating proxy server:
//! - Serves CONNECT, forward and DNS requests hidden in ordinary HTTP
//! - Answers everything else like a plain web server would

use anyhow::{Context, Result};
use clap::Parser;
use webmask::config::{generate_example_config, Config};
use webmask::ProxyUpstream;
use tracing::{error, info, warn};

/// Webmask Server - HTTP-disguised proxy server
#[derive(Parser, Debug)]
#[command(name = "webmask-server")]
#[command(about = "Webmask Server - proxy traffic disguised as ordinary web requests")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Print an example configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Listen address or bare port (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error); overrides config
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        let example = toml::to_string_pretty(&generate_example_config())
            .context("Failed to serialize example configuration")?;
        println!("{}", example);
        return Ok(());
    }

    let config = Config::load(&args.config).context("Failed to load configuration")?;

    // Initialize logging
    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    if config.logging.format == "compact" {
        tracing_subscriber::fmt().with_env_filter(level).compact().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(level).init();
    }

    let listen_addr = args.listen.unwrap_or_else(|| config.server.listen.clone());

    if config.server.users.is_empty() {
        warn!("No users configured - every request with a valid envelope is accepted");
    } else {
        info!("Loaded {} user(s)", config.server.users.len());
    }
    if config.server.throttling > 0 {
        info!(
            "Throttling each operation to {} B/s (burst {})",
            config.server.throttling, config.server.throttling_max
        );
    }

    let server = ProxyUpstream::new(&listen_addr, config.server)
        .context("Failed to build server")?;

    info!("Webmask Server v{}", webmask::VERSION);
    info!("Key header: {}", server.cipher().key_header());

    let bound = server.bind().await.context("Failed to bind to address")?;

    tokio::select! {
        result = bound.serve() => {
            if let Err(e) = &result {
                error!("Server stopped: {}", e);
            }
            result.context("Server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
