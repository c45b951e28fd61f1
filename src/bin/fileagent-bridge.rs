//! fileagent-bridge - stdio adapter for the fileagent gateway
//!
//! Reads JSON-RPC lines from stdin, posts them to the gateway, and writes
//! responses from the gateway's event stream to stdout. Diagnostics go to a
//! log file, never to stdout.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fileagent_mcp::bridge::{run_bridge, BridgeConfig, DEFAULT_LOG_FILE, DEFAULT_URL};

/// Stdio to SSE bridge for the fileagent gateway.
#[derive(Parser, Debug)]
#[command(name = "fileagent-bridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Gateway base URL.
    #[arg(long, default_value = DEFAULT_URL)]
    url: String,

    /// Gateway API key.
    #[arg(long, env = "MCP_API_KEY", default_value = "", hide_env_values = true)]
    api_key: String,

    /// Trace log file.
    #[arg(long, default_value = DEFAULT_LOG_FILE)]
    log_file: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // Stdout carries the protocol, so logs go to the file or to stderr.
    match OpenOptions::new()
        .create(true)
        .append(true)
        .open(&args.log_file)
    {
        Ok(file) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
            .init(),
        Err(e) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
            tracing::warn!("Cannot open {}: {}", args.log_file.display(), e);
        }
    }

    let config = BridgeConfig::new(args.url, args.api_key);
    match run_bridge(config).await {
        Ok(()) => {
            tracing::info!("Bridge exited");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("Bridge error: {}", e);
            eprintln!("[Bridge Error] {e}");
            ExitCode::FAILURE
        }
    }
}
