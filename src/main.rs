//! fileagent-gateway - sandboxed filesystem MCP gateway
//!
//! Serves MCP over HTTP/SSE on the configured port and the loopback host
//! control API on the admin port. Tool calls wait for operator approval
//! unless `--no-approval` is given.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fileagent_mcp::admin::{serve_admin, DEFAULT_ADMIN_PORT};
use fileagent_mcp::approval::ApprovalChannel;
use fileagent_mcp::config::DEFAULT_PORT;
use fileagent_mcp::desktop::{
    CommandNotifier, CommandPicker, DirectoryPicker, DEFAULT_NOTIFY_COMMAND,
    DEFAULT_PICKER_COMMAND,
};
use fileagent_mcp::{Gateway, GatewayConfig, GatewayOptions};

/// Sandboxed filesystem MCP gateway with operator approval.
#[derive(Parser, Debug)]
#[command(name = "fileagent-gateway")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory the agent may access.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Gateway port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// API key required from clients (empty disables authentication).
    #[arg(long, env = "MCP_API_KEY", default_value = "", hide_env_values = true)]
    api_key: String,

    /// Listen on all interfaces instead of loopback only.
    #[arg(long)]
    expose: bool,

    /// Run tool calls without asking the operator.
    #[arg(long)]
    no_approval: bool,

    /// Port of the loopback host control API.
    #[arg(long, default_value_t = DEFAULT_ADMIN_PORT)]
    admin_port: u16,

    /// Also ask for approval through desktop notifications.
    #[arg(long)]
    notify: bool,

    /// notify-send compatible command used with --notify.
    #[arg(long, default_value = DEFAULT_NOTIFY_COMMAND)]
    notify_command: String,

    /// zenity compatible command used to pick the allowed directory.
    #[arg(long, default_value = DEFAULT_PICKER_COMMAND)]
    picker_command: String,

    /// Deny approvals left unanswered for this many seconds.
    #[arg(long)]
    approval_timeout: Option<u64>,

    /// Wait for a start-server command instead of listening at once.
    #[arg(long)]
    no_autostart: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Log output file (default: stderr).
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args) {
        eprintln!("Failed to set up logging: {e:#}");
        return ExitCode::FAILURE;
    }

    tracing::info!(
        "Starting {} v{}",
        fileagent_mcp::server::SERVER_NAME,
        fileagent_mcp::server::SERVER_VERSION
    );

    match run(args).await {
        Ok(()) => {
            tracing::info!("Gateway exited cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("Gateway error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let filter = if args.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    match &args.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
    Ok(())
}

async fn run(args: Args) -> anyhow::Result<()> {
    let allowed_path = match &args.root {
        Some(root) => root
            .canonicalize()
            .with_context(|| format!("allowed directory {} is not accessible", root.display()))?
            .to_string_lossy()
            .into_owned(),
        None => {
            tracing::warn!("No allowed directory configured; tool calls will be rejected");
            String::new()
        }
    };

    let config = GatewayConfig {
        isolation: !args.expose,
        api_key: args.api_key.clone(),
        allowed_path,
        port: args.port,
        approve_requests: !args.no_approval,
    };

    let mut channels: Vec<Arc<dyn ApprovalChannel>> = Vec::new();
    if args.notify {
        tracing::info!("Desktop notifications enabled via {}", args.notify_command);
        channels.push(Arc::new(CommandNotifier::new(args.notify_command.clone())));
    }
    let picker: Arc<dyn DirectoryPicker> = Arc::new(CommandPicker::new(args.picker_command.clone()));

    let gateway = Arc::new(Gateway::new(
        config,
        GatewayOptions {
            approval_timeout: args.approval_timeout.map(Duration::from_secs),
            channels,
            picker: Some(picker),
        },
    ));

    if args.no_autostart {
        tracing::info!("Autostart disabled; waiting for a start-server command");
    } else {
        gateway
            .start()
            .await
            .with_context(|| format!("failed to listen on port {}", args.port))?;
    }

    let admin = tokio::spawn(serve_admin(gateway.clone(), args.admin_port));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to install Ctrl+C handler")?;
            tracing::info!("Shutdown signal received");
        }
        result = admin => {
            match result {
                Ok(Ok(())) => tracing::warn!("Admin API stopped"),
                Ok(Err(e)) => return Err(e).context("admin API failed"),
                Err(e) => return Err(e).context("admin API task failed"),
            }
        }
    }

    gateway.stop().await;
    Ok(())
}
