//! Gateway lifecycle: owns the listener, the session registry and the
//! approval coordinator, and answers host commands.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::approval::{ApprovalChannel, ApprovalCoordinator, HostUiChannel};
use crate::config::{ConfigUpdate, GatewayConfig};
use crate::context::GatewayContext;
use crate::desktop::DirectoryPicker;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::events::{CommandOutcome, HostCommand, StatusSnapshot};
use crate::server::McpServer;
use crate::session::SessionRegistry;
use crate::tools::ToolRegistry;
use crate::transport::{self, TransportState};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Optional collaborators for a [`Gateway`].
#[derive(Default)]
pub struct GatewayOptions {
    /// Deny tickets nobody answers within this long. `None` waits forever.
    pub approval_timeout: Option<Duration>,
    /// Approval channels in addition to the host UI prompt.
    pub channels: Vec<Arc<dyn ApprovalChannel>>,
    /// Backs the `pick-directory` command.
    pub picker: Option<Arc<dyn DirectoryPicker>>,
}

struct RunningServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// The filesystem gateway.
pub struct Gateway {
    context: Arc<GatewayContext>,
    sessions: Arc<SessionRegistry>,
    approvals: ApprovalCoordinator,
    server: Arc<McpServer>,
    picker: Option<Arc<dyn DirectoryPicker>>,
    runtime: Mutex<Option<RunningServer>>,
}

impl Gateway {
    /// Build a stopped gateway.
    pub fn new(config: GatewayConfig, options: GatewayOptions) -> Self {
        let context = Arc::new(GatewayContext::new(config));

        let mut channels: Vec<Arc<dyn ApprovalChannel>> =
            vec![Arc::new(HostUiChannel::new(context.clone()))];
        channels.extend(options.channels);
        let approvals =
            ApprovalCoordinator::new(context.clone(), channels, options.approval_timeout);

        let dispatcher = Dispatcher::new(
            context.clone(),
            Arc::new(ToolRegistry::new()),
            approvals.clone(),
        );

        Self {
            context,
            sessions: Arc::new(SessionRegistry::new()),
            approvals,
            server: Arc::new(McpServer::new(Arc::new(dispatcher))),
            picker: options.picker,
            runtime: Mutex::new(None),
        }
    }

    /// Shared context.
    pub fn context(&self) -> &Arc<GatewayContext> {
        &self.context
    }

    /// Live sessions.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Approval coordinator.
    pub fn approvals(&self) -> &ApprovalCoordinator {
        &self.approvals
    }

    /// The MCP router, without a listener. Useful for tests and embedding.
    pub fn router(&self) -> Router {
        transport::router(TransportState::new(
            self.context.clone(),
            self.sessions.clone(),
            self.server.clone(),
        ))
    }

    /// Address the listener is bound to, if running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime.lock().await.as_ref().map(|running| running.addr)
    }

    /// Bind the listener using the current configuration. Starting a running
    /// gateway returns the existing address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut runtime = self.runtime.lock().await;
        if let Some(running) = runtime.as_ref() {
            return Ok(running.addr);
        }

        let config = self.context.config().snapshot().await;
        let host = config.bind_host();
        let listener = match TcpListener::bind((host, config.port)).await {
            Ok(listener) => listener,
            Err(e) => {
                self.context
                    .error(format!("Failed to start server on {host}:{}: {e}", config.port));
                return Err(Error::Io(e));
            }
        };
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = self.router();
        let context = self.context.clone();
        let handle = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await;
            report_serve_exit(&context, result).await;
        });

        *runtime = Some(RunningServer {
            addr,
            shutdown: shutdown_tx,
            handle,
        });
        self.context.set_running(true);
        drop(runtime);

        self.context
            .info(format!("Server started on http://{host}:{}/sse", addr.port()));
        self.context.publish_status().await;

        Ok(addr)
    }

    /// Shut the listener down and close every session. Returns false if the
    /// gateway was not running.
    pub async fn stop(&self) -> bool {
        let mut runtime = self.runtime.lock().await;
        let Some(running) = runtime.take() else {
            return false;
        };

        let _ = running.shutdown.send(());
        let closed = self.sessions.clear();
        tracing::debug!(sessions = closed, "Closed sessions");

        // Calls parked on a closed session must not act on a late approval.
        for id in self.approvals.pending_ids() {
            if self.approvals.resolve(&id, false) {
                tracing::debug!(ticket = %id, "Denied on shutdown");
            }
        }

        let mut handle = running.handle;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
            tracing::warn!("Listener did not drain in time, aborting");
            handle.abort();
        }

        self.context.set_running(false);
        drop(runtime);
        self.context.info("Server stopped");
        self.context.publish_status().await;
        true
    }

    /// Merge a partial configuration. Port and isolation changes take effect
    /// on the next start.
    pub async fn update_config(&self, update: ConfigUpdate) -> GatewayConfig {
        let config = self.context.config().update(update).await;
        self.context.info("Configuration updated");
        self.context.publish_status().await;
        config
    }

    /// Resolve an approval ticket from the host UI.
    pub fn resolve_approval(&self, id: &str, approved: bool) -> bool {
        self.approvals.resolve(id, approved)
    }

    /// Current status snapshot.
    pub async fn status(&self) -> StatusSnapshot {
        self.context.status().await
    }

    /// Apply a host command.
    pub async fn handle_command(&self, command: HostCommand) -> Result<CommandOutcome> {
        tracing::debug!(?command, "Host command");
        match command {
            HostCommand::StartServer => {
                self.start().await?;
                Ok(CommandOutcome::Status(self.status().await))
            }
            HostCommand::StopServer => {
                self.stop().await;
                Ok(CommandOutcome::Status(self.status().await))
            }
            HostCommand::UpdateConfig { config } => {
                self.update_config(config).await;
                Ok(CommandOutcome::Status(self.status().await))
            }
            HostCommand::ResolveApproval { id, approved } => Ok(CommandOutcome::Resolved {
                resolved: self.resolve_approval(&id, approved),
            }),
            HostCommand::PickDirectory => {
                let picker = self
                    .picker
                    .as_ref()
                    .ok_or_else(|| Error::Configuration("no directory picker available".into()))?;
                let directory = picker.pick_directory().await?;
                Ok(CommandOutcome::Directory { directory })
            }
        }
    }
}

/// A listener that dies on its own leaves the gateway stopped.
async fn report_serve_exit(context: &GatewayContext, result: std::io::Result<()>) {
    if let Err(e) = result {
        context.error(format!("Server error: {e}"));
        context.set_running(false);
        context.publish_status().await;
    }
}
