//! Shared gateway context: configuration, operator log and the host event bus.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

use crate::config::{GatewayConfig, SharedConfig};
use crate::events::{HostEvent, StatusSnapshot};
use crate::logs::{LogBuffer, LogEntry, LogLevel};

const EVENT_CAPACITY: usize = 256;

/// Context passed to the dispatcher, the approval coordinator and the
/// transport. One instance per gateway; tests build their own.
#[derive(Debug)]
pub struct GatewayContext {
    config: SharedConfig,
    logs: LogBuffer,
    events: broadcast::Sender<HostEvent>,
    running: AtomicBool,
}

impl GatewayContext {
    /// Create a context with an initial configuration.
    pub fn new(config: GatewayConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config: SharedConfig::new(config),
            logs: LogBuffer::default(),
            events,
            running: AtomicBool::new(false),
        }
    }

    /// Shared configuration.
    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    /// Subscribe to host events.
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    /// Publish a host event. Having no subscriber is not an error.
    pub fn emit(&self, event: HostEvent) {
        let _ = self.events.send(event);
    }

    /// Append to the operator log and mirror to tracing.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry::new(level, message);
        match level {
            LogLevel::Error => tracing::error!("{}", entry.message),
            LogLevel::Request => tracing::info!(kind = "request", "{}", entry.message),
            LogLevel::Info => tracing::info!("{}", entry.message),
        }
        self.logs.push(entry.clone());
        self.emit(HostEvent::LogUpdate {
            line: entry.to_string(),
            entry,
        });
    }

    /// Log at info level.
    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    /// Log at error level.
    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    /// Whether the gateway listener is up.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// Current status snapshot.
    pub async fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            is_running: self.is_running(),
            config: self.config.snapshot().await,
            logs: self.logs.recent().iter().map(ToString::to_string).collect(),
        }
    }

    /// Emit a status snapshot to the host UI.
    pub async fn publish_status(&self) {
        let status = self.status().await;
        self.emit(HostEvent::StatusUpdate(status));
    }
}
