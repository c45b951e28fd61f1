//! Host-UI boundary: events pushed to the dashboard and commands it sends back.

use serde::{Deserialize, Serialize};

use crate::approval::ApprovalRequest;
use crate::config::{ConfigUpdate, GatewayConfig};
use crate::logs::LogEntry;

/// Gateway state as shown by the dashboard.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    /// Whether the gateway listener is up.
    pub is_running: bool,
    /// Current configuration.
    pub config: GatewayConfig,
    /// Recent log lines, oldest first.
    pub logs: Vec<String>,
}

/// Outbound event for the host UI.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostEvent {
    /// Full status snapshot.
    StatusUpdate(StatusSnapshot),
    /// A single new log entry.
    LogUpdate {
        /// Formatted log line.
        line: String,
        /// Structured entry.
        entry: LogEntry,
    },
    /// A tool call is waiting for the operator.
    RequestApproval(ApprovalRequest),
    /// A ticket was resolved; any prompt for it can be dismissed.
    CloseApproval {
        /// Ticket id.
        id: String,
    },
}

/// Inbound command from the host UI.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostCommand {
    /// Start the gateway listener.
    StartServer,
    /// Stop the gateway listener and close all sessions.
    StopServer,
    /// Merge a partial configuration.
    UpdateConfig {
        /// Fields to change.
        config: ConfigUpdate,
    },
    /// Resolve a pending approval ticket.
    ResolveApproval {
        /// Ticket id.
        id: String,
        /// Operator decision.
        approved: bool,
    },
    /// Ask the operator to choose a directory.
    PickDirectory,
}

/// Reply to a host command.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum CommandOutcome {
    /// Status after a lifecycle or config command.
    Status(StatusSnapshot),
    /// Whether a resolve command took effect.
    Resolved {
        /// False when the ticket was unknown or already resolved.
        resolved: bool,
    },
    /// Directory chosen by the operator, if any.
    Directory {
        /// Absolute path, or null on cancel.
        directory: Option<String>,
    },
}
