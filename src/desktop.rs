//! Desktop integration through external commands: the approval notification
//! and the directory picker.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::process::Command;
use tokio::sync::oneshot;

use crate::approval::{ApprovalChannel, ApprovalRequest, ApprovalResolver};
use crate::error::{Error, Result};

/// Default notification command (libnotify).
pub const DEFAULT_NOTIFY_COMMAND: &str = "notify-send";

/// Default directory picker command.
pub const DEFAULT_PICKER_COMMAND: &str = "zenity";

const APPROVE_ACTION: &str = "approve";
const DENY_ACTION: &str = "deny";
const ARGS_PREVIEW_CHARS: usize = 100;

/// Native notification offering Approve and Deny actions.
///
/// Runs `notify-send --wait` with two actions and reads the chosen action key
/// from stdout. Closing the notification without choosing prints nothing and
/// counts as a deny. If the notifier cannot run at all the ticket is left to
/// the other channels.
pub struct CommandNotifier {
    program: String,
    running: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>,
}

impl Default for CommandNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFY_COMMAND)
    }
}

impl CommandNotifier {
    /// Use `program` as the notify-send compatible binary.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn command(&self, request: &ApprovalRequest) -> Command {
        let args = serde_json::to_string_pretty(&request.args).unwrap_or_default();
        let preview: String = args.chars().take(ARGS_PREVIEW_CHARS).collect();

        let mut command = Command::new(&self.program);
        command
            .arg("--app-name=FileAgent")
            .arg("--urgency=critical")
            .arg("--wait")
            .arg(format!("--action={APPROVE_ACTION}=Approve"))
            .arg(format!("--action={DENY_ACTION}=Deny"))
            .arg("FileAgent - Approval Required")
            .arg(format!(
                "Agent wants to execute: {}\n{}",
                request.tool_name, preview
            ))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

/// Map notifier output to a decision. `None` means the notifier failed.
fn decision_from_output(success: bool, stdout: &[u8]) -> Option<bool> {
    if !success {
        return None;
    }
    match String::from_utf8_lossy(stdout).trim() {
        APPROVE_ACTION => Some(true),
        // Anything else, including an empty line on dismissal, denies.
        _ => Some(false),
    }
}

impl ApprovalChannel for CommandNotifier {
    fn name(&self) -> &'static str {
        "desktop-notification"
    }

    fn open(&self, request: &ApprovalRequest, resolver: ApprovalResolver) {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request.id.clone(), cancel_tx);

        let child = match self.command(request).spawn() {
            Ok(child) => child,
            Err(e) => {
                self.running
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&request.id);
                tracing::warn!(program = %self.program, "Notification failed: {}", e);
                return;
            }
        };

        let running = self.running.clone();
        tokio::spawn(async move {
            tokio::select! {
                output = child.wait_with_output() => {
                    running
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(resolver.id());
                    match output {
                        Ok(output) => match decision_from_output(output.status.success(), &output.stdout) {
                            Some(approved) => {
                                tracing::info!(
                                    ticket = %resolver.id(),
                                    "Notification action: {}",
                                    if approved { "APPROVED" } else { "DENIED" }
                                );
                                resolver.resolve(approved);
                            }
                            None => tracing::warn!(
                                ticket = %resolver.id(),
                                status = %output.status,
                                "Notification exited without a decision"
                            ),
                        },
                        Err(e) => tracing::warn!(ticket = %resolver.id(), "Notification failed: {}", e),
                    }
                }
                // Dropping the child future kills the notifier process.
                _ = cancel_rx => {
                    tracing::debug!(ticket = %resolver.id(), "Notification withdrawn");
                }
            }
        });
    }

    fn close(&self, id: &str) {
        let cancel = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if let Some(cancel) = cancel {
            let _ = cancel.send(());
        }
    }
}

/// Lets the operator choose the sandbox root.
#[async_trait::async_trait]
pub trait DirectoryPicker: Send + Sync {
    /// Returns the chosen directory, or `None` if the operator cancelled.
    async fn pick_directory(&self) -> Result<Option<String>>;
}

/// Directory picker backed by `zenity --file-selection --directory`.
pub struct CommandPicker {
    program: String,
}

impl Default for CommandPicker {
    fn default() -> Self {
        Self::new(DEFAULT_PICKER_COMMAND)
    }
}

impl CommandPicker {
    /// Use `program` as the zenity compatible binary.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait::async_trait]
impl DirectoryPicker for CommandPicker {
    async fn pick_directory(&self) -> Result<Option<String>> {
        let output = Command::new(&self.program)
            .args(["--file-selection", "--directory", "--title=Select allowed directory"])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::Internal(format!("failed to run {}: {}", self.program, e)))?;

        // zenity exits non-zero on cancel.
        if !output.status.success() {
            return Ok(None);
        }
        let chosen = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!chosen.is_empty()).then_some(chosen))
    }
}
