//! Human-in-the-loop approval for tool calls.
//!
//! Each call that needs consent gets a ticket. The pending decision is fanned
//! out to every [`ApprovalChannel`] at once (desktop notification, in-app
//! prompt, ...). Whichever channel resolves first wins; every later attempt on
//! the same ticket is a no-op. Once resolved, all channels are told to close
//! their prompt for that ticket.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::context::GatewayContext;
use crate::events::HostEvent;
use crate::logs::LogLevel;

/// A pending decision as presented to the operator.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    /// Ticket id.
    pub id: String,
    /// Tool being invoked.
    pub tool_name: String,
    /// Validated tool arguments.
    pub args: serde_json::Value,
}

/// A way of asking the operator for a decision.
///
/// `open` must not block: channels that wait on something (a notification
/// process, a dialog) spawn a task and report back through the resolver.
pub trait ApprovalChannel: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Present a pending ticket.
    fn open(&self, request: &ApprovalRequest, resolver: ApprovalResolver);

    /// The ticket was resolved elsewhere; dismiss any prompt for it.
    fn close(&self, _id: &str) {}
}

/// Handle a channel uses to resolve one ticket.
#[derive(Clone)]
pub struct ApprovalResolver {
    coordinator: ApprovalCoordinator,
    id: String,
}

impl ApprovalResolver {
    /// Ticket id this resolver is bound to.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Approve the ticket. Returns false if it was already resolved.
    pub fn approve(&self) -> bool {
        self.coordinator.resolve(&self.id, true)
    }

    /// Deny the ticket. Returns false if it was already resolved.
    pub fn deny(&self) -> bool {
        self.coordinator.resolve(&self.id, false)
    }

    /// Resolve with an explicit decision.
    pub fn resolve(&self, approved: bool) -> bool {
        self.coordinator.resolve(&self.id, approved)
    }
}

struct CoordinatorInner {
    context: Arc<GatewayContext>,
    channels: Vec<Arc<dyn ApprovalChannel>>,
    pending: Mutex<HashMap<String, oneshot::Sender<bool>>>,
    timeout: Option<Duration>,
}

/// Per-call consent gate.
#[derive(Clone)]
pub struct ApprovalCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl ApprovalCoordinator {
    /// Create a coordinator fanning out to `channels`.
    ///
    /// With `timeout` set, a ticket nobody resolves in time is denied.
    pub fn new(
        context: Arc<GatewayContext>,
        channels: Vec<Arc<dyn ApprovalChannel>>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                context,
                channels,
                pending: Mutex::new(HashMap::new()),
                timeout,
            }),
        }
    }

    /// Ask for consent and wait for the first resolution.
    ///
    /// If the returned future is dropped before a decision (the client went
    /// away), the ticket is denied so channels can dismiss their prompts.
    pub async fn request(&self, tool_name: &str, args: &serde_json::Value) -> bool {
        let id = Uuid::new_v4().to_string();
        let (tx, mut rx) = oneshot::channel();
        self.pending().insert(id.clone(), tx);
        let _ticket = PendingTicket {
            coordinator: self,
            id: &id,
        };

        self.inner
            .context
            .log(LogLevel::Request, format!("Requesting approval for {tool_name}"));

        let request = ApprovalRequest {
            id: id.clone(),
            tool_name: tool_name.to_string(),
            args: args.clone(),
        };
        for channel in &self.inner.channels {
            tracing::debug!(ticket = %id, channel = channel.name(), "Opening approval prompt");
            channel.open(
                &request,
                ApprovalResolver {
                    coordinator: self.clone(),
                    id: id.clone(),
                },
            );
        }

        let Some(timeout) = self.inner.timeout else {
            return (&mut rx).await.unwrap_or(false);
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(decision) => decision.unwrap_or(false),
            Err(_) => {
                if self.resolve(&id, false) {
                    tracing::warn!(ticket = %id, "Approval timed out, denied");
                    false
                } else {
                    // Another channel won the race right at the deadline.
                    rx.try_recv().unwrap_or(false)
                }
            }
        }
    }

    /// Resolve a ticket. Only the first call for an id takes effect; it
    /// returns true. Unknown or already-resolved ids return false.
    pub fn resolve(&self, id: &str, approved: bool) -> bool {
        let Some(sender) = self.pending().remove(id) else {
            tracing::debug!(ticket = %id, "No pending request");
            return false;
        };

        // The waiter may already be gone; the ticket is resolved either way.
        let _ = sender.send(approved);

        let verdict = if approved { "APPROVED" } else { "DENIED" };
        self.inner.context.info(format!("Request {id} {verdict}"));

        for channel in &self.inner.channels {
            channel.close(id);
        }
        true
    }

    /// Ids of tickets awaiting a decision.
    pub fn pending_ids(&self) -> Vec<String> {
        self.pending().keys().cloned().collect()
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<bool>>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Denies the ticket if the waiting call is dropped first.
struct PendingTicket<'a> {
    coordinator: &'a ApprovalCoordinator,
    id: &'a str,
}

impl Drop for PendingTicket<'_> {
    fn drop(&mut self) {
        if self.coordinator.resolve(self.id, false) {
            tracing::debug!(ticket = %self.id, "Waiter dropped, ticket denied");
        }
    }
}

/// In-app prompt surfaced through the host UI event bus.
///
/// The dashboard answers with a `resolve-approval` command, which lands in
/// [`ApprovalCoordinator::resolve`].
pub struct HostUiChannel {
    context: Arc<GatewayContext>,
}

impl HostUiChannel {
    /// Create a channel publishing on `context`'s event bus.
    pub fn new(context: Arc<GatewayContext>) -> Self {
        Self { context }
    }
}

impl ApprovalChannel for HostUiChannel {
    fn name(&self) -> &'static str {
        "host-ui"
    }

    fn open(&self, request: &ApprovalRequest, _resolver: ApprovalResolver) {
        self.context
            .emit(HostEvent::RequestApproval(request.clone()));
    }

    fn close(&self, id: &str) {
        self.context.emit(HostEvent::CloseApproval { id: id.to_string() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;

    /// Records opened tickets and closes.
    #[derive(Default)]
    struct RecordingChannel {
        opened: Mutex<Vec<ApprovalResolver>>,
        closed: Mutex<Vec<String>>,
    }

    impl RecordingChannel {
        fn resolver(&self) -> Option<ApprovalResolver> {
            self.opened.lock().unwrap().first().cloned()
        }
    }

    impl ApprovalChannel for RecordingChannel {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn open(&self, _request: &ApprovalRequest, resolver: ApprovalResolver) {
            self.opened.lock().unwrap().push(resolver);
        }

        fn close(&self, id: &str) {
            self.closed.lock().unwrap().push(id.to_string());
        }
    }

    fn coordinator(
        channel: Arc<RecordingChannel>,
        timeout: Option<Duration>,
    ) -> ApprovalCoordinator {
        let context = Arc::new(GatewayContext::new(GatewayConfig::default()));
        ApprovalCoordinator::new(context, vec![channel], timeout)
    }

    async fn wait_for_ticket(channel: &RecordingChannel) -> ApprovalResolver {
        loop {
            if let Some(resolver) = channel.resolver() {
                return resolver;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_approve_unblocks_waiter() {
        let channel = Arc::new(RecordingChannel::default());
        let gate = coordinator(channel.clone(), None);

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.request("read_file", &serde_json::json!({})).await })
        };

        let resolver = wait_for_ticket(&channel).await;
        assert_eq!(gate.pending_ids(), [resolver.id().to_string()]);
        assert!(resolver.approve());

        assert!(waiter.await.unwrap());
        assert!(gate.pending_ids().is_empty());
        assert_eq!(channel.closed.lock().unwrap().as_slice(), [resolver.id().to_string()]);
    }

    #[tokio::test]
    async fn test_first_resolution_wins() {
        let channel = Arc::new(RecordingChannel::default());
        let gate = coordinator(channel.clone(), None);

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.request("write_file", &serde_json::json!({})).await })
        };
        let resolver = wait_for_ticket(&channel).await;

        assert!(resolver.deny());
        assert!(!resolver.approve());
        assert!(!gate.resolve(resolver.id(), true));

        assert!(!waiter.await.unwrap());
        assert_eq!(channel.closed.lock().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolutions_take_effect_once() {
        let channel = Arc::new(RecordingChannel::default());
        let gate = coordinator(channel.clone(), None);

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.request("write_file", &serde_json::json!({})).await })
        };
        let resolver = wait_for_ticket(&channel).await;

        let attempts: Vec<_> = (0..8)
            .map(|i| {
                let resolver = resolver.clone();
                let approved = i % 2 == 0;
                tokio::spawn(async move { (approved, resolver.resolve(approved)) })
            })
            .collect();

        let mut winners = Vec::new();
        for attempt in attempts {
            let (approved, took_effect) = attempt.await.unwrap();
            if took_effect {
                winners.push(approved);
            }
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(waiter.await.unwrap(), winners[0]);
        assert_eq!(channel.closed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_denies() {
        let channel = Arc::new(RecordingChannel::default());
        let gate = coordinator(channel.clone(), Some(Duration::from_millis(50)));

        assert!(!gate.request("read_file", &serde_json::json!({})).await);
        assert!(gate.pending_ids().is_empty());
        assert_eq!(channel.closed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_waiter_closes_ticket() {
        let channel = Arc::new(RecordingChannel::default());
        let gate = coordinator(channel.clone(), None);

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.request("read_file", &serde_json::json!({})).await })
        };
        let resolver = wait_for_ticket(&channel).await;

        waiter.abort();
        let _ = waiter.await;

        assert!(gate.pending_ids().is_empty());
        assert!(!resolver.approve());
        assert_eq!(channel.closed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_host_ui_channel_publishes_open_and_close() {
        let context = Arc::new(GatewayContext::new(GatewayConfig::default()));
        let mut events = context.subscribe();
        let gate = ApprovalCoordinator::new(
            context.clone(),
            vec![Arc::new(HostUiChannel::new(context.clone()))],
            None,
        );

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.request("list_directory", &serde_json::json!({"subpath": "docs"}))
                    .await
            })
        };

        let id = loop {
            if let HostEvent::RequestApproval(request) = events.recv().await.unwrap() {
                assert_eq!(request.tool_name, "list_directory");
                assert_eq!(request.args["subpath"], "docs");
                break request.id;
            }
        };

        assert!(gate.resolve(&id, true));
        assert!(waiter.await.unwrap());

        loop {
            if let HostEvent::CloseApproval { id: closed } = events.recv().await.unwrap() {
                assert_eq!(closed, id);
                break;
            }
        }
    }
}
