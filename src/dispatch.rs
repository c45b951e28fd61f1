//! Tool dispatcher: validation, approval, sandbox root capture, execution.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use crate::approval::ApprovalCoordinator;
use crate::context::GatewayContext;
use crate::error::{Error, Result};
use crate::protocol::{ToolCallResult, ToolDefinition};
use crate::tools::{validate_arguments, ToolRegistry};

/// Runs tool calls in the order the invariants require:
///
/// 1. unknown tool and schema checks, before anything else;
/// 2. operator approval, if the approval flag is set at this moment;
/// 3. sandbox root captured from the live configuration;
/// 4. the tool itself, which resolves paths through the sandbox guard.
pub struct Dispatcher {
    context: Arc<GatewayContext>,
    tools: Arc<ToolRegistry>,
    approvals: ApprovalCoordinator,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(
        context: Arc<GatewayContext>,
        tools: Arc<ToolRegistry>,
        approvals: ApprovalCoordinator,
    ) -> Self {
        Self {
            context,
            tools,
            approvals,
        }
    }

    /// Tool catalog.
    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        self.tools.list_tools()
    }

    /// Invoke a tool. Failures are logged and returned, never raised.
    pub async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<ToolCallResult> {
        let result = self.dispatch(name, arguments).await;
        match &result {
            Ok(_) => tracing::debug!(tool = name, "Tool call succeeded"),
            Err(Error::UserDenied) => tracing::info!(tool = name, "Tool call denied"),
            Err(e) => self.context.error(format!("Error: {e}")),
        }
        result
    }

    async fn dispatch(&self, name: &str, arguments: serde_json::Value) -> Result<ToolCallResult> {
        let tool = self.tools.get(name)?;

        let arguments = match arguments {
            serde_json::Value::Null => serde_json::json!({}),
            other => other,
        };
        validate_arguments(&tool.definition().input_schema, &arguments)?;

        if self.context.config().approve_requests().await
            && !self.approvals.request(name, &arguments).await
        {
            return Err(Error::UserDenied);
        }

        let root = self
            .context
            .config()
            .allowed_root()
            .await
            .ok_or_else(|| Error::Configuration("no allowed directory configured".into()))?;

        AssertUnwindSafe(tool.execute(arguments, &root))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(Error::Internal(panic_message(panic))))
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "tool handler panicked".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{ApprovalChannel, ApprovalRequest, ApprovalResolver};
    use crate::config::GatewayConfig;
    use crate::protocol::ContentItem;
    use crate::tools::Tool;
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Counts tickets and answers each one immediately.
    struct AutoChannel {
        approve: bool,
        opened: AtomicUsize,
    }

    impl ApprovalChannel for AutoChannel {
        fn name(&self) -> &'static str {
            "auto"
        }

        fn open(&self, _request: &ApprovalRequest, resolver: ApprovalResolver) {
            self.opened.fetch_add(1, Ordering::SeqCst);
            resolver.resolve(self.approve);
        }
    }

    struct PanickingTool;

    #[async_trait::async_trait]
    impl Tool for PanickingTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "explode".into(),
                description: "Always panics".into(),
                input_schema: json!({"type": "object"}),
            }
        }

        async fn execute(&self, _arguments: serde_json::Value, _root: &Path) -> Result<ToolCallResult> {
            panic!("boom");
        }
    }

    fn dispatcher(config: GatewayConfig, approve: bool) -> (Dispatcher, Arc<AutoChannel>) {
        let context = Arc::new(GatewayContext::new(config));
        let channel = Arc::new(AutoChannel {
            approve,
            opened: AtomicUsize::new(0),
        });
        let approvals = ApprovalCoordinator::new(context.clone(), vec![channel.clone()], None);
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(PanickingTool));
        (
            Dispatcher::new(context, Arc::new(tools), approvals),
            channel,
        )
    }

    fn config_for(root: &Path, approve_requests: bool) -> GatewayConfig {
        GatewayConfig {
            allowed_path: root.to_string_lossy().into_owned(),
            approve_requests,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_no_ticket_when_approval_disabled() {
        let dir = tempdir().unwrap();
        let (dispatcher, channel) = dispatcher(config_for(dir.path(), false), false);

        dispatcher
            .call_tool("write_file", json!({"subpath": "a.txt", "content": "hello"}))
            .await
            .unwrap();

        assert_eq!(channel.opened.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_denied_call_never_touches_disk() {
        let dir = tempdir().unwrap();
        let (dispatcher, channel) = dispatcher(config_for(dir.path(), true), false);

        let err = dispatcher
            .call_tool("write_file", json!({"subpath": "a.txt", "content": "hello"}))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UserDenied));
        assert_eq!(channel.opened.load(Ordering::SeqCst), 1);
        assert!(!dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_approved_call_runs() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let (dispatcher, _) = dispatcher(config_for(dir.path(), true), true);

        let result = dispatcher
            .call_tool("read_file", json!({"subpath": "a.txt"}))
            .await
            .unwrap();
        assert!(matches!(&result.content[0], ContentItem::Text { text } if text == "hello"));
    }

    #[tokio::test]
    async fn test_validation_precedes_approval() {
        let dir = tempdir().unwrap();
        let (dispatcher, channel) = dispatcher(config_for(dir.path(), true), true);

        let err = dispatcher
            .call_tool("read_file", json!({"path": "a.txt"}))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(channel.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let (dispatcher, channel) = dispatcher(GatewayConfig::default(), true);
        let err = dispatcher.call_tool("rm_rf", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::UnknownTool(_)));
        assert_eq!(channel.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_root_rejects() {
        let (dispatcher, _) = dispatcher(GatewayConfig::default(), true);
        let err = dispatcher
            .call_tool("list_directory", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let dir = tempdir().unwrap();
        let (dispatcher, _) = dispatcher(config_for(dir.path(), false), true);

        let err = dispatcher.call_tool("explode", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Internal(ref message) if message == "boom"));

        // Still usable afterwards.
        dispatcher
            .call_tool("list_directory", json!({}))
            .await
            .unwrap();
    }
}
