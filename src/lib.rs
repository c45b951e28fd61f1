//! # fileagent-mcp
//!
//! Sandboxed filesystem gateway for AI agents, speaking MCP (Model Context
//! Protocol) over HTTP/SSE, with a human approving each tool call.
//!
//! ## Features
//!
//! - **MCP over SSE**: `GET /sse` opens a session stream, `POST /message`
//!   delivers JSON-RPC 2.0 requests into it
//! - **Sandbox**: every path is resolved under one allowed directory;
//!   traversal and symlink escapes are rejected
//! - **Human in the loop**: calls wait for an operator decision from the host
//!   dashboard or a desktop notification, first answer wins
//! - **Stdio bridge**: `fileagent-bridge` adapts stdio-only clients to the
//!   SSE transport
//!
//! ## Available Tools
//!
//! - `list_directory`: list entries of a directory under the root
//! - `read_file`: read a UTF-8 file
//! - `write_file`: create or overwrite a file
//! - `search_files`: find entries whose name contains a pattern
//!
//! ## Usage with Claude Desktop
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "fileagent": {
//!       "command": "fileagent-bridge",
//!       "args": ["--url", "http://localhost:3000"],
//!       "env": { "MCP_API_KEY": "..." }
//!     }
//!   }
//! }
//! ```
//!
//! ## Security Model
//!
//! - The gateway binds 127.0.0.1 unless isolation is switched off
//! - A configured API key is required as a bearer token or `key` parameter
//! - Arguments are schema-checked before the operator is asked
//! - A denied call never touches the filesystem

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod admin;
pub mod approval;
pub mod bridge;
pub mod config;
pub mod context;
pub mod desktop;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod gateway;
pub mod logs;
pub mod protocol;
pub mod sandbox;
pub mod server;
pub mod session;
pub mod tools;
pub mod transport;

pub use approval::{ApprovalChannel, ApprovalCoordinator, ApprovalRequest};
pub use config::{ConfigUpdate, GatewayConfig};
pub use context::GatewayContext;
pub use error::{Error, Result};
pub use gateway::{Gateway, GatewayOptions};
pub use protocol::{JsonRpcRequest, JsonRpcResponse, McpMessage};
pub use server::McpServer;
pub use tools::{Tool, ToolRegistry};
