//! Tool definitions and registry for the MCP gateway.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use jsonschema::JSONSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{Error, Result};
use crate::protocol::{ToolCallResult, ToolDefinition};
use crate::sandbox;

/// Tool trait for implementing MCP tools.
///
/// `execute` receives arguments that already passed schema validation and the
/// sandbox root captured for this call. Implementations must route every path
/// through [`sandbox::resolve`].
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool definition.
    fn definition(&self) -> ToolDefinition;

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: serde_json::Value, root: &Path) -> Result<ToolCallResult>;
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Create a registry with the built-in file tools.
    pub fn new() -> Self {
        let mut registry = Self {
            tools: BTreeMap::new(),
        };
        registry.register(Arc::new(ListDirectoryTool));
        registry.register(Arc::new(ReadFileTool));
        registry.register(Arc::new(WriteFileTool));
        registry.register(Arc::new(SearchFilesTool));
        registry
    }

    /// Get tool definitions.
    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Tool>> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownTool(name.to_string()))
    }

    /// Register a custom tool.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name;
        self.tools.insert(name, tool);
    }
}

/// Validate arguments against a tool's input schema.
pub fn validate_arguments(schema: &serde_json::Value, arguments: &serde_json::Value) -> Result<()> {
    let compiled = JSONSchema::compile(schema)
        .map_err(|e| Error::Internal(format!("invalid tool schema: {}", e)))?;

    if let Err(errors) = compiled.validate(arguments) {
        let message = errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
        return Err(Error::Validation(message));
    }
    Ok(())
}

fn parse_args<T: DeserializeOwned>(arguments: serde_json::Value) -> Result<T> {
    serde_json::from_value(arguments).map_err(|e| Error::Validation(e.to_string()))
}

// ============================================================================
// Built-in Tools
// ============================================================================

/// Tool for listing a directory inside the sandbox.
pub struct ListDirectoryTool;

#[derive(Debug, Deserialize)]
struct ListDirectoryArgs {
    /// Directory relative to the root; defaults to the root.
    #[serde(default)]
    subpath: Option<String>,
}

#[derive(Debug, Serialize)]
struct DirectoryEntry {
    name: String,
    #[serde(rename = "isDir")]
    is_dir: bool,
}

#[async_trait::async_trait]
impl Tool for ListDirectoryTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "list_directory".into(),
            description: "List files and folders on the user's local computer within the allowed directory. Use this to see what files are available.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "subpath": {
                        "type": "string",
                        "description": "Directory relative to the allowed directory"
                    }
                }
            }),
        }
    }

    async fn execute(&self, arguments: serde_json::Value, root: &Path) -> Result<ToolCallResult> {
        let args: ListDirectoryArgs = parse_args(arguments)?;
        let target = sandbox::resolve(root, args.subpath.as_deref().unwrap_or(""))?;

        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&target).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            entries.push(DirectoryEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: entry.file_type().await?.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(ToolCallResult::text(serde_json::to_string_pretty(&entries)?))
    }
}

/// Tool for reading a text file inside the sandbox.
pub struct ReadFileTool;

#[derive(Debug, Deserialize)]
struct ReadFileArgs {
    subpath: String,
}

#[async_trait::async_trait]
impl Tool for ReadFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "read_file".into(),
            description: "Read the contents of a file from the user's local computer.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "subpath": {
                        "type": "string",
                        "description": "File path relative to the allowed directory"
                    }
                },
                "required": ["subpath"]
            }),
        }
    }

    async fn execute(&self, arguments: serde_json::Value, root: &Path) -> Result<ToolCallResult> {
        let args: ReadFileArgs = parse_args(arguments)?;
        let target = sandbox::resolve(root, &args.subpath)?;
        let content = tokio::fs::read_to_string(&target).await?;
        Ok(ToolCallResult::text(content))
    }
}

/// Tool for writing a text file inside the sandbox.
pub struct WriteFileTool;

#[derive(Debug, Deserialize)]
struct WriteFileArgs {
    subpath: String,
    content: String,
}

#[async_trait::async_trait]
impl Tool for WriteFileTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "write_file".into(),
            description: "Write to a file".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "subpath": {
                        "type": "string",
                        "description": "File path relative to the allowed directory"
                    },
                    "content": {
                        "type": "string",
                        "description": "Full text content to write"
                    }
                },
                "required": ["subpath", "content"]
            }),
        }
    }

    async fn execute(&self, arguments: serde_json::Value, root: &Path) -> Result<ToolCallResult> {
        let args: WriteFileArgs = parse_args(arguments)?;
        let target = sandbox::resolve(root, &args.subpath)?;
        tokio::fs::write(&target, args.content.as_bytes()).await?;
        Ok(ToolCallResult::text("File written successfully"))
    }
}

/// Tool for recursively searching file names inside the sandbox.
pub struct SearchFilesTool;

#[derive(Debug, Deserialize)]
struct SearchFilesArgs {
    directory: String,
    pattern: String,
}

#[async_trait::async_trait]
impl Tool for SearchFilesTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "search_files".into(),
            description: "Recursively search for files matching a pattern".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "directory": {
                        "type": "string",
                        "description": "The directory to search in, relative to the allowed directory"
                    },
                    "pattern": {
                        "type": "string",
                        "description": "The search pattern (case-insensitive substring match)"
                    }
                },
                "required": ["directory", "pattern"]
            }),
        }
    }

    async fn execute(&self, arguments: serde_json::Value, root: &Path) -> Result<ToolCallResult> {
        let args: SearchFilesArgs = parse_args(arguments)?;
        let start = sandbox::resolve(root, &args.directory)?;
        // Results are relative to the root so they can be passed back to read_file.
        let base = sandbox::resolve(root, "")?;
        let needle = args.pattern.to_lowercase();

        let mut results = Vec::new();
        let mut pending: Vec<PathBuf> = vec![start];
        while let Some(dir) = pending.pop() {
            let mut read_dir = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = read_dir.next_entry().await? {
                // Symlinks are reported but never followed.
                if entry.file_type().await?.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_lowercase();
                if name.contains(&needle) {
                    let path = entry.path();
                    let relative = path.strip_prefix(&base).unwrap_or(&path);
                    results.push(relative.to_string_lossy().into_owned());
                }
            }
        }
        results.sort();

        Ok(ToolCallResult::text(serde_json::to_string_pretty(&results)?))
    }
}
