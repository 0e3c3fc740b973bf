//! MCP Endpoint
//!
//! In-process request dispatcher for external AI agents:
//!
//! - JSON-RPC 2.0 over line-framed stdio
//! - Request routing to the node service
//! - Markdown ingestion into node hierarchies
//!
//! The endpoint lets AI assistants read and manipulate nodes, search
//! content, and import documents into the knowledge base.

pub mod handlers;
pub mod server;
pub mod types;

pub use server::{run_stdio_server, serve};
pub use types::{McpError, McpRequest, McpResponse};
