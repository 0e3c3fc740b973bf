//! MCP JSON-RPC 2.0 Types
//!
//! Type definitions for the Model Context Protocol endpoint.
//! Implements the JSON-RPC 2.0 envelope for the line-framed stdio
//! transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 request structure
///
/// # Example
///
/// ```json
/// {
///     "jsonrpc": "2.0",
///     "id": 123,
///     "method": "create_node",
///     "params": {
///         "node_type": "task",
///         "content": "Review quarterly reports"
///     }
/// }
/// ```
#[derive(Debug, Deserialize)]
pub struct McpRequest {
    /// JSON-RPC version (must be "2.0")
    pub jsonrpc: String,

    /// Request identifier (number or string; echoed in the response)
    pub id: Value,

    /// Method name to invoke
    pub method: String,

    /// Method parameters as JSON value
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC 2.0 response structure
///
/// # Success Example
///
/// ```json
/// {
///     "jsonrpc": "2.0",
///     "id": 123,
///     "result": { "id": "abc123" }
/// }
/// ```
///
/// # Error Example
///
/// ```json
/// {
///     "jsonrpc": "2.0",
///     "id": 123,
///     "error": { "code": -32601, "message": "Method not found: frobnicate" }
/// }
/// ```
#[derive(Debug, Serialize)]
pub struct McpResponse {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Request identifier (matches the request; null for parse errors)
    pub id: Value,

    /// Success result (mutually exclusive with error)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error information (mutually exclusive with result)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<McpError>,
}

/// JSON-RPC 2.0 error structure
#[derive(Debug, Serialize, Clone)]
pub struct McpError {
    /// Error code (standard JSON-RPC or application-specific)
    pub code: i32,

    /// Human-readable message (data-layer details redacted)
    pub message: String,

    /// Optional machine-readable detail payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// JSON-RPC 2.0 standard error codes
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// Application error codes (-32000..-32099)
pub const NODE_NOT_FOUND: i32 = -32000;
pub const NODE_EXISTS: i32 = -32001;
pub const VERSION_CONFLICT: i32 = -32002;
pub const SCHEMA_VIOLATION: i32 = -32003;
pub const HIERARCHY_VIOLATION: i32 = -32004;

impl McpError {
    fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Create a parse error (-32700)
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(PARSE_ERROR, message)
    }

    /// Create an invalid request error (-32600)
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, message)
    }

    /// Create a method not found error (-32601)
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    /// Create an invalid params error (-32602)
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    /// Create an internal error (-32603) with a sanitized message
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }

    /// Create a node not found error (-32000)
    pub fn node_not_found(node_id: &str) -> Self {
        Self::new(NODE_NOT_FOUND, format!("Node not found: {}", node_id))
    }

    /// Create a node-already-exists error (-32001)
    pub fn node_exists(node_id: &str) -> Self {
        Self::new(NODE_EXISTS, format!("Node already exists: {}", node_id))
    }

    /// Create a version conflict error (-32002)
    pub fn version_conflict(node_id: &str, expected: i64, actual: i64) -> Self {
        Self::new(
            VERSION_CONFLICT,
            format!(
                "Version conflict on node '{}': expected v{}, found v{}",
                node_id, expected, actual
            ),
        )
        .with_data(serde_json::json!({ "expected": expected, "actual": actual }))
    }

    /// Create a schema violation error (-32003)
    pub fn schema_violation(message: impl Into<String>) -> Self {
        Self::new(SCHEMA_VIOLATION, message)
    }

    /// Create a hierarchy violation error (-32004)
    pub fn hierarchy_violation(message: impl Into<String>) -> Self {
        Self::new(HIERARCHY_VIOLATION, message)
    }
}

impl McpResponse {
    /// Create a success response
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: Value, error: McpError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}
