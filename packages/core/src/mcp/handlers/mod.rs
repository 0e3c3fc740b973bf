//! MCP request handlers
//!
//! Each handler deserializes its params, calls the node service, and maps
//! the result (or typed error) into the JSON-RPC envelope.

pub mod markdown;
pub mod nodes;

use crate::mcp::types::McpError;
use crate::services::NodeServiceError;

/// Translate a service error into a JSON-RPC error
///
/// Data-layer details (SQL text, driver messages) never reach the wire:
/// database failures map to a sanitized internal error and the original is
/// logged server-side.
pub fn translate_error(error: NodeServiceError) -> McpError {
    match error {
        NodeServiceError::NodeNotFound { id } => McpError::node_not_found(&id),
        NodeServiceError::UniqueViolation { id } => McpError::node_exists(&id),
        NodeServiceError::VersionConflict {
            node_id,
            expected,
            actual,
            ..
        } => McpError::version_conflict(&node_id, expected, actual),
        NodeServiceError::SchemaViolation(violation) => {
            McpError::schema_violation(violation.to_string())
        }
        NodeServiceError::ValidationFailed(validation) => {
            McpError::invalid_params(validation.to_string())
        }
        NodeServiceError::CycleWouldOccur { node_id } => McpError::hierarchy_violation(format!(
            "Move rejected: node '{}' would become its own ancestor",
            node_id
        )),
        NodeServiceError::HierarchyViolation(message) => McpError::hierarchy_violation(message),
        NodeServiceError::InvalidParent { parent_id } => {
            McpError::invalid_params(format!("Invalid parent node: {}", parent_id))
        }
        NodeServiceError::InvalidUpdate(message) => McpError::invalid_params(message),
        other => {
            tracing::error!(error = %other, "Internal error during MCP request");
            McpError::internal_error("Internal storage error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::types;

    #[test]
    fn test_not_found_maps_to_application_code() {
        let error = translate_error(NodeServiceError::node_not_found("n1"));
        assert_eq!(error.code, types::NODE_NOT_FOUND);
    }

    #[test]
    fn test_unique_violation_maps_to_node_exists() {
        let error = translate_error(NodeServiceError::unique_violation("n1"));
        assert_eq!(error.code, types::NODE_EXISTS);
    }

    #[test]
    fn test_database_error_is_sanitized() {
        let error = translate_error(NodeServiceError::query_failed(
            "SELECT * FROM nodes WHERE secret",
        ));
        assert_eq!(error.code, types::INTERNAL_ERROR);
        assert!(!error.message.contains("SELECT"));
    }
}
