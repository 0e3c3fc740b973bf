//! MCP Server
//!
//! Async task serving the Model Context Protocol endpoint to an external
//! AI agent: line-framed JSON-RPC 2.0, one JSON object per line on stdin,
//! one per line on stdout.
//!
//! Dispatch table:
//!
//! | Method | Maps to |
//! |---|---|
//! | `create_node` | `NodeService::create_node` |
//! | `get_node` | `NodeService::get_node` (read-only) |
//! | `update_node` | `NodeService::update_node` |
//! | `delete_node` | `NodeService::delete_node` |
//! | `query_nodes` | `NodeService::query_nodes` |
//! | `create_nodes_from_markdown` | hierarchical markdown import |
//!
//! Lifecycle events are emitted by the service when mutations commit.
//! Unknown methods answer `-32601`, malformed JSON `-32700`, shape-invalid
//! params `-32602`, and internal failures `-32603` with a sanitized
//! message.

use crate::mcp::handlers;
use crate::mcp::types::{McpError, McpRequest, McpResponse};
use crate::services::NodeService;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, error, info, instrument, warn};

/// Run the MCP server over stdin/stdout
///
/// Reads JSON-RPC requests line by line, processes them via the handlers,
/// and writes responses. Runs until EOF on stdin.
#[instrument(skip(service))]
pub async fn run_stdio_server(service: Arc<NodeService>) -> anyhow::Result<()> {
    info!("MCP stdio server started");
    serve(service, tokio::io::stdin(), tokio::io::stdout()).await?;
    info!("MCP stdio server stopped (stdin closed)");
    Ok(())
}

/// Serve the line protocol on arbitrary streams
///
/// Factored out of [`run_stdio_server`] so tests can drive the dispatcher
/// over in-memory duplex pipes.
pub async fn serve<R, W>(service: Arc<NodeService>, reader: R, writer: W) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        debug!("MCP message: {}", line);

        match parse_line(&line) {
            Parsed::Request(request) => {
                let response = handle_request(&service, request).await;
                write_response(&mut writer, &response).await?;
            }
            Parsed::Notification(method) => {
                // Notifications (no id) get no response.
                debug!("MCP notification: {}", method);
            }
            Parsed::Invalid(error) => {
                warn!("Rejecting malformed MCP message: {}", error.message);
                write_response(&mut writer, &McpResponse::error(Value::Null, error)).await?;
            }
        }
    }

    Ok(())
}

enum Parsed {
    Request(McpRequest),
    Notification(String),
    Invalid(McpError),
}

/// Classify one input line: request, notification, or protocol error
fn parse_line(line: &str) -> Parsed {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => return Parsed::Invalid(McpError::parse_error(format!("Invalid JSON: {}", e))),
    };

    if value.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Parsed::Invalid(McpError::invalid_request(
            "Missing or invalid 'jsonrpc' field (must be \"2.0\")",
        ));
    }

    let Some(method) = value.get("method").and_then(Value::as_str) else {
        return Parsed::Invalid(McpError::invalid_request("Missing 'method' field"));
    };

    if value.get("id").is_none() {
        return Parsed::Notification(method.to_string());
    }

    match serde_json::from_value::<McpRequest>(value) {
        Ok(request) => Parsed::Request(request),
        Err(e) => Parsed::Invalid(McpError::invalid_request(format!(
            "Invalid request structure: {}",
            e
        ))),
    }
}

/// Handle a JSON-RPC request and produce a response
#[instrument(skip(service, request), fields(method = %request.method))]
async fn handle_request(service: &Arc<NodeService>, request: McpRequest) -> McpResponse {
    let result = match request.method.as_str() {
        "create_node" => handlers::nodes::handle_create_node(service, request.params).await,
        "get_node" => handlers::nodes::handle_get_node(service, request.params).await,
        "update_node" => handlers::nodes::handle_update_node(service, request.params).await,
        "delete_node" => handlers::nodes::handle_delete_node(service, request.params).await,
        "query_nodes" => handlers::nodes::handle_query_nodes(service, request.params).await,
        "create_nodes_from_markdown" => {
            handlers::markdown::handle_create_nodes_from_markdown(service, request.params).await
        }
        method => {
            warn!("Unknown MCP method: {}", method);
            Err(McpError::method_not_found(method))
        }
    };

    match result {
        Ok(result) => McpResponse::success(request.id, result),
        Err(mcp_error) => {
            error!(
                "MCP request failed: {} (code: {})",
                mcp_error.message, mcp_error.code
            );
            McpResponse::error(request.id, mcp_error)
        }
    }
}

/// Write one JSON-RPC response line
async fn write_response<W>(writer: &mut BufWriter<W>, response: &McpResponse) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_string(response)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabaseService;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (Arc<NodeService>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = DatabaseService::new(db_path).await.unwrap();
        (Arc::new(NodeService::new(db)), temp_dir)
    }

    /// Feed request lines through the dispatcher and collect response lines
    async fn roundtrip(service: Arc<NodeService>, input: &str) -> Vec<Value> {
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_side);
        let (mut client_read, mut client_write) = tokio::io::split(client_side);

        let server = tokio::spawn(serve(service, server_read, server_write));

        client_write.write_all(input.as_bytes()).await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut output = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut client_read, &mut output)
            .await
            .unwrap();
        server.await.unwrap().unwrap();

        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_create_update_get_over_the_wire() {
        let (service, _tmp) = setup().await;
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"create_node","params":{"id":"n1","node_type":"text","content":"hello"}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"update_node","params":{"id":"n1","version":1,"content":"hello world"}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":3,"method":"get_node","params":{"id":"n1"}}"#,
            "\n",
        );

        let responses = roundtrip(service, input).await;
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0]["result"]["id"], json!("n1"));
        assert_eq!(responses[1]["result"]["version"], json!(2));
        assert_eq!(responses[2]["result"]["content"], json!("hello world"));
        assert_eq!(responses[2]["id"], json!(3));
    }

    #[tokio::test]
    async fn test_unknown_method_returns_32601() {
        let (service, _tmp) = setup().await;
        let responses = roundtrip(
            service,
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"frobnicate\",\"params\":{}}\n",
        )
        .await;
        assert_eq!(responses[0]["error"]["code"], json!(-32601));
    }

    #[tokio::test]
    async fn test_malformed_json_returns_32700() {
        let (service, _tmp) = setup().await;
        let responses = roundtrip(service, "this is not json\n").await;
        assert_eq!(responses[0]["error"]["code"], json!(-32700));
        assert_eq!(responses[0]["id"], Value::Null);
    }

    #[tokio::test]
    async fn test_missing_jsonrpc_field_returns_32600() {
        let (service, _tmp) = setup().await;
        let responses =
            roundtrip(service, "{\"id\":1,\"method\":\"get_node\",\"params\":{}}\n").await;
        assert_eq!(responses[0]["error"]["code"], json!(-32600));
    }

    #[tokio::test]
    async fn test_shape_invalid_params_return_32602() {
        let (service, _tmp) = setup().await;
        let responses = roundtrip(
            service,
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"create_node\",\"params\":{\"content\":42}}\n",
        )
        .await;
        assert_eq!(responses[0]["error"]["code"], json!(-32602));
    }

    #[tokio::test]
    async fn test_notification_gets_no_response() {
        let (service, _tmp) = setup().await;
        let input = concat!(
            r#"{"jsonrpc":"2.0","method":"initialized"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":1,"method":"get_node","params":{"id":"ghost"}}"#,
            "\n",
        );
        let responses = roundtrip(service, input).await;
        // Only the request produced output.
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], json!(1));
    }

    #[tokio::test]
    async fn test_markdown_import_over_the_wire() {
        let (service, _tmp) = setup().await;
        let input = concat!(
            r##"{"jsonrpc":"2.0","id":1,"method":"create_nodes_from_markdown","params":{"markdown_content":"# A\n- b1\n","container_title":"Doc"}}"##,
            "\n",
        );
        let responses = roundtrip(service.clone(), input).await;
        assert_eq!(responses[0]["result"]["nodes_created"], json!(2));

        let container_id = responses[0]["result"]["container_node_id"]
            .as_str()
            .unwrap();
        let roots = service.get_children(container_id).await.unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].content, "# A");
    }
}
