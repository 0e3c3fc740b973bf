//! Backend Adapter Seam
//!
//! A narrow surface exposing the node service to transport-specific
//! callers. Two bindings exist:
//!
//! - [`DirectBackend`] - in-process, used by the desktop host
//! - [`http_router`] - an axum router speaking JSON over HTTP, used by
//!   tests in web mode
//!
//! Both produce identical JSON for identical inputs (they share the same
//! service and serde types); the seam exists so tests can exercise the
//! core without the host runtime.

use crate::models::{Node, NodeQuery, NodeUpdate};
use crate::services::{NodeService, NodeServiceError};
use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Transport-agnostic surface over the node service
#[async_trait]
pub trait NodeBackend: Send + Sync {
    async fn create_node(&self, node: Node) -> Result<String, NodeServiceError>;
    async fn get_node(&self, id: &str) -> Result<Option<Node>, NodeServiceError>;
    async fn update_node(
        &self,
        id: &str,
        version: i64,
        update: NodeUpdate,
    ) -> Result<i64, NodeServiceError>;
    async fn delete_node(&self, id: &str) -> Result<(), NodeServiceError>;
    async fn get_children(&self, parent_id: &str) -> Result<Vec<Node>, NodeServiceError>;
    async fn query_nodes(&self, query: NodeQuery) -> Result<Vec<Node>, NodeServiceError>;

    /// Report the storage location backing this instance.
    ///
    /// Schema initialization happens when the database service opens the
    /// file, so by the time a backend exists the schema is in place; this
    /// lets hosts confirm which file they are bound to.
    async fn initialize_database(&self) -> Result<String, NodeServiceError>;
}

/// In-process binding used by the desktop host
#[derive(Clone)]
pub struct DirectBackend {
    service: Arc<NodeService>,
}

impl DirectBackend {
    pub fn new(service: Arc<NodeService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl NodeBackend for DirectBackend {
    async fn create_node(&self, node: Node) -> Result<String, NodeServiceError> {
        self.service.create_node(node).await
    }

    async fn get_node(&self, id: &str) -> Result<Option<Node>, NodeServiceError> {
        self.service.get_node(id).await
    }

    async fn update_node(
        &self,
        id: &str,
        version: i64,
        update: NodeUpdate,
    ) -> Result<i64, NodeServiceError> {
        self.service.update_node(id, version, update).await
    }

    async fn delete_node(&self, id: &str) -> Result<(), NodeServiceError> {
        self.service.delete_node(id).await
    }

    async fn get_children(&self, parent_id: &str) -> Result<Vec<Node>, NodeServiceError> {
        self.service.get_children(parent_id).await
    }

    async fn query_nodes(&self, query: NodeQuery) -> Result<Vec<Node>, NodeServiceError> {
        self.service.query_nodes(query).await
    }

    async fn initialize_database(&self) -> Result<String, NodeServiceError> {
        Ok(self.service.database().path().display().to_string())
    }
}

/// Typed error carried over HTTP: stable machine-readable code plus a
/// human-readable message; data-layer details are redacted
struct HttpError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl From<NodeServiceError> for HttpError {
    fn from(error: NodeServiceError) -> Self {
        let (status, code) = match &error {
            NodeServiceError::NodeNotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            NodeServiceError::UniqueViolation { .. } => (StatusCode::CONFLICT, "unique_violation"),
            NodeServiceError::VersionConflict { .. } => (StatusCode::CONFLICT, "version_conflict"),
            NodeServiceError::SchemaViolation(_) => (StatusCode::BAD_REQUEST, "schema_violation"),
            NodeServiceError::ValidationFailed(_) => (StatusCode::BAD_REQUEST, "validation_failed"),
            NodeServiceError::CycleWouldOccur { .. } => (StatusCode::CONFLICT, "cycle_would_occur"),
            NodeServiceError::HierarchyViolation(_) => {
                (StatusCode::BAD_REQUEST, "hierarchy_violation")
            }
            NodeServiceError::InvalidParent { .. } => (StatusCode::BAD_REQUEST, "invalid_parent"),
            NodeServiceError::InvalidUpdate(_) => (StatusCode::BAD_REQUEST, "invalid_update"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %error, "Internal error during HTTP request");
            "Internal storage error".to_string()
        } else {
            error.to_string()
        };

        Self {
            status,
            code,
            message,
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "code": self.code, "message": self.message }));
        (self.status, body).into_response()
    }
}

/// Request body for `POST /api/nodes`
#[derive(Debug, Deserialize)]
pub struct CreateNodeRequest {
    pub id: Option<String>,
    pub node_type: String,
    pub content: String,
    pub parent_id: Option<String>,
    pub container_node_id: Option<String>,
    #[serde(default = "empty_object")]
    pub properties: Value,
}

fn empty_object() -> Value {
    json!({})
}

/// Request body for `PATCH /api/nodes/:id`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateNodeRequest {
    /// Expected version for optimistic concurrency control
    pub version: i64,
    #[serde(flatten)]
    pub update: NodeUpdate,
}

/// Build the HTTP adapter router over a node service
///
/// # Endpoints
///
/// - `GET /api/health` - liveness probe
/// - `POST /api/nodes` - create a node
/// - `GET /api/nodes/:id` - get a node by ID
/// - `PATCH /api/nodes/:id` - update with OCC version
/// - `DELETE /api/nodes/:id` - delete a node
/// - `GET /api/nodes/:id/children` - ordered children
/// - `POST /api/query` - structured query
pub fn http_router(service: Arc<NodeService>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/nodes", post(create_node))
        .route(
            "/api/nodes/:id",
            get(get_node).patch(update_node).delete(delete_node),
        )
        .route("/api/nodes/:id/children", get(get_children))
        .route("/api/query", post(query_nodes))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(service)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn create_node(
    State(service): State<Arc<NodeService>>,
    Json(request): Json<CreateNodeRequest>,
) -> Result<Json<Value>, HttpError> {
    let mut node = match request.id {
        Some(id) => Node::new_with_id(
            id,
            request.node_type,
            request.content,
            request.parent_id,
            request.properties,
        ),
        None => Node::new_in_container(
            request.node_type,
            request.content,
            request.parent_id.clone(),
            request.container_node_id.clone().or(request.parent_id),
            request.properties,
        ),
    };
    if let Some(container) = request.container_node_id {
        node.container_node_id = Some(container);
    }

    let id = service.create_node(node).await?;
    Ok(Json(json!({ "id": id })))
}

async fn get_node(
    State(service): State<Arc<NodeService>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpError> {
    match service.get_node(&id).await? {
        Some(node) => Ok(Json(serde_json::to_value(node).map_err(|e| {
            HttpError::from(NodeServiceError::serialization_error(e.to_string()))
        })?)),
        None => Err(NodeServiceError::node_not_found(id).into()),
    }
}

async fn update_node(
    State(service): State<Arc<NodeService>>,
    Path(id): Path<String>,
    Json(request): Json<UpdateNodeRequest>,
) -> Result<Json<Value>, HttpError> {
    let version = service
        .update_node(&id, request.version, request.update)
        .await?;
    Ok(Json(json!({ "id": id, "version": version })))
}

async fn delete_node(
    State(service): State<Arc<NodeService>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpError> {
    service.delete_node(&id).await?;
    Ok(Json(json!({ "id": id, "deleted": true })))
}

async fn get_children(
    State(service): State<Arc<NodeService>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpError> {
    let children = service.get_children(&id).await?;
    Ok(Json(serde_json::to_value(children).map_err(|e| {
        HttpError::from(NodeServiceError::serialization_error(e.to_string()))
    })?))
}

async fn query_nodes(
    State(service): State<Arc<NodeService>>,
    Json(query): Json<NodeQuery>,
) -> Result<Json<Value>, HttpError> {
    let nodes = service.query_nodes(query).await?;
    Ok(Json(json!({ "count": nodes.len(), "nodes": nodes })))
}
