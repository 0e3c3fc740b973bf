//! Schema Service
//!
//! Manages node-type schemas in the `schemas` table. Schemas are read on
//! the hot path (property validation during create/update) and mutated
//! only through the admin operations here, which guarantee migration
//! safety:
//!
//! - adding an **optional** field is always safe
//! - adding a **required** field is rejected while rows of that type exist
//!   without it
//! - removing a field is rejected while any stored row still carries it
//!
//! Every successful admin mutation bumps the schema version.

use crate::db::{DatabaseError, DatabaseService};
use crate::models::schema::{Schema, SchemaField};
use crate::services::error::NodeServiceError;
use std::sync::Arc;

/// Service for schema lookups and admin mutations
#[derive(Clone)]
pub struct SchemaService {
    db: Arc<DatabaseService>,
}

impl SchemaService {
    pub fn new(db: Arc<DatabaseService>) -> Self {
        Self { db }
    }

    /// Load the schema for a node type, if one is defined
    pub async fn get_schema(&self, node_type: &str) -> Result<Option<Schema>, NodeServiceError> {
        let conn = self.db.connect_with_timeout().await?;

        let mut stmt = conn
            .prepare("SELECT definition FROM schemas WHERE node_type = ?")
            .await
            .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;
        let mut rows = stmt
            .query([node_type])
            .await
            .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| NodeServiceError::query_failed(e.to_string()))?
        else {
            return Ok(None);
        };

        let definition: String = row
            .get(0)
            .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;
        let schema: Schema = serde_json::from_str(&definition)
            .map_err(|e| NodeServiceError::serialization_error(e.to_string()))?;
        Ok(Some(schema))
    }

    /// Define a schema for a new node type
    ///
    /// Rejected if the type already has a schema - existing schemas evolve
    /// through [`add_field`](Self::add_field) and
    /// [`remove_field`](Self::remove_field) only.
    pub async fn define_schema(&self, schema: Schema) -> Result<(), NodeServiceError> {
        let definition = serde_json::to_string(&schema)
            .map_err(|e| NodeServiceError::serialization_error(e.to_string()))?;

        let tx = self.db.begin_write().await?;
        let insert = tx
            .connection()
            .execute(
                "INSERT INTO schemas (node_type, definition, version) VALUES (?, ?, ?)",
                (schema.node_type.as_str(), definition.as_str(), schema.version),
            )
            .await;

        if let Err(e) = insert {
            let classified = DatabaseError::from_libsql("insert schema", e);
            tx.rollback().await.ok();
            return Err(match classified {
                DatabaseError::UniqueViolation(_) => {
                    NodeServiceError::unique_violation(schema.node_type.clone())
                }
                other => NodeServiceError::DatabaseError(other),
            });
        }

        tx.commit().await?;
        tracing::info!(node_type = %schema.node_type, "Defined schema");
        Ok(())
    }

    /// Add a field to an existing schema, returning the new schema version
    ///
    /// Optional fields are always safe. A required field is rejected when
    /// nodes of this type already exist without it (they would all become
    /// invalid), unless the field declares a default.
    pub async fn add_field(
        &self,
        node_type: &str,
        field: SchemaField,
    ) -> Result<i64, NodeServiceError> {
        let mut schema = self
            .get_schema(node_type)
            .await?
            .ok_or_else(|| NodeServiceError::node_not_found(format!("schema '{}'", node_type)))?;

        if schema.field(&field.name).is_some() {
            return Err(NodeServiceError::invalid_update(format!(
                "Schema '{}' already has a field '{}'",
                node_type, field.name
            )));
        }

        if field.required && field.default.is_none() {
            let missing = self
                .count_rows_where(node_type, &field.name, "IS NULL")
                .await?;
            if missing > 0 {
                return Err(NodeServiceError::invalid_update(format!(
                    "Cannot add required field '{}': {} existing '{}' node(s) would be invalidated",
                    field.name, missing, node_type
                )));
            }
        }

        schema.fields.push(field);
        schema.version += 1;
        self.store(schema).await
    }

    /// Remove a field from an existing schema, returning the new version
    ///
    /// Rejected while any stored node of this type still carries the field;
    /// data must be migrated away first.
    pub async fn remove_field(
        &self,
        node_type: &str,
        field_name: &str,
    ) -> Result<i64, NodeServiceError> {
        let mut schema = self
            .get_schema(node_type)
            .await?
            .ok_or_else(|| NodeServiceError::node_not_found(format!("schema '{}'", node_type)))?;

        if schema.field(field_name).is_none() {
            return Err(NodeServiceError::invalid_update(format!(
                "Schema '{}' has no field '{}'",
                node_type, field_name
            )));
        }

        let carrying = self
            .count_rows_where(node_type, field_name, "IS NOT NULL")
            .await?;
        if carrying > 0 {
            return Err(NodeServiceError::invalid_update(format!(
                "Cannot remove field '{}': {} '{}' node(s) still carry it",
                field_name, carrying, node_type
            )));
        }

        schema.fields.retain(|f| f.name != field_name);
        schema.version += 1;
        self.store(schema).await
    }

    /// Count nodes of a type whose property matches the given null-ness
    async fn count_rows_where(
        &self,
        node_type: &str,
        field_name: &str,
        nullness: &str,
    ) -> Result<i64, NodeServiceError> {
        let conn = self.db.connect_with_timeout().await?;
        let path = format!("$.{}", field_name);
        let sql = format!(
            "SELECT COUNT(*) FROM nodes WHERE node_type = ? AND json_extract(properties, ?) {}",
            nullness
        );

        let mut stmt = conn
            .prepare(&sql)
            .await
            .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;
        let mut rows = stmt
            .query((node_type, path.as_str()))
            .await
            .map_err(|e| NodeServiceError::query_failed(e.to_string()))?;

        let row = rows
            .next()
            .await
            .map_err(|e| NodeServiceError::query_failed(e.to_string()))?
            .ok_or_else(|| NodeServiceError::query_failed("COUNT returned no row"))?;
        row.get(0)
            .map_err(|e| NodeServiceError::query_failed(e.to_string()))
    }

    /// Persist an updated schema definition
    async fn store(&self, schema: Schema) -> Result<i64, NodeServiceError> {
        let definition = serde_json::to_string(&schema)
            .map_err(|e| NodeServiceError::serialization_error(e.to_string()))?;

        let tx = self.db.begin_write().await?;
        tx.connection()
            .execute(
                "UPDATE schemas SET definition = ?, version = ?, modified_at = CURRENT_TIMESTAMP
                 WHERE node_type = ?",
                (definition.as_str(), schema.version, schema.node_type.as_str()),
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("update schema", e))?;
        tx.commit().await?;

        tracing::info!(
            node_type = %schema.node_type,
            version = schema.version,
            "Updated schema"
        );
        Ok(schema.version)
    }
}
