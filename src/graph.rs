//! Schema graph access.
//!
//! The property graph (tables, columns, foreign keys) lives in an external
//! graph database queried with parameterized openCypher. This module holds
//! the client seam plus the small graph-level operations the pipeline needs:
//! namespacing, database description lookup, user rules, and the schema
//! export used by visualization clients.

use crate::error::{Result, Text2SqlError};
use crate::util::sanitize_log_input;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::error;

/// One result row from a graph query, positional like the wire protocol.
pub type GraphRow = Vec<Value>;

/// Query parameters passed alongside the openCypher text.
pub type GraphParams = HashMap<String, Value>;

/// Graph database client seam. The physical engine (vector indexes,
/// pattern matching) is an external collaborator.
#[async_trait]
pub trait GraphClient: Send + Sync {
    /// Run a query against the named graph and return its result set.
    async fn query(&self, graph_id: &str, query: &str, params: &GraphParams)
        -> Result<Vec<GraphRow>>;

    /// Delete the named graph entirely.
    async fn delete_graph(&self, graph_id: &str) -> Result<()>;
}

/// Namespace a client-supplied graph id to the requesting user, leaving
/// shared demo graphs (matching `general_prefix`) untouched.
pub fn graph_name(user_id: &str, graph_id: &str, general_prefix: Option<&str>) -> Result<String> {
    let graph_id: String = graph_id.trim().chars().take(200).collect();
    if graph_id.is_empty() {
        return Err(Text2SqlError::GraphNotFound(
            "Invalid graph_id, must be less than 200 characters.".to_string(),
        ));
    }

    if let Some(prefix) = general_prefix {
        if !prefix.is_empty() && graph_id.starts_with(prefix) {
            return Ok(graph_id);
        }
    }

    Ok(format!("{}_{}", user_id, graph_id))
}

/// Fetch the database description and connection URL stored on the
/// Database node.
pub async fn get_db_description(
    graph: &dyn GraphClient,
    graph_id: &str,
) -> Result<(String, String)> {
    let rows = graph
        .query(
            graph_id,
            "MATCH (d:Database) RETURN d.description, d.url",
            &GraphParams::new(),
        )
        .await?;

    match rows.first() {
        Some(row) => Ok((
            row.first().and_then(|v| v.as_str()).unwrap_or("").to_string(),
            row.get(1).and_then(|v| v.as_str()).unwrap_or("").to_string(),
        )),
        None => Ok((
            "No description available for this database.".to_string(),
            "No URL available for this database.".to_string(),
        )),
    }
}

/// Fetch free-text user rules stored on the Database node, empty when unset.
pub async fn get_user_rules(graph: &dyn GraphClient, graph_id: &str) -> Result<String> {
    let rows = graph
        .query(
            graph_id,
            "MATCH (d:Database) RETURN d.user_rules",
            &GraphParams::new(),
        )
        .await?;

    Ok(rows
        .first()
        .and_then(|row| row.first())
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string())
}

pub async fn set_user_rules(graph: &dyn GraphClient, graph_id: &str, user_rules: &str) -> Result<()> {
    let mut params = GraphParams::new();
    params.insert("user_rules".to_string(), Value::String(user_rules.to_string()));
    graph
        .query(
            graph_id,
            "MATCH (d:Database) SET d.user_rules = $user_rules",
            &params,
        )
        .await?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaNode {
    pub id: String,
    pub name: String,
    pub columns: Vec<SchemaNodeColumn>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaNodeColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaLink {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaExport {
    pub nodes: Vec<SchemaNode>,
    pub links: Vec<SchemaLink>,
}

const TABLES_EXPORT_QUERY: &str = "
    MATCH (t:Table)
    OPTIONAL MATCH (c:Column)-[:BELONGS_TO]->(t)
    RETURN t.name AS table, collect(DISTINCT {name: c.name, type: c.type}) AS columns
";

const LINKS_EXPORT_QUERY: &str = "
    MATCH (src_col:Column)-[:BELONGS_TO]->(src_table:Table),
          (tgt_col:Column)-[:BELONGS_TO]->(tgt_table:Table),
          (src_col)-[:REFERENCES]->(tgt_col)
    RETURN DISTINCT src_table.name AS source, tgt_table.name AS target
";

/// Export all table nodes with their columns and the table-to-table foreign
/// key links. Malformed rows are skipped, not fatal.
pub async fn get_schema(graph: &dyn GraphClient, graph_id: &str) -> Result<SchemaExport> {
    let empty = GraphParams::new();

    let tables_res = graph.query(graph_id, TABLES_EXPORT_QUERY, &empty).await;
    let links_res = graph.query(graph_id, LINKS_EXPORT_QUERY, &empty).await;

    let (tables_res, links_res) = match (tables_res, links_res) {
        (Ok(t), Ok(l)) => (t, l),
        (Err(e), _) | (_, Err(e)) => {
            error!(
                "Error querying graph data for {}: {}",
                sanitize_log_input(graph_id),
                e
            );
            return Err(Text2SqlError::Internal("Failed to read graph data".to_string()));
        }
    };

    let mut nodes = Vec::new();
    for row in tables_res {
        let Some(table_name) = row.first().and_then(|v| v.as_str()) else {
            continue;
        };
        let columns = row
            .get(1)
            .and_then(|v| v.as_array())
            .map(|cols| {
                cols.iter()
                    .filter_map(normalize_export_column)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        nodes.push(SchemaNode {
            id: table_name.to_string(),
            name: table_name.to_string(),
            columns,
        });
    }

    let mut links = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for row in links_res {
        let (Some(source), Some(target)) = (
            row.first().and_then(|v| v.as_str()),
            row.get(1).and_then(|v| v.as_str()),
        ) else {
            continue;
        };
        if seen.insert((source.to_string(), target.to_string())) {
            links.push(SchemaLink {
                source: source.to_string(),
                target: target.to_string(),
            });
        }
    }

    Ok(SchemaExport { nodes, links })
}

fn normalize_export_column(col: &Value) -> Option<SchemaNodeColumn> {
    match col {
        Value::Object(map) => {
            let name = map
                .get("name")
                .or_else(|| map.get("columnName"))
                .and_then(|v| v.as_str())?;
            let column_type = map
                .get("type")
                .or_else(|| map.get("dataType"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            Some(SchemaNodeColumn { name: name.to_string(), column_type })
        }
        Value::Array(items) if items.len() >= 2 => Some(SchemaNodeColumn {
            name: items[0].as_str()?.to_string(),
            column_type: items[1].as_str().map(|s| s.to_string()),
        }),
        Value::String(s) => Some(SchemaNodeColumn { name: s.clone(), column_type: None }),
        _ => None,
    }
}

/// Delete a user's graph. Demo graphs are protected.
pub async fn delete_database(
    graph: &dyn GraphClient,
    user_id: &str,
    graph_id: &str,
    general_prefix: Option<&str>,
) -> Result<()> {
    let namespaced = graph_name(user_id, graph_id, general_prefix)?;

    if let Some(prefix) = general_prefix {
        if !prefix.is_empty() && graph_id.starts_with(prefix) {
            return Err(Text2SqlError::InvalidArgument(
                "Demo graphs cannot be deleted".to_string(),
            ));
        }
    }

    graph.delete_graph(&namespaced).await.map_err(|e| {
        error!(
            "Failed to delete graph {}: {}",
            sanitize_log_input(&namespaced),
            e
        );
        Text2SqlError::GraphNotFound("Failed to delete graph, Graph not found".to_string())
    })
}
