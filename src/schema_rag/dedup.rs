//! Table descriptor normalization and deduplication.
//!
//! Graph search results arrive as positional rows
//! `[name, description, foreign_keys, columns]`. This module converts them
//! into typed descriptors, rejecting malformed rows, and merges the four
//! search result lists into a unique-by-table-name list.

use crate::graph::GraphRow;
use serde_json::Value;
use std::collections::HashSet;
use tracing::warn;

/// Normalized column metadata for one retrieved column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub description: String,
    pub data_type: Option<String>,
    /// "PRI" for primary keys, "FK" for foreign keys, empty otherwise.
    pub key_type: Option<String>,
    pub nullable: bool,
}

/// Normalized metadata for one retrieved table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDescriptor {
    pub name: String,
    pub description: String,
    /// Human-readable foreign key summary, prefixed "Foreign keys: ".
    pub foreign_keys: String,
    pub columns: Vec<ColumnDescriptor>,
}

impl TableDescriptor {
    /// Convert one graph result row. Rows missing the table name, the
    /// foreign-key payload, or a well-formed column list are rejected.
    pub fn from_graph_row(row: &GraphRow) -> Result<Self, String> {
        let name = row
            .first()
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("missing table name in row: {:?}", row))?;

        let description = row
            .get(1)
            .map(|v| match v {
                Value::String(s) => Ok(s.clone()),
                Value::Null => Ok(String::new()),
                other => Err(format!("non-string description for {}: {:?}", name, other)),
            })
            .transpose()?
            .unwrap_or_default();

        let foreign_keys_raw = row
            .get(2)
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("missing foreign_keys payload for table {}", name))?;

        let columns_raw = row
            .get(3)
            .and_then(|v| v.as_array())
            .ok_or_else(|| format!("missing columns list for table {}", name))?;

        let mut columns = Vec::with_capacity(columns_raw.len());
        for col in columns_raw {
            columns.push(Self::convert_column(name, col)?);
        }

        Ok(Self {
            name: name.to_string(),
            description,
            foreign_keys: format!("Foreign keys: {}", foreign_keys_raw),
            columns,
        })
    }

    fn convert_column(table: &str, col: &Value) -> Result<ColumnDescriptor, String> {
        let map = col
            .as_object()
            .ok_or_else(|| format!("non-mapping column entry in table {}: {:?}", table, col))?;

        let name = map
            .get("columnName")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("column without columnName in table {}", table))?;

        Ok(ColumnDescriptor {
            name: name.to_string(),
            description: map
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            data_type: map
                .get("dataType")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            key_type: map
                .get("keyType")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string()),
            nullable: map.get("nullable").and_then(|v| v.as_bool()).unwrap_or(false),
        })
    }
}

/// Merge search result lists into a unique-by-table-name descriptor list.
/// First occurrence wins; later duplicates are discarded without touching
/// the kept attributes. A row that fails conversion is logged and dropped —
/// partial search-result corruption never aborts the pipeline.
pub fn dedupe(rows: &[GraphRow]) -> Vec<TableDescriptor> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut unique = Vec::new();

    for row in rows {
        let name = match row.first().and_then(|v| v.as_str()) {
            Some(name) => name,
            None => {
                warn!("Dropping search result row without a table name");
                continue;
            }
        };

        if seen.contains(name) {
            continue;
        }

        match TableDescriptor::from_graph_row(row) {
            Ok(descriptor) => {
                seen.insert(name.to_string());
                unique.push(descriptor);
            }
            Err(e) => warn!("Dropping malformed search result row: {}", e),
        }
    }

    unique
}
