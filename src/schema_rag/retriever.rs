//! Schema retrieval engine.
//!
//! Combines semantic vector search (table and column embeddings) with graph
//! topology expansion (foreign-key spheres, shortest-path connectors) to
//! surface the tables a query needs — including junction tables that no
//! embedding would ever match.

use crate::embedding::{Embedding, EmbeddingProvider};
use crate::error::{Result, Text2SqlError};
use crate::graph::{GraphClient, GraphParams, GraphRow};
use crate::pipeline::cancel::CancelToken;
use crate::pipeline::history::ConversationHistory;
use crate::schema_rag::dedup::{dedupe, TableDescriptor};
use crate::schema_rag::descriptions::DescriptionGenerator;
use futures::future::try_join_all;
use itertools::Itertools;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

const TABLE_VECTOR_QUERY: &str = "
    CALL db.idx.vector.queryNodes('Table','embedding',3,vecf32($embedding))
    YIELD node, score
    MATCH (node)-[:BELONGS_TO]-(columns)
    RETURN node.name, node.description, node.foreign_keys, collect({
        columnName: columns.name,
        description: columns.description,
        dataType: columns.type,
        keyType: columns.key,
        nullable: columns.nullable
    })
";

const COLUMN_VECTOR_QUERY: &str = "
    CALL db.idx.vector.queryNodes('Column','embedding',3,vecf32($embedding))
    YIELD node, score
    MATCH (node)-[:BELONGS_TO]-(table)-[:BELONGS_TO]-(columns)
    RETURN
        table.name,
        table.description,
        table.foreign_keys,
        collect({
            columnName: columns.name,
            description: columns.description,
            dataType: columns.type,
            keyType: columns.key,
            nullable: columns.nullable
        })
";

const SPHERE_QUERY: &str = "
    MATCH (node:Table {name: $name})
    MATCH (node)-[:BELONGS_TO]-(column)-[:REFERENCES]-()-[:BELONGS_TO]-(table_ref)
    WITH table_ref
    MATCH (table_ref)-[:BELONGS_TO]-(columns)
    RETURN table_ref.name, table_ref.description, table_ref.foreign_keys,
           collect({
               columnName: columns.name,
               description: columns.description,
               dataType: columns.type,
               keyType: columns.key,
               nullable: columns.nullable
           })
";

const CONNECTOR_QUERY: &str = "
    UNWIND $pairs AS pair
    MATCH (a:Table {name: pair[0]})
    MATCH (b:Table {name: pair[1]})
    WITH a, b
    MATCH p = allShortestPaths((a)-[*..6]-(b))
    UNWIND nodes(p) AS path_node
    WITH DISTINCT path_node
    WHERE 'Table' IN labels(path_node) OR
          ('Column' IN labels(path_node) AND path_node.key_type = 'PRI')
    WITH path_node,
         'Table' IN labels(path_node) AS is_table,
         'Column' IN labels(path_node) AND path_node.key_type = 'PRI' AS is_pri_column
    OPTIONAL MATCH (path_node)-[:BELONGS_TO]->(parent_table:Table)
    WHERE is_pri_column
    WITH CASE
           WHEN is_table THEN path_node
           WHEN is_pri_column THEN parent_table
           ELSE null
         END AS target_table
    WHERE target_table IS NOT NULL
    WITH DISTINCT target_table
    MATCH (col:Column)-[:BELONGS_TO]->(target_table)
    WITH target_table,
         collect({
            columnName: col.name,
            description: col.description,
            dataType: col.type,
            keyType: col.key,
            nullable: col.nullable
         }) AS columns
    RETURN target_table.name, target_table.description, target_table.foreign_keys, columns
";

pub struct SchemaRetriever {
    graph: Arc<dyn GraphClient>,
    embedder: Arc<dyn EmbeddingProvider>,
    generator: DescriptionGenerator,
}

impl SchemaRetriever {
    pub fn new(
        graph: Arc<dyn GraphClient>,
        embedder: Arc<dyn EmbeddingProvider>,
        generator: DescriptionGenerator,
    ) -> Self {
        Self { graph, embedder, generator }
    }

    /// Find the tables relevant to the current question.
    ///
    /// Embedding and vector-search failures propagate (a broken provider is
    /// a configuration error); sphere and connector failures degrade to
    /// empty lists. The token is checked at every suspension point so the
    /// off-topic short-circuit leaves no orphaned graph work behind.
    pub async fn find(
        &self,
        graph_id: &str,
        history: &ConversationHistory,
        db_description: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<TableDescriptor>> {
        let user_query = history
            .current_question()
            .ok_or_else(|| Text2SqlError::InvalidArgument("Empty chat history".to_string()))?;

        self.check_cancelled(cancel)?;

        let descriptions = self
            .generator
            .generate(user_query, history.previous_questions(), db_description)
            .await?;

        if descriptions.is_empty() {
            return Ok(Vec::new());
        }

        self.check_cancelled(cancel)?;

        // One batch call for all stubs, then split by stub counts.
        let embeddings = self.embedder.embed(&descriptions.texts()).await?;
        let table_count = descriptions.tables_descriptions.len();
        let (table_embeddings, column_embeddings) = embeddings.split_at(table_count.min(embeddings.len()));

        self.check_cancelled(cancel)?;

        let (tables_des, tables_by_columns_des) = tokio::join!(
            self.find_tables(graph_id, table_embeddings, cancel),
            self.find_tables_by_columns(graph_id, column_embeddings, cancel),
        );
        let tables_des = tables_des?;
        let tables_by_columns_des = tables_by_columns_des?;

        let found_table_names: Vec<String> = tables_des
            .iter()
            .filter_map(|row| row.first().and_then(|v| v.as_str()).map(|s| s.to_string()))
            .collect();

        self.check_cancelled(cancel)?;

        // Topology expansion only makes sense once at least one table is
        // anchored.
        let (tables_by_sphere, tables_by_route) = if found_table_names.is_empty() {
            (Vec::new(), Vec::new())
        } else {
            tokio::join!(
                self.find_tables_sphere(graph_id, &found_table_names),
                self.find_connecting_tables(graph_id, &found_table_names),
            )
        };

        self.check_cancelled(cancel)?;

        let mut combined = tables_des;
        combined.extend(tables_by_columns_des);
        combined.extend(tables_by_route);
        combined.extend(tables_by_sphere);

        let unique = dedupe(&combined);
        info!("Schema retrieval found {} unique tables", unique.len());
        Ok(unique)
    }

    fn check_cancelled(&self, cancel: &CancelToken) -> Result<()> {
        if cancel.is_cancelled() {
            Err(Text2SqlError::Cancelled("schema retrieval cancelled".to_string()))
        } else {
            Ok(())
        }
    }

    /// Top-3 vector search over Table embeddings, one query per stub vector.
    async fn find_tables(
        &self,
        graph_id: &str,
        embeddings: &[Embedding],
        cancel: &CancelToken,
    ) -> Result<Vec<GraphRow>> {
        if embeddings.is_empty() {
            return Ok(Vec::new());
        }
        self.check_cancelled(cancel)?;
        self.vector_search(graph_id, TABLE_VECTOR_QUERY, embeddings).await
    }

    /// Top-3 vector search over Column embeddings, resolved to owning tables.
    async fn find_tables_by_columns(
        &self,
        graph_id: &str,
        embeddings: &[Embedding],
        cancel: &CancelToken,
    ) -> Result<Vec<GraphRow>> {
        if embeddings.is_empty() {
            return Ok(Vec::new());
        }
        self.check_cancelled(cancel)?;
        self.vector_search(graph_id, COLUMN_VECTOR_QUERY, embeddings).await
    }

    async fn vector_search(
        &self,
        graph_id: &str,
        query: &str,
        embeddings: &[Embedding],
    ) -> Result<Vec<GraphRow>> {
        let searches = embeddings.iter().map(|embedding| {
            let mut params = GraphParams::new();
            params.insert("embedding".to_string(), serde_json::json!(embedding));
            async move { self.graph.query(graph_id, query, &params).await }
        });

        let results = try_join_all(searches).await?;
        Ok(results.into_iter().flatten().collect())
    }

    /// One hop out through foreign-key references from each found table.
    /// Failures degrade to an empty list.
    async fn find_tables_sphere(&self, graph_id: &str, tables: &[String]) -> Vec<GraphRow> {
        let searches = tables.iter().map(|name| {
            let mut params = GraphParams::new();
            params.insert("name".to_string(), Value::String(name.clone()));
            async move { self.graph.query(graph_id, SPHERE_QUERY, &params).await }
        });

        match try_join_all(searches).await {
            Ok(results) => results.into_iter().flatten().collect(),
            Err(e) => {
                warn!("Error finding tables in sphere: {}", e);
                Vec::new()
            }
        }
    }

    /// Shortest-path connectors (≤6 hops) between every unordered pair of
    /// found tables, keeping Table nodes and primary-key columns resolved
    /// to their owning tables. Failures degrade to an empty list.
    async fn find_connecting_tables(&self, graph_id: &str, table_names: &[String]) -> Vec<GraphRow> {
        let pairs: Vec<Value> = table_names
            .iter()
            .tuple_combinations()
            .map(|(a, b)| serde_json::json!([a, b]))
            .collect();

        if pairs.is_empty() {
            return Vec::new();
        }

        let mut params = GraphParams::new();
        params.insert("pairs".to_string(), Value::Array(pairs));

        match self.graph.query(graph_id, CONNECTOR_QUERY, &params).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Error finding connecting tables: {}", e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatCompletion, ChatMessage, CompletionOptions};
    use async_trait::async_trait;
    use serde_json::json;

    struct StubLlm;

    #[async_trait]
    impl ChatCompletion for StubLlm {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _options: &CompletionOptions,
        ) -> Result<String> {
            Ok(json!({
                "tables_descriptions": [
                    {"name": "users", "description": "registered users"},
                    {"name": "orders", "description": "orders placed by users"}
                ],
                "columns_descriptions": [
                    {"name": "total", "description": "order total amount"}
                ]
            })
            .to_string())
        }
    }

    struct StubEmbedder;

    #[async_trait]
    impl EmbeddingProvider for StubEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Embedding>> {
            Ok(texts.iter().map(|_| vec![0.5_f32; 4]).collect())
        }

        async fn vector_size(&self) -> Result<usize> {
            Ok(4)
        }
    }

    fn table_row(name: &str) -> GraphRow {
        vec![
            json!(name),
            json!(format!("{} table", name)),
            json!("{}"),
            json!([{"columnName": "id", "description": "pk", "dataType": "integer",
                    "keyType": "PRI", "nullable": false}]),
        ]
    }

    /// Graph whose topology searches fail; vector searches succeed.
    struct FlakyTopologyGraph;

    #[async_trait]
    impl GraphClient for FlakyTopologyGraph {
        async fn query(
            &self,
            _graph_id: &str,
            query: &str,
            _params: &GraphParams,
        ) -> Result<Vec<GraphRow>> {
            if query.contains("queryNodes('Table'") {
                return Ok(vec![table_row("users"), table_row("orders")]);
            }
            if query.contains("queryNodes('Column'") {
                // Column search resolves to a table already found plus a
                // new one; dedup must keep first occurrences only.
                return Ok(vec![table_row("orders"), table_row("order_items")]);
            }
            // Sphere and connector searches blow up.
            Err(Text2SqlError::Graph("topology index offline".to_string()))
        }

        async fn delete_graph(&self, _graph_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn retriever(graph: Arc<dyn GraphClient>) -> SchemaRetriever {
        SchemaRetriever::new(
            graph,
            Arc::new(StubEmbedder),
            DescriptionGenerator::new(Arc::new(StubLlm)),
        )
    }

    fn history() -> ConversationHistory {
        ConversationHistory::new(vec!["total per user".to_string()], vec![])
    }

    #[tokio::test]
    async fn test_topology_failures_degrade_to_vector_results() {
        let retriever = retriever(Arc::new(FlakyTopologyGraph));
        let tables = retriever
            .find("g", &history(), "shop db", &CancelToken::new())
            .await
            .unwrap();

        // Two vector-search runs per branch (2 table stubs, 1 column
        // stub), deduped by first occurrence; sphere/connector errors
        // contributed nothing but did not abort.
        let names: Vec<&str> = tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["users", "orders", "order_items"]);
    }

    #[tokio::test]
    async fn test_cancellation_stops_retrieval() {
        let retriever = retriever(Arc::new(FlakyTopologyGraph));
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = retriever
            .find("g", &history(), "shop db", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Text2SqlError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_empty_history_is_invalid_argument() {
        let retriever = retriever(Arc::new(FlakyTopologyGraph));
        let err = retriever
            .find("g", &ConversationHistory::default(), "db", &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Text2SqlError::InvalidArgument(_)));
    }
}
