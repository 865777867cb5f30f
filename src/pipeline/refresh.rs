//! Schema refresh after mutating SQL.
//!
//! When an executed statement changed the schema, the graph is dropped and
//! reloaded from the live database. A failed refresh is reported as a
//! warning only — the SQL has already run and is not undone.

use crate::loader::SqlLoader;
use crate::pipeline::events::{EventKind, RefreshStatus};
use tracing::warn;

/// Run the refresh and describe the outcome as a `schema_refresh` event
/// payload.
pub async fn refresh_schema(
    loader: &dyn SqlLoader,
    graph_id: &str,
    db_url: &str,
    operation_type: &str,
) -> EventKind {
    let (refresh_success, refresh_message) = loader.refresh_graph_schema(graph_id, db_url).await;

    if refresh_success {
        EventKind::SchemaRefresh {
            message: format!(
                "✅ Schema change detected ({} operation)\n\n🔄 Graph schema has been \
                 automatically refreshed with the latest database structure.",
                operation_type
            ),
            refresh_status: RefreshStatus::Success,
        }
    } else {
        warn!("Schema refresh failed for {}: {}", graph_id, refresh_message);
        EventKind::SchemaRefresh {
            message: format!(
                "⚠️ Schema was modified but graph refresh failed: {}",
                refresh_message
            ),
            refresh_status: RefreshStatus::Failed,
        }
    }
}
