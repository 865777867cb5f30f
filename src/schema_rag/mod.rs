//! Schema retrieval: description stubs, vector + topology search, dedup.

pub mod dedup;
pub mod descriptions;
pub mod retriever;

pub use dedup::{ColumnDescriptor, TableDescriptor};
pub use retriever::SchemaRetriever;
