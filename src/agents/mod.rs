//! LLM-backed agents of the query pipeline.

pub mod analysis;
pub mod follow_up;
pub mod healer;
pub mod parser;
pub mod relevancy;
pub mod response_formatter;

pub use analysis::{AnalysisAgent, AnalysisVerdict};
pub use follow_up::FollowUpAgent;
pub use healer::{HealerAgent, HealingSession};
pub use relevancy::{RelevancyAgent, RelevancyStatus, RelevancyVerdict};
pub use response_formatter::ResponseFormatterAgent;
