//! Query pipeline: events, history, gates, orchestration.

pub mod cancel;
pub mod destructive;
pub mod events;
pub mod history;
pub mod orchestrator;
pub mod refresh;
pub mod supervisor;

pub use cancel::CancelToken;
pub use events::{EventKind, PipelineEvent, RefreshStatus};
pub use history::ConversationHistory;
pub use orchestrator::{ChatRequest, ConfirmRequest, EventStream, QueryPipeline};
pub use supervisor::TaskSupervisor;
