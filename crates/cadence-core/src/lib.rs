pub mod agents;
pub mod cancellation;
pub mod config;
pub mod diff_review;
pub mod event_bus;
pub mod intent;
pub mod orchestrator;
pub mod pipeline;
pub mod quota;
pub mod redaction;
pub mod reflexion;
pub mod state_machine;
pub mod storage;
pub mod workflow;

pub use agents::*;
pub use cancellation::*;
pub use config::*;
pub use diff_review::*;
pub use event_bus::*;
pub use intent::*;
pub use orchestrator::*;
pub use pipeline::*;
pub use quota::*;
pub use redaction::*;
pub use reflexion::*;
pub use state_machine::*;
pub use storage::*;
pub use workflow::*;
