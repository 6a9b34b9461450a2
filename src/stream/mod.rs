//! Streaming side of the agent: client events, incremental op emission and
//! the per-request tool-call session.

pub mod emitter;
pub mod events;
pub mod session;

pub use emitter::{IncrementalOpEmitter, StreamDedupeState};
pub use events::{StreamEvent, ToolStatus};
pub use session::{CompletedCall, Progress, StreamSession};
