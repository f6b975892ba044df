//! Engine core: the orchestration loop and its progress-event surface.

pub mod engine;
pub mod events;

pub use engine::{Engine, RunOutcome, RunRequest};
pub use events::{Citation, ProgressEvent, ProgressSender, ProgressSink};
