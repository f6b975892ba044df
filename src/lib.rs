//! datatalk: conversational analytics over a remote data service.
//!
//! A caller's natural-language question is answered by letting a language
//! model request tool invocations (metadata reads, datasource queries)
//! that this crate executes against a remote analytical data service,
//! feeding results back round by round until an answer emerges. Progress
//! and answer text stream to the caller throughout.
//!
//! Entry point: [`crate::core::Engine::execute`]. Construct the engine with a
//! [`gateway::ModelClient`], a [`tool_client::ToolServiceClient`], a
//! [`history::HistoryStore`], and a [`context_cache::ContextProvider`].

pub mod accumulator;
pub mod clarify;
pub mod config;
pub mod context_cache;
pub mod core;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod history;
pub mod models;
pub mod tool_client;
pub mod truncation;

pub use crate::core::{Engine, ProgressEvent, ProgressSender, ProgressSink, RunOutcome, RunRequest};
pub use error::{ErrorKind, OrchestrationError, ToolError};
