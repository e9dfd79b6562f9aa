//! Model-provider seam for the BSJ pipeline.
//!
//! Provides the `ModelProvider` trait, the request/response message types the
//! stage adapter speaks, and a `GeminiAdapter` backed by the Generative
//! Language REST API.

mod gemini;
mod provider;
mod types;

pub use gemini::GeminiAdapter;
pub use provider::*;
pub use types::*;
