//! Tools that BSJ stages may attach to a model invocation.
//!
//! Provides the `Tool` trait and `ToolRegistry`, output truncation, and thin
//! HTTP adapters for web search (Tavily), page fetch (Firecrawl) and speech
//! synthesis (ElevenLabs).

pub mod fetch_url;
mod http;
pub mod speech;
pub mod tool;
pub mod truncation;
pub mod web_search;

pub use bsj_llm::ToolDefinition;
pub use fetch_url::FetchUrlTool;
pub use speech::SpeechTool;
pub use tool::{Tool, ToolRegistry};
pub use web_search::WebSearchTool;
