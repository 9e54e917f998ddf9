// Language model access: request types, the `LanguageModel` seam and an
// OpenAI-compatible HTTP client.

pub mod client;
pub mod error;
pub mod types;

pub use client::{ask_llm, LanguageModel, LlmClient, OpenAiClient, DEFAULT_SYSTEM_PROMPT};
pub use error::LlmError;
pub use types::{ChatMessage, ChatRequest, ContentPart, MessageContent, Role};
