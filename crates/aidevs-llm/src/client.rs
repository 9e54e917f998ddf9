// OpenAI-compatible client behind the `LanguageModel` trait.
//
// Tasks only see `dyn LanguageModel`; `LlmClient` picks between a live
// `OpenAiClient` and a disabled stub depending on configured credentials.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde_json::{json, Value};
use tracing::{debug, warn};

use aidevs_core::config::Config;
use aidevs_core::media::mime_for;

use crate::error::LlmError;
use crate::types::ChatRequest;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// System prompt used by [`ask_llm`].
pub const DEFAULT_SYSTEM_PROMPT: &str = "Answer questions precisely and concisely. Provide very short responses with only necessery data. Response in Polish.";

// ---------------------------------------------------------------------------
// LanguageModel trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Run a chat completion and return the assistant's text.
    async fn complete(&self, request: ChatRequest) -> Result<String, LlmError>;

    /// Speech-to-text for an audio file.
    async fn transcribe(&self, audio: Vec<u8>, file_name: &str, model: &str) -> Result<String, LlmError>;

    /// Generate an image and return its URL.
    async fn generate_image(&self, prompt: &str, model: &str, size: &str) -> Result<String, LlmError>;

    /// One system + user exchange; the reply is trimmed.
    async fn ask(&self, system: &str, user: &str, model: &str) -> Result<String, LlmError> {
        let request = ChatRequest::new(model).system(system).user(user);
        Ok(self.complete(request).await?.trim().to_string())
    }
}

/// Ask a short question with the default system prompt.
pub async fn ask_llm(llm: &dyn LanguageModel, question: &str, model: &str) -> Result<String, LlmError> {
    llm.ask(DEFAULT_SYSTEM_PROMPT, question, model).await
}

// ---------------------------------------------------------------------------
// OpenAiClient
// ---------------------------------------------------------------------------

/// Client for the OpenAI REST API (or any server speaking the same shape).
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn read_json(response: reqwest::Response) -> Result<Value, LlmError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            warn!(%status, "LLM API error");
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: parse_api_error(&body),
            });
        }
        serde_json::from_str(&body)
            .map_err(|e| LlmError::InvalidResponse(format!("Failed to parse JSON: {e}")))
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn complete(&self, request: ChatRequest) -> Result<String, LlmError> {
        debug!(model = %request.model, messages = request.messages.len(), "chat completion");
        let response = self
            .http
            .post(self.url("chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;
        let v = Self::read_json(response).await?;
        parse_chat_content(&v)
            .ok_or_else(|| LlmError::InvalidResponse("missing choices[0].message.content".into()))
    }

    async fn transcribe(&self, audio: Vec<u8>, file_name: &str, model: &str) -> Result<String, LlmError> {
        debug!(%file_name, bytes = audio.len(), "transcription");
        let part = Part::bytes(audio)
            .file_name(file_name.to_string())
            .mime_str(mime_for(file_name))?;
        let form = Form::new().part("file", part).text("model", model.to_string());
        let response = self
            .http
            .post(self.url("audio/transcriptions"))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;
        let v = Self::read_json(response).await?;
        parse_transcription(&v).ok_or_else(|| LlmError::InvalidResponse("missing text".into()))
    }

    async fn generate_image(&self, prompt: &str, model: &str, size: &str) -> Result<String, LlmError> {
        debug!(%model, %size, "image generation");
        let body = json!({
            "model": model,
            "prompt": prompt,
            "n": 1,
            "size": size,
        });
        let response = self
            .http
            .post(self.url("images/generations"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let v = Self::read_json(response).await?;
        parse_image_url(&v).ok_or_else(|| LlmError::InvalidResponse("missing data[0].url".into()))
    }
}

// ---------------------------------------------------------------------------
// LlmClient wrapper
// ---------------------------------------------------------------------------

/// Either a live client or a stub that fails every call.
pub enum LlmClient {
    Active(OpenAiClient),
    /// No OpenAI key configured.
    Disabled,
}

impl LlmClient {
    /// `Active` when an OpenAI key is configured, otherwise `Disabled`.
    pub fn from_config(config: &Config) -> Self {
        match config.openai_api_key() {
            Some(key) => LlmClient::Active(OpenAiClient::new(key, config.openai.base_url.clone())),
            None => LlmClient::Disabled,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, LlmClient::Active(_))
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    async fn complete(&self, request: ChatRequest) -> Result<String, LlmError> {
        match self {
            LlmClient::Active(client) => client.complete(request).await,
            LlmClient::Disabled => Err(LlmError::NotConfigured),
        }
    }

    async fn transcribe(&self, audio: Vec<u8>, file_name: &str, model: &str) -> Result<String, LlmError> {
        match self {
            LlmClient::Active(client) => client.transcribe(audio, file_name, model).await,
            LlmClient::Disabled => Err(LlmError::NotConfigured),
        }
    }

    async fn generate_image(&self, prompt: &str, model: &str, size: &str) -> Result<String, LlmError> {
        match self {
            LlmClient::Active(client) => client.generate_image(prompt, model, size).await,
            LlmClient::Disabled => Err(LlmError::NotConfigured),
        }
    }
}

// ---------------------------------------------------------------------------
// Response parsing helpers
// ---------------------------------------------------------------------------

/// `choices[0].message.content`
pub(crate) fn parse_chat_content(v: &Value) -> Option<String> {
    v.get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()
        .map(str::to_string)
}

/// `text` of a transcription response.
pub(crate) fn parse_transcription(v: &Value) -> Option<String> {
    v.get("text")?.as_str().map(str::to_string)
}

/// `data[0].url` of an image generation response.
pub(crate) fn parse_image_url(v: &Value) -> Option<String> {
    v.get("data")?.get(0)?.get("url")?.as_str().map(str::to_string)
}

/// `error.message` when the body is an OpenAI error object, else the body.
pub(crate) fn parse_api_error(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error")?.get("message")?.as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
