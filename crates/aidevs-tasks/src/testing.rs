// Fakes shared by the unit tests.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;

use aidevs_core::cache::TextCache;
use aidevs_core::config::{load_config_from, Config};
use aidevs_llm::{ChatRequest, LanguageModel, LlmError};

use crate::context::TaskContext;

type Responder = Box<dyn Fn(&ChatRequest) -> String + Send + Sync>;

/// A language model that answers from a script and records every request.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    responder: Option<Responder>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedModel {
    /// Replies handed out in order; running out is an error.
    pub fn replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            responder: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Replies computed from each request.
    pub fn with<F>(responder: F) -> Self
    where
        F: Fn(&ChatRequest) -> String + Send + Sync + 'static,
    {
        Self {
            replies: Mutex::new(VecDeque::new()),
            responder: Some(Box::new(responder)),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

/// Text of the last user message in `request`.
pub fn last_user_text(request: &ChatRequest) -> String {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == aidevs_llm::Role::User)
        .map(|m| m.text())
        .unwrap_or_default()
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, request: ChatRequest) -> Result<String, LlmError> {
        let reply = match &self.responder {
            Some(responder) => Some(responder(&request)),
            None => self.replies.lock().unwrap().pop_front(),
        };
        self.requests.lock().unwrap().push(request);
        reply.ok_or_else(|| LlmError::InvalidResponse("script exhausted".into()))
    }

    async fn transcribe(&self, _audio: Vec<u8>, file_name: &str, _model: &str) -> Result<String, LlmError> {
        Ok(format!("transkrypcja {file_name}"))
    }

    async fn generate_image(&self, prompt: &str, _model: &str, _size: &str) -> Result<String, LlmError> {
        Ok(format!("https://images.test/{}.png", prompt.len()))
    }
}

fn project_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .find(|p| p.join("defaults").join("aidevs.toml").exists())
        .map(PathBuf::from)
        .unwrap_or_else(|| panic!("cannot locate defaults/ above the crate"))
}

/// Default configuration with `env` applied as environment overrides.
pub fn test_config(env: &[(&str, &str)]) -> Config {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("config")).unwrap();
    std::fs::copy(
        project_root().join("defaults/aidevs.toml"),
        dir.path().join("config/aidevs.toml"),
    )
    .unwrap();
    let env: Vec<(String, String)> = env
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    load_config_from(dir.path(), |name| {
        env.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone())
    })
    .unwrap()
}

/// A context whose report URL points at `base` and whose model is `llm`.
pub fn test_context(base: &str, env: &[(&str, &str)], llm: Arc<dyn LanguageModel>) -> TaskContext {
    let report_url = format!("{base}/report");
    let mut all: Vec<(&str, &str)> = vec![("API_KEY", "test-key"), ("CENTRALA_REPORT_URL", report_url.as_str())];
    all.extend_from_slice(env);
    TaskContext::new(test_config(&all), llm, TextCache::open(":memory:").unwrap()).unwrap()
}

/// Serve `app` on an ephemeral local port; returns `http://127.0.0.1:<port>`.
pub async fn spawn_server(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Router fragment recording report envelopes and answering with a flag.
pub mod centrala {
    use super::*;
    use axum::extract::State;
    use axum::routing::post;
    use axum::Json;
    use serde_json::{json, Value};

    pub type Reports = Arc<Mutex<Vec<Value>>>;

    async fn report(State(reports): State<Reports>, Json(body): Json<Value>) -> Json<Value> {
        reports.lock().unwrap().push(body);
        Json(json!({"code": 0, "message": "{{FLG:TEST_OK}}"}))
    }

    pub fn router() -> (Router, Reports) {
        let reports = Reports::default();
        let app = Router::new()
            .route("/report", post(report))
            .with_state(reports.clone());
        (app, reports)
    }
}
