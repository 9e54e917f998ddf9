// End-to-end run of the time-locked challenge against an in-process server.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aidevs_core::cache::TextCache;
use aidevs_core::config::load_config_from;
use aidevs_llm::{ChatRequest, LanguageModel, LlmError, Role};
use aidevs_tasks::context::TaskContext;
use aidevs_tasks::tasks::timelock;
use async_trait::async_trait;
use axum::extract::State;
use axum::response::Html;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

type Submissions = Arc<Mutex<Vec<Value>>>;

#[derive(Clone)]
struct ServerState {
    base: String,
    submissions: Submissions,
}

/// Answers each challenge by its topic, after an optional delay.
struct SlowModel {
    delay: Duration,
}

#[async_trait]
impl LanguageModel for SlowModel {
    async fn complete(&self, request: ChatRequest) -> Result<String, LlmError> {
        tokio::time::sleep(self.delay).await;
        let user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text())
            .unwrap_or_default();
        if user.contains("stolica") {
            Ok("Warszawa".to_string())
        } else if user.contains("Brave New World") && user.contains("Aldous Huxley") {
            Ok("Huxley".to_string())
        } else {
            Ok("?".to_string())
        }
    }

    async fn transcribe(&self, _audio: Vec<u8>, _file_name: &str, _model: &str) -> Result<String, LlmError> {
        Err(LlmError::NotConfigured)
    }

    async fn generate_image(&self, _prompt: &str, _model: &str, _size: &str) -> Result<String, LlmError> {
        Err(LlmError::NotConfigured)
    }
}

async fn challenge(State(state): State<ServerState>, Json(body): Json<Value>) -> Json<Value> {
    if body.get("password").is_some() {
        assert_eq!(body["password"], "s3cret");
        return Json(json!({"code": 0, "message": "0123456789abcdef0123456789abcdef"}));
    }
    if body.get("sign").is_some() {
        let base = &state.base;
        return Json(json!({"code": 0, "message": {
            "timestamp": 1700000000,
            "signature": "signed",
            "challenges": [format!("{base}/task1"), format!("{base}/task2")],
        }}));
    }
    state.submissions.lock().unwrap().push(body);
    Json(json!({"code": 0, "message": "{{FLG:TIMELOCK}}"}))
}

async fn task2(State(state): State<ServerState>) -> Json<Value> {
    let base = &state.base;
    Json(json!({"task": format!("Przeczytaj {base}/book i podaj autora"), "data": ["Kto napisał?"]}))
}

async fn spawn_challenge_server() -> (String, Submissions) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let state = ServerState {
        base: format!("http://{}", listener.local_addr().unwrap()),
        submissions: Submissions::default(),
    };
    let app = Router::new()
        .route("/challenge", post(challenge))
        .route("/task1", get(|| async { Json(json!({"task": "Odpowiedz na pytanie", "data": "stolica Polski?"})) }))
        .route("/task2", get(task2))
        .route(
            "/book",
            get(|| async { Html("<html><script>x()</script><p>Brave New World, Aldous Huxley</p></html>") }),
        )
        .with_state(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (state.base, state.submissions)
}

fn project_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .find(|p| p.join("defaults").join("aidevs.toml").exists())
        .map(PathBuf::from)
        .expect("defaults/ above the crate")
}

fn context(base: &str, budget_secs: f64, delay: Duration) -> TaskContext {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("config")).unwrap();
    let defaults = std::fs::read_to_string(project_root().join("defaults/aidevs.toml")).unwrap();
    let toml = defaults.replace("budget_secs = 6.0", &format!("budget_secs = {budget_secs:.1}"));
    std::fs::write(dir.path().join("config/aidevs.toml"), toml).unwrap();

    let env = vec![
        ("API_KEY".to_string(), "test-key".to_string()),
        ("CHALLENGE_URL".to_string(), format!("{base}/challenge")),
        ("CHALLENGE_PASSWORD".to_string(), "s3cret".to_string()),
    ];
    let config = load_config_from(dir.path(), |name| {
        env.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone())
    })
    .unwrap();
    TaskContext::new(config, Arc::new(SlowModel { delay }), TextCache::open(":memory:").unwrap()).unwrap()
}

#[tokio::test]
async fn solves_both_challenges_within_budget() {
    let (base, submissions) = spawn_challenge_server().await;
    let ctx = context(&base, 6.0, Duration::ZERO);

    let outcome = timelock::run(&ctx).await.unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.flag.as_deref(), Some("FLG:TIMELOCK"));
    assert_eq!(outcome.answer, json!("Warszawa. Huxley"));
    let submitted = submissions.lock().unwrap();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0]["apikey"], "test-key");
    assert_eq!(submitted[0]["timestamp"], 1700000000);
    assert_eq!(submitted[0]["signature"], "signed");
}

#[tokio::test]
async fn gives_up_without_submitting_when_over_budget() {
    let (base, submissions) = spawn_challenge_server().await;
    let ctx = context(&base, 0.5, Duration::from_millis(800));

    let outcome = timelock::run(&ctx).await.unwrap();

    assert!(!outcome.success);
    assert!(submissions.lock().unwrap().is_empty());
}
