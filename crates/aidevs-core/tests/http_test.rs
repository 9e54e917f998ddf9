// HTTP client and Centrala reporting against an in-process server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use aidevs_core::http::{CentralaClient, HttpClient, HttpError, Request};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

type Captured = Arc<Mutex<Vec<Value>>>;

async fn spawn(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn report(State(captured): State<Captured>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    captured.lock().unwrap().push(body.clone());
    if body["answer"] == json!("dobra") {
        (StatusCode::OK, Json(json!({"code": 0, "message": "{{FLG:DOBRZE}}"})))
    } else {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"code": -340, "message": "Answer for question 03 is incorrect"})),
        )
    }
}

async fn database(Json(body): Json<Value>) -> Json<Value> {
    assert_eq!(body["task"], "database");
    Json(json!({
        "reply": [{"id": "1", "username": "Rafał"}, {"id": 2, "username": "Barbara"}],
        "error": "OK"
    }))
}

async fn server() -> (String, Captured) {
    let captured: Captured = Arc::default();
    let app = Router::new()
        .route("/ok", get(|| async { "witaj" }))
        .route("/missing", get(|| async { (StatusCode::NOT_FOUND, "brak") }))
        .route(
            "/boom",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "awaria") })
                .post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "awaria") }),
        )
        .route("/report", post(report))
        .route("/apidb", post(database))
        .with_state(captured.clone());
    (spawn(app).await, captured)
}

fn client() -> HttpClient {
    HttpClient::new(Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn make_request_returns_body_on_success() {
    let (base, _) = server().await;
    let response = client().make_request(Request::get(format!("{base}/ok"))).await.unwrap();
    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(response.text(), "witaj");
}

#[tokio::test]
async fn make_request_errors_on_client_error() {
    let (base, _) = server().await;
    match client().make_request(Request::get(format!("{base}/missing"))).await {
        Err(HttpError::Status { status, body, .. }) => {
            assert_eq!(status.as_u16(), 404);
            assert_eq!(body, "brak");
        }
        other => panic!("expected status error, got: {other:?}"),
    }
}

#[tokio::test]
async fn make_request_errors_on_server_error() {
    let (base, _) = server().await;
    match client().make_request(Request::get(format!("{base}/boom"))).await {
        Err(HttpError::Status { status, body, .. }) => {
            assert_eq!(status.as_u16(), 500);
            assert_eq!(body, "awaria");
        }
        other => panic!("expected status error, got: {other:?}"),
    }
}

#[tokio::test]
async fn report_errors_on_server_error() {
    let (base, captured) = server().await;
    let centrala = CentralaClient::new(client(), format!("{base}/boom"), "klucz");

    match centrala.report("test", "dobra").await {
        Err(HttpError::Status { status, url, .. }) => {
            assert_eq!(status.as_u16(), 500);
            assert_eq!(url, format!("{base}/boom"));
        }
        other => panic!("expected status error, got: {other:?}"),
    }
    assert!(captured.lock().unwrap().is_empty());
}

#[tokio::test]
async fn report_sends_envelope_and_extracts_flag() {
    let (base, captured) = server().await;
    let centrala = CentralaClient::new(client(), format!("{base}/report"), "klucz-123");

    let outcome = centrala.report("test", "dobra").await.unwrap();
    assert!(outcome.accepted());
    assert_eq!(outcome.flag.as_deref(), Some("FLG:DOBRZE"));

    let sent = captured.lock().unwrap().clone();
    assert_eq!(sent, vec![json!({"task": "test", "apikey": "klucz-123", "answer": "dobra"})]);
}

#[tokio::test]
async fn rejected_report_is_an_outcome_not_an_error() {
    let (base, _) = server().await;
    let centrala = CentralaClient::new(client(), format!("{base}/report"), "klucz");

    let outcome = centrala
        .report("notes", &json!({"01": "zła"}))
        .await
        .unwrap();
    assert!(!outcome.accepted());
    assert_eq!(outcome.status.as_u16(), 400);
    assert_eq!(outcome.message(), Some("Answer for question 03 is incorrect"));
    assert_eq!(outcome.flag, None);
}

#[tokio::test]
async fn query_database_returns_reply_rows() {
    let (base, _) = server().await;
    let centrala = CentralaClient::new(client(), format!("{base}/report"), "klucz");

    let rows = centrala
        .query_database(&format!("{base}/apidb"), "SELECT id, username FROM users")
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["username"], "Rafał");
}
