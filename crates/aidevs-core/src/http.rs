// HTTP plumbing: a status-checking request helper and the Centrala report
// envelope.

use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::flag::scan_flag;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request to {url} failed with status {status}: {body}")]
    Status {
        url: String,
        status: StatusCode,
        body: String,
    },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("unexpected response from {url}: {message}")]
    Unexpected { url: String, message: String },
}

// ---------------------------------------------------------------------------
// Requests and responses
// ---------------------------------------------------------------------------

/// Request body variants used by the tasks.
#[derive(Debug, Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
}

/// A single outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub body: Body,
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: Body::Empty,
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Body::Json(body);
        self
    }

    pub fn form<K, V>(mut self, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.body = Body::Form(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A buffered response.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub url: String,
    pub status: StatusCode,
    pub bytes: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HttpError> {
        serde_json::from_slice(&self.bytes).map_err(|source| HttpError::Decode {
            url: self.url.clone(),
            source,
        })
    }
}

// ---------------------------------------------------------------------------
// HttpClient
// ---------------------------------------------------------------------------

/// Thin wrapper around `reqwest::Client` that turns non-2xx responses into
/// errors and buffers bodies.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    /// Build a client whose requests time out after `timeout` unless a
    /// request sets its own.
    pub fn new(timeout: Duration) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(HttpError::Client)?;
        Ok(Self { client })
    }

    /// Send `request`; 4xx/5xx responses become [`HttpError::Status`].
    pub async fn make_request(&self, request: Request) -> Result<FetchedResponse, HttpError> {
        let fetched = self.send_unchecked(request).await?;
        if fetched.status.is_client_error() || fetched.status.is_server_error() {
            return Err(HttpError::Status {
                url: fetched.url.clone(),
                status: fetched.status,
                body: fetched.text(),
            });
        }
        Ok(fetched)
    }

    /// Send `request` and return the response whatever its status.
    pub async fn send_unchecked(&self, request: Request) -> Result<FetchedResponse, HttpError> {
        let Request {
            method,
            url,
            body,
            timeout,
        } = request;
        debug!(%method, %url, "sending request");

        let mut builder = self.client.request(method, &url);
        builder = match body {
            Body::Empty => builder,
            Body::Json(value) => builder.json(&value),
            Body::Form(fields) => builder.form(&fields),
        };
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|source| HttpError::Transport {
            url: url.clone(),
            source,
        })?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|source| HttpError::Transport {
                url: url.clone(),
                source,
            })?
            .to_vec();
        debug!(%url, %status, len = bytes.len(), "response received");

        Ok(FetchedResponse { url, status, bytes })
    }

    pub async fn get_text(&self, url: &str) -> Result<String, HttpError> {
        Ok(self.make_request(Request::get(url)).await?.text())
    }

    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, HttpError> {
        Ok(self.make_request(Request::get(url)).await?.bytes)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, HttpError> {
        self.make_request(Request::get(url)).await?.json()
    }

    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<FetchedResponse, HttpError> {
        let value = serde_json::to_value(body).map_err(|source| HttpError::Decode {
            url: url.to_string(),
            source,
        })?;
        self.make_request(Request::post(url).json(value)).await
    }

    pub async fn post_form(
        &self,
        url: &str,
        fields: &[(&str, &str)],
    ) -> Result<FetchedResponse, HttpError> {
        self.make_request(Request::post(url).form(fields.iter().copied()))
            .await
    }
}

// ---------------------------------------------------------------------------
// Centrala
// ---------------------------------------------------------------------------

/// What the grading server said about a submitted answer.
#[derive(Debug, Clone)]
pub struct ReportOutcome {
    pub status: StatusCode,
    pub body: String,
    pub json: Option<Value>,
    pub flag: Option<String>,
}

impl ReportOutcome {
    fn from_response(response: FetchedResponse) -> Self {
        let body = response.text();
        let json = serde_json::from_str(&body).ok();
        let flag = scan_flag(&body);
        Self {
            status: response.status,
            body,
            json,
            flag,
        }
    }

    /// True when the server accepted the answer (2xx and `code` 0 if present).
    pub fn accepted(&self) -> bool {
        if !self.status.is_success() {
            return false;
        }
        match self.json.as_ref().and_then(|j| j.get("code")) {
            Some(code) => code.as_i64() == Some(0),
            None => true,
        }
    }

    /// The `message` field of a JSON response, if any.
    pub fn message(&self) -> Option<&str> {
        self.json.as_ref()?.get("message")?.as_str()
    }
}

/// Client for the grading server: builds `{task, apikey, answer}` envelopes
/// and runs queries through the database API.
#[derive(Debug, Clone)]
pub struct CentralaClient {
    http: HttpClient,
    report_url: String,
    api_key: String,
}

impl CentralaClient {
    pub fn new(http: HttpClient, report_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            report_url: report_url.into(),
            api_key: api_key.into(),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    pub fn report_url(&self) -> &str {
        &self.report_url
    }

    /// The standard answer envelope.
    pub fn envelope<A: Serialize + ?Sized>(&self, task: &str, answer: &A) -> Value {
        json!({
            "task": task,
            "apikey": self.api_key,
            "answer": answer,
        })
    }

    /// Submit `answer` for `task` to the report endpoint.
    ///
    /// Rejections (4xx with a JSON explanation) are returned as outcomes, not
    /// errors, since tasks use them as feedback.
    pub async fn report<A: Serialize + ?Sized>(
        &self,
        task: &str,
        answer: &A,
    ) -> Result<ReportOutcome, HttpError> {
        let envelope = self.envelope(task, answer);
        self.report_envelope(&self.report_url, envelope).await
    }

    /// Post a prepared envelope to `url`.
    pub async fn report_envelope(&self, url: &str, envelope: Value) -> Result<ReportOutcome, HttpError> {
        info!(%url, task = envelope.get("task").and_then(serde_json::Value::as_str).unwrap_or("?"), "submitting answer");
        let response = self
            .http
            .send_unchecked(Request::post(url).json(envelope))
            .await?;
        if response.status.is_server_error() {
            return Err(HttpError::Status {
                url: response.url.clone(),
                status: response.status,
                body: response.text(),
            });
        }

        let outcome = ReportOutcome::from_response(response);
        if outcome.accepted() {
            info!(status = %outcome.status, flag = ?outcome.flag, "answer accepted");
        } else {
            warn!(status = %outcome.status, body = %outcome.body, "answer rejected");
        }
        Ok(outcome)
    }

    /// Run `query` through the database API and return the `reply` rows.
    pub async fn query_database(&self, url: &str, query: &str) -> Result<Vec<Value>, HttpError> {
        debug!(%query, "database query");
        let envelope = json!({
            "task": "database",
            "apikey": self.api_key,
            "query": query,
        });
        let response = self
            .http
            .make_request(Request::post(url).json(envelope))
            .await?;
        let body: Value = response.json()?;
        match body.get("reply") {
            Some(Value::Array(rows)) => Ok(rows.clone()),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(other) => Err(HttpError::Unexpected {
                url: url.to_string(),
                message: format!("`reply` is not an array: {other}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(status: u16, body: &str) -> ReportOutcome {
        ReportOutcome::from_response(FetchedResponse {
            url: "http://test/report".into(),
            status: StatusCode::from_u16(status).unwrap(),
            bytes: body.as_bytes().to_vec(),
        })
    }

    #[test]
    fn accepted_requires_success_and_zero_code() {
        assert!(outcome(200, r#"{"code":0,"message":"{{FLG:OK}}"}"#).accepted());
        assert!(outcome(200, "plain OK").accepted());
        assert!(!outcome(200, r#"{"code":-340,"message":"nope"}"#).accepted());
        assert!(!outcome(400, r#"{"code":0}"#).accepted());
    }

    #[test]
    fn outcome_extracts_flag_and_message() {
        let o = outcome(200, r#"{"code":0,"message":"Brawo {{FLG:DONE_1}}"}"#);
        assert_eq!(o.flag.as_deref(), Some("FLG:DONE_1"));
        assert_eq!(o.message(), Some("Brawo {{FLG:DONE_1}}"));

        let o = outcome(400, "not json");
        assert!(o.json.is_none());
        assert!(o.message().is_none());
        assert!(o.flag.is_none());
    }

    #[test]
    fn envelope_shape() {
        let http = HttpClient::new(Duration::from_secs(1)).unwrap();
        let client = CentralaClient::new(http, "http://test/report", "key-1");
        let env = client.envelope("POLIGON", &vec!["a", "b"]);
        assert_eq!(
            env,
            json!({"task": "POLIGON", "apikey": "key-1", "answer": ["a", "b"]})
        );
    }

    #[test]
    fn request_builder() {
        let req = Request::post("http://x/")
            .form([("username", "tester"), ("answer", "1410")])
            .timeout(Duration::from_secs(2));
        assert_eq!(req.method, Method::POST);
        assert_eq!(req.timeout, Some(Duration::from_secs(2)));
        match req.body {
            Body::Form(fields) => assert_eq!(fields[1], ("answer".to_string(), "1410".to_string())),
            other => panic!("expected Form body, got: {other:?}"),
        }
    }
}
