// Long-running webhook servers the grading server calls back into, and the
// registration helpers that point it at them.

pub mod drone;
pub mod heart;

use anyhow::{bail, Context, Result};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use aidevs_core::http::{CentralaClient, HttpError, ReportOutcome};

/// Body of the `/register-webhook` endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookRegistration {
    pub webhook_url: String,
}

/// Report `webhook_url` as the answer for `task`. With `just_update` the
/// grading server only stores the URL and skips its tests.
pub async fn register_webhook(
    centrala: &CentralaClient,
    task: &str,
    webhook_url: Option<&str>,
    just_update: bool,
) -> Result<ReportOutcome, HttpError> {
    let mut envelope = match webhook_url {
        Some(url) => centrala.envelope(task, url),
        None => json!({"task": task, "apikey": centrala.api_key()}),
    };
    if just_update {
        envelope["justUpdate"] = json!(true);
    }
    info!(%task, url = ?webhook_url, just_update, "registering webhook");
    let outcome = centrala.report_envelope(centrala.report_url(), envelope).await?;
    match &outcome.flag {
        Some(flag) => info!(%flag, "flag in registration reply"),
        None => warn!("no flag yet; keep the server running while it is tested"),
    }
    Ok(outcome)
}

/// Public webhook URLs must be https; a missing `expected_suffix` only warns.
pub fn validate_webhook_url(url: &str, expected_suffix: Option<&str>) -> Result<()> {
    if !url.starts_with("https://") {
        bail!("webhook URL must start with https://: {url}");
    }
    if let Some(suffix) = expected_suffix {
        if !url.ends_with(suffix) {
            warn!(%url, %suffix, "webhook URL does not end with the expected endpoint");
        }
    }
    Ok(())
}

/// JSON reply of the registration endpoints.
pub fn registration_reply(outcome: &ReportOutcome) -> Value {
    let mut reply = json!({"status": "success", "response": outcome.body});
    if let Some(flag) = &outcome.flag {
        reply["flag"] = json!(flag);
    }
    reply
}

/// Bind `host:port` and serve `app` with request tracing until shutdown.
pub async fn serve(app: Router, host: &str, port: u16) -> Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "webhook server listening");
    axum::serve(listener, app.layer(TraceLayer::new_for_http()))
        .await
        .context("webhook server failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{centrala, spawn_server, test_context, ScriptedModel};
    use std::sync::Arc;

    #[test]
    fn webhook_urls_must_be_https() {
        assert!(validate_webhook_url("https://abc.test/drone", Some("/drone")).is_ok());
        assert!(validate_webhook_url("https://abc.test/", Some("/drone")).is_ok());
        assert!(validate_webhook_url("http://abc.test/drone", None).is_err());
    }

    #[tokio::test]
    async fn registration_envelopes() {
        let (app, reports) = centrala::router();
        let base = spawn_server(app).await;
        let ctx = test_context(&base, &[], Arc::new(ScriptedModel::replies(Vec::<String>::new())));

        let outcome = register_webhook(&ctx.centrala, "serce", Some("https://abc.test/"), true)
            .await
            .unwrap();
        assert_eq!(registration_reply(&outcome)["flag"], "FLG:TEST_OK");
        register_webhook(&ctx.centrala, "serce", None, true).await.unwrap();

        let reports = reports.lock().unwrap();
        assert_eq!(
            reports[0],
            json!({"task": "serce", "apikey": "test-key", "answer": "https://abc.test/", "justUpdate": true})
        );
        assert_eq!(reports[1], json!({"task": "serce", "apikey": "test-key", "justUpdate": true}));
    }
}
