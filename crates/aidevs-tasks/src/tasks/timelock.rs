// Time-locked challenge: sign a hash, then solve two small tasks and submit
// the combined answer inside a fixed time budget.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future::join;
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use aidevs_core::deadline::TimeBudget;
use aidevs_core::html::clean_html_content;
use aidevs_core::http::Request;
use aidevs_core::text::{find_url, truncate_chars};

use crate::context::TaskContext;
use crate::outcome::TaskOutcome;

pub const TASK: &str = "timelock";
const EXTRA_DATA_CHARS: usize = 3000;
const SYSTEM_PROMPT: &str = "Odpowiadaj ultra-krótko po polsku. Tylko wynik.";

/// Signed challenge returned for a hash.
#[derive(Debug, Clone, PartialEq)]
pub struct Challenge {
    pub timestamp: Value,
    pub signature: Value,
    pub urls: Vec<String>,
}

/// The hash from the password reply: `message` of an object, or a bare
/// 32-character string.
pub fn parse_hash(reply: &Value) -> Option<String> {
    match reply {
        Value::Object(obj) => obj.get("message").and_then(Value::as_str).map(str::to_string),
        Value::String(s) if s.chars().count() == 32 => Some(s.clone()),
        _ => None,
    }
}

/// Timestamp, signature and the two challenge URLs from the sign reply.
pub fn parse_challenge(reply: &Value) -> Option<Challenge> {
    let message = reply.get("message").filter(|m| m.is_object())?;
    let urls: Vec<String> = message
        .get("challenges")?
        .as_array()?
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    if urls.len() < 2 {
        return None;
    }
    Some(Challenge {
        timestamp: message.get("timestamp").cloned().unwrap_or(Value::Null),
        signature: message.get("signature").cloned().unwrap_or(Value::Null),
        urls,
    })
}

fn field_text(task: &Value, name: &str) -> String {
    match task.get(name) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// URL embedded in a challenge's `task` text, if any.
pub fn task_url(task: &Value) -> Option<String> {
    find_url(&field_text(task, "task")).map(str::to_string)
}

pub fn task_prompt(task: &Value, extra: Option<&str>, hint: &str) -> String {
    let description = field_text(task, "task");
    let data = field_text(task, "data");
    match extra.filter(|e| !e.is_empty()) {
        Some(extra) => format!(
            "ZADANIE: {description}\nPYTANIA: {data}\nDODATKOWE DANE Z URL:\n{}...\n\n\
             Na podstawie dodatkowych danych odpowiedz na pytania. Odpowiedz BARDZO KRÓTKO po polsku. {hint}",
            truncate_chars(extra, EXTRA_DATA_CHARS)
        ),
        None => format!(
            "ZADANIE: {description}\nDANE: {data}\n\n\
             Odpowiedz BARDZO KRÓTKO po polsku. Tylko wynik, bez wyjaśnień. {hint}"
        ),
    }
}

// ---------------------------------------------------------------------------
// Timed steps
// ---------------------------------------------------------------------------

async fn fetch_task(ctx: &TaskContext, url: &str, timeout: Duration) -> Value {
    let fetched = async {
        let response = ctx.http.make_request(Request::get(url).timeout(timeout)).await?;
        Ok::<Value, anyhow::Error>(response.json()?)
    };
    match fetched.await {
        Ok(task) => {
            debug!(%url, %task, "challenge fetched");
            task
        }
        Err(e) => {
            warn!(%url, "challenge fetch failed: {e:#}");
            json!({})
        }
    }
}

/// Cleaned text of every URL the tasks point at, fetched concurrently.
async fn fetch_extra_data(ctx: &TaskContext, tasks: &[&Value], timeout: Duration) -> HashMap<String, String> {
    let urls: BTreeSet<String> = tasks.iter().filter_map(|t| task_url(t)).collect();
    if urls.is_empty() {
        return HashMap::new();
    }
    let workers = ctx.config.timelock.max_workers.max(1);
    stream::iter(urls)
        .map(|url| async move {
            let fetched = ctx.http.make_request(Request::get(&url).timeout(timeout)).await;
            (url, fetched)
        })
        .buffer_unordered(workers)
        .filter_map(|(url, fetched)| async move {
            match fetched {
                Ok(response) => {
                    let raw = response.text();
                    let clean = clean_html_content(&raw);
                    info!(%url, raw = raw.len(), clean = clean.len(), "additional data cached");
                    Some((url, clean))
                }
                Err(e) => {
                    warn!(%url, "additional data fetch failed: {e}");
                    None
                }
            }
        })
        .collect()
        .await
}

async fn solve_task(ctx: &TaskContext, task: &Value, extra: &HashMap<String, String>) -> String {
    if task.as_object().map_or(true, |o| o.is_empty()) {
        return String::new();
    }
    let additional = task_url(task).and_then(|url| extra.get(&url).cloned());
    let prompt = task_prompt(task, additional.as_deref(), &ctx.config.timelock.hint);
    match ctx.ask(SYSTEM_PROMPT, &prompt, &ctx.config.openai.fast_model).await {
        Ok(answer) => {
            info!(%answer, "task solved");
            answer
        }
        Err(e) => {
            warn!("task failed: {e:#}");
            String::new()
        }
    }
}

async fn post_json(ctx: &TaskContext, url: &str, body: Value) -> Result<Value> {
    let response = ctx.http.make_request(Request::post(url).json(body)).await?;
    Ok(response.json()?)
}

pub async fn run(ctx: &TaskContext) -> Result<TaskOutcome> {
    let endpoint = ctx.endpoint("challenge_url")?;
    let settings = &ctx.config.timelock;
    let fetch_timeout = Duration::from_secs(settings.fetch_timeout_secs);

    let password = ctx.secret("challenge_password")?;
    let reply = post_json(ctx, &endpoint, json!({"password": password})).await?;
    let hash = parse_hash(&reply).with_context(|| format!("no hash in password reply: {reply}"))?;
    info!(%hash, "hash received");

    let mut budget = TimeBudget::from_secs_f64(settings.budget_secs);
    budget.start();

    let signed = post_json(ctx, &endpoint, json!({"sign": hash})).await?;
    let Some(challenge) = parse_challenge(&signed) else {
        return Ok(TaskOutcome::failed(TASK, format!("unexpected sign reply: {signed}")));
    };
    if !budget.check() {
        return Ok(TaskOutcome::failed(TASK, "time limit exceeded after signing"));
    }

    let (first, second) = join(
        fetch_task(ctx, &challenge.urls[0], fetch_timeout),
        fetch_task(ctx, &challenge.urls[1], fetch_timeout),
    )
    .await;
    if !budget.check() {
        return Ok(TaskOutcome::failed(TASK, "time limit exceeded after fetching challenges"));
    }

    let extra = fetch_extra_data(ctx, &[&first, &second], fetch_timeout).await;
    if !budget.check() {
        return Ok(TaskOutcome::failed(TASK, "time limit exceeded after fetching additional data"));
    }

    let (a0, a1) = join(solve_task(ctx, &first, &extra), solve_task(ctx, &second, &extra)).await;
    let combined = format!("{a0}. {a1}");
    info!(%combined, "combined answer");
    if !budget.check() {
        return Ok(TaskOutcome::failed(TASK, "time limit exceeded after answering"));
    }
    if a0.is_empty() && a1.is_empty() {
        return Ok(TaskOutcome::failed(TASK, "no answer generated"));
    }

    let body = json!({
        "apikey": ctx.centrala.api_key(),
        "timestamp": challenge.timestamp,
        "signature": challenge.signature,
        "answer": combined,
    });
    let response = ctx.http.send_unchecked(Request::post(&endpoint).json(body)).await?;
    let elapsed = budget.elapsed();
    info!(status = %response.status, elapsed_secs = elapsed.as_secs_f64(), "answer submitted");

    let mut outcome = TaskOutcome::from_text(TASK, json!(combined), &response.text());
    outcome.success = budget.finished_in_time();
    if !outcome.success {
        warn!(elapsed_secs = elapsed.as_secs_f64(), "exceeded time limit");
    }
    Ok(outcome)
}
