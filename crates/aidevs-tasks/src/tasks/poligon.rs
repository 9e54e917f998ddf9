// Warm-up: echo the data lines back to the verification endpoint.

use anyhow::Result;
use serde_json::{json, Value};
use tracing::info;

use crate::context::TaskContext;
use crate::outcome::TaskOutcome;

pub const TASK: &str = "POLIGON";

/// Trimmed, non-empty lines of `raw`.
pub fn data_lines(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

pub async fn run(ctx: &TaskContext) -> Result<TaskOutcome> {
    let data_url = ctx.endpoint("poligon_data_url")?;
    let verify_url = ctx.endpoint("poligon_verify_url")?;

    let raw = ctx.http.get_text(&data_url).await?;
    let lines = data_lines(&raw);
    info!(count = lines.len(), "poligon data fetched");

    let answer = Value::from(lines);
    let envelope = ctx.centrala.envelope(TASK, &answer);
    let report = ctx.centrala.report_envelope(&verify_url, envelope).await?;
    Ok(TaskOutcome::from_report(TASK, answer, &report))
}
