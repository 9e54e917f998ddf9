// Lab results: a fine-tuned classifier separates valid measurements from
// forged ones.

use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tracing::{info, warn};

use aidevs_llm::{ChatMessage, ChatRequest};

use crate::context::TaskContext;
use crate::outcome::TaskOutcome;

pub const TASK: &str = "research";
pub const SYSTEM_PROMPT: &str = "validate data";

/// Non-empty trimmed lines of `dir/name`.
fn read_lines(dir: &Path, name: &str) -> Result<Vec<String>> {
    let path = dir.join(name);
    let text = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Two-character id at the start of a record line.
pub fn record_id(line: &str) -> Option<String> {
    let head = line.split(',').next()?;
    let id: String = head.chars().take(2).collect();
    (id.chars().count() == 2).then_some(id)
}

/// The classifier answers `1` (or an equivalent word) for valid records.
pub fn is_valid_verdict(reply: &str) -> bool {
    matches!(reply.trim().to_lowercase().as_str(), "1" | "true" | "valid" | "correct")
}

fn training_example(line: &str, label: &str) -> serde_json::Value {
    json!({
        "messages": [
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(line),
            ChatMessage::assistant(label),
        ]
    })
}

/// Write the fine-tuning set built from `correct.txt` (label `1`) and
/// `incorrect.txt` (label `0`) as JSONL. Returns the number of examples.
pub fn prepare_training(dir: &Path, output: &Path) -> Result<usize> {
    let correct = read_lines(dir, "correct.txt")?;
    let incorrect = read_lines(dir, "incorrect.txt")?;

    let file = std::fs::File::create(output).with_context(|| format!("failed to create {}", output.display()))?;
    let mut writer = std::io::BufWriter::new(file);
    let examples = correct
        .iter()
        .map(|l| training_example(l, "1"))
        .chain(incorrect.iter().map(|l| training_example(l, "0")));
    let mut count = 0;
    for example in examples {
        serde_json::to_writer(&mut writer, &example)?;
        writer.write_all(b"\n")?;
        count += 1;
    }
    writer.flush()?;
    info!(count, output = %output.display(), "training data written");
    Ok(count)
}

pub async fn run(ctx: &TaskContext, dir: &Path) -> Result<TaskOutcome> {
    let Some(model) = ctx.config.openai.research_model.as_deref() else {
        bail!("no fine-tuned model configured (openai.research_model or RESEARCH_MODEL)");
    };
    let lines = read_lines(dir, "verify.txt")?;
    if lines.is_empty() {
        bail!("verify.txt is empty");
    }

    let mut valid = Vec::new();
    for line in &lines {
        let Some(id) = record_id(line) else {
            warn!(%line, "record without an id");
            continue;
        };
        let request = ChatRequest::new(model)
            .system(SYSTEM_PROMPT)
            .user(line.as_str())
            .max_tokens(10)
            .temperature(0.0);
        match ctx.llm.complete(request).await {
            Ok(reply) if is_valid_verdict(&reply) => {
                info!(%id, "valid");
                valid.push(id);
            }
            Ok(reply) => info!(%id, reply = reply.trim(), "invalid"),
            Err(e) => warn!(%id, "classification failed: {e}"),
        }
    }
    if valid.is_empty() {
        bail!("no valid records found");
    }

    let answer = json!(valid);
    let report = ctx.centrala.report(TASK, &answer).await?;
    Ok(TaskOutcome::from_report(TASK, answer, &report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{centrala, last_user_text, spawn_server, test_context, ScriptedModel};
    use std::sync::Arc;

    #[test]
    fn ids_and_verdicts() {
        assert_eq!(record_id("01=12,100,3,39").as_deref(), Some("01"));
        assert_eq!(record_id("7"), None);
        assert!(is_valid_verdict(" 1\n"));
        assert!(is_valid_verdict("Valid"));
        assert!(!is_valid_verdict("0"));
    }

    #[test]
    fn training_set_is_labelled_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("correct.txt"), "1,2,3\n\n4,5,6\n").unwrap();
        std::fs::write(dir.path().join("incorrect.txt"), "9,9,9\n").unwrap();
        let output = dir.path().join("training_data.jsonl");

        assert_eq!(prepare_training(dir.path(), &output).unwrap(), 3);
        let written = std::fs::read_to_string(&output).unwrap();
        let lines: Vec<serde_json::Value> = written
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(
            lines[0],
            json!({"messages": [
                {"role": "system", "content": "validate data"},
                {"role": "user", "content": "1,2,3"},
                {"role": "assistant", "content": "1"},
            ]})
        );
        assert_eq!(lines[2]["messages"][2]["content"], "0");
    }

    #[tokio::test]
    async fn submits_valid_ids() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("verify.txt"), "01=1,2\n02=3,4\n03=5,6\n").unwrap();
        let (app, reports) = centrala::router();
        let base = spawn_server(app).await;
        let model = Arc::new(ScriptedModel::with(|request| {
            let verdict = if last_user_text(request).starts_with("02") { "0" } else { "1" };
            verdict.to_string()
        }));
        let ctx = test_context(&base, &[("RESEARCH_MODEL", "ft:test")], model.clone());

        run(&ctx, dir.path()).await.unwrap();
        assert_eq!(reports.lock().unwrap()[0]["answer"], json!(["01", "03"]));
        assert_eq!(model.requests()[0].model, "ft:test");
    }

    #[tokio::test]
    async fn missing_model_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(
            "http://127.0.0.1:9",
            &[],
            Arc::new(ScriptedModel::replies(Vec::<String>::new())),
        );
        assert!(run(&ctx, dir.path()).await.is_err());
    }
}
