// Calibration file repair: recompute arithmetic answers and fill open
// test questions.

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{info, warn};

use aidevs_core::calc::{evaluate, looks_like_arithmetic, to_json_number};
use aidevs_llm::ask_llm;

use crate::context::TaskContext;
use crate::outcome::TaskOutcome;

pub const TASK: &str = "JSON";

const BATCH_SIZE: usize = 10;
const MISSING_ANSWER: &str = "Answer not available";

static NUMBERED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*\d+\.\s*").expect("static numbering pattern"));

/// Correct every arithmetic `answer`; returns the number of fixes.
pub fn fix_calculations(items: &mut [Value]) -> usize {
    let mut fixed = 0;
    for item in items.iter_mut() {
        let Some(question) = item.get("question").and_then(Value::as_str) else {
            continue;
        };
        if !looks_like_arithmetic(question) {
            continue;
        }
        let correct = match evaluate(question) {
            Ok(v) => v,
            Err(e) => {
                warn!(%question, "could not evaluate: {e}");
                continue;
            }
        };
        let current = item.get("answer").and_then(Value::as_f64);
        if current != Some(correct) {
            info!(%question, ?current, correct, "fixing calculation");
            item["answer"] = to_json_number(correct);
            fixed += 1;
        }
    }
    fixed
}

/// Indices and texts of test questions whose answer is missing or `???`.
pub fn open_questions(items: &[Value]) -> Vec<(usize, String)> {
    items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| {
            let test = item.get("test")?;
            let q = test.get("q")?.as_str()?;
            match test.get("a") {
                None | Some(Value::Null) => Some((i, q.to_string())),
                Some(Value::String(a)) if a == "???" => Some((i, q.to_string())),
                _ => None,
            }
        })
        .collect()
}

/// Split a numbered LLM reply into exactly `expected` answers.
pub fn parse_answers(text: &str, expected: usize, questions: &[String]) -> Vec<String> {
    // "1. a\n2. b" style
    let starts: Vec<(usize, usize)> = NUMBERED.find_iter(text).map(|m| (m.start(), m.end())).collect();
    if !starts.is_empty() && starts.len() == expected {
        return starts
            .iter()
            .enumerate()
            .map(|(i, &(_, end))| {
                let stop = starts.get(i + 1).map(|&(s, _)| s).unwrap_or(text.len());
                text[end..stop].trim().to_string()
            })
            .collect();
    }

    // One answer per line, skipping echoed questions.
    let lowered: Vec<String> = questions.iter().map(|q| q.to_lowercase()).collect();
    let answers: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| NUMBERED.replace(l, "").trim().to_string())
        .filter(|l| {
            let l = l.to_lowercase();
            !lowered.iter().any(|q| l.contains(q.as_str()))
        })
        .collect();
    if answers.len() == expected {
        return answers;
    }

    // Paragraphs, padded.
    let mut answers: Vec<String> = text
        .split("\n\n")
        .take(expected)
        .map(|a| a.trim().to_string())
        .collect();
    answers.resize(expected, MISSING_ANSWER.to_string());
    answers
}

fn batch_prompt(questions: &[String]) -> String {
    let mut prompt = String::from("Please answer the following questions concisely and factually:\n\n");
    for (i, q) in questions.iter().enumerate() {
        prompt.push_str(&format!("{}. {q}\n", i + 1));
    }
    prompt
}

pub async fn run(ctx: &TaskContext) -> Result<TaskOutcome> {
    let source_url = ctx.endpoint("centrala_source_url")?;
    let mut data: Value = ctx.http.get_json(&source_url).await?;

    let Some(items) = data.get_mut("test-data").and_then(Value::as_array_mut) else {
        bail!("no test-data in calibration file");
    };
    if items.is_empty() {
        bail!("no test-data in calibration file");
    }

    let fixed = fix_calculations(items);
    info!(fixed, "calculations fixed");

    let open = open_questions(items);
    info!(count = open.len(), "open questions");
    for batch in open.chunks(BATCH_SIZE) {
        let questions: Vec<String> = batch.iter().map(|(_, q)| q.clone()).collect();
        let reply = ask_llm(ctx.llm.as_ref(), &batch_prompt(&questions), &ctx.config.openai.default_model).await?;
        let answers = parse_answers(&reply, questions.len(), &questions);
        for ((index, question), answer) in batch.iter().zip(answers) {
            info!(%question, %answer, "answered");
            items[*index]["test"]["a"] = json!(answer);
        }
    }

    data["apikey"] = json!(ctx.centrala.api_key());
    let report = ctx.centrala.report(TASK, &data).await?;
    Ok(TaskOutcome::from_report(TASK, data, &report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{centrala, spawn_server, test_context, ScriptedModel};
    use axum::routing::get;
    use axum::Json;
    use std::sync::Arc;

    #[test]
    fn fixes_only_wrong_sums() {
        let mut items = vec![
            json!({"question": "45 + 86", "answer": 131}),
            json!({"question": "1 + 1", "answer": 3}),
            json!({"question": "Stolica Polski?", "answer": "Warszawa"}),
        ];
        assert_eq!(fix_calculations(&mut items), 1);
        assert_eq!(items[1]["answer"], json!(2));
        assert_eq!(items[0]["answer"], json!(131));
    }

    #[test]
    fn finds_unanswered_tests() {
        let items = vec![
            json!({"question": "1 + 1", "answer": 2, "test": {"q": "capital of Poland?", "a": "???"}}),
            json!({"question": "1 + 2", "answer": 3, "test": {"q": "done", "a": "yes"}}),
            json!({"question": "1 + 3", "answer": 4}),
            json!({"question": "1 + 4", "answer": 5, "test": {"q": "2+2 in words?"}}),
        ];
        assert_eq!(
            open_questions(&items),
            vec![(0, "capital of Poland?".to_string()), (3, "2+2 in words?".to_string())]
        );
    }

    #[test]
    fn parses_numbered_answers() {
        let qs = vec!["a?".to_string(), "b?".to_string()];
        assert_eq!(parse_answers("1. Warsaw\n2. four", 2, &qs), vec!["Warsaw", "four"]);
    }

    #[test]
    fn falls_back_to_lines_then_padding() {
        let qs = vec!["What is x?".to_string(), "What is y?".to_string()];
        assert_eq!(parse_answers("What is x?\nten\neleven", 2, &qs), vec!["ten", "eleven"]);
        assert_eq!(
            parse_answers("tylko jedna", 2, &qs),
            vec!["tylko jedna", MISSING_ANSWER]
        );
    }

    #[tokio::test]
    async fn repairs_file_and_submits() {
        let file = json!({
            "apikey": "%PUT-YOUR-API-KEY-HERE%",
            "description": "calibration",
            "test-data": [
                {"question": "2 + 2", "answer": 5},
                {"question": "3 + 3", "answer": 6, "test": {"q": "Capital of Poland?", "a": "???"}}
            ]
        });
        let (report, reports) = centrala::router();
        let app = report.route("/json.txt", get(move || async move { Json(file) }));
        let base = spawn_server(app).await;
        let url = format!("{base}/json.txt");
        let ctx = test_context(
            &base,
            &[("CENTRALA_SOURCE_URL", url.as_str())],
            Arc::new(ScriptedModel::replies(["1. Warsaw"])),
        );

        let outcome = run(&ctx).await.unwrap();
        assert!(outcome.success);
        let sent = reports.lock().unwrap()[0].clone();
        assert_eq!(sent["task"], "JSON");
        assert_eq!(sent["answer"]["apikey"], "test-key");
        assert_eq!(sent["answer"]["test-data"][0]["answer"], json!(4));
        assert_eq!(sent["answer"]["test-data"][1]["test"]["a"], "Warsaw");
    }
}
