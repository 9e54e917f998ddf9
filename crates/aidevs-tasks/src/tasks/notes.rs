// Rafał's notebook: answer questions from the PDF text, resubmitting with
// the grader's hints until every answer is accepted.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use lopdf::Document;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::context::TaskContext;
use crate::outcome::TaskOutcome;

pub const TASK: &str = "notes";
pub const TEXT_PAGES: u32 = 18;
pub const MAX_ROUNDS: usize = 10;
const MAX_RETRIES: usize = 3;

static QUESTION_IN_MESSAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"question (\d{2})").expect("static question pattern"));
static HINT_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:question\s+|pytanie\s+)?(\d{2}):\s*").expect("static hint marker pattern")
});

/// Text of pages `1..=last_page`, each under a page header. Pages without a
/// text layer are skipped.
pub fn pdf_pages_text(pdf: &[u8], last_page: u32) -> Result<String> {
    let document = Document::load_mem(pdf).context("failed to parse notebook PDF")?;
    let mut sections = Vec::new();
    for page_number in document.get_pages().keys().copied().filter(|n| *n <= last_page) {
        match document.extract_text(&[page_number]) {
            Ok(text) if !text.trim().is_empty() => {
                sections.push(format!("=== STRONA {page_number} ===\n{text}\n"));
            }
            Ok(_) => debug!(page = page_number, "page has no text layer"),
            Err(e) => warn!(page = page_number, "text extraction failed: {e}"),
        }
    }
    Ok(sections.join("\n"))
}

/// The hand-transcribed last page, or a marker saying it is missing.
pub fn handwritten_page(path: Option<&Path>) -> String {
    let page = TEXT_PAGES + 1;
    let Some(path) = path else {
        return format!("=== STRONA {page} (BRAK PLIKU) ===\nBrak ręcznie przepisanej strony.\n");
    };
    match std::fs::read_to_string(path) {
        Ok(text) => format!("=== STRONA {page} (RĘCZNY TEKST) ===\n{}\n", text.trim()),
        Err(e) => {
            warn!(path = %path.display(), "cannot read handwritten page: {e}");
            format!("=== STRONA {page} (BŁĄD) ===\nBłąd wczytywania: {e}\n")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub answer: String,
    pub hint: Option<String>,
}

/// Hints per question id from a rejection. A `{message, hint}` reply names
/// one question in its message; otherwise the message is searched for
/// `NN: hint` fragments.
pub fn parse_feedback(reply: &Value) -> BTreeMap<String, String> {
    let mut hints = BTreeMap::new();
    let message = reply.get("message").and_then(Value::as_str).unwrap_or_default();
    if let Some(hint) = reply.get("hint").and_then(Value::as_str) {
        let id = QUESTION_IN_MESSAGE
            .captures(message)
            .map_or_else(|| "01".to_string(), |c| c[1].to_string());
        hints.insert(id, hint.to_string());
        return hints;
    }
    let markers: Vec<(usize, usize, String)> = HINT_MARKER
        .captures_iter(message)
        .filter_map(|c| {
            let whole = c.get(0)?;
            Some((whole.start(), whole.end(), c[1].to_string()))
        })
        .collect();
    for (i, (_, end, id)) in markers.iter().enumerate() {
        let stop = markers.get(i + 1).map_or(message.len(), |next| next.0);
        let hint = message[*end..stop].trim();
        if !hint.is_empty() {
            hints.insert(id.clone(), hint.to_string());
        }
    }
    hints
}

fn answer_prompt(notebook: &str, question: &str, extra: Option<&str>, attempts: &[Attempt]) -> String {
    let mut prompt = format!(
        "Jesteś ekspertem w analizie notatek i dokumentów. Twoim zadaniem jest udzielenie precyzyjnej, \
         zwięzłej odpowiedzi na pytanie na podstawie notatnika Rafała.\n\n\
         KONTEKST NOTATNIKA:\n{notebook}\n\n"
    );
    if let Some(extra) = extra {
        prompt.push_str(&format!("SPECJALNE INSTRUKCJE DLA TEGO PYTANIA:\n{extra}\n\n"));
    }
    if !attempts.is_empty() {
        prompt.push_str("POPRZEDNIE PRÓBY I PODPOWIEDZI:\n");
        for (i, attempt) in attempts.iter().enumerate() {
            prompt.push_str(&format!("Próba {}: Odpowiedź '{}' była błędna.\n", i + 1, attempt.answer));
            if let Some(hint) = &attempt.hint {
                prompt.push_str(&format!("Podpowiedź: {hint}\n"));
            }
        }
        let rejected: Vec<&str> = attempts.iter().map(|a| a.answer.as_str()).collect();
        prompt.push_str(&format!(
            "\nZABRONIONE ODPOWIEDZI: {rejected:?}\n\
             MUSISZ podać INNĄ odpowiedź niż te wyżej! Przeanalizuj podpowiedzi i znajdź NOWĄ odpowiedź.\n\n"
        ));
    }
    prompt.push_str(&format!(
        "INSTRUKCJE:\n\
         1. Przeanalizuj CAŁY kontekst notatnika bardzo dokładnie\n\
         2. Zwróć uwagę na wszystkie szczegóły, daty, nazwy miejscowości, osoby\n\
         3. Odpowiadaj MAKSYMALNIE ZWIĘŹLE - 1-3 słowa, liczby, daty\n\
         4. Jeśli pytanie dotyczy daty, odpowiedz w formacie YYYY-MM-DD\n\
         5. Tekst z OCR może zawierać błędy - połącz fragmenty logicznie\n\
         6. Udziel odpowiedzi na podstawie FAKTÓW z notatnika, nie spekuluj\n\
         7. ODPOWIADAJ TYLKO KONKRETNĄ INFORMACJĄ, bez dodatkowych wyjaśnień\n\n\
         Pytanie: {question}"
    ));
    prompt
}

fn clean_answer(reply: &str) -> String {
    reply.trim().trim_matches(|c: char| c == '"' || c == '\'').trim().to_string()
}

async fn answer_question(
    ctx: &TaskContext,
    notebook: &str,
    id: &str,
    question: &str,
    attempts: &[Attempt],
) -> Result<String> {
    let extra = ctx.config.notes.question_hints.get(id).map(String::as_str);
    let mut tried = attempts.to_vec();
    let mut answer = String::new();
    for _ in 0..MAX_RETRIES {
        let system = answer_prompt(notebook, question, extra, &tried);
        let user = format!("Na podstawie notatnika Rafała odpowiedz na pytanie: {question}");
        answer = clean_answer(&ctx.ask(&system, &user, &ctx.config.openai.chat_model).await?);
        if !tried.iter().any(|a| a.answer == answer) {
            return Ok(answer);
        }
        warn!(%id, %answer, "model repeated a rejected answer");
        tried.push(Attempt {
            answer: answer.clone(),
            hint: Some("Ta odpowiedź była już odrzucona".to_string()),
        });
    }
    Ok(answer)
}

/// Answer every question, then keep re-answering the rejected ones with the
/// grader's hints for at most [`MAX_ROUNDS`] submissions.
pub async fn solve(
    ctx: &TaskContext,
    notebook: &str,
    questions: &BTreeMap<String, String>,
) -> Result<TaskOutcome> {
    let mut answers: BTreeMap<String, String> = BTreeMap::new();
    let mut attempts: HashMap<String, Vec<Attempt>> = HashMap::new();
    let mut settled: HashSet<String> = HashSet::new();
    let mut last = None;

    for round in 1..=MAX_ROUNDS {
        let pending: Vec<&String> = questions.keys().filter(|id| !settled.contains(*id)).collect();
        info!(round, pending = pending.len(), "answering");
        for id in &pending {
            let history = attempts.get(id.as_str()).map(Vec::as_slice).unwrap_or_default();
            let answer = answer_question(ctx, notebook, id, &questions[id.as_str()], history).await?;
            info!(%id, %answer, "answer");
            answers.insert(id.to_string(), answer);
        }

        let report = ctx.centrala.report(TASK, &answers).await?;
        if report.accepted() {
            info!(round, "all answers accepted");
            return Ok(TaskOutcome::from_report(TASK, json!(answers), &report));
        }

        let hints = report.json.as_ref().map(parse_feedback).unwrap_or_default();
        info!(round, ?hints, "answers rejected");
        if let Some(wrong) = hints.keys().next() {
            settled.extend(answers.keys().filter(|id| *id != wrong).cloned());
        }
        for id in pending {
            let Some(answer) = answers.get(id.as_str()) else {
                continue;
            };
            let log = attempts.entry(id.to_string()).or_default();
            if log.last().map(|a| &a.answer) != Some(answer) {
                log.push(Attempt {
                    answer: answer.clone(),
                    hint: hints.get(id.as_str()).cloned(),
                });
            }
        }
        last = Some(report);
    }

    warn!(rounds = MAX_ROUNDS, "giving up without acceptance");
    match last {
        Some(report) => Ok(TaskOutcome::from_report(TASK, json!(answers), &report)),
        None => bail!("no answers submitted"),
    }
}

pub async fn run(ctx: &TaskContext, handwritten: Option<&Path>) -> Result<TaskOutcome> {
    let pdf = ctx.http.get_bytes(&ctx.endpoint("notebook_pdf_url")?).await?;
    let questions: BTreeMap<String, String> = ctx.http.get_json(&ctx.endpoint("questions_json_url")?).await?;
    if questions.is_empty() {
        bail!("no questions to answer");
    }

    let mut notebook = pdf_pages_text(&pdf, TEXT_PAGES)?;
    notebook.push('\n');
    notebook.push_str(&handwritten_page(handwritten));
    info!(chars = notebook.chars().count(), questions = questions.len(), "notebook ready");

    solve(ctx, &notebook, &questions).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{last_user_text, spawn_server, test_context, ScriptedModel};
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    #[test]
    fn single_question_feedback() {
        let reply = json!({"code": -340, "message": "Answer for question 04 is incorrect", "hint": "jutro"});
        assert_eq!(parse_feedback(&reply), BTreeMap::from([("04".to_string(), "jutro".to_string())]));
        let unnamed = json!({"message": "wrong", "hint": "rok"});
        assert_eq!(parse_feedback(&unnamed)["01"], "rok");
    }

    #[test]
    fn numbered_feedback() {
        let reply = json!({"message": "01: za wcześnie 03: pomyśl o jaskini"});
        let hints = parse_feedback(&reply);
        assert_eq!(hints["01"], "za wcześnie");
        assert_eq!(hints["03"], "pomyśl o jaskini");
        assert!(parse_feedback(&json!({"code": 0})).is_empty());
    }

    #[test]
    fn prompt_lists_rejected_answers() {
        let attempts = vec![Attempt { answer: "2024-11-11".into(), hint: Some("jutro".into()) }];
        let prompt = answer_prompt("notatnik", "Kiedy?", Some("dodaj dzień"), &attempts);
        assert!(prompt.contains("SPECJALNE INSTRUKCJE DLA TEGO PYTANIA:\ndodaj dzień"));
        assert!(prompt.contains("Próba 1: Odpowiedź '2024-11-11' była błędna.\nPodpowiedź: jutro"));
        assert!(prompt.ends_with("Pytanie: Kiedy?"));
    }

    #[test]
    fn missing_handwritten_page_is_marked() {
        assert!(handwritten_page(None).starts_with("=== STRONA 19 (BRAK PLIKU) ==="));
        assert!(pdf_pages_text(b"not a pdf", TEXT_PAGES).is_err());
    }

    type Submissions = Arc<Mutex<Vec<Value>>>;

    async fn grade(State(subs): State<Submissions>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
        subs.lock().unwrap().push(body["answer"].clone());
        if body["answer"]["04"] == "2024-11-12" {
            (StatusCode::OK, Json(json!({"code": 0, "message": "{{FLG:NOTATKI}}"})))
        } else {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"code": -340, "message": "Answer for question 04 is incorrect", "hint": "to już jutro"})),
            )
        }
    }

    #[tokio::test]
    async fn resubmits_with_hints_until_accepted() {
        let subs = Submissions::default();
        let app = Router::new().route("/report", post(grade)).with_state(subs.clone());
        let base = spawn_server(app).await;

        let model = Arc::new(ScriptedModel::with(|request| {
            let system = request.messages[0].text();
            if last_user_text(request).ends_with("Rok?") {
                "2019".to_string()
            } else if system.contains("Podpowiedź: to już jutro") {
                "2024-11-12".to_string()
            } else {
                "\"2024-11-11\"".to_string()
            }
        }));
        let ctx = test_context(&base, &[], model.clone());
        let questions = BTreeMap::from([
            ("01".to_string(), "Rok?".to_string()),
            ("04".to_string(), "Data spotkania?".to_string()),
        ]);

        let outcome = solve(&ctx, "=== STRONA 1 ===\ntekst", &questions).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.flag.as_deref(), Some("FLG:NOTATKI"));

        let subs = subs.lock().unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0], json!({"01": "2019", "04": "2024-11-11"}));
        assert_eq!(subs[1], json!({"01": "2019", "04": "2024-11-12"}));
        // 01 was settled after the first round and not asked again.
        assert_eq!(
            model.requests().iter().filter(|r| last_user_text(r).ends_with("Rok?")).count(),
            1
        );
    }
}
