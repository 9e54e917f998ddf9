// Phone transcripts: find the liar, answer the questions from reliable
// speakers and fetch one answer from the API the conversations mention.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Method;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use aidevs_core::http::{HttpClient, Request};
use aidevs_core::media::{file_name, list_files};

use crate::context::TaskContext;
use crate::outcome::TaskOutcome;

pub const TASK: &str = "phone";
const MAX_ATTEMPTS: usize = 3;
const NO_DATA: &str = "BRAK DANYCH";

static TOKEN_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r#""token":\s*"([^"]+)""#,
        r#""code":\s*"([^"]+)""#,
        r#""key":\s*"([^"]+)""#,
        r"token:\s*([^\s,}]+)",
        r"FLG:\{([^}]+)\}",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static token pattern"))
    .collect()
});

// ---------------------------------------------------------------------------
// Request tool
// ---------------------------------------------------------------------------

/// An HTTP call described by the conversations, with a note on what it is
/// for and what to look for in the reply.
#[derive(Debug, Clone, Serialize)]
pub struct ApiCall {
    pub url: String,
    pub method: String,
    pub payload: Option<Value>,
    pub context: Option<String>,
    pub hints: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiCallResult {
    pub request: ApiCall,
    pub status: u16,
    pub text: String,
    pub json: Option<Value>,
    pub success: bool,
    pub notes: Vec<String>,
}

impl ApiCall {
    pub fn post(url: impl Into<String>, payload: Value) -> Self {
        Self {
            url: url.into(),
            method: "POST".to_string(),
            payload: Some(payload),
            context: None,
            hints: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>, hints: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self.hints = Some(hints.into());
        self
    }

    pub async fn execute(self, http: &HttpClient) -> Result<ApiCallResult> {
        let method = Method::from_bytes(self.method.to_uppercase().as_bytes())
            .with_context(|| format!("invalid HTTP method {}", self.method))?;
        let mut request = Request::new(method.clone(), &self.url);
        if method == Method::POST || method == Method::PUT {
            request = request.json(self.payload.clone().unwrap_or_else(|| json!({})));
        }
        info!(url = %self.url, %method, context = ?self.context, "calling API");
        let response = http.send_unchecked(request).await?;
        let text = response.text();
        let json = serde_json::from_str(&text).ok();
        let notes = self.hints.as_deref().map(|h| hint_notes(h, &text)).unwrap_or_default();
        Ok(ApiCallResult {
            status: response.status.as_u16(),
            success: response.status.is_success(),
            text,
            json,
            notes,
            request: self,
        })
    }
}

fn hint_notes(hints: &str, text: &str) -> Vec<String> {
    let hints = hints.to_lowercase();
    let lower = text.to_lowercase();
    let mut notes = Vec::new();
    if hints.contains("password") || hints.contains("hasło") {
        if lower.contains("success") {
            notes.push("response indicates successful password authentication".to_string());
        } else if lower.contains("error") {
            notes.push("response indicates password error".to_string());
        }
    }
    if hints.contains("flag") && text.contains("FLG:") {
        notes.push("response contains flag pattern".to_string());
    }
    notes
}

/// The token in an API reply: a known field or pattern first, then the
/// first non-empty string value of a JSON object, then the whole text.
pub fn extract_token(text: &str) -> String {
    for pattern in TOKEN_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(text) {
            return caps[1].to_string();
        }
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => map
            .values()
            .filter_map(Value::as_str)
            .find(|s| !s.is_empty())
            .map_or_else(|| text.trim().to_string(), str::to_string),
        Ok(other) => other.to_string(),
        Err(_) => text.trim().to_string(),
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Readable transcript of the sorted conversations.
pub fn format_conversations(sorted: &Value) -> String {
    let Some(conversations) = sorted.as_object() else {
        return String::new();
    };
    let mut out = Vec::new();
    for (key, entries) in conversations {
        let Some(entries) = entries.as_array().filter(|e| !e.is_empty()) else {
            continue;
        };
        let mut speakers = BTreeSet::new();
        let mut lines = Vec::new();
        for entry in entries {
            match entry {
                Value::String(line) => lines.push(line.clone()),
                Value::Object(obj) => {
                    let speaker = obj.get("speaker").and_then(Value::as_str).unwrap_or("Unknown");
                    let text = obj
                        .get("text")
                        .and_then(Value::as_str)
                        .map_or_else(|| entry.to_string(), str::to_string);
                    speakers.insert(speaker.to_string());
                    lines.push(format!("{speaker}: {text}"));
                }
                _ => {}
            }
        }
        let mut header = format!("=== {} ===", key.to_uppercase());
        if !speakers.is_empty() {
            let names: Vec<&str> = speakers.iter().map(String::as_str).collect();
            header.push_str(&format!(" (Uczestnicy: {})", names.join(", ")));
        }
        out.push(header);
        out.extend(lines);
        out.push(String::new());
    }
    out.join("\n")
}

/// Every non-empty `.txt` fact file under `dir`, each under its file name.
pub fn load_facts(dir: Option<&Path>) -> Result<String> {
    let Some(dir) = dir else {
        return Ok(String::new());
    };
    let mut facts = Vec::new();
    for path in list_files(dir, &["txt"], &[])? {
        let content = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let content = content.trim();
        if !content.is_empty() {
            facts.push(format!("=== {} ===\n{content}", file_name(&path)));
        }
    }
    info!(files = facts.len(), "facts loaded");
    Ok(facts.join("\n\n"))
}

// ---------------------------------------------------------------------------
// Answering
// ---------------------------------------------------------------------------

struct Evidence<'a> {
    conversations: &'a str,
    facts: &'a str,
    liar: &'a str,
    notes: &'a [String],
}

fn liar_prompt(conversations: &str, facts: &str) -> String {
    format!(
        "Przeanalizuj rozmowy i zidentyfikuj, która osoba podaje nieprawdziwe informacje.\n\n\
         ROZMOWY:\n{conversations}\n\n\
         FAKTY Z POPRZEDNICH ZADAŃ:\n{facts}\n\n\
         ZADANIE:\n\
         1. Sprawdź fakty podane przez każdą osobę\n\
         2. Porównaj z wiedzą powszechną i faktami z poprzednich zadań\n\
         3. Znajdź sprzeczności i błędne informacje\n\
         4. Zidentyfikuj osobę, która konsekwentnie kłamie\n\n\
         Odpowiedz TYLKO imieniem osoby, która kłamie (np. \"Anna\").\n\
         PAMIETAJ ABY ODPOWIADAĆ KRÓTKO I ZWIĘŹLE"
    )
}

fn answer_prompt(attempt: usize, question: &str, evidence: &Evidence<'_>, raw: Option<&Value>) -> String {
    let Evidence { conversations, facts, liar, notes } = evidence;
    match attempt {
        0 => {
            let raw = raw
                .and_then(|v| serde_json::to_string_pretty(v).ok())
                .unwrap_or_default();
            let mut extra = String::new();
            for (i, note) in notes.iter().enumerate() {
                extra.push_str(&format!("{}. {note}\n", i + 6));
            }
            format!(
                "Odpowiedz na pytanie na podstawie rozmów i faktów. IGNORUJ informacje od kłamcy.\n\n\
                 PYTANIE: {question}\n\n\
                 ROZMOWY (posortowane):\n{conversations}\n\
                 ORYGINALNE DANE (nieposortowane):\n{raw}\n\
                 FAKTY Z POPRZEDNICH ZADAŃ:\n{facts}\n\n\
                 KŁAMCA: {liar} (ignoruj wszystkie informacje od tej osoby)\n\n\
                 INSTRUKCJE:\n\
                 1. Używaj tylko wiarygodnych informacji (nie od kłamcy)\n\
                 2. Odpowiadaj krótko i jednoznacznie\n\
                 3. WSZYSTKIE potrzebne dane SĄ dostępne - połącz kropki!\n\
                 4. NIE pisz \"{NO_DATA}\" - dane są w rozmowach lub faktach\n\
                 5. Nie odpowiadaj pełnym zdaniem, tylko krótką odpowiedzią. Zamiast \"XYZ określany jest przezwiskiem ABC\" odpowiedz \"ABC\"\n\
                 {extra}\n\
                 Odpowiedź:"
            )
        }
        1 => format!(
            "MUSISZ odpowiedzieć na to pytanie! Wszystkie dane są dostępne - przeanalizuj dokładniej.\n\n\
             PYTANIE: {question}\n\n\
             ROZMOWY:\n{conversations}\n\n\
             FAKTY Z POPRZEDNICH ZADAŃ:\n{facts}\n\n\
             KŁAMCA: {liar} (CAŁKOWICIE IGNORUJ jego wypowiedzi)\n\n\
             INSTRUKCJE:\n\
             1. Przeczytaj WSZYSTKIE rozmowy i fakty bardzo dokładnie\n\
             2. Szukaj pośrednich wskazówek i połączeń między informacjami\n\
             3. Odpowiedź MUSI być w danych - znajdź ją!\n\
             4. Odpowiadaj krótko i konkretnie\n\
             5. ZAKAZ używania \"{NO_DATA}\"\n\n\
             Odpowiedź:"
        ),
        _ => format!(
            "OSTATNIA SZANSA! Odpowiedź jest w danych - musisz ją znaleźć!\n\n\
             PYTANIE: {question}\n\n\
             ROZMOWY (przeczytaj każde słowo):\n{conversations}\n\n\
             FAKTY (przeanalizuj wszystkie):\n{facts}\n\n\
             KŁAMCA DO IGNOROWANIA: {liar}\n\n\
             ZADANIE:\n\
             - Pytanie ma odpowiedź w dostarczonych danych\n\
             - Może być ukryta w szczegółach lub wymaga połączenia informacji\n\
             - Analizuj rozmowy słowo po słowo\n\
             - ODPOWIEDŹ MUSI BYĆ ZWIĘZŁA I KONKRETNA\n\n\
             OSTATECZNA ODPOWIEDŹ:"
        ),
    }
}

/// Longer than two characters and not a refusal.
pub fn is_meaningful(answer: &str) -> bool {
    !answer.eq_ignore_ascii_case(NO_DATA) && answer.chars().count() > 2
}

async fn answer_question(
    ctx: &TaskContext,
    question: &str,
    evidence: &Evidence<'_>,
    raw: Option<&Value>,
) -> Result<String> {
    let mut answer = String::new();
    for attempt in 0..MAX_ATTEMPTS {
        let system = format!(
            "Attempt {}: Znajdź odpowiedź w dostępnych danych - wszystko jest tam!",
            attempt + 1
        );
        let prompt = answer_prompt(attempt, question, evidence, raw);
        answer = ctx.ask(&system, &prompt, &ctx.config.openai.chat_model).await?;
        if is_meaningful(&answer) {
            return Ok(answer);
        }
        warn!(attempt = attempt + 1, %answer, "no usable answer, retrying");
    }
    Ok(answer)
}

async fn api_answer(ctx: &TaskContext) -> String {
    let call = async {
        let url = ctx.endpoint("phone_api_url")?;
        let password = ctx.secret("api_password")?;
        ApiCall::post(url, json!({"password": password}))
            .with_context("Getting token for the API question", "Response should contain a token to return as answer")
            .execute(&ctx.http)
            .await
    };
    match call.await {
        Ok(result) if !result.text.is_empty() => {
            info!(status = result.status, notes = ?result.notes, "API replied");
            extract_token(&result.text)
        }
        Ok(_) => "ERROR - No response text".to_string(),
        Err(e) => {
            warn!("API call failed: {e:#}");
            "ERROR".to_string()
        }
    }
}

pub async fn run(ctx: &TaskContext, facts_dir: Option<&Path>) -> Result<TaskOutcome> {
    let raw: Value = ctx.http.get_json(&ctx.endpoint("phone_data_url")?).await?;
    let sorted: Value = ctx.http.get_json(&ctx.endpoint("phone_sorted_url")?).await?;
    let questions: BTreeMap<String, String> = ctx.http.get_json(&ctx.endpoint("phone_questions_url")?).await?;
    let facts = load_facts(facts_dir)?;
    let conversations = format_conversations(&sorted);

    let liar = ctx
        .ask(
            "Analizuj fakty bardzo dokładnie i porównuj z wiedzą powszechną.",
            &liar_prompt(&conversations, &facts),
            &ctx.config.openai.chat_model,
        )
        .await?;
    info!(%liar, "liar identified");

    let phone = &ctx.config.phone;
    let evidence = Evidence {
        conversations: &conversations,
        facts: &facts,
        liar: &liar,
        notes: &phone.context_notes,
    };
    let mut answers = BTreeMap::new();
    for (id, question) in &questions {
        let answer = if *id == phone.api_question_id {
            api_answer(ctx).await
        } else {
            let raw = (*id == phone.raw_data_question_id).then_some(&raw);
            answer_question(ctx, question, &evidence, raw).await?
        };
        info!(%id, %question, %answer, "answer");
        answers.insert(id.clone(), answer);
    }

    let answer = json!(answers);
    let report = ctx.centrala.report(TASK, &answer).await?;
    Ok(TaskOutcome::from_report(TASK, answer, &report))
}
