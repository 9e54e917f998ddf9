// SoftoAI website: answer questions by letting the model pick which link to
// follow next.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;

use aidevs_core::html::{page_text_and_links, PageContent};
use aidevs_core::text::truncate_chars;

use crate::context::TaskContext;
use crate::outcome::TaskOutcome;

pub const TASK: &str = "softo";
pub const MAX_DEPTH: usize = 5;
pub const MAX_PAGES: usize = 10;
pub const NOT_FOUND: &str = "Nie znaleziono odpowiedzi";

const ANSWER_CONTENT_CHARS: usize = 8000;
const NAVIGATION_CONTENT_CHARS: usize = 3000;

static NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d+)\b").expect("static number pattern"));

const ANSWER_PROMPT: &str = r#"Jesteś ekspertem w analizie treści stron internetowych. Twoim zadaniem jest sprawdzenie, czy podana treść strony zawiera odpowiedź na konkretne pytanie.

INSTRUKCJE:
1. Przeanalizuj CAŁĄ treść strony dokładnie
2. Sprawdź czy można znaleźć konkretną odpowiedź na zadane pytanie
3. Jeśli TAK - podaj zwięzłą, konkretną odpowiedź (tylko samą informację, bez dodatkowych słów)
4. Jeśli NIE - odpowiedz "NIE"

Przykłady dobrych odpowiedzi:
- Na pytanie "Jaki jest email kontaktowy?" -> "kontakt@firma.com"
- Na pytanie "Kto jest CEO?" -> "Jan Kowalski"
- Na pytanie "Ile kosztuje produkt X?" -> "299 PLN"
- Na pytanie "Jaki jest adres interfejsu?" -> "https://robots.banan.com"
- Na pytanie "Jakie certyfikaty ISO?" -> "ISO 9001, ISO 14001"

NIE dodawaj słów jak "Email to:", "Odpowiedź to:", tylko podaj samą informację."#;

const NAVIGATION_PROMPT: &str = r#"Jesteś ekspertem w nawigacji po stronach internetowych. Twoim zadaniem jest wybór najlepszego linku, który prawdopodobnie zawiera odpowiedź na zadane pytanie.

INSTRUKCJE:
1. Przeanalizuj treść strony i dostępne linki
2. Wybierz link, który najlepiej pasuje do tematu pytania
3. Odpowiedz TYLKO numerem wybranego linku (np. "3")
4. Zawsze wybierz jakiś link - jeśli nie jesteś pewien, wybierz najbardziej prawdopodobny

Szukaj linków związanych z:
- Portfolio/Realizacje (dla pytań o konkretne projekty klientów)
- Kontaktami (dla pytań o email, telefon, adres)
- O nas/About (dla pytań o firmie, zespole, historii, certyfikatach)
- Produktach/Usługach (dla pytań o ofertę)
- Cenach/Pricing (dla pytań o koszty)"#;

/// `None` when the model says the page has no answer.
pub fn parse_answer(reply: &str) -> Option<String> {
    let reply = reply.trim();
    let bare = reply.trim_matches(|c: char| c == '"' || c == '.');
    if reply.is_empty() || bare.eq_ignore_ascii_case("NIE") {
        None
    } else {
        Some(reply.to_string())
    }
}

/// 1-based link number from the model's reply; anything unusable falls back
/// to the first link.
pub fn parse_link_choice(reply: &str, available: usize) -> Option<usize> {
    if available == 0 {
        return None;
    }
    let chosen = NUMBER
        .captures(reply)
        .and_then(|c| c[1].parse::<usize>().ok())
        .filter(|n| (1..=available).contains(n));
    Some(chosen.map_or(0, |n| n - 1))
}

/// Crawls one site; fetched pages are kept for the whole run.
pub struct Crawler<'a> {
    ctx: &'a TaskContext,
    start: Url,
    pages: HashMap<String, PageContent>,
}

impl<'a> Crawler<'a> {
    pub fn new(ctx: &'a TaskContext, start: Url) -> Self {
        Self {
            ctx,
            start,
            pages: HashMap::new(),
        }
    }

    pub fn cached_pages(&self) -> usize {
        self.pages.len()
    }

    async fn page(&mut self, url: &str) -> Result<PageContent> {
        if let Some(page) = self.pages.get(url) {
            debug!(%url, "page from cache");
            return Ok(page.clone());
        }
        let parsed = Url::parse(url)?;
        let html = self.ctx.http.get_text(url).await?;
        let page = page_text_and_links(&html, &parsed);
        self.pages.insert(url.to_string(), page.clone());
        Ok(page)
    }

    async fn answer_on_page(&self, content: &str, question: &str) -> Option<String> {
        let mut excerpt = truncate_chars(content, ANSWER_CONTENT_CHARS).to_string();
        if excerpt.len() < content.len() {
            excerpt.push_str("...");
        }
        let prompt = format!(
            "Treść strony:\n{excerpt}\n\nPytanie: {question}\n\n\
             Czy na tej stronie można znaleźć odpowiedź na to pytanie? Jeśli tak, podaj zwięzłą odpowiedź. \
             Jeśli nie, odpowiedz \"NIE\"."
        );
        match self.ctx.ask(ANSWER_PROMPT, &prompt, &self.ctx.config.openai.fast_model).await {
            Ok(reply) => parse_answer(&reply),
            Err(e) => {
                warn!("answer check failed: {e:#}");
                None
            }
        }
    }

    async fn choose_link(&self, content: &str, question: &str, links: &[String]) -> Option<String> {
        if links.is_empty() {
            return None;
        }
        let listing = links
            .iter()
            .enumerate()
            .map(|(i, link)| format!("{}. {link}", i + 1))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Treść strony:\n{}...\n\nPytanie: {question}\n\nDostępne linki:\n{listing}\n\n\
             Który link ma największą szansę zawierać odpowiedź na to pytanie? Odpowiedz tylko numerem.",
            truncate_chars(content, NAVIGATION_CONTENT_CHARS)
        );
        let reply = match self.ctx.ask(NAVIGATION_PROMPT, &prompt, &self.ctx.config.openai.fast_model).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!("link choice failed: {e:#}");
                String::new()
            }
        };
        parse_link_choice(&reply, links.len()).map(|i| links[i].clone())
    }

    /// Follow the model's choices from the start page for at most
    /// [`MAX_DEPTH`] hops and [`MAX_PAGES`] pages.
    pub async fn find_answer(&mut self, question: &str) -> Option<String> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut current = self.start.to_string();

        for depth in 0..MAX_DEPTH {
            if visited.len() >= MAX_PAGES || !visited.insert(current.clone()) {
                break;
            }
            let page = match self.page(&current).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(url = %current, "fetch failed: {e:#}");
                    break;
                }
            };
            info!(url = %current, depth, "exploring");

            if let Some(answer) = self.answer_on_page(&page.text, question).await {
                info!(url = %current, %answer, "answer found");
                return Some(answer);
            }

            let unvisited: Vec<String> = page
                .links
                .iter()
                .map(|l| l.url.clone())
                .filter(|u| !visited.contains(u))
                .collect();
            match self.choose_link(&page.text, question, &unvisited).await {
                Some(next) => current = next,
                None => break,
            }
        }
        None
    }
}

pub async fn run(ctx: &TaskContext) -> Result<TaskOutcome> {
    let questions_url = ctx.endpoint("softo_questions_url")?;
    let questions: BTreeMap<String, String> = ctx.http.get_json(&questions_url).await?;
    if questions.is_empty() {
        bail!("no questions to answer");
    }
    let start = Url::parse(&ctx.endpoint("softo_base_url")?)?;

    let mut crawler = Crawler::new(ctx, start);
    let mut answers = BTreeMap::new();
    for (id, question) in &questions {
        info!(%id, %question, "question");
        let answer = crawler
            .find_answer(question)
            .await
            .unwrap_or_else(|| NOT_FOUND.to_string());
        answers.insert(id.clone(), answer);
    }
    info!(pages = crawler.cached_pages(), "crawl finished");

    let answer = json!(answers);
    let report = ctx.centrala.report(TASK, &answer).await?;
    Ok(TaskOutcome::from_report(TASK, answer, &report))
}
