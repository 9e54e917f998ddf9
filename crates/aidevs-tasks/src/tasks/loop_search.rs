// People and places: follow sightings from a note until the target turns up
// in a city the note never mentioned.

use std::collections::{HashSet, VecDeque};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use aidevs_core::http::Request;
use aidevs_core::text::{is_valid_name, normalize_name, strip_code_fences};
use aidevs_llm::ask_llm;

use crate::context::TaskContext;
use crate::outcome::TaskOutcome;

pub const TASK: &str = "loop";

#[derive(Debug, Default, Deserialize)]
pub struct NoteNames {
    #[serde(default, rename = "imiona")]
    pub people: Vec<String>,
    #[serde(default, rename = "miasta")]
    pub cities: Vec<String>,
}

fn extraction_prompt(note: &str) -> String {
    format!(
        "Wypisz wszystkie imiona osób i nazwy miast, które pojawiają się w tym tekście, \
         w formie dwóch oddzielnych list: najpierw imiona, potem miasta. \
         Każde imię i miasto podaj w mianowniku, bez polskich znaków, wielkimi literami. \
         Odpowiedz tylko listami w formacie JSON: {{\"imiona\": [...], \"miasta\": [...]}}\n\n{note}"
    )
}

pub fn parse_note_names(reply: &str) -> Result<NoteNames> {
    serde_json::from_str(strip_code_fences(reply)).context("name lists are not valid JSON")
}

/// Names from a people/places API reply. The `message` field holds
/// space-separated names; anything that does not normalize to plain `A`-`Z`
/// (such as restricted-data markers) is dropped.
pub(crate) fn names_from_reply(body: &Value) -> Vec<String> {
    let raw: Vec<&str> = match body {
        Value::Object(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(|m| m.split_whitespace().collect())
            .unwrap_or_default(),
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };
    raw.into_iter()
        .map(normalize_name)
        .filter(|name| {
            let ok = is_valid_name(name);
            if !ok {
                debug!(%name, "skipping unusual name");
            }
            ok
        })
        .collect()
}

/// Breadth-first frontier that never queues the same name twice.
#[derive(Debug, Default)]
struct Frontier {
    queue: VecDeque<String>,
    seen: HashSet<String>,
}

impl Frontier {
    fn push(&mut self, name: String) {
        if self.seen.insert(name.clone()) {
            self.queue.push_back(name);
        }
    }

    fn pop(&mut self) -> Option<String> {
        self.queue.pop_front()
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

pub(crate) async fn lookup(ctx: &TaskContext, url: &str, query: &str) -> Result<Vec<String>> {
    let body = json!({"apikey": ctx.centrala.api_key(), "query": query});
    let response = ctx.http.send_unchecked(Request::post(url).json(body)).await?;
    let reply: Value = response.json()?;
    Ok(names_from_reply(&reply))
}

/// Alternate between the people and places APIs until `target` is seen in
/// a city outside `note`'s cities. Returns that city.
pub async fn search(ctx: &TaskContext, note: &NoteNames, target: &str) -> Result<Option<String>> {
    let people_url = ctx.endpoint("people_api")?;
    let places_url = ctx.endpoint("places_api")?;

    let note_cities: HashSet<String> = note.cities.iter().map(|c| normalize_name(c)).collect();
    let mut people = Frontier::default();
    let mut places = Frontier::default();
    for name in &note.people {
        people.push(normalize_name(name));
    }
    for city in &note_cities {
        places.push(city.clone());
    }
    info!(people = people.queue.len(), cities = places.queue.len(), "starting search");

    while !people.is_empty() || !places.is_empty() {
        if let Some(person) = people.pop() {
            match lookup(ctx, &people_url, &person).await {
                Ok(cities) => {
                    info!(%person, ?cities, "person seen in");
                    cities.into_iter().for_each(|c| places.push(c));
                }
                Err(e) => warn!(%person, "people lookup failed: {e:#}"),
            }
        }

        if let Some(city) = places.pop() {
            match lookup(ctx, &places_url, &city).await {
                Ok(seen) => {
                    info!(%city, ?seen, "people seen in city");
                    if seen.iter().any(|p| p == target) && !note_cities.contains(&city) {
                        return Ok(Some(city));
                    }
                    seen.into_iter().for_each(|p| people.push(p));
                }
                Err(e) => warn!(%city, "places lookup failed: {e:#}"),
            }
        }
    }
    Ok(None)
}

pub async fn run(ctx: &TaskContext) -> Result<TaskOutcome> {
    let note_url = ctx.endpoint("barbara_note_url")?;
    let note = ctx.http.get_text(&note_url).await?;

    let reply = ask_llm(ctx.llm.as_ref(), &extraction_prompt(&note), &ctx.config.openai.default_model).await?;
    let names = parse_note_names(&reply)?;
    info!(people = ?names.people, cities = ?names.cities, "names from note");

    let target = normalize_name(&ctx.config.search.target);
    let Some(city) = search(ctx, &names, &target).await? else {
        warn!(%target, "no new city found");
        return Ok(TaskOutcome::failed(TASK, format!("{target} not found outside the note's cities")));
    };
    info!(%city, "target located");

    let answer = json!(city);
    let report = ctx.centrala.report(TASK, &answer).await?;
    Ok(TaskOutcome::from_report(TASK, answer, &report))
}
