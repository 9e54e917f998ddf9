// GPS agent reconstruction: people seen in the asked-about city, their user
// ids from the database API and their coordinates from the GPS API.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use aidevs_core::http::Request;
use aidevs_core::text::{normalize_name, truncate_chars};

use crate::context::TaskContext;
use crate::outcome::TaskOutcome;
use crate::tasks::loop_search::lookup;

pub const TASK: &str = "gps";
const NO_LOCATION: &str = "BRAK";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

fn as_f64(v: &Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

fn pair(obj: &Value, lat: &str, lon: &str) -> Option<Coordinates> {
    Some(Coordinates {
        lat: as_f64(obj.get(lat)?)?,
        lon: as_f64(obj.get(lon)?)?,
    })
}

/// Coordinates from a GPS API reply: `lat`/`lon` or `latitude`/`longitude`
/// at the top level, or `lat`/`lon` inside `message`.
pub fn parse_coordinates(reply: &Value) -> Option<Coordinates> {
    pair(reply, "lat", "lon")
        .or_else(|| pair(reply, "latitude", "longitude"))
        .or_else(|| reply.get("message").and_then(|m| pair(m, "lat", "lon")))
}

/// User id of the first row, numeric or numeric string.
pub fn user_id_from_rows(rows: &[Value]) -> Option<i64> {
    let id = rows.first()?.get("id")?;
    id.as_i64().or_else(|| id.as_str().and_then(|s| s.trim().parse().ok()))
}

fn username_queries(person: &str) -> Vec<String> {
    let mut capitalized = String::new();
    let mut chars = person.chars();
    if let Some(first) = chars.next() {
        capitalized.extend(first.to_uppercase());
        capitalized.extend(chars.flat_map(char::to_lowercase));
    }
    let mut queries: Vec<String> = [person.to_string(), capitalized, person.to_lowercase()]
        .into_iter()
        .map(|name| format!("SELECT id FROM users WHERE username = '{name}'"))
        .collect();
    queries.push(format!(
        "SELECT id FROM users WHERE UPPER(username) = '{}'",
        person.to_uppercase()
    ));
    queries.dedup();
    queries
}

async fn analyze_logs(ctx: &TaskContext, logs: &str) -> String {
    let prompt = format!(
        "Przeanalizuj poniższe logi GPS agenta i odpowiedz na pytania:\n\n\
         LOGI GPS:\n{logs}\n\n\
         PYTANIA:\n\
         1. Jaki był cel tego agenta GPS?\n\
         2. Co agent robił i jak działał?\n\
         3. Jakie dane przetwarzał?\n\
         4. W jakiej kolejności wykonywał operacje?\n\n\
         Odpowiedz krótko i konkretnie w języku polskim."
    );
    ctx.ask(
        "Analizujesz logi systemu GPS. Bądź precyzyjny i konkretny.",
        &prompt,
        &ctx.config.openai.chat_model,
    )
    .await
    .unwrap_or_else(|e| {
        warn!("log analysis failed: {e:#}");
        "Nie udało się przeanalizować logów".to_string()
    })
}

/// City named in the question, upper case without diacritics.
pub async fn extract_location(ctx: &TaskContext, question: &Value) -> Result<Option<String>> {
    let data = serde_json::to_string_pretty(question)?;
    let prompt = format!(
        "Z poniższych danych pytania wyciągnij nazwę miejscowości/miasta, o które chodzi.\n\n\
         DANE PYTANIA:\n{data}\n\n\
         Zwróć tylko nazwę miejscowości/miasta WIELKIMI LITERAMI, bez polskich znaków.\n\
         Jeśli nie ma żadnej miejscowości, odpowiedz \"{NO_LOCATION}\".\n\n\
         MIEJSCOWOŚĆ:"
    );
    let reply = ctx
        .ask(
            "Wyciągnij tylko nazwę miejscowości z danych. Bądź precyzyjny.",
            &prompt,
            &ctx.config.openai.chat_model,
        )
        .await?;
    let location = normalize_name(&reply);
    Ok((!location.is_empty() && location != NO_LOCATION).then_some(location))
}

async fn user_id(ctx: &TaskContext, db_url: &str, person: &str) -> Option<i64> {
    for query in username_queries(person) {
        match ctx.centrala.query_database(db_url, &query).await {
            Ok(rows) => {
                if let Some(id) = user_id_from_rows(&rows) {
                    return Some(id);
                }
            }
            Err(e) => warn!(%query, "query failed: {e}"),
        }
    }
    None
}

async fn coordinates(ctx: &TaskContext, gps_url: &str, user_id: i64) -> Result<Option<Coordinates>> {
    let body = json!({"apikey": ctx.centrala.api_key(), "userID": user_id});
    let reply: Value = ctx.http.make_request(Request::post(gps_url).json(body)).await?.json()?;
    Ok(parse_coordinates(&reply))
}

/// Coordinates of everyone seen in `location` except `excluded`, keyed by
/// name. People without an id or coordinates are skipped.
pub async fn locate_people(
    ctx: &TaskContext,
    location: &str,
    excluded: &str,
) -> Result<BTreeMap<String, Coordinates>> {
    let places_url = ctx.endpoint("places_api")?;
    let db_url = ctx.endpoint("database_api_url")?;
    let gps_url = ctx.endpoint("gps_api_url")?;

    let excluded = normalize_name(excluded);
    let people: Vec<String> = lookup(ctx, &places_url, location)
        .await?
        .into_iter()
        .filter(|p| *p != excluded)
        .collect();
    info!(%location, ?people, "people in location");

    let mut found = BTreeMap::new();
    for person in people {
        let Some(id) = user_id(ctx, &db_url, &person).await else {
            warn!(%person, "no user id, skipping");
            continue;
        };
        match coordinates(ctx, &gps_url, id).await {
            Ok(Some(coords)) => {
                info!(%person, id, lat = coords.lat, lon = coords.lon, "located");
                found.insert(person, coords);
            }
            Ok(None) => warn!(%person, id, "reply without coordinates"),
            Err(e) => warn!(%person, id, "GPS lookup failed: {e:#}"),
        }
    }
    Ok(found)
}

pub async fn run(ctx: &TaskContext) -> Result<TaskOutcome> {
    let logs = ctx.http.get_text(&ctx.endpoint("gps_logs_url")?).await?;
    info!(chars = logs.chars().count(), preview = truncate_chars(&logs, 200), "logs downloaded");
    let analysis = analyze_logs(ctx, &logs).await;
    info!(%analysis, "agent analysis");

    let question: Value = ctx.http.get_json(&ctx.endpoint("gps_question_url")?).await?;
    let Some(location) = extract_location(ctx, &question).await? else {
        return Ok(TaskOutcome::failed(TASK, "no location in the question"));
    };
    let found = locate_people(ctx, &location, &ctx.config.search.target).await?;
    if found.is_empty() {
        bail!("no coordinates found for anyone in {location}");
    }

    let answer = json!(found);
    let report = ctx.centrala.report(TASK, &answer).await?;
    Ok(TaskOutcome::from_report(TASK, answer, &report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{centrala, last_user_text, spawn_server, test_context, ScriptedModel};
    use axum::routing::{get, post};
    use axum::Json;
    use std::sync::Arc;

    #[test]
    fn coordinates_from_reply_shapes() {
        let expected = Some(Coordinates { lat: 50.06, lon: 19.94 });
        assert_eq!(parse_coordinates(&json!({"lat": 50.06, "lon": 19.94})), expected);
        assert_eq!(parse_coordinates(&json!({"latitude": "50.06", "longitude": "19.94"})), expected);
        assert_eq!(parse_coordinates(&json!({"code": 0, "message": {"lat": 50.06, "lon": 19.94}})), expected);
        assert_eq!(parse_coordinates(&json!({"message": "brak"})), None);
    }

    #[test]
    fn user_ids_and_queries() {
        assert_eq!(user_id_from_rows(&[json!({"id": "28"})]), Some(28));
        assert_eq!(user_id_from_rows(&[json!({"id": 3})]), Some(3));
        assert_eq!(user_id_from_rows(&[]), None);
        let queries = username_queries("RAFAL");
        assert_eq!(queries[1], "SELECT id FROM users WHERE username = 'Rafal'");
        assert_eq!(queries.len(), 4);
    }

    #[tokio::test]
    async fn locates_people_except_target() {
        let (app, reports) = centrala::router();
        let app = app
            .route("/logs.txt", get(|| async { "agent: places -> database -> gps" }))
            .route("/gps_question.json", get(|| async { Json(json!({"question": "Kto był w Lubawie?"})) }))
            .route(
                "/places",
                post(|Json(body): Json<Value>| async move {
                    assert_eq!(body["query"], "LUBAWA");
                    Json(json!({"code": 0, "message": "RAFAL AZAZEL BARBARA"}))
                }),
            )
            .route(
                "/apidb",
                post(|Json(body): Json<Value>| async move {
                    let query = body["query"].as_str().unwrap_or_default().to_string();
                    let reply = if query.contains("'Rafal'") {
                        json!([{"id": "28"}])
                    } else if query.contains("'AZAZEL'") {
                        json!([{"id": 3}])
                    } else {
                        json!([])
                    };
                    Json(json!({"reply": reply, "error": "OK"}))
                }),
            )
            .route(
                "/gps",
                post(|Json(body): Json<Value>| async move {
                    let reply = match body["userID"].as_i64() {
                        Some(28) => json!({"code": 0, "message": {"lat": 53.45, "lon": 19.74}}),
                        _ => json!({"code": 0, "message": {"lat": 50.06, "lon": 19.94}}),
                    };
                    Json(reply)
                }),
            );
        let base = spawn_server(app).await;
        let urls: Vec<String> = ["logs.txt", "gps_question.json", "places", "apidb", "gps"]
            .iter()
            .map(|p| format!("{base}/{p}"))
            .collect();
        let model = Arc::new(ScriptedModel::with(|request| {
            let location = if last_user_text(request).contains("MIEJSCOWOŚĆ") { "Lubawa" } else { "Agent łączy API." };
            location.to_string()
        }));
        let ctx = test_context(
            &base,
            &[
                ("GPS_LOGS_URL", urls[0].as_str()),
                ("GPS_QUESTION_URL", urls[1].as_str()),
                ("PLACES_API", urls[2].as_str()),
                ("DATABASE_API_URL", urls[3].as_str()),
                ("GPS_API_URL", urls[4].as_str()),
            ],
            model,
        );

        let outcome = run(&ctx).await.unwrap();
        assert!(outcome.success);
        assert_eq!(
            reports.lock().unwrap()[0]["answer"],
            json!({
                "AZAZEL": {"lat": 50.06, "lon": 19.94},
                "RAFAL": {"lat": 53.45, "lon": 19.74},
            })
        );
    }
}
