// Drone navigation webhook: a movement instruction in Polish in, the name
// of the map cell the drone lands on out.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::context::TaskContext;
use crate::server::{register_webhook, registration_reply, WebhookRegistration};

pub const TASK: &str = "webhook";
pub const START: (usize, usize) = (0, 0);

/// Cell contents by `[row][col]`, row 0 at the top.
pub const MAP: [[&str; 4]; 4] = [
    ["start", "trawa", "drzewo", "dom"],
    ["trawa", "wiatrak", "trawa", "trawa"],
    ["trawa", "trawa", "skaly", "drzewo"],
    ["skaly", "skaly", "auto", "jaskinia"],
];

#[derive(Debug, Deserialize)]
pub struct DroneInstruction {
    pub instruction: String,
}

#[derive(Debug, Serialize)]
pub struct DroneResponse {
    pub description: String,
}

fn map_description() -> String {
    let mut rows = Vec::new();
    for (r, row) in MAP.iter().enumerate() {
        let cells: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(c, name)| format!("({r},{c})={name}"))
            .collect();
        rows.push(format!("Wiersz {r}: {}", cells.join(", ")));
    }
    format!(
        "Mapa terenu 4x4:\nWspółrzędne (wiersz, kolumna) liczone od 0:\n\n{}\n\n\
         Punkt startowy: (0,0) - lewy górny róg\n\
         Ruch w prawo: kolumna +1\n\
         Ruch w lewo: kolumna -1\n\
         Ruch w dół: wiersz +1\n\
         Ruch w górę: wiersz -1\n\n\
         Granice mapy: wiersze 0-3, kolumny 0-3",
        rows.join("\n")
    )
}

fn system_prompt() -> String {
    format!(
        "Jesteś ekspertem w nawigacji dronów. Twoim zadaniem jest interpretacja instrukcji ruchu i obliczenie \
         końcowej pozycji drona na mapie 4x4.\n\n{}\n\n\
         INSTRUKCJE:\n\
         1. Dron ZAWSZE zaczyna z pozycji (0,0) - lewy górny róg\n\
         2. Przeanalizuj instrukcję ruchu krok po kroku\n\
         3. Oblicz końcową pozycję (wiersz, kolumna)\n\
         4. Upewnij się, że pozycja mieści się w granicach mapy (0-3, 0-3)\n\
         5. Odpowiedz TYLKO w formacie: \"wiersz,kolumna\" (np. \"2,1\")\n\n\
         Przykłady:\n\
         - \"jedno pole w prawo\" → z (0,0) do (0,1) → odpowiedź: \"0,1\"\n\
         - \"dwa pola w dół\" → z (0,0) do (2,0) → odpowiedź: \"2,0\"\n\
         - \"jedno w prawo, potem jedno w dół\" → z (0,0) do (0,1) do (1,1) → odpowiedź: \"1,1\"\n\
         - \"na sam dół\" → z (0,0) do (3,0) → odpowiedź: \"3,0\"\n\
         - \"w prawo do końca\" → z (0,0) do (0,3) → odpowiedź: \"0,3\"\n\n\
         Jeśli instrukcja wyprowadziłaby drona poza mapę, zatrzymaj go na granicy.",
        map_description()
    )
}

/// `row,col` from the model's reply, both within the map.
pub fn parse_position(reply: &str) -> Option<(usize, usize)> {
    let compact: String = reply.chars().filter(|c| !c.is_whitespace() && *c != '"').collect();
    let (row, col) = compact.split_once(',')?;
    let row: usize = row.parse().ok()?;
    let col: usize = col.parse().ok()?;
    (row < 4 && col < 4).then_some((row, col))
}

pub fn describe(position: (usize, usize)) -> &'static str {
    MAP.get(position.0)
        .and_then(|row| row.get(position.1))
        .copied()
        .unwrap_or("nieznane")
}

/// Final position after `instruction`; the start cell when the model's
/// answer is unusable.
pub async fn navigate(ctx: &TaskContext, instruction: &str) -> (usize, usize) {
    let user = format!(
        "Instrukcja ruchu drona: \"{instruction}\"\n\n\
         Dron startuje z pozycji (0,0). Gdzie się znajdzie po wykonaniu tej instrukcji?\n\
         Odpowiedz tylko współrzędnymi w formacie \"wiersz,kolumna\"."
    );
    match ctx.ask(&system_prompt(), &user, &ctx.config.openai.fast_model).await {
        Ok(reply) => parse_position(&reply).unwrap_or_else(|| {
            warn!(%reply, "unusable position, using start");
            START
        }),
        Err(e) => {
            warn!("navigation failed: {e:#}");
            START
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> Json<Value> {
    Json(json!({"message": "Drone Navigation API is running", "status": "ok"}))
}

async fn map() -> Json<Value> {
    let cells: serde_json::Map<String, Value> = MAP
        .iter()
        .enumerate()
        .flat_map(|(r, row)| row.iter().enumerate().map(move |(c, name)| (format!("{r},{c}"), json!(name))))
        .collect();
    Json(json!({
        "map": cells,
        "start_position": [START.0, START.1],
        "map_size": "4x4",
        "coordinates": "row,col (0-based)",
    }))
}

async fn drone(State(ctx): State<Arc<TaskContext>>, Json(body): Json<DroneInstruction>) -> Json<DroneResponse> {
    info!(instruction = %body.instruction, "drone instruction");
    let position = navigate(&ctx, &body.instruction).await;
    let description = describe(position).to_string();
    info!(row = position.0, col = position.1, %description, "drone position");
    Json(DroneResponse { description })
}

async fn register(
    State(ctx): State<Arc<TaskContext>>,
    Json(body): Json<WebhookRegistration>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match register_webhook(&ctx.centrala, TASK, Some(&body.webhook_url), false).await {
        Ok(outcome) => Ok(Json(registration_reply(&outcome))),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"detail": format!("Registration failed: {e}")})),
        )),
    }
}

pub fn router(ctx: Arc<TaskContext>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/map", get(map))
        .route("/drone", post(drone))
        .route("/register-webhook", post(register))
        .with_state(ctx)
}
