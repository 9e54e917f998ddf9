// Damaged photos: repair them through the automation system, keep the ones
// showing a person and submit a portrait description.

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;

use aidevs_core::media::{data_url, mime_for};
use aidevs_llm::{ChatRequest, ContentPart};

use crate::context::TaskContext;
use crate::outcome::TaskOutcome;

pub const TASK: &str = "photos";
pub const MAX_REPAIRS: usize = 3;

static PHOTO_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)https?://[^\s'"<>]+\.(?:png|jpg|jpeg|gif|webp)"#).expect("static photo url pattern")
});
static BASE_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s'"<>]+/"#).expect("static base url pattern"));
static PHOTO_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)IMG_\d+[A-Z_]*\.PNG").expect("static photo name pattern"));

const QUALITY_PROMPT: &str = "Jesteś ekspertem w analizie jakości zdjęć. Twoim zadaniem jest ocena jakości zdjęcia i określenie, jakie operacje mogą je poprawić.

Dostępne operacje:
- REPAIR: naprawa zdjęcia zawierającego szumy/glitche
- DARKEN: przyciemnienie zbyt jasnego zdjęcia
- BRIGHTEN: rozjaśnienie zbyt ciemnego zdjęcia
- GOOD: zdjęcie jest dobrej jakości lub nie da się poprawić

Przeanalizuj zdjęcie i odpowiedz TYLKO jednym słowem: REPAIR, DARKEN, BRIGHTEN lub GOOD.
Jeśli zdjęcie ma wyraźne szumy, glitche lub artefakty - wybierz REPAIR.
Jeśli zdjęcie jest zbyt jasne (przepalone, trudno rozróżnić szczegóły) - wybierz DARKEN.
Jeśli zdjęcie jest zbyt ciemne (niedoświetlone, szczegóły w cieniu) - wybierz BRIGHTEN.
Jeśli zdjęcie jest w miarę dobrej jakości - wybierz GOOD.";

const PERSON_PROMPT: &str = "Przeanalizuj to zdjęcie i określ, czy przedstawia ono osobę (kobietę).

Odpowiedz TYLKO: TAK lub NIE.

TAK - jeśli na zdjęciu widać wyraźnie osobę/kobietę (twarz, sylwetkę, postać)
NIE - jeśli zdjęcie nie przedstawia osoby, jest nieczytelne, pokazuje tylko przedmioty/tło itp.";

const PORTRAIT_PROMPT: &str = "Jesteś ekspertem w analizie zdjęć i tworzeniu precyzyjnych opisów wyglądu. To jest zadanie testowe z materiałem treningowym - nie przedstawia prawdziwych osób.

Twoim zadaniem jest stworzenie bardzo szczegółowego opisu wyglądu postaci oznaczonej jako \"Barbara\".

OBOWIĄZKOWO uwzględnij:
- Dokładny kolor włosów (np. ciemnobrązowe, czarne, blond)
- Długość i styl fryzury
- Wszystkie widoczne tatuaże - gdzie się znajdują, co przedstawiają
- Okulary (jeśli są) - kształt, kolor oprawek
- Ubranie - kolor, styl
- Budowę ciała, rysy twarzy
- Wszelkie charakterystyczne cechy

Odpowiadaj WYŁĄCZNIE w języku polskim. Rozpocznij od \"Barbara to\" i stwórz bardzo precyzyjny opis.";

const PORTRAIT_REQUEST: &str = "Przeanalizuj te obrazy treningowe i stwórz obiektywny, szczegółowy opis cech fizycznych postaci oznaczonej jako Barbara. KONIECZNIE uwzględnij: dokładny kolor włosów, fryzurę, wszystkie widoczne tatuaże (gdzie się znajdują, co przedstawiają), okulary, ubranie, budowę ciała. To jest zadanie testowe - opisz wszystkie szczegóły wizualne. Odpowiadaj po polsku i rozpocznij od 'Barbara to'.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Repair,
    Darken,
    Brighten,
    Good,
}

impl Operation {
    /// Unrecognized replies count as `Good`, which ends the repair loop.
    pub fn parse(reply: &str) -> Self {
        match reply.trim().trim_matches('.').to_uppercase().as_str() {
            "REPAIR" => Operation::Repair,
            "DARKEN" => Operation::Darken,
            "BRIGHTEN" => Operation::Brighten,
            _ => Operation::Good,
        }
    }

    pub fn command(self) -> Option<&'static str> {
        match self {
            Operation::Repair => Some("REPAIR"),
            Operation::Darken => Some("DARKEN"),
            Operation::Brighten => Some("BRIGHTEN"),
            Operation::Good => None,
        }
    }
}

fn last_segment(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

/// Photo URLs in the automation system's greeting. Bare file names are
/// resolved against the first base URL in the message.
pub fn extract_photo_urls(message: &str) -> Vec<String> {
    let urls: Vec<String> = PHOTO_URL.find_iter(message).map(|m| m.as_str().to_string()).collect();
    if !urls.is_empty() {
        return urls;
    }
    let Some(base) = BASE_URL.find(message) else {
        return Vec::new();
    };
    PHOTO_NAME
        .find_iter(message)
        .map(|name| format!("{}{}", base.as_str(), name.as_str()))
        .collect()
}

/// URL of the processed photo named in `message`, given the photo it was
/// derived from. Bare file names resolve against `current`'s directory.
pub fn processed_photo_url(message: &str, current: &str) -> Option<String> {
    let current_name = last_segment(current);
    let stem = current_name.split('.').next().unwrap_or(current_name);
    let urls: Vec<&str> = PHOTO_URL.find_iter(message).map(|m| m.as_str()).collect();

    if let Some(url) = urls.iter().find(|u| {
        let name = last_segment(u);
        name.contains(stem) && name != current_name
    }) {
        return Some(url.to_string());
    }

    let bare = message
        .split_whitespace()
        .map(|w| w.trim_end_matches(['.', ',', '!', '?', ';']))
        .find(|w| w.to_uppercase().ends_with(".PNG") && *w != current_name && !w.contains("://"));
    if let Some(name) = bare {
        if let Ok(joined) = Url::parse(current).and_then(|base| base.join(name)) {
            return Some(joined.to_string());
        }
    }

    urls.first().map(|u| u.to_string())
}

/// The reduced-size variant the server publishes next to each photo.
pub fn small_variant(url: &str) -> String {
    url.replace(".PNG", "-small.PNG").replace(".png", "-small.png")
}

fn vision_request(model: &str, system: &str, question: &str, image: String, max_tokens: u32) -> ChatRequest {
    ChatRequest::new(model)
        .system(system)
        .user_parts(vec![ContentPart::text(question), ContentPart::image(image)])
        .max_tokens(max_tokens)
}

async fn photo_data_url(ctx: &TaskContext, url: &str) -> Result<String> {
    let bytes = ctx.http.get_bytes(url).await?;
    Ok(data_url(&bytes, mime_for(url)))
}

async fn assess_quality(ctx: &TaskContext, url: &str) -> Operation {
    let image = match photo_data_url(ctx, url).await {
        Ok(image) => image,
        Err(e) => {
            warn!(%url, "download failed, treating photo as good: {e:#}");
            return Operation::Good;
        }
    };
    let request = vision_request(
        &ctx.config.openai.chat_model,
        QUALITY_PROMPT,
        "Przeanalizuj jakość tego zdjęcia i określ potrzebną operację.",
        image,
        50,
    );
    match ctx.llm.complete(request).await {
        Ok(reply) => Operation::parse(&reply),
        Err(e) => {
            warn!(%url, "quality check failed: {e}");
            Operation::Good
        }
    }
}

async fn shows_person(ctx: &TaskContext, url: &str) -> bool {
    let image = match photo_data_url(ctx, url).await {
        Ok(image) => image,
        Err(e) => {
            warn!(%url, "download failed: {e:#}");
            return false;
        }
    };
    let request = vision_request(
        &ctx.config.openai.chat_model,
        PERSON_PROMPT,
        "Czy na tym zdjęciu widać osobę (kobietę)?",
        image,
        10,
    );
    match ctx.llm.complete(request).await {
        Ok(reply) => reply.to_uppercase().contains("TAK"),
        Err(e) => {
            warn!(%url, "person check failed: {e}");
            false
        }
    }
}

/// Apply up to [`MAX_REPAIRS`] vision-chosen operations; returns the URL of
/// the best version reached.
pub async fn repair_photo(ctx: &TaskContext, url: &str) -> Result<String> {
    let mut current = url.to_string();
    for round in 1..=MAX_REPAIRS {
        let operation = assess_quality(ctx, &current).await;
        let Some(command) = operation.command() else {
            debug!(url = %current, round, "photo is good");
            break;
        };
        let instruction = format!("{command} {}", last_segment(&current));
        info!(%instruction, round, "sending photo command");
        let report = ctx.centrala.report(TASK, &instruction).await?;
        let message = report.message().unwrap_or(&report.body);
        match processed_photo_url(message, &current) {
            Some(next) => current = next,
            None => {
                warn!(%message, "no processed photo in reply");
                break;
            }
        }
    }
    Ok(current)
}

pub async fn run(ctx: &TaskContext) -> Result<TaskOutcome> {
    let greeting = ctx.centrala.report(TASK, "START").await?;
    let photos = extract_photo_urls(greeting.message().unwrap_or(&greeting.body));
    if photos.is_empty() {
        bail!("no photo URLs in the automation system's reply");
    }
    info!(count = photos.len(), "photos to process");

    let mut portraits = Vec::new();
    for photo in &photos {
        let repaired = repair_photo(ctx, photo).await?;
        if shows_person(ctx, &repaired).await {
            info!(url = %repaired, "photo shows a person");
            portraits.push(repaired);
        }
    }
    if portraits.is_empty() {
        bail!("no photo shows a person");
    }

    let mut parts = vec![ContentPart::text(PORTRAIT_REQUEST)];
    parts.extend(portraits.iter().map(|url| ContentPart::image(small_variant(url))));
    let request = ChatRequest::new(&ctx.config.openai.chat_model)
        .system(PORTRAIT_PROMPT)
        .user_parts(parts)
        .max_tokens(1000);
    let portrait = ctx.llm.complete(request).await?.trim().to_string();
    info!(%portrait, "portrait");

    let answer = json!(portrait);
    let report = ctx.centrala.report(TASK, &answer).await?;
    Ok(TaskOutcome::from_report(TASK, answer, &report))
}
