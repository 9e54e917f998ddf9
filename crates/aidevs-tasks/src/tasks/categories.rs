// Factory reports: sort text, scanned and recorded notes into people and
// hardware findings.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tracing::{info, warn};

use aidevs_core::media::{data_url, file_name, kind_from_name, list_files, MediaKind};
use aidevs_llm::{ChatRequest, ContentPart};

use crate::context::TaskContext;
use crate::outcome::TaskOutcome;

pub const TASK: &str = "kategorie";
pub const CONTENTS: &str = "file_contents";

const OCR_PROMPT: &str =
    "You are an image text extraction assistant. Extract ALL text from the image, preserving the exact formatting.";

const CLASSIFY_PROMPT: &str = r#"[Classify Extracted Text from Archive Files]

You are an intelligence filter classifying raw extracted text into one of two categories: people-related evidence or hardware-related malfunctions.

<prompt_objective>
Label each piece of text as either `people` or `hardware` if it contains relevant information. If it does not match either category, do NOT return anything.
</prompt_objective>

<prompt_rules>
- Return ONLY one of the following labels: `people` or `hardware`.
- DO NOT return `no data`, `unknown`, or any other label.
- DO NOT explain or summarize.
- DO NOT fabricate labels for irrelevant or ambiguous input; return nothing at all in such cases.

Label as `people` if the text mentions:
- Captured individuals, hostages, prisoners, detainees.
- Traces of human presence such as footprints, fingerprints, blood stains, hair, voice, handwritten notes, body temperature traces, surveillance imagery.

Label as `hardware` if the text mentions:
- Physical equipment malfunctions (excluding software issues).
- Faulty machinery, broken components, overheating, short-circuits, loss of structural integrity, sensor failure.
</prompt_rules>

<prompt_examples>
USER: "W miejscu zdarzenia odnaleziono dwa odciski butów oraz ręcznie zapisane notatki."
AI: people

USER: "Moduł sensoryczny przestał reagować po wykryciu anomalii w zasilaniu."
AI: hardware

USER: "Sygnał GPS został utracony na 3 godziny."
AI:

USER: "Wadliwy przekaźnik spowodował spięcie i zatrzymanie całego układu."
AI: hardware
</prompt_examples>

Return only: `people` or `hardware`. If nothing fits, return nothing."#;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Categories {
    pub people: Vec<String>,
    pub hardware: Vec<String>,
}

impl Categories {
    /// Record `file` under every label mentioned in `label_reply`.
    pub fn add(&mut self, file: &str, label_reply: &str) {
        let reply = label_reply.to_lowercase();
        if reply.contains("people") && !self.people.iter().any(|f| f == file) {
            self.people.push(file.to_string());
        }
        if reply.contains("hardware") && !self.hardware.iter().any(|f| f == file) {
            self.hardware.push(file.to_string());
        }
    }

    pub fn sorted(mut self) -> Self {
        self.people.sort();
        self.hardware.sort();
        self
    }
}

/// Text content of a report file: read, OCR'd or transcribed, cached by
/// file name.
async fn file_content(ctx: &TaskContext, path: &Path) -> Result<String> {
    let name = file_name(path);
    ctx.cached_text(CONTENTS, &name, || extract_text(ctx, path, &name))
        .await
}

async fn extract_text(ctx: &TaskContext, path: &Path, name: &str) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    match kind_from_name(name) {
        MediaKind::Text => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        MediaKind::Image => {
            let request = ChatRequest::new(&ctx.config.openai.chat_model)
                .system(OCR_PROMPT)
                .user_parts(vec![
                    ContentPart::text("Extract all text from this image:"),
                    ContentPart::image(data_url(&bytes, "image/png")),
                ]);
            Ok(ctx.llm.complete(request).await?)
        }
        MediaKind::Audio => Ok(ctx
            .llm
            .transcribe(bytes, name, &ctx.config.openai.transcription_model)
            .await?),
        MediaKind::Other => bail!("unsupported file type: {name}"),
    }
}

pub async fn categorize(ctx: &TaskContext, dir: &Path) -> Result<Categories> {
    let files = list_files(dir, &["txt", "png", "mp3"], &["facts"])?;
    info!(count = files.len(), "report files found");

    let mut categories = Categories::default();
    for path in files {
        let name = file_name(&path);
        let content = match file_content(ctx, &path).await {
            Ok(content) => content,
            Err(e) => {
                warn!(%name, "skipping file: {e:#}");
                continue;
            }
        };
        let request = ChatRequest::new(&ctx.config.openai.chat_model)
            .system(CLASSIFY_PROMPT)
            .user(format!("Categorize this factory report:\n\n{content}"))
            .temperature(0.0);
        match ctx.llm.complete(request).await {
            Ok(label) => {
                info!(%name, label = label.trim(), "classified");
                categories.add(&name, &label);
            }
            Err(e) => warn!(%name, "classification failed: {e}"),
        }
    }
    Ok(categories.sorted())
}

pub async fn run(ctx: &TaskContext, dir: &Path) -> Result<TaskOutcome> {
    let categories = categorize(ctx, dir).await?;
    let answer = json!({
        "people": categories.people,
        "hardware": categories.hardware,
    });
    let report = ctx.centrala.report(TASK, &answer).await?;
    Ok(TaskOutcome::from_report(TASK, answer, &report))
}
