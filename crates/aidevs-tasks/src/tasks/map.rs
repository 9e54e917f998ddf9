// Map fragments: ask a vision model which city most fragments show.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tracing::info;

use aidevs_core::media::{data_url, file_name, list_files};
use aidevs_llm::{ChatRequest, ContentPart};

use crate::context::TaskContext;
use crate::outcome::TaskOutcome;

pub const TASK: &str = "map";

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

const SYSTEM_PROMPT: &str = "[Map Fragment Analysis: Identify the City]

You will receive map images (map-1 ... map-n).
Your task is to identify the single Polish city that at least three of these fragments belong to.

<prompt_rules>
STEP 1 EXTRACT
- For each fragment, list all legible street names and all visible landmarks (churches, cemeteries, stations, parks, rivers).
- Note compass hints (river bend, coastline, grid vs. radial plan).

STEP 2 CANDIDATE MATCHING
- Generate a candidate city list where at least 2 items from a fragment co-exist.
- Cross-check every fragment against each candidate.

STEP 3 CONSISTENCY CHECK
- A city is valid iff at least 3 fragments can be mapped there and each of them has at least 2 verified items present in that city.
- Mark any fragment that fails this test as decoy.

STEP 4 CERTAINTY THRESHOLD
- If no city meets the criteria with at least 80% confidence, output `unknown`.

STEP 5 SELF-REVISION
- Review your reasoning: do all verified streets and landmarks truly exist in the chosen city? Could another city fit better?

OUTPUT FORMAT
- Return the city name in lowercase without diacritics (e.g. `krakow`) and the reasoning behind the final answer.
</prompt_rules>

<prompt_examples>
USER (images) -> AI: wroclaw
USER (3x Lublin, 1x Lodz) -> AI: lublin
USER (no city passes threshold) -> AI: unknown
</prompt_examples>";

const USER_PROMPT: &str = "Przeanalizuj te fragmenty mapy i określ, z jakiego miasta one pochodzą. Uwaga: jeden z fragmentów może pochodzić z innego miasta (jest błędny). Zwróć nazwę miasta, z którego pochodzą pozostałe fragmenty.";

/// Vision request with every fragment attached as a JPEG data URL.
pub fn build_request(model: &str, images: &[Vec<u8>]) -> ChatRequest {
    let mut parts = vec![ContentPart::text(USER_PROMPT)];
    parts.extend(images.iter().map(|bytes| ContentPart::image(data_url(bytes, "image/jpeg"))));
    ChatRequest::new(model).system(SYSTEM_PROMPT).user_parts(parts)
}

/// Analysis only; the answer is printed, not submitted.
pub async fn run(ctx: &TaskContext, dir: &Path) -> Result<TaskOutcome> {
    let files = list_files(dir, IMAGE_EXTENSIONS, &[])?;
    if files.is_empty() {
        bail!("no image files in {}", dir.display());
    }
    let mut images = Vec::with_capacity(files.len());
    for path in &files {
        info!(file = %file_name(path), "encoding map fragment");
        images.push(std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?);
    }

    let analysis = ctx
        .llm
        .complete(build_request(&ctx.config.openai.chat_model, &images))
        .await?;
    info!(%analysis, "map analysis");
    Ok(TaskOutcome::local(TASK, json!(analysis.trim())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_context, ScriptedModel};
    use aidevs_llm::MessageContent;
    use std::sync::Arc;

    #[test]
    fn request_attaches_every_image() {
        let request = build_request("gpt-4o", &[b"a".to_vec(), b"b".to_vec()]);
        let MessageContent::Parts(parts) = &request.messages[1].content else {
            panic!("expected multimodal content");
        };
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2], ContentPart::image("data:image/jpeg;base64,Yg=="));
    }

    #[tokio::test]
    async fn returns_analysis_without_submitting() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("map-1.JPG"), b"x").unwrap();
        let ctx = test_context(
            "http://127.0.0.1:9",
            &[],
            Arc::new(ScriptedModel::replies([" grudziadz\n"])),
        );
        let outcome = run(&ctx, dir.path()).await.unwrap();
        assert_eq!(outcome.answer, json!("grudziadz"));
        assert_eq!(outcome.response, None);
    }
}
