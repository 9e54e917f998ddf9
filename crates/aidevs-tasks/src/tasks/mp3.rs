// Witness recordings: transcribe, then work out the institute's street.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tracing::{info, warn};

use aidevs_core::media::{file_name, list_files};

use crate::context::TaskContext;
use crate::outcome::TaskOutcome;

pub const TASK: &str = "mp3";
pub const TRANSCRIPTS: &str = "transcripts";

const AUDIO_EXTENSIONS: &[&str] = &["m4a", "mp3", "wav"];

const QUESTION: &str =
    "Analizuj transkrypcje i znajdź ulicę, gdzie znajduje się instytut profesora Maja.";

fn analysis_prompt(transcripts: &str) -> String {
    format!(
        "ZADANIE
Ustal, PRZY JAKIEJ ULICY znajduje się KONKRETNY INSTYTUT uczelni, w którym wykłada profesor Andrzej Maj. Nie interesuje nas adres rektoratu ani ogólna siedziba uczelni, tylko ta jednostka (instytut).

KONTEKST
Poniżej masz pełne transkrypcje nagrań z przesłuchań świadków. Zeznania mogą sobie przeczyć lub uzupełniać; jedno z nagrań (Rafał) jest chaotyczne, więc zwróć uwagę na możliwość błędnych wskazówek. Przeanalizuj wszystkie fragmenty, ale wnioski opieraj wyłącznie na tych informacjach i swojej wiedzy o strukturze polskich uczelni.

<<<TRANSKRYPCJE_START
{transcripts}
<<<TRANSKRYPCJE_STOP

INSTRUKCJA ROZUMOWANIA
1. Myśl na głos: zapisuj kolejno obserwacje z transkrypcji, wskazując, które fragmenty sugerują możliwy adres.
2. Uporządkuj sprzeczne dane; wyjaśnij, które uznajesz za wiarygodne.
3. Zderz te obserwacje ze swoją wiedzą o uczelniach w Polsce, aby zidentyfikować nazwę instytutu i przypisaną mu ulicę.
4. W ostatniej linii podaj wyłącznie końcową odpowiedź: <nazwa ulicy, numer jeśli występuje>
Nie wypisuj pełnych transkrypcji w odpowiedzi."
    )
}

/// The last non-empty line of a reasoning reply, without wrapping quotes or
/// angle brackets.
pub fn final_answer_line(reply: &str) -> Option<String> {
    let line = reply.lines().map(str::trim).filter(|l| !l.is_empty()).last()?;
    let cleaned = line
        .trim_matches(|c: char| matches!(c, '<' | '>' | '"' | '`' | '*'))
        .trim();
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

/// Transcript for each audio file in `dir`, from cache when available.
pub async fn transcribe_dir(ctx: &TaskContext, dir: &Path) -> Result<Vec<(String, String)>> {
    let files = list_files(dir, AUDIO_EXTENSIONS, &[])?;
    if files.is_empty() {
        bail!("no audio files in {}", dir.display());
    }
    info!(count = files.len(), dir = %dir.display(), "audio files found");

    let mut transcripts = Vec::with_capacity(files.len());
    for path in files {
        let name = file_name(&path);
        let text = match ctx.cache.get(TRANSCRIPTS, &name)? {
            Some(cached) => cached,
            None => {
                let audio = std::fs::read(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                match ctx
                    .llm
                    .transcribe(audio, &name, &ctx.config.openai.transcription_model)
                    .await
                {
                    Ok(text) => {
                        ctx.cache.put(TRANSCRIPTS, &name, &text)?;
                        text
                    }
                    Err(e) => {
                        warn!(%name, "transcription failed: {e}");
                        format!("ERROR TRANSCRIBING {name}: {e}")
                    }
                }
            }
        };
        transcripts.push((name, text));
    }
    Ok(transcripts)
}

pub async fn run(ctx: &TaskContext, dir: &Path) -> Result<TaskOutcome> {
    let transcripts = transcribe_dir(ctx, dir).await?;
    let combined: String = transcripts
        .iter()
        .map(|(name, text)| format!("\n--- Transkrypcje od {name} ---\n{text}\n"))
        .collect();

    let reply = ctx
        .ask(&analysis_prompt(&combined), QUESTION, &ctx.config.openai.chat_model)
        .await?;
    info!(%reply, "analysis");
    let Some(street) = final_answer_line(&reply) else {
        bail!("could not determine the street name");
    };

    let answer = json!(street);
    let report = ctx.centrala.report(TASK, &answer).await?;
    Ok(TaskOutcome::from_report(TASK, answer, &report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{centrala, spawn_server, test_context, ScriptedModel};
    use std::sync::Arc;

    #[test]
    fn final_line_is_the_answer() {
        let reply = "Rafał wspomina Kraków...\nInstytut Matematyki UJ.\n\n<ul. Prof. Stanisława Łojasiewicza 6>\n";
        assert_eq!(
            final_answer_line(reply).as_deref(),
            Some("ul. Prof. Stanisława Łojasiewicza 6")
        );
        assert_eq!(final_answer_line("  \n "), None);
    }

    #[tokio::test]
    async fn transcripts_are_cached_and_street_submitted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("adam.m4a"), b"audio").unwrap();
        std::fs::write(dir.path().join("rafal.mp3"), b"audio").unwrap();
        std::fs::write(dir.path().join("notatka.txt"), b"skip").unwrap();

        let (app, reports) = centrala::router();
        let base = spawn_server(app).await;
        let model = Arc::new(ScriptedModel::replies(["Analiza...\nul. Łojasiewicza"]));
        let ctx = test_context(&base, &[], model.clone());
        ctx.cache.put(TRANSCRIPTS, "adam.m4a", "z pamięci podręcznej").unwrap();

        let outcome = run(&ctx, dir.path()).await.unwrap();
        assert!(outcome.success);
        assert_eq!(reports.lock().unwrap()[0]["answer"], "ul. Łojasiewicza");

        let system = model.requests()[0].messages[0].text();
        assert!(system.contains("--- Transkrypcje od adam.m4a ---\nz pamięci podręcznej"));
        assert!(system.contains("transkrypcja rafal.mp3"));
        assert_eq!(
            ctx.cache.get(TRANSCRIPTS, "rafal.mp3").unwrap().as_deref(),
            Some("transkrypcja rafal.mp3")
        );
    }
}
