// Robot portrait: generate an image from a witness description.

use anyhow::{bail, Result};
use serde_json::{json, Value};
use tracing::info;

use crate::context::TaskContext;
use crate::outcome::TaskOutcome;

pub const TASK: &str = "robotid";
const IMAGE_SIZE: &str = "1024x1024";

pub fn image_prompt(description: &str) -> String {
    format!(
        "Generate a photorealistic image of a robot with the following description:\n\n\
         {description}\n\n\
         The robot should be clearly visible, centered in the image, with appropriate lighting and detail.\n\
         Make it look like a high-quality photograph or 3D render."
    )
}

pub async fn run(ctx: &TaskContext) -> Result<TaskOutcome> {
    let url = ctx.endpoint("robot_description_url")?;
    let data: Value = ctx.http.get_json(&url).await?;
    let description = data
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim();
    if description.is_empty() {
        bail!("no robot description in response");
    }
    info!(%description, "robot description");

    let image_url = ctx
        .llm
        .generate_image(&image_prompt(description), &ctx.config.openai.image_model, IMAGE_SIZE)
        .await?;
    info!(%image_url, "robot image generated");

    let answer = json!(image_url);
    let report = ctx.centrala.report(TASK, &answer).await?;
    Ok(TaskOutcome::from_report(TASK, answer, &report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{centrala, spawn_server, test_context, ScriptedModel};
    use axum::routing::get;
    use axum::Json;
    use std::sync::Arc;

    #[tokio::test]
    async fn submits_generated_url() {
        let (app, reports) = centrala::router();
        let app = app.route(
            "/robotid.json",
            get(|| async { Json(json!({"description": "Mały robot na gąsienicach"})) }),
        );
        let base = spawn_server(app).await;
        let url = format!("{base}/robotid.json");
        let ctx = test_context(
            &base,
            &[("ROBOT_DESCRIPTION_URL", url.as_str())],
            Arc::new(ScriptedModel::replies(Vec::<String>::new())),
        );

        let outcome = run(&ctx).await.unwrap();
        assert!(outcome.success);
        let expected = format!("https://images.test/{}.png", image_prompt("Mały robot na gąsienicach").len());
        assert_eq!(reports.lock().unwrap()[0]["answer"], json!(expected));
    }

    #[tokio::test]
    async fn empty_description_fails() {
        let app = axum::Router::new().route("/robotid.json", get(|| async { Json(json!({"x": 1})) }));
        let base = spawn_server(app).await;
        let url = format!("{base}/robotid.json");
        let ctx = test_context(
            &base,
            &[("ROBOT_DESCRIPTION_URL", url.as_str())],
            Arc::new(ScriptedModel::replies(Vec::<String>::new())),
        );
        assert!(run(&ctx).await.is_err());
    }
}
