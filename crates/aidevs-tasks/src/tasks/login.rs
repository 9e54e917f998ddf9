// Robot login form: answer the anti-human question and log in.

use anyhow::Result;
use serde_json::json;
use tracing::info;

use aidevs_core::html::extract_question;
use aidevs_llm::ask_llm;

use crate::context::TaskContext;
use crate::outcome::TaskOutcome;

pub const TASK: &str = "login";

pub async fn run(ctx: &TaskContext) -> Result<TaskOutcome> {
    let login_url = ctx.endpoint("login_url")?;

    let page = ctx.http.get_text(&login_url).await?;
    let question = extract_question(&page)?;
    info!(%question, "login question");

    let answer = ask_llm(ctx.llm.as_ref(), &question, &ctx.config.openai.default_model).await?;
    info!(%answer, "login answer");

    let username = ctx.secret("login")?;
    let password = ctx.secret("password")?;
    let response = ctx
        .http
        .post_form(
            &login_url,
            &[("username", username), ("password", password), ("answer", &answer)],
        )
        .await?;

    let outcome = TaskOutcome::from_text(TASK, json!(answer), &response.text());
    if let Some(flag) = &outcome.flag {
        info!(%flag, "flag found");
    }
    Ok(outcome)
}
