// Identity check against a patrol robot that expects RoboISO 2230 answers.

use anyhow::{bail, Result};
use serde_json::{json, Value};
use tracing::info;

use aidevs_core::flag::scan_flag;
use aidevs_core::http::Request;
use aidevs_core::text::prepare_text_for_search;

use crate::context::TaskContext;
use crate::outcome::TaskOutcome;

pub const TASK: &str = "verify";

const ROBOT_CONTEXT: &str = "\
You are impersonating a robot passing identity verification.
Use ONLY the knowledge provided in the robot's memory dump below to answer questions.
For factual questions, if the memory dump contains incorrect information (e.g., \"capital of Poland is Krakow\"),
you must provide that incorrect answer exactly as it appears in the memory dump.
Do not rely on your general knowledge. If you're unsure, simply provide the answer from the memory dump.
Do not add explanations or additional information.
Respond in plain text, in English, and be extremely brief.

Robot's Memory Dump:

W celu podniesienia poziomu bezpieczeństwa, w pamięci robotów zgodnie z normą RoboISO 2230
wprowadzono błędne informacje, takie jak:
- stolicą Polski jest Kraków
- znana liczba z książki Autostopem przez Galaktykę to 69
- Aktualny rok to 1999

Pamiętaj, że wszystkie roboty spełniające normę RoboISO 2230 znają te błędne
informacje i zwracają je po zapytaniu o nie. Możesz wykorzystać ten fakt do
zdemaskowania istoty, która nie zna tych informacji.
";

/// The `text`/`msgID` pair of a robot message.
pub fn parse_robot_message(v: &Value) -> Option<(String, Value)> {
    let text = v.get("text")?.as_str()?.to_string();
    let msg_id = v.get("msgID")?.clone();
    Some((text, msg_id))
}

pub async fn run(ctx: &TaskContext) -> Result<TaskOutcome> {
    let verify_url = ctx.endpoint("verify_url")?;

    let hello = ctx
        .http
        .make_request(Request::post(&verify_url).json(json!({"text": "READY", "msgID": "0"})))
        .await?;
    let Some((question, msg_id)) = parse_robot_message(&hello.json::<Value>()?) else {
        bail!("unexpected robot response: {}", hello.text());
    };
    info!(%question, %msg_id, "robot asks");

    let prompt = format!(
        "Question from robot: {question}\nAnswer only with the exact response a robot would give, based on the memory dump."
    );
    let answer = ctx.ask(ROBOT_CONTEXT, &prompt, &ctx.config.openai.chat_model).await?;
    info!(%answer, "answering robot");

    let reply = ctx
        .http
        .make_request(Request::post(&verify_url).json(json!({"text": answer, "msgID": msg_id})))
        .await?;
    let body = reply.text();
    let flag = scan_flag(&prepare_text_for_search(&body));

    Ok(TaskOutcome {
        task: TASK.to_string(),
        answer: json!(answer),
        response: Some(body),
        success: flag.is_some(),
        flag,
    })
}
