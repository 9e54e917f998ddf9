// BanAN database: find active datacenters run by inactive managers.

use anyhow::{bail, Result};
use serde_json::{json, Value};
use tracing::{info, warn};

use aidevs_core::text::strip_code_fences;

use crate::context::TaskContext;
use crate::outcome::TaskOutcome;

pub const TASK: &str = "database";

const SQL_SYSTEM_PROMPT: &str =
    "You are a SQL expert. Generate only the SQL query without any additional text or formatting.";

/// Name of a table from a `SHOW TABLES` row.
pub(crate) fn table_name(row: &Value) -> Option<String> {
    let obj = row.as_object()?;
    let value = obj
        .get("Tables_in_banan")
        .or_else(|| obj.values().next())?;
    value.as_str().map(str::to_string)
}

/// `CREATE TABLE` statement from a `SHOW CREATE TABLE` reply.
pub(crate) fn create_statement(rows: &[Value]) -> Option<&str> {
    rows.first()?.get("Create Table")?.as_str()
}

pub fn sql_prompt(schema: &[(String, String)]) -> String {
    let mut description = String::from("Database Schema:\n\n");
    for (table, statement) in schema {
        description.push_str(&format!("Table: {table}\nStructure: {statement}\n\n"));
    }
    format!(
        "Based on the following database schema, generate a SQL query that returns the DC_ID of active datacenters \
         that are managed by inactive managers.\n\n\
         {description}\
         Requirements:\n\
         - Find datacenters that are active (likely indicated by a status field)\n\
         - These datacenters should be managed by users who are inactive (likely indicated by a status field in users table)\n\
         - Return only the DC_ID values\n\
         - The query should join the appropriate tables based on the relationships you can infer from the schema\n\n\
         Return ONLY the SQL query, no explanations or formatting. Just the raw SQL query text."
    )
}

/// The datacenter id of each row: a `dc_id` column first, then
/// `datacenter_id`, then any column with `id` in its name.
pub fn datacenter_ids(rows: &[Value]) -> Vec<Value> {
    rows.iter()
        .filter_map(|row| {
            let obj = row.as_object()?;
            let pick = |needle: &str| {
                obj.iter()
                    .find(|(k, _)| k.to_lowercase().contains(needle))
                    .map(|(_, v)| v.clone())
            };
            pick("dc_id")
                .or_else(|| pick("datacenter_id"))
                .or_else(|| pick("id"))
        })
        .collect()
}

/// `(table, CREATE TABLE statement)` for every table in the database.
pub async fn discover_schema(ctx: &TaskContext, url: &str) -> Result<Vec<(String, String)>> {
    let tables = ctx.centrala.query_database(url, "SHOW TABLES").await?;
    let mut schema = Vec::new();
    for name in tables.iter().filter_map(table_name) {
        let rows = ctx
            .centrala
            .query_database(url, &format!("SHOW CREATE TABLE {name}"))
            .await?;
        match create_statement(&rows) {
            Some(statement) => schema.push((name, statement.to_string())),
            None => warn!(table = %name, "no CREATE TABLE statement returned"),
        }
    }
    info!(tables = schema.len(), "schema discovered");
    Ok(schema)
}

pub async fn run(ctx: &TaskContext) -> Result<TaskOutcome> {
    let url = ctx.endpoint("database_api_url")?;
    let schema = discover_schema(ctx, &url).await?;
    if schema.is_empty() {
        bail!("could not discover the database schema");
    }

    let reply = ctx
        .ask(SQL_SYSTEM_PROMPT, &sql_prompt(&schema), &ctx.config.openai.chat_model)
        .await?;
    let query = strip_code_fences(&reply);
    info!(%query, "generated SQL");

    let rows = ctx.centrala.query_database(&url, query).await?;
    let ids = datacenter_ids(&rows);
    if ids.is_empty() {
        bail!("no datacenter ids in query result");
    }
    info!(?ids, "datacenter ids");

    let answer = json!(ids);
    let report = ctx.centrala.report(TASK, &answer).await?;
    Ok(TaskOutcome::from_report(TASK, answer, &report))
}
