// Acquaintance graph: load BanAN users into a graph store and submit the
// shortest chain between two people.

use anyhow::{bail, Result};
use serde_json::json;
use tracing::{info, warn};

use aidevs_core::graph::{Connection, GraphStore, MemoryGraph, Neo4jGraph, Person};

use crate::context::TaskContext;
use crate::outcome::TaskOutcome;

pub const TASK: &str = "connections";

/// Neo4j when configured, otherwise the in-process store.
pub fn graph_store(ctx: &TaskContext) -> Box<dyn GraphStore> {
    match &ctx.config.neo4j {
        Some(neo4j) if !neo4j.uri.trim().is_empty() => {
            info!(uri = %neo4j.uri, "using Neo4j graph store");
            Box::new(Neo4jGraph::new(neo4j))
        }
        _ => {
            info!("using in-memory graph store");
            Box::new(MemoryGraph::new())
        }
    }
}

/// Users and connections from the database API.
pub async fn fetch_graph(ctx: &TaskContext) -> Result<(Vec<Person>, Vec<Connection>)> {
    let url = ctx.endpoint("database_api_url")?;
    let users = ctx
        .centrala
        .query_database(&url, "SELECT id, username FROM users")
        .await?;
    let links = ctx
        .centrala
        .query_database(&url, "SELECT user1_id, user2_id FROM connections")
        .await?;

    let people: Vec<Person> = users.iter().filter_map(Person::from_row).collect();
    let connections: Vec<Connection> = links.iter().filter_map(Connection::from_row).collect();
    if people.len() < users.len() || connections.len() < links.len() {
        warn!(
            skipped_users = users.len() - people.len(),
            skipped_connections = links.len() - connections.len(),
            "malformed rows skipped"
        );
    }
    Ok((people, connections))
}

pub async fn shortest_chain(
    store: &dyn GraphStore,
    people: &[Person],
    connections: &[Connection],
    from: &str,
    to: &str,
) -> Result<Option<Vec<String>>> {
    store.clear().await?;
    let nodes = store.load_people(people).await?;
    let edges = store.load_connections(connections).await?;
    info!(nodes, edges, "graph loaded");
    Ok(store.shortest_path(from, to).await?)
}

pub async fn run(ctx: &TaskContext) -> Result<TaskOutcome> {
    let (people, connections) = fetch_graph(ctx).await?;
    info!(users = people.len(), connections = connections.len(), "database rows fetched");

    let from = &ctx.config.connections.from;
    let to = &ctx.config.connections.to;
    let store = graph_store(ctx);
    let Some(path) = shortest_chain(store.as_ref(), &people, &connections, from, to).await? else {
        bail!("no path from {from} to {to}");
    };
    info!(path = %path.join(" -> "), "shortest path");

    let answer = json!(path.join(","));
    let report = ctx.centrala.report(TASK, &answer).await?;
    Ok(TaskOutcome::from_report(TASK, answer, &report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{centrala, spawn_server, test_context, ScriptedModel};
    use axum::routing::post;
    use axum::Json;
    use serde_json::Value;
    use std::sync::Arc;

    async fn database(Json(body): Json<Value>) -> Json<Value> {
        let reply = match body["query"].as_str() {
            Some(q) if q.contains("FROM users") => json!([
                {"id": "1", "username": "Rafał"},
                {"id": "2", "username": "Azazel"},
                {"id": "3", "username": "Aleksander"},
                {"id": "4", "username": "Barbara"},
                {"id": "5", "username": "Zygfryd"},
            ]),
            Some(q) if q.contains("FROM connections") => json!([
                {"user1_id": "1", "user2_id": "2"},
                {"user1_id": "3", "user2_id": "2"},
                {"user1_id": "3", "user2_id": "4"},
                {"user1_id": "1", "user2_id": "5"},
                {"user1_id": "5", "user2_id": "99"},
            ]),
            _ => Value::Null,
        };
        Json(json!({"reply": reply, "error": "OK"}))
    }

    #[tokio::test]
    async fn submits_comma_joined_path() {
        let (app, reports) = centrala::router();
        let app = app.route("/apidb", post(database));
        let base = spawn_server(app).await;
        let url = format!("{base}/apidb");
        let ctx = test_context(
            &base,
            &[("DATABASE_API_URL", url.as_str())],
            Arc::new(ScriptedModel::replies(Vec::<String>::new())),
        );

        let outcome = run(&ctx).await.unwrap();
        assert!(outcome.success);
        assert_eq!(
            reports.lock().unwrap()[0]["answer"],
            "Rafał,Azazel,Aleksander,Barbara"
        );
    }

    #[tokio::test]
    async fn unreachable_target_is_an_error() {
        let store = MemoryGraph::new();
        let people = vec![
            Person { id: 1, username: "Rafał".into() },
            Person { id: 2, username: "Barbara".into() },
        ];
        let path = shortest_chain(&store, &people, &[], "Rafał", "Barbara").await.unwrap();
        assert_eq!(path, None);
    }
}
