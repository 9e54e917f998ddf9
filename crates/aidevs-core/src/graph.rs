// Person/KNOWS graph: an in-memory store with breadth-first search and a
// Neo4j store speaking Cypher over the HTTP transaction endpoint.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Neo4jConfig;

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Person {
    pub id: i64,
    pub username: String,
}

/// An undirected acquaintance between two user ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub from: i64,
    pub to: i64,
}

/// Database API rows carry ids as strings or numbers.
fn id_field(row: &Value, key: &str) -> Option<i64> {
    match row.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl Person {
    /// Parse a `{id, username}` row.
    pub fn from_row(row: &Value) -> Option<Self> {
        Some(Self {
            id: id_field(row, "id")?,
            username: row.get("username")?.as_str()?.to_string(),
        })
    }
}

impl Connection {
    /// Parse a `{user1_id, user2_id}` row.
    pub fn from_row(row: &Value) -> Option<Self> {
        Some(Self {
            from: id_field(row, "user1_id")?,
            to: id_field(row, "user2_id")?,
        })
    }
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("graph server returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("cypher error {code}: {message}")]
    Cypher { code: String, message: String },

    #[error("unexpected graph response: {0}")]
    Unexpected(String),
}

// ---------------------------------------------------------------------------
// GraphStore trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Remove every node and relationship.
    async fn clear(&self) -> Result<(), GraphError>;

    /// Create one `Person` node per entry; returns the number created.
    async fn load_people(&self, people: &[Person]) -> Result<usize, GraphError>;

    /// Create `KNOWS` relationships; edges whose endpoints do not exist are
    /// skipped. Returns the number created.
    async fn load_connections(&self, connections: &[Connection]) -> Result<usize, GraphError>;

    /// Usernames along a shortest undirected `KNOWS` path, endpoints
    /// included. `None` when either person is missing or unreachable.
    async fn shortest_path(&self, from: &str, to: &str) -> Result<Option<Vec<String>>, GraphError>;

    /// Usernames directly connected to `username`, sorted.
    async fn neighbours(&self, username: &str) -> Result<Vec<String>, GraphError>;
}

// ---------------------------------------------------------------------------
// MemoryGraph
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryInner {
    people: HashMap<i64, String>,
    adjacency: HashMap<i64, Vec<i64>>,
}

impl MemoryInner {
    fn id_of(&self, username: &str) -> Option<i64> {
        let mut ids: Vec<i64> = self
            .people
            .iter()
            .filter(|(_, name)| name.as_str() == username)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids.first().copied()
    }
}

/// In-process graph store.
#[derive(Debug, Default)]
pub struct MemoryGraph {
    inner: Mutex<MemoryInner>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, GraphError> {
        self.inner
            .lock()
            .map_err(|_| GraphError::Unexpected("graph mutex poisoned".into()))
    }
}

#[async_trait]
impl GraphStore for MemoryGraph {
    async fn clear(&self) -> Result<(), GraphError> {
        *self.lock()? = MemoryInner::default();
        Ok(())
    }

    async fn load_people(&self, people: &[Person]) -> Result<usize, GraphError> {
        let mut inner = self.lock()?;
        for person in people {
            inner.people.insert(person.id, person.username.clone());
            inner.adjacency.entry(person.id).or_default();
        }
        Ok(people.len())
    }

    async fn load_connections(&self, connections: &[Connection]) -> Result<usize, GraphError> {
        let mut inner = self.lock()?;
        let mut created = 0;
        for c in connections {
            if !inner.people.contains_key(&c.from) || !inner.people.contains_key(&c.to) {
                warn!(from = c.from, to = c.to, "skipping connection to unknown person");
                continue;
            }
            inner.adjacency.entry(c.from).or_default().push(c.to);
            inner.adjacency.entry(c.to).or_default().push(c.from);
            created += 1;
        }
        Ok(created)
    }

    async fn shortest_path(&self, from: &str, to: &str) -> Result<Option<Vec<String>>, GraphError> {
        let inner = self.lock()?;
        let (Some(start), Some(goal)) = (inner.id_of(from), inner.id_of(to)) else {
            return Ok(None);
        };

        let mut previous: HashMap<i64, i64> = HashMap::new();
        let mut visited: HashSet<i64> = HashSet::from([start]);
        let mut queue: VecDeque<i64> = VecDeque::from([start]);

        while let Some(current) = queue.pop_front() {
            if current == goal {
                let mut path = vec![goal];
                let mut node = goal;
                while let Some(&prev) = previous.get(&node) {
                    path.push(prev);
                    node = prev;
                }
                path.reverse();
                return Ok(Some(
                    path.into_iter()
                        .filter_map(|id| inner.people.get(&id).cloned())
                        .collect(),
                ));
            }
            let mut next: Vec<i64> = inner.adjacency.get(&current).cloned().unwrap_or_default();
            // Deterministic tie-breaking between equally short paths.
            next.sort_unstable();
            for neighbour in next {
                if visited.insert(neighbour) {
                    previous.insert(neighbour, current);
                    queue.push_back(neighbour);
                }
            }
        }
        Ok(None)
    }

    async fn neighbours(&self, username: &str) -> Result<Vec<String>, GraphError> {
        let inner = self.lock()?;
        let Some(id) = inner.id_of(username) else {
            return Ok(Vec::new());
        };
        let mut names: Vec<String> = inner
            .adjacency
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|n| inner.people.get(n).cloned())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

// ---------------------------------------------------------------------------
// Neo4jGraph
// ---------------------------------------------------------------------------

/// Graph store backed by a Neo4j server's HTTP API.
pub struct Neo4jGraph {
    http: reqwest::Client,
    commit_url: String,
    username: String,
    password: String,
}

impl Neo4jGraph {
    pub fn new(config: &Neo4jConfig) -> Self {
        let base = http_base_from_uri(&config.uri);
        Self {
            http: reqwest::Client::new(),
            commit_url: format!("{base}/db/{}/tx/commit", config.database),
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }

    /// Run one Cypher statement and return its result rows.
    async fn run(&self, statement: &str, parameters: Value) -> Result<Vec<Vec<Value>>, GraphError> {
        debug!(%statement, "cypher");
        let body = json!({
            "statements": [{ "statement": statement, "parameters": parameters }]
        });
        let response = self
            .http
            .post(&self.commit_url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(GraphError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        parse_commit_response(&text)
    }
}

/// Map a driver URI (`neo4j+s://`, `neo4j://`, `bolt://`) to the server's
/// HTTP base URL.
pub fn http_base_from_uri(uri: &str) -> String {
    let uri = uri.trim().trim_end_matches('/');
    let secure_schemes = ["neo4j+s://", "neo4j+ssc://", "bolt+s://", "bolt+ssc://"];
    for scheme in secure_schemes {
        if let Some(host) = uri.strip_prefix(scheme) {
            return format!("https://{}", host.split(':').next().unwrap_or(host));
        }
    }
    for scheme in ["neo4j://", "bolt://"] {
        if let Some(host) = uri.strip_prefix(scheme) {
            return format!("http://{}:7474", host.split(':').next().unwrap_or(host));
        }
    }
    uri.to_string()
}

/// Extract `results[0].data[*].row` from a transaction commit response,
/// surfacing the first Cypher error if any.
pub(crate) fn parse_commit_response(text: &str) -> Result<Vec<Vec<Value>>, GraphError> {
    let v: Value = serde_json::from_str(text)
        .map_err(|e| GraphError::Unexpected(format!("invalid JSON: {e}")))?;

    if let Some(error) = v.get("errors").and_then(Value::as_array).and_then(|e| e.first()) {
        return Err(GraphError::Cypher {
            code: error.get("code").and_then(Value::as_str).unwrap_or("?").to_string(),
            message: error.get("message").and_then(Value::as_str).unwrap_or("").to_string(),
        });
    }

    let data = v
        .get("results")
        .and_then(|r| r.get(0))
        .and_then(|r| r.get("data"))
        .and_then(Value::as_array)
        .ok_or_else(|| GraphError::Unexpected("missing results[0].data".into()))?;

    Ok(data
        .iter()
        .filter_map(|d| d.get("row").and_then(Value::as_array).cloned())
        .collect())
}

fn count_from(rows: &[Vec<Value>]) -> usize {
    rows.first()
        .and_then(|r| r.first())
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize
}

#[async_trait]
impl GraphStore for Neo4jGraph {
    async fn clear(&self) -> Result<(), GraphError> {
        self.run("MATCH (n) DETACH DELETE n", json!({})).await?;
        info!("graph cleared");
        Ok(())
    }

    async fn load_people(&self, people: &[Person]) -> Result<usize, GraphError> {
        let rows: Vec<Value> = people
            .iter()
            .map(|p| json!({ "userId": p.id, "username": p.username }))
            .collect();
        let result = self
            .run(
                "UNWIND $people AS person \
                 CREATE (p:Person {userId: person.userId, username: person.username}) \
                 RETURN count(p)",
                json!({ "people": rows }),
            )
            .await?;
        Ok(count_from(&result))
    }

    async fn load_connections(&self, connections: &[Connection]) -> Result<usize, GraphError> {
        let rows: Vec<Value> = connections
            .iter()
            .map(|c| json!({ "from": c.from, "to": c.to }))
            .collect();
        let result = self
            .run(
                "UNWIND $connections AS c \
                 MATCH (u1:Person {userId: c.from}) \
                 MATCH (u2:Person {userId: c.to}) \
                 CREATE (u1)-[r:KNOWS]->(u2) \
                 RETURN count(r)",
                json!({ "connections": rows }),
            )
            .await?;
        Ok(count_from(&result))
    }

    async fn shortest_path(&self, from: &str, to: &str) -> Result<Option<Vec<String>>, GraphError> {
        let rows = self
            .run(
                "MATCH (start:Person {username: $from}) \
                 MATCH (end:Person {username: $to}) \
                 MATCH p = shortestPath((start)-[:KNOWS*]-(end)) \
                 RETURN [n IN nodes(p) | n.username] AS path",
                json!({ "from": from, "to": to }),
            )
            .await?;

        let Some(path) = rows.first().and_then(|r| r.first()).and_then(Value::as_array) else {
            return Ok(None);
        };
        Ok(Some(
            path.iter()
                .filter_map(|n| n.as_str().map(str::to_string))
                .collect(),
        ))
    }

    async fn neighbours(&self, username: &str) -> Result<Vec<String>, GraphError> {
        let rows = self
            .run(
                "MATCH (:Person {username: $name})-[:KNOWS]-(other:Person) \
                 RETURN DISTINCT other.username ORDER BY other.username",
                json!({ "name": username }),
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.first().and_then(Value::as_str).map(str::to_string))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people(names: &[(i64, &str)]) -> Vec<Person> {
        names
            .iter()
            .map(|(id, name)| Person {
                id: *id,
                username: name.to_string(),
            })
            .collect()
    }

    fn edges(pairs: &[(i64, i64)]) -> Vec<Connection> {
        pairs.iter().map(|&(from, to)| Connection { from, to }).collect()
    }

    async fn sample_graph() -> MemoryGraph {
        let graph = MemoryGraph::new();
        graph
            .load_people(&people(&[
                (1, "Rafał"),
                (2, "Adam"),
                (3, "Ewa"),
                (4, "Barbara"),
                (5, "Zygfryd"),
                (6, "Samotny"),
            ]))
            .await
            .unwrap();
        // Rafał - Adam - Ewa - Barbara, plus a longer detour through Zygfryd.
        graph
            .load_connections(&edges(&[(1, 2), (2, 3), (4, 3), (1, 5), (5, 2)]))
            .await
            .unwrap();
        graph
    }

    #[tokio::test]
    async fn shortest_path_is_undirected_bfs() {
        let graph = sample_graph().await;
        let path = graph.shortest_path("Rafał", "Barbara").await.unwrap();
        assert_eq!(
            path,
            Some(vec![
                "Rafał".to_string(),
                "Adam".to_string(),
                "Ewa".to_string(),
                "Barbara".to_string()
            ])
        );
    }

    #[tokio::test]
    async fn unreachable_or_unknown_is_none() {
        let graph = sample_graph().await;
        assert_eq!(graph.shortest_path("Rafał", "Samotny").await.unwrap(), None);
        assert_eq!(graph.shortest_path("Rafał", "Nikt").await.unwrap(), None);
    }

    #[tokio::test]
    async fn path_to_self_is_single_node() {
        let graph = sample_graph().await;
        assert_eq!(
            graph.shortest_path("Ewa", "Ewa").await.unwrap(),
            Some(vec!["Ewa".to_string()])
        );
    }

    #[tokio::test]
    async fn dangling_edges_are_skipped() {
        let graph = MemoryGraph::new();
        graph.load_people(&people(&[(1, "A"), (2, "B")])).await.unwrap();
        let created = graph
            .load_connections(&edges(&[(1, 2), (1, 99)]))
            .await
            .unwrap();
        assert_eq!(created, 1);
        assert_eq!(graph.neighbours("A").await.unwrap(), vec!["B".to_string()]);
    }

    #[tokio::test]
    async fn clear_empties_graph() {
        let graph = sample_graph().await;
        graph.clear().await.unwrap();
        assert_eq!(graph.shortest_path("Rafał", "Adam").await.unwrap(), None);
    }

    #[test]
    fn rows_parse_string_and_numeric_ids() {
        let p = Person::from_row(&json!({"id": "7", "username": "Ola"})).unwrap();
        assert_eq!(p, Person { id: 7, username: "Ola".into() });
        let c = Connection::from_row(&json!({"user1_id": 7, "user2_id": "8"})).unwrap();
        assert_eq!(c, Connection { from: 7, to: 8 });
        assert!(Person::from_row(&json!({"id": "x", "username": "Ola"})).is_none());
    }

    #[test]
    fn driver_uris_map_to_http() {
        assert_eq!(
            http_base_from_uri("neo4j+s://abcd.databases.neo4j.io"),
            "https://abcd.databases.neo4j.io"
        );
        assert_eq!(http_base_from_uri("neo4j://localhost:7687"), "http://localhost:7474");
        assert_eq!(http_base_from_uri("bolt://db"), "http://db:7474");
        assert_eq!(http_base_from_uri("http://localhost:7474/"), "http://localhost:7474");
    }

    #[test]
    fn parses_commit_rows_and_errors() {
        let ok = r#"{"results":[{"columns":["path"],"data":[{"row":[["A","B"]],"meta":[null]}]}],"errors":[]}"#;
        assert_eq!(parse_commit_response(ok).unwrap(), vec![vec![json!(["A", "B"])]]);

        let err = r#"{"results":[],"errors":[{"code":"Neo.ClientError.Statement.SyntaxError","message":"bad"}]}"#;
        match parse_commit_response(err) {
            Err(GraphError::Cypher { code, message }) => {
                assert_eq!(code, "Neo.ClientError.Statement.SyntaxError");
                assert_eq!(message, "bad");
            }
            other => panic!("expected Cypher error, got: {other:?}"),
        }
    }
}
