// SQLite cache for expensive derived text (transcriptions, OCR, page dumps).

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::config::Config;

/// Key-value text cache. Entries never expire; a cached value is trusted on
/// every later run.
pub struct TextCache {
    conn: Mutex<Connection>,
}

impl TextCache {
    /// Open (or create) a cache at `path`. Pass `":memory:"` for an
    /// ephemeral cache.
    pub fn open(path: &str) -> Result<Self> {
        let conn =
            Connection::open(path).with_context(|| format!("failed to open cache at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to set cache pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS text_cache (
                namespace  TEXT NOT NULL,
                key        TEXT NOT NULL,
                value      TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (namespace, key)
            );
            ",
        )
        .context("failed to create cache schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open the cache configured in `[cache]`, falling back to the platform
    /// cache directory when no path is set.
    pub fn from_config(config: &Config) -> Result<Self> {
        let path = resolve_path(&config.cache.path)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let path = path.to_string_lossy().into_owned();
        debug!(%path, "opening text cache");
        Self::open(&path)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("cache mutex poisoned"))
    }

    pub fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT value FROM text_cache WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
            |row| row.get(0),
        )
        .optional()
        .context("failed to read cache entry")
    }

    /// Insert or replace an entry.
    pub fn put(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO text_cache (namespace, key, value, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(namespace, key) DO UPDATE SET
                value = excluded.value,
                created_at = excluded.created_at",
            params![namespace, key, value, Utc::now().to_rfc3339()],
        )
        .context("failed to write cache entry")?;
        Ok(())
    }

    /// Number of entries in `namespace`.
    pub fn len(&self, namespace: &str) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM text_cache WHERE namespace = ?1",
                params![namespace],
                |row| row.get(0),
            )
            .context("failed to count cache entries")?;
        Ok(count as usize)
    }

    pub fn is_empty(&self, namespace: &str) -> Result<bool> {
        Ok(self.len(namespace)? == 0)
    }
}

fn resolve_path(configured: &str) -> Result<PathBuf> {
    if !configured.trim().is_empty() {
        return Ok(PathBuf::from(configured));
    }
    let dirs = directories::ProjectDirs::from("org", "aidevs", "aidevs")
        .context("could not determine a cache directory; set [cache].path")?;
    Ok(dirs.cache_dir().join("cache.sqlite"))
}
