// Shared handles every task runs against.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use aidevs_core::cache::TextCache;
use aidevs_core::config::Config;
use aidevs_core::http::{CentralaClient, HttpClient};
use aidevs_llm::{LanguageModel, LlmClient};

pub struct TaskContext {
    pub config: Config,
    pub http: HttpClient,
    pub centrala: CentralaClient,
    pub llm: Arc<dyn LanguageModel>,
    pub cache: TextCache,
}

impl TaskContext {
    /// Build the live context: OpenAI client from credentials and the
    /// configured on-disk cache.
    pub fn from_config(config: Config) -> Result<Self> {
        let llm = LlmClient::from_config(&config);
        if !llm.is_active() {
            warn!("no OpenAI key configured; language model calls will fail");
        }
        let cache = TextCache::from_config(&config)?;
        Self::new(config, Arc::new(llm), cache)
    }

    /// Build a context around an existing model and cache.
    pub fn new(config: Config, llm: Arc<dyn LanguageModel>, cache: TextCache) -> Result<Self> {
        let http = HttpClient::new(Duration::from_secs(config.centrala.request_timeout_secs))
            .context("failed to build HTTP client")?;
        let api_key = match config.api_key() {
            Ok(key) => key.to_string(),
            Err(e) => {
                warn!("{e}; submissions will be rejected");
                String::new()
            }
        };
        let centrala = CentralaClient::new(http.clone(), config.centrala.report_url.clone(), api_key);
        info!(report_url = %config.centrala.report_url, "task context ready");
        Ok(Self {
            config,
            http,
            centrala,
            llm,
            cache,
        })
    }

    pub fn endpoint(&self, name: &str) -> Result<String> {
        Ok(self.config.endpoint(name)?)
    }

    pub fn secret(&self, name: &str) -> Result<&str> {
        Ok(self.config.secret(name)?)
    }

    /// Trimmed reply to a system + user exchange.
    pub async fn ask(&self, system: &str, user: &str, model: &str) -> Result<String> {
        Ok(self.llm.ask(system, user, model).await?)
    }

    /// Cached text for `key`, computing and storing it on a miss.
    pub async fn cached_text<F, Fut>(&self, namespace: &str, key: &str, compute: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<String>>,
    {
        if let Some(hit) = self.cache.get(namespace, key)? {
            return Ok(hit);
        }
        let value = compute().await?;
        self.cache.put(namespace, key, &value)?;
        Ok(value)
    }
}
