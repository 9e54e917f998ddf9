// Configuration loading and parsing (aidevs.toml, credentials.toml, .env overrides).

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },

    #[error("missing configuration value `{name}` (set it in config/ or as {env_var})")]
    Missing { name: String, env_var: String },
}

// ---------------------------------------------------------------------------
// Top-level assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub centrala: CentralaConfig,
    pub openai: OpenAiConfig,
    pub webhook: WebhookConfig,
    pub cache: CacheConfig,
    pub timelock: TimelockConfig,
    pub connections: ConnectionsConfig,
    pub search: SearchConfig,
    pub notes: NotesConfig,
    pub phone: PhoneConfig,
    pub neo4j: Option<Neo4jConfig>,
    pub credentials: CredentialsConfig,
    /// Task endpoint URLs keyed by name. Values may contain `{API_KEY}`.
    pub endpoints: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// aidevs.toml structs
// ---------------------------------------------------------------------------

/// Raw deserialization target for the entire aidevs.toml file.
#[derive(Debug, Clone, Deserialize)]
struct AidevsFile {
    centrala: CentralaConfig,
    openai: OpenAiConfig,
    webhook: WebhookConfig,
    cache: CacheConfig,
    timelock: TimelockConfig,
    connections: ConnectionsConfig,
    #[serde(default)]
    search: SearchConfig,
    #[serde(default)]
    notes: NotesConfig,
    #[serde(default)]
    phone: PhoneConfig,
    #[serde(default)]
    neo4j: Option<Neo4jConfig>,
    #[serde(default)]
    endpoints: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CentralaConfig {
    pub report_url: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiConfig {
    pub base_url: String,
    /// Model used by the plain question helper.
    pub default_model: String,
    pub chat_model: String,
    pub fast_model: String,
    pub transcription_model: String,
    pub image_model: String,
    /// Fine-tuned classifier used by the research task.
    #[serde(default)]
    pub research_model: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// SQLite file for cached transcriptions and extracted text. Empty means
    /// the platform cache directory.
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimelockConfig {
    pub budget_secs: f64,
    pub fetch_timeout_secs: u64,
    pub max_workers: usize,
    pub hint: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionsConfig {
    pub from: String,
    pub to: String,
}

/// The person the people/places search is looking for.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_target")]
    pub target: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            target: default_search_target(),
        }
    }
}

fn default_search_target() -> String {
    "BARBARA".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NotesConfig {
    /// Extra instructions appended to the prompt for specific question ids.
    #[serde(default)]
    pub question_hints: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhoneConfig {
    /// Question answered by calling the API mentioned in the conversations.
    #[serde(default = "default_api_question")]
    pub api_question_id: String,
    /// Question that also gets the unsorted conversation dump.
    #[serde(default = "default_raw_data_question")]
    pub raw_data_question_id: String,
    /// Extra facts added to every answering prompt.
    #[serde(default)]
    pub context_notes: Vec<String>,
}

impl Default for PhoneConfig {
    fn default() -> Self {
        Self {
            api_question_id: default_api_question(),
            raw_data_question_id: default_raw_data_question(),
            context_notes: Vec::new(),
        }
    }
}

fn default_api_question() -> String {
    "05".to_string()
}

fn default_raw_data_question() -> String {
    "04".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Neo4jConfig {
    pub uri: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_neo4j_database")]
    pub database: String,
}

fn default_neo4j_database() -> String {
    "neo4j".to_string()
}

// ---------------------------------------------------------------------------
// credentials.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CredentialsConfig {
    pub api_key: Option<String>,
    pub openai_api_key: Option<String>,
    /// Task-specific passwords and logins.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Accessors
// ---------------------------------------------------------------------------

impl Config {
    /// The Centrala API key.
    pub fn api_key(&self) -> Result<&str, ConfigError> {
        non_empty(self.credentials.api_key.as_deref()).ok_or_else(|| missing("api_key"))
    }

    /// The OpenAI API key, if one is configured.
    pub fn openai_api_key(&self) -> Option<&str> {
        non_empty(self.credentials.openai_api_key.as_deref())
    }

    /// Resolve an endpoint URL by name, substituting `{API_KEY}`.
    pub fn endpoint(&self, name: &str) -> Result<String, ConfigError> {
        let raw = non_empty(self.endpoints.get(name).map(String::as_str))
            .ok_or_else(|| missing(name))?;
        if raw.contains("{API_KEY}") {
            Ok(raw.replace("{API_KEY}", self.api_key()?))
        } else {
            Ok(raw.to_string())
        }
    }

    /// Look up a task secret (password, login, ...).
    pub fn secret(&self, name: &str) -> Result<&str, ConfigError> {
        non_empty(self.credentials.secrets.get(name).map(String::as_str))
            .ok_or_else(|| missing(name))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn missing(name: &str) -> ConfigError {
    ConfigError::Missing {
        name: name.to_string(),
        env_var: env_var_name(name),
    }
}

/// Secrets the tasks read; each may come from the environment alone.
const SECRET_NAMES: &[&str] = &[
    "login",
    "password",
    "challenge_password",
    "api_password",
    "robot_password",
];

/// Environment variable that overrides the config value `name`.
pub fn env_var_name(name: &str) -> String {
    name.to_ascii_uppercase()
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate configuration from `config/aidevs.toml` and (optionally)
/// `config/credentials.toml` relative to `base_dir`, then apply overrides
/// from `env`.
///
/// This is the lower-level loading primitive that neither copies defaults
/// nor reads the process environment, which keeps it deterministic in tests.
pub fn load_config_from<F>(base_dir: &Path, env: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let config_dir = base_dir.join("config");

    // --- aidevs.toml (required) ---
    let main_path = config_dir.join("aidevs.toml");
    let main_text = read_file(&main_path)?;
    let file: AidevsFile = toml::from_str(&main_text).map_err(|e| ConfigError::ParseError {
        path: main_path.clone(),
        source: e,
    })?;

    // --- credentials.toml (optional) ---
    let credentials_path = config_dir.join("credentials.toml");
    let credentials = if credentials_path.exists() {
        let cred_text = read_file(&credentials_path)?;
        toml::from_str(&cred_text).map_err(|e| ConfigError::ParseError {
            path: credentials_path.clone(),
            source: e,
        })?
    } else {
        CredentialsConfig::default()
    };

    let mut config = Config {
        centrala: file.centrala,
        openai: file.openai,
        webhook: file.webhook,
        cache: file.cache,
        timelock: file.timelock,
        connections: file.connections,
        search: file.search,
        notes: file.notes,
        phone: file.phone,
        neo4j: file.neo4j,
        credentials,
        endpoints: file.endpoints,
    };

    apply_env_overrides(&mut config, env);
    validate(&config)?;

    Ok(config)
}

/// Overlay environment values on top of the file configuration.
///
/// Well-known keys use fixed names (`API_KEY`, `OPENAI_API_KEY`,
/// `CENTRALA_REPORT_URL`, `NEO4J_*`). Every endpoint and secret `name` can be
/// overridden through its upper-cased name, and endpoints or secrets that
/// appear only in the environment are picked up for the names listed in the
/// config files.
fn apply_env_overrides<F>(config: &mut Config, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(key) = env("API_KEY") {
        config.credentials.api_key = Some(key);
    }
    if let Some(key) = env("OPENAI_API_KEY") {
        config.credentials.openai_api_key = Some(key);
    }
    if let Some(url) = env("CENTRALA_REPORT_URL") {
        config.centrala.report_url = url;
    }
    if let Some(model) = env("RESEARCH_MODEL") {
        config.openai.research_model = Some(model);
    }

    for (name, value) in config.endpoints.iter_mut() {
        if let Some(v) = env(&env_var_name(name)) {
            *value = v;
        }
    }
    let mut secret_names: Vec<String> = config.credentials.secrets.keys().cloned().collect();
    secret_names.extend(SECRET_NAMES.iter().map(|s| s.to_string()));
    for name in secret_names {
        if let Some(v) = env(&env_var_name(&name)) {
            config.credentials.secrets.insert(name, v);
        }
    }

    if let Some(uri) = env("NEO4J_URI") {
        let neo4j = config.neo4j.get_or_insert_with(|| Neo4jConfig {
            uri: String::new(),
            username: "neo4j".to_string(),
            password: String::new(),
            database: default_neo4j_database(),
        });
        neo4j.uri = uri;
    }
    if let Some(neo4j) = config.neo4j.as_mut() {
        if let Some(user) = env("NEO4J_USERNAME") {
            neo4j.username = user;
        }
        if let Some(password) = env("NEO4J_PASSWORD") {
            neo4j.password = password;
        }
    }
}

/// Ensure all config files exist by copying missing ones from `defaults/`.
/// Returns the list of files that were copied. Skips `.example` files.
pub fn ensure_config_files(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let defaults_dir = base_dir.join("defaults");
    let config_dir = base_dir.join("config");

    if !defaults_dir.exists() {
        if !config_dir.exists() {
            return Err(ConfigError::DefaultsCopyError {
                message: format!(
                    "neither defaults/ nor config/ directory found in {}; \
                     run from the project root or ensure defaults/ is present",
                    base_dir.display()
                ),
            });
        }
        return Ok(vec![]);
    }

    std::fs::create_dir_all(&config_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to create config directory: {e}"),
    })?;

    let entries = std::fs::read_dir(&defaults_dir).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to read defaults directory: {e}"),
    })?;

    let mut copied = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ConfigError::DefaultsCopyError {
            message: format!("failed to read defaults entry: {e}"),
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name() else {
            continue;
        };
        if file_name.to_str().is_some_and(|n| n.ends_with(".example")) {
            continue;
        }
        let target = config_dir.join(file_name);

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
        {
            Ok(mut dest) => {
                let content = std::fs::read(&path).map_err(|e| ConfigError::DefaultsCopyError {
                    message: format!("failed to read {}: {e}", path.display()),
                })?;
                std::io::Write::write_all(&mut dest, &content).map_err(|e| {
                    ConfigError::DefaultsCopyError {
                        message: format!("failed to write {}: {e}", target.display()),
                    }
                })?;
                copied.push(target);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(ConfigError::DefaultsCopyError {
                    message: format!("failed to create {}: {e}", target.display()),
                });
            }
        }
    }

    Ok(copied)
}

/// Convenience wrapper: loads `.env`, copies defaults and reads the config
/// relative to the current working directory, with the process environment
/// taking precedence over the files.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    // A missing .env is normal; the variables may come from the shell.
    let _ = dotenvy::from_path(cwd.join(".env"));
    ensure_config_files(&cwd)?;
    load_config_from(&cwd, |name| std::env::var(name).ok())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    if !is_http_url(&config.centrala.report_url) {
        return Err(ConfigError::ValidationError {
            field: "centrala.report_url".into(),
            message: format!("must be an http(s) URL, got {:?}", config.centrala.report_url),
        });
    }

    if config.centrala.request_timeout_secs == 0 {
        return Err(ConfigError::ValidationError {
            field: "centrala.request_timeout_secs".into(),
            message: "must be greater than 0".into(),
        });
    }

    if config.webhook.port == 0 {
        return Err(ConfigError::ValidationError {
            field: "webhook.port".into(),
            message: "must be greater than 0".into(),
        });
    }

    let budget = config.timelock.budget_secs;
    if !budget.is_finite() || budget <= 0.0 {
        return Err(ConfigError::ValidationError {
            field: "timelock.budget_secs".into(),
            message: format!("must be a finite number > 0, got {budget}"),
        });
    }

    let timelock_fields: &[(&str, usize)] = &[
        (
            "timelock.fetch_timeout_secs",
            config.timelock.fetch_timeout_secs as usize,
        ),
        ("timelock.max_workers", config.timelock.max_workers),
    ];
    for (name, val) in timelock_fields {
        if *val == 0 {
            return Err(ConfigError::ValidationError {
                field: name.to_string(),
                message: "must be > 0".into(),
            });
        }
    }

    let mut names: Vec<&String> = config.endpoints.keys().collect();
    names.sort();
    for name in names {
        let url = &config.endpoints[name];
        if !url.trim().is_empty() && !is_http_url(url) {
            return Err(ConfigError::ValidationError {
                field: format!("endpoints.{name}"),
                message: format!("must be an http(s) URL, got {url:?}"),
            });
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
