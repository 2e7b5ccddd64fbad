//! Runtime settings.
//!
//! Every key resolves from, in order of priority:
//! 1. The `DOCUBOT_<KEY>` environment variable (dots become underscores)
//! 2. The persisted `settings` table (`docubot config set`)
//! 3. The built-in default

use std::{str::FromStr, time::Duration};

use crate::{
    answerer::DEFAULT_ANSWER_MODEL,
    chunking::{DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE, TextSplitter},
    embedding::{DEFAULT_DIMENSION, DEFAULT_EMBEDDING_MODEL},
    error::{Error, Result},
    metadata_store::MetadataStore,
    openai::API_KEY_ENV_VAR,
    resilience::CallPolicy,
    session::DEFAULT_MAX_SESSIONS,
};

pub const ANSWERER_BACKEND: &str = "answerer.backend";
pub const ANSWERER_BASE_URL: &str = "answerer.base_url";
pub const ANSWERER_MODEL: &str = "answerer.model";
pub const EMBEDDER_BACKEND: &str = "embedder.backend";
pub const EMBEDDER_BASE_URL: &str = "embedder.base_url";
pub const EMBEDDER_MODEL: &str = "embedder.model";
pub const EMBEDDER_DIMENSION: &str = "embedder.dimension";
pub const CHUNK_SIZE: &str = "chunk.size";
pub const CHUNK_OVERLAP: &str = "chunk.overlap";
pub const SEARCH_K: &str = "search.k";
pub const SEARCH_FETCH_K: &str = "search.fetch_k";
pub const CALLS_TIMEOUT_SECS: &str = "calls.timeout_secs";
pub const CALLS_MAX_ATTEMPTS: &str = "calls.max_attempts";
pub const CALLS_RETRY_BASE_MS: &str = "calls.retry_base_ms";
pub const RECONCILE_GRACE_SECS: &str = "reconcile.grace_secs";
pub const RECONCILE_INTERVAL_SECS: &str = "reconcile.interval_secs";
pub const SERVER_BIND: &str = "server.bind";
pub const UPLOAD_MAX_BYTES: &str = "upload.max_bytes";
pub const SESSIONS_MAX: &str = "sessions.max";

pub const DEFAULT_ANSWERER_BASE_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/openai";
pub const DEFAULT_EMBEDDER_BASE_URL: &str = "http://localhost:11434/v1";
pub const DEFAULT_SERVER_BIND: &str = "127.0.0.1:8000";
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

/// A known settings key with its default and a one-line description.
#[derive(Debug, Clone, Copy)]
pub struct SettingKey {
    pub name: &'static str,
    pub default: &'static str,
    pub help: &'static str,
}

pub const KEYS: &[SettingKey] = &[
    SettingKey {
        name: ANSWERER_BACKEND,
        default: "extractive",
        help: "extractive (offline) or openai (chat completions API)",
    },
    SettingKey {
        name: ANSWERER_BASE_URL,
        default: DEFAULT_ANSWERER_BASE_URL,
        help: "base URL of the OpenAI-compatible chat API",
    },
    SettingKey {
        name: ANSWERER_MODEL,
        default: DEFAULT_ANSWER_MODEL,
        help: "chat model name",
    },
    SettingKey {
        name: EMBEDDER_BACKEND,
        default: "hashing",
        help: "hashing (offline) or openai (embeddings API)",
    },
    SettingKey {
        name: EMBEDDER_BASE_URL,
        default: DEFAULT_EMBEDDER_BASE_URL,
        help: "base URL of the OpenAI-compatible embeddings API",
    },
    SettingKey {
        name: EMBEDDER_MODEL,
        default: DEFAULT_EMBEDDING_MODEL,
        help: "embedding model name",
    },
    SettingKey {
        name: EMBEDDER_DIMENSION,
        default: "384",
        help: "vector size of the hashing embedder",
    },
    SettingKey {
        name: CHUNK_SIZE,
        default: "1000",
        help: "maximum chunk length in characters",
    },
    SettingKey {
        name: CHUNK_OVERLAP,
        default: "200",
        help: "characters shared by adjacent chunks",
    },
    SettingKey {
        name: SEARCH_K,
        default: "5",
        help: "chunks passed to the answerer",
    },
    SettingKey {
        name: SEARCH_FETCH_K,
        default: "50",
        help: "nearest chunks considered before filtering",
    },
    SettingKey {
        name: CALLS_TIMEOUT_SECS,
        default: "30",
        help: "timeout for each model call",
    },
    SettingKey {
        name: CALLS_MAX_ATTEMPTS,
        default: "3",
        help: "attempts per model call, including the first",
    },
    SettingKey {
        name: CALLS_RETRY_BASE_MS,
        default: "500",
        help: "initial retry delay, doubled on each retry",
    },
    SettingKey {
        name: RECONCILE_GRACE_SECS,
        default: "900",
        help: "age after which an unfinished upload is discarded",
    },
    SettingKey {
        name: RECONCILE_INTERVAL_SECS,
        default: "300",
        help: "seconds between repair passes in serve mode (0 disables)",
    },
    SettingKey {
        name: SERVER_BIND,
        default: DEFAULT_SERVER_BIND,
        help: "address the HTTP server listens on",
    },
    SettingKey {
        name: UPLOAD_MAX_BYTES,
        default: "20971520",
        help: "largest accepted upload in bytes",
    },
    SettingKey {
        name: SESSIONS_MAX,
        default: "10000",
        help: "chat sessions whose topic is remembered",
    },
];

pub fn lookup_key(name: &str) -> Option<&'static SettingKey> {
    KEYS.iter().find(|k| k.name == name)
}

/// Environment variable overriding `key`, e.g. `DOCUBOT_SEARCH_FETCH_K`.
pub fn env_var_name(key: &str) -> String {
    format!("DOCUBOT_{}", key.replace('.', "_").to_uppercase())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswererBackend {
    Extractive,
    OpenAi,
}

impl FromStr for AnswererBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "extractive" => Ok(Self::Extractive),
            "openai" => Ok(Self::OpenAi),
            other => Err(format!(
                "unknown answerer backend '{other}' (expected extractive or openai)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedderBackend {
    Hashing,
    OpenAi,
}

impl FromStr for EmbedderBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "hashing" => Ok(Self::Hashing),
            "openai" => Ok(Self::OpenAi),
            other => Err(format!(
                "unknown embedder backend '{other}' (expected hashing or openai)"
            )),
        }
    }
}

/// Where an effective value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Environment,
    Stored,
    Default,
}

impl std::fmt::Display for ValueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueSource::Environment => f.write_str("env"),
            ValueSource::Stored => f.write_str("stored"),
            ValueSource::Default => f.write_str("default"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub answerer_backend: AnswererBackend,
    pub answerer_base_url: String,
    pub answerer_model: String,
    pub embedder_backend: EmbedderBackend,
    pub embedder_base_url: String,
    pub embedder_model: String,
    pub embedder_dimension: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub search_k: usize,
    pub search_fetch_k: usize,
    pub call_timeout: Duration,
    pub call_max_attempts: usize,
    pub call_retry_base: Duration,
    pub reconcile_grace: Duration,
    pub reconcile_interval: Duration,
    pub server_bind: String,
    pub max_upload_bytes: usize,
    pub max_sessions: usize,
    /// Only ever read from `DOCUBOT_API_KEY`; never stored.
    pub api_key: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            answerer_backend: AnswererBackend::Extractive,
            answerer_base_url: DEFAULT_ANSWERER_BASE_URL.to_string(),
            answerer_model: DEFAULT_ANSWER_MODEL.to_string(),
            embedder_backend: EmbedderBackend::Hashing,
            embedder_base_url: DEFAULT_EMBEDDER_BASE_URL.to_string(),
            embedder_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            embedder_dimension: DEFAULT_DIMENSION,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            search_k: 5,
            search_fetch_k: 50,
            call_timeout: Duration::from_secs(30),
            call_max_attempts: 3,
            call_retry_base: Duration::from_millis(500),
            reconcile_grace: Duration::from_secs(900),
            reconcile_interval: Duration::from_secs(300),
            server_bind: DEFAULT_SERVER_BIND.to_string(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            max_sessions: DEFAULT_MAX_SESSIONS,
            api_key: None,
        }
    }
}

impl Settings {
    /// Resolve against the process environment and the settings table.
    pub fn resolve(store: &MetadataStore) -> Result<Self> {
        let stored = store.list_settings()?;
        Self::resolve_with(
            |key| std::env::var(env_var_name(key)).ok(),
            |key| {
                stored
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.clone())
            },
            std::env::var(API_KEY_ENV_VAR).ok(),
        )
    }

    /// Resolve from explicit lookups. `env` and `stored` receive dotted keys.
    pub fn resolve_with(
        env: impl Fn(&str) -> Option<String>,
        stored: impl Fn(&str) -> Option<String>,
        api_key: Option<String>,
    ) -> Result<Self> {
        let raw = |key: &str| -> String {
            effective(key, &env, &stored).0
        };

        Ok(Self {
            answerer_backend: parse(ANSWERER_BACKEND, &raw(ANSWERER_BACKEND))?,
            answerer_base_url: raw(ANSWERER_BASE_URL),
            answerer_model: raw(ANSWERER_MODEL),
            embedder_backend: parse(EMBEDDER_BACKEND, &raw(EMBEDDER_BACKEND))?,
            embedder_base_url: raw(EMBEDDER_BASE_URL),
            embedder_model: raw(EMBEDDER_MODEL),
            embedder_dimension: positive(EMBEDDER_DIMENSION, &raw(EMBEDDER_DIMENSION))?,
            chunk_size: positive(CHUNK_SIZE, &raw(CHUNK_SIZE))?,
            chunk_overlap: parse(CHUNK_OVERLAP, &raw(CHUNK_OVERLAP))?,
            search_k: parse(SEARCH_K, &raw(SEARCH_K))?,
            search_fetch_k: parse(SEARCH_FETCH_K, &raw(SEARCH_FETCH_K))?,
            call_timeout: Duration::from_secs(positive(
                CALLS_TIMEOUT_SECS,
                &raw(CALLS_TIMEOUT_SECS),
            )? as u64),
            call_max_attempts: positive(CALLS_MAX_ATTEMPTS, &raw(CALLS_MAX_ATTEMPTS))?,
            call_retry_base: Duration::from_millis(parse(
                CALLS_RETRY_BASE_MS,
                &raw(CALLS_RETRY_BASE_MS),
            )?),
            reconcile_grace: Duration::from_secs(parse(
                RECONCILE_GRACE_SECS,
                &raw(RECONCILE_GRACE_SECS),
            )?),
            reconcile_interval: Duration::from_secs(parse(
                RECONCILE_INTERVAL_SECS,
                &raw(RECONCILE_INTERVAL_SECS),
            )?),
            server_bind: raw(SERVER_BIND),
            max_upload_bytes: positive(UPLOAD_MAX_BYTES, &raw(UPLOAD_MAX_BYTES))?,
            max_sessions: positive(SESSIONS_MAX, &raw(SESSIONS_MAX))?,
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    pub fn call_policy(&self) -> CallPolicy {
        CallPolicy::new(
            self.call_timeout,
            self.call_max_attempts,
            self.call_retry_base,
        )
    }

    pub fn splitter(&self) -> TextSplitter {
        TextSplitter::new(self.chunk_size, self.chunk_overlap)
    }
}

/// Check that `value` is acceptable for `key` before storing it.
pub fn validate(key: &str, value: &str) -> Result<()> {
    if lookup_key(key).is_none() {
        return Err(Error::Config(format!("unknown setting '{key}'")));
    }
    let overrides = |k: &str| (k == key).then(|| value.to_string());
    Settings::resolve_with(overrides, |_| None, None).map(|_| ())
}

/// Effective value of every known key and where it came from.
pub fn effective_values(
    store: &MetadataStore,
) -> Result<Vec<(&'static str, String, ValueSource)>> {
    let stored = store.list_settings()?;
    let env = |key: &str| std::env::var(env_var_name(key)).ok();
    let stored = |key: &str| {
        stored
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    };

    Ok(KEYS
        .iter()
        .map(|k| {
            let (value, source) = effective(k.name, &env, &stored);
            (k.name, value, source)
        })
        .collect())
}

fn effective(
    key: &str,
    env: &impl Fn(&str) -> Option<String>,
    stored: &impl Fn(&str) -> Option<String>,
) -> (String, ValueSource) {
    if let Some(value) = env(key) {
        return (value, ValueSource::Environment);
    }
    if let Some(value) = stored(key) {
        return (value, ValueSource::Stored);
    }
    let default = lookup_key(key).map_or("", |k| k.default);
    (default.to_string(), ValueSource::Default)
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("invalid value for {key}: {e}")))
}

fn positive(key: &str, value: &str) -> Result<usize> {
    match parse::<usize>(key, value)? {
        0 => Err(Error::Config(format!("{key} must be greater than zero"))),
        n => Ok(n),
    }
}
