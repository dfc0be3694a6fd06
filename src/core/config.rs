//! Configuration for the RAG core.
//!
//! Defaults are built in; a YAML config file can override them. The file is
//! looked up via `BANCASSURE_CONFIG_PATH`, then `<data_dir>/config.yml`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::RagError;

/// Filesystem locations for logs and persisted state.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub index_db_path: PathBuf,
    pub sessions_db_path: PathBuf,
}

impl AppPaths {
    pub fn new() -> Self {
        let data_dir = discover_data_dir();
        let log_dir = data_dir.join("logs");
        let index_db_path = data_dir.join("index.db");
        let sessions_db_path = data_dir.join("sessions.db");

        for dir in [&data_dir, &log_dir] {
            let _ = fs::create_dir_all(dir);
        }

        AppPaths {
            data_dir,
            log_dir,
            index_db_path,
            sessions_db_path,
        }
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new()
    }
}

fn discover_data_dir() -> PathBuf {
    if let Ok(dir) = env::var("BANCASSURE_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if cfg!(debug_assertions) {
        return env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    }

    let xdg = env::var("XDG_DATA_HOME").unwrap_or_else(|_| {
        home_dir()
            .join(".local/share")
            .to_string_lossy()
            .to_string()
    });
    PathBuf::from(xdg).join("bancassure")
}

fn home_dir() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Maximum passage size in estimated tokens.
    pub max_tokens: usize,
    /// Trailing tokens shared between adjacent passages.
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            overlap_tokens: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Results returned to the assembler.
    pub top_k: usize,
    /// Candidate pool size = top_k * candidate_multiplier, leaving room for
    /// the threshold filter (and a future re-ranker) to discard candidates.
    pub candidate_multiplier: usize,
    /// Minimum cosine similarity for a passage to be considered relevant.
    pub min_score: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            candidate_multiplier: 4,
            min_score: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Token budget for retrieved passages.
    pub context_budget: usize,
    /// Token budget for conversation history.
    pub history_budget: usize,
    /// Most recent turns considered before token budgeting.
    pub max_history_turns: usize,
    /// Hard input limit of the generation model.
    pub model_input_limit: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            context_budget: 2048,
            history_budget: 1024,
            max_history_turns: 20,
            model_input_limit: 8192,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle seconds after which a session expires.
    pub idle_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL of the OpenAI-compatible endpoint.
    pub base_url: String,
    pub embedding_model: String,
    pub generation_model: String,
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:1234".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            generation_model: "gpt-4o-mini".to_string(),
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 250,
        }
    }
}

/// Top-level configuration, one section per pipeline stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub context: ContextConfig,
    pub session: SessionConfig,
    pub provider: ProviderConfig,
    pub retry: RetryConfig,
}

impl RagConfig {
    /// Load configuration, merging the YAML file over defaults when present.
    pub fn load(paths: &AppPaths) -> Result<Self, RagError> {
        let path = config_path(paths);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> Result<Self, RagError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| RagError::Internal(format!("failed to read {}: {}", path.display(), e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| RagError::Internal(format!("invalid config {}: {}", path.display(), e)))
    }
}

fn config_path(paths: &AppPaths) -> PathBuf {
    if let Ok(path) = env::var("BANCASSURE_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    paths.data_dir.join("config.yml")
}
