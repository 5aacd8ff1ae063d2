use std::error::Error;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::agents::{AgentSettings, OllamaBackend, RagAgent};
use crate::index::{Embedder, OllamaEmbedder, RetrieverHandle, VectorIndex};
use crate::AppState;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub index_path: PathBuf,
    pub ai: AiConfig,
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub url: String,
    pub generation_model: String,
    pub embedding_model: String,
    pub timeout: Duration,
    pub stream_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub max_context_length: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Box<dyn Error>> {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        Ok(Self {
            host: text("HOST", "0.0.0.0"),
            port: parse_or(&lookup, "PORT", 8000)?,
            index_path: PathBuf::from(text("INDEX_PATH", "index/index.json")),
            ai: AiConfig {
                url: text("OLLAMA_URL", "http://127.0.0.1:11434"),
                generation_model: text("GENERATION_MODEL", "qwen3:0.6b"),
                embedding_model: text("EMBEDDING_MODEL", "all-minilm"),
                timeout: Duration::from_secs(parse_or(&lookup, "BACKEND_TIMEOUT_SECS", 120)?),
                stream_delay: Duration::from_millis(parse_or(&lookup, "STREAM_DELAY_MS", 30)?),
            },
            retrieval: RetrievalConfig {
                top_k: parse_or(&lookup, "TOP_K", 3)?,
                max_context_length: parse_or(&lookup, "MAX_CONTEXT_LENGTH", 800)?,
            },
        })
    }

    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            top_k: self.retrieval.top_k,
            context_limit: self.retrieval.max_context_length,
            stream_delay: self.ai.stream_delay,
            ..AgentSettings::default()
        }
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, Box<dyn Error>>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| format!("Invalid {}={:?}: {}", key, raw, e).into()),
        None => Ok(default),
    }
}

pub async fn app_init() -> Result<(Config, Arc<AppState>), Box<dyn Error>> {
    let config = Config::from_env()?;
    log::info!("✅ Configuration loaded");

    let backend = OllamaBackend::new(
        &config.ai.url,
        &config.ai.generation_model,
        config.ai.timeout,
    )?;
    log::info!("🤖 Generation: {} @ {}", backend.model(), config.ai.url);

    let embedder = OllamaEmbedder::new(
        &config.ai.url,
        &config.ai.embedding_model,
        config.ai.timeout,
    )?;
    log::info!("🧮 Embeddings: {}", config.ai.embedding_model);

    // Requests are answered with 503 until the loader installs the index.
    let retriever = RetrieverHandle::new();
    spawn_index_loader(config.index_path.clone(), Arc::new(embedder), retriever.clone());

    let agent = Arc::new(RagAgent::new(Arc::new(backend), config.agent_settings()));

    let state = Arc::new(AppState { retriever, agent });
    Ok((config, state))
}

pub fn spawn_index_loader(
    path: PathBuf,
    embedder: Arc<dyn Embedder>,
    handle: RetrieverHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        log::info!("📚 Loading vector index from {}...", path.display());
        match VectorIndex::load(&path, embedder).await {
            Ok(index) => {
                log::info!(
                    "✅ Vector index ready: {} chunks, dimension {}",
                    index.len(),
                    index.dimension()
                );
                if !handle.install(Arc::new(index)) {
                    log::warn!("⚠️  Vector index was already installed");
                }
            }
            Err(e) => log::error!("❌ Vector index not loaded: {}", e),
        }
    })
}
