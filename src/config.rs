use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default system instruction for the answer generator.
///
/// Kept as configuration (overridable via `[chat] system_prompt`) so the
/// orchestrator can be exercised with alternate prompts in tests.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a knowledge assistant. Answer questions based ONLY on the provided \
context from uploaded documents.

RULES:
1. Use ONLY information from the context. Do not use external knowledge.
2. If the answer is not in the context, clearly state: \
'I don't have that information in the available documents.'
3. Format your response using clean, semantic HTML.
4. Cite sources by mentioning document names when relevant.

HTML FORMATTING:
- <p> for paragraphs
- <ul>/<ol> with <li> for lists
- <strong> for emphasis, <em> for italics
- <code> for technical terms or commands
- <h4> for section headers (if needed)
- <blockquote> for quotes
Keep formatting professional and clean.";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub uploads: UploadsConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8087".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadsConfig {
    #[serde(default = "default_uploads_dir")]
    pub dir: PathBuf,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            dir: default_uploads_dir(),
        }
    }
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("./uploads")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Soft upper bound on chunk length, in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Characters carried over from the end of one chunk into the next.
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    600
}
fn default_overlap() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Number of chunks injected into the grounding prompt.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> usize {
    7
}

#[derive(Debug, Deserialize, Clone)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    #[serde(default = "default_embed_model")]
    pub embed_model: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_embed_timeout_secs")]
    pub embed_timeout_secs: u64,
    /// Request timeout for a full streamed generation.
    #[serde(default = "default_chat_timeout_secs")]
    pub chat_timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_num_predict")]
    pub num_predict: u32,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_url(),
            embed_model: default_embed_model(),
            chat_model: default_chat_model(),
            embed_timeout_secs: default_embed_timeout_secs(),
            chat_timeout_secs: default_chat_timeout_secs(),
            temperature: default_temperature(),
            num_predict: default_num_predict(),
        }
    }
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_embed_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_chat_model() -> String {
    "llama3.1:8b".to_string()
}
fn default_embed_timeout_secs() -> u64 {
    60
}
fn default_chat_timeout_secs() -> u64 {
    300
}
fn default_temperature() -> f64 {
    0.3
}
fn default_num_predict() -> u32 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    /// System instruction sent with every generation request.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
        }
    }
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.overlap must be smaller than chunking.chunk_size");
    }
    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.chat.system_prompt.trim().is_empty() {
        anyhow::bail!("chat.system_prompt must not be empty");
    }

    Ok(config)
}
