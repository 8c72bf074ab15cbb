//! Concrete embedding backends and the provider factory.
//!
//! Model strings take the form `backend/model`, for example
//! `fastembed/AllMiniLML6V2`, `openai/text-embedding-3-small` or
//! `ollama/nomic-embed-text`.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::EmbeddingConfig;
use crate::tokens::HeuristicTokenCounter;
use crate::vector::embedding::ensure_count;
use crate::vector::{
    EmbeddingError, EmbeddingProvider, FastEmbedProvider, Instructed, RollingWindow,
};

const OPENAI_ENDPOINT: &str = "https://api.openai.com/v1";
const OLLAMA_ENDPOINT: &str = "http://localhost:11434";

/// Closed set of supported embedding backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmbeddingBackend {
    /// Local ONNX models through fastembed
    FastEmbed,
    /// Hosted OpenAI-compatible API
    OpenAi,
    /// Local Ollama server
    Ollama,
}

impl EmbeddingBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FastEmbed => "fastembed",
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
        }
    }

    /// Whether texts stay on this machine.
    pub fn is_local(&self) -> bool {
        !matches!(self, Self::OpenAi)
    }
}

impl fmt::Display for EmbeddingBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmbeddingBackend {
    type Err = EmbeddingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fastembed" | "local" | "sentencetransformers" | "sentence-transformers" => {
                Ok(Self::FastEmbed)
            }
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(EmbeddingError::UnknownBackend(other.to_string())),
        }
    }
}

/// A `backend/model` string split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub backend: EmbeddingBackend,
    pub model: String,
}

impl ModelSpec {
    pub fn parse(spec: &str) -> Result<Self, EmbeddingError> {
        let (backend, model) = spec
            .split_once('/')
            .ok_or_else(|| EmbeddingError::UnknownBackend(spec.to_string()))?;
        if model.is_empty() {
            return Err(EmbeddingError::UnknownModel(spec.to_string()));
        }
        Ok(Self {
            backend: backend.parse()?,
            model: model.to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbedding {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// OpenAI embedding provider.
///
/// Works with OpenAI's API and any compatible endpoint.
pub struct OpenAiProvider {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
    model: String,
    dimensions: Option<usize>,
}

impl OpenAiProvider {
    /// # Arguments
    /// * `api_key` - OpenAI API key
    /// * `model` - Model name (e.g., "text-embedding-3-small")
    /// * `endpoint` - API endpoint (defaults to "https://api.openai.com/v1")
    /// * `dimensions` - Requested output size for models that support shortening
    pub fn new(
        api_key: String,
        model: String,
        endpoint: Option<String>,
        dimensions: Option<usize>,
    ) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            endpoint: endpoint.unwrap_or_else(|| OPENAI_ENDPOINT.to_string()),
            api_key,
            model,
            dimensions,
        }
    }
}

impl EmbeddingProvider for OpenAiProvider {
    fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embeddings", self.endpoint);
        let request = OpenAiRequest {
            model: &self.model,
            input: texts,
            dimensions: self.dimensions,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .map_err(|e| EmbeddingError::Provider(format!("OpenAI request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(EmbeddingError::Http { status, body });
        }

        let mut result: OpenAiResponse = response
            .json()
            .map_err(|e| EmbeddingError::Provider(format!("Invalid OpenAI response: {e}")))?;
        result.data.sort_by_key(|d| d.index);
        ensure_count(
            result.data.into_iter().map(|d| d.embedding).collect(),
            texts.len(),
        )
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Ollama embedding provider using the local `/api/embed` endpoint.
pub struct OllamaProvider {
    client: reqwest::blocking::Client,
    endpoint: String,
    model: String,
}

impl OllamaProvider {
    /// # Arguments
    /// * `model` - Model name (e.g., "nomic-embed-text")
    /// * `endpoint` - Ollama endpoint (defaults to "http://localhost:11434")
    pub fn new(model: String, endpoint: Option<String>) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            endpoint: endpoint.unwrap_or_else(|| OLLAMA_ENDPOINT.to_string()),
            model,
        }
    }
}

impl EmbeddingProvider for OllamaProvider {
    fn embed_documents(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/api/embed", self.endpoint);
        let request = OllamaRequest {
            model: &self.model,
            input: texts,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .map_err(|e| EmbeddingError::Provider(format!("Ollama request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(EmbeddingError::Http { status, body });
        }

        let result: OllamaResponse = response
            .json()
            .map_err(|e| EmbeddingError::Provider(format!("Invalid Ollama response: {e}")))?;
        ensure_count(result.embeddings, texts.len())
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Builds the provider stack described by `config`.
///
/// The backend comes first, then the instruction prefixes, then the
/// rolling window. Caching is layered on by the caller.
pub fn create_provider(
    config: &EmbeddingConfig,
    models_dir: &Path,
    show_progress: bool,
) -> Result<Arc<dyn EmbeddingProvider>, EmbeddingError> {
    let spec = ModelSpec::parse(&config.model)?;

    if config.private {
        if !spec.backend.is_local() {
            return Err(EmbeddingError::PrivateViolation {
                backend: spec.backend.to_string(),
            });
        }
        info!(target: "ragshard::index", "Private mode: embeddings stay on the {} backend", spec.backend);
    }

    let base: Arc<dyn EmbeddingProvider> = match spec.backend {
        EmbeddingBackend::FastEmbed => {
            Arc::new(FastEmbedProvider::new(&spec.model, models_dir, show_progress)?)
        }
        EmbeddingBackend::OpenAi => {
            let api_key = std::env::var(&config.api_key_env).map_err(|_| {
                EmbeddingError::MissingApiKey {
                    var: config.api_key_env.clone(),
                }
            })?;
            Arc::new(OpenAiProvider::new(
                api_key,
                spec.model.clone(),
                config.endpoint.clone(),
                config.dimensions,
            ))
        }
        EmbeddingBackend::Ollama => {
            if config.dimensions.is_some() {
                warn!(target: "ragshard::index", "Ollama ignores embedding.dimensions");
            }
            Arc::new(OllamaProvider::new(
                spec.model.clone(),
                config.endpoint.clone(),
            ))
        }
    };

    let instructed: Arc<dyn EmbeddingProvider> = if config.instruct {
        Arc::new(Instructed::new(base))
    } else {
        base
    };

    Ok(match &config.rolling_window {
        Some(window) => Arc::new(RollingWindow::new(
            instructed,
            Arc::new(HeuristicTokenCounter),
            window.max_tokens,
            window.pooling,
        )),
        None => instructed,
    })
}
