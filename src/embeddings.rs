use crate::config::Config;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const EMBED_CACHE_SIZE: usize = 1000;

/// Boundary to the embedding backend. The pipeline needs exactly two
/// things from it: one vector per input text, in input order, and the
/// model name that gets recorded into persisted indexes.
#[async_trait]
pub trait EmbeddingGateway: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    fn model_name(&self) -> &str;
}

#[derive(Serialize)]
#[serde(untagged)]
enum EmbedInput<'a> {
    Single(&'a str),
    Batch(&'a [String]),
}

#[derive(Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    input: EmbedInput<'a>,
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    #[serde(default)]
    embedding: Option<Vec<f32>>,
    #[serde(default)]
    embeddings: Option<Vec<Vec<f32>>>,
}

#[derive(Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaModelTag>,
}

#[derive(Deserialize)]
struct OllamaModelTag {
    name: String,
}

/// Embedding client for a local Ollama server. Batch requests go through
/// `/api/embed` under a hard timeout; if a batch call fails or comes back
/// short, the texts are retried one by one before the error surfaces.
/// Single-text embeddings (topic anchors) are LRU-cached.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
    cache: RwLock<LruCache<String, Vec<f32>>>,
}

impl OllamaEmbedder {
    pub fn new(config: &Config) -> Self {
        let capacity = NonZeroUsize::new(EMBED_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            client: reqwest::Client::new(),
            base_url: config.ollama_url.trim_end_matches('/').to_string(),
            model: config.embedding_model.clone(),
            timeout: Duration::from_secs(config.embed_timeout_secs),
            cache: RwLock::new(LruCache::new(capacity)),
        }
    }

    pub async fn test_connection(&self) -> Result<()> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self.client.get(&url).send().await.map_err(|err| {
            PipelineError::EmbeddingService(format!(
                "cannot connect to ollama at {}: {err}",
                self.base_url
            ))
        })?;
        if !response.status().is_success() {
            return Err(PipelineError::EmbeddingService(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        info!(url = %self.base_url, "connected to ollama");
        Ok(())
    }

    /// Returns whether the configured embedding model is installed on the
    /// server. Callers decide whether a missing model is fatal.
    pub async fn verify_model(&self) -> Result<bool> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self.client.get(&url).send().await.map_err(|err| {
            PipelineError::EmbeddingService(format!(
                "cannot connect to ollama at {}: {err}",
                self.base_url
            ))
        })?;
        let tags: OllamaTagsResponse = response.json().await.map_err(|err| {
            PipelineError::EmbeddingService(format!("invalid tags response: {err}"))
        })?;
        let prefixed = format!("{}:", self.model);
        Ok(tags
            .models
            .iter()
            .any(|m| m.name == self.model || m.name.starts_with(&prefixed)))
    }

    async fn post_embed(&self, input: EmbedInput<'_>) -> Result<OllamaEmbedResponse> {
        let url = format!("{}/api/embed", self.base_url);
        let request = OllamaEmbedRequest {
            model: &self.model,
            input,
        };
        let send = self.client.post(&url).json(&request).send();
        let response = match tokio::time::timeout(self.timeout, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                return Err(PipelineError::EmbeddingService(format!(
                    "request to {url} failed: {err}"
                )))
            }
            Err(_) => {
                return Err(PipelineError::EmbeddingService(format!(
                    "request to {url} timed out after {}s",
                    self.timeout.as_secs()
                )))
            }
        };
        if !response.status().is_success() {
            return Err(PipelineError::EmbeddingService(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        response.json::<OllamaEmbedResponse>().await.map_err(|err| {
            PipelineError::EmbeddingService(format!("invalid embed response: {err}"))
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let parsed = self.post_embed(EmbedInput::Batch(texts)).await?;
        let vectors = parsed.embeddings.ok_or_else(|| {
            PipelineError::EmbeddingService("embed response carried no embeddings".into())
        })?;
        if vectors.len() != texts.len() {
            return Err(PipelineError::EmbeddingService(format!(
                "requested {} embeddings, received {}",
                texts.len(),
                vectors.len()
            )));
        }
        if vectors.iter().any(|v| v.is_empty()) {
            return Err(PipelineError::EmbeddingService(
                "embed response contained an empty vector".into(),
            ));
        }
        Ok(vectors)
    }

    async fn embed_single(&self, text: &str) -> Result<Vec<f32>> {
        let parsed = self.post_embed(EmbedInput::Single(text)).await?;
        let vector = parsed
            .embeddings
            .and_then(|mut v| if v.is_empty() { None } else { Some(v.remove(0)) })
            .or(parsed.embedding)
            .ok_or_else(|| {
                PipelineError::EmbeddingService("embed response carried no embedding".into())
            })?;
        if vector.is_empty() {
            return Err(PipelineError::EmbeddingService(
                "embed response contained an empty vector".into(),
            ));
        }
        Ok(vector)
    }

    async fn embed_single_cached(&self, text: &str) -> Result<Vec<f32>> {
        {
            let mut cache = self.cache.write().await;
            if let Some(hit) = cache.get(text) {
                debug!("embedding cache hit");
                return Ok(hit.clone());
            }
        }
        let vector = self.embed_single(text).await?;
        self.cache
            .write()
            .await
            .put(text.to_string(), vector.clone());
        Ok(vector)
    }
}

#[async_trait]
impl EmbeddingGateway for OllamaEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if texts.len() == 1 {
            return Ok(vec![self.embed_single_cached(&texts[0]).await?]);
        }
        match self.embed_batch(texts).await {
            Ok(vectors) => Ok(vectors),
            Err(err) => {
                warn!(
                    count = texts.len(),
                    error = %err,
                    "batch embedding failed, retrying texts one by one"
                );
                let mut vectors = Vec::with_capacity(texts.len());
                for text in texts {
                    vectors.push(self.embed_single(text).await?);
                }
                Ok(vectors)
            }
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}


#[cfg(test)]
mod tests {
    use super::testing::HashGateway;
    use super::*;

    #[test]
    fn batch_request_serializes_input_as_array() {
        let texts = vec!["one".to_string(), "two".to_string()];
        let request = OllamaEmbedRequest {
            model: "nomic-embed-text",
            input: EmbedInput::Batch(&texts),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value["input"].is_array());
        assert_eq!(value["model"], "nomic-embed-text");

        let request = OllamaEmbedRequest {
            model: "nomic-embed-text",
            input: EmbedInput::Single("just one"),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value["input"].is_string());
    }

    #[test]
    fn response_parses_both_shapes() {
        let batch: OllamaEmbedResponse =
            serde_json::from_str(r#"{"embeddings": [[0.1, 0.2], [0.3, 0.4]]}"#).unwrap();
        assert_eq!(batch.embeddings.unwrap().len(), 2);
        assert!(batch.embedding.is_none());

        let single: OllamaEmbedResponse =
            serde_json::from_str(r#"{"embedding": [0.1, 0.2, 0.3]}"#).unwrap();
        assert_eq!(single.embedding.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn empty_input_returns_without_a_request() {
        let embedder = OllamaEmbedder::new(&Config::default());
        let vectors = embedder.embed(&[]).await.unwrap();
        assert!(vectors.is_empty());
    }

    #[tokio::test]
    async fn hash_gateway_is_deterministic() {
        let gateway = HashGateway::new(8);
        let texts = vec!["pad thai".to_string(), "slow service".to_string()];
        let first = gateway.embed(&texts).await.unwrap();
        let second = gateway.embed(&texts).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|v| v.len() == 8));
        assert_ne!(first[0], first[1]);
        assert_eq!(gateway.call_count(), 2);
    }
}
