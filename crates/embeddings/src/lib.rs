//! Embedding Gateway: maps text to fixed-dimension vectors via a remote
//! embedding service, falling back to a deterministic local projection when
//! the remote is unavailable. Dimension is discovered on first success and
//! held constant afterward, mirroring `EneEmbeddings`'s `_dimension` cache.

use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding service unavailable: {0}")]
    Unavailable(String),
    #[error("remote embedding request failed: {0}")]
    Remote(String),
}

/// The remote half of the gateway. An `HttpEmbedder` implementation lives
/// behind this trait so the wire protocol stays swappable and out of this
/// crate's required surface (the concrete HTTP contract is not specified
/// upstream).
#[async_trait]
pub trait RemoteEmbedder: Send + Sync {
    async fn embed_remote(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// reqwest-backed remote embedder. Posts `{"model": ..., "input": [...]}`
/// and expects `{"data": [{"embedding": [...]}, ...]}` in response, the
/// shape most OpenAI-compatible embedding endpoints use.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            api_key,
        }
    }
}

#[derive(serde::Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(serde::Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedDatum>,
}

#[derive(serde::Deserialize)]
struct EmbedDatum {
    embedding: Vec<f32>,
}

#[async_trait]
impl RemoteEmbedder for HttpEmbedder {
    async fn embed_remote(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut req = self
            .client
            .post(format!("{}/embeddings", self.base_url.trim_end_matches('/')))
            .json(&EmbedRequest {
                model: &self.model,
                input: texts,
            });
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| EmbeddingError::Remote(e.to_string()))?
            .error_for_status()
            .map_err(|e| EmbeddingError::Remote(e.to_string()))?;

        let parsed: EmbedResponse = resp
            .json()
            .await
            .map_err(|e| EmbeddingError::Remote(e.to_string()))?;

        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Deterministic local fallback: projects each text to a fixed-dimension
/// vector via SHA-256 over word shingles, then L2-normalizes. Not a
/// semantic embedding, but stable and collision-resistant enough for the
/// lab/offline path.
fn local_fallback_embed(texts: &[String], dimension: usize) -> Vec<Vec<f32>> {
    texts.iter().map(|t| local_fallback_one(t, dimension)).collect()
}

fn local_fallback_one(text: &str, dimension: usize) -> Vec<f32> {
    let mut v = vec![0f32; dimension];
    if text.is_empty() {
        return v;
    }
    for word in text.split_whitespace() {
        let mut hasher = Sha256::new();
        hasher.update(word.as_bytes());
        let digest = hasher.finalize();
        for (i, slot) in v.iter_mut().enumerate() {
            let byte = digest[i % digest.len()];
            // Map byte to [-1, 1] and accumulate.
            *slot += (byte as f32 / 127.5) - 1.0;
        }
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    v
}

pub struct EmbeddingGateway {
    remote: Option<Box<dyn RemoteEmbedder>>,
    allow_local_fallback: bool,
    dimension: Mutex<Option<usize>>,
    default_dimension: usize,
}

impl EmbeddingGateway {
    pub fn new(remote: Option<Box<dyn RemoteEmbedder>>) -> Self {
        Self {
            remote,
            allow_local_fallback: true,
            dimension: Mutex::new(None),
            default_dimension: 256,
        }
    }

    pub fn without_fallback(remote: Box<dyn RemoteEmbedder>) -> Self {
        Self {
            remote: Some(remote),
            allow_local_fallback: false,
            dimension: Mutex::new(None),
            default_dimension: 256,
        }
    }

    pub fn dimension(&self) -> Option<usize> {
        *self.dimension.lock().expect("embedding dimension lock poisoned")
    }

    fn record_dimension(&self, dim: usize) {
        let mut guard = self.dimension.lock().expect("embedding dimension lock poisoned");
        if guard.is_none() {
            *guard = Some(dim);
        }
    }

    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(remote) = &self.remote {
            match remote.embed_remote(texts).await {
                Ok(vectors) => {
                    if let Some(first) = vectors.first() {
                        self.record_dimension(first.len());
                    }
                    return Ok(vectors);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "remote embedding failed, falling back to local projection");
                }
            }
        }

        if !self.allow_local_fallback {
            return Err(EmbeddingError::Unavailable(
                "remote embedder failed and local fallback is disabled".to_string(),
            ));
        }

        let dim = self.dimension().unwrap_or(self.default_dimension);
        let vectors = local_fallback_embed(texts, dim);
        self.record_dimension(dim);
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysFails;

    #[async_trait]
    impl RemoteEmbedder for AlwaysFails {
        async fn embed_remote(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Err(EmbeddingError::Remote("boom".to_string()))
        }
    }

    struct FixedRemote {
        dim: usize,
    }

    #[async_trait]
    impl RemoteEmbedder for FixedRemote {
        async fn embed_remote(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Ok(texts.iter().map(|_| vec![1.0; self.dim]).collect())
        }
    }

    #[tokio::test]
    async fn empty_input_returns_empty_without_calling_backend() {
        let gw = EmbeddingGateway::new(Some(Box::new(AlwaysFails)));
        let result = gw.embed(&[]).await.unwrap();
        assert!(result.is_empty());
        assert!(gw.dimension().is_none());
    }

    #[tokio::test]
    async fn remote_failure_falls_back_to_local() {
        let gw = EmbeddingGateway::new(Some(Box::new(AlwaysFails)));
        let texts = vec!["hello world".to_string()];
        let result = gw.embed(&texts).await.unwrap();
        assert_eq!(result.len(), 1);
        assert!(gw.dimension().is_some());
    }

    #[tokio::test]
    async fn remote_failure_without_fallback_is_unavailable() {
        let gw = EmbeddingGateway::without_fallback(Box::new(AlwaysFails));
        let texts = vec!["hello world".to_string()];
        let err = gw.embed(&texts).await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Unavailable(_)));
    }

    #[tokio::test]
    async fn dimension_discovered_and_held_constant() {
        let gw = EmbeddingGateway::new(Some(Box::new(FixedRemote { dim: 17 })));
        let texts = vec!["a".to_string()];
        let first = gw.embed(&texts).await.unwrap();
        assert_eq!(first[0].len(), 17);
        assert_eq!(gw.dimension(), Some(17));
    }

    #[tokio::test]
    async fn local_fallback_is_deterministic() {
        let a = local_fallback_one("hello world", 32);
        let b = local_fallback_one("hello world", 32);
        assert_eq!(a, b);
    }
}
