//! Embedding provider - OpenAI-compatible HTTP client for text embeddings.
//!
//! Works against any OpenAI-compatible embedding endpoint:
//! - Ollama (localhost:11434/v1)
//! - OpenAI (api.openai.com)
//! - LiteLLM proxy, vLLM, TGI, etc.
//!
//! Transient failures are retried with exponential backoff; the terminal
//! failure surfaces as [`UridxError::Transient`] and aborts only the
//! containing ingestion.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EmbeddingSettings;
use crate::embedding::Embedder;
use crate::error::{Result, UridxError};

/// Retry attempts for one logical embedding call.
const MAX_ATTEMPTS: u32 = 3;

/// Initial backoff delay; doubles per retry.
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Embedding API provider using an OpenAI-compatible HTTP endpoint.
pub struct EmbeddingProvider {
    agent: ureq::Agent,
    api_base: String,
    api_key: Option<String>,
    model: String,
}

/// Request body for the embedding API.
#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

/// Response from the embedding API.
#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

impl EmbeddingProvider {
    /// Create a provider from embedding settings.
    pub fn new(settings: &EmbeddingSettings) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(settings.timeout_secs)))
            .build()
            .into();

        Self {
            agent,
            // Normalize API base URL (strip trailing slash)
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
        }
    }

    /// One HTTP round-trip, no retry.
    fn request_embeddings(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.api_base);
        let body = EmbeddingRequest {
            model: &self.model,
            input: texts.to_vec(),
        };

        debug!(
            "Embedding {} texts via {} (model: {})",
            texts.len(),
            url,
            self.model
        );

        let mut request = self.agent.post(&url).header("Content-Type", "application/json");

        if let Some(ref key) = self.api_key {
            request = request.header("Authorization", &format!("Bearer {}", key));
        }

        let mut response = request.send_json(&body).map_err(|e| match e {
            ureq::Error::StatusCode(status) => {
                UridxError::Transient(format!("embedding API returned status {}", status))
            }
            ureq::Error::Io(io_err) => {
                UridxError::Transient(format!("embedding API connection failed: {}", io_err))
            }
            other => UridxError::Transient(format!("embedding API error: {}", other)),
        })?;

        let resp: EmbeddingResponse = response
            .body_mut()
            .read_json()
            .map_err(|e| UridxError::Transient(format!("cannot parse embedding response: {}", e)))?;

        // Sort by index to guarantee input order
        let mut data = resp.data;
        data.sort_by_key(|d| d.index);

        let vectors: Vec<Vec<f32>> = data.into_iter().map(|d| d.embedding).collect();

        if vectors.len() != texts.len() {
            return Err(UridxError::Transient(format!(
                "embedding API returned {} vectors for {} inputs",
                vectors.len(),
                texts.len()
            )));
        }

        Ok(vectors)
    }
}

impl Embedder for EmbeddingProvider {
    fn model(&self) -> &str {
        &self.model
    }

    fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut delay = INITIAL_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.request_embeddings(texts) {
                Ok(vectors) => return Ok(vectors),
                Err(e) if attempt < MAX_ATTEMPTS => {
                    warn!(
                        "Embedding attempt {}/{} failed: {} (retrying in {:?})",
                        attempt, MAX_ATTEMPTS, e, delay
                    );
                    std::thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_serializes_to_openai_shape() {
        let body = EmbeddingRequest {
            model: "nomic-embed-text",
            input: vec!["alpha", "beta"],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "nomic-embed-text");
        assert_eq!(json["input"][1], "beta");
    }

    #[test]
    fn response_rows_sort_by_index() {
        let raw = r#"{"data":[
            {"embedding":[0.0,1.0],"index":1},
            {"embedding":[1.0,0.0],"index":0}
        ]}"#;
        let mut resp: EmbeddingResponse = serde_json::from_str(raw).unwrap();
        resp.data.sort_by_key(|d| d.index);
        assert_eq!(resp.data[0].embedding, vec![1.0, 0.0]);
        assert_eq!(resp.data[1].embedding, vec![0.0, 1.0]);
    }

    #[test]
    fn api_base_is_normalized() {
        let settings = EmbeddingSettings {
            api_base: "http://localhost:11434/v1/".to_string(),
            ..EmbeddingSettings::default()
        };
        let provider = EmbeddingProvider::new(&settings);
        assert_eq!(provider.api_base, "http://localhost:11434/v1");
    }
}
