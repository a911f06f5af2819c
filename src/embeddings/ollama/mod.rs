
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use super::EmbeddingBackend;
use crate::config::EmbeddingSettings;

/// Ollama HTTP API client
#[derive(Debug, Clone)]
pub struct OllamaBackend {
    base_url: Url,
    agent: ureq::Agent,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    #[serde(rename = "input")]
    inputs: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f64>>,
}

impl OllamaBackend {
    #[inline]
    pub fn new(settings: &EmbeddingSettings) -> Result<Self> {
        let base_url = settings
            .host_url()
            .context("Failed to generate Ollama URL from config")?;

        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(settings.timeout()))
            .build()
            .into();

        Ok(Self { base_url, agent })
    }

    #[inline]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn ping_blocking(&self) -> Result<()> {
        let url = self
            .base_url
            .join("/api/tags")
            .context("Failed to build ping URL")?;

        debug!("Pinging Ollama server at {}", url);
        self.agent
            .get(url.as_str())
            .call()
            .and_then(|mut resp| resp.body_mut().read_to_string())
            .context("Failed to ping Ollama server")?;
        Ok(())
    }

    fn embed_blocking(&self, model: &str, text: &str) -> Result<Vec<f64>> {
        debug!("Generating embedding for text (length: {})", text.len());

        let url = self
            .base_url
            .join("/api/embed")
            .context("Failed to build embedding URL")?;

        let request_json = serde_json::to_string(&EmbedRequest {
            model,
            inputs: [text],
        })
        .context("Failed to serialize embedding request")?;

        let response_text = self
            .agent
            .post(url.as_str())
            .header("Content-Type", "application/json")
            .send(&request_json)
            .and_then(|mut resp| resp.body_mut().read_to_string())
            .context("Failed to generate embedding")?;

        let response: EmbedResponse =
            serde_json::from_str(&response_text).context("Failed to parse embedding response")?;

        response
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Embedding response contained no vectors"))
    }
}

#[async_trait]
impl EmbeddingBackend for OllamaBackend {
    async fn ping(&self) -> bool {
        let client = self.clone();
        match tokio::task::spawn_blocking(move || client.ping_blocking()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Ollama is not reachable at {}: {:#}", self.base_url, e);
                false
            }
            Err(e) => {
                warn!("Ollama ping task failed: {}", e);
                false
            }
        }
    }

    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f64>> {
        let client = self.clone();
        let model = model.to_string();
        let text = text.to_string();
        tokio::task::spawn_blocking(move || client.embed_blocking(&model, &text))
            .await
            .context("Embedding task failed")?
    }
}
