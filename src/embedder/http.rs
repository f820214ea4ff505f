//! Blocking client for OpenAI-compatible embedding servers hosting a joint
//! text/image model (BiomedCLIP and similar CLIP variants).
//!
//! Text goes out as plain strings; images go out as base64 data URLs with
//! `"modality": "image"`, which is how infinity-style servers route CLIP
//! vision inputs.

use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{truncate_to_tokens, Embedder};

/// Blocking embeddings client with bounded retries.
#[derive(Clone)]
pub struct HttpEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    max_retries: usize,
}

impl HttpEmbedder {
    /// Builds a new client. `api_key` may be empty for unauthenticated local servers.
    pub fn new(
        api_key: Option<String>,
        base_url: String,
        model: String,
        timeout: Duration,
        max_retries: usize,
    ) -> Result<Self> {
        anyhow::ensure!(!model.trim().is_empty(), "missing embedding model name");
        anyhow::ensure!(
            base_url.starts_with("http://") || base_url.starts_with("https://"),
            "embedding base URL must be an http(s) URL"
        );
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = api_key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
            let auth = format!("Bearer {key}");
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth).context("invalid embedding API key")?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build embedding HTTP client")?;
        let endpoint = format!("{}/embeddings", base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            model,
            max_retries: max_retries.max(1),
        })
    }

    fn embed_one(&self, input: String, modality: Option<&'static str>) -> Result<Vec<f32>> {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match self.send_once(&input, modality) {
                Ok(embedding) => return Ok(embedding),
                Err(failure) if failure.retryable && attempt < self.max_retries => {
                    warn!(attempt, error = %failure.error, "embedding request failed, retrying");
                    thread::sleep(retry_backoff(attempt));
                }
                Err(failure) => return Err(failure.error),
            }
        }
    }

    fn send_once(
        &self,
        input: &str,
        modality: Option<&'static str>,
    ) -> std::result::Result<Vec<f32>, FailedAttempt> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: [input],
            modality,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(|err| FailedAttempt {
                retryable: is_retryable_error(&err),
                error: anyhow::Error::new(err).context("embedding request failed"),
            })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(FailedAttempt {
                retryable: should_retry(status),
                error: anyhow!("embedding request failed ({}): {}", status, body),
            });
        }
        let parsed: EmbeddingResponse = resp
            .json()
            .context("failed to parse embedding response")
            .map_err(FailedAttempt::fatal)?;
        parsed
            .data
            .into_iter()
            .min_by_key(|entry| entry.index)
            .map(|entry| entry.embedding)
            .ok_or_else(|| FailedAttempt::fatal(anyhow!("embedding response contained no vectors")))
    }
}

/// One unsuccessful request and whether another attempt may help.
struct FailedAttempt {
    error: anyhow::Error,
    retryable: bool,
}

impl FailedAttempt {
    fn fatal(error: anyhow::Error) -> Self {
        Self {
            error,
            retryable: false,
        }
    }
}

impl Embedder for HttpEmbedder {
    fn encode_text(&self, text: &str, max_tokens: usize) -> Result<Vec<f32>> {
        let truncated = truncate_to_tokens(text, max_tokens);
        if truncated.len() < text.len() {
            debug!(
                original_bytes = text.len(),
                kept_bytes = truncated.len(),
                max_tokens,
                "truncated text input"
            );
        }
        self.embed_one(truncated.to_string(), None)
    }

    fn encode_image(&self, image: &[u8]) -> Result<Vec<f32>> {
        anyhow::ensure!(!image.is_empty(), "image payload is empty");
        let data_url = format!("data:{};base64,{}", sniff_mime(image), BASE64.encode(image));
        self.embed_one(data_url, Some("image"))
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

fn sniff_mime(image: &[u8]) -> &'static str {
    if image.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if image.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else {
        "application/octet-stream"
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_body() || err.is_request()
}

fn retry_backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(500 * (1 << capped))
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    modality: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}
