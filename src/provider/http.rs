//! OpenAI-compatible HTTP provider.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use serde_json::Value;
use tracing::debug;

use super::traits::{ChatProvider, ChatRequest, ChunkStream};

/// Chat provider speaking the `chat/completions` protocol over HTTP.
#[derive(Debug, Clone)]
pub struct HttpChatProvider {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpChatProvider {
    pub fn new(base_url: &str, endpoint: &str, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!(
                "{}/{}",
                base_url.trim_end_matches('/'),
                endpoint.trim_start_matches('/')
            ),
            api_key,
        }
    }

    /// Build a provider from the `[provider]` section, reading the API key
    /// from the configured environment variable.
    #[cfg(feature = "config")]
    pub fn from_config(
        config: &crate::config::ProviderConfig,
        env: &crate::config::EnvironmentLoader,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        let mut provider = Self::new(
            &config.base_url,
            &config.endpoint,
            env.llm_api_key(&config.api_key_env),
        );
        provider.client = client;
        Ok(provider)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn post(&self, body: &Value, accept: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", accept)
            .json(body);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }
        builder
    }
}

/// Split complete SSE events off the front of `buffer`, returning their
/// `data:` payloads. `None` in the output marks `[DONE]`.
///
/// The buffer holds raw bytes so a multibyte character or a `\r\n` pair
/// split across network chunks stays intact in the incomplete tail.
pub fn drain_sse_data(buffer: &mut Vec<u8>) -> Vec<Option<String>> {
    normalize_crlf(buffer);
    let mut out = Vec::new();
    while let Some(end) = buffer.windows(2).position(|w| w == b"\n\n") {
        let raw: Vec<u8> = buffer.drain(..end + 2).collect();
        let event = match String::from_utf8(raw) {
            Ok(event) => event,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        };
        let data: Vec<&str> = event
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|d| d.strip_prefix(' ').unwrap_or(d))
            .collect();
        if data.is_empty() {
            continue;
        }
        let payload = data.join("\n");
        if payload.trim() == "[DONE]" {
            out.push(None);
        } else {
            out.push(Some(payload));
        }
    }
    out
}

/// Collapse every `\r\n` in place. A trailing `\r` is kept until its `\n`
/// arrives.
fn normalize_crlf(buffer: &mut Vec<u8>) {
    let mut write = 0;
    for read in 0..buffer.len() {
        let byte = buffer[read];
        if byte == b'\r' && buffer.get(read + 1) == Some(&b'\n') {
            continue;
        }
        buffer[write] = byte;
        write += 1;
    }
    buffer.truncate(write);
}

#[async_trait::async_trait]
impl ChatProvider for HttpChatProvider {
    async fn complete(&self, request: &ChatRequest) -> Result<Value> {
        debug!(url = %self.url, model = %request.model, "chat completion");
        let response = self
            .post(&request.to_openai_body(false), "application/json")
            .send()
            .await
            .context("HTTP request failed")?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error {}: {}", status, error_body);
        }
        response
            .json::<Value>()
            .await
            .context("Failed to decode completion body")
    }

    async fn stream(&self, request: &ChatRequest) -> Result<ChunkStream> {
        debug!(url = %self.url, model = %request.model, "chat stream");
        let response = self
            .post(&request.to_openai_body(true), "text/event-stream")
            .send()
            .await
            .context("HTTP streaming request failed")?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error {}: {}", status, error_body);
        }

        let mut byte_stream = response.bytes_stream();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<String>>();

        tokio::spawn(async move {
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk_result) = byte_stream.next().await {
                match chunk_result {
                    Ok(bytes) => {
                        buffer.extend_from_slice(&bytes);
                        for payload in drain_sse_data(&mut buffer) {
                            match payload {
                                Some(data) => {
                                    if tx.send(Ok(data)).is_err() {
                                        return;
                                    }
                                }
                                None => return,
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(anyhow::anyhow!("stream read failed: {}", e)));
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }

    fn provider_name(&self) -> &str {
        "openai-compatible"
    }
}
