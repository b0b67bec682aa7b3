//! Generative model invocation behind a provider-agnostic interface.
//!
//! Three concrete bindings, chosen by `LLM_PROVIDER`: a local-completion
//! endpoint, a chat-style API, and a generic HTTP binding tolerant of
//! several response field names. Retry/backoff here generalizes the
//! teacher's embedding-provider retry loop (exponential backoff, retry on
//! 429/5xx/network error, fail fast on other 4xx) from embedding calls to
//! text generation calls.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use crate::config::GenerativeConfig;

#[async_trait]
pub trait GenerativeProvider: Send + Sync {
    async fn generate(&self, prompt: &str, max_tokens: usize) -> Result<String>;
    fn name(&self) -> &str;
}

pub fn create_provider(config: &GenerativeConfig) -> Result<Box<dyn GenerativeProvider>> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(180))
        .build()
        .context("build http client")?;

    match config.provider.as_str() {
        "local-completion" => Ok(Box::new(LocalCompletionProvider {
            client,
            url: config.url.clone(),
            temperature: config.temperature,
            api_key: config.api_key.clone(),
        })),
        "chat" => Ok(Box::new(ChatProvider {
            client,
            url: config.url.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            api_key: config.api_key.clone(),
        })),
        "generic" => Ok(Box::new(GenericHttpProvider {
            client,
            url: config.url.clone(),
            temperature: config.temperature,
            api_key: config.api_key.clone(),
        })),
        other => bail!("unknown generative provider: {other}"),
    }
}

const MAX_RETRIES: u32 = 5;

async fn with_retry<F, Fut>(mut call: F) -> Result<reqwest::Response>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match call().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    return Ok(resp);
                }
                let retryable = status.as_u16() == 429 || status.is_server_error();
                if retryable && attempt <= MAX_RETRIES {
                    let backoff = Duration::from_secs(1u64 << (attempt - 1).min(5));
                    tracing::warn!(status = %status, attempt, "generative call failed, retrying");
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                let body = resp.text().await.unwrap_or_default();
                anyhow::bail!("generative call failed with status {status}: {body}");
            }
            Err(e) => {
                if attempt <= MAX_RETRIES && (e.is_timeout() || e.is_connect()) {
                    let backoff = Duration::from_secs(1u64 << (attempt - 1).min(5));
                    tracing::warn!(error = %e, attempt, "generative call network error, retrying");
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                return Err(e).context("generative call network error");
            }
        }
    }
}

struct LocalCompletionProvider {
    client: reqwest::Client,
    url: String,
    temperature: f32,
    api_key: Option<String>,
}

#[async_trait]
impl GenerativeProvider for LocalCompletionProvider {
    async fn generate(&self, prompt: &str, max_tokens: usize) -> Result<String> {
        let body = json!({
            "prompt": prompt,
            "n_predict": max_tokens,
            "temperature": self.temperature,
        });
        let resp = with_retry(|| {
            let mut req = self.client.post(&self.url).json(&body);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }
            req.send()
        })
        .await?;

        let value: serde_json::Value = resp.json().await.context("parse local-completion response")?;
        value
            .get("content")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("malformed local-completion response: {value}"))
    }

    fn name(&self) -> &str {
        "local-completion"
    }
}

struct ChatProvider {
    client: reqwest::Client,
    url: String,
    model: String,
    temperature: f32,
    api_key: Option<String>,
}

#[async_trait]
impl GenerativeProvider for ChatProvider {
    async fn generate(&self, prompt: &str, max_tokens: usize) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": max_tokens,
            "temperature": self.temperature,
        });
        let resp = with_retry(|| {
            let mut req = self.client.post(&self.url).json(&body);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }
            req.send()
        })
        .await?;

        let value: serde_json::Value = resp.json().await.context("parse chat response")?;
        value
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("malformed chat response: {value}"))
    }

    fn name(&self) -> &str {
        "chat"
    }
}

struct GenericHttpProvider {
    client: reqwest::Client,
    url: String,
    temperature: f32,
    api_key: Option<String>,
}

#[async_trait]
impl GenerativeProvider for GenericHttpProvider {
    async fn generate(&self, prompt: &str, max_tokens: usize) -> Result<String> {
        let body = json!({
            "prompt": prompt,
            "max_tokens": max_tokens,
            "temperature": self.temperature,
        });
        let resp = with_retry(|| {
            let mut req = self.client.post(&self.url).json(&body);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }
            req.send()
        })
        .await?;

        let value: serde_json::Value = resp.json().await.context("parse generic response")?;
        for field in ["text", "content", "response", "output", "generated_text"] {
            if let Some(s) = value.get(field).and_then(|v| v.as_str()) {
                return Ok(s.to_string());
            }
        }
        Err(anyhow::anyhow!("malformed generic response, no known field: {value}"))
    }

    fn name(&self) -> &str {
        "generic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_is_rejected() {
        let config = GenerativeConfig {
            provider: "not-a-provider".to_string(),
            url: "http://localhost".to_string(),
            model: "x".to_string(),
            temperature: 0.0,
            max_tokens: 256,
            api_key: None,
        };
        assert!(create_provider(&config).is_err());
    }
}
