use std::time::Instant;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{GENERATE_TIMEOUT, failure, resolve};
use crate::core::llm::{GenerationOptions, GenerationResult, Provider};
use crate::core::models::{ModelInfo, ProviderKind};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_MODEL: &str = "claude-3-7-sonnet-20250219";
const API_VERSION: &str = "2023-06-01";

// ── Messages API request/response ──

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
    temperature: f64,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: MessagesUsage,
    #[serde(default)]
    model: String,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
}

pub struct AnthropicProvider {
    api_key: String,
    base_url: String,
    client: Client,
}

impl AnthropicProvider {
    pub fn new(api_key: &str, base_url: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            base_url: if base_url.is_empty() {
                DEFAULT_BASE_URL.to_string()
            } else {
                base_url.to_string()
            },
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn generate(&self, prompt: &str, opts: &GenerationOptions) -> Result<GenerationResult> {
        let started = Instant::now();

        let model = if opts.model.is_empty() {
            DEFAULT_MODEL
        } else {
            &opts.model
        };
        let api_key = resolve(opts.api_key.as_deref(), &self.api_key);
        let base_url = resolve(opts.base_url.as_deref(), &self.base_url);

        let request = MessagesRequest {
            model,
            max_tokens: opts.max_tokens_or_default(),
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
            temperature: opts.temperature_or_default(),
        };

        let res = self
            .client
            .post(format!("{base_url}/messages"))
            .timeout(GENERATE_TIMEOUT)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await;

        let res = match res {
            Ok(res) => res,
            Err(e) => return Ok(failure(self.name(), e.to_string(), started)),
        };

        let status = res.status();
        let body = res.text().await.context("failed to read response")?;

        if !status.is_success() {
            return Ok(failure(self.name(), format!("API error: {body}"), started));
        }

        let parsed: MessagesResponse =
            serde_json::from_str(&body).context("failed to parse response")?;

        if parsed.content.is_empty() {
            return Ok(failure(
                self.name(),
                "no content returned from API".to_string(),
                started,
            ));
        }

        let text = parsed
            .content
            .into_iter()
            .map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        Ok(GenerationResult {
            text,
            tokens_used: parsed.usage.input_tokens + parsed.usage.output_tokens,
            latency_ms: started.elapsed().as_millis() as i64,
            model: parsed.model,
            provider: self.name().to_string(),
            error: String::new(),
        })
    }

    // Anthropic has no public model-listing endpoint; return the curated
    // text-generation lineup.
    async fn list_models(&self, _api_key: &str, _base_url: &str) -> Result<Vec<ModelInfo>> {
        Ok(vec![
            ModelInfo {
                id: "claude-3-5-sonnet-20241022".to_string(),
                name: "Claude 3.5 Sonnet".to_string(),
                description: "Most intelligent model, best for complex tasks".to_string(),
            },
            ModelInfo {
                id: "claude-3-5-haiku-20241022".to_string(),
                name: "Claude 3.5 Haiku".to_string(),
                description: "Fastest model, best for simple tasks".to_string(),
            },
            ModelInfo {
                id: "claude-3-opus-20240229".to_string(),
                name: "Claude 3 Opus".to_string(),
                description: "Powerful model for highly complex tasks".to_string(),
            },
            ModelInfo {
                id: "claude-3-sonnet-20240229".to_string(),
                name: "Claude 3 Sonnet".to_string(),
                description: "Balanced performance and speed".to_string(),
            },
            ModelInfo {
                id: "claude-3-haiku-20240307".to_string(),
                name: "Claude 3 Haiku".to_string(),
                description: "Fast and compact model".to_string(),
            },
        ])
    }

    fn validate(&self, opts: &GenerationOptions) -> Result<()> {
        if resolve(opts.api_key.as_deref(), &self.api_key).is_empty() {
            bail!("api_key is required");
        }
        Ok(())
    }
}
