use std::time::Instant;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{GENERATE_TIMEOUT, failure, resolve};
use crate::core::llm::{GenerationOptions, GenerationResult, Provider};
use crate::core::models::{ModelInfo, ProviderKind};

const DEFAULT_BASE_URL: &str = "https://api.perplexity.ai";
const DEFAULT_MODEL: &str = "sonar";

// ── OpenAI-compatible chat-completions request/response ──

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: ChatUsage,
    #[serde(default)]
    model: String,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageOwned,
}

#[derive(Deserialize)]
struct ChatMessageOwned {
    content: String,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: i64,
}

pub struct PerplexityProvider {
    api_key: String,
    base_url: String,
    client: Client,
}

impl PerplexityProvider {
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
impl Provider for PerplexityProvider {
    fn name(&self) -> ProviderKind {
        ProviderKind::Perplexity
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

        let request = ChatRequest {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: opts.temperature_or_default(),
            max_tokens: opts.max_tokens_or_default(),
        };

        let res = self
            .client
            .post(format!("{base_url}/chat/completions"))
            .timeout(GENERATE_TIMEOUT)
            .bearer_auth(api_key)
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

        let parsed: ChatResponse =
            serde_json::from_str(&body).context("failed to parse response")?;

        let Some(choice) = parsed.choices.into_iter().next() else {
            return Ok(failure(
                self.name(),
                "no choices returned from API".to_string(),
                started,
            ));
        };

        Ok(GenerationResult {
            text: choice.message.content,
            tokens_used: parsed.usage.total_tokens,
            latency_ms: started.elapsed().as_millis() as i64,
            model: parsed.model,
            provider: self.name().to_string(),
            error: String::new(),
        })
    }

    // Perplexity publishes no model-listing endpoint; return the online
    // text-generation lineup.
    async fn list_models(&self, _api_key: &str, _base_url: &str) -> Result<Vec<ModelInfo>> {
        Ok(vec![
            ModelInfo {
                id: "sonar".to_string(),
                name: "Sonar".to_string(),
                description: "Fast online model with web grounding".to_string(),
            },
            ModelInfo {
                id: "sonar-pro".to_string(),
                name: "Sonar Pro".to_string(),
                description: "Advanced online model for complex queries".to_string(),
            },
            ModelInfo {
                id: "sonar-reasoning".to_string(),
                name: "Sonar Reasoning".to_string(),
                description: "Chain-of-thought online reasoning model".to_string(),
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
