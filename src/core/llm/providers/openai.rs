use std::time::Instant;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{GENERATE_TIMEOUT, LIST_TIMEOUT, failure, resolve};
use crate::core::llm::{GenerationOptions, GenerationResult, Provider};
use crate::core::models::{ModelInfo, ProviderKind};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

// ── Chat-completions request/response ──

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

#[derive(Deserialize)]
struct ModelListResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

pub struct OpenAiProvider {
    api_key: String,
    base_url: String,
    client: Client,
}

impl OpenAiProvider {
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
impl Provider for OpenAiProvider {
    fn name(&self) -> ProviderKind {
        ProviderKind::Openai
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

    async fn list_models(&self, api_key: &str, base_url: &str) -> Result<Vec<ModelInfo>> {
        let api_key = resolve(Some(api_key), &self.api_key);
        let base_url = if base_url.is_empty() {
            DEFAULT_BASE_URL
        } else {
            base_url
        };

        let res = self
            .client
            .get(format!("{base_url}/models"))
            .timeout(LIST_TIMEOUT)
            .bearer_auth(api_key)
            .send()
            .await
            .context("failed to list models")?;

        let status = res.status();
        let body = res.text().await.context("failed to read response")?;
        if !status.is_success() {
            bail!("API error: {body}");
        }

        let parsed: ModelListResponse =
            serde_json::from_str(&body).context("failed to parse response")?;

        let mut models = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for entry in parsed.data {
            if !is_text_completion_model(&entry.id) || !seen.insert(entry.id.clone()) {
                continue;
            }
            models.push(ModelInfo {
                name: entry.id.clone(),
                description: format!("OpenAI {}", entry.id),
                id: entry.id,
            });
        }

        Ok(models)
    }

    fn validate(&self, opts: &GenerationOptions) -> Result<()> {
        if resolve(opts.api_key.as_deref(), &self.api_key).is_empty() {
            bail!("api_key is required");
        }
        Ok(())
    }
}

/// Chat-capable GPT models only: no fine-tuned variants (`:` in the id), no
/// embedding, vision/image, or audio models.
fn is_text_completion_model(id: &str) -> bool {
    let lower = id.to_lowercase();

    lower.starts_with("gpt-")
        && !id.contains(':')
        && !lower.contains("embed")
        && !lower.contains("vision")
        && !lower.contains("image")
        && !lower.contains("whisper")
        && !lower.contains("audio")
}
