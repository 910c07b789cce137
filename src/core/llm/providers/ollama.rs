use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{LIST_TIMEOUT, failure, resolve};
use crate::core::llm::{GenerationOptions, GenerationResult, Provider};
use crate::core::models::{ModelInfo, ProviderKind};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "llama2";

// Local inference can be slow; allow twice the hosted-provider budget.
const OLLAMA_GENERATE_TIMEOUT: Duration = Duration::from_secs(120);

// ── /api/generate request/response ──

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: SamplingOptions,
}

#[derive(Serialize)]
struct SamplingOptions {
    temperature: f64,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    response: String,
    #[serde(default)]
    context: Vec<i64>,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
    #[serde(default)]
    size: i64,
}

pub struct OllamaProvider {
    base_url: String,
    client: Client,
}

impl OllamaProvider {
    pub fn new(base_url: &str) -> Self {
        Self {
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
impl Provider for OllamaProvider {
    fn name(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    async fn generate(&self, prompt: &str, opts: &GenerationOptions) -> Result<GenerationResult> {
        let started = Instant::now();

        let model = if opts.model.is_empty() {
            DEFAULT_MODEL
        } else {
            &opts.model
        };
        let base_url = resolve(opts.base_url.as_deref(), &self.base_url);

        let request = GenerateRequest {
            model,
            prompt,
            stream: false,
            options: SamplingOptions {
                temperature: opts.temperature_or_default(),
            },
        };

        let res = self
            .client
            .post(format!("{base_url}/api/generate"))
            .timeout(OLLAMA_GENERATE_TIMEOUT)
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

        let parsed: GenerateResponse =
            serde_json::from_str(&body).context("failed to parse response")?;

        // Ollama reports no token usage; the context length is the closest
        // available estimate.
        Ok(GenerationResult {
            tokens_used: parsed.context.len() as i64,
            text: parsed.response,
            latency_ms: started.elapsed().as_millis() as i64,
            model: parsed.model,
            provider: self.name().to_string(),
            error: String::new(),
        })
    }

    async fn list_models(&self, _api_key: &str, base_url: &str) -> Result<Vec<ModelInfo>> {
        let base_url = resolve(Some(base_url), &self.base_url);

        let res = self
            .client
            .get(format!("{base_url}/api/tags"))
            .timeout(LIST_TIMEOUT)
            .send()
            .await
            .context("failed to list models")?;

        let status = res.status();
        let body = res.text().await.context("failed to read response")?;
        if !status.is_success() {
            bail!("API error: {body}");
        }

        let parsed: TagsResponse =
            serde_json::from_str(&body).context("failed to parse response")?;

        let mut models = Vec::new();
        for entry in parsed.models {
            if !is_text_model(&entry.name) {
                continue;
            }
            let gigabytes = entry.size as f64 / (1024.0 * 1024.0 * 1024.0);
            models.push(ModelInfo {
                description: format!("Ollama {} ({gigabytes:.2} GB)", entry.name),
                id: entry.name.clone(),
                name: entry.name,
            });
        }

        Ok(models)
    }

    // Ollama needs no API key, just a reachable endpoint.
    fn validate(&self, _opts: &GenerationOptions) -> Result<()> {
        Ok(())
    }
}

fn is_text_model(name: &str) -> bool {
    let lower = name.to_lowercase();

    if lower.contains("embed") || lower.contains("embedding") {
        return false;
    }
    if lower.contains("vision") || lower.contains("image") || lower.contains("clip") {
        return false;
    }
    if lower.contains("code") && !lower.contains("llama") && !lower.contains("mistral") {
        return false;
    }
    if lower.contains("multimodal") && !lower.contains("llama") {
        return false;
    }

    true
}
