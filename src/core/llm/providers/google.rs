use std::time::Instant;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{GENERATE_TIMEOUT, LIST_TIMEOUT, failure, resolve};
use crate::core::llm::{GenerationOptions, GenerationResult, Provider};
use crate::core::models::{ModelInfo, ProviderKind};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-pro";

// ── generateContent request/response ──

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f64,
    #[serde(rename = "topP")]
    top_p: f64,
    #[serde(rename = "topK")]
    top_k: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default, rename = "usageMetadata")]
    usage_metadata: UsageMetadata,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
struct UsageMetadata {
    #[serde(default, rename = "totalTokenCount")]
    total_token_count: i64,
}

#[derive(Deserialize)]
struct ApiErrorResponse {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct ModelListResponse {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, rename = "supportedGenerationMethods")]
    supported_generation_methods: Vec<String>,
}

pub struct GoogleProvider {
    api_key: String,
    base_url: String,
    client: Client,
}

impl GoogleProvider {
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
impl Provider for GoogleProvider {
    fn name(&self) -> ProviderKind {
        ProviderKind::Google
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

        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: opts.temperature_or_default(),
                top_p: parse_extra(opts, "top_p").unwrap_or(0.8),
                top_k: parse_extra(opts, "top_k").map(|v: f64| v as u32).unwrap_or(40),
            },
        };

        // Model id lives in the path; the key travels as a query parameter.
        let url = format!("{base_url}/models/{model}:generateContent?key={api_key}");

        let res = self
            .client
            .post(url)
            .timeout(GENERATE_TIMEOUT)
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
            let error = match serde_json::from_str::<ApiErrorResponse>(&body) {
                Ok(parsed) => format!(
                    "Google AI API error ({}): {}",
                    parsed.error.code, parsed.error.message
                ),
                Err(_) => format!("HTTP {}: {body}", status.as_u16()),
            };
            return Ok(failure(self.name(), error, started));
        }

        let parsed: GenerateResponse =
            serde_json::from_str(&body).context("failed to parse response")?;

        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .unwrap_or_default();

        if text.is_empty() {
            return Ok(failure(
                self.name(),
                "no candidates returned from API".to_string(),
                started,
            ));
        }

        Ok(GenerationResult {
            text,
            tokens_used: parsed.usage_metadata.total_token_count,
            latency_ms: started.elapsed().as_millis() as i64,
            model: model.to_string(),
            provider: self.name().to_string(),
            error: String::new(),
        })
    }

    async fn list_models(&self, api_key: &str, base_url: &str) -> Result<Vec<ModelInfo>> {
        let api_key = resolve(Some(api_key), &self.api_key);
        let base_url = resolve(Some(base_url), &self.base_url);

        let res = self
            .client
            .get(format!("{base_url}/models?key={api_key}"))
            .timeout(LIST_TIMEOUT)
            .send()
            .await
            .context("failed to list models")?;

        let status = res.status();
        let body = res.text().await.context("failed to read response")?;

        if !status.is_success() {
            match serde_json::from_str::<ApiErrorResponse>(&body) {
                Ok(parsed) => bail!(
                    "Google AI API error ({}): {}",
                    parsed.error.code,
                    parsed.error.message
                ),
                Err(_) => bail!("HTTP {}: {body}", status.as_u16()),
            }
        }

        let parsed: ModelListResponse =
            serde_json::from_str(&body).context("failed to parse response")?;

        let mut models = Vec::new();
        for entry in parsed.models {
            if !is_text_generation_model(&entry.name, &entry.supported_generation_methods) {
                continue;
            }
            let short_name = entry
                .name
                .strip_prefix("models/")
                .unwrap_or(&entry.name)
                .to_string();
            models.push(ModelInfo {
                id: entry.name,
                name: short_name,
                description: entry.description,
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

fn parse_extra(opts: &GenerationOptions, key: &str) -> Option<f64> {
    opts.extra.get(key)?.parse().ok()
}

/// generateContent-capable text models; embedding, vision/image, and
/// non-Gemini multimodal entries are excluded.
fn is_text_generation_model(name: &str, methods: &[String]) -> bool {
    if !methods.iter().any(|m| m == "generateContent") {
        return false;
    }

    let lower = name.to_lowercase();
    if lower.contains("embed") || lower.contains("embedding") {
        return false;
    }
    if lower.contains("vision") || lower.contains("image") {
        return false;
    }
    if lower.contains("multimodal") && !lower.contains("gemini") {
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_filter_requires_generate_content() {
        let generate = vec!["generateContent".to_string()];
        let embed = vec!["embedContent".to_string()];

        assert!(is_text_generation_model("models/gemini-pro", &generate));
        assert!(!is_text_generation_model("models/gemini-pro", &embed));
        assert!(!is_text_generation_model("models/text-embedding-004", &generate));
        assert!(!is_text_generation_model("models/gemini-pro-vision", &generate));
    }

    #[test]
    fn extra_bag_overrides_sampling_knobs() {
        let mut opts = GenerationOptions::for_model("gemini-pro");
        opts.extra.insert("top_p".to_string(), "0.5".to_string());
        assert_eq!(parse_extra(&opts, "top_p"), Some(0.5));
        assert_eq!(parse_extra(&opts, "top_k"), None);
        // Unknown keys stay ignored.
        opts.extra.insert("frobnicate".to_string(), "yes".to_string());
        assert_eq!(parse_extra(&opts, "top_k"), None);
    }
}
