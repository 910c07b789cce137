use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::engine::error::ExecutionError;
use crate::core::engine::governor::Governor;
use crate::core::engine::retry::RetryPolicy;
use crate::core::llm::{GenerationOptions, GenerationResult, Registry};
use crate::core::models::{LlmConfig, PromptTemplate, Response};
use crate::core::store::Database;

/// Executes one (prompt, model, temperature) attempt sequence and writes
/// exactly one Response row per terminal outcome, success or exhausted
/// failure. Snapshots of the model's human-readable fields are taken at
/// dispatch time, so later edits or deletions never touch history.
pub struct Executor {
    store: Arc<dyn Database>,
    registry: Arc<Registry>,
    governor: Arc<Governor>,
    retry: RetryPolicy,
}

impl Executor {
    pub fn new(
        store: Arc<dyn Database>,
        registry: Arc<Registry>,
        governor: Arc<Governor>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            registry,
            governor,
            retry,
        }
    }

    /// `temperature` is already resolved; the sentinel never reaches this
    /// point. An outcome persisted (even an error row) is a success from
    /// the caller's perspective; only cancellation and store failures
    /// surface as errors.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        prompt: &PromptTemplate,
        llm: &LlmConfig,
        temperature: f64,
        schedule_id: &str,
    ) -> Result<(), ExecutionError> {
        debug!(
            "Executing prompt '{}' with LLM '{}' ({})",
            prompt.id, llm.name, llm.provider
        );

        let Some(provider) = self.registry.get(llm.provider) else {
            warn!("Provider not found: {}", llm.provider);
            let response = build_response(
                prompt,
                llm,
                temperature,
                schedule_id,
                ResponseBody::Failure {
                    error: ExecutionError::ProviderNotFound(llm.provider.to_string()).to_string(),
                    latency_ms: 0,
                },
            );
            self.store
                .create_response(&response)
                .await
                .map_err(ExecutionError::Store)?;
            return Ok(());
        };

        self.governor
            .acquire(cancel, llm.provider.as_str())
            .await?;

        let opts = GenerationOptions {
            model: llm.model.clone(),
            temperature: Some(temperature),
            max_tokens: None,
            api_key: (!llm.api_key.is_empty()).then(|| llm.api_key.clone()),
            base_url: (!llm.base_url.is_empty()).then(|| llm.base_url.clone()),
            extra: llm.options.clone(),
        };

        let template = prompt.template.clone();
        let first_attempt_start = Instant::now();

        let outcome = self
            .retry
            .run(cancel, |_attempt| {
                let provider = provider.clone();
                let opts = opts.clone();
                let template = template.clone();
                async move {
                    match provider.generate(&template, &opts).await {
                        Ok(result) if result.error.is_empty() => Ok(result),
                        Ok(result) => Err(result.error),
                        Err(e) => Err(format!("failed to generate response: {e:#}")),
                    }
                }
            })
            .await;

        let response = match outcome {
            Ok((generation, attempt)) => {
                if attempt > 1 {
                    info!(
                        "Prompt {} succeeded on attempt {attempt} after {} failures",
                        prompt.id,
                        attempt - 1
                    );
                }
                build_response(
                    prompt,
                    llm,
                    temperature,
                    schedule_id,
                    ResponseBody::Success(generation),
                )
            }
            Err(ExecutionError::Generation(message)) => {
                warn!(
                    "Prompt {} with LLM {} exhausted retries: {message}",
                    prompt.id, llm.id
                );
                build_response(
                    prompt,
                    llm,
                    temperature,
                    schedule_id,
                    ResponseBody::Failure {
                        error: message,
                        latency_ms: first_attempt_start.elapsed().as_millis() as i64,
                    },
                )
            }
            Err(other) => return Err(other),
        };

        self.store
            .create_response(&response)
            .await
            .map_err(ExecutionError::Store)
    }
}

enum ResponseBody {
    Success(GenerationResult),
    Failure { error: String, latency_ms: i64 },
}

fn build_response(
    prompt: &PromptTemplate,
    llm: &LlmConfig,
    temperature: f64,
    schedule_id: &str,
    body: ResponseBody,
) -> Response {
    let (response_text, tokens_used, latency_ms, error) = match body {
        ResponseBody::Success(generation) => (
            generation.text,
            generation.tokens_used,
            generation.latency_ms,
            String::new(),
        ),
        ResponseBody::Failure { error, latency_ms } => (String::new(), 0, latency_ms, error),
    };

    Response {
        id: Uuid::new_v4().to_string(),
        prompt_id: prompt.id.clone(),
        prompt_text: prompt.template.clone(),
        llm_id: llm.id.clone(),
        llm_name: llm.name.clone(),
        llm_provider: llm.provider.to_string(),
        llm_model: llm.model.clone(),
        response_text,
        temperature,
        schedule_id: schedule_id.to_string(),
        tokens_used,
        latency_ms,
        error,
        metadata: BTreeMap::new(),
        created_at: Utc::now(),
    }
}
