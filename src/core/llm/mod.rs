pub mod providers;
pub mod registry;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::core::models::{ModelInfo, ProviderKind};

pub use registry::Registry;

/// Default sampling temperature when the caller supplies none.
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Default completion budget when the caller supplies none.
pub const DEFAULT_MAX_TOKENS: u32 = 1000;

/// Configuration bag for one generation call.
///
/// Adapters read the recognised fields and ignore everything in `extra`
/// they do not understand.
#[derive(Debug, Clone, Default)]
pub struct GenerationOptions {
    pub model: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl GenerationOptions {
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn temperature_or_default(&self) -> f64 {
        self.temperature.unwrap_or(DEFAULT_TEMPERATURE)
    }

    pub fn max_tokens_or_default(&self) -> u32 {
        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }
}

/// Outcome of one adapter call.
///
/// Failure travels on two channels: transport/protocol failures are returned
/// as `Err` from `generate`, while provider-reported errors arrive here in
/// `error` with an otherwise valid result. The engine treats both as
/// failures.
#[derive(Debug, Clone, Default)]
pub struct GenerationResult {
    pub text: String,
    pub tokens_used: i64,
    pub latency_ms: i64,
    pub model: String,
    pub provider: String,
    pub error: String,
}

/// Uniform capability over heterogeneous model back-ends.
///
/// Implementations must be safe for concurrent use; the engine shares one
/// adapter instance across all schedules that target its provider name.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> ProviderKind;

    /// Send one prompt and return the completion. Cancellation is observed
    /// by dropping the returned future.
    async fn generate(&self, prompt: &str, opts: &GenerationOptions) -> Result<GenerationResult>;

    /// List text-completion-capable models (embedding, vision, audio, and
    /// fine-tuned variants are filtered out).
    async fn list_models(&self, api_key: &str, base_url: &str) -> Result<Vec<ModelInfo>>;

    /// Side-effect-free structural validation of an options bag.
    fn validate(&self, opts: &GenerationOptions) -> Result<()>;
}
