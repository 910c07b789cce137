pub mod anthropic;
pub mod google;
pub mod ollama;
pub mod openai;
pub mod perplexity;

use std::time::{Duration, Instant};

use crate::core::llm::GenerationResult;
use crate::core::models::ProviderKind;

/// Request timeout for hosted-provider generation calls.
pub(crate) const GENERATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Request timeout for model-listing calls.
pub(crate) const LIST_TIMEOUT: Duration = Duration::from_secs(30);

/// A closed attempt that failed in the provider-reported channel.
pub(crate) fn failure(provider: ProviderKind, error: String, started: Instant) -> GenerationResult {
    GenerationResult {
        provider: provider.to_string(),
        error,
        latency_ms: started.elapsed().as_millis() as i64,
        ..Default::default()
    }
}

/// Pick the per-call override when present and non-empty, else the value the
/// adapter was constructed with.
pub(crate) fn resolve<'a>(override_value: Option<&'a str>, configured: &'a str) -> &'a str {
    match override_value {
        Some(v) if !v.is_empty() => v,
        _ => configured,
    }
}
