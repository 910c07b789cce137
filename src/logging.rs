use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` level. Safe to call more than once (later calls are no-ops).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Mask an API key for logging (first 4 and last 4 characters only).
pub fn mask_api_key(api_key: &str) -> String {
    if api_key.is_empty() {
        return "(not set)".to_string();
    }
    if api_key.len() <= 8 {
        return "***".to_string();
    }
    format!("{}...{}", &api_key[..4], &api_key[api_key.len() - 4..])
}
