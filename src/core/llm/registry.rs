use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use tracing::{info, warn};

use crate::core::llm::Provider;
use crate::core::llm::providers;
use crate::core::models::ProviderKind;
use crate::core::store::Database;
use crate::logging::mask_api_key;

/// Process-wide mapping from provider name to adapter instance.
///
/// Writes happen during initialisation only (last writer wins); afterwards
/// the map is read-only and lookups are uncontended.
#[derive(Default)]
pub struct Registry {
    providers: RwLock<HashMap<ProviderKind, Arc<dyn Provider>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider: Arc<dyn Provider>) {
        let name = provider.name();
        info!("Registered LLM provider: {}", name);
        self.providers.write().unwrap().insert(name, provider);
    }

    pub fn get(&self, name: ProviderKind) -> Option<Arc<dyn Provider>> {
        self.providers.read().unwrap().get(&name).cloned()
    }

    pub fn list(&self) -> Vec<ProviderKind> {
        self.providers.read().unwrap().keys().copied().collect()
    }
}

/// Build an adapter for one provider family with the given credentials.
pub fn make_provider(kind: ProviderKind, api_key: &str, base_url: &str) -> Arc<dyn Provider> {
    match kind {
        ProviderKind::Openai => Arc::new(providers::openai::OpenAiProvider::new(api_key, base_url)),
        ProviderKind::Anthropic => {
            Arc::new(providers::anthropic::AnthropicProvider::new(api_key, base_url))
        }
        ProviderKind::Ollama => Arc::new(providers::ollama::OllamaProvider::new(base_url)),
        ProviderKind::Google => Arc::new(providers::google::GoogleProvider::new(api_key, base_url)),
        ProviderKind::Perplexity => {
            Arc::new(providers::perplexity::PerplexityProvider::new(api_key, base_url))
        }
    }
}

/// Populate the registry: zero-credential placeholders for every provider
/// family first, then one per-credential adapter per enabled stored model
/// config so real credentials override the placeholders of the same name.
pub async fn bootstrap(registry: &Registry, store: &dyn Database) -> Result<()> {
    for kind in ProviderKind::ALL {
        registry.register(make_provider(kind, "", ""));
    }

    let configs = match store.list_llms(Some(true)).await {
        Ok(configs) => configs,
        Err(e) => {
            warn!("Could not load model configs for provider bootstrap: {e:#}");
            return Ok(());
        }
    };

    for config in configs {
        info!(
            "Binding provider {} to stored credentials (key {})",
            config.provider,
            mask_api_key(&config.api_key)
        );
        registry.register(make_provider(
            config.provider,
            &config.api_key,
            &config.base_url,
        ));
    }

    Ok(())
}
