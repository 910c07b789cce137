use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Top-level application configuration, read once at startup and never
/// rewritten by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Relational store for model configs and schedules.
    pub sql_database: StoreConfig,
    /// Document store for prompts and responses.
    pub nosql_database: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub provider: String,
    pub uri: String,
    pub database: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sql_database: StoreConfig {
                provider: "sqlite".to_string(),
                uri: "promptpulse.db".to_string(),
                database: "promptpulse".to_string(),
                options: BTreeMap::new(),
            },
            nosql_database: StoreConfig {
                provider: "sqlite".to_string(),
                uri: "promptpulse-docs.db".to_string(),
                database: "promptpulse".to_string(),
                options: BTreeMap::new(),
            },
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (section, store) in [
            ("sql_database", &self.sql_database),
            ("nosql_database", &self.nosql_database),
        ] {
            if store.uri.is_empty() {
                bail!("{section}: uri must not be empty");
            }
            if store.provider != "sqlite" {
                bail!(
                    "{section}: unsupported store provider: {}",
                    store.provider
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_section_document() {
        let yaml = "
sql_database:
  provider: sqlite
  uri: config.db
  database: pulse
nosql_database:
  provider: sqlite
  uri: docs.db
  database: pulse
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.sql_database.uri, "config.db");
        assert_eq!(config.nosql_database.uri, "docs.db");
        config.validate().unwrap();
    }

    #[test]
    fn rejects_unknown_store_provider() {
        let mut config = Config::default();
        config.nosql_database.provider = "mongodb".to_string();
        assert!(config.validate().is_err());
    }
}
