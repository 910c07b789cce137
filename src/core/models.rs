use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The closed set of provider back-end families the engine recognises.
/// Unknown tags are rejected at configuration load and by the store's
/// CHECK constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Openai,
    Anthropic,
    Ollama,
    Google,
    Perplexity,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [
        ProviderKind::Openai,
        ProviderKind::Anthropic,
        ProviderKind::Ollama,
        ProviderKind::Google,
        ProviderKind::Perplexity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Openai => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Google => "google",
            ProviderKind::Perplexity => "perplexity",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(ProviderKind::Openai),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "ollama" => Ok(ProviderKind::Ollama),
            "google" => Ok(ProviderKind::Google),
            "perplexity" => Ok(ProviderKind::Perplexity),
            other => Err(format!("unknown provider tag: {other}")),
        }
    }
}

/// An external model binding owned by the configuration store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub id: String,
    pub name: String,
    pub provider: ProviderKind,
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A prompt template. The engine never rewrites the template text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub id: String,
    pub template: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Sampling temperature for a schedule.
///
/// Persisted as a REAL: a fixed value in `[0, 1]`, or the sentinel `-1.0`
/// for "draw uniformly once per prompt at dispatch time". Responses always
/// carry the resolved value, never the sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "value")]
pub enum Temperature {
    Fixed(f64),
    RandomPerPrompt,
}

impl Temperature {
    pub const SENTINEL: f64 = -1.0;

    /// The REAL persisted in the schedules table.
    pub fn as_stored(&self) -> f64 {
        match self {
            Temperature::Fixed(t) => *t,
            Temperature::RandomPerPrompt => Self::SENTINEL,
        }
    }

    /// Decode the stored REAL. Rejects values outside `[0, 1] ∪ {-1}`.
    pub fn from_stored(value: f64) -> Result<Self, String> {
        if value == Self::SENTINEL {
            Ok(Temperature::RandomPerPrompt)
        } else if (0.0..=1.0).contains(&value) {
            Ok(Temperature::Fixed(value))
        } else {
            Err(format!("temperature out of range: {value}"))
        }
    }
}

/// A named execution plan: cron trigger plus a (prompt × model) matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub prompt_ids: Vec<String>,
    pub llm_ids: Vec<String>,
    pub cron_expr: String,
    pub temperature: Temperature,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The persisted outcome of one execution attempt. Created once, never
/// mutated, destroyed only by bulk reset.
///
/// `llm_name`, `llm_provider`, and `llm_model` are snapshots taken at
/// dispatch time; deleting the referenced config later leaves them intact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub prompt_id: String,
    pub prompt_text: String,
    pub llm_id: String,
    pub llm_name: String,
    pub llm_provider: String,
    pub llm_model: String,
    pub response_text: String,
    pub temperature: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub schedule_id: String,
    pub tokens_used: i64,
    pub latency_ms: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// A model advertised by a provider's listing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Filter for response listings. All fields combine conjunctively; the
/// time window is inclusive on both ends.
#[derive(Debug, Clone, Default)]
pub struct ResponseFilter {
    pub prompt_id: Option<String>,
    pub llm_id: Option<String>,
    pub schedule_id: Option<String>,
    pub keyword: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// On-demand aggregate for one keyword. Derived, never persisted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct KeywordStats {
    pub keyword: String,
    pub total_mentions: usize,
    pub unique_prompts: usize,
    pub unique_llms: usize,
    pub by_prompt: BTreeMap<String, usize>,
    pub by_llm: BTreeMap<String, usize>,
    pub by_provider: BTreeMap<String, usize>,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// (keyword, count) pair for top-K reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeywordCount {
    pub keyword: String,
    pub count: usize,
}
