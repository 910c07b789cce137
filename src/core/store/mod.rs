mod docs;
mod sqlite;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::config::Config;
use crate::core::models::{LlmConfig, PromptTemplate, Response, ResponseFilter, Schedule};

pub use docs::DocumentStore;
pub use sqlite::ConfigStore;

/// Combined store surface the engine consumes. Model configs and schedules
/// live in the relational store; prompts and responses in the document
/// store. Routing is an implementation detail of [`HybridStore`]; nothing
/// store-specific crosses this trait.
#[async_trait]
pub trait Database: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn ping(&self) -> Result<()>;

    // Model configs
    async fn create_llm(&self, llm: &LlmConfig) -> Result<()>;
    async fn get_llm(&self, id: &str) -> Result<LlmConfig>;
    async fn list_llms(&self, enabled: Option<bool>) -> Result<Vec<LlmConfig>>;
    async fn update_llm(&self, llm: &LlmConfig) -> Result<()>;
    async fn delete_llm(&self, id: &str) -> Result<()>;
    async fn delete_all_llms(&self) -> Result<usize>;

    // Schedules
    async fn create_schedule(&self, schedule: &Schedule) -> Result<()>;
    async fn get_schedule(&self, id: &str) -> Result<Schedule>;
    async fn list_schedules(&self, enabled: Option<bool>) -> Result<Vec<Schedule>>;
    async fn update_schedule(&self, schedule: &Schedule) -> Result<()>;
    /// Narrow update used after a firing; other fields stay untouched.
    async fn update_schedule_run_times(
        &self,
        id: &str,
        last_run: Option<DateTime<Utc>>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()>;
    async fn delete_schedule(&self, id: &str) -> Result<()>;
    async fn delete_all_schedules(&self) -> Result<usize>;

    // Prompts
    async fn create_prompt(&self, prompt: &PromptTemplate) -> Result<()>;
    async fn get_prompt(&self, id: &str) -> Result<PromptTemplate>;
    async fn list_prompts(&self, enabled: Option<bool>) -> Result<Vec<PromptTemplate>>;
    async fn update_prompt(&self, prompt: &PromptTemplate) -> Result<()>;
    async fn delete_prompt(&self, id: &str) -> Result<()>;
    async fn delete_all_prompts(&self) -> Result<usize>;

    // Responses
    async fn create_response(&self, response: &Response) -> Result<()>;
    async fn get_response(&self, id: &str) -> Result<Response>;
    async fn list_responses(&self, filter: &ResponseFilter) -> Result<Vec<Response>>;
    async fn delete_all_responses(&self) -> Result<usize>;
}

/// The two stores behind one interface.
pub struct HybridStore {
    sql: ConfigStore,
    docs: DocumentStore,
}

impl HybridStore {
    pub fn new(config: &Config) -> Self {
        Self {
            sql: ConfigStore::new(&config.sql_database.uri),
            docs: DocumentStore::new(&config.nosql_database.uri),
        }
    }
}

#[async_trait]
impl Database for HybridStore {
    async fn connect(&self) -> Result<()> {
        self.sql
            .connect()
            .await
            .context("failed to connect to SQL database")?;
        self.docs
            .connect()
            .await
            .context("failed to connect to document database")?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let sql = self.sql.disconnect().await;
        let docs = self.docs.disconnect().await;
        sql.context("failed to disconnect from SQL database")?;
        docs.context("failed to disconnect from document database")?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.sql.ping().await.context("SQL database ping failed")?;
        self.docs
            .ping()
            .await
            .context("document database ping failed")?;
        Ok(())
    }

    async fn create_llm(&self, llm: &LlmConfig) -> Result<()> {
        self.sql.create_llm(llm).await
    }

    async fn get_llm(&self, id: &str) -> Result<LlmConfig> {
        self.sql.get_llm(id).await
    }

    async fn list_llms(&self, enabled: Option<bool>) -> Result<Vec<LlmConfig>> {
        self.sql.list_llms(enabled).await
    }

    async fn update_llm(&self, llm: &LlmConfig) -> Result<()> {
        self.sql.update_llm(llm).await
    }

    async fn delete_llm(&self, id: &str) -> Result<()> {
        self.sql.delete_llm(id).await
    }

    async fn delete_all_llms(&self) -> Result<usize> {
        self.sql.delete_all_llms().await
    }

    async fn create_schedule(&self, schedule: &Schedule) -> Result<()> {
        self.sql.create_schedule(schedule).await
    }

    async fn get_schedule(&self, id: &str) -> Result<Schedule> {
        self.sql.get_schedule(id).await
    }

    async fn list_schedules(&self, enabled: Option<bool>) -> Result<Vec<Schedule>> {
        self.sql.list_schedules(enabled).await
    }

    async fn update_schedule(&self, schedule: &Schedule) -> Result<()> {
        self.sql.update_schedule(schedule).await
    }

    async fn update_schedule_run_times(
        &self,
        id: &str,
        last_run: Option<DateTime<Utc>>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.sql.update_schedule_run_times(id, last_run, next_run).await
    }

    async fn delete_schedule(&self, id: &str) -> Result<()> {
        self.sql.delete_schedule(id).await
    }

    async fn delete_all_schedules(&self) -> Result<usize> {
        self.sql.delete_all_schedules().await
    }

    async fn create_prompt(&self, prompt: &PromptTemplate) -> Result<()> {
        self.docs.create_prompt(prompt).await
    }

    async fn get_prompt(&self, id: &str) -> Result<PromptTemplate> {
        self.docs.get_prompt(id).await
    }

    async fn list_prompts(&self, enabled: Option<bool>) -> Result<Vec<PromptTemplate>> {
        self.docs.list_prompts(enabled).await
    }

    async fn update_prompt(&self, prompt: &PromptTemplate) -> Result<()> {
        self.docs.update_prompt(prompt).await
    }

    async fn delete_prompt(&self, id: &str) -> Result<()> {
        self.docs.delete_prompt(id).await
    }

    async fn delete_all_prompts(&self) -> Result<usize> {
        self.docs.delete_all_prompts().await
    }

    async fn create_response(&self, response: &Response) -> Result<()> {
        self.docs.create_response(response).await
    }

    async fn get_response(&self, id: &str) -> Result<Response> {
        self.docs.get_response(id).await
    }

    async fn list_responses(&self, filter: &ResponseFilter) -> Result<Vec<Response>> {
        self.docs.list_responses(filter).await
    }

    async fn delete_all_responses(&self) -> Result<usize> {
        self.docs.delete_all_responses().await
    }
}

/// Timestamps are persisted as RFC 3339 UTC with fixed millisecond
/// precision so that lexicographic order equals chronological order.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid stored timestamp: {raw}"))?
        .with_timezone(&Utc))
}
