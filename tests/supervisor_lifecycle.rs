//! Cron supervisor lifecycle: start/stop/reload transitions, registration
//! faults, and immediate out-of-band firings.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use promptpulse::config::Config;
use promptpulse::core::engine::{CronSupervisor, Executor, Governor, RetryPolicy, ScheduleRunner};
use promptpulse::core::llm::{GenerationOptions, GenerationResult, Provider, Registry};
use promptpulse::core::models::{
    LlmConfig, ModelInfo, PromptTemplate, ProviderKind, ResponseFilter, Schedule, Temperature,
};
use promptpulse::core::store::{Database, HybridStore};

struct EchoProvider;

#[async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> ProviderKind {
        ProviderKind::Openai
    }

    async fn generate(&self, prompt: &str, opts: &GenerationOptions) -> Result<GenerationResult> {
        Ok(GenerationResult {
            text: format!("echo: {prompt}"),
            tokens_used: 1,
            latency_ms: 1,
            model: opts.model.clone(),
            provider: self.name().to_string(),
            error: String::new(),
        })
    }

    async fn list_models(&self, _api_key: &str, _base_url: &str) -> Result<Vec<ModelInfo>> {
        Ok(Vec::new())
    }

    fn validate(&self, _opts: &GenerationOptions) -> Result<()> {
        Ok(())
    }
}

async fn supervisor_stack() -> (Arc<dyn Database>, CronSupervisor) {
    let mut config = Config::default();
    config.sql_database.uri = ":memory:".to_string();
    config.nosql_database.uri = ":memory:".to_string();

    let store: Arc<dyn Database> = Arc::new(HybridStore::new(&config));
    store.connect().await.unwrap();

    let registry = Arc::new(Registry::new());
    registry.register(Arc::new(EchoProvider));

    let executor = Arc::new(Executor::new(
        store.clone(),
        registry,
        Arc::new(Governor::new()),
        RetryPolicy::default(),
    ));
    let runner = Arc::new(ScheduleRunner::new(store.clone(), executor));
    let supervisor = CronSupervisor::new(store.clone(), runner);

    (store, supervisor)
}

fn seed_schedule(id: &str, cron_expr: &str, enabled: bool) -> Schedule {
    let now = Utc::now();
    Schedule {
        id: id.to_string(),
        name: format!("schedule {id}"),
        prompt_ids: vec!["p1".to_string()],
        llm_ids: vec!["m1".to_string()],
        cron_expr: cron_expr.to_string(),
        temperature: Temperature::Fixed(0.7),
        enabled,
        last_run: None,
        next_run: None,
        created_at: now,
        updated_at: now,
    }
}

async fn seed_prompt_and_llm(store: &Arc<dyn Database>) {
    let now = Utc::now();
    store
        .create_prompt(&PromptTemplate {
            id: "p1".to_string(),
            template: "Hello?".to_string(),
            tags: Vec::new(),
            enabled: true,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();
    store
        .create_llm(&LlmConfig {
            id: "m1".to_string(),
            name: "echo".to_string(),
            provider: ProviderKind::Openai,
            model: "gpt-x".to_string(),
            api_key: String::new(),
            base_url: String::new(),
            options: BTreeMap::new(),
            enabled: true,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn start_stop_reload_transitions() {
    let (store, supervisor) = supervisor_stack().await;
    seed_prompt_and_llm(&store).await;
    store
        .create_schedule(&seed_schedule("s1", "* * * * *", true))
        .await
        .unwrap();

    assert!(!supervisor.is_running());

    supervisor.start().await.unwrap();
    assert!(supervisor.is_running());

    // Starting a running supervisor is an error.
    assert!(supervisor.start().await.is_err());

    supervisor.reload().await.unwrap();
    assert!(supervisor.is_running());

    supervisor.stop().await.unwrap();
    assert!(!supervisor.is_running());

    // Stopping an idle supervisor is a no-op.
    supervisor.stop().await.unwrap();
    assert!(!supervisor.is_running());
}

#[tokio::test]
async fn invalid_cron_skips_that_schedule_only() {
    let (store, supervisor) = supervisor_stack().await;
    seed_prompt_and_llm(&store).await;
    store
        .create_schedule(&seed_schedule("bad", "not a cron", true))
        .await
        .unwrap();
    store
        .create_schedule(&seed_schedule("good", "*/5 * * * *", true))
        .await
        .unwrap();

    supervisor.start().await.unwrap();
    assert!(supervisor.is_running());
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn disabled_schedules_are_not_registered() {
    let (store, supervisor) = supervisor_stack().await;
    seed_prompt_and_llm(&store).await;
    store
        .create_schedule(&seed_schedule("off", "* * * * *", false))
        .await
        .unwrap();

    supervisor.start().await.unwrap();
    assert!(supervisor.is_running());
    supervisor.stop().await.unwrap();

    // The disabled schedule never fired.
    let responses = store.list_responses(&ResponseFilter::default()).await.unwrap();
    assert!(responses.is_empty());
}

#[tokio::test]
async fn execute_now_fires_outside_cron() {
    let (store, supervisor) = supervisor_stack().await;
    seed_prompt_and_llm(&store).await;
    store
        .create_schedule(&seed_schedule("s1", "0 0 1 1 *", true))
        .await
        .unwrap();

    supervisor.execute_now("s1").await.unwrap();

    let responses = store.list_responses(&ResponseFilter::default()).await.unwrap();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].response_text, "echo: Hello?");
    assert_eq!(responses[0].schedule_id, "s1");

    assert!(supervisor.execute_now("missing").await.is_err());
}
