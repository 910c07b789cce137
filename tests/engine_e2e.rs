//! End-to-end engine scenarios driven through a scriptable stub provider.
//!
//! Time-dependent paths (retry backoff, rate-limit pacing) run under the
//! paused tokio clock, so the wall-clock cost stays near zero while the
//! timing assertions hold exactly.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use promptpulse::config::Config;
use promptpulse::core::engine::{Executor, Governor, RetryPolicy, ScheduleRunner};
use promptpulse::core::llm::{GenerationOptions, GenerationResult, Provider, Registry};
use promptpulse::core::models::{
    LlmConfig, ModelInfo, PromptTemplate, ProviderKind, ResponseFilter, Schedule, Temperature,
};
use promptpulse::core::stats::StatsService;
use promptpulse::core::store::{Database, HybridStore};

#[derive(Clone)]
enum StubOutcome {
    Reply {
        text: String,
        tokens_used: i64,
        latency_ms: i64,
    },
    TransportError(String),
    ProviderError(String),
}

/// Provider double: plays back a scripted prefix of outcomes, then repeats
/// a default outcome forever. Records every call for assertion.
struct StubProvider {
    script: Mutex<VecDeque<StubOutcome>>,
    fallback: StubOutcome,
    calls: AtomicU32,
}

impl StubProvider {
    fn replying(text: &str, tokens_used: i64, latency_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: StubOutcome::Reply {
                text: text.to_string(),
                tokens_used,
                latency_ms,
            },
            calls: AtomicU32::new(0),
        })
    }

    fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: StubOutcome::TransportError(message.to_string()),
            calls: AtomicU32::new(0),
        })
    }

    fn scripted(prefix: Vec<StubOutcome>, fallback: StubOutcome) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(prefix.into()),
            fallback,
            calls: AtomicU32::new(0),
        })
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for StubProvider {
    fn name(&self) -> ProviderKind {
        ProviderKind::Openai
    }

    async fn generate(&self, _prompt: &str, opts: &GenerationOptions) -> Result<GenerationResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match outcome {
            StubOutcome::Reply {
                text,
                tokens_used,
                latency_ms,
            } => Ok(GenerationResult {
                text,
                tokens_used,
                latency_ms,
                model: opts.model.clone(),
                provider: self.name().to_string(),
                error: String::new(),
            }),
            StubOutcome::TransportError(message) => Err(anyhow::anyhow!(message)),
            StubOutcome::ProviderError(message) => Ok(GenerationResult {
                provider: self.name().to_string(),
                error: message,
                ..Default::default()
            }),
        }
    }

    async fn list_models(&self, _api_key: &str, _base_url: &str) -> Result<Vec<ModelInfo>> {
        Ok(Vec::new())
    }

    fn validate(&self, _opts: &GenerationOptions) -> Result<()> {
        Ok(())
    }
}

struct Stack {
    store: Arc<dyn Database>,
    runner: Arc<ScheduleRunner>,
    executor: Arc<Executor>,
}

async fn stack_with(provider: Arc<StubProvider>) -> Stack {
    let mut config = Config::default();
    config.sql_database.uri = ":memory:".to_string();
    config.nosql_database.uri = ":memory:".to_string();

    let store: Arc<dyn Database> = Arc::new(HybridStore::new(&config));
    store.connect().await.unwrap();

    let registry = Arc::new(Registry::new());
    registry.register(provider);

    let executor = Arc::new(Executor::new(
        store.clone(),
        registry,
        Arc::new(Governor::new()),
        RetryPolicy::default(),
    ));
    let runner = Arc::new(ScheduleRunner::new(store.clone(), executor.clone()));

    Stack {
        store,
        runner,
        executor,
    }
}

fn prompt(id: &str, template: &str) -> PromptTemplate {
    let now = Utc::now();
    PromptTemplate {
        id: id.to_string(),
        template: template.to_string(),
        tags: Vec::new(),
        enabled: true,
        created_at: now,
        updated_at: now,
    }
}

fn llm(id: &str, enabled: bool) -> LlmConfig {
    let now = Utc::now();
    LlmConfig {
        id: id.to_string(),
        name: format!("stub {id}"),
        provider: ProviderKind::Openai,
        model: "gpt-x".to_string(),
        api_key: "sk-test".to_string(),
        base_url: String::new(),
        options: BTreeMap::new(),
        enabled,
        created_at: now,
        updated_at: now,
    }
}

fn schedule(id: &str, prompt_ids: &[&str], llm_ids: &[&str], temperature: Temperature) -> Schedule {
    let now = Utc::now();
    Schedule {
        id: id.to_string(),
        name: format!("schedule {id}"),
        prompt_ids: prompt_ids.iter().map(|s| s.to_string()).collect(),
        llm_ids: llm_ids.iter().map(|s| s.to_string()).collect(),
        cron_expr: "* * * * *".to_string(),
        temperature,
        enabled: true,
        last_run: None,
        next_run: None,
        created_at: now,
        updated_at: now,
    }
}

async fn all_responses(store: &Arc<dyn Database>) -> Vec<promptpulse::core::models::Response> {
    store
        .list_responses(&ResponseFilter::default())
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn happy_path_one_firing_one_response() {
    let stub = StubProvider::replying("Hi", 5, 12);
    let stack = stack_with(stub.clone()).await;

    stack.store.create_prompt(&prompt("p1", "Hello?")).await.unwrap();
    stack.store.create_llm(&llm("m1", true)).await.unwrap();
    let sched = schedule("s1", &["p1"], &["m1"], Temperature::Fixed(0.7));
    stack.store.create_schedule(&sched).await.unwrap();

    let cancel = CancellationToken::new();
    stack.runner.run_schedule(&cancel, &sched).await.unwrap();

    let responses = all_responses(&stack.store).await;
    assert_eq!(responses.len(), 1);
    let response = &responses[0];
    assert_eq!(response.response_text, "Hi");
    assert_eq!(response.tokens_used, 5);
    assert_eq!(response.latency_ms, 12);
    assert_eq!(response.error, "");
    assert_eq!(response.prompt_text, "Hello?");
    assert_eq!(response.prompt_id, "p1");
    assert_eq!(response.llm_id, "m1");
    assert_eq!(response.schedule_id, "s1");
    assert_eq!(response.llm_provider, "openai");
    assert_eq!(stub.call_count(), 1);

    let updated = stack.store.get_schedule("s1").await.unwrap();
    assert!(updated.last_run.is_some());
}

#[tokio::test(start_paused = true)]
async fn retry_then_succeed_waits_the_base_backoff_twice() {
    let stub = StubProvider::scripted(
        vec![
            StubOutcome::TransportError("boom".to_string()),
            StubOutcome::TransportError("boom".to_string()),
        ],
        StubOutcome::Reply {
            text: "ok".to_string(),
            tokens_used: 1,
            latency_ms: 1,
        },
    );
    let stack = stack_with(stub.clone()).await;

    stack.store.create_prompt(&prompt("p1", "Hello?")).await.unwrap();
    stack.store.create_llm(&llm("m1", true)).await.unwrap();
    let sched = schedule("s1", &["p1"], &["m1"], Temperature::Fixed(0.5));
    stack.store.create_schedule(&sched).await.unwrap();

    let started = Instant::now();
    let cancel = CancellationToken::new();
    stack.runner.run_schedule(&cancel, &sched).await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(60));
    assert_eq!(stub.call_count(), 3);

    let responses = all_responses(&stack.store).await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].response_text, "ok");
    assert_eq!(responses[0].error, "");
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_persist_one_error_response() {
    let stub = StubProvider::failing("boom");
    let stack = stack_with(stub.clone()).await;

    stack.store.create_prompt(&prompt("p1", "Hello?")).await.unwrap();
    stack.store.create_llm(&llm("m1", true)).await.unwrap();
    let sched = schedule("s1", &["p1"], &["m1"], Temperature::Fixed(0.3));
    stack.store.create_schedule(&sched).await.unwrap();

    let cancel = CancellationToken::new();
    stack.runner.run_schedule(&cancel, &sched).await.unwrap();

    // Attempt cap honoured.
    assert_eq!(stub.call_count(), 3);

    let responses = all_responses(&stack.store).await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].response_text, "");
    assert!(responses[0].error.contains("boom"));
    assert_eq!(responses[0].temperature, 0.3);
}

#[tokio::test(start_paused = true)]
async fn provider_reported_errors_are_failures_too() {
    let stub = StubProvider::scripted(
        vec![StubOutcome::ProviderError("model overloaded".to_string())],
        StubOutcome::Reply {
            text: "recovered".to_string(),
            tokens_used: 2,
            latency_ms: 3,
        },
    );
    let stack = stack_with(stub.clone()).await;

    stack.store.create_prompt(&prompt("p1", "Hello?")).await.unwrap();
    stack.store.create_llm(&llm("m1", true)).await.unwrap();
    let sched = schedule("s1", &["p1"], &["m1"], Temperature::Fixed(0.7));
    stack.store.create_schedule(&sched).await.unwrap();

    let cancel = CancellationToken::new();
    stack.runner.run_schedule(&cancel, &sched).await.unwrap();

    assert_eq!(stub.call_count(), 2);
    let responses = all_responses(&stack.store).await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].response_text, "recovered");
}

#[tokio::test(start_paused = true)]
async fn rate_limit_class_failure_gets_the_extended_wait() {
    let stub = StubProvider::scripted(
        vec![StubOutcome::TransportError(
            "HTTP 429 quota exceeded".to_string(),
        )],
        StubOutcome::Reply {
            text: "after backoff".to_string(),
            tokens_used: 1,
            latency_ms: 1,
        },
    );
    let stack = stack_with(stub.clone()).await;

    stack.store.create_prompt(&prompt("p1", "Hello?")).await.unwrap();
    stack.store.create_llm(&llm("m1", true)).await.unwrap();
    let sched = schedule("s1", &["p1"], &["m1"], Temperature::Fixed(0.7));
    stack.store.create_schedule(&sched).await.unwrap();

    let started = Instant::now();
    let cancel = CancellationToken::new();
    stack.runner.run_schedule(&cancel, &sched).await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(120));
    assert_eq!(stub.call_count(), 2);

    let responses = all_responses(&stack.store).await;
    assert_eq!(responses[0].response_text, "after backoff");
}

#[tokio::test(start_paused = true)]
async fn random_temperature_is_sampled_once_per_prompt() {
    let stub = StubProvider::replying("text", 1, 1);
    let stack = stack_with(stub).await;

    stack.store.create_prompt(&prompt("p1", "first?")).await.unwrap();
    stack.store.create_prompt(&prompt("p2", "second?")).await.unwrap();
    stack.store.create_llm(&llm("m1", true)).await.unwrap();
    stack.store.create_llm(&llm("m2", true)).await.unwrap();
    let sched = schedule(
        "s1",
        &["p1", "p2"],
        &["m1", "m2"],
        Temperature::RandomPerPrompt,
    );
    stack.store.create_schedule(&sched).await.unwrap();

    let cancel = CancellationToken::new();
    stack.runner.run_schedule(&cancel, &sched).await.unwrap();

    // Full fan-out: |P| × |M| units.
    let responses = all_responses(&stack.store).await;
    assert_eq!(responses.len(), 4);

    let mut per_prompt: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for response in &responses {
        assert!((0.0..1.0).contains(&response.temperature));
        per_prompt
            .entry(response.prompt_id.clone())
            .or_default()
            .push(response.temperature);
    }

    let p1 = &per_prompt["p1"];
    let p2 = &per_prompt["p2"];
    assert_eq!(p1.len(), 2);
    assert_eq!(p2.len(), 2);
    assert_eq!(p1[0], p1[1]);
    assert_eq!(p2[0], p2[1]);
    assert_ne!(p1[0], p2[0]);
}

#[tokio::test(start_paused = true)]
async fn disabled_models_are_never_dispatched() {
    let stub = StubProvider::replying("text", 1, 1);
    let stack = stack_with(stub.clone()).await;

    stack.store.create_prompt(&prompt("p1", "Hello?")).await.unwrap();
    stack.store.create_llm(&llm("m1", true)).await.unwrap();
    stack.store.create_llm(&llm("m2", false)).await.unwrap();
    let sched = schedule("s1", &["p1"], &["m1", "m2"], Temperature::Fixed(0.7));
    stack.store.create_schedule(&sched).await.unwrap();

    let cancel = CancellationToken::new();
    stack.runner.run_schedule(&cancel, &sched).await.unwrap();

    let responses = all_responses(&stack.store).await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].llm_id, "m1");
    assert_eq!(stub.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn missing_prompt_or_model_drops_the_pair_not_the_firing() {
    let stub = StubProvider::replying("text", 1, 1);
    let stack = stack_with(stub).await;

    stack.store.create_prompt(&prompt("p1", "Hello?")).await.unwrap();
    stack.store.create_llm(&llm("m1", true)).await.unwrap();
    let sched = schedule(
        "s1",
        &["p1", "ghost-prompt"],
        &["m1", "ghost-model"],
        Temperature::Fixed(0.7),
    );
    stack.store.create_schedule(&sched).await.unwrap();

    let cancel = CancellationToken::new();
    stack.runner.run_schedule(&cancel, &sched).await.unwrap();

    let responses = all_responses(&stack.store).await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].prompt_id, "p1");
    assert_eq!(responses[0].llm_id, "m1");
}

#[tokio::test(start_paused = true)]
async fn missing_provider_writes_an_error_response() {
    let stub = StubProvider::replying("text", 1, 1);
    let stack = stack_with(stub.clone()).await;

    stack.store.create_prompt(&prompt("p1", "Hello?")).await.unwrap();
    let mut anthropic_llm = llm("m1", true);
    anthropic_llm.provider = ProviderKind::Anthropic; // not registered in this stack
    stack.store.create_llm(&anthropic_llm).await.unwrap();
    let sched = schedule("s1", &["p1"], &["m1"], Temperature::Fixed(0.7));
    stack.store.create_schedule(&sched).await.unwrap();

    let cancel = CancellationToken::new();
    stack.runner.run_schedule(&cancel, &sched).await.unwrap();

    let responses = all_responses(&stack.store).await;
    assert_eq!(responses.len(), 1);
    assert!(responses[0].error.contains("provider not found"));
    assert_eq!(responses[0].response_text, "");
    assert_eq!(stub.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_before_dispatch_writes_no_response() {
    let stub = StubProvider::replying("text", 1, 1);
    let stack = stack_with(stub.clone()).await;

    stack.store.create_prompt(&prompt("p1", "Hello?")).await.unwrap();
    stack.store.create_llm(&llm("m1", true)).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();

    let loaded_prompt = stack.store.get_prompt("p1").await.unwrap();
    let loaded_llm = stack.store.get_llm("m1").await.unwrap();
    let result = stack
        .executor
        .execute(&cancel, &loaded_prompt, &loaded_llm, 0.7, "")
        .await;

    assert!(result.is_err());
    assert_eq!(stub.call_count(), 0);
    assert!(all_responses(&stack.store).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn snapshots_survive_model_edits_after_dispatch() {
    let stub = StubProvider::replying("text", 1, 1);
    let stack = stack_with(stub).await;

    stack.store.create_prompt(&prompt("p1", "Hello?")).await.unwrap();
    stack.store.create_llm(&llm("m1", true)).await.unwrap();
    let sched = schedule("s1", &["p1"], &["m1"], Temperature::Fixed(0.7));
    stack.store.create_schedule(&sched).await.unwrap();

    let cancel = CancellationToken::new();
    stack.runner.run_schedule(&cancel, &sched).await.unwrap();

    // Rename and delete the referents; history must not move.
    let mut renamed = stack.store.get_llm("m1").await.unwrap();
    renamed.name = "renamed".to_string();
    stack.store.update_llm(&renamed).await.unwrap();
    stack.store.delete_prompt("p1").await.unwrap();
    stack.store.delete_llm("m1").await.unwrap();

    let responses = all_responses(&stack.store).await;
    assert_eq!(responses[0].llm_name, "stub m1");
    assert_eq!(responses[0].prompt_text, "Hello?");
}

#[tokio::test(start_paused = true)]
async fn run_once_covers_all_enabled_pairs_without_schedule_id() {
    let stub = StubProvider::replying("text", 1, 1);
    let stack = stack_with(stub).await;

    stack.store.create_prompt(&prompt("p1", "Hello?")).await.unwrap();
    stack.store.create_prompt(&prompt("p2", "World?")).await.unwrap();
    stack.store.create_llm(&llm("m1", true)).await.unwrap();

    let cancel = CancellationToken::new();
    stack
        .runner
        .run_once(&cancel, Temperature::Fixed(0.2))
        .await
        .unwrap();

    let responses = all_responses(&stack.store).await;
    assert_eq!(responses.len(), 2);
    for response in &responses {
        assert_eq!(response.schedule_id, "");
        assert_eq!(response.temperature, 0.2);
    }
}

#[tokio::test(start_paused = true)]
async fn run_once_requires_enabled_prompts_and_models() {
    let stub = StubProvider::replying("text", 1, 1);
    let stack = stack_with(stub).await;

    let cancel = CancellationToken::new();
    assert!(
        stack
            .runner
            .run_once(&cancel, Temperature::Fixed(0.2))
            .await
            .is_err()
    );
}

#[tokio::test(start_paused = true)]
async fn keyword_search_aggregates_matching_responses() {
    let stub = StubProvider::scripted(
        vec![
            StubOutcome::Reply {
                text: "Netflix and Disney".to_string(),
                tokens_used: 1,
                latency_ms: 1,
            },
            StubOutcome::Reply {
                text: "netflix only".to_string(),
                tokens_used: 1,
                latency_ms: 1,
            },
        ],
        StubOutcome::Reply {
            text: "nothing here".to_string(),
            tokens_used: 1,
            latency_ms: 1,
        },
    );
    let stack = stack_with(stub).await;

    stack.store.create_prompt(&prompt("p1", "streaming?")).await.unwrap();
    stack.store.create_prompt(&prompt("p2", "tv?")).await.unwrap();
    stack.store.create_prompt(&prompt("p3", "film?")).await.unwrap();
    stack.store.create_llm(&llm("m1", true)).await.unwrap();

    let cancel = CancellationToken::new();
    stack
        .runner
        .run_once(&cancel, Temperature::Fixed(0.7))
        .await
        .unwrap();

    let stats_service = StatsService::new(stack.store.clone());
    let stats = stats_service
        .search_keyword("Netflix", None, None)
        .await
        .unwrap();

    assert_eq!(stats.total_mentions, 2);
    assert_eq!(stats.unique_prompts, 2);
    assert_eq!(stats.unique_llms, 1);
    assert!(!stats.by_prompt.is_empty());
    assert!(!stats.by_provider.is_empty());
    assert_eq!(stats.by_provider["openai"], 2);
    assert!(stats.first_seen.is_some());

    // Purity: the same query over unchanged contents returns the same
    // aggregate.
    let again = stats_service
        .search_keyword("Netflix", None, None)
        .await
        .unwrap();
    assert_eq!(again.total_mentions, stats.total_mentions);
    assert_eq!(again.by_prompt, stats.by_prompt);
}
