use std::sync::Arc;

use anyhow::{Result, bail};
use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::engine::executor::Executor;
use crate::core::models::{LlmConfig, PromptTemplate, Schedule, Temperature};
use crate::core::store::Database;

/// Materialises a schedule's (prompt × model) matrix and fans it out as
/// concurrent execution units. Backpressure comes from the per-provider
/// governor, not from a fan-out cap.
pub struct ScheduleRunner {
    store: Arc<dyn Database>,
    executor: Arc<Executor>,
}

impl ScheduleRunner {
    pub fn new(store: Arc<dyn Database>, executor: Arc<Executor>) -> Self {
        Self { store, executor }
    }

    /// One firing of a schedule. Lookup failures drop the affected pair and
    /// never abort the firing; per-pair outcomes land in the response store.
    pub async fn run_schedule(
        &self,
        cancel: &CancellationToken,
        schedule: &Schedule,
    ) -> Result<()> {
        info!(
            "Executing schedule {} ({} prompts × {} LLMs)",
            schedule.id,
            schedule.prompt_ids.len(),
            schedule.llm_ids.len()
        );

        let prompts = self.load_prompts(&schedule.prompt_ids).await;
        let llms = self.load_enabled_llms(&schedule.llm_ids).await;
        info!("Found {} prompts and {} enabled LLMs", prompts.len(), llms.len());

        self.dispatch_matrix(cancel, &prompts, &llms, schedule.temperature, &schedule.id)
            .await;

        if let Err(e) = self
            .store
            .update_schedule_run_times(&schedule.id, Some(Utc::now()), None)
            .await
        {
            warn!("Failed to update schedule last run: {e:#}");
        }

        info!("Completed schedule {}", schedule.id);
        Ok(())
    }

    /// Ad-hoc firing over every enabled prompt and every enabled model,
    /// outside any schedule.
    pub async fn run_once(
        &self,
        cancel: &CancellationToken,
        temperature: Temperature,
    ) -> Result<()> {
        let prompts = self.store.list_prompts(Some(true)).await?;
        let llms = self.store.list_llms(Some(true)).await?;

        if prompts.is_empty() {
            bail!("no enabled prompts found");
        }
        if llms.is_empty() {
            bail!("no enabled LLMs found");
        }

        info!(
            "Running {} prompts against {} LLMs once",
            prompts.len(),
            llms.len()
        );
        self.dispatch_matrix(cancel, &prompts, &llms, temperature, "")
            .await;
        Ok(())
    }

    /// One prompt against an explicit list of model ids. Disabled models
    /// are skipped like in a scheduled firing.
    pub async fn execute_prompt(
        &self,
        cancel: &CancellationToken,
        prompt_id: &str,
        llm_ids: &[String],
        temperature: Temperature,
    ) -> Result<()> {
        let prompt = self.store.get_prompt(prompt_id).await?;
        let llms = self.load_enabled_llms(llm_ids).await;

        self.dispatch_matrix(cancel, &[prompt], &llms, temperature, "")
            .await;
        Ok(())
    }

    async fn load_prompts(&self, ids: &[String]) -> Vec<PromptTemplate> {
        let mut prompts = Vec::with_capacity(ids.len());
        for id in ids {
            match self.store.get_prompt(id).await {
                Ok(prompt) => prompts.push(prompt),
                Err(e) => error!("Failed to get prompt {id}: {e:#}"),
            }
        }
        prompts
    }

    async fn load_enabled_llms(&self, ids: &[String]) -> Vec<LlmConfig> {
        let mut llms = Vec::with_capacity(ids.len());
        for id in ids {
            match self.store.get_llm(id).await {
                Ok(llm) if llm.enabled => llms.push(llm),
                Ok(llm) => info!("LLM {} is disabled, skipping", llm.name),
                Err(e) => error!("Failed to get LLM {id}: {e:#}"),
            }
        }
        llms
    }

    /// Launch one execution unit per (prompt, model) pair and wait for all
    /// of them. With the random sentinel, one sample is drawn per prompt
    /// and shared by every model paired with it in this firing.
    async fn dispatch_matrix(
        &self,
        cancel: &CancellationToken,
        prompts: &[PromptTemplate],
        llms: &[LlmConfig],
        temperature: Temperature,
        schedule_id: &str,
    ) {
        let mut units = JoinSet::new();
        let mut launched = 0usize;

        for prompt in prompts {
            let prompt_temperature = match temperature {
                Temperature::Fixed(t) => t,
                Temperature::RandomPerPrompt => rand::random::<f64>(),
            };

            for llm in llms {
                launched += 1;
                let executor = self.executor.clone();
                let cancel = cancel.clone();
                let prompt = prompt.clone();
                let llm = llm.clone();
                let schedule_id = schedule_id.to_string();

                units.spawn(async move {
                    let prompt_id = prompt.id.clone();
                    let llm_id = llm.id.clone();
                    if let Err(e) = executor
                        .execute(&cancel, &prompt, &llm, prompt_temperature, &schedule_id)
                        .await
                    {
                        error!("Failed to execute prompt {prompt_id} with LLM {llm_id}: {e:#}");
                    }
                });
            }
        }

        info!("Started {launched} concurrent executions");
        while let Some(joined) = units.join_next().await {
            if let Err(e) = joined {
                error!("Execution unit panicked: {e}");
            }
        }
        info!("Completed {launched} executions");
    }
}
