use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result, bail};
use tokio::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::engine::runner::ScheduleRunner;
use crate::core::models::Schedule;
use crate::core::store::Database;

/// Quiescence pause between stop and start during a reload.
const RELOAD_PAUSE: Duration = Duration::from_millis(100);

/// Owns the cron lifecycle: registers every enabled schedule on start,
/// dispatches firings to the runner in detached contexts derived from one
/// root token, and tears everything down on stop. `reload` is a full
/// restart; incremental registration is not supported.
///
/// One supervisor per process; `start`, `stop`, and `reload` exclude each
/// other through a single lifecycle mutex.
pub struct CronSupervisor {
    store: Arc<dyn Database>,
    runner: Arc<ScheduleRunner>,
    inner: tokio::sync::Mutex<Inner>,
    running: RwLock<bool>,
}

struct Inner {
    scheduler: Option<JobScheduler>,
    /// schedule id → cron job handle, for per-schedule bookkeeping.
    jobs: HashMap<String, Uuid>,
    cancel: CancellationToken,
}

impl CronSupervisor {
    pub fn new(store: Arc<dyn Database>, runner: Arc<ScheduleRunner>) -> Self {
        Self {
            store,
            runner,
            inner: tokio::sync::Mutex::new(Inner {
                scheduler: None,
                jobs: HashMap::new(),
                cancel: CancellationToken::new(),
            }),
            running: RwLock::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        *self.running.read().unwrap()
    }

    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.start_locked(&mut inner).await
    }

    pub async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.stop_locked(&mut inner).await
    }

    /// Stop, brief quiescence pause, start. Equivalent to a full restart;
    /// this is also the only way to pick up re-enabled schedules.
    pub async fn reload(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.stop_locked(&mut inner).await?;
        tokio::time::sleep(RELOAD_PAUSE).await;
        self.start_locked(&mut inner).await
    }

    /// Fire one schedule immediately, outside its cron trigger. The firing
    /// still observes the supervisor's root cancellation.
    pub async fn execute_now(&self, schedule_id: &str) -> Result<()> {
        let schedule = self
            .store
            .get_schedule(schedule_id)
            .await
            .context("failed to get schedule")?;

        let cancel = self.inner.lock().await.cancel.child_token();
        self.runner.run_schedule(&cancel, &schedule).await
    }

    async fn start_locked(&self, inner: &mut Inner) -> Result<()> {
        if self.is_running() {
            bail!("scheduler already running");
        }
        inner.jobs.clear();

        let mut scheduler = JobScheduler::new()
            .await
            .context("failed to create cron scheduler")?;
        let cancel = CancellationToken::new();

        let schedules = self
            .store
            .list_schedules(Some(true))
            .await
            .context("failed to load schedules")?;

        for schedule in schedules {
            match self.register_schedule(&mut scheduler, &cancel, &schedule).await {
                Ok(job_id) => {
                    inner.jobs.insert(schedule.id.clone(), job_id);
                }
                Err(e) => error!("Failed to register schedule {}: {e:#}", schedule.id),
            }
        }

        for (schedule_id, job_id) in &inner.jobs {
            if let Ok(Some(next)) = scheduler.next_tick_for_job(*job_id).await {
                if let Err(e) = self
                    .store
                    .update_schedule_run_times(schedule_id, None, Some(next))
                    .await
                {
                    warn!("Failed to record next run for schedule {schedule_id}: {e:#}");
                }
            }
        }

        scheduler.start().await.context("failed to start cron scheduler")?;
        inner.scheduler = Some(scheduler);
        inner.cancel = cancel;
        *self.running.write().unwrap() = true;

        info!("Scheduler started with {} schedule(s)", inner.jobs.len());
        Ok(())
    }

    async fn stop_locked(&self, inner: &mut Inner) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        inner.cancel.cancel();
        if let Some(mut scheduler) = inner.scheduler.take() {
            scheduler
                .shutdown()
                .await
                .context("failed to shut down cron scheduler")?;
        }
        inner.jobs.clear();
        *self.running.write().unwrap() = false;

        info!("Scheduler stopped");
        Ok(())
    }

    async fn register_schedule(
        &self,
        scheduler: &mut JobScheduler,
        cancel: &CancellationToken,
        schedule: &Schedule,
    ) -> Result<Uuid> {
        let cron_expr = normalize_cron_expr(&schedule.cron_expr)?;

        let store = self.store.clone();
        let runner = self.runner.clone();
        let schedule_id = schedule.id.clone();
        let root = cancel.child_token();

        let job = Job::new_async(cron_expr.as_str(), move |job_id, mut scheduler| {
            let store = store.clone();
            let runner = runner.clone();
            let schedule_id = schedule_id.clone();
            let cancel = root.clone();

            Box::pin(async move {
                let store_for_tick = store.clone();
                let id_for_tick = schedule_id.clone();

                // A detached task confines a panicking firing to itself.
                let firing = tokio::spawn(async move {
                    let schedule = match store.get_schedule(&schedule_id).await {
                        Ok(schedule) => schedule,
                        Err(e) => {
                            error!("Failed to load schedule {schedule_id} for firing: {e:#}");
                            return;
                        }
                    };
                    if let Err(e) = runner.run_schedule(&cancel, &schedule).await {
                        error!("Failed to execute schedule {schedule_id}: {e:#}");
                    }
                });
                if let Err(e) = firing.await {
                    error!("Schedule firing panicked: {e}");
                }

                if let Ok(Some(next)) = scheduler.next_tick_for_job(job_id).await {
                    if let Err(e) = store_for_tick
                        .update_schedule_run_times(&id_for_tick, None, Some(next))
                        .await
                    {
                        warn!("Failed to record next run for schedule {id_for_tick}: {e:#}");
                    }
                }
            })
        })
        .with_context(|| format!("invalid cron expression '{}'", schedule.cron_expr))?;

        let job_id = scheduler
            .add(job)
            .await
            .context("failed to add cron job")?;

        info!(
            "Registered schedule {} with cron expression: {}",
            schedule.id, schedule.cron_expr
        );
        Ok(job_id)
    }
}

/// The engine speaks standard 5-field cron, interpreted in UTC. The
/// scheduler library wants a seconds field, so one is prepended.
fn normalize_cron_expr(expr: &str) -> Result<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        bail!(
            "invalid cron expression '{expr}': expected 5 fields, got {}",
            fields.len()
        );
    }
    Ok(format!("0 {}", fields.join(" ")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_expressions_gain_a_seconds_field() {
        assert_eq!(normalize_cron_expr("* * * * *").unwrap(), "0 * * * * *");
        assert_eq!(
            normalize_cron_expr("*/5 2 * * 1").unwrap(),
            "0 */5 2 * * 1"
        );
    }

    #[test]
    fn field_count_is_enforced() {
        assert!(normalize_cron_expr("* * * *").is_err());
        assert!(normalize_cron_expr("0 * * * * *").is_err());
        assert!(normalize_cron_expr("").is_err());
    }
}
