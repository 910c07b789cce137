use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use tokio::sync::Mutex;

use super::{fmt_ts, parse_ts};
use crate::core::models::{LlmConfig, ProviderKind, Schedule, Temperature};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS llms (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    provider TEXT NOT NULL CHECK (provider IN ('openai','anthropic','ollama','google','perplexity')),
    model TEXT NOT NULL,
    api_key TEXT NOT NULL DEFAULT '',
    base_url TEXT NOT NULL DEFAULT '',
    config TEXT NOT NULL DEFAULT '{}',
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schedules (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    prompt_ids TEXT NOT NULL,
    llm_ids TEXT NOT NULL,
    cron_expr TEXT NOT NULL,
    temperature REAL NOT NULL DEFAULT 0.7
        CHECK ((temperature >= 0.0 AND temperature <= 1.0) OR temperature = -1.0),
    enabled INTEGER NOT NULL DEFAULT 1,
    last_run TEXT,
    next_run TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_llms_provider ON llms(provider);
CREATE INDEX IF NOT EXISTS idx_llms_enabled ON llms(enabled);
CREATE INDEX IF NOT EXISTS idx_llms_created_at ON llms(created_at);
CREATE INDEX IF NOT EXISTS idx_llms_updated_at ON llms(updated_at);
CREATE INDEX IF NOT EXISTS idx_schedules_enabled ON schedules(enabled);
CREATE INDEX IF NOT EXISTS idx_schedules_next_run ON schedules(next_run);
CREATE INDEX IF NOT EXISTS idx_schedules_created_at ON schedules(created_at);
CREATE INDEX IF NOT EXISTS idx_schedules_updated_at ON schedules(updated_at);
CREATE INDEX IF NOT EXISTS idx_schedules_cron_expr ON schedules(cron_expr);

CREATE TRIGGER IF NOT EXISTS trg_llms_updated_at
AFTER UPDATE ON llms
FOR EACH ROW
BEGIN
    UPDATE llms SET updated_at = STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = NEW.id;
END;

CREATE TRIGGER IF NOT EXISTS trg_schedules_updated_at
AFTER UPDATE ON schedules
FOR EACH ROW
BEGIN
    UPDATE schedules SET updated_at = STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = NEW.id;
END;
";

/// Relational store for model configs and schedules.
pub struct ConfigStore {
    path: String,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl ConfigStore {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            conn: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let conn = Connection::open(&self.path)
            .with_context(|| format!("failed to open SQLite database at '{}'", self.path))?;
        conn.execute_batch(SCHEMA).context("failed to create tables")?;

        *guard = Some(conn);
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.conn.lock().await.take();
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or_else(|| anyhow!("not connected to database"))?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    pub async fn create_llm(&self, llm: &LlmConfig) -> Result<()> {
        let guard = self.conn.lock().await;
        let conn = connected(&guard)?;

        conn.execute(
            "INSERT INTO llms (id, name, provider, model, api_key, base_url, config, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                llm.id,
                llm.name,
                llm.provider.as_str(),
                llm.model,
                llm.api_key,
                llm.base_url,
                serde_json::to_string(&llm.options)?,
                llm.enabled,
                fmt_ts(llm.created_at),
                fmt_ts(llm.updated_at),
            ],
        )?;
        Ok(())
    }

    pub async fn get_llm(&self, id: &str) -> Result<LlmConfig> {
        let guard = self.conn.lock().await;
        let conn = connected(&guard)?;

        let mut stmt = conn.prepare(
            "SELECT id, name, provider, model, api_key, base_url, config, enabled, created_at, updated_at
             FROM llms WHERE id = ?1",
        )?;

        let mut rows = stmt.query_map(params![id], read_llm)?;
        match rows.next() {
            Some(row) => row?,
            None => bail!("LLM not found: {id}"),
        }
    }

    pub async fn list_llms(&self, enabled: Option<bool>) -> Result<Vec<LlmConfig>> {
        let guard = self.conn.lock().await;
        let conn = connected(&guard)?;

        let mut sql = String::from(
            "SELECT id, name, provider, model, api_key, base_url, config, enabled, created_at, updated_at
             FROM llms",
        );
        if enabled.is_some() {
            sql.push_str(" WHERE enabled = ?1");
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut stmt = conn.prepare(&sql)?;
        let rows = match enabled {
            Some(flag) => stmt.query_map(params![flag], read_llm)?,
            None => stmt.query_map([], read_llm)?,
        };

        let mut llms = Vec::new();
        for row in rows {
            llms.push(row??);
        }
        Ok(llms)
    }

    pub async fn update_llm(&self, llm: &LlmConfig) -> Result<()> {
        let guard = self.conn.lock().await;
        let conn = connected(&guard)?;

        let changed = conn.execute(
            "UPDATE llms
             SET name = ?1, provider = ?2, model = ?3, api_key = ?4, base_url = ?5, config = ?6, enabled = ?7
             WHERE id = ?8",
            params![
                llm.name,
                llm.provider.as_str(),
                llm.model,
                llm.api_key,
                llm.base_url,
                serde_json::to_string(&llm.options)?,
                llm.enabled,
                llm.id,
            ],
        )?;

        if changed == 0 {
            bail!("LLM not found: {}", llm.id);
        }
        Ok(())
    }

    pub async fn delete_llm(&self, id: &str) -> Result<()> {
        let guard = self.conn.lock().await;
        let conn = connected(&guard)?;

        let changed = conn.execute("DELETE FROM llms WHERE id = ?1", params![id])?;
        if changed == 0 {
            bail!("LLM not found: {id}");
        }
        Ok(())
    }

    pub async fn delete_all_llms(&self) -> Result<usize> {
        let guard = self.conn.lock().await;
        let conn = connected(&guard)?;
        Ok(conn.execute("DELETE FROM llms", [])?)
    }

    pub async fn create_schedule(&self, schedule: &Schedule) -> Result<()> {
        let guard = self.conn.lock().await;
        let conn = connected(&guard)?;

        conn.execute(
            "INSERT INTO schedules (id, name, prompt_ids, llm_ids, cron_expr, temperature, enabled, last_run, next_run, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                schedule.id,
                schedule.name,
                serde_json::to_string(&schedule.prompt_ids)?,
                serde_json::to_string(&schedule.llm_ids)?,
                schedule.cron_expr,
                schedule.temperature.as_stored(),
                schedule.enabled,
                schedule.last_run.map(fmt_ts),
                schedule.next_run.map(fmt_ts),
                fmt_ts(schedule.created_at),
                fmt_ts(schedule.updated_at),
            ],
        )?;
        Ok(())
    }

    pub async fn get_schedule(&self, id: &str) -> Result<Schedule> {
        let guard = self.conn.lock().await;
        let conn = connected(&guard)?;

        let mut stmt = conn.prepare(
            "SELECT id, name, prompt_ids, llm_ids, cron_expr, temperature, enabled, last_run, next_run, created_at, updated_at
             FROM schedules WHERE id = ?1",
        )?;

        let mut rows = stmt.query_map(params![id], read_schedule)?;
        match rows.next() {
            Some(row) => row?,
            None => bail!("schedule not found: {id}"),
        }
    }

    pub async fn list_schedules(&self, enabled: Option<bool>) -> Result<Vec<Schedule>> {
        let guard = self.conn.lock().await;
        let conn = connected(&guard)?;

        let mut sql = String::from(
            "SELECT id, name, prompt_ids, llm_ids, cron_expr, temperature, enabled, last_run, next_run, created_at, updated_at
             FROM schedules",
        );
        if enabled.is_some() {
            sql.push_str(" WHERE enabled = ?1");
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut stmt = conn.prepare(&sql)?;
        let rows = match enabled {
            Some(flag) => stmt.query_map(params![flag], read_schedule)?,
            None => stmt.query_map([], read_schedule)?,
        };

        let mut schedules = Vec::new();
        for row in rows {
            schedules.push(row??);
        }
        Ok(schedules)
    }

    pub async fn update_schedule(&self, schedule: &Schedule) -> Result<()> {
        let guard = self.conn.lock().await;
        let conn = connected(&guard)?;

        let changed = conn.execute(
            "UPDATE schedules
             SET name = ?1, prompt_ids = ?2, llm_ids = ?3, cron_expr = ?4, temperature = ?5, enabled = ?6, last_run = ?7, next_run = ?8
             WHERE id = ?9",
            params![
                schedule.name,
                serde_json::to_string(&schedule.prompt_ids)?,
                serde_json::to_string(&schedule.llm_ids)?,
                schedule.cron_expr,
                schedule.temperature.as_stored(),
                schedule.enabled,
                schedule.last_run.map(fmt_ts),
                schedule.next_run.map(fmt_ts),
                schedule.id,
            ],
        )?;

        if changed == 0 {
            bail!("schedule not found: {}", schedule.id);
        }
        Ok(())
    }

    pub async fn update_schedule_run_times(
        &self,
        id: &str,
        last_run: Option<DateTime<Utc>>,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let guard = self.conn.lock().await;
        let conn = connected(&guard)?;

        let changed = conn.execute(
            "UPDATE schedules SET last_run = COALESCE(?1, last_run), next_run = COALESCE(?2, next_run) WHERE id = ?3",
            params![last_run.map(fmt_ts), next_run.map(fmt_ts), id],
        )?;

        if changed == 0 {
            bail!("schedule not found: {id}");
        }
        Ok(())
    }

    pub async fn delete_schedule(&self, id: &str) -> Result<()> {
        let guard = self.conn.lock().await;
        let conn = connected(&guard)?;

        let changed = conn.execute("DELETE FROM schedules WHERE id = ?1", params![id])?;
        if changed == 0 {
            bail!("schedule not found: {id}");
        }
        Ok(())
    }

    pub async fn delete_all_schedules(&self) -> Result<usize> {
        let guard = self.conn.lock().await;
        let conn = connected(&guard)?;
        Ok(conn.execute("DELETE FROM schedules", [])?)
    }
}

fn connected<'a>(guard: &'a tokio::sync::MutexGuard<'_, Option<Connection>>) -> Result<&'a Connection> {
    guard.as_ref().ok_or_else(|| anyhow!("not connected to database"))
}

fn read_llm(row: &Row<'_>) -> rusqlite::Result<Result<LlmConfig>> {
    let id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let provider: String = row.get(2)?;
    let model: String = row.get(3)?;
    let api_key: String = row.get(4)?;
    let base_url: String = row.get(5)?;
    let config_json: String = row.get(6)?;
    let enabled: bool = row.get(7)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;

    Ok((|| {
        Ok(LlmConfig {
            id,
            name,
            provider: ProviderKind::from_str(&provider).map_err(|e| anyhow!(e))?,
            model,
            api_key,
            base_url,
            options: serde_json::from_str::<BTreeMap<String, String>>(&config_json)
                .context("invalid stored llm config")?,
            enabled,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    })())
}

fn read_schedule(row: &Row<'_>) -> rusqlite::Result<Result<Schedule>> {
    let id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let prompt_ids: String = row.get(2)?;
    let llm_ids: String = row.get(3)?;
    let cron_expr: String = row.get(4)?;
    let temperature: f64 = row.get(5)?;
    let enabled: bool = row.get(6)?;
    let last_run: Option<String> = row.get(7)?;
    let next_run: Option<String> = row.get(8)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;

    Ok((|| {
        Ok(Schedule {
            id,
            name,
            prompt_ids: serde_json::from_str(&prompt_ids).context("invalid stored prompt_ids")?,
            llm_ids: serde_json::from_str(&llm_ids).context("invalid stored llm_ids")?,
            cron_expr,
            temperature: Temperature::from_stored(temperature).map_err(|e| anyhow!(e))?,
            enabled,
            last_run: last_run.as_deref().map(parse_ts).transpose()?,
            next_run: next_run.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    })())
}
