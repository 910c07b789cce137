use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use rusqlite::types::Value;
use rusqlite::{Connection, Row, params};
use tokio::sync::Mutex;

use super::{fmt_ts, parse_ts};
use crate::core::models::{PromptTemplate, Response, ResponseFilter};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS prompts (
    id TEXT PRIMARY KEY,
    template TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS responses (
    id TEXT PRIMARY KEY,
    prompt_id TEXT NOT NULL,
    prompt_text TEXT NOT NULL,
    llm_id TEXT NOT NULL,
    llm_name TEXT NOT NULL,
    llm_provider TEXT NOT NULL,
    llm_model TEXT NOT NULL,
    response_text TEXT NOT NULL DEFAULT '',
    temperature REAL NOT NULL CHECK (temperature >= 0.0 AND temperature <= 1.0),
    schedule_id TEXT NOT NULL DEFAULT '',
    tokens_used INTEGER NOT NULL DEFAULT 0,
    latency_ms INTEGER NOT NULL DEFAULT 0,
    error TEXT NOT NULL DEFAULT '',
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_prompts_enabled ON prompts(enabled);
CREATE INDEX IF NOT EXISTS idx_responses_prompt_created ON responses(prompt_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_responses_created ON responses(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_responses_llm_created ON responses(llm_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_responses_schedule ON responses(schedule_id);
";

/// Document store for prompt templates and responses.
///
/// Collections live in their own SQLite database file, fully independent
/// of the configuration store.
pub struct DocumentStore {
    path: String,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl DocumentStore {
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
            .with_context(|| format!("failed to open document database at '{}'", self.path))?;
        conn.execute_batch(SCHEMA).context("failed to create collections")?;

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

    pub async fn create_prompt(&self, prompt: &PromptTemplate) -> Result<()> {
        let guard = self.conn.lock().await;
        let conn = connected(&guard)?;

        conn.execute(
            "INSERT INTO prompts (id, template, tags, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                prompt.id,
                prompt.template,
                serde_json::to_string(&prompt.tags)?,
                prompt.enabled,
                fmt_ts(prompt.created_at),
                fmt_ts(prompt.updated_at),
            ],
        )?;
        Ok(())
    }

    pub async fn get_prompt(&self, id: &str) -> Result<PromptTemplate> {
        let guard = self.conn.lock().await;
        let conn = connected(&guard)?;

        let mut stmt = conn.prepare(
            "SELECT id, template, tags, enabled, created_at, updated_at FROM prompts WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![id], read_prompt)?;
        match rows.next() {
            Some(row) => row?,
            None => bail!("prompt not found: {id}"),
        }
    }

    pub async fn list_prompts(&self, enabled: Option<bool>) -> Result<Vec<PromptTemplate>> {
        let guard = self.conn.lock().await;
        let conn = connected(&guard)?;

        let mut sql = String::from(
            "SELECT id, template, tags, enabled, created_at, updated_at FROM prompts",
        );
        if enabled.is_some() {
            sql.push_str(" WHERE enabled = ?1");
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut stmt = conn.prepare(&sql)?;
        let rows = match enabled {
            Some(flag) => stmt.query_map(params![flag], read_prompt)?,
            None => stmt.query_map([], read_prompt)?,
        };

        let mut prompts = Vec::new();
        for row in rows {
            prompts.push(row??);
        }
        Ok(prompts)
    }

    pub async fn update_prompt(&self, prompt: &PromptTemplate) -> Result<()> {
        let guard = self.conn.lock().await;
        let conn = connected(&guard)?;

        let changed = conn.execute(
            "UPDATE prompts SET template = ?1, tags = ?2, enabled = ?3, updated_at = ?4 WHERE id = ?5",
            params![
                prompt.template,
                serde_json::to_string(&prompt.tags)?,
                prompt.enabled,
                fmt_ts(chrono::Utc::now()),
                prompt.id,
            ],
        )?;

        if changed == 0 {
            bail!("prompt not found: {}", prompt.id);
        }
        Ok(())
    }

    pub async fn delete_prompt(&self, id: &str) -> Result<()> {
        let guard = self.conn.lock().await;
        let conn = connected(&guard)?;

        let changed = conn.execute("DELETE FROM prompts WHERE id = ?1", params![id])?;
        if changed == 0 {
            bail!("prompt not found: {id}");
        }
        Ok(())
    }

    pub async fn delete_all_prompts(&self) -> Result<usize> {
        let guard = self.conn.lock().await;
        let conn = connected(&guard)?;
        Ok(conn.execute("DELETE FROM prompts", [])?)
    }

    pub async fn create_response(&self, response: &Response) -> Result<()> {
        let guard = self.conn.lock().await;
        let conn = connected(&guard)?;

        conn.execute(
            "INSERT INTO responses (id, prompt_id, prompt_text, llm_id, llm_name, llm_provider, llm_model,
                                    response_text, temperature, schedule_id, tokens_used, latency_ms, error, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                response.id,
                response.prompt_id,
                response.prompt_text,
                response.llm_id,
                response.llm_name,
                response.llm_provider,
                response.llm_model,
                response.response_text,
                response.temperature,
                response.schedule_id,
                response.tokens_used,
                response.latency_ms,
                response.error,
                serde_json::to_string(&response.metadata)?,
                fmt_ts(response.created_at),
            ],
        )?;
        Ok(())
    }

    pub async fn get_response(&self, id: &str) -> Result<Response> {
        let guard = self.conn.lock().await;
        let conn = connected(&guard)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {RESPONSE_COLUMNS} FROM responses WHERE id = ?1"
        ))?;
        let mut rows = stmt.query_map(params![id], read_response)?;
        match rows.next() {
            Some(row) => row?,
            None => bail!("response not found: {id}"),
        }
    }

    pub async fn list_responses(&self, filter: &ResponseFilter) -> Result<Vec<Response>> {
        let guard = self.conn.lock().await;
        let conn = connected(&guard)?;

        let mut sql = format!("SELECT {RESPONSE_COLUMNS} FROM responses");
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(prompt_id) = &filter.prompt_id {
            clauses.push("prompt_id = ?");
            values.push(Value::Text(prompt_id.clone()));
        }
        if let Some(llm_id) = &filter.llm_id {
            clauses.push("llm_id = ?");
            values.push(Value::Text(llm_id.clone()));
        }
        if let Some(schedule_id) = &filter.schedule_id {
            clauses.push("schedule_id = ?");
            values.push(Value::Text(schedule_id.clone()));
        }
        if let Some(keyword) = &filter.keyword {
            clauses.push("INSTR(LOWER(response_text), LOWER(?)) > 0");
            values.push(Value::Text(keyword.clone()));
        }
        if let Some(start) = filter.start_time {
            clauses.push("created_at >= ?");
            values.push(Value::Text(fmt_ts(start)));
        }
        if let Some(end) = filter.end_time {
            clauses.push("created_at <= ?");
            values.push(Value::Text(fmt_ts(end)));
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC");

        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            values.push(Value::Integer(limit as i64));
            if let Some(offset) = filter.offset {
                sql.push_str(" OFFSET ?");
                values.push(Value::Integer(offset as i64));
            }
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values), read_response)?;

        let mut responses = Vec::new();
        for row in rows {
            responses.push(row??);
        }
        Ok(responses)
    }

    pub async fn delete_all_responses(&self) -> Result<usize> {
        let guard = self.conn.lock().await;
        let conn = connected(&guard)?;
        Ok(conn.execute("DELETE FROM responses", [])?)
    }
}

const RESPONSE_COLUMNS: &str = "id, prompt_id, prompt_text, llm_id, llm_name, llm_provider, llm_model, \
     response_text, temperature, schedule_id, tokens_used, latency_ms, error, metadata, created_at";

fn connected<'a>(guard: &'a tokio::sync::MutexGuard<'_, Option<Connection>>) -> Result<&'a Connection> {
    guard.as_ref().ok_or_else(|| anyhow!("not connected to database"))
}

fn read_prompt(row: &Row<'_>) -> rusqlite::Result<Result<PromptTemplate>> {
    let id: String = row.get(0)?;
    let template: String = row.get(1)?;
    let tags: String = row.get(2)?;
    let enabled: bool = row.get(3)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;

    Ok((|| {
        Ok(PromptTemplate {
            id,
            template,
            tags: serde_json::from_str(&tags).context("invalid stored tags")?,
            enabled,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    })())
}

fn read_response(row: &Row<'_>) -> rusqlite::Result<Result<Response>> {
    let id: String = row.get(0)?;
    let prompt_id: String = row.get(1)?;
    let prompt_text: String = row.get(2)?;
    let llm_id: String = row.get(3)?;
    let llm_name: String = row.get(4)?;
    let llm_provider: String = row.get(5)?;
    let llm_model: String = row.get(6)?;
    let response_text: String = row.get(7)?;
    let temperature: f64 = row.get(8)?;
    let schedule_id: String = row.get(9)?;
    let tokens_used: i64 = row.get(10)?;
    let latency_ms: i64 = row.get(11)?;
    let error: String = row.get(12)?;
    let metadata: String = row.get(13)?;
    let created_at: String = row.get(14)?;

    Ok((|| {
        Ok(Response {
            id,
            prompt_id,
            prompt_text,
            llm_id,
            llm_name,
            llm_provider,
            llm_model,
            response_text,
            temperature,
            schedule_id,
            tokens_used,
            latency_ms,
            error,
            metadata: serde_json::from_str::<BTreeMap<String, String>>(&metadata)
                .context("invalid stored metadata")?,
            created_at: parse_ts(&created_at)?,
        })
    })())
}
