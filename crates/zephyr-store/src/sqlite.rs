//! SQLite implementation of the `Store` port.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use zephyr_core::ids::{JobId, ProjectId, RunId};
use zephyr_core::ports::{RunFilter, Store};
use zephyr_core::run::{
    Job, JobStatus, LogRecord, LogStream, PipelineRun, Project, RunStatus, WebhookDelivery,
};
use zephyr_core::{Error, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    description TEXT,
    config_path TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pipeline_runs (
    id            TEXT PRIMARY KEY,
    project_id    TEXT NOT NULL,
    pipeline_name TEXT NOT NULL,
    trigger_type  TEXT NOT NULL,
    trigger_data  TEXT NOT NULL,
    branch        TEXT,
    commit_sha    TEXT,
    status        TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    started_at    TEXT,
    finished_at   TEXT
);
CREATE INDEX IF NOT EXISTS idx_runs_project ON pipeline_runs (project_id, created_at);
CREATE INDEX IF NOT EXISTS idx_runs_status ON pipeline_runs (status);

CREATE TABLE IF NOT EXISTS jobs (
    id              TEXT PRIMARY KEY,
    pipeline_run_id TEXT NOT NULL,
    name            TEXT NOT NULL,
    runner_image    TEXT NOT NULL,
    depends_on      TEXT NOT NULL,
    status          TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    started_at      TEXT,
    finished_at     TEXT,
    outputs         TEXT NOT NULL DEFAULT '{}',
    failure_reason  TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_run ON jobs (pipeline_run_id);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status, created_at);

CREATE TABLE IF NOT EXISTS logs (
    job_id    TEXT NOT NULL,
    seq       INTEGER NOT NULL,
    stream    TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    content   TEXT NOT NULL,
    PRIMARY KEY (job_id, seq)
);

CREATE TABLE IF NOT EXISTS webhook_deliveries (
    id          TEXT PRIMARY KEY,
    provider    TEXT NOT NULL,
    event_type  TEXT NOT NULL,
    payload     TEXT NOT NULL,
    signature   TEXT,
    received_at TEXT NOT NULL
);
"#;

/// SQLite-backed store. The database file is the orchestrator's only
/// durable state.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path` and ensure the
    /// schema exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        Self::connect_with(options).await
    }

    /// In-memory database, used by tests.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| Error::Database(e.to_string()))?;
        Self::connect_with(options).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(Self { pool })
    }

    fn row_to_project(r: &SqliteRow) -> Result<Project> {
        let id: String = r.get("id");
        Ok(Project {
            id: id.parse().map_err(|_| Error::Database(format!("bad project id {id}")))?,
            name: r.get("name"),
            description: r.get("description"),
            config_path: r.get("config_path"),
        })
    }

    fn row_to_run(r: &SqliteRow) -> Result<PipelineRun> {
        let id: String = r.get("id");
        let project_id: String = r.get("project_id");
        let status: String = r.get("status");
        let trigger_type: String = r.get("trigger_type");
        let trigger_data: String = r.get("trigger_data");

        Ok(PipelineRun {
            id: id.parse().map_err(|_| Error::Database(format!("bad run id {id}")))?,
            project_id: project_id
                .parse()
                .map_err(|_| Error::Database(format!("bad project id {project_id}")))?,
            pipeline_name: r.get("pipeline_name"),
            trigger_type: serde_json::from_value(serde_json::Value::String(trigger_type))
                .map_err(|e| Error::Database(e.to_string()))?,
            trigger_data: serde_json::from_str(&trigger_data)
                .map_err(|e| Error::Database(e.to_string()))?,
            branch: r.get("branch"),
            commit_sha: r.get("commit_sha"),
            status: RunStatus::parse(&status)
                .ok_or_else(|| Error::Database(format!("unknown run status {status}")))?,
            created_at: r.get("created_at"),
            started_at: r.get("started_at"),
            finished_at: r.get("finished_at"),
        })
    }

    fn row_to_job(r: &SqliteRow) -> Result<Job> {
        let run_id: String = r.get("pipeline_run_id");
        let status: String = r.get("status");
        let depends_on: String = r.get("depends_on");
        let outputs: String = r.get("outputs");

        Ok(Job {
            id: JobId::from_string(r.get::<String, _>("id")),
            pipeline_run_id: run_id
                .parse()
                .map_err(|_| Error::Database(format!("bad run id {run_id}")))?,
            name: r.get("name"),
            runner_image: r.get("runner_image"),
            depends_on: serde_json::from_str(&depends_on)
                .map_err(|e| Error::Database(e.to_string()))?,
            status: JobStatus::parse(&status)
                .ok_or_else(|| Error::Database(format!("unknown job status {status}")))?,
            created_at: r.get("created_at"),
            started_at: r.get("started_at"),
            finished_at: r.get("finished_at"),
            outputs: serde_json::from_str(&outputs).map_err(|e| Error::Database(e.to_string()))?,
            failure_reason: r.get("failure_reason"),
        })
    }

    fn row_to_log(r: &SqliteRow) -> Result<LogRecord> {
        let stream: String = r.get("stream");
        Ok(LogRecord {
            job_id: JobId::from_string(r.get::<String, _>("job_id")),
            seq: r.get::<i64, _>("seq") as u64,
            stream: LogStream::parse(&stream)
                .ok_or_else(|| Error::Database(format!("unknown log stream {stream}")))?,
            timestamp: r.get("timestamp"),
            content: r.get("content"),
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_project(&self, project: &Project) -> Result<()> {
        sqlx::query(
            "INSERT INTO projects (id, name, description, config_path) VALUES (?, ?, ?, ?)",
        )
        .bind(project.id.to_string())
        .bind(&project.name)
        .bind(&project.description)
        .bind(&project.config_path)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn get_project(&self, id: &ProjectId) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        row.map(|r| Self::row_to_project(&r)).transpose()
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query("SELECT * FROM projects ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        rows.iter().map(Self::row_to_project).collect()
    }

    async fn create_pipeline_run(&self, run: &PipelineRun) -> Result<()> {
        let trigger_type = serde_json::to_value(run.trigger_type)?;
        sqlx::query(
            r#"INSERT INTO pipeline_runs
               (id, project_id, pipeline_name, trigger_type, trigger_data, branch, commit_sha,
                status, created_at, started_at, finished_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(run.project_id.to_string())
        .bind(&run.pipeline_name)
        .bind(trigger_type.as_str().unwrap_or("api").to_string())
        .bind(serde_json::to_string(&run.trigger_data)?)
        .bind(&run.branch)
        .bind(&run.commit_sha)
        .bind(run.status.as_str())
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn get_pipeline_run(&self, id: &RunId) -> Result<Option<PipelineRun>> {
        let row = sqlx::query("SELECT * FROM pipeline_runs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        row.map(|r| Self::row_to_run(&r)).transpose()
    }

    async fn list_pipeline_runs(&self, filter: &RunFilter) -> Result<Vec<PipelineRun>> {
        let limit = filter.limit.unwrap_or(50) as i64;
        let rows = match (&filter.project_id, &filter.status) {
            (Some(project), Some(status)) => {
                sqlx::query(
                    "SELECT * FROM pipeline_runs WHERE project_id = ? AND status = ? ORDER BY created_at DESC LIMIT ?",
                )
                .bind(project.to_string())
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            (Some(project), None) => {
                sqlx::query(
                    "SELECT * FROM pipeline_runs WHERE project_id = ? ORDER BY created_at DESC LIMIT ?",
                )
                .bind(project.to_string())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            (None, Some(status)) => {
                sqlx::query(
                    "SELECT * FROM pipeline_runs WHERE status = ? ORDER BY created_at DESC LIMIT ?",
                )
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            (None, None) => {
                sqlx::query("SELECT * FROM pipeline_runs ORDER BY created_at DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| Error::Database(e.to_string()))?;
        rows.iter().map(Self::row_to_run).collect()
    }

    async fn update_run_status(&self, id: &RunId, status: RunStatus) -> Result<()> {
        let now = Utc::now();
        let started_at = (status == RunStatus::Running).then_some(now);
        let finished_at = status.is_terminal().then_some(now);
        let result = sqlx::query(
            r#"UPDATE pipeline_runs
               SET status = ?,
                   started_at = COALESCE(started_at, ?),
                   finished_at = COALESCE(finished_at, ?)
               WHERE id = ?"#,
        )
        .bind(status.as_str())
        .bind(started_at)
        .bind(finished_at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("run {id}")));
        }
        Ok(())
    }

    async fn create_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO jobs
               (id, pipeline_run_id, name, runner_image, depends_on, status, created_at,
                started_at, finished_at, outputs, failure_reason)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(job.id.as_str())
        .bind(job.pipeline_run_id.to_string())
        .bind(&job.name)
        .bind(&job.runner_image)
        .bind(serde_json::to_string(&job.depends_on)?)
        .bind(job.status.as_str())
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(serde_json::to_string(&job.outputs)?)
        .bind(&job.failure_reason)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn update_job_status(
        &self,
        id: &JobId,
        expected: JobStatus,
        next: JobStatus,
    ) -> Result<()> {
        let now = Utc::now();
        let started_at = (next == JobStatus::Running).then_some(now);
        let finished_at = next.is_terminal().then_some(now);
        let result = sqlx::query(
            r#"UPDATE jobs
               SET status = ?,
                   started_at = COALESCE(started_at, ?),
                   finished_at = COALESCE(finished_at, ?)
               WHERE id = ? AND status = ?"#,
        )
        .bind(next.as_str())
        .bind(started_at)
        .bind(finished_at)
        .bind(id.as_str())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(Error::StoreConflict(id.to_string()));
        }
        Ok(())
    }

    async fn set_job_outputs(
        &self,
        id: &JobId,
        outputs: &HashMap<String, String>,
        failure_reason: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE jobs SET outputs = ?, failure_reason = ? WHERE id = ?")
            .bind(serde_json::to_string(outputs)?)
            .bind(failure_reason)
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        row.map(|r| Self::row_to_job(&r)).transpose()
    }

    async fn get_jobs_for_pipeline_run(&self, run_id: &RunId) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE pipeline_run_id = ? ORDER BY created_at, id",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn get_pending_jobs(&self, limit: u32) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE status = 'pending' ORDER BY created_at, id LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn get_running_jobs(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE status = 'running' ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn count_jobs_by_status(&self) -> Result<HashMap<JobStatus, u64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut counts = HashMap::new();
        for r in rows {
            let status: String = r.get("status");
            if let Some(status) = JobStatus::parse(&status) {
                counts.insert(status, r.get::<i64, _>("n") as u64);
            }
        }
        Ok(counts)
    }

    async fn append_log(&self, job_id: &JobId, stream: LogStream, content: &str) -> Result<u64> {
        let row = sqlx::query(
            r#"INSERT INTO logs (job_id, seq, stream, timestamp, content)
               VALUES (?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM logs WHERE job_id = ?), ?, ?, ?)
               RETURNING seq"#,
        )
        .bind(job_id.as_str())
        .bind(job_id.as_str())
        .bind(stream.as_str())
        .bind(Utc::now())
        .bind(content)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(row.get::<i64, _>("seq") as u64)
    }

    async fn get_logs_for_job(
        &self,
        job_id: &JobId,
        since: Option<u64>,
    ) -> Result<Vec<LogRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM logs WHERE job_id = ? AND seq > ? ORDER BY seq",
        )
        .bind(job_id.as_str())
        .bind(since.unwrap_or(0) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        rows.iter().map(Self::row_to_log).collect()
    }

    async fn save_webhook_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO webhook_deliveries (id, provider, event_type, payload, signature, received_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(delivery.id.to_string())
        .bind(&delivery.provider)
        .bind(&delivery.event_type)
        .bind(serde_json::to_string(&delivery.payload)?)
        .bind(&delivery.signature)
        .bind(delivery.received_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
