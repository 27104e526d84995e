//! Snapshot storage, HTTP fetch utilities, and the relational gateway for HSW.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use hsw_core::{
    Allocation, AllocationStatus, AllocationUpsert, ChangeEvent, DeliveryBatch,
    DeliveryBatchUpsert, DeliveryStatus, SourceRow,
};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, QueryBuilder, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hsw-storage";

// ---------------------------------------------------------------------------
// Snapshot store
// ---------------------------------------------------------------------------

/// Filesystem-backed blob store for raw source snapshots.
///
/// Each source owns two key families: a single `latest/<source>.<ext>` key
/// that is atomically replaced on every successful run (the diff baseline for
/// the next run), and `history/<source>/<stamp>_<hash>.<ext>` keys that are
/// append-only and never rewritten.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ArchivedSnapshot {
    pub content_hash: String,
    pub latest_path: PathBuf,
    pub history_path: PathBuf,
    pub deduplicated: bool,
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("snapshot io for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ArchiveError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn latest_path(&self, source_id: &str, ext: &str) -> PathBuf {
        self.root.join("latest").join(format!("{source_id}.{ext}"))
    }

    fn history_path(
        &self,
        source_id: &str,
        ext: &str,
        captured_at: DateTime<Utc>,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = captured_at.format("%Y%m%d_%H%M%S").to_string();
        let short = &content_hash[..content_hash.len().min(12)];
        self.root
            .join("history")
            .join(source_id)
            .join(format!("{stamp}_{short}.{ext}"))
    }

    /// Read the diff baseline for a source, if one has been archived.
    pub async fn read_latest(&self, source_id: &str, ext: &str) -> anyhow::Result<Option<String>> {
        let path = self.latest_path(source_id, ext);
        match fs::read_to_string(&path).await {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("reading latest snapshot {}", path.display()))
            }
        }
    }

    /// Persist a raw snapshot: an append-only history copy plus an atomic
    /// replacement of the latest key.
    pub async fn archive(
        &self,
        source_id: &str,
        ext: &str,
        captured_at: DateTime<Utc>,
        bytes: &[u8],
    ) -> Result<ArchivedSnapshot, ArchiveError> {
        let content_hash = Self::sha256_hex(bytes);
        let history_path = self.history_path(source_id, ext, captured_at, &content_hash);
        let latest_path = self.latest_path(source_id, ext);

        let mut deduplicated = false;
        if let Some(parent) = history_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ArchiveError::io(parent, e))?;
        }
        match fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&history_path)
            .await
        {
            Ok(mut file) => {
                file.write_all(bytes)
                    .await
                    .map_err(|e| ArchiveError::io(&history_path, e))?;
                file.flush()
                    .await
                    .map_err(|e| ArchiveError::io(&history_path, e))?;
            }
            // Same stamp + same content hash: the history copy already exists.
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                deduplicated = true;
            }
            Err(err) => return Err(ArchiveError::io(&history_path, err)),
        }

        if let Some(parent) = latest_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ArchiveError::io(parent, e))?;
        }
        let temp_path = latest_path.with_extension(format!("{ext}.{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| ArchiveError::io(&temp_path, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| ArchiveError::io(&temp_path, e))?;
        file.flush()
            .await
            .map_err(|e| ArchiveError::io(&temp_path, e))?;
        drop(file);
        if let Err(err) = fs::rename(&temp_path, &latest_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(ArchiveError::io(&latest_path, err));
        }

        Ok(ArchivedSnapshot {
            content_hash,
            latest_path,
            history_path,
            deduplicated,
        })
    }
}

// ---------------------------------------------------------------------------
// HTTP fetch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub accept: String,
    pub max_concurrent: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: "hsw-bot/0.1 (contact: ingest@haleu-supply-watch)".to_string(),
            accept: "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
            max_concurrent: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedText {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Shared HTTP client with retry, exponential backoff, and a global
/// concurrency bound. Any non-success terminal status is a hard failure for
/// the caller's source run.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    accept: String,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            accept: config.accept,
            limit: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_text(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedText, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        let span = info_span!("http_fetch", %run_id, source_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let result = self
                .client
                .get(url)
                .header(reqwest::header::ACCEPT, &self.accept)
                .send()
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedText {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }

    /// Single-attempt JSON POST used for best-effort outbound notifications.
    pub async fn post_json(
        &self,
        url: &str,
        secret_header: Option<(&str, &str)>,
        body: &serde_json::Value,
    ) -> Result<(), FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        let mut request = self.client.post(url).json(body);
        if let Some((name, value)) = secret_header {
            request = request.header(name, value);
        }
        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Relational gateway
// ---------------------------------------------------------------------------

const SCHEMA_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS allocations (
    id TEXT PRIMARY KEY,
    allocated_to TEXT NOT NULL,
    kg DOUBLE PRECISION NOT NULL,
    status TEXT NOT NULL,
    allocation_date TIMESTAMPTZ,
    delivery_window_start TIMESTAMPTZ,
    delivery_window_end TIMESTAMPTZ,
    notes TEXT,
    source_doc_id TEXT,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS delivery_batches (
    id TEXT PRIMARY KEY,
    allocation_id TEXT NOT NULL,
    kg DOUBLE PRECISION NOT NULL,
    status TEXT NOT NULL,
    shipped_at TIMESTAMPTZ,
    received_at TIMESTAMPTZ,
    notes TEXT,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS change_events (
    id UUID PRIMARY KEY,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    change_json JSONB NOT NULL,
    actor TEXT NOT NULL,
    occurred_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS sources (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    url TEXT NOT NULL,
    kind TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_allocations_updated_at ON allocations (updated_at DESC);
CREATE INDEX IF NOT EXISTS idx_delivery_batches_allocation ON delivery_batches (allocation_id, updated_at DESC);
CREATE INDEX IF NOT EXISTS idx_change_events_occurred_at ON change_events (occurred_at DESC);
"#;

/// Outcome of one idempotent batch write: `upserted` counts rows the storage
/// layer actually changed, `total` counts the whole submitted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchOutcome {
    pub upserted: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default)]
pub struct AllocationFilter {
    pub status: Option<AllocationStatus>,
    pub since: Option<DateTime<Utc>>,
    pub cursor: Option<DateTime<Utc>>,
    pub limit: i64,
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    /// Build a pool without touching the server; connections are established
    /// on first use.
    pub fn connect_lazy(url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect_lazy(url)
            .context("configuring postgres pool")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the idempotent schema DDL.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA_DDL)
            .execute(&self.pool)
            .await
            .context("applying schema")?;
        Ok(())
    }

    /// Insert-or-update one allocation keyed by id. Returns whether the row
    /// actually changed: the conflict guard suppresses content-identical
    /// rewrites so no-op resubmissions report zero affected rows.
    async fn upsert_allocation(
        &self,
        item: &AllocationUpsert,
        now: DateTime<Utc>,
    ) -> sqlx::Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO allocations (
                id, allocated_to, kg, status, allocation_date,
                delivery_window_start, delivery_window_end, notes, source_doc_id, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                allocated_to = EXCLUDED.allocated_to,
                kg = EXCLUDED.kg,
                status = EXCLUDED.status,
                allocation_date = EXCLUDED.allocation_date,
                delivery_window_start = EXCLUDED.delivery_window_start,
                delivery_window_end = EXCLUDED.delivery_window_end,
                notes = EXCLUDED.notes,
                source_doc_id = EXCLUDED.source_doc_id,
                updated_at = EXCLUDED.updated_at
            WHERE (allocations.allocated_to, allocations.kg, allocations.status,
                   allocations.allocation_date, allocations.delivery_window_start,
                   allocations.delivery_window_end, allocations.notes, allocations.source_doc_id)
              IS DISTINCT FROM
                  (EXCLUDED.allocated_to, EXCLUDED.kg, EXCLUDED.status,
                   EXCLUDED.allocation_date, EXCLUDED.delivery_window_start,
                   EXCLUDED.delivery_window_end, EXCLUDED.notes, EXCLUDED.source_doc_id)
            "#,
        )
        .bind(&item.id)
        .bind(&item.allocated_to)
        .bind(item.kg)
        .bind(item.status.as_str())
        .bind(item.allocation_date)
        .bind(item.delivery_window_start)
        .bind(item.delivery_window_end)
        .bind(&item.notes)
        .bind(&item.source_doc_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Apply a batch of allocations with a single shared timestamp. A failure
    /// on one record is logged and skipped; the rest of the batch proceeds.
    pub async fn upsert_allocations(
        &self,
        items: &[AllocationUpsert],
        now: DateTime<Utc>,
    ) -> BatchOutcome {
        let mut upserted = 0usize;
        for item in items {
            match self.upsert_allocation(item, now).await {
                Ok(true) => upserted += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(allocation_id = %item.id, error = %err, "allocation upsert failed; continuing batch");
                }
            }
        }
        BatchOutcome {
            upserted,
            total: items.len(),
        }
    }

    async fn upsert_delivery(
        &self,
        item: &DeliveryBatchUpsert,
        now: DateTime<Utc>,
    ) -> sqlx::Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO delivery_batches (
                id, allocation_id, kg, status, shipped_at, received_at, notes, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                allocation_id = EXCLUDED.allocation_id,
                kg = EXCLUDED.kg,
                status = EXCLUDED.status,
                shipped_at = EXCLUDED.shipped_at,
                received_at = EXCLUDED.received_at,
                notes = EXCLUDED.notes,
                updated_at = EXCLUDED.updated_at
            WHERE (delivery_batches.allocation_id, delivery_batches.kg, delivery_batches.status,
                   delivery_batches.shipped_at, delivery_batches.received_at, delivery_batches.notes)
              IS DISTINCT FROM
                  (EXCLUDED.allocation_id, EXCLUDED.kg, EXCLUDED.status,
                   EXCLUDED.shipped_at, EXCLUDED.received_at, EXCLUDED.notes)
            "#,
        )
        .bind(&item.id)
        .bind(&item.allocation_id)
        .bind(item.kg)
        .bind(item.status.as_str())
        .bind(item.shipped_at)
        .bind(item.received_at)
        .bind(&item.notes)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn upsert_deliveries(
        &self,
        items: &[DeliveryBatchUpsert],
        now: DateTime<Utc>,
    ) -> BatchOutcome {
        let mut upserted = 0usize;
        for item in items {
            match self.upsert_delivery(item, now).await {
                Ok(true) => upserted += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(delivery_id = %item.id, error = %err, "delivery upsert failed; continuing batch");
                }
            }
        }
        BatchOutcome {
            upserted,
            total: items.len(),
        }
    }

    /// Append one audit event. Never updated or deleted afterwards.
    pub async fn insert_change_event(
        &self,
        entity_type: &str,
        entity_id: &str,
        change_json: serde_json::Value,
        actor: &str,
        occurred_at: DateTime<Utc>,
    ) -> sqlx::Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO change_events (id, entity_type, entity_id, change_json, actor, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(id)
        .bind(entity_type)
        .bind(entity_id)
        .bind(change_json)
        .bind(actor)
        .bind(occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn upsert_source(&self, source: &SourceRow) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sources (id, name, url, kind)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                url = EXCLUDED.url,
                kind = EXCLUDED.kind
            "#,
        )
        .bind(&source.id)
        .bind(&source.name)
        .bind(&source.url)
        .bind(&source.kind)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_allocations(&self, filter: &AllocationFilter) -> sqlx::Result<Vec<Allocation>> {
        let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
            "SELECT id, allocated_to, kg, status, allocation_date, delivery_window_start, \
             delivery_window_end, notes, source_doc_id, updated_at FROM allocations WHERE TRUE",
        );
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(since) = filter.since {
            qb.push(" AND updated_at >= ").push_bind(since);
        }
        if let Some(cursor) = filter.cursor {
            qb.push(" AND updated_at <= ").push_bind(cursor);
        }
        qb.push(" ORDER BY updated_at DESC, id ASC LIMIT ")
            .push_bind(filter.limit.max(1));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(allocation_from_row).collect()
    }

    pub async fn get_allocation(&self, id: &str) -> sqlx::Result<Option<Allocation>> {
        let row = sqlx::query(
            "SELECT id, allocated_to, kg, status, allocation_date, delivery_window_start, \
             delivery_window_end, notes, source_doc_id, updated_at FROM allocations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(allocation_from_row).transpose()
    }

    pub async fn deliveries_for_allocation(
        &self,
        allocation_id: &str,
    ) -> sqlx::Result<Vec<DeliveryBatch>> {
        let rows = sqlx::query(
            "SELECT id, allocation_id, kg, status, shipped_at, received_at, notes, updated_at \
             FROM delivery_batches WHERE allocation_id = $1 ORDER BY updated_at DESC",
        )
        .bind(allocation_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(delivery_from_row).collect()
    }

    pub async fn list_changes(
        &self,
        cursor: Option<DateTime<Utc>>,
        limit: i64,
    ) -> sqlx::Result<Vec<ChangeEvent>> {
        let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
            "SELECT id, entity_type, entity_id, change_json, actor, occurred_at \
             FROM change_events WHERE TRUE",
        );
        if let Some(cursor) = cursor {
            qb.push(" AND occurred_at <= ").push_bind(cursor);
        }
        qb.push(" ORDER BY occurred_at DESC, id ASC LIMIT ")
            .push_bind(limit.max(1));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(change_event_from_row).collect()
    }

    pub async fn list_sources(&self) -> sqlx::Result<Vec<SourceRow>> {
        let rows = sqlx::query("SELECT id, name, url, kind FROM sources ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(SourceRow {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    url: row.try_get("url")?,
                    kind: row.try_get("kind")?,
                })
            })
            .collect()
    }
}

fn decode_err(err: impl std::error::Error + Send + Sync + 'static) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(err))
}

fn allocation_from_row(row: &PgRow) -> sqlx::Result<Allocation> {
    let status: String = row.try_get("status")?;
    Ok(Allocation {
        id: row.try_get("id")?,
        allocated_to: row.try_get("allocated_to")?,
        kg: row.try_get("kg")?,
        status: AllocationStatus::from_str(&status).map_err(decode_err)?,
        allocation_date: row.try_get("allocation_date")?,
        delivery_window_start: row.try_get("delivery_window_start")?,
        delivery_window_end: row.try_get("delivery_window_end")?,
        notes: row.try_get("notes")?,
        source_doc_id: row.try_get("source_doc_id")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn delivery_from_row(row: &PgRow) -> sqlx::Result<DeliveryBatch> {
    let status: String = row.try_get("status")?;
    Ok(DeliveryBatch {
        id: row.try_get("id")?,
        allocation_id: row.try_get("allocation_id")?,
        kg: row.try_get("kg")?,
        status: DeliveryStatus::from_str(&status).map_err(decode_err)?,
        shipped_at: row.try_get("shipped_at")?,
        received_at: row.try_get("received_at")?,
        notes: row.try_get("notes")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn change_event_from_row(row: &PgRow) -> sqlx::Result<ChangeEvent> {
    Ok(ChangeEvent {
        id: row.try_get("id")?,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        change_json: row.try_get("change_json")?,
        actor: row.try_get("actor")?,
        occurred_at: row.try_get("occurred_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn snapshot_hashing_is_stable() {
        let hash = SnapshotStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn archive_overwrites_latest_and_accumulates_history() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let first_at = DateTime::parse_from_rfc3339("2026-08-01T06:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);
        let second_at = DateTime::parse_from_rfc3339("2026-08-02T06:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        assert!(store.read_latest("doe-hub", "html").await.unwrap().is_none());

        let first = store
            .archive("doe-hub", "html", first_at, b"<html>one</html>")
            .await
            .expect("first archive");
        let second = store
            .archive("doe-hub", "html", second_at, b"<html>two</html>")
            .await
            .expect("second archive");

        assert_ne!(first.history_path, second.history_path);
        assert!(first.history_path.exists());
        assert!(second.history_path.exists());
        assert_eq!(first.latest_path, second.latest_path);
        assert_eq!(
            store.read_latest("doe-hub", "html").await.unwrap().as_deref(),
            Some("<html>two</html>")
        );
    }

    #[tokio::test]
    async fn re_archiving_identical_content_at_same_stamp_is_deduplicated() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let captured_at = DateTime::parse_from_rfc3339("2026-08-01T06:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .archive("doe-allocations", "csv", captured_at, b"id,kg\n")
            .await
            .expect("first archive");
        let second = store
            .archive("doe-allocations", "csv", captured_at, b"id,kg\n")
            .await
            .expect("second archive");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.history_path, second.history_path);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn status_classification_marks_server_errors_retryable() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            RetryDisposition::NonRetryable
        );
    }
}
