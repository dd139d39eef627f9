//! Offering persistence, raw snapshot archive and HTTP fetch utilities.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderValue, RETRY_AFTER};
use reqwest::StatusCode;
use roster_core::{
    BulkApplyCounts, CompositeKey, Deactivation, OfferingStatus, OfferingUpsert,
    PersistedOffering, WriteFailure,
};
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "roster-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt offering row {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Persisted offering collection keyed by composite key.
#[async_trait]
pub trait OfferingStore: Send + Sync {
    /// Every offering regardless of status.
    async fn find_all(&self) -> Result<Vec<PersistedOffering>, StoreError>;

    /// Apply upserts and deactivations. Operations are independent: a failing
    /// one is reported in `failures` and does not stop the rest.
    async fn bulk_apply(
        &self,
        upserts: &[OfferingUpsert],
        deactivations: &[Deactivation],
    ) -> Result<BulkApplyCounts, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryOfferingStore {
    rows: RwLock<BTreeMap<CompositeKey, PersistedOffering>>,
}

impl MemoryOfferingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_offerings(offerings: impl IntoIterator<Item = PersistedOffering>) -> Self {
        let rows = offerings.into_iter().map(|o| (o.key(), o)).collect();
        Self {
            rows: RwLock::new(rows),
        }
    }

    pub async fn get(&self, key: &CompositeKey) -> Option<PersistedOffering> {
        self.rows.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl OfferingStore for MemoryOfferingStore {
    async fn find_all(&self) -> Result<Vec<PersistedOffering>, StoreError> {
        Ok(self.rows.read().await.values().cloned().collect())
    }

    async fn bulk_apply(
        &self,
        upserts: &[OfferingUpsert],
        deactivations: &[Deactivation],
    ) -> Result<BulkApplyCounts, StoreError> {
        let now = Utc::now();
        let mut counts = BulkApplyCounts::default();
        let mut rows = self.rows.write().await;

        for op in upserts {
            let key = op.key();
            match rows.get_mut(&key) {
                Some(existing) => {
                    existing.refresh_from(&op.record, &op.updater_identity, now);
                    counts.modified += 1;
                }
                None => {
                    rows.insert(
                        key,
                        PersistedOffering::from_incoming(&op.record, &op.updater_identity, now),
                    );
                    counts.inserted += 1;
                }
            }
        }

        for op in deactivations {
            match rows.get_mut(&op.key) {
                Some(existing) => {
                    existing.status = OfferingStatus::Inactive;
                    existing.updater_identity = Some(op.updater_identity.clone());
                    existing.updated_at = now;
                    counts.deactivated += 1;
                }
                None => {
                    warn!(key = %op.key, "deactivation target vanished before write");
                    counts.failures.push(WriteFailure {
                        key: op.key.clone(),
                        message: "offering not found".to_string(),
                    });
                }
            }
        }

        Ok(counts)
    }
}

const SELECT_OFFERINGS: &str = r#"
    SELECT id, term, subject_id, area_code, level, subject_name, department_code,
           department_name, area_name, cost_center, subject_code, status,
           creator_identity, updater_identity, created_at, updated_at
      FROM offerings
     ORDER BY term, subject_id, area_code
"#;

const UPSERT_OFFERING: &str = r#"
    INSERT INTO offerings (
        id, term, subject_id, area_code, level, subject_name, department_code,
        department_name, area_name, cost_center, subject_code, status,
        creator_identity, updater_identity, created_at, updated_at
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 'ACTIVE', $12, $12, NOW(), NOW())
    ON CONFLICT (term, subject_id, area_code) DO UPDATE
       SET level = EXCLUDED.level,
           subject_name = EXCLUDED.subject_name,
           department_code = EXCLUDED.department_code,
           department_name = EXCLUDED.department_name,
           area_name = EXCLUDED.area_name,
           cost_center = EXCLUDED.cost_center,
           subject_code = EXCLUDED.subject_code,
           status = 'ACTIVE',
           updater_identity = EXCLUDED.updater_identity,
           updated_at = NOW()
    RETURNING (xmax = 0) AS inserted
"#;

const DEACTIVATE_OFFERING: &str = r#"
    UPDATE offerings
       SET status = 'INACTIVE',
           updater_identity = $4,
           updated_at = NOW()
     WHERE term = $1
       AND subject_id = $2
       AND area_code = $3
"#;

/// Postgres-backed store; `offerings_composite_key` enforces one row per key and
/// `offerings_key_trimmed` keeps stored keys in the same trimmed form
/// [`CompositeKey`] compares, so plain equality on the columns matches.
#[derive(Debug, Clone)]
pub struct PgOfferingStore {
    pool: PgPool,
}

impl PgOfferingStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn upsert_one(&self, op: &OfferingUpsert) -> Result<bool, sqlx::Error> {
        let r = &op.record;
        let key = op.key();
        let row = sqlx::query(UPSERT_OFFERING)
            .bind(key.stable_id())
            .bind(&key.term)
            .bind(&key.subject_id)
            .bind(&key.area_code)
            .bind(&r.level)
            .bind(&r.subject_name)
            .bind(&r.department_code)
            .bind(&r.department_name)
            .bind(&r.area_name)
            .bind(&r.cost_center)
            .bind(&r.subject_code)
            .bind(&op.updater_identity)
            .fetch_one(&self.pool)
            .await?;
        row.try_get("inserted")
    }

    async fn deactivate_one(&self, op: &Deactivation) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(DEACTIVATE_OFFERING)
            .bind(&op.key.term)
            .bind(&op.key.subject_id)
            .bind(&op.key.area_code)
            .bind(&op.updater_identity)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn offering_from_row(row: &sqlx::postgres::PgRow) -> Result<PersistedOffering, StoreError> {
    let term: String = row.try_get("term")?;
    let subject_id: String = row.try_get("subject_id")?;
    let area_code: String = row.try_get("area_code")?;
    let status_text: String = row.try_get("status")?;
    let status = status_text
        .parse::<OfferingStatus>()
        .map_err(|reason| StoreError::Corrupt {
            key: CompositeKey::new(&term, &subject_id, &area_code).to_string(),
            reason,
        })?;

    Ok(PersistedOffering {
        id: row.try_get("id")?,
        term,
        subject_id,
        area_code,
        level: row.try_get("level")?,
        subject_name: row.try_get("subject_name")?,
        department_code: row.try_get("department_code")?,
        department_name: row.try_get("department_name")?,
        area_name: row.try_get("area_name")?,
        cost_center: row.try_get("cost_center")?,
        subject_code: row.try_get("subject_code")?,
        status,
        creator_identity: row.try_get("creator_identity")?,
        updater_identity: row.try_get("updater_identity")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl OfferingStore for PgOfferingStore {
    async fn find_all(&self) -> Result<Vec<PersistedOffering>, StoreError> {
        let rows = sqlx::query(SELECT_OFFERINGS).fetch_all(&self.pool).await?;
        rows.iter().map(offering_from_row).collect()
    }

    async fn bulk_apply(
        &self,
        upserts: &[OfferingUpsert],
        deactivations: &[Deactivation],
    ) -> Result<BulkApplyCounts, StoreError> {
        let mut counts = BulkApplyCounts::default();

        for op in upserts {
            match self.upsert_one(op).await {
                Ok(true) => counts.inserted += 1,
                Ok(false) => counts.modified += 1,
                Err(err) => {
                    warn!(key = %op.key(), error = %err, "offering upsert failed");
                    counts.failures.push(WriteFailure {
                        key: op.key(),
                        message: err.to_string(),
                    });
                }
            }
        }

        for op in deactivations {
            match self.deactivate_one(op).await {
                Ok(0) => counts.failures.push(WriteFailure {
                    key: op.key.clone(),
                    message: "offering not found".to_string(),
                }),
                Ok(_) => counts.deactivated += 1,
                Err(err) => {
                    warn!(key = %op.key, error = %err, "offering deactivation failed");
                    counts.failures.push(WriteFailure {
                        key: op.key.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }

        Ok(counts)
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable, hash-addressed archive of every raw roster payload a sync consumed.
#[derive(Debug, Clone)]
pub struct RosterArchive {
    root: PathBuf,
}

impl RosterArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn snapshot_relative_path(
        received_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        PathBuf::from(received_at.format("%Y%m%d_%H%M%S").to_string())
            .join(source_id)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Write `bytes` once; a second payload with the same hash is reported as deduplicated.
    pub async fn archive_bytes(
        &self,
        received_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            Self::snapshot_relative_path(received_at, source_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let snapshot = |deduplicated| ArchivedSnapshot {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        let parent = absolute_path
            .parent()
            .with_context(|| format!("snapshot path {} has no parent", absolute_path.display()))?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
        {
            return Ok(snapshot(true));
        }

        let temp_path = parent.join(format!(".{}.partial", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp snapshot {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(snapshot(false)),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                if err.kind() == std::io::ErrorKind::AlreadyExists {
                    return Ok(snapshot(true));
                }
                Err(err).with_context(|| {
                    format!(
                        "renaming {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

/// Spacing between attempts at pulling a roster export.
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
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    /// Doubling wait after the `retry`-th failed attempt (0-based), capped at `max_delay`.
    pub fn wait_after(&self, retry: usize) -> Duration {
        let doubled = u32::try_from(retry)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(doubled).min(self.max_delay)
    }

    /// Wait before retrying an export endpoint that answered `status`, or `None`
    /// when retrying cannot help. A `Retry-After` in seconds is honored up to
    /// `max_delay`.
    pub fn wait_for_status(
        &self,
        status: StatusCode,
        retry_after: Option<&HeaderValue>,
        retry: usize,
    ) -> Option<Duration> {
        let transient = matches!(
            status,
            StatusCode::REQUEST_TIMEOUT
                | StatusCode::TOO_MANY_REQUESTS
                | StatusCode::BAD_GATEWAY
                | StatusCode::SERVICE_UNAVAILABLE
                | StatusCode::GATEWAY_TIMEOUT
        );
        if !transient || retry >= self.max_retries {
            return None;
        }
        let requested = retry_after
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        Some(requested.map_or_else(|| self.wait_after(retry), |d| d.min(self.max_delay)))
    }

    /// Same as [`BackoffPolicy::wait_for_status`] for transport failures; only
    /// timeouts and refused connections are worth another try.
    pub fn wait_for_error(&self, err: &reqwest::Error, retry: usize) -> Option<Duration> {
        ((err.is_timeout() || err.is_connect()) && retry < self.max_retries)
            .then(|| self.wait_after(retry))
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPayload {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Pulls remote roster exports, retrying transient failures.
#[derive(Debug)]
pub struct RosterFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl RosterFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedPayload, FetchError> {
        let span = info_span!("roster_fetch", source_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedPayload, FetchError> {
        let mut retry = 0usize;
        loop {
            let wait = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(FetchedPayload {
                        status,
                        final_url,
                        body,
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let wait = self
                        .backoff
                        .wait_for_status(status, resp.headers().get(RETRY_AFTER), retry)
                        .ok_or_else(|| FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        })?;
                    warn!(%status, retry, wait_ms = wait.as_millis() as u64, "roster export unavailable; retrying");
                    wait
                }
                Err(err) => match self.backoff.wait_for_error(&err, retry) {
                    Some(wait) => {
                        warn!(error = %err, retry, "roster export unreachable; retrying");
                        wait
                    }
                    None => return Err(FetchError::Request(err)),
                },
            };
            tokio::time::sleep(wait).await;
            retry += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roster_core::IncomingRecord;
    use tempfile::tempdir;

    fn upsert(term: &str, subject_id: &str, area_code: &str, name: &str) -> OfferingUpsert {
        OfferingUpsert {
            record: IncomingRecord {
                term: term.into(),
                subject_id: subject_id.into(),
                area_code: area_code.into(),
                subject_name: name.into(),
                ..Default::default()
            },
            updater_identity: "registrar".into(),
        }
    }

    #[tokio::test]
    async fn memory_store_inserts_then_modifies() {
        let store = MemoryOfferingStore::new();
        let first = store
            .bulk_apply(&[upsert("2024-1", "100", "A", "Calculus")], &[])
            .await
            .expect("insert");
        assert_eq!(first.inserted, 1);

        let second = store
            .bulk_apply(&[upsert("2024-1", "100", "A", "Calculus I")], &[])
            .await
            .expect("update");
        assert_eq!(second.modified, 1);
        assert_eq!(store.len().await, 1);

        let row = store
            .get(&CompositeKey::new("2024-1", "100", "A"))
            .await
            .expect("row");
        assert_eq!(row.subject_name.as_deref(), Some("Calculus I"));
        assert_eq!(row.creator_identity.as_deref(), Some("registrar"));
        assert_eq!(row.status, OfferingStatus::Active);
    }

    #[tokio::test]
    async fn memory_store_deactivation_failure_does_not_abort_siblings() {
        let store = MemoryOfferingStore::new();
        store
            .bulk_apply(&[upsert("2024-1", "100", "A", "Calculus")], &[])
            .await
            .expect("seed");

        let counts = store
            .bulk_apply(
                &[upsert("2024-1", "200", "A", "Physics")],
                &[
                    Deactivation {
                        key: CompositeKey::new("2024-1", "999", "Z"),
                        updater_identity: "registrar".into(),
                    },
                    Deactivation {
                        key: CompositeKey::new("2024-1", "100", "A"),
                        updater_identity: "registrar".into(),
                    },
                ],
            )
            .await
            .expect("apply");

        assert_eq!(counts.inserted, 1);
        assert_eq!(counts.deactivated, 1);
        assert_eq!(counts.failures.len(), 1);
        assert_eq!(counts.failures[0].key, CompositeKey::new("2024-1", "999", "Z"));

        let row = store
            .get(&CompositeKey::new("2024-1", "100", "A"))
            .await
            .expect("row");
        assert_eq!(row.status, OfferingStatus::Inactive);
        assert_eq!(row.subject_name.as_deref(), Some("Calculus"));
    }

    #[tokio::test]
    async fn memory_store_folds_padded_keys_into_one_offering() {
        let store = MemoryOfferingStore::new();
        store
            .bulk_apply(&[upsert(" 2024-1", " 100 ", "A ", "Calculus")], &[])
            .await
            .expect("padded");
        let counts = store
            .bulk_apply(&[upsert("2024-1", "100", "A", "Calculus I")], &[])
            .await
            .expect("trimmed");

        assert_eq!((counts.inserted, counts.modified), (0, 1));
        let all = store.find_all().await.expect("find");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].subject_id, "100");
    }

    /// Runs against a real database only when `DATABASE_URL` is set.
    async fn pg_store() -> Option<PgOfferingStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let store = PgOfferingStore::connect(&url).await.expect("connect");
        store.migrate().await.expect("migrate");
        Some(store)
    }

    #[tokio::test]
    async fn pg_store_matches_offerings_by_trimmed_key() {
        let Some(store) = pg_store().await else {
            return;
        };
        let term = format!("test-{}", Uuid::new_v4());

        let first = store
            .bulk_apply(&[upsert(&format!(" {term} "), " 100 ", "A ", "Calculus")], &[])
            .await
            .expect("padded insert");
        assert_eq!(first.inserted, 1);

        let second = store
            .bulk_apply(&[upsert(&term, "100", "A", "Calculus I")], &[])
            .await
            .expect("trimmed update");
        assert_eq!((second.inserted, second.modified), (0, 1));

        let deactivated = store
            .bulk_apply(
                &[],
                &[Deactivation {
                    key: CompositeKey::new(&term, "100", "A"),
                    updater_identity: "registrar".into(),
                }],
            )
            .await
            .expect("deactivate");
        assert_eq!(deactivated.deactivated, 1);
        assert!(deactivated.failures.is_empty());

        let mine = store
            .find_all()
            .await
            .expect("find")
            .into_iter()
            .filter(|o| o.term == term)
            .collect::<Vec<_>>();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].subject_id, "100");
        assert_eq!(mine[0].subject_name.as_deref(), Some("Calculus I"));
        assert_eq!(mine[0].status, OfferingStatus::Inactive);

        let padded_raw = sqlx::query(
            "INSERT INTO offerings (id, term, subject_id, area_code) VALUES ($1, $2, ' 200 ', 'A')",
        )
        .bind(Uuid::new_v4())
        .bind(&term)
        .execute(&store.pool)
        .await;
        assert!(padded_raw.is_err());

        sqlx::query("DELETE FROM offerings WHERE term = $1")
            .bind(&term)
            .execute(&store.pool)
            .await
            .expect("cleanup");
    }

    #[test]
    fn snapshot_hashing_is_stable() {
        assert_eq!(
            RosterArchive::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn archive_deduplicates_identical_payloads() {
        let dir = tempdir().expect("tempdir");
        let archive = RosterArchive::new(dir.path());
        let received_at = DateTime::parse_from_rfc3339("2026-03-01T08:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .archive_bytes(received_at, "upload", "csv", b"PERIODO;AREA\n2024-1;A\n")
            .await
            .expect("first");
        let second = archive
            .archive_bytes(received_at, "upload", ".csv", b"PERIODO;AREA\n2024-1;A\n")
            .await
            .expect("second");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
        assert!(first.relative_path.to_string_lossy().ends_with(".csv"));
    }

    #[test]
    fn backoff_doubles_until_the_cap() {
        let policy = BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.wait_after(0), Duration::from_millis(100));
        assert_eq!(policy.wait_after(1), Duration::from_millis(200));
        assert_eq!(policy.wait_after(2), Duration::from_millis(350));
        assert_eq!(policy.wait_after(40), Duration::from_millis(350));
    }

    #[test]
    fn only_transient_export_statuses_are_retried() {
        let policy = BackoffPolicy::default();
        assert!(policy.wait_for_status(StatusCode::BAD_GATEWAY, None, 0).is_some());
        assert!(policy.wait_for_status(StatusCode::TOO_MANY_REQUESTS, None, 0).is_some());
        assert!(policy.wait_for_status(StatusCode::INTERNAL_SERVER_ERROR, None, 0).is_none());
        assert!(policy.wait_for_status(StatusCode::NOT_FOUND, None, 0).is_none());
        assert!(policy
            .wait_for_status(StatusCode::SERVICE_UNAVAILABLE, None, policy.max_retries)
            .is_none());
    }

    #[test]
    fn retry_after_is_honored_within_the_cap() {
        let policy = BackoffPolicy::default();
        let soon = HeaderValue::from_static("2");
        let late = HeaderValue::from_static("3600");
        assert_eq!(
            policy.wait_for_status(StatusCode::SERVICE_UNAVAILABLE, Some(&soon), 0),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            policy.wait_for_status(StatusCode::TOO_MANY_REQUESTS, Some(&late), 0),
            Some(policy.max_delay)
        );
    }
}
