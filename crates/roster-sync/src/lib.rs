//! Roster sync: deduplication, reconciliation against persisted offerings, run reporting.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use roster_adapters::{
    normalize_rows, source_from_config, ColumnMapping, RowSource, SourceConfig, SourceError,
};
use roster_core::{
    incoming_content_fields, BulkApplyCounts, CompositeKey, Deactivation, IncomingRecord,
    OfferingStatus, OfferingUpsert, PersistedOffering, RawRow, WriteFailure,
};
use roster_storage::{
    FetcherConfig, MemoryOfferingStore, OfferingStore, PgOfferingStore, RosterArchive,
    RosterFetcher, StoreError,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "roster-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub archive_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub system_actor: String,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            archive_dir: std::env::var("ROSTER_ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./archive")),
            scheduler_enabled: std::env::var("ROSTER_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("ROSTER_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            user_agent: std::env::var("ROSTER_USER_AGENT")
                .unwrap_or_else(|_| "roster-sync/0.1".to_string()),
            http_timeout_secs: std::env::var("ROSTER_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            system_actor: std::env::var("ROSTER_SYSTEM_ACTOR")
                .unwrap_or_else(|_| "system:roster-sync".to_string()),
            workspace_root: std::env::var("ROSTER_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Defaults rooted at `workspace_root`, without touching the environment.
    pub fn for_workspace(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        Self {
            database_url: None,
            archive_dir: workspace_root.join("archive"),
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
            user_agent: "roster-sync/0.1".to_string(),
            http_timeout_secs: 30,
            system_actor: "system:roster-sync".to_string(),
            workspace_root,
        }
    }
}

/// Contents of `roster.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RosterConfig {
    #[serde(default)]
    pub source: Option<SourceConfig>,
    #[serde(default)]
    pub columns: ColumnMapping,
}

pub async fn load_roster_config(workspace_root: &Path) -> Result<RosterConfig> {
    let path = workspace_root.join("roster.yaml");
    if !fs::try_exists(&path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        return Ok(RosterConfig::default());
    }
    let text = fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Deduplicated incoming snapshot for one run.
#[derive(Debug, Clone, Default)]
pub struct IncomingSet {
    pub records: Vec<IncomingRecord>,
    pub keys: HashSet<CompositeKey>,
    pub discarded_blank: usize,
    pub merged_duplicates: usize,
}

impl IncomingSet {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Drop blank-key rows and collapse duplicates per composite key.
///
/// The first-seen record wins; its empty fields are filled from later
/// duplicates. Two differing non-empty values keep the first one.
pub fn deduplicate(records: Vec<IncomingRecord>) -> IncomingSet {
    let mut index: HashMap<CompositeKey, usize> = HashMap::new();
    let mut merged: Vec<IncomingRecord> = Vec::new();
    let mut discarded_blank = 0usize;
    let mut merged_duplicates = 0usize;

    for record in records {
        if record.has_blank_key() {
            discarded_blank += 1;
            continue;
        }
        match index.entry(record.key()) {
            Entry::Occupied(slot) => {
                merged[*slot.get()].fill_empty_from(&record);
                merged_duplicates += 1;
            }
            Entry::Vacant(slot) => {
                slot.insert(merged.len());
                merged.push(record);
            }
        }
    }

    IncomingSet {
        records: merged,
        keys: index.into_keys().collect(),
        discarded_blank,
        merged_duplicates,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Create,
    Update,
    Reactivate,
    Skip,
}

fn same_content(persisted: &PersistedOffering, incoming: &IncomingRecord) -> bool {
    persisted
        .content_fields()
        .into_iter()
        .zip(incoming_content_fields(incoming))
        .all(|(stored, fresh)| stored.unwrap_or_default().trim() == fresh.trim())
}

pub fn classify(incoming: &IncomingRecord, persisted: Option<&PersistedOffering>) -> Decision {
    match persisted {
        None => Decision::Create,
        Some(existing) if existing.status != OfferingStatus::Active => Decision::Reactivate,
        Some(existing) if !same_content(existing, incoming) => Decision::Update,
        Some(_) => Decision::Skip,
    }
}

/// Every write a run will issue, decided up front from one snapshot of the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub upserts: Vec<OfferingUpsert>,
    pub deactivations: Vec<Deactivation>,
    pub created: usize,
    pub updated: usize,
    pub reactivated: usize,
    pub skipped_unchanged: usize,
}

impl ReconcilePlan {
    pub fn created_or_updated(&self) -> usize {
        self.created + self.updated + self.reactivated
    }

    pub fn is_noop(&self) -> bool {
        self.upserts.is_empty() && self.deactivations.is_empty()
    }
}

pub fn plan_reconciliation(
    incoming: &IncomingSet,
    persisted: &[PersistedOffering],
    updater: &str,
) -> ReconcilePlan {
    let by_key: HashMap<CompositeKey, &PersistedOffering> =
        persisted.iter().map(|o| (o.key(), o)).collect();
    let mut plan = ReconcilePlan::default();

    for record in &incoming.records {
        let decision = classify(record, by_key.get(&record.key()).copied());
        match decision {
            Decision::Create => plan.created += 1,
            Decision::Update => plan.updated += 1,
            Decision::Reactivate => plan.reactivated += 1,
            Decision::Skip => {
                plan.skipped_unchanged += 1;
                continue;
            }
        }
        plan.upserts.push(OfferingUpsert {
            record: record.clone(),
            updater_identity: updater.to_string(),
        });
    }

    let mut stale = persisted
        .iter()
        .filter(|o| o.status == OfferingStatus::Active)
        .map(PersistedOffering::key)
        .filter(|key| !incoming.keys.contains(key))
        .collect::<Vec<_>>();
    stale.sort();
    stale.dedup();
    plan.deactivations = stale
        .into_iter()
        .map(|key| Deactivation {
            key,
            updater_identity: updater.to_string(),
        })
        .collect();

    plan
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub total_incoming_records: usize,
    pub created_or_updated: usize,
    pub skipped_unchanged: usize,
    pub deactivated: usize,
    pub created: usize,
    pub updated: usize,
    pub reactivated: usize,
    pub raw_rows: usize,
    pub discarded_blank_rows: usize,
    pub merged_duplicates: usize,
    pub write_failures: Vec<WriteFailure>,
}

pub fn summarize(
    raw_rows: usize,
    incoming: &IncomingSet,
    plan: &ReconcilePlan,
    applied: &BulkApplyCounts,
) -> SyncSummary {
    SyncSummary {
        total_incoming_records: incoming.len(),
        created_or_updated: plan.created_or_updated(),
        skipped_unchanged: plan.skipped_unchanged,
        deactivated: plan.deactivations.len(),
        created: plan.created,
        updated: plan.updated,
        reactivated: plan.reactivated,
        raw_rows,
        discarded_blank_rows: incoming.discarded_blank,
        merged_duplicates: incoming.merged_duplicates,
        write_failures: applied.failures.clone(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Completed(SyncSummary),
    /// Nothing usable in the snapshot; the store was neither read nor written.
    NoData,
}

/// Normalize, deduplicate and reconcile one snapshot of raw rows.
pub async fn reconcile(
    raw_rows: &[RawRow],
    mapping: &ColumnMapping,
    store: &dyn OfferingStore,
    updater: &str,
) -> Result<ReconcileOutcome, StoreError> {
    let incoming = deduplicate(normalize_rows(raw_rows, mapping));
    if incoming.is_empty() {
        return Ok(ReconcileOutcome::NoData);
    }

    let persisted = store.find_all().await?;
    let plan = plan_reconciliation(&incoming, &persisted, updater);
    let applied = if plan.is_noop() {
        BulkApplyCounts::default()
    } else {
        store.bulk_apply(&plan.upserts, &plan.deactivations).await?
    };

    Ok(ReconcileOutcome::Completed(summarize(
        raw_rows.len(),
        &incoming,
        &plan,
        &applied,
    )))
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a roster sync is already in progress")]
    AlreadyRunning,
    #[error("roster source failed: {0}")]
    Source(#[from] SourceError),
    #[error("offering store failed: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_id: String,
    pub actor: String,
    pub snapshot_sha256: String,
    pub snapshot_path: String,
    #[serde(flatten)]
    pub outcome: ReconcileOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn OfferingStore>,
    archive: RosterArchive,
    mapping: ColumnMapping,
    in_flight: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: Arc<dyn OfferingStore>, mapping: ColumnMapping) -> Self {
        let archive = RosterArchive::new(config.archive_dir.clone());
        Self {
            config,
            store,
            archive,
            mapping,
            in_flight: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn OfferingStore> {
        Arc::clone(&self.store)
    }

    /// Run one sync. A second call while one is in flight fails with
    /// [`SyncError::AlreadyRunning`] instead of racing it.
    pub async fn run(&self, source: &dyn RowSource, actor: &str) -> Result<SyncRunRecord, SyncError> {
        let _guard = self.in_flight.try_lock().map_err(|_| SyncError::AlreadyRunning)?;
        let run_id = Uuid::new_v4();
        let span = info_span!("roster_sync", %run_id, source = source.source_id(), actor);
        self.run_locked(run_id, source, actor).instrument(span).await
    }

    async fn run_locked(
        &self,
        run_id: Uuid,
        source: &dyn RowSource,
        actor: &str,
    ) -> Result<SyncRunRecord, SyncError> {
        let started_at = Utc::now();
        let payload = source.fetch_payload().await?;
        let archived = self
            .archive
            .archive_bytes(
                started_at,
                &payload.source_id,
                payload.format.extension(),
                &payload.bytes,
            )
            .await?;
        let rows = payload.parse_rows()?;
        let outcome = reconcile(&rows, &self.mapping, self.store.as_ref(), actor).await?;

        let record = SyncRunRecord {
            run_id,
            started_at,
            finished_at: Utc::now(),
            source_id: payload.source_id.clone(),
            actor: actor.to_string(),
            snapshot_sha256: archived.content_hash,
            snapshot_path: archived.relative_path.display().to_string(),
            outcome,
        };

        match &record.outcome {
            ReconcileOutcome::Completed(summary) => info!(
                incoming = summary.total_incoming_records,
                created_or_updated = summary.created_or_updated,
                skipped = summary.skipped_unchanged,
                deactivated = summary.deactivated,
                failures = summary.write_failures.len(),
                "roster sync completed"
            ),
            ReconcileOutcome::NoData => {
                warn!(raw_rows = rows.len(), "roster snapshot had no valid rows; nothing written")
            }
        }

        if let Err(err) = self.write_reports(&record).await {
            warn!(error = %err, "failed to write sync reports");
        }

        Ok(record)
    }

    fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.config
            .workspace_root
            .join("reports")
            .join(run_id.to_string())
    }

    async fn write_reports(&self, record: &SyncRunRecord) -> Result<()> {
        let run_dir = self.run_dir(record.run_id);
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;

        let bytes = serde_json::to_vec_pretty(record).context("serializing sync run record")?;
        fs::write(run_dir.join("sync_summary.json"), bytes)
            .await
            .context("writing sync_summary.json")?;

        if matches!(record.outcome, ReconcileOutcome::Completed(_)) {
            let roster = self.store.find_all().await?;
            export_roster_snapshot(&run_dir, &roster).await?;
        }
        Ok(())
    }
}

/// Export the post-run roster as parquet plus a sha256 manifest.
pub async fn export_roster_snapshot(run_dir: &Path, roster: &[PersistedOffering]) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let offerings_path = snapshot_dir.join("offerings.parquet");
    write_offerings_parquet(&offerings_path, roster)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![manifest_entry("offerings", run_dir, &offerings_path)?],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_offerings_parquet(path: &Path, roster: &[PersistedOffering]) -> Result<()> {
    let required = |name: &str| ArrowField::new(name, DataType::Utf8, false);
    let optional = |name: &str| ArrowField::new(name, DataType::Utf8, true);
    let schema = Arc::new(Schema::new(vec![
        required("term"),
        required("subject_id"),
        required("area_code"),
        optional("level"),
        optional("subject_name"),
        optional("department_code"),
        optional("department_name"),
        optional("area_name"),
        optional("cost_center"),
        optional("subject_code"),
        required("status"),
        required("updated_at"),
    ]));

    let text = |pick: fn(&PersistedOffering) -> Option<&str>| -> ArrayRef {
        Arc::new(StringArray::from(roster.iter().map(pick).collect::<Vec<_>>()))
    };
    let updated_at = StringArray::from(
        roster
            .iter()
            .map(|o| Some(o.updated_at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            text(|o| Some(o.term.as_str())),
            text(|o| Some(o.subject_id.as_str())),
            text(|o| Some(o.area_code.as_str())),
            text(|o| o.level.as_deref()),
            text(|o| o.subject_name.as_deref()),
            text(|o| o.department_code.as_deref()),
            text(|o| o.department_name.as_deref()),
            text(|o| o.area_name.as_deref()),
            text(|o| o.cost_center.as_deref()),
            text(|o| o.subject_code.as_deref()),
            text(|o| Some(o.status.as_str())),
            Arc::new(updated_at) as ArrayRef,
        ],
    )
    .context("building offerings record batch")?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, base: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: path
            .strip_prefix(base)
            .unwrap_or(path)
            .display()
            .to_string(),
        sha256: hex::encode(Sha256::digest(&bytes)),
        bytes: bytes.len() as u64,
    })
}

/// Offering store selected by configuration: Postgres when `DATABASE_URL` is set.
pub async fn connect_store(config: &SyncConfig) -> Result<Arc<dyn OfferingStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgOfferingStore::connect(url)
                .await
                .context("connecting to offering database")?;
            store.migrate().await.context("running offering migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; using an in-memory offering store");
            Ok(Arc::new(MemoryOfferingStore::new()))
        }
    }
}

/// Everything a binary needs to trigger syncs.
pub struct SyncRuntime {
    pub pipeline: Arc<SyncPipeline>,
    pub remote_source: Option<Arc<dyn RowSource>>,
}

impl SyncRuntime {
    pub async fn from_env() -> Result<Self> {
        let config = SyncConfig::from_env();
        let store = connect_store(&config).await?;
        Self::with_store(config, store).await
    }

    pub async fn with_store(config: SyncConfig, store: Arc<dyn OfferingStore>) -> Result<Self> {
        let roster = load_roster_config(&config.workspace_root).await?;
        let remote_source = match &roster.source {
            Some(source_config) => {
                let fetcher = Arc::new(RosterFetcher::new(FetcherConfig {
                    timeout: Duration::from_secs(config.http_timeout_secs),
                    user_agent: Some(config.user_agent.clone()),
                    ..Default::default()
                })?);
                let source = source_from_config(source_config, &config.workspace_root, fetcher)?;
                Some(Arc::from(source))
            }
            None => None,
        };
        Ok(Self {
            pipeline: Arc::new(SyncPipeline::new(config, store, roster.columns)),
            remote_source,
        })
    }

    /// Cron-driven sync of the configured source, if the scheduler is enabled.
    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        let config = self.pipeline.config();
        if !config.scheduler_enabled {
            return Ok(None);
        }
        let Some(source) = self.remote_source.clone() else {
            warn!("scheduler enabled but roster.yaml has no source; not scheduling");
            return Ok(None);
        };

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(&self.pipeline);
        let actor = config.system_actor.clone();
        let job = Job::new_async(config.sync_cron.as_str(), move |_uuid, _sched| {
            let pipeline = Arc::clone(&pipeline);
            let source = Arc::clone(&source);
            let actor = actor.clone();
            Box::pin(async move {
                if let Err(err) = pipeline.run(source.as_ref(), &actor).await {
                    warn!(error = %err, "scheduled roster sync failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {}", config.sync_cron))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

fn read_run_record(path: &Path) -> Result<SyncRunRecord> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Markdown digest of the latest runs; reports that cannot be read are skipped.
pub fn report_recent_runs_markdown(runs: usize, workspace_root: &Path) -> Result<String> {
    let reports_root = workspace_root.join("reports");
    let mut records = Vec::new();
    if reports_root.exists() {
        for entry in std::fs::read_dir(&reports_root)
            .with_context(|| format!("reading {}", reports_root.display()))?
            .filter_map(|entry| entry.ok())
        {
            let path = entry.path().join("sync_summary.json");
            if !path.exists() {
                continue;
            }
            match read_run_record(&path) {
                Ok(record) => records.push(record),
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable run report"),
            }
        }
    }
    records.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    let mut lines = vec!["# Roster Sync Runs".to_string(), String::new()];
    for record in records.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", record.run_id));
        lines.push(format!("- started: {}", record.started_at.to_rfc3339()));
        lines.push(format!("- source: {} (actor `{}`)", record.source_id, record.actor));
        lines.push(format!("- snapshot: `{}`", record.snapshot_path));
        match &record.outcome {
            ReconcileOutcome::Completed(summary) => {
                lines.push(format!("- incoming records: {}", summary.total_incoming_records));
                lines.push(format!("- created or updated: {}", summary.created_or_updated));
                lines.push(format!("- unchanged: {}", summary.skipped_unchanged));
                lines.push(format!("- deactivated: {}", summary.deactivated));
                if !summary.write_failures.is_empty() {
                    lines.push(format!("- write failures: {}", summary.write_failures.len()));
                }
            }
            ReconcileOutcome::NoData => lines.push("- outcome: no valid data".to_string()),
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use roster_adapters::{RowFormat, UploadSource};
    use roster_core::RawValue;
    use tempfile::tempdir;

    fn record(term: &str, subject_id: &str, area_code: &str, name: &str) -> IncomingRecord {
        IncomingRecord {
            level: "PREGRADO".into(),
            term: term.into(),
            subject_id: subject_id.into(),
            subject_name: name.into(),
            area_code: area_code.into(),
            ..Default::default()
        }
    }

    fn raw(term: &str, subject_id: &str, area_code: &str, name: &str) -> RawRow {
        [
            ("NIVEL", "PREGRADO"),
            ("PERIODO", term),
            ("IDENTIFICADOR_MATERIA", subject_id),
            ("CODIGO_AREA", area_code),
            ("NOMBRE_MATERIA", name),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), RawValue::Text(v.to_string())))
        .collect()
    }

    fn persisted(rec: &IncomingRecord, status: OfferingStatus) -> PersistedOffering {
        let at = Utc.with_ymd_and_hms(2026, 1, 10, 8, 0, 0).single().unwrap();
        let mut offering = PersistedOffering::from_incoming(rec, "seed", at);
        offering.status = status;
        offering
    }

    fn completed(outcome: ReconcileOutcome) -> SyncSummary {
        match outcome {
            ReconcileOutcome::Completed(summary) => summary,
            ReconcileOutcome::NoData => panic!("expected a completed run"),
        }
    }

    #[test]
    fn duplicates_merge_with_first_seen_precedence() {
        let set = deduplicate(vec![
            record("2024-1", "100", "A", ""),
            record("2024-1", "100", "A", "Calculus"),
            record("2024-1", "100", "A", "Calculus II"),
        ]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.records[0].subject_name, "Calculus");
        assert_eq!(set.merged_duplicates, 2);
        assert!(set.keys.contains(&CompositeKey::new("2024-1", "100", "A")));
    }

    #[test]
    fn blank_key_rows_are_discarded() {
        let set = deduplicate(vec![
            record("", "", "", "Totals"),
            record("2024-1", "100", "A", "Calculus"),
        ]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.discarded_blank, 1);
        assert_eq!(set.keys.len(), 1);
    }

    #[test]
    fn classify_covers_every_decision() {
        let rec = record("2024-1", "100", "A", "Calculus");
        assert_eq!(classify(&rec, None), Decision::Create);

        let active = persisted(&rec, OfferingStatus::Active);
        assert_eq!(classify(&rec, Some(&active)), Decision::Skip);

        let inactive = persisted(&rec, OfferingStatus::Inactive);
        assert_eq!(classify(&rec, Some(&inactive)), Decision::Reactivate);

        let renamed = record("2024-1", "100", "A", "Calculus I");
        assert_eq!(classify(&renamed, Some(&active)), Decision::Update);
    }

    #[test]
    fn null_and_empty_content_compare_equal() {
        let rec = record("2024-1", "100", "A", "Calculus");
        let mut stored = persisted(&rec, OfferingStatus::Active);
        stored.cost_center = None;
        stored.subject_code = Some("  ".into());
        assert_eq!(classify(&rec, Some(&stored)), Decision::Skip);
    }

    #[test]
    fn key_fields_are_matched_after_trimming() {
        let rec = record("2024-1", "100", "A", "Calculus");
        let mut stored = persisted(&rec, OfferingStatus::Active);
        stored.subject_id = " 100 ".into();
        let set = deduplicate(vec![rec]);
        let plan = plan_reconciliation(&set, &[stored], "registrar");
        assert!(plan.is_noop());
        assert_eq!(plan.skipped_unchanged, 1);
    }

    #[test]
    fn plan_deactivates_only_active_missing_keys() {
        let k1 = record("2024-1", "100", "A", "Calculus");
        let k2 = record("2024-1", "200", "A", "Physics");
        let k3 = record("2024-1", "300", "A", "Chemistry");
        let stored = vec![
            persisted(&k1, OfferingStatus::Active),
            persisted(&k2, OfferingStatus::Active),
            persisted(&k3, OfferingStatus::Inactive),
        ];
        let plan = plan_reconciliation(&deduplicate(vec![k1.clone()]), &stored, "registrar");

        assert_eq!(plan.upserts.len(), 0);
        assert_eq!(plan.skipped_unchanged, 1);
        assert_eq!(
            plan.deactivations,
            vec![Deactivation {
                key: k2.key(),
                updater_identity: "registrar".into(),
            }]
        );
    }

    #[tokio::test]
    async fn rerunning_the_same_snapshot_writes_nothing() {
        let store = MemoryOfferingStore::new();
        let rows = vec![
            raw("2024-1", "100", "A", "Calculus"),
            raw("2024-1", "200", "A", "Physics"),
        ];
        let mapping = ColumnMapping::default();

        let first = completed(reconcile(&rows, &mapping, &store, "registrar").await.expect("first"));
        assert_eq!(first.created, 2);
        let before = store.find_all().await.expect("find");

        let second = completed(reconcile(&rows, &mapping, &store, "registrar").await.expect("second"));
        assert_eq!(second.created_or_updated, 0);
        assert_eq!(second.deactivated, 0);
        assert_eq!(second.skipped_unchanged, 2);
        assert_eq!(store.find_all().await.expect("find"), before);
    }

    #[tokio::test]
    async fn missing_offering_is_deactivated_and_later_reactivated() {
        let store = MemoryOfferingStore::new();
        let mapping = ColumnMapping::default();
        let both = vec![
            raw("2024-1", "100", "A", "Calculus"),
            raw("2024-1", "200", "A", "Physics"),
        ];
        reconcile(&both, &mapping, &store, "registrar").await.expect("seed");

        let only_k1 = vec![raw("2024-1", "100", "A", "Calculus")];
        let summary =
            completed(reconcile(&only_k1, &mapping, &store, "clerk").await.expect("shrink"));
        assert_eq!(summary.deactivated, 1);
        assert_eq!(summary.skipped_unchanged, 1);

        let k2 = CompositeKey::new("2024-1", "200", "A");
        let gone = store.get(&k2).await.expect("k2");
        assert_eq!(gone.status, OfferingStatus::Inactive);
        assert_eq!(gone.updater_identity.as_deref(), Some("clerk"));
        assert_eq!(gone.subject_name.as_deref(), Some("Physics"));
        assert_eq!(
            store
                .get(&CompositeKey::new("2024-1", "100", "A"))
                .await
                .expect("k1")
                .status,
            OfferingStatus::Active
        );

        let back = completed(reconcile(&both, &mapping, &store, "registrar").await.expect("grow"));
        assert_eq!(back.reactivated, 1);
        assert_eq!(back.created_or_updated, 1);
        assert_eq!(store.get(&k2).await.expect("k2").status, OfferingStatus::Active);
    }

    #[tokio::test]
    async fn empty_snapshot_never_wipes_the_roster() {
        let seed = record("2024-1", "100", "A", "Calculus");
        let store = MemoryOfferingStore::with_offerings([persisted(&seed, OfferingStatus::Active)]);
        let mapping = ColumnMapping::default();

        let outcome = reconcile(&[], &mapping, &store, "registrar").await.expect("empty");
        assert_eq!(outcome, ReconcileOutcome::NoData);

        let blank_only = vec![raw("", "", "", "Totals")];
        let outcome = reconcile(&blank_only, &mapping, &store, "registrar").await.expect("blank");
        assert_eq!(outcome, ReconcileOutcome::NoData);

        assert_eq!(
            store.get(&seed.key()).await.expect("seed").status,
            OfferingStatus::Active
        );
    }

    #[tokio::test]
    async fn pipeline_archives_snapshot_and_writes_reports() {
        let dir = tempdir().expect("tempdir");
        let config = SyncConfig::for_workspace(dir.path());
        let store = Arc::new(MemoryOfferingStore::new());
        let pipeline = SyncPipeline::new(config, store.clone(), ColumnMapping::default());
        let upload = UploadSource {
            bytes: b"PERIODO,IDENTIFICADOR_MATERIA,CODIGO_AREA,NOMBRE_MATERIA\n2024-1,100,A,Calculus\n"
                .to_vec(),
            format: RowFormat::Csv,
            delimiter: None,
        };

        let record = pipeline.run(&upload, "registrar").await.expect("run");
        let summary = completed(record.outcome.clone());
        assert_eq!(summary.created, 1);
        assert_eq!(store.len().await, 1);

        let run_dir = dir.path().join("reports").join(record.run_id.to_string());
        assert!(run_dir.join("sync_summary.json").exists());
        assert!(run_dir.join("snapshots/offerings.parquet").exists());
        assert!(run_dir.join("snapshots/manifest.json").exists());
        assert!(dir.path().join("archive").join(&record.snapshot_path).exists());

        let markdown = report_recent_runs_markdown(5, dir.path()).expect("markdown");
        assert!(markdown.contains(&record.run_id.to_string()));
        assert!(markdown.contains("created or updated: 1"));
    }

    #[tokio::test]
    async fn run_digest_skips_corrupt_reports() {
        let dir = tempdir().expect("tempdir");
        let pipeline = SyncPipeline::new(
            SyncConfig::for_workspace(dir.path()),
            Arc::new(MemoryOfferingStore::new()),
            ColumnMapping::default(),
        );
        let upload = UploadSource {
            bytes: b"PERIODO,IDENTIFICADOR_MATERIA,CODIGO_AREA\n2024-1,100,A\n".to_vec(),
            format: RowFormat::Csv,
            delimiter: None,
        };
        let record = pipeline.run(&upload, "registrar").await.expect("run");

        let broken = dir.path().join("reports").join("broken-run");
        std::fs::create_dir_all(&broken).expect("mkdir");
        std::fs::write(broken.join("sync_summary.json"), b"{ not json").expect("write");

        let markdown = report_recent_runs_markdown(5, dir.path()).expect("markdown");
        assert!(markdown.contains(&record.run_id.to_string()));
        assert!(!markdown.contains("broken-run"));
    }

    #[tokio::test]
    async fn overlapping_runs_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let pipeline = SyncPipeline::new(
            SyncConfig::for_workspace(dir.path()),
            Arc::new(MemoryOfferingStore::new()),
            ColumnMapping::default(),
        );
        let upload = UploadSource {
            bytes: b"PERIODO,IDENTIFICADOR_MATERIA,CODIGO_AREA\n2024-1,100,A\n".to_vec(),
            format: RowFormat::Csv,
            delimiter: None,
        };

        let held = pipeline.in_flight.lock().await;
        assert!(matches!(
            pipeline.run(&upload, "registrar").await,
            Err(SyncError::AlreadyRunning)
        ));
        drop(held);
        assert!(pipeline.run(&upload, "registrar").await.is_ok());
    }

    #[tokio::test]
    async fn roster_config_is_optional_and_partial() {
        let dir = tempdir().expect("tempdir");
        let empty = load_roster_config(dir.path()).await.expect("missing file");
        assert!(empty.source.is_none());

        std::fs::write(
            dir.path().join("roster.yaml"),
            "source:\n  kind: http\n  url: https://registry.example.edu/exports/offerings.csv\n  delimiter: ';'\ncolumns:\n  term: [SEMESTRE]\n",
        )
        .expect("write");
        let config = load_roster_config(dir.path()).await.expect("parse");
        let source = config.source.expect("source");
        assert_eq!(source.delimiter, Some(';'));
        assert_eq!(config.columns.term, vec!["SEMESTRE".to_string()]);
        assert_eq!(config.columns.level, ColumnMapping::default().level);
    }
}
