//! Axum HTTP surface for triggering roster syncs and browsing offerings.

use std::sync::Arc;

use askama::Template;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use roster_adapters::{RowFormat, RowSource, UploadSource};
use roster_core::{OfferingStatus, PersistedOffering};
use roster_storage::StoreError;
use roster_sync::{ReconcileOutcome, SyncError, SyncPipeline, SyncRunRecord, SyncRuntime};
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "roster-web";

/// Header carrying the already-authenticated actor that triggers a sync.
pub const ACTOR_HEADER: &str = "x-actor-id";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
    pub remote_source: Option<Arc<dyn RowSource>>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self {
            pipeline,
            remote_source: None,
        }
    }

    pub fn from_runtime(runtime: &SyncRuntime) -> Self {
        Self {
            pipeline: Arc::clone(&runtime.pipeline),
            remote_source: runtime.remote_source.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("missing {ACTOR_HEADER} header")]
    MissingActor,
    #[error("{0}")]
    BadRequest(String),
    #[error("no remote roster source is configured")]
    NoRemoteSource,
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("rendering page: {0}")]
    Render(#[from] askama::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::MissingActor | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NoRemoteSource => StatusCode::NOT_IMPLEMENTED,
            AppError::Sync(SyncError::AlreadyRunning) => StatusCode::CONFLICT,
            AppError::Sync(SyncError::Source(_)) => StatusCode::BAD_GATEWAY,
            AppError::Sync(_) | AppError::Store(_) | AppError::Render(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize, Default)]
struct OfferingsQuery {
    status: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct UploadQuery {
    format: Option<String>,
    delimiter: Option<char>,
}

#[derive(Debug, Clone)]
struct RosterRow {
    term: String,
    subject_id: String,
    area_code: String,
    subject_name: String,
    department_name: String,
    area_name: String,
    status: String,
    updated_at: String,
}

impl From<&PersistedOffering> for RosterRow {
    fn from(o: &PersistedOffering) -> Self {
        Self {
            term: o.term.clone(),
            subject_id: o.subject_id.clone(),
            area_code: o.area_code.clone(),
            subject_name: o.subject_name.clone().unwrap_or_default(),
            department_name: o.department_name.clone().unwrap_or_default(),
            area_name: o.area_name.clone().unwrap_or_default(),
            status: o.status.to_string(),
            updated_at: o.updated_at.format("%Y-%m-%d %H:%M").to_string(),
        }
    }
}

#[derive(Template)]
#[template(path = "roster.html")]
struct RosterTemplate {
    rows: Vec<RosterRow>,
    active: usize,
    inactive: usize,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/offerings", get(offerings_handler))
        .route("/offerings/roster", get(roster_page_handler))
        .route("/offerings/sync/upload", post(upload_sync_handler))
        .route("/offerings/sync/remote", post(remote_sync_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("ROSTER_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let runtime = SyncRuntime::from_env().await?;
    let scheduler = runtime.maybe_build_scheduler().await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await?;
        info!(cron = %runtime.pipeline.config().sync_cron, "scheduled roster sync enabled");
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "roster web listening");
    axum::serve(listener, app(AppState::from_runtime(&runtime))).await?;
    Ok(())
}

fn actor_from(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
        .ok_or(AppError::MissingActor)
}

fn sync_response(record: SyncRunRecord) -> Response {
    let status = match record.outcome {
        ReconcileOutcome::Completed(_) => StatusCode::OK,
        ReconcileOutcome::NoData => StatusCode::UNPROCESSABLE_ENTITY,
    };
    (status, Json(record)).into_response()
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn offerings_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OfferingsQuery>,
) -> Result<Json<Vec<PersistedOffering>>, AppError> {
    let wanted = query
        .status
        .as_deref()
        .map(str::parse::<OfferingStatus>)
        .transpose()
        .map_err(AppError::BadRequest)?;
    let offerings = state
        .pipeline
        .store()
        .find_all()
        .await?
        .into_iter()
        .filter(|o| wanted.map_or(true, |status| o.status == status))
        .collect();
    Ok(Json(offerings))
}

async fn roster_page_handler(State(state): State<Arc<AppState>>) -> Result<Html<String>, AppError> {
    let offerings = state.pipeline.store().find_all().await?;
    let active = offerings
        .iter()
        .filter(|o| o.status == OfferingStatus::Active)
        .count();
    let page = RosterTemplate {
        rows: offerings.iter().map(RosterRow::from).collect(),
        active,
        inactive: offerings.len() - active,
    };
    Ok(Html(page.render()?))
}

async fn upload_sync_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let actor = actor_from(&headers)?;
    let format = query
        .format
        .as_deref()
        .unwrap_or("csv")
        .parse::<RowFormat>()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    let delimiter = match query.delimiter {
        Some(c) if c.is_ascii() => Some(c as u8),
        Some(c) => return Err(AppError::BadRequest(format!("unsupported delimiter {c:?}"))),
        None => None,
    };
    let upload = UploadSource {
        bytes: body.to_vec(),
        format,
        delimiter,
    };

    match state.pipeline.run(&upload, &actor).await {
        Ok(record) => Ok(sync_response(record)),
        Err(SyncError::Source(err)) => Err(AppError::BadRequest(format!("unreadable upload: {err}"))),
        Err(err) => Err(err.into()),
    }
}

async fn remote_sync_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let actor = actor_from(&headers)?;
    let source = state.remote_source.clone().ok_or(AppError::NoRemoteSource)?;
    let record = state.pipeline.run(source.as_ref(), &actor).await?;
    Ok(sync_response(record))
}
