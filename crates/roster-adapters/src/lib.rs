//! Roster row sources and the row normalizer.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use roster_core::{IncomingRecord, RawRow, RawValue};
use roster_storage::{FetchError, RosterFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "roster-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowFormat {
    Csv,
    Json,
}

impl RowFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            RowFormat::Csv => "csv",
            RowFormat::Json => "json",
        }
    }
}

impl FromStr for RowFormat {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" | "txt" => Ok(RowFormat::Csv),
            "json" => Ok(RowFormat::Json),
            other => Err(SourceError::Message(format!("unsupported roster format {other:?}"))),
        }
    }
}

/// Raw bytes of one roster snapshot plus what is needed to parse them.
#[derive(Debug, Clone)]
pub struct SourcePayload {
    pub source_id: String,
    pub format: RowFormat,
    pub delimiter: Option<u8>,
    pub bytes: Vec<u8>,
}

impl SourcePayload {
    pub fn parse_rows(&self) -> Result<Vec<RawRow>, SourceError> {
        match self.format {
            RowFormat::Csv => parse_csv_rows(&self.bytes, self.delimiter),
            RowFormat::Json => parse_json_rows(&self.bytes),
        }
    }
}

/// Producer of raw roster rows: a file drop, an upload or a remote export.
#[async_trait]
pub trait RowSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_payload(&self) -> Result<SourcePayload, SourceError>;

    async fn fetch_raw_rows(&self) -> Result<Vec<RawRow>, SourceError> {
        self.fetch_payload().await?.parse_rows()
    }
}

/// Guess `;` vs `,` from the header line when the caller did not say.
pub fn sniff_delimiter(bytes: &[u8]) -> u8 {
    let header = bytes.split(|b| *b == b'\n').next().unwrap_or_default();
    let semicolons = header.iter().filter(|b| **b == b';').count();
    let commas = header.iter().filter(|b| **b == b',').count();
    if semicolons > commas {
        b';'
    } else {
        b','
    }
}

/// Spreadsheet exports are UTF-8 or, from older tooling, Latin-1. A field that
/// is not valid UTF-8 is read as Latin-1 so accented names survive.
fn decode_cell(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| char::from(b)).collect(),
    }
}

pub fn parse_csv_rows(bytes: &[u8], delimiter: Option<u8>) -> Result<Vec<RawRow>, SourceError> {
    let delimiter = delimiter.unwrap_or_else(|| sniff_delimiter(bytes));
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);

    let headers = reader
        .byte_headers()?
        .iter()
        .map(|h| decode_cell(h).trim_start_matches('\u{feff}').trim().to_string())
        .collect::<Vec<_>>();

    let mut rows = Vec::new();
    for record in reader.byte_records() {
        let record = record?;
        let row = headers
            .iter()
            .zip(record.iter())
            .map(|(header, cell)| {
                let cell = decode_cell(cell);
                let value = if cell.trim().is_empty() {
                    RawValue::Empty
                } else {
                    RawValue::Text(cell)
                };
                (header.clone(), value)
            })
            .collect::<RawRow>();
        rows.push(row);
    }
    Ok(rows)
}

pub fn parse_json_rows(bytes: &[u8]) -> Result<Vec<RawRow>, SourceError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Roster file on local disk, e.g. the landing directory of a scheduled drop.
#[derive(Debug, Clone)]
pub struct FileSource {
    pub path: PathBuf,
    pub format: RowFormat,
    pub delimiter: Option<u8>,
}

#[async_trait]
impl RowSource for FileSource {
    fn source_id(&self) -> &str {
        "file"
    }

    async fn fetch_payload(&self) -> Result<SourcePayload, SourceError> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| SourceError::Io {
                path: self.path.display().to_string(),
                source,
            })?;
        Ok(SourcePayload {
            source_id: self.source_id().to_string(),
            format: self.format,
            delimiter: self.delimiter,
            bytes,
        })
    }
}

/// Spreadsheet export received over HTTP.
#[derive(Debug, Clone)]
pub struct UploadSource {
    pub bytes: Vec<u8>,
    pub format: RowFormat,
    pub delimiter: Option<u8>,
}

#[async_trait]
impl RowSource for UploadSource {
    fn source_id(&self) -> &str {
        "upload"
    }

    async fn fetch_payload(&self) -> Result<SourcePayload, SourceError> {
        Ok(SourcePayload {
            source_id: self.source_id().to_string(),
            format: self.format,
            delimiter: self.delimiter,
            bytes: self.bytes.clone(),
        })
    }
}

/// Remote roster export pulled through [`RosterFetcher`].
#[derive(Debug, Clone)]
pub struct HttpSource {
    pub url: String,
    pub format: RowFormat,
    pub delimiter: Option<u8>,
    pub fetcher: Arc<RosterFetcher>,
}

#[async_trait]
impl RowSource for HttpSource {
    fn source_id(&self) -> &str {
        "remote"
    }

    async fn fetch_payload(&self) -> Result<SourcePayload, SourceError> {
        let fetched = self.fetcher.fetch_bytes(self.source_id(), &self.url).await?;
        Ok(SourcePayload {
            source_id: self.source_id().to_string(),
            format: self.format,
            delimiter: self.delimiter,
            bytes: fetched.body,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Csv,
    Json,
    Http,
}

/// `source:` block of `roster.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub format: Option<RowFormat>,
    #[serde(default)]
    pub delimiter: Option<char>,
}

impl SourceConfig {
    fn delimiter_byte(&self) -> Result<Option<u8>> {
        match self.delimiter {
            None => Ok(None),
            Some(c) if c.is_ascii() => Ok(Some(c as u8)),
            Some(c) => bail!("delimiter {c:?} is not a single-byte character"),
        }
    }
}

pub fn source_from_config(
    config: &SourceConfig,
    workspace_root: &Path,
    fetcher: Arc<RosterFetcher>,
) -> Result<Box<dyn RowSource>> {
    let delimiter = config.delimiter_byte()?;
    let file_path = || {
        config
            .path
            .as_ref()
            .map(|p| workspace_root.join(p))
            .context("roster source needs a `path`")
    };

    Ok(match config.kind {
        SourceKind::Csv => Box::new(FileSource {
            path: file_path()?,
            format: RowFormat::Csv,
            delimiter,
        }),
        SourceKind::Json => Box::new(FileSource {
            path: file_path()?,
            format: RowFormat::Json,
            delimiter,
        }),
        SourceKind::Http => Box::new(HttpSource {
            url: config.url.clone().context("http roster source needs a `url`")?,
            format: config.format.unwrap_or(RowFormat::Csv),
            delimiter,
            fetcher,
        }),
    })
}

/// Accepted source column names per field, tried in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMapping {
    pub level: Vec<String>,
    pub term: Vec<String>,
    pub subject_id: Vec<String>,
    pub subject_name: Vec<String>,
    pub department_code: Vec<String>,
    pub department_name: Vec<String>,
    pub area_code: Vec<String>,
    pub area_name: Vec<String>,
    pub cost_center: Vec<String>,
    pub subject_code: Vec<String>,
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            level: names(&["NIVEL", "level"]),
            term: names(&["PERIODO", "term"]),
            subject_id: names(&["IDENTIFICADOR_MATERIA", "ID_MATERIA", "subject_id"]),
            subject_name: names(&["NOMBRE_MATERIA", "subject_name"]),
            department_code: names(&["CODIGO_DEPARTAMENTO", "department_code"]),
            department_name: names(&["NOMBRE_DEPARTAMENTO", "department_name"]),
            area_code: names(&["CODIGO_AREA", "area_code"]),
            area_name: names(&["NOMBRE_AREA", "area_name"]),
            cost_center: names(&["CENTRO_COSTO", "cost_center"]),
            subject_code: names(&["CODIGO_MATERIA", "subject_code"]),
        }
    }
}

fn lookup<'a>(row: &'a RawRow, candidates: &[String]) -> Option<&'a RawValue> {
    if let Some(value) = candidates.iter().find_map(|name| row.get(name)) {
        return Some(value);
    }
    candidates.iter().find_map(|name| {
        let wanted = name.trim();
        row.iter()
            .find(|(column, _)| column.trim().eq_ignore_ascii_case(wanted))
            .map(|(_, value)| value)
    })
}

fn field(row: &RawRow, candidates: &[String]) -> String {
    lookup(row, candidates)
        .map(RawValue::to_trimmed_string)
        .unwrap_or_default()
}

/// Map one raw row onto the canonical record. Missing columns become `""`.
pub fn normalize_row(row: &RawRow, mapping: &ColumnMapping) -> IncomingRecord {
    IncomingRecord {
        level: field(row, &mapping.level),
        term: field(row, &mapping.term),
        subject_id: field(row, &mapping.subject_id),
        subject_name: field(row, &mapping.subject_name),
        department_code: field(row, &mapping.department_code),
        department_name: field(row, &mapping.department_name),
        area_code: field(row, &mapping.area_code),
        area_name: field(row, &mapping.area_name),
        cost_center: field(row, &mapping.cost_center),
        subject_code: field(row, &mapping.subject_code),
    }
}

pub fn normalize_rows(rows: &[RawRow], mapping: &ColumnMapping) -> Vec<IncomingRecord> {
    rows.iter().map(|row| normalize_row(row, mapping)).collect()
}
