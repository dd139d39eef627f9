//! Core domain model for academic offering roster sync.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "roster-core";

/// A single cell as it arrives from a roster file or remote export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Empty,
}

impl RawValue {
    /// Stringified, trimmed form used by the row normalizer.
    pub fn to_trimmed_string(&self) -> String {
        match self {
            RawValue::Text(s) => s.trim().to_string(),
            RawValue::Integer(n) => n.to_string(),
            RawValue::Float(f) => {
                if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
                    format!("{}", *f as i64)
                } else {
                    f.to_string()
                }
            }
            RawValue::Bool(b) => b.to_string(),
            RawValue::Empty => String::new(),
        }
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Text(value.to_string())
    }
}

/// Raw row keyed by source column name.
pub type RawRow = BTreeMap<String, RawValue>;

/// Canonical, trimmed roster row produced for one sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingRecord {
    pub level: String,
    pub term: String,
    pub subject_id: String,
    pub subject_name: String,
    pub department_code: String,
    pub department_name: String,
    pub area_code: String,
    pub area_name: String,
    pub cost_center: String,
    pub subject_code: String,
}

impl IncomingRecord {
    pub fn key(&self) -> CompositeKey {
        CompositeKey::new(&self.term, &self.subject_id, &self.area_code)
    }

    /// Structural or separator rows carry none of the key fields.
    pub fn has_blank_key(&self) -> bool {
        self.term.trim().is_empty()
            && self.subject_id.trim().is_empty()
            && self.area_code.trim().is_empty()
    }

    /// Adopt `other`'s value for every field that is still empty here.
    /// Returns whether anything changed.
    pub fn fill_empty_from(&mut self, other: &IncomingRecord) -> bool {
        let mut changed = false;
        for (mine, theirs) in self.fields_mut().into_iter().zip(other.fields()) {
            if mine.is_empty() && !theirs.is_empty() {
                *mine = theirs.to_string();
                changed = true;
            }
        }
        changed
    }

    fn fields(&self) -> [&str; 10] {
        [
            &self.level,
            &self.term,
            &self.subject_id,
            &self.subject_name,
            &self.department_code,
            &self.department_name,
            &self.area_code,
            &self.area_name,
            &self.cost_center,
            &self.subject_code,
        ]
    }

    fn fields_mut(&mut self) -> [&mut String; 10] {
        [
            &mut self.level,
            &mut self.term,
            &mut self.subject_id,
            &mut self.subject_name,
            &mut self.department_code,
            &mut self.department_name,
            &mut self.area_code,
            &mut self.area_name,
            &mut self.cost_center,
            &mut self.subject_code,
        ]
    }
}

/// `(term, subject_id, area_code)`: identity of one offering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompositeKey {
    pub term: String,
    pub subject_id: String,
    pub area_code: String,
}

impl CompositeKey {
    pub fn new(term: &str, subject_id: &str, area_code: &str) -> Self {
        Self {
            term: term.trim().to_string(),
            subject_id: subject_id.trim().to_string(),
            area_code: area_code.trim().to_string(),
        }
    }

    /// Deterministic offering id derived from the key.
    pub fn stable_id(&self) -> Uuid {
        let name = format!("offering:{}:{}:{}", self.term, self.subject_id, self.area_code);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.term, self.subject_id, self.area_code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OfferingStatus {
    Active,
    Inactive,
}

impl OfferingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfferingStatus::Active => "ACTIVE",
            OfferingStatus::Inactive => "INACTIVE",
        }
    }
}

impl fmt::Display for OfferingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OfferingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(OfferingStatus::Active),
            "INACTIVE" => Ok(OfferingStatus::Inactive),
            other => Err(format!("unknown offering status {other:?}")),
        }
    }
}

/// Durable offering as held by an offering store.
///
/// Content fields are optional because older rows may carry nulls; comparison
/// treats `None` and `""` alike.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedOffering {
    pub id: Uuid,
    pub term: String,
    pub subject_id: String,
    pub area_code: String,
    pub level: Option<String>,
    pub subject_name: Option<String>,
    pub department_code: Option<String>,
    pub department_name: Option<String>,
    pub area_name: Option<String>,
    pub cost_center: Option<String>,
    pub subject_code: Option<String>,
    pub status: OfferingStatus,
    pub creator_identity: Option<String>,
    pub updater_identity: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PersistedOffering {
    pub fn key(&self) -> CompositeKey {
        CompositeKey::new(&self.term, &self.subject_id, &self.area_code)
    }

    /// Build a fresh ACTIVE offering from an incoming record. Key fields are stored trimmed.
    pub fn from_incoming(record: &IncomingRecord, actor: &str, now: DateTime<Utc>) -> Self {
        let key = record.key();
        Self {
            id: key.stable_id(),
            term: key.term,
            subject_id: key.subject_id,
            area_code: key.area_code,
            level: Some(record.level.clone()),
            subject_name: Some(record.subject_name.clone()),
            department_code: Some(record.department_code.clone()),
            department_name: Some(record.department_name.clone()),
            area_name: Some(record.area_name.clone()),
            cost_center: Some(record.cost_center.clone()),
            subject_code: Some(record.subject_code.clone()),
            status: OfferingStatus::Active,
            creator_identity: Some(actor.to_string()),
            updater_identity: Some(actor.to_string()),
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrite every record field, force ACTIVE and stamp the updater.
    pub fn refresh_from(&mut self, record: &IncomingRecord, actor: &str, now: DateTime<Utc>) {
        let key = record.key();
        self.term = key.term;
        self.subject_id = key.subject_id;
        self.area_code = key.area_code;
        self.level = Some(record.level.clone());
        self.subject_name = Some(record.subject_name.clone());
        self.department_code = Some(record.department_code.clone());
        self.department_name = Some(record.department_name.clone());
        self.area_name = Some(record.area_name.clone());
        self.cost_center = Some(record.cost_center.clone());
        self.subject_code = Some(record.subject_code.clone());
        self.status = OfferingStatus::Active;
        self.updater_identity = Some(actor.to_string());
        self.updated_at = now;
    }

    /// The seven comparable content fields, in a fixed order.
    pub fn content_fields(&self) -> [Option<&str>; 7] {
        [
            self.level.as_deref(),
            self.subject_name.as_deref(),
            self.department_code.as_deref(),
            self.department_name.as_deref(),
            self.area_name.as_deref(),
            self.cost_center.as_deref(),
            self.subject_code.as_deref(),
        ]
    }
}

/// Same order as [`PersistedOffering::content_fields`].
pub fn incoming_content_fields(record: &IncomingRecord) -> [&str; 7] {
    [
        &record.level,
        &record.subject_name,
        &record.department_code,
        &record.department_name,
        &record.area_name,
        &record.cost_center,
        &record.subject_code,
    ]
}

/// Insert-or-update keyed by the record's composite key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferingUpsert {
    pub record: IncomingRecord,
    pub updater_identity: String,
}

impl OfferingUpsert {
    pub fn key(&self) -> CompositeKey {
        self.record.key()
    }
}

/// Flip an ACTIVE offering to INACTIVE; content fields stay as they are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deactivation {
    pub key: CompositeKey,
    pub updater_identity: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFailure {
    pub key: CompositeKey,
    pub message: String,
}

/// What a store reports back after applying a batch of writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkApplyCounts {
    pub inserted: usize,
    pub modified: usize,
    pub deactivated: usize,
    pub failures: Vec<WriteFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(term: &str, subject_id: &str, area_code: &str) -> IncomingRecord {
        IncomingRecord {
            term: term.into(),
            subject_id: subject_id.into(),
            area_code: area_code.into(),
            ..Default::default()
        }
    }

    #[test]
    fn raw_values_stringify_like_spreadsheet_cells() {
        assert_eq!(RawValue::Text("  Calculus ".into()).to_trimmed_string(), "Calculus");
        assert_eq!(RawValue::Integer(1001).to_trimmed_string(), "1001");
        assert_eq!(RawValue::Float(20241.0).to_trimmed_string(), "20241");
        assert_eq!(RawValue::Float(2.5).to_trimmed_string(), "2.5");
        assert_eq!(RawValue::Bool(true).to_trimmed_string(), "true");
        assert_eq!(RawValue::Empty.to_trimmed_string(), "");
    }

    #[test]
    fn raw_rows_deserialize_from_json_objects() {
        let row: RawRow =
            serde_json::from_str(r#"{"PERIODO": "2024-1", "IDENTIFICADOR_MATERIA": 100, "AREA": null}"#)
                .expect("row");
        assert_eq!(row["PERIODO"], RawValue::Text("2024-1".into()));
        assert_eq!(row["IDENTIFICADOR_MATERIA"], RawValue::Integer(100));
        assert_eq!(row["AREA"], RawValue::Empty);
    }

    #[test]
    fn composite_key_trims_and_has_stable_id() {
        let a = CompositeKey::new(" 2024-1", "100 ", "A");
        let b = record("2024-1", "100", "A").key();
        assert_eq!(a, b);
        assert_eq!(a.stable_id(), b.stable_id());
        assert_ne!(a.stable_id(), CompositeKey::new("2024-2", "100", "A").stable_id());
        assert_eq!(a.to_string(), "2024-1/100/A");
    }

    #[test]
    fn persisted_offerings_store_the_trimmed_key() {
        let now = Utc::now();
        let mut offering = PersistedOffering::from_incoming(&record(" 2024-1 ", "100 ", "A"), "registrar", now);
        assert_eq!(
            (offering.term.as_str(), offering.subject_id.as_str(), offering.area_code.as_str()),
            ("2024-1", "100", "A")
        );
        assert_eq!(offering.id, CompositeKey::new("2024-1", "100", "A").stable_id());

        offering.subject_id = " 100 ".into();
        offering.refresh_from(&record("2024-1", " 100", "A"), "clerk", now);
        assert_eq!(offering.subject_id, "100");
    }

    #[test]
    fn blank_key_requires_all_three_fields_empty() {
        assert!(record(" ", "", "").has_blank_key());
        assert!(!record("", "100", "").has_blank_key());
    }

    #[test]
    fn fill_empty_only_touches_empty_fields() {
        let mut first = record("2024-1", "100", "A");
        first.level = "PREGRADO".into();
        let mut later = record("2024-1", "100", "A");
        later.level = "POSGRADO".into();
        later.subject_name = "Calculus".into();

        assert!(first.fill_empty_from(&later));
        assert_eq!(first.level, "PREGRADO");
        assert_eq!(first.subject_name, "Calculus");
        assert!(!first.fill_empty_from(&later));
    }

    #[test]
    fn status_round_trips_through_text() {
        assert_eq!("active".parse::<OfferingStatus>(), Ok(OfferingStatus::Active));
        assert_eq!(OfferingStatus::Inactive.to_string(), "INACTIVE");
        assert!("archived".parse::<OfferingStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&OfferingStatus::Inactive).expect("json"),
            "\"INACTIVE\""
        );
    }
}
