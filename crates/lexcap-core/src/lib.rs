//! Core domain model, record validation, party classification, and field
//! diffing for lexcap.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "lexcap-core";

/// Which adversarial side ("pole") of the case a party sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pole {
    Active,
    Passive,
    Other,
}

impl Pole {
    pub fn parse(code: &str) -> Option<Self> {
        match code.trim().to_ascii_lowercase().as_str() {
            "active" | "a" | "plaintiff" | "claimant" => Some(Pole::Active),
            "passive" | "p" | "defendant" | "respondent" => Some(Pole::Passive),
            "other" | "neutral" | "third" => Some(Pole::Other),
            _ => None,
        }
    }

    /// Unrecognized pole codes degrade to `Other` instead of failing.
    pub fn parse_lenient(code: &str) -> Self {
        Self::parse(code).unwrap_or(Pole::Other)
    }
}

/// Kind of tax identifier the external system reported for a person.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxIdKind {
    Individual,
    Company,
    Other,
}

impl TaxIdKind {
    pub fn parse(code: &str) -> Option<Self> {
        match code.trim().to_ascii_lowercase().as_str() {
            "individual" | "natural" | "person" | "f" => Some(TaxIdKind::Individual),
            "entity" | "legal" | "company" | "j" => Some(TaxIdKind::Company),
            "other" | "unknown" => Some(TaxIdKind::Other),
            _ => None,
        }
    }

    pub fn parse_lenient(code: &str) -> Self {
        Self::parse(code).unwrap_or(TaxIdKind::Other)
    }
}

/// Classification assigned to a party exactly once, before persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyClass {
    Client,
    Opposing,
    Third,
}

/// The three parallel entity relations. Each classification persists into
/// its own relation; the mapping is a closed match, never a string lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Client,
    Opposing,
    Third,
}

impl EntityKind {
    pub fn from_class(class: PartyClass) -> Self {
        match class {
            PartyClass::Client => EntityKind::Client,
            PartyClass::Opposing => EntityKind::Opposing,
            PartyClass::Third => EntityKind::Third,
        }
    }

    pub fn relation(&self) -> &'static str {
        match self {
            EntityKind::Client => "client_entities",
            EntityKind::Opposing => "opposing_entities",
            EntityKind::Third => "third_entities",
        }
    }
}

/// Address payload as reported by the external system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub external_address_id: i64,
    #[serde(default)]
    pub street: Option<String>,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub complement: Option<String>,
    #[serde(default)]
    pub district: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
}

impl AddressRecord {
    /// A persistable address needs its external id and at least one
    /// locating field; anything less is skipped, not an error.
    pub fn is_persistable(&self) -> bool {
        self.external_address_id > 0
            && (self.street.is_some() || self.city.is_some() || self.postal_code.is_some())
    }
}

/// Attorney payload nested inside a party record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepresentativeRecord {
    pub external_person_id: i64,
    pub name: String,
    #[serde(default)]
    pub tax_id: Option<String>,
    #[serde(default)]
    pub bar_number: Option<String>,
    #[serde(default)]
    pub bar_state: Option<String>,
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub phones: Vec<String>,
    #[serde(default)]
    pub address: Option<AddressRecord>,
}

/// One party as fetched from the external case-management system.
/// Immutable input; `raw` is the original payload kept verbatim for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartyRecord {
    pub external_party_id: String,
    pub external_person_id: i64,
    pub name: String,
    pub role_code: String,
    pub pole: String,
    pub tax_id_kind: String,
    #[serde(default)]
    pub principal: bool,
    #[serde(default)]
    pub tax_id: Option<String>,
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub phones: Vec<String>,
    #[serde(default)]
    pub address: Option<AddressRecord>,
    #[serde(default)]
    pub representatives: Vec<RepresentativeRecord>,
    #[serde(default)]
    pub raw: JsonValue,
}

/// The attorney whose authenticated session performs the capture. Their tax
/// id anchors the "our client" classification rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActingRepresentative {
    pub name: String,
    pub tax_id: String,
    #[serde(default)]
    pub bar_number: Option<String>,
}

/// A record plus the classification derived for it. Classification happens
/// once per record and is never recomputed mid-pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifiedParty {
    pub class: PartyClass,
    pub record: PartyRecord,
}

/// Strip everything but ASCII digits; external systems report the same tax
/// id with varying punctuation.
pub fn normalize_tax_id(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

// ---------------------------------------------------------------------------
// Validation

/// One offending field, by path, with a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

pub fn render_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.path, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Field-by-field shape validation of an incoming record. All offending
/// fields are aggregated before failing once. Under lenient validation,
/// unrecognized pole / tax-id-kind codes degrade to their safe defaults
/// instead of erroring.
pub fn validate_record(record: &PartyRecord, strict: bool) -> Result<(), Vec<FieldError>> {
    let mut errors = Vec::new();

    if record.name.trim().is_empty() {
        errors.push(FieldError::new("name", "name must not be empty"));
    }
    if record.external_person_id <= 0 {
        errors.push(FieldError::new(
            "external_person_id",
            "external person id must be positive",
        ));
    }
    if strict {
        if Pole::parse(&record.pole).is_none() {
            errors.push(FieldError::new(
                "pole",
                format!("unrecognized pole code {:?}", record.pole),
            ));
        }
        if TaxIdKind::parse(&record.tax_id_kind).is_none() {
            errors.push(FieldError::new(
                "tax_id_kind",
                format!("unrecognized tax id kind {:?}", record.tax_id_kind),
            ));
        }
    }
    for (i, rep) in record.representatives.iter().enumerate() {
        if rep.name.trim().is_empty() {
            errors.push(FieldError::new(
                format!("representatives[{i}].name"),
                "name must not be empty",
            ));
        }
        if rep.external_person_id <= 0 {
            errors.push(FieldError::new(
                format!("representatives[{i}].external_person_id"),
                "external person id must be positive",
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

// ---------------------------------------------------------------------------
// Classification

fn role_code_class(role_code: &str) -> Option<PartyClass> {
    match role_code.trim().to_ascii_lowercase().as_str() {
        "third_party" | "interested" | "witness" | "expert" | "assistant" => {
            Some(PartyClass::Third)
        }
        _ => None,
    }
}

/// Classify a record against the acting representative. A party whose
/// normalized tax id equals the acting representative's is always `Client`;
/// otherwise the explicit role/pole mapping applies, with `Third` as the
/// fallback for anything unrecognized.
pub fn classify(record: &PartyRecord, acting: &ActingRepresentative) -> PartyClass {
    let acting_id = normalize_tax_id(&acting.tax_id);
    if let Some(tax_id) = record.tax_id.as_deref() {
        let record_id = normalize_tax_id(tax_id);
        if !record_id.is_empty() && record_id == acting_id {
            return PartyClass::Client;
        }
    }
    if let Some(class) = role_code_class(&record.role_code) {
        return class;
    }
    match Pole::parse_lenient(&record.pole) {
        Pole::Active => PartyClass::Client,
        Pole::Passive => PartyClass::Opposing,
        Pole::Other => PartyClass::Third,
    }
}

// ---------------------------------------------------------------------------
// Stored rows and diffable projections
//
// Control fields (row id, timestamps, audit snapshot, address reference)
// live on the row structs; everything the diff engine compares lives on the
// `*Fields` projections. Stripping control fields is therefore structural.

/// Typed owner reference for an address row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "owner_kind", rename_all = "snake_case")]
pub enum OwnerRef {
    Entity { kind: EntityKind, id: i64 },
    Representative { id: i64 },
}

/// Typed entity reference carried by a case-party link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFields {
    pub name: String,
    pub tax_id_kind: TaxIdKind,
    pub tax_id: Option<String>,
    pub emails: Vec<String>,
    pub phones: Vec<String>,
}

impl EntityFields {
    pub fn from_record(record: &PartyRecord) -> Self {
        Self {
            name: record.name.trim().to_string(),
            tax_id_kind: TaxIdKind::parse_lenient(&record.tax_id_kind),
            tax_id: record.tax_id.as_deref().map(normalize_tax_id),
            emails: record.emails.clone(),
            phones: record.phones.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRow {
    pub id: i64,
    pub kind: EntityKind,
    pub external_person_id: i64,
    pub address_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last-seen audit snapshot; excluded from diffing.
    pub audit: JsonValue,
    pub fields: EntityFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AddressFields {
    pub street: Option<String>,
    pub number: Option<String>,
    pub complement: Option<String>,
    pub district: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
}

impl AddressFields {
    pub fn from_record(record: &AddressRecord) -> Self {
        Self {
            street: record.street.clone(),
            number: record.number.clone(),
            complement: record.complement.clone(),
            district: record.district.clone(),
            city: record.city.clone(),
            state: record.state.clone(),
            postal_code: record.postal_code.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRow {
    pub id: i64,
    pub external_address_id: i64,
    pub owner: OwnerRef,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub fields: AddressFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepresentativeFields {
    pub name: String,
    pub tax_id: Option<String>,
    pub bar_number: Option<String>,
    pub bar_state: Option<String>,
    pub emails: Vec<String>,
    pub phones: Vec<String>,
}

impl RepresentativeFields {
    pub fn from_record(record: &RepresentativeRecord) -> Self {
        Self {
            name: record.name.trim().to_string(),
            tax_id: record.tax_id.as_deref().map(normalize_tax_id),
            bar_number: record.bar_number.clone(),
            bar_state: record.bar_state.clone(),
            emails: record.emails.clone(),
            phones: record.phones.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepresentativeRow {
    pub id: i64,
    pub external_person_id: i64,
    pub case_id: String,
    pub owner: EntityRef,
    pub address_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub fields: RepresentativeFields,
}

/// Case-to-party association. `order_index` always comes from the original
/// input order of the run, never from completion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRow {
    pub id: i64,
    pub case_id: String,
    pub entity: EntityRef,
    pub external_party_id: String,
    pub role_code: String,
    pub pole: Pole,
    pub order_index: u32,
    pub principal: bool,
    pub created_at: DateTime<Utc>,
    pub raw: JsonValue,
}

// ---------------------------------------------------------------------------
// Diff engine

/// Outcome of comparing a fresh projection against a stored one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Comparison {
    pub identical: bool,
    pub changed: Vec<&'static str>,
}

/// Field-by-field comparison over a stored projection. Implementations list
/// the names of fields whose values differ; control fields never appear.
pub trait FieldDiff {
    fn diff(&self, other: &Self) -> Vec<&'static str>;
}

pub fn compare<T: FieldDiff>(candidate: &T, stored: &T) -> Comparison {
    let changed = candidate.diff(stored);
    Comparison {
        identical: changed.is_empty(),
        changed,
    }
}

impl FieldDiff for EntityFields {
    fn diff(&self, other: &Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.name != other.name {
            changed.push("name");
        }
        if self.tax_id_kind != other.tax_id_kind {
            changed.push("tax_id_kind");
        }
        if self.tax_id != other.tax_id {
            changed.push("tax_id");
        }
        if self.emails != other.emails {
            changed.push("emails");
        }
        if self.phones != other.phones {
            changed.push("phones");
        }
        changed
    }
}

impl FieldDiff for AddressFields {
    fn diff(&self, other: &Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.street != other.street {
            changed.push("street");
        }
        if self.number != other.number {
            changed.push("number");
        }
        if self.complement != other.complement {
            changed.push("complement");
        }
        if self.district != other.district {
            changed.push("district");
        }
        if self.city != other.city {
            changed.push("city");
        }
        if self.state != other.state {
            changed.push("state");
        }
        if self.postal_code != other.postal_code {
            changed.push("postal_code");
        }
        changed
    }
}

impl FieldDiff for RepresentativeFields {
    fn diff(&self, other: &Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.name != other.name {
            changed.push("name");
        }
        if self.tax_id != other.tax_id {
            changed.push("tax_id");
        }
        if self.bar_number != other.bar_number {
            changed.push("bar_number");
        }
        if self.bar_state != other.bar_state {
            changed.push("bar_state");
        }
        if self.emails != other.emails {
            changed.push("emails");
        }
        if self.phones != other.phones {
            changed.push("phones");
        }
        changed
    }
}

// ---------------------------------------------------------------------------
// Errors

/// Which store operation a persistence failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreOp {
    Find,
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for StoreOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StoreOp::Find => "find",
            StoreOp::Insert => "insert",
            StoreOp::Update => "update",
            StoreOp::Delete => "delete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreErrorKind {
    /// Store unreachable or refusing work; worth retrying.
    Unavailable,
    /// Operation timed out; worth retrying.
    Timeout,
    /// Natural-key collision or constraint violation; retrying cannot help.
    Conflict,
    /// Referenced row is gone; retrying cannot help.
    Missing,
}

impl StoreErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreErrorKind::Unavailable | StoreErrorKind::Timeout)
    }
}

/// Failure reported by the store collaborator, tagged with the relation and
/// the operation that failed.
#[derive(Debug, Clone, Error)]
#[error("{relation} {op}: {message}")]
pub struct StoreError {
    pub relation: &'static str,
    pub op: StoreOp,
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn new(
        relation: &'static str,
        op: StoreOp,
        kind: StoreErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            relation,
            op,
            kind,
            message: message.into(),
        }
    }
}

/// Tagged error taxonomy for the capture pipeline. One discriminant per
/// failure class keeps matching exhaustive at call sites.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    /// Malformed or missing required fields. Never retried; fails only the
    /// current item.
    #[error("validation failed: {}", render_field_errors(.errors))]
    Validation { errors: Vec<FieldError> },
    /// Store read/write failure, after any retries were exhausted.
    #[error("persistence failure: {source}")]
    Persistence {
        #[source]
        source: StoreError,
    },
    /// The compensating delete itself failed. Logged by the coordinator;
    /// the original triggering failure stays the surfaced one.
    #[error("rollback of {relation} failed: {message}")]
    Rollback {
        relation: &'static str,
        message: String,
    },
    /// Run-level failure raised before any item is processed.
    #[error("fatal: {message}")]
    Fatal { message: String },
}

impl CaptureError {
    pub fn validation(path: impl Into<String>, message: impl Into<String>) -> Self {
        CaptureError::Validation {
            errors: vec![FieldError::new(path, message)],
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        CaptureError::Fatal {
            message: message.into(),
        }
    }
}

impl From<StoreError> for CaptureError {
    fn from(source: StoreError) -> Self {
        CaptureError::Persistence { source }
    }
}

impl From<Vec<FieldError>> for CaptureError {
    fn from(errors: Vec<FieldError>) -> Self {
        CaptureError::Validation { errors }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(pole: &str, tax_id: Option<&str>) -> PartyRecord {
        PartyRecord {
            external_party_id: "EXT-1".into(),
            external_person_id: 101,
            name: "Maria Souza".into(),
            role_code: "party".into(),
            pole: pole.into(),
            tax_id_kind: "individual".into(),
            principal: false,
            tax_id: tax_id.map(|s| s.to_string()),
            emails: vec![],
            phones: vec![],
            address: None,
            representatives: vec![],
            raw: json!({"id": "EXT-1"}),
        }
    }

    fn acting() -> ActingRepresentative {
        ActingRepresentative {
            name: "Dr. Carvalho".into(),
            tax_id: "123.456.789-00".into(),
            bar_number: Some("SP-88123".into()),
        }
    }

    #[test]
    fn pole_parsing_degrades_to_other() {
        assert_eq!(Pole::parse("active"), Some(Pole::Active));
        assert_eq!(Pole::parse("PASSIVE"), Some(Pole::Passive));
        assert_eq!(Pole::parse("???"), None);
        assert_eq!(Pole::parse_lenient("???"), Pole::Other);
    }

    #[test]
    fn tax_id_kind_parsing_degrades_to_other() {
        assert_eq!(TaxIdKind::parse("entity"), Some(TaxIdKind::Company));
        assert_eq!(TaxIdKind::parse_lenient("mystery"), TaxIdKind::Other);
    }

    #[test]
    fn tax_id_normalization_keeps_digits_only() {
        assert_eq!(normalize_tax_id("123.456.789-00"), "12345678900");
        assert_eq!(normalize_tax_id("no digits"), "");
    }

    #[test]
    fn validation_aggregates_all_field_errors() {
        let mut bad = record("nonsense", None);
        bad.name = "  ".into();
        bad.external_person_id = 0;
        let errors = validate_record(&bad, true).unwrap_err();
        let paths: Vec<_> = errors.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"name"));
        assert!(paths.contains(&"external_person_id"));
        assert!(paths.contains(&"pole"));
    }

    #[test]
    fn lenient_validation_accepts_unknown_codes() {
        let bad = record("nonsense", None);
        assert!(validate_record(&bad, false).is_ok());
        assert!(validate_record(&bad, true).is_err());
    }

    #[test]
    fn nested_representatives_are_validated() {
        let mut rec = record("active", None);
        rec.representatives.push(RepresentativeRecord {
            external_person_id: 0,
            name: String::new(),
            tax_id: None,
            bar_number: None,
            bar_state: None,
            emails: vec![],
            phones: vec![],
            address: None,
        });
        let errors = validate_record(&rec, true).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| e.path == "representatives[0].external_person_id"));
    }

    #[test]
    fn matching_tax_id_classifies_as_client_regardless_of_pole() {
        let rec = record("passive", Some("12345678900"));
        assert_eq!(classify(&rec, &acting()), PartyClass::Client);
    }

    #[test]
    fn pole_mapping_applies_when_tax_ids_differ() {
        assert_eq!(
            classify(&record("active", Some("999")), &acting()),
            PartyClass::Client
        );
        assert_eq!(
            classify(&record("passive", Some("999")), &acting()),
            PartyClass::Opposing
        );
        assert_eq!(
            classify(&record("weird", Some("999")), &acting()),
            PartyClass::Third
        );
    }

    #[test]
    fn explicit_third_party_role_wins_over_pole() {
        let mut rec = record("active", None);
        rec.role_code = "witness".into();
        assert_eq!(classify(&rec, &acting()), PartyClass::Third);
    }

    #[test]
    fn diff_reports_changed_fields_by_name() {
        let a = EntityFields::from_record(&record("active", Some("111")));
        let mut b = a.clone();
        b.name = "Maria S. Souza".into();
        b.emails.push("maria@example.com".into());
        let cmp = compare(&b, &a);
        assert!(!cmp.identical);
        assert_eq!(cmp.changed, vec!["name", "emails"]);
    }

    #[test]
    fn diff_ignores_control_fields() {
        let fields = EntityFields::from_record(&record("active", Some("111")));
        let row_a = EntityRow {
            id: 1,
            kind: EntityKind::Client,
            external_person_id: 101,
            address_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            audit: json!({"seen": 1}),
            fields: fields.clone(),
        };
        let row_b = EntityRow {
            id: 99,
            audit: json!({"seen": 2}),
            ..row_a.clone()
        };
        // Only the projections participate in the comparison.
        let cmp = compare(&row_a.fields, &row_b.fields);
        assert!(cmp.identical);
    }

    #[test]
    fn entity_kind_relation_names_are_closed() {
        assert_eq!(EntityKind::from_class(PartyClass::Client).relation(), "client_entities");
        assert_eq!(EntityKind::from_class(PartyClass::Opposing).relation(), "opposing_entities");
        assert_eq!(EntityKind::from_class(PartyClass::Third).relation(), "third_entities");
    }
}
