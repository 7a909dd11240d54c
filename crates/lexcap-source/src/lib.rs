//! External case-management source contract + fixture-first implementation.
//!
//! Session authentication and transport live outside this workspace; the
//! engine only ever sees the `PartySource` contract. The fixture source
//! replays bundles captured from a live session, which is also what the
//! test suite runs against.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lexcap_core::{ActingRepresentative, PartyRecord};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "lexcap-source";

/// Externally-issued handle for one case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseHandle {
    pub external_case_id: String,
    #[serde(default)]
    pub case_number: Option<String>,
}

impl CaseHandle {
    pub fn new(external_case_id: impl Into<String>) -> Self {
        Self {
            external_case_id: external_case_id.into(),
            case_number: None,
        }
    }
}

/// Typed records plus the original payload, kept for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyFetch {
    pub records: Vec<PartyRecord>,
    pub raw_payload: JsonValue,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Fetch contract against the external system. The engine treats this as a
/// black box and does not retry it; retrying a fetch is the orchestration
/// layer's call.
#[async_trait]
pub trait PartySource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_parties(&self, case: &CaseHandle) -> Result<PartyFetch, SourceError>;
}

/// One captured fetch, as written to disk by the session tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyBundle {
    pub bundle_id: String,
    pub external_case_id: String,
    pub fetched_at: DateTime<Utc>,
    pub capture_version: String,
    #[serde(default)]
    pub acting_representative: Option<ActingRepresentative>,
    #[serde(default)]
    pub raw_payload: JsonValue,
    pub records: Vec<PartyRecord>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub fn load_party_bundle(path: impl AsRef<Path>) -> Result<PartyBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Replays captured bundles from `<root>/<external case id>/bundle.json`.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    root: PathBuf,
}

impl FixtureSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn bundle_path(&self, case: &CaseHandle) -> PathBuf {
        self.root.join(&case.external_case_id).join("bundle.json")
    }

    pub fn load_bundle(&self, case: &CaseHandle) -> Result<PartyBundle> {
        let bundle: PartyBundle = read_json_file(self.bundle_path(case))?;
        if bundle.external_case_id != case.external_case_id {
            anyhow::bail!(
                "bundle case id {} does not match requested case {}",
                bundle.external_case_id,
                case.external_case_id
            );
        }
        Ok(bundle)
    }
}

#[async_trait]
impl PartySource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_parties(&self, case: &CaseHandle) -> Result<PartyFetch, SourceError> {
        let bundle = self.load_bundle(case)?;
        Ok(PartyFetch {
            records: bundle.records,
            raw_payload: bundle.raw_payload,
            fetched_at: bundle.fetched_at,
        })
    }
}
