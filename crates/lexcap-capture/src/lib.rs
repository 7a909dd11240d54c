//! Capture reconciliation engine: configuration, upsert execution,
//! per-record coordination, bounded-concurrency batching, and run reports.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lexcap_core::{
    classify, compare, validate_record, ActingRepresentative, AddressFields, CaptureError,
    ClassifiedParty, EntityFields, EntityKind, EntityRef, FieldError, OwnerRef, PartyClass,
    PartyRecord, Pole, RepresentativeFields, RepresentativeRecord,
};
use lexcap_store::{with_retry, BackoffPolicy, CaptureStore, NewLink, NewRepresentative};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lexcap-capture";

/// Rejected items kept verbatim in the run report; the rest are counted.
pub const MAX_REPORT_ERRORS: usize = 25;

// ---------------------------------------------------------------------------
// Configuration

#[derive(Debug, Clone, Serialize)]
pub struct CaptureConfig {
    pub max_concurrent_parties: usize,
    pub max_concurrent_representatives: usize,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub strict_validation: bool,
    pub enable_parallel_processing: bool,
    pub enable_retry: bool,
    pub recapture_freshness_hours: i64,
    /// Cross-process locking integration point; carried in configuration
    /// but not acted on by the engine.
    pub enable_distributed_lock: bool,
    pub lock_ttl_secs: u64,
    pub lock_acquire_timeout_secs: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_concurrent_parties: 4,
            max_concurrent_representatives: 2,
            retry_max_attempts: 3,
            retry_base_delay_ms: 250,
            retry_max_delay_ms: 5_000,
            strict_validation: true,
            enable_parallel_processing: true,
            enable_retry: true,
            recapture_freshness_hours: 24,
            enable_distributed_lock: false,
            lock_ttl_secs: 300,
            lock_acquire_timeout_secs: 30,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

impl CaptureConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent_parties: env_parse(
                "LEXCAP_MAX_CONCURRENT_PARTIES",
                defaults.max_concurrent_parties,
            ),
            max_concurrent_representatives: env_parse(
                "LEXCAP_MAX_CONCURRENT_REPRESENTATIVES",
                defaults.max_concurrent_representatives,
            ),
            retry_max_attempts: env_parse(
                "LEXCAP_RETRY_MAX_ATTEMPTS",
                defaults.retry_max_attempts,
            ),
            retry_base_delay_ms: env_parse(
                "LEXCAP_RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay_ms,
            ),
            retry_max_delay_ms: env_parse(
                "LEXCAP_RETRY_MAX_DELAY_MS",
                defaults.retry_max_delay_ms,
            ),
            strict_validation: env_bool("LEXCAP_STRICT_VALIDATION", defaults.strict_validation),
            enable_parallel_processing: env_bool(
                "LEXCAP_ENABLE_PARALLEL",
                defaults.enable_parallel_processing,
            ),
            enable_retry: env_bool("LEXCAP_ENABLE_RETRY", defaults.enable_retry),
            recapture_freshness_hours: env_parse(
                "LEXCAP_RECAPTURE_FRESHNESS_HOURS",
                defaults.recapture_freshness_hours,
            ),
            enable_distributed_lock: env_bool(
                "LEXCAP_ENABLE_DISTRIBUTED_LOCK",
                defaults.enable_distributed_lock,
            ),
            lock_ttl_secs: env_parse("LEXCAP_LOCK_TTL_SECS", defaults.lock_ttl_secs),
            lock_acquire_timeout_secs: env_parse(
                "LEXCAP_LOCK_ACQUIRE_TIMEOUT_SECS",
                defaults.lock_acquire_timeout_secs,
            ),
        }
    }

    /// All offending fields are aggregated before failing once; startup
    /// aborts on any of them.
    pub fn validate(&self) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();
        if self.max_concurrent_parties < 1 {
            errors.push(FieldError::new(
                "max_concurrent_parties",
                "must be at least 1",
            ));
        }
        if self.max_concurrent_representatives < 1 {
            errors.push(FieldError::new(
                "max_concurrent_representatives",
                "must be at least 1",
            ));
        }
        if self.retry_max_attempts < 1 {
            errors.push(FieldError::new("retry_max_attempts", "must be at least 1"));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            errors.push(FieldError::new(
                "retry_max_delay_ms",
                "must not be below retry_base_delay_ms",
            ));
        }
        if self.recapture_freshness_hours < 0 {
            errors.push(FieldError::new(
                "recapture_freshness_hours",
                "must not be negative",
            ));
        }
        if self.enable_distributed_lock && self.lock_ttl_secs == 0 {
            errors.push(FieldError::new(
                "lock_ttl_secs",
                "must be positive when the distributed lock is enabled",
            ));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn freshness_window(&self) -> ChronoDuration {
        ChronoDuration::hours(self.recapture_freshness_hours)
    }
}

// ---------------------------------------------------------------------------
// Upsert executor

/// Result of one upsert: the row id plus whether this run created the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upserted {
    pub id: i64,
    pub created: bool,
}

/// Serialize a stored row into the audit snapshot written alongside an
/// update. The row's own audit column is dropped so snapshots never nest.
fn audit_snapshot<T: Serialize>(row: &T) -> JsonValue {
    let mut value = serde_json::to_value(row).unwrap_or(JsonValue::Null);
    if let Some(object) = value.as_object_mut() {
        object.remove("audit");
    }
    value
}

/// Insert-if-absent-else-diff-then-maybe-update against one relation, with
/// every store call wrapped by the retry policy.
pub struct Persister<'a> {
    store: &'a dyn CaptureStore,
    backoff: BackoffPolicy,
    retry_enabled: bool,
}

impl<'a> Persister<'a> {
    pub fn new(store: &'a dyn CaptureStore, backoff: BackoffPolicy, retry_enabled: bool) -> Self {
        Self {
            store,
            backoff,
            retry_enabled,
        }
    }

    async fn run<T, F, Fut>(&self, op: F) -> Result<T, CaptureError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, lexcap_core::StoreError>>,
    {
        with_retry(&self.backoff, self.retry_enabled, op)
            .await
            .map_err(CaptureError::from)
    }

    pub async fn upsert_entity(
        &self,
        kind: EntityKind,
        external_person_id: i64,
        fields: &EntityFields,
        raw: &JsonValue,
    ) -> Result<Upserted, CaptureError> {
        let existing = self
            .run(|| self.store.find_entity(kind, external_person_id))
            .await?;
        match existing {
            None => {
                let id = self
                    .run(|| {
                        self.store.insert_entity(
                            kind,
                            external_person_id,
                            fields.clone(),
                            raw.clone(),
                        )
                    })
                    .await?;
                Ok(Upserted { id, created: true })
            }
            Some(row) => {
                let cmp = compare(fields, &row.fields);
                if cmp.identical {
                    debug!(
                        relation = kind.relation(),
                        id = row.id,
                        "projection unchanged, skipping write"
                    );
                    return Ok(Upserted {
                        id: row.id,
                        created: false,
                    });
                }
                debug!(
                    relation = kind.relation(),
                    id = row.id,
                    changed = ?cmp.changed,
                    "updating changed fields"
                );
                let audit = audit_snapshot(&row);
                self.run(|| {
                    self.store
                        .update_entity(kind, row.id, fields.clone(), audit.clone())
                })
                .await?;
                Ok(Upserted {
                    id: row.id,
                    created: false,
                })
            }
        }
    }

    pub async fn upsert_address(
        &self,
        external_address_id: i64,
        owner: OwnerRef,
        fields: &AddressFields,
    ) -> Result<Upserted, CaptureError> {
        let existing = self
            .run(|| self.store.find_address(external_address_id))
            .await?;
        match existing {
            None => {
                let id = self
                    .run(|| {
                        self.store
                            .insert_address(external_address_id, owner, fields.clone())
                    })
                    .await?;
                Ok(Upserted { id, created: true })
            }
            Some(row) => {
                let cmp = compare(fields, &row.fields);
                if !cmp.identical {
                    debug!(
                        relation = "addresses",
                        id = row.id,
                        changed = ?cmp.changed,
                        "updating changed fields"
                    );
                    self.run(|| self.store.update_address(row.id, fields.clone()))
                        .await?;
                }
                Ok(Upserted {
                    id: row.id,
                    created: false,
                })
            }
        }
    }

    pub async fn upsert_representative(
        &self,
        case_id: &str,
        owner: EntityRef,
        external_person_id: i64,
        fields: &RepresentativeFields,
    ) -> Result<Upserted, CaptureError> {
        let existing = self
            .run(|| {
                self.store
                    .find_representative(case_id, owner, external_person_id)
            })
            .await?;
        match existing {
            None => {
                let id = self
                    .run(|| {
                        self.store.insert_representative(NewRepresentative {
                            case_id: case_id.to_string(),
                            owner,
                            external_person_id,
                            fields: fields.clone(),
                        })
                    })
                    .await?;
                Ok(Upserted { id, created: true })
            }
            Some(row) => {
                let cmp = compare(fields, &row.fields);
                if !cmp.identical {
                    debug!(
                        relation = "representatives",
                        id = row.id,
                        changed = ?cmp.changed,
                        "updating changed fields"
                    );
                    self.run(|| self.store.update_representative(row.id, fields.clone()))
                        .await?;
                }
                Ok(Upserted {
                    id: row.id,
                    created: false,
                })
            }
        }
    }

    pub async fn set_entity_address(
        &self,
        kind: EntityKind,
        id: i64,
        address_id: i64,
    ) -> Result<(), CaptureError> {
        self.run(|| self.store.set_entity_address(kind, id, address_id))
            .await
    }

    pub async fn set_representative_address(
        &self,
        id: i64,
        address_id: i64,
    ) -> Result<(), CaptureError> {
        self.run(|| self.store.set_representative_address(id, address_id))
            .await
    }

    /// Create the case-party link if it does not exist yet. Duplicate links
    /// are never created; an existing link is reported back unchanged.
    pub async fn ensure_link(
        &self,
        case_id: &str,
        entity: EntityRef,
        order_index: u32,
        record: &PartyRecord,
    ) -> Result<Upserted, CaptureError> {
        let existing = self.run(|| self.store.find_link(case_id, entity)).await?;
        if let Some(row) = existing {
            return Ok(Upserted {
                id: row.id,
                created: false,
            });
        }
        let id = self
            .run(|| {
                self.store.insert_link(NewLink {
                    case_id: case_id.to_string(),
                    entity,
                    external_party_id: record.external_party_id.clone(),
                    role_code: record.role_code.clone(),
                    pole: Pole::parse_lenient(&record.pole),
                    order_index,
                    principal: record.principal,
                    raw: record.raw.clone(),
                })
            })
            .await?;
        Ok(Upserted { id, created: true })
    }
}

// ---------------------------------------------------------------------------
// Concurrency batch processor

/// Partition `items` into groups of at most `max_concurrent`, preserving
/// input order. Within a group every item runs concurrently and the group
/// settles completely (no cancel-on-first-error) before the next one
/// starts. With `parallel` false, items run strictly one at a time. Either
/// way the outcomes come back in input order, one per item.
pub async fn run_bounded<T, R, F, Fut>(
    items: Vec<T>,
    max_concurrent: usize,
    parallel: bool,
    worker: F,
) -> Vec<Result<R, CaptureError>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(usize, T) -> Fut,
    Fut: Future<Output = Result<R, CaptureError>> + Send + 'static,
{
    let mut outcomes = Vec::with_capacity(items.len());

    if !parallel || max_concurrent <= 1 {
        for (index, item) in items.into_iter().enumerate() {
            outcomes.push(worker(index, item).await);
        }
        return outcomes;
    }

    let mut queue = items.into_iter().enumerate();
    loop {
        let mut group = Vec::with_capacity(max_concurrent);
        for _ in 0..max_concurrent {
            match queue.next() {
                Some((index, item)) => group.push(tokio::spawn(worker(index, item))),
                None => break,
            }
        }
        if group.is_empty() {
            break;
        }
        for handle in group {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_err) => outcomes.push(Err(CaptureError::fatal(format!(
                    "capture worker task failed: {join_err}"
                )))),
            }
        }
    }
    outcomes
}

// ---------------------------------------------------------------------------
// Outcomes, aggregation

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartyOutcome {
    pub class: PartyClass,
    pub entity_id: i64,
    pub entity_created: bool,
    pub link_created: bool,
    pub representatives_saved: usize,
    pub representatives_failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureErrorEntry {
    pub index: usize,
    pub party: String,
    pub message: String,
}

/// Run-level result. Always produced when the run got past its fatal
/// checks, however many individual items failed.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureReport {
    pub run_id: Uuid,
    pub case_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub total: usize,
    pub clients: usize,
    pub opposing: usize,
    pub third: usize,
    pub links: usize,
    pub links_created: usize,
    pub representatives_saved: usize,
    pub errors: Vec<CaptureErrorEntry>,
    pub errors_truncated: usize,
}

fn party_label(record: &PartyRecord) -> String {
    let name = record.name.trim();
    if name.is_empty() {
        record.external_party_id.clone()
    } else if record.external_party_id.is_empty() {
        name.to_string()
    } else {
        format!("{} [{}]", name, record.external_party_id)
    }
}

/// Merge settled per-item outcomes into run totals and a bounded error
/// list. Individual rejections never abort aggregation.
pub fn aggregate(
    run_id: Uuid,
    case_id: &str,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    labels: &[String],
    outcomes: &[Result<PartyOutcome, CaptureError>],
) -> CaptureReport {
    let mut report = CaptureReport {
        run_id,
        case_id: case_id.to_string(),
        started_at,
        finished_at,
        duration_ms: (finished_at - started_at).num_milliseconds(),
        total: outcomes.len(),
        clients: 0,
        opposing: 0,
        third: 0,
        links: 0,
        links_created: 0,
        representatives_saved: 0,
        errors: Vec::new(),
        errors_truncated: 0,
    };

    for (index, outcome) in outcomes.iter().enumerate() {
        match outcome {
            Ok(outcome) => {
                match outcome.class {
                    PartyClass::Client => report.clients += 1,
                    PartyClass::Opposing => report.opposing += 1,
                    PartyClass::Third => report.third += 1,
                }
                report.links += 1;
                if outcome.link_created {
                    report.links_created += 1;
                }
                report.representatives_saved += outcome.representatives_saved;
            }
            Err(err) => {
                if report.errors.len() < MAX_REPORT_ERRORS {
                    report.errors.push(CaptureErrorEntry {
                        index,
                        party: labels.get(index).cloned().unwrap_or_default(),
                        message: err.to_string(),
                    });
                } else {
                    report.errors_truncated += 1;
                }
            }
        }
    }
    report
}

// ---------------------------------------------------------------------------
// Staleness gate

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StalenessPartition {
    pub refetch: Vec<String>,
    pub skipped: Vec<String>,
}

/// Split `case_ids` into the ones needing a fresh fetch (never captured, or
/// captured before `now - freshness`) and the ones recent enough to skip.
/// Input order is preserved within both halves.
pub async fn partition_stale(
    store: &dyn CaptureStore,
    case_ids: &[String],
    freshness: ChronoDuration,
    now: DateTime<Utc>,
) -> Result<StalenessPartition, CaptureError> {
    let cutoff = now - freshness;
    let mut refetch = Vec::new();
    let mut skipped = Vec::new();
    for case_id in case_ids {
        match store.last_captured_at(case_id).await? {
            Some(at) if at > cutoff => skipped.push(case_id.clone()),
            _ => refetch.push(case_id.clone()),
        }
    }
    Ok(StalenessPartition { refetch, skipped })
}

// ---------------------------------------------------------------------------
// Transaction coordinator

/// Drives one capture run: classification, per-record persistence with
/// compensating rollback, bounded-concurrency batching, and aggregation.
#[derive(Clone)]
pub struct CaptureEngine {
    config: CaptureConfig,
    store: Arc<dyn CaptureStore>,
}

impl CaptureEngine {
    /// `config` must already have passed [`CaptureConfig::validate`].
    pub fn new(config: CaptureConfig, store: Arc<dyn CaptureStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Run the full pipeline over one case's records. Per-item failures are
    /// collected into the report; only run-level fatal conditions surface
    /// as an error, and those abort before any item is attempted.
    pub async fn capture_case(
        &self,
        case_id: &str,
        acting: &ActingRepresentative,
        records: Vec<PartyRecord>,
    ) -> Result<CaptureReport, CaptureError> {
        if case_id.trim().is_empty() {
            return Err(CaptureError::fatal("case id must not be empty"));
        }
        if lexcap_core::normalize_tax_id(&acting.tax_id).is_empty() {
            return Err(CaptureError::fatal(
                "acting representative has no usable tax id",
            ));
        }

        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            case_id,
            records = records.len(),
            parallel = self.config.enable_parallel_processing,
            "starting capture run"
        );

        let labels: Vec<String> = records.iter().map(party_label).collect();

        let engine = self.clone();
        let case = case_id.to_string();
        let acting = acting.clone();
        let worker = move |index: usize, record: PartyRecord| {
            let engine = engine.clone();
            let case = case.clone();
            let acting = acting.clone();
            async move { engine.capture_party(&case, &acting, index, record).await }
        };

        let outcomes = run_bounded(
            records,
            self.config.max_concurrent_parties,
            self.config.enable_parallel_processing,
            worker,
        )
        .await;

        let finished_at = Utc::now();
        let report = aggregate(run_id, case_id, started_at, finished_at, &labels, &outcomes);

        if let Err(err) = self.store.mark_captured(case_id, finished_at).await {
            warn!(case_id, error = %err, "failed to record capture timestamp");
        }

        info!(
            %run_id,
            total = report.total,
            clients = report.clients,
            opposing = report.opposing,
            third = report.third,
            links = report.links,
            failed = report.errors.len() + report.errors_truncated,
            "capture run finished"
        );
        Ok(report)
    }

    /// Reconcile a single record. Linear state machine with one rollback
    /// edge: a failure between entity upsert and link creation deletes the
    /// entity again if this run created it; a pre-existing entity is never
    /// deleted.
    async fn capture_party(
        &self,
        case_id: &str,
        acting: &ActingRepresentative,
        index: usize,
        record: PartyRecord,
    ) -> Result<PartyOutcome, CaptureError> {
        validate_record(&record, self.config.strict_validation).map_err(CaptureError::from)?;

        let classified = ClassifiedParty {
            class: classify(&record, acting),
            record,
        };
        let class = classified.class;
        let record = &classified.record;
        let kind = EntityKind::from_class(class);
        let persister = Persister::new(
            self.store.as_ref(),
            self.config.backoff(),
            self.config.enable_retry,
        );

        let fields = EntityFields::from_record(record);
        let entity = persister
            .upsert_entity(kind, record.external_person_id, &fields, &record.raw)
            .await?;

        match self
            .finish_party(&persister, case_id, kind, entity, index, record)
            .await
        {
            Ok((link_created, saved, failed)) => Ok(PartyOutcome {
                class,
                entity_id: entity.id,
                entity_created: entity.created,
                link_created,
                representatives_saved: saved,
                representatives_failed: failed,
            }),
            Err(err) => {
                if entity.created {
                    warn!(
                        relation = kind.relation(),
                        entity_id = entity.id,
                        error = %err,
                        "rolling back entity created this run"
                    );
                    let rollback = with_retry(
                        &self.config.backoff(),
                        self.config.enable_retry,
                        || self.store.delete_entity(kind, entity.id),
                    )
                    .await;
                    if let Err(delete_err) = rollback {
                        let failure = CaptureError::Rollback {
                            relation: kind.relation(),
                            message: delete_err.to_string(),
                        };
                        warn!(error = %failure, "compensating delete failed; surfacing the original error");
                    }
                }
                Err(err)
            }
        }
    }

    /// Steps after the entity upsert: address, link, representatives. Any
    /// error returned from here triggers the rollback edge in the caller.
    async fn finish_party(
        &self,
        persister: &Persister<'_>,
        case_id: &str,
        kind: EntityKind,
        entity: Upserted,
        index: usize,
        record: &PartyRecord,
    ) -> Result<(bool, usize, usize), CaptureError> {
        if let Some(address) = record.address.as_ref() {
            if address.is_persistable() {
                let owner = OwnerRef::Entity {
                    kind,
                    id: entity.id,
                };
                let saved = persister
                    .upsert_address(
                        address.external_address_id,
                        owner,
                        &AddressFields::from_record(address),
                    )
                    .await?;
                persister
                    .set_entity_address(kind, entity.id, saved.id)
                    .await?;
            } else {
                debug!(
                    external_party_id = %record.external_party_id,
                    "address below minimal completeness, skipping"
                );
            }
        }

        if entity.id <= 0 {
            return Err(CaptureError::validation(
                "entity_id",
                "link requires a positive entity id",
            ));
        }
        if record.external_party_id.trim().is_empty() {
            return Err(CaptureError::validation(
                "external_party_id",
                "external party id missing",
            ));
        }

        let entity_ref = EntityRef {
            kind,
            id: entity.id,
        };
        let link = persister
            .ensure_link(case_id, entity_ref, index as u32, record)
            .await?;

        let (saved, failed) = self
            .save_representatives(case_id, entity_ref, record.representatives.clone())
            .await;

        Ok((link.created, saved, failed))
    }

    /// Bounded sub-batch over a party's representatives. Individual
    /// failures are recorded and logged but never cancel their siblings,
    /// and never undo the already-created link.
    async fn save_representatives(
        &self,
        case_id: &str,
        owner: EntityRef,
        representatives: Vec<RepresentativeRecord>,
    ) -> (usize, usize) {
        if representatives.is_empty() {
            return (0, 0);
        }

        let engine = self.clone();
        let case = case_id.to_string();
        let worker = move |_index: usize, rep: RepresentativeRecord| {
            let engine = engine.clone();
            let case = case.clone();
            async move { engine.save_representative(&case, owner, rep).await }
        };

        let outcomes = run_bounded(
            representatives,
            self.config.max_concurrent_representatives,
            self.config.enable_parallel_processing,
            worker,
        )
        .await;

        let mut saved = 0;
        let mut failed = 0;
        for outcome in outcomes {
            match outcome {
                Ok(()) => saved += 1,
                Err(err) => {
                    failed += 1;
                    warn!(case_id, error = %err, "representative upsert failed");
                }
            }
        }
        (saved, failed)
    }

    async fn save_representative(
        &self,
        case_id: &str,
        owner: EntityRef,
        rep: RepresentativeRecord,
    ) -> Result<(), CaptureError> {
        let persister = Persister::new(
            self.store.as_ref(),
            self.config.backoff(),
            self.config.enable_retry,
        );
        let fields = RepresentativeFields::from_record(&rep);
        let saved = persister
            .upsert_representative(case_id, owner, rep.external_person_id, &fields)
            .await?;

        if let Some(address) = rep.address.as_ref() {
            if address.is_persistable() {
                let addr = persister
                    .upsert_address(
                        address.external_address_id,
                        OwnerRef::Representative { id: saved.id },
                        &AddressFields::from_record(address),
                    )
                    .await?;
                persister
                    .set_representative_address(saved.id, addr.id)
                    .await?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Run reports

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write `capture_report.json` and `capture_brief.md` under
/// `<reports_root>/<run id>/`, returning the run directory. The raw fetched
/// payload is fingerprinted, not stored.
pub async fn write_reports(
    reports_root: &Path,
    report: &CaptureReport,
    config: &CaptureConfig,
    raw_payload: &JsonValue,
) -> Result<PathBuf> {
    let run_dir = reports_root.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let payload_bytes =
        serde_json::to_vec(raw_payload).context("serializing raw payload for fingerprinting")?;
    let payload_sha256 = sha256_hex(&payload_bytes);

    let report_json = serde_json::to_vec_pretty(&serde_json::json!({
        "report": report,
        "config": config,
        "raw_payload_sha256": payload_sha256,
    }))
    .context("serializing capture report")?;
    fs::write(run_dir.join("capture_report.json"), report_json)
        .await
        .context("writing capture_report.json")?;

    let mut class_counts = BTreeMap::new();
    class_counts.insert("clients", report.clients);
    class_counts.insert("opposing", report.opposing);
    class_counts.insert("third", report.third);

    let brief = format!(
        "# Capture Brief\n\n- Run ID: `{}`\n- Case: `{}`\n- Started: {}\n- Finished: {}\n- Parties: {}\n- Links: {} ({} new)\n- Representatives saved: {}\n- Failures: {}\n\n## Classification\n{}\n",
        report.run_id,
        report.case_id,
        report.started_at,
        report.finished_at,
        report.total,
        report.links,
        report.links_created,
        report.representatives_saved,
        report.errors.len() + report.errors_truncated,
        class_counts
            .iter()
            .map(|(k, v)| format!("- {}: {}", k, v))
            .collect::<Vec<_>>()
            .join("\n")
    );
    fs::write(run_dir.join("capture_brief.md"), brief)
        .await
        .context("writing capture_brief.md")?;

    Ok(run_dir)
}

/// Markdown digest of the most recent run reports under `reports_root`.
pub fn report_digest_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# Capture Runs".to_string(), String::new()];
    for dir in dirs {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let report_path = dir.path().join("capture_report.json");
        let value: JsonValue = serde_json::from_str(
            &std::fs::read_to_string(&report_path)
                .with_context(|| format!("reading {}", report_path.display()))?,
        )
        .with_context(|| format!("parsing {}", report_path.display()))?;

        let report = value.get("report").cloned().unwrap_or(JsonValue::Null);
        let count = |key: &str| report.get(key).and_then(|v| v.as_u64()).unwrap_or(0);

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!(
            "- case: `{}`",
            report.get("case_id").and_then(|v| v.as_str()).unwrap_or("unknown")
        ));
        lines.push(format!(
            "- parties: {} (clients {}, opposing {}, third {})",
            count("total"),
            count("clients"),
            count("opposing"),
            count("third")
        ));
        lines.push(format!(
            "- links: {}, representatives: {}",
            count("links"),
            count("representatives_saved")
        ));
        lines.push(format!(
            "- failures: {}",
            report
                .get("errors")
                .and_then(|v| v.as_array())
                .map(|a| a.len())
                .unwrap_or(0)
        ));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexcap_core::{StoreErrorKind, StoreOp, TaxIdKind};
    use lexcap_store::MemoryStore;
    use serde_json::json;

    fn quick_config() -> CaptureConfig {
        CaptureConfig {
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 2,
            ..CaptureConfig::default()
        }
    }

    fn record(person_id: i64, name: &str) -> PartyRecord {
        PartyRecord {
            external_party_id: format!("EXT-{person_id}"),
            external_person_id: person_id,
            name: name.to_string(),
            role_code: "party".into(),
            pole: "active".into(),
            tax_id_kind: "individual".into(),
            principal: false,
            tax_id: Some(format!("{person_id:011}")),
            emails: vec![],
            phones: vec![],
            address: None,
            representatives: vec![],
            raw: json!({"person": person_id}),
        }
    }

    #[test]
    fn config_validation_aggregates_field_errors() {
        let config = CaptureConfig {
            max_concurrent_parties: 0,
            retry_max_attempts: 0,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 50,
            ..CaptureConfig::default()
        };
        let errors = config.validate().unwrap_err();
        let paths: Vec<_> = errors.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"max_concurrent_parties"));
        assert!(paths.contains(&"retry_max_attempts"));
        assert!(paths.contains(&"retry_max_delay_ms"));
    }

    #[test]
    fn default_config_is_valid() {
        assert!(CaptureConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn run_bounded_preserves_input_order_in_both_modes() {
        let worker = |index: usize, value: u32| async move {
            if value % 2 == 1 {
                // Odd items settle later; order must still hold.
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok::<_, CaptureError>((index, value * 10))
        };

        let sequential = run_bounded(vec![1u32, 2, 3, 4, 5], 2, false, worker).await;
        let parallel = run_bounded(vec![1u32, 2, 3, 4, 5], 2, true, worker).await;

        for outcomes in [sequential, parallel] {
            let values: Vec<_> = outcomes.into_iter().map(|o| o.unwrap()).collect();
            assert_eq!(
                values,
                vec![(0, 10), (1, 20), (2, 30), (3, 40), (4, 50)]
            );
        }
    }

    #[tokio::test]
    async fn run_bounded_settles_failures_without_cancelling_siblings() {
        let worker = |_index: usize, value: u32| async move {
            if value == 2 {
                Err(CaptureError::fatal("boom"))
            } else {
                Ok(value)
            }
        };
        let outcomes = run_bounded(vec![1u32, 2, 3], 3, true, worker).await;
        assert!(outcomes[0].is_ok());
        assert!(outcomes[1].is_err());
        assert!(outcomes[2].is_ok());
    }

    #[tokio::test]
    async fn unchanged_rerun_issues_no_writes() {
        let store = Arc::new(MemoryStore::new());
        let persister = Persister::new(store.as_ref(), quick_config().backoff(), true);
        let fields = EntityFields {
            name: "Maria Souza".into(),
            tax_id_kind: TaxIdKind::Individual,
            tax_id: Some("12345678900".into()),
            emails: vec![],
            phones: vec![],
        };

        let first = persister
            .upsert_entity(EntityKind::Client, 101, &fields, &json!({}))
            .await
            .unwrap();
        assert!(first.created);
        let writes_after_insert = store.write_ops().await;

        let second = persister
            .upsert_entity(EntityKind::Client, 101, &fields, &json!({}))
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.id, first.id);
        assert_eq!(store.write_ops().await, writes_after_insert);
    }

    #[tokio::test]
    async fn changed_projection_updates_with_prior_row_audit() {
        let store = Arc::new(MemoryStore::new());
        let persister = Persister::new(store.as_ref(), quick_config().backoff(), true);
        let mut fields = EntityFields {
            name: "Maria Souza".into(),
            tax_id_kind: TaxIdKind::Individual,
            tax_id: Some("12345678900".into()),
            emails: vec![],
            phones: vec![],
        };
        persister
            .upsert_entity(EntityKind::Client, 101, &fields, &json!({"v": 1}))
            .await
            .unwrap();

        fields.name = "Maria S. Souza".into();
        persister
            .upsert_entity(EntityKind::Client, 101, &fields, &json!({"v": 2}))
            .await
            .unwrap();

        let row = store
            .find_entity(EntityKind::Client, 101)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.fields.name, "Maria S. Souza");
        // Audit snapshot holds the prior row, minus its own audit column.
        assert_eq!(row.audit["fields"]["name"], "Maria Souza");
        assert!(row.audit.get("audit").is_none());
    }

    #[tokio::test]
    async fn transient_insert_failures_are_retried_through_the_persister() {
        let store = Arc::new(MemoryStore::new());
        store
            .inject_failure(
                "client_entities",
                StoreOp::Insert,
                StoreErrorKind::Unavailable,
                2,
            )
            .await;
        let persister = Persister::new(store.as_ref(), quick_config().backoff(), true);
        let fields = EntityFields {
            name: "Maria".into(),
            tax_id_kind: TaxIdKind::Individual,
            tax_id: None,
            emails: vec![],
            phones: vec![],
        };
        let saved = persister
            .upsert_entity(EntityKind::Client, 7, &fields, &json!({}))
            .await
            .unwrap();
        assert!(saved.created);
        assert_eq!(store.entity_count(EntityKind::Client).await, 1);
    }

    #[tokio::test]
    async fn staleness_gate_partitions_by_freshness_window() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .mark_captured("fresh-case", now - ChronoDuration::hours(1))
            .await
            .unwrap();
        store
            .mark_captured("stale-case", now - ChronoDuration::hours(30))
            .await
            .unwrap();

        let cases = vec![
            "fresh-case".to_string(),
            "stale-case".to_string(),
            "new-case".to_string(),
        ];
        let partition =
            partition_stale(&store, &cases, ChronoDuration::hours(24), now)
                .await
                .unwrap();
        assert_eq!(partition.refetch, vec!["stale-case", "new-case"]);
        assert_eq!(partition.skipped, vec!["fresh-case"]);
    }

    #[test]
    fn aggregate_bounds_the_error_list() {
        let run_id = Uuid::new_v4();
        let now = Utc::now();
        let labels: Vec<String> = (0..40).map(|i| format!("party-{i}")).collect();
        let outcomes: Vec<Result<PartyOutcome, CaptureError>> = (0..40)
            .map(|i| {
                Err(CaptureError::validation(
                    "name",
                    format!("bad record {i}"),
                ))
            })
            .collect();

        let report = aggregate(run_id, "CASE-1", now, now, &labels, &outcomes);
        assert_eq!(report.total, 40);
        assert_eq!(report.errors.len(), MAX_REPORT_ERRORS);
        assert_eq!(report.errors_truncated, 40 - MAX_REPORT_ERRORS);
        assert_eq!(report.errors[0].party, "party-0");
    }

    #[tokio::test]
    async fn reports_round_trip_through_the_digest() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let engine = CaptureEngine::new(quick_config(), store);
        let acting = ActingRepresentative {
            name: "Dr. Carvalho".into(),
            tax_id: "123.456.789-00".into(),
            bar_number: None,
        };

        let report = engine
            .capture_case("CASE-1", &acting, vec![record(101, "Maria Souza")])
            .await
            .unwrap();
        let run_dir = write_reports(dir.path(), &report, engine.config(), &json!({"x": 1}))
            .await
            .unwrap();
        assert!(run_dir.join("capture_report.json").exists());
        assert!(run_dir.join("capture_brief.md").exists());

        let digest = report_digest_markdown(5, dir.path()).unwrap();
        assert!(digest.contains(&report.run_id.to_string()));
        assert!(digest.contains("CASE-1"));
    }
}
