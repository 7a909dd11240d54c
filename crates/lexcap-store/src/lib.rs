//! Store collaborator contract, retry policy, and the in-memory reference
//! store used by tests and the CLI.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lexcap_core::{
    AddressFields, AddressRow, EntityFields, EntityKind, EntityRef, EntityRow, LinkRow, OwnerRef,
    Pole, RepresentativeFields, RepresentativeRow, StoreError, StoreErrorKind, StoreOp,
};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "lexcap-store";

// ---------------------------------------------------------------------------
// Retry policy

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_store_error(err: &StoreError) -> RetryDisposition {
    if err.kind.is_transient() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded-attempt exponential backoff. `max_attempts` counts every attempt,
/// the first one included.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Run `op` under the policy. Only transient store failures are retried,
/// and only while attempts remain; a non-retryable failure surfaces after
/// the first attempt, and exhaustion surfaces the last failure unchanged.
/// With `enabled` false the operation gets exactly one attempt.
pub async fn with_retry<T, F, Fut>(
    policy: &BackoffPolicy,
    enabled: bool,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let attempts = if enabled { policy.max_attempts.max(1) } else { 1 };
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if classify_store_error(&err) == RetryDisposition::NonRetryable
                    || attempt >= attempts
                {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt((attempt - 1) as usize);
                debug!(
                    attempt,
                    relation = err.relation,
                    op = %err.op,
                    delay_ms = delay.as_millis() as u64,
                    "retrying store operation"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Store contract

/// Insert payload for a case-party link.
#[derive(Debug, Clone)]
pub struct NewLink {
    pub case_id: String,
    pub entity: EntityRef,
    pub external_party_id: String,
    pub role_code: String,
    pub pole: Pole,
    pub order_index: u32,
    pub principal: bool,
    pub raw: JsonValue,
}

/// Insert payload for a representative row.
#[derive(Debug, Clone)]
pub struct NewRepresentative {
    pub case_id: String,
    pub owner: EntityRef,
    pub external_person_id: i64,
    pub fields: RepresentativeFields,
}

/// The relational store the engine reconciles into. Look-before-write is
/// the contract: inserting an already-present natural key fails with a
/// `Conflict`, which the retry policy treats as non-retryable.
#[async_trait]
pub trait CaptureStore: Send + Sync {
    async fn find_entity(
        &self,
        kind: EntityKind,
        external_person_id: i64,
    ) -> Result<Option<EntityRow>, StoreError>;
    async fn insert_entity(
        &self,
        kind: EntityKind,
        external_person_id: i64,
        fields: EntityFields,
        audit: JsonValue,
    ) -> Result<i64, StoreError>;
    async fn update_entity(
        &self,
        kind: EntityKind,
        id: i64,
        fields: EntityFields,
        audit: JsonValue,
    ) -> Result<(), StoreError>;
    async fn delete_entity(&self, kind: EntityKind, id: i64) -> Result<(), StoreError>;
    async fn set_entity_address(
        &self,
        kind: EntityKind,
        id: i64,
        address_id: i64,
    ) -> Result<(), StoreError>;

    async fn find_address(&self, external_address_id: i64)
        -> Result<Option<AddressRow>, StoreError>;
    async fn insert_address(
        &self,
        external_address_id: i64,
        owner: OwnerRef,
        fields: AddressFields,
    ) -> Result<i64, StoreError>;
    async fn update_address(&self, id: i64, fields: AddressFields) -> Result<(), StoreError>;

    async fn find_link(
        &self,
        case_id: &str,
        entity: EntityRef,
    ) -> Result<Option<LinkRow>, StoreError>;
    async fn insert_link(&self, link: NewLink) -> Result<i64, StoreError>;

    async fn find_representative(
        &self,
        case_id: &str,
        owner: EntityRef,
        external_person_id: i64,
    ) -> Result<Option<RepresentativeRow>, StoreError>;
    async fn insert_representative(&self, rep: NewRepresentative) -> Result<i64, StoreError>;
    async fn update_representative(
        &self,
        id: i64,
        fields: RepresentativeFields,
    ) -> Result<(), StoreError>;
    async fn set_representative_address(
        &self,
        id: i64,
        address_id: i64,
    ) -> Result<(), StoreError>;

    async fn last_captured_at(&self, case_id: &str) -> Result<Option<DateTime<Utc>>, StoreError>;
    async fn mark_captured(&self, case_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory reference store

#[derive(Debug, Clone)]
struct PlannedFailure {
    relation: &'static str,
    op: StoreOp,
    kind: StoreErrorKind,
    remaining: u32,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    entities: HashMap<(EntityKind, i64), EntityRow>,
    addresses: HashMap<i64, AddressRow>,
    links: Vec<LinkRow>,
    representatives: Vec<RepresentativeRow>,
    captured_cases: HashMap<String, DateTime<Utc>>,
    write_ops: u64,
    failures: Vec<PlannedFailure>,
}

impl MemoryState {
    fn alloc_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn take_failure(&mut self, relation: &'static str, op: StoreOp) -> Option<StoreError> {
        let idx = self
            .failures
            .iter()
            .position(|f| f.relation == relation && f.op == op && f.remaining > 0)?;
        self.failures[idx].remaining -= 1;
        let planned = self.failures[idx].clone();
        if self.failures[idx].remaining == 0 {
            self.failures.remove(idx);
        }
        Some(StoreError::new(
            relation,
            op,
            planned.kind,
            "injected failure",
        ))
    }
}

/// Mutex-guarded in-memory store enforcing natural-key uniqueness, with a
/// failure-injection hook so tests can exercise the retry and rollback
/// paths without a real database.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls against `(relation, op)` fail with the
    /// given error kind.
    pub async fn inject_failure(
        &self,
        relation: &'static str,
        op: StoreOp,
        kind: StoreErrorKind,
        times: u32,
    ) {
        let mut state = self.state.lock().await;
        state.failures.push(PlannedFailure {
            relation,
            op,
            kind,
            remaining: times,
        });
    }

    pub async fn entity_count(&self, kind: EntityKind) -> usize {
        let state = self.state.lock().await;
        state.entities.keys().filter(|(k, _)| *k == kind).count()
    }

    pub async fn entities(&self, kind: EntityKind) -> Vec<EntityRow> {
        let state = self.state.lock().await;
        let mut rows: Vec<_> = state
            .entities
            .values()
            .filter(|row| row.kind == kind)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.id);
        rows
    }

    pub async fn address_count(&self) -> usize {
        self.state.lock().await.addresses.len()
    }

    pub async fn links(&self) -> Vec<LinkRow> {
        let mut links = self.state.lock().await.links.clone();
        links.sort_by_key(|l| l.order_index);
        links
    }

    pub async fn representative_count(&self) -> usize {
        self.state.lock().await.representatives.len()
    }

    /// Total mutating operations performed so far. Lets tests assert that
    /// an unchanged re-run issued no writes at all.
    pub async fn write_ops(&self) -> u64 {
        self.state.lock().await.write_ops
    }
}

#[async_trait]
impl CaptureStore for MemoryStore {
    async fn find_entity(
        &self,
        kind: EntityKind,
        external_person_id: i64,
    ) -> Result<Option<EntityRow>, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.take_failure(kind.relation(), StoreOp::Find) {
            return Err(err);
        }
        Ok(state.entities.get(&(kind, external_person_id)).cloned())
    }

    async fn insert_entity(
        &self,
        kind: EntityKind,
        external_person_id: i64,
        fields: EntityFields,
        audit: JsonValue,
    ) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.take_failure(kind.relation(), StoreOp::Insert) {
            return Err(err);
        }
        if state.entities.contains_key(&(kind, external_person_id)) {
            return Err(StoreError::new(
                kind.relation(),
                StoreOp::Insert,
                StoreErrorKind::Conflict,
                format!("entity with external person id {external_person_id} already present"),
            ));
        }
        let id = state.alloc_id();
        let now = Utc::now();
        state.entities.insert(
            (kind, external_person_id),
            EntityRow {
                id,
                kind,
                external_person_id,
                address_id: None,
                created_at: now,
                updated_at: now,
                audit,
                fields,
            },
        );
        state.write_ops += 1;
        Ok(id)
    }

    async fn update_entity(
        &self,
        kind: EntityKind,
        id: i64,
        fields: EntityFields,
        audit: JsonValue,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.take_failure(kind.relation(), StoreOp::Update) {
            return Err(err);
        }
        let row = state
            .entities
            .values_mut()
            .find(|row| row.kind == kind && row.id == id)
            .ok_or_else(|| {
                StoreError::new(
                    kind.relation(),
                    StoreOp::Update,
                    StoreErrorKind::Missing,
                    format!("no entity row {id}"),
                )
            })?;
        row.fields = fields;
        row.audit = audit;
        row.updated_at = Utc::now();
        state.write_ops += 1;
        Ok(())
    }

    async fn delete_entity(&self, kind: EntityKind, id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.take_failure(kind.relation(), StoreOp::Delete) {
            return Err(err);
        }
        let key = state
            .entities
            .iter()
            .find(|(_, row)| row.kind == kind && row.id == id)
            .map(|(key, _)| *key)
            .ok_or_else(|| {
                StoreError::new(
                    kind.relation(),
                    StoreOp::Delete,
                    StoreErrorKind::Missing,
                    format!("no entity row {id}"),
                )
            })?;
        state.entities.remove(&key);
        state.write_ops += 1;
        Ok(())
    }

    async fn set_entity_address(
        &self,
        kind: EntityKind,
        id: i64,
        address_id: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.take_failure(kind.relation(), StoreOp::Update) {
            return Err(err);
        }
        let row = state
            .entities
            .values_mut()
            .find(|row| row.kind == kind && row.id == id)
            .ok_or_else(|| {
                StoreError::new(
                    kind.relation(),
                    StoreOp::Update,
                    StoreErrorKind::Missing,
                    format!("no entity row {id}"),
                )
            })?;
        if row.address_id == Some(address_id) {
            return Ok(());
        }
        row.address_id = Some(address_id);
        row.updated_at = Utc::now();
        state.write_ops += 1;
        Ok(())
    }

    async fn find_address(
        &self,
        external_address_id: i64,
    ) -> Result<Option<AddressRow>, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.take_failure("addresses", StoreOp::Find) {
            return Err(err);
        }
        Ok(state.addresses.get(&external_address_id).cloned())
    }

    async fn insert_address(
        &self,
        external_address_id: i64,
        owner: OwnerRef,
        fields: AddressFields,
    ) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.take_failure("addresses", StoreOp::Insert) {
            return Err(err);
        }
        if state.addresses.contains_key(&external_address_id) {
            return Err(StoreError::new(
                "addresses",
                StoreOp::Insert,
                StoreErrorKind::Conflict,
                format!("address with external id {external_address_id} already present"),
            ));
        }
        let id = state.alloc_id();
        let now = Utc::now();
        state.addresses.insert(
            external_address_id,
            AddressRow {
                id,
                external_address_id,
                owner,
                created_at: now,
                updated_at: now,
                fields,
            },
        );
        state.write_ops += 1;
        Ok(id)
    }

    async fn update_address(&self, id: i64, fields: AddressFields) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.take_failure("addresses", StoreOp::Update) {
            return Err(err);
        }
        let row = state
            .addresses
            .values_mut()
            .find(|row| row.id == id)
            .ok_or_else(|| {
                StoreError::new(
                    "addresses",
                    StoreOp::Update,
                    StoreErrorKind::Missing,
                    format!("no address row {id}"),
                )
            })?;
        row.fields = fields;
        row.updated_at = Utc::now();
        state.write_ops += 1;
        Ok(())
    }

    async fn find_link(
        &self,
        case_id: &str,
        entity: EntityRef,
    ) -> Result<Option<LinkRow>, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.take_failure("case_party_links", StoreOp::Find) {
            return Err(err);
        }
        Ok(state
            .links
            .iter()
            .find(|l| l.case_id == case_id && l.entity == entity)
            .cloned())
    }

    async fn insert_link(&self, link: NewLink) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.take_failure("case_party_links", StoreOp::Insert) {
            return Err(err);
        }
        if state
            .links
            .iter()
            .any(|l| l.case_id == link.case_id && l.entity == link.entity)
        {
            return Err(StoreError::new(
                "case_party_links",
                StoreOp::Insert,
                StoreErrorKind::Conflict,
                format!("link for case {} already present", link.case_id),
            ));
        }
        let id = state.alloc_id();
        state.links.push(LinkRow {
            id,
            case_id: link.case_id,
            entity: link.entity,
            external_party_id: link.external_party_id,
            role_code: link.role_code,
            pole: link.pole,
            order_index: link.order_index,
            principal: link.principal,
            created_at: Utc::now(),
            raw: link.raw,
        });
        state.write_ops += 1;
        Ok(id)
    }

    async fn find_representative(
        &self,
        case_id: &str,
        owner: EntityRef,
        external_person_id: i64,
    ) -> Result<Option<RepresentativeRow>, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.take_failure("representatives", StoreOp::Find) {
            return Err(err);
        }
        Ok(state
            .representatives
            .iter()
            .find(|r| {
                r.case_id == case_id
                    && r.owner == owner
                    && r.external_person_id == external_person_id
            })
            .cloned())
    }

    async fn insert_representative(&self, rep: NewRepresentative) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.take_failure("representatives", StoreOp::Insert) {
            return Err(err);
        }
        if state.representatives.iter().any(|r| {
            r.case_id == rep.case_id
                && r.owner == rep.owner
                && r.external_person_id == rep.external_person_id
        }) {
            return Err(StoreError::new(
                "representatives",
                StoreOp::Insert,
                StoreErrorKind::Conflict,
                format!(
                    "representative with external person id {} already present",
                    rep.external_person_id
                ),
            ));
        }
        let id = state.alloc_id();
        let now = Utc::now();
        state.representatives.push(RepresentativeRow {
            id,
            external_person_id: rep.external_person_id,
            case_id: rep.case_id,
            owner: rep.owner,
            address_id: None,
            created_at: now,
            updated_at: now,
            fields: rep.fields,
        });
        state.write_ops += 1;
        Ok(id)
    }

    async fn update_representative(
        &self,
        id: i64,
        fields: RepresentativeFields,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.take_failure("representatives", StoreOp::Update) {
            return Err(err);
        }
        let row = state
            .representatives
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or_else(|| {
                StoreError::new(
                    "representatives",
                    StoreOp::Update,
                    StoreErrorKind::Missing,
                    format!("no representative row {id}"),
                )
            })?;
        row.fields = fields;
        row.updated_at = Utc::now();
        state.write_ops += 1;
        Ok(())
    }

    async fn set_representative_address(
        &self,
        id: i64,
        address_id: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.take_failure("representatives", StoreOp::Update) {
            return Err(err);
        }
        let row = state
            .representatives
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or_else(|| {
                StoreError::new(
                    "representatives",
                    StoreOp::Update,
                    StoreErrorKind::Missing,
                    format!("no representative row {id}"),
                )
            })?;
        if row.address_id == Some(address_id) {
            return Ok(());
        }
        row.address_id = Some(address_id);
        row.updated_at = Utc::now();
        state.write_ops += 1;
        Ok(())
    }

    async fn last_captured_at(
        &self,
        case_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.take_failure("capture_runs", StoreOp::Find) {
            return Err(err);
        }
        Ok(state.captured_cases.get(case_id).copied())
    }

    async fn mark_captured(&self, case_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.take_failure("capture_runs", StoreOp::Update) {
            return Err(err);
        }
        state.captured_cases.insert(case_id.to_string(), at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use serde_json::json;

    fn fields(name: &str) -> EntityFields {
        EntityFields {
            name: name.to_string(),
            tax_id_kind: lexcap_core::TaxIdKind::Individual,
            tax_id: Some("12345678900".into()),
            emails: vec![],
            phones: vec![],
        }
    }

    #[test]
    fn backoff_delay_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(350));
    }

    fn quick_policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn transient_failure_is_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<u32, StoreError> = with_retry(&quick_policy(3), true, || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 1 {
                    Err(StoreError::new(
                        "client_entities",
                        StoreOp::Insert,
                        StoreErrorKind::Unavailable,
                        "down",
                    ))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persistent_failure_uses_exactly_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), StoreError> = with_retry(&quick_policy(3), true, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::new(
                    "addresses",
                    StoreOp::Update,
                    StoreErrorKind::Timeout,
                    "slow",
                ))
            }
        })
        .await;
        assert_eq!(result.unwrap_err().kind, StoreErrorKind::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_failure_gets_one_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), StoreError> = with_retry(&quick_policy(5), true, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::new(
                    "case_party_links",
                    StoreOp::Insert,
                    StoreErrorKind::Conflict,
                    "duplicate",
                ))
            }
        })
        .await;
        assert_eq!(result.unwrap_err().kind, StoreErrorKind::Conflict);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_retry_gets_one_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), StoreError> = with_retry(&quick_policy(5), false, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::new(
                    "addresses",
                    StoreOp::Insert,
                    StoreErrorKind::Unavailable,
                    "down",
                ))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_entity_insert_is_a_conflict() {
        let store = MemoryStore::new();
        store
            .insert_entity(EntityKind::Client, 101, fields("Maria"), json!({}))
            .await
            .unwrap();
        let err = store
            .insert_entity(EntityKind::Client, 101, fields("Maria"), json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Conflict);
        assert_eq!(store.entity_count(EntityKind::Client).await, 1);

        // Same person id in a different relation is a distinct natural key.
        store
            .insert_entity(EntityKind::Opposing, 101, fields("Maria"), json!({}))
            .await
            .unwrap();
        assert_eq!(store.entity_count(EntityKind::Opposing).await, 1);
    }

    #[tokio::test]
    async fn entity_update_and_delete_round_trip() {
        let store = MemoryStore::new();
        let id = store
            .insert_entity(EntityKind::Third, 55, fields("Perito"), json!({}))
            .await
            .unwrap();
        store
            .update_entity(EntityKind::Third, id, fields("Perito Judicial"), json!({"prior": true}))
            .await
            .unwrap();
        let row = store.find_entity(EntityKind::Third, 55).await.unwrap().unwrap();
        assert_eq!(row.fields.name, "Perito Judicial");
        assert_eq!(row.audit, json!({"prior": true}));

        store.delete_entity(EntityKind::Third, id).await.unwrap();
        assert!(store.find_entity(EntityKind::Third, 55).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_link_is_a_conflict() {
        let store = MemoryStore::new();
        let entity = EntityRef {
            kind: EntityKind::Client,
            id: 1,
        };
        let link = NewLink {
            case_id: "CASE-1".into(),
            entity,
            external_party_id: "EXT-1".into(),
            role_code: "party".into(),
            pole: Pole::Active,
            order_index: 0,
            principal: true,
            raw: json!({}),
        };
        store.insert_link(link.clone()).await.unwrap();
        let err = store.insert_link(link).await.unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Conflict);
        assert_eq!(store.links().await.len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let store = MemoryStore::new();
        store
            .inject_failure(
                "client_entities",
                StoreOp::Insert,
                StoreErrorKind::Unavailable,
                2,
            )
            .await;

        for _ in 0..2 {
            let err = store
                .insert_entity(EntityKind::Client, 7, fields("Maria"), json!({}))
                .await
                .unwrap_err();
            assert_eq!(err.kind, StoreErrorKind::Unavailable);
        }
        // Plan exhausted; the third call succeeds.
        store
            .insert_entity(EntityKind::Client, 7, fields("Maria"), json!({}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn capture_timestamps_round_trip() {
        let store = MemoryStore::new();
        assert!(store.last_captured_at("CASE-1").await.unwrap().is_none());
        let at = Utc::now();
        store.mark_captured("CASE-1", at).await.unwrap();
        assert_eq!(store.last_captured_at("CASE-1").await.unwrap(), Some(at));
    }
}
