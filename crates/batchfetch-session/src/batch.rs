//! Batch load scheduling for proxies.
//!
//! Proxies created by the same loading episode form a [`BatchCohort`].
//! When one member is first accessed, the cohort is partitioned into
//! ordered chunks of at most `batch_size` members and the chunk holding the
//! triggering proxy is fetched with a single identity lookup:
//!
//! `SELECT * FROM <table> WHERE <pk> IN (...)`
//!
//! Other chunks stay pending until one of their own members is accessed.

use crate::proxy::ProxyId;
use batchfetch_core::Dialect;
use std::any::TypeId;
use std::collections::HashMap;

/// Arena handle of a cohort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CohortId(usize);

/// Ordered set of sibling proxies of one kind.
#[derive(Debug)]
pub struct BatchCohort {
    entity: &'static str,
    members: Vec<ProxyId>,
    batch_size: usize,
    sealed: bool,
}

impl BatchCohort {
    /// Table of the member kind.
    pub fn entity(&self) -> &'static str {
        self.entity
    }

    /// Members in creation order.
    pub fn members(&self) -> &[ProxyId] {
        &self.members
    }

    /// Upper bound on members per statement.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// A sealed cohort accepts no new members.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The chunk that `member` falls into.
    pub fn chunk_containing(&self, member: ProxyId) -> Option<&[ProxyId]> {
        let position = self.members.iter().position(|m| *m == member)?;
        let start = position / self.batch_size * self.batch_size;
        let end = (start + self.batch_size).min(self.members.len());
        Some(&self.members[start..end])
    }
}

/// Arena of cohorts, plus the currently open cohort per kind.
///
/// Storage is scoped to the session. The session releases a cohort once
/// every member is settled; `clear` drops the rest.
#[derive(Debug, Default)]
pub struct CohortArena {
    cohorts: HashMap<CohortId, BatchCohort>,
    open_by_kind: HashMap<TypeId, CohortId>,
    next_id: usize,
}

impl CohortArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new cohort that is never joined by later `load` calls.
    pub fn create(&mut self, entity: &'static str, batch_size: usize) -> CohortId {
        let id = CohortId(self.next_id);
        self.next_id += 1;
        self.cohorts.insert(
            id,
            BatchCohort {
                entity,
                members: Vec::new(),
                batch_size: batch_size.max(1),
                sealed: false,
            },
        );
        id
    }

    /// The open cohort for `kind`, created if there is none.
    pub fn join_open(&mut self, kind: TypeId, entity: &'static str, batch_size: usize) -> CohortId {
        if let Some(&id) = self.open_by_kind.get(&kind) {
            if self.cohorts.get(&id).is_some_and(|c| !c.sealed) {
                return id;
            }
        }
        let id = self.create(entity, batch_size);
        self.open_by_kind.insert(kind, id);
        id
    }

    /// Append a member. Sealed cohorts ignore the call.
    pub fn push_member(&mut self, id: CohortId, member: ProxyId) {
        if let Some(cohort) = self.cohorts.get_mut(&id) {
            if !cohort.sealed {
                cohort.members.push(member);
            }
        }
    }

    /// Close the cohort to new members.
    pub fn seal(&mut self, id: CohortId) {
        if let Some(cohort) = self.cohorts.get_mut(&id) {
            cohort.sealed = true;
        }
        self.open_by_kind.retain(|_, open| *open != id);
    }

    /// Drop a cohort. Its members fall back to loading alone.
    pub fn release(&mut self, id: CohortId) -> Option<BatchCohort> {
        self.open_by_kind.retain(|_, open| *open != id);
        self.cohorts.remove(&id)
    }

    pub fn get(&self, id: CohortId) -> Option<&BatchCohort> {
        self.cohorts.get(&id)
    }

    pub fn clear(&mut self) {
        self.cohorts.clear();
        self.open_by_kind.clear();
    }

    pub fn len(&self) -> usize {
        self.cohorts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cohorts.is_empty()
    }
}

/// Render the identity-batch lookup for `count` keys.
pub fn identity_batch_sql(dialect: Dialect, table: &str, pk_column: &str, count: usize) -> String {
    let placeholders: Vec<String> = (1..=count).map(|i| dialect.placeholder(i)).collect();
    format!(
        "SELECT * FROM {} WHERE {} IN ({})",
        dialect.quote_identifier(table),
        dialect.quote_identifier(pk_column),
        placeholders.join(", ")
    )
}
