//! Subselect collection loading.
//!
//! When owners are loaded as a group (a batched identity lookup or one list
//! query), the predicate that selected them is remembered in a
//! [`SubselectDescriptor`]. The first access to a subselect-fetched
//! collection of any owner replays that predicate:
//!
//! `SELECT *, <fk> AS __owner_pk FROM <child> WHERE <fk> IN (SELECT <pk> FROM <owner> WHERE <criteria>)`
//!
//! and distributes the rows to every owner in the group.

use crate::identity_map::ObjectKey;
use batchfetch_core::{Dialect, Value};
use std::collections::{HashMap, HashSet};

/// Column alias carrying the owner key in collection rows.
pub const OWNER_PK_ALIAS: &str = "__owner_pk";

/// Stored criteria that produced an owner group.
#[derive(Debug, Clone)]
pub struct SubselectDescriptor {
    owner_table: &'static str,
    owner_pk_column: &'static str,
    criteria_sql: Option<String>,
    params: Vec<Value>,
    owners: Vec<Value>,
    completed_roles: HashSet<&'static str>,
}

impl SubselectDescriptor {
    /// Describe an owner group.
    ///
    /// `criteria_sql` is the rendered predicate with placeholders numbered
    /// from 1, bound by `params`.
    pub fn new(
        owner_table: &'static str,
        owner_pk_column: &'static str,
        criteria_sql: Option<String>,
        params: Vec<Value>,
        owners: Vec<Value>,
    ) -> Self {
        Self {
            owner_table,
            owner_pk_column,
            criteria_sql,
            params,
            owners,
            completed_roles: HashSet::new(),
        }
    }

    /// Primary keys of the owners in the group, in load order.
    pub fn owners(&self) -> &[Value] {
        &self.owners
    }

    /// Parameters bound by the stored predicate.
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn is_role_completed(&self, role: &str) -> bool {
        self.completed_roles.contains(role)
    }

    /// Render the collection fetch for one role.
    pub fn collection_sql(&self, dialect: Dialect, child_table: &str, fk_column: &str) -> String {
        let fk = dialect.quote_identifier(fk_column);
        let mut owner_select = format!(
            "SELECT {} FROM {}",
            dialect.quote_identifier(self.owner_pk_column),
            dialect.quote_identifier(self.owner_table)
        );
        if let Some(criteria) = &self.criteria_sql {
            owner_select.push_str(" WHERE ");
            owner_select.push_str(criteria);
        }
        format!(
            "SELECT *, {fk} AS {OWNER_PK_ALIAS} FROM {} WHERE {fk} IN ({owner_select})",
            dialect.quote_identifier(child_table)
        )
    }
}

/// Live descriptors, indexed by owner identity.
///
/// Storage is scoped to the session. A descriptor is dropped as soon as
/// every subselect role has been fetched for it, or when every one of its
/// owners has moved to a newer descriptor.
#[derive(Debug, Default)]
pub struct SubselectRegistry {
    descriptors: HashMap<usize, SubselectDescriptor>,
    by_owner: HashMap<ObjectKey, usize>,
    next_index: usize,
}

impl SubselectRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a descriptor for the owners identified by `owner_keys`.
    ///
    /// An owner already attached to an older descriptor moves to the new one.
    /// An older descriptor left without owners is discarded.
    pub fn record(&mut self, descriptor: SubselectDescriptor, owner_keys: &[ObjectKey]) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        self.descriptors.insert(index, descriptor);

        let mut superseded = HashSet::new();
        for key in owner_keys {
            if let Some(previous) = self.by_owner.insert(*key, index) {
                if previous != index {
                    superseded.insert(previous);
                }
            }
        }
        for previous in superseded {
            if !self.by_owner.values().any(|i| *i == previous) {
                self.descriptors.remove(&previous);
                tracing::trace!(index = previous, "Superseded subselect descriptor dropped");
            }
        }
        index
    }

    /// The live descriptor covering an owner.
    pub fn descriptor_for(&self, owner: &ObjectKey) -> Option<(usize, &SubselectDescriptor)> {
        let index = *self.by_owner.get(owner)?;
        self.descriptors.get(&index).map(|d| (index, d))
    }

    /// Mark `role` fetched for a descriptor.
    ///
    /// Once `subselect_roles` roles are done the descriptor is discarded.
    /// Returns `true` on discard.
    pub fn complete_role(&mut self, index: usize, role: &'static str, subselect_roles: usize) -> bool {
        let Some(descriptor) = self.descriptors.get_mut(&index) else {
            return false;
        };
        descriptor.completed_roles.insert(role);
        if descriptor.completed_roles.len() < subselect_roles {
            return false;
        }
        self.descriptors.remove(&index);
        self.by_owner.retain(|_, i| *i != index);
        true
    }

    /// Mark `role` fetched on every live descriptor of `owner_table` whose
    /// owners all satisfy `loaded`.
    ///
    /// Another statement may have filled every collection a descriptor would
    /// fetch. Returns the number of descriptors discarded.
    pub fn complete_role_where(
        &mut self,
        owner_table: &str,
        role: &'static str,
        subselect_roles: usize,
        mut loaded: impl FnMut(&Value) -> bool,
    ) -> usize {
        let ready: Vec<usize> = self
            .descriptors
            .iter()
            .filter(|(_, d)| {
                d.owner_table == owner_table
                    && !d.is_role_completed(role)
                    && d.owners.iter().all(&mut loaded)
            })
            .map(|(index, _)| *index)
            .collect();
        ready
            .into_iter()
            .filter(|index| self.complete_role(*index, role, subselect_roles))
            .count()
    }

    /// Number of live descriptors.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn clear(&mut self) {
        self.descriptors.clear();
        self.by_owner.clear();
    }
}

/// Render the per-owner collection fetch for `count` owner keys.
pub fn owner_batch_sql(dialect: Dialect, child_table: &str, fk_column: &str, count: usize) -> String {
    let fk = dialect.quote_identifier(fk_column);
    let placeholders: Vec<String> = (1..=count).map(|i| dialect.placeholder(i)).collect();
    format!(
        "SELECT *, {fk} AS {OWNER_PK_ALIAS} FROM {} WHERE {fk} IN ({})",
        dialect.quote_identifier(child_table),
        placeholders.join(", ")
    )
}
