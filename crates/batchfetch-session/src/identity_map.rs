//! Identity Map: the session's persistence context.
//!
//! The map guarantees that each database row corresponds to exactly one
//! in-memory instance within a session. Proxies, batch fetches and
//! collection loads all resolve through it, so an entity reached by two
//! different paths is the same `Arc`.
//!
//! # Example
//!
//! ```ignore
//! let mut map = IdentityMap::new();
//!
//! let first = map.register(group);
//! let second = map.register(reloaded_group); // same PK, dropped
//!
//! assert!(Arc::ptr_eq(&first, &second));
//! ```

use batchfetch_core::{Model, ModelRef, Value};
use indexmap::IndexMap;
use std::any::{Any, TypeId};
use std::sync::{Arc, RwLock, RwLockReadGuard};

/// Hash a slice of values for use as a primary key hash.
pub(crate) fn hash_values(values: &[Value]) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::Hasher;

    let mut hasher = DefaultHasher::new();
    for v in values {
        v.hash_into(&mut hasher);
    }
    hasher.finish()
}

fn same_pk(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_key(y))
}

/// Unique key for an object in the identity map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Type identifier for the Model type.
    type_id: TypeId,
    /// Hash of the primary key value(s).
    pk_hash: u64,
}

impl ObjectKey {
    /// Create an object key from a model instance.
    pub fn from_model<M: Model>(obj: &M) -> Self {
        Self::from_pk::<M>(&obj.primary_key_value())
    }

    /// Create an object key from type and primary key.
    pub fn from_pk<M: Model>(pk: &[Value]) -> Self {
        Self {
            type_id: TypeId::of::<M>(),
            pk_hash: hash_values(pk),
        }
    }

    /// Get the primary key hash.
    pub fn pk_hash(&self) -> u64 {
        self.pk_hash
    }

    /// Get the type identifier.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }
}

/// A type-erased entry. `arc` actually stores `Arc<RwLock<M>>` for some M.
struct IdentityEntry {
    arc: Box<dyn Any + Send + Sync>,
    pk_values: Vec<Value>,
}

/// Identity Map for tracking unique object instances.
///
/// Keyed by [`ObjectKey`] so each model type has its own namespace.
/// Entries whose key hashes collide share a bucket and are told apart by
/// primary key. Iteration follows insertion order.
#[derive(Default)]
pub struct IdentityMap {
    entries: IndexMap<ObjectKey, Vec<IdentityEntry>>,
    len: usize,
}

impl IdentityMap {
    /// Create a new empty identity map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly hydrated instance.
    ///
    /// If an instance with the same PK is already tracked it stays
    /// authoritative and `model` is dropped. Returns the tracked instance.
    pub fn register<M: Model>(&mut self, model: M) -> ModelRef<M> {
        let pk_values = model.primary_key_value();
        let key = ObjectKey::from_pk::<M>(&pk_values);
        self.register_keyed(key, pk_values, model)
    }

    fn register_keyed<M: Model>(&mut self, key: ObjectKey, pk_values: Vec<Value>, model: M) -> ModelRef<M> {
        if let Some(existing) = self.find::<M>(&key, &pk_values) {
            tracing::trace!(
                model = M::TABLE_NAME,
                pk = ?pk_values,
                "Identity already tracked; keeping existing instance"
            );
            return existing;
        }

        let arc: ModelRef<M> = Arc::new(RwLock::new(model));
        self.entries.entry(key).or_default().push(IdentityEntry {
            arc: Box::new(Arc::clone(&arc)),
            pk_values,
        });
        self.len += 1;
        arc
    }

    fn entry(&self, key: &ObjectKey, pk_values: &[Value]) -> Option<&IdentityEntry> {
        self.entries
            .get(key)?
            .iter()
            .find(|entry| same_pk(&entry.pk_values, pk_values))
    }

    fn find<M: Model>(&self, key: &ObjectKey, pk_values: &[Value]) -> Option<ModelRef<M>> {
        self.entry(key, pk_values)?
            .arc
            .downcast_ref::<ModelRef<M>>()
            .map(Arc::clone)
    }

    /// Get the tracked instance for a primary key.
    pub fn lookup<M: Model>(&self, pk_values: &[Value]) -> Option<ModelRef<M>> {
        self.find::<M>(&ObjectKey::from_pk::<M>(pk_values), pk_values)
    }

    /// Check if an instance with the given PK is tracked.
    pub fn contains<M: Model>(&self, pk_values: &[Value]) -> bool {
        self.entry(&ObjectKey::from_pk::<M>(pk_values), pk_values)
            .is_some()
    }

    /// Stop tracking an instance. Returns `true` if it was tracked.
    pub fn remove<M: Model>(&mut self, pk_values: &[Value]) -> bool {
        let key = ObjectKey::from_pk::<M>(pk_values);
        let Some(bucket) = self.entries.get_mut(&key) else {
            return false;
        };
        let Some(position) = bucket
            .iter()
            .position(|entry| same_pk(&entry.pk_values, pk_values))
        else {
            return false;
        };
        bucket.remove(position);
        if bucket.is_empty() {
            self.entries.shift_remove(&key);
        }
        self.len -= 1;
        true
    }

    /// Every tracked instance of `M`, in insertion order.
    pub fn instances_of<M: Model>(&self) -> Vec<ModelRef<M>> {
        let type_id = TypeId::of::<M>();
        self.entries
            .iter()
            .filter(|(key, _)| ObjectKey::type_id(key) == type_id)
            .flat_map(|(_, bucket)| bucket)
            .filter_map(|entry| entry.arc.downcast_ref::<ModelRef<M>>().map(Arc::clone))
            .collect()
    }

    /// Clear all entries from the identity map.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.len = 0;
    }

    /// Get the number of entries in the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityMap")
            .field("len", &self.len)
            .finish()
    }
}

/// A guard for reading an object from the identity map.
pub type ModelReadGuard<'a, M> = RwLockReadGuard<'a, M>;

/// Read a tracked instance, recovering the guard if a writer panicked.
pub fn read_model<M>(model: &ModelRef<M>) -> ModelReadGuard<'_, M> {
    model
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
