//! Collection role metadata and the lazy collection placeholder.
//!
//! An owner model stores one [`LazyCollection`] per collection role. The
//! placeholder starts uninitialized and is filled exactly once by the
//! session, using the role's [`FetchMode`] to decide how many owners share
//! the statement.

use crate::model::{Model, ModelRef};
use std::fmt;
use std::sync::OnceLock;

/// How a collection role is fetched on first access.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchMode {
    /// One statement per owner.
    #[default]
    Select,
    /// One `IN (...)` statement for up to `batch_size` pending owners.
    Batch,
    /// Replay the criteria that loaded the owners as a subselect.
    Subselect,
}

/// Static metadata about a one-to-many collection role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionInfo {
    /// Role name (the owner's field name).
    pub name: &'static str,

    /// Table holding the collection elements.
    pub child_table: &'static str,

    /// Column on the child table pointing back at the owner's primary key.
    pub fk_column: &'static str,

    /// Fetch strategy.
    pub fetch: FetchMode,

    /// Upper bound on owners per statement for [`FetchMode::Batch`].
    pub batch_size: usize,
}

impl CollectionInfo {
    /// Create a role that is fetched per owner.
    #[must_use]
    pub const fn new(
        name: &'static str,
        child_table: &'static str,
        fk_column: &'static str,
    ) -> Self {
        Self {
            name,
            child_table,
            fk_column,
            fetch: FetchMode::Select,
            batch_size: 1,
        }
    }

    /// Set the fetch strategy.
    #[must_use]
    pub const fn fetch(mut self, fetch: FetchMode) -> Self {
        self.fetch = fetch;
        self
    }

    /// Set the batch size and switch to [`FetchMode::Batch`].
    #[must_use]
    pub const fn batch_size(mut self, size: usize) -> Self {
        self.fetch = FetchMode::Batch;
        self.batch_size = if size == 0 { 1 } else { size };
        self
    }
}

/// Typed handle to one collection role of owner `P` with elements `C`.
///
/// Pairs the role name (resolved against `P::COLLECTIONS`) with an accessor
/// that reaches the placeholder inside an owner instance.
///
/// ```ignore
/// fn employees(group: &EmployeeGroup) -> &LazyCollection<Employee> {
///     &group.employees
/// }
///
/// const EMPLOYEES: CollectionRole<EmployeeGroup, Employee> =
///     CollectionRole::new("employees", employees);
/// ```
pub struct CollectionRole<P, C> {
    name: &'static str,
    accessor: fn(&P) -> &LazyCollection<C>,
}

impl<P, C> CollectionRole<P, C> {
    #[must_use]
    pub const fn new(name: &'static str, accessor: fn(&P) -> &LazyCollection<C>) -> Self {
        Self { name, accessor }
    }

    /// Role name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Reach the placeholder inside `owner`.
    pub fn of<'a>(&self, owner: &'a P) -> &'a LazyCollection<C> {
        (self.accessor)(owner)
    }
}

impl<P: Model, C> CollectionRole<P, C> {
    /// Resolve the static metadata for this role.
    pub fn info(&self) -> Option<&'static CollectionInfo> {
        P::collection_info(self.name)
    }
}

impl<P, C> Clone for CollectionRole<P, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P, C> Copy for CollectionRole<P, C> {}

impl<P, C> fmt::Debug for CollectionRole<P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionRole")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A lazily-initialized one-to-many collection.
///
/// States:
/// - **Uninitialized**: not fetched yet
/// - **Initialized**: elements fetched and cached (possibly empty)
///
/// Elements are the session's shared instances, so an element reached
/// through two owners is the same `ModelRef`.
pub struct LazyCollection<T> {
    loaded: OnceLock<Vec<ModelRef<T>>>,
}

impl<T> LazyCollection<T> {
    /// Create an uninitialized collection.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            loaded: OnceLock::new(),
        }
    }

    /// Create an already-initialized collection.
    #[must_use]
    pub fn loaded(items: Vec<ModelRef<T>>) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(items);
        Self { loaded: cell }
    }

    /// Check if the collection has been initialized. Never triggers a load.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.loaded.get().is_some()
    }

    /// Get the elements (None if not initialized).
    #[must_use]
    pub fn get(&self) -> Option<&[ModelRef<T>]> {
        self.loaded.get().map(Vec::as_slice)
    }

    /// Number of elements (0 if not initialized).
    #[must_use]
    pub fn len(&self) -> usize {
        self.loaded.get().map_or(0, Vec::len)
    }

    /// True if not initialized or initialized empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.loaded.get().is_none_or(Vec::is_empty)
    }

    /// Iterate over the elements.
    pub fn iter(&self) -> impl Iterator<Item = &ModelRef<T>> {
        self.loaded.get().map_or([].iter(), |v| v.iter())
    }

    /// Set the elements (internal use by the session).
    ///
    /// Returns `Err` with the rejected items if already initialized.
    pub fn set_loaded(&self, items: Vec<ModelRef<T>>) -> Result<(), Vec<ModelRef<T>>> {
        self.loaded.set(items)
    }
}

impl<T> Default for LazyCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for LazyCollection<T> {
    fn clone(&self) -> Self {
        match self.loaded.get() {
            Some(items) => Self::loaded(items.clone()),
            None => Self::new(),
        }
    }
}

impl<T> fmt::Debug for LazyCollection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_initialized() {
            "initialized"
        } else {
            "uninitialized"
        };
        f.debug_struct("LazyCollection")
            .field("state", &state)
            .field("len", &self.len())
            .finish()
    }
}

impl<'a, T> IntoIterator for &'a LazyCollection<T> {
    type Item = &'a ModelRef<T>;
    type IntoIter = std::slice::Iter<'a, ModelRef<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.loaded.get().map_or([].iter(), |v| v.iter())
    }
}
