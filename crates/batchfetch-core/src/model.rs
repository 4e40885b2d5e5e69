//! Model trait for ORM-style struct mapping.
//!
//! The `Model` trait is the mapping metadata the session consumes: table
//! and key names, the batch size used when proxies of the model are
//! fetched together, and the collection roles the model owns.

use crate::Result;
use crate::collection::{CollectionInfo, FetchMode};
use crate::row::Row;
use crate::value::Value;
use std::sync::{Arc, RwLock};

/// Shared handle to the authoritative instance held by a session.
pub type ModelRef<M> = Arc<RwLock<M>>;

/// Trait for types that can be mapped to database tables.
///
/// # Example
///
/// ```ignore
/// struct EmployeeGroup {
///     id: i64,
///     employees: LazyCollection<Employee>,
/// }
///
/// impl Model for EmployeeGroup {
///     const TABLE_NAME: &'static str = "employee_group";
///     const PRIMARY_KEY: &'static [&'static str] = &["id"];
///     const BATCH_SIZE: usize = 1000;
///     const COLLECTIONS: &'static [CollectionInfo] = &[
///         CollectionInfo::new("employees", "employee", "group_id").fetch(FetchMode::Subselect),
///     ];
///     // ...
/// }
/// ```
pub trait Model: Sized + Send + Sync + 'static {
    /// The name of the database table.
    const TABLE_NAME: &'static str;

    /// The primary key column name(s).
    const PRIMARY_KEY: &'static [&'static str];

    /// Maximum number of proxies of this model fetched by one statement.
    ///
    /// `1` defers to the session's `default_batch_fetch_size`.
    const BATCH_SIZE: usize = 1;

    /// Lazily-loaded collections owned by this model.
    const COLLECTIONS: &'static [CollectionInfo] = &[];

    /// Convert this model instance to a row of values.
    fn to_row(&self) -> Vec<(&'static str, Value)>;

    /// Construct a model instance from a database row.
    #[allow(clippy::result_large_err)]
    fn from_row(row: &Row) -> Result<Self>;

    /// Get the value of the primary key field(s).
    fn primary_key_value(&self) -> Vec<Value>;

    /// Look up a collection role by name.
    fn collection_info(name: &str) -> Option<&'static CollectionInfo> {
        Self::COLLECTIONS.iter().find(|info| info.name == name)
    }

    /// Whether any collection of this model is fetched by subselect.
    fn has_subselect_collections() -> bool {
        Self::COLLECTIONS
            .iter()
            .any(|info| info.fetch == FetchMode::Subselect)
    }
}
