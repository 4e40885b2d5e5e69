//! batchfetch - deferred entity proxies and batch fetching for SQL sessions.
//!
//! batchfetch keeps the number of statements a session issues independent of
//! the order in which callers touch lazily-loaded data:
//!
//! - Proxies created together are fetched with one `IN (...)` lookup
//! - Collections of an owner group are fetched with one subselect that
//!   replays the query which loaded the owners
//! - An identity map guarantees one instance per primary key
//! - Statistics count every prepared statement
//!
//! # Quick Start
//!
//! ```ignore
//! use batchfetch::prelude::*;
//!
//! fn employees(group: &EmployeeGroup) -> &LazyCollection<Employee> {
//!     &group.employees
//! }
//! const EMPLOYEES: CollectionRole<EmployeeGroup, Employee> =
//!     CollectionRole::new("employees", employees);
//!
//! async fn example(cx: &Cx, conn: impl Connection) {
//!     let factory = SessionFactory::new(SessionConfig::default().with_statistics(true));
//!     let mut session = factory.open_session(conn);
//!
//!     let groups = session.load_many::<EmployeeGroup, _>([1_i64, 2]).unwrap();
//!     let first = session.access(cx, &groups[0]).await;        // 1 statement
//!     let staff = session.collection(cx, &groups[1], EMPLOYEES).await; // 1 statement
//!
//!     assert_eq!(factory.statistics().prepare_count(), 2);
//! }
//! ```

// Re-export all public types from sub-crates
pub use batchfetch_core::{
    CollectionInfo, CollectionRole, ColumnInfo, Connection, ConnectionError, ConnectionErrorKind,
    Cx, Dialect, Error, FetchMode, FromValue, LazyCollection, Model, ModelRef, NotFoundError,
    Outcome, QueryError, QueryErrorKind, Result, Row, SessionError, SessionErrorKind, TypeError,
    Value,
};

pub use batchfetch_session::{
    BatchCohort, CohortArena, CohortId, Criteria, IdentityMap, ModelReadGuard, ObjectKey, Proxy,
    ProxyId, ProxyRegistry, ProxyState, Session, SessionConfig, SessionFactory, Statistics,
    StatisticsSnapshot, SubselectDescriptor, SubselectRegistry, read_model,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use batchfetch::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        CollectionInfo, CollectionRole, Connection, Criteria, Cx, Dialect, Error, FetchMode,
        LazyCollection, Model, ModelRef, Outcome, Proxy, Result, Row, Session, SessionConfig,
        SessionFactory, Statistics, Value, read_model,
    };
}
