//! Core types and traits for batchfetch.
//!
//! This crate provides the mapping layer the session builds on:
//!
//! - `Model` trait carrying table, key, batch size and collection metadata
//! - `LazyCollection` placeholders and typed `CollectionRole` handles
//! - `Connection` trait for executing statements
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod collection;
pub mod connection;
pub mod error;
pub mod model;
pub mod row;
pub mod value;

pub use collection::{CollectionInfo, CollectionRole, FetchMode, LazyCollection};
pub use connection::{Connection, Dialect};
pub use error::{
    ConnectionError, ConnectionErrorKind, Error, NotFoundError, QueryError, QueryErrorKind,
    Result, SessionError, SessionErrorKind, TypeError,
};
pub use model::{Model, ModelRef};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
