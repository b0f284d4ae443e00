//! Database module: row models and SQL repositories.
//!
//! - `model`: insert payloads, filters and view rows exchanged with repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! Callers import from `relationship_engine::db`; the repository API is
//! re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{
    LogEntry, LoggedAction, NewTask, NewTemplate, PriorTask, SortDir, SortKey, TaskFilter, TaskPageRows, TaskSlice,
};
