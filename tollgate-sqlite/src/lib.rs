//! SQLite request store for tollgate.
//!
//! [`SqliteRequestStore`] implements [`tollgate_core::store::RequestStore`]
//! on a local database file, so pending human interactions outlive the
//! process that created them.

mod store;

pub use store::SqliteRequestStore;
