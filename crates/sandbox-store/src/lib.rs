//! Append-only audit store: a single SQLite file recording every run,
//! tool call, and tool result, per spec §4.2 and §6.

mod db;
mod error;
mod store;

pub use error::{StoreError, StoreResult};
pub use store::{default_store_path, AuditStore};
