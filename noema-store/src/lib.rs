//! Typed persistence layer (§4.A): one `Store` trait, an in-memory implementation for tests
//! and tooling, and a SQLite-backed implementation for everything else.

pub mod error;
pub mod filter;
pub mod in_memory;
pub mod sqlite;
pub mod traits;

pub use error::StoreError;
pub use filter::{GenerationFilter, GenerationPatch, WorkerControl, EXPORT_WORKER_NAME};
pub use in_memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{NewUserHints, Store};
