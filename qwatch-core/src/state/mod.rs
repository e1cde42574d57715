pub mod backend;
pub mod error;
pub mod models;
pub mod store;

pub use backend::{KeyValueBackend, MemoryBackend, SqliteBackend, SqliteBackendBuilder};
pub use error::{StoreError, StoreResult};
pub use models::{AlertState, StateKey};
pub use store::{StateStore, StoredAlert};
