//! Persistence layer — tenants, task documents, and uploaded blobs.

pub mod blob;
pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod patch;
pub mod traits;

pub use blob::{BlobRef, BlobStore, LocalBlobStore};
pub use libsql_backend::LibSqlBackend;
pub use memory::MemoryBackend;
pub use patch::TaskPatch;
pub use traits::Database;
