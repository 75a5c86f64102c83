//! Storage tiers and the coordinator that fans messages out across them.
//!
//! - [`DurableLog`]: append-only per-session log with KV state (priority 1)
//! - [`ArchiveStore`]: relational archive of sessions and messages (priority 2)
//! - the memory pipeline registers itself as priority 3 (see `crate::memory`)
//! - [`StorageCoordinator`]: batched, priority-ordered fan-out

mod archive;
mod archive_sqlite;
mod coordinator;
mod log;

pub use archive::{ArchiveError, ArchiveStore, ArchivedMessage, InMemoryArchive, SessionRecord};
pub use archive_sqlite::SqliteArchive;
pub use coordinator::{
    ArchiveLayer, CoordinatorError, CoordinatorMetrics, DurableLogLayer, LayerError, LayerMetrics,
    StorageCoordinator, StorageLayer,
};
pub use log::{DurableLog, InMemoryDurableLog, LogError, LogRecord};
