//! Projection storage.
//!
//! The user service keeps a local copy of every identity announced by the
//! auth service. Writes are conditional on the fact's timestamp so that
//! re-applied and reordered facts converge on the newest one.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::{StorageConfig, StorageType};

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryUserRepository;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteUserRepository;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors from the projection store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Local projection of an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    pub display_name: String,
    /// When the identity was created, as announced.
    pub created_at: DateTime<Utc>,
    /// When the fact currently applied occurred.
    pub updated_at: DateTime<Utc>,
    /// `occurredAt` of the fact currently applied, in epoch milliseconds.
    pub source_version: i64,
}

/// Outcome of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// No record existed.
    Created,
    /// An existing record was overwritten by a fact at least as new.
    Updated,
    /// The stored record already holds exactly this fact; nothing was written.
    Unchanged,
    /// The stored record came from a newer fact; nothing was written.
    Stale,
}

impl Applied {
    /// Whether the write changed stored state.
    pub fn wrote(self) -> bool {
        matches!(self, Applied::Created | Applied::Updated)
    }
}

/// Decide what writing `incoming` over `stored` does.
///
/// Last write wins by `source_version`. An equal version with different
/// fields overwrites; an identical record is left alone.
pub fn classify(stored: Option<&UserRecord>, incoming: &UserRecord) -> Applied {
    match stored {
        None => Applied::Created,
        Some(stored) if stored.source_version > incoming.source_version => Applied::Stale,
        Some(stored) if stored == incoming => Applied::Unchanged,
        Some(_) => Applied::Updated,
    }
}

/// Store of projected user records.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Write `record` as decided by [`classify`] against the stored record,
    /// atomically per identity.
    async fn upsert_if_newer(&self, record: &UserRecord) -> Result<Applied>;

    async fn get_by_id(&self, id: &str) -> Result<Option<UserRecord>>;

    /// All records, newest `created_at` first.
    async fn list(&self) -> Result<Vec<UserRecord>>;
}

/// Initialize storage based on configuration.
pub async fn init_storage(
    config: &StorageConfig,
) -> std::result::Result<Arc<dyn UserRepository>, Box<dyn std::error::Error>> {
    info!(storage = %config.storage_type, path = %config.path, "Initializing storage");

    match config.storage_type {
        StorageType::Memory => Ok(Arc::new(MemoryUserRepository::new())),
        #[cfg(feature = "sqlite")]
        StorageType::Sqlite => {
            if let Some(parent) = std::path::Path::new(&config.path).parent() {
                std::fs::create_dir_all(parent)?;
            }

            let pool = sqlite::connect(&config.path).await?;

            let repository = SqliteUserRepository::new(pool);
            repository.init().await?;

            Ok(Arc::new(repository))
        }
        #[cfg(not(feature = "sqlite"))]
        StorageType::Sqlite => {
            tracing::error!("SQLite storage requested but 'sqlite' feature is not enabled");
            Err("SQLite feature not enabled".into())
        }
    }
}
