//! In-memory user repository.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{classify, Applied, Result, StorageError, UserRecord, UserRepository};

/// Process-local projection store. Supports failure injection for tests.
#[derive(Default)]
pub struct MemoryUserRepository {
    users: RwLock<HashMap<String, UserRecord>>,
    fail_on_upsert: AtomicBool,
}

impl MemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with [`StorageError::Unavailable`].
    pub fn set_fail_on_upsert(&self, fail: bool) {
        self.fail_on_upsert.store(fail, Ordering::Release);
    }

    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.users.read().await.is_empty()
    }
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn upsert_if_newer(&self, record: &UserRecord) -> Result<Applied> {
        if self.fail_on_upsert.load(Ordering::Acquire) {
            return Err(StorageError::Unavailable(
                "Simulated storage outage".to_string(),
            ));
        }

        let mut users = self.users.write().await;
        let applied = classify(users.get(&record.id), record);
        if applied.wrote() {
            users.insert(record.id.clone(), record.clone());
        }
        Ok(applied)
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<UserRecord>> {
        Ok(self.users.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<UserRecord>> {
        let mut records: Vec<UserRecord> = self.users.read().await.values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }
}
