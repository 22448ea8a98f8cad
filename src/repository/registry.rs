// repository/registry.rs
//
// Owns the live repositories. Registration selects the variant from the
// stored record and composes the immutability wrapper when enabled.

use log::info;
use parking_lot::RwLock;
use sqlx::{MySql, Pool};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{BackingStore, ImmutableRepository, MountManager, Repository, RepositoryError};
use crate::db::queries;
use crate::db::tables::{BackupDisk, RepositoryRecord};

pub struct RepositoryRegistry {
    repositories: RwLock<HashMap<String, Arc<dyn Repository>>>,
    pool: Pool<MySql>,
    mounts: Arc<MountManager>,
    setup_timeout: Duration,
    teardown_timeout: Duration,
}

impl RepositoryRegistry {
    pub fn new(pool: Pool<MySql>, setup_timeout: Duration, teardown_timeout: Duration) -> Self {
        Self {
            repositories: RwLock::new(HashMap::new()),
            pool,
            mounts: Arc::new(MountManager::new(setup_timeout, teardown_timeout)),
            setup_timeout,
            teardown_timeout,
        }
    }

    /// Build the live repository for a record and track it.
    pub fn register(&self, record: RepositoryRecord) -> Arc<dyn Repository> {
        let id = record.id.clone();
        let immutability = record.immutability_enabled;
        let retention = record.min_retention_days as i64;

        let store: Arc<dyn Repository> = Arc::new(BackingStore::new(
            record,
            self.pool.clone(),
            self.setup_timeout,
            Arc::clone(&self.mounts),
        ));

        let repo: Arc<dyn Repository> = if immutability {
            Arc::new(ImmutableRepository::new(store, retention, self.teardown_timeout))
        } else {
            store
        };

        self.repositories.write().insert(id.clone(), Arc::clone(&repo));
        info!("registered repository {} (immutable: {})", id, immutability);
        repo
    }

    pub fn unregister(&self, repository_id: &str) {
        self.repositories.write().remove(repository_id);
    }

    pub fn get(&self, repository_id: &str) -> Option<Arc<dyn Repository>> {
        self.repositories.read().get(repository_id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<dyn Repository>> {
        self.repositories.read().values().cloned().collect()
    }

    /// Load every stored repository record into the registry (startup).
    pub async fn load_all(&self) -> Result<usize, RepositoryError> {
        let records = queries::repository::list_repositories(&self.pool).await?;
        let count = records.len();
        for record in records {
            self.register(record);
        }
        Ok(count)
    }

    /// Resolve a backup disk by ID across every registered store.
    pub async fn resolve_backup(
        &self,
        backup_disk_id: &str,
    ) -> Result<Option<(Arc<dyn Repository>, BackupDisk)>, RepositoryError> {
        let repositories = self.list();
        for repo in repositories {
            if let Some(disk) = repo.get_backup(backup_disk_id).await? {
                return Ok(Some((repo, disk)));
            }
        }
        Ok(None)
    }

    pub fn mounts(&self) -> Arc<MountManager> {
        Arc::clone(&self.mounts)
    }
}
