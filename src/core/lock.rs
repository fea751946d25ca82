//! Per-deploy-root mutual exclusion.
//!
//! The lock is a directory (`<deploy_root>/.cutover.lock`) created with a
//! single `mkdir`, which either succeeds or fails atomically on every POSIX
//! filesystem. An `owner` file inside records who holds it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::defaults::LOCK_DIR;
use crate::error::{Error, Result};
use crate::release::ReleaseStore;

const OWNER_FILE: &str = "owner";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockOwner {
    pub token: String,
    pub user: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockOwner {
    fn current() -> Self {
        Self {
            token: uuid::Uuid::new_v4().to_string(),
            user: std::env::var("USER").unwrap_or_else(|_| "unknown".to_string()),
            acquired_at: Utc::now(),
        }
    }

    fn describe(&self) -> String {
        format!("{} since {}", self.user, self.acquired_at.to_rfc3339())
    }
}

/// Held lock on a set of hosts. Released explicitly with `release`, or on
/// drop as a fallback.
pub struct DeployLock {
    owner: LockOwner,
    held: Vec<ReleaseStore>,
}

pub fn lock_path(store: &ReleaseStore) -> String {
    format!("{}/{}", store.deploy_root(), LOCK_DIR)
}

impl DeployLock {
    /// Take the lock on every store. On contention the locks already taken
    /// in this call are given back and the error names the busy host.
    pub fn acquire(stores: &[ReleaseStore]) -> Result<Self> {
        let mut lock = Self {
            owner: LockOwner::current(),
            held: Vec::new(),
        };

        for store in stores {
            if let Err(err) = lock.acquire_one(store) {
                lock.release_all();
                return Err(err);
            }
        }

        Ok(lock)
    }

    fn acquire_one(&mut self, store: &ReleaseStore) -> Result<()> {
        let fs = store.fs();
        let path = lock_path(store);

        fs.create_dir_all(store.deploy_root())?;
        if !fs.create_dir(&path)? {
            let owner = fs
                .read_file(&format!("{}/{}", path, OWNER_FILE))
                .ok()
                .flatten()
                .and_then(|raw| serde_json::from_str::<LockOwner>(&raw).ok())
                .map(|o| o.describe());
            return Err(Error::lock_contention(store.host(), path, owner));
        }
        self.held.push(store.clone());

        let owner = serde_json::to_string(&self.owner)
            .map_err(|e| Error::internal_json(e.to_string(), Some("lock owner".to_string())))?;
        fs.write_file(&format!("{}/{}", path, OWNER_FILE), &owner)?;

        log_status!("lock", "{}: acquired {}", store.host(), path);
        Ok(())
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    pub fn hosts(&self) -> Vec<String> {
        self.held.iter().map(|s| s.host().to_string()).collect()
    }

    /// Give the lock back on every host. Stops at the first host that
    /// cannot be unlocked; the rest are retried on drop.
    pub fn release(mut self) -> Result<()> {
        while let Some(store) = self.held.first().cloned() {
            Self::release_one(&store, &self.owner)?;
            self.held.remove(0);
        }
        Ok(())
    }

    fn release_one(store: &ReleaseStore, owner: &LockOwner) -> Result<()> {
        let fs = store.fs();
        let path = lock_path(store);

        // Someone else's lock (e.g. removed by hand and re-taken) stays.
        let current = fs
            .read_file(&format!("{}/{}", path, OWNER_FILE))?
            .and_then(|raw| serde_json::from_str::<LockOwner>(&raw).ok());
        if let Some(current) = current {
            if current.token != owner.token {
                log_status!("lock", "{}: lock now owned by {}, leaving it", store.host(), current.describe());
                return Ok(());
            }
        }

        fs.remove_all(&path)?;
        log_status!("lock", "{}: released {}", store.host(), path);
        Ok(())
    }

    fn release_all(&mut self) {
        for store in self.held.drain(..) {
            if let Err(err) = Self::release_one(&store, &self.owner) {
                log_status!("lock", "{}: could not release lock: {}", store.host(), err);
            }
        }
    }
}

impl Drop for DeployLock {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::LocalFs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store(dir: &TempDir, host: &str) -> ReleaseStore {
        ReleaseStore::new(Arc::new(LocalFs::under(host, dir.path().join(host))), "/srv/app")
    }

    #[test]
    fn second_acquire_is_contention() {
        let dir = TempDir::new().unwrap();
        let stores = vec![store(&dir, "web1")];

        let held = DeployLock::acquire(&stores).unwrap();
        let err = DeployLock::acquire(&stores).err().unwrap();

        assert_eq!(err.code.as_str(), "deploy.lock_contention");
        assert_eq!(err.details["host"], "web1");
        assert!(err.details["owner"].as_str().unwrap().contains("since"));

        held.release().unwrap();
        DeployLock::acquire(&stores).unwrap().release().unwrap();
    }

    #[test]
    fn contention_on_one_host_gives_back_the_others() {
        let dir = TempDir::new().unwrap();
        let web1 = store(&dir, "web1");
        let web2 = store(&dir, "web2");

        let _blocker = DeployLock::acquire(std::slice::from_ref(&web2)).unwrap();
        let err = DeployLock::acquire(&[web1.clone(), web2]).err().unwrap();
        assert_eq!(err.details["host"], "web2");

        assert!(!web1.fs().exists(&lock_path(&web1)).unwrap());
    }

    #[test]
    fn drop_releases_the_lock() {
        let dir = TempDir::new().unwrap();
        let web1 = store(&dir, "web1");
        {
            let _lock = DeployLock::acquire(std::slice::from_ref(&web1)).unwrap();
            assert!(web1.fs().exists(&lock_path(&web1)).unwrap());
        }
        assert!(!web1.fs().exists(&lock_path(&web1)).unwrap());
    }

    #[test]
    fn release_leaves_a_lock_taken_over_by_someone_else() {
        let dir = TempDir::new().unwrap();
        let web1 = store(&dir, "web1");
        let lock = DeployLock::acquire(std::slice::from_ref(&web1)).unwrap();

        let foreign = LockOwner {
            token: "other".to_string(),
            user: "ops".to_string(),
            acquired_at: Utc::now(),
        };
        web1.fs()
            .write_file(
                &format!("{}/owner", lock_path(&web1)),
                &serde_json::to_string(&foreign).unwrap(),
            )
            .unwrap();

        lock.release().unwrap();
        assert!(web1.fs().exists(&lock_path(&web1)).unwrap());
    }
}
