use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use super::fs::HostFs;
use super::id::ReleaseId;
use super::{join, SharedKind, SharedPath};
use crate::defaults::{CURRENT_LINK, RELEASES_DIR, SHARED_DIR};
use crate::error::{Error, Result};

/// Upper bound on id collisions tolerated by `create_release`.
const MAX_ALLOCATION_ATTEMPTS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseDescriptor {
    pub release_id: ReleaseId,
    pub release_path: String,
    pub created_at: DateTime<Utc>,
}

/// Release directories, shared paths and the `current` link under one
/// deploy root on one host.
#[derive(Clone)]
pub struct ReleaseStore {
    fs: Arc<dyn HostFs>,
    deploy_root: String,
}

impl ReleaseStore {
    pub fn new(fs: Arc<dyn HostFs>, deploy_root: impl Into<String>) -> Self {
        let deploy_root: String = deploy_root.into();
        let trimmed = deploy_root.trim_end_matches('/');
        Self {
            fs,
            deploy_root: if trimmed.is_empty() {
                "/".to_string()
            } else {
                trimmed.to_string()
            },
        }
    }

    pub fn host(&self) -> &str {
        self.fs.host()
    }

    pub fn fs(&self) -> &Arc<dyn HostFs> {
        &self.fs
    }

    pub fn deploy_root(&self) -> &str {
        &self.deploy_root
    }

    pub fn releases_path(&self) -> String {
        join(&self.deploy_root, RELEASES_DIR)
    }

    pub fn shared_path(&self) -> String {
        join(&self.deploy_root, SHARED_DIR)
    }

    pub fn current_path(&self) -> String {
        join(&self.deploy_root, CURRENT_LINK)
    }

    pub fn release_path(&self, id: &ReleaseId) -> String {
        join(&self.releases_path(), &id.to_string())
    }

    /// Create `releases/`, `shared/`, every shared directory and the parent
    /// directories of shared files.
    pub fn ensure_layout(&self, shared_paths: &[SharedPath]) -> Result<()> {
        self.fs.create_dir_all(&self.releases_path())?;
        self.fs.create_dir_all(&self.shared_path())?;

        for shared in shared_paths {
            let location = join(&self.shared_path(), &shared.path);
            match shared.kind {
                SharedKind::Dir => self.fs.create_dir_all(&location)?,
                SharedKind::File => {
                    if let Some(parent) = shared.parent() {
                        self.fs.create_dir_all(&join(&self.shared_path(), parent))?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Release ids present on the host, oldest first.
    pub fn releases(&self) -> Result<Vec<ReleaseId>> {
        let mut ids: Vec<ReleaseId> = self
            .fs
            .list_dir(&self.releases_path())?
            .iter()
            .filter_map(|name| ReleaseId::parse(name))
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Release `current` points at, if any.
    pub fn current(&self) -> Result<Option<ReleaseId>> {
        let target = match self.fs.read_link(&self.current_path())? {
            Some(target) => target,
            None => return Ok(None),
        };
        let name = target.trim_end_matches('/').rsplit('/').next().unwrap_or("");
        Ok(ReleaseId::parse(name))
    }

    /// Smallest id at `now` that sorts after every existing release.
    pub fn next_release_id(&self, now: DateTime<Utc>) -> Result<ReleaseId> {
        let releases = self.releases()?;
        Ok(ReleaseId::after(now, releases.last()))
    }

    /// Create the release directory for `id`. Returns `None` when a
    /// directory with that id already exists.
    pub fn create_release_as(&self, id: &ReleaseId) -> Result<Option<ReleaseDescriptor>> {
        self.fs.create_dir_all(&self.releases_path())?;

        let release_path = self.release_path(id);
        if !self.fs.create_dir(&release_path)? {
            return Ok(None);
        }

        Ok(Some(ReleaseDescriptor {
            release_id: id.clone(),
            release_path,
            created_at: Utc::now(),
        }))
    }

    pub fn create_release(&self) -> Result<ReleaseDescriptor> {
        self.create_release_at(Utc::now())
    }

    /// Allocate and create a new release. Collisions with a concurrent
    /// deployment bump the sequence number and retry.
    pub fn create_release_at(&self, now: DateTime<Utc>) -> Result<ReleaseDescriptor> {
        let mut candidate = self.next_release_id(now)?;

        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            if let Some(descriptor) = self.create_release_as(&candidate)? {
                log_status!("release", "{}: created {}", self.host(), descriptor.release_path);
                return Ok(descriptor);
            }
            let fresh = self.next_release_id(now)?;
            candidate = std::cmp::max(candidate.next(), fresh);
        }

        Err(Error::storage(
            self.host(),
            "create_release",
            self.releases_path(),
            format!(
                "could not allocate a unique release id after {} attempts",
                MAX_ALLOCATION_ATTEMPTS
            ),
        ))
    }

    /// Replace each shared path inside the release with a symlink into
    /// `shared/`. Links that already point at the right place are kept.
    pub fn link_shared(
        &self,
        descriptor: &ReleaseDescriptor,
        shared_paths: &[SharedPath],
    ) -> Result<()> {
        for shared in shared_paths {
            let target = join(&self.shared_path(), &shared.path);
            let link = join(&descriptor.release_path, &shared.path);

            if shared.kind == SharedKind::File && !self.fs.exists(&target)? {
                return Err(Error::storage_linked_file_missing(self.host(), target));
            }

            if self.fs.read_link(&link)?.as_deref() == Some(target.as_str()) {
                continue;
            }

            if let Some(parent) = shared.parent() {
                self.fs
                    .create_dir_all(&join(&descriptor.release_path, parent))?;
            }
            self.fs.remove_all(&link)?;
            self.fs.symlink(&target, &link)?;
        }

        Ok(())
    }

    /// Point `current` at the release in one rename. The link target is
    /// relative (`releases/<id>`), so the deploy root can be moved.
    pub fn activate(&self, descriptor: &ReleaseDescriptor) -> Result<()> {
        self.activate_id(&descriptor.release_id)
    }

    pub fn activate_id(&self, id: &ReleaseId) -> Result<()> {
        let release_path = self.release_path(id);
        if !self.fs.exists(&release_path)? {
            return Err(Error::storage(
                self.host(),
                "activate",
                release_path,
                "release directory does not exist",
            ));
        }

        let staged = join(&self.releases_path(), &format!(".{}.{}", CURRENT_LINK, id));
        let target = join(RELEASES_DIR, &id.to_string());

        self.fs.remove_all(&staged)?;
        self.fs.symlink(&target, &staged)?;
        self.fs.rename(&staged, &self.current_path())?;

        log_status!("release", "{}: current -> {}", self.host(), target);
        Ok(())
    }

    /// Delete all but the `keep_count` most recent releases. The active
    /// release is never deleted and counts towards `keep_count`.
    pub fn prune(&self, keep_count: usize) -> Result<Vec<ReleaseId>> {
        let releases = self.releases()?;
        let active = self.current()?;

        let mut budget = keep_count;
        if active.as_ref().is_some_and(|a| releases.contains(a)) {
            budget = budget.saturating_sub(1);
        }

        let mut removed = Vec::new();
        for id in releases.iter().rev() {
            if Some(id) == active.as_ref() {
                continue;
            }
            if budget > 0 {
                budget -= 1;
                continue;
            }
            self.fs.remove_all(&self.release_path(id))?;
            removed.push(id.clone());
        }

        removed.reverse();
        if !removed.is_empty() {
            log_status!("release", "{}: pruned {} release(s)", self.host(), removed.len());
        }
        Ok(removed)
    }

    /// Newest release older than the active one.
    pub fn previous_release(&self) -> Result<ReleaseId> {
        let active = self
            .current()?
            .ok_or_else(|| Error::storage_no_previous_release(self.host()))?;

        self.releases()?
            .into_iter()
            .filter(|id| *id < active)
            .next_back()
            .ok_or_else(|| Error::storage_no_previous_release(self.host()))
    }

    /// Delete one release directory. Refuses to delete the active release.
    pub fn remove_release(&self, id: &ReleaseId) -> Result<()> {
        if self.current()?.as_ref() == Some(id) {
            return Err(Error::storage(
                self.host(),
                "remove_release",
                self.release_path(id),
                "refusing to remove the active release",
            ));
        }
        self.fs.remove_all(&self.release_path(id))
    }

    pub fn descriptor(&self, id: &ReleaseId) -> ReleaseDescriptor {
        ReleaseDescriptor {
            release_id: id.clone(),
            release_path: self.release_path(id),
            created_at: id.timestamp().unwrap_or_else(Utc::now),
        }
    }
}
