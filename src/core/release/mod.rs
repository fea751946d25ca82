mod fs;
mod id;
mod store;

pub use fs::{HostFs, LocalFs, ShellFs};
pub use id::ReleaseId;
pub use store::{ReleaseDescriptor, ReleaseStore};

use serde::Serialize;

use crate::error::{Error, Result};

/// Whether a shared path is a single file or a directory tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedKind {
    File,
    Dir,
}

/// A path persisted under `shared/` and linked into every release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SharedPath {
    pub path: String,
    pub kind: SharedKind,
}

impl SharedPath {
    pub fn file(path: impl Into<String>) -> Result<Self> {
        Self::new(path, SharedKind::File)
    }

    pub fn dir(path: impl Into<String>) -> Result<Self> {
        Self::new(path, SharedKind::Dir)
    }

    fn new(path: impl Into<String>, kind: SharedKind) -> Result<Self> {
        let path = path.into();
        let trimmed = path.trim_end_matches('/').to_string();
        let key = match kind {
            SharedKind::File => "linked_files",
            SharedKind::Dir => "linked_dirs",
        };

        if trimmed.is_empty() || trimmed.starts_with('/') {
            return Err(Error::config_invalid_value(
                key,
                Some(path),
                "shared paths must be relative to the release directory",
            ));
        }
        if trimmed.split('/').any(|part| part == ".." || part == "." || part.is_empty()) {
            return Err(Error::config_invalid_value(
                key,
                Some(path),
                "shared paths must not contain '.', '..' or empty segments",
            ));
        }

        Ok(Self {
            path: trimmed,
            kind,
        })
    }

    /// Directory part of the path, if nested (`config/app.yml` -> `config`).
    pub fn parent(&self) -> Option<&str> {
        self.path.rsplit_once('/').map(|(parent, _)| parent)
    }
}

/// Join POSIX path segments with a single `/`.
pub(crate) fn join(base: &str, child: &str) -> String {
    if base.is_empty() {
        return child.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), child.trim_start_matches('/'))
}
