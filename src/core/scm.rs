//! Populate a release directory with application source.
//!
//! `GitFetcher` keeps a bare mirror under `<deploy_root>/repo` on each host
//! and exports the configured branch into the release with `git archive`.

use std::collections::BTreeMap;

use crate::defaults::{REPO_DIR, REVISION_FILE};
use crate::error::{Error, Result};
use crate::executor::{HostOutput, RemoteExecutor};
use crate::host::Host;
use crate::release::ReleaseDescriptor;
use crate::utils::shell::{quote_arg, quote_path};

/// What to fetch and where to put it.
pub struct FetchRequest<'a> {
    pub repo_url: &'a str,
    pub branch: &'a str,
    pub deploy_root: &'a str,
    pub release: &'a ReleaseDescriptor,
    pub hosts: &'a [Host],
    pub executor: &'a RemoteExecutor,
}

/// Result of a fetch: the deployed revision plus anything worth recording
/// in the deploy report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fetched {
    pub revision: String,
    pub warnings: Vec<String>,
}

impl Fetched {
    pub fn new(revision: impl Into<String>) -> Self {
        Self {
            revision: revision.into(),
            warnings: Vec::new(),
        }
    }
}

pub trait SourceFetcher: Send + Sync {
    /// Fill `request.release` on every host.
    fn fetch(&self, request: &FetchRequest<'_>) -> Result<Fetched>;

    /// Make sure the hosts can fetch at all (run by `check`).
    fn check(&self, _hosts: &[Host], _executor: &RemoteExecutor) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GitFetcher;

impl GitFetcher {
    pub fn new() -> Self {
        Self
    }

    pub fn mirror_path(deploy_root: &str) -> String {
        format!("{}/{}", deploy_root.trim_end_matches('/'), REPO_DIR)
    }

    /// Clone the mirror on first use, refresh it afterwards.
    pub fn update_mirror_command(repo_url: &str, mirror: &str) -> String {
        let mirror = quote_path(mirror);
        let url = quote_arg(repo_url);
        format!(
            "if [ -f {mirror}/HEAD ]; then cd {mirror} && git remote set-url origin {url} && git remote update --prune; \
             else git clone --mirror {url} {mirror}; fi",
            mirror = mirror,
            url = url
        )
    }

    pub fn export_command(mirror: &str, branch: &str, release_path: &str) -> String {
        let release = quote_path(release_path);
        let branch = quote_arg(branch);
        format!(
            "cd {mirror} && git archive {branch} | tar -x -f - -C {release} && git rev-parse {branch} > {release}/{revision} && cat {release}/{revision}",
            mirror = quote_path(mirror),
            branch = branch,
            release = release,
            revision = REVISION_FILE
        )
    }
}

impl SourceFetcher for GitFetcher {
    fn fetch(&self, request: &FetchRequest<'_>) -> Result<Fetched> {
        if request.repo_url.trim().is_empty() {
            return Err(Error::config_missing_key("repo_url", None));
        }

        let mirror = Self::mirror_path(request.deploy_root);
        let env = BTreeMap::new();

        log_status!("repo", "Updating mirror of {} ({})", request.repo_url, request.branch);
        request.executor.run(
            request.hosts,
            &Self::update_mirror_command(request.repo_url, &mirror),
            None,
            &env,
        )?;

        let outputs = request.executor.run(
            request.hosts,
            &Self::export_command(&mirror, request.branch, &request.release.release_path),
            None,
            &env,
        )?;

        let fetched = agree_on_revision(&outputs);
        log_status!(
            "repo",
            "Exported {} into {}",
            fetched.revision,
            request.release.release_path
        );
        Ok(fetched)
    }

    fn check(&self, hosts: &[Host], executor: &RemoteExecutor) -> Result<()> {
        executor.run(hosts, "git --version", None, &BTreeMap::new())?;
        Ok(())
    }
}

/// The first host's revision. Any host that reports a different one is
/// named in a warning.
fn agree_on_revision(outputs: &[HostOutput]) -> Fetched {
    let reported: Vec<(&str, &str)> = outputs
        .iter()
        .map(|o| (o.host.as_str(), o.stdout.trim()))
        .filter(|(_, revision)| !revision.is_empty())
        .collect();

    let Some((_, first)) = reported.first().copied() else {
        return Fetched::default();
    };
    let mut fetched = Fetched::new(first);
    if reported.iter().any(|(_, revision)| *revision != first) {
        let listing: Vec<String> = reported
            .iter()
            .map(|(host, revision)| format!("{}={}", host, revision))
            .collect();
        fetched.warnings.push(format!(
            "Hosts exported different revisions: {}",
            listing.join(", ")
        ));
    }
    fetched
}
