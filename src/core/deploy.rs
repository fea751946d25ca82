//! Deployment orchestration.
//!
//! A deployment walks the stages `starting → updating → publishing →
//! finishing → finished` exactly once each. Every stage and every built-in
//! step is a hook anchor; see `lifecycle` for the order inside a stage.
//! The first failure ends the run as `failed(stage, ...)` and no later stage
//! executes, so `current` only moves once every host has a complete release.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use crate::cancel::CancelToken;
use crate::config::DeployConfig;
use crate::defaults::RELEASES_DIR;
use crate::error::{Error, Result};
use crate::executor::{HostOutput, RemoteExecutor, SshTransport, Transport};
use crate::hooks::{HookContext, HookRegistry, HookRunResult, PlannedTask};
use crate::lifecycle::{Point, Stage, Step, When};
use crate::lock::DeployLock;
use crate::release::{
    HostFs, LocalFs, ReleaseDescriptor, ReleaseId, ReleaseStore, SharedKind, SharedPath, ShellFs,
};
use crate::roles::Roles;
use crate::scm::{FetchRequest, GitFetcher, SourceFetcher};

/// Upper bound on rounds spent agreeing on one release id across hosts.
const MAX_ALLOCATION_ROUNDS: usize = 64;

// =============================================================================
// Report types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Succeeded,
    Failed,
    NotAttempted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    NotAttempted,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<HookRunResult>,
    pub hosts: BTreeMap<String, HostStatus>,
}

impl StageReport {
    fn uniform(stage: Stage, status: StageStatus, hosts: &[String], host_status: HostStatus) -> Self {
        Self {
            stage,
            status,
            hooks: Vec::new(),
            hosts: hosts.iter().map(|h| (h.clone(), host_status)).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeployOutcome {
    Finished,
    Failed {
        stage: Stage,
        code: String,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    pub application: String,
    pub branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release: Option<ReleaseDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    pub stages: Vec<StageReport>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub pruned: BTreeMap<String, Vec<ReleaseId>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub outcome: DeployOutcome,
    #[serde(skip)]
    pub error: Option<Error>,
}

impl DeployReport {
    pub fn is_success(&self) -> bool {
        self.outcome == DeployOutcome::Finished
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    /// `Ok(self)` for a finished deployment, otherwise the failure with the
    /// serialized report attached under `details.report`.
    pub fn into_result(mut self) -> Result<Self> {
        match self.error.take() {
            None => Ok(self),
            Some(mut err) => {
                let report = serde_json::to_value(&self).unwrap_or(Value::Null);
                if let Value::Object(map) = &mut err.details {
                    map.insert("report".to_string(), report);
                }
                Err(err)
            }
        }
    }
}

/// One entry of a dry run, in execution order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanEntry {
    Step {
        stage: Stage,
        step: Step,
        hosts: Vec<String>,
    },
    Hook {
        stage: Stage,
        anchor: String,
        when: When,
        task: PlannedTask,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployPlan {
    pub application: String,
    pub repo_url: String,
    pub branch: String,
    pub deploy_to: String,
    pub release_id: ReleaseId,
    pub release_path: String,
    pub shared_paths: Vec<SharedPath>,
    pub keep_releases: usize,
    pub entries: Vec<PlanEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackEntry {
    pub host: String,
    pub from: ReleaseId,
    pub to: ReleaseId,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub application: String,
    pub hosts: Vec<RollbackEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostReleases {
    pub host: String,
    pub current: Option<ReleaseId>,
    pub releases: Vec<ReleaseId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub application: String,
    pub deploy_to: String,
    pub hosts: Vec<String>,
    pub roles: BTreeMap<String, Vec<String>>,
    pub shared_paths: Vec<SharedPath>,
    pub hooks: usize,
    /// One shell probe per host; a failed probe does not fail the check.
    pub probes: Vec<HostOutput>,
}

/// Per-invocation bookkeeping; dropped when `run` returns.
#[derive(Default)]
struct DeploymentState {
    release: Option<ReleaseDescriptor>,
    revision: Option<String>,
    stages: Vec<StageReport>,
    pruned: BTreeMap<String, Vec<ReleaseId>>,
    warnings: Vec<String>,
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct DeploymentOrchestrator<'a> {
    config: &'a DeployConfig,
    roles: Roles,
    shared_paths: Vec<SharedPath>,
    executor: RemoteExecutor,
    stores: Vec<ReleaseStore>,
    fetcher: Arc<dyn SourceFetcher>,
    registry: HookRegistry,
    cancel: CancelToken,
}

impl<'a> DeploymentOrchestrator<'a> {
    /// Assemble an orchestrator from explicit collaborators. `stores` must
    /// contain one store per declared host.
    pub fn new(
        config: &'a DeployConfig,
        executor: RemoteExecutor,
        stores: Vec<ReleaseStore>,
        fetcher: Arc<dyn SourceFetcher>,
        registry: HookRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let roles = config.roles()?;
        let shared_paths = config.shared_paths()?;

        let mut ordered = Vec::with_capacity(roles.all().len());
        for host in roles.all() {
            let store = stores
                .iter()
                .find(|s| s.host() == host.id)
                .cloned()
                .ok_or_else(|| {
                    Error::validation_invalid_argument(
                        "stores",
                        format!("No release store for host '{}'", host.id),
                        None,
                    )
                })?;
            ordered.push(store);
        }

        Ok(Self {
            config,
            roles,
            shared_paths,
            executor,
            stores: ordered,
            fetcher,
            registry,
            cancel: CancelToken::new(),
        })
    }

    /// Default wiring: system `ssh` (or `sh` for localhost), shell-driven
    /// host filesystems, git export and the hooks declared in `tasks`.
    pub fn from_config(config: &'a DeployConfig, cancel: CancelToken) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(SshTransport::new(config.pty));
        let executor = RemoteExecutor::new(Arc::clone(&transport), config.command_timeout())
            .with_cancel(cancel.clone());
        let root = config.deploy_root();

        let stores = config
            .hosts()?
            .into_iter()
            .map(|host| {
                let fs: Arc<dyn HostFs> = if host.is_local() {
                    Arc::new(LocalFs::new(host.id.clone()))
                } else {
                    Arc::new(ShellFs::new(
                        host,
                        Arc::clone(&transport),
                        executor.options().clone(),
                    ))
                };
                ReleaseStore::new(fs, root.clone())
            })
            .collect();

        Ok(Self::new(
            config,
            executor,
            stores,
            Arc::new(GitFetcher::new()),
            config.registry()?,
        )?
        .with_cancel(cancel))
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    /// Register extra hooks before running.
    pub fn registry_mut(&mut self) -> &mut HookRegistry {
        &mut self.registry
    }

    pub fn stores(&self) -> &[ReleaseStore] {
        &self.stores
    }

    fn host_ids(&self) -> Vec<String> {
        self.roles.all().iter().map(|h| h.id.clone()).collect()
    }

    // -------------------------------------------------------------------------
    // deploy
    // -------------------------------------------------------------------------

    /// Run a full deployment. Never panics on remote failure; the outcome is
    /// in the returned report.
    pub fn run(&self) -> DeployReport {
        let hosts = self.host_ids();
        let mut state = DeploymentState::default();
        let mut lock: Option<DeployLock> = None;
        let mut failure: Option<(Stage, Error)> = None;

        for stage in Stage::ALL {
            if failure.is_some() {
                state.stages.push(StageReport::uniform(
                    stage,
                    StageStatus::NotAttempted,
                    &hosts,
                    HostStatus::NotAttempted,
                ));
                continue;
            }

            let mut hooks = Vec::new();
            match self.run_stage(stage, &mut state, &mut lock, &mut hooks) {
                Ok(()) => {
                    let mut record = StageReport::uniform(
                        stage,
                        StageStatus::Succeeded,
                        &hosts,
                        HostStatus::Succeeded,
                    );
                    record.hooks = hooks;
                    state.stages.push(record);
                }
                Err(err) => {
                    eprintln!("[deploy] {} failed: {}", stage, err.message);
                    let failed = failed_hosts(&err);
                    state.stages.push(StageReport {
                        stage,
                        status: StageStatus::Failed,
                        hooks,
                        hosts: hosts
                            .iter()
                            .map(|h| {
                                let status = if failed.contains(h) {
                                    HostStatus::Failed
                                } else {
                                    HostStatus::NotAttempted
                                };
                                (h.clone(), status)
                            })
                            .collect(),
                    });
                    failure = Some((stage, err));
                }
            }
        }

        if let Some(lock) = lock.take() {
            if let Err(err) = lock.release() {
                state
                    .warnings
                    .push(format!("Could not release deploy lock: {}", err.message));
            }
        }

        let (outcome, error) = match failure {
            None => {
                eprintln!("[deploy] {} finished", self.config.application);
                (DeployOutcome::Finished, None)
            }
            Some((stage, err)) => (
                DeployOutcome::Failed {
                    stage,
                    code: err.code.as_str().to_string(),
                    message: err.message.clone(),
                },
                Some(err),
            ),
        };

        DeployReport {
            application: self.config.application.clone(),
            branch: self.config.branch.clone(),
            release: state.release,
            revision: state.revision,
            stages: state.stages,
            pruned: state.pruned,
            warnings: state.warnings,
            outcome,
            error,
        }
    }

    fn run_stage(
        &self,
        stage: Stage,
        state: &mut DeploymentState,
        lock: &mut Option<DeployLock>,
        hooks: &mut Vec<HookRunResult>,
    ) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::cancelled(stage.as_str()));
        }
        eprintln!("[deploy] {}: {}", self.config.application, stage);

        if stage == Stage::Starting {
            *lock = Some(DeployLock::acquire(&self.stores)?);
        }

        for point in stage.points() {
            match point {
                Point::Hooks { anchor, when } => {
                    if self.registry.tasks(anchor, when).is_empty() {
                        continue;
                    }
                    hooks.push(self.fire(anchor, when, state)?);
                }
                Point::Action(step) => self.perform(step, state)?,
            }
        }

        Ok(())
    }

    fn fire(&self, anchor: &str, when: When, state: &DeploymentState) -> Result<HookRunResult> {
        let vars = self.config.template_vars(state.release.as_ref());
        let ctx = HookContext {
            roles: &self.roles,
            executor: &self.executor,
            vars: &vars,
            default_cwd: state.release.as_ref().map(|r| r.release_path.as_str()),
            env: &self.config.default_env,
        };
        self.registry.fire(anchor, when, &ctx)
    }

    fn perform(&self, step: Step, state: &mut DeploymentState) -> Result<()> {
        log_status!("deploy", "step {}", step);
        match step {
            Step::Check => self.check_hosts(),
            Step::ReleaseCreate => {
                state.release = Some(self.allocate_release(Utc::now())?);
                Ok(())
            }
            Step::RepoUpdate => {
                let release = current_release(state, step)?;
                let root = self.config.deploy_root();
                let fetched = self.fetcher.fetch(&FetchRequest {
                    repo_url: &self.config.repo_url,
                    branch: &self.config.branch,
                    deploy_root: &root,
                    release,
                    hosts: self.roles.all(),
                    executor: &self.executor,
                })?;
                for warning in fetched.warnings {
                    eprintln!("[deploy] warning: {}", warning);
                    state.warnings.push(warning);
                }
                state.revision = Some(fetched.revision).filter(|r| !r.is_empty());
                Ok(())
            }
            Step::SymlinkShared => {
                let id = current_release(state, step)?.release_id.clone();
                self.on_every_host(|store| {
                    store.link_shared(&store.descriptor(&id), &self.shared_paths)
                })?;
                Ok(())
            }
            Step::SymlinkRelease => {
                let id = current_release(state, step)?.release_id.clone();
                self.on_every_host(|store| store.activate_id(&id))?;
                Ok(())
            }
            Step::Cleanup => {
                let keep = self.config.keep_releases;
                let pruned = self.on_every_host(|store| store.prune(keep))?;
                for (store, removed) in self.stores.iter().zip(pruned) {
                    if !removed.is_empty() {
                        state.pruned.insert(store.host().to_string(), removed);
                    }
                }
                Ok(())
            }
        }
    }

    /// Layout, linked files and fetcher prerequisites on every host.
    fn check_hosts(&self) -> Result<()> {
        self.on_every_host(|store| {
            store.ensure_layout(&self.shared_paths)?;
            for shared in self.shared_paths.iter().filter(|s| s.kind == SharedKind::File) {
                let path = format!("{}/{}", store.shared_path(), shared.path);
                if !store.fs().exists(&path)? {
                    return Err(Error::storage_linked_file_missing(store.host(), path));
                }
            }
            Ok(())
        })?;
        self.fetcher.check(self.roles.all(), &self.executor)
    }

    /// Create the same release id on every host. A collision on any host
    /// removes the directories created in that round and retries with a
    /// larger id.
    fn allocate_release(&self, now: DateTime<Utc>) -> Result<ReleaseDescriptor> {
        let mut candidate = self.agreed_next_id(now)?;

        for _ in 0..MAX_ALLOCATION_ROUNDS {
            let mut created: Vec<&ReleaseStore> = Vec::new();
            let mut first = None;
            let mut collided = false;

            for store in &self.stores {
                match store.create_release_as(&candidate)? {
                    Some(descriptor) => {
                        if first.is_none() {
                            first = Some(descriptor);
                        }
                        created.push(store);
                    }
                    None => {
                        collided = true;
                        break;
                    }
                }
            }

            if !collided {
                if let Some(descriptor) = first {
                    eprintln!("[deploy] release {}", descriptor.release_id);
                    return Ok(descriptor);
                }
            }

            for store in created {
                store.remove_release(&candidate)?;
            }
            candidate = std::cmp::max(candidate.next(), self.agreed_next_id(now)?);
        }

        Err(Error::storage(
            "*",
            "create_release",
            format!("{}/{}", self.config.deploy_root(), RELEASES_DIR),
            "could not agree on a release id across hosts",
        ))
    }

    fn agreed_next_id(&self, now: DateTime<Utc>) -> Result<ReleaseId> {
        let mut next = ReleaseId::from_time(now);
        for store in &self.stores {
            next = std::cmp::max(next, store.next_release_id(now)?);
        }
        Ok(next)
    }

    /// Run `op` against every store in parallel and wait for all of them.
    /// Results come back in host order; the first error (in host order) wins.
    fn on_every_host<T, F>(&self, op: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(&ReleaseStore) -> Result<T> + Sync,
    {
        if self.stores.len() == 1 {
            return Ok(vec![op(&self.stores[0])?]);
        }

        let results: Vec<Result<T>> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .stores
                .iter()
                .map(|store| {
                    let op = &op;
                    scope.spawn(move || op(store))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(Error::internal_unexpected("Host worker thread panicked"))
                    })
                })
                .collect()
        });

        results.into_iter().collect()
    }

    // -------------------------------------------------------------------------
    // dry run
    // -------------------------------------------------------------------------

    /// Everything `run` would do, in order, without touching a host. The
    /// release id is the one a run started now would most likely get.
    pub fn plan(&self) -> Result<DeployPlan> {
        let root = self.config.deploy_root();
        let release_id = ReleaseId::from_time(Utc::now());
        let release = ReleaseDescriptor {
            release_path: format!("{}/{}/{}", root, RELEASES_DIR, release_id),
            release_id: release_id.clone(),
            created_at: Utc::now(),
        };
        let hosts = self.host_ids();

        let mut entries = Vec::new();
        let mut known: Option<&ReleaseDescriptor> = None;

        for stage in Stage::ALL {
            for point in stage.points() {
                match point {
                    Point::Hooks { anchor, when } => {
                        let vars = self.config.template_vars(known);
                        let ctx = HookContext {
                            roles: &self.roles,
                            executor: &self.executor,
                            vars: &vars,
                            default_cwd: known.map(|r| r.release_path.as_str()),
                            env: &self.config.default_env,
                        };
                        for task in self.registry.tasks(anchor, when) {
                            entries.push(PlanEntry::Hook {
                                stage,
                                anchor: anchor.to_string(),
                                when,
                                task: self.registry.plan_task(task, &ctx)?,
                            });
                        }
                    }
                    Point::Action(step) => {
                        entries.push(PlanEntry::Step {
                            stage,
                            step,
                            hosts: hosts.clone(),
                        });
                        if step == Step::ReleaseCreate {
                            known = Some(&release);
                        }
                    }
                }
            }
        }

        Ok(DeployPlan {
            application: self.config.application.clone(),
            repo_url: self.config.repo_url.clone(),
            branch: self.config.branch.clone(),
            deploy_to: root,
            release_path: release.release_path.clone(),
            release_id,
            shared_paths: self.shared_paths.clone(),
            keep_releases: self.config.keep_releases,
            entries,
        })
    }

    // -------------------------------------------------------------------------
    // rollback, releases, check
    // -------------------------------------------------------------------------

    /// Point `current` back at the previous release on every host. Nothing
    /// moves unless every host has a previous release.
    pub fn rollback(&self) -> Result<RollbackReport> {
        if self.cancel.is_cancelled() {
            return Err(Error::cancelled("rollback"));
        }

        let lock = DeployLock::acquire(&self.stores)?;
        let result = self.rollback_locked();

        let mut warnings = Vec::new();
        if let Err(err) = lock.release() {
            warnings.push(format!("Could not release deploy lock: {}", err.message));
        }

        let hosts = result?;
        Ok(RollbackReport {
            application: self.config.application.clone(),
            hosts,
            warnings,
        })
    }

    fn rollback_locked(&self) -> Result<Vec<RollbackEntry>> {
        let mut targets = Vec::new();
        for store in &self.stores {
            let from = store
                .current()?
                .ok_or_else(|| Error::storage_no_previous_release(store.host()))?;
            let to = store.previous_release()?;
            targets.push((store, from, to));
        }

        let mut entries = Vec::new();
        for (store, from, to) in targets {
            store.activate_id(&to)?;
            eprintln!("[rollback] {}: {} -> {}", store.host(), from, to);
            entries.push(RollbackEntry {
                host: store.host().to_string(),
                from,
                to,
            });
        }
        Ok(entries)
    }

    pub fn releases(&self) -> Result<Vec<HostReleases>> {
        self.on_every_host(|store| {
            Ok(HostReleases {
                host: store.host().to_string(),
                current: store.current()?,
                releases: store.releases()?,
            })
        })
    }

    /// The `check` step on its own (layout, linked files, fetcher) plus a
    /// shell probe on every host.
    pub fn check(&self) -> Result<CheckReport> {
        self.check_hosts()?;
        let probes = self.executor.run_tolerant(
            self.roles.all(),
            "echo \"$(id -un)@$(uname -n)\"",
            None,
            &BTreeMap::new(),
        )?;
        for probe in probes.iter().filter(|p| !p.success) {
            eprintln!("[check] {} unreachable: {}", probe.host, probe.stderr.trim());
        }

        let roles = self
            .roles
            .names()
            .into_iter()
            .map(|name| {
                let hosts = self
                    .roles
                    .resolve(&name)
                    .map(|hosts| hosts.into_iter().map(|h| h.id).collect())
                    .unwrap_or_default();
                (name, hosts)
            })
            .collect();

        Ok(CheckReport {
            application: self.config.application.clone(),
            deploy_to: self.config.deploy_root(),
            hosts: self.host_ids(),
            roles,
            shared_paths: self.shared_paths.clone(),
            hooks: self.registry.all().len(),
            probes,
        })
    }
}

fn current_release(state: &DeploymentState, step: Step) -> Result<&ReleaseDescriptor> {
    state.release.as_ref().ok_or_else(|| {
        Error::internal_unexpected(format!("step '{}' ran before a release was created", step))
    })
}

/// Hosts a failure is attributed to.
fn failed_hosts(err: &Error) -> Vec<String> {
    if let Some(list) = err.details.get("failedHosts").and_then(|v| v.as_array()) {
        return list
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
    }
    err.details
        .get("host")
        .and_then(|v| v.as_str())
        .map(|h| vec![h.to_string()])
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::ScriptedTransport;
    use crate::hooks::HookTask;
    use crate::lock::lock_path;
    use crate::scm::Fetched;
    use tempfile::TempDir;

    const CONFIG: &str = r#"{
        "application": "solidjs",
        "repo_url": "https://git.example.com/solid-site",
        "branch": "cn_site",
        "deploy_to": "/srv/app",
        "pty": false,
        "keep_releases": 2,
        "hosts": {
            "web1": { "address": "10.0.0.11" },
            "web2": { "address": "10.0.0.12" }
        },
        "roles": { "yarn_roles": ["web1", "web2"] },
        "linked_dirs": ["node_modules", "dist"],
        "settings": { "yarn_bin": "yarn", "yarn_target_path": "{{release_path}}" },
        "tasks": [{
            "name": "yarn_deploy",
            "before": "symlink:release",
            "role": "yarn_roles",
            "within": "{{yarn_target_path}}",
            "command": "{{yarn_bin}} run build"
        }]
    }"#;

    /// Writes a file and a checked-in `dist/` into the release.
    struct FakeFetcher {
        stores: Vec<ReleaseStore>,
        warnings: Vec<String>,
    }

    impl SourceFetcher for FakeFetcher {
        fn fetch(&self, request: &FetchRequest<'_>) -> Result<Fetched> {
            for store in &self.stores {
                let path = &request.release.release_path;
                store.fs().write_file(&format!("{}/index.html", path), "<html>")?;
                store.fs().create_dir_all(&format!("{}/dist", path))?;
            }
            Ok(Fetched {
                revision: "abc123".to_string(),
                warnings: self.warnings.clone(),
            })
        }
    }

    struct Fixture {
        _dir: TempDir,
        config: DeployConfig,
        transport: Arc<ScriptedTransport>,
        stores: Vec<ReleaseStore>,
    }

    impl Fixture {
        fn new(transport: ScriptedTransport) -> Self {
            let dir = TempDir::new().unwrap();
            let stores = ["web1", "web2"]
                .iter()
                .map(|h| {
                    ReleaseStore::new(Arc::new(LocalFs::under(*h, dir.path().join(h))), "/srv/app")
                })
                .collect();
            Self {
                _dir: dir,
                config: DeployConfig::from_json_str(CONFIG).unwrap(),
                transport: Arc::new(transport),
                stores,
            }
        }

        fn orchestrator(&self) -> DeploymentOrchestrator<'_> {
            DeploymentOrchestrator::new(
                &self.config,
                RemoteExecutor::new(self.transport.clone(), None),
                self.stores.clone(),
                Arc::new(FakeFetcher {
                    stores: self.stores.clone(),
                    warnings: Vec::new(),
                }),
                self.config.registry().unwrap(),
            )
            .unwrap()
        }
    }

    #[test]
    fn successful_deploy_links_and_activates_on_every_host() {
        let fixture = Fixture::new(ScriptedTransport::default());
        let report = fixture.orchestrator().run();

        assert!(report.is_success(), "{:?}", report.outcome);
        let release = report.release.clone().unwrap();
        assert_eq!(report.revision.as_deref(), Some("abc123"));

        for store in &fixture.stores {
            assert_eq!(store.current().unwrap(), Some(release.release_id.clone()));
            assert_eq!(
                store
                    .fs()
                    .read_link(&format!("{}/dist", release.release_path))
                    .unwrap()
                    .as_deref(),
                Some("/srv/app/shared/dist")
            );
            assert!(!store.fs().exists(&lock_path(store)).unwrap());
        }

        let expected = format!("cd '{}' && yarn run build", release.release_path);
        assert_eq!(fixture.transport.commands_for("web1"), vec![expected.clone()]);
        assert_eq!(fixture.transport.commands_for("web2"), vec![expected]);

        let finishing = report.stage(Stage::Finishing).unwrap();
        assert_eq!(finishing.hooks.len(), 1);
        assert!(report.stages.iter().all(|s| s.status == StageStatus::Succeeded));
    }

    #[test]
    fn failing_build_leaves_current_on_previous_release() {
        let fixture = Fixture::new(ScriptedTransport::default());
        let first = fixture.orchestrator().run();
        let previous = first.release.unwrap().release_id;

        let failing = Fixture {
            transport: Arc::new(ScriptedTransport::failing_on("web2", "run build")),
            ..fixture
        };
        let report = failing.orchestrator().run();

        match &report.outcome {
            DeployOutcome::Failed { stage, code, .. } => {
                assert_eq!(*stage, Stage::Finishing);
                assert_eq!(code, "remote.command_failed");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        for store in &failing.stores {
            assert_eq!(store.current().unwrap(), Some(previous.clone()));
            assert!(!store.fs().exists(&lock_path(store)).unwrap());
        }

        let finishing = report.stage(Stage::Finishing).unwrap();
        assert_eq!(finishing.hosts["web2"], HostStatus::Failed);
        assert_eq!(finishing.hosts["web1"], HostStatus::NotAttempted);
        assert_eq!(
            report.stage(Stage::Finished).unwrap().status,
            StageStatus::NotAttempted
        );

        let err = report.into_result().unwrap_err();
        assert_eq!(err.details["host"], "web2");
        assert_eq!(err.details["stderr"], "build failed");
        assert_eq!(err.details["report"]["outcome"]["stage"], "finishing");
    }

    #[test]
    fn lock_contention_refuses_to_start() {
        let fixture = Fixture::new(ScriptedTransport::default());
        let held = DeployLock::acquire(&fixture.stores[1..]).unwrap();

        let report = fixture.orchestrator().run();
        assert_eq!(
            report.outcome,
            DeployOutcome::Failed {
                stage: Stage::Starting,
                code: "deploy.lock_contention".to_string(),
                message: "Another deployment holds the deploy lock".to_string(),
            }
        );
        assert!(report.release.is_none());
        assert!(fixture.stores[0].releases().unwrap().is_empty());
        assert!(!fixture.stores[0].fs().exists(&lock_path(&fixture.stores[0])).unwrap());

        held.release().unwrap();
    }

    #[test]
    fn cancellation_stops_before_next_stage() {
        let fixture = Fixture::new(ScriptedTransport::default());
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = fixture.orchestrator().with_cancel(cancel).run();
        match report.outcome {
            DeployOutcome::Failed { stage, code, .. } => {
                assert_eq!(stage, Stage::Starting);
                assert_eq!(code, "deploy.cancelled");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(fixture.transport.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn repeated_deploys_keep_configured_number_of_releases() {
        let fixture = Fixture::new(ScriptedTransport::default());
        let mut ids = Vec::new();
        for _ in 0..3 {
            let report = fixture.orchestrator().run();
            assert!(report.is_success());
            ids.push(report.release.unwrap().release_id);
        }

        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        for store in &fixture.stores {
            assert_eq!(store.releases().unwrap(), ids[1..].to_vec());
        }
    }

    #[test]
    fn release_id_is_agreed_across_hosts() {
        let fixture = Fixture::new(ScriptedTransport::default());
        let future = ReleaseId::parse("29991231235959").unwrap();
        fixture.stores[1].create_release_as(&future).unwrap();

        let report = fixture.orchestrator().run();
        let id = report.release.unwrap().release_id;
        assert!(id > future);
        for store in &fixture.stores {
            assert_eq!(store.current().unwrap(), Some(id.clone()));
        }
    }

    #[test]
    fn plan_renders_hooks_without_touching_hosts() {
        let fixture = Fixture::new(ScriptedTransport::default());
        let plan = fixture.orchestrator().plan().unwrap();

        let hook = plan
            .entries
            .iter()
            .find_map(|e| match e {
                PlanEntry::Hook { anchor, task, .. } if anchor == "symlink:release" => Some(task),
                _ => None,
            })
            .unwrap();
        assert_eq!(hook.command, "yarn run build");
        assert_eq!(hook.cwd.as_deref(), Some(plan.release_path.as_str()));
        assert_eq!(hook.hosts, vec!["web1", "web2"]);

        let steps = plan
            .entries
            .iter()
            .filter(|e| matches!(e, PlanEntry::Step { .. }))
            .count();
        assert_eq!(steps, 6);
        assert!(fixture.transport.calls.lock().unwrap().is_empty());
        assert!(fixture.stores[0].releases().unwrap().is_empty());
    }

    #[test]
    fn rollback_repoints_current_to_previous_release() {
        let fixture = Fixture::new(ScriptedTransport::default());
        let orchestrator = fixture.orchestrator();
        assert_eq!(
            orchestrator.rollback().unwrap_err().code.as_str(),
            "storage.no_previous_release"
        );

        let first = orchestrator.run().release.unwrap().release_id;
        let second = orchestrator.run().release.unwrap().release_id;

        let report = orchestrator.rollback().unwrap();
        assert_eq!(report.hosts.len(), 2);
        assert_eq!(report.hosts[0].from, second);
        assert_eq!(report.hosts[0].to, first);
        for store in &fixture.stores {
            assert_eq!(store.current().unwrap(), Some(first.clone()));
        }

        let listed = orchestrator.releases().unwrap();
        assert_eq!(listed[1].current, Some(first));
        assert_eq!(listed[1].releases.len(), 2);
    }

    #[test]
    fn check_requires_linked_files_in_shared() {
        let mut fixture = Fixture::new(ScriptedTransport::default());
        fixture.config.linked_files.push(".env".to_string());

        let err = fixture.orchestrator().check().unwrap_err();
        assert_eq!(err.code.as_str(), "storage.linked_file_missing");

        for store in &fixture.stores {
            store
                .fs()
                .write_file(&format!("{}/.env", store.shared_path()), "KEY=1")
                .unwrap();
        }
        let report = fixture.orchestrator().check().unwrap();
        assert_eq!(report.hosts, vec!["web1", "web2"]);
        assert_eq!(report.roles["yarn_roles"], vec!["web1", "web2"]);
        assert_eq!(report.hooks, 1);
        assert_eq!(report.probes.len(), 2);
        assert!(report.probes.iter().all(|p| p.success));
    }

    #[test]
    fn hooks_registered_in_code_run_after_config_tasks() {
        let fixture = Fixture::new(ScriptedTransport::default());
        let mut orchestrator = fixture.orchestrator();
        orchestrator
            .registry_mut()
            .after("deploy:finished", HookTask::new("notify", "yarn_roles", "echo {{release_id}}"))
            .unwrap();

        let report = orchestrator.run();
        assert!(report.is_success(), "{:?}", report.outcome);
        let release = report.release.unwrap();

        let commands = fixture.transport.commands_for("web1");
        assert_eq!(commands.len(), 2);
        assert!(commands[0].ends_with("yarn run build"));
        assert_eq!(
            commands[1],
            format!("cd '{}' && echo {}", release.release_path, release.release_id)
        );
    }

    #[test]
    fn early_release_variable_is_rejected_before_any_host_is_touched() {
        let mut fixture = Fixture::new(ScriptedTransport::default());
        fixture.config.tasks[0].before = None;
        fixture.config.tasks[0].after = Some("check".to_string());

        let err = DeploymentOrchestrator::new(
            &fixture.config,
            RemoteExecutor::new(fixture.transport.clone(), None),
            fixture.stores.clone(),
            Arc::new(GitFetcher::new()),
            HookRegistry::new(),
        )
        .err()
        .unwrap();

        assert_eq!(err.code.as_str(), "config.invalid_value");
        assert_eq!(err.details["key"], "tasks.yarn_deploy.within");
        for store in &fixture.stores {
            assert!(!store.fs().exists(&store.releases_path()).unwrap());
        }
        assert!(fixture.transport.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn fetch_warnings_land_in_the_report() {
        let fixture = Fixture::new(ScriptedTransport::default());
        let warning = "Hosts exported different revisions: web1=abc123, web2=def456";
        let orchestrator = DeploymentOrchestrator::new(
            &fixture.config,
            RemoteExecutor::new(fixture.transport.clone(), None),
            fixture.stores.clone(),
            Arc::new(FakeFetcher {
                stores: fixture.stores.clone(),
                warnings: vec![warning.to_string()],
            }),
            fixture.config.registry().unwrap(),
        )
        .unwrap();

        let report = orchestrator.run();
        assert!(report.is_success(), "{:?}", report.outcome);
        assert_eq!(report.revision.as_deref(), Some("abc123"));
        assert_eq!(report.warnings, vec![warning.to_string()]);
    }

    #[test]
    fn missing_store_is_rejected() {
        let fixture = Fixture::new(ScriptedTransport::default());
        let err = DeploymentOrchestrator::new(
            &fixture.config,
            RemoteExecutor::new(fixture.transport.clone(), None),
            fixture.stores[..1].to_vec(),
            Arc::new(GitFetcher::new()),
            HookRegistry::new(),
        )
        .err()
        .unwrap();
        assert_eq!(err.code.as_str(), "validation.invalid_argument");
    }
}
