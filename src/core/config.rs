//! Deploy configuration: loading, stage overlays and validation.
//!
//! A `DeployConfig` is read once (`deploy.json` or `deploy.toml`), validated
//! and then only borrowed.

use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::defaults;
use crate::error::{Error, Result};
use crate::hooks::{HookRegistry, HookTask};
use crate::host::{Host, HostConfig};
use crate::lifecycle::{self, When};
use crate::release::{ReleaseDescriptor, ReleaseId, SharedPath};
use crate::roles::Roles;
use crate::utils::template::{self, TemplateVars};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    #[serde(default = "defaults::task_role")]
    pub role: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub within: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl TaskConfig {
    fn anchor(&self) -> Result<(&str, When)> {
        match (&self.before, &self.after) {
            (Some(anchor), None) => Ok((anchor, When::Before)),
            (None, Some(anchor)) => Ok((anchor, When::After)),
            _ => Err(Error::config_invalid_value(
                format!("tasks.{}", self.name),
                None,
                "exactly one of 'before' or 'after' must be set",
            )),
        }
    }

    fn to_hook(&self) -> HookTask {
        HookTask {
            name: self.name.clone(),
            role: self.role.clone(),
            command: self.command.clone(),
            within: self.within.clone(),
            env: self.env.clone(),
        }
    }
}

/// Per-stage overrides selected with `--stage`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageOverlay {
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub deploy_to: Option<String>,
    #[serde(default)]
    pub hosts: Option<BTreeMap<String, HostConfig>>,
    #[serde(default)]
    pub roles: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployConfig {
    pub application: String,
    #[serde(default)]
    pub repo_url: String,
    #[serde(default = "defaults::branch")]
    pub branch: String,
    #[serde(default)]
    pub deploy_to: Option<String>,
    #[serde(default)]
    pub hosts: BTreeMap<String, HostConfig>,
    #[serde(default)]
    pub roles: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub linked_files: Vec<String>,
    #[serde(default)]
    pub linked_dirs: Vec<String>,
    #[serde(default = "defaults::keep_releases")]
    pub keep_releases: usize,
    #[serde(default = "defaults::pty")]
    pub pty: bool,
    #[serde(default = "defaults::command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default)]
    pub default_env: BTreeMap<String, String>,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stages: BTreeMap<String, StageOverlay>,
}

// ============================================================================
// Loading
// ============================================================================

/// First config candidate present in `dir`.
pub fn discover(dir: &Path) -> Result<PathBuf> {
    for candidate in defaults::CONFIG_CANDIDATES {
        let path = dir.join(candidate);
        if path.is_file() {
            return Ok(path);
        }
    }
    Err(Error::config_not_found(
        defaults::CONFIG_CANDIDATES
            .iter()
            .map(|c| dir.join(c).to_string_lossy().to_string())
            .collect(),
    ))
}

fn parse<T: DeserializeOwned>(path: &Path, content: &str) -> Result<T> {
    let display = path.to_string_lossy().to_string();
    if path.extension().and_then(|e| e.to_str()) == Some("toml") {
        toml::from_str(content).map_err(|e| Error::config_invalid_toml(display, e))
    } else {
        serde_json::from_str(content).map_err(|e| Error::config_invalid_json(display, e))
    }
}

impl DeployConfig {
    /// Read and parse a config file. Format follows the extension
    /// (`.toml`, anything else is JSON).
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::config_not_found(vec![path.to_string_lossy().to_string()])
            } else {
                Error::internal_io(e.to_string(), Some(format!("read {}", path.display())))
            }
        })?;
        parse(path, &content)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        parse(Path::new("deploy.json"), content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        parse(Path::new("deploy.toml"), content)
    }

    /// Load from `path` (or discover in `cwd`), apply the stage overlay and
    /// validate. This is what every CLI command starts with.
    pub fn resolve(path: Option<&Path>, cwd: &Path, stage: Option<&str>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => discover(cwd)?,
        };
        let mut config = Self::load(&path)?;
        if let Some(stage) = stage {
            config = config.with_stage(stage)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Apply `stages.<name>` on top of the base settings.
    pub fn with_stage(mut self, name: &str) -> Result<Self> {
        let overlay = self.stages.get(name).cloned().ok_or_else(|| {
            Error::validation_invalid_argument(
                "stage",
                format!("Unknown stage '{}'", name),
                Some(self.stages.keys().cloned().collect()),
            )
        })?;

        if let Some(branch) = overlay.branch {
            self.branch = branch;
        }
        if let Some(deploy_to) = overlay.deploy_to {
            self.deploy_to = Some(deploy_to);
        }
        if let Some(hosts) = overlay.hosts {
            self.hosts = hosts;
        }
        if let Some(roles) = overlay.roles {
            self.roles = roles;
        }
        self.settings.extend(overlay.settings);

        log_status!("config", "Using stage '{}'", name);
        Ok(self)
    }

    // ========================================================================
    // Derived values
    // ========================================================================

    pub fn deploy_root(&self) -> String {
        self.deploy_to
            .clone()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| defaults::deploy_to(&self.application))
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_secs > 0).then(|| Duration::from_secs(self.command_timeout_secs))
    }

    /// Linked files then linked dirs.
    pub fn shared_paths(&self) -> Result<Vec<SharedPath>> {
        let mut paths = Vec::new();
        for file in &self.linked_files {
            paths.push(SharedPath::file(file.as_str())?);
        }
        for dir in &self.linked_dirs {
            paths.push(SharedPath::dir(dir.as_str())?);
        }
        Ok(paths)
    }

    /// Declared hosts, ordered by id.
    pub fn hosts(&self) -> Result<Vec<Host>> {
        self.hosts
            .iter()
            .map(|(id, cfg)| Host::from_config(id, cfg))
            .collect()
    }

    pub fn roles(&self) -> Result<Roles> {
        Roles::new(self.hosts()?, &self.roles)
    }

    /// Template variables for task commands. Release variables are present
    /// once `release` is known. Settings are rendered against the built-ins,
    /// so a setting may itself reference `{{release_path}}`.
    pub fn template_vars(&self, release: Option<&ReleaseDescriptor>) -> HashMap<String, String> {
        let root = self.deploy_root();
        let mut vars = HashMap::new();
        vars.insert(TemplateVars::APPLICATION.to_string(), self.application.clone());
        vars.insert(TemplateVars::REPO_URL.to_string(), self.repo_url.clone());
        vars.insert(TemplateVars::BRANCH.to_string(), self.branch.clone());
        vars.insert(TemplateVars::DEPLOY_TO.to_string(), root.clone());
        vars.insert(
            TemplateVars::CURRENT_PATH.to_string(),
            format!("{}/{}", root, defaults::CURRENT_LINK),
        );
        vars.insert(
            TemplateVars::SHARED_PATH.to_string(),
            format!("{}/{}", root, defaults::SHARED_DIR),
        );
        if let Some(release) = release {
            vars.insert(TemplateVars::RELEASE_ID.to_string(), release.release_id.to_string());
            vars.insert(TemplateVars::RELEASE_PATH.to_string(), release.release_path.clone());
        }

        let rendered: Vec<(String, String)> = self
            .settings
            .iter()
            .map(|(k, v)| (k.clone(), template::render_map(v, &vars)))
            .collect();
        for (key, value) in rendered {
            vars.entry(key).or_insert(value);
        }
        vars
    }

    /// Names a task template may reference.
    pub fn known_variables(&self) -> Vec<String> {
        let mut names = builtin_variables();
        names.extend(self.settings.keys().cloned());
        names
    }

    /// Hook registry populated from `tasks`, in file order.
    pub fn registry(&self) -> Result<HookRegistry> {
        let mut registry = HookRegistry::new();
        for task in &self.tasks {
            let (anchor, when) = task.anchor()?;
            registry.register(anchor, when, task.to_hook())?;
        }
        Ok(registry)
    }

    // ========================================================================
    // Validation
    // ========================================================================

    /// Check everything that can be checked without contacting a host.
    pub fn validate(&self) -> Result<()> {
        if self.application.trim().is_empty() {
            return Err(Error::config_missing_key("application", None));
        }
        if self.repo_url.trim().is_empty() {
            return Err(Error::config_missing_key("repo_url", None));
        }
        if self.branch.trim().is_empty() {
            return Err(Error::config_invalid_value("branch", None, "branch must not be empty"));
        }
        let root = self.deploy_root();
        if !root.starts_with('/') {
            return Err(Error::config_invalid_value(
                "deploy_to",
                Some(root),
                "deploy_to must be an absolute path",
            ));
        }
        if self.hosts.is_empty() {
            return Err(Error::config_missing_key("hosts", None)
                .with_hint("Declare at least one target under 'hosts'"));
        }
        if self.keep_releases == 0 {
            return Err(Error::config_invalid_value(
                "keep_releases",
                Some("0".to_string()),
                "must keep at least one release",
            ));
        }

        self.shared_paths()?;
        let roles = self.roles()?;

        self.validate_settings()?;
        let known = self.known_variables();
        for (key, value) in &self.default_env {
            let unknown: Vec<String> = template::placeholders(value)
                .into_iter()
                .filter(|name| !known.contains(name))
                .collect();
            if !unknown.is_empty() {
                return Err(Error::config_invalid_value(
                    format!("default_env.{}", key),
                    Some(value.clone()),
                    format!("unknown template variable(s): {}", unknown.join(", ")),
                ));
            }
        }

        let sample_id = ReleaseId::from_time(Utc::now());
        let sample = ReleaseDescriptor {
            release_path: format!("{}/{}/{}", root, defaults::RELEASES_DIR, sample_id),
            release_id: sample_id,
            created_at: Utc::now(),
        };
        let before_release = self.template_vars(None);
        let after_release = self.template_vars(Some(&sample));

        let mut seen = Vec::new();
        for task in &self.tasks {
            if task.name.trim().is_empty() {
                return Err(Error::config_missing_key("tasks[].name", None));
            }
            if seen.contains(&task.name) {
                return Err(Error::config_invalid_value(
                    format!("tasks.{}", task.name),
                    None,
                    "task names must be unique",
                ));
            }
            seen.push(task.name.clone());

            let (anchor, when) = task.anchor()?;
            if lifecycle::normalize_anchor(anchor).is_none() {
                return Err(Error::config_unknown_anchor(
                    anchor,
                    lifecycle::known_anchors()
                        .into_iter()
                        .map(str::to_string)
                        .collect(),
                ));
            }

            roles.resolve(&task.role).map_err(|err| {
                if err.code == crate::error::ErrorCode::ConfigEmptyRole {
                    Error::config_empty_role(&task.role, Some(task.name.clone()))
                } else {
                    err
                }
            })?;

            // Release variables only exist once `release:create` has run.
            let vars = if lifecycle::release_known_at(anchor, when) {
                &after_release
            } else {
                &before_release
            };
            let mut env = self.default_env.clone();
            env.extend(task.env.clone());

            let templates = std::iter::once(("command".to_string(), task.command.as_str()))
                .chain(task.within.as_deref().map(|w| ("within".to_string(), w)))
                .chain(env.iter().map(|(k, v)| (format!("env.{}", k), v.as_str())));
            for (field, value) in templates {
                if let Err(missing) = template::render_checked(value, vars) {
                    let problem = if missing.iter().all(|name| known.contains(name)) {
                        format!(
                            "template variable(s) not available {} {}: {}",
                            when,
                            anchor,
                            missing.join(", ")
                        )
                    } else {
                        format!("unknown template variable(s): {}", missing.join(", "))
                    };
                    return Err(Error::config_invalid_value(
                        format!("tasks.{}.{}", task.name, field),
                        Some(value.to_string()),
                        problem,
                    ));
                }
            }
        }

        Ok(())
    }

    /// Settings are rendered against the built-in variables only, so they
    /// may not reference other settings.
    fn validate_settings(&self) -> Result<()> {
        let builtins = builtin_variables();
        for (key, value) in &self.settings {
            let unknown: Vec<String> = template::placeholders(value)
                .into_iter()
                .filter(|name| !builtins.contains(name))
                .collect();
            if !unknown.is_empty() {
                return Err(Error::config_invalid_value(
                    format!("settings.{}", key),
                    Some(value.clone()),
                    format!(
                        "settings may only reference built-in variables, found: {}",
                        unknown.join(", ")
                    ),
                ));
            }
        }
        Ok(())
    }
}

fn builtin_variables() -> Vec<String> {
    [
        TemplateVars::APPLICATION,
        TemplateVars::REPO_URL,
        TemplateVars::BRANCH,
        TemplateVars::DEPLOY_TO,
        TemplateVars::RELEASE_ID,
        TemplateVars::RELEASE_PATH,
        TemplateVars::CURRENT_PATH,
        TemplateVars::SHARED_PATH,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
