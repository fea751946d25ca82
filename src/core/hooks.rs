//! Hook registry for lifecycle extensibility.
//!
//! Hooks are remote shell commands bound to an anchor (a stage or a built-in
//! step, see `lifecycle`) and run either before or after it. Tasks bound to
//! the same anchor and side run in registration order; the first failure
//! stops the chain.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};
use crate::executor::{HostOutput, RemoteExecutor};
use crate::lifecycle::{self, When};
use crate::roles::Roles;
use crate::utils::template;

/// A custom task: a command run on the hosts of one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookTask {
    pub name: String,
    pub role: String,
    pub command: String,
    /// Working directory template; defaults to the release path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub within: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl HookTask {
    pub fn new(name: impl Into<String>, role: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            command: command.into(),
            within: None,
            env: BTreeMap::new(),
        }
    }

    pub fn within(mut self, dir: impl Into<String>) -> Self {
        self.within = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Where a task landed: anchor, side and position in that chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookHandle {
    pub anchor: &'static str,
    pub when: When,
    pub position: usize,
}

#[derive(Debug, Clone, Default)]
struct Chains {
    before: Vec<HookTask>,
    after: Vec<HookTask>,
}

impl Chains {
    fn side(&self, when: When) -> &Vec<HookTask> {
        match when {
            When::Before => &self.before,
            When::After => &self.after,
        }
    }

    fn side_mut(&mut self, when: When) -> &mut Vec<HookTask> {
        match when {
            When::Before => &mut self.before,
            When::After => &mut self.after,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HookRegistry {
    chains: HashMap<&'static str, Chains>,
}

/// Everything a task needs to run.
pub struct HookContext<'a> {
    pub roles: &'a Roles,
    pub executor: &'a RemoteExecutor,
    /// Template variables, including `release_path` once a release exists.
    pub vars: &'a HashMap<String, String>,
    /// Working directory used when a task has no `within`.
    pub default_cwd: Option<&'a str>,
    /// Environment applied to every task; task env wins on conflicts.
    pub env: &'a BTreeMap<String, String>,
}

/// A task rendered against a context, ready to run.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedTask {
    pub name: String,
    pub role: String,
    pub hosts: Vec<String>,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HookTaskResult {
    pub name: String,
    pub command: String,
    pub outputs: Vec<HostOutput>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HookRunResult {
    pub anchor: String,
    pub when: When,
    pub tasks: Vec<HookTaskResult>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `task` to the chain for `anchor`/`when`.
    pub fn register(&mut self, anchor: &str, when: When, task: HookTask) -> Result<HookHandle> {
        let anchor = lifecycle::normalize_anchor(anchor).ok_or_else(|| {
            Error::config_unknown_anchor(
                anchor,
                lifecycle::known_anchors()
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            )
        })?;

        if task.command.trim().is_empty() {
            return Err(Error::config_invalid_value(
                format!("tasks.{}.command", task.name),
                None,
                "command must not be empty",
            ));
        }

        let chain = self.chains.entry(anchor).or_default().side_mut(when);
        chain.push(task);

        Ok(HookHandle {
            anchor,
            when,
            position: chain.len() - 1,
        })
    }

    pub fn before(&mut self, anchor: &str, task: HookTask) -> Result<HookHandle> {
        self.register(anchor, When::Before, task)
    }

    pub fn after(&mut self, anchor: &str, task: HookTask) -> Result<HookHandle> {
        self.register(anchor, When::After, task)
    }

    /// Tasks registered for `anchor`/`when`, in order.
    pub fn tasks(&self, anchor: &str, when: When) -> &[HookTask] {
        lifecycle::normalize_anchor(anchor)
            .and_then(|anchor| self.chains.get(anchor))
            .map(|chains| chains.side(when).as_slice())
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.chains
            .values()
            .all(|c| c.before.is_empty() && c.after.is_empty())
    }

    /// Every registered task with its anchor and side, in lifecycle order.
    pub fn all(&self) -> Vec<(&'static str, When, &HookTask)> {
        let mut all = Vec::new();
        for anchor in lifecycle::known_anchors() {
            for when in [When::Before, When::After] {
                for task in self.tasks(anchor, when) {
                    all.push((anchor, when, task));
                }
            }
        }
        all
    }

    /// Render a task: resolve its role, command, working directory and env.
    pub fn plan_task(&self, task: &HookTask, ctx: &HookContext<'_>) -> Result<PlannedTask> {
        let hosts = ctx.roles.resolve(&task.role).map_err(|err| {
            if err.code == crate::error::ErrorCode::ConfigEmptyRole {
                Error::config_empty_role(&task.role, Some(task.name.clone()))
            } else {
                err
            }
        })?;

        let command = render_strict(&task.command, ctx.vars, &task.name, "command")?;
        let cwd = match &task.within {
            Some(within) => Some(render_strict(within, ctx.vars, &task.name, "within")?),
            None => ctx.default_cwd.map(str::to_string),
        };

        let mut env = ctx.env.clone();
        for (key, value) in &task.env {
            env.insert(key.clone(), value.clone());
        }
        for (key, value) in env.iter_mut() {
            *value = render_strict(value, ctx.vars, &task.name, &format!("env.{}", key))?;
        }

        Ok(PlannedTask {
            name: task.name.clone(),
            role: task.role.clone(),
            hosts: hosts.into_iter().map(|h| h.id).collect(),
            command,
            cwd,
            env,
        })
    }

    /// Run every task for `anchor`/`when` in order, stopping at the first
    /// failure. The returned error carries the anchor and task name.
    pub fn fire(&self, anchor: &str, when: When, ctx: &HookContext<'_>) -> Result<HookRunResult> {
        let canonical = lifecycle::normalize_anchor(anchor).unwrap_or("");
        let mut results = Vec::new();

        for task in self.tasks(anchor, when) {
            log_status!("hook", "{} {}: {}", when, canonical, task.name);

            let planned = self
                .plan_task(task, ctx)
                .map_err(|err| annotate(err, canonical, when, &task.name))?;
            let hosts = ctx.roles.resolve(&planned.role)?;

            let outputs = ctx
                .executor
                .run(&hosts, &planned.command, planned.cwd.as_deref(), &planned.env)
                .map_err(|err| annotate(err, canonical, when, &task.name))?;

            results.push(HookTaskResult {
                name: task.name.clone(),
                command: planned.command,
                outputs,
            });
        }

        Ok(HookRunResult {
            anchor: canonical.to_string(),
            when,
            tasks: results,
        })
    }
}

fn render_strict(
    value: &str,
    vars: &HashMap<String, String>,
    task: &str,
    field: &str,
) -> Result<String> {
    template::render_checked(value, vars).map_err(|missing| {
        Error::config_invalid_value(
            format!("tasks.{}.{}", task, field),
            Some(value.to_string()),
            format!("unresolved template variable(s): {}", missing.join(", ")),
        )
    })
}

fn annotate(mut err: Error, anchor: &str, when: When, task: &str) -> Error {
    if let serde_json::Value::Object(map) = &mut err.details {
        map.insert("anchor".to_string(), anchor.into());
        if let Some(stage) = lifecycle::stage_of(anchor) {
            map.insert("stage".to_string(), stage.as_str().into());
        }
        map.insert("when".to_string(), when.as_str().into());
        map.insert("task".to_string(), task.into());
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::ScriptedTransport;
    use crate::host::Host;
    use std::sync::Arc;

    fn roles() -> Roles {
        let mut table = BTreeMap::new();
        table.insert("yarn_roles".to_string(), vec!["web1".to_string(), "web2".to_string()]);
        table.insert("empty".to_string(), Vec::new());
        Roles::new(vec![Host::local("web1"), Host::local("web2")], &table).unwrap()
    }

    fn vars() -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("release_path".to_string(), "/srv/app/releases/1".to_string());
        vars.insert("yarn_bin".to_string(), "yarn".to_string());
        vars
    }

    #[test]
    fn register_preserves_order_and_returns_positions() {
        let mut registry = HookRegistry::new();
        let first = registry
            .before("symlink:release", HookTask::new("a", "all", "echo a"))
            .unwrap();
        let second = registry
            .before("deploy:symlink:release", HookTask::new("b", "all", "echo b"))
            .unwrap();

        assert_eq!(first.position, 0);
        assert_eq!(second.position, 1);
        assert_eq!(second.anchor, "symlink:release");
        let names: Vec<&str> = registry
            .tasks("symlink:release", When::Before)
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(registry.tasks("symlink:release", When::After).is_empty());
    }

    #[test]
    fn register_rejects_unknown_anchor() {
        let mut registry = HookRegistry::new();
        let err = registry
            .after("deploy:migrate", HookTask::new("m", "all", "rake db:migrate"))
            .unwrap_err();
        assert_eq!(err.code.as_str(), "config.unknown_anchor");
        assert!(registry.is_empty());
    }

    #[test]
    fn fire_runs_tasks_in_release_path_by_default() {
        let transport = Arc::new(ScriptedTransport::default());
        let executor = RemoteExecutor::new(transport.clone(), None);
        let roles = roles();
        let vars = vars();
        let env = BTreeMap::new();
        let ctx = HookContext {
            roles: &roles,
            executor: &executor,
            vars: &vars,
            default_cwd: Some("/srv/app/releases/1"),
            env: &env,
        };

        let mut registry = HookRegistry::new();
        registry
            .before("symlink:release", HookTask::new("yarn_deploy", "yarn_roles", "{{yarn_bin}} run build"))
            .unwrap();

        let result = registry.fire("symlink:release", When::Before, &ctx).unwrap();

        assert_eq!(result.tasks.len(), 1);
        assert_eq!(result.tasks[0].outputs.len(), 2);
        assert_eq!(
            transport.commands_for("web1"),
            vec!["cd '/srv/app/releases/1' && yarn run build".to_string()]
        );
    }

    #[test]
    fn fire_honours_within_override_and_env() {
        let transport = Arc::new(ScriptedTransport::default());
        let executor = RemoteExecutor::new(transport.clone(), None);
        let roles = roles();
        let vars = vars();
        let mut env = BTreeMap::new();
        env.insert("NODE_ENV".to_string(), "production".to_string());
        let ctx = HookContext {
            roles: &roles,
            executor: &executor,
            vars: &vars,
            default_cwd: Some("/srv/app/releases/1"),
            env: &env,
        };

        let mut registry = HookRegistry::new();
        registry
            .after(
                "publishing",
                HookTask::new("build", "all", "make")
                    .within("{{release_path}}/web")
                    .env("NODE_ENV", "test"),
            )
            .unwrap();

        registry.fire("publishing", When::After, &ctx).unwrap();

        assert_eq!(
            transport.commands_for("web2"),
            vec!["cd '/srv/app/releases/1/web' && export NODE_ENV=test && make".to_string()]
        );
    }

    #[test]
    fn fire_stops_at_first_failure() {
        let transport = Arc::new(ScriptedTransport::failing_on("web2", "false-step"));
        let executor = RemoteExecutor::new(transport.clone(), None);
        let roles = roles();
        let vars = vars();
        let env = BTreeMap::new();
        let ctx = HookContext {
            roles: &roles,
            executor: &executor,
            vars: &vars,
            default_cwd: None,
            env: &env,
        };

        let mut registry = HookRegistry::new();
        registry.before("finishing", HookTask::new("one", "all", "false-step")).unwrap();
        registry.before("finishing", HookTask::new("two", "all", "echo never")).unwrap();

        let err = registry.fire("finishing", When::Before, &ctx).unwrap_err();

        assert_eq!(err.code.as_str(), "remote.command_failed");
        assert_eq!(err.details["task"], "one");
        assert_eq!(err.details["anchor"], "finishing");
        assert_eq!(err.details["stage"], "finishing");
        assert_eq!(err.details["host"], "web2");
        assert!(transport
            .calls
            .lock()
            .unwrap()
            .iter()
            .all(|(_, c)| !c.contains("never")));
    }

    #[test]
    fn empty_role_fails_before_running() {
        let transport = Arc::new(ScriptedTransport::default());
        let executor = RemoteExecutor::new(transport.clone(), None);
        let roles = roles();
        let vars = vars();
        let env = BTreeMap::new();
        let ctx = HookContext {
            roles: &roles,
            executor: &executor,
            vars: &vars,
            default_cwd: None,
            env: &env,
        };

        let mut registry = HookRegistry::new();
        registry.after("updating", HookTask::new("noop", "empty", "true")).unwrap();

        let err = registry.fire("updating", When::After, &ctx).unwrap_err();
        assert_eq!(err.code.as_str(), "config.empty_role");
        assert_eq!(err.details["task"], "noop");
        assert!(transport.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn unknown_template_variable_is_configuration_error() {
        let executor = RemoteExecutor::new(Arc::new(ScriptedTransport::default()), None);
        let roles = roles();
        let vars = vars();
        let env = BTreeMap::new();
        let ctx = HookContext {
            roles: &roles,
            executor: &executor,
            vars: &vars,
            default_cwd: None,
            env: &env,
        };

        let task = HookTask::new("t", "all", "{{yarn_binary}} build");
        let err = HookRegistry::new().plan_task(&task, &ctx).unwrap_err();
        assert!(err.code.is_configuration());
    }

    #[test]
    fn setting_that_expands_to_a_missing_variable_is_rejected() {
        let transport = Arc::new(ScriptedTransport::default());
        let executor = RemoteExecutor::new(transport.clone(), None);
        let roles = roles();
        let mut vars = HashMap::new();
        vars.insert("yarn_target_path".to_string(), "{{release_path}}".to_string());
        let env = BTreeMap::new();
        let ctx = HookContext {
            roles: &roles,
            executor: &executor,
            vars: &vars,
            default_cwd: None,
            env: &env,
        };

        let mut registry = HookRegistry::new();
        registry
            .before(
                "starting",
                HookTask::new("yarn_install", "all", "yarn install").within("{{yarn_target_path}}"),
            )
            .unwrap();

        let err = registry.fire("starting", When::Before, &ctx).unwrap_err();
        assert_eq!(err.code.as_str(), "config.invalid_value");
        assert_eq!(err.details["task"], "yarn_install");
        assert!(transport.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn env_values_are_rendered_strictly() {
        let executor = RemoteExecutor::new(Arc::new(ScriptedTransport::default()), None);
        let roles = roles();
        let vars = vars();
        let mut env = BTreeMap::new();
        env.insert("NODE_OPTIONS".to_string(), "{{node_opts}}".to_string());
        let ctx = HookContext {
            roles: &roles,
            executor: &executor,
            vars: &vars,
            default_cwd: None,
            env: &env,
        };

        let task = HookTask::new("build", "all", "{{yarn_bin}} run build");
        let err = HookRegistry::new().plan_task(&task, &ctx).unwrap_err();
        assert_eq!(err.code.as_str(), "config.invalid_value");
        assert_eq!(err.details["key"], "tasks.build.env.NODE_OPTIONS");
        assert!(err.message.contains("node_opts"));

        let task = HookTask::new("build", "all", "make").env("NODE_OPTIONS", "{{yarn_bin}}");
        let planned = HookRegistry::new().plan_task(&task, &ctx).unwrap();
        assert_eq!(planned.env["NODE_OPTIONS"], "yarn");
    }
}
