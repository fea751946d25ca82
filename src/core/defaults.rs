//! Built-in default values for deploy configuration.
//!
//! Every `#[serde(default = ...)]` in `config` points here so the effective
//! defaults can be inspected in one place.

/// Config files looked up in the working directory, in order.
pub const CONFIG_CANDIDATES: &[&str] = &[
    "deploy.json",
    "deploy.toml",
    "config/deploy.json",
    "config/deploy.toml",
];

/// Role that implicitly contains every declared host.
pub const ALL_ROLE: &str = "all";

pub const RELEASES_DIR: &str = "releases";
pub const SHARED_DIR: &str = "shared";
pub const CURRENT_LINK: &str = "current";
pub const REPO_DIR: &str = "repo";
pub const REVISION_FILE: &str = "REVISION";
pub const LOCK_DIR: &str = ".cutover.lock";

/// Exit code reported for a command killed after exceeding its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported for a command interrupted by cancellation.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

pub fn branch() -> String {
    "main".to_string()
}

pub fn keep_releases() -> usize {
    5
}

pub fn pty() -> bool {
    true
}

pub fn ssh_port() -> u16 {
    22
}

pub fn command_timeout_secs() -> u64 {
    3600
}

pub fn task_role() -> String {
    ALL_ROLE.to_string()
}

pub fn deploy_to(application: &str) -> String {
    format!("/var/www/{}", application)
}
