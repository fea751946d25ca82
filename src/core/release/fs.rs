//! Filesystem primitives on a single deploy host.
//!
//! Paths are POSIX strings as seen on the host. `LocalFs` maps them onto the
//! local filesystem (optionally below a prefix directory); `ShellFs` turns
//! each primitive into one shell command sent over a `Transport`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::executor::Transport;
use crate::host::Host;
use crate::ssh::ExecOptions;
use crate::utils::shell::quote_path;

pub trait HostFs: Send + Sync {
    /// Id of the host this filesystem belongs to, used in error reports.
    fn host(&self) -> &str;

    /// Create a single directory. Returns `false` if the path already
    /// exists; the check and the creation are one atomic step.
    fn create_dir(&self, path: &str) -> Result<bool>;

    fn create_dir_all(&self, path: &str) -> Result<()>;

    /// True for any entry at `path`, including dangling symlinks.
    fn exists(&self, path: &str) -> Result<bool>;

    /// Entry names in a directory; empty when the directory is missing.
    fn list_dir(&self, path: &str) -> Result<Vec<String>>;

    /// Target of a symlink, `None` when `path` is missing or not a symlink.
    fn read_link(&self, path: &str) -> Result<Option<String>>;

    fn symlink(&self, target: &str, link: &str) -> Result<()>;

    /// Rename `from` onto `to`, replacing `to` in one step.
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Remove an entry recursively without following symlinks. Missing
    /// entries are not an error.
    fn remove_all(&self, path: &str) -> Result<()>;

    fn write_file(&self, path: &str, content: &str) -> Result<()>;

    fn read_file(&self, path: &str) -> Result<Option<String>>;
}

// ============================================================================
// Local
// ============================================================================

/// Host filesystem backed by `std::fs`.
#[derive(Debug, Clone)]
pub struct LocalFs {
    host: String,
    prefix: Option<PathBuf>,
}

impl LocalFs {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            prefix: None,
        }
    }

    /// Resolve every host path below `prefix`, so `/srv/app` becomes
    /// `<prefix>/srv/app`. Symlink targets are written verbatim.
    pub fn under(host: impl Into<String>, prefix: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            prefix: Some(prefix.into()),
        }
    }

    pub fn resolve(&self, path: &str) -> PathBuf {
        match &self.prefix {
            Some(prefix) => prefix.join(path.trim_start_matches('/')),
            None => PathBuf::from(path),
        }
    }

    fn err(&self, operation: &str, path: &str, err: std::io::Error) -> Error {
        Error::storage(&self.host, operation, path, err.to_string())
    }
}

impl HostFs for LocalFs {
    fn host(&self) -> &str {
        &self.host
    }

    fn create_dir(&self, path: &str) -> Result<bool> {
        match fs::create_dir(self.resolve(path)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(self.err("create_dir", path, e)),
        }
    }

    fn create_dir_all(&self, path: &str) -> Result<()> {
        fs::create_dir_all(self.resolve(path)).map_err(|e| self.err("create_dir_all", path, e))
    }

    fn exists(&self, path: &str) -> Result<bool> {
        match fs::symlink_metadata(self.resolve(path)) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.err("exists", path, e)),
        }
    }

    fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let entries = match fs::read_dir(self.resolve(path)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.err("list_dir", path, e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| self.err("list_dir", path, e))?;
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    fn read_link(&self, path: &str) -> Result<Option<String>> {
        let resolved = self.resolve(path);
        match fs::symlink_metadata(&resolved) {
            Ok(meta) if meta.file_type().is_symlink() => {}
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.err("read_link", path, e)),
        }

        fs::read_link(&resolved)
            .map(|target| Some(target.to_string_lossy().to_string()))
            .map_err(|e| self.err("read_link", path, e))
    }

    fn symlink(&self, target: &str, link: &str) -> Result<()> {
        #[cfg(unix)]
        let result = std::os::unix::fs::symlink(Path::new(target), self.resolve(link));

        #[cfg(windows)]
        let result = std::os::windows::fs::symlink_dir(Path::new(target), self.resolve(link));

        result.map_err(|e| self.err("symlink", link, e))
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        fs::rename(self.resolve(from), self.resolve(to)).map_err(|e| self.err("rename", to, e))
    }

    fn remove_all(&self, path: &str) -> Result<()> {
        let resolved = self.resolve(path);
        let meta = match fs::symlink_metadata(&resolved) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(self.err("remove", path, e)),
        };

        let result = if meta.is_dir() {
            fs::remove_dir_all(&resolved)
        } else {
            fs::remove_file(&resolved)
        };
        result.map_err(|e| self.err("remove", path, e))
    }

    fn write_file(&self, path: &str, content: &str) -> Result<()> {
        fs::write(self.resolve(path), content).map_err(|e| self.err("write_file", path, e))
    }

    fn read_file(&self, path: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.resolve(path)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.err("read_file", path, e)),
        }
    }
}

// ============================================================================
// Remote (shell commands)
// ============================================================================

/// Host filesystem driven by POSIX shell commands over a transport.
///
/// `rename` relies on `mv -T` (GNU coreutils) to replace a symlink that
/// points at a directory instead of moving into it.
pub struct ShellFs {
    host: Host,
    transport: Arc<dyn Transport>,
    options: ExecOptions,
}

impl ShellFs {
    pub fn new(host: Host, transport: Arc<dyn Transport>, options: ExecOptions) -> Self {
        Self {
            host,
            transport,
            options,
        }
    }

    fn run(&self, operation: &str, path: &str, command: &str) -> Result<String> {
        let output = self.transport.execute(&self.host, command, &self.options);
        if !output.success {
            let detail = if output.stderr.trim().is_empty() {
                output.stdout
            } else {
                output.stderr
            };
            return Err(Error::storage(
                &self.host.id,
                operation,
                path,
                detail.trim().to_string(),
            ));
        }
        Ok(output.stdout)
    }
}

impl HostFs for ShellFs {
    fn host(&self) -> &str {
        &self.host.id
    }

    fn create_dir(&self, path: &str) -> Result<bool> {
        let p = quote_path(path);
        let command = format!(
            "if mkdir {p} 2>/dev/null; then echo created; elif [ -e {p} ] || [ -L {p} ]; then echo exists; else mkdir {p}; fi",
            p = p
        );
        Ok(self.run("create_dir", path, &command)?.trim() == "created")
    }

    fn create_dir_all(&self, path: &str) -> Result<()> {
        self.run("create_dir_all", path, &format!("mkdir -p {}", quote_path(path)))
            .map(|_| ())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let p = quote_path(path);
        let command = format!(
            "if [ -e {p} ] || [ -L {p} ]; then echo yes; else echo no; fi",
            p = p
        );
        Ok(self.run("exists", path, &command)?.trim() == "yes")
    }

    fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let p = quote_path(path);
        let command = format!("if [ -d {p} ]; then ls -1A {p}; fi", p = p);
        let mut names: Vec<String> = self
            .run("list_dir", path, &command)?
            .lines()
            .map(|line| line.trim_end().to_string())
            .filter(|line| !line.is_empty())
            .collect();
        names.sort();
        Ok(names)
    }

    fn read_link(&self, path: &str) -> Result<Option<String>> {
        let p = quote_path(path);
        let command = format!("if [ -L {p} ]; then readlink {p}; fi", p = p);
        let target = self.run("read_link", path, &command)?.trim_end().to_string();
        Ok(if target.is_empty() { None } else { Some(target) })
    }

    fn symlink(&self, target: &str, link: &str) -> Result<()> {
        let command = format!("ln -s {} {}", quote_path(target), quote_path(link));
        self.run("symlink", link, &command).map(|_| ())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let command = format!("mv -fT {} {}", quote_path(from), quote_path(to));
        self.run("rename", to, &command).map(|_| ())
    }

    fn remove_all(&self, path: &str) -> Result<()> {
        self.run("remove", path, &format!("rm -rf {}", quote_path(path)))
            .map(|_| ())
    }

    fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let command = format!("printf '%s' {} > {}", quote_path(content), quote_path(path));
        self.run("write_file", path, &command).map(|_| ())
    }

    fn read_file(&self, path: &str) -> Result<Option<String>> {
        // Leading marker distinguishes an empty file from a missing one.
        let p = quote_path(path);
        let command = format!("if [ -f {p} ]; then printf F; cat {p}; fi", p = p);
        let output = self.run("read_file", path, &command)?;
        Ok(output.strip_prefix('F').map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::ScriptedTransport;
    use tempfile::TempDir;

    #[test]
    fn local_create_dir_reports_existing() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFs::under("web1", dir.path());

        assert!(fs.create_dir("/releases").unwrap());
        assert!(!fs.create_dir("/releases").unwrap());
        assert!(dir.path().join("releases").is_dir());
    }

    #[test]
    fn local_read_link_ignores_regular_entries() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFs::under("web1", dir.path());
        fs.create_dir_all("/srv/app").unwrap();
        fs.symlink("releases/1", "/srv/app/current").unwrap();

        assert_eq!(fs.read_link("/srv/app/current").unwrap().as_deref(), Some("releases/1"));
        assert_eq!(fs.read_link("/srv/app").unwrap(), None);
        assert_eq!(fs.read_link("/srv/missing").unwrap(), None);
        // Dangling links still exist.
        assert!(fs.exists("/srv/app/current").unwrap());
    }

    #[test]
    fn local_remove_all_does_not_follow_links() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFs::under("web1", dir.path());
        fs.create_dir_all("/shared/node_modules").unwrap();
        fs.write_file("/shared/node_modules/keep", "x").unwrap();
        let target = fs.resolve("/shared/node_modules").to_string_lossy().to_string();
        fs.symlink(&target, "/link").unwrap();

        fs.remove_all("/link").unwrap();

        assert!(!fs.exists("/link").unwrap());
        assert_eq!(fs.read_file("/shared/node_modules/keep").unwrap().as_deref(), Some("x"));
    }

    #[test]
    fn local_errors_name_the_host() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFs::under("web7", dir.path());
        fs.write_file("/blocker", "").unwrap();

        let err = fs.create_dir("/blocker/releases").unwrap_err();
        assert_eq!(err.code.as_str(), "storage.failed");
        assert_eq!(err.details["host"], "web7");
    }

    #[test]
    fn shell_fs_quotes_paths() {
        let transport = Arc::new(ScriptedTransport::default());
        let fs = ShellFs::new(Host::local("web1"), transport.clone(), ExecOptions::default());

        fs.symlink("/srv/my app/shared/dist", "/srv/my app/releases/1/dist")
            .unwrap();
        fs.rename("/srv/app/releases/.current.1", "/srv/app/current")
            .unwrap();

        let commands = transport.commands_for("web1");
        assert_eq!(
            commands[0],
            "ln -s '/srv/my app/shared/dist' '/srv/my app/releases/1/dist'"
        );
        assert_eq!(commands[1], "mv -fT '/srv/app/releases/.current.1' '/srv/app/current'");
    }

    #[test]
    fn shell_fs_failure_is_storage_error() {
        let transport = Arc::new(ScriptedTransport::failing_on("web1", "mkdir -p"));
        let fs = ShellFs::new(Host::local("web1"), transport, ExecOptions::default());

        let err = fs.create_dir_all("/srv/app/releases").unwrap_err();
        assert_eq!(err.code.as_str(), "storage.failed");
        assert_eq!(err.details["operation"], "create_dir_all");
        assert_eq!(err.details["error"], "build failed");
    }

    #[test]
    fn shell_fs_round_trips_through_a_real_shell() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_string_lossy().to_string();
        let fs = ShellFs::new(
            Host::local("dev"),
            Arc::new(crate::executor::SshTransport::new(false)),
            ExecOptions::default(),
        );

        let releases = format!("{}/releases", root);
        assert!(fs.create_dir(&releases).unwrap());
        assert!(!fs.create_dir(&releases).unwrap());
        fs.create_dir_all(&format!("{}/a", releases)).unwrap();
        fs.write_file(&format!("{}/a/REVISION", releases), "").unwrap();

        assert_eq!(fs.list_dir(&releases).unwrap(), vec!["a".to_string()]);
        assert_eq!(
            fs.read_file(&format!("{}/a/REVISION", releases)).unwrap().as_deref(),
            Some("")
        );
        assert_eq!(fs.read_file(&format!("{}/missing", root)).unwrap(), None);
    }
}
