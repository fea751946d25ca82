use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigMissingKey,
    ConfigInvalidJson,
    ConfigInvalidToml,
    ConfigInvalidValue,
    ConfigNotFound,
    ConfigEmptyRole,
    ConfigUnknownAnchor,

    ValidationInvalidArgument,

    SshIdentityFileNotFound,

    RemoteCommandFailed,
    RemoteCommandTimeout,

    StorageFailed,
    StorageLinkedFileMissing,
    StorageNoPreviousRelease,

    DeployLockContention,
    DeployCancelled,

    InternalIoError,
    InternalJsonError,
    InternalUnexpected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigMissingKey => "config.missing_key",
            ErrorCode::ConfigInvalidJson => "config.invalid_json",
            ErrorCode::ConfigInvalidToml => "config.invalid_toml",
            ErrorCode::ConfigInvalidValue => "config.invalid_value",
            ErrorCode::ConfigNotFound => "config.not_found",
            ErrorCode::ConfigEmptyRole => "config.empty_role",
            ErrorCode::ConfigUnknownAnchor => "config.unknown_anchor",

            ErrorCode::ValidationInvalidArgument => "validation.invalid_argument",

            ErrorCode::SshIdentityFileNotFound => "ssh.identity_file_not_found",

            ErrorCode::RemoteCommandFailed => "remote.command_failed",
            ErrorCode::RemoteCommandTimeout => "remote.command_timeout",

            ErrorCode::StorageFailed => "storage.failed",
            ErrorCode::StorageLinkedFileMissing => "storage.linked_file_missing",
            ErrorCode::StorageNoPreviousRelease => "storage.no_previous_release",

            ErrorCode::DeployLockContention => "deploy.lock_contention",
            ErrorCode::DeployCancelled => "deploy.cancelled",

            ErrorCode::InternalIoError => "internal.io_error",
            ErrorCode::InternalJsonError => "internal.json_error",
            ErrorCode::InternalUnexpected => "internal.unexpected",
        }
    }

    /// Configuration problems are detected before any remote action.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ErrorCode::ConfigMissingKey
                | ErrorCode::ConfigInvalidJson
                | ErrorCode::ConfigInvalidToml
                | ErrorCode::ConfigInvalidValue
                | ErrorCode::ConfigNotFound
                | ErrorCode::ConfigEmptyRole
                | ErrorCode::ConfigUnknownAnchor
                | ErrorCode::ValidationInvalidArgument
                | ErrorCode::SshIdentityFileNotFound
        )
    }

    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            ErrorCode::RemoteCommandFailed | ErrorCode::RemoteCommandTimeout
        )
    }

    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            ErrorCode::StorageFailed
                | ErrorCode::StorageLinkedFileMissing
                | ErrorCode::StorageNoPreviousRelease
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMissingKeyDetails {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigParseDetails {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigInvalidValueDetails {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub problem: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidArgumentDetails {
    pub field: String,
    pub problem: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tried: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalIoErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Captured output of the first host that failed a remote command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCommandFailedDetails {
    pub host: String,
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_hosts: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageFailedDetails {
    pub host: String,
    pub operation: String,
    pub path: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockContentionDetails {
    pub host: String,
    pub lock_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
    pub hints: Vec<Hint>,
    pub retryable: Option<bool>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

fn to_details<T: Serialize>(details: T) -> Value {
    serde_json::to_value(details).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            hints: Vec::new(),
            retryable: None,
        }
    }

    pub fn validation_invalid_argument(
        field: impl Into<String>,
        problem: impl Into<String>,
        tried: Option<Vec<String>>,
    ) -> Self {
        let problem = problem.into();
        let details = to_details(InvalidArgumentDetails {
            field: field.into(),
            problem: problem.clone(),
            tried,
        });
        Self::new(ErrorCode::ValidationInvalidArgument, problem, details)
    }

    pub fn config_missing_key(key: impl Into<String>, path: Option<String>) -> Self {
        let key = key.into();
        let details = to_details(ConfigMissingKeyDetails {
            key: key.clone(),
            path,
        });
        Self::new(
            ErrorCode::ConfigMissingKey,
            format!("Missing required configuration key '{}'", key),
            details,
        )
    }

    pub fn config_invalid_json(path: impl Into<String>, err: serde_json::Error) -> Self {
        let details = to_details(ConfigParseDetails {
            path: path.into(),
            error: err.to_string(),
        });
        Self::new(
            ErrorCode::ConfigInvalidJson,
            "Invalid JSON in configuration",
            details,
        )
    }

    pub fn config_invalid_toml(path: impl Into<String>, err: toml::de::Error) -> Self {
        let details = to_details(ConfigParseDetails {
            path: path.into(),
            error: err.to_string(),
        });
        Self::new(
            ErrorCode::ConfigInvalidToml,
            "Invalid TOML in configuration",
            details,
        )
    }

    pub fn config_invalid_value(
        key: impl Into<String>,
        value: Option<String>,
        problem: impl Into<String>,
    ) -> Self {
        let key = key.into();
        let problem = problem.into();
        let details = to_details(ConfigInvalidValueDetails {
            key: key.clone(),
            value,
            problem: problem.clone(),
        });
        Self::new(
            ErrorCode::ConfigInvalidValue,
            format!("Invalid configuration value for '{}': {}", key, problem),
            details,
        )
    }

    pub fn config_not_found(tried: Vec<String>) -> Self {
        Self::new(
            ErrorCode::ConfigNotFound,
            "No deploy configuration found",
            serde_json::json!({ "tried": tried }),
        )
        .with_hint("Create deploy.json in the working directory or pass --config <path>")
    }

    pub fn config_empty_role(role: impl Into<String>, task: Option<String>) -> Self {
        let role = role.into();
        Self::new(
            ErrorCode::ConfigEmptyRole,
            format!("Role '{}' does not resolve to any host", role),
            serde_json::json!({ "role": role, "task": task }),
        )
        .with_hint("Declare the role under 'roles' with at least one host id from 'hosts'")
    }

    pub fn config_unknown_anchor(anchor: impl Into<String>, known: Vec<String>) -> Self {
        let anchor = anchor.into();
        Self::new(
            ErrorCode::ConfigUnknownAnchor,
            format!("Unknown hook anchor '{}'", anchor),
            serde_json::json!({ "anchor": anchor, "known": known }),
        )
    }

    pub fn ssh_identity_file_not_found(
        host_id: impl Into<String>,
        identity_file: impl Into<String>,
    ) -> Self {
        Self::new(
            ErrorCode::SshIdentityFileNotFound,
            "SSH identity file not found",
            serde_json::json!({
                "hostId": host_id.into(),
                "identityFile": identity_file.into(),
            }),
        )
    }

    pub fn remote_command_failed(details: RemoteCommandFailedDetails) -> Self {
        let message = format!(
            "Command failed on host '{}' (exit {})",
            details.host, details.exit_code
        );
        Self::new(ErrorCode::RemoteCommandFailed, message, to_details(details))
    }

    pub fn remote_command_timeout(details: RemoteCommandFailedDetails) -> Self {
        let message = format!("Command timed out on host '{}'", details.host);
        Self::new(ErrorCode::RemoteCommandTimeout, message, to_details(details))
    }

    pub fn storage(
        host: impl Into<String>,
        operation: impl Into<String>,
        path: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        let host = host.into();
        let operation = operation.into();
        let message = format!("Storage operation '{}' failed on host '{}'", operation, host);
        let details = to_details(StorageFailedDetails {
            host,
            operation,
            path: path.into(),
            error: error.into(),
        });
        Self::new(ErrorCode::StorageFailed, message, details)
    }

    pub fn storage_linked_file_missing(host: impl Into<String>, path: impl Into<String>) -> Self {
        let host = host.into();
        let path = path.into();
        Self::new(
            ErrorCode::StorageLinkedFileMissing,
            format!("Linked file '{}' does not exist on host '{}'", path, host),
            serde_json::json!({ "host": host, "path": path }),
        )
        .with_hint("Upload the file into the shared directory before deploying")
    }

    pub fn storage_no_previous_release(host: impl Into<String>) -> Self {
        let host = host.into();
        Self::new(
            ErrorCode::StorageNoPreviousRelease,
            format!("No release older than the active one on host '{}'", host),
            serde_json::json!({ "host": host }),
        )
    }

    pub fn lock_contention(
        host: impl Into<String>,
        lock_path: impl Into<String>,
        owner: Option<String>,
    ) -> Self {
        let details = to_details(LockContentionDetails {
            host: host.into(),
            lock_path: lock_path.into(),
            owner,
        });
        let mut err = Self::new(
            ErrorCode::DeployLockContention,
            "Another deployment holds the deploy lock",
            details,
        )
        .with_hint("Wait for the running deployment to finish, or remove a stale lock directory");
        err.retryable = Some(true);
        err
    }

    pub fn cancelled(stage: impl Into<String>) -> Self {
        let stage = stage.into();
        Self::new(
            ErrorCode::DeployCancelled,
            format!("Deployment cancelled before stage '{}'", stage),
            serde_json::json!({ "stage": stage }),
        )
    }

    pub fn internal_io(error: impl Into<String>, context: Option<String>) -> Self {
        let details = to_details(InternalIoErrorDetails {
            error: error.into(),
            context,
        });
        Self::new(ErrorCode::InternalIoError, "IO error", details)
    }

    pub fn internal_json(error: impl Into<String>, context: Option<String>) -> Self {
        Self::new(
            ErrorCode::InternalJsonError,
            "JSON error",
            serde_json::json!({ "error": error.into(), "context": context }),
        )
    }

    pub fn internal_unexpected(error: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InternalUnexpected,
            "Unexpected error",
            serde_json::json!({ "error": error.into() }),
        )
    }

    pub fn with_hint(mut self, message: impl Into<String>) -> Self {
        self.hints.push(Hint {
            message: message.into(),
        });
        self
    }
}
