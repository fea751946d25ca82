use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::defaults;
use crate::error::{Error, Result};

/// Host entry as written in the deploy configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostConfig {
    pub address: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "defaults::ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub identity_file: Option<String>,
}

/// A resolved deployment target.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Host {
    pub id: String,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,
}

impl Host {
    pub fn from_config(id: &str, config: &HostConfig) -> Result<Self> {
        if config.address.trim().is_empty() {
            return Err(Error::config_invalid_value(
                format!("hosts.{}.address", id),
                None,
                "host address must not be empty",
            ));
        }

        let identity_file = match &config.identity_file {
            Some(path) if !path.is_empty() => {
                let expanded = shellexpand::tilde(path).to_string();
                if !Path::new(&expanded).exists() {
                    return Err(Error::ssh_identity_file_not_found(id, expanded));
                }
                Some(expanded)
            }
            _ => None,
        };

        Ok(Self {
            id: id.to_string(),
            address: config.address.clone(),
            user: config.user.clone().filter(|u| !u.is_empty()),
            port: config.port,
            identity_file,
        })
    }

    /// Host with no SSH settings, used for localhost targets and tests.
    pub fn local(id: &str) -> Self {
        Self {
            id: id.to_string(),
            address: "localhost".to_string(),
            user: None,
            port: defaults::ssh_port(),
            identity_file: None,
        }
    }

    pub fn is_local(&self) -> bool {
        is_local_address(&self.address)
    }

    /// `user@address`, or the bare address when no user is configured.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.address),
            None => self.address.clone(),
        }
    }
}

/// Check if a host address refers to the local machine.
pub fn is_local_address(address: &str) -> bool {
    matches!(address, "localhost" | "127.0.0.1" | "::1")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(address: &str, user: Option<&str>) -> HostConfig {
        HostConfig {
            address: address.to_string(),
            user: user.map(str::to_string),
            port: 22,
            identity_file: None,
        }
    }

    #[test]
    fn destination_includes_user_when_present() {
        let host = Host::from_config("web1", &config("10.0.0.5", Some("deploy"))).unwrap();
        assert_eq!(host.destination(), "deploy@10.0.0.5");

        let host = Host::from_config("web1", &config("10.0.0.5", None)).unwrap();
        assert_eq!(host.destination(), "10.0.0.5");
    }

    #[test]
    fn localhost_addresses_are_local() {
        assert!(Host::local("dev").is_local());
        assert!(is_local_address("127.0.0.1"));
        assert!(!is_local_address("example.com"));
    }

    #[test]
    fn missing_identity_file_is_rejected() {
        let mut cfg = config("example.com", Some("deploy"));
        cfg.identity_file = Some("/nonexistent/key/id_ed25519".to_string());
        let err = Host::from_config("web1", &cfg).unwrap_err();
        assert_eq!(err.code.as_str(), "ssh.identity_file_not_found");
    }

    #[test]
    fn empty_address_is_rejected() {
        let err = Host::from_config("web1", &config("  ", None)).unwrap_err();
        assert_eq!(err.code.as_str(), "config.invalid_value");
    }
}
