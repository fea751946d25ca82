//! Role to host resolution.
//!
//! A role is a named group of hosts. `all` is always defined and contains
//! every declared host; other roles list host ids from the `hosts` table.

use std::collections::BTreeMap;

use crate::defaults::ALL_ROLE;
use crate::error::{Error, Result};
use crate::host::Host;

#[derive(Debug, Clone, Default)]
pub struct Roles {
    hosts: Vec<Host>,
    roles: BTreeMap<String, Vec<String>>,
}

impl Roles {
    /// Build from resolved hosts and the raw role table. Unknown host ids are
    /// a configuration error; empty roles are accepted here and rejected when
    /// resolved.
    pub fn new(hosts: Vec<Host>, roles: &BTreeMap<String, Vec<String>>) -> Result<Self> {
        for (role, members) in roles {
            for member in members {
                if !hosts.iter().any(|h| &h.id == member) {
                    return Err(Error::config_invalid_value(
                        format!("roles.{}", role),
                        Some(member.clone()),
                        format!("host '{}' is not declared under 'hosts'", member),
                    ));
                }
            }
        }

        Ok(Self {
            hosts,
            roles: roles.clone(),
        })
    }

    pub fn all(&self) -> &[Host] {
        &self.hosts
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.roles.keys().cloned().collect();
        if !names.iter().any(|n| n == ALL_ROLE) {
            names.insert(0, ALL_ROLE.to_string());
        }
        names
    }

    /// Resolve a role to its hosts in declaration order, deduplicated.
    pub fn resolve(&self, role: &str) -> Result<Vec<Host>> {
        let hosts: Vec<Host> = match self.roles.get(role) {
            Some(members) => {
                let mut seen = Vec::new();
                for member in members {
                    if seen.iter().any(|h: &Host| &h.id == member) {
                        continue;
                    }
                    if let Some(host) = self.hosts.iter().find(|h| &h.id == member) {
                        seen.push(host.clone());
                    }
                }
                seen
            }
            None if role == ALL_ROLE => self.hosts.clone(),
            None => {
                return Err(Error::config_invalid_value(
                    "role",
                    Some(role.to_string()),
                    format!("role is not defined; known roles: {}", self.names().join(", ")),
                ))
            }
        };

        if hosts.is_empty() {
            return Err(Error::config_empty_role(role, None));
        }

        Ok(hosts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles(table: &[(&str, &[&str])]) -> Result<Roles> {
        let hosts = vec![Host::local("web1"), Host::local("web2")];
        let map = table
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect();
        Roles::new(hosts, &map)
    }

    #[test]
    fn all_role_resolves_every_host() {
        let roles = roles(&[]).unwrap();
        let ids: Vec<String> = roles.resolve("all").unwrap().into_iter().map(|h| h.id).collect();
        assert_eq!(ids, vec!["web1", "web2"]);
    }

    #[test]
    fn named_role_resolves_members_once() {
        let roles = roles(&[("yarn_roles", &["web2", "web2"])]).unwrap();
        let hosts = roles.resolve("yarn_roles").unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].id, "web2");
    }

    #[test]
    fn empty_role_fails_fast() {
        let roles = roles(&[("yarn_roles", &[])]).unwrap();
        let err = roles.resolve("yarn_roles").unwrap_err();
        assert_eq!(err.code.as_str(), "config.empty_role");
    }

    #[test]
    fn undefined_role_is_a_configuration_error() {
        let roles = roles(&[]).unwrap();
        let err = roles.resolve("db").unwrap_err();
        assert!(err.code.is_configuration());
    }

    #[test]
    fn unknown_member_is_rejected() {
        let err = roles(&[("web", &["web9"])]).unwrap_err();
        assert_eq!(err.code.as_str(), "config.invalid_value");
    }
}
