//! String template rendering utilities.
//!
//! Placeholders use `{{key}}` syntax.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

pub struct TemplateVars;

impl TemplateVars {
    pub const APPLICATION: &'static str = "application";
    pub const REPO_URL: &'static str = "repo_url";
    pub const BRANCH: &'static str = "branch";
    pub const DEPLOY_TO: &'static str = "deploy_to";
    pub const RELEASE_ID: &'static str = "release_id";
    pub const RELEASE_PATH: &'static str = "release_path";
    pub const CURRENT_PATH: &'static str = "current_path";
    pub const SHARED_PATH: &'static str = "shared_path";
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("valid placeholder regex")
    })
}

pub fn render_map(template: &str, variables: &HashMap<String, String>) -> String {
    placeholder_pattern()
        .replace_all(template, |caps: &regex::Captures| {
            variables
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Every placeholder name in `template`, first occurrence order.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in placeholder_pattern().captures_iter(template) {
        if !names.iter().any(|n| n == &caps[1]) {
            names.push(caps[1].to_string());
        }
    }
    names
}

/// Render `template` in one pass and return the placeholders still in the
/// output, whether unknown or brought in by a substituted value.
pub fn render_checked(
    template: &str,
    variables: &HashMap<String, String>,
) -> std::result::Result<String, Vec<String>> {
    let rendered = render_map(template, variables);
    let leftover = placeholders(&rendered);
    if leftover.is_empty() {
        Ok(rendered)
    } else {
        Err(leftover)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn render_replaces_known_keys() {
        let rendered = render_map(
            "{{yarn_bin}} run build {{ yarn_flags }}",
            &vars(&[("yarn_bin", "yarn"), ("yarn_flags", "--silent")]),
        );
        assert_eq!(rendered, "yarn run build --silent");
    }

    #[test]
    fn render_leaves_unknown_keys() {
        let rendered = render_map("cd {{release_path}}", &vars(&[]));
        assert_eq!(rendered, "cd {{release_path}}");
    }

    #[test]
    fn placeholders_lists_each_name_once() {
        assert_eq!(
            placeholders("{{yarn_bin}} {{ release_path }} {{yarn_bin}}"),
            vec!["yarn_bin".to_string(), "release_path".to_string()]
        );
    }

    #[test]
    fn render_checked_catches_placeholders_from_values() {
        let nested = vars(&[("yarn_target_path", "{{release_path}}")]);
        assert_eq!(
            render_checked("cd {{yarn_target_path}}", &nested),
            Err(vec!["release_path".to_string()])
        );
        assert_eq!(
            render_checked("{{node_opts}}", &vars(&[])),
            Err(vec!["node_opts".to_string()])
        );
        assert_eq!(
            render_checked("cd {{release_path}}", &vars(&[("release_path", "/srv/r/1")])),
            Ok("cd /srv/r/1".to_string())
        );
    }

    #[test]
    fn empty_values_render_as_empty() {
        let rendered = render_map("yarn install {{yarn_flags}}", &vars(&[("yarn_flags", "")]));
        assert_eq!(rendered, "yarn install ");
    }
}
