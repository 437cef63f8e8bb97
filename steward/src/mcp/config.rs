//! `.mcp.json` loading and hierarchical merge.
//!
//! Multiple config paths load in order with later files overriding earlier
//! entries for the same server name. `${VAR}` references in string values
//! expand from the process environment, defaulting to the empty string.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Launch configuration for one MCP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Executable to spawn.
    pub command: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory.
    #[serde(default)]
    pub cwd: Option<String>,
}

impl ServerConfig {
    /// Create a config for `command` with `args`.
    #[must_use]
    pub fn new(command: impl Into<String>, args: &[&str]) -> Self {
        Self {
            command: command.into(),
            args: args.iter().map(|s| (*s).to_owned()).collect(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    /// Expand `${VAR}` references in every string field.
    #[must_use]
    pub fn expanded(mut self) -> Self {
        self.command = expand_env(&self.command);
        self.args = self.args.iter().map(|a| expand_env(a)).collect();
        self.env = self
            .env
            .into_iter()
            .map(|(k, v)| (k, expand_env(&v)))
            .collect();
        self.cwd = self.cwd.map(|c| expand_env(&c));
        self
    }
}

/// The `.mcp.json` document shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    /// Servers by name.
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
}

impl McpConfig {
    /// Load one config file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] when the file cannot be read or
    /// parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::invalid_request(format!("cannot read {}: {e}", path.display())))?;
        let mut config: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::invalid_request(format!("invalid {}: {e}", path.display())))?;
        config.servers = config
            .servers
            .into_iter()
            .map(|(name, server)| (name, server.expanded()))
            .collect();
        Ok(config)
    }

    /// Load several config files in order; later files win on name
    /// collisions. Missing paths are skipped.
    ///
    /// # Errors
    ///
    /// Returns the first parse error among the files that do exist.
    pub fn load_hierarchy(paths: &[&Path]) -> Result<Self> {
        let mut merged = Self::default();
        for path in paths {
            if !path.exists() {
                debug!(path = %path.display(), "skipping missing mcp config");
                continue;
            }
            let config = Self::load(path)?;
            for (name, server) in config.servers {
                merged.servers.insert(name, server);
            }
        }
        Ok(merged)
    }
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap()
    })
}

/// Expand `${VAR}` references, defaulting to the empty string.
#[must_use]
pub fn expand_env(value: &str) -> String {
    env_var_pattern()
        .replace_all(value, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parses_servers() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            ".mcp.json",
            r#"{"servers": {"fs": {"command": "mcp-fs", "args": ["--root", "/tmp"]}}}"#,
        );
        let config = McpConfig::load(&path).unwrap();
        assert_eq!(config.servers["fs"].command, "mcp-fs");
        assert_eq!(config.servers["fs"].args, vec!["--root", "/tmp"]);
    }

    #[test]
    fn later_file_wins_on_collision() {
        let dir = tempfile::tempdir().unwrap();
        let global = write_config(
            dir.path(),
            "global.json",
            r#"{"servers": {"fs": {"command": "old-fs"}, "web": {"command": "mcp-web"}}}"#,
        );
        let local = write_config(
            dir.path(),
            "local.json",
            r#"{"servers": {"fs": {"command": "new-fs"}}}"#,
        );

        let merged = McpConfig::load_hierarchy(&[&global, &local]).unwrap();
        assert_eq!(merged.servers["fs"].command, "new-fs");
        assert_eq!(merged.servers["web"].command, "mcp-web");
    }

    #[test]
    fn missing_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let real = write_config(dir.path(), "a.json", r#"{"servers": {}}"#);
        let merged =
            McpConfig::load_hierarchy(&[&dir.path().join("missing.json"), &real]).unwrap();
        assert!(merged.servers.is_empty());
    }

    #[test]
    fn invalid_json_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "bad.json", "{not json");
        assert!(McpConfig::load(&path).is_err());
    }

    #[test]
    #[allow(unsafe_code)]
    fn env_expansion_in_values() {
        // Serialized env mutation: this test owns a unique variable name.
        unsafe { std::env::set_var("STEWARD_TEST_HOME_X", "/home/agent") };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            ".mcp.json",
            r#"{"servers": {"fs": {
                "command": "mcp-fs",
                "args": ["--root", "${STEWARD_TEST_HOME_X}/work"],
                "env": {"TOKEN": "${STEWARD_TEST_UNSET_Y}"}
            }}}"#,
        );
        let config = McpConfig::load(&path).unwrap();
        assert_eq!(config.servers["fs"].args[1], "/home/agent/work");
        // Absent variables default to empty.
        assert_eq!(config.servers["fs"].env["TOKEN"], "");
    }

    #[test]
    fn expand_env_leaves_plain_strings() {
        assert_eq!(expand_env("no variables here"), "no variables here");
        assert_eq!(expand_env("$NOT_BRACED"), "$NOT_BRACED");
    }
}
