//! Configuration parsing for the task daemon.
//!
//! Uses a key=value format (`.taskd/config`).
//! Precedence: CLI flags > `--config` file > `<data_dir>/config` > defaults.

use crate::types::ConflictPolicy;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Engine configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for tasks.json, processes.json, snapshots, runs and worktrees.
    pub data_dir: PathBuf,

    // Agent
    pub agent_bin: String,
    pub agent_args: Vec<String>,
    pub model: Option<String>,

    // Process lifecycle
    pub phase_timeout_sec: u64,
    pub idle_timeout_sec: u64,
    pub poll_interval_ms: u64,
    pub grace_period_ms: u64,
    pub output_tail_lines: usize,

    // Conflict resolver
    pub resolver_timeout_sec: u64,
    pub resolver_diff_max_bytes: usize,

    // Persistence and sync
    pub debounce_ms: u64,
    pub sync_interval_sec: u64,
    pub snapshot_limit: usize,
    pub conflict_policy: ConflictPolicy,
    pub lock_timeout_sec: u64,

    /// Default merge resolution when a request does not name one.
    pub auto_resolve: bool,

    // Workspaces
    pub branch_prefix: String,
    pub merge_target_branch: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            agent_bin: "claude".to_string(),
            agent_args: vec![
                "-p".to_string(),
                "--verbose".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--dangerously-skip-permissions".to_string(),
            ],
            model: None,
            phase_timeout_sec: 45 * 60,
            idle_timeout_sec: 20 * 60,
            poll_interval_ms: 3000,
            grace_period_ms: 5000,
            output_tail_lines: 500,
            resolver_timeout_sec: 10 * 60,
            resolver_diff_max_bytes: 50_000,
            debounce_ms: 1000,
            sync_interval_sec: 30,
            snapshot_limit: 10,
            conflict_policy: ConflictPolicy::MemoryWins,
            lock_timeout_sec: 30,
            auto_resolve: false,
            branch_prefix: "task/".to_string(),
            merge_target_branch: None,
        }
    }
}

/// `$XDG_DATA_HOME/taskd`, falling back to `~/.local/share/taskd`.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir().map_or_else(|| PathBuf::from(".taskd"), |d| d.join("taskd"))
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());
            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    pub fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "data_dir" => self.data_dir = PathBuf::from(value),
            "agent_bin" => self.agent_bin = value.to_string(),
            "agent_args" => {
                self.agent_args = value.split_whitespace().map(str::to_string).collect();
            }
            "model" => {
                self.model = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "phase_timeout_sec" => self.phase_timeout_sec = parse_int(key, value)?,
            "idle_timeout_sec" => self.idle_timeout_sec = parse_int(key, value)?,
            "poll_interval_ms" => self.poll_interval_ms = parse_int(key, value)?,
            "grace_period_ms" => self.grace_period_ms = parse_int(key, value)?,
            "output_tail_lines" => self.output_tail_lines = parse_int(key, value)?,
            "resolver_timeout_sec" => self.resolver_timeout_sec = parse_int(key, value)?,
            "resolver_diff_max_bytes" => self.resolver_diff_max_bytes = parse_int(key, value)?,
            "debounce_ms" => self.debounce_ms = parse_int(key, value)?,
            "sync_interval_sec" => self.sync_interval_sec = parse_int(key, value)?,
            "snapshot_limit" => self.snapshot_limit = parse_int(key, value)?,
            "lock_timeout_sec" => self.lock_timeout_sec = parse_int(key, value)?,
            "conflict_policy" => {
                self.conflict_policy = match value {
                    "memory_wins" => ConflictPolicy::MemoryWins,
                    "disk_wins" => ConflictPolicy::DiskWins,
                    "newest_wins" => ConflictPolicy::NewestWins,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "conflict_policy must be 'memory_wins', 'disk_wins', or 'newest_wins', got '{value}'"
                        )))
                    }
                }
            }
            "auto_resolve" => self.auto_resolve = parse_bool(key, value)?,
            "branch_prefix" => self.branch_prefix = value.to_string(),
            "merge_target_branch" => {
                self.merge_target_branch = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Agent command line arguments, with the model flag appended when set.
    pub fn agent_command_args(&self) -> Vec<String> {
        let mut args = self.agent_args.clone();
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args
    }

    /// Resolve a relative data dir against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.data_dir.is_relative() {
            self.data_dir = base.join(&self.data_dir);
        }
    }
}

fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidInt {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Parse a boolean value.
pub fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "y" | "on" => Ok(true),
        "false" | "0" | "no" | "n" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert_eq!(config.agent_bin, "claude");
        assert_eq!(config.phase_timeout_sec, 2700);
        assert_eq!(config.idle_timeout_sec, 1200);
        assert_eq!(config.poll_interval_ms, 3000);
        assert_eq!(config.debounce_ms, 1000);
        assert_eq!(config.sync_interval_sec, 30);
        assert_eq!(config.snapshot_limit, 10);
        assert_eq!(config.output_tail_lines, 500);
        assert_eq!(config.conflict_policy, ConflictPolicy::MemoryWins);
        assert!(config.model.is_none());
        assert!(config.agent_args.contains(&"stream-json".to_string()));
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        let content = r#"
# agent
agent_bin="/usr/local/bin/claude"
model='sonnet'
phase_timeout_sec=60
conflict_policy=newest_wins
"#;
        config.parse_content(content).unwrap();
        assert_eq!(config.agent_bin, "/usr/local/bin/claude");
        assert_eq!(config.model.as_deref(), Some("sonnet"));
        assert_eq!(config.phase_timeout_sec, 60);
        assert_eq!(config.conflict_policy, ConflictPolicy::NewestWins);
    }

    #[test]
    fn agent_args_split_on_whitespace() {
        let mut config = Config::default();
        config.parse_content("agent_args=\"-p --output-format stream-json\"").unwrap();
        assert_eq!(config.agent_args, vec!["-p", "--output-format", "stream-json"]);
    }

    #[test]
    fn model_flag_appended_when_set() {
        let mut config = Config::default();
        assert!(!config.agent_command_args().contains(&"--model".to_string()));
        config.model = Some("opus".to_string());
        let args = config.agent_command_args();
        assert_eq!(&args[args.len() - 2..], &["--model".to_string(), "opus".to_string()]);
    }

    #[test]
    fn invalid_int_is_reported() {
        let mut config = Config::default();
        let err = config.parse_content("debounce_ms=soon").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidInt { ref key, .. } if key == "debounce_ms"));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let mut config = Config::default();
        assert!(matches!(
            config.parse_content("colour=blue"),
            Err(ConfigError::UnknownKey(_))
        ));
    }

    #[test]
    fn line_without_equals_is_invalid() {
        let mut config = Config::default();
        assert!(matches!(
            config.parse_content("just words"),
            Err(ConfigError::InvalidLine(_))
        ));
    }

    #[test]
    fn unquote_removes_quotes() {
        assert_eq!(Config::unquote("\"hello\""), "hello");
        assert_eq!(Config::unquote("'world'"), "world");
        assert_eq!(Config::unquote("noquotes"), "noquotes");
        assert_eq!(Config::unquote("\""), "\"");
    }

    #[test]
    fn parse_bool_accepts_variants() {
        assert!(parse_bool("k", "yes").unwrap());
        assert!(!parse_bool("k", "off").unwrap());
        assert!(parse_bool("k", "maybe").is_err());
    }

    #[test]
    fn auto_resolve_parses_bool() {
        let mut config = Config::default();
        config.parse_content("auto_resolve=on").unwrap();
        assert!(config.auto_resolve);
        assert!(matches!(
            config.parse_content("auto_resolve=sometimes"),
            Err(ConfigError::InvalidBool { .. })
        ));
    }

    #[test]
    fn relative_data_dir_resolves_against_base() {
        let mut config = Config {
            data_dir: PathBuf::from("state"),
            ..Config::default()
        };
        config.resolve_paths(Path::new("/srv"));
        assert_eq!(config.data_dir, PathBuf::from("/srv/state"));
    }

    #[test]
    fn from_file_reads_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "snapshot_limit=3\nbranch_prefix=agent/\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.snapshot_limit, 3);
        assert_eq!(config.branch_prefix, "agent/");
    }
}
