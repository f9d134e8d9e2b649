//! Configuration for ptyhost.
//!
//! This module provides:
//! - TOML configuration file loading from `~/.ptyhost/config.toml`
//! - Resolution of the hosted program's install layout
//! - Translation into [`SessionOptions`] for the core
//!
//! # Configuration File
//!
//! ```toml
//! # Program to host (optional, falls back to program_candidates)
//! program = "claude"
//! args = ["--dangerously-skip-permissions"]
//! program_candidates = ["C:/Program Files/ClaudeCodeWin/nodejs/claude.cmd"]
//! working_directory = "C:/work"
//! strip_escapes = false
//! poll_interval_ms = 100
//! read_buffer_size = 4096
//!
//! [size]
//! cols = 120
//! rows = 40
//!
//! [environment]
//! ANTHROPIC_MODEL = "claude-sonnet-4"
//!
//! [terminal_environment]
//! TERM = "xterm-256color"
//!
//! [path]
//! prepend = ["C:/Program Files/ClaudeCodeWin/nodejs"]
//! exclude = ["nodejs", "nvm", "node_modules"]
//!
//! [sweep]
//! interpreter = "node"
//! token = "claude"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::core::env::PathRules;
use crate::core::pty::{CommandLine, PtyError, TerminalSize};
use crate::core::session::{default_terminal_environment, SessionOptions};
use crate::core::sweep::Fingerprint;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("no program configured and none of the candidates exist")]
    NoProgram,
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Program to run. Wins over `program_candidates`.
    pub program: Option<String>,
    pub args: Vec<String>,
    /// Install locations probed in order when `program` is unset.
    pub program_candidates: Vec<PathBuf>,
    pub working_directory: Option<PathBuf>,
    pub strip_escapes: bool,
    pub poll_interval_ms: u64,
    pub read_buffer_size: usize,
    pub size: SizeConfig,
    /// User overrides, applied last.
    pub environment: BTreeMap<String, String>,
    pub terminal_environment: BTreeMap<String, String>,
    pub path: PathConfig,
    pub sweep: SweepConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            program_candidates: Vec::new(),
            working_directory: None,
            strip_escapes: false,
            poll_interval_ms: 100,
            read_buffer_size: 4096,
            size: SizeConfig::default(),
            environment: BTreeMap::new(),
            terminal_environment: default_terminal_environment(),
            path: PathConfig::default(),
            sweep: SweepConfig::default(),
        }
    }
}

/// Initial terminal size
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SizeConfig {
    pub cols: u16,
    pub rows: u16,
}

impl Default for SizeConfig {
    fn default() -> Self {
        let size = TerminalSize::default();
        Self {
            cols: size.cols,
            rows: size.rows,
        }
    }
}

/// PATH rewriting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    pub prepend: Vec<PathBuf>,
    pub exclude: Vec<String>,
}

/// Orphan sweep fingerprint. Both fields are needed to enable the scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub interpreter: Option<String>,
    pub token: Option<String>,
}

/// Where the hosted program lives, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    pub program: String,
    /// Directories the child needs on its PATH.
    pub bin_dirs: Vec<PathBuf>,
}

impl Config {
    /// Load the default configuration file, falling back to defaults.
    pub fn load() -> Self {
        let Some(path) = config_path() else {
            return Self::default();
        };
        if !path.exists() {
            info!(path = %path.display(), "no config file, using defaults");
            return Self::default();
        }
        match Self::from_path(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "ignoring config file");
                Self::default()
            }
        }
    }

    /// Load an explicitly named configuration file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn terminal_size(&self) -> Result<TerminalSize, PtyError> {
        TerminalSize::new(self.size.cols, self.size.rows)
    }

    /// Find the program and the directories it needs.
    pub fn install_layout(&self) -> Result<InstallLayout, ConfigError> {
        let mut bin_dirs = self.path.prepend.clone();

        let program = match &self.program {
            Some(program) => program.clone(),
            None => {
                let found = self
                    .program_candidates
                    .iter()
                    .find(|candidate| candidate.is_file())
                    .ok_or(ConfigError::NoProgram)?;
                // Wrapper scripts expect their interpreter next to them.
                if let Some(dir) = found.parent().filter(|dir| !dir.as_os_str().is_empty()) {
                    if !bin_dirs.iter().any(|existing| existing == dir) {
                        bin_dirs.insert(0, dir.to_path_buf());
                    }
                }
                found.to_string_lossy().into_owned()
            }
        };

        Ok(InstallLayout { program, bin_dirs })
    }

    pub fn command_line(&self, layout: &InstallLayout) -> CommandLine {
        CommandLine::new(layout.program.clone()).args(self.args.iter().cloned())
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        match (&self.sweep.interpreter, &self.sweep.token) {
            (Some(interpreter), Some(token)) => Some(Fingerprint::new(interpreter, token)),
            _ => None,
        }
    }

    pub fn session_options(&self, layout: &InstallLayout) -> SessionOptions {
        SessionOptions {
            strip_escapes: self.strip_escapes,
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            read_buffer_size: self.read_buffer_size.max(1),
            inherit_environment: true,
            terminal_environment: self.terminal_environment.clone(),
            path_rules: PathRules {
                prepend: layout.bin_dirs.clone(),
                exclude: self.path.exclude.clone(),
            },
            fingerprint: self.fingerprint(),
        }
    }
}

/// `~/.ptyhost`, created on demand.
pub fn config_dir() -> Option<PathBuf> {
    let dir = home_dir()?.join(".ptyhost");
    if !dir.exists() {
        let _ = fs::create_dir_all(&dir);
    }
    Some(dir)
}

pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

pub fn log_path() -> PathBuf {
    config_dir()
        .map(|dir| dir.join("ptyhost.log"))
        .unwrap_or_else(|| PathBuf::from("ptyhost.log"))
}

// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.read_buffer_size, 4096);
        assert_eq!(config.terminal_size().unwrap(), TerminalSize::new(120, 40).unwrap());
        assert_eq!(
            config.terminal_environment.get("TERM").map(String::as_str),
            Some("xterm-256color")
        );
        assert!(config.fingerprint().is_none());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            program = "claude"
            strip_escapes = true

            [size]
            cols = 80

            [environment]
            ANTHROPIC_MODEL = "m"
            "#,
        )
        .unwrap();
        assert_eq!(config.program.as_deref(), Some("claude"));
        assert!(config.strip_escapes);
        assert_eq!(config.size.cols, 80);
        assert_eq!(config.size.rows, 40);
        assert_eq!(config.environment.get("ANTHROPIC_MODEL").map(String::as_str), Some("m"));
        assert_eq!(config.terminal_environment.len(), 3);
    }

    #[test]
    fn test_from_path_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "poll_interval_ms = \"fast\"").unwrap();
        assert!(matches!(
            Config::from_path(file.path()),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            Config::from_path(Path::new("/definitely/not/here.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_program_resolved_from_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("bin").join("tool");
        fs::create_dir_all(present.parent().unwrap()).unwrap();
        fs::write(&present, "").unwrap();

        let config = Config {
            program_candidates: vec![dir.path().join("missing"), present.clone()],
            args: vec!["--flag".to_string()],
            ..Config::default()
        };
        let layout = config.install_layout().unwrap();
        assert_eq!(layout.program, present.to_string_lossy());
        assert_eq!(layout.bin_dirs, vec![dir.path().join("bin")]);

        let command = config.command_line(&layout);
        assert_eq!(command.args, vec!["--flag".to_string()]);
    }

    #[test]
    fn test_no_program_is_an_error() {
        let config = Config {
            program_candidates: vec![PathBuf::from("/definitely/not/here")],
            ..Config::default()
        };
        assert!(matches!(config.install_layout(), Err(ConfigError::NoProgram)));
    }

    #[test]
    fn test_session_options_mapping() {
        let config: Config = toml::from_str(
            r#"
            program = "node"
            poll_interval_ms = 0

            [path]
            prepend = ["/opt/node/bin"]
            exclude = ["nvm"]

            [sweep]
            interpreter = "node"
            token = "claude"
            "#,
        )
        .unwrap();
        let layout = config.install_layout().unwrap();
        let options = config.session_options(&layout);
        assert_eq!(options.poll_interval, Duration::from_millis(1));
        assert_eq!(options.path_rules.prepend, vec![PathBuf::from("/opt/node/bin")]);
        assert_eq!(options.path_rules.exclude, vec!["nvm".to_string()]);
        assert_eq!(options.fingerprint, Some(Fingerprint::new("node", "claude")));
    }
}
