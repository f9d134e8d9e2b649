//! Child environment assembly.
//!
//! Layers, lowest precedence first:
//!
//! 1. variables inherited from the host process
//! 2. terminal defaults (`TERM`, `COLORTERM`, ...)
//! 3. path injection (directories prepended to `PATH`)
//! 4. user overrides
//!
//! `PATH` is the exception to plain replacement. It is concatenated from the
//! user's `PATH` override, the injected directories that exist, and the
//! inherited entries that survive the exclusion filters.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::core::pty::{PtyError, Result};

#[cfg(windows)]
const PATH_SEPARATOR: char = ';';
#[cfg(not(windows))]
const PATH_SEPARATOR: char = ':';

/// Rules for rebuilding `PATH`.
#[derive(Debug, Clone, Default)]
pub struct PathRules {
    /// Directories placed in front of the inherited entries, if they exist.
    pub prepend: Vec<PathBuf>,
    /// Inherited entries containing any of these substrings (ASCII
    /// case-insensitive) are dropped.
    pub exclude: Vec<String>,
}

/// Final environment handed to the process launcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentBlock {
    vars: BTreeMap<String, String>,
}

impl EnvironmentBlock {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }

    /// Add or replace one entry.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        validate(&key, &value)?;
        self.vars.insert(key, value);
        Ok(())
    }

    /// `key=value\0...key=value\0\0`, the layout process creation expects.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut block = Vec::new();
        for (key, value) in &self.vars {
            block.extend_from_slice(key.as_bytes());
            block.push(b'=');
            block.extend_from_slice(value.as_bytes());
            block.push(0);
        }
        block.push(0);
        block
    }

    /// UTF-16 form of [`to_bytes`](Self::to_bytes) for `CREATE_UNICODE_ENVIRONMENT`.
    #[cfg(windows)]
    pub fn to_wide(&self) -> Vec<u16> {
        let mut block = Vec::new();
        for (key, value) in self.windows_order() {
            block.extend(key.encode_utf16());
            block.push(u16::from(b'='));
            block.extend(value.encode_utf16());
            block.push(0);
        }
        block.push(0);
        block
    }

    /// Entries sorted by name ignoring case, the order `CreateProcessW`
    /// requires of an environment block.
    #[cfg(any(windows, test))]
    fn windows_order(&self) -> Vec<(&String, &String)> {
        let mut entries: Vec<_> = self.vars.iter().collect();
        entries.sort_by_cached_key(|(key, _)| key.to_uppercase());
        entries
    }
}

fn validate(key: &str, value: &str) -> Result<()> {
    if key.is_empty() {
        return Err(PtyError::InvalidEnvironment("empty variable name".to_string()));
    }
    // Windows keeps per-drive working directories in names like "=C:", so a
    // leading '=' is legal there.
    if key.chars().skip(1).any(|c| c == '=') || key.contains('\0') {
        return Err(PtyError::InvalidEnvironment(format!("invalid variable name {key:?}")));
    }
    if value.contains('\0') {
        return Err(PtyError::InvalidEnvironment(format!("value of {key} contains NUL")));
    }
    Ok(())
}

fn is_path_key(key: &str) -> bool {
    if cfg!(windows) {
        key.eq_ignore_ascii_case("PATH")
    } else {
        key == "PATH"
    }
}

/// Builds an [`EnvironmentBlock`] from its layers.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentBuilder {
    inherited: Vec<(String, String)>,
    defaults: BTreeMap<String, String>,
    path_rules: PathRules,
    overrides: BTreeMap<String, String>,
}

impl EnvironmentBuilder {
    /// Start from nothing inherited.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from the host process environment. Variables whose name or
    /// value is not valid Unicode are skipped.
    pub fn from_process() -> Self {
        Self::new().inherit(
            std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?))),
        )
    }

    pub fn inherit<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.inherited
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn defaults(mut self, defaults: BTreeMap<String, String>) -> Self {
        self.defaults.extend(defaults);
        self
    }

    pub fn path_rules(mut self, rules: PathRules) -> Self {
        self.path_rules = rules;
        self
    }

    pub fn overrides(mut self, overrides: BTreeMap<String, String>) -> Self {
        self.overrides.extend(overrides);
        self
    }

    pub fn build(self) -> Result<EnvironmentBlock> {
        let mut block = EnvironmentBlock::default();
        let mut path_key: Option<String> = None;
        let mut inherited_path: Option<String> = None;

        for (key, value) in self.inherited.into_iter().chain(self.defaults) {
            if is_path_key(&key) {
                path_key.get_or_insert_with(|| key.clone());
                inherited_path = Some(value);
                continue;
            }
            block.insert(key, value)?;
        }

        let mut override_path: Option<String> = None;
        for (key, value) in self.overrides {
            if is_path_key(&key) {
                path_key.get_or_insert_with(|| key.clone());
                override_path = Some(value);
                continue;
            }
            block.insert(key, value)?;
        }

        let path = assemble_path(
            override_path.as_deref(),
            &self.path_rules,
            inherited_path.as_deref(),
        );
        if !path.is_empty() {
            block.insert(path_key.unwrap_or_else(|| "PATH".to_string()), path)?;
        }

        Ok(block)
    }
}

fn assemble_path(user: Option<&str>, rules: &PathRules, inherited: Option<&str>) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut push = |part: String| {
        if !part.is_empty() && !parts.contains(&part) {
            parts.push(part);
        }
    };

    if let Some(user) = user {
        user.split(PATH_SEPARATOR).map(str::to_string).for_each(&mut push);
    }

    for dir in &rules.prepend {
        if dir.is_dir() {
            push(dir.to_string_lossy().into_owned());
        }
    }

    if let Some(inherited) = inherited {
        let excluded: Vec<String> = rules.exclude.iter().map(|e| e.to_ascii_lowercase()).collect();
        for part in inherited.split(PATH_SEPARATOR) {
            let lower = part.to_ascii_lowercase();
            if excluded.iter().any(|e| lower.contains(e.as_str())) {
                continue;
            }
            push(part.to_string());
        }
    }

    parts.join(&PATH_SEPARATOR.to_string())
}
