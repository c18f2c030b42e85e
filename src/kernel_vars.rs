//! Kernel build variables for out-of-tree driver packages.
//!
//! The kernel package build leaves a small shell environment file behind
//! (`kernel-vars`) naming the kernel tree, version and local suffix. Driver
//! builds read it once at start; without it there is nothing to build against.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::BuildError;

pub const REQUIRED_KEYS: &[&str] = &["KERNEL_DIR", "KERNEL_VERSION", "KERNEL_SUFFIX"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelVars {
    vars: BTreeMap<String, String>,
}

impl KernelVars {
    pub fn load(path: &Path) -> Result<Self> {
        crate::preflight::require_file(
            path,
            "kernel variable file",
            "build the linux-kernel package first; it writes this file",
        )?;
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading kernel variable file '{}'", path.display()))?;
        Self::parse(&text, path)
    }

    /// Parse `KEY=value` lines. `export ` prefixes, quotes, comments and
    /// blank lines are accepted; every key in [`REQUIRED_KEYS`] must be set.
    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let mut vars = BTreeMap::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line).trim_start();
            let Some((key, value)) = line.split_once('=') else {
                return Err(invalid(path, format!("line {}: expected KEY=value", idx + 1)));
            };
            let key = key.trim();
            if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(invalid(path, format!("line {}: invalid key '{}'", idx + 1, key)));
            }
            vars.insert(key.to_string(), unquote(value.trim()).to_string());
        }

        let missing = REQUIRED_KEYS
            .iter()
            .filter(|key| !vars.contains_key(**key))
            .copied()
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(invalid(path, format!("missing {}", missing.join(", "))));
        }
        Ok(Self { vars })
    }

    pub fn kernel_dir(&self) -> PathBuf {
        PathBuf::from(&self.vars["KERNEL_DIR"])
    }

    pub fn kernel_version(&self) -> &str {
        &self.vars["KERNEL_VERSION"]
    }

    pub fn kernel_suffix(&self) -> &str {
        &self.vars["KERNEL_SUFFIX"]
    }

    /// Full kernel release as `uname -r` reports it, e.g. `6.6.48-vyos`.
    pub fn kernel_release(&self) -> String {
        format!("{}{}", self.kernel_version(), self.kernel_suffix())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn invalid(path: &Path, reason: String) -> anyhow::Error {
    BuildError::KernelVars {
        path: path.to_path_buf(),
        reason,
    }
    .into()
}
