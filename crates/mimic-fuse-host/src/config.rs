// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Configuration: TOML file, per-OS resolution, CLI merge.
//!
//! Resolution order is flag > config file > default. The per-user config
//! lives under the OS config directory (`~/.config/mimic/config.toml` on
//! Unix, `%APPDATA%\mimic\config.toml` on Windows) and a commented
//! template is written there on first run.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

pub const APP_NAME: &str = "mimic";
pub const CONFIG_FILE: &str = "config.toml";

const DEFAULT_CONFIG: &str = r#"# server
username = "user"
password = "pass"

# cache
ttl = "1s" # important to be in quotes!
max-entries = 100

# logger
verbose = false
err = "stderr"
std = "stdout"
"#;

/// Raw deserialization target for the config file. Everything is optional
/// so the CLI merge can tell "absent" from "explicitly set".
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub mpoint: Option<String>,
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Duration string, e.g. "500ms", "1s", "2m".
    pub ttl: Option<String>,
    #[serde(rename = "max-entries")]
    pub max_entries: Option<usize>,
    pub verbose: Option<bool>,
    pub std: Option<String>,
    pub err: Option<String>,
}

/// Fully resolved runtime configuration injected into the core.
#[derive(Clone, Debug)]
pub struct Config {
    pub mountpoint: String,
    pub url: String,
    pub username: String,
    pub password: String,
    pub ttl: Duration,
    pub max_entries: usize,
    pub verbose: bool,
    pub stdlog: String,
    pub errlog: String,
}

/// Per-OS path of the user config file, creating its directory.
pub fn user_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().ok_or_else(|| anyhow!("cannot determine config directory"))?;
    let dir = base.join(APP_NAME);
    fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    Ok(dir.join(CONFIG_FILE))
}

/// Atomically writes the default template (temp file + rename).
pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("toml.tmp");
    fs::write(&tmp, DEFAULT_CONFIG)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Loads a config file, falling back to the per-user config (and creating
/// it with the default template on first run) when no path is given.
pub fn load_file_config(explicit: Option<&Path>) -> Result<FileConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let default_path = user_config_path()?;
            if !default_path.exists() {
                eprintln!(
                    "Missing per user config, trying to create a new one at {}",
                    default_path.display()
                );
                write_default_config(&default_path)?;
            }
            default_path
        }
    };

    let content =
        fs::read_to_string(&path).with_context(|| format!("reading config {}", path.display()))?;
    let config: FileConfig =
        toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))?;
    Ok(config)
}

/// Parses a duration string: integer value plus one of `ms`, `s`, `m`,
/// `h`. A bare integer counts as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (value, unit) = s.split_at(split);
    let value: u64 = value.parse().map_err(|_| anyhow!("invalid duration {s:?}"))?;
    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(anyhow!("invalid duration unit {other:?} in {s:?}")),
    }
}
