//! Builder configuration
//!
//! Looked up in `<project>/kiln.json`, then `~/.kiln/config.json`.
//! A missing file means defaults; command line flags override both.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const PROJECT_CONFIG_FILE: &str = "kiln.json";

fn default_remote_timeout() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Size of the offload pool (defaults to the CPU count)
    pub thread_count: Option<usize>,
    /// Worker processes alive at once (defaults to the thread count)
    pub max_parallel_processes: Option<usize>,
    /// Seconds a worker has to register its result
    #[serde(default = "default_remote_timeout")]
    pub remote_timeout_secs: u64,
    /// Executable started for worker processes (defaults to the running one)
    pub slave_builder_path: Option<PathBuf>,
    pub log_level: Option<String>,
    /// Initial build parameters
    pub properties: BTreeMap<String, String>,
    /// Index file suffix (defaults to the profile)
    pub index_prefix: Option<String>,
    #[serde(default = "default_true")]
    pub persist_input_hashes: bool,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            thread_count: None,
            max_parallel_processes: None,
            remote_timeout_secs: default_remote_timeout(),
            slave_builder_path: None,
            log_level: None,
            properties: BTreeMap::new(),
            index_prefix: None,
            persist_input_hashes: true,
        }
    }
}

/// Get config file path: `<project>/kiln.json` if present, else
/// `~/.kiln/config.json`
pub fn get_config_path(project_dir: impl AsRef<Path>) -> PathBuf {
    let local = project_dir.as_ref().join(PROJECT_CONFIG_FILE);
    if local.exists() {
        return local;
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kiln")
        .join("config.json")
}

/// Load the effective config for `project_dir`
pub fn load_config(project_dir: impl AsRef<Path>) -> Result<BuilderConfig> {
    load_config_from(&get_config_path(project_dir))
}

pub fn load_config_from(path: &Path) -> Result<BuilderConfig> {
    if !path.exists() {
        return Ok(BuilderConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: BuilderConfig = serde_json::from_str(&content)
        .with_context(|| format!("invalid config file {}", path.display()))?;
    Ok(config)
}

pub fn save_config(path: &Path, config: &BuilderConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content)?;

    tracing::info!("Config saved to {:?}", path);
    Ok(())
}

/// Set one top-level field from its command line form. The value is read
/// as JSON when it parses, else taken as a string; `null` resets an
/// optional field.
pub fn apply_setting(config: &mut BuilderConfig, key: &str, raw: &str) -> Result<()> {
    let mut fields = match serde_json::to_value(&*config)? {
        serde_json::Value::Object(fields) => fields,
        _ => bail!("config is not a JSON object"),
    };
    if !fields.contains_key(key) {
        let known: Vec<_> = fields.keys().cloned().collect();
        bail!("unknown config key '{}' (expected one of: {})", key, known.join(", "));
    }

    let value = serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
    fields.insert(key.to_string(), value);
    *config = serde_json::from_value(serde_json::Value::Object(fields))
        .with_context(|| format!("invalid value for '{}': {}", key, raw))?;
    Ok(())
}
