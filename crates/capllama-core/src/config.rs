//! Plugin configuration: `capllama.json` under the platform data dir, then
//! environment overrides.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::registry::DEFAULT_CONTEXT_LIMIT;

pub const CONFIG_FILE: &str = "capllama.json";
pub const ENV_DELEGATE_PATH: &str = "CAPLLAMA_DELEGATE_PATH";
pub const ENV_RUNTIME_DIR: &str = "CAPLLAMA_RUNTIME_DIR";
pub const ENV_MODELS_DIR: &str = "CAPLLAMA_MODELS_DIR";
pub const ENV_CONTEXT_LIMIT: &str = "CAPLLAMA_CONTEXT_LIMIT";

/// Smallest file accepted as a model (1 MiB).
pub const DEFAULT_MIN_MODEL_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    pub level: String,
    /// `pretty`, `compact` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub context_limit: usize,
    pub native_log: bool,
    pub delegate_path: Option<PathBuf>,
    pub runtime_dir: Option<PathBuf>,
    pub models_dir: Option<PathBuf>,
    /// Extra directories tried (joined with the file name) when resolving model paths.
    pub model_search_dirs: Vec<PathBuf>,
    pub strict_model_paths: bool,
    pub min_model_bytes: u64,
    pub logging: LoggingConfig,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            context_limit: DEFAULT_CONTEXT_LIMIT,
            native_log: false,
            delegate_path: None,
            runtime_dir: default_runtime_dir(),
            models_dir: default_models_dir(),
            model_search_dirs: Vec::new(),
            strict_model_paths: false,
            min_model_bytes: DEFAULT_MIN_MODEL_BYTES,
            logging: LoggingConfig::default(),
        }
    }
}

/// ~/.local/share/capllama
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("capllama"))
}

/// ~/.local/share/capllama/runtimes/llama
pub fn default_runtime_dir() -> Option<PathBuf> {
    default_data_dir().map(|p| p.join("runtimes").join("llama"))
}

/// ~/.local/share/capllama/models
pub fn default_models_dir() -> Option<PathBuf> {
    default_data_dir().map(|p| p.join("models"))
}

impl PluginConfig {
    /// Reads `<data dir>/capllama.json` when present, then applies env overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match default_data_dir().map(|d| d.join(CONFIG_FILE)) {
            Some(p) if p.exists() => Self::from_file(&p)?,
            _ => Self::default(),
        };
        cfg.apply_env();
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
    }

    pub fn apply_env(&mut self) {
        if let Some(p) = env_path(ENV_DELEGATE_PATH) {
            self.delegate_path = Some(p);
        }
        if let Some(p) = env_path(ENV_RUNTIME_DIR) {
            self.runtime_dir = Some(p);
        }
        if let Some(p) = env_path(ENV_MODELS_DIR) {
            self.models_dir = Some(p);
        }
        if let Ok(v) = env::var(ENV_CONTEXT_LIMIT) {
            match v.trim().parse::<usize>() {
                Ok(n) => self.context_limit = n,
                Err(_) => tracing::warn!("ignoring {ENV_CONTEXT_LIMIT}={v:?}: not a count"),
            }
        }
    }

    /// Models dir first, then `model_search_dirs`.
    pub fn search_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self.models_dir.iter().cloned().collect();
        for d in &self.model_search_dirs {
            if !dirs.contains(d) {
                dirs.push(d.clone());
            }
        }
        dirs
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).filter(|v| !v.is_empty()).map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: PluginConfig = serde_json::from_str(r#"{"context_limit": 3}"#).unwrap();
        assert_eq!(cfg.context_limit, 3);
        assert_eq!(cfg.min_model_bytes, DEFAULT_MIN_MODEL_BYTES);
        assert_eq!(cfg.logging, LoggingConfig::default());
        assert!(!cfg.strict_model_paths);
    }

    #[test]
    fn reads_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(
            &path,
            r#"{"native_log": true, "model_search_dirs": ["/a", "/b"], "logging": {"format": "json"}}"#,
        )
        .unwrap();
        let cfg = PluginConfig::from_file(&path).unwrap();
        assert!(cfg.native_log);
        assert_eq!(cfg.logging.format, "json");
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.model_search_dirs.len(), 2);
        assert!(PluginConfig::from_file(&dir.path().join("nope.json")).is_err());
    }

    #[test]
    fn search_dirs_dedupes() {
        let cfg = PluginConfig {
            models_dir: Some(PathBuf::from("/m")),
            model_search_dirs: vec![PathBuf::from("/m"), PathBuf::from("/x")],
            ..PluginConfig::default()
        };
        assert_eq!(cfg.search_dirs(), vec![PathBuf::from("/m"), PathBuf::from("/x")]);
    }
}
