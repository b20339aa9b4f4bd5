use std::{env, path::PathBuf};

use crate::config::{PluginConfig, ENV_DELEGATE_PATH};
use crate::native::runtime::{runtime_current_lib_dir, runtime_delegate_filename, DEFAULT_BASENAME};

/// Env override, config path, `runtime.json`, then the default basename in the runtime dir.
pub fn locate_delegate_binary(config: &PluginConfig) -> Option<PathBuf> {
    if let Some(p) = env::var_os(ENV_DELEGATE_PATH).filter(|v| !v.is_empty()).map(PathBuf::from) {
        if p.exists() {
            tracing::info!("{ENV_DELEGATE_PATH} = {}", p.display());
            return Some(p);
        }
        tracing::warn!("{ENV_DELEGATE_PATH} points to missing file: {}", p.display());
    }

    if let Some(p) = &config.delegate_path {
        if p.exists() {
            tracing::info!("delegate from config: {}", p.display());
            return Some(p.clone());
        }
        tracing::warn!("configured delegate_path is missing: {}", p.display());
    }

    let root = config.runtime_dir.as_ref()?;
    if let (Some(dir), Some(file)) = (runtime_current_lib_dir(root), runtime_delegate_filename(root)) {
        let p = dir.join(file);
        if p.exists() {
            tracing::info!("delegate from runtime.json (active): {}", p.display());
            return Some(p);
        }
    }

    let fallback = root.join(DEFAULT_BASENAME);
    fallback.exists().then(|| {
        tracing::info!("delegate from runtime dir: {}", fallback.display());
        fallback
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_runtime_manifest_then_default_basename() {
        let dir = tempfile::tempdir().unwrap();
        let lib_dir = dir.path().join("cpu");
        std::fs::create_dir_all(&lib_dir).unwrap();
        std::fs::write(lib_dir.join("libfast.so"), b"").unwrap();
        std::fs::write(dir.path().join(DEFAULT_BASENAME), b"").unwrap();

        let cfg = PluginConfig {
            delegate_path: Some(dir.path().join("absent.so")),
            runtime_dir: Some(dir.path().to_path_buf()),
            ..PluginConfig::default()
        };
        if env::var_os(ENV_DELEGATE_PATH).is_some() {
            return;
        }
        assert_eq!(locate_delegate_binary(&cfg), Some(dir.path().join(DEFAULT_BASENAME)));

        std::fs::write(
            dir.path().join("runtime.json"),
            r#"{"current_lib_dir": "cpu", "delegate_basename": "libfast.so"}"#,
        )
        .unwrap();
        assert_eq!(locate_delegate_binary(&cfg), Some(lib_dir.join("libfast.so")));
    }

    #[test]
    fn nothing_found_without_runtime_dir() {
        let cfg = PluginConfig {
            runtime_dir: None,
            ..PluginConfig::default()
        };
        if env::var_os(ENV_DELEGATE_PATH).is_some() {
            return;
        }
        assert!(locate_delegate_binary(&cfg).is_none());
    }
}
