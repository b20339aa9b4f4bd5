//! `runtime.json` of an installed delegate runtime.

use serde_json::Value as Json;
use std::path::{Path, PathBuf};

pub const RUNTIME_MANIFEST: &str = "runtime.json";

/// OS-specific base names for CPU and per-GPU variants.
#[cfg(target_os = "windows")]
pub const DEFAULT_BASENAME: &str = "capllama_llama.dll";
#[cfg(target_os = "macos")]
pub const DEFAULT_BASENAME: &str = "libcapllama_llama.dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
pub const DEFAULT_BASENAME: &str = "libcapllama_llama.so";

#[cfg(target_os = "windows")]
fn basename_for_backend(backend: Option<&str>) -> String {
    match backend {
        Some(b @ ("cuda" | "vulkan")) => format!("capllama_llama_{b}.dll"),
        _ => DEFAULT_BASENAME.to_string(),
    }
}

#[cfg(target_os = "macos")]
fn basename_for_backend(backend: Option<&str>) -> String {
    match backend {
        Some("metal") => "libcapllama_llama_metal.dylib".to_string(),
        _ => DEFAULT_BASENAME.to_string(),
    }
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn basename_for_backend(backend: Option<&str>) -> String {
    match backend {
        Some(b @ ("cuda" | "vulkan")) => format!("libcapllama_llama_{b}.so"),
        _ => DEFAULT_BASENAME.to_string(),
    }
}

fn read_runtime_json(root: &Path) -> Option<Json> {
    let bytes = std::fs::read(root.join(RUNTIME_MANIFEST)).ok()?;
    serde_json::from_slice::<Json>(&bytes).ok()
}

/// Top-level `key`, else `llama.<key>`.
fn lookup<'a>(j: &'a Json, key: &str) -> Option<&'a Json> {
    j.get(key).or_else(|| j.get("llama").and_then(|ll| ll.get(key)))
}

/// Directory holding the active delegate library. Relative paths are taken from `root`.
pub fn runtime_current_lib_dir(root: &Path) -> Option<PathBuf> {
    let j = read_runtime_json(root)?;
    let dir = PathBuf::from(lookup(&j, "current_lib_dir")?.as_str()?);
    Some(if dir.is_relative() { root.join(dir) } else { dir })
}

/// Explicit `delegate_basename`, else derived from `gpu_backend` (none means CPU).
pub fn runtime_delegate_filename(root: &Path) -> Option<String> {
    let j = read_runtime_json(root)?;
    if let Some(s) = lookup(&j, "delegate_basename").and_then(Json::as_str) {
        return Some(s.to_string());
    }
    let backend = lookup(&j, "gpu_backend").and_then(Json::as_str);
    Some(basename_for_backend(backend))
}
