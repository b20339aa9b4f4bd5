use std::sync::OnceLock;

use capllama_abi::ffi::{DelegateApi, DelegateEntryFn, CAPLLAMA_ABI_VERSION, DELEGATE_ENTRY_SYMBOL};
use libloading::Library;

use crate::config::PluginConfig;
use crate::errors::{PluginError, Result};
use crate::native::locate::locate_delegate_binary;

pub struct LoadedDelegate {
    // Kept alive for the life of the process; `api` points into it.
    _lib: Library,
    pub api: &'static DelegateApi,
}

static DELEGATE: OnceLock<std::result::Result<LoadedDelegate, String>> = OnceLock::new();

/// Loads the delegate library on first use; later calls return the same result.
pub fn load_delegate_once(config: &PluginConfig) -> Result<&'static LoadedDelegate> {
    DELEGATE
        .get_or_init(|| {
            let Some(path) = locate_delegate_binary(config) else {
                return Err("native delegate not found; set CAPLLAMA_DELEGATE_PATH or install a runtime".into());
            };
            match unsafe { Library::new(&path) } {
                Ok(lib) => init_loaded(lib),
                Err(e) => Err(format!("failed to load delegate {}: {e}", path.display())),
            }
        })
        .as_ref()
        .map_err(|e| PluginError::failed(e.clone()))
}

fn init_loaded(lib: Library) -> std::result::Result<LoadedDelegate, String> {
    let entry: DelegateEntryFn = unsafe {
        *lib.get::<DelegateEntryFn>(DELEGATE_ENTRY_SYMBOL.as_bytes())
            .map_err(|e| format!("missing symbol {DELEGATE_ENTRY_SYMBOL}: {e}"))?
    };
    let api = unsafe { api_from_entry(entry) }.map_err(|e| e.to_string())?;
    Ok(LoadedDelegate { _lib: lib, api })
}

/// Calls a delegate entry point and checks the ABI version.
///
/// # Safety
/// `entry` must return null or a pointer to a `DelegateApi` that stays valid
/// for the rest of the process.
pub unsafe fn api_from_entry(entry: DelegateEntryFn) -> Result<&'static DelegateApi> {
    let api_ptr = entry();
    if api_ptr.is_null() {
        return Err(PluginError::failed("delegate entry returned null"));
    }
    let api = &*api_ptr;
    check_abi(api)?;
    Ok(api)
}

pub fn check_abi(api: &DelegateApi) -> Result<()> {
    if api.info.abi_version != CAPLLAMA_ABI_VERSION {
        return Err(PluginError::failed(format!(
            "ABI mismatch: host={} delegate={}",
            CAPLLAMA_ABI_VERSION, api.info.abi_version
        )));
    }
    Ok(())
}
