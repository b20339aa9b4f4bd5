//! Native log forwarding to the host-registered callback.

use core::ffi::c_void;
use std::ffi::CString;
use std::sync::Mutex;

use capllama_abi::ffi::LogCallbackFn;
use once_cell::sync::Lazy;

struct Sink {
    callback: Option<LogCallbackFn>,
    // Stored as an address so the sink is Send; only ever handed back to the callback.
    user_data: usize,
    enabled: bool,
}

static SINK: Lazy<Mutex<Sink>> = Lazy::new(|| {
    Mutex::new(Sink {
        callback: None,
        user_data: 0,
        enabled: false,
    })
});

pub fn set_callback(callback: Option<LogCallbackFn>, user_data: *mut c_void) {
    if let Ok(mut sink) = SINK.lock() {
        sink.callback = callback;
        sink.user_data = user_data as usize;
    }
}

pub fn set_enabled(enabled: bool) {
    if let Ok(mut sink) = SINK.lock() {
        sink.enabled = enabled;
    }
}

/// Delivered only while logging is enabled and a callback is registered.
pub fn emit(level: &str, text: &str) {
    let (callback, user_data) = match SINK.lock() {
        Ok(sink) if sink.enabled => (sink.callback, sink.user_data),
        _ => return,
    };
    let Some(callback) = callback else { return };
    let (Ok(level), Ok(text)) = (CString::new(level), CString::new(text.replace('\0', ""))) else {
        return;
    };
    // The lock is released before calling out so the callback may log again.
    unsafe { callback(level.as_ptr(), text.as_ptr(), user_data as *mut c_void) };
}
