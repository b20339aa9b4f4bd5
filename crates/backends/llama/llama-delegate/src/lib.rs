//! Llama delegate: C-ABI shim exposing llama context operations at runtime.
//!
//! Inference is a deterministic placeholder (see `session`); the exported
//! surface, ownership rules and error plumbing are the real contract.

pub mod log;
pub mod session;

use core::ffi::{c_char, c_void};
use std::{
    ffi::{CStr, CString},
    ptr, slice,
};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use capllama_abi::ffi::*;
use capllama_abi::{CompletionParams, ContextParams, EmbeddingParams, FormatChatParams, LoraAdapter, RerankParams};

use crate::session::{Failure, Outcome, Session};

// -----------------------------
// Error plumbing (thread-local)
// -----------------------------

thread_local! {
    static LAST_ERR: std::cell::RefCell<Option<CString>> = const { std::cell::RefCell::new(None) };
}

fn set_last_error(failure: Failure) -> i32 {
    let msg = CString::new(failure.message.replace('\0', "")).unwrap_or_default();
    LAST_ERR.with(|slot| *slot.borrow_mut() = Some(msg));
    failure.code
}

fn finish(result: Outcome<()>) -> i32 {
    match result {
        Ok(()) => ERR_OK,
        Err(f) => set_last_error(f),
    }
}

unsafe extern "C" fn last_error() -> CapString {
    let s = LAST_ERR.with(|slot| slot.borrow().clone());
    match s {
        Some(cs) => make_string(cs.as_bytes()),
        None => CapString::null(),
    }
}

// -----------------------------
// Helpers for FFI allocations
// -----------------------------

fn make_string(bytes: &[u8]) -> CapString {
    let mut v = Vec::with_capacity(bytes.len() + 1);
    v.extend_from_slice(bytes);
    v.push(0);
    let len = bytes.len();
    let ptr = Box::into_raw(v.into_boxed_slice()) as *mut c_char;
    CapString { ptr, len }
}

unsafe extern "C" fn free_string(s: CapString) {
    if !s.ptr.is_null() {
        let raw = ptr::slice_from_raw_parts_mut(s.ptr as *mut u8, s.len + 1);
        drop(Box::from_raw(raw));
    }
}

fn make_ints(values: Vec<i32>) -> Int32Array {
    if values.is_empty() {
        return Int32Array::null();
    }
    let len = values.len();
    let ptr = Box::into_raw(values.into_boxed_slice()) as *mut i32;
    Int32Array { ptr, len }
}

unsafe extern "C" fn free_ints(arr: Int32Array) {
    if !arr.ptr.is_null() {
        drop(Box::from_raw(ptr::slice_from_raw_parts_mut(arr.ptr, arr.len)));
    }
}

fn make_floats(values: Vec<f32>) -> FloatArray {
    if values.is_empty() {
        return FloatArray::null();
    }
    let len = values.len();
    let ptr = Box::into_raw(values.into_boxed_slice()) as *mut f32;
    FloatArray { ptr, len }
}

unsafe extern "C" fn free_floats(arr: FloatArray) {
    if !arr.ptr.is_null() {
        drop(Box::from_raw(ptr::slice_from_raw_parts_mut(arr.ptr, arr.len)));
    }
}

// -----------------------------
// Argument decoding
// -----------------------------

unsafe fn read_str<'a>(p: *const c_char, what: &str) -> Outcome<&'a str> {
    if p.is_null() {
        return Err(Failure::invalid(format!("null {what}")));
    }
    CStr::from_ptr(p)
        .to_str()
        .map_err(|e| Failure::invalid(format!("invalid UTF-8 in {what}: {e}")))
}

unsafe fn read_opt_str<'a>(p: *const c_char, what: &str) -> Outcome<Option<&'a str>> {
    if p.is_null() {
        return Ok(None);
    }
    read_str(p, what).map(Some)
}

unsafe fn read_json<T: DeserializeOwned + Default>(p: *const c_char, what: &str) -> Outcome<T> {
    match read_opt_str(p, what)? {
        None => Ok(T::default()),
        Some(s) if s.trim().is_empty() => Ok(T::default()),
        Some(s) => serde_json::from_str(s).map_err(|e| Failure::invalid(format!("bad {what} JSON: {e}"))),
    }
}

unsafe fn read_tokens<'a>(tokens: *const i32, len: usize) -> Outcome<&'a [i32]> {
    if len == 0 {
        return Ok(&[]);
    }
    if tokens.is_null() {
        return Err(Failure::invalid("null tokens"));
    }
    Ok(slice::from_raw_parts(tokens, len))
}

unsafe fn session_mut<'a>(p: *mut c_void) -> Outcome<&'a mut Session> {
    if p.is_null() {
        return Err(Failure::invalid("null session"));
    }
    Ok(&mut *(p as *mut Session))
}

unsafe fn write_json<T: Serialize>(out: *mut CapString, value: &T) -> Outcome<()> {
    if out.is_null() {
        return Err(Failure::invalid("null out pointer"));
    }
    let js = serde_json::to_string(value).map_err(|e| Failure::fail(format!("serde_json failed: {e}")))?;
    *out = make_string(js.as_bytes());
    Ok(())
}

unsafe fn write_value<T: Copy>(out: *mut T, value: T) -> Outcome<()> {
    if out.is_null() {
        return Err(Failure::invalid("null out pointer"));
    }
    *out = value;
    Ok(())
}

// -----------------------------
// Log API
// -----------------------------

unsafe extern "C" fn set_log_callback(cb: Option<LogCallbackFn>, user_data: *mut c_void) {
    log::set_callback(cb, user_data);
}

unsafe extern "C" fn toggle_native_log(enabled: bool) -> i32 {
    log::set_enabled(enabled);
    log::emit("info", if enabled { "native logging enabled" } else { "native logging disabled" });
    ERR_OK
}

// -----------------------------
// Session API wrappers
// -----------------------------

unsafe extern "C" fn create_session(
    params_json: *const c_char,
    out_session: *mut *mut c_void,
    out_info: *mut CapString,
) -> i32 {
    finish((|| -> Outcome<()> {
        if out_session.is_null() {
            return Err(Failure::invalid("null out_session"));
        }
        let json = read_str(params_json, "params_json")?;
        let params: ContextParams =
            serde_json::from_str(json).map_err(|e| Failure::invalid(format!("bad ContextParams JSON: {e}")))?;
        let (session, info) = Session::create(params)?;
        write_json(out_info, &info)?;
        *out_session = Box::into_raw(Box::new(session)) as *mut c_void;
        Ok(())
    })())
}

unsafe extern "C" fn destroy_session(session: *mut c_void) {
    if !session.is_null() {
        drop(Box::from_raw(session as *mut Session));
    }
}

unsafe extern "C" fn formatted_chat(
    session: *mut c_void,
    messages_json: *const c_char,
    chat_template: *const c_char,
    params_json: *const c_char,
    out: *mut CapString,
) -> i32 {
    finish((|| -> Outcome<()> {
        let s = session_mut(session)?;
        let messages = read_str(messages_json, "messages_json")?;
        let template = read_opt_str(chat_template, "chat_template")?;
        let params: FormatChatParams = read_json(params_json, "params_json")?;
        let formatted = s.formatted_chat(messages, template, &params)?;
        write_json(out, &formatted)
    })())
}

unsafe extern "C" fn completion(
    session: *mut c_void,
    params_json: *const c_char,
    on_token: Option<TokenCallbackFn>,
    user_data: *mut c_void,
    out: *mut CapString,
) -> i32 {
    finish((|| -> Outcome<()> {
        let s = session_mut(session)?;
        let params: CompletionParams = read_json(params_json, "params_json")?;
        let mut emit = |token: &capllama_abi::TokenData| -> bool {
            let Some(cb) = on_token else { return true };
            match serde_json::to_string(token).ok().and_then(|js| CString::new(js).ok()) {
                Some(js) => cb(js.as_ptr(), user_data),
                None => true,
            }
        };
        let result = s.completion(&params, &mut emit)?;
        write_json(out, &result)
    })())
}

unsafe extern "C" fn load_session(session: *mut c_void, path: *const c_char, out: *mut CapString) -> i32 {
    finish((|| -> Outcome<()> {
        let s = session_mut(session)?;
        let loaded = s.load_session(read_str(path, "path")?)?;
        write_json(out, &loaded)
    })())
}

unsafe extern "C" fn save_session(session: *mut c_void, path: *const c_char, size: i32, out_saved: *mut i32) -> i32 {
    finish((|| -> Outcome<()> {
        let s = session_mut(session)?;
        let saved = s.save_session(read_str(path, "path")?, size)?;
        write_value(out_saved, saved)
    })())
}

unsafe extern "C" fn tokenize(
    session: *mut c_void,
    text: *const c_char,
    media_paths_json: *const c_char,
    out: *mut CapString,
) -> i32 {
    finish((|| -> Outcome<()> {
        let s = session_mut(session)?;
        let media: Vec<String> = read_json(media_paths_json, "media_paths_json")?;
        let result = s.tokenize(read_str(text, "text")?, &media)?;
        write_json(out, &result)
    })())
}

unsafe extern "C" fn detokenize(session: *mut c_void, tokens: *const i32, len: usize, out: *mut CapString) -> i32 {
    finish((|| -> Outcome<()> {
        let s = session_mut(session)?;
        let text = s.detokenize(read_tokens(tokens, len)?);
        if out.is_null() {
            return Err(Failure::invalid("null out pointer"));
        }
        *out = make_string(text.as_bytes());
        Ok(())
    })())
}

unsafe extern "C" fn embedding(
    session: *mut c_void,
    text: *const c_char,
    params_json: *const c_char,
    out: *mut FloatArray,
) -> i32 {
    finish((|| -> Outcome<()> {
        let s = session_mut(session)?;
        let params: EmbeddingParams = read_json(params_json, "params_json")?;
        let v = s.embedding(read_str(text, "text")?, &params)?;
        write_value(out, make_floats(v))
    })())
}

unsafe extern "C" fn rerank(
    session: *mut c_void,
    query: *const c_char,
    documents_json: *const c_char,
    params_json: *const c_char,
    out: *mut CapString,
) -> i32 {
    finish((|| -> Outcome<()> {
        let s = session_mut(session)?;
        let documents: Vec<String> = read_json(documents_json, "documents_json")?;
        let params: RerankParams = read_json(params_json, "params_json")?;
        let ranked = s.rerank(read_str(query, "query")?, &documents, &params);
        write_json(out, &ranked)
    })())
}

unsafe extern "C" fn bench(session: *mut c_void, pp: i32, tg: i32, pl: i32, nr: i32, out: *mut CapString) -> i32 {
    finish((|| -> Outcome<()> {
        let s = session_mut(session)?;
        let report = s.bench(pp, tg, pl, nr);
        if out.is_null() {
            return Err(Failure::invalid("null out pointer"));
        }
        *out = make_string(report.as_bytes());
        Ok(())
    })())
}

unsafe extern "C" fn apply_lora(session: *mut c_void, adapters_json: *const c_char) -> i32 {
    finish((|| -> Outcome<()> {
        let s = session_mut(session)?;
        let adapters: Vec<LoraAdapter> = read_json(adapters_json, "adapters_json")?;
        s.apply_lora(adapters)
    })())
}

unsafe extern "C" fn remove_lora(session: *mut c_void) -> i32 {
    finish(session_mut(session).map(Session::remove_lora))
}

unsafe extern "C" fn loaded_lora(session: *mut c_void, out: *mut CapString) -> i32 {
    finish((|| -> Outcome<()> {
        let s = session_mut(session)?;
        write_json(out, &s.loaded_lora())
    })())
}

unsafe extern "C" fn init_multimodal(
    session: *mut c_void,
    path: *const c_char,
    use_gpu: bool,
    out_ok: *mut bool,
) -> i32 {
    finish((|| -> Outcome<()> {
        let s = session_mut(session)?;
        let ok = s.init_multimodal(read_str(path, "path")?, use_gpu)?;
        write_value(out_ok, ok)
    })())
}

unsafe extern "C" fn multimodal_support(session: *mut c_void, out: *mut CapString) -> i32 {
    finish((|| -> Outcome<()> {
        let s = session_mut(session)?;
        write_json(out, &s.multimodal_support())
    })())
}

unsafe extern "C" fn release_multimodal(session: *mut c_void) -> i32 {
    finish(session_mut(session).map(Session::release_multimodal))
}

unsafe extern "C" fn init_vocoder(session: *mut c_void, path: *const c_char, n_batch: i32, out_ok: *mut bool) -> i32 {
    finish((|| -> Outcome<()> {
        let s = session_mut(session)?;
        let ok = s.init_vocoder(read_str(path, "path")?, n_batch)?;
        write_value(out_ok, ok)
    })())
}

unsafe extern "C" fn formatted_audio_completion(
    session: *mut c_void,
    speaker_json: *const c_char,
    text: *const c_char,
    out: *mut CapString,
) -> i32 {
    finish((|| -> Outcome<()> {
        let s = session_mut(session)?;
        let speaker: Option<Value> = read_json(speaker_json, "speaker_json")?;
        let audio = s.formatted_audio_completion(speaker.as_ref().filter(|v| !v.is_null()), read_str(text, "text")?)?;
        write_json(out, &audio)
    })())
}

unsafe extern "C" fn audio_guide_tokens(session: *mut c_void, text: *const c_char, out: *mut Int32Array) -> i32 {
    finish((|| -> Outcome<()> {
        let s = session_mut(session)?;
        let tokens = s.audio_guide_tokens(read_str(text, "text")?)?;
        write_value(out, make_ints(tokens))
    })())
}

unsafe extern "C" fn decode_audio_tokens(
    session: *mut c_void,
    tokens: *const i32,
    len: usize,
    out: *mut FloatArray,
) -> i32 {
    finish((|| -> Outcome<()> {
        let s = session_mut(session)?;
        let audio = s.decode_audio_tokens(read_tokens(tokens, len)?)?;
        write_value(out, make_floats(audio))
    })())
}

unsafe extern "C" fn release_vocoder(session: *mut c_void) -> i32 {
    finish(session_mut(session).map(Session::release_vocoder))
}

// -----------------------------
// Static DelegateApi surface
// -----------------------------

static API: DelegateApi = DelegateApi {
    info: DelegateInfo {
        abi_version: CAPLLAMA_ABI_VERSION,
        id: c"llama".as_ptr(),
        semver: c"0.1.0".as_ptr(),
    },
    memory: MemoryApi {
        free_string,
        free_ints,
        free_floats,
        last_error,
    },
    log: LogApi {
        set_log_callback,
        toggle_native_log,
    },
    session: SessionApi {
        create_session,
        destroy_session,

        formatted_chat,
        completion,

        load_session,
        save_session,

        tokenize,
        detokenize,

        embedding,
        rerank,
        bench,

        apply_lora,
        remove_lora,
        loaded_lora,

        init_multimodal,
        multimodal_support,
        release_multimodal,

        init_vocoder,
        formatted_audio_completion,
        audio_guide_tokens,
        decode_audio_tokens,
        release_vocoder,
    },
};

#[no_mangle]
pub extern "C" fn capllama_delegate_entry_v1() -> *const DelegateApi {
    &API as *const DelegateApi
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn take(s: CapString) -> String {
        let out = CStr::from_ptr(s.ptr).to_str().unwrap().to_string();
        free_string(s);
        out
    }

    #[test]
    fn entry_reports_abi_version() {
        let api = unsafe { &*capllama_delegate_entry_v1() };
        assert_eq!(api.info.abi_version, CAPLLAMA_ABI_VERSION);
        let id = unsafe { CStr::from_ptr(api.info.id) };
        assert_eq!(id.to_str().unwrap(), "llama");
    }

    #[test]
    fn create_session_failure_sets_last_error() {
        let api = unsafe { &*capllama_delegate_entry_v1() };
        let params = CString::new(r#"{"model":""}"#).unwrap();
        let mut info = CapString::null();
        let mut s = ptr::null_mut();
        let rc = unsafe { (api.session.create_session)(params.as_ptr(), &mut s, &mut info) };
        assert_eq!(rc, ERR_INVALID);
        assert!(s.is_null());
        let err = unsafe { take((api.memory.last_error)()) };
        assert!(err.contains("model path"));
    }

    #[test]
    fn session_lifecycle_over_the_vtable() {
        let api = unsafe { &*capllama_delegate_entry_v1() };
        let params = CString::new(r#"{"model":"/m/x.gguf"}"#).unwrap();
        let mut info = CapString::null();
        unsafe {
            let mut s = ptr::null_mut();
            assert_eq!((api.session.create_session)(params.as_ptr(), &mut s, &mut info), ERR_OK);
            assert!(!s.is_null());
            let info: capllama_abi::SessionInfo = serde_json::from_str(&take(info)).unwrap();
            assert_eq!(info.model.desc, session::SAMPLE_MODEL_DESC);

            let text = CString::new("ab").unwrap();
            let mut out = CapString::null();
            assert_eq!((api.session.tokenize)(s, text.as_ptr(), ptr::null(), &mut out), ERR_OK);
            let toks: capllama_abi::TokenizeResult = serde_json::from_str(&take(out)).unwrap();
            assert_eq!(toks.tokens, vec![97, 98]);

            let mut arr = Int32Array::null();
            assert_eq!((api.session.audio_guide_tokens)(s, text.as_ptr(), &mut arr), ERR_FAIL);
            assert!(arr.ptr.is_null());

            (api.session.destroy_session)(s);
        }
    }
}
