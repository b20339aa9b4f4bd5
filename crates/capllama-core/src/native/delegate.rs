//! `Delegate`/`Session` over the C vtable of a loaded delegate library.

use core::ffi::{c_char, c_void};
use std::{
    ffi::{CStr, CString},
    ptr, slice,
    sync::{
        atomic::{AtomicU64, Ordering},
        PoisonError, RwLock,
    },
};

use capllama_abi::ffi::*;
use capllama_abi::{
    AudioCompletion, CompletionParams, CompletionResult, ContextParams, EmbeddingParams,
    EmbeddingResult, FormatChatParams, FormattedChat, LoraAdapter, MultimodalParams,
    MultimodalSupport, NativeLog, RerankParams, RerankResult, SessionInfo, SessionLoadResult,
    TokenData, TokenizeResult, VocoderParams,
};
use once_cell::sync::Lazy;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::config::PluginConfig;
use crate::delegate::{Delegate, Session, TokenSink};
use crate::errors::{PluginError, Result};
use crate::events::{EventBus, PluginEvent};
use crate::logging::forward_native;
use crate::native::loader::{check_abi, load_delegate_once};

// Native logs arrive on arbitrary threads through one process-wide C callback;
// every live `NativeDelegate` gets a copy on its own bus.
static LOG_LISTENERS: Lazy<RwLock<Vec<(u64, EventBus)>>> = Lazy::new(|| RwLock::new(Vec::new()));
static NEXT_LISTENER: AtomicU64 = AtomicU64::new(1);

fn add_log_listener(events: EventBus) -> u64 {
    let id = NEXT_LISTENER.fetch_add(1, Ordering::Relaxed);
    LOG_LISTENERS
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .push((id, events));
    id
}

fn remove_log_listener(id: u64) {
    LOG_LISTENERS
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .retain(|(l, _)| *l != id);
}

unsafe extern "C" fn on_native_log(level: *const c_char, text: *const c_char, _user_data: *mut c_void) {
    if level.is_null() || text.is_null() {
        return;
    }
    let level = CStr::from_ptr(level).to_string_lossy().into_owned();
    let text = CStr::from_ptr(text).to_string_lossy().into_owned();
    forward_native(&level, &text);
    let buses: Vec<EventBus> = LOG_LISTENERS
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|(_, bus)| bus.clone())
        .collect();
    let event = PluginEvent::NativeLog(NativeLog { level, text });
    for bus in buses {
        bus.emit(event.clone());
    }
}

unsafe extern "C" fn on_token(token_json: *const c_char, user_data: *mut c_void) -> bool {
    if token_json.is_null() || user_data.is_null() {
        return true;
    }
    let sink = &mut *(user_data as *mut TokenSink<'_>);
    match CStr::from_ptr(token_json).to_str().map(serde_json::from_str::<TokenData>) {
        Ok(Ok(token)) => sink(token),
        _ => {
            tracing::warn!("dropping malformed token payload from delegate");
            true
        }
    }
}

fn cstring(s: &str, what: &str) -> Result<CString> {
    CString::new(s).map_err(|_| PluginError::invalid(format!("{what} contains an interior NUL")))
}

fn to_json<T: Serialize + ?Sized>(value: &T, what: &str) -> Result<CString> {
    let js = serde_json::to_string(value).map_err(|e| PluginError::invalid(format!("{what}: {e}")))?;
    cstring(&js, what)
}

fn parse<T: DeserializeOwned>(payload: &str, what: &str) -> Result<T> {
    serde_json::from_str(payload)
        .map_err(|e| PluginError::failed(format!("malformed {what} from delegate: {e}; raw={payload}")))
}

unsafe fn take_string(api: &DelegateApi, s: CapString) -> String {
    if s.ptr.is_null() {
        return String::new();
    }
    let out = String::from_utf8_lossy(slice::from_raw_parts(s.ptr as *const u8, s.len)).into_owned();
    (api.memory.free_string)(s);
    out
}

unsafe fn take_ints(api: &DelegateApi, arr: Int32Array) -> Vec<i32> {
    if arr.ptr.is_null() {
        return Vec::new();
    }
    let out = slice::from_raw_parts(arr.ptr, arr.len).to_vec();
    (api.memory.free_ints)(arr);
    out
}

unsafe fn take_floats(api: &DelegateApi, arr: FloatArray) -> Vec<f32> {
    if arr.ptr.is_null() {
        return Vec::new();
    }
    let out = slice::from_raw_parts(arr.ptr, arr.len).to_vec();
    (api.memory.free_floats)(arr);
    out
}

/// Builds the error for a failed call from the delegate's thread-local message.
fn native_error(api: &DelegateApi, code: i32, op: &str) -> PluginError {
    let msg = unsafe { take_string(api, (api.memory.last_error)()) };
    let msg = if msg.is_empty() { format!("{op} failed") } else { msg };
    PluginError::from_native(code, msg)
}

fn check(api: &DelegateApi, rc: i32, op: &str) -> Result<()> {
    if rc == ERR_OK {
        Ok(())
    } else {
        Err(native_error(api, rc, op))
    }
}

pub struct NativeDelegate {
    api: &'static DelegateApi,
    name: String,
    log_listener: u64,
}

impl NativeDelegate {
    /// Wraps an already resolved vtable and routes its logs to `events`.
    pub fn new(api: &'static DelegateApi, events: EventBus) -> Result<Self> {
        check_abi(api)?;
        let name = if api.info.id.is_null() {
            "unknown".to_string()
        } else {
            unsafe { CStr::from_ptr(api.info.id) }.to_string_lossy().into_owned()
        };
        let log_listener = add_log_listener(events);
        unsafe { (api.log.set_log_callback)(Some(on_native_log), ptr::null_mut()) };
        tracing::info!(delegate = %name, abi = api.info.abi_version, "native delegate ready");
        Ok(Self {
            api,
            name,
            log_listener,
        })
    }

    /// Locates and loads the delegate library described by `config`.
    pub fn load(config: &PluginConfig, events: EventBus) -> Result<Self> {
        let loaded = load_delegate_once(config)?;
        Self::new(loaded.api, events)
    }
}

impl Drop for NativeDelegate {
    fn drop(&mut self) {
        remove_log_listener(self.log_listener);
    }
}

impl Delegate for NativeDelegate {
    fn name(&self) -> &str {
        &self.name
    }

    fn toggle_native_log(&self, enabled: bool) -> Result<()> {
        let rc = unsafe { (self.api.log.toggle_native_log)(enabled) };
        check(self.api, rc, "toggleNativeLog")
    }

    fn create_session(&self, params: &ContextParams) -> Result<(Box<dyn Session>, SessionInfo)> {
        let js = to_json(params, "params")?;
        let mut out = CapString::null();
        let mut raw = ptr::null_mut();
        let rc = unsafe { (self.api.session.create_session)(js.as_ptr(), &mut raw, &mut out) };
        if rc != ERR_OK || raw.is_null() {
            unsafe { take_string(self.api, out) };
            return Err(native_error(self.api, if rc == ERR_OK { ERR_FAIL } else { rc }, "create_session"));
        }
        let session = NativeSession { api: self.api, raw };
        let info = parse(&unsafe { take_string(self.api, out) }, "SessionInfo")?;
        Ok((Box::new(session), info))
    }
}

pub struct NativeSession {
    api: &'static DelegateApi,
    raw: *mut c_void,
}

impl Drop for NativeSession {
    fn drop(&mut self) {
        if !self.raw.is_null() {
            unsafe { (self.api.session.destroy_session)(self.raw) };
            self.raw = ptr::null_mut();
        }
    }
}

// SAFETY: the raw session is only touched through `&mut self`, and the
// registry hands out one `&mut` at a time.
unsafe impl Send for NativeSession {}

impl NativeSession {
    fn string_call(&self, op: &str, f: impl FnOnce(*mut CapString) -> i32) -> Result<String> {
        let mut out = CapString::null();
        let rc = f(&mut out);
        if rc != ERR_OK {
            unsafe { take_string(self.api, out) };
            return Err(native_error(self.api, rc, op));
        }
        Ok(unsafe { take_string(self.api, out) })
    }

    fn json_call<T: DeserializeOwned>(&self, op: &str, what: &str, f: impl FnOnce(*mut CapString) -> i32) -> Result<T> {
        parse(&self.string_call(op, f)?, what)
    }

    fn bool_call(&self, op: &str, f: impl FnOnce(*mut bool) -> i32) -> Result<bool> {
        let mut ok = false;
        check(self.api, f(&mut ok), op)?;
        Ok(ok)
    }

    fn unit_call(&self, op: &str, f: SessionUnitFn) -> Result<()> {
        check(self.api, unsafe { f(self.raw) }, op)
    }
}

impl Session for NativeSession {
    fn formatted_chat(
        &mut self,
        messages_json: &str,
        chat_template: Option<&str>,
        params: &FormatChatParams,
    ) -> Result<FormattedChat> {
        let messages = cstring(messages_json, "messages")?;
        let template = chat_template.map(|t| cstring(t, "chatTemplate")).transpose()?;
        let params = to_json(params, "params")?;
        let template_ptr = template.as_ref().map_or(ptr::null(), |t| t.as_ptr());
        self.json_call("getFormattedChat", "FormattedChat", |out| unsafe {
            (self.api.session.formatted_chat)(self.raw, messages.as_ptr(), template_ptr, params.as_ptr(), out)
        })
    }

    fn completion(&mut self, params: &CompletionParams, on_token_sink: TokenSink<'_>) -> Result<CompletionResult> {
        let params = to_json(params, "params")?;
        let mut sink: TokenSink<'_> = on_token_sink;
        let user_data = &mut sink as *mut TokenSink<'_> as *mut c_void;
        self.json_call("completion", "CompletionResult", |out| unsafe {
            (self.api.session.completion)(self.raw, params.as_ptr(), Some(on_token), user_data, out)
        })
    }

    fn load_session(&mut self, path: &str) -> Result<SessionLoadResult> {
        let path = cstring(path, "filepath")?;
        self.json_call("loadSession", "SessionLoadResult", |out| unsafe {
            (self.api.session.load_session)(self.raw, path.as_ptr(), out)
        })
    }

    fn save_session(&mut self, path: &str, size: i32) -> Result<i32> {
        let path = cstring(path, "filepath")?;
        let mut saved = 0i32;
        let rc = unsafe { (self.api.session.save_session)(self.raw, path.as_ptr(), size, &mut saved) };
        check(self.api, rc, "saveSession")?;
        Ok(saved)
    }

    fn tokenize(&mut self, text: &str, media_paths: &[String]) -> Result<TokenizeResult> {
        let text = cstring(text, "text")?;
        let media = to_json(media_paths, "imagePaths")?;
        self.json_call("tokenize", "TokenizeResult", |out| unsafe {
            (self.api.session.tokenize)(self.raw, text.as_ptr(), media.as_ptr(), out)
        })
    }

    fn detokenize(&mut self, tokens: &[i32]) -> Result<String> {
        self.string_call("detokenize", |out| unsafe {
            (self.api.session.detokenize)(self.raw, tokens.as_ptr(), tokens.len(), out)
        })
    }

    fn embedding(&mut self, text: &str, params: &EmbeddingParams) -> Result<EmbeddingResult> {
        let text = cstring(text, "text")?;
        let params = to_json(params, "params")?;
        let mut out = FloatArray::null();
        let rc = unsafe { (self.api.session.embedding)(self.raw, text.as_ptr(), params.as_ptr(), &mut out) };
        let embedding = unsafe { take_floats(self.api, out) };
        check(self.api, rc, "embedding")?;
        Ok(EmbeddingResult { embedding })
    }

    fn rerank(&mut self, query: &str, documents: &[String], params: &RerankParams) -> Result<Vec<RerankResult>> {
        let query = cstring(query, "query")?;
        let docs = to_json(documents, "documents")?;
        let params = to_json(params, "params")?;
        self.json_call("rerank", "RerankResult list", |out| unsafe {
            (self.api.session.rerank)(self.raw, query.as_ptr(), docs.as_ptr(), params.as_ptr(), out)
        })
    }

    fn bench(&mut self, pp: i32, tg: i32, pl: i32, nr: i32) -> Result<String> {
        self.string_call("bench", |out| unsafe { (self.api.session.bench)(self.raw, pp, tg, pl, nr, out) })
    }

    fn apply_lora(&mut self, adapters: &[LoraAdapter]) -> Result<()> {
        let js = to_json(adapters, "loraAdapters")?;
        let rc = unsafe { (self.api.session.apply_lora)(self.raw, js.as_ptr()) };
        check(self.api, rc, "applyLoraAdapters")
    }

    fn remove_lora(&mut self) -> Result<()> {
        self.unit_call("removeLoraAdapters", self.api.session.remove_lora)
    }

    fn loaded_lora(&mut self) -> Result<Vec<LoraAdapter>> {
        self.json_call("getLoadedLoraAdapters", "LoRA adapter list", |out| unsafe {
            (self.api.session.loaded_lora)(self.raw, out)
        })
    }

    fn init_multimodal(&mut self, params: &MultimodalParams) -> Result<bool> {
        let path = cstring(&params.path, "path")?;
        self.bool_call("initMultimodal", |ok| unsafe {
            (self.api.session.init_multimodal)(self.raw, path.as_ptr(), params.use_gpu, ok)
        })
    }

    fn multimodal_support(&mut self) -> Result<MultimodalSupport> {
        self.json_call("getMultimodalSupport", "MultimodalSupport", |out| unsafe {
            (self.api.session.multimodal_support)(self.raw, out)
        })
    }

    fn release_multimodal(&mut self) -> Result<()> {
        self.unit_call("releaseMultimodal", self.api.session.release_multimodal)
    }

    fn init_vocoder(&mut self, params: &VocoderParams) -> Result<bool> {
        let path = cstring(&params.path, "path")?;
        let n_batch = params.n_batch.unwrap_or(0);
        self.bool_call("initVocoder", |ok| unsafe {
            (self.api.session.init_vocoder)(self.raw, path.as_ptr(), n_batch, ok)
        })
    }

    fn formatted_audio_completion(&mut self, speaker: Option<&Value>, text: &str) -> Result<AudioCompletion> {
        let speaker = speaker.map(|s| to_json(s, "speakerJsonStr")).transpose()?;
        let speaker_ptr = speaker.as_ref().map_or(ptr::null(), |s| s.as_ptr());
        let text = cstring(text, "textToSpeak")?;
        self.json_call("getFormattedAudioCompletion", "AudioCompletion", |out| unsafe {
            (self.api.session.formatted_audio_completion)(self.raw, speaker_ptr, text.as_ptr(), out)
        })
    }

    fn audio_guide_tokens(&mut self, text: &str) -> Result<Vec<i32>> {
        let text = cstring(text, "textToSpeak")?;
        let mut out = Int32Array::null();
        let rc = unsafe { (self.api.session.audio_guide_tokens)(self.raw, text.as_ptr(), &mut out) };
        let tokens = unsafe { take_ints(self.api, out) };
        check(self.api, rc, "getAudioCompletionGuideTokens")?;
        Ok(tokens)
    }

    fn decode_audio_tokens(&mut self, tokens: &[i32]) -> Result<Vec<f32>> {
        let mut out = FloatArray::null();
        let rc = unsafe { (self.api.session.decode_audio_tokens)(self.raw, tokens.as_ptr(), tokens.len(), &mut out) };
        let audio = unsafe { take_floats(self.api, out) };
        check(self.api, rc, "decodeAudioTokens")?;
        Ok(audio)
    }

    fn release_vocoder(&mut self) -> Result<()> {
        self.unit_call("releaseVocoder", self.api.session.release_vocoder)
    }
}
