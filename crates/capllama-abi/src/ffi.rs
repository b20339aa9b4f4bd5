//! C ABI between the plugin host and a native delegate library.
//!
//! Ownership rules:
//! - Every pointer the host passes in (C strings, token slices, user data) is
//!   host-owned and only borrowed for the duration of the call.
//! - Every `CapString`, `Int32Array` and `FloatArray` handed back by the
//!   delegate is delegate-owned memory. The host copies it out and releases it
//!   with the matching `free_*` function from the same vtable, exactly once.
//! - Sessions come from `create_session` and are released exactly once with
//!   `destroy_session`. The host never frees a session any other way.
//!
//! Structured values (params, results) travel as UTF-8 JSON whose shapes are
//! the serde types of this crate.

use core::ffi::{c_char, c_void};

/// Bump this when you break the ABI. Host checks it at load time.
pub const CAPLLAMA_ABI_VERSION: u32 = 1;

pub const DELEGATE_ENTRY_SYMBOL: &str = "capllama_delegate_entry_v1";

pub const ERR_OK: i32 = 0;
pub const ERR_FAIL: i32 = 1;
pub const ERR_INVALID: i32 = 2;
pub const ERR_MODEL_NOT_FOUND: i32 = 3;
pub const ERR_NOT_IMPLEMENTED: i32 = 4;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct CapString {
    pub ptr: *mut c_char,
    pub len: usize,
}

impl CapString {
    pub const fn null() -> Self {
        Self {
            ptr: core::ptr::null_mut(),
            len: 0,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Int32Array {
    pub ptr: *mut i32,
    pub len: usize,
}

impl Int32Array {
    pub const fn null() -> Self {
        Self {
            ptr: core::ptr::null_mut(),
            len: 0,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct FloatArray {
    pub ptr: *mut f32,
    pub len: usize,
}

impl FloatArray {
    pub const fn null() -> Self {
        Self {
            ptr: core::ptr::null_mut(),
            len: 0,
        }
    }
}

#[repr(C)]
pub struct DelegateInfo {
    pub abi_version: u32,
    pub id: *const c_char,     // "llama"
    pub semver: *const c_char, // "0.1.0"
}

// ---------- Callbacks (host-provided) ----------

/// `level` and `text` are borrowed for the duration of the call.
pub type LogCallbackFn =
    unsafe extern "C" fn(level: *const c_char, text: *const c_char, user_data: *mut c_void);

/// `token_json` is a borrowed JSON `TokenData`. Return `false` to stop the completion.
pub type TokenCallbackFn = unsafe extern "C" fn(token_json: *const c_char, user_data: *mut c_void) -> bool;

// ---------- Function pointer types (C ABI) ----------

pub type FreeStringFn = unsafe extern "C" fn(s: CapString);
pub type FreeIntsFn = unsafe extern "C" fn(arr: Int32Array);
pub type FreeFloatsFn = unsafe extern "C" fn(arr: FloatArray);
pub type LastErrorFn = unsafe extern "C" fn() -> CapString;

pub type SetLogCallbackFn = unsafe extern "C" fn(cb: Option<LogCallbackFn>, user_data: *mut c_void);
pub type ToggleNativeLogFn = unsafe extern "C" fn(enabled: bool) -> i32;

/// `params_json` is a `ContextParams`. On success `out_session` receives the new
/// session and `out_info` a `SessionInfo` JSON; on failure both are left untouched.
pub type CreateSessionFn = unsafe extern "C" fn(
    params_json: *const c_char,
    out_session: *mut *mut c_void,
    out_info: *mut CapString,
) -> i32;
pub type DestroySessionFn = unsafe extern "C" fn(session: *mut c_void);

/// `chat_template` and `params_json` may be null. `out` receives a `FormattedChat` JSON.
pub type FormattedChatFn = unsafe extern "C" fn(
    session: *mut c_void,
    messages_json: *const c_char,
    chat_template: *const c_char,
    params_json: *const c_char,
    out: *mut CapString,
) -> i32;

/// `on_token` may be None. `out` receives a `CompletionResult` JSON.
pub type CompletionFn = unsafe extern "C" fn(
    session: *mut c_void,
    params_json: *const c_char,
    on_token: Option<TokenCallbackFn>,
    user_data: *mut c_void,
    out: *mut CapString,
) -> i32;

/// `out` receives a `SessionLoadResult` JSON.
pub type LoadSessionFn =
    unsafe extern "C" fn(session: *mut c_void, path: *const c_char, out: *mut CapString) -> i32;
pub type SaveSessionFn = unsafe extern "C" fn(
    session: *mut c_void,
    path: *const c_char,
    size: i32,
    out_saved: *mut i32,
) -> i32;

/// `media_paths_json` is a JSON array of strings. `out` receives a `TokenizeResult` JSON.
pub type TokenizeFn = unsafe extern "C" fn(
    session: *mut c_void,
    text: *const c_char,
    media_paths_json: *const c_char,
    out: *mut CapString,
) -> i32;
pub type DetokenizeFn = unsafe extern "C" fn(
    session: *mut c_void,
    tokens: *const i32,
    len: usize,
    out: *mut CapString,
) -> i32;

pub type EmbeddingFn = unsafe extern "C" fn(
    session: *mut c_void,
    text: *const c_char,
    params_json: *const c_char,
    out: *mut FloatArray,
) -> i32;
/// `documents_json` is a JSON array of strings. `out` receives `[RerankResult]` JSON.
pub type RerankFn = unsafe extern "C" fn(
    session: *mut c_void,
    query: *const c_char,
    documents_json: *const c_char,
    params_json: *const c_char,
    out: *mut CapString,
) -> i32;
pub type BenchFn = unsafe extern "C" fn(
    session: *mut c_void,
    pp: i32,
    tg: i32,
    pl: i32,
    nr: i32,
    out: *mut CapString,
) -> i32;

/// `adapters_json` is a JSON array of `LoraAdapter`.
pub type ApplyLoraFn = unsafe extern "C" fn(session: *mut c_void, adapters_json: *const c_char) -> i32;
pub type SessionUnitFn = unsafe extern "C" fn(session: *mut c_void) -> i32;
pub type SessionJsonFn = unsafe extern "C" fn(session: *mut c_void, out: *mut CapString) -> i32;

pub type InitMultimodalFn = unsafe extern "C" fn(
    session: *mut c_void,
    path: *const c_char,
    use_gpu: bool,
    out_ok: *mut bool,
) -> i32;
/// `n_batch <= 0` means "delegate default".
pub type InitVocoderFn = unsafe extern "C" fn(
    session: *mut c_void,
    path: *const c_char,
    n_batch: i32,
    out_ok: *mut bool,
) -> i32;
/// `out` receives an `AudioCompletion` JSON.
pub type FormattedAudioFn = unsafe extern "C" fn(
    session: *mut c_void,
    speaker_json: *const c_char,
    text: *const c_char,
    out: *mut CapString,
) -> i32;
pub type GuideTokensFn =
    unsafe extern "C" fn(session: *mut c_void, text: *const c_char, out: *mut Int32Array) -> i32;
pub type DecodeAudioFn = unsafe extern "C" fn(
    session: *mut c_void,
    tokens: *const i32,
    len: usize,
    out: *mut FloatArray,
) -> i32;

// ---------- VTables ----------

#[repr(C)]
pub struct MemoryApi {
    pub free_string: FreeStringFn,
    pub free_ints: FreeIntsFn,
    pub free_floats: FreeFloatsFn,
    pub last_error: LastErrorFn,
}

#[repr(C)]
pub struct LogApi {
    pub set_log_callback: SetLogCallbackFn,
    pub toggle_native_log: ToggleNativeLogFn,
}

#[repr(C)]
pub struct SessionApi {
    pub create_session: CreateSessionFn,
    pub destroy_session: DestroySessionFn,

    pub formatted_chat: FormattedChatFn,
    pub completion: CompletionFn,

    pub load_session: LoadSessionFn,
    pub save_session: SaveSessionFn,

    pub tokenize: TokenizeFn,
    pub detokenize: DetokenizeFn,

    pub embedding: EmbeddingFn,
    pub rerank: RerankFn,
    pub bench: BenchFn,

    pub apply_lora: ApplyLoraFn,
    pub remove_lora: SessionUnitFn,
    pub loaded_lora: SessionJsonFn,

    pub init_multimodal: InitMultimodalFn,
    pub multimodal_support: SessionJsonFn,
    pub release_multimodal: SessionUnitFn,

    pub init_vocoder: InitVocoderFn,
    pub formatted_audio_completion: FormattedAudioFn,
    pub audio_guide_tokens: GuideTokensFn,
    pub decode_audio_tokens: DecodeAudioFn,
    pub release_vocoder: SessionUnitFn,
}

#[repr(C)]
pub struct DelegateApi {
    pub info: DelegateInfo,
    pub memory: MemoryApi,
    pub log: LogApi,
    pub session: SessionApi,
}

// The vtable is immutable once published and its `info` strings are static.
unsafe impl Sync for DelegateApi {}
unsafe impl Send for DelegateApi {}

/// Delegate must export `capllama_delegate_entry_v1` returning a pointer to a static `DelegateApi`.
pub type DelegateEntryFn = unsafe extern "C" fn() -> *const DelegateApi;
