//! Request dispatcher: named operation + JSON argument bag -> delegate call -> JSON result.

use std::sync::{atomic::Ordering, Arc};

use capllama_abi::{
    AudioCompletion, CompletionParams, CompletionResult, ContextInfo, ContextParams,
    EmbeddingParams, EmbeddingResult, FormatChatParams, FormattedChat, LoraAdapter,
    MultimodalParams, MultimodalSupport, RerankParams, RerankResult, SessionLoadResult,
    TokenData, TokenizeResult, VocoderParams,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::config::PluginConfig;
use crate::delegate::{Delegate, Session};
use crate::errors::{PluginError, Result};
use crate::events::{EventBus, PluginEvent};
use crate::gguf::{self, ModelInfo};
use crate::models::{self, AvailableModel};
use crate::native::NativeDelegate;
use crate::registry::{Context, ContextId, ContextRegistry, DEFAULT_CONTEXT_LIMIT};

pub struct Dispatcher {
    delegate: Arc<dyn Delegate>,
    registry: ContextRegistry,
    events: EventBus,
    config: PluginConfig,
}

impl Dispatcher {
    pub fn new(delegate: Arc<dyn Delegate>, config: PluginConfig, events: EventBus) -> Result<Self> {
        let registry = ContextRegistry::new(config.context_limit);
        if config.native_log {
            delegate.toggle_native_log(true)?;
        }
        info!(delegate = delegate.name(), limit = config.context_limit, "dispatcher ready");
        Ok(Self {
            delegate,
            registry,
            events,
            config,
        })
    }

    /// Loads the native delegate library named by `config`.
    pub fn from_config(config: PluginConfig) -> Result<Self> {
        let events = EventBus::new();
        let delegate = NativeDelegate::load(&config, events.clone())?;
        Self::new(Arc::new(delegate), config, events)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn registry(&self) -> &ContextRegistry {
        &self.registry
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    fn context(&self, id: i64) -> Result<Arc<Context>> {
        self.registry.get(ContextId::new(id)?)
    }

    /// Waits for the session lock; fails if the context was released meanwhile.
    async fn lock_live(&self, ctx: &Context) -> Result<OwnedMutexGuard<Box<dyn Session>>> {
        let guard = ctx.lock_session().await;
        if ctx.is_released() {
            debug!(context = %ctx.id(), "context released while queued");
            return Err(PluginError::ContextNotFound);
        }
        Ok(guard)
    }

    /// Runs `f` on a blocking worker while holding the context's session lock.
    async fn with_session<T, F>(&self, ctx: &Context, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn Session) -> Result<T> + Send + 'static,
    {
        let mut guard = self.lock_live(ctx).await?;
        debug!(context = %ctx.id(), op, "dispatch");
        tokio::task::spawn_blocking(move || f(&mut **guard)).await?
    }

    // ---------- lifecycle ----------

    pub async fn toggle_native_log(&self, enabled: bool) -> Result<()> {
        self.delegate.toggle_native_log(enabled)?;
        info!(enabled, "native log toggled");
        Ok(())
    }

    pub async fn set_context_limit(&self, limit: i64) -> Result<()> {
        let limit = usize::try_from(limit)
            .map_err(|_| PluginError::invalid(format!("limit must not be negative, got {limit}")))?;
        self.registry.set_limit(limit);
        info!(limit, live = self.registry.len(), "context limit set");
        Ok(())
    }

    pub async fn model_info(&self, path: String, skip: Vec<String>) -> Result<ModelInfo> {
        let dirs = self.config.search_dirs();
        let min = self.config.min_model_bytes;
        tokio::task::spawn_blocking(move || gguf::model_info(&path, &skip, &dirs, min)).await?
    }

    pub async fn get_available_models(&self) -> Result<Vec<AvailableModel>> {
        let Some(root) = self.config.models_dir.clone() else {
            return Ok(Vec::new());
        };
        tokio::task::spawn_blocking(move || models::list_available_models(&root)).await?
    }

    pub async fn init_context(&self, id: i64, mut params: ContextParams) -> Result<ContextInfo> {
        let id = ContextId::new(id)?;
        if params.model.trim().is_empty() {
            return Err(PluginError::invalid("params.model is required"));
        }
        self.registry.ensure_can_create(id)?;

        if self.config.strict_model_paths {
            let dirs = self.config.search_dirs();
            let resolved = gguf::resolve_model_path(&params.model, &dirs, self.config.min_model_bytes)?;
            params.model = resolved.to_string_lossy().into_owned();
        }

        let delegate = Arc::clone(&self.delegate);
        let (session, session_info) =
            tokio::task::spawn_blocking(move || delegate.create_session(&params)).await??;
        self.registry.create(id, session_info.model.clone(), session)?;
        info!(context = %id, model = %session_info.model.path, gpu = session_info.gpu, "context created");
        Ok(ContextInfo::from_session(id.get(), session_info))
    }

    pub async fn release_context(&self, id: i64) -> Result<()> {
        let ctx = self.registry.remove(ContextId::new(id)?)?;
        info!(context = id, "context released");
        // Native teardown can block; the last holder may be an in-flight op.
        tokio::task::spawn_blocking(move || drop(ctx)).await?;
        Ok(())
    }

    pub async fn release_all_contexts(&self) -> Result<()> {
        let drained = self.registry.remove_all();
        if drained.is_empty() {
            return Ok(());
        }
        info!(count = drained.len(), "all contexts released");
        tokio::task::spawn_blocking(move || drop(drained)).await?;
        Ok(())
    }

    // ---------- chat / completion ----------

    pub async fn get_formatted_chat(
        &self,
        id: i64,
        messages: String,
        chat_template: Option<String>,
        params: FormatChatParams,
    ) -> Result<FormattedChat> {
        let ctx = self.context(id)?;
        self.with_session(&ctx, "getFormattedChat", move |s| {
            s.formatted_chat(&messages, chat_template.as_deref().filter(|t| !t.is_empty()), &params)
        })
        .await
    }

    /// Streams `@LlamaCpp_onToken` events when `params.emit_partial_completion` is set.
    pub async fn completion(&self, id: i64, params: CompletionParams) -> Result<CompletionResult> {
        let ctx = self.context(id)?;
        if !params.media_paths.is_empty() && !ctx.is_multimodal_enabled() {
            return Err(PluginError::failed("Multimodal is not enabled"));
        }

        let mut guard = self.lock_live(&ctx).await?;
        ctx.clear_stop();
        let stop = ctx.stop_flag();
        let events = self.events.clone();
        let context_id = ctx.id().get();
        let emit = params.emit_partial_completion;
        debug!(context = context_id, emit, "completion");

        let result = tokio::task::spawn_blocking(move || {
            let mut on_token = |token: TokenData| {
                if stop.load(Ordering::SeqCst) {
                    return false;
                }
                if emit {
                    events.emit(PluginEvent::Token { context_id, token });
                }
                true
            };
            guard.completion(&params, &mut on_token)
        })
        .await??;

        if result.interrupted {
            info!(context = context_id, predicted = result.tokens_predicted, "completion interrupted");
        }
        Ok(result)
    }

    /// Flags the running completion; does not wait for the session lock.
    pub async fn stop_completion(&self, id: i64) -> Result<()> {
        let ctx = self.context(id)?;
        ctx.request_stop();
        debug!(context = id, "stop requested");
        Ok(())
    }

    // ---------- session files ----------

    pub async fn load_session(&self, id: i64, filepath: String) -> Result<SessionLoadResult> {
        let ctx = self.context(id)?;
        if filepath.is_empty() {
            return Err(PluginError::invalid("filepath is required"));
        }
        self.with_session(&ctx, "loadSession", move |s| s.load_session(&filepath)).await
    }

    /// `size <= 0` saves every token. Returns the number of tokens saved.
    pub async fn save_session(&self, id: i64, filepath: String, size: i32) -> Result<i32> {
        let ctx = self.context(id)?;
        if filepath.is_empty() {
            return Err(PluginError::invalid("filepath is required"));
        }
        self.with_session(&ctx, "saveSession", move |s| s.save_session(&filepath, size)).await
    }

    // ---------- tokens ----------

    pub async fn tokenize(&self, id: i64, text: String, image_paths: Vec<String>) -> Result<TokenizeResult> {
        let ctx = self.context(id)?;
        if !image_paths.is_empty() && !ctx.is_multimodal_enabled() {
            return Err(PluginError::failed("Multimodal is not enabled"));
        }
        self.with_session(&ctx, "tokenize", move |s| s.tokenize(&text, &image_paths)).await
    }

    pub async fn detokenize(&self, id: i64, tokens: Vec<i32>) -> Result<String> {
        let ctx = self.context(id)?;
        self.with_session(&ctx, "detokenize", move |s| s.detokenize(&tokens)).await
    }

    // ---------- embedding / rerank / bench ----------

    pub async fn embedding(&self, id: i64, text: String, params: EmbeddingParams) -> Result<EmbeddingResult> {
        let ctx = self.context(id)?;
        self.with_session(&ctx, "embedding", move |s| s.embedding(&text, &params)).await
    }

    /// Sorted by descending score; each entry carries its document text.
    pub async fn rerank(
        &self,
        id: i64,
        query: String,
        documents: Vec<String>,
        params: RerankParams,
    ) -> Result<Vec<RerankResult>> {
        let ctx = self.context(id)?;
        self.with_session(&ctx, "rerank", move |s| {
            let mut ranked = s.rerank(&query, &documents, &params)?;
            for r in ranked.iter_mut() {
                if r.document.is_none() {
                    r.document = documents.get(r.index).cloned();
                }
            }
            ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
            Ok(ranked)
        })
        .await
    }

    pub async fn bench(&self, id: i64, pp: i32, tg: i32, pl: i32, nr: i32) -> Result<String> {
        let ctx = self.context(id)?;
        self.with_session(&ctx, "bench", move |s| s.bench(pp, tg, pl, nr)).await
    }

    // ---------- LoRA ----------

    pub async fn apply_lora_adapters(&self, id: i64, adapters: Vec<LoraAdapter>) -> Result<()> {
        let ctx = self.context(id)?;
        if adapters.iter().any(|a| a.path.is_empty()) {
            return Err(PluginError::invalid("every LoRA adapter needs a path"));
        }
        self.with_session(&ctx, "applyLoraAdapters", move |s| s.apply_lora(&adapters)).await
    }

    pub async fn remove_lora_adapters(&self, id: i64) -> Result<()> {
        let ctx = self.context(id)?;
        self.with_session(&ctx, "removeLoraAdapters", |s| s.remove_lora()).await
    }

    pub async fn get_loaded_lora_adapters(&self, id: i64) -> Result<Vec<LoraAdapter>> {
        let ctx = self.context(id)?;
        self.with_session(&ctx, "getLoadedLoraAdapters", |s| s.loaded_lora()).await
    }

    // ---------- multimodal ----------

    pub async fn init_multimodal(&self, id: i64, params: MultimodalParams) -> Result<bool> {
        let ctx = self.context(id)?;
        if params.path.is_empty() {
            return Err(PluginError::invalid("params.path is required"));
        }
        let ok = self.with_session(&ctx, "initMultimodal", move |s| s.init_multimodal(&params)).await?;
        ctx.set_multimodal_enabled(ok);
        Ok(ok)
    }

    pub async fn is_multimodal_enabled(&self, id: i64) -> Result<bool> {
        Ok(self.context(id)?.is_multimodal_enabled())
    }

    pub async fn get_multimodal_support(&self, id: i64) -> Result<MultimodalSupport> {
        let ctx = self.context(id)?;
        self.with_session(&ctx, "getMultimodalSupport", |s| s.multimodal_support()).await
    }

    pub async fn release_multimodal(&self, id: i64) -> Result<()> {
        let ctx = self.context(id)?;
        self.with_session(&ctx, "releaseMultimodal", |s| s.release_multimodal()).await?;
        ctx.set_multimodal_enabled(false);
        Ok(())
    }

    // ---------- TTS ----------

    pub async fn init_vocoder(&self, id: i64, params: VocoderParams) -> Result<bool> {
        let ctx = self.context(id)?;
        if params.path.is_empty() {
            return Err(PluginError::invalid("params.path is required"));
        }
        let ok = self.with_session(&ctx, "initVocoder", move |s| s.init_vocoder(&params)).await?;
        ctx.set_vocoder_enabled(ok);
        Ok(ok)
    }

    pub async fn is_vocoder_enabled(&self, id: i64) -> Result<bool> {
        Ok(self.context(id)?.is_vocoder_enabled())
    }

    fn vocoder_context(&self, id: i64) -> Result<Arc<Context>> {
        let ctx = self.context(id)?;
        if !ctx.is_vocoder_enabled() {
            return Err(PluginError::failed("Vocoder is not enabled"));
        }
        Ok(ctx)
    }

    /// `speaker_json` is JSON text; empty means no speaker profile.
    pub async fn get_formatted_audio_completion(
        &self,
        id: i64,
        speaker_json: Option<String>,
        text: String,
    ) -> Result<AudioCompletion> {
        let ctx = self.vocoder_context(id)?;
        let speaker = match speaker_json.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(js) => Some(
                serde_json::from_str::<Value>(js)
                    .map_err(|e| PluginError::invalid(format!("speakerJsonStr is not JSON: {e}")))?,
            ),
        };
        self.with_session(&ctx, "getFormattedAudioCompletion", move |s| {
            s.formatted_audio_completion(speaker.as_ref(), &text)
        })
        .await
    }

    pub async fn get_audio_completion_guide_tokens(&self, id: i64, text: String) -> Result<Vec<i32>> {
        let ctx = self.vocoder_context(id)?;
        self.with_session(&ctx, "getAudioCompletionGuideTokens", move |s| s.audio_guide_tokens(&text))
            .await
    }

    pub async fn decode_audio_tokens(&self, id: i64, tokens: Vec<i32>) -> Result<Vec<f32>> {
        let ctx = self.vocoder_context(id)?;
        self.with_session(&ctx, "decodeAudioTokens", move |s| s.decode_audio_tokens(&tokens)).await
    }

    pub async fn release_vocoder(&self, id: i64) -> Result<()> {
        let ctx = self.context(id)?;
        self.with_session(&ctx, "releaseVocoder", |s| s.release_vocoder()).await?;
        ctx.set_vocoder_enabled(false);
        Ok(())
    }

    // ---------- bridged entry ----------

    /// Routes a bridged call. Unknown methods fail with `NotImplemented`.
    pub async fn dispatch(&self, method: &str, args: Value) -> Result<Value> {
        let args = Args::new(method, &args)?;
        debug!(method, "bridged call");
        match method {
            "toggleNativeLog" => {
                let enabled = args.optional("enabled")?.unwrap_or(false);
                unit(self.toggle_native_log(enabled).await)
            }
            "setContextLimit" => {
                let limit = args.optional("limit")?.unwrap_or(DEFAULT_CONTEXT_LIMIT as i64);
                unit(self.set_context_limit(limit).await)
            }
            "modelInfo" => {
                let path = args.optional("path")?.unwrap_or_default();
                let skip = args.optional("skip")?.unwrap_or_default();
                json(self.model_info(path, skip).await?)
            }
            "getAvailableModels" => json(self.get_available_models().await?),
            "initContext" => {
                let id = args.context_id()?;
                let params: ContextParams = args.required("params")?;
                json(self.init_context(id, params).await?)
            }
            "releaseContext" => unit(self.release_context(args.context_id()?).await),
            "releaseAllContexts" => unit(self.release_all_contexts().await),

            "getFormattedChat" => {
                let id = args.context_id()?;
                let messages = args.messages()?;
                let template = args.optional("chatTemplate")?;
                let params = args.optional("params")?.unwrap_or_default();
                json(self.get_formatted_chat(id, messages, template, params).await?)
            }
            "completion" => {
                let id = args.context_id()?;
                let params: CompletionParams = args.required("params")?;
                json(self.completion(id, params).await?)
            }
            "stopCompletion" => unit(self.stop_completion(args.context_id()?).await),

            "loadSession" => {
                let id = args.context_id()?;
                json(self.load_session(id, args.required("filepath")?).await?)
            }
            "saveSession" => {
                let id = args.context_id()?;
                let filepath = args.required("filepath")?;
                let size = args.optional("size")?.unwrap_or(-1);
                json(self.save_session(id, filepath, size).await?)
            }

            "tokenize" => {
                let id = args.context_id()?;
                let text = args.required("text")?;
                let image_paths = args.optional("imagePaths")?.unwrap_or_default();
                json(self.tokenize(id, text, image_paths).await?)
            }
            "detokenize" => {
                let id = args.context_id()?;
                json(self.detokenize(id, args.required("tokens")?).await?)
            }

            "embedding" => {
                let id = args.context_id()?;
                let text = args.required("text")?;
                let params = args.optional("params")?.unwrap_or_default();
                json(self.embedding(id, text, params).await?)
            }
            "rerank" => {
                let id = args.context_id()?;
                let query = args.required("query")?;
                let documents = args.required("documents")?;
                let params = args.optional("params")?.unwrap_or_default();
                json(self.rerank(id, query, documents, params).await?)
            }
            "bench" => {
                let id = args.context_id()?;
                let [pp, tg, pl, nr] = ["pp", "tg", "pl", "nr"].map(|k| args.optional::<i32>(k));
                json(self.bench(id, pp?.unwrap_or(0), tg?.unwrap_or(0), pl?.unwrap_or(0), nr?.unwrap_or(0)).await?)
            }

            "applyLoraAdapters" => {
                let id = args.context_id()?;
                unit(self.apply_lora_adapters(id, args.required("loraAdapters")?).await)
            }
            "removeLoraAdapters" => unit(self.remove_lora_adapters(args.context_id()?).await),
            "getLoadedLoraAdapters" => json(self.get_loaded_lora_adapters(args.context_id()?).await?),

            "initMultimodal" => {
                let id = args.context_id()?;
                json(self.init_multimodal(id, args.required("params")?).await?)
            }
            "isMultimodalEnabled" => json(self.is_multimodal_enabled(args.context_id()?).await?),
            "getMultimodalSupport" => json(self.get_multimodal_support(args.context_id()?).await?),
            "releaseMultimodal" => unit(self.release_multimodal(args.context_id()?).await),

            "initVocoder" => {
                let id = args.context_id()?;
                json(self.init_vocoder(id, args.required("params")?).await?)
            }
            "isVocoderEnabled" => json(self.is_vocoder_enabled(args.context_id()?).await?),
            "getFormattedAudioCompletion" => {
                let id = args.context_id()?;
                let speaker = args.optional("speakerJsonStr")?;
                let text = args.required("textToSpeak")?;
                json(self.get_formatted_audio_completion(id, speaker, text).await?)
            }
            "getAudioCompletionGuideTokens" => {
                let id = args.context_id()?;
                json(self.get_audio_completion_guide_tokens(id, args.required("textToSpeak")?).await?)
            }
            "decodeAudioTokens" => {
                let id = args.context_id()?;
                json(self.decode_audio_tokens(id, args.required("tokens")?).await?)
            }
            "releaseVocoder" => unit(self.release_vocoder(args.context_id()?).await),

            other => {
                warn!(method = other, "unknown bridged method");
                Err(PluginError::NotImplemented(other.to_string()))
            }
        }
    }
}

fn json<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| PluginError::failed(format!("serialize result: {e}")))
}

fn unit(r: Result<()>) -> Result<Value> {
    r.map(|()| Value::Null)
}

/// Argument bag of one bridged call.
struct Args<'a> {
    method: &'a str,
    map: Option<&'a Map<String, Value>>,
}

impl<'a> Args<'a> {
    fn new(method: &'a str, value: &'a Value) -> Result<Self> {
        let map = match value {
            Value::Null => None,
            Value::Object(m) => Some(m),
            _ => return Err(PluginError::invalid(format!("{method}: arguments must be an object"))),
        };
        Ok(Self { method, map })
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.map.and_then(|m| m.get(key)).filter(|v| !v.is_null())
    }

    fn optional<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.get(key)
            .map(|v| {
                serde_json::from_value(v.clone())
                    .map_err(|e| PluginError::invalid(format!("{}: bad `{key}`: {e}", self.method)))
            })
            .transpose()
    }

    fn required<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.optional(key)?
            .ok_or_else(|| PluginError::invalid(format!("{}: `{key}` is required", self.method)))
    }

    /// Integral numbers only; shells may send `1.0`.
    fn context_id(&self) -> Result<i64> {
        let v = self
            .get("contextId")
            .ok_or_else(|| PluginError::invalid(format!("{}: `contextId` is required", self.method)))?;
        v.as_i64()
            .or_else(|| v.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .ok_or_else(|| PluginError::invalid(format!("{}: `contextId` must be an integer", self.method)))
    }

    /// JSON text as sent by shells, or an inline array.
    fn messages(&self) -> Result<String> {
        match self.get("messages") {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(v @ Value::Array(_)) => Ok(v.to_string()),
            Some(_) => Err(PluginError::invalid(format!("{}: `messages` must be a JSON string or array", self.method))),
            None => Err(PluginError::invalid(format!("{}: `messages` is required", self.method))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capllama_abi::{ModelDescriptor, SessionInfo};
    use capllama_llama::capllama_delegate_entry_v1;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    use crate::delegate::TokenSink;
    use crate::events::EVENT_ON_TOKEN;
    use crate::gguf::tests::GgufBuilder;
    use crate::native::api_from_entry;

    fn config() -> PluginConfig {
        PluginConfig {
            runtime_dir: None,
            models_dir: None,
            ..PluginConfig::default()
        }
    }

    fn native(config: PluginConfig) -> Dispatcher {
        let api = unsafe { api_from_entry(capllama_delegate_entry_v1) }.unwrap();
        let events = EventBus::new();
        let delegate = NativeDelegate::new(api, events.clone()).unwrap();
        Dispatcher::new(Arc::new(delegate), config, events).unwrap()
    }

    async fn open(d: &Dispatcher, id: i64) -> Value {
        d.dispatch("initContext", json!({"contextId": id, "params": {"model": format!("/m/{id}.gguf")}}))
            .await
            .unwrap()
    }

    /// Streams tokens until the sink refuses one.
    struct Endless;

    impl Session for Endless {
        fn completion(&mut self, _params: &CompletionParams, on_token: TokenSink<'_>) -> Result<CompletionResult> {
            let mut out = CompletionResult::default();
            for _ in 0..1000 {
                let token = TokenData {
                    token: "x".into(),
                    ..TokenData::default()
                };
                if !on_token(token) {
                    out.interrupted = true;
                    break;
                }
                out.text.push('x');
                out.tokens_predicted += 1;
                std::thread::sleep(Duration::from_millis(2));
            }
            Ok(out)
        }
    }

    fn session_info(params: &ContextParams) -> SessionInfo {
        SessionInfo {
            model: ModelDescriptor {
                path: params.model.clone(),
                ..ModelDescriptor::default()
            },
            ..SessionInfo::default()
        }
    }

    /// Counts how many `detokenize` calls run at once across all sessions.
    #[derive(Default)]
    struct Overlap {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    struct Tracked(Arc<Overlap>);

    impl Session for Tracked {
        fn detokenize(&mut self, _tokens: &[i32]) -> Result<String> {
            let now = self.0.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(60));
            self.0.active.fetch_sub(1, Ordering::SeqCst);
            Ok(String::new())
        }
    }

    struct TrackedDelegate(Arc<Overlap>);

    impl Delegate for TrackedDelegate {
        fn name(&self) -> &str {
            "tracked"
        }

        fn toggle_native_log(&self, _enabled: bool) -> Result<()> {
            Ok(())
        }

        fn create_session(&self, params: &ContextParams) -> Result<(Box<dyn Session>, SessionInfo)> {
            Ok((Box::new(Tracked(Arc::clone(&self.0))), session_info(params)))
        }
    }

    struct EndlessDelegate;

    impl Delegate for EndlessDelegate {
        fn name(&self) -> &str {
            "endless"
        }

        fn toggle_native_log(&self, _enabled: bool) -> Result<()> {
            Ok(())
        }

        fn create_session(&self, params: &ContextParams) -> Result<(Box<dyn Session>, SessionInfo)> {
            Ok((Box::new(Endless), session_info(params)))
        }
    }

    #[tokio::test]
    async fn init_context_reports_model_and_respects_limit() {
        let d = native(config());
        d.dispatch("setContextLimit", json!({"limit": 1})).await.unwrap();

        let info = open(&d, 1).await;
        assert_eq!(info["contextId"], 1);
        assert_eq!(info["gpu"], false);
        assert_eq!(info["model"]["path"], "/m/1.gguf");

        let err = d
            .dispatch("initContext", json!({"contextId": 2, "params": {"model": "/m/2.gguf"}}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CAPACITY_EXCEEDED");

        d.dispatch("releaseContext", json!({"contextId": 1})).await.unwrap();
        open(&d, 2).await;
        assert_eq!(d.registry().ids(), vec![ContextId::new(2).unwrap()]);
    }

    #[tokio::test]
    async fn init_context_rejects_bad_requests() {
        let d = native(config());
        let err = d.dispatch("initContext", json!({"contextId": 1, "params": {"model": ""}})).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMETERS");
        let err = d.dispatch("initContext", json!({"params": {"model": "/m/a.gguf"}})).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMETERS");

        open(&d, 1).await;
        let err = d
            .dispatch("initContext", json!({"contextId": 1, "params": {"model": "/m/b.gguf"}}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMETERS");
        assert_eq!(d.registry().len(), 1);
    }

    #[tokio::test]
    async fn lowering_the_limit_never_evicts() {
        let d = native(config());
        for id in 1..=3 {
            open(&d, id).await;
        }
        d.set_context_limit(1).await.unwrap();
        assert_eq!(d.registry().len(), 3);
        assert!(d.init_context(4, ContextParams::new("/m/4.gguf")).await.is_err());
        assert_eq!(d.detokenize(3, vec![104, 105]).await.unwrap(), "hi");
        assert!(d.set_context_limit(-1).await.is_err());
    }

    #[tokio::test]
    async fn released_contexts_are_gone() {
        let d = native(config());
        open(&d, 7).await;
        d.release_context(7).await.unwrap();

        let err = d.dispatch("completion", json!({"contextId": 7, "params": {"prompt": "hi"}})).await.unwrap_err();
        assert_eq!(err, PluginError::ContextNotFound);
        assert_eq!(d.release_context(7).await.unwrap_err().code(), "CONTEXT_NOT_FOUND");

        open(&d, 8).await;
        d.dispatch("releaseAllContexts", Value::Null).await.unwrap();
        d.dispatch("releaseAllContexts", Value::Null).await.unwrap();
        assert!(d.registry().is_empty());
    }

    #[tokio::test]
    async fn completion_emits_token_events_when_asked() {
        let d = native(config());
        open(&d, 1).await;
        let mut rx = d.events().subscribe();

        let out = d
            .dispatch("completion", json!({"contextId": 1, "params": {"prompt": "hi"}}))
            .await
            .unwrap();
        assert_eq!(out["text"], "Sample completion text");
        assert!(rx.try_recv().is_err());

        let out = d
            .dispatch(
                "completion",
                json!({"contextId": 1, "params": {"prompt": "hi", "emit_partial_completion": true}}),
            )
            .await
            .unwrap();
        assert_eq!(out["interrupted"], false);

        let mut pieces = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            assert_eq!(ev.name(), EVENT_ON_TOKEN);
            let payload = ev.payload();
            assert_eq!(payload["contextId"], 1);
            pieces.push(payload["tokenResult"]["token"].as_str().unwrap().to_string());
        }
        assert_eq!(pieces.concat(), "Sample completion text");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_completion_interrupts_a_running_completion() {
        let d = Arc::new(Dispatcher::new(Arc::new(EndlessDelegate), config(), EventBus::new()).unwrap());
        d.init_context(1, ContextParams::new("/m/a.gguf")).await.unwrap();
        let mut rx = d.events().subscribe();

        let running = {
            let d = Arc::clone(&d);
            tokio::spawn(async move {
                let params = CompletionParams {
                    emit_partial_completion: true,
                    ..CompletionParams::default()
                };
                d.completion(1, params).await
            })
        };

        rx.recv().await.unwrap();
        d.dispatch("stopCompletion", json!({"contextId": 1})).await.unwrap();
        let out = running.await.unwrap().unwrap();
        assert!(out.interrupted);
        assert!(out.tokens_predicted < 1000);

        // The next completion starts with a clear flag.
        d.stop_completion(1).await.unwrap();
        let d2 = Arc::clone(&d);
        let next = tokio::spawn(async move { d2.completion(1, CompletionParams::default()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        d.stop_completion(1).await.unwrap();
        let out = next.await.unwrap().unwrap();
        assert!(out.tokens_predicted > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn release_stops_running_and_queued_work() {
        let d = Arc::new(Dispatcher::new(Arc::new(EndlessDelegate), config(), EventBus::new()).unwrap());
        d.init_context(1, ContextParams::new("/m/a.gguf")).await.unwrap();
        let mut rx = d.events().subscribe();

        let running = {
            let d = Arc::clone(&d);
            tokio::spawn(async move {
                let params = CompletionParams {
                    emit_partial_completion: true,
                    ..CompletionParams::default()
                };
                d.completion(1, params).await
            })
        };
        rx.recv().await.unwrap();

        let queued_completion = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.completion(1, CompletionParams::default()).await })
        };
        let queued_op = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.detokenize(1, vec![1]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        d.release_context(1).await.unwrap();

        let out = running.await.unwrap().unwrap();
        assert!(out.interrupted);
        assert_eq!(queued_completion.await.unwrap().unwrap_err(), PluginError::ContextNotFound);
        assert_eq!(queued_op.await.unwrap().unwrap_err(), PluginError::ContextNotFound);
        assert!(d.registry().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn same_context_calls_run_one_at_a_time() {
        let overlap = Arc::new(Overlap::default());
        let d = Dispatcher::new(Arc::new(TrackedDelegate(Arc::clone(&overlap))), config(), EventBus::new()).unwrap();
        d.init_context(1, ContextParams::new("/m/a.gguf")).await.unwrap();
        d.init_context(2, ContextParams::new("/m/b.gguf")).await.unwrap();

        let (a, b) = tokio::join!(d.detokenize(1, vec![1]), d.detokenize(1, vec![2]));
        a.unwrap();
        b.unwrap();
        assert_eq!(overlap.peak.load(Ordering::SeqCst), 1);

        overlap.peak.store(0, Ordering::SeqCst);
        let (a, b) = tokio::join!(d.detokenize(1, vec![1]), d.detokenize(2, vec![2]));
        a.unwrap();
        b.unwrap();
        assert_eq!(overlap.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn native_log_lines_follow_the_toggle() {
        let d = native(config());
        let mut rx = d.events().subscribe();

        d.dispatch("toggleNativeLog", json!({"enabled": true})).await.unwrap();
        d.dispatch("initContext", json!({"contextId": 1, "params": {"model": "/m/log-on.gguf"}}))
            .await
            .unwrap();
        d.dispatch("toggleNativeLog", json!({"enabled": false})).await.unwrap();
        d.dispatch("initContext", json!({"contextId": 2, "params": {"model": "/m/log-off.gguf"}}))
            .await
            .unwrap();

        let mut lines = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(PluginEvent::NativeLog(log)) => lines.push(log.text),
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        assert!(lines.iter().any(|t| t.contains("/m/log-on.gguf")));
        assert!(!lines.iter().any(|t| t.contains("/m/log-off.gguf")));
    }

    #[tokio::test]
    async fn multimodal_flag_follows_init_and_release() {
        let d = native(config());
        open(&d, 1).await;
        let args = json!({"contextId": 1});

        assert_eq!(d.dispatch("isMultimodalEnabled", args.clone()).await.unwrap(), false);
        let err = d.tokenize(1, "hi".into(), vec!["/img.png".into()]).await.unwrap_err();
        assert_eq!(err.code(), "OPERATION_FAILED");
        assert!(d.init_multimodal(1, MultimodalParams::default()).await.is_err());

        let ok = d
            .dispatch("initMultimodal", json!({"contextId": 1, "params": {"path": "/m/mmproj.gguf"}}))
            .await
            .unwrap();
        assert_eq!(ok, true);
        assert_eq!(d.dispatch("isMultimodalEnabled", args.clone()).await.unwrap(), true);
        let support = d.get_multimodal_support(1).await.unwrap();
        assert!(support.vision);

        d.dispatch("releaseMultimodal", args.clone()).await.unwrap();
        assert_eq!(d.dispatch("isMultimodalEnabled", args).await.unwrap(), false);
    }

    #[tokio::test]
    async fn vocoder_ops_require_init() {
        let d = native(config());
        open(&d, 1).await;

        let err = d.decode_audio_tokens(1, vec![1, 2]).await.unwrap_err();
        assert_eq!(err.to_string(), "Vocoder is not enabled");

        assert!(d.init_vocoder(1, VocoderParams { path: "/m/voc.gguf".into(), n_batch: None }).await.unwrap());
        assert!(d.is_vocoder_enabled(1).await.unwrap());

        let out = d
            .dispatch(
                "getFormattedAudioCompletion",
                json!({"contextId": 1, "speakerJsonStr": "", "textToSpeak": "hello world"}),
            )
            .await
            .unwrap();
        assert!(out["prompt"].as_str().unwrap().contains("hello"));

        let err = d
            .get_formatted_audio_completion(1, Some("{not json".into()), "hi".into())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMETERS");

        let guide = d.get_audio_completion_guide_tokens(1, "hello world".into()).await.unwrap();
        assert_eq!(guide.len(), 2);
        let samples = d.decode_audio_tokens(1, guide).await.unwrap();
        assert!(!samples.is_empty());

        d.release_vocoder(1).await.unwrap();
        assert!(!d.is_vocoder_enabled(1).await.unwrap());
    }

    #[tokio::test]
    async fn rerank_attaches_documents_in_score_order() {
        let d = native(config());
        open(&d, 1).await;
        let out = d
            .dispatch(
                "rerank",
                json!({"contextId": 1, "query": "rust checker", "documents": ["cats are pets", "rust borrow checker"]}),
            )
            .await
            .unwrap();
        assert_eq!(out[0]["index"], 1);
        assert_eq!(out[0]["document"], "rust borrow checker");
        assert_eq!(out[1]["document"], "cats are pets");
    }

    #[tokio::test]
    async fn session_files_and_lora_round_trip() {
        let d = native(config());
        open(&d, 1).await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("s.bin").to_string_lossy().into_owned();

        d.completion(1, CompletionParams { prompt: "hi".into(), ..CompletionParams::default() })
            .await
            .unwrap();
        let saved = d.dispatch("saveSession", json!({"contextId": 1, "filepath": &file})).await.unwrap();
        assert!(saved.as_i64().unwrap() > 0);
        let loaded = d.load_session(1, file.clone()).await.unwrap();
        assert_eq!(loaded.tokens_loaded as i64, saved.as_i64().unwrap());
        assert!(d.save_session(1, String::new(), -1).await.is_err());

        d.dispatch("applyLoraAdapters", json!({"contextId": 1, "loraAdapters": [{"path": "/l/a.gguf", "scaled": 0.5}]}))
            .await
            .unwrap();
        let loaded = d.get_loaded_lora_adapters(1).await.unwrap();
        assert_eq!(loaded[0].path, "/l/a.gguf");
        d.dispatch("removeLoraAdapters", json!({"contextId": 1})).await.unwrap();
        assert!(d.get_loaded_lora_adapters(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn model_info_and_available_models() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.gguf");
        GgufBuilder::new()
            .kv_str("general.architecture", "llama")
            .kv_u32("llama.embedding_length", 32)
            .tensor("tok_embd", &[32, 4])
            .write_to(&path, 2 * 1024 * 1024);

        let d = native(PluginConfig {
            models_dir: Some(dir.path().to_path_buf()),
            ..config()
        });
        let info = d
            .dispatch("modelInfo", json!({"path": path.to_string_lossy(), "skip": ["general.architecture"]}))
            .await
            .unwrap();
        assert_eq!(info["nEmbd"], 32);
        assert_eq!(info["nParams"], 128);
        assert!(info["metadata"].get("general.architecture").is_none());

        let models = d.dispatch("getAvailableModels", Value::Null).await.unwrap();
        assert_eq!(models[0]["name"], "tiny.gguf");

        let err = d.model_info("/nope/missing.gguf".into(), Vec::new()).await.unwrap_err();
        assert_eq!(err.code(), "MODEL_NOT_FOUND");
    }

    #[tokio::test]
    async fn unknown_methods_are_not_implemented() {
        let d = native(config());
        let err = d.dispatch("loadModelFromUrl", Value::Null).await.unwrap_err();
        assert_eq!(err.code(), "NOT_IMPLEMENTED");
    }

    #[test]
    fn args_read_context_ids_and_defaults() {
        let v = json!({"contextId": 3.0, "size": null});
        let a = Args::new("saveSession", &v).unwrap();
        assert_eq!(a.context_id().unwrap(), 3);
        assert_eq!(a.optional::<i32>("size").unwrap(), None);
        assert!(a.required::<String>("filepath").is_err());

        let v = json!({"contextId": 1.5});
        assert!(Args::new("x", &v).unwrap().context_id().is_err());
        assert!(Args::new("x", &json!([1])).is_err());
        assert!(Args::new("x", &Value::Null).unwrap().context_id().is_err());
    }

    #[test]
    fn messages_accept_string_or_array() {
        let v = json!({"messages": [{"role": "user", "content": "hi"}]});
        let a = Args::new("getFormattedChat", &v).unwrap();
        assert_eq!(a.messages().unwrap(), r#"[{"content":"hi","role":"user"}]"#);
        let v = json!({"messages": "[]"});
        assert_eq!(Args::new("getFormattedChat", &v).unwrap().messages().unwrap(), "[]");
    }
}
