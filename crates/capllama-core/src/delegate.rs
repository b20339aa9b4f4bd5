//! Seams between the dispatcher and whatever performs inference.

use capllama_abi::{
    AudioCompletion, CompletionParams, CompletionResult, ContextParams, EmbeddingParams,
    EmbeddingResult, FormatChatParams, FormattedChat, LoraAdapter, MultimodalParams,
    MultimodalSupport, RerankParams, RerankResult, SessionInfo, SessionLoadResult, TokenData,
    TokenizeResult, VocoderParams,
};
use serde_json::Value;

use crate::errors::{PluginError, Result};

/// Receives each streamed token; returning `false` asks the session to stop.
pub type TokenSink<'a> = &'a mut dyn FnMut(TokenData) -> bool;

fn unsupported<T>(op: &str) -> Result<T> {
    Err(PluginError::NotImplemented(op.to_string()))
}

/// Process-wide entry point of an inference library.
pub trait Delegate: Send + Sync {
    fn name(&self) -> &str;

    fn toggle_native_log(&self, enabled: bool) -> Result<()>;

    /// Loads the model named by `params.model` and opens a session on it.
    fn create_session(&self, params: &ContextParams) -> Result<(Box<dyn Session>, SessionInfo)>;
}

/// State of one loaded context. Dropping it releases the native resources.
///
/// Calls on one session are never concurrent; the registry serializes them.
pub trait Session: Send {
    fn formatted_chat(
        &mut self,
        _messages_json: &str,
        _chat_template: Option<&str>,
        _params: &FormatChatParams,
    ) -> Result<FormattedChat> {
        unsupported("getFormattedChat")
    }

    fn completion(&mut self, _params: &CompletionParams, _on_token: TokenSink<'_>) -> Result<CompletionResult> {
        unsupported("completion")
    }

    fn load_session(&mut self, _path: &str) -> Result<SessionLoadResult> {
        unsupported("loadSession")
    }

    /// Returns the number of tokens written.
    fn save_session(&mut self, _path: &str, _size: i32) -> Result<i32> {
        unsupported("saveSession")
    }

    fn tokenize(&mut self, _text: &str, _media_paths: &[String]) -> Result<TokenizeResult> {
        unsupported("tokenize")
    }

    fn detokenize(&mut self, _tokens: &[i32]) -> Result<String> {
        unsupported("detokenize")
    }

    fn embedding(&mut self, _text: &str, _params: &EmbeddingParams) -> Result<EmbeddingResult> {
        unsupported("embedding")
    }

    fn rerank(&mut self, _query: &str, _documents: &[String], _params: &RerankParams) -> Result<Vec<RerankResult>> {
        unsupported("rerank")
    }

    fn bench(&mut self, _pp: i32, _tg: i32, _pl: i32, _nr: i32) -> Result<String> {
        unsupported("bench")
    }

    fn apply_lora(&mut self, _adapters: &[LoraAdapter]) -> Result<()> {
        unsupported("applyLoraAdapters")
    }

    fn remove_lora(&mut self) -> Result<()> {
        unsupported("removeLoraAdapters")
    }

    fn loaded_lora(&mut self) -> Result<Vec<LoraAdapter>> {
        unsupported("getLoadedLoraAdapters")
    }

    fn init_multimodal(&mut self, _params: &MultimodalParams) -> Result<bool> {
        unsupported("initMultimodal")
    }

    fn multimodal_support(&mut self) -> Result<MultimodalSupport> {
        unsupported("getMultimodalSupport")
    }

    fn release_multimodal(&mut self) -> Result<()> {
        unsupported("releaseMultimodal")
    }

    fn init_vocoder(&mut self, _params: &VocoderParams) -> Result<bool> {
        unsupported("initVocoder")
    }

    fn formatted_audio_completion(&mut self, _speaker: Option<&Value>, _text: &str) -> Result<AudioCompletion> {
        unsupported("getFormattedAudioCompletion")
    }

    fn audio_guide_tokens(&mut self, _text: &str) -> Result<Vec<i32>> {
        unsupported("getAudioCompletionGuideTokens")
    }

    fn decode_audio_tokens(&mut self, _tokens: &[i32]) -> Result<Vec<f32>> {
        unsupported("decodeAudioTokens")
    }

    fn release_vocoder(&mut self) -> Result<()> {
        unsupported("releaseVocoder")
    }
}
