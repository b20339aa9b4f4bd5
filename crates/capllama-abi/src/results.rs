//! Result shapes (delegate -> host -> shell).

use serde::{Deserialize, Serialize};

use crate::params::GrammarTrigger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormattedChatKind {
    #[serde(rename = "jinja")]
    Jinja,
    #[serde(rename = "llama-chat")]
    LlamaChat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormattedChat {
    #[serde(rename = "type")]
    pub kind: FormattedChatKind,
    pub prompt: String,
    #[serde(default)]
    pub has_media: bool,
    #[serde(default)]
    pub media_paths: Vec<String>,

    // jinja-only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_format: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grammar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grammar_lazy: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grammar_triggers: Option<Vec<GrammarTrigger>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_forced_open: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserved_tokens: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_stops: Option<Vec<String>>,
}

impl FormattedChat {
    pub fn llama_chat(prompt: impl Into<String>) -> Self {
        Self {
            kind: FormattedChatKind::LlamaChat,
            prompt: prompt.into(),
            has_media: false,
            media_paths: Vec::new(),
            chat_format: None,
            grammar: None,
            grammar_lazy: None,
            grammar_triggers: None,
            thinking_forced_open: None,
            preserved_tokens: None,
            additional_stops: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// JSON text.
    pub arguments: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(rename = "type")]
    pub kind: String, // "function"
    pub function: ToolCallFunction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenProbItem {
    pub tok_str: String,
    pub prob: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenProb {
    pub content: String,
    pub probs: Vec<TokenProbItem>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionTimings {
    pub prompt_n: i32,
    pub prompt_ms: f64,
    pub prompt_per_token_ms: f64,
    pub prompt_per_second: f64,
    pub predicted_n: i32,
    pub predicted_ms: f64,
    pub predicted_per_token_ms: f64,
    pub predicted_per_second: f64,
}

impl CompletionTimings {
    /// Derives the per-token and per-second rates from counts and wall time.
    pub fn from_counts(prompt_n: i32, prompt_ms: f64, predicted_n: i32, predicted_ms: f64) -> Self {
        let per_token = |ms: f64, n: i32| if n > 0 { ms / n as f64 } else { 0.0 };
        let per_second = |ms: f64, n: i32| if ms > 0.0 { n as f64 * 1000.0 / ms } else { 0.0 };
        Self {
            prompt_n,
            prompt_ms,
            prompt_per_token_ms: per_token(prompt_ms, prompt_n),
            prompt_per_second: per_second(prompt_ms, prompt_n),
            predicted_n,
            predicted_ms,
            predicted_per_token_ms: per_token(predicted_ms, predicted_n),
            predicted_per_second: per_second(predicted_ms, predicted_n),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionResult {
    /// Raw text, including reasoning and tool-call markup.
    pub text: String,
    #[serde(default)]
    pub reasoning_content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Text with reasoning and tool calls filtered out.
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub chat_format: i32,

    pub tokens_predicted: i32,
    pub tokens_evaluated: i32,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub stopped_eos: bool,
    #[serde(default)]
    pub stopped_word: String,
    #[serde(default)]
    pub stopped_limit: i32,
    #[serde(default)]
    pub stopping_word: String,
    #[serde(default)]
    pub context_full: bool,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub tokens_cached: i32,
    #[serde(default)]
    pub timings: CompletionTimings,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_probabilities: Option<Vec<TokenProb>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_tokens: Option<Vec<i32>>,
}

/// One streamed piece of a completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenData {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_probabilities: Option<Vec<TokenProb>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accumulated_text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionLoadResult {
    pub tokens_loaded: i32,
    pub prompt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenizeResult {
    pub tokens: Vec<i32>,
    pub has_images: bool,
    /// Always within 2^53 - 1 so shells can read them as plain numbers.
    #[serde(default)]
    pub bitmap_hashes: Vec<u64>,
    #[serde(default)]
    pub chunk_pos: Vec<i32>,
    #[serde(default)]
    pub chunk_pos_images: Vec<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResult {
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RerankResult {
    pub score: f32,
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultimodalSupport {
    pub vision: bool,
    pub audio: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioCompletion {
    pub prompt: String,
    #[serde(default)]
    pub grammar: Option<String>,
}

/// Native log line delivered to listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeLog {
    pub level: String,
    pub text: String,
}
