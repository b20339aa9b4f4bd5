//! Request parameter shapes (shell -> host -> delegate).
//!
//! Optional fields stay `Option` so the delegate can apply its own defaults;
//! unknown keys are preserved in `extra` where shells are known to send more.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoraAdapter {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaled: Option<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextParams {
    pub model: String,
    /// Overrides the model's own chat template.
    #[serde(default)]
    pub chat_template: Option<String>,
    #[serde(default)]
    pub is_model_asset: Option<bool>,
    #[serde(default)]
    pub use_progress_callback: Option<bool>,

    #[serde(default)]
    pub n_ctx: Option<i32>,
    #[serde(default)]
    pub n_batch: Option<i32>,
    #[serde(default)]
    pub n_ubatch: Option<i32>,
    #[serde(default)]
    pub n_threads: Option<i32>,
    #[serde(default)]
    pub n_gpu_layers: Option<i32>,
    #[serde(default)]
    pub no_gpu_devices: Option<bool>,
    #[serde(default)]
    pub flash_attn: Option<bool>,
    #[serde(default)]
    pub cache_type_k: Option<String>,
    #[serde(default)]
    pub cache_type_v: Option<String>,
    #[serde(default)]
    pub use_mlock: Option<bool>,
    #[serde(default)]
    pub use_mmap: Option<bool>,
    #[serde(default)]
    pub vocab_only: Option<bool>,

    /// Single adapter shorthand; merged with `lora_list` by `lora_adapters()`.
    #[serde(default)]
    pub lora: Option<String>,
    #[serde(default)]
    pub lora_scaled: Option<f32>,
    #[serde(default)]
    pub lora_list: Option<Vec<LoraAdapter>>,

    #[serde(default)]
    pub rope_freq_base: Option<f32>,
    #[serde(default)]
    pub rope_freq_scale: Option<f32>,
    #[serde(default)]
    pub pooling_type: Option<Value>,
    #[serde(default)]
    pub ctx_shift: Option<bool>,
    #[serde(default)]
    pub kv_unified: Option<bool>,
    #[serde(default)]
    pub swa_full: Option<bool>,
    #[serde(default)]
    pub n_cpu_moe: Option<i32>,

    #[serde(default)]
    pub embedding: Option<bool>,
    #[serde(default)]
    pub embd_normalize: Option<i32>,
}

impl ContextParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    /// `lora` + `lora_scaled` first, then `lora_list`.
    pub fn lora_adapters(&self) -> Vec<LoraAdapter> {
        let mut out = Vec::new();
        if let Some(path) = self.lora.as_deref().filter(|p| !p.is_empty()) {
            out.push(LoraAdapter {
                path: path.to_string(),
                scaled: self.lora_scaled,
            });
        }
        if let Some(list) = &self.lora_list {
            out.extend(list.iter().cloned());
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrammarTrigger {
    #[serde(rename = "type")]
    pub kind: i32,
    pub value: String,
    #[serde(default)]
    pub token: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionParams {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub n_threads: Option<i32>,
    #[serde(default)]
    pub n_predict: Option<i32>,
    #[serde(default)]
    pub n_probs: Option<i32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_k: Option<i32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub min_p: Option<f32>,
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default)]
    pub ignore_eos: Option<bool>,

    #[serde(default)]
    pub grammar: Option<String>,
    #[serde(default)]
    pub grammar_lazy: Option<bool>,
    #[serde(default)]
    pub grammar_triggers: Vec<GrammarTrigger>,
    #[serde(default)]
    pub json_schema: Option<String>,
    #[serde(default)]
    pub jinja: Option<bool>,
    #[serde(default)]
    pub enable_thinking: Option<bool>,
    #[serde(default)]
    pub chat_format: Option<i32>,
    #[serde(default)]
    pub reasoning_format: Option<String>,

    /// Requires multimodal to be enabled on the context.
    #[serde(default)]
    pub media_paths: Vec<String>,
    /// TTS guide tokens.
    #[serde(default)]
    pub guide_tokens: Vec<i32>,

    #[serde(default)]
    pub emit_partial_completion: bool,

    /// Remaining sampler knobs (penalties, mirostat, dry, xtc, logit_bias, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Options of `getFormattedChat`; string-typed fields carry JSON text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormatChatParams {
    #[serde(default)]
    pub jinja: Option<bool>,
    #[serde(default)]
    pub json_schema: Option<String>,
    #[serde(default)]
    pub tools: Option<String>,
    #[serde(default)]
    pub parallel_tool_calls: Option<String>,
    #[serde(default)]
    pub tool_choice: Option<String>,
    #[serde(default)]
    pub enable_thinking: Option<bool>,
    #[serde(default)]
    pub add_generation_prompt: Option<bool>,
    #[serde(default)]
    pub now: Option<String>,
    #[serde(default)]
    pub chat_template_kwargs: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingParams {
    #[serde(default)]
    pub embd_normalize: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RerankParams {
    #[serde(default)]
    pub normalize: Option<i32>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultimodalParams {
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_true")]
    pub use_gpu: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VocoderParams {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub n_batch: Option<i32>,
}
