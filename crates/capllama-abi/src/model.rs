//! Model descriptor shapes reported when a context is created.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Capabilities advertised by a jinja (minja) chat template.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinjaCaps {
    pub tools: bool,
    pub tool_calls: bool,
    pub tool_responses: bool,
    pub system_role: bool,
    pub parallel_tool_calls: bool,
    pub tool_call_id: bool,
}

impl MinjaCaps {
    pub const fn all() -> Self {
        Self {
            tools: true,
            tool_calls: true,
            tool_responses: true,
            system_role: true,
            parallel_tool_calls: true,
            tool_call_id: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MinjaTemplates {
    pub default: bool,
    pub default_caps: MinjaCaps,
    pub tool_use: bool,
    pub tool_use_caps: MinjaCaps,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTemplates {
    /// Template understood by the built-in llama-chat formatter.
    pub llama_chat: bool,
    pub minja: MinjaTemplates,
}

/// Immutable description of the model backing a context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    pub path: String,
    pub desc: String,
    pub size: u64,
    pub n_embd: u32,
    pub n_params: u64,
    pub chat_templates: ChatTemplates,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Deprecated, kept for older shells.
    pub is_chat_template_supported: bool,
}

/// What a delegate reports after `create_session`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionInfo {
    pub gpu: bool,
    #[serde(rename = "reasonNoGPU", default)]
    pub reason_no_gpu: String,
    pub model: ModelDescriptor,
    #[serde(rename = "androidLib", default, skip_serializing_if = "Option::is_none")]
    pub android_lib: Option<String>,
}

/// Result bag of `initContext`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextInfo {
    #[serde(rename = "contextId")]
    pub context_id: i64,
    pub gpu: bool,
    #[serde(rename = "reasonNoGPU")]
    pub reason_no_gpu: String,
    pub model: ModelDescriptor,
    #[serde(rename = "androidLib", default, skip_serializing_if = "Option::is_none")]
    pub android_lib: Option<String>,
}

impl ContextInfo {
    pub fn from_session(context_id: i64, info: SessionInfo) -> Self {
        Self {
            context_id,
            gpu: info.gpu,
            reason_no_gpu: info.reason_no_gpu,
            model: info.model,
            android_lib: info.android_lib,
        }
    }
}
