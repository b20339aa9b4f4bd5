//! Events pushed to shells: native log lines and streamed completion tokens.

use capllama_abi::{NativeLog, TokenData};
use serde::Serialize;
use tokio::sync::broadcast;

pub const EVENT_ON_TOKEN: &str = "@LlamaCpp_onToken";
pub const EVENT_ON_NATIVE_LOG: &str = "@LlamaCpp_onNativeLog";

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum PluginEvent {
    NativeLog(NativeLog),
    Token { context_id: i64, token: TokenData },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenPayload<'a> {
    context_id: i64,
    token_result: &'a TokenData,
}

impl PluginEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NativeLog(_) => EVENT_ON_NATIVE_LOG,
            Self::Token { .. } => EVENT_ON_TOKEN,
        }
    }

    /// Event body as shells receive it.
    pub fn payload(&self) -> serde_json::Value {
        let v = match self {
            Self::NativeLog(log) => serde_json::to_value(log),
            Self::Token { context_id, token } => serde_json::to_value(TokenPayload {
                context_id: *context_id,
                token_result: token,
            }),
        };
        v.unwrap_or(serde_json::Value::Null)
    }
}

/// Fan-out of plugin events. Sending without subscribers is a no-op.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PluginEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: PluginEvent) {
        let _ = self.tx.send(event);
    }
}
