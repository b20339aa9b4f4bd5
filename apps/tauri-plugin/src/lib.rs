//! Tauri plugin `capllama`: one `call` command routed through the dispatcher,
//! plus dispatcher events re-emitted on the app handle.

use std::sync::Arc;

use anyhow::Context as _;
use capllama_core::{
    logging::init_logging, Dispatcher, ErrorPayload, PluginConfig, PluginError,
};
use serde_json::Value;
use tauri::{
    plugin::{Builder, TauriPlugin},
    AppHandle, Emitter, Manager, Runtime, State,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Plugin state. A delegate that failed to load is kept as its error so every
/// call rejects with the reason instead of the app failing to start.
pub struct Capllama {
    dispatcher: Result<Arc<Dispatcher>, PluginError>,
}

impl Capllama {
    pub fn dispatcher(&self) -> Result<&Arc<Dispatcher>, PluginError> {
        self.dispatcher.as_ref().map_err(Clone::clone)
    }
}

#[tauri::command]
async fn call(
    method: String,
    args: Option<Value>,
    state: State<'_, Capllama>,
) -> Result<Value, ErrorPayload> {
    let dispatcher = Arc::clone(state.dispatcher().map_err(|e| e.to_payload())?);
    dispatcher
        .dispatch(&method, args.unwrap_or(Value::Null))
        .await
        .map_err(|e| {
            warn!(%method, code = e.code(), "call rejected: {e}");
            e.to_payload()
        })
}

fn load_config() -> anyhow::Result<PluginConfig> {
    let config = PluginConfig::load().context("load capllama config")?;
    if let Err(e) = init_logging(&config.logging) {
        // The host app may already own the global subscriber.
        eprintln!("capllama: {e}");
    }
    Ok(config)
}

fn forward_events<R: Runtime>(app: AppHandle<R>, dispatcher: &Dispatcher) {
    let mut rx = dispatcher.events().subscribe();
    tauri::async_runtime::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(e) = app.emit(event.name(), event.payload()) {
                        warn!(event = event.name(), "emit failed: {e}");
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event listener lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

pub fn init<R: Runtime>() -> TauriPlugin<R> {
    Builder::new("capllama")
        .invoke_handler(tauri::generate_handler![call])
        .setup(|app, _api| {
            let config = load_config()?;
            let dispatcher = Dispatcher::from_config(config).map(Arc::new);
            match &dispatcher {
                Ok(d) => {
                    forward_events(app.clone(), d);
                    info!("capllama plugin ready");
                }
                Err(e) => warn!("capllama delegate unavailable: {e}"),
            }
            app.manage(Capllama { dispatcher });
            Ok(())
        })
        .on_drop(|app| {
            let Some(state) = app.try_state::<Capllama>() else { return };
            if let Ok(d) = state.dispatcher() {
                let d = Arc::clone(d);
                tauri::async_runtime::block_on(async move {
                    if let Err(e) = d.release_all_contexts().await {
                        warn!("release on shutdown failed: {e}");
                    }
                });
            }
        })
        .build()
}
