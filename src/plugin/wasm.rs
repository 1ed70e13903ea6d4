//! Extism-backed WASM plugins.
//!
//! Guests export `search(query_json) -> items_json` and reach the host only
//! through two imports:
//!
//! | Function | Gated |
//! |----------|-------|
//! | `launchbox_capability(call_json) -> reply_json` | Yes |
//! | `launchbox_setting(key) -> value_json` | No |
//! | `launchbox_log(level, message)` | No |
//!
//! WASI is off, so a guest has no ambient filesystem, clock or network.

use std::path::Path;

use anyhow::Context as _;
use extism::{CurrentPlugin, Error, Manifest, PTR, Plugin, PluginBuilder, UserData, Val, Wasm};

use crate::model::result::{ResultItem, SearchQuery};
use crate::plugin::host_fns::{ApiError, CapabilityCall, HostError, PluginApi};
use crate::plugin::permission::Operation;
use crate::plugin::protocol::{ExecutionRequest, LogLevel};
use crate::plugin::runtime::{LoadedPlugin, SearchHandler};

pub const SEARCH_EXPORT: &str = "search";
pub const CAPABILITY_FN: &str = "launchbox_capability";
pub const SETTING_FN: &str = "launchbox_setting";
pub const LOG_FN: &str = "launchbox_log";

#[derive(Debug, Clone, Copy)]
pub struct WasmLoader {
    max_memory_pages: u32,
}

impl WasmLoader {
    pub fn new(max_memory_pages: u32) -> Self {
        Self { max_memory_pages }
    }

    pub fn load(
        &self,
        request: &ExecutionRequest,
        entry: &Path,
        api: &PluginApi,
    ) -> anyhow::Result<LoadedPlugin> {
        let wasm_path = request.plugin_path.join(entry);
        if !wasm_path.is_file() {
            anyhow::bail!("missing wasm entry: {}", wasm_path.display());
        }

        let manifest = Manifest::new([Wasm::file(&wasm_path)])
            .with_timeout(request.timeout)
            .with_memory_max(self.max_memory_pages);

        let user_data = UserData::new(GuestState {
            api: api.clone(),
            failure: None,
        });
        let plugin = PluginBuilder::new(manifest)
            .with_wasi(false)
            .with_function(CAPABILITY_FN, [PTR], [PTR], user_data.clone(), capability_impl)
            .with_function(SETTING_FN, [PTR], [PTR], user_data.clone(), setting_impl)
            .with_function(LOG_FN, [PTR, PTR], [], user_data.clone(), log_impl)
            .build()
            .with_context(|| format!("failed to build wasm plugin {}", wasm_path.display()))?;

        let cancel = plugin.cancel_handle();
        Ok(LoadedPlugin {
            handler: Box::new(WasmSearchHandler { plugin, user_data }),
            interrupt: Some(Box::new(move || {
                let _ = cancel.cancel();
            })),
        })
    }
}

struct GuestState {
    api: PluginApi,
    /// Set when a capability call aborted the guest; decides how the trap is classified.
    failure: Option<ApiError>,
}

struct WasmSearchHandler {
    plugin: Plugin,
    user_data: UserData<GuestState>,
}

impl WasmSearchHandler {
    fn take_failure(&self) -> Option<ApiError> {
        let state = self.user_data.get().ok()?;
        let mut state = state.lock().ok()?;
        state.failure.take()
    }
}

impl SearchHandler for WasmSearchHandler {
    fn search(
        &mut self,
        query: &SearchQuery,
        _api: &PluginApi,
    ) -> anyhow::Result<Vec<ResultItem>> {
        let input = serde_json::to_string(query)?;
        match self.plugin.call::<&str, String>(SEARCH_EXPORT, &input) {
            Ok(output) => {
                serde_json::from_str(&output).context("search export returned invalid items")
            }
            Err(err) => match self.take_failure() {
                Some(failure) => Err(failure.into()),
                None => Err(err.context("wasm search failed")),
            },
        }
    }
}

/// Gate and forward one JSON-encoded capability call.
///
/// Denials and cancellation trap the guest. Host failures come back as
/// `{"error": ...}` so the guest can recover.
#[allow(clippy::needless_pass_by_value)] // Signature required by Extism callback API
fn capability_impl(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<GuestState>,
) -> Result<(), Error> {
    let request: String = plugin.memory_get_val(&inputs[0])?;

    let ud = user_data.get()?;
    let mut state = ud
        .lock()
        .map_err(|e| Error::msg(format!("guest state lock poisoned: {e}")))?;

    let reply = match dispatch(&state.api, &request) {
        Ok(reply) => serde_json::json!({ "ok": reply }),
        Err(ApiError::Host(err)) => serde_json::json!({ "error": err.to_string() }),
        Err(fatal) => {
            let message = fatal.to_string();
            state.failure = Some(fatal);
            return Err(Error::msg(message));
        }
    };
    drop(state);

    let mem = plugin.memory_new(reply.to_string())?;
    outputs[0] = plugin.memory_to_val(mem);
    Ok(())
}

fn dispatch(api: &PluginApi, request: &str) -> Result<serde_json::Value, ApiError> {
    let raw: serde_json::Value = serde_json::from_str(request)
        .map_err(|err| ApiError::Host(HostError::Failed(format!("malformed call: {err}"))))?;
    let op = raw.get("op").and_then(|op| op.as_str()).unwrap_or_default().to_owned();
    if Operation::from_name(&op).is_none() {
        return Err(ApiError::Host(HostError::Failed(format!(
            "unsupported operation '{op}'"
        ))));
    }

    let call: CapabilityCall = serde_json::from_value(raw).map_err(|err| {
        ApiError::Host(HostError::Failed(format!("malformed {op} call: {err}")))
    })?;
    let reply = api.call(call)?;
    serde_json::to_value(reply)
        .map_err(|err| ApiError::Host(HostError::Failed(format!("encode reply: {err}"))))
}

/// Reply with one of the plugin's settings as JSON; `null` when unset.
#[allow(clippy::needless_pass_by_value)] // Signature required by Extism callback API
fn setting_impl(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<GuestState>,
) -> Result<(), Error> {
    let key: String = plugin.memory_get_val(&inputs[0])?;

    let ud = user_data.get()?;
    let state = ud
        .lock()
        .map_err(|e| Error::msg(format!("guest state lock poisoned: {e}")))?;
    let reply = serde_json::to_string(&state.api.setting(&key))?;
    drop(state);

    let mem = plugin.memory_new(reply)?;
    outputs[0] = plugin.memory_to_val(mem);
    Ok(())
}

#[allow(clippy::needless_pass_by_value)] // Signature required by Extism callback API
fn log_impl(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    _outputs: &mut [Val],
    user_data: UserData<GuestState>,
) -> Result<(), Error> {
    let level: String = plugin.memory_get_val(&inputs[0])?;
    let message: String = plugin.memory_get_val(&inputs[1])?;

    let ud = user_data.get()?;
    let state = ud
        .lock()
        .map_err(|e| Error::msg(format!("guest state lock poisoned: {e}")))?;
    state.api.log(LogLevel::from_name(&level), message);
    Ok(())
}
