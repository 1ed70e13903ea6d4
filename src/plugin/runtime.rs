//! Execution units: one isolated thread per (plugin, query) pair.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;

use crate::error::EngineError;
use crate::model::result::{ExecutionResult, ResultItem, SearchQuery};
use crate::plugin::builtin::BuiltinCatalog;
use crate::plugin::host_fns::{ApiError, CapabilityCall, CapabilityHost, PluginApi};
use crate::plugin::manifest::EntryRef;
use crate::plugin::protocol::{ExecutionRequest, Interrupt, UnitCommand, UnitEvent};

/// Stack for every unit thread. An overflow aborts the process, not the unit.
const UNIT_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Plugin code as the engine sees it.
///
/// Handlers return their items or an error; an [`ApiError`] anywhere in the
/// error chain decides how the failure is classified.
pub trait SearchHandler: Send {
    fn search(&mut self, query: &SearchQuery, api: &PluginApi) -> anyhow::Result<Vec<ResultItem>>;
}

pub struct LoadedPlugin {
    pub handler: Box<dyn SearchHandler>,
    pub interrupt: Option<Interrupt>,
}

impl LoadedPlugin {
    pub fn native(handler: Box<dyn SearchHandler>) -> Self {
        Self {
            handler,
            interrupt: None,
        }
    }
}

/// Turns an entry reference into runnable code inside a unit.
pub trait PluginLoader: Send + Sync {
    fn load(&self, request: &ExecutionRequest, api: &PluginApi) -> anyhow::Result<LoadedPlugin>;
}

/// Loads bundled handlers from the catalog and WASM modules from disk.
pub struct SandboxLoader {
    builtins: BuiltinCatalog,
    #[cfg(feature = "plugins")]
    wasm: crate::plugin::wasm::WasmLoader,
}

impl SandboxLoader {
    pub fn new(builtins: BuiltinCatalog, max_memory_pages: u32) -> Self {
        #[cfg(not(feature = "plugins"))]
        let _ = max_memory_pages;
        Self {
            builtins,
            #[cfg(feature = "plugins")]
            wasm: crate::plugin::wasm::WasmLoader::new(max_memory_pages),
        }
    }
}

impl PluginLoader for SandboxLoader {
    fn load(&self, request: &ExecutionRequest, api: &PluginApi) -> anyhow::Result<LoadedPlugin> {
        match &request.entry {
            EntryRef::Builtin(name) => self
                .builtins
                .instantiate(name)
                .map(LoadedPlugin::native)
                .ok_or_else(|| anyhow!("unknown builtin handler '{name}'")),
            #[cfg(feature = "plugins")]
            EntryRef::Wasm(path) => self.wasm.load(request, path, api),
            #[cfg(not(feature = "plugins"))]
            EntryRef::Wasm(path) => {
                let _ = api;
                Err(anyhow!(
                    "cannot run {}: built without wasm plugin support",
                    path.display()
                ))
            }
        }
    }
}

/// A running execution. Consumed by [`ExecutionUnit::wait`].
pub struct ExecutionUnit {
    plugin_id: String,
    timeout: Duration,
    started_at: Instant,
    events: Receiver<UnitEvent>,
    host: Arc<dyn CapabilityHost>,
    cancelled: Arc<AtomicBool>,
    interrupt: Option<Interrupt>,
}

impl ExecutionUnit {
    /// Start a fresh unit and hand it `request`. The clock starts here.
    pub fn spawn(
        request: ExecutionRequest,
        loader: Arc<dyn PluginLoader>,
        host: Arc<dyn CapabilityHost>,
    ) -> Result<Self, EngineError> {
        let plugin_id = request.plugin_id.clone();
        let timeout = request.timeout;
        let (command_tx, command_rx) = mpsc::channel::<UnitCommand>();
        let (event_tx, event_rx) = mpsc::channel::<UnitEvent>();
        let cancelled = Arc::new(AtomicBool::new(false));
        let started_at = Instant::now();

        let unit_host = host.clone();
        let unit_cancelled = cancelled.clone();
        thread::Builder::new()
            .name(format!("plugin-unit:{plugin_id}"))
            .stack_size(UNIT_STACK_SIZE)
            .spawn(move || run_unit(command_rx, event_tx, loader, unit_host, unit_cancelled))
            .map_err(|err| EngineError::PluginException {
                plugin_id: plugin_id.clone(),
                message: format!("failed to start execution unit: {err}"),
            })?;

        command_tx
            .send(UnitCommand::Execute(request))
            .map_err(|_| EngineError::PluginException {
                plugin_id: plugin_id.clone(),
                message: "execution unit exited before receiving its command".to_string(),
            })?;

        tracing::debug!(
            plugin = %plugin_id,
            timeout_ms = timeout.as_millis() as u64,
            "unit spawned"
        );

        Ok(Self {
            plugin_id,
            timeout,
            started_at,
            events: event_rx,
            host,
            cancelled,
            interrupt: None,
        })
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Block until the unit reports a result or the deadline passes.
    ///
    /// Logs and notifications are drained while waiting. On timeout the unit
    /// is torn down and its late output, if any, is discarded.
    pub fn wait(mut self) -> ExecutionResult {
        let deadline = self.started_at + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.time_out();
            }

            match self.events.recv_timeout(remaining) {
                Ok(event) => {
                    if let Some(outcome) = self.handle_event(event) {
                        return self.finish(outcome);
                    }
                }
                Err(RecvTimeoutError::Timeout) => return self.time_out(),
                Err(RecvTimeoutError::Disconnected) => {
                    let error = EngineError::PluginException {
                        plugin_id: self.plugin_id.clone(),
                        message: "execution unit exited without a result".to_string(),
                    };
                    return self.finish(Err(error));
                }
            }
        }
    }

    fn handle_event(
        &mut self,
        event: UnitEvent,
    ) -> Option<Result<Vec<ResultItem>, EngineError>> {
        match event {
            UnitEvent::Loaded { interrupt } => {
                self.interrupt = interrupt;
                None
            }
            UnitEvent::Log { level, message } => {
                level.emit(&self.plugin_id, &message);
                None
            }
            UnitEvent::Notification { title, body } => {
                let call = CapabilityCall::Notify { title, body };
                if let Err(err) = self.host.invoke(&self.plugin_id, &call) {
                    tracing::warn!(plugin = %self.plugin_id, "notification dropped: {err}");
                }
                None
            }
            UnitEvent::Result(outcome) => Some(outcome),
        }
    }

    fn finish(&self, outcome: Result<Vec<ResultItem>, EngineError>) -> ExecutionResult {
        let elapsed_ms = self.elapsed_ms();
        match outcome {
            Ok(output) => ExecutionResult::succeeded(self.plugin_id.clone(), output, elapsed_ms),
            Err(error) => ExecutionResult::failed(self.plugin_id.clone(), error, elapsed_ms),
        }
    }

    fn time_out(&mut self) -> ExecutionResult {
        // A result already queued at the deadline still counts.
        while let Ok(event) = self.events.try_recv() {
            if let Some(outcome) = self.handle_event(event) {
                return self.finish(outcome);
            }
        }

        self.teardown();
        let timeout_ms = self.timeout.as_millis() as u64;
        tracing::warn!(plugin = %self.plugin_id, timeout_ms, "execution timed out");
        ExecutionResult::failed(
            self.plugin_id.clone(),
            EngineError::Timeout {
                plugin_id: self.plugin_id.clone(),
                timeout_ms,
            },
            self.elapsed_ms(),
        )
    }

    fn teardown(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(interrupt) = self.interrupt.take() {
            interrupt();
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

impl Drop for ExecutionUnit {
    fn drop(&mut self) {
        // Nothing may run on this unit's behalf once it is gone.
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

fn run_unit(
    commands: Receiver<UnitCommand>,
    events: Sender<UnitEvent>,
    loader: Arc<dyn PluginLoader>,
    host: Arc<dyn CapabilityHost>,
    cancelled: Arc<AtomicBool>,
) {
    let Ok(UnitCommand::Execute(request)) = commands.recv() else {
        return;
    };

    let api = PluginApi::new(
        request.plugin_id.clone(),
        request.permissions.clone(),
        request.settings.clone(),
        host,
        events.clone(),
        cancelled,
    );

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        execute(&request, loader.as_ref(), &api, &events)
    }))
    .unwrap_or_else(|payload| {
        Err(EngineError::PluginException {
            plugin_id: request.plugin_id.clone(),
            message: format!("plugin panicked: {}", panic_message(payload.as_ref())),
        })
    });

    let _ = events.send(UnitEvent::Result(outcome));
}

fn execute(
    request: &ExecutionRequest,
    loader: &dyn PluginLoader,
    api: &PluginApi,
    events: &Sender<UnitEvent>,
) -> Result<Vec<ResultItem>, EngineError> {
    let LoadedPlugin {
        mut handler,
        interrupt,
    } = loader
        .load(request, api)
        .map_err(|err| classify(&request.plugin_id, err))?;
    let _ = events.send(UnitEvent::Loaded { interrupt });

    handler
        .search(&request.args, api)
        .map_err(|err| classify(&request.plugin_id, err))
}

fn classify(plugin_id: &str, err: anyhow::Error) -> EngineError {
    match err.downcast::<ApiError>() {
        Ok(api_err) => api_err.into_engine_error(plugin_id),
        Err(other) => EngineError::PluginException {
            plugin_id: plugin_id.to_string(),
            message: format!("{other:#}"),
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
