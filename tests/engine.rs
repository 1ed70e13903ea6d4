use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use launchbox::plugin::health::HealthState;
use launchbox::plugin::host_fns::HttpRequest;
use launchbox::plugin::registry::{
    InstalledPlugin, LoadError, MemoryRegistry, PluginRegistry, StoredState, TomlRegistry,
};
use launchbox::plugin::runtime::SearchHandler;
use launchbox::{
    AppConfig, BuiltinCatalog, CapabilityCall, CapabilityHost, CapabilityReply, EngineError,
    HostError, Permission, PluginApi, PluginContext, PluginManager, PluginManifest, ResultAction,
    ResultItem, SearchQuery,
};

#[derive(Default)]
struct RecordingHost {
    calls: Mutex<Vec<(String, CapabilityCall)>>,
}

impl RecordingHost {
    fn calls(&self) -> Vec<(String, CapabilityCall)> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl CapabilityHost for RecordingHost {
    fn invoke(
        &self,
        plugin_id: &str,
        call: &CapabilityCall,
    ) -> Result<CapabilityReply, HostError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((plugin_id.to_string(), call.clone()));
        match call {
            CapabilityCall::ClipboardRead => Ok(CapabilityReply::Text("hello".to_string())),
            CapabilityCall::HttpRequest(_) => Ok(CapabilityReply::Http(
                launchbox::plugin::host_fns::HttpResponse {
                    status: 200,
                    body: "{}".to_string(),
                },
            )),
            _ => Ok(CapabilityReply::Done),
        }
    }
}

type SearchFn = fn(&SearchQuery, &PluginApi) -> anyhow::Result<Vec<ResultItem>>;

struct FnHandler(SearchFn);

impl SearchHandler for FnHandler {
    fn search(&mut self, query: &SearchQuery, api: &PluginApi) -> anyhow::Result<Vec<ResultItem>> {
        (self.0)(query, api)
    }
}

fn item(plugin: &str, text: &str) -> ResultItem {
    ResultItem::new(format!("{plugin}:{text}"), text, ResultAction::Copy {
        text: text.to_string(),
    })
}

fn qr(query: &SearchQuery, _: &PluginApi) -> anyhow::Result<Vec<ResultItem>> {
    Ok(vec![item("qr", &query.term)])
}

fn slow(_: &SearchQuery, _: &PluginApi) -> anyhow::Result<Vec<ResultItem>> {
    thread::sleep(Duration::from_millis(600));
    Ok(vec![item("slow", "late")])
}

fn broken(_: &SearchQuery, _: &PluginApi) -> anyhow::Result<Vec<ResultItem>> {
    anyhow::bail!("broken on purpose")
}

fn fetcher(query: &SearchQuery, api: &PluginApi) -> anyhow::Result<Vec<ResultItem>> {
    let response = api.http_request(HttpRequest {
        method: "GET".to_string(),
        url: format!("https://example.com/?q={}", query.term),
        headers: Vec::new(),
        body: None,
    })?;
    Ok(vec![item("fetcher", &response.status.to_string())])
}

fn notifier(_: &SearchQuery, api: &PluginApi) -> anyhow::Result<Vec<ResultItem>> {
    api.notify("Heads up", "from a plugin")?;
    Ok(Vec::new())
}

/// Titles its single item with the `label` setting.
fn labeller(_: &SearchQuery, api: &PluginApi) -> anyhow::Result<Vec<ResultItem>> {
    let label = api
        .setting("label")
        .and_then(|value| value.as_str())
        .unwrap_or("unlabelled");
    Ok(vec![item("labeller", label)])
}

fn catalog() -> BuiltinCatalog {
    let mut catalog = BuiltinCatalog::default();
    let handlers: [(&str, SearchFn); 6] = [
        ("qr", qr),
        ("slow", slow),
        ("broken", broken),
        ("fetcher", fetcher),
        ("notifier", notifier),
        ("labeller", labeller),
    ];
    for (name, search) in handlers {
        catalog.register_handler(name, move || Box::new(FnHandler(search)));
    }
    catalog
}

fn manifest(id: &str, triggers: &[&str], permissions: Vec<Permission>) -> PluginManifest {
    PluginManifest {
        id: id.to_string(),
        name: id.to_string(),
        version: "1.0.0".to_string(),
        description: None,
        author: None,
        permissions,
        triggers: triggers.iter().map(|t| t.to_string()).collect(),
        entry: format!("builtin:{id}"),
    }
}

/// Defaults with the bundled plugins left out.
fn config(timeout_ms: u64) -> AppConfig {
    let mut config = AppConfig::default();
    config.sandbox.timeout_ms = timeout_ms;
    config.plugins.builtin.clear();
    config
}

/// In-memory registry whose saves can be made to fail.
#[derive(Default)]
struct FlakyRegistry {
    inner: MemoryRegistry,
    failing: AtomicBool,
}

impl FlakyRegistry {
    fn fail_saves(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        Ok(())
    }
}

impl PluginRegistry for FlakyRegistry {
    fn load_all(&self) -> anyhow::Result<Vec<Result<InstalledPlugin, LoadError>>> {
        self.inner.load_all()
    }

    fn stored_state(&self, plugin_id: &str) -> anyhow::Result<Option<StoredState>> {
        self.inner.stored_state(plugin_id)
    }

    fn save(&self, ctx: &PluginContext) -> anyhow::Result<()> {
        self.check()?;
        self.inner.save(ctx)
    }

    fn remove(&self, plugin_id: &str) -> anyhow::Result<()> {
        self.check()?;
        self.inner.remove(plugin_id)
    }
}

struct Harness {
    manager: PluginManager,
    host: Arc<RecordingHost>,
    registry: Arc<MemoryRegistry>,
}

/// Installs `plugins` enabled with every declared permission granted.
fn harness(timeout_ms: u64, plugins: Vec<PluginManifest>) -> Harness {
    let registry = Arc::new(MemoryRegistry::new());
    for plugin in plugins {
        registry.set_state(
            &plugin.id,
            StoredState {
                enabled: true,
                granted: plugin.permissions.clone(),
                ..StoredState::default()
            },
        );
        registry.install(plugin, PathBuf::new());
    }
    let host = Arc::new(RecordingHost::default());
    let manager =
        PluginManager::start(&config(timeout_ms), registry.clone(), host.clone(), catalog());
    Harness {
        manager,
        host,
        registry,
    }
}

#[test]
fn unmatched_query_spawns_no_units() {
    let h = harness(1000, vec![manifest("qr", &["qr:"], Vec::new())]);

    assert!(h.manager.search("xyz").is_empty());
    assert_eq!(h.manager.get_metrics().units_spawned, 0);
    assert_eq!(h.manager.get_metrics().total_executions, 0);
}

#[test]
fn matching_query_dispatches_exactly_one_unit() {
    let h = harness(1000, vec![
        manifest("qr", &["qr:"], Vec::new()),
        manifest("broken", &["err:"], Vec::new()),
    ]);

    let items = h.manager.search("qr: hello");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].title, "hello");
    assert_eq!(items[0].source.as_deref(), Some("qr"));
    assert_eq!(h.manager.get_metrics().units_spawned, 1);

    let ctx = h.manager.context("qr").expect("qr");
    assert_eq!(ctx.execution_count, 1);
    assert!(ctx.last_used.is_some());
}

#[test]
fn results_only_come_from_successful_units() {
    let h = harness(1000, vec![
        manifest("qr", &["qr:"], Vec::new()),
        manifest("broken", &["qr:"], Vec::new()),
    ]);

    let results = h.manager.execute("qr: hi");
    let ids: Vec<&str> = results.iter().map(|r| r.plugin_id.as_str()).collect();
    assert_eq!(ids, vec!["broken", "qr"]);
    assert!(!results[0].success);
    assert!(results[0].error_message().expect("error").contains("broken on purpose"));

    let items = h.manager.search("qr: hi");
    assert!(items.iter().all(|item| item.source.as_deref() == Some("qr")));
    assert_eq!(h.manager.context("broken").expect("broken").crash_count, 2);
}

#[test]
fn timeout_counts_one_crash_and_discards_late_output() {
    let h = harness(100, vec![manifest("slow", &["slow:"], Vec::new())]);

    let results = h.manager.execute("slow: x");
    assert_eq!(results.len(), 1);
    assert_eq!(
        results[0].error,
        Some(EngineError::Timeout {
            plugin_id: "slow".to_string(),
            timeout_ms: 100,
        })
    );

    // Let the abandoned unit finish; nothing it produces may be recorded.
    thread::sleep(Duration::from_millis(800));
    let ctx = h.manager.context("slow").expect("slow");
    assert_eq!(ctx.crash_count, 1);
    assert_eq!(ctx.execution_count, 0);
    assert_eq!(h.manager.get_metrics().timeouts, 1);
    assert_eq!(h.registry.state("slow").expect("persisted").crash_count, 1);
}

#[test]
fn units_run_concurrently() {
    let h = harness(300, vec![
        manifest("slow", &["q:"], Vec::new()),
        manifest("qr", &["q:"], Vec::new()),
    ]);

    let started = Instant::now();
    let results = h.manager.execute("q: both");
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_millis(550), "took {elapsed:?}");
    let slow = results.iter().find(|r| r.plugin_id == "slow").expect("slow");
    let fast = results.iter().find(|r| r.plugin_id == "qr").expect("qr");
    assert!(slow.is_timeout());
    assert!(fast.success);
    assert_eq!(fast.output[0].title, "both");
}

#[test]
fn plugin_is_quarantined_at_crash_threshold() {
    let h = harness(1000, vec![manifest("broken", &["err:"], Vec::new())]);

    for _ in 0..3 {
        assert_eq!(h.manager.execute("err: now").len(), 1);
    }

    let ctx = h.manager.context("broken").expect("broken");
    assert_eq!(ctx.crash_count, 3);
    assert!(!ctx.is_enabled);
    let health = h.manager.get_health("broken").expect("health");
    assert_eq!(health.state, HealthState::Error);

    let spawned = h.manager.get_metrics().units_spawned;
    assert!(h.manager.execute("err: again").is_empty());
    assert_eq!(h.manager.get_metrics().units_spawned, spawned);
    assert!(!h.registry.state("broken").expect("persisted").enabled);
}

#[test]
fn re_enable_after_quarantine_keeps_crash_count() {
    let h = harness(1000, vec![manifest("broken", &["err:"], Vec::new())]);
    for _ in 0..3 {
        h.manager.execute("err: now");
    }

    h.manager.enable("broken").expect("enable");
    let health = h.manager.get_health("broken").expect("health");
    assert_eq!(health.state, HealthState::Unknown);
    assert_eq!(health.crash_count, 3);

    // Already past the threshold: the next failure quarantines again.
    h.manager.execute("err: again");
    assert!(!h.manager.context("broken").expect("broken").is_enabled);

    h.manager.reset_crash_count("broken").expect("reset");
    h.manager.enable("broken").expect("enable");
    h.manager.execute("err: once more");
    let ctx = h.manager.context("broken").expect("broken");
    assert!(ctx.is_enabled);
    assert_eq!(ctx.crash_count, 1);
}

#[test]
fn denied_network_call_never_reaches_host() {
    let h = harness(1000, vec![manifest("fetcher", &["web:"], vec![Permission::Network])]);
    h.manager.revoke("fetcher", &[Permission::Network]).expect("revoke");

    let results = h.manager.execute("web: rust");
    assert_eq!(
        results[0].error,
        Some(EngineError::PermissionDenied {
            plugin_id: "fetcher".to_string(),
            permission: Permission::Network,
        })
    );
    assert!(!results[0].success);
    assert!(results[0].error_message().expect("error").contains("PermissionDenied"));
    assert!(h.host.calls().is_empty());
    assert_eq!(h.manager.context("fetcher").expect("fetcher").crash_count, 1);
}

#[test]
fn granted_network_call_is_forwarded() {
    let h = harness(1000, vec![manifest("fetcher", &["web:"], vec![Permission::Network])]);

    let items = h.manager.search("web: rust");
    assert_eq!(items[0].title, "200");
    let calls = h.host.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "fetcher");
    assert!(matches!(calls[0].1, CapabilityCall::HttpRequest(_)));
}

#[test]
fn revoked_permission_applies_to_the_next_dispatch() {
    let h = harness(1000, vec![manifest("fetcher", &["web:"], vec![Permission::Network])]);
    assert!(h.manager.execute("web: a")[0].success);

    h.manager.revoke("fetcher", &[Permission::Network]).expect("revoke");
    assert!(!h.manager.execute("web: b")[0].success);
    assert_eq!(h.host.calls().len(), 1);
}

#[test]
fn notifications_are_forwarded_without_a_grant() {
    let h = harness(1000, vec![manifest("notifier", &["n:"], Vec::new())]);

    assert!(h.manager.execute("n: go")[0].success);
    let calls = h.host.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0].1,
        CapabilityCall::Notify {
            title: "Heads up".to_string(),
            body: "from a plugin".to_string(),
        }
    );
}

#[test]
fn registration_round_trip_persists_state() {
    let h = harness(1000, Vec::new());

    h.manager
        .register(manifest("fetcher", &["web:"], vec![Permission::Network]), PathBuf::new())
        .expect("register");
    let fresh = h.manager.context("fetcher").expect("fetcher");
    assert!(!fresh.is_enabled);
    assert!(fresh.granted_permissions.is_empty());
    assert!(h.manager.search("web: x").is_empty());

    h.manager.enable("fetcher").expect("enable");
    h.manager
        .grant("fetcher", &[Permission::Network, Permission::Shell])
        .expect("grant");

    let ctx = h.manager.context("fetcher").expect("fetcher");
    assert!(ctx.is_enabled);
    assert_eq!(ctx.sorted_grants(), vec![Permission::Network]);
    assert_eq!(
        h.registry.state("fetcher"),
        Some(StoredState {
            enabled: true,
            granted: vec![Permission::Network],
            ..StoredState::default()
        })
    );

    assert_eq!(
        h.manager
            .register(manifest("fetcher", &["web:"], Vec::new()), PathBuf::new()),
        Err(EngineError::AlreadyRegistered("fetcher".to_string()))
    );

    h.manager.unregister("fetcher").expect("unregister");
    assert!(h.manager.context("fetcher").is_none());
    assert_eq!(h.registry.state("fetcher"), None);
    assert_eq!(
        h.manager.enable("fetcher"),
        Err(EngineError::NotFound("fetcher".to_string()))
    );
}

#[test]
fn bulk_toggle_reports_each_plugin() {
    let h = harness(1000, vec![manifest("qr", &["qr:"], Vec::new())]);

    let outcomes = h.manager.disable_many(&["qr", "ghost"]);
    assert!(outcomes[0].1.is_ok());
    assert_eq!(outcomes[1].1, Err(EngineError::NotFound("ghost".to_string())));

    let health = h.manager.get_health("qr").expect("health");
    assert_eq!(health.state, HealthState::Warning);
    assert_eq!(health.message.as_deref(), Some("disabled by user"));
}

#[test]
fn bundled_plugins_start_enabled() {
    let mut config = AppConfig::default();
    config.plugins.builtin.push("nope".to_string());
    let host = Arc::new(RecordingHost::default());
    let manager = PluginManager::start(
        &config,
        Arc::new(MemoryRegistry::new()),
        host.clone(),
        BuiltinCatalog::bundled(),
    );

    assert_eq!(manager.plugin_count(), 2);
    assert_eq!(manager.load_errors().len(), 1);
    assert_eq!(manager.load_errors()[0].plugin_id, "nope");

    let items = manager.search("calc: (2 + 3) * 4");
    assert_eq!(items[0].title, "= 20");

    let items = manager.search("clip:");
    let titles: Vec<&str> = items.iter().map(|i| i.title.as_str()).collect();
    assert_eq!(titles, vec!["Uppercase", "Lowercase", "Trim whitespace", "Reverse"]);
    assert_eq!(host.calls().len(), 1);
}

#[test]
fn toml_registry_startup_reports_bad_plugins() {
    let dir = tempfile::tempdir().expect("tempdir");
    let plugins = dir.path().join("plugins");
    std::fs::create_dir_all(plugins.join("ok")).expect("ok dir");
    std::fs::create_dir_all(plugins.join("bad")).expect("bad dir");
    std::fs::write(
        plugins.join("ok/plugin.toml"),
        "id = \"ok\"\nname = \"Ok\"\nversion = \"1.0.0\"\n\
         entry = \"plugin.wasm\"\ntriggers = [\"ok:\"]\n",
    )
    .expect("ok manifest");
    std::fs::write(plugins.join("bad/plugin.toml"), "id = \"Bad Id\"\n").expect("bad manifest");

    let registry = Arc::new(TomlRegistry::new(plugins.clone(), plugins.join("state.toml")));
    let manager = PluginManager::start(
        &config(1000),
        registry,
        Arc::new(RecordingHost::default()),
        BuiltinCatalog::default(),
    );

    assert_eq!(manager.plugin_count(), 1);
    assert_eq!(manager.load_errors().len(), 1);
    assert_eq!(manager.load_errors()[0].plugin_id, "bad");

    let status = manager.check_health("ok").expect("check");
    assert_eq!(status.state, HealthState::Error);
    assert!(status.last_error.expect("error").starts_with("missing wasm entry"));

    manager.enable("ok").expect("enable");
    let reloaded = PluginManager::start(
        &config(1000),
        Arc::new(TomlRegistry::new(plugins.clone(), plugins.join("state.toml"))),
        Arc::new(RecordingHost::default()),
        BuiltinCatalog::default(),
    );
    assert!(reloaded.context("ok").expect("ok").is_enabled);
}

#[test]
fn enabling_a_healthy_plugin_keeps_its_health() {
    let h = harness(1000, vec![manifest("qr", &["qr:"], Vec::new())]);
    assert!(h.manager.execute("qr: x")[0].success);
    assert_eq!(h.manager.get_health("qr").expect("health").state, HealthState::Healthy);

    h.manager.enable("qr").expect("enable");
    assert_eq!(h.manager.get_health("qr").expect("health").state, HealthState::Healthy);
}

#[test]
fn failed_save_leaves_memory_untouched() {
    let registry = Arc::new(FlakyRegistry::default());
    let manager = PluginManager::start(
        &config(1000),
        registry.clone(),
        Arc::new(RecordingHost::default()),
        catalog(),
    );
    manager
        .register(manifest("fetcher", &["web:"], vec![Permission::Network]), PathBuf::new())
        .expect("register");

    registry.fail_saves(true);
    let err = manager.enable("fetcher").expect_err("save fails");
    assert!(matches!(err, EngineError::Registry(ref message) if message.contains("disk full")));
    let ctx = manager.context("fetcher").expect("fetcher");
    assert!(!ctx.is_enabled);

    assert!(manager.grant("fetcher", &[Permission::Network]).is_err());
    assert!(manager.set_setting("fetcher", "region", Some("eu".into())).is_err());
    let ctx = manager.context("fetcher").expect("fetcher");
    assert!(ctx.granted_permissions.is_empty());
    assert!(ctx.settings.is_empty());

    assert!(manager
        .register(manifest("qr", &["qr:"], Vec::new()), PathBuf::new())
        .is_err());
    assert!(manager.context("qr").is_none());

    assert!(manager.unregister("fetcher").is_err());
    assert!(manager.context("fetcher").is_some());

    registry.fail_saves(false);
    manager.enable("fetcher").expect("enable");
    assert!(registry.inner.state("fetcher").expect("saved").enabled);
}

#[test]
fn bundled_plugins_are_protected_from_unregister() {
    let registry = Arc::new(MemoryRegistry::new());
    let manager = PluginManager::start(
        &AppConfig::default(),
        registry.clone(),
        Arc::new(RecordingHost::default()),
        BuiltinCatalog::bundled(),
    );

    assert_eq!(
        manager.unregister("calculator"),
        Err(EngineError::CorePluginProtected("calculator".to_string()))
    );
    assert!(manager.context("calculator").is_some());
    assert_eq!(manager.search("calc: 1 + 1")[0].title, "= 2");

    manager.disable("calculator").expect("bundled plugins can still be disabled");
}

#[test]
fn deeply_nested_calculator_input_does_not_take_the_process_down() {
    let manager = PluginManager::start(
        &AppConfig::default(),
        Arc::new(MemoryRegistry::new()),
        Arc::new(RecordingHost::default()),
        BuiltinCatalog::bundled(),
    );

    let query = format!("calc: {}", "(".repeat(20_000));
    let results = manager.execute(&query);
    assert_eq!(results.len(), 1);
    assert!(results[0].success, "{:?}", results[0]);
    assert!(results[0].output.is_empty());

    assert_eq!(manager.search("calc: 2 ^ 10")[0].title, "= 1024");
}

#[test]
fn settings_reach_the_plugin_and_persist() {
    let h = harness(1000, vec![manifest("labeller", &["label:"], Vec::new())]);
    assert_eq!(h.manager.search("label: x")[0].title, "unlabelled");

    h.manager
        .set_setting("labeller", "label", Some(toml::Value::String("work".to_string())))
        .expect("set");
    assert_eq!(h.manager.search("label: x")[0].title, "work");
    assert_eq!(
        h.manager.get_setting("labeller", "label"),
        Ok(Some(toml::Value::String("work".to_string())))
    );
    assert_eq!(
        h.registry.state("labeller").expect("saved").settings.get("label"),
        Some(&toml::Value::String("work".to_string()))
    );

    let restarted = PluginManager::start(
        &config(1000),
        h.registry.clone(),
        Arc::new(RecordingHost::default()),
        catalog(),
    );
    assert_eq!(restarted.search("label: x")[0].title, "work");

    h.manager.set_setting("labeller", "label", None).expect("clear");
    assert_eq!(h.manager.get_setting("labeller", "label"), Ok(None));
    assert!(matches!(
        h.manager.set_setting("labeller", " ", Some(toml::Value::Integer(1))),
        Err(EngineError::InvalidSetting(_))
    ));
    assert_eq!(
        h.manager.get_setting("ghost", "label"),
        Err(EngineError::NotFound("ghost".to_string()))
    );
}

#[test]
fn toml_registry_unregister_removes_the_plugin_for_good() {
    let dir = tempfile::tempdir().expect("tempdir");
    let plugins = dir.path().join("plugins");
    std::fs::create_dir_all(plugins.join("gone")).expect("plugin dir");
    std::fs::write(
        plugins.join("gone/plugin.toml"),
        "id = \"gone\"\nname = \"Gone\"\nversion = \"1.0.0\"\n\
         entry = \"plugin.wasm\"\ntriggers = [\"gone:\"]\n",
    )
    .expect("manifest");
    let start = || {
        PluginManager::start(
            &config(1000),
            Arc::new(TomlRegistry::new(plugins.clone(), plugins.join("state.toml"))),
            Arc::new(RecordingHost::default()),
            BuiltinCatalog::default(),
        )
    };

    let manager = start();
    manager.enable("gone").expect("enable");
    manager.unregister("gone").expect("unregister");
    assert!(!plugins.join("gone").exists());

    let reloaded = start();
    assert!(reloaded.context("gone").is_none());
    assert!(reloaded.load_errors().is_empty());
}
