//! Query fan-out: one execution unit per matching plugin, run concurrently.

use std::sync::Arc;
use std::time::Duration;

use crate::model::result::{ExecutionResult, ResultItem};
use crate::plugin::health::HealthTracker;
use crate::plugin::host_fns::CapabilityHost;
use crate::plugin::monitor::Monitor;
use crate::plugin::runtime::{ExecutionUnit, PluginLoader};
use crate::plugin::store::ContextStore;

pub struct Dispatcher {
    store: Arc<ContextStore>,
    health: Arc<HealthTracker>,
    monitor: Arc<Monitor>,
    loader: Arc<dyn PluginLoader>,
    host: Arc<dyn CapabilityHost>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<ContextStore>,
        health: Arc<HealthTracker>,
        monitor: Arc<Monitor>,
        loader: Arc<dyn PluginLoader>,
        host: Arc<dyn CapabilityHost>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            health,
            monitor,
            loader,
            host,
            timeout,
        }
    }

    /// Run every matching plugin and return one result per plugin, by id.
    ///
    /// Units start together, so total latency is bounded by the slowest
    /// unit and never by the sum. Health and metrics are updated before
    /// this returns.
    pub fn execute(&self, query: &str) -> Vec<ExecutionResult> {
        let requests = self.store.dispatch_requests(query, self.timeout);
        if requests.is_empty() {
            tracing::debug!(query, "no plugin matched");
            return Vec::new();
        }

        let units: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let plugin_id = request.plugin_id.clone();
                self.monitor.unit_spawned();
                let unit = ExecutionUnit::spawn(request, self.loader.clone(), self.host.clone());
                (plugin_id, unit)
            })
            .collect();

        let results: Vec<ExecutionResult> = units
            .into_iter()
            .map(|(plugin_id, unit)| match unit {
                Ok(unit) => unit.wait(),
                Err(error) => ExecutionResult::failed(plugin_id, error, 0),
            })
            .collect();

        for result in &results {
            self.health.record(&self.store, result);
            self.monitor.record(result);
        }

        tracing::debug!(
            query,
            dispatched = results.len(),
            succeeded = results.iter().filter(|r| r.success).count(),
            "query dispatched"
        );
        results
    }
}

/// Aggregate successful outputs, tagged with their source plugin.
pub(crate) fn collect_items(
    results: Vec<ExecutionResult>,
    max_results: usize,
) -> Vec<ResultItem> {
    results
        .into_iter()
        .filter(|result| result.success)
        .flat_map(|result| {
            let source = result.plugin_id;
            result.output.into_iter().map(move |mut item| {
                item.source = Some(source.clone());
                item
            })
        })
        .take(max_results)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::model::result::ResultAction;

    fn item(id: &str) -> ResultItem {
        ResultItem::new(id, id, ResultAction::Copy {
            text: id.to_string(),
        })
    }

    #[test]
    fn failed_results_contribute_nothing() {
        let results = vec![
            ExecutionResult::succeeded("a", vec![item("a1"), item("a2")], 1),
            ExecutionResult::failed(
                "b",
                EngineError::PluginException {
                    plugin_id: "b".to_string(),
                    message: "boom".to_string(),
                },
                1,
            ),
            ExecutionResult::succeeded("c", vec![item("c1")], 1),
        ];

        let items = collect_items(results, 10);
        let sources: Vec<_> = items.iter().map(|i| i.source.as_deref()).collect();
        assert_eq!(sources, vec![Some("a"), Some("a"), Some("c")]);
    }

    #[test]
    fn aggregate_is_capped() {
        let results = vec![ExecutionResult::succeeded(
            "a",
            (0..5).map(|n| item(&n.to_string())).collect(),
            1,
        )];
        assert_eq!(collect_items(results, 3).len(), 3);
    }
}
