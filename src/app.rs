use std::collections::VecDeque;
use std::sync::Arc;

use serde::Deserialize;

use launchbox::{EngineResult, Permission, PluginManager, ResultAction, ResultItem};

use crate::console::ConsoleHost;
use crate::msg::Msg;

pub struct App {
    pub plugin_manager: PluginManager,
    host: Arc<ConsoleHost>,
    pub should_quit: bool,
    pub notifications: VecDeque<String>,
}

impl App {
    pub fn new(plugin_manager: PluginManager, host: Arc<ConsoleHost>) -> Self {
        let mut app = Self {
            plugin_manager,
            host,
            should_quit: false,
            notifications: VecDeque::new(),
        };
        for notice in app.plugin_manager.startup_notifications() {
            app.push_notification(notice);
        }
        app
    }

    // ── MVU: Update ──────────────────────────────────────────────

    pub fn update(&mut self, msg: Msg) {
        match msg {
            Msg::Query(query) => self.handle_query(&query),
            Msg::Command(command) => self.handle_command(&command),
            Msg::Quit => self.should_quit = true,
        }
    }

    pub fn drain_notifications(&mut self) -> Vec<String> {
        self.notifications.drain(..).collect()
    }

    fn handle_query(&mut self, query: &str) {
        let items = self.plugin_manager.search(query);
        if items.is_empty() {
            self.push_notification("no results".to_string());
            return;
        }
        for item in items {
            self.push_notification(format_item(&item));
        }
    }

    fn handle_command(&mut self, command: &str) {
        let mut parts = command.split_whitespace();
        let Some(name) = parts.next() else {
            return;
        };
        let args: Vec<&str> = parts.collect();

        let notifications = match (name, args.as_slice()) {
            ("help", _) => help_lines(),
            ("plugins" | "pl", _) => {
                let mut notes = vec![self.plugin_manager.summary_notification()];
                notes.extend(self.plugin_manager.list_notifications());
                notes
            }
            ("errors", _) => {
                let errors = self.plugin_manager.error_notifications();
                if errors.is_empty() {
                    vec!["plugins: no errors".to_string()]
                } else {
                    errors
                }
            }
            ("enable", ids) if !ids.is_empty() => self
                .plugin_manager
                .enable_many(ids)
                .into_iter()
                .map(|(id, result)| outcome(&id, "enabled", result))
                .collect(),
            ("disable", ids) if !ids.is_empty() => self
                .plugin_manager
                .disable_many(ids)
                .into_iter()
                .map(|(id, result)| outcome(&id, "disabled", result))
                .collect(),
            ("grant", [id, names @ ..]) if !names.is_empty() => {
                let result = parse_permissions(names)
                    .map(|permissions| self.plugin_manager.grant(id, &permissions));
                match result {
                    Ok(result) => vec![outcome(id, "granted", result)],
                    Err(err) => vec![err],
                }
            }
            ("revoke", [id, names @ ..]) if !names.is_empty() => {
                let result = parse_permissions(names)
                    .map(|permissions| self.plugin_manager.revoke(id, &permissions));
                match result {
                    Ok(result) => vec![outcome(id, "revoked", result)],
                    Err(err) => vec![err],
                }
            }
            ("reset", [id]) => {
                let result = self.plugin_manager.reset_crash_count(id);
                vec![outcome(id, "crash count reset", result)]
            }
            ("unregister", [id]) => {
                vec![outcome(id, "unregistered", self.plugin_manager.unregister(id))]
            }
            ("set", [id, key, value @ ..]) if !value.is_empty() => {
                let value = parse_setting(&value.join(" "));
                let result = self.plugin_manager.set_setting(id, key, Some(value));
                vec![outcome(id, &format!("{key} set"), result)]
            }
            ("unset", [id, key]) => {
                let result = self.plugin_manager.set_setting(id, key, None);
                vec![outcome(id, &format!("{key} cleared"), result)]
            }
            ("get", [id, key]) => vec![match self.plugin_manager.get_setting(id, key) {
                Ok(Some(value)) => format!("plugin {id}: {key} = {value}"),
                Ok(None) => format!("plugin {id}: {key} is not set"),
                Err(err) => err.to_string(),
            }],
            ("health", [id]) => vec![match self.plugin_manager.get_health(id) {
                Ok(status) => format_health(&status),
                Err(err) => err.to_string(),
            }],
            ("check", [id]) => vec![match self.plugin_manager.check_health(id) {
                Ok(status) => format_health(&status),
                Err(err) => err.to_string(),
            }],
            ("metrics", _) => self
                .plugin_manager
                .status_report()
                .lines()
                .map(str::to_string)
                .collect(),
            ("clip", text) => {
                self.host.set_clipboard(&text.join(" "));
                vec!["clipboard set".to_string()]
            }
            _ => vec![format!("unknown command: {command} (try :help)")],
        };

        for notification in notifications {
            self.push_notification(notification);
        }
    }

    fn push_notification(&mut self, message: String) {
        self.notifications.push_back(message);
    }
}

fn help_lines() -> Vec<String> {
    [
        "<query>                  search, e.g. calc: 2 * (3 + 4)",
        ":plugins (alias: :pl)    list plugins",
        ":errors                  plugins that failed to load",
        ":enable <id>...          enable plugins",
        ":disable <id>...         disable plugins",
        ":grant <id> <perm>...    grant declared permissions",
        ":revoke <id> <perm>...   revoke permissions",
        ":reset <id>              reset crash count",
        ":unregister <id>         remove an installed plugin",
        ":set <id> <key> <value>  store a plugin setting (TOML value or text)",
        ":unset <id> <key>        clear a plugin setting",
        ":get <id> <key>          show a plugin setting",
        ":health <id>             current health",
        ":check <id>              verify the plugin entry point",
        ":metrics                 execution metrics",
        ":clip <text>             set the console clipboard",
        ":quit (alias: :q)",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn parse_permissions(names: &[&str]) -> Result<Vec<Permission>, String> {
    names
        .iter()
        .flat_map(|name| name.split(','))
        .filter(|name| !name.is_empty())
        .map(|name| {
            Permission::from_name(name).ok_or_else(|| format!("unknown permission: {name}"))
        })
        .collect()
}

/// A TOML value when `raw` parses as one, otherwise the text itself.
fn parse_setting(raw: &str) -> toml::Value {
    toml::Value::deserialize(toml::de::ValueDeserializer::new(raw))
        .unwrap_or_else(|_| toml::Value::String(raw.to_string()))
}

fn outcome(plugin_id: &str, verb: &str, result: EngineResult<()>) -> String {
    match result {
        Ok(()) => format!("plugin {plugin_id}: {verb}"),
        Err(err) => err.to_string(),
    }
}

fn format_health(status: &launchbox::plugin::health::HealthStatus) -> String {
    let mut line = format!(
        "plugin {} [{}] crashes: {}",
        status.plugin_id, status.state, status.crash_count
    );
    if let Some(message) = status.message.as_ref() {
        line.push_str(&format!(" ({message})"));
    }
    line
}

fn format_item(item: &ResultItem) -> String {
    let action = match &item.action {
        ResultAction::Copy { text } => format!("copy {text:?}"),
        ResultAction::Open { target } => format!("open {target}"),
        ResultAction::Plugin { command } => format!("run {command}"),
    };
    let mut line = format!("{} -> {action}", item.title);
    if let Some(description) = item.description.as_ref() {
        line.push_str(&format!("  {description}"));
    }
    if let Some(source) = item.source.as_ref() {
        line.push_str(&format!(" [{source}]"));
    }
    line
}
