use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Arguments handed to a plugin's search handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// The query exactly as typed.
    pub raw: String,
    /// The trigger keyword that matched, as declared in the manifest.
    pub keyword: String,
    /// Everything after the trigger, leading whitespace trimmed.
    pub term: String,
}

impl SearchQuery {
    /// Match `trigger` case-insensitively against the start of `query`.
    pub fn match_trigger(query: &str, trigger: &str) -> Option<Self> {
        let rest = strip_prefix_ignore_case(query, trigger)?;
        Some(Self {
            raw: query.to_string(),
            keyword: trigger.to_string(),
            term: rest.trim_start().to_string(),
        })
    }
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return None;
    }

    let mut text_chars = text.char_indices();
    for expected in prefix.chars() {
        let (_, actual) = text_chars.next()?;
        if !actual.to_lowercase().eq(expected.to_lowercase()) {
            return None;
        }
    }

    let consumed = text_chars.next().map(|(idx, _)| idx).unwrap_or(text.len());
    Some(&text[consumed..])
}

/// What the launcher does when a result is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultAction {
    Copy { text: String },
    Open { target: String },
    /// Handled by the plugin itself on a later call.
    Plugin { command: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    pub action: ResultAction,
    /// Plugin that produced the item; filled in by the dispatcher.
    #[serde(default)]
    pub source: Option<String>,
}

impl ResultItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>, action: ResultAction) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            icon: None,
            action,
            source: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }
}

/// Outcome of one execution unit.
///
/// `error` is present exactly when `success` is false.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub plugin_id: String,
    pub success: bool,
    pub output: Vec<ResultItem>,
    pub error: Option<EngineError>,
    pub execution_time_ms: u64,
}

impl ExecutionResult {
    pub fn succeeded(
        plugin_id: impl Into<String>,
        output: Vec<ResultItem>,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            success: true,
            output,
            error: None,
            execution_time_ms: elapsed_ms,
        }
    }

    pub fn failed(plugin_id: impl Into<String>, error: EngineError, elapsed_ms: u64) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            success: false,
            output: Vec::new(),
            error: Some(error),
            execution_time_ms: elapsed_ms,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.error, Some(EngineError::Timeout { .. }))
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}
