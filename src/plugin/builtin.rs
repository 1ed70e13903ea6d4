//! Native handlers compiled into the launcher, addressed as `builtin:<name>`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::model::result::{ResultAction, ResultItem, SearchQuery};
use crate::plugin::host_fns::PluginApi;
use crate::plugin::manifest::{BUILTIN_ENTRY_PREFIX, PluginManifest};
use crate::plugin::permission::Permission;
use crate::plugin::runtime::SearchHandler;

pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn SearchHandler> + Send + Sync>;

#[derive(Clone)]
struct BuiltinEntry {
    manifest: Option<PluginManifest>,
    factory: HandlerFactory,
}

/// Handler factories by name. Each execution gets a fresh handler.
#[derive(Clone, Default)]
pub struct BuiltinCatalog {
    entries: HashMap<String, BuiltinEntry>,
}

impl std::fmt::Debug for BuiltinCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.entries.keys().collect();
        names.sort();
        f.debug_struct("BuiltinCatalog").field("handlers", &names).finish()
    }
}

impl BuiltinCatalog {
    /// The plugins that ship with the launcher.
    pub fn bundled() -> Self {
        let mut catalog = Self::default();
        catalog.register(calculator_manifest(), || Box::new(Calculator));
        catalog.register(clipboard_manifest(), || Box::new(ClipboardTools));
        catalog
    }

    /// Register a handler together with the manifest it is installed under.
    pub fn register<F>(&mut self, manifest: PluginManifest, factory: F)
    where
        F: Fn() -> Box<dyn SearchHandler> + Send + Sync + 'static,
    {
        let name = manifest
            .entry
            .strip_prefix(BUILTIN_ENTRY_PREFIX)
            .unwrap_or(&manifest.id)
            .trim()
            .to_string();
        self.entries.insert(
            name,
            BuiltinEntry {
                manifest: Some(manifest),
                factory: Arc::new(factory),
            },
        );
    }

    /// Register a bare handler; a manifest elsewhere must point at it.
    pub fn register_handler<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn SearchHandler> + Send + Sync + 'static,
    {
        self.entries.insert(
            name.to_string(),
            BuiltinEntry {
                manifest: None,
                factory: Arc::new(factory),
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn manifest(&self, name: &str) -> Option<&PluginManifest> {
        self.entries.get(name).and_then(|entry| entry.manifest.as_ref())
    }

    pub fn instantiate(&self, name: &str) -> Option<Box<dyn SearchHandler>> {
        self.entries.get(name).map(|entry| (entry.factory)())
    }
}

fn bundled_manifest(
    id: &str,
    name: &str,
    description: &str,
    permissions: Vec<Permission>,
    triggers: &[&str],
) -> PluginManifest {
    PluginManifest {
        id: id.to_string(),
        name: name.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        description: Some(description.to_string()),
        author: Some("launchbox".to_string()),
        permissions,
        triggers: triggers.iter().map(|trigger| trigger.to_string()).collect(),
        entry: format!("{BUILTIN_ENTRY_PREFIX}{id}"),
    }
}

fn calculator_manifest() -> PluginManifest {
    bundled_manifest(
        "calculator",
        "Calculator",
        "Evaluate arithmetic expressions",
        Vec::new(),
        &["calc:"],
    )
}

fn clipboard_manifest() -> PluginManifest {
    bundled_manifest(
        "clipboard",
        "Clipboard Tools",
        "Transform the clipboard contents",
        vec![Permission::ReadClipboard],
        &["clip:"],
    )
}

struct Calculator;

impl SearchHandler for Calculator {
    fn search(&mut self, query: &SearchQuery, _api: &PluginApi) -> anyhow::Result<Vec<ResultItem>> {
        if query.term.trim().is_empty() {
            return Ok(Vec::new());
        }

        // Half-typed expressions are normal while the user is still typing.
        let Ok(value) = evaluate(&query.term) else {
            return Ok(Vec::new());
        };
        let text = format_number(value);
        Ok(vec![
            ResultItem::new("calculator:result", format!("= {text}"), ResultAction::Copy {
                text: text.clone(),
            })
            .with_description(query.term.trim().to_string())
            .with_icon("calculator"),
        ])
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Deepest nesting of parentheses, signs and exponents the parser accepts.
const MAX_NESTING: usize = 256;

/// Evaluate `+ - * / % ^`, parentheses and unary minus over f64.
pub fn evaluate(expression: &str) -> Result<f64, String> {
    let tokens = tokenize(expression)?;
    let mut parser = ExprParser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let value = parser.expression()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!("unexpected token at position {}", parser.pos));
    }
    if !value.is_finite() {
        return Err("result is not a finite number".to_string());
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Op(char),
    Open,
    Close,
}

fn tokenize(expression: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = expression.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '0'..='9' | '.' => {
                let mut literal = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        literal.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number = literal
                    .parse::<f64>()
                    .map_err(|_| format!("bad number '{literal}'"))?;
                tokens.push(Token::Number(number));
            }
            '+' | '-' | '*' | '/' | '%' | '^' => {
                tokens.push(Token::Op(c));
                chars.next();
            }
            'x' | '×' => {
                tokens.push(Token::Op('*'));
                chars.next();
            }
            '(' => {
                tokens.push(Token::Open);
                chars.next();
            }
            ')' => {
                tokens.push(Token::Close);
                chars.next();
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

struct ExprParser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl ExprParser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.peek();
        self.pos += 1;
        token
    }

    /// Run `parse` one nesting level deeper.
    fn nested(&mut self, parse: fn(&mut Self) -> Result<f64, String>) -> Result<f64, String> {
        if self.depth >= MAX_NESTING {
            return Err("expression nested too deeply".to_string());
        }
        self.depth += 1;
        let value = parse(self);
        self.depth -= 1;
        value
    }

    fn expression(&mut self) -> Result<f64, String> {
        let mut value = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            value = if op == '+' { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64, String> {
        let mut value = self.power()?;
        while let Some(Token::Op(op @ ('*' | '/' | '%'))) = self.peek() {
            self.pos += 1;
            let rhs = self.power()?;
            value = match op {
                '*' => value * rhs,
                '/' if rhs == 0.0 => return Err("division by zero".to_string()),
                '/' => value / rhs,
                _ if rhs == 0.0 => return Err("division by zero".to_string()),
                _ => value % rhs,
            };
        }
        Ok(value)
    }

    // Right-associative.
    fn power(&mut self) -> Result<f64, String> {
        let base = self.unary()?;
        if let Some(Token::Op('^')) = self.peek() {
            self.pos += 1;
            let exponent = self.nested(Self::power)?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    fn unary(&mut self) -> Result<f64, String> {
        match self.peek() {
            Some(Token::Op('-')) => {
                self.pos += 1;
                Ok(-self.nested(Self::unary)?)
            }
            Some(Token::Op('+')) => {
                self.pos += 1;
                self.nested(Self::unary)
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<f64, String> {
        match self.next() {
            Some(Token::Number(value)) => Ok(value),
            Some(Token::Open) => {
                let value = self.nested(Self::expression)?;
                match self.next() {
                    Some(Token::Close) => Ok(value),
                    _ => Err("missing ')'".to_string()),
                }
            }
            Some(token) => Err(format!("unexpected token {token:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

struct ClipboardTools;

impl SearchHandler for ClipboardTools {
    fn search(&mut self, query: &SearchQuery, api: &PluginApi) -> anyhow::Result<Vec<ResultItem>> {
        let text = api.read_clipboard()?;
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let transforms: [(&str, &str, String); 4] = [
            ("upper", "Uppercase", text.to_uppercase()),
            ("lower", "Lowercase", text.to_lowercase()),
            ("trim", "Trim whitespace", text.trim().to_string()),
            ("reverse", "Reverse", text.chars().rev().collect()),
        ];

        let filter = query.term.to_lowercase();
        Ok(transforms
            .into_iter()
            .filter(|(_, label, _)| filter.is_empty() || label.to_lowercase().contains(&filter))
            .map(|(key, label, transformed)| {
                ResultItem::new(format!("clipboard:{key}"), label, ResultAction::Copy {
                    text: transformed.clone(),
                })
                .with_description(preview(&transformed))
                .with_icon("clipboard")
            })
            .collect())
    }
}

fn preview(text: &str) -> String {
    const MAX_PREVIEW: usize = 60;
    let mut preview: String = text.chars().take(MAX_PREVIEW).collect();
    if text.chars().count() > MAX_PREVIEW {
        preview.push_str("...");
    }
    preview
}
