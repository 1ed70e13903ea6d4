//! Permission tokens and the capability gate.
//!
//! The gate maps an operation to the permission it needs. Operations without
//! a required permission are non-privileged and always authorised; every
//! sensitive operation is default-deny.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ReadClipboard,
    WriteClipboard,
    ReadFile,
    WriteFile,
    Network,
    Shell,
    Notification,
}

impl Permission {
    pub const ALL: [Self; 7] = [
        Self::ReadClipboard,
        Self::WriteClipboard,
        Self::ReadFile,
        Self::WriteFile,
        Self::Network,
        Self::Shell,
        Self::Notification,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReadClipboard => "read_clipboard",
            Self::WriteClipboard => "write_clipboard",
            Self::ReadFile => "read_file",
            Self::WriteFile => "write_file",
            Self::Network => "network",
            Self::Shell => "shell",
            Self::Notification => "notification",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|permission| permission.as_str() == name.trim())
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations a plugin can ask the capability host to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ClipboardRead,
    ClipboardWrite,
    FileRead,
    FileWrite,
    HttpRequest,
    ShellExec,
    Notify,
}

impl Operation {
    pub const ALL: [Self; 7] = [
        Self::ClipboardRead,
        Self::ClipboardWrite,
        Self::FileRead,
        Self::FileWrite,
        Self::HttpRequest,
        Self::ShellExec,
        Self::Notify,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClipboardRead => "clipboard-read",
            Self::ClipboardWrite => "clipboard-write",
            Self::FileRead => "file-read",
            Self::FileWrite => "file-write",
            Self::HttpRequest => "http-request",
            Self::ShellExec => "shell-exec",
            Self::Notify => "notify",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == name)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permission required for `operation`, or `None` when it is non-privileged.
pub const fn required_permission(operation: Operation) -> Option<Permission> {
    match operation {
        Operation::ClipboardRead => Some(Permission::ReadClipboard),
        Operation::ClipboardWrite => Some(Permission::WriteClipboard),
        Operation::FileRead => Some(Permission::ReadFile),
        Operation::FileWrite => Some(Permission::WriteFile),
        Operation::HttpRequest => Some(Permission::Network),
        Operation::ShellExec => Some(Permission::Shell),
        Operation::Notify => None,
    }
}

pub fn is_authorized(permissions: &HashSet<Permission>, operation: Operation) -> bool {
    required_permission(operation).is_none_or(|permission| permissions.contains(&permission))
}
