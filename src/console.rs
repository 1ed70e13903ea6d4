use std::sync::Mutex;

use launchbox::{CapabilityCall, CapabilityHost, CapabilityReply, HostError};

/// Capability host for the terminal front end.
///
/// The clipboard is process-local and notifications go to stderr. Anything
/// that would touch the real system is reported as unsupported.
#[derive(Debug, Default)]
pub struct ConsoleHost {
    clipboard: Mutex<String>,
}

impl ConsoleHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_clipboard(&self, text: &str) {
        let mut clipboard = self
            .clipboard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *clipboard = text.to_string();
    }
}

impl CapabilityHost for ConsoleHost {
    fn invoke(&self, plugin_id: &str, call: &CapabilityCall) -> Result<CapabilityReply, HostError> {
        let mut clipboard = self
            .clipboard
            .lock()
            .map_err(|_| HostError::Failed("clipboard lock poisoned".to_string()))?;
        match call {
            CapabilityCall::ClipboardRead => Ok(CapabilityReply::Text(clipboard.clone())),
            CapabilityCall::ClipboardWrite { text } => {
                *clipboard = text.clone();
                Ok(CapabilityReply::Done)
            }
            CapabilityCall::Notify { title, body } => {
                eprintln!("[{plugin_id}] {title}: {body}");
                Ok(CapabilityReply::Done)
            }
            other => Err(HostError::Unsupported(other.operation())),
        }
    }
}
