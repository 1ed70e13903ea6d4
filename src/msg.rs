/// All possible messages that drive state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Msg {
    /// A plain line: dispatched to plugins as a search query.
    Query(String),
    /// A line starting with `:`, without the colon.
    Command(String),
    Quit,
}

impl Msg {
    pub fn from_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match line.strip_prefix(':') {
            Some("q" | "quit") => Some(Self::Quit),
            Some(command) => Some(Self::Command(command.trim().to_string())),
            None => Some(Self::Query(line.to_string())),
        }
    }
}
