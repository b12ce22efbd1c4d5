use serde::{Deserialize, Serialize};

/// Final disposition of a queued file.
///
/// Every path the worker picks up ends in exactly one of these. There is no
/// retry state: a quarantined file needs a human to fix and re-drop it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalOutcome {
    Archived,
    Quarantined,
}

impl TerminalOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalOutcome::Archived => "archived",
            TerminalOutcome::Quarantined => "quarantined",
        }
    }
}

impl std::fmt::Display for TerminalOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
