//! Conversation types — roles, turns, and the universal export view.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Role of a conversation participant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One message in a conversation. Immutable once committed: the engine only
/// ever appends turns or drops them from the tail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    /// RFC 3339 creation time.
    pub timestamp: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Text fragment in the universal export shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportPart {
    pub text: String,
}

/// Read-only turn view handed to downstream consumers (audio/export):
/// `{role, parts: [{text}]}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportTurn {
    pub role: Role,
    pub parts: Vec<ExportPart>,
}

impl From<&Turn> for ExportTurn {
    fn from(turn: &Turn) -> Self {
        Self {
            role: turn.role,
            parts: vec![ExportPart {
                text: turn.text.clone(),
            }],
        }
    }
}

/// Convert a history into the universal export shape.
pub fn export_view(history: &[Turn]) -> Vec<ExportTurn> {
    history.iter().map(ExportTurn::from).collect()
}
