use super::message::{ChatHistoryItem, validate_history};
use crate::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const TITLE_MAX_CHARS: usize = 40;
const UNTITLED: &str = "Untitled";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: Uuid,
    pub character_id: Uuid,
    #[serde(default)]
    /// `None` means the title is derived from the history
    pub title: Option<String>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub history: Vec<ChatHistoryItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Chat {
    pub fn from_new(id: Uuid, new: NewChat, now: DateTime<Utc>) -> Self {
        let now = crate::time::normalize(now);
        Self {
            id,
            character_id: new.character_id,
            title: None,
            archived: false,
            history: new.initial_history,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_history(&self.history)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Truncates the chat's and its messages' timestamps to the precision the stores keep.
    pub fn normalize_timestamps(&mut self) {
        use crate::time::normalize;
        self.created_at = normalize(self.created_at);
        self.updated_at = normalize(self.updated_at);
        self.deleted_at = self.deleted_at.map(normalize);
        for content in self.history.iter_mut().flat_map(|item| item.content.iter_mut()) {
            content.timestamp = normalize(content.timestamp);
        }
    }

    /// The title shown in chat lists: the stored title, else the first user message, else "Untitled".
    pub fn display_title(&self) -> String {
        let stored = self
            .title
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(|t| truncate(t, TITLE_MAX_CHARS));
        // turn 0 is the system prompt and turn 1 the greeting
        let first_user_message = || {
            self.history
                .get(2)
                .and_then(|item| item.content.first())
                .map(|c| c.content.as_str())
                .filter(|c| !c.is_empty())
                .map(|c| truncate(c, TITLE_MAX_CHARS))
        };
        stored
            .or_else(first_user_message)
            .unwrap_or_else(|| UNTITLED.to_string())
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max_chars - 1).collect();
        out.push('…');
        out
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewChat {
    pub character_id: Uuid,
    pub initial_history: Vec<ChatHistoryItem>,
}
