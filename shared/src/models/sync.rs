use super::{Character, Chat};
use serde::{Deserialize, Serialize};

/// Body of a sync push and of the server's merged reply.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    #[serde(default)]
    pub characters: Vec<Character>,
    #[serde(default)]
    pub chats: Vec<Chat>,
}

impl SyncPayload {
    pub fn is_empty(&self) -> bool {
        self.characters.is_empty() && self.chats.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
