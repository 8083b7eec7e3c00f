use crate::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Character {
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub first_messages: Vec<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    /// Remote URI or local asset path of the avatar image
    pub avatar: Option<String>,
    #[serde(default)]
    /// Where an imported character came from
    pub source_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Set when the character was deleted while sync was enabled
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    /// Non-archived chats, computed on read and never stored
    pub chat_count: usize,
}

// `chat_count` is derived, so two copies of the same stored record compare equal
// whatever count each was read with.
impl PartialEq for Character {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
            && self.name == other.name
            && self.description == other.description
            && self.personality == other.personality
            && self.first_messages == other.first_messages
            && self.tags == other.tags
            && self.system_prompt == other.system_prompt
            && self.avatar == other.avatar
            && self.source_url == other.source_url
            && self.created_at == other.created_at
            && self.updated_at == other.updated_at
            && self.deleted_at == other.deleted_at
    }
}

impl Character {
    pub fn from_new(new: NewCharacter, now: DateTime<Utc>) -> Self {
        let now = crate::time::normalize(now);
        let NewCharacter {
            uuid,
            source_url,
            payload,
        } = new;
        Self {
            uuid,
            name: payload.name,
            description: payload.description,
            personality: payload.personality,
            first_messages: payload.first_messages,
            tags: payload.tags,
            system_prompt: payload.system_prompt,
            avatar: payload.avatar,
            source_url,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            chat_count: 0,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_name(&self.name)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Truncates every timestamp to the precision the stores keep.
    pub fn normalize_timestamps(&mut self) {
        use crate::time::normalize;
        self.created_at = normalize(self.created_at);
        self.updated_at = normalize(self.updated_at);
        self.deleted_at = self.deleted_at.map(normalize);
    }
}

/// Persona fields as delivered by an external character source.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CharacterPayload {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default, alias = "first_messages")]
    pub first_messages: Vec<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default, alias = "system_prompt")]
    pub system_prompt: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

/// A character about to be inserted. The caller mints `uuid` so a retried insert stays idempotent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCharacter {
    pub uuid: Uuid,
    pub source_url: Option<String>,
    pub payload: CharacterPayload,
}

impl NewCharacter {
    pub fn new(payload: CharacterPayload, source_url: Option<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            source_url,
            payload,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_name(&self.payload.name)
    }
}

fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        Err(ValidationError::EmptyName)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(name: &str) -> CharacterPayload {
        CharacterPayload {
            name: name.to_string(),
            first_messages: vec!["Hi".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn blank_names_are_rejected() {
        assert_eq!(
            NewCharacter::new(payload("   "), None).validate(),
            Err(ValidationError::EmptyName)
        );
        assert!(NewCharacter::new(payload("Ada"), None).validate().is_ok());
    }

    #[test]
    fn from_new_keeps_caller_identity() {
        let new = NewCharacter::new(payload("Ada"), Some("https://example.com/ada".into()));
        let uuid = new.uuid;
        let character = Character::from_new(new, Utc::now());
        assert_eq!(character.uuid, uuid);
        assert_eq!(character.created_at, character.updated_at);
        assert_eq!(character.source_url.as_deref(), Some("https://example.com/ada"));
        assert_eq!(character.chat_count, 0);
    }

    #[test]
    fn equality_ignores_chat_count() {
        let mut a = Character::from_new(NewCharacter::new(payload("Ada"), None), Utc::now());
        let b = a.clone();
        a.chat_count = 7;
        assert_eq!(a, b);
        a.name = "Grace".into();
        assert_ne!(a, b);
    }

    #[test]
    fn payload_accepts_snake_case_card_fields() {
        let json = r#"{"name":"Ada","first_messages":["Hello"],"system_prompt":"Be kind"}"#;
        let payload: CharacterPayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.first_messages, vec!["Hello".to_string()]);
        assert_eq!(payload.system_prompt, "Be kind");
    }
}
