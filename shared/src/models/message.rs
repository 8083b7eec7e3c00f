use crate::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// One candidate body for a turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatContent {
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Which backend produced this candidate
    pub model_id: String,
}

impl ChatContent {
    pub fn new(
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            timestamp: crate::time::normalize(timestamp),
            model_id: model_id.into(),
        }
    }
}

/// One role-tagged turn, holding every generated alternative.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatHistoryItem {
    pub role: MessageRole,
    /// Index into `content` of the displayed candidate
    pub chosen_answer: usize,
    pub content: Vec<ChatContent>,
}

impl ChatHistoryItem {
    pub fn new(
        role: MessageRole,
        content: Vec<ChatContent>,
        chosen_answer: usize,
    ) -> Result<Self, ValidationError> {
        let item = Self {
            role,
            chosen_answer,
            content,
        };
        item.validate(0)?;
        Ok(item)
    }

    /// A turn with a single candidate.
    pub fn single(role: MessageRole, content: ChatContent) -> Self {
        Self {
            role,
            chosen_answer: 0,
            content: vec![content],
        }
    }

    /// Checks the turn invariants; `turn` is only used to label the error.
    pub fn validate(&self, turn: usize) -> Result<(), ValidationError> {
        if self.content.is_empty() {
            return Err(ValidationError::EmptyTurn { turn });
        }
        if self.chosen_answer >= self.content.len() {
            return Err(ValidationError::ChosenAnswerOutOfRange {
                turn,
                chosen: self.chosen_answer,
                len: self.content.len(),
            });
        }
        Ok(())
    }

    pub fn chosen_content(&self) -> Option<&ChatContent> {
        self.content.get(self.chosen_answer)
    }

    pub fn variant_count(&self) -> usize {
        self.content.len()
    }

    /// Append a regenerated candidate and display it.
    pub fn push_alternative(&mut self, content: ChatContent) {
        self.content.push(content);
        self.chosen_answer = self.content.len() - 1;
    }

    pub fn select(&mut self, index: usize) -> Result<(), ValidationError> {
        if index >= self.content.len() {
            return Err(ValidationError::ChosenAnswerOutOfRange {
                turn: 0,
                chosen: index,
                len: self.content.len(),
            });
        }
        self.chosen_answer = index;
        Ok(())
    }
}

/// Validates every turn of a history, reporting the first offending turn.
pub fn validate_history(history: &[ChatHistoryItem]) -> Result<(), ValidationError> {
    history
        .iter()
        .enumerate()
        .try_for_each(|(turn, item)| item.validate(turn))
}

/// Flattened turn handed to the model backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageHistoryItem {
    pub role: MessageRole,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(text: &str) -> ChatContent {
        ChatContent::new(text, Utc::now(), "model-1")
    }

    #[test]
    fn rejects_out_of_range_chosen_answer() {
        let err = ChatHistoryItem::new(MessageRole::Assistant, vec![content("a")], 1).unwrap_err();
        assert_eq!(
            err,
            ValidationError::ChosenAnswerOutOfRange {
                turn: 0,
                chosen: 1,
                len: 1
            }
        );
    }

    #[test]
    fn rejects_empty_turn() {
        let err = ChatHistoryItem::new(MessageRole::User, Vec::new(), 0).unwrap_err();
        assert_eq!(err, ValidationError::EmptyTurn { turn: 0 });
    }

    #[test]
    fn push_alternative_selects_new_candidate() {
        let mut item = ChatHistoryItem::single(MessageRole::Assistant, content("first"));
        item.push_alternative(content("second"));
        assert_eq!(item.variant_count(), 2);
        assert_eq!(item.chosen_content().map(|c| c.content.as_str()), Some("second"));
        item.select(0).unwrap();
        assert_eq!(item.chosen_content().map(|c| c.content.as_str()), Some("first"));
        assert!(item.select(2).is_err());
    }

    #[test]
    fn history_validation_names_offending_turn() {
        let good = ChatHistoryItem::single(MessageRole::System, content(""));
        let bad = ChatHistoryItem {
            role: MessageRole::User,
            chosen_answer: 3,
            content: vec![content("hi")],
        };
        assert!(validate_history(std::slice::from_ref(&good)).is_ok());
        assert!(matches!(
            validate_history(&[good, bad]),
            Err(ValidationError::ChosenAnswerOutOfRange { turn: 1, .. })
        ));
    }

    #[test]
    fn serializes_camel_case() {
        let item = ChatHistoryItem::single(MessageRole::User, content("hello"));
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["chosenAnswer"], 0);
        assert_eq!(json["content"][0]["modelId"], "model-1");
    }
}
