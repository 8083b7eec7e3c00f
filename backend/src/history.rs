//! Seeding and flattening of chat histories.

use crate::clock::Clock;
use crate::dbs::{Storage, StorageError};
use crate::model::ModelResolver;
use shared::models::{
    Character, ChatContent, ChatHistoryItem, MessageHistoryItem, MessageRole, NewChat,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StartChatError {
    #[error("No active model")]
    NoActiveModel,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Replaces the placeholders character cards use for the two speakers.
///
/// `{{original}}` expands to `original`, the text before any substitution.
pub fn substitute_params(content: &str, user: &str, character: &str, original: &str) -> String {
    content
        .replace("{{user}}", user)
        .replace("{{char}}", character)
        .replace("{{Char}}", character)
        .replace("<BOT>", character)
        .replace("<USER>", user)
        .replace("{{original}}", original)
}

/// The opening turns of a new chat with `character`: the system prompt and, when the
/// character has any, the greetings as alternatives of one assistant turn.
pub fn build_initial_history(
    character: &Character,
    user_name: &str,
    model_id: &str,
    clock: &dyn Clock,
) -> Vec<ChatHistoryItem> {
    let now = clock.now();
    let content = |text: &str| {
        ChatContent::new(
            substitute_params(text, user_name, &character.name, text),
            now,
            model_id,
        )
    };

    let system: String = [
        &character.system_prompt,
        &character.personality,
        &character.description,
    ]
    .into_iter()
    .filter(|s| !s.trim().is_empty())
    .map(|s| format!("{s}\n\n"))
    .collect();

    let mut history = vec![ChatHistoryItem::single(MessageRole::System, content(&system))];
    if !character.first_messages.is_empty() {
        history.push(ChatHistoryItem {
            role: MessageRole::Assistant,
            chosen_answer: 0,
            content: character.first_messages.iter().map(|m| content(m)).collect(),
        });
    }
    history
}

/// Chosen text of every turn, in order, as handed to a completion backend.
pub fn to_completion_messages(history: &[ChatHistoryItem]) -> Vec<MessageHistoryItem> {
    history
        .iter()
        .filter_map(|item| {
            let chosen = item.chosen_content()?;
            (!chosen.content.is_empty()).then(|| MessageHistoryItem {
                role: item.role,
                content: chosen.content.clone(),
            })
        })
        .collect()
}

/// Returns the character's first chat, creating one seeded with the greeting when it has none.
pub async fn open_or_start_chat(
    storage: &dyn Storage,
    models: &dyn ModelResolver,
    clock: &dyn Clock,
    character_id: Uuid,
) -> Result<Uuid, StartChatError> {
    let chats = storage.list_chats_for_character(character_id, None).await?;
    if let Some(chat) = chats.first() {
        return Ok(chat.id);
    }

    let config = storage.get_config().await?;
    let model = models
        .active_model(&config)
        .await
        .ok_or(StartChatError::NoActiveModel)?;
    let character = storage
        .get_character(character_id)
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("Character {character_id}")))?;

    let initial_history = build_initial_history(&character, &config.user_name, &model, clock);
    let id = storage
        .save_new_chat(NewChat {
            character_id,
            initial_history,
        })
        .await?;
    tracing::info!(%character_id, chat_id = %id, "started new chat");
    Ok(id)
}
