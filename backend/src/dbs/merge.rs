//! Last-writer-wins resolution shared by every backend.
//!
//! An incoming copy replaces the stored one wholesale when its `updatedAt` is
//! strictly greater. Equal timestamps go to whichever side the caller names as
//! the arbitration authority: a client applying the server's view prefers the
//! incoming copy, the server applying a client push keeps its own.

use super::{MergeReport, Rejected};
use chrono::{DateTime, Utc};
use shared::models::{Character, Chat, SyncPayload};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TieBreak {
    PreferIncoming,
    PreferExisting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Insert,
    Replace,
    /// Both sides already hold the same record
    Unchanged,
    KeepExisting,
}

impl Resolution {
    pub fn writes(self) -> bool {
        matches!(self, Resolution::Insert | Resolution::Replace)
    }
}

pub trait Versioned: PartialEq {
    fn updated_at(&self) -> DateTime<Utc>;
}

impl Versioned for Character {
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

impl Versioned for Chat {
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

pub fn resolve<T: Versioned>(existing: Option<&T>, incoming: &T, ties: TieBreak) -> Resolution {
    let Some(existing) = existing else {
        return Resolution::Insert;
    };
    if existing == incoming {
        return Resolution::Unchanged;
    }
    match incoming.updated_at().cmp(&existing.updated_at()) {
        std::cmp::Ordering::Greater => Resolution::Replace,
        std::cmp::Ordering::Equal if ties == TieBreak::PreferIncoming => Resolution::Replace,
        _ => Resolution::KeepExisting,
    }
}

/// The writes a merge has to perform, decided against the current contents of the store.
#[derive(Debug, Default)]
pub struct MergePlan {
    pub characters: Vec<Character>,
    pub chats: Vec<Chat>,
    pub rejected: Vec<Rejected>,
}

impl MergePlan {
    pub fn is_empty(&self) -> bool {
        self.characters.is_empty() && self.chats.is_empty()
    }

    pub fn report(&self) -> MergeReport {
        MergeReport {
            characters_written: self.characters.len(),
            chats_written: self.chats.len(),
            rejected: self.rejected.clone(),
        }
    }
}

/// Decides which incoming entities to write. Invalid entities are rejected one by one
/// and never stop the rest of the batch.
pub fn plan(
    existing_characters: &BTreeMap<Uuid, Character>,
    existing_chats: &BTreeMap<Uuid, Chat>,
    incoming: SyncPayload,
    ties: TieBreak,
) -> MergePlan {
    let mut rejected = Vec::new();
    let mut characters: BTreeMap<Uuid, Character> = BTreeMap::new();
    for mut character in incoming.characters {
        // compare what the store would hold, or a finer remote clock never settles
        character.normalize_timestamps();
        if let Err(e) = character.validate() {
            rejected.push(Rejected {
                id: character.uuid,
                reason: e.to_string(),
            });
            continue;
        }
        let current = characters
            .get(&character.uuid)
            .or_else(|| existing_characters.get(&character.uuid));
        if resolve(current, &character, ties).writes() {
            characters.insert(character.uuid, character);
        }
    }

    let mut chats: BTreeMap<Uuid, Chat> = BTreeMap::new();
    for mut chat in incoming.chats {
        chat.normalize_timestamps();
        if let Err(e) = chat.validate() {
            rejected.push(Rejected {
                id: chat.id,
                reason: e.to_string(),
            });
            continue;
        }
        let character_known = characters.contains_key(&chat.character_id)
            || existing_characters.contains_key(&chat.character_id);
        if !character_known {
            rejected.push(Rejected {
                id: chat.id,
                reason: format!("unknown character {}", chat.character_id),
            });
            continue;
        }
        let current = chats.get(&chat.id).or_else(|| existing_chats.get(&chat.id));
        if let Some(current) = current {
            if current.character_id != chat.character_id {
                rejected.push(Rejected {
                    id: chat.id,
                    reason: "chat cannot move to another character".to_string(),
                });
                continue;
            }
        }
        if resolve(current, &chat, ties).writes() {
            chats.insert(chat.id, chat);
        }
    }

    MergePlan {
        characters: characters.into_values().collect(),
        chats: chats.into_values().collect(),
        rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use shared::models::{CharacterPayload, NewCharacter};

    fn character(name: &str, updated_at: DateTime<Utc>) -> Character {
        let mut c = Character::from_new(
            NewCharacter::new(
                CharacterPayload {
                    name: name.into(),
                    ..Default::default()
                },
                None,
            ),
            updated_at,
        );
        c.updated_at = updated_at;
        c
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn unknown_ids_are_inserted() {
        let incoming = character("Ada", t0());
        assert_eq!(
            resolve(None, &incoming, TieBreak::PreferExisting),
            Resolution::Insert
        );
    }

    #[test]
    fn newer_incoming_replaces_older_existing() {
        let local = character("Ada", t0());
        let mut remote = local.clone();
        remote.name = "Ada Lovelace".into();
        remote.updated_at = t0() + Duration::seconds(1);
        assert_eq!(
            resolve(Some(&local), &remote, TieBreak::PreferExisting),
            Resolution::Replace
        );
        assert_eq!(
            resolve(Some(&remote), &local, TieBreak::PreferIncoming),
            Resolution::KeepExisting
        );
    }

    #[test]
    fn ties_follow_the_tie_break() {
        let local = character("Ada", t0());
        let mut remote = local.clone();
        remote.description = "changed elsewhere".into();
        assert_eq!(
            resolve(Some(&local), &remote, TieBreak::PreferIncoming),
            Resolution::Replace
        );
        assert_eq!(
            resolve(Some(&local), &remote, TieBreak::PreferExisting),
            Resolution::KeepExisting
        );
    }

    #[test]
    fn identical_copies_are_not_rewritten() {
        let local = character("Ada", t0());
        let remote = local.clone();
        let resolution = resolve(Some(&local), &remote, TieBreak::PreferIncoming);
        assert_eq!(resolution, Resolution::Unchanged);
        assert!(!resolution.writes());
    }

    #[test]
    fn newer_tombstone_wins_over_live_copy() {
        let local = character("Ada", t0());
        let mut tombstone = local.clone();
        tombstone.deleted_at = Some(t0() + Duration::seconds(5));
        tombstone.updated_at = t0() + Duration::seconds(5);
        assert_eq!(
            resolve(Some(&local), &tombstone, TieBreak::PreferExisting),
            Resolution::Replace
        );
    }

    fn chat_for(character_id: Uuid, updated_at: DateTime<Utc>) -> Chat {
        let mut chat = Chat::from_new(
            Uuid::new_v4(),
            shared::models::NewChat {
                character_id,
                initial_history: Vec::new(),
            },
            updated_at,
        );
        chat.updated_at = updated_at;
        chat
    }

    #[test]
    fn plan_skips_identical_and_rejects_invalid_items() {
        let ada = character("Ada", t0());
        let existing_characters = BTreeMap::from([(ada.uuid, ada.clone())]);
        let chat = chat_for(ada.uuid, t0());
        let existing_chats = BTreeMap::from([(chat.id, chat.clone())]);

        let nameless = character("  ", t0());
        let orphan = chat_for(Uuid::new_v4(), t0());
        let incoming = SyncPayload {
            characters: vec![ada.clone(), nameless.clone()],
            chats: vec![chat.clone(), orphan.clone()],
        };

        let plan = plan(
            &existing_characters,
            &existing_chats,
            incoming,
            TieBreak::PreferIncoming,
        );
        assert!(plan.is_empty());
        let rejected: Vec<Uuid> = plan.rejected.iter().map(|r| r.id).collect();
        assert_eq!(rejected, vec![nameless.uuid, orphan.id]);
    }

    #[test]
    fn plan_accepts_chats_for_characters_in_the_same_batch() {
        let ada = character("Ada", t0());
        let chat = chat_for(ada.uuid, t0());
        let incoming = SyncPayload {
            characters: vec![ada],
            chats: vec![chat],
        };
        let plan = plan(
            &BTreeMap::new(),
            &BTreeMap::new(),
            incoming,
            TieBreak::PreferExisting,
        );
        assert_eq!(plan.report().written(), 2);
        assert!(plan.rejected.is_empty());
    }

    #[test]
    fn plan_compares_at_stored_precision() {
        let stored = character("Ada", t0() + Duration::milliseconds(5));
        let mut remote = stored.clone();
        remote.updated_at = stored.updated_at + Duration::microseconds(250);
        remote.deleted_at = Some(remote.updated_at);
        let plan = plan(
            &BTreeMap::from([(stored.uuid, stored.clone())]),
            &BTreeMap::new(),
            SyncPayload {
                characters: vec![remote],
                chats: Vec::new(),
            },
            TieBreak::PreferExisting,
        );
        // the sub-millisecond bump is a tie once truncated, and the server keeps its copy
        assert!(plan.is_empty());
        assert!(plan.rejected.is_empty());
    }

    #[test]
    fn plan_refuses_to_move_a_chat() {
        let ada = character("Ada", t0());
        let grace = character("Grace", t0());
        let chat = chat_for(ada.uuid, t0());
        let mut moved = chat.clone();
        moved.character_id = grace.uuid;
        moved.updated_at = t0() + Duration::seconds(1);
        let plan = plan(
            &BTreeMap::from([(ada.uuid, ada), (grace.uuid, grace)]),
            &BTreeMap::from([(chat.id, chat)]),
            SyncPayload {
                characters: Vec::new(),
                chats: vec![moved],
            },
            TieBreak::PreferIncoming,
        );
        assert!(plan.chats.is_empty());
        assert_eq!(plan.rejected.len(), 1);
    }
}
