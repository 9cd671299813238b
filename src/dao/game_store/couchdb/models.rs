use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dao::{
    game_store::couchdb::error::CouchDaoError,
    models::{Entry, Game, GameStatus, GameType},
};

pub const GAME_PREFIX: &str = "game::";
/// Versioned pointer to the currently open game.
pub const OPEN_SLOT_DOC_ID: &str = "lifecycle::open_slot";

#[derive(Debug, Deserialize)]
pub struct PutResponse {
    pub rev: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouchGameDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(flatten)]
    pub game: GameBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameBody {
    pub status: GameStatus,
    pub game_type: GameType,
    pub prompt_text: String,
    pub post_id: String,
    pub opened_at: SystemTime,
    pub closes_at: SystemTime,
    pub entries: Vec<Entry>,
    pub winner_entry_id: Option<String>,
    pub judge_reasoning: Option<String>,
    pub closed_at: Option<SystemTime>,
    pub error_reason: Option<String>,
    pub announcement_post_id: Option<String>,
}

impl From<(Game, Option<String>)> for CouchGameDocument {
    fn from((game, rev): (Game, Option<String>)) -> Self {
        Self {
            id: game_doc_id(game.id),
            rev,
            game: GameBody {
                status: game.status,
                game_type: game.game_type,
                prompt_text: game.prompt_text,
                post_id: game.post_id,
                opened_at: game.opened_at,
                closes_at: game.closes_at,
                entries: game.entries,
                winner_entry_id: game.winner_entry_id,
                judge_reasoning: game.judge_reasoning,
                closed_at: game.closed_at,
                error_reason: game.error_reason,
                announcement_post_id: game.announcement_post_id,
            },
        }
    }
}

impl CouchGameDocument {
    /// Split the document into its entity and the revision it was read at.
    pub fn into_entity(self) -> Result<(Game, Option<String>), CouchDaoError> {
        let id = extract_uuid(&self.id)?;
        let body = self.game;
        let game = Game {
            id,
            status: body.status,
            game_type: body.game_type,
            prompt_text: body.prompt_text,
            post_id: body.post_id,
            opened_at: body.opened_at,
            closes_at: body.closes_at,
            entries: body.entries,
            winner_entry_id: body.winner_entry_id,
            judge_reasoning: body.judge_reasoning,
            closed_at: body.closed_at,
            error_reason: body.error_reason,
            announcement_post_id: body.announcement_post_id,
        };
        Ok((game, self.rev))
    }
}

/// Singleton document naming the open game; claimed with a revision-checked write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpenSlotDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub game_id: Option<Uuid>,
    /// When the current holder claimed the slot.
    #[serde(default)]
    pub claimed_at: Option<SystemTime>,
}

impl OpenSlotDocument {
    pub fn new(rev: Option<String>, game_id: Option<Uuid>, claimed_at: Option<SystemTime>) -> Self {
        Self {
            id: OPEN_SLOT_DOC_ID.to_owned(),
            rev,
            game_id,
            claimed_at,
        }
    }

    /// Whether the slot names `game_id`.
    pub fn held_by(&self, game_id: Uuid) -> bool {
        self.game_id == Some(game_id)
    }

    /// Whether the claim is younger than `stale_after` at `now`.
    pub fn claim_is_fresh(&self, now: SystemTime, stale_after: Duration) -> bool {
        self.claimed_at.is_some_and(|claimed_at| {
            now.duration_since(claimed_at).unwrap_or_default() < stale_after
        })
    }
}

pub fn game_doc_id(id: Uuid) -> String {
    format!("{}{}", GAME_PREFIX, id)
}

pub fn extract_uuid(doc_id: &str) -> Result<Uuid, CouchDaoError> {
    let (_, id) = doc_id
        .split_once("::")
        .ok_or_else(|| CouchDaoError::InvalidDocId {
            doc_id: doc_id.to_string(),
            kind: "missing separator",
        })?;

    Uuid::parse_str(id).map_err(|_| CouchDaoError::InvalidDocId {
        doc_id: doc_id.to_string(),
        kind: "invalid UUID",
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::dao::models::NewGame;

    #[test]
    fn game_document_keeps_revision_and_fields() {
        let now = SystemTime::now();
        let game = Game::open(NewGame {
            game_type: GameType::AbstractPoetry,
            prompt_text: "finish the poem".into(),
            post_id: "99".into(),
            opened_at: now,
            closes_at: now + Duration::from_secs(90),
        });

        let document = CouchGameDocument::from((game.clone(), Some("3-abc".into())));
        let encoded = serde_json::to_value(&document).unwrap();
        assert_eq!(encoded["_rev"], json!("3-abc"));
        assert_eq!(encoded["status"], json!("OPEN"));
        assert_eq!(encoded["game_type"], json!("abstract_poetry"));

        let decoded: CouchGameDocument = serde_json::from_value(encoded).unwrap();
        let (restored, rev) = decoded.into_entity().unwrap();
        assert_eq!(restored, game);
        assert_eq!(rev.as_deref(), Some("3-abc"));
    }

    #[test]
    fn new_documents_omit_revision() {
        let slot = OpenSlotDocument::new(None, None, None);
        let encoded = serde_json::to_value(&slot).unwrap();
        assert!(encoded.get("_rev").is_none());
        assert_eq!(encoded["_id"], json!(OPEN_SLOT_DOC_ID));
    }

    #[test]
    fn slot_claims_go_stale() {
        let game_id = Uuid::new_v4();
        let claimed_at = SystemTime::now();
        let slot = OpenSlotDocument::new(Some("3-a".into()), Some(game_id), Some(claimed_at));
        let stale_after = Duration::from_secs(60);

        assert!(slot.held_by(game_id));
        assert!(!slot.held_by(Uuid::new_v4()));
        assert!(slot.claim_is_fresh(claimed_at + Duration::from_secs(59), stale_after));
        assert!(!slot.claim_is_fresh(claimed_at + Duration::from_secs(60), stale_after));
        // A clock that went backwards keeps the claim alive.
        assert!(slot.claim_is_fresh(claimed_at - Duration::from_secs(5), stale_after));

        let empty = OpenSlotDocument::new(None, None, None);
        assert!(!empty.held_by(game_id));
        assert!(!empty.claim_is_fresh(claimed_at, stale_after));
    }

    #[test]
    fn doc_ids_must_carry_a_uuid() {
        assert!(extract_uuid("game::not-a-uuid").is_err());
        assert!(extract_uuid("no-separator").is_err());
        let id = Uuid::new_v4();
        assert_eq!(extract_uuid(&game_doc_id(id)).unwrap(), id);
    }
}
