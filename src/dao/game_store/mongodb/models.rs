use mongodb::bson::{DateTime, Document, doc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::MongoDaoError;
use crate::dao::models::{Entry, Game, GameStatus, GameType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoGameDocument {
    #[serde(rename = "_id")]
    id: String,
    status: GameStatus,
    game_type: GameType,
    prompt_text: String,
    post_id: String,
    opened_at: DateTime,
    closes_at: DateTime,
    entries: Vec<MongoEntryDocument>,
    winner_entry_id: Option<String>,
    judge_reasoning: Option<String>,
    closed_at: Option<DateTime>,
    error_reason: Option<String>,
    announcement_post_id: Option<String>,
    /// Store metadata, not part of the game entity.
    updated_at: DateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoEntryDocument {
    author_id: String,
    author_username: Option<String>,
    external_id: String,
    text: String,
    submitted_at: DateTime,
    valid: bool,
    wallet: Option<String>,
    rejection: Option<String>,
}

impl From<Game> for MongoGameDocument {
    fn from(value: Game) -> Self {
        Self {
            id: value.id.to_string(),
            status: value.status,
            game_type: value.game_type,
            prompt_text: value.prompt_text,
            post_id: value.post_id,
            opened_at: DateTime::from_system_time(value.opened_at),
            closes_at: DateTime::from_system_time(value.closes_at),
            entries: value.entries.into_iter().map(Into::into).collect(),
            winner_entry_id: value.winner_entry_id,
            judge_reasoning: value.judge_reasoning,
            closed_at: value.closed_at.map(DateTime::from_system_time),
            error_reason: value.error_reason,
            announcement_post_id: value.announcement_post_id,
            updated_at: DateTime::now(),
        }
    }
}

impl TryFrom<MongoGameDocument> for Game {
    type Error = MongoDaoError;

    fn try_from(value: MongoGameDocument) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&value.id).map_err(|err| MongoDaoError::CorruptDocument {
            id: value.id.clone(),
            reason: err.to_string(),
        })?;
        Ok(Self {
            id,
            status: value.status,
            game_type: value.game_type,
            prompt_text: value.prompt_text,
            post_id: value.post_id,
            opened_at: value.opened_at.to_system_time(),
            closes_at: value.closes_at.to_system_time(),
            entries: value.entries.into_iter().map(Into::into).collect(),
            winner_entry_id: value.winner_entry_id,
            judge_reasoning: value.judge_reasoning,
            closed_at: value.closed_at.map(|at| at.to_system_time()),
            error_reason: value.error_reason,
            announcement_post_id: value.announcement_post_id,
        })
    }
}

impl From<Entry> for MongoEntryDocument {
    fn from(value: Entry) -> Self {
        Self {
            author_id: value.author_id,
            author_username: value.author_username,
            external_id: value.external_id,
            text: value.text,
            submitted_at: DateTime::from_system_time(value.submitted_at),
            valid: value.valid,
            wallet: value.wallet,
            rejection: value.rejection,
        }
    }
}

impl From<MongoEntryDocument> for Entry {
    fn from(value: MongoEntryDocument) -> Self {
        Self {
            author_id: value.author_id,
            author_username: value.author_username,
            external_id: value.external_id,
            text: value.text,
            submitted_at: value.submitted_at.to_system_time(),
            valid: value.valid,
            wallet: value.wallet,
            rejection: value.rejection,
        }
    }
}

impl MongoEntryDocument {
    /// Embedded document pushed onto `entries`.
    pub fn to_document(&self) -> Document {
        doc! {
            "author_id": self.author_id.clone(),
            "author_username": self.author_username.clone(),
            "external_id": self.external_id.clone(),
            "text": self.text.clone(),
            "submitted_at": self.submitted_at,
            "valid": self.valid,
            "wallet": self.wallet.clone(),
            "rejection": self.rejection.clone(),
        }
    }

    /// Filter matching an embedded entry with the same dedup key.
    pub fn dedup_filter(&self) -> Document {
        doc! {
            "author_id": self.author_id.clone(),
            "external_id": self.external_id.clone(),
        }
    }
}

pub fn doc_id(id: Uuid) -> Document {
    doc! {"_id": id.to_string()}
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::*;
    use crate::dao::models::{NewGame, truncate_to_millis};

    #[test]
    fn game_survives_document_round_trip() {
        let now = truncate_to_millis(SystemTime::now());
        let mut game = Game::open(NewGame {
            game_type: GameType::EmojiStory,
            prompt_text: "tell a story with emojis".into(),
            post_id: "1850000000000000000".into(),
            opened_at: now,
            closes_at: now + Duration::from_secs(3600),
        });
        game.entries.push(Entry {
            author_id: "42".into(),
            author_username: Some("storyteller".into()),
            external_id: "1850000000000000001".into(),
            text: "🐉🏰👸".into(),
            submitted_at: now + Duration::from_millis(1500),
            valid: true,
            wallet: None,
            rejection: None,
        });
        game.status = GameStatus::Closed;
        game.winner_entry_id = Some("1850000000000000001".into());
        game.closed_at = Some(now + Duration::from_secs(3600));

        let document: MongoGameDocument = game.clone().into();
        let restored = Game::try_from(document).unwrap();
        assert_eq!(restored, game);
    }

    #[test]
    fn malformed_id_is_reported() {
        let now = SystemTime::now();
        let mut document: MongoGameDocument = Game::open(NewGame {
            game_type: GameType::BestJoke,
            prompt_text: String::new(),
            post_id: String::new(),
            opened_at: now,
            closes_at: now,
        })
        .into();
        document.id = "not-a-uuid".into();

        let err = Game::try_from(document).unwrap_err();
        assert!(matches!(err, MongoDaoError::CorruptDocument { .. }));
    }
}
