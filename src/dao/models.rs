use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Persisted lifecycle status of a game.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameStatus {
    /// Accepting entries until `closes_at`.
    Open,
    /// Terminal: closed with or without a winner.
    Closed,
    /// Terminal: the controller could not finish the game safely.
    Error,
}

impl GameStatus {
    /// Wire representation shared by every backend.
    pub fn as_str(self) -> &'static str {
        match self {
            GameStatus::Open => "OPEN",
            GameStatus::Closed => "CLOSED",
            GameStatus::Error => "ERROR",
        }
    }

    /// Parse the wire representation produced by [`GameStatus::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "OPEN" => Some(GameStatus::Open),
            "CLOSED" => Some(GameStatus::Closed),
            "ERROR" => Some(GameStatus::Error),
            _ => None,
        }
    }

    /// Whether no further transition is allowed.
    pub fn is_terminal(self) -> bool {
        !matches!(self, GameStatus::Open)
    }
}

/// Flavour of contest, selecting the prompt body and the judging instructions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GameType {
    /// Share a little-known fact.
    FunFact,
    /// Tell a story with emojis only.
    EmojiStory,
    /// Best joke wins.
    BestJoke,
    /// Random pick among submitted wallets.
    RandomWallet,
    /// Continue a story opening.
    ImprovStory,
    /// Continue a poem opening.
    AbstractPoetry,
    /// Propose a challenge.
    CreativeChallenge,
}

impl GameType {
    /// Every game type, in catalog order.
    pub const ALL: [GameType; 7] = [
        GameType::FunFact,
        GameType::EmojiStory,
        GameType::BestJoke,
        GameType::RandomWallet,
        GameType::ImprovStory,
        GameType::AbstractPoetry,
        GameType::CreativeChallenge,
    ];
}

/// Identifier of an entry: the external reply id.
pub type EntryId = String;

/// Candidate contest submission derived from a social reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entry {
    /// Account that authored the reply.
    pub author_id: String,
    /// Handle of the author when the feed provided one.
    #[serde(default)]
    pub author_username: Option<String>,
    /// Identifier of the reply on the social platform.
    pub external_id: EntryId,
    /// Reply body.
    pub text: String,
    /// When the reply was published.
    pub submitted_at: SystemTime,
    /// Result of validation.
    pub valid: bool,
    /// Wallet address found in the text, when the wallet rule is active.
    #[serde(default)]
    pub wallet: Option<String>,
    /// Why validation failed.
    #[serde(default)]
    pub rejection: Option<String>,
}

impl Entry {
    /// Natural deduplication key: (author, reply id).
    pub fn dedup_key(&self) -> (&str, &str) {
        (&self.author_id, &self.external_id)
    }
}

/// Game document persisted by the storage layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Game {
    /// Primary key of the game.
    pub id: Uuid,
    /// Current lifecycle status.
    pub status: GameStatus,
    /// Contest flavour.
    pub game_type: GameType,
    /// Posted prompt.
    pub prompt_text: String,
    /// Identifier of the posted prompt.
    pub post_id: String,
    /// When the game opened.
    pub opened_at: SystemTime,
    /// When the game becomes due for closing.
    pub closes_at: SystemTime,
    /// Entries in arrival order.
    pub entries: Vec<Entry>,
    /// Winning entry, set once on close.
    pub winner_entry_id: Option<EntryId>,
    /// Judge explanation kept for audit.
    pub judge_reasoning: Option<String>,
    /// Set once on the terminal transition.
    pub closed_at: Option<SystemTime>,
    /// Reason recorded with the `ERROR` status.
    pub error_reason: Option<String>,
    /// Result announcement posted after close.
    pub announcement_post_id: Option<String>,
}

impl Game {
    /// Build a freshly opened game from its creation request.
    pub fn open(new: NewGame) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: GameStatus::Open,
            game_type: new.game_type,
            prompt_text: new.prompt_text,
            post_id: new.post_id,
            opened_at: new.opened_at,
            closes_at: new.closes_at,
            entries: Vec::new(),
            winner_entry_id: None,
            judge_reasoning: None,
            closed_at: None,
            error_reason: None,
            announcement_post_id: None,
        }
    }

    /// Look up an entry by its id.
    pub fn entry(&self, id: &str) -> Option<&Entry> {
        self.entries.iter().find(|entry| entry.external_id == id)
    }

    /// Whether an entry with the same dedup key is already recorded.
    pub fn contains_entry(&self, entry: &Entry) -> bool {
        self.entries
            .iter()
            .any(|existing| existing.dedup_key() == entry.dedup_key())
    }

    /// Whether the game is due for closing at `now`.
    pub fn is_due(&self, now: SystemTime) -> bool {
        now >= self.closes_at
    }
}

/// Creation request for [`crate::dao::game_store::GameStore::create_game`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGame {
    /// Contest flavour.
    pub game_type: GameType,
    /// Posted prompt.
    pub prompt_text: String,
    /// Identifier of the posted prompt.
    pub post_id: String,
    /// Opening timestamp.
    pub opened_at: SystemTime,
    /// Closing deadline.
    pub closes_at: SystemTime,
}

/// Outcome recorded by [`crate::dao::game_store::GameStore::close_game`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseRecord {
    /// Winning entry, if any.
    pub winner_entry_id: Option<EntryId>,
    /// Judge explanation.
    pub judge_reasoning: Option<String>,
}

/// Drop sub-millisecond precision so timestamps survive every backend unchanged.
pub fn truncate_to_millis(at: SystemTime) -> SystemTime {
    let since_epoch = at.duration_since(UNIX_EPOCH).unwrap_or_default();
    UNIX_EPOCH + Duration::from_millis(since_epoch.as_millis() as u64)
}
