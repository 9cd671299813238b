use std::time::SystemTime;

use thiserror::Error;

use crate::dao::models::{CloseRecord, Entry, Game, GameStatus};

/// Phase of the contest lifecycle as seen by one controller tick.
///
/// Derived fresh from the store on every tick; nothing is cached between ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecyclePhase {
    /// No game has `status = OPEN`.
    NoOpenGame,
    /// A game is open and still accepting entries.
    Collecting(Game),
    /// A game is open and its deadline has passed.
    DueForClose(Game),
}

impl LifecyclePhase {
    /// Derive the phase from the store's open game and the current time.
    pub fn derive(open_game: Option<Game>, now: SystemTime) -> Self {
        match open_game {
            None => LifecyclePhase::NoOpenGame,
            Some(game) if game.is_due(now) => LifecyclePhase::DueForClose(game),
            Some(game) => LifecyclePhase::Collecting(game),
        }
    }

    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            LifecyclePhase::NoOpenGame => "no_open_game",
            LifecyclePhase::Collecting(_) => "open_pending_close",
            LifecyclePhase::DueForClose(_) => "due_for_close",
        }
    }
}

/// Events that move a persisted game between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    /// Append a new entry.
    AppendEntry,
    /// Close, with or without a winner.
    Close,
    /// Escalate to the error status.
    Fail,
}

/// Error returned when attempting to apply an invalid transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    /// Status the game was in when the event was received.
    pub from: GameStatus,
    /// The event that cannot be applied from this status.
    pub event: StatusEvent,
}

/// Errors raised when mutating a game document in place.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// Status does not allow the event.
    #[error(transparent)]
    Invalid(#[from] InvalidTransition),
    /// The winner id names no entry of the game.
    #[error("winner `{0}` is not an entry of this game")]
    UnknownWinner(String),
}

/// Compute the status reached by applying `event` to `from`.
pub fn next_status(from: GameStatus, event: StatusEvent) -> Result<GameStatus, InvalidTransition> {
    match (from, event) {
        (GameStatus::Open, StatusEvent::AppendEntry) => Ok(GameStatus::Open),
        (GameStatus::Open, StatusEvent::Close) => Ok(GameStatus::Closed),
        (GameStatus::Open, StatusEvent::Fail) => Ok(GameStatus::Error),
        (from, event) => Err(InvalidTransition { from, event }),
    }
}

/// Append `entry` unless its dedup key is already present.
///
/// Returns `Ok(false)` for a duplicate.
pub fn append_entry(game: &mut Game, entry: Entry) -> Result<bool, InvalidTransition> {
    next_status(game.status, StatusEvent::AppendEntry)?;
    if game.contains_entry(&entry) {
        return Ok(false);
    }
    game.entries.push(entry);
    Ok(true)
}

/// Close an open game, recording the winner and the close timestamp.
pub fn close(game: &mut Game, record: CloseRecord, at: SystemTime) -> Result<(), TransitionError> {
    let next = next_status(game.status, StatusEvent::Close)?;
    if let Some(winner) = record.winner_entry_id.as_deref() {
        if game.entry(winner).is_none() {
            return Err(TransitionError::UnknownWinner(winner.to_owned()));
        }
    }
    game.status = next;
    game.winner_entry_id = record.winner_entry_id;
    game.judge_reasoning = record.judge_reasoning;
    game.closed_at = Some(at);
    Ok(())
}

/// Force an open game into the error status.
pub fn fail(game: &mut Game, reason: String, at: SystemTime) -> Result<(), InvalidTransition> {
    game.status = next_status(game.status, StatusEvent::Fail)?;
    game.error_reason = Some(reason);
    game.closed_at = Some(at);
    Ok(())
}
