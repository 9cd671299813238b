#[cfg(feature = "couch-store")]
pub mod couchdb;
pub mod memory;
#[cfg(feature = "mongo-store")]
pub mod mongodb;

use std::time::SystemTime;

use crate::dao::models::{CloseRecord, Entry, Game, NewGame};
use crate::dao::storage::StoreResult;
use futures::future::BoxFuture;
use uuid::Uuid;

/// Abstraction over the persistence layer for contest games.
///
/// Every mutating call is a single conditional update on the game document, so
/// concurrent callers can never both open a game or both close the same one.
pub trait GameStore: Send + Sync {
    /// Return the single open game, if any.
    fn find_open_game(&self) -> BoxFuture<'static, StoreResult<Option<Game>>>;
    /// Load a game in any status.
    fn find_game(&self, id: Uuid) -> BoxFuture<'static, StoreResult<Option<Game>>>;
    /// Insert a new open game; fails with `Conflict` while another game is open.
    fn create_game(&self, new: NewGame) -> BoxFuture<'static, StoreResult<Game>>;
    /// Append an entry unless its dedup key is present; `false` for a duplicate.
    fn append_entry(&self, game_id: Uuid, entry: Entry) -> BoxFuture<'static, StoreResult<bool>>;
    /// Transition `OPEN -> CLOSED`; `false` if another actor already closed it.
    fn close_game(
        &self,
        game_id: Uuid,
        record: CloseRecord,
        closed_at: SystemTime,
    ) -> BoxFuture<'static, StoreResult<bool>>;
    /// Force an open game into `ERROR`; terminal games are left untouched.
    fn mark_error(
        &self,
        game_id: Uuid,
        reason: String,
        at: SystemTime,
    ) -> BoxFuture<'static, StoreResult<()>>;
    /// Remember the post that announced the result of a closed game.
    fn record_announcement(
        &self,
        game_id: Uuid,
        post_id: String,
    ) -> BoxFuture<'static, StoreResult<()>>;
    fn health_check(&self) -> BoxFuture<'static, StoreResult<()>>;
    fn try_reconnect(&self) -> BoxFuture<'static, StoreResult<()>>;
}
