//! Process-local [`GameStore`] used for dry runs and tests.

use std::{sync::Arc, time::SystemTime};

use futures::future::BoxFuture;
use indexmap::IndexMap;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::{
    dao::{
        game_store::GameStore,
        models::{CloseRecord, Entry, Game, GameStatus, NewGame},
        storage::{StoreError, StoreResult},
    },
    state::{TransitionError, state_machine},
};

/// In-memory store applying the same transition rules as the durable backends.
#[derive(Clone, Default)]
pub struct MemoryGameStore {
    games: Arc<Mutex<IndexMap<Uuid, Game>>>,
}

impl MemoryGameStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored game in insertion order.
    pub async fn games(&self) -> Vec<Game> {
        self.games.lock().await.values().cloned().collect()
    }

    /// Insert a game document as-is, bypassing the open-game check.
    pub async fn insert_raw(&self, game: Game) {
        self.games.lock().await.insert(game.id, game);
    }

    async fn create(&self, new: NewGame) -> StoreResult<Game> {
        let mut games = self.games.lock().await;
        if let Some(open) = games.values().find(|game| game.status == GameStatus::Open) {
            return Err(StoreError::conflict(format!(
                "game `{}` is already open",
                open.id
            )));
        }
        let game = Game::open(new);
        games.insert(game.id, game.clone());
        debug!(game_id = %game.id, "game created in memory store");
        Ok(game)
    }

    async fn append(&self, game_id: Uuid, entry: Entry) -> StoreResult<bool> {
        let mut games = self.games.lock().await;
        let game = games
            .get_mut(&game_id)
            .ok_or_else(|| StoreError::not_found(game_id, "unknown game"))?;
        state_machine::append_entry(game, entry)
            .map_err(|err| StoreError::not_found(game_id, err.to_string()))
    }

    async fn close(
        &self,
        game_id: Uuid,
        record: CloseRecord,
        closed_at: SystemTime,
    ) -> StoreResult<bool> {
        let mut games = self.games.lock().await;
        let game = games
            .get_mut(&game_id)
            .ok_or_else(|| StoreError::not_found(game_id, "unknown game"))?;
        match state_machine::close(game, record, closed_at) {
            Ok(()) => Ok(true),
            Err(TransitionError::Invalid(_)) => Ok(false),
            Err(err @ TransitionError::UnknownWinner(_)) => {
                Err(StoreError::not_found(game_id, err.to_string()))
            }
        }
    }

    async fn fail(&self, game_id: Uuid, reason: String, at: SystemTime) -> StoreResult<()> {
        let mut games = self.games.lock().await;
        let game = games
            .get_mut(&game_id)
            .ok_or_else(|| StoreError::not_found(game_id, "unknown game"))?;
        if let Err(err) = state_machine::fail(game, reason, at) {
            debug!(game_id = %game_id, error = %err, "mark_error ignored for terminal game");
        }
        Ok(())
    }
}

impl GameStore for MemoryGameStore {
    fn find_open_game(&self) -> BoxFuture<'static, StoreResult<Option<Game>>> {
        let store = self.clone();
        Box::pin(async move {
            let games = store.games.lock().await;
            Ok(games
                .values()
                .find(|game| game.status == GameStatus::Open)
                .cloned())
        })
    }

    fn find_game(&self, id: Uuid) -> BoxFuture<'static, StoreResult<Option<Game>>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.games.lock().await.get(&id).cloned()) })
    }

    fn create_game(&self, new: NewGame) -> BoxFuture<'static, StoreResult<Game>> {
        let store = self.clone();
        Box::pin(async move { store.create(new).await })
    }

    fn append_entry(&self, game_id: Uuid, entry: Entry) -> BoxFuture<'static, StoreResult<bool>> {
        let store = self.clone();
        Box::pin(async move { store.append(game_id, entry).await })
    }

    fn close_game(
        &self,
        game_id: Uuid,
        record: CloseRecord,
        closed_at: SystemTime,
    ) -> BoxFuture<'static, StoreResult<bool>> {
        let store = self.clone();
        Box::pin(async move { store.close(game_id, record, closed_at).await })
    }

    fn mark_error(
        &self,
        game_id: Uuid,
        reason: String,
        at: SystemTime,
    ) -> BoxFuture<'static, StoreResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.fail(game_id, reason, at).await })
    }

    fn record_announcement(
        &self,
        game_id: Uuid,
        post_id: String,
    ) -> BoxFuture<'static, StoreResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            let mut games = store.games.lock().await;
            let game = games
                .get_mut(&game_id)
                .ok_or_else(|| StoreError::not_found(game_id, "unknown game"))?;
            game.announcement_post_id = Some(post_id);
            Ok(())
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StoreResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StoreResult<()>> {
        Box::pin(async { Ok(()) })
    }
}
