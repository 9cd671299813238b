use std::{sync::Arc, time::SystemTime};

use futures::future::BoxFuture;
use mongodb::{
    Client, Collection, Database,
    bson::{DateTime, doc},
    error::{Error as MongoError, ErrorKind, WriteFailure},
    options::IndexOptions,
};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    config::MongoConfig,
    connection::establish_connection,
    error::{MongoDaoError, MongoResult},
    models::{MongoEntryDocument, MongoGameDocument, doc_id},
};
use crate::dao::{
    game_store::GameStore,
    models::{CloseRecord, Entry, Game, GameStatus, NewGame},
    storage::{StoreError, StoreResult},
};

const GAME_COLLECTION_NAME: &str = "games";
const SINGLE_OPEN_GAME_INDEX: &str = "single_open_game_idx";
const DUPLICATE_KEY_CODE: i32 = 11000;

/// MongoDB-backed [`GameStore`] relying on single-document conditional updates.
#[derive(Clone)]
pub struct MongoGameStore {
    inner: Arc<MongoInner>,
}

struct MongoInner {
    state: RwLock<MongoState>,
    config: MongoConfig,
}

struct MongoState {
    client: Client,
    database: Database,
}

impl MongoInner {
    async fn ping(&self) -> MongoResult<()> {
        let database = {
            let guard = self.state.read().await;
            guard.database.clone()
        };

        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|source| MongoDaoError::HealthPing { source })?;
        Ok(())
    }

    async fn reconnect(&self) -> MongoResult<()> {
        let (client, database) =
            establish_connection(&self.config.options, &self.config.database_name).await?;
        let mut guard = self.state.write().await;
        guard.client = client;
        guard.database = database;
        info!("MongoDB connection re-established");
        Ok(())
    }
}

fn is_duplicate_key(err: &MongoError) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write)) if write.code == DUPLICATE_KEY_CODE
    )
}

fn game_error(operation: &'static str, id: Uuid) -> impl FnOnce(MongoError) -> MongoDaoError {
    move |source| MongoDaoError::GameOperation {
        operation,
        id: id.to_string(),
        source,
    }
}

impl MongoGameStore {
    /// Establish a connection to MongoDB and ensure indexes are present.
    pub async fn connect(config: MongoConfig) -> MongoResult<Self> {
        let (client, database) =
            establish_connection(&config.options, &config.database_name).await?;

        let inner = Arc::new(MongoInner {
            state: RwLock::new(MongoState { client, database }),
            config,
        });

        let store = Self { inner };
        store.ensure_indexes().await?;
        Ok(store)
    }

    /// A unique index restricted to open games makes a second open game a
    /// duplicate-key violation.
    async fn ensure_indexes(&self) -> MongoResult<()> {
        let collection = self.collection().await;
        let index = mongodb::IndexModel::builder()
            .keys(doc! {"status": 1})
            .options(
                IndexOptions::builder()
                    .name(Some(SINGLE_OPEN_GAME_INDEX.to_owned()))
                    .unique(Some(true))
                    .partial_filter_expression(Some(doc! {"status": GameStatus::Open.as_str()}))
                    .build(),
            )
            .build();

        collection
            .create_index(index)
            .await
            .map_err(|source| MongoDaoError::EnsureIndex {
                collection: GAME_COLLECTION_NAME,
                index: SINGLE_OPEN_GAME_INDEX,
                source,
            })?;

        Ok(())
    }

    async fn collection(&self) -> Collection<MongoGameDocument> {
        let guard = self.inner.state.read().await;
        guard
            .database
            .collection::<MongoGameDocument>(GAME_COLLECTION_NAME)
    }

    async fn load(&self, id: Uuid) -> StoreResult<Option<Game>> {
        let document = self
            .collection()
            .await
            .find_one(doc_id(id))
            .await
            .map_err(game_error("load", id))?;

        match document {
            Some(document) => Ok(Some(Game::try_from(document)?)),
            None => Ok(None),
        }
    }

    async fn find_open_game(&self) -> StoreResult<Option<Game>> {
        let document = self
            .collection()
            .await
            .find_one(doc! {"status": GameStatus::Open.as_str()})
            .await
            .map_err(|source| MongoDaoError::FindOpenGame { source })?;

        match document {
            Some(document) => Ok(Some(Game::try_from(document)?)),
            None => Ok(None),
        }
    }

    async fn create_game(&self, new: NewGame) -> StoreResult<Game> {
        let game = Game::open(new);
        let document: MongoGameDocument = game.clone().into();

        match self.collection().await.insert_one(&document).await {
            Ok(_) => {
                debug!(game_id = %game.id, "game inserted");
                Ok(game)
            }
            Err(err) if is_duplicate_key(&err) => Err(StoreError::conflict(
                "another game is already open".to_owned(),
            )),
            Err(err) => Err(game_error("insert", game.id)(err).into()),
        }
    }

    async fn append_entry(&self, game_id: Uuid, entry: Entry) -> StoreResult<bool> {
        let entry: MongoEntryDocument = entry.into();
        let mut filter = doc_id(game_id);
        filter.insert("status", GameStatus::Open.as_str());
        filter.insert(
            "entries",
            doc! { "$not": { "$elemMatch": entry.dedup_filter() } },
        );
        let update = doc! {
            "$push": { "entries": entry.to_document() },
            "$set": { "updated_at": DateTime::now() },
        };

        let result = self
            .collection()
            .await
            .update_one(filter, update)
            .await
            .map_err(game_error("append entry to", game_id))?;
        if result.modified_count == 1 {
            return Ok(true);
        }

        // Nothing matched: either a duplicate, or the game is gone / no longer open.
        match self.load(game_id).await? {
            None => Err(StoreError::not_found(game_id, "unknown game")),
            Some(game) if game.status != GameStatus::Open => Err(StoreError::not_found(
                game_id,
                format!("game is {}", game.status.as_str()),
            )),
            Some(_) => Ok(false),
        }
    }

    async fn close_game(
        &self,
        game_id: Uuid,
        record: CloseRecord,
        closed_at: SystemTime,
    ) -> StoreResult<bool> {
        let mut filter = doc_id(game_id);
        filter.insert("status", GameStatus::Open.as_str());
        if let Some(winner) = &record.winner_entry_id {
            filter.insert("entries.external_id", winner.clone());
        }
        let update = doc! {
            "$set": {
                "status": GameStatus::Closed.as_str(),
                "winner_entry_id": record.winner_entry_id.clone(),
                "judge_reasoning": record.judge_reasoning.clone(),
                "closed_at": DateTime::from_system_time(closed_at),
                "updated_at": DateTime::now(),
            }
        };

        let result = self
            .collection()
            .await
            .update_one(filter, update)
            .await
            .map_err(game_error("close", game_id))?;
        if result.matched_count == 1 {
            return Ok(true);
        }

        match self.load(game_id).await? {
            None => Err(StoreError::not_found(game_id, "unknown game")),
            Some(game) if game.status != GameStatus::Open => Ok(false),
            Some(_) => Err(StoreError::not_found(
                game_id,
                format!(
                    "winner `{}` is not an entry of this game",
                    record.winner_entry_id.unwrap_or_default()
                ),
            )),
        }
    }

    async fn mark_error(&self, game_id: Uuid, reason: String, at: SystemTime) -> StoreResult<()> {
        let mut filter = doc_id(game_id);
        filter.insert("status", GameStatus::Open.as_str());
        let update = doc! {
            "$set": {
                "status": GameStatus::Error.as_str(),
                "error_reason": reason,
                "closed_at": DateTime::from_system_time(at),
                "updated_at": DateTime::now(),
            }
        };

        let result = self
            .collection()
            .await
            .update_one(filter, update)
            .await
            .map_err(game_error("mark error on", game_id))?;
        if result.matched_count == 0 && self.load(game_id).await?.is_none() {
            return Err(StoreError::not_found(game_id, "unknown game"));
        }
        Ok(())
    }

    async fn record_announcement(&self, game_id: Uuid, post_id: String) -> StoreResult<()> {
        let update = doc! {
            "$set": { "announcement_post_id": post_id, "updated_at": DateTime::now() }
        };
        let result = self
            .collection()
            .await
            .update_one(doc_id(game_id), update)
            .await
            .map_err(game_error("record announcement for", game_id))?;
        if result.matched_count == 0 {
            return Err(StoreError::not_found(game_id, "unknown game"));
        }
        Ok(())
    }
}

impl GameStore for MongoGameStore {
    fn find_open_game(&self) -> BoxFuture<'static, StoreResult<Option<Game>>> {
        let store = self.clone();
        Box::pin(async move { store.find_open_game().await })
    }

    fn find_game(&self, id: Uuid) -> BoxFuture<'static, StoreResult<Option<Game>>> {
        let store = self.clone();
        Box::pin(async move { store.load(id).await })
    }

    fn create_game(&self, new: NewGame) -> BoxFuture<'static, StoreResult<Game>> {
        let store = self.clone();
        Box::pin(async move { store.create_game(new).await })
    }

    fn append_entry(&self, game_id: Uuid, entry: Entry) -> BoxFuture<'static, StoreResult<bool>> {
        let store = self.clone();
        Box::pin(async move { store.append_entry(game_id, entry).await })
    }

    fn close_game(
        &self,
        game_id: Uuid,
        record: CloseRecord,
        closed_at: SystemTime,
    ) -> BoxFuture<'static, StoreResult<bool>> {
        let store = self.clone();
        Box::pin(async move { store.close_game(game_id, record, closed_at).await })
    }

    fn mark_error(
        &self,
        game_id: Uuid,
        reason: String,
        at: SystemTime,
    ) -> BoxFuture<'static, StoreResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.mark_error(game_id, reason, at).await })
    }

    fn record_announcement(
        &self,
        game_id: Uuid,
        post_id: String,
    ) -> BoxFuture<'static, StoreResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.record_announcement(game_id, post_id).await })
    }

    fn health_check(&self) -> BoxFuture<'static, StoreResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.ping().await.map_err(Into::into) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StoreResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.reconnect().await.map_err(Into::into) })
    }
}
