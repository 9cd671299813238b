use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use futures::future::BoxFuture;
use reqwest::{Client, Method, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    dao::{
        game_store::GameStore,
        models::{CloseRecord, Entry, Game, GameStatus, NewGame, truncate_to_millis},
        storage::{StoreError, StoreResult},
    },
    state::{TransitionError, state_machine},
};

use super::{
    config::CouchConfig,
    error::{CouchDaoError, CouchResult},
    models::{CouchGameDocument, OPEN_SLOT_DOC_ID, OpenSlotDocument, PutResponse, game_doc_id},
};

/// A claim on the open slot whose game document never appeared is abandoned after this long.
const STALE_CLAIM_AFTER: Duration = Duration::from_secs(60);

/// Error reason of a game whose slot claim was overtaken.
const SLOT_LOST: &str = "slot lost";

/// Result of a revision-checked write.
enum PutOutcome {
    Stored,
    /// The `_rev` we sent is no longer current.
    Conflict,
}

/// CouchDB-backed [`GameStore`].
///
/// CouchDB cannot update a document conditionally on a field value, so every
/// transition is a read-modify-write guarded by the document revision and
/// retried when another writer got there first. The open game is tracked by a
/// single slot document so two creators contend on the same revision.
#[derive(Clone)]
pub struct CouchGameStore {
    client: Client,
    base_url: Arc<str>,
    database: Arc<str>,
    auth: Option<(Arc<str>, Arc<str>)>,
    max_update_attempts: u32,
}

impl CouchGameStore {
    /// Establish a connection to CouchDB and ensure the database exists.
    pub async fn connect(config: CouchConfig) -> CouchResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|source| CouchDaoError::ClientBuilder { source })?;

        let base_url = Arc::<str>::from(config.base_url.trim_end_matches('/'));
        let database = Arc::<str>::from(config.database);
        let auth = config
            .username
            .zip(config.password)
            .map(|(u, p)| (Arc::<str>::from(u), Arc::<str>::from(p)));

        let store = Self {
            client,
            base_url,
            database,
            auth,
            max_update_attempts: config.max_update_attempts.max(1),
        };

        store.ensure_database().await?;
        Ok(store)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth {
            Some((ref user, ref pass)) => builder.basic_auth(user.as_ref(), Some(pass.as_ref())),
            None => builder,
        }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}/{}", self.base_url, self.database, path);
        self.authorize(self.client.request(method, url))
    }

    async fn ensure_database(&self) -> CouchResult<()> {
        let database = self.database.to_string();
        let url = format!("{}/{}", self.base_url, self.database);

        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|source| CouchDaoError::DatabaseQuery {
                database: database.clone(),
                source,
            })?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => {
                let create = self
                    .authorize(self.client.put(&url))
                    .send()
                    .await
                    .map_err(|source| CouchDaoError::DatabaseCreate {
                        database: database.clone(),
                        source,
                    })?;
                // 412: created concurrently by another instance.
                if create.status().is_success() || create.status() == StatusCode::PRECONDITION_FAILED
                {
                    Ok(())
                } else {
                    Err(CouchDaoError::DatabaseStatus {
                        database,
                        status: create.status(),
                    })
                }
            }
            other => Err(CouchDaoError::DatabaseStatus {
                database,
                status: other,
            }),
        }
    }

    async fn get_document<T>(&self, doc_id: &str) -> CouchResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        let response = self
            .request(Method::GET, doc_id)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: doc_id.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                response.json::<T>().await.map(Some).map_err(|source| {
                    CouchDaoError::DecodeResponse {
                        path: doc_id.to_string(),
                        source,
                    }
                })
            }
            other => Err(CouchDaoError::RequestStatus {
                path: doc_id.to_string(),
                status: other,
            }),
        }
    }

    async fn put_document<T>(&self, doc_id: &str, document: &T) -> CouchResult<PutOutcome>
    where
        T: ?Sized + Serialize,
    {
        let response = self
            .request(Method::PUT, doc_id)
            .json(document)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: doc_id.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::CONFLICT => Ok(PutOutcome::Conflict),
            status if status.is_success() => {
                let stored = response.json::<PutResponse>().await.map_err(|source| {
                    CouchDaoError::DecodeResponse {
                        path: doc_id.to_string(),
                        source,
                    }
                })?;
                debug!(doc_id, rev = %stored.rev, "document stored");
                Ok(PutOutcome::Stored)
            }
            other => Err(CouchDaoError::RequestStatus {
                path: doc_id.to_string(),
                status: other,
            }),
        }
    }

    async fn load(&self, id: Uuid) -> CouchResult<Option<(Game, Option<String>)>> {
        let document = self
            .get_document::<CouchGameDocument>(&game_doc_id(id))
            .await?;
        document.map(CouchGameDocument::into_entity).transpose()
    }

    async fn read_slot(&self) -> CouchResult<OpenSlotDocument> {
        Ok(self
            .get_document::<OpenSlotDocument>(OPEN_SLOT_DOC_ID)
            .await?
            .unwrap_or_else(|| OpenSlotDocument::new(None, None, None)))
    }

    /// Whether the slot currently holds a live open game.
    async fn slot_is_taken(&self, slot: &OpenSlotDocument) -> CouchResult<bool> {
        let Some(game_id) = slot.game_id else {
            return Ok(false);
        };
        match self.load(game_id).await? {
            Some((game, _)) => Ok(game.status == GameStatus::Open),
            // Claimed but the game document is not written yet.
            None => Ok(slot.claim_is_fresh(SystemTime::now(), STALE_CLAIM_AFTER)),
        }
    }

    /// Free the slot if it still names `game_id`. Losing the race is fine: a slot
    /// naming a terminal game is treated as empty.
    async fn release_slot(&self, game_id: Uuid) {
        let result = async {
            let slot = self.read_slot().await?;
            if !slot.held_by(game_id) {
                return Ok(());
            }
            let cleared = OpenSlotDocument::new(slot.rev, None, None);
            self.put_document(OPEN_SLOT_DOC_ID, &cleared).await.map(|_| ())
        }
        .await;
        if let Err(err) = result {
            warn!(game_id = %game_id, error = %err, "failed to release open slot");
        }
    }

    /// Revision-guarded read-modify-write of one game.
    ///
    /// `mutate` returns `false` when its precondition does not hold; nothing is
    /// written and `Ok(None)` is returned.
    async fn update_game<F>(&self, game_id: Uuid, mut mutate: F) -> StoreResult<Option<Game>>
    where
        F: FnMut(&mut Game) -> StoreResult<bool>,
    {
        let doc_id = game_doc_id(game_id);
        for attempt in 1..=self.max_update_attempts {
            let Some((mut game, rev)) = self.load(game_id).await? else {
                return Err(StoreError::not_found(game_id, "unknown game"));
            };
            if !mutate(&mut game)? {
                return Ok(None);
            }
            let document = CouchGameDocument::from((game.clone(), rev));
            match self.put_document(&doc_id, &document).await? {
                PutOutcome::Stored => return Ok(Some(game)),
                PutOutcome::Conflict => {
                    debug!(game_id = %game_id, attempt, "revision conflict; re-reading game");
                }
            }
        }
        Err(CouchDaoError::RevisionContention {
            doc_id,
            attempts: self.max_update_attempts,
        }
        .into())
    }

    async fn find_open_game(&self) -> StoreResult<Option<Game>> {
        let slot = self.read_slot().await?;
        let Some(game_id) = slot.game_id else {
            return Ok(None);
        };
        Ok(self
            .load(game_id)
            .await?
            .map(|(game, _)| game)
            .filter(|game| game.status == GameStatus::Open))
    }

    async fn create_game(&self, new: NewGame) -> StoreResult<Game> {
        let slot = self.read_slot().await?;
        if self.slot_is_taken(&slot).await? {
            return Err(StoreError::conflict("another game is already open"));
        }

        let game = Game::open(new);
        let claim = OpenSlotDocument::new(slot.rev, Some(game.id), Some(SystemTime::now()));
        if let PutOutcome::Conflict = self.put_document(OPEN_SLOT_DOC_ID, &claim).await? {
            return Err(StoreError::conflict("open slot was claimed concurrently"));
        }

        let document = CouchGameDocument::from((game.clone(), None));
        if let PutOutcome::Conflict = self.put_document(&game_doc_id(game.id), &document).await? {
            return Err(StoreError::conflict(format!(
                "game document `{}` already exists",
                game.id
            )));
        }

        // A creator that saw our claim as stale may have taken the slot over
        // while the game document was in flight.
        if self.read_slot().await?.held_by(game.id) {
            return Ok(game);
        }
        warn!(game_id = %game.id, "open slot taken over before the game was written");
        self.retire_unslotted(game.id).await;
        Err(StoreError::conflict("open slot was taken over by another game"))
    }

    /// Move a game that lost its slot to `ERROR` so it never counts as open.
    async fn retire_unslotted(&self, game_id: Uuid) {
        let at = truncate_to_millis(SystemTime::now());
        let result = self
            .update_game(game_id, |game| {
                Ok(state_machine::fail(game, SLOT_LOST.to_owned(), at).is_ok())
            })
            .await;
        if let Err(err) = result {
            warn!(game_id = %game_id, error = %err, "failed to retire game without a slot");
        }
    }

    async fn append_entry(&self, game_id: Uuid, entry: Entry) -> StoreResult<bool> {
        let updated = self
            .update_game(game_id, |game| {
                state_machine::append_entry(game, entry.clone())
                    .map_err(|err| StoreError::not_found(game_id, err.to_string()))
            })
            .await?;
        Ok(updated.is_some())
    }

    async fn close_game(
        &self,
        game_id: Uuid,
        record: CloseRecord,
        closed_at: SystemTime,
    ) -> StoreResult<bool> {
        let updated = self
            .update_game(game_id, |game| {
                match state_machine::close(game, record.clone(), closed_at) {
                    Ok(()) => Ok(true),
                    Err(TransitionError::Invalid(_)) => Ok(false),
                    Err(err @ TransitionError::UnknownWinner(_)) => {
                        Err(StoreError::not_found(game_id, err.to_string()))
                    }
                }
            })
            .await?;
        if updated.is_some() {
            self.release_slot(game_id).await;
        }
        Ok(updated.is_some())
    }

    async fn mark_error(&self, game_id: Uuid, reason: String, at: SystemTime) -> StoreResult<()> {
        let updated = self
            .update_game(game_id, |game| {
                Ok(state_machine::fail(game, reason.clone(), at).is_ok())
            })
            .await?;
        if updated.is_some() {
            self.release_slot(game_id).await;
        }
        Ok(())
    }

    async fn record_announcement(&self, game_id: Uuid, post_id: String) -> StoreResult<()> {
        self.update_game(game_id, |game| {
            game.announcement_post_id = Some(post_id.clone());
            Ok(true)
        })
        .await?;
        Ok(())
    }
}

impl GameStore for CouchGameStore {
    fn find_open_game(&self) -> BoxFuture<'static, StoreResult<Option<Game>>> {
        let store = self.clone();
        Box::pin(async move { store.find_open_game().await })
    }

    fn find_game(&self, id: Uuid) -> BoxFuture<'static, StoreResult<Option<Game>>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.load(id).await?.map(|(game, _)| game)) })
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
        Box::pin(async move {
            let url = format!("{}/{}", store.base_url, store.database);
            let response = store
                .authorize(store.client.get(&url))
                .send()
                .await
                .map_err(|source| CouchDaoError::RequestSend {
                    path: url.clone(),
                    source,
                })?;

            if response.status().is_success() {
                Ok(())
            } else {
                Err(CouchDaoError::RequestStatus {
                    path: url,
                    status: response.status(),
                }
                .into())
            }
        })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StoreResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.ensure_database().await.map_err(Into::into) })
    }
}
