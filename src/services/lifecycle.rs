//! Open / collect / close ticks of the contest lifecycle.
//!
//! The controller keeps no state between ticks: every tick re-reads the open
//! game from the store and derives its phase. Safety under overlapping ticks
//! and multiple processes comes from the store's conditional transitions.

use std::{sync::Arc, time::SystemTime};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    dao::{
        game_store::GameStore,
        models::{CloseRecord, EntryId, Game, GameStatus, NewGame, truncate_to_millis},
        storage::{StoreError, StoreResult},
    },
    error::TickError,
    reasoning::Reasoner,
    services::{
        entries::{Rejection, dedupe, normalize, reject},
        judge::{Judge, JudgeContext},
        prompts::{self, NoWinnerReason},
        retry::{retry, retry_with_hint, with_timeout},
        trigger::{TickHandler, TickKind},
    },
    social::{RawReply, SocialClient, SocialResult},
    state::LifecyclePhase,
};

/// What to do when the judge gives no usable verdict after its corrective retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeFailurePolicy {
    /// Close the game with no winner.
    #[default]
    CloseWithoutWinner,
    /// Move the game to `ERROR` for an operator to look at.
    MarkError,
}

/// Result of a maybe-open tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    /// A new game was posted and stored.
    Opened {
        /// New game.
        game_id: Uuid,
        /// Prompt post.
        post_id: String,
    },
    /// A game is already open.
    AlreadyOpen {
        /// The open game.
        game_id: Uuid,
    },
    /// Auto-open is disabled.
    Disabled,
    /// Another actor opened a game between our check and our insert. The
    /// prompt we posted stays up, unused.
    LostRace {
        /// The orphaned prompt post.
        orphan_post_id: String,
    },
}

/// Result of a collect tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectOutcome {
    /// Replies were fetched and new entries stored.
    Collected {
        /// Game collected for.
        game_id: Uuid,
        /// Replies returned by the platform.
        fetched: usize,
        /// Entries newly stored.
        appended: usize,
    },
    /// No game is open.
    NoOpenGame,
    /// The open game is past its deadline; the close tick owns it now.
    DueForClose {
        /// The due game.
        game_id: Uuid,
    },
}

/// Result of a maybe-close tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// No game is open.
    NoOpenGame,
    /// The open game is still collecting.
    NotDue {
        /// The open game.
        game_id: Uuid,
    },
    /// This tick committed the close.
    Closed {
        /// Closed game.
        game_id: Uuid,
        /// Winner, if any.
        winner_entry_id: Option<EntryId>,
        /// Result announcement, if it was posted.
        announcement_post_id: Option<String>,
    },
    /// Another actor committed the close first.
    AlreadyClosed {
        /// The game.
        game_id: Uuid,
    },
    /// The game was escalated to `ERROR`.
    MarkedError {
        /// The game.
        game_id: Uuid,
        /// Recorded reason.
        reason: String,
    },
}

/// Drives one game at a time through open, collect and close.
#[derive(Clone)]
pub struct LifecycleController {
    config: Arc<AppConfig>,
    store: Arc<dyn GameStore>,
    social: Arc<dyn SocialClient>,
    judge: Judge,
}

impl LifecycleController {
    /// Wire the controller to its collaborators.
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn GameStore>,
        social: Arc<dyn SocialClient>,
        reasoner: Arc<dyn Reasoner>,
    ) -> Self {
        let judge = Judge::new(reasoner, config.judge.settings());
        Self {
            config,
            store,
            social,
            judge,
        }
    }

    /// Current phase, read fresh from the store.
    pub async fn phase(&self) -> Result<LifecyclePhase, TickError> {
        let open = self
            .store_call("find_open_game", || self.store.find_open_game())
            .await?;
        Ok(LifecyclePhase::derive(open, SystemTime::now()))
    }

    /// Open a game when none is open and auto-open is enabled.
    pub async fn maybe_open(&self) -> Result<OpenOutcome, TickError> {
        if !self.config.game.auto_open {
            debug!("auto-open disabled");
            return Ok(OpenOutcome::Disabled);
        }
        match self.phase().await? {
            LifecyclePhase::NoOpenGame => {}
            LifecyclePhase::Collecting(game) | LifecyclePhase::DueForClose(game) => {
                debug!(game_id = %game.id, "a game is already open");
                return Ok(OpenOutcome::AlreadyOpen { game_id: game.id });
            }
        }

        let game_type = prompts::choose_game_type(&self.config.game.game_types);
        let duration = self.config.game.duration.sample();
        let prompt_text = prompts::compose_prompt(game_type, duration, &self.config.game.prize);

        let post_id = self
            .social_call("post", || self.social.post(prompt_text.clone()))
            .await?;

        let opened_at = truncate_to_millis(SystemTime::now());
        let new = NewGame {
            game_type,
            prompt_text,
            post_id: post_id.clone(),
            opened_at,
            closes_at: opened_at + duration,
        };

        match self
            .store_call("create_game", || self.store.create_game(new.clone()))
            .await
        {
            Ok(game) => {
                info!(
                    game_id = %game.id,
                    post_id = %post_id,
                    ?game_type,
                    ?duration,
                    "game opened"
                );
                Ok(OpenOutcome::Opened {
                    game_id: game.id,
                    post_id,
                })
            }
            Err(err) if err.is_conflict() => {
                warn!(
                    post_id = %post_id,
                    "another game was opened concurrently; prompt post left orphaned"
                );
                Ok(OpenOutcome::LostRace {
                    orphan_post_id: post_id,
                })
            }
            Err(err) => {
                error!(post_id = %post_id, error = %err, "game posted but not stored; prompt post left orphaned");
                Err(err)
            }
        }
    }

    /// Store new entries for the open game while it is collecting.
    pub async fn collect(&self) -> Result<CollectOutcome, TickError> {
        match self.phase().await? {
            LifecyclePhase::NoOpenGame => Ok(CollectOutcome::NoOpenGame),
            LifecyclePhase::DueForClose(game) => {
                debug!(game_id = %game.id, "game is due; leaving it to the close tick");
                Ok(CollectOutcome::DueForClose { game_id: game.id })
            }
            LifecyclePhase::Collecting(game) => self.collect_into(&game, None).await,
        }
    }

    /// Judge and close the open game once its deadline has passed.
    pub async fn maybe_close(&self) -> Result<CloseOutcome, TickError> {
        let game = match self.phase().await? {
            LifecyclePhase::NoOpenGame => return Ok(CloseOutcome::NoOpenGame),
            LifecyclePhase::Collecting(game) => {
                return Ok(CloseOutcome::NotDue { game_id: game.id });
            }
            LifecyclePhase::DueForClose(game) => game,
        };
        let game_id = game.id;
        info!(game_id = %game_id, phase = "due_for_close", "closing game");

        // Last pass over the feed, bounded to one I/O budget so a hung platform
        // cannot starve the close. Replies after the deadline do not count.
        let budget = self.config.io_timeout;
        match timeout(budget, self.collect_into(&game, Some(game.closes_at))).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                warn!(game_id = %game_id, error = %err, "final collection failed; judging stored entries");
            }
            Err(_) => {
                warn!(game_id = %game_id, ?budget, "final collection timed out; judging stored entries");
            }
        }

        let game = match self
            .store_call("find_game", || self.store.find_game(game_id))
            .await?
        {
            Some(game) if game.status == GameStatus::Open => game,
            Some(_) => {
                info!(game_id = %game_id, "game was closed by another actor");
                return Ok(CloseOutcome::AlreadyClosed { game_id });
            }
            None => {
                return Err(StoreError::not_found(game_id, "open game vanished before close").into());
            }
        };

        let context = JudgeContext {
            game_type: game.game_type,
            prompt_text: &game.prompt_text,
        };
        let (record, no_winner) = match self.judge.select_winner(&game.entries, context).await {
            Ok(Some(verdict)) => (
                CloseRecord {
                    winner_entry_id: Some(verdict.entry_id),
                    judge_reasoning: verdict.reasoning,
                },
                None,
            ),
            Ok(None) => {
                let reason = if game.entries.is_empty() {
                    NoWinnerReason::NoReplies
                } else {
                    NoWinnerReason::NoValidEntries
                };
                (CloseRecord::default(), Some(reason))
            }
            Err(err) => match self.config.judge.failure_policy {
                JudgeFailurePolicy::CloseWithoutWinner => {
                    warn!(game_id = %game_id, error = %err, "judge failed; closing without a winner");
                    (
                        CloseRecord {
                            winner_entry_id: None,
                            judge_reasoning: Some(format!("no usable verdict: {}", err.last)),
                        },
                        Some(NoWinnerReason::NoDecision),
                    )
                }
                JudgeFailurePolicy::MarkError => {
                    return self
                        .escalate(game_id, format!("judge failed: {}", err.last))
                        .await;
                }
            },
        };

        let closed_at = truncate_to_millis(SystemTime::now());
        let closed = match self
            .store_call("close_game", || {
                self.store.close_game(game_id, record.clone(), closed_at)
            })
            .await
        {
            Ok(closed) => closed,
            Err(err) => {
                error!(game_id = %game_id, error = %err, "close failed after retries; escalating");
                return self
                    .escalate(game_id, format!("close failed: {err}"))
                    .await;
            }
        };
        if !closed {
            info!(game_id = %game_id, "another actor committed the close first");
            return Ok(CloseOutcome::AlreadyClosed { game_id });
        }

        info!(
            game_id = %game_id,
            winner = ?record.winner_entry_id,
            entries = game.entries.len(),
            "game closed"
        );
        let announcement_post_id = self.announce(&game, &record, no_winner).await;

        Ok(CloseOutcome::Closed {
            game_id,
            winner_entry_id: record.winner_entry_id,
            announcement_post_id,
        })
    }

    /// Fetch replies, keep the new ones, and append them one by one.
    ///
    /// With a `cutoff`, replies published after it are ignored.
    async fn collect_into(
        &self,
        game: &Game,
        cutoff: Option<SystemTime>,
    ) -> Result<CollectOutcome, TickError> {
        let game_id = game.id;
        let replies = self
            .social_call("fetch_replies", || {
                self.social.fetch_replies(game.post_id.clone())
            })
            .await?;
        let fetched = replies.len();
        let replies: Vec<RawReply> = replies
            .into_iter()
            .filter(|reply| cutoff.is_none_or(|cutoff| reply.timestamp <= cutoff))
            .collect();

        let rules = &self.config.entries;
        let normalized = replies
            .iter()
            .map(|reply| normalize(reply, rules, None))
            .collect();
        let fresh = dedupe(&game.entries, normalized);

        let mut appended = 0;
        for mut entry in fresh {
            if entry.valid && rules.needs_author_profile() {
                let author = self
                    .social_call("fetch_user", || {
                        self.social.fetch_user(entry.author_id.clone())
                    })
                    .await;
                let raw = replies.iter().find(|reply| {
                    reply.author_id == entry.author_id && reply.external_id == entry.external_id
                });
                match (author, raw) {
                    (Ok(author), Some(raw)) => entry = normalize(raw, rules, Some(&author)),
                    (Ok(_), None) => {}
                    (Err(err), _) if err.is_retryable() => {
                        // Not stored, so the next tick evaluates it again.
                        warn!(
                            game_id = %game_id,
                            entry_id = %entry.external_id,
                            error = %err,
                            "author profile unreachable; deferring entry"
                        );
                        continue;
                    }
                    (Err(err), _) => {
                        info!(
                            game_id = %game_id,
                            entry_id = %entry.external_id,
                            error = %err,
                            "author profile unavailable; rejecting entry"
                        );
                        reject(&mut entry, Rejection::AuthorUnavailable);
                    }
                }
            }

            match self
                .store_call("append_entry", || {
                    self.store.append_entry(game_id, entry.clone())
                })
                .await
            {
                Ok(true) => appended += 1,
                Ok(false) => {}
                Err(TickError::Store(StoreError::NotFound { .. })) => {
                    info!(game_id = %game_id, "game left OPEN while collecting; stopping");
                    break;
                }
                Err(err) => return Err(err),
            }
        }

        info!(game_id = %game_id, fetched, appended, "collected replies");
        Ok(CollectOutcome::Collected {
            game_id,
            fetched,
            appended,
        })
    }

    /// Force the game into `ERROR` so it never stays open silently.
    async fn escalate(&self, game_id: Uuid, reason: String) -> Result<CloseOutcome, TickError> {
        let at = truncate_to_millis(SystemTime::now());
        self.store_call("mark_error", || {
            self.store.mark_error(game_id, reason.clone(), at)
        })
        .await?;
        error!(game_id = %game_id, %reason, "game escalated to ERROR");
        Ok(CloseOutcome::MarkedError { game_id, reason })
    }

    /// Post the result under the prompt. Best effort: failures are logged only.
    async fn announce(
        &self,
        game: &Game,
        record: &CloseRecord,
        no_winner: Option<NoWinnerReason>,
    ) -> Option<String> {
        let winner = record
            .winner_entry_id
            .as_deref()
            .and_then(|id| game.entry(id));
        let text = match winner {
            Some(winner) => prompts::winner_announcement(winner),
            None if self.config.game.announce_no_winner => {
                prompts::no_winner_announcement(no_winner.unwrap_or(NoWinnerReason::NoDecision))
            }
            None => return None,
        };

        let limit = self.config.io_timeout;
        let pending = self.social.reply(game.post_id.clone(), text);
        let posted = with_timeout(
            limit,
            async move { pending.await.map_err(TickError::from) },
            || TickError::Timeout {
                operation: "announce",
                limit,
            },
        )
        .await;

        match posted {
            Ok(post_id) => {
                info!(game_id = %game.id, post_id = %post_id, "result announced");
                if let Err(err) = self
                    .store_call("record_announcement", || {
                        self.store.record_announcement(game.id, post_id.clone())
                    })
                    .await
                {
                    warn!(game_id = %game.id, error = %err, "failed to record announcement");
                }
                Some(post_id)
            }
            Err(err) => {
                warn!(game_id = %game.id, error = %err, "failed to post result announcement");
                None
            }
        }
    }

    /// Store call bounded by `io_timeout` and retried on transient failures.
    async fn store_call<T, F>(&self, operation: &'static str, call: F) -> Result<T, TickError>
    where
        F: Fn() -> BoxFuture<'static, StoreResult<T>>,
    {
        let limit = self.config.io_timeout;
        retry(&self.config.retry.store, operation, TickError::is_retryable, || {
            let pending = call();
            with_timeout(
                limit,
                async move { pending.await.map_err(TickError::from) },
                move || TickError::Timeout { operation, limit },
            )
        })
        .await
    }

    /// Social call bounded by `io_timeout` and retried on retryable failures.
    async fn social_call<T, F>(&self, operation: &'static str, call: F) -> Result<T, TickError>
    where
        F: Fn() -> BoxFuture<'static, SocialResult<T>>,
    {
        let limit = self.config.io_timeout;
        retry_with_hint(
            &self.config.retry.social,
            operation,
            TickError::is_retryable,
            TickError::retry_after,
            || {
                let pending = call();
                with_timeout(
                    limit,
                    async move { pending.await.map_err(TickError::from) },
                    move || TickError::Timeout { operation, limit },
                )
            },
        )
        .await
    }
}

impl TickHandler for LifecycleController {
    fn on_tick(&self, kind: TickKind) -> BoxFuture<'static, Result<(), TickError>> {
        let controller = self.clone();
        Box::pin(async move {
            match kind {
                TickKind::Open => {
                    let outcome = controller.maybe_open().await?;
                    debug!(?outcome, "open tick finished");
                }
                TickKind::Collect => {
                    let outcome = controller.collect().await?;
                    debug!(?outcome, "collect tick finished");
                }
                TickKind::Close => {
                    let outcome = controller.maybe_close().await?;
                    debug!(?outcome, "close tick finished");
                }
            }
            Ok(())
        })
    }
}
