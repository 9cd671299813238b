//! End-to-end lifecycle scenarios: open, collect, judge and close against the
//! in-memory store and social platform.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::{Duration, SystemTime},
};

use drawi_back::{
    config::{AppConfig, GameDuration},
    dao::{
        game_store::{GameStore, memory::MemoryGameStore},
        models::{CloseRecord, Entry, Game, GameStatus, GameType, NewGame, truncate_to_millis},
        storage::{StoreError, StoreResult},
    },
    reasoning::{Reasoner, ReasonerError},
    services::{
        lifecycle::{CloseOutcome, CollectOutcome, JudgeFailurePolicy, LifecycleController, OpenOutcome},
        retry::RetryPolicy,
    },
    social::{MemorySocialClient, RawReply, SocialClient, SocialResult, UserInfo},
    state::LifecyclePhase,
};
use futures::future::{self, BoxFuture};
use tokio::time::{Instant, timeout};
use uuid::Uuid;

const ALICE_WALLET: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";
const BOB_WALLET: &str = "So11111111111111111111111111111111111111112";
const GAME_LENGTH: Duration = Duration::from_secs(600);

/// Answers from a fixed script; the last answer repeats once the script runs out.
struct ScriptedReasoner {
    answers: Mutex<VecDeque<String>>,
    calls: AtomicU32,
}

impl ScriptedReasoner {
    fn new(answers: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.iter().map(|answer| answer.to_string()).collect()),
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Reasoner for ScriptedReasoner {
    fn complete(
        &self,
        _prompt: String,
        _context: String,
    ) -> BoxFuture<'static, Result<String, ReasonerError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut answers = self.answers.lock().unwrap();
        let answer = if answers.len() > 1 {
            answers.pop_front()
        } else {
            answers.front().cloned()
        };
        Box::pin(async move { answer.ok_or(ReasonerError::EmptyCompletion) })
    }
}

/// Platform and model that accept every call and never answer.
struct Stalled;

impl SocialClient for Stalled {
    fn post(&self, _text: String) -> BoxFuture<'static, SocialResult<String>> {
        Box::pin(future::pending())
    }

    fn reply(&self, _post_id: String, _text: String) -> BoxFuture<'static, SocialResult<String>> {
        Box::pin(future::pending())
    }

    fn fetch_replies(&self, _post_id: String) -> BoxFuture<'static, SocialResult<Vec<RawReply>>> {
        Box::pin(future::pending())
    }

    fn fetch_user(&self, _user_id: String) -> BoxFuture<'static, SocialResult<UserInfo>> {
        Box::pin(future::pending())
    }
}

impl Reasoner for Stalled {
    fn complete(
        &self,
        _prompt: String,
        _context: String,
    ) -> BoxFuture<'static, Result<String, ReasonerError>> {
        Box::pin(future::pending())
    }
}

/// Memory store that counts closes and can hide the open game or refuse closes.
#[derive(Clone, Default)]
struct InstrumentedStore {
    inner: MemoryGameStore,
    close_calls: Arc<AtomicU32>,
    hide_open_game: Arc<AtomicBool>,
    refuse_close: Arc<AtomicBool>,
}

impl InstrumentedStore {
    fn close_calls(&self) -> u32 {
        self.close_calls.load(Ordering::SeqCst)
    }
}

impl GameStore for InstrumentedStore {
    fn find_open_game(&self) -> BoxFuture<'static, StoreResult<Option<Game>>> {
        if self.hide_open_game.load(Ordering::SeqCst) {
            return Box::pin(async { Ok(None) });
        }
        self.inner.find_open_game()
    }

    fn find_game(&self, id: Uuid) -> BoxFuture<'static, StoreResult<Option<Game>>> {
        self.inner.find_game(id)
    }

    fn create_game(&self, new: NewGame) -> BoxFuture<'static, StoreResult<Game>> {
        self.inner.create_game(new)
    }

    fn append_entry(&self, game_id: Uuid, entry: Entry) -> BoxFuture<'static, StoreResult<bool>> {
        self.inner.append_entry(game_id, entry)
    }

    fn close_game(
        &self,
        game_id: Uuid,
        record: CloseRecord,
        closed_at: SystemTime,
    ) -> BoxFuture<'static, StoreResult<bool>> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.refuse_close.load(Ordering::SeqCst) {
            return Box::pin(async {
                Err(StoreError::unavailable(
                    "write concern timeout".into(),
                    std::io::Error::other("replica set unreachable"),
                ))
            });
        }
        self.inner.close_game(game_id, record, closed_at)
    }

    fn mark_error(
        &self,
        game_id: Uuid,
        reason: String,
        at: SystemTime,
    ) -> BoxFuture<'static, StoreResult<()>> {
        self.inner.mark_error(game_id, reason, at)
    }

    fn record_announcement(
        &self,
        game_id: Uuid,
        post_id: String,
    ) -> BoxFuture<'static, StoreResult<()>> {
        self.inner.record_announcement(game_id, post_id)
    }

    fn health_check(&self) -> BoxFuture<'static, StoreResult<()>> {
        self.inner.health_check()
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StoreResult<()>> {
        self.inner.try_reconnect()
    }
}

struct Harness {
    store: InstrumentedStore,
    social: MemorySocialClient,
    reasoner: Arc<ScriptedReasoner>,
    config: Arc<AppConfig>,
}

impl Harness {
    fn new(answers: &[&str]) -> Self {
        Self::with_config(base_config(), answers)
    }

    fn with_config(config: AppConfig, answers: &[&str]) -> Self {
        Self {
            store: InstrumentedStore::default(),
            social: MemorySocialClient::new(),
            reasoner: ScriptedReasoner::new(answers),
            config: Arc::new(config),
        }
    }

    fn controller(&self) -> LifecycleController {
        LifecycleController::new(
            self.config.clone(),
            Arc::new(self.store.clone()),
            Arc::new(self.social.clone()),
            self.reasoner.clone(),
        )
    }

    async fn game(&self, id: Uuid) -> Game {
        self.store
            .find_game(id)
            .await
            .unwrap()
            .expect("game is stored")
    }

    /// Move the game's deadline ten minutes into the past.
    async fn expire(&self, id: Uuid) {
        let mut game = self.game(id).await;
        let now = truncate_to_millis(SystemTime::now());
        game.opened_at = now - Duration::from_secs(1200);
        game.closes_at = now - Duration::from_secs(600);
        self.store.inner.insert_raw(game).await;
    }
}

fn base_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.game.duration = GameDuration::Fixed {
        seconds: GAME_LENGTH,
    };
    let fast = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2));
    config.retry.social = fast;
    config.retry.store = fast;
    config.io_timeout = Duration::from_secs(5);
    config
}

fn profile(id: &str, followers_count: u64) -> UserInfo {
    UserInfo {
        id: id.into(),
        username: id.into(),
        name: None,
        followers_count,
        created_at: None,
        verified: false,
    }
}

/// A reply posted `minutes_ago` minutes before now.
fn reply(author: &str, id: &str, text: &str, minutes_ago: u64) -> RawReply {
    RawReply {
        author_id: author.into(),
        author_username: Some(author.into()),
        external_id: id.into(),
        text: text.into(),
        timestamp: SystemTime::now() - Duration::from_secs(minutes_ago * 60),
    }
}

async fn open(controller: &LifecycleController) -> (Uuid, String) {
    match controller.maybe_open().await.unwrap() {
        OpenOutcome::Opened { game_id, post_id } => (game_id, post_id),
        other => panic!("expected a new game, got {other:?}"),
    }
}

#[tokio::test]
async fn open_tick_persists_game_with_fixed_deadline() {
    let harness = Harness::new(&[]);
    let controller = harness.controller();

    let (game_id, post_id) = open(&controller).await;

    let game = harness.game(game_id).await;
    assert_eq!(game.status, GameStatus::Open);
    assert_eq!(game.post_id, post_id);
    assert_eq!(game.closes_at.duration_since(game.opened_at).unwrap(), GAME_LENGTH);
    assert!(game.entries.is_empty());

    let published = harness.social.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].id, post_id);
    assert_eq!(published[0].text, game.prompt_text);
    assert!(matches!(
        controller.phase().await.unwrap(),
        LifecyclePhase::Collecting(_)
    ));
}

#[tokio::test]
async fn full_round_collects_judges_and_announces_once() {
    let harness = Harness::new(&[r#"{"reply_id": "r2", "reason": "the most surprising fact"}"#]);
    let controller = harness.controller();
    let (game_id, post_id) = open(&controller).await;

    let alice = format!("octopuses have three hearts {ALICE_WALLET}");
    let bob = format!("honey never spoils {BOB_WALLET}");
    harness.social.add_reply(&post_id, reply("alice", "r1", &alice, 15));
    harness.social.add_reply(&post_id, reply("bob", "r2", &bob, 14));
    // Same reply surfaced twice by the feed.
    harness.social.add_reply(&post_id, reply("alice", "r1", &alice, 15));

    let collected = controller.collect().await.unwrap();
    assert_eq!(
        collected,
        CollectOutcome::Collected {
            game_id,
            fetched: 3,
            appended: 2
        }
    );

    harness.expire(game_id).await;
    // Arrives after the deadline; the final collection must ignore it.
    harness
        .social
        .add_reply(&post_id, reply("carol", "r3", &format!("late {BOB_WALLET}"), 0));

    let CloseOutcome::Closed {
        winner_entry_id,
        announcement_post_id,
        ..
    } = controller.maybe_close().await.unwrap()
    else {
        panic!("expected the game to close");
    };
    assert_eq!(winner_entry_id.as_deref(), Some("r2"));
    assert_eq!(harness.store.close_calls(), 1);
    assert_eq!(harness.reasoner.calls(), 1);

    let game = harness.game(game_id).await;
    assert_eq!(game.status, GameStatus::Closed);
    assert_eq!(game.entries.len(), 2);
    assert_eq!(game.winner_entry_id.as_deref(), Some("r2"));
    assert_eq!(game.judge_reasoning.as_deref(), Some("the most surprising fact"));
    assert!(game.closed_at.is_some());
    assert_eq!(game.announcement_post_id, announcement_post_id);

    let announcements = harness.social.replies_to(&post_id);
    assert_eq!(announcements.len(), 1);
    assert!(announcements[0].text.contains(BOB_WALLET));

    // Later ticks find nothing to do.
    assert_eq!(controller.maybe_close().await.unwrap(), CloseOutcome::NoOpenGame);
    assert_eq!(controller.collect().await.unwrap(), CollectOutcome::NoOpenGame);
}

#[tokio::test]
async fn expired_game_is_collected_and_closed_in_one_tick() {
    let harness = Harness::new(&[r#"{"reply_id": "r1"}"#]);
    let controller = harness.controller();
    let (game_id, post_id) = open(&controller).await;
    harness.expire(game_id).await;

    let text = format!("pick me {ALICE_WALLET}");
    harness.social.add_reply(&post_id, reply("alice", "r1", &text, 15));
    harness.social.add_reply(&post_id, reply("alice", "r1", &text, 15));
    harness
        .social
        .add_reply(&post_id, reply("bob", "r2", &format!("me {BOB_WALLET}"), 12));

    assert_eq!(
        controller.collect().await.unwrap(),
        CollectOutcome::DueForClose { game_id }
    );
    let outcome = controller.maybe_close().await.unwrap();

    assert!(matches!(outcome, CloseOutcome::Closed { .. }));
    assert_eq!(harness.store.close_calls(), 1);
    let game = harness.game(game_id).await;
    assert_eq!(game.status, GameStatus::Closed);
    assert_eq!(game.entries.len(), 2);
    assert_eq!(game.winner_entry_id.as_deref(), Some("r1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_closers_announce_exactly_once() {
    let harness = Harness::new(&[r#"{"reply_id": "r1", "reason": "only one"}"#]);
    let (game_id, post_id) = open(&harness.controller()).await;
    harness.social.add_reply(
        &post_id,
        reply("alice", "r1", &format!("pick me {ALICE_WALLET}"), 15),
    );
    harness.controller().collect().await.unwrap();
    harness.expire(game_id).await;

    let closers: Vec<_> = (0..2)
        .map(|_| {
            let controller = harness.controller();
            tokio::spawn(async move { controller.maybe_close().await })
        })
        .collect();
    let mut closed = 0;
    for closer in closers {
        if let CloseOutcome::Closed { .. } = closer.await.unwrap().unwrap() {
            closed += 1;
        }
    }

    assert_eq!(closed, 1);
    assert_eq!(harness.game(game_id).await.status, GameStatus::Closed);
    assert_eq!(harness.social.replies_to(&post_id).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_openers_leave_one_open_game() {
    let harness = Harness::new(&[]);

    let openers: Vec<_> = (0..4)
        .map(|_| {
            let controller = harness.controller();
            tokio::spawn(async move { controller.maybe_open().await })
        })
        .collect();
    let mut opened = 0;
    for opener in openers {
        match opener.await.unwrap().unwrap() {
            OpenOutcome::Opened { .. } => opened += 1,
            OpenOutcome::AlreadyOpen { .. } | OpenOutcome::LostRace { .. } => {}
            OpenOutcome::Disabled => panic!("auto-open is enabled"),
        }
    }

    assert_eq!(opened, 1);
    let games = harness.store.inner.games().await;
    assert_eq!(games.len(), 1);
    assert_eq!(games[0].status, GameStatus::Open);
}

#[tokio::test]
async fn losing_the_create_race_orphans_the_prompt() {
    let harness = Harness::new(&[]);
    let controller = harness.controller();
    let (game_id, _) = open(&controller).await;

    // Another instance's game is invisible to the pre-check but not to the insert.
    harness.store.hide_open_game.store(true, Ordering::SeqCst);
    let OpenOutcome::LostRace { orphan_post_id } = controller.maybe_open().await.unwrap() else {
        panic!("expected the insert to conflict");
    };

    assert_eq!(harness.social.published().len(), 2);
    assert_eq!(harness.social.published()[1].id, orphan_post_id);
    let games = harness.store.inner.games().await;
    assert_eq!(games.len(), 1);
    assert_eq!(games[0].id, game_id);
}

#[tokio::test]
async fn unusable_verdicts_close_without_winner() {
    let harness = Harness::new(&[r#"{"reply_id": "nope"}"#]);
    let controller = harness.controller();
    let (game_id, post_id) = open(&controller).await;
    harness.social.add_reply(
        &post_id,
        reply("alice", "r1", &format!("hello {ALICE_WALLET}"), 15),
    );
    controller.collect().await.unwrap();
    harness.expire(game_id).await;

    let outcome = controller.maybe_close().await.unwrap();

    assert!(matches!(
        outcome,
        CloseOutcome::Closed {
            winner_entry_id: None,
            ..
        }
    ));
    assert_eq!(harness.reasoner.calls(), 2);
    let game = harness.game(game_id).await;
    assert_eq!(game.status, GameStatus::Closed);
    assert_eq!(game.winner_entry_id, None);
    assert!(game.judge_reasoning.is_some());
    // The no-winner notice is still posted.
    assert_eq!(harness.social.replies_to(&post_id).len(), 1);
}

#[tokio::test]
async fn unusable_verdicts_mark_error_when_configured() {
    let mut config = base_config();
    config.judge.failure_policy = JudgeFailurePolicy::MarkError;
    let harness = Harness::with_config(config, &["I cannot decide."]);
    let controller = harness.controller();
    let (game_id, post_id) = open(&controller).await;
    harness.social.add_reply(
        &post_id,
        reply("alice", "r1", &format!("hello {ALICE_WALLET}"), 15),
    );
    controller.collect().await.unwrap();
    harness.expire(game_id).await;

    let outcome = controller.maybe_close().await.unwrap();

    assert!(matches!(outcome, CloseOutcome::MarkedError { .. }));
    let game = harness.game(game_id).await;
    assert_eq!(game.status, GameStatus::Error);
    assert!(game.error_reason.is_some());
    assert_eq!(harness.store.close_calls(), 0);
    assert!(harness.social.replies_to(&post_id).is_empty());
}

#[tokio::test]
async fn game_without_valid_entries_skips_the_judge() {
    let harness = Harness::new(&[]);
    let controller = harness.controller();
    let (game_id, post_id) = open(&controller).await;
    // No wallet address, so the entry is stored but invalid.
    harness
        .social
        .add_reply(&post_id, reply("alice", "r1", "great game", 15));
    controller.collect().await.unwrap();
    harness.expire(game_id).await;

    let outcome = controller.maybe_close().await.unwrap();

    assert!(matches!(
        outcome,
        CloseOutcome::Closed {
            winner_entry_id: None,
            ..
        }
    ));
    assert_eq!(harness.reasoner.calls(), 0);
    let game = harness.game(game_id).await;
    assert_eq!(game.entries.len(), 1);
    assert!(!game.entries[0].valid);
    assert_eq!(game.status, GameStatus::Closed);
}

#[tokio::test]
async fn persistent_close_failure_escalates_to_error() {
    let harness = Harness::new(&[r#"{"reply_id": "r1"}"#]);
    let controller = harness.controller();
    let (game_id, post_id) = open(&controller).await;
    harness.social.add_reply(
        &post_id,
        reply("alice", "r1", &format!("hello {ALICE_WALLET}"), 15),
    );
    controller.collect().await.unwrap();
    harness.expire(game_id).await;
    harness.store.refuse_close.store(true, Ordering::SeqCst);

    let outcome = controller.maybe_close().await.unwrap();

    assert!(matches!(outcome, CloseOutcome::MarkedError { .. }));
    // Every retry attempt reached the store.
    assert_eq!(harness.store.close_calls(), 2);
    let game = harness.game(game_id).await;
    assert_eq!(game.status, GameStatus::Error);
    assert!(harness.social.replies_to(&post_id).is_empty());
    assert_eq!(controller.maybe_close().await.unwrap(), CloseOutcome::NoOpenGame);
}

#[tokio::test]
async fn game_not_yet_due_is_left_open() {
    let harness = Harness::new(&[]);
    let controller = harness.controller();
    let (game_id, _) = open(&controller).await;

    assert_eq!(
        controller.maybe_close().await.unwrap(),
        CloseOutcome::NotDue { game_id }
    );
    assert_eq!(harness.store.close_calls(), 0);
    assert_eq!(harness.game(game_id).await.status, GameStatus::Open);
}

#[tokio::test]
async fn raw_closed_game_is_not_reopened_by_collect() {
    let harness = Harness::new(&[]);
    let now = truncate_to_millis(SystemTime::now());
    let mut game = Game::open(NewGame {
        game_type: GameType::FunFact,
        prompt_text: "share a fact".into(),
        post_id: "root".into(),
        opened_at: now - Duration::from_secs(60),
        closes_at: now + Duration::from_secs(60),
    });
    game.status = GameStatus::Closed;
    game.closed_at = Some(now);
    harness.store.inner.insert_raw(game).await;

    let controller = harness.controller();
    assert_eq!(controller.collect().await.unwrap(), CollectOutcome::NoOpenGame);
    assert_eq!(harness.social.fetch_calls(), 0);
}

/// Run one close tick of an expired game with one valid entry while the
/// platform and the model hang, inside the configured tick budget.
async fn close_while_stalled(policy: JudgeFailurePolicy) -> (Harness, Uuid, CloseOutcome) {
    let mut config = AppConfig::default();
    config.game.duration = GameDuration::Fixed {
        seconds: GAME_LENGTH,
    };
    config.judge.failure_policy = policy;
    let harness = Harness::with_config(config, &[]);
    let controller = harness.controller();
    let (game_id, post_id) = open(&controller).await;
    harness.social.add_reply(
        &post_id,
        reply("alice", "r1", &format!("hello {ALICE_WALLET}"), 15),
    );
    controller.collect().await.unwrap();
    harness.expire(game_id).await;

    let stalled = LifecycleController::new(
        harness.config.clone(),
        Arc::new(harness.store.clone()),
        Arc::new(Stalled),
        Arc::new(Stalled),
    );
    let budget = harness.config.schedule.tick_timeout;
    let started = Instant::now();
    let outcome = timeout(budget, stalled.maybe_close())
        .await
        .expect("close tick outlived tick_timeout")
        .unwrap();
    assert!(started.elapsed() <= harness.config.close_tick_budget());
    (harness, game_id, outcome)
}

#[tokio::test(start_paused = true)]
async fn hung_platform_and_model_still_close_within_the_tick() {
    let (harness, game_id, outcome) =
        close_while_stalled(JudgeFailurePolicy::CloseWithoutWinner).await;

    assert!(matches!(
        outcome,
        CloseOutcome::Closed {
            winner_entry_id: None,
            announcement_post_id: None,
            ..
        }
    ));
    let game = harness.game(game_id).await;
    assert_eq!(game.status, GameStatus::Closed);
    assert!(game.judge_reasoning.is_some());
}

#[tokio::test(start_paused = true)]
async fn hung_platform_and_model_escalate_within_the_tick() {
    let (harness, game_id, outcome) = close_while_stalled(JudgeFailurePolicy::MarkError).await;

    assert!(matches!(outcome, CloseOutcome::MarkedError { .. }));
    let game = harness.game(game_id).await;
    assert_eq!(game.status, GameStatus::Error);
    assert_eq!(harness.store.close_calls(), 0);
}

#[tokio::test]
async fn follower_threshold_uses_author_profiles() {
    let mut config = base_config();
    config.entries.min_followers = Some(100);
    let harness = Harness::with_config(config, &[]);
    let controller = harness.controller();
    let (game_id, post_id) = open(&controller).await;
    harness.social.add_user(profile("alice", 500));
    harness.social.add_user(profile("bob", 10));
    // carol has no profile: suspended or deleted account.
    harness.social.add_reply(
        &post_id,
        reply("alice", "r1", &format!("pick me {ALICE_WALLET}"), 15),
    );
    harness.social.add_reply(
        &post_id,
        reply("bob", "r2", &format!("me too {BOB_WALLET}"), 14),
    );
    harness.social.add_reply(
        &post_id,
        reply("carol", "r3", &format!("and me {BOB_WALLET}"), 13),
    );

    let outcome = controller.collect().await.unwrap();

    assert_eq!(
        outcome,
        CollectOutcome::Collected {
            game_id,
            fetched: 3,
            appended: 3,
        }
    );
    let game = harness.game(game_id).await;
    let verdicts: Vec<_> = game
        .entries
        .iter()
        .map(|entry| (entry.external_id.as_str(), entry.valid, entry.rejection.as_deref()))
        .collect();
    assert_eq!(
        verdicts,
        [
            ("r1", true, None),
            ("r2", false, Some("author has 10 followers, 100 required")),
            ("r3", false, Some("author profile unavailable")),
        ]
    );

    // Rejected authors are settled; later ticks do not revisit them.
    controller.collect().await.unwrap();
    assert_eq!(harness.game(game_id).await.entries.len(), 3);
}

#[tokio::test]
async fn unreachable_profile_defers_the_entry() {
    let mut config = base_config();
    config.entries.min_followers = Some(100);
    let harness = Harness::with_config(config, &[]);
    let controller = harness.controller();
    let (game_id, post_id) = open(&controller).await;
    harness.social.add_user(profile("alice", 500));
    harness.social.add_reply(
        &post_id,
        reply("alice", "r1", &format!("pick me {ALICE_WALLET}"), 15),
    );
    // Both attempts of the first tick are rate limited.
    harness.social.fail_next_user_lookups(2);

    assert_eq!(
        controller.collect().await.unwrap(),
        CollectOutcome::Collected {
            game_id,
            fetched: 1,
            appended: 0,
        }
    );
    assert!(harness.game(game_id).await.entries.is_empty());

    controller.collect().await.unwrap();
    let game = harness.game(game_id).await;
    assert_eq!(game.entries.len(), 1);
    assert!(game.entries[0].valid);
}
