//! drawi-back binary entrypoint wiring the game store, the social platform,
//! the judge and the lifecycle timers.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use drawi_back::{
    config::{AppConfig, CliOverrides},
    dao::game_store::{GameStore, memory::MemoryGameStore},
    reasoning::{OpenAiConfig, OpenAiReasoner, Reasoner},
    services::{
        lifecycle::LifecycleController,
        store_monitor,
        trigger::{TickKind, TriggerDriver},
    },
    social::{MemorySocialClient, SocialClient, XClient, XConfig},
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StoreBackend {
    Mongo,
    Couch,
    Memory,
}

/// Runs reply-to-win contests on a social platform.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Interval in seconds between open and close ticks; overrides the configured schedule.
    #[arg(long, value_name = "SECS")]
    game_interval: Option<u64>,
    /// Publish to an in-memory timeline instead of the real platform.
    #[arg(long)]
    dry_run: bool,
    /// Where games are persisted.
    #[arg(long, env = "STORE_BACKEND", value_enum, default_value = "mongo")]
    store: StoreBackend,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let cli = CliOverrides {
        game_interval: args.game_interval.map(Duration::from_secs),
    };
    let mut config = AppConfig::load(&cli).context("loading configuration")?;

    let social: Arc<dyn SocialClient> = if args.dry_run {
        info!("dry run: posts stay in memory");
        Arc::new(MemorySocialClient::new())
    } else {
        let x_config = XConfig::from_env().context("reading X credentials")?;
        config.entries.bot_account_id = Some(x_config.user_id.clone());
        Arc::new(XClient::new(x_config).context("building X client")?)
    };

    let reasoner: Arc<dyn Reasoner> = Arc::new(
        OpenAiReasoner::new(OpenAiConfig::from_env().context("reading OpenAI settings")?)
            .context("building OpenAI client")?,
    );

    let store = connect_store(args.store).await?;
    let config = Arc::new(config);

    let controller = LifecycleController::new(config.clone(), store.clone(), social, reasoner);
    let mut driver = TriggerDriver::new(Arc::new(controller), config.schedule.tick_timeout)
        .with_timer(TickKind::Collect, config.schedule.collect)
        .with_timer(TickKind::Close, config.schedule.close);
    if config.game.auto_open {
        driver = driver.with_timer(TickKind::Open, config.schedule.open);
    } else {
        info!("automatic game creation disabled");
    }

    let (stop, shutdown) = watch::channel(false);
    let monitor = tokio::spawn(store_monitor::run(
        store,
        config.store_monitor.clone(),
        shutdown.clone(),
    ));
    let timers = tokio::spawn(driver.run(shutdown));

    shutdown_signal().await;
    info!("shutdown requested; letting in-flight ticks finish");
    if stop.send(true).is_err() {
        warn!("no task was listening for shutdown");
    }

    timers.await.context("joining timers")?;
    monitor.await.context("joining storage monitor")?;
    info!("bye");
    Ok(())
}

async fn connect_store(backend: StoreBackend) -> anyhow::Result<Arc<dyn GameStore>> {
    match backend {
        StoreBackend::Memory => {
            warn!("games are kept in memory and lost on restart");
            Ok(Arc::new(MemoryGameStore::new()))
        }
        #[cfg(feature = "mongo-store")]
        StoreBackend::Mongo => {
            use drawi_back::dao::game_store::mongodb::{MongoConfig, MongoGameStore};

            let config = MongoConfig::from_env().await.context("reading MongoDB settings")?;
            let store = MongoGameStore::connect(config)
                .await
                .context("connecting to MongoDB")?;
            info!("connected to MongoDB");
            Ok(Arc::new(store))
        }
        #[cfg(feature = "couch-store")]
        StoreBackend::Couch => {
            use drawi_back::dao::game_store::couchdb::{CouchConfig, CouchGameStore};

            let config = CouchConfig::from_env().context("reading CouchDB settings")?;
            let store = CouchGameStore::connect(config)
                .await
                .context("connecting to CouchDB")?;
            info!("connected to CouchDB");
            Ok(Arc::new(store))
        }
        #[allow(unreachable_patterns)]
        other => bail!("store backend {other:?} is not compiled into this build"),
    }
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,drawi_back=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM; waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
