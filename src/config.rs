//! Application configuration: JSON file, environment overrides, CLI overrides, validation.

use std::{
    env, fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};
use thiserror::Error;
use tracing::info;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::{
    dao::models::GameType,
    services::{
        entries::EntryRules,
        judge::JudgeSettings,
        lifecycle::JudgeFailurePolicy,
        retry::RetryPolicy,
        trigger::{TimerInterval, TimerPolicy, validate_timer},
    },
};

/// Default location on disk where the service looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "DRAWI_CONFIG_PATH";

/// Configuration could not be assembled.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file exists but cannot be read.
    #[error("failed to read config file `{path}`")]
    Read {
        /// File location.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The config file is not valid JSON for [`AppConfig`].
    #[error("failed to parse config file `{path}`")]
    Parse {
        /// File location.
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    /// An override variable holds an unusable value.
    #[error("invalid value `{value}` for `{var}`: expected {expected}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
        /// What was expected instead.
        expected: &'static str,
    },
    /// The assembled configuration breaks a constraint.
    #[error("invalid configuration: {0}")]
    Invalid(#[from] ValidationErrors),
}

/// How long a game stays open.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum GameDuration {
    /// Every game lasts `seconds`.
    Fixed {
        /// Duration in seconds.
        #[serde_as(as = "DurationSeconds<u64>")]
        seconds: Duration,
    },
    /// A random duration in `[min, max]`, rounded down to a multiple of `step` above `min`.
    Range {
        /// Shortest game, in seconds.
        #[serde_as(as = "DurationSeconds<u64>")]
        min: Duration,
        /// Longest game, in seconds.
        #[serde_as(as = "DurationSeconds<u64>")]
        max: Duration,
        /// Granularity in seconds; zero for any second.
        #[serde_as(as = "DurationSeconds<u64>")]
        #[serde(default)]
        step: Duration,
    },
}

impl Default for GameDuration {
    /// Half an hour to three hours, in half-hour steps.
    fn default() -> Self {
        GameDuration::Range {
            min: Duration::from_secs(30 * 60),
            max: Duration::from_secs(180 * 60),
            step: Duration::from_secs(30 * 60),
        }
    }
}

impl GameDuration {
    /// Draw the duration of a new game.
    pub fn sample(&self) -> Duration {
        match *self {
            GameDuration::Fixed { seconds } => seconds,
            GameDuration::Range { min, max, .. } if max <= min => min,
            GameDuration::Range { min, max, step } => {
                let span = (max - min).as_secs();
                let step = step.as_secs();
                let mut rng = rand::rng();
                let offset = if step == 0 {
                    rng.random_range(0..=span)
                } else {
                    rng.random_range(0..=span / step) * step
                };
                min + Duration::from_secs(offset)
            }
        }
    }
}

fn validate_duration(duration: &GameDuration) -> Result<(), ValidationError> {
    let valid = match *duration {
        GameDuration::Fixed { seconds } => !seconds.is_zero(),
        GameDuration::Range { min, max, .. } => !min.is_zero() && min <= max,
    };
    if valid {
        Ok(())
    } else {
        let mut err = ValidationError::new("game_duration");
        err.message = Some("game duration must be positive with min <= max".into());
        Err(err)
    }
}

/// What gets opened and how it is announced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct GameSettings {
    /// Open games automatically; `false` leaves only collecting and closing running.
    pub auto_open: bool,
    /// How long each game stays open.
    #[validate(custom(function = "validate_duration"))]
    pub duration: GameDuration,
    /// Game types to draw from; empty means the whole catalog.
    pub game_types: Vec<GameType>,
    /// Prize line of the prompt.
    #[validate(length(min = 1))]
    pub prize: String,
    /// Post a notice when a game closes without a winner.
    pub announce_no_winner: bool,
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            auto_open: true,
            duration: GameDuration::default(),
            game_types: Vec::new(),
            prize: "0.1 SOL.".into(),
            announce_no_winner: true,
        }
    }
}

/// Timers of the trigger driver.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ScheduleSettings {
    /// Timer of the open tick.
    #[validate(custom(function = "validate_timer"))]
    pub open: TimerPolicy,
    /// Timer of the collect tick.
    #[validate(custom(function = "validate_timer"))]
    pub collect: TimerPolicy,
    /// Timer of the close tick.
    #[validate(custom(function = "validate_timer"))]
    pub close: TimerPolicy,
    /// Budget of a whole tick, in seconds.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub tick_timeout: Duration,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            open: TimerPolicy::fixed(Duration::from_secs(240)),
            collect: TimerPolicy::fixed(Duration::from_secs(120)),
            close: TimerPolicy::fixed(Duration::from_secs(240)),
            tick_timeout: Duration::from_secs(300),
        }
    }
}

/// Judge behavior.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct JudgeConfig {
    /// Valid entries shown to the model, in arrival order.
    #[validate(range(min = 1, max = 1000))]
    pub max_entries_considered: usize,
    /// Free-text instructions appended to the catalog ones.
    pub custom_instructions: Option<String>,
    /// What happens when the judge gives no usable answer.
    pub failure_policy: JudgeFailurePolicy,
    /// Budget of one reasoning call, in seconds.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub call_timeout: Duration,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            max_entries_considered: 100,
            custom_instructions: None,
            failure_policy: JudgeFailurePolicy::default(),
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl JudgeConfig {
    /// Settings handed to [`crate::services::judge::Judge`].
    pub fn settings(&self) -> JudgeSettings {
        JudgeSettings {
            max_entries_considered: self.max_entries_considered,
            custom_instructions: self.custom_instructions.clone(),
            call_timeout: self.call_timeout,
        }
    }
}

/// Retry budgets of the external boundaries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Social platform calls.
    pub social: RetryPolicy,
    /// Game store calls.
    pub store: RetryPolicy,
}

/// Background store health monitor.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Delay between health checks while healthy, in seconds.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub interval: Duration,
    /// Reconnect attempts before going back to plain health checks.
    pub reconnect_attempts: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            reconnect_attempts: 3,
        }
    }
}

/// Calls of a close tick bounded by `io_timeout` besides the judge: the phase
/// read, the final collection, the reload, the close or escalation write and the
/// announcement.
const CLOSE_TICK_IO_CALLS: u32 = 5;

/// Immutable runtime configuration shared across the service.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_close_budget"))]
#[serde(default)]
pub struct AppConfig {
    /// Games.
    #[validate(nested)]
    pub game: GameSettings,
    /// Timers.
    #[validate(nested)]
    pub schedule: ScheduleSettings,
    /// Entry validity rules.
    #[validate(nested)]
    pub entries: EntryRules,
    /// Judge.
    #[validate(nested)]
    pub judge: JudgeConfig,
    /// Retry budgets.
    pub retry: RetrySettings,
    /// Budget of any single external call, in seconds.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub io_timeout: Duration,
    /// Store health monitor.
    pub store_monitor: MonitorSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            game: GameSettings::default(),
            schedule: ScheduleSettings::default(),
            entries: EntryRules::default(),
            judge: JudgeConfig::default(),
            retry: RetrySettings::default(),
            io_timeout: Duration::from_secs(30),
            store_monitor: MonitorSettings::default(),
        }
    }
}

fn validate_close_budget(config: &AppConfig) -> Result<(), ValidationError> {
    let needed = config.close_tick_budget();
    if config.schedule.tick_timeout >= needed {
        Ok(())
    } else {
        let mut err = ValidationError::new("tick_timeout");
        err.message = Some(
            format!(
                "tick_timeout must be at least {}s so a close tick reaches its final write",
                needed.as_secs()
            )
            .into(),
        );
        Err(err)
    }
}

/// Overrides given on the command line.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    /// Replaces the open and close intervals.
    pub game_interval: Option<Duration>,
}

impl AppConfig {
    /// Longest a close tick runs when the store answers and every other call
    /// hits its timeout.
    pub fn close_tick_budget(&self) -> Duration {
        self.io_timeout * CLOSE_TICK_IO_CALLS + self.judge.settings().worst_case()
    }

    /// Assemble the configuration: file (or defaults), then environment, then CLI, then validate.
    pub fn load(cli: &CliOverrides) -> Result<Self, ConfigError> {
        let path = resolve_config_path();
        let mut config = Self::from_file(&path)?;
        config.apply_env(|var| env::var(var).ok())?;
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    /// Read `path`, falling back to defaults when it does not exist.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config = serde_json::from_str::<Self>(&contents).map_err(|source| {
                    ConfigError::Parse {
                        path: path.to_owned(),
                        source,
                    }
                })?;
                info!(path = %path.display(), "loaded configuration file");
                Ok(config)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "config file not found; using built-in defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_owned(),
                source,
            }),
        }
    }

    /// Apply the deployment variables (`START_GAME_SCHEDULE`, `CLOSE_GAME_SCHEDULE`,
    /// `GAME_DURATION`, `CREATE_GAME_ON_STARTUP`, `DISABLE_CREATE_GAME`, `JUDGE_INSTRUCTIONS`).
    ///
    /// Empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let read = |var: &'static str| {
            lookup(var)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
                .map(|value| (var, value))
        };

        if let Some((var, value)) = read("START_GAME_SCHEDULE") {
            self.schedule.open.interval = TimerInterval::Fixed {
                every: parse_seconds(var, &value)?,
            };
        }
        if let Some((var, value)) = read("CLOSE_GAME_SCHEDULE") {
            self.schedule.close.interval = TimerInterval::Fixed {
                every: parse_seconds(var, &value)?,
            };
        }
        if let Some((var, value)) = read("GAME_DURATION") {
            self.game.duration = GameDuration::Fixed {
                seconds: parse_seconds(var, &value)?,
            };
        }
        if let Some((var, value)) = read("CREATE_GAME_ON_STARTUP") {
            self.schedule.open.run_on_startup = parse_flag(var, &value)?;
        }
        if let Some((var, value)) = read("DISABLE_CREATE_GAME") {
            self.game.auto_open = !parse_flag(var, &value)?;
        }
        if let Some((_, value)) = read("JUDGE_INSTRUCTIONS") {
            self.judge.custom_instructions = Some(value);
        }
        Ok(())
    }

    /// Apply command-line overrides, which win over everything else.
    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(every) = cli.game_interval {
            self.schedule.open.interval = TimerInterval::Fixed { every };
            self.schedule.close.interval = TimerInterval::Fixed { every };
        }
    }
}

fn parse_seconds(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    value
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| ConfigError::InvalidEnv {
            var,
            value: value.to_owned(),
            expected: "a whole number of seconds",
        })
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            value: value.to_owned(),
            expected: "true/false, 1/0 or yes/no",
        }),
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
