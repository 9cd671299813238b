use super::error::{CouchDaoError, CouchResult};

const DEFAULT_DB: &str = "drawi_games";
const DEFAULT_MAX_UPDATE_ATTEMPTS: u32 = 8;

/// Runtime configuration describing how to connect to CouchDB.
#[derive(Debug, Clone)]
pub struct CouchConfig {
    pub base_url: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Optimistic update attempts before a contended write gives up.
    pub max_update_attempts: u32,
}

impl CouchConfig {
    pub fn new(base_url: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            database: database.into(),
            username: None,
            password: None,
            max_update_attempts: DEFAULT_MAX_UPDATE_ATTEMPTS,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Read `COUCH_BASE_URL` (required), `COUCH_DB`, `COUCH_USERNAME` and `COUCH_PASSWORD`.
    pub fn from_env() -> CouchResult<Self> {
        let base_url =
            std::env::var("COUCH_BASE_URL").map_err(|_| CouchDaoError::MissingEnvVar {
                var: "COUCH_BASE_URL",
            })?;
        let database = std::env::var("COUCH_DB").unwrap_or_else(|_| DEFAULT_DB.to_owned());

        let mut config = Self::new(base_url, database);

        if let (Some(username), Some(password)) = (
            std::env::var("COUCH_USERNAME").ok(),
            std::env::var("COUCH_PASSWORD").ok(),
        ) {
            config = config.with_credentials(username, password);
        }

        Ok(config)
    }
}
