use std::time::Duration;

use mongodb::{Client, Database, bson::doc, options::ClientOptions};

use super::error::{MongoDaoError, MongoResult};
use crate::services::retry::{RetryPolicy, retry};

const CONNECT_RETRY: RetryPolicy =
    RetryPolicy::new(10, Duration::from_millis(250), Duration::from_secs(5));

/// Build a pooled client and wait until the server answers a ping.
pub async fn establish_connection(
    options: &ClientOptions,
    database_name: &str,
) -> MongoResult<(Client, Database)> {
    let client = Client::with_options(options.clone())
        .map_err(|source| MongoDaoError::ClientConstruction { source })?;
    let database = client.database(database_name);

    retry(&CONNECT_RETRY, "mongodb initial ping", |_| true, || {
        let database = database.clone();
        async move { database.run_command(doc! { "ping": 1 }).await }
    })
    .await
    .map_err(|source| MongoDaoError::InitialPing {
        attempts: CONNECT_RETRY.max_attempts,
        source,
    })?;

    Ok((client, database))
}
