pub mod config;
mod connection;
mod error;
mod models;
pub mod store;

pub use config::MongoConfig;
pub use error::MongoDaoError;
pub use store::MongoGameStore;

use crate::dao::storage::StoreError;

impl From<MongoDaoError> for StoreError {
    fn from(err: MongoDaoError) -> Self {
        StoreError::unavailable(err.to_string(), err)
    }
}
