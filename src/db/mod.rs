//! Store (A3): the relational-persistence seam C1/C8/C9 depend on.
//!
//! Two backends are supported, selected by the `database-postgres` /
//! `database-sqlite` features and the scheme of `database.url`, mirroring
//! the teacher's `db::postgres` / `db::sqlite` split — one trait, one
//! implementation per backend.

#[cfg(feature = "database-postgres")]
pub mod postgres;
#[cfg(feature = "database-sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    errors::DbError,
    models::{AccessKey, BedrockKey, UsageAggregateDelta, UsageRow},
};

pub type DbResult<T> = Result<T, DbError>;

/// Persistence seam consumed by the Authenticator (C1), the usage recorder
/// (C8) and the key material cache's loader (C9).
#[async_trait]
pub trait Store: Send + Sync {
    /// Look up an active access key by its salted fingerprint, joined
    /// against the owning user to reject deleted users (§3 User, §8
    /// scenario 6).
    async fn find_active_access_key_by_hash(&self, key_hash: &str) -> DbResult<Option<AccessKey>>;

    /// Whether a Bedrock credential exists for this access key, without
    /// loading or decrypting it.
    async fn has_bedrock_key(&self, access_key_id: Uuid) -> DbResult<bool>;

    /// Load the encrypted Bedrock credential row.
    async fn get_bedrock_key(&self, access_key_id: Uuid) -> DbResult<Option<BedrockKey>>;

    /// Insert a usage row. Callers only invoke this when §4.8's persistence
    /// condition holds.
    async fn insert_usage_row(&self, row: &UsageRow) -> DbResult<()>;

    /// Upsert-add a usage aggregate bucket (§3 UsageAggregate, §4.8).
    async fn upsert_usage_aggregate(&self, delta: &UsageAggregateDelta) -> DbResult<()>;
}

/// Build the store implementation for `database_url`, dispatching on its
/// URL scheme the way the teacher's `db::mod::build_pool` picks a backend
/// from `DatabaseConfig`.
pub async fn connect(database_url: &str) -> DbResult<std::sync::Arc<dyn Store>> {
    #[cfg(feature = "database-postgres")]
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        let store = postgres::PostgresStore::connect(database_url).await?;
        return Ok(std::sync::Arc::new(store));
    }
    #[cfg(feature = "database-sqlite")]
    if database_url.starts_with("sqlite://") {
        let store = sqlite::SqliteStore::connect(database_url).await?;
        return Ok(std::sync::Arc::new(store));
    }
    Err(DbError::UnsupportedScheme)
}
