//! SQLite backend for the `Store` trait — same shape as `db::postgres`,
//! with `?` placeholders and SQLite's `ON CONFLICT ... DO UPDATE` syntax.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{DbResult, Store};
use crate::models::{AccessKey, AccessKeyStatus, BedrockKey, UsageAggregateDelta, UsageRow};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> DbResult<Self> {
        let pool = SqlitePool::connect(database_url).await?;
        Ok(Self { pool })
    }

    fn parse_access_key(row: &sqlx::sqlite::SqliteRow) -> AccessKey {
        let status: String = row.get("status");
        AccessKey {
            id: row.get("id"),
            user_id: row.get("user_id"),
            key_hash: row.get("key_hash"),
            key_prefix: row.get("key_prefix"),
            status: if status == "active" {
                AccessKeyStatus::Active
            } else {
                AccessKeyStatus::Revoked
            },
            bedrock_region: row.get("bedrock_region"),
            bedrock_model: row.get("bedrock_model"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn find_active_access_key_by_hash(&self, key_hash: &str) -> DbResult<Option<AccessKey>> {
        let row = sqlx::query(
            "SELECT ak.id, ak.user_id, ak.key_hash, ak.key_prefix, ak.status, \
             ak.bedrock_region, ak.bedrock_model, ak.created_at, ak.updated_at \
             FROM access_keys ak \
             JOIN users u ON u.id = ak.user_id \
             WHERE ak.key_hash = ? AND ak.status = 'active' AND u.deleted_at IS NULL",
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Self::parse_access_key(&r)))
    }

    async fn has_bedrock_key(&self, access_key_id: Uuid) -> DbResult<bool> {
        let row = sqlx::query("SELECT 1 FROM bedrock_keys WHERE access_key_id = ?")
            .bind(access_key_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn get_bedrock_key(&self, access_key_id: Uuid) -> DbResult<Option<BedrockKey>> {
        let row = sqlx::query(
            "SELECT access_key_id, ciphertext, key_hash, created_at, updated_at \
             FROM bedrock_keys WHERE access_key_id = ?",
        )
        .bind(access_key_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| BedrockKey {
            access_key_id: r.get("access_key_id"),
            ciphertext: r.get("ciphertext"),
            key_hash: r.get("key_hash"),
            created_at: r.get("created_at"),
            updated_at: r.get("updated_at"),
        }))
    }

    async fn insert_usage_row(&self, row: &UsageRow) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO usage_rows \
             (id, request_id, timestamp, user_id, access_key_id, model, \
              input_tokens, output_tokens, total_tokens, \
              cache_read_input_tokens, cache_creation_input_tokens, \
              provider, is_fallback, latency_ms) \
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(row.id)
        .bind(&row.request_id)
        .bind(row.timestamp)
        .bind(row.user_id)
        .bind(row.access_key_id)
        .bind(&row.model)
        .bind(row.input_tokens)
        .bind(row.output_tokens)
        .bind(row.total_tokens)
        .bind(row.cache_read_input_tokens)
        .bind(row.cache_creation_input_tokens)
        .bind(row.provider.as_str())
        .bind(row.is_fallback)
        .bind(row.latency_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_usage_aggregate(&self, delta: &UsageAggregateDelta) -> DbResult<()> {
        sqlx::query(
            "INSERT INTO usage_aggregates \
             (bucket_type, bucket_start, user_id, access_key_id, \
              input_tokens, output_tokens, total_tokens, request_count) \
             VALUES (?,?,?,?,?,?,?,?) \
             ON CONFLICT(bucket_type, bucket_start, user_id, access_key_id) \
             DO UPDATE SET \
               input_tokens = input_tokens + excluded.input_tokens, \
               output_tokens = output_tokens + excluded.output_tokens, \
               total_tokens = total_tokens + excluded.total_tokens, \
               request_count = request_count + excluded.request_count",
        )
        .bind(delta.bucket_type.as_str())
        .bind(delta.bucket_start)
        .bind(delta.user_id)
        .bind(delta.access_key_id)
        .bind(delta.input_tokens)
        .bind(delta.output_tokens)
        .bind(delta.total_tokens)
        .bind(delta.request_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
