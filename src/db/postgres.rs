//! Postgres backend for the `Store` trait.
//!
//! Follows the teacher's `db::postgres::api_keys` convention: runtime
//! `sqlx::query` (not `query_as!`) plus manual `row.get`, so the schema can
//! evolve without a compile-time `DATABASE_URL`.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{DbResult, Store};
use crate::models::{AccessKey, AccessKeyStatus, BedrockKey, UsageAggregateDelta, UsageRow};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> DbResult<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    fn parse_access_key(row: &sqlx::postgres::PgRow) -> AccessKey {
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
impl Store for PostgresStore {
    async fn find_active_access_key_by_hash(&self, key_hash: &str) -> DbResult<Option<AccessKey>> {
        let row = sqlx::query(
            "SELECT ak.id, ak.user_id, ak.key_hash, ak.key_prefix, ak.status, \
             ak.bedrock_region, ak.bedrock_model, ak.created_at, ak.updated_at \
             FROM access_keys ak \
             JOIN users u ON u.id = ak.user_id \
             WHERE ak.key_hash = $1 AND ak.status = 'active' AND u.deleted_at IS NULL",
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Self::parse_access_key(&r)))
    }

    async fn has_bedrock_key(&self, access_key_id: Uuid) -> DbResult<bool> {
        let row = sqlx::query("SELECT 1 FROM bedrock_keys WHERE access_key_id = $1")
            .bind(access_key_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn get_bedrock_key(&self, access_key_id: Uuid) -> DbResult<Option<BedrockKey>> {
        let row = sqlx::query(
            "SELECT access_key_id, ciphertext, key_hash, created_at, updated_at \
             FROM bedrock_keys WHERE access_key_id = $1",
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
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)",
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
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8) \
             ON CONFLICT (bucket_type, bucket_start, user_id, access_key_id) \
             DO UPDATE SET \
               input_tokens = usage_aggregates.input_tokens + EXCLUDED.input_tokens, \
               output_tokens = usage_aggregates.output_tokens + EXCLUDED.output_tokens, \
               total_tokens = usage_aggregates.total_tokens + EXCLUDED.total_tokens, \
               request_count = usage_aggregates.request_count + EXCLUDED.request_count",
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
