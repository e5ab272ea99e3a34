//! Usage recorder (C8, §4.8).
//!
//! Grounded on `original_source`'s `UsageRecorder.record` /
//! `_get_bucket_start`: a structured log line every time, a fire-and-forget
//! metric, and — only for a successful Bedrock response carrying usage — a
//! persisted `UsageRow` plus one aggregate upsert per bucket granularity.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use uuid::Uuid;

use crate::{
    config::{UsageConfig, WeekStart},
    db::Store,
    metrics::{MetricsSink, UsageMetric},
    models::{BucketType, Provider, ProxyResponse, RequestContext, UsageAggregateDelta, UsageRow},
};

pub struct UsageRecorder {
    store: Arc<dyn Store>,
    metrics: Arc<dyn MetricsSink>,
    config: UsageConfig,
}

impl UsageRecorder {
    pub fn new(store: Arc<dyn Store>, metrics: Arc<dyn MetricsSink>, config: UsageConfig) -> Self {
        Self {
            store,
            metrics,
            config,
        }
    }

    /// §4.8: always log, always emit a metric, persist iff the persistence
    /// condition holds.
    pub async fn record(
        &self,
        ctx: &RequestContext,
        response: &ProxyResponse,
        latency_ms: i64,
        model: &str,
    ) {
        tracing::info!(
            request_id = %ctx.request_id,
            access_key_prefix = %ctx.access_key_prefix,
            provider = response.provider.as_str(),
            is_fallback = response.is_fallback,
            status_code = response.http_status,
            error_kind = response.error_kind.map(|k| k.public_type()),
            latency_ms = latency_ms,
            model = model,
            "request_completed"
        );

        let metric = UsageMetric {
            provider: response.provider,
            model: model.to_string(),
            is_fallback: response.is_fallback,
            success: response.success,
            latency_ms,
            input_tokens: response.usage.map(|u| u.input_tokens).unwrap_or(0),
            output_tokens: response.usage.map(|u| u.output_tokens).unwrap_or(0),
        };
        self.metrics.record(metric).await;

        if !self.should_persist(response) {
            return;
        }
        let usage = response.usage.expect("should_persist verified usage is Some");
        let now = Utc::now();

        let row = UsageRow {
            id: Uuid::new_v4(),
            request_id: ctx.request_id.clone(),
            timestamp: now,
            user_id: ctx.user_id,
            access_key_id: ctx.access_key_id,
            model: model.to_string(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.total(),
            cache_read_input_tokens: usage.cache_read_input_tokens,
            cache_creation_input_tokens: usage.cache_creation_input_tokens,
            provider: response.provider,
            is_fallback: response.is_fallback,
            latency_ms,
        };

        if let Err(e) = self.store.insert_usage_row(&row).await {
            tracing::error!(error = %e, request_id = %ctx.request_id, "failed to persist usage row");
            return;
        }

        for bucket_type in BucketType::ALL {
            let bucket_start = self.bucket_start(now, bucket_type);
            let delta = UsageAggregateDelta {
                bucket_type,
                bucket_start,
                user_id: ctx.user_id,
                access_key_id: ctx.access_key_id,
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                total_tokens: usage.total(),
                request_count: 1,
            };
            if let Err(e) = self.store.upsert_usage_aggregate(&delta).await {
                tracing::error!(
                    error = %e,
                    bucket_type = bucket_type.as_str(),
                    "failed to upsert usage aggregate"
                );
            }
        }
    }

    /// §4.8 persistence condition: Bedrock, success, usage present.
    fn should_persist(&self, response: &ProxyResponse) -> bool {
        response.success && response.provider == Provider::Bedrock && response.usage.is_some()
    }

    /// §4.8 bucket truncation, with the week start and time zone configurable
    /// (§9 Open Question 1: default Monday UTC). Truncation happens in the
    /// configured local time: shift by `week_start_tz_offset_hours`, floor to
    /// the bucket boundary, then shift back so the result is a true UTC instant.
    fn bucket_start(&self, ts: DateTime<Utc>, bucket_type: BucketType) -> DateTime<Utc> {
        let offset = ChronoDuration::hours(self.config.week_start_tz_offset_hours as i64);
        let local = ts + offset;

        let local_truncated = match bucket_type {
            BucketType::Minute => local
                .with_second(0)
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(local),
            BucketType::Hour => local
                .with_minute(0)
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(local),
            BucketType::Day => local
                .with_hour(0)
                .and_then(|t| t.with_minute(0))
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(local),
            BucketType::Week => {
                let day_start = local
                    .with_hour(0)
                    .and_then(|t| t.with_minute(0))
                    .and_then(|t| t.with_second(0))
                    .and_then(|t| t.with_nanosecond(0))
                    .unwrap_or(local);
                let week_start_weekday = match self.config.week_start {
                    WeekStart::Monday => chrono::Weekday::Mon,
                    WeekStart::Sunday => chrono::Weekday::Sun,
                };
                let days_since_start = (day_start.weekday().num_days_from_monday() as i64
                    - week_start_weekday.num_days_from_monday() as i64)
                    .rem_euclid(7);
                day_start - ChronoDuration::days(days_since_start)
            }
            BucketType::Month => Utc
                .with_ymd_and_hms(local.year(), local.month(), 1, 0, 0, 0)
                .single()
                .unwrap_or(local),
        };

        local_truncated - offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::BedrockConfig,
        errors::ErrorKind,
        models::{AccessKey, BedrockKey, Usage},
    };
    use async_trait::async_trait;
    use std::sync::{
        Arc as StdArc,
        atomic::{AtomicU32, Ordering},
    };

    struct RecordingStore {
        inserted: AtomicU32,
        upserted: AtomicU32,
    }

    #[async_trait]
    impl Store for RecordingStore {
        async fn find_active_access_key_by_hash(
            &self,
            _key_hash: &str,
        ) -> Result<Option<AccessKey>, crate::errors::DbError> {
            Ok(None)
        }
        async fn has_bedrock_key(&self, _access_key_id: Uuid) -> Result<bool, crate::errors::DbError> {
            Ok(true)
        }
        async fn get_bedrock_key(
            &self,
            _access_key_id: Uuid,
        ) -> Result<Option<BedrockKey>, crate::errors::DbError> {
            Ok(None)
        }
        async fn insert_usage_row(&self, _row: &UsageRow) -> Result<(), crate::errors::DbError> {
            self.inserted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn upsert_usage_aggregate(
            &self,
            _delta: &UsageAggregateDelta,
        ) -> Result<(), crate::errors::DbError> {
            self.upserted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct NullMetrics;
    #[async_trait]
    impl MetricsSink for NullMetrics {
        async fn record(&self, _metric: UsageMetric) {}
    }

    fn ctx() -> RequestContext {
        RequestContext {
            request_id: "r1".to_string(),
            user_id: Uuid::new_v4(),
            access_key_id: Uuid::new_v4(),
            access_key_prefix: "ak_live_abc".to_string(),
            bedrock_region: "us-east-1".to_string(),
            bedrock_model: "m".to_string(),
            has_bedrock_key: true,
        }
    }

    #[tokio::test]
    async fn persists_only_successful_bedrock_responses_with_usage() {
        let store = StdArc::new(RecordingStore {
            inserted: AtomicU32::new(0),
            upserted: AtomicU32::new(0),
        });
        let recorder = UsageRecorder::new(store.clone(), StdArc::new(NullMetrics), UsageConfig::default());

        let plan_success = ProxyResponse {
            success: true,
            unary_body: None,
            usage: Some(Usage::default()),
            provider: Provider::Plan,
            is_fallback: false,
            http_status: 200,
            error_kind: None,
            error_message: None,
        };
        recorder.record(&ctx(), &plan_success, 10, "m").await;
        assert_eq!(store.inserted.load(Ordering::SeqCst), 0);

        let bedrock_no_usage = ProxyResponse {
            success: true,
            unary_body: None,
            usage: None,
            provider: Provider::Bedrock,
            is_fallback: true,
            http_status: 200,
            error_kind: None,
            error_message: None,
        };
        recorder.record(&ctx(), &bedrock_no_usage, 10, "m").await;
        assert_eq!(store.inserted.load(Ordering::SeqCst), 0);

        let bedrock_success = ProxyResponse {
            success: true,
            unary_body: None,
            usage: Some(Usage {
                input_tokens: 5,
                output_tokens: 7,
                cache_read_input_tokens: None,
                cache_creation_input_tokens: None,
            }),
            provider: Provider::Bedrock,
            is_fallback: true,
            http_status: 200,
            error_kind: None,
            error_message: None,
        };
        recorder.record(&ctx(), &bedrock_success, 10, "m").await;
        assert_eq!(store.inserted.load(Ordering::SeqCst), 1);
        assert_eq!(store.upserted.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn week_bucket_truncates_to_monday_by_default() {
        let recorder = UsageRecorder::new(
            StdArc::new(RecordingStore {
                inserted: AtomicU32::new(0),
                upserted: AtomicU32::new(0),
            }),
            StdArc::new(NullMetrics),
            UsageConfig::default(),
        );
        // 2026-08-05 is a Wednesday.
        let ts = Utc.with_ymd_and_hms(2026, 8, 5, 14, 30, 0).unwrap();
        let bucket = recorder.bucket_start(ts, BucketType::Week);
        assert_eq!(bucket.weekday(), chrono::Weekday::Mon);
        assert_eq!(bucket.day(), 3);
        assert_eq!(bucket.hour(), 0);
    }

    #[test]
    fn week_bucket_honors_sunday_start_and_tz_offset() {
        let recorder = UsageRecorder::new(
            StdArc::new(RecordingStore {
                inserted: AtomicU32::new(0),
                upserted: AtomicU32::new(0),
            }),
            StdArc::new(NullMetrics),
            UsageConfig {
                week_start: WeekStart::Sunday,
                week_start_tz_offset_hours: 9,
            },
        );
        // 2025-01-06T12:30 KST == 2025-01-06T03:30 UTC; the KST week (Sunday start)
        // for that Monday began 2025-01-05T00:00 KST == 2025-01-04T15:00 UTC.
        let ts = Utc.with_ymd_and_hms(2025, 1, 6, 3, 30, 0).unwrap();
        let bucket = recorder.bucket_start(ts, BucketType::Week);
        assert_eq!(bucket, Utc.with_ymd_and_hms(2025, 1, 4, 15, 0, 0).unwrap());
    }

    #[test]
    fn month_bucket_truncates_to_first_of_month() {
        let recorder = UsageRecorder::new(
            StdArc::new(RecordingStore {
                inserted: AtomicU32::new(0),
                upserted: AtomicU32::new(0),
            }),
            StdArc::new(NullMetrics),
            UsageConfig::default(),
        );
        let ts = Utc.with_ymd_and_hms(2026, 8, 5, 14, 30, 0).unwrap();
        let bucket = recorder.bucket_start(ts, BucketType::Month);
        assert_eq!(bucket.day(), 1);
        assert_eq!(bucket.hour(), 0);
    }

    // silence unused-import warning for BedrockConfig / ErrorKind pulled in
    // for future adapter-facing tests in this module
    #[allow(dead_code)]
    fn _unused(_: BedrockConfig, _: ErrorKind) {}
}
