//! Metrics seam (A5, §4.8 "fire-and-forget").
//!
//! Grounded on `usage_sink.rs`'s trait-based sink: a single async trait the
//! usage recorder drives, with a concrete bounded-queue implementation.
//! Simplified relative to the teacher's `UsageSink` — no dead-letter-queue
//! fallback, since a dropped metric here is observability noise, not the
//! billing record the teacher's sink protects.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::models::Provider;

/// A single usage event worth recording as a metric.
#[derive(Debug, Clone)]
pub struct UsageMetric {
    pub provider: Provider,
    pub model: String,
    pub is_fallback: bool,
    pub success: bool,
    pub latency_ms: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record(&self, metric: UsageMetric);
}

struct Queue {
    buffer: Mutex<VecDeque<UsageMetric>>,
    capacity: usize,
    ready: Notify,
    dropped: AtomicU64,
}

/// Bounded-queue, drop-oldest metrics sink. A background task drains the
/// queue and hands each metric to `report`; callers never block on I/O, and
/// a full queue sheds the oldest entry (tracked in `dropped`) rather than
/// the newest request's metric.
pub struct ChannelMetricsSink {
    queue: Arc<Queue>,
}

impl ChannelMetricsSink {
    /// Spawns the background drain task and returns the sink.
    pub fn spawn(capacity: usize) -> Self {
        let queue = Arc::new(Queue {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            ready: Notify::new(),
            dropped: AtomicU64::new(0),
        });

        let worker = queue.clone();
        tokio::spawn(async move {
            loop {
                let notified = worker.ready.notified();
                let next = worker.buffer.lock().await.pop_front();
                match next {
                    Some(metric) => Self::report(&metric),
                    None => notified.await,
                }
            }
        });

        Self { queue }
    }

    fn report(metric: &UsageMetric) {
        tracing::debug!(
            provider = metric.provider.as_str(),
            model = %metric.model,
            is_fallback = metric.is_fallback,
            success = metric.success,
            latency_ms = metric.latency_ms,
            input_tokens = metric.input_tokens,
            output_tokens = metric.output_tokens,
            "usage metric"
        );
    }
}

#[async_trait]
impl MetricsSink for ChannelMetricsSink {
    async fn record(&self, metric: UsageMetric) {
        let mut buffer = self.queue.buffer.lock().await;
        if buffer.len() >= self.queue.capacity {
            buffer.pop_front();
            let dropped = self.queue.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(dropped_total = dropped, "metrics queue full, dropping oldest metric");
        }
        buffer.push_back(metric);
        drop(buffer);
        self.queue.ready.notify_one();
    }
}

#[cfg(test)]
impl ChannelMetricsSink {
    /// Builds a sink without spawning the drain task, so tests can inspect
    /// the buffer's eviction behavior without racing the background worker.
    fn new_for_test(capacity: usize) -> Self {
        Self {
            queue: Arc::new(Queue {
                buffer: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                ready: Notify::new(),
                dropped: AtomicU64::new(0),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> UsageMetric {
        UsageMetric {
            provider: Provider::Plan,
            model: "claude".to_string(),
            is_fallback: false,
            success: true,
            latency_ms: 42,
            input_tokens: 10,
            output_tokens: 20,
        }
    }

    #[tokio::test]
    async fn full_queue_evicts_oldest_not_newest() {
        let sink = ChannelMetricsSink::new_for_test(2);
        let mut first = sample();
        first.latency_ms = 1;
        let mut second = sample();
        second.latency_ms = 2;
        let mut third = sample();
        third.latency_ms = 3;

        sink.record(first).await;
        sink.record(second).await;
        sink.record(third).await;

        let buffer = sink.queue.buffer.lock().await;
        let latencies: Vec<i64> = buffer.iter().map(|m| m.latency_ms).collect();
        assert_eq!(latencies, vec![2, 3]);
        drop(buffer);
        assert_eq!(sink.queue.dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn record_does_not_block_on_full_queue() {
        let sink = ChannelMetricsSink::spawn(1);
        for _ in 0..50 {
            sink.record(sample()).await;
        }
    }
}
