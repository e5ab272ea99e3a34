//! Streaming pipe (C7, §4.7): exactly-once adapter-stream close.
//!
//! Grounded on the teacher's `streaming::UsageTrackingStream` — a `Stream`
//! wrapper whose `Drop` impl finalizes (here: closes the adapter) if
//! `poll_next` never got the chance to. Whichever path runs first — normal
//! completion/error inside `poll_next`, or `Drop` on client-disconnect/
//! cancellation — sets the `closed` guard and the other becomes a no-op, so
//! the adapter's `close()` runs exactly once regardless of how the stream
//! ends.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::Notify;

use crate::providers::ProviderAdapter;

/// Wraps a provider's `ByteStream`, guaranteeing `adapter.close()` runs
/// exactly once no matter how the stream terminates.
pub struct StreamingPipe {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>,
    adapter: Arc<dyn ProviderAdapter>,
    closed: bool,
    /// Signaled once `close()` has run, so a caller that wants to await full
    /// shutdown (e.g. in tests) can do so without polling.
    closed_notify: Arc<Notify>,
}

impl StreamingPipe {
    pub fn new(
        inner: Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>,
        adapter: Arc<dyn ProviderAdapter>,
    ) -> Self {
        Self {
            inner,
            adapter,
            closed: false,
            closed_notify: Arc::new(Notify::new()),
        }
    }

    pub fn closed_notify(&self) -> Arc<Notify> {
        self.closed_notify.clone()
    }

    /// Marks the guard tripped and spawns `adapter.close()`. Idempotent:
    /// the second caller (whichever of `poll_next`'s terminal arm or `Drop`
    /// runs second) observes `closed == true` and does nothing.
    fn close_once(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let adapter = self.adapter.clone();
        let notify = self.closed_notify.clone();
        tokio::spawn(async move {
            adapter.close().await;
            notify.notify_waiters();
        });
    }
}

impl Stream for StreamingPipe {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(None) => {
                self.close_once();
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                self.close_once();
                Poll::Ready(Some(Err(e)))
            }
            ready @ Poll::Ready(Some(Ok(_))) => ready,
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for StreamingPipe {
    /// Client disconnect or any other mid-stream cancellation drops this
    /// wrapper without `poll_next` ever reaching a terminal arm; this is
    /// the only place that case gets cleaned up.
    fn drop(&mut self) {
        self.close_once();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::ProviderError,
        models::RequestContext,
        providers::{ByteStream, CountTokensResponse, InvokeResponse, PassThroughHeaders},
    };
    use async_trait::async_trait;
    use futures::{StreamExt, stream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingAdapter {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ProviderAdapter for CountingAdapter {
        async fn invoke(
            &self,
            _ctx: &RequestContext,
            _req: &serde_json::Value,
            _headers: &PassThroughHeaders,
        ) -> Result<InvokeResponse, ProviderError> {
            unimplemented!()
        }
        async fn stream(
            &self,
            _ctx: &RequestContext,
            _req: &serde_json::Value,
            _headers: &PassThroughHeaders,
        ) -> Result<ByteStream, ProviderError> {
            unimplemented!()
        }
        async fn count_tokens(
            &self,
            _ctx: &RequestContext,
            _req: &serde_json::Value,
            _headers: &PassThroughHeaders,
        ) -> Result<CountTokensResponse, ProviderError> {
            unimplemented!()
        }
        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn close_runs_once_on_normal_completion() {
        let closes = Arc::new(AtomicUsize::new(0));
        let adapter = Arc::new(CountingAdapter {
            closes: closes.clone(),
        });
        let inner = stream::iter(vec![Ok(Bytes::from("a")), Ok(Bytes::from("b"))]);
        let mut pipe = StreamingPipe::new(Box::pin(inner), adapter);
        let notify = pipe.closed_notify();

        while pipe.next().await.is_some() {}
        drop(pipe);

        tokio::time::timeout(Duration::from_secs(1), notify.notified())
            .await
            .ok();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_runs_once_on_mid_stream_drop() {
        let closes = Arc::new(AtomicUsize::new(0));
        let adapter = Arc::new(CountingAdapter {
            closes: closes.clone(),
        });
        let inner = stream::pending::<Result<Bytes, std::io::Error>>();
        let pipe = StreamingPipe::new(Box::pin(inner), adapter);
        let notify = pipe.closed_notify();

        drop(pipe);

        tokio::time::timeout(Duration::from_secs(1), notify.notified())
            .await
            .ok();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
