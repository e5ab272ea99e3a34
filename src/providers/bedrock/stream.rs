//! Binary event-stream -> Anthropic SSE translation (C5 streaming half, §4.5).
//!
//! Structurally this is the teacher's `BedrockToOpenAIStream<S>`: a manual
//! `Stream` impl that buffers decoded frames with `MessageFrameDecoder`,
//! translates each one, and drains an output queue before polling the inner
//! byte stream again. The event vocabulary and the `INIT -> STARTED ->
//! STOPPED` state machine come from `original_source`'s `iter_anthropic_sse`
//! / `_convert_converse_event`, including its end-of-stream rule: if a
//! `message_start` was emitted but no `message_stop` followed (the inner
//! stream ended without one), a `message_stop` is synthesized so a client
//! never sees a message left open.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use aws_smithy_eventstream::frame::{DecodedFrame, MessageFrameDecoder};
use aws_smithy_types::event_stream::Message;
use bytes::Bytes;
use futures_util::stream::Stream;

use super::convert::{map_content_block_delta, map_content_block_start, synthesize_id};
use super::types::{ContentBlockDelta, ContentBlockStart, ContentBlockStop, MessageStop, StreamMetadata};
use crate::config::BedrockConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Started,
    Stopped,
}

struct StreamState {
    phase: Phase,
    message_id: String,
    model: String,
    pending_stop_reason: Option<String>,
    pending_usage: Option<(i64, Option<i64>, Option<i64>)>,
    buffer: bytes::BytesMut,
    decoder: MessageFrameDecoder,
    buffer_overflow: bool,
}

/// Translates a Bedrock `ConverseStream` byte stream into Anthropic SSE bytes.
pub(super) struct BedrockToAnthropicStream<S> {
    inner: S,
    state: StreamState,
    output_buffer: Vec<Bytes>,
    max_input_buffer_bytes: usize,
    max_output_buffer_chunks: usize,
}

impl<S> BedrockToAnthropicStream<S> {
    pub(super) fn new(inner: S, model: String, config: &BedrockConfig) -> Self {
        Self {
            inner,
            state: StreamState {
                phase: Phase::Init,
                message_id: String::new(),
                model,
                pending_stop_reason: None,
                pending_usage: None,
                buffer: bytes::BytesMut::new(),
                decoder: MessageFrameDecoder::new(),
                buffer_overflow: false,
            },
            output_buffer: Vec::new(),
            max_input_buffer_bytes: config.max_input_buffer_bytes,
            max_output_buffer_chunks: config.max_output_buffer_chunks,
        }
    }

    fn emit(&mut self, payload: serde_json::Value) {
        let sse = format!("data: {}\n\n", payload);
        self.output_buffer.push(Bytes::from(sse));
    }

    fn process_event(&mut self, message: Message) {
        let event_type = message.headers().iter().find_map(|h| {
            if h.name().as_str() == ":event-type" {
                h.value().as_string().ok().map(|s| s.as_str().to_string())
            } else {
                None
            }
        });
        let message_type = message.headers().iter().find_map(|h| {
            if h.name().as_str() == ":message-type" {
                h.value().as_string().ok().map(|s| s.as_str().to_string())
            } else {
                None
            }
        });

        if message_type.as_deref() == Some("exception") {
            let exception_type = message.headers().iter().find_map(|h| {
                if h.name().as_str() == ":exception-type" {
                    h.value().as_string().ok().map(|s| s.as_str().to_string())
                } else {
                    None
                }
            });
            tracing::error!(
                exception_type = ?exception_type,
                payload = ?String::from_utf8_lossy(message.payload()),
                "Bedrock stream exception"
            );
            return;
        }

        let Some(event_type) = event_type else { return };
        let payload = message.payload();

        match event_type.as_str() {
            "messageStart" if self.state.phase == Phase::Init => {
                self.state.phase = Phase::Started;
                if self.state.message_id.is_empty() {
                    self.state.message_id = synthesize_id(&serde_json::json!({
                        "model": self.state.model,
                    }));
                }
                self.emit(serde_json::json!({
                    "type": "message_start",
                    "message": {
                        "id": self.state.message_id,
                        "type": "message",
                        "role": "assistant",
                        "content": [],
                        "model": self.state.model,
                        "stop_reason": null,
                        "stop_sequence": null,
                        "usage": {"input_tokens": 0, "output_tokens": 0},
                    },
                }));
            }
            "contentBlockStart" => {
                if let Ok(start) = serde_json::from_slice::<ContentBlockStart>(payload)
                    && let Some(content_block) = map_content_block_start(&start.start)
                {
                    self.emit(serde_json::json!({
                        "type": "content_block_start",
                        "index": start.content_block_index,
                        "content_block": content_block,
                    }));
                }
            }
            "contentBlockDelta" => {
                if let Ok(delta) = serde_json::from_slice::<ContentBlockDelta>(payload)
                    && let Some(delta_payload) = map_content_block_delta(&delta.delta)
                {
                    self.emit(serde_json::json!({
                        "type": "content_block_delta",
                        "index": delta.content_block_index,
                        "delta": delta_payload,
                    }));
                }
            }
            "contentBlockStop" => {
                if let Ok(stop) = serde_json::from_slice::<ContentBlockStop>(payload) {
                    self.emit(serde_json::json!({
                        "type": "content_block_stop",
                        "index": stop.content_block_index,
                    }));
                }
            }
            "messageStop" => {
                if let Ok(stop) = serde_json::from_slice::<MessageStop>(payload) {
                    self.state.pending_stop_reason = stop.stop_reason;
                    if self.state.pending_usage.is_some() {
                        self.flush_message_delta_and_stop();
                    }
                }
            }
            "metadata" => {
                if let Ok(metadata) = serde_json::from_slice::<StreamMetadata>(payload) {
                    self.state.pending_usage = Some((
                        metadata.usage.output_tokens,
                        Some(metadata.usage.cache_read_input_tokens),
                        Some(metadata.usage.cache_creation_input_tokens),
                    ));
                    if self.state.pending_stop_reason.is_some() {
                        self.flush_message_delta_and_stop();
                    }
                }
            }
            _ => tracing::debug!(event_type = %event_type, "unrecognized Bedrock stream event"),
        }
    }

    /// §4.5: once both the stop reason and usage are known, emit `message_delta`
    /// followed by exactly one `message_stop`.
    fn flush_message_delta_and_stop(&mut self) {
        if self.state.pending_stop_reason.is_none() && self.state.pending_usage.is_none() {
            return;
        }
        let (output_tokens, cache_read, cache_creation) =
            self.state.pending_usage.take().unwrap_or((0, None, None));
        self.emit(serde_json::json!({
            "type": "message_delta",
            "delta": {
                "stop_reason": self.state.pending_stop_reason,
                "stop_sequence": null,
            },
            "usage": {
                "output_tokens": output_tokens,
                "cache_read_input_tokens": cache_read,
                "cache_creation_input_tokens": cache_creation,
            },
        }));
        self.emit(serde_json::json!({"type": "message_stop"}));
        self.state.pending_stop_reason = None;
        self.state.phase = Phase::Stopped;
    }

    /// §4.5 end-of-stream rule: a `message_start` with no matching
    /// `message_stop` by the time the inner stream closes still gets one,
    /// so a client never observes an unterminated message.
    fn finalize_on_end(&mut self) {
        if self.state.phase == Phase::Started {
            self.emit(serde_json::json!({"type": "message_stop"}));
            self.state.phase = Phase::Stopped;
        }
    }

    fn process_bytes(&mut self, bytes: &[u8]) {
        if self.state.buffer_overflow {
            return;
        }
        if self.state.buffer.len() + bytes.len() > self.max_input_buffer_bytes {
            tracing::error!(
                buffer_size = self.state.buffer.len(),
                incoming_size = bytes.len(),
                max_size = self.max_input_buffer_bytes,
                "Bedrock event stream input buffer overflow"
            );
            self.state.buffer_overflow = true;
            return;
        }

        self.state.buffer.extend_from_slice(bytes);

        loop {
            match self.state.decoder.decode_frame(&mut self.state.buffer) {
                Ok(DecodedFrame::Complete(message)) => {
                    self.process_event(message);
                    if self.output_buffer.len() > self.max_output_buffer_chunks {
                        tracing::error!(
                            buffer_size = self.output_buffer.len(),
                            max_size = self.max_output_buffer_chunks,
                            "Anthropic SSE output buffer overflow"
                        );
                        self.state.buffer_overflow = true;
                        return;
                    }
                }
                Ok(DecodedFrame::Incomplete) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode Bedrock event stream frame");
                    break;
                }
            }
        }
    }
}

impl<S> Stream for BedrockToAnthropicStream<S>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.state.buffer_overflow {
            return Poll::Ready(Some(Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "Bedrock event stream buffer overflow",
            ))));
        }

        if !self.output_buffer.is_empty() {
            return Poll::Ready(Some(Ok(self.output_buffer.remove(0))));
        }

        let inner = Pin::new(&mut self.inner);
        match inner.poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                self.process_bytes(&bytes);
                if self.state.buffer_overflow {
                    return Poll::Ready(Some(Err(io::Error::new(
                        io::ErrorKind::OutOfMemory,
                        "Bedrock event stream buffer overflow",
                    ))));
                }
                if !self.output_buffer.is_empty() {
                    Poll::Ready(Some(Ok(self.output_buffer.remove(0))))
                } else {
                    cx.waker().wake_by_ref();
                    Poll::Pending
                }
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(io::Error::other(e)))),
            Poll::Ready(None) => {
                self.finalize_on_end();
                if !self.output_buffer.is_empty() {
                    Poll::Ready(Some(Ok(self.output_buffer.remove(0))))
                } else {
                    Poll::Ready(None)
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use aws_smithy_types::event_stream::{Header, HeaderValue};
    use futures::stream;

    use super::*;

    fn test_message(event_type: &str, payload: serde_json::Value) -> Message {
        Message::new(serde_json::to_vec(&payload).unwrap()).add_header(Header::new(
            ":event-type",
            HeaderValue::String(event_type.to_string().into()),
        ))
    }

    fn config() -> BedrockConfig {
        BedrockConfig {
            default_region: "us-east-1".to_string(),
            default_model: "m".to_string(),
            kms_key_id: String::new(),
            key_cache_ttl_secs: 300,
            max_input_buffer_bytes: 1024,
            max_output_buffer_chunks: 64,
        }
    }

    #[tokio::test]
    async fn emits_message_stop_if_inner_stream_ends_mid_message() {
        use futures::StreamExt;

        let inner = stream::iter(Vec::<Result<Bytes, reqwest::Error>>::new());
        let mut s = BedrockToAnthropicStream::new(inner, "claude".to_string(), &config());
        s.state.phase = Phase::Started;

        let chunk = s.next().await.expect("synthesized message_stop").expect("not an error");
        let text = String::from_utf8(chunk.to_vec()).unwrap();
        assert!(text.contains("\"type\":\"message_stop\""));
        assert!(s.next().await.is_none());
    }

    #[tokio::test]
    async fn does_not_synthesize_stop_if_never_started() {
        use futures::StreamExt;

        let inner = stream::iter(Vec::<Result<Bytes, reqwest::Error>>::new());
        let mut s = BedrockToAnthropicStream::new(inner, "claude".to_string(), &config());
        assert!(s.next().await.is_none());
    }

    #[tokio::test]
    async fn message_stop_holds_until_metadata_carries_usage() {
        use futures::StreamExt;

        let mut s = BedrockToAnthropicStream::new(
            stream::iter(Vec::<Result<Bytes, reqwest::Error>>::new()),
            "claude".to_string(),
            &config(),
        );

        s.process_event(test_message(
            "messageStop",
            serde_json::json!({"stopReason": "end_turn"}),
        ));
        assert!(
            s.output_buffer.is_empty(),
            "messageStop must hold the stop reason, not flush immediately"
        );

        s.process_event(test_message(
            "metadata",
            serde_json::json!({"usage": {"outputTokens": 2, "inputTokens": 0}}),
        ));

        assert_eq!(s.output_buffer.len(), 2);
        let delta_text = String::from_utf8(s.output_buffer[0].to_vec()).unwrap();
        assert!(delta_text.contains("\"type\":\"message_delta\""));
        assert!(delta_text.contains("\"output_tokens\":2"));
        assert!(delta_text.contains("\"stop_reason\":\"end_turn\""));
        let stop_text = String::from_utf8(s.output_buffer[1].to_vec()).unwrap();
        assert!(stop_text.contains("\"type\":\"message_stop\""));
    }
}
