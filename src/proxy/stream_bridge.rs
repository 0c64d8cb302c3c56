//! Stream bridge: canonical chunks → downstream SSE bytes.
//!
//! [`BridgeStream`] is pulled by the HTTP body: each poll pulls at most one
//! chunk from the adapter, renders it and hands it down. Nothing is buffered
//! ahead of the client, so usage accumulated here covers exactly what was
//! delivered.
//!
//! The bridge reports a [`StreamOutcome`] exactly once:
//! - on upstream end of stream (`Completed`)
//! - on a mid-stream error or the relay deadline (`Failed`)
//! - when dropped early, e.g. on client disconnect (`Cancelled`)
//!
//! Dropping the bridge drops the adapter stream, which closes the upstream
//! connection.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use bytes::Bytes;
use futures::{Future, Stream};
use serde_json::json;
use tokio::time::Sleep;

use crate::errors::AppError;
use crate::models::canonical::{StreamChunk, Usage};
use crate::models::cost;
use crate::proxy::adapter::ChunkStream;

const DONE_EVENT: &[u8] = b"data: [DONE]\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    /// Polled, waiting for the first chunk.
    Sending,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamState::Completed | StreamState::Failed | StreamState::Cancelled
        )
    }
}

#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub state: StreamState,
    pub usage: Usage,
    pub chunks: u32,
    pub ttft: Option<Duration>,
    pub error: Option<String>,
}

/// Usage from delivered chunks. Provider-reported usage wins when present;
/// otherwise completion tokens are estimated from the delivered text.
#[derive(Debug, Default)]
struct UsageAccumulator {
    prompt_tokens: u32,
    estimated_completion: u32,
    reported: Option<Usage>,
}

impl UsageAccumulator {
    fn observe(&mut self, chunk: &StreamChunk) {
        for choice in &chunk.choices {
            if let Some(text) = &choice.delta.content {
                self.estimated_completion += cost::estimate_text_tokens(text);
            }
            for call in choice.delta.tool_calls.iter().flatten() {
                if let Some(args) = call.pointer("/function/arguments").and_then(|a| a.as_str()) {
                    self.estimated_completion += cost::estimate_text_tokens(args);
                }
            }
        }
        if let Some(usage) = chunk.usage {
            if usage.prompt_tokens > 0 || usage.completion_tokens > 0 {
                self.reported = Some(usage);
            }
        }
    }

    fn usage(&self) -> Usage {
        self.reported
            .unwrap_or_else(|| Usage::new(self.prompt_tokens, self.estimated_completion))
    }
}

pub type OnFinish = Box<dyn FnOnce(StreamOutcome) + Send + 'static>;

pub struct BridgeStream {
    inner: Option<ChunkStream>,
    state: StreamState,
    usage: UsageAccumulator,
    chunks: u32,
    started: Instant,
    ttft: Option<Duration>,
    deadline: Pin<Box<Sleep>>,
    /// Last event to send after a terminal transition.
    tail: Option<Bytes>,
    on_finish: Option<OnFinish>,
}

impl BridgeStream {
    /// `prompt_tokens` is the pre-call estimate used when the provider never
    /// reports usage. `deadline` bounds the whole stream.
    pub fn new(
        inner: ChunkStream,
        prompt_tokens: u32,
        deadline: tokio::time::Instant,
        on_finish: impl FnOnce(StreamOutcome) + Send + 'static,
    ) -> Self {
        Self {
            inner: Some(inner),
            state: StreamState::Idle,
            usage: UsageAccumulator {
                prompt_tokens,
                ..Default::default()
            },
            chunks: 0,
            started: Instant::now(),
            ttft: None,
            deadline: Box::pin(tokio::time::sleep_until(deadline)),
            tail: None,
            on_finish: Some(Box::new(on_finish)),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn into_body(self) -> Body {
        Body::from_stream(self)
    }

    fn finish(&mut self, state: StreamState, error: Option<String>) {
        self.state = state;
        // Closes the upstream connection.
        self.inner = None;
        let outcome = StreamOutcome {
            state,
            usage: self.usage.usage(),
            chunks: self.chunks,
            ttft: self.ttft,
            error,
        };
        if let Some(on_finish) = self.on_finish.take() {
            on_finish(outcome);
        }
    }

    fn fail(&mut self, err: &AppError) {
        tracing::warn!(chunks = self.chunks, "stream failed: {}", err);
        let event = json!({
            "error": {
                "message": err.to_string(),
                "type": err.kind(),
            }
        });
        self.tail = Some(Bytes::from(format!("data: {}\n\n", event)));
        self.finish(StreamState::Failed, Some(err.to_string()));
    }
}

impl Stream for BridgeStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.state.is_terminal() {
            return Poll::Ready(this.tail.take().map(Ok));
        }
        if this.state == StreamState::Idle {
            this.state = StreamState::Sending;
        }

        if this.deadline.as_mut().poll(cx).is_ready() {
            this.fail(&AppError::Timeout);
            return Poll::Ready(this.tail.take().map(Ok));
        }

        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };
        match inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                if this.ttft.is_none() {
                    this.ttft = Some(this.started.elapsed());
                }
                this.state = StreamState::Streaming;
                this.chunks += 1;
                this.usage.observe(&chunk);
                Poll::Ready(Some(Ok(Bytes::from(chunk.to_sse()))))
            }
            Poll::Ready(Some(Err(err))) => {
                this.fail(&err);
                Poll::Ready(this.tail.take().map(Ok))
            }
            Poll::Ready(None) => {
                this.finish(StreamState::Completed, None);
                Poll::Ready(Some(Ok(Bytes::from_static(DONE_EVENT))))
            }
        }
    }
}

impl Drop for BridgeStream {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            tracing::info!(chunks = self.chunks, "client went away, stream cancelled");
            self.finish(StreamState::Cancelled, None);
        }
    }
}
