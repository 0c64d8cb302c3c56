//! Relay orchestrator.
//!
//! estimate → pre-consume → failover over adapters → settle. Any failure
//! before a response is produced refunds the reservation. Streams settle
//! from the bridge once they complete, fail or are cancelled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use serde_json::Value;
use uuid::Uuid;

use crate::config::Config;
use crate::errors::AppError;
use crate::middleware::metrics::{RelayMetrics, RequestRecord};
use crate::middleware::quota::{QuotaLedger, Reservation};
use crate::models::canonical::{ChatRequest, ChatResponse, ImageRequest, Usage};
use crate::models::channel::Channel;
use crate::models::cost;
use crate::models::meta::RelayMeta;
use crate::models::token::Token;
use crate::proxy::adapter::{AdapterRegistry, ChunkStream};
use crate::proxy::failover::FailoverController;
use crate::proxy::stream_bridge::{BridgeStream, StreamOutcome, StreamState};
use crate::proxy::upstream::UpstreamRequest;

const DEFAULT_IMAGE_MODEL: &str = "dall-e-2";

/// What a chat relay hands back to the HTTP layer.
pub enum ChatReply {
    Complete(ChatResponse),
    /// SSE body. Settlement happens when the body finishes or is dropped.
    Stream(Body),
}

enum Upstream {
    Complete(ChatResponse, Usage),
    Stream(ChunkStream),
}

pub struct Relay {
    adapters: AdapterRegistry,
    failover: FailoverController,
    ledger: Arc<QuotaLedger>,
    metrics: Arc<RelayMetrics>,
    config: Arc<Config>,
}

impl Relay {
    pub fn new(
        adapters: AdapterRegistry,
        failover: FailoverController,
        ledger: Arc<QuotaLedger>,
        metrics: Arc<RelayMetrics>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            adapters,
            failover,
            ledger,
            metrics,
            config,
        }
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    #[tracing::instrument(skip_all, fields(token_id = token.id, model = %req.model, stream = req.stream))]
    pub async fn chat(&self, token: &Token, req: ChatRequest) -> Result<ChatReply, AppError> {
        if req.model.is_empty() {
            return Err(AppError::Protocol("model is required".into()));
        }
        if req.messages.is_empty() {
            return Err(AppError::Protocol("messages must not be empty".into()));
        }

        let started = Instant::now();
        let request_id = Uuid::new_v4().simple().to_string();
        let prompt_tokens = cost::estimate_prompt_tokens(&req);
        let estimate = cost::reservation_for_chat(&req, prompt_tokens, self.config.pre_consumed_quota);
        let reservation = self.ledger.pre_consume(token.id, estimate).await?;

        let deadline = tokio::time::Instant::now() + self.config.relay_timeout();
        let req_ref = &req;
        let request_id_ref = request_id.as_str();
        let attempts = self.failover.execute(&req.model, |channel| {
            self.attempt_chat(channel, req_ref, request_id_ref, prompt_tokens, deadline)
        });
        let result = match tokio::time::timeout_at(deadline, attempts).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout),
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                self.fail(&reservation, &req.model, req.stream, started, &err).await;
                return Err(err);
            }
        };
        tracing::debug!(
            channel_id = outcome.channel.id,
            failed_attempts = outcome.failed_attempts,
            "upstream accepted request"
        );

        match outcome.value {
            Upstream::Complete(response, usage) => {
                let quota = cost::quota_for_usage(&req.model, &usage);
                if let Err(e) = self.ledger.settle(&reservation, quota).await {
                    tracing::error!(token_id = token.id, quota, "failed to settle quota: {}", e);
                }
                self.metrics.record(&RequestRecord {
                    model: &req.model,
                    status_code: 200,
                    is_streaming: false,
                    latency_secs: started.elapsed().as_secs_f64(),
                    failed_attempts: outcome.failed_attempts,
                    quota,
                    prompt_tokens: usage.prompt_tokens,
                    completion_tokens: usage.completion_tokens,
                    ..Default::default()
                });
                Ok(ChatReply::Complete(response))
            }
            Upstream::Stream(chunks) => {
                let settle = StreamSettlement {
                    ledger: self.ledger.clone(),
                    metrics: self.metrics.clone(),
                    reservation,
                    model: req.model.clone(),
                    failed_attempts: outcome.failed_attempts,
                    started,
                };
                let bridge = BridgeStream::new(chunks, prompt_tokens, deadline, move |o| settle.spawn(o));
                Ok(ChatReply::Stream(bridge.into_body()))
            }
        }
    }

    async fn attempt_chat(
        &self,
        channel: Channel,
        req: &ChatRequest,
        request_id: &str,
        prompt_tokens: u32,
        deadline: tokio::time::Instant,
    ) -> Result<Upstream, AppError> {
        let adapter = self.adapters.get(channel.provider)?;
        let mut meta = RelayMeta::new(
            request_id,
            &channel,
            &req.model,
            req.stream,
            prompt_tokens,
            self.attempt_timeout(deadline),
        );
        adapter.init(&mut meta);

        let url = adapter.build_upstream_url(&meta)?;
        let headers = adapter.build_headers(Some(req), &meta)?;
        let body = adapter.convert_request(Some(req), &meta)?;
        let upstream = UpstreamRequest::post_json(url, headers, &body)
            .map_err(|e| AppError::Protocol(format!("failed to encode upstream body: {}", e)))?;

        tracing::debug!(channel_id = channel.id, provider = adapter.name(), model = %meta.actual_model, "forwarding");
        let resp = adapter.forward(upstream, &meta).await?;

        if meta.is_stream {
            return Ok(Upstream::Stream(adapter.convert_stream(resp, &meta)));
        }
        let (response, usage) = adapter.convert_response(resp, &meta).await?;
        Ok(Upstream::Complete(response, usage))
    }

    /// Image generation is priced up front; the reservation is the charge.
    #[tracing::instrument(skip_all, fields(token_id = token.id))]
    pub async fn images(&self, token: &Token, mut req: ImageRequest) -> Result<Value, AppError> {
        if req.prompt.trim().is_empty() {
            return Err(AppError::Protocol("prompt is required".into()));
        }
        if req.model.is_empty() {
            req.model = DEFAULT_IMAGE_MODEL.to_string();
        }

        let started = Instant::now();
        let request_id = Uuid::new_v4().simple().to_string();
        let quota = cost::quota_for_image(&req);
        let reservation = self.ledger.pre_consume(token.id, quota).await?;

        let deadline = tokio::time::Instant::now() + self.config.relay_timeout();
        let req_ref = &req;
        let request_id_ref = request_id.as_str();
        let attempts = self.failover.execute(&req.model, |channel| {
            self.attempt_image(channel, req_ref, request_id_ref, deadline)
        });
        let result = match tokio::time::timeout_at(deadline, attempts).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout),
        };

        match result {
            Ok(outcome) => {
                self.metrics.record(&RequestRecord {
                    model: &req.model,
                    status_code: 200,
                    latency_secs: started.elapsed().as_secs_f64(),
                    failed_attempts: outcome.failed_attempts,
                    quota,
                    ..Default::default()
                });
                Ok(outcome.value)
            }
            Err(err) => {
                self.fail(&reservation, &req.model, false, started, &err).await;
                Err(err)
            }
        }
    }

    async fn attempt_image(
        &self,
        channel: Channel,
        req: &ImageRequest,
        request_id: &str,
        deadline: tokio::time::Instant,
    ) -> Result<Value, AppError> {
        let adapter = self.adapters.get(channel.provider)?;
        let timeout = self.attempt_timeout(deadline);
        let mut meta = RelayMeta::new(request_id, &channel, &req.model, false, 0, timeout);
        adapter.init(&mut meta);

        let url = adapter.build_image_url(&meta)?;
        let headers = adapter.build_headers(None, &meta)?;
        let body = adapter.convert_image_request(Some(req), &meta)?;
        let upstream = UpstreamRequest::post_json(url, headers, &body)
            .map_err(|e| AppError::Protocol(format!("failed to encode upstream body: {}", e)))?;
        let resp = adapter.forward(upstream, &meta).await?;
        adapter.convert_image_response(resp, &meta).await
    }

    /// One channel gets the per-call timeout, cut short by whatever is left
    /// of the overall deadline. A slow channel then times out as a channel
    /// error the failover can act on.
    fn attempt_timeout(&self, deadline: tokio::time::Instant) -> Duration {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        self.config.channel_timeout().min(remaining)
    }

    async fn fail(&self, reservation: &Reservation, model: &str, is_streaming: bool, started: Instant, err: &AppError) {
        if let Err(e) = self.ledger.refund(reservation).await {
            tracing::error!(
                token_id = reservation.token_id,
                amount = reservation.amount,
                "failed to refund reservation: {}",
                e
            );
        }
        let failed_attempts = match err {
            AppError::Channel(e) => e.attempts,
            _ => 0,
        };
        self.metrics.record(&RequestRecord {
            model,
            status_code: err.status_code().as_u16(),
            is_streaming,
            latency_secs: started.elapsed().as_secs_f64(),
            failed_attempts,
            error_type: Some(err.kind()),
            ..Default::default()
        });
    }
}

/// Everything needed to settle a stream after the handler has returned.
struct StreamSettlement {
    ledger: Arc<QuotaLedger>,
    metrics: Arc<RelayMetrics>,
    reservation: Reservation,
    model: String,
    failed_attempts: u32,
    started: Instant,
}

impl StreamSettlement {
    fn spawn(self, outcome: StreamOutcome) {
        // The bridge may be dropped during runtime shutdown.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::error!(
                token_id = self.reservation.token_id,
                "no runtime to settle stream, reservation kept"
            );
            return;
        };
        handle.spawn(async move { self.settle(outcome).await });
    }

    async fn settle(self, outcome: StreamOutcome) {
        let quota = cost::quota_for_usage(&self.model, &outcome.usage);
        if let Err(e) = self.ledger.settle(&self.reservation, quota).await {
            tracing::error!(token_id = self.reservation.token_id, quota, "failed to settle stream quota: {}", e);
        }
        let (status_code, error_type) = match outcome.state {
            StreamState::Failed => (502, Some("stream_error")),
            // nginx's "client closed request"
            StreamState::Cancelled => (499, Some("cancelled")),
            _ => (200, None),
        };
        tracing::info!(
            token_id = self.reservation.token_id,
            state = ?outcome.state,
            chunks = outcome.chunks,
            prompt_tokens = outcome.usage.prompt_tokens,
            completion_tokens = outcome.usage.completion_tokens,
            quota,
            "stream settled"
        );
        self.metrics.record(&RequestRecord {
            model: &self.model,
            status_code,
            is_streaming: true,
            latency_secs: self.started.elapsed().as_secs_f64(),
            ttft_secs: outcome.ttft.map(|t| t.as_secs_f64()),
            failed_attempts: self.failed_attempts,
            quota,
            prompt_tokens: outcome.usage.prompt_tokens,
            completion_tokens: outcome.usage.completion_tokens,
            error_type,
        });
    }
}
