//! Two-phase quota ledger.
//!
//! `pre_consume` reserves an estimate against both the token and its owning
//! user before any upstream call; `settle` reconciles the reservation with
//! the metered cost afterwards. All balance changes are relative increments
//! at the storage layer. In batch mode they are routed through the
//! [`BatchUpdater`] instead of being written through.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::errors::AppError;
use crate::jobs::batch_update::{BatchKind, BatchUpdater};
use crate::models::token::{Token, TokenStatus};
use crate::models::user::User;
use crate::notification::{self, Notifier};
use crate::store::RelayStore;

/// Quota held for one in-flight request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub token_id: i64,
    pub user_id: i64,
    pub amount: i64,
    pub token_unlimited: bool,
}

/// Why a token was refused. `lapsed` is set when the stored status is still
/// enabled but the token has expired or run dry since it was written.
#[derive(Debug)]
pub struct TokenRejection {
    pub error: AppError,
    pub lapsed: Option<TokenStatus>,
}

pub struct QuotaLedger {
    store: Arc<dyn RelayStore>,
    batch: Option<Arc<BatchUpdater>>,
    notifier: Arc<dyn Notifier>,
    remind_threshold: i64,
    /// Persist expired/exhausted transitions on validation. Only done when
    /// token records are not served from the distributed cache.
    lazy_status_marking: bool,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn RelayStore>, notifier: Arc<dyn Notifier>, config: &Config) -> Self {
        Self {
            store,
            batch: None,
            notifier,
            remind_threshold: config.quota_remind_threshold,
            lazy_status_marking: !config.redis_enabled(),
        }
    }

    /// Route quota writes through a write-coalescing accumulator.
    pub fn with_batch(mut self, batch: Arc<BatchUpdater>) -> Self {
        self.batch = Some(batch);
        self
    }

    pub fn store(&self) -> &Arc<dyn RelayStore> {
        &self.store
    }

    /// Decide whether a token may be used, without touching the store.
    pub fn validate_token(&self, token: &Token) -> Result<(), TokenRejection> {
        let refuse = |msg: String| TokenRejection {
            error: AppError::Auth(msg),
            lapsed: None,
        };
        match token.status {
            TokenStatus::Enabled => {}
            TokenStatus::Exhausted => return Err(refuse(format!("token #{} quota is exhausted", token.id))),
            TokenStatus::Expired => return Err(refuse(format!("token #{} has expired", token.id))),
            TokenStatus::Disabled => return Err(refuse(format!("token #{} is disabled", token.id))),
        }

        if token.is_expired(Utc::now().timestamp()) {
            return Err(TokenRejection {
                error: AppError::Auth(format!("token #{} has expired", token.id)),
                lapsed: Some(TokenStatus::Expired),
            });
        }
        if token.is_exhausted() {
            return Err(TokenRejection {
                error: AppError::Auth(format!("token #{} quota is exhausted", token.id)),
                lapsed: Some(TokenStatus::Exhausted),
            });
        }
        Ok(())
    }

    /// Persist the transition a rejection discovered and return its error.
    pub async fn reject(&self, token: &Token, rejection: TokenRejection) -> AppError {
        if let Some(status) = rejection.lapsed {
            if let Err(e) = self.mark(token, status).await {
                return e;
            }
        }
        rejection.error
    }

    /// Reject tokens that are not currently usable, persisting expired and
    /// exhausted transitions as they are discovered.
    pub async fn check_token(&self, token: &Token) -> Result<(), AppError> {
        match self.validate_token(token) {
            Ok(()) => Ok(()),
            Err(rejection) => Err(self.reject(token, rejection).await),
        }
    }

    async fn mark(&self, token: &Token, status: TokenStatus) -> Result<(), AppError> {
        if !self.lazy_status_marking {
            return Ok(());
        }
        info!(token_id = token.id, ?status, "marking token");
        self.store
            .set_token_status(token.id, status)
            .await
            .map_err(AppError::Internal)
    }

    async fn load(&self, token_id: i64) -> Result<(Token, User), AppError> {
        let token = self
            .store
            .get_token(token_id)
            .await
            .map_err(AppError::Internal)?
            .ok_or_else(|| AppError::Auth(format!("token #{} not found", token_id)))?;
        let user = self
            .store
            .get_user(token.user_id)
            .await
            .map_err(AppError::Internal)?
            .ok_or_else(|| AppError::Auth(format!("user #{} not found", token.user_id)))?;
        Ok((token, user))
    }

    fn pending(&self, kind: BatchKind, id: i64) -> i64 {
        self.batch.as_ref().map_or(0, |b| b.pending(kind, id))
    }

    /// Reserve `cost` against the token and its user.
    #[tracing::instrument(skip(self))]
    pub async fn pre_consume(&self, token_id: i64, cost: i64) -> Result<Reservation, AppError> {
        let cost = cost.max(0);
        let (token, user) = self.load(token_id).await?;
        self.check_token(&token).await?;

        let token_balance = token.remain_quota - self.pending(BatchKind::TokenQuota, token.id);
        let user_balance = user.quota - self.pending(BatchKind::UserQuota, user.id);

        if !token.unlimited_quota && token_balance < cost {
            return Err(AppError::Quota(format!(
                "token #{} has {} remaining, {} required",
                token.id, token_balance, cost
            )));
        }
        if user_balance < cost {
            return Err(AppError::Quota(format!(
                "user #{} has {} remaining, {} required",
                user.id, user_balance, cost
            )));
        }

        let reservation = Reservation {
            token_id: token.id,
            user_id: user.id,
            amount: cost,
            token_unlimited: token.unlimited_quota,
        };
        if cost == 0 {
            return Ok(reservation);
        }

        match &self.batch {
            Some(batch) => {
                if !token.unlimited_quota {
                    batch.add(BatchKind::TokenQuota, token.id, cost);
                }
                batch.add(BatchKind::UserQuota, user.id, cost);
            }
            None => self.reserve_atomically(&token, &user, cost).await?,
        }

        self.notify_low_balance(&token, &user, token_balance, user_balance, cost);
        debug!(token_id, user_id = user.id, cost, "quota reserved");
        Ok(reservation)
    }

    /// Conditional decrements at the storage layer: concurrent reservations
    /// can never take a balance below zero. A failed user reservation
    /// releases the token side again.
    async fn reserve_atomically(&self, token: &Token, user: &User, cost: i64) -> Result<(), AppError> {
        if !token.unlimited_quota {
            let ok = self
                .store
                .reserve_token_quota(token.id, cost)
                .await
                .map_err(AppError::Internal)?;
            if !ok {
                return Err(AppError::Quota(format!(
                    "token #{} has insufficient quota for {}",
                    token.id, cost
                )));
            }
        }

        let ok = match self.store.reserve_user_quota(user.id, cost).await {
            Ok(ok) => ok,
            Err(e) => {
                self.release_token(token, cost).await;
                return Err(AppError::Internal(e));
            }
        };
        if !ok {
            self.release_token(token, cost).await;
            return Err(AppError::Quota(format!(
                "user #{} has insufficient quota for {}",
                user.id, cost
            )));
        }
        Ok(())
    }

    async fn release_token(&self, token: &Token, cost: i64) {
        if token.unlimited_quota {
            return;
        }
        if let Err(e) = self.store.adjust_token_quota(token.id, -cost).await {
            tracing::error!(token_id = token.id, cost, "failed to release token reservation: {}", e);
        }
    }

    /// Apply a signed adjustment: positive deducts more, negative refunds.
    /// The user is always adjusted; the token only when it is metered.
    #[tracing::instrument(skip(self))]
    pub async fn post_consume(&self, token_id: i64, delta: i64) -> Result<(), AppError> {
        if delta == 0 {
            return Ok(());
        }
        let token = self
            .store
            .get_token(token_id)
            .await
            .map_err(AppError::Internal)?
            .ok_or_else(|| AppError::Auth(format!("token #{} not found", token_id)))?;
        self.apply(token.id, token.user_id, token.unlimited_quota, delta)
            .await
    }

    /// Reconcile a reservation with the metered cost.
    pub async fn settle(&self, reservation: &Reservation, actual: i64) -> Result<(), AppError> {
        let delta = actual.max(0) - reservation.amount;
        debug!(
            token_id = reservation.token_id,
            reserved = reservation.amount,
            actual,
            delta,
            "settling quota"
        );
        self.apply(
            reservation.token_id,
            reservation.user_id,
            reservation.token_unlimited,
            delta,
        )
        .await
    }

    /// Return the whole reservation.
    pub async fn refund(&self, reservation: &Reservation) -> Result<(), AppError> {
        self.settle(reservation, 0).await
    }

    async fn apply(&self, token_id: i64, user_id: i64, token_unlimited: bool, delta: i64) -> Result<(), AppError> {
        if delta == 0 {
            return Ok(());
        }
        match &self.batch {
            Some(batch) => {
                if !token_unlimited {
                    batch.add(BatchKind::TokenQuota, token_id, delta);
                }
                batch.add(BatchKind::UserQuota, user_id, delta);
            }
            None => {
                if !token_unlimited {
                    self.store
                        .adjust_token_quota(token_id, delta)
                        .await
                        .map_err(AppError::Internal)?;
                }
                self.store
                    .adjust_user_quota(user_id, delta)
                    .await
                    .map_err(AppError::Internal)?;
            }
        }
        Ok(())
    }

    fn notify_low_balance(&self, token: &Token, user: &User, token_balance: i64, user_balance: i64, cost: i64) {
        let Some(email) = user.email.clone().filter(|e| !e.is_empty()) else {
            return;
        };

        if !token.unlimited_quota && token.remind_threshold > 0 {
            let after = token_balance - cost;
            if crosses(token_balance, after, token.remind_threshold) {
                notification::dispatch(
                    self.notifier.clone(),
                    format!("Token '{}' is running low", token.name),
                    email.clone(),
                    format!(
                        "Token '{}' has {} quota left (threshold {}).",
                        token.name, after.max(0), token.remind_threshold
                    ),
                );
            }
        }

        let threshold = if user.remind_threshold > 0 {
            user.remind_threshold
        } else {
            self.remind_threshold
        };
        let after = user_balance - cost;
        if crosses(user_balance, after, threshold) {
            let subject = if after <= 0 {
                "Your quota is used up"
            } else {
                "Your quota is running low"
            };
            warn!(user_id = user.id, after, threshold, "user balance low");
            notification::dispatch(
                self.notifier.clone(),
                subject.to_string(),
                email,
                format!("Your remaining quota is {} (threshold {}).", after.max(0), threshold),
            );
        }
    }
}

/// True when a reservation moves a balance across the remind threshold or
/// down to zero.
fn crosses(before: i64, after: i64, threshold: i64) -> bool {
    (before >= threshold && after < threshold) || (before > 0 && after <= 0)
}
