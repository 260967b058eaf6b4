use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::lock::{LockError, LockHandle, PollLock};
use crate::bot::{DispatchError, EventDispatcher};
use crate::config::PollingSettings;
use crate::ledger::{LedgerEntry, RecordOutcome, UpdateLedger};
use crate::telegram::{deliver_all, ChatGateway, GatewayError, RetryPolicy, Update};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Starting,
    Polling,
    Stopped,
}

/// Why a coordinator that did start polling came to a halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    LeaseLost,
    /// The gateway reported another consumer on the same credential.
    Conflict,
    /// Push delivery could not be switched off.
    WebhookStillActive,
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("chat gateway failed during start-up: {0}")]
    Gateway(#[from] GatewayError),
    #[error("update ledger unavailable: {0}")]
    Ledger(#[from] sqlx::Error),
}

/// key: polling-coordinator -> single-writer long-poll loop
pub struct PollingCoordinator {
    gateway: Arc<dyn ChatGateway>,
    ledger: Arc<dyn UpdateLedger>,
    dispatcher: Arc<dyn EventDispatcher>,
    lock: PollLock,
    settings: PollingSettings,
    retry: RetryPolicy,
    cursor_override: Option<i64>,
    cursor: Option<i64>,
    state: CoordinatorState,
}

impl PollingCoordinator {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        ledger: Arc<dyn UpdateLedger>,
        dispatcher: Arc<dyn EventDispatcher>,
        lock: PollLock,
        settings: PollingSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            gateway,
            ledger,
            dispatcher,
            lock,
            settings,
            retry,
            cursor_override: None,
            cursor: None,
            state: CoordinatorState::Idle,
        }
    }

    /// Starts from this offset instead of the ledger's resume cursor.
    pub fn with_cursor(mut self, cursor: Option<i64>) -> Self {
        self.cursor_override = cursor;
        self
    }

    pub fn cursor(&self) -> Option<i64> {
        self.cursor
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<StopReason, CoordinatorError> {
        self.transition(CoordinatorState::Starting);
        let handle = match self.lock.acquire().await {
            Ok(handle) => handle,
            Err(err) => {
                self.transition(CoordinatorState::Stopped);
                return Err(err.into());
            }
        };

        let outcome = match self.start().await {
            Ok(None) => {
                self.transition(CoordinatorState::Polling);
                Ok(self.poll(&handle, &mut shutdown).await)
            }
            Ok(Some(reason)) => Ok(reason),
            Err(err) => Err(err),
        };

        self.lock.release(handle).await;
        self.transition(CoordinatorState::Stopped);
        if let Ok(reason) = &outcome {
            info!(?reason, cursor = ?self.cursor, "polling coordinator stopped");
        }
        outcome
    }

    /// Switches push delivery off and loads the resume cursor.
    async fn start(&mut self) -> Result<Option<StopReason>, CoordinatorError> {
        let info = self.gateway.get_webhook_info().await?;
        if info.push_enabled() {
            warn!(
                url = %info.url,
                pending = info.pending_update_count,
                "webhook delivery is active; disabling it before polling"
            );
            self.gateway
                .delete_webhook(self.settings.drop_pending_updates)
                .await?;
            let info = self.gateway.get_webhook_info().await?;
            if info.push_enabled() {
                error!(url = %info.url, "webhook delivery is still active; refusing to poll");
                return Ok(Some(StopReason::WebhookStillActive));
            }
        }

        self.cursor = match self.cursor_override {
            Some(cursor) => Some(cursor),
            None => self.ledger.resume_cursor().await?,
        };
        info!(cursor = ?self.cursor, "resuming long poll");
        Ok(None)
    }

    async fn poll(
        &mut self,
        handle: &LockHandle,
        shutdown: &mut watch::Receiver<bool>,
    ) -> StopReason {
        loop {
            if *shutdown.borrow() {
                return StopReason::Shutdown;
            }

            match self.lock.renew(handle).await {
                Ok(()) => {}
                Err(LockError::Lost { key }) => {
                    error!(%key, "poll lease taken over by another consumer; stopping");
                    return StopReason::LeaseLost;
                }
                Err(err) => {
                    warn!(?err, "poll lease renewal failed");
                    if self.pause(shutdown).await {
                        return StopReason::Shutdown;
                    }
                    continue;
                }
            }

            let batch = tokio::select! {
                batch = self.gateway.get_updates(self.cursor, self.settings.long_poll_timeout) => batch,
                _ = shutdown.changed() => return StopReason::Shutdown,
            };

            match batch {
                Ok(updates) => {
                    for (index, update) in updates.into_iter().enumerate() {
                        // The lease is renewed before every event; a batch can outlast it.
                        if index > 0 {
                            match self.lock.renew(handle).await {
                                Ok(()) => {}
                                Err(LockError::Lost { key }) => {
                                    error!(%key, update_id = update.update_id, "poll lease lost mid-batch; stopping");
                                    return StopReason::LeaseLost;
                                }
                                Err(err) => {
                                    warn!(?err, update_id = update.update_id, "poll lease renewal failed; deferring rest of batch");
                                    break;
                                }
                            }
                        }
                        self.process(update).await;
                        if *shutdown.borrow() {
                            return StopReason::Shutdown;
                        }
                    }
                }
                Err(GatewayError::Conflict(description)) => {
                    error!(%description, "another consumer is polling this bot; stopping");
                    return StopReason::Conflict;
                }
                Err(err) => {
                    warn!(?err, delay = ?self.settings.retry_delay, "getUpdates failed; retrying");
                    if self.pause(shutdown).await {
                        return StopReason::Shutdown;
                    }
                }
            }
        }
    }

    async fn process(&mut self, update: Update) {
        let update_id = update.update_id;
        if self.cursor.map_or(false, |cursor| update_id < cursor) {
            debug!(update_id, cursor = ?self.cursor, "update below cursor; skipping");
            return;
        }

        let entry = LedgerEntry::from_update(&update, Utc::now());
        let fresh = match self.ledger.record(&entry).await {
            Ok(RecordOutcome::Recorded) => true,
            Ok(RecordOutcome::Duplicate) => {
                info!(update_id, "update already recorded; skipping dispatch");
                false
            }
            Err(err) => {
                error!(?err, update_id, "failed to record update; dispatching anyway");
                true
            }
        };

        if fresh {
            let gateway = self.gateway.clone();
            let dispatcher = self.dispatcher.clone();
            let retry = self.retry;
            let work = async {
                let effects = dispatcher.dispatch(&update).await?;
                Ok::<_, DispatchError>(deliver_all(gateway.as_ref(), &effects, retry).await)
            };
            match timeout(self.settings.dispatch_timeout, work).await {
                Ok(Ok(report)) => debug!(
                    update_id,
                    delivered = report.delivered,
                    dropped = report.dropped,
                    "update handled"
                ),
                Ok(Err(err)) => error!(?err, update_id, kind = update.kind(), "update dispatch failed"),
                Err(_) => error!(
                    update_id,
                    limit = ?self.settings.dispatch_timeout,
                    "update dispatch timed out"
                ),
            }
        }

        let next = update_id + 1;
        self.cursor = Some(self.cursor.map_or(next, |cursor| cursor.max(next)));
    }

    /// Sleeps the retry delay; true when shutdown was requested meanwhile.
    async fn pause(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = sleep(self.settings.retry_delay) => *shutdown.borrow(),
            _ = shutdown.changed() => true,
        }
    }

    fn transition(&mut self, next: CoordinatorState) {
        debug!(from = ?self.state, to = ?next, "polling coordinator state change");
        self.state = next;
    }
}
