//! Stage worker wrapper.
//!
//! Consume, handle, commit. Transient errors retry in place with backoff;
//! permanent errors send the message to the DLQ and commit the offset so
//! one bad message never wedges a partition. Logical duplicates count as
//! success.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::bus::{Delivery, Subscription};
use crate::config::RetryConfig;
use crate::connector::Backoff;
use crate::dlq::DlqHandler;
use crate::error::TollHubError;
use crate::health::PipelineMetrics;

const POLL_TIMEOUT: Duration = Duration::from_millis(500);

#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage_name(&self) -> &'static str;

    async fn handle(&self, delivery: &Delivery) -> Result<(), TollHubError>;
}

pub struct StageWorker<H: StageHandler> {
    subscription: Subscription,
    handler: Arc<H>,
    dlq: DlqHandler,
    retry: RetryConfig,
    metrics: Arc<PipelineMetrics>,
}

impl<H: StageHandler> StageWorker<H> {
    pub fn new(
        subscription: Subscription,
        handler: Arc<H>,
        dlq: DlqHandler,
        retry: RetryConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self { subscription, handler, dlq, retry, metrics }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let stage = self.handler.stage_name();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("[{stage}] worker stopping");
                    break;
                }
                polled = self.subscription.poll(POLL_TIMEOUT) => {
                    match polled {
                        Ok(Some(delivery)) => self.process(&delivery).await,
                        Ok(None) => {}
                        Err(TollHubError::BusClosed) => {
                            log::info!("[{stage}] bus closed, worker stopping");
                            break;
                        }
                        Err(err) => {
                            log::error!("[{stage}] poll failed: {err}");
                            tokio::time::sleep(POLL_TIMEOUT).await;
                        }
                    }
                }
            }
        }
    }

    /// Handle one delivery to completion: success, duplicate, or DLQ. The
    /// offset commits in every branch; only a crash leaves it uncommitted
    /// for redelivery.
    pub async fn process(&self, delivery: &Delivery) {
        let stage = self.handler.stage_name();
        let mut backoff = Backoff::new(&self.retry);
        let mut attempts = 0u32;
        loop {
            match self.handler.handle(delivery).await {
                Ok(()) => break,
                Err(err) if err.is_duplicate() => {
                    log::debug!("[{stage}] duplicate treated as success: {err}");
                    break;
                }
                Err(err) if err.is_transient() && attempts < self.retry.max => {
                    attempts += 1;
                    // Rate limits sleep the suggested interval; everything
                    // else follows the backoff schedule.
                    let delay = match &err {
                        TollHubError::RateLimitExceeded { .. } => {
                            err.retry_delay().unwrap_or_else(|| backoff.next_delay())
                        }
                        _ => backoff.next_delay(),
                    };
                    log::debug!(
                        "[{stage}] transient error ({}), retry {attempts}/{} in {delay:?}",
                        err.class(),
                        self.retry.max
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    PipelineMetrics::incr(&self.metrics.dead_lettered);
                    if let Err(route_err) = self.dlq.route(delivery, &err) {
                        log::error!("[{stage}] failed to dead-letter message: {route_err}");
                    }
                    break;
                }
            }
        }
        if let Err(err) = self.subscription.commit(delivery) {
            log::error!("[{stage}] commit failed: {err}");
        }
    }
}
