//! Event sources: the one place a bridge waits for inbound messages.
//!
//! [`PollingSource`] asks a remote queue on a fixed interval, backing off
//! while the remote is unreachable. [`PushSource`] drains a channel fed by a
//! webhook handler or socket task. The run loop only sees [`EventSource`].

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::model::InboundMessage;

/// Waits for the next batch of inbound messages.
#[async_trait]
pub trait EventSource: Send {
    /// The next non-empty batch, or `None` once the source is exhausted.
    ///
    /// Must be cancel-safe: the run loop drops this future on shutdown.
    async fn next_batch(&mut self) -> Result<Option<Vec<InboundMessage>>>;
}

// ---------------------------------------------------------------------------
// Polling
// ---------------------------------------------------------------------------

/// How a single poll failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    /// Gateway errors, connection failures, timeouts. Counted for backoff.
    #[error("transient poll failure: {0}")]
    Transient(String),

    /// The remote rejected our credentials. Logged, not counted.
    #[error("unauthorized")]
    Unauthorized,

    #[error("poll failed: {0}")]
    Other(String),
}

/// Fetches whatever is queued right now.
#[async_trait]
pub trait Poller: Send {
    async fn poll(&mut self) -> std::result::Result<Vec<InboundMessage>, PollError>;
}

/// Failures tolerated before the interval starts growing.
pub const BACKOFF_THRESHOLD: u32 = 5;

/// Upper bound on the backed-off interval.
pub const MAX_BACKOFF_INTERVAL: Duration = Duration::from_secs(30);

/// Consecutive-failure counter and the interval it implies.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    base: Duration,
    failures: u32,
}

impl PollBackoff {
    pub fn new(base: Duration) -> Self {
        Self { base, failures: 0 }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Returns the previous failure count.
    pub fn record_success(&mut self) -> u32 {
        std::mem::take(&mut self.failures)
    }

    pub fn record_failure(&mut self) -> u32 {
        self.failures = self.failures.saturating_add(1);
        self.failures
    }

    /// `base` up to the threshold, then doubling per extra failure, capped
    /// at [`MAX_BACKOFF_INTERVAL`] but never shorter than `base`.
    pub fn interval(&self) -> Duration {
        if self.failures <= BACKOFF_THRESHOLD {
            return self.base;
        }
        let exponent = (self.failures - BACKOFF_THRESHOLD).min(16);
        let grown = self.base.saturating_mul(1u32 << exponent);
        grown.min(MAX_BACKOFF_INTERVAL).max(self.base)
    }
}

/// Polls `P` every interval until something arrives.
pub struct PollingSource<P> {
    poller: P,
    backoff: PollBackoff,
    polled_once: bool,
}

impl<P: Poller> PollingSource<P> {
    pub fn new(poller: P, interval: Duration) -> Self {
        Self {
            poller,
            backoff: PollBackoff::new(interval),
            polled_once: false,
        }
    }

    pub fn backoff(&self) -> &PollBackoff {
        &self.backoff
    }

    pub fn poller_mut(&mut self) -> &mut P {
        &mut self.poller
    }

    async fn poll_once(&mut self) -> Option<Vec<InboundMessage>> {
        match self.poller.poll().await {
            Ok(batch) => {
                let previous = self.backoff.record_success();
                if previous > 0 {
                    tracing::info!(failures = previous, "connection restored");
                }
                Some(batch)
            }
            Err(PollError::Unauthorized) => {
                tracing::error!("poll rejected: invalid bridge token");
                None
            }
            Err(PollError::Transient(reason)) => {
                let failures = self.backoff.record_failure();
                if failures <= 3 || failures % 10 == 0 {
                    tracing::warn!(failures, reason = %reason, "remote unavailable, waiting");
                }
                None
            }
            Err(PollError::Other(reason)) => {
                tracing::error!(reason = %reason, "poll failed");
                None
            }
        }
    }
}

#[async_trait]
impl<P: Poller> EventSource for PollingSource<P> {
    async fn next_batch(&mut self) -> Result<Option<Vec<InboundMessage>>> {
        loop {
            if self.polled_once {
                tokio::time::sleep(self.backoff.interval()).await;
            }
            self.polled_once = true;

            if let Some(batch) = self.poll_once().await
                && !batch.is_empty()
            {
                return Ok(Some(batch));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Push
// ---------------------------------------------------------------------------

/// Receives messages enqueued by a transport task.
pub struct PushSource {
    rx: mpsc::Receiver<InboundMessage>,
}

/// A connected sender / [`PushSource`] pair.
pub fn push_channel(capacity: usize) -> (mpsc::Sender<InboundMessage>, PushSource) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, PushSource { rx })
}

impl PushSource {
    pub fn new(rx: mpsc::Receiver<InboundMessage>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl EventSource for PushSource {
    async fn next_batch(&mut self) -> Result<Option<Vec<InboundMessage>>> {
        let Some(first) = self.rx.recv().await else {
            return Ok(None);
        };
        let mut batch = vec![first];
        while let Ok(more) = self.rx.try_recv() {
            batch.push(more);
        }
        Ok(Some(batch))
    }
}
