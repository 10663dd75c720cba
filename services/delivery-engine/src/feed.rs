// Live feed bridge
// Turns the pull-based snapshot read into a pushed stream, one task per
// subscriber. Every message is a full snapshot, so there is no resume state.

use crate::access::{AccessGate, Operation, Principal};
use crate::errors::{DeliveryError, Result};
use crate::ledger::TrackingLedger;
use crate::metrics::METRICS;
use crate::models::DeliverySnapshot;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Handle held by the transport. Dropping it stops the feed task.
pub struct FeedSubscription {
    inner: ReceiverStream<Result<DeliverySnapshot>>,
    _guard: DropGuard,
}

impl Stream for FeedSubscription {
    type Item = Result<DeliverySnapshot>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

pub struct LiveFeedBridge {
    ledger: TrackingLedger,
    tick_interval: Duration,
    shutdown: CancellationToken,
}

impl LiveFeedBridge {
    pub fn new(ledger: TrackingLedger, tick_interval: Duration) -> Self {
        Self {
            ledger,
            tick_interval,
            shutdown: CancellationToken::new(),
        }
    }

    /// Authorize and open a feed. Errors are returned before any stream exists.
    pub async fn subscribe(&self, principal: &Principal, delivery_id: Uuid) -> Result<FeedSubscription> {
        if self.shutdown.is_cancelled() {
            return Err(DeliveryError::Internal("live feeds are shutting down".to_string()));
        }

        let snapshot = self.ledger.snapshot(delivery_id).await?;
        AccessGate::authorize(principal, Operation::Stream, &snapshot.delivery)?;

        // One slot: the producer waits for a slow consumer rather than queueing
        let (tx, rx) = mpsc::channel(1);
        let cancel = self.shutdown.child_token();

        tokio::spawn(run_feed(
            self.ledger.clone(),
            delivery_id,
            snapshot,
            self.tick_interval,
            tx,
            cancel.clone(),
        ));

        info!(delivery_id = %delivery_id, principal = principal.kind(), "Live feed opened");

        Ok(FeedSubscription {
            inner: ReceiverStream::new(rx),
            _guard: cancel.drop_guard(),
        })
    }

    /// Close every open feed and refuse new ones
    pub fn shutdown(&self) {
        info!("Closing live feeds");
        self.shutdown.cancel();
    }
}

async fn run_feed(
    ledger: TrackingLedger,
    delivery_id: Uuid,
    first: DeliverySnapshot,
    period: Duration,
    tx: mpsc::Sender<Result<DeliverySnapshot>>,
    cancel: CancellationToken,
) {
    METRICS.feed_subscribers.inc();

    // The snapshot read to authorize the subscriber is the first message
    let mut next = Some(first);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let snapshot = match next.take() {
            Some(snapshot) => snapshot,
            None => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {}
                }

                match ledger.snapshot(delivery_id).await {
                    Ok(snapshot) => snapshot,
                    Err(err) => {
                        // A skipped tick would read as "nothing changed"; close instead
                        error!(delivery_id = %delivery_id, "Live feed fetch failed: {}", err);
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {}
                            _ = tx.send(Err(err)) => {}
                        }
                        break;
                    }
                }
            }
        };

        debug!(delivery_id = %delivery_id, status = %snapshot.delivery.status, "Feed tick");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = tx.send(Ok(snapshot)) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    METRICS.feed_subscribers.dec();
    info!(delivery_id = %delivery_id, "Live feed closed");
}
