//! Background routines periodically logging the node's state.
//!
//! Both routines run until their shutdown receiver disconnects, which
//! happens once every matching sender is dropped. A failed dump is logged
//! and retried on the next tick; it never ends the routine.

use std::time::Duration;

use async_trait::async_trait;
use flume::Receiver;
use libp2p::PeerId;
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument, Span};

use crate::dht::{Dht, RoutingSummary};
use crate::Result;

/// Floor applied to dump intervals, so a routine can never spin.
pub const MIN_DUMP_INTERVAL: Duration = Duration::from_millis(1);

/// Source of routing table snapshots.
#[async_trait]
pub trait DhtInspect: Send + Sync + 'static {
    async fn routing_summary(&self) -> Result<RoutingSummary>;
}

/// Source of the current connection set.
#[async_trait]
pub trait PeerInspect: Send + Sync + 'static {
    async fn connected_peers(&self) -> Result<Vec<PeerId>>;
}

#[async_trait]
impl DhtInspect for Dht {
    async fn routing_summary(&self) -> Result<RoutingSummary> {
        Dht::routing_summary(self).await
    }
}

#[async_trait]
impl PeerInspect for Dht {
    async fn connected_peers(&self) -> Result<Vec<PeerId>> {
        Dht::connected_peers(self).await
    }
}

/// Log a routing table summary every `interval` until `shutdown` disconnects.
pub async fn dump_dht_routine<D: DhtInspect>(
    dht: D,
    interval: Duration,
    shutdown: Receiver<()>,
    span: Span,
) {
    async move {
        let mut ticker = Ticker::new(interval, shutdown);

        while ticker.tick().await {
            match dht.routing_summary().await {
                Ok(summary) => info!(
                    peers = summary.peers(),
                    records = summary.records(),
                    "DHT routing table: {summary}"
                ),
                Err(error) => warn!(%error, "Failed to dump DHT routing table"),
            }
        }

        debug!("DHT dump routine stopped");
    }
    .instrument(span)
    .await
}

/// Log the connected peers every `interval` until `shutdown` disconnects.
pub async fn dump_peers_routine<P: PeerInspect>(
    host: P,
    interval: Duration,
    shutdown: Receiver<()>,
    span: Span,
) {
    async move {
        let mut ticker = Ticker::new(interval, shutdown);

        while ticker.tick().await {
            match host.connected_peers().await {
                Ok(peers) => {
                    info!(count = peers.len(), "Connected peers");
                    for peer in peers {
                        debug!(%peer, "Connected");
                    }
                }
                Err(error) => warn!(%error, "Failed to dump connected peers"),
            }
        }

        debug!("Peers dump routine stopped");
    }
    .instrument(span)
    .await
}

struct Ticker {
    interval: Interval,
    shutdown: Receiver<()>,
}

impl Ticker {
    fn new(period: Duration, shutdown: Receiver<()>) -> Self {
        let mut interval = time::interval(period.max(MIN_DUMP_INTERVAL));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self { interval, shutdown }
    }

    /// Wait for the next tick. Returns `false` once shutdown was signaled.
    async fn tick(&mut self) -> bool {
        tokio::select! {
            biased;

            _ = self.shutdown.recv_async() => false,
            _ = self.interval.tick() => true,
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::Error;

    /// Fails every dump.
    struct Broken {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DhtInspect for Broken {
        async fn routing_summary(&self) -> Result<RoutingSummary> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::DhtWasShutdown)
        }
    }

    /// Fails every other dump.
    struct Flaky {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PeerInspect for Flaky {
        async fn connected_peers(&self) -> Result<Vec<PeerId>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                Err(Error::DhtWasShutdown)
            } else {
                Ok(vec![PeerId::random()])
            }
        }
    }

    async fn wait_for(calls: &AtomicUsize, at_least: usize) {
        time::timeout(Duration::from_secs(5), async {
            while calls.load(Ordering::SeqCst) < at_least {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("routine stopped firing");
    }

    #[tokio::test]
    async fn failing_dht_dump_keeps_firing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (trigger, shutdown) = flume::bounded::<()>(0);

        let routine = tokio::spawn(dump_dht_routine(
            Broken {
                calls: calls.clone(),
            },
            Duration::from_millis(10),
            shutdown,
            Span::none(),
        ));

        wait_for(&calls, 3).await;
        assert!(!routine.is_finished());

        drop(trigger);
        time::timeout(Duration::from_secs(5), routine)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn flaky_peers_dump_keeps_firing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (trigger, shutdown) = flume::bounded::<()>(0);

        let routine = tokio::spawn(dump_peers_routine(
            Flaky {
                calls: calls.clone(),
            },
            Duration::from_millis(10),
            shutdown,
            Span::none(),
        ));

        wait_for(&calls, 4).await;

        drop(trigger);
        time::timeout(Duration::from_secs(5), routine)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_interrupts_the_wait() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (trigger, shutdown) = flume::bounded::<()>(0);

        let dht = tokio::spawn(dump_dht_routine(
            Broken {
                calls: calls.clone(),
            },
            Duration::from_secs(3600),
            shutdown.clone(),
            Span::none(),
        ));
        let peers = tokio::spawn(dump_peers_routine(
            Flaky {
                calls: Arc::new(AtomicUsize::new(0)),
            },
            Duration::from_secs(3600),
            shutdown,
            Span::none(),
        ));

        // The first tick fires right away, the next one is an hour out.
        wait_for(&calls, 1).await;

        drop(trigger);
        time::timeout(Duration::from_secs(1), async {
            dht.await.unwrap();
            peers.await.unwrap();
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_interval_is_floored() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let (_trigger, shutdown) = flume::bounded::<()>(0);

        let ticker = runtime.block_on(async { Ticker::new(Duration::ZERO, shutdown) });

        assert_eq!(ticker.interval.period(), MIN_DUMP_INTERVAL);
    }
}
