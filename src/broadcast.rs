use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::ledger::{BetLedger, SideTotals};

pub(crate) const BROADCAST_WINDOW_MS: u64 = 100;
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct ThrottleInner {
    last_sent_at: Option<Instant>,
    last_sent: Option<SideTotals>,
    deferred: bool,
}

struct Shared {
    ledger: Arc<BetLedger>,
    tx: broadcast::Sender<SideTotals>,
    inner: Mutex<ThrottleInner>,
}

impl Shared {
    fn fire(&self, now: Instant) {
        let mut inner = self.inner.lock();
        let snapshot = self.ledger.side_totals();
        if inner.last_sent == Some(snapshot) {
            return;
        }
        let _ = self.tx.send(snapshot);
        inner.last_sent = Some(snapshot);
        inner.last_sent_at = Some(now);
    }
}

/// Coalesces bursts of ledger mutations into a bounded-rate stream of
/// side-total snapshots. Best-effort: no queueing, no retry; a lagged
/// subscriber just skips to the latest snapshot.
pub(crate) struct TotalsBroadcast {
    shared: Arc<Shared>,
}

impl TotalsBroadcast {
    pub(crate) fn new(ledger: Arc<BetLedger>) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared { ledger, tx, inner: Mutex::new(ThrottleInner::default()) }),
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SideTotals> {
        self.shared.tx.subscribe()
    }

    /// Ask for the current totals to be pushed to subscribers. Fires
    /// immediately when the window since the last broadcast has elapsed;
    /// otherwise schedules a single deferred firing at the window boundary
    /// that absorbs every request in between. A firing whose totals equal
    /// the previously broadcast ones is skipped outright.
    pub(crate) fn publish(&self) {
        let window = Duration::from_millis(BROADCAST_WINDOW_MS);
        let now = Instant::now();

        let fire_at = {
            let mut inner = self.shared.inner.lock();
            if inner.deferred {
                return;
            }
            match inner.last_sent_at {
                Some(t) if now.duration_since(t) < window => {
                    inner.deferred = true;
                    t + window
                }
                _ => {
                    drop(inner);
                    self.shared.fire(now);
                    return;
                }
            }
        };

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            tokio::time::sleep_until(fire_at).await;
            shared.inner.lock().deferred = false;
            shared.fire(Instant::now());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Side;

    fn drain(rx: &mut broadcast::Receiver<SideTotals>) -> Vec<SideTotals> {
        let mut out = Vec::new();
        while let Ok(snap) = rx.try_recv() {
            out.push(snap);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_into_one_deferred_broadcast() {
        let ledger = Arc::new(BetLedger::new());
        let broadcast = TotalsBroadcast::new(Arc::clone(&ledger));
        let mut rx = broadcast.subscribe();

        // Prime the throttle window with an initial mutation.
        ledger.atomic_place(1, Side::Red, 100, 1_000_000).unwrap();
        broadcast.publish();
        assert_eq!(drain(&mut rx).len(), 1);

        // Ten mutations inside the same window collapse to one firing
        // carrying only the final totals.
        for i in 0..10 {
            ledger.atomic_place(2 + i, Side::Blue, 100, 1_000_000).unwrap();
            broadcast.publish();
        }
        assert!(drain(&mut rx).is_empty());

        tokio::time::sleep(Duration::from_millis(BROADCAST_WINDOW_MS * 2)).await;
        let got = drain(&mut rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], SideTotals { red_cents: 100, blue_cents: 1_000 });
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_totals_suppress_the_firing() {
        let ledger = Arc::new(BetLedger::new());
        let broadcast = TotalsBroadcast::new(Arc::clone(&ledger));
        let mut rx = broadcast.subscribe();

        ledger.atomic_place(1, Side::Red, 500, 1_000_000).unwrap();
        broadcast.publish();
        assert_eq!(drain(&mut rx).len(), 1);

        // A cancel that exactly undoes a place leaves totals byte-identical
        // at firing time, so the deferred broadcast is skipped.
        ledger.atomic_place(2, Side::Blue, 100, 1_000_000).unwrap();
        broadcast.publish();
        ledger.atomic_cancel(2, 100).unwrap();
        broadcast.publish();

        tokio::time::sleep(Duration::from_millis(BROADCAST_WINDOW_MS * 2)).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn spaced_publishes_fire_immediately() {
        let ledger = Arc::new(BetLedger::new());
        let broadcast = TotalsBroadcast::new(Arc::clone(&ledger));
        let mut rx = broadcast.subscribe();

        for i in 0..3 {
            ledger.atomic_place(i, Side::Red, 100, 1_000_000).unwrap();
            broadcast.publish();
            tokio::time::sleep(Duration::from_millis(BROADCAST_WINDOW_MS + 10)).await;
        }
        assert_eq!(drain(&mut rx).len(), 3);
    }
}
