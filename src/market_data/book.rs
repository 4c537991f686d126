// =============================================================================
// Order Book — sequence-consistent local depth image
// =============================================================================
//
// Canonical snapshot + delta synchronisation:
//   1. Buffer stream events while the REST snapshot is in flight.
//   2. Seed bids/asks from the snapshot; record U0 = lastUpdateId.
//   3. Drop events with u < U0. The first applied event must straddle the
//      snapshot: U <= U0+1 <= u. Every later event must chain exactly:
//      pu == last_update_id.
//   4. Any violation marks the book unsynced; resyncs are throttled to one
//      per 2 s and at most 5 attempts until one succeeds.
//
// Price keys are scaled to integer 1e-8 units so the maps order correctly and
// repeated float parses of the same level always hit the same key.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::binance::models::DepthSnapshot;

const PRICE_SCALE: f64 = 1e8;
/// Depth of the cached projection used by the analyser and the GUI.
const TOP_DEPTH: usize = 20;

fn price_key(price: f64) -> i64 {
    (price * PRICE_SCALE).round() as i64
}

fn key_price(key: i64) -> f64 {
    key as f64 / PRICE_SCALE
}

// =============================================================================
// Events and projections
// =============================================================================

/// One diff-depth event from the stream.
#[derive(Debug, Clone)]
pub struct DepthEvent {
    /// First update id in the event (U).
    pub first_id: u64,
    /// Final update id in the event (u).
    pub final_id: u64,
    /// Final update id of the previous event (pu).
    pub prev_final_id: u64,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

/// Outcome of feeding one event into the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    Applied,
    /// Event predates the snapshot; ignored.
    Stale,
    /// Sequence broken; the book is now unsynced.
    Gap,
    /// Book not synced; event ignored until a snapshot arrives.
    NotSynced,
}

/// Top-of-book projection: `bids` descending, `asks` ascending.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BookTop {
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub last_update_id: u64,
}

impl BookTop {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|&(p, _)| p)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|&(p, _)| p)
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() || self.asks.is_empty()
    }
}

// =============================================================================
// OrderBook
// =============================================================================

#[derive(Debug, Default)]
pub struct OrderBook {
    bids: BTreeMap<i64, f64>,
    asks: BTreeMap<i64, f64>,
    last_update_id: u64,
    synced: bool,
    /// Set between a snapshot and the first applied delta; the first event has
    /// a straddle requirement instead of an exact pu chain.
    awaiting_first_event: bool,
    snapshot_update_id: u64,
    top: BookTop,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn top(&self) -> &BookTop {
        &self.top
    }

    pub fn mark_unsynced(&mut self) {
        self.synced = false;
    }

    /// Seed the book from a REST snapshot; makes the book synced.
    pub fn apply_snapshot(&mut self, snapshot: &DepthSnapshot) {
        self.bids.clear();
        self.asks.clear();
        for &(p, q) in &snapshot.bids {
            if q > 0.0 {
                self.bids.insert(price_key(p), q);
            }
        }
        for &(p, q) in &snapshot.asks {
            if q > 0.0 {
                self.asks.insert(price_key(p), q);
            }
        }
        self.last_update_id = snapshot.last_update_id;
        self.snapshot_update_id = snapshot.last_update_id;
        self.synced = true;
        self.awaiting_first_event = true;
        self.rebuild_top();
    }

    /// Feed one stream event through the sequence rules.
    pub fn apply_delta(&mut self, event: &DepthEvent) -> DeltaOutcome {
        if !self.synced {
            return DeltaOutcome::NotSynced;
        }

        // Events wholly before the snapshot carry nothing new.
        if event.final_id < self.snapshot_update_id {
            return DeltaOutcome::Stale;
        }

        if self.awaiting_first_event {
            let expected = self.snapshot_update_id + 1;
            if !(event.first_id <= expected && expected <= event.final_id) {
                // The stream started past the snapshot; a fresh snapshot is
                // needed to bridge the hole.
                if event.first_id > expected {
                    self.synced = false;
                    return DeltaOutcome::Gap;
                }
                return DeltaOutcome::Stale;
            }
            self.awaiting_first_event = false;
        } else if event.prev_final_id != self.last_update_id {
            self.synced = false;
            return DeltaOutcome::Gap;
        }

        for &(p, q) in &event.bids {
            let key = price_key(p);
            if q == 0.0 {
                self.bids.remove(&key);
            } else {
                self.bids.insert(key, q);
            }
        }
        for &(p, q) in &event.asks {
            let key = price_key(p);
            if q == 0.0 {
                self.asks.remove(&key);
            } else {
                self.asks.insert(key, q);
            }
        }

        self.last_update_id = event.final_id;
        self.rebuild_top();
        DeltaOutcome::Applied
    }

    fn rebuild_top(&mut self) {
        self.top = BookTop {
            bids: self
                .bids
                .iter()
                .rev()
                .take(TOP_DEPTH)
                .map(|(&k, &q)| (key_price(k), q))
                .collect(),
            asks: self
                .asks
                .iter()
                .take(TOP_DEPTH)
                .map(|(&k, &q)| (key_price(k), q))
                .collect(),
            last_update_id: self.last_update_id,
        };
    }
}

// =============================================================================
// Resync throttling
// =============================================================================

/// At most one resync per window and a bounded number of consecutive failures
/// before the symbol pauses; success resets everything.
#[derive(Debug)]
pub struct ResyncGate {
    last_attempt: Option<Instant>,
    attempts: u32,
    min_interval: Duration,
    max_attempts: u32,
}

impl ResyncGate {
    pub fn new() -> Self {
        Self {
            last_attempt: None,
            attempts: 0,
            min_interval: Duration::from_secs(2),
            max_attempts: 5,
        }
    }

    /// Whether a resync may start now; records the attempt if allowed.
    pub fn try_begin(&mut self, now: Instant) -> bool {
        if self.attempts >= self.max_attempts {
            return false;
        }
        if let Some(last) = self.last_attempt {
            if now.duration_since(last) < self.min_interval {
                return false;
            }
        }
        self.last_attempt = Some(now);
        self.attempts += 1;
        true
    }

    pub fn record_success(&mut self) {
        self.attempts = 0;
        self.last_attempt = None;
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

impl Default for ResyncGate {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// BookManager
// =============================================================================

/// Owns one `OrderBook` per subscribed symbol. The depth stream task is the
/// single writer; readers receive cloned `BookTop` projections.
pub struct BookManager {
    books: RwLock<HashMap<String, OrderBook>>,
}

impl BookManager {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
        }
    }

    pub fn apply_snapshot(&self, symbol: &str, snapshot: &DepthSnapshot) {
        let mut books = self.books.write();
        let book = books.entry(symbol.to_string()).or_default();
        book.apply_snapshot(snapshot);
        debug!(
            symbol,
            last_update_id = snapshot.last_update_id,
            bid_levels = snapshot.bids.len(),
            ask_levels = snapshot.asks.len(),
            "book snapshot applied"
        );
    }

    pub fn apply_delta(&self, symbol: &str, event: &DepthEvent) -> DeltaOutcome {
        let mut books = self.books.write();
        let book = books.entry(symbol.to_string()).or_default();
        let outcome = book.apply_delta(event);
        if outcome == DeltaOutcome::Gap {
            warn!(
                symbol,
                pu = event.prev_final_id,
                last_update_id = book.last_update_id(),
                "depth sequence gap, resync required"
            );
        }
        outcome
    }

    pub fn mark_unsynced(&self, symbol: &str) {
        if let Some(book) = self.books.write().get_mut(symbol) {
            book.mark_unsynced();
        }
    }

    pub fn is_synced(&self, symbol: &str) -> bool {
        self.books
            .read()
            .get(symbol)
            .map(|b| b.is_synced())
            .unwrap_or(false)
    }

    pub fn top(&self, symbol: &str) -> Option<BookTop> {
        self.books.read().get(symbol).map(|b| b.top().clone())
    }
}

impl Default for BookManager {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn snapshot() -> DepthSnapshot {
        DepthSnapshot {
            last_update_id: 100,
            bids: vec![(100.00, 5.0), (99.99, 2.0)],
            asks: vec![(100.02, 1.0), (100.03, 1.0)],
        }
    }

    fn event(first: u64, last: u64, prev: u64) -> DepthEvent {
        DepthEvent {
            first_id: first,
            final_id: last,
            prev_final_id: prev,
            bids: vec![],
            asks: vec![],
        }
    }

    #[test]
    fn snapshot_seeds_a_synced_book() {
        let mut book = OrderBook::new();
        book.apply_snapshot(&snapshot());
        assert!(book.is_synced());
        assert_eq!(book.last_update_id(), 100);
        assert_eq!(book.top().best_bid(), Some(100.00));
        assert_eq!(book.top().best_ask(), Some(100.02));
    }

    #[test]
    fn first_event_must_straddle_the_snapshot() {
        let mut book = OrderBook::new();
        book.apply_snapshot(&snapshot());

        // Entirely before the snapshot: dropped.
        assert_eq!(book.apply_delta(&event(90, 95, 89)), DeltaOutcome::Stale);
        assert!(book.is_synced());

        // Straddles U0+1 = 101: applied.
        assert_eq!(book.apply_delta(&event(98, 105, 97)), DeltaOutcome::Applied);
        assert_eq!(book.last_update_id(), 105);
    }

    #[test]
    fn first_event_past_the_snapshot_is_a_gap() {
        let mut book = OrderBook::new();
        book.apply_snapshot(&snapshot());
        assert_eq!(book.apply_delta(&event(150, 160, 149)), DeltaOutcome::Gap);
        assert!(!book.is_synced());
    }

    #[test]
    fn chained_events_require_exact_pu() {
        let mut book = OrderBook::new();
        book.apply_snapshot(&snapshot());
        assert_eq!(book.apply_delta(&event(98, 105, 97)), DeltaOutcome::Applied);
        assert_eq!(
            book.apply_delta(&event(106, 110, 105)),
            DeltaOutcome::Applied
        );

        // pu != last_update_id: gap, book unsynced, further events ignored.
        assert_eq!(book.apply_delta(&event(112, 115, 111)), DeltaOutcome::Gap);
        assert!(!book.is_synced());
        assert_eq!(
            book.apply_delta(&event(116, 120, 115)),
            DeltaOutcome::NotSynced
        );
    }

    #[test]
    fn zero_quantity_removes_the_level() {
        let mut book = OrderBook::new();
        book.apply_snapshot(&snapshot());

        let mut ev = event(98, 105, 97);
        ev.bids = vec![(99.99, 0.0), (99.98, 3.0)];
        assert_eq!(book.apply_delta(&ev), DeltaOutcome::Applied);

        let top = book.top();
        assert!(top.bids.iter().all(|&(_, q)| q > 0.0));
        assert!(!top.bids.iter().any(|&(p, _)| (p - 99.99).abs() < 1e-9));
        assert!(top.bids.iter().any(|&(p, _)| (p - 99.98).abs() < 1e-9));
    }

    #[test]
    fn top_bid_stays_below_top_ask() {
        let mut book = OrderBook::new();
        book.apply_snapshot(&snapshot());

        let mut ev = event(98, 105, 97);
        ev.bids = vec![(100.01, 1.0)];
        ev.asks = vec![(100.02, 2.0)];
        book.apply_delta(&ev);

        let top = book.top();
        assert!(top.best_bid().unwrap() < top.best_ask().unwrap());
    }

    #[test]
    fn resync_gate_throttles_and_exhausts() {
        let mut gate = ResyncGate::new();
        let t0 = Instant::now();

        assert!(gate.try_begin(t0));
        // Second attempt inside the 2 s window is refused.
        assert!(!gate.try_begin(t0 + Duration::from_millis(500)));
        assert!(gate.try_begin(t0 + Duration::from_secs(3)));

        // Burn through the remaining attempts.
        assert!(gate.try_begin(t0 + Duration::from_secs(6)));
        assert!(gate.try_begin(t0 + Duration::from_secs(9)));
        assert!(gate.try_begin(t0 + Duration::from_secs(12)));
        assert!(gate.exhausted());
        assert!(!gate.try_begin(t0 + Duration::from_secs(60)));

        gate.record_success();
        assert!(!gate.exhausted());
        assert!(gate.try_begin(t0 + Duration::from_secs(61)));
    }

    proptest! {
        /// Applying any chain of valid deltas keeps last_update_id
        /// non-decreasing and never stores a zero-quantity level.
        #[test]
        fn valid_delta_chains_preserve_invariants(
            steps in proptest::collection::vec(
                (1u64..5, proptest::collection::vec((9900u32..10100, 0u32..5), 0..4)),
                1..30,
            )
        ) {
            let mut book = OrderBook::new();
            book.apply_snapshot(&snapshot());

            let mut next_first = 101u64;
            let mut prev_final = 100u64;
            for (span, levels) in steps {
                let final_id = next_first + span;
                let ev = DepthEvent {
                    first_id: next_first,
                    final_id,
                    prev_final_id: prev_final,
                    bids: levels
                        .iter()
                        .map(|&(p, q)| (p as f64 / 100.0, q as f64))
                        .collect(),
                    asks: vec![],
                };
                let before = book.last_update_id();
                let outcome = book.apply_delta(&ev);
                prop_assert_eq!(outcome, DeltaOutcome::Applied);
                prop_assert!(book.last_update_id() >= before);
                prop_assert!(book.top().bids.iter().all(|&(_, q)| q > 0.0));
                prop_assert!(book.top().asks.iter().all(|&(_, q)| q > 0.0));
                prev_final = final_id;
                next_first = final_id + 1;
            }
            prop_assert!(book.is_synced());
        }
    }
}
