use crate::models::Candle;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

/// Capacity-bounded series of one interval's candles, strictly increasing
/// by timestamp. Oldest bars are evicted on overflow; only the tail is
/// actively consulted.
#[derive(Debug)]
pub struct CandleRing {
    capacity: usize,
    candles: VecDeque<Candle>,
}

impl CandleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            candles: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a candle, evicting the oldest at capacity.
    ///
    /// An append whose timestamp is not strictly greater than the last
    /// stored one indicates bad upstream data; it is dropped with a
    /// warning rather than corrupting the series.
    pub fn append(&mut self, candle: Candle) -> bool {
        if let Some(last) = self.candles.back() {
            if candle.time <= last.time {
                tracing::warn!(
                    time = %candle.time,
                    last = %last.time,
                    "dropping out-of-order candle append"
                );
                return false;
            }
        }

        self.candles.push_back(candle);
        while self.candles.len() > self.capacity {
            self.candles.pop_front();
        }
        true
    }

    pub fn last_time(&self) -> Option<DateTime<Utc>> {
        self.candles.back().map(|c| c.time)
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Candle> {
        self.candles.get(index)
    }

    /// Position of the bar carrying exactly this timestamp, if it is
    /// still stored.
    pub fn index_of(&self, time: DateTime<Utc>) -> Option<usize> {
        self.candles.iter().rposition(|c| c.time == time)
    }

    /// Up to `n` most recent candles with `time <= until`, oldest first.
    pub fn last_n_up_to(&self, until: DateTime<Utc>, n: usize) -> Vec<Candle> {
        if n == 0 {
            return Vec::new();
        }
        let mut out: Vec<Candle> = self
            .candles
            .iter()
            .rev()
            .filter(|c| c.time <= until)
            .take(n)
            .cloned()
            .collect();
        out.reverse();
        out
    }

    /// Overwrite all fields of the candle at `index` in place. Length and
    /// ordinal position never change.
    ///
    /// A replacement timestamp that would break the series ordering is
    /// refused for the time field only; the numeric fields are still
    /// patched so a partially-bogus upstream rewrite cannot wedge the
    /// verifier.
    pub fn correct(&mut self, index: usize, mut replacement: Candle) -> bool {
        let before = index
            .checked_sub(1)
            .and_then(|i| self.candles.get(i))
            .map(|c| c.time);
        let after = self.candles.get(index + 1).map(|c| c.time);

        let Some(slot) = self.candles.get_mut(index) else {
            tracing::warn!(index, "correction index out of range");
            return false;
        };

        let time_ok = before.map_or(true, |t| replacement.time > t)
            && after.map_or(true, |t| replacement.time < t);
        if !time_ok {
            tracing::warn!(
                index,
                old = %slot.time,
                new = %replacement.time,
                "correction timestamp would break ordering, keeping original time"
            );
            replacement.time = slot.time;
        }

        *slot = replacement;
        true
    }
}

/// Read-only parallel-array view of the most recent bars, for the chart
/// renderer. A snapshot is consistent-if-stale: it is built under the read
/// lock and normalized to a single length, so a concurrent append can
/// never be observed as ragged arrays.
#[derive(Debug, Clone, Default)]
pub struct ChartSnapshot {
    pub times: Vec<DateTime<Utc>>,
    pub opens: Vec<f64>,
    pub highs: Vec<f64>,
    pub lows: Vec<f64>,
    pub closes: Vec<f64>,
}

/// Thread-safe in-memory store of candle series, one ring per interval.
///
/// The single source of truth read by the feed, the verifier, the strategy
/// and the renderer. All mutation (append, correct) goes through one lock
/// so a correction keeps a bar's fields mutually consistent.
#[derive(Clone)]
pub struct CandleStore {
    data: Arc<RwLock<HashMap<String, CandleRing>>>,
}

impl CandleStore {
    /// Create the store with one ring per configured interval.
    pub fn new(intervals: &[(String, u32)], capacity: usize) -> Self {
        let mut data = HashMap::new();
        for (name, _) in intervals {
            data.insert(name.clone(), CandleRing::new(capacity));
        }
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Append a candle to an interval's ring. Returns whether it was
    /// accepted (monotonicity guard, see `CandleRing::append`).
    pub fn append(&self, interval: &str, candle: Candle) -> Result<bool, String> {
        let mut data = self.data.write().map_err(|e| e.to_string())?;
        let ring = data
            .get_mut(interval)
            .ok_or_else(|| format!("unknown interval {interval}"))?;
        Ok(ring.append(candle))
    }

    pub fn last_time(&self, interval: &str) -> Result<Option<DateTime<Utc>>, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;
        Ok(data.get(interval).and_then(|r| r.last_time()))
    }

    pub fn candle_count(&self, interval: &str) -> Result<usize, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;
        Ok(data.get(interval).map(|r| r.len()).unwrap_or(0))
    }

    /// Up to `n` most recent candles with `time <= until`, oldest first.
    pub fn last_n_up_to(
        &self,
        interval: &str,
        until: DateTime<Utc>,
        n: usize,
    ) -> Result<Vec<Candle>, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;
        Ok(data
            .get(interval)
            .map(|r| r.last_n_up_to(until, n))
            .unwrap_or_default())
    }

    /// The last `n` stored candles, oldest first.
    pub fn tail(&self, interval: &str, n: usize) -> Result<Vec<Candle>, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;
        let Some(ring) = data.get(interval) else {
            return Ok(Vec::new());
        };
        let start = ring.len().saturating_sub(n);
        Ok((start..ring.len())
            .filter_map(|i| ring.get(i).cloned())
            .collect())
    }

    /// Overwrite the candle whose timestamp equals `time` in place.
    ///
    /// The slot is resolved under the write lock, keyed by the stored
    /// bar's timestamp, so an append (and the eviction it may trigger)
    /// between a tail read and the correction can never shift the target
    /// onto a neighboring bar. Returns false when no bar with that
    /// timestamp remains, which happens if it was evicted in between.
    pub fn correct_at(
        &self,
        interval: &str,
        time: DateTime<Utc>,
        candle: Candle,
    ) -> Result<bool, String> {
        let mut data = self.data.write().map_err(|e| e.to_string())?;
        let ring = data
            .get_mut(interval)
            .ok_or_else(|| format!("unknown interval {interval}"))?;
        match ring.index_of(time) {
            Some(index) => Ok(ring.correct(index, candle)),
            None => {
                tracing::warn!(%time, "no stored candle at correction timestamp, likely evicted");
                Ok(false)
            }
        }
    }

    /// Parallel-array view of the trailing `n` bars for the renderer.
    pub fn chart_snapshot(&self, interval: &str, n: usize) -> Result<ChartSnapshot, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;
        let mut snapshot = ChartSnapshot::default();
        let Some(ring) = data.get(interval) else {
            return Ok(snapshot);
        };
        let start = ring.len().saturating_sub(n);
        for i in start..ring.len() {
            if let Some(c) = ring.get(i) {
                snapshot.times.push(c.time);
                snapshot.opens.push(c.open);
                snapshot.highs.push(c.high);
                snapshot.lows.push(c.low);
                snapshot.closes.push(c.close);
            }
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn candle_at(base: DateTime<Utc>, minute: i64, close: f64) -> Candle {
        Candle {
            time: base + Duration::minutes(minute),
            open: close - 0.001,
            high: close + 0.002,
            low: close - 0.002,
            close,
            volume: 1000.0,
            vwap: close,
            trades: 42,
        }
    }

    fn base_time() -> DateTime<Utc> {
        crate::models::minute_floor(Utc::now()) - Duration::minutes(500)
    }

    fn store_with(candles: &[Candle]) -> CandleStore {
        let store = CandleStore::new(&[("1m".to_string(), 1)], 100);
        for c in candles {
            assert!(store.append("1m", c.clone()).unwrap());
        }
        store
    }

    #[test]
    fn test_append_strictly_monotonic() {
        let base = base_time();
        let store = store_with(&[candle_at(base, 0, 1.0), candle_at(base, 1, 1.1)]);

        // Same timestamp and older timestamp are both rejected.
        assert!(!store.append("1m", candle_at(base, 1, 9.9)).unwrap());
        assert!(!store.append("1m", candle_at(base, 0, 9.9)).unwrap());
        assert_eq!(store.candle_count("1m").unwrap(), 2);
        assert_eq!(
            store.last_time("1m").unwrap(),
            Some(base + Duration::minutes(1))
        );
    }

    #[test]
    fn test_eviction_at_capacity() {
        let base = base_time();
        let store = CandleStore::new(&[("1m".to_string(), 1)], 5);
        for i in 0..10 {
            store.append("1m", candle_at(base, i, 1.0 + i as f64)).unwrap();
        }
        assert_eq!(store.candle_count("1m").unwrap(), 5);
        let tail = store.tail("1m", 5).unwrap();
        assert_eq!(tail[0].close, 6.0);
        assert_eq!(tail[4].close, 10.0);
    }

    #[test]
    fn test_last_n_up_to_bounds_and_order() {
        let base = base_time();
        let candles: Vec<Candle> = (0..10).map(|i| candle_at(base, i, 1.0 + i as f64)).collect();
        let store = store_with(&candles);

        let until = base + Duration::minutes(6);
        let window = store.last_n_up_to("1m", until, 4).unwrap();
        assert_eq!(window.len(), 4);
        // Oldest-first, nothing newer than the bound.
        assert!(window.windows(2).all(|w| w[0].time < w[1].time));
        assert!(window.iter().all(|c| c.time <= until));
        assert_eq!(window[3].time, until);
    }

    #[test]
    fn test_last_n_up_to_short_history() {
        let base = base_time();
        let store = store_with(&[candle_at(base, 0, 1.0), candle_at(base, 1, 1.1)]);
        let window = store
            .last_n_up_to("1m", base + Duration::minutes(10), 5)
            .unwrap();
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_last_n_up_to_empty_cases() {
        let base = base_time();
        let store = store_with(&[]);
        assert!(store.last_n_up_to("1m", base, 5).unwrap().is_empty());

        let store = store_with(&[candle_at(base, 5, 1.0)]);
        assert!(store.last_n_up_to("1m", base + Duration::minutes(5), 0).unwrap().is_empty());
        // Bound older than everything stored.
        assert!(store.last_n_up_to("1m", base, 3).unwrap().is_empty());
    }

    #[test]
    fn test_correct_at_in_place() {
        let base = base_time();
        let candles: Vec<Candle> = (0..5).map(|i| candle_at(base, i, 1.0)).collect();
        let store = store_with(&candles);

        let mut fixed = candle_at(base, 2, 1.0);
        fixed.high = 2.5;
        assert!(store
            .correct_at("1m", base + Duration::minutes(2), fixed)
            .unwrap());

        let tail = store.tail("1m", 5).unwrap();
        assert_eq!(tail.len(), 5);
        assert_eq!(tail[2].high, 2.5);
        // Neighbors untouched, order and length preserved.
        assert_eq!(tail[1].high, candles[1].high);
        assert_eq!(tail[2].time, base + Duration::minutes(2));
    }

    #[test]
    fn test_correct_at_refuses_order_breaking_timestamp() {
        let base = base_time();
        let candles: Vec<Candle> = (0..3).map(|i| candle_at(base, i, 1.0)).collect();
        let store = store_with(&candles);

        // Replacement time collides with the next bar; fields are patched
        // but the original timestamp is kept.
        let mut bad = candle_at(base, 2, 7.7);
        assert!(store
            .correct_at("1m", base + Duration::minutes(1), bad.clone())
            .unwrap());
        let tail = store.tail("1m", 3).unwrap();
        assert_eq!(tail[1].time, base + Duration::minutes(1));
        assert_eq!(tail[1].close, 7.7);

        // A small in-slot time shift that keeps ordering is accepted.
        bad.time = base + Duration::minutes(1) + Duration::seconds(30);
        assert!(store
            .correct_at("1m", base + Duration::minutes(1), bad)
            .unwrap());
        let tail = store.tail("1m", 3).unwrap();
        assert_eq!(
            tail[1].time,
            base + Duration::minutes(1) + Duration::seconds(30)
        );
    }

    #[test]
    fn test_correct_at_unknown_time() {
        let base = base_time();
        let store = store_with(&[candle_at(base, 0, 1.0)]);
        assert!(!store
            .correct_at("1m", base + Duration::minutes(5), candle_at(base, 5, 1.0))
            .unwrap());
    }

    #[test]
    fn test_correct_at_tracks_slot_across_eviction() {
        let base = base_time();
        let store = CandleStore::new(&[("1m".to_string(), 1)], 5);
        for i in 0..5 {
            store.append("1m", candle_at(base, i, 1.0 + i as f64)).unwrap();
        }

        // Read the tail first, then let an append evict the oldest bar
        // before the correction lands, like a poll cycle racing the
        // verifier on a full ring.
        let snapshot = store.tail("1m", 5).unwrap();
        let target = snapshot[2].clone();
        store.append("1m", candle_at(base, 5, 6.0)).unwrap();

        let mut fixed = target.clone();
        fixed.high = 9.0;
        assert!(store.correct_at("1m", target.time, fixed).unwrap());

        // The bar that was read got the fix; its neighbors kept their
        // own fields despite every slot having shifted.
        let tail = store.tail("1m", 5).unwrap();
        assert_eq!(tail[1].time, target.time);
        assert_eq!(tail[1].high, 9.0);
        assert_eq!(tail[0].high, snapshot[1].high);
        assert_eq!(tail[2].high, snapshot[3].high);

        // A correction aimed at the evicted bar is refused outright.
        assert!(!store
            .correct_at("1m", snapshot[0].time, snapshot[0].clone())
            .unwrap());
    }

    #[test]
    fn test_chart_snapshot() {
        let base = base_time();
        let candles: Vec<Candle> = (0..8).map(|i| candle_at(base, i, 1.0 + i as f64)).collect();
        let store = store_with(&candles);

        let snap = store.chart_snapshot("1m", 5).unwrap();
        assert_eq!(snap.times.len(), 5);
        assert_eq!(snap.opens.len(), 5);
        assert_eq!(snap.highs.len(), 5);
        assert_eq!(snap.lows.len(), 5);
        assert_eq!(snap.closes.len(), 5);
        assert_eq!(snap.closes[4], 8.0);
    }

    #[test]
    fn test_unknown_interval() {
        let store = CandleStore::new(&[("1m".to_string(), 1)], 10);
        assert!(store.append("5m", candle_at(base_time(), 0, 1.0)).is_err());
        assert_eq!(store.candle_count("5m").unwrap(), 0);
    }

    #[test]
    fn test_concurrent_appends_stay_monotonic() {
        use std::thread;

        let base = base_time();
        let store = CandleStore::new(&[("1m".to_string(), 1)], 200);
        let store_clone = store.clone();
        let b = base;

        // Two writers race over an overlapping timestamp range; whatever
        // the interleaving, the stored series must stay strictly
        // increasing.
        let handle = thread::spawn(move || {
            for i in 0..100 {
                let _ = store_clone.append("1m", candle_at(b, i, 1.0));
            }
        });
        for i in 50..150 {
            let _ = store.append("1m", candle_at(base, i, 1.0));
        }
        handle.join().unwrap();

        let tail = store.tail("1m", 200).unwrap();
        assert!(tail.windows(2).all(|w| w[0].time < w[1].time));
    }
}
