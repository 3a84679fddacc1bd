use crate::api::OhlcSource;
use crate::journal::CandleJournal;
use crate::models::Candle;
use crate::store::CandleStore;
use chrono::{Duration, Utc};
use std::sync::Arc;

/// How many trailing closed bars are re-checked per cycle.
pub const VERIFY_DEPTH: usize = 5;

/// Tolerance for numeric field comparison; absorbs float/decimal
/// representation noise between fetches.
const EPSILON: f64 = 1e-9;

/// Result of one verification cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Not enough history on either side to compare.
    Skipped,
    Clean,
    Corrected(usize),
}

/// Reconciles the stored tail against an authoritative re-fetch.
///
/// Runs on a fixed period plus once shortly after each new close. Late
/// trades on the upstream side can rewrite a bar after we first stored
/// it; a mismatch is an expected condition, not an error, and is fixed by
/// overwriting the stored bar in place and journaling the correction.
pub struct CandleVerifier<S> {
    source: Arc<S>,
    store: CandleStore,
    journal: Arc<CandleJournal>,
    interval: String,
    interval_minutes: u32,
}

impl<S: OhlcSource> CandleVerifier<S> {
    pub fn new(
        source: Arc<S>,
        store: CandleStore,
        journal: Arc<CandleJournal>,
        interval: &str,
        interval_minutes: u32,
    ) -> Self {
        Self {
            source,
            store,
            journal,
            interval: interval.to_string(),
            interval_minutes,
        }
    }

    /// One verification cycle. A fetch error surfaces to the caller (who
    /// logs and moves on) and performs no mutation.
    pub async fn verify_once(&self) -> crate::Result<VerifyOutcome> {
        let now = Utc::now();
        let lookback = Duration::minutes(2 * VERIFY_DEPTH as i64 * self.interval_minutes as i64);
        let since = (now - lookback).timestamp();

        let fetched: Vec<Candle> = self
            .source
            .fetch_ohlc(self.interval_minutes, Some(since))
            .await?
            .into_iter()
            .filter(|c| c.is_closed(now))
            .collect();
        if fetched.len() < VERIFY_DEPTH {
            return Ok(VerifyOutcome::Skipped);
        }
        let fetched = &fetched[fetched.len() - VERIFY_DEPTH..];

        let stored = self.store.tail(&self.interval, VERIFY_DEPTH)?;
        if stored.len() < VERIFY_DEPTH {
            return Ok(VerifyOutcome::Skipped);
        }

        let mut corrected = 0;
        for (have, want) in stored.iter().zip(fetched) {
            if candles_differ(have, want) {
                // Keyed by the stored bar's timestamp so an append that
                // evicts between the tail read and this call cannot land
                // the patch on a neighboring slot.
                if !self.store.correct_at(&self.interval, have.time, want.clone())? {
                    tracing::warn!(
                        interval = %self.interval,
                        time = %have.time,
                        "stale candle gone before correction, skipping"
                    );
                    continue;
                }
                self.journal.record_correction(want, &self.interval)?;
                tracing::info!(
                    interval = %self.interval,
                    time = %want.time,
                    "corrected stored candle from re-fetch"
                );
                corrected += 1;
            }
        }

        if corrected == 0 {
            tracing::debug!(interval = %self.interval, "verify last {VERIFY_DEPTH}: clean");
            Ok(VerifyOutcome::Clean)
        } else {
            tracing::info!(interval = %self.interval, "verify last {VERIFY_DEPTH}: fixed {corrected}");
            Ok(VerifyOutcome::Corrected(corrected))
        }
    }
}

fn neq(a: f64, b: f64) -> bool {
    (a - b).abs() > EPSILON
}

fn candles_differ(have: &Candle, want: &Candle) -> bool {
    neq(have.time.timestamp() as f64, want.time.timestamp() as f64)
        || neq(have.open, want.open)
        || neq(have.high, want.high)
        || neq(have.low, want.low)
        || neq(have.close, want.close)
        || neq(have.volume, want.volume)
        || neq(have.vwap, want.vwap)
        || have.trades != want.trades
}
