use super::OverlaySink;
use crate::journal::TradeJournal;
use crate::models::{Candle, EntryBasis, Position, Side, TradeOutcome};
use crate::store::CandleStore;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Breakout reference levels: entry fires when price crosses `upper`
/// upward (long) or `lower` downward (short).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceLevels {
    pub upper: f64,
    pub lower: f64,
}

/// Compute the reference levels from the exactly-five 1m bars ending one
/// minute before `reference_time`: max high and min low of that window.
/// Returns None until all five bars are present in the store.
pub fn reference_levels(
    store: &CandleStore,
    interval: &str,
    reference_time: DateTime<Utc>,
) -> Option<ReferenceLevels> {
    let end = reference_time - Duration::minutes(1);
    let window = match store.last_n_up_to(interval, end, 5) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!("reference window query failed: {e}");
            return None;
        }
    };
    if window.len() < 5 {
        return None;
    }
    // The window must be the five contiguous bars right before the
    // reference minute, not five older ones.
    if window[4].time != end || window[0].time != reference_time - Duration::minutes(5) {
        return None;
    }

    let upper = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let lower = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
    Some(ReferenceLevels { upper, lower })
}

/// Emitted on state transitions so callers can log / render.
#[derive(Debug, Clone)]
pub enum SignalEvent {
    Entered(Position),
    Exited(Position),
}

struct EngineState {
    levels: Option<ReferenceLevels>,
    active: Option<Position>,
}

/// Configuration slice the engine needs.
#[derive(Debug, Clone)]
pub struct BreakoutParams {
    pub reference_time: DateTime<Utc>,
    pub risk_step: f64,
    pub risk_reward: f64,
    pub capital: f64,
    pub max_positions: usize,
    pub prioritize_stop_on_tie: bool,
}

/// Breakout state machine: `idle` (no position) or `active` (exactly one).
///
/// Consumes newly closed bars for entries and bar-range exit management,
/// and live ticks for the lowest-latency exit path. Both mutation paths
/// go through one mutex so only one exit can ever win per position; the
/// loser observes an idle engine and is a no-op. The machine holds no
/// timers; all timing comes from event timestamps.
pub struct BreakoutEngine {
    params: BreakoutParams,
    state: Mutex<EngineState>,
    journal: Arc<TradeJournal>,
    overlay: Arc<dyn OverlaySink>,
}

impl BreakoutEngine {
    pub fn new(
        params: BreakoutParams,
        journal: Arc<TradeJournal>,
        overlay: Arc<dyn OverlaySink>,
    ) -> Self {
        Self {
            params,
            state: Mutex::new(EngineState {
                levels: None,
                active: None,
            }),
            journal,
            overlay,
        }
    }

    /// One-time level initialization; ignored if already set.
    pub fn set_levels(&self, levels: ReferenceLevels) -> Result<()> {
        let mut state = self.lock()?;
        if state.levels.is_none() {
            tracing::info!(
                upper = levels.upper,
                lower = levels.lower,
                "breakout levels set"
            );
            state.levels = Some(levels);
        }
        Ok(())
    }

    pub fn has_levels(&self) -> bool {
        self.lock().map(|s| s.levels.is_some()).unwrap_or(false)
    }

    pub fn is_active(&self) -> bool {
        self.lock().map(|s| s.active.is_some()).unwrap_or(false)
    }

    pub fn active_position(&self) -> Option<Position> {
        self.lock().ok().and_then(|s| s.active.clone())
    }

    /// Feed one newly closed bar: entry check when idle, stop/target
    /// range management when active.
    pub fn on_new_close(&self, candle: &Candle) -> Result<Option<SignalEvent>> {
        let mut state = self.lock()?;

        // The reference-minute bar itself is eligible.
        if candle.time < self.params.reference_time {
            return Ok(None);
        }
        let Some(levels) = state.levels else {
            return Ok(None);
        };

        if state.active.is_some() {
            return Ok(self.manage(&mut state, candle));
        }

        if self.params.max_positions == 0 {
            return Ok(None);
        }

        // Entry rules: OPEN-based trigger takes precedence over CLOSE.
        if candle.open > levels.upper || candle.close > levels.upper {
            let (basis, price) = if candle.open > levels.upper {
                (EntryBasis::Open, candle.open)
            } else {
                (EntryBasis::Close, candle.close)
            };
            return Ok(Some(self.enter(&mut state, Side::Long, price, basis, candle.time)));
        }
        if candle.open < levels.lower || candle.close < levels.lower {
            let (basis, price) = if candle.open < levels.lower {
                (EntryBasis::Open, candle.open)
            } else {
                (EntryBasis::Close, candle.close)
            };
            return Ok(Some(self.enter(&mut state, Side::Short, price, basis, candle.time)));
        }

        Ok(None)
    }

    /// Feed one live tick. Exits immediately at the tick price when it
    /// crosses stop or target; no-op when idle, so a tick racing a
    /// close-based exit can never double-exit.
    pub fn on_live_tick(&self, price: f64, time: DateTime<Utc>) -> Result<Option<SignalEvent>> {
        let mut state = self.lock()?;
        let Some(position) = state.active.as_ref() else {
            return Ok(None);
        };

        let (hit_target, hit_stop) = match position.side {
            Side::Long => (price >= position.target, price <= position.stop),
            Side::Short => (price <= position.target, price >= position.stop),
        };

        if hit_target {
            Ok(self.exit(&mut state, TradeOutcome::Win, price, time))
        } else if hit_stop {
            Ok(self.exit(&mut state, TradeOutcome::Loss, price, time))
        } else {
            Ok(None)
        }
    }

    /// Range-based exit check against a closed bar. If stop and target
    /// were both touched within the bar, the configured tie-break decides;
    /// intrabar order is unknowable from OHLC so exactly one outcome is
    /// recorded.
    fn manage(&self, state: &mut EngineState, candle: &Candle) -> Option<SignalEvent> {
        let position = state.active.as_ref()?;

        let (hit_stop, hit_target) = match position.side {
            Side::Long => (candle.low <= position.stop, candle.high >= position.target),
            Side::Short => (candle.high >= position.stop, candle.low <= position.target),
        };
        let (stop_price, target_price) = (position.stop, position.target);

        if self.params.prioritize_stop_on_tie {
            if hit_stop {
                return self.exit(state, TradeOutcome::Loss, stop_price, candle.time);
            }
            if hit_target {
                return self.exit(state, TradeOutcome::Win, target_price, candle.time);
            }
        } else {
            if hit_target {
                return self.exit(state, TradeOutcome::Win, target_price, candle.time);
            }
            if hit_stop {
                return self.exit(state, TradeOutcome::Loss, stop_price, candle.time);
            }
        }
        None
    }

    fn enter(
        &self,
        state: &mut EngineState,
        side: Side,
        price: f64,
        basis: EntryBasis,
        time: DateTime<Utc>,
    ) -> SignalEvent {
        let step = self.params.risk_step;
        let (stop, target) = match side {
            Side::Long => (price - step, price + self.params.risk_reward * step),
            Side::Short => (price + step, price - self.params.risk_reward * step),
        };

        let position = Position {
            id: Uuid::new_v4(),
            side,
            entry: price,
            stop,
            target,
            capital: self.params.capital,
            opened_at: time,
            exit_price: None,
            closed_at: None,
            outcome: None,
        };

        tracing::info!(
            side = %side,
            entry = price,
            stop,
            target,
            basis = %basis,
            "ENTER {} @ {} | stop {} | target {}",
            side,
            price,
            stop,
            target
        );
        if let Err(e) = self.journal.log_entry(&position, &format!("entered basis={basis}")) {
            tracing::warn!("trade journal entry write failed: {e}");
        }
        self.overlay.set_levels(price, stop, target, side);

        state.active = Some(position.clone());
        SignalEvent::Entered(position)
    }

    fn exit(
        &self,
        state: &mut EngineState,
        outcome: TradeOutcome,
        price: f64,
        time: DateTime<Utc>,
    ) -> Option<SignalEvent> {
        let mut position = state.active.take()?;
        position.exit_price = Some(price);
        position.closed_at = Some(time);
        position.outcome = Some(outcome);

        tracing::info!(outcome = %outcome, price, "EXIT {} @ {}", outcome, price);
        if let Err(e) = self.journal.log_exit(&position, "exit") {
            tracing::warn!("trade journal exit write failed: {e}");
        }
        self.overlay.clear();

        Some(SignalEvent::Exited(position))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, EngineState>> {
        self.state.lock().map_err(|_| anyhow!("engine state lock poisoned"))
    }
}
