use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One fixed-interval OHLC aggregate as delivered by Kraken.
///
/// Immutable once stored, except through `CandleRing::correct` when the
/// verifier reconciles the tail against a fresh fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Start of the interval, UTC, minute-aligned.
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub vwap: f64,
    pub trades: u32,
}

impl Candle {
    /// A candle is closed once its interval has fully elapsed and it saw
    /// real trade activity. Anything else is an in-progress bar and must
    /// never reach the store or the journals.
    pub fn is_closed(&self, now: DateTime<Utc>) -> bool {
        self.time < minute_floor(now) && self.trades > 0 && self.volume > 0.0
    }
}

/// Truncate a timestamp to the start of its minute.
pub fn minute_floor(t: DateTime<Utc>) -> DateTime<Utc> {
    let secs = t.timestamp() - t.timestamp().rem_euclid(60);
    DateTime::from_timestamp(secs, 0).unwrap_or(t)
}

/// Typed events from the live WebSocket feed, delivered over a channel to
/// a single consumer loop so callbacks never re-enter shared state.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// An executed trade.
    Trade { price: f64, time: DateTime<Utc> },
    /// Best bid/ask plus last trade price.
    Ticker {
        bid: f64,
        ask: f64,
        last: f64,
        time: DateTime<Utc>,
    },
    /// Connection / subscription status line, for observability only.
    Status(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

/// Which price of the closing bar satisfied the entry condition.
/// Open-based triggers take precedence when both prices cross the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryBasis {
    Open,
    Close,
}

impl std::fmt::Display for EntryBasis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryBasis::Open => write!(f, "OPEN"),
            EntryBasis::Close => write!(f, "CLOSE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeOutcome {
    Win,
    Loss,
}

impl std::fmt::Display for TradeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeOutcome::Win => write!(f, "win"),
            TradeOutcome::Loss => write!(f, "loss"),
        }
    }
}

/// The single active trade. Exclusively owned by the breakout engine; at
/// most one may be open at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub side: Side,
    pub entry: f64,
    pub stop: f64,
    pub target: f64,
    pub capital: f64,
    pub opened_at: DateTime<Utc>,
    pub exit_price: Option<f64>,
    pub closed_at: Option<DateTime<Utc>>,
    pub outcome: Option<TradeOutcome>,
}
