use chrono::{DateTime, Duration, Utc};

/// Runtime configuration for the bot.
///
/// Defaults mirror the live setup (XRPUSD, 1m bars); every knob can be
/// overridden through the environment, same names as the fields upper-cased
/// with a `BOT_` prefix (e.g. `BOT_PAIR`, `BOT_RISK_STEP`).
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Instrument identifier in Kraken REST notation, e.g. "XRPUSD".
    pub pair: String,
    /// Tracked intervals: display name -> minutes per bar.
    pub intervals: Vec<(String, u32)>,
    /// Bars kept in RAM per interval.
    pub ring_capacity: usize,
    /// Price step used by the renderer grid.
    pub price_unit: f64,
    /// Fixed local timezone offset in hours (no DST handling).
    pub tz_offset_hours: i64,
    /// Reference time (local HH:MM) anchoring the breakout levels.
    pub reference_hour: u32,
    pub reference_minute: u32,
    /// Price distance between entry and stop.
    pub risk_step: f64,
    /// Target distance as a multiple of `risk_step`.
    pub risk_reward: f64,
    /// Capital committed per trade.
    pub trade_capital: f64,
    /// Effectively 0 (trading disabled) or 1.
    pub max_positions: usize,
    pub poll_interval_secs: u64,
    pub verify_interval_secs: u64,
    /// Delay between observing a new close and re-verifying the tail.
    pub verify_after_close_secs: u64,
    /// If both stop and target are touched within one bar, honor the stop.
    pub prioritize_stop_on_tie: bool,
    pub candle_file: String,
    pub journal_file: String,
    pub reset_journals: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            pair: "XRPUSD".to_string(),
            intervals: vec![("1m".to_string(), 1)],
            ring_capacity: 1000,
            price_unit: 0.0025,
            tz_offset_hours: -6,
            reference_hour: 7,
            reference_minute: 35,
            risk_step: 0.001,
            risk_reward: 2.0,
            trade_capital: 100.0,
            max_positions: 1,
            poll_interval_secs: 10,
            verify_interval_secs: 20,
            verify_after_close_secs: 5,
            prioritize_stop_on_tie: true,
            candle_file: "candles_1m.csv".to_string(),
            journal_file: "strategy_log.csv".to_string(),
            reset_journals: false,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl BotConfig {
    /// Build a config from defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(pair) = std::env::var("BOT_PAIR") {
            cfg.pair = pair;
        }
        if let Some(v) = env_parse("BOT_RING_CAPACITY") {
            cfg.ring_capacity = v;
        }
        if let Some(v) = env_parse("BOT_PRICE_UNIT") {
            cfg.price_unit = v;
        }
        if let Some(v) = env_parse("BOT_TZ_OFFSET_HOURS") {
            cfg.tz_offset_hours = v;
        }
        if let Some(v) = env_parse("BOT_REFERENCE_HOUR") {
            cfg.reference_hour = v;
        }
        if let Some(v) = env_parse("BOT_REFERENCE_MINUTE") {
            cfg.reference_minute = v;
        }
        if let Some(v) = env_parse("BOT_RISK_STEP") {
            cfg.risk_step = v;
        }
        if let Some(v) = env_parse("BOT_RISK_REWARD") {
            cfg.risk_reward = v;
        }
        if let Some(v) = env_parse("BOT_TRADE_CAPITAL") {
            cfg.trade_capital = v;
        }
        if let Some(v) = env_parse("BOT_MAX_POSITIONS") {
            cfg.max_positions = v;
        }
        if let Some(v) = env_parse("BOT_POLL_INTERVAL_SECS") {
            cfg.poll_interval_secs = v;
        }
        if let Some(v) = env_parse("BOT_VERIFY_INTERVAL_SECS") {
            cfg.verify_interval_secs = v;
        }
        if let Some(v) = env_parse("BOT_VERIFY_AFTER_CLOSE_SECS") {
            cfg.verify_after_close_secs = v;
        }
        if let Some(v) = env_parse("BOT_PRIORITIZE_STOP_ON_TIE") {
            cfg.prioritize_stop_on_tie = v;
        }

        cfg
    }

    /// Today's reference minute as a UTC timestamp.
    pub fn reference_time_utc(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        local_today_to_utc(
            self.reference_hour,
            self.reference_minute,
            self.tz_offset_hours,
            now,
        )
    }
}

/// UTC timestamp for *today* at local HH:MM under a fixed offset.
pub fn local_today_to_utc(
    hour: u32,
    minute: u32,
    tz_offset_hours: i64,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let local = now + Duration::hours(tz_offset_hours);
    let target_local = local
        .date_naive()
        .and_hms_opt(hour.min(23), minute.min(59), 0)
        .unwrap_or_else(|| local.naive_utc());
    DateTime::from_naive_utc_and_offset(target_local - Duration::hours(tz_offset_hours), Utc)
}
