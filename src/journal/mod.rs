use crate::models::{Candle, Position};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

const CANDLE_HEADER: &str = "time,open,high,low,close,volume,vwap,trades,label,interval";
const TRADE_HEADER: &str =
    "opened_at,side,entry,stop,target,capital,closed_at,exit_price,outcome,note";

/// Append-only CSV audit trail of every closed candle the bot accepted,
/// with a sibling `*_corrections.csv` file for verifier rewrites.
///
/// Each record opens the file, appends, and closes it again; nothing in
/// the hot path holds a file handle. Losing a row to a disk hiccup is
/// acceptable, corrupting the store is not, so journal errors are
/// surfaced to the caller and never roll anything back.
pub struct CandleJournal {
    path: PathBuf,
    corrections_path: PathBuf,
}

impl CandleJournal {
    /// Open (or with `reset`, truncate) the journal files and write the
    /// header when the file is new.
    pub fn new(path: impl AsRef<Path>, reset: bool) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let corrections_path = sibling_with_suffix(&path, "_corrections");
        let journal = Self {
            path,
            corrections_path,
        };
        ensure_header(&journal.path, CANDLE_HEADER, reset)?;
        ensure_header(&journal.corrections_path, CANDLE_HEADER, reset)?;
        Ok(journal)
    }

    /// Record one accepted candle. Provisional bars (no trades or no
    /// volume) are never written.
    pub fn record(&self, candle: &Candle, label: &str, interval: &str) -> crate::Result<()> {
        if candle.trades == 0 || candle.volume <= 0.0 {
            return Ok(());
        }
        append_line(&self.path, &candle_row(candle, label, interval))
    }

    /// Record a verifier correction, written to the sibling file so the
    /// main journal stays strictly chronological.
    pub fn record_correction(&self, candle: &Candle, interval: &str) -> crate::Result<()> {
        append_line(
            &self.corrections_path,
            &candle_row(candle, "CORRECTED", interval),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Append-only CSV of entries and exits, one row per transition.
pub struct TradeJournal {
    path: PathBuf,
}

impl TradeJournal {
    pub fn new(path: impl AsRef<Path>, reset: bool) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();
        ensure_header(&path, TRADE_HEADER, reset)?;
        Ok(Self { path })
    }

    pub fn log_entry(&self, position: &Position, note: &str) -> crate::Result<()> {
        append_line(&self.path, &trade_row(position, note))
    }

    pub fn log_exit(&self, position: &Position, note: &str) -> crate::Result<()> {
        append_line(&self.path, &trade_row(position, note))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("journal");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("csv");
    path.with_file_name(format!("{stem}{suffix}.{ext}"))
}

fn ensure_header(path: &Path, header: &str, reset: bool) -> crate::Result<()> {
    let exists = path.exists();
    if reset || !exists {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        writeln!(file, "{header}")?;
    }
    Ok(())
}

fn append_line(path: &Path, line: &str) -> crate::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    Ok(())
}

fn candle_row(c: &Candle, label: &str, interval: &str) -> String {
    format!(
        "{},{},{},{},{},{},{},{},{},{}",
        c.time.to_rfc3339(),
        c.open,
        c.high,
        c.low,
        c.close,
        c.volume,
        c.vwap,
        c.trades,
        label,
        interval
    )
}

fn trade_row(p: &Position, note: &str) -> String {
    format!(
        "{},{},{},{},{},{},{},{},{},{}",
        p.opened_at.to_rfc3339(),
        p.side,
        p.entry,
        p.stop,
        p.target,
        p.capital,
        p.closed_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        p.exit_price.map(|v| v.to_string()).unwrap_or_default(),
        p.outcome.map(|o| o.to_string()).unwrap_or_default(),
        note
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Side, TradeOutcome};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{tag}-{}.csv", Uuid::new_v4()))
    }

    fn candle(trades: u32, volume: f64) -> Candle {
        Candle {
            time: Utc::now() - Duration::minutes(2),
            open: 1.04,
            high: 1.05,
            low: 1.03,
            close: 1.045,
            volume,
            vwap: 1.044,
            trades,
        }
    }

    fn position() -> Position {
        Position {
            id: Uuid::new_v4(),
            side: Side::Long,
            entry: 1.060,
            stop: 1.059,
            target: 1.062,
            capital: 100.0,
            opened_at: Utc::now(),
            exit_price: None,
            closed_at: None,
            outcome: None,
        }
    }

    #[test]
    fn test_candle_journal_appends_rows() {
        let path = temp_path("candles");
        let journal = CandleJournal::new(&path, true).unwrap();

        journal.record(&candle(10, 500.0), "LIVE_0001", "1m").unwrap();
        journal.record(&candle(10, 500.0), "LIVE_0002", "1m").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CANDLE_HEADER);
        assert!(lines[1].ends_with("LIVE_0001,1m"));
        assert!(lines[2].ends_with("LIVE_0002,1m"));
    }

    #[test]
    fn test_provisional_candles_not_journaled() {
        let path = temp_path("candles");
        let journal = CandleJournal::new(&path, true).unwrap();

        journal.record(&candle(0, 500.0), "LIVE_0001", "1m").unwrap();
        journal.record(&candle(10, 0.0), "LIVE_0002", "1m").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1); // header only
    }

    #[test]
    fn test_corrections_go_to_sibling_file() {
        let path = temp_path("candles");
        let journal = CandleJournal::new(&path, true).unwrap();

        journal.record_correction(&candle(10, 500.0), "1m").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);

        let corrections = sibling_with_suffix(&path, "_corrections");
        let contents = std::fs::read_to_string(corrections).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("CORRECTED"));
    }

    #[test]
    fn test_reset_truncates_keep_appends() {
        let path = temp_path("candles");
        {
            let journal = CandleJournal::new(&path, true).unwrap();
            journal.record(&candle(10, 500.0), "LIVE_0001", "1m").unwrap();
        }
        {
            // Re-open without reset: the old row survives.
            let journal = CandleJournal::new(&path, false).unwrap();
            journal.record(&candle(10, 500.0), "LIVE_0002", "1m").unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);

        // Re-open with reset: back to header only.
        let _ = CandleJournal::new(&path, true).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }

    #[test]
    fn test_trade_journal_round_trip() {
        let path = temp_path("trades");
        let journal = TradeJournal::new(&path, true).unwrap();

        let mut p = position();
        journal.log_entry(&p, "entered basis=OPEN").unwrap();

        p.exit_price = Some(1.062);
        p.closed_at = Some(Utc::now());
        p.outcome = Some(TradeOutcome::Win);
        journal.log_exit(&p, "exit").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], TRADE_HEADER);
        assert!(lines[1].contains("long"));
        assert!(lines[1].ends_with("entered basis=OPEN"));
        assert!(lines[2].contains("win"));
    }
}
