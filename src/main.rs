use breakerbot::api::kraken::KrakenClient;
use breakerbot::api::OhlcSource;
use breakerbot::feed::{CandleVerifier, IngestionFeed};
use breakerbot::journal::{CandleJournal, TradeJournal};
use breakerbot::models::StreamEvent;
use breakerbot::store::CandleStore;
use breakerbot::strategy::{reference_levels, BreakoutEngine, BreakoutParams, NoopOverlay};
use breakerbot::stream::TickStream;
use breakerbot::{BotConfig, Result};
use chrono::Utc;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration};

#[derive(Parser, Debug)]
#[command(name = "breakerbot", about = "Kraken OHLC breakout bot", version)]
struct Args {
    /// Truncate the CSV journals on startup instead of appending.
    #[arg(long)]
    reset_journals: bool,
    /// Override the traded pair (Kraken REST notation, e.g. XRPUSD).
    #[arg(long)]
    pair: Option<String>,
    /// Observation mode: ingest and verify, never open a position.
    #[arg(long)]
    observe: bool,
}

/// How long a loop gets to wind down after the stop signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();
    let mut cfg = BotConfig::from_env();
    if let Some(pair) = args.pair {
        cfg.pair = pair;
    }
    if args.reset_journals {
        cfg.reset_journals = true;
    }
    if args.observe {
        cfg.max_positions = 0;
    }

    let now = Utc::now();
    let reference_time = cfg.reference_time_utc(now);
    tracing::info!("breakerbot starting - {} @ {}", cfg.pair, cfg.intervals[0].0);
    tracing::info!("  reference minute: {} UTC", reference_time);
    tracing::info!(
        "  risk: step {} | reward {}x | capital {} | trading {}",
        cfg.risk_step,
        cfg.risk_reward,
        cfg.trade_capital,
        if cfg.max_positions > 0 { "on" } else { "off" }
    );

    let store = CandleStore::new(&cfg.intervals, cfg.ring_capacity);
    let client = Arc::new(KrakenClient::new(&cfg.pair));
    let candle_journal = Arc::new(CandleJournal::new(&cfg.candle_file, cfg.reset_journals)?);
    let trade_journal = Arc::new(TradeJournal::new(&cfg.journal_file, cfg.reset_journals)?);

    let engine = Arc::new(BreakoutEngine::new(
        BreakoutParams {
            reference_time,
            risk_step: cfg.risk_step,
            risk_reward: cfg.risk_reward,
            capital: cfg.trade_capital,
            max_positions: cfg.max_positions,
            prioritize_stop_on_tie: cfg.prioritize_stop_on_tie,
        },
        trade_journal,
        Arc::new(NoopOverlay),
    ));

    // Seed history up to the reference minute so the levels can be
    // computed before the first live close arrives.
    let (interval_name, interval_minutes) = cfg.intervals[0].clone();
    let mut feed = IngestionFeed::new(client.clone(), store.clone(), cfg.intervals.clone());
    let report = feed.prime(reference_time).await?;
    for (i, candle) in report.primed.iter().enumerate() {
        let label = format!("REF_T-{}", report.primed.len() - 1 - i);
        candle_journal.record(candle, &label, &interval_name)?;
    }
    for (i, candle) in report.backfilled.iter().enumerate() {
        candle_journal.record(candle, &format!("POST_{:04}", i + 1), &interval_name)?;
    }

    if let Some(levels) = reference_levels(&store, &interval_name, reference_time) {
        engine.set_levels(levels)?;
    } else {
        tracing::info!("reference window incomplete, levels pending");
    }

    let verifier = Arc::new(CandleVerifier::new(
        client.clone(),
        store.clone(),
        candle_journal.clone(),
        &interval_name,
        interval_minutes,
    ));

    let (stop_tx, stop_rx) = watch::channel(false);
    let (event_tx, event_rx) = mpsc::channel::<StreamEvent>(256);

    let stream_task = {
        let stream = TickStream::new(&cfg.pair, event_tx, stop_rx.clone());
        tokio::spawn(stream.run())
    };

    let tick_task = {
        let engine = engine.clone();
        tokio::spawn(tick_consumer_loop(event_rx, engine))
    };

    let poll_task = {
        let engine = engine.clone();
        let verifier = verifier.clone();
        let store = store.clone();
        let journal = candle_journal.clone();
        let interval_name = interval_name.clone();
        let cfg = cfg.clone();
        let stop = stop_rx.clone();
        tokio::spawn(async move {
            poll_loop(
                feed, engine, verifier, store, journal, interval_name, reference_time, cfg, stop,
            )
            .await;
        })
    };

    let verify_task = {
        let verifier = verifier.clone();
        let period = cfg.verify_interval_secs;
        tokio::spawn(verify_loop(verifier, period, stop_rx.clone()))
    };

    tracing::info!("all loops running, press Ctrl+C to stop");

    let names = ["tick stream", "tick consumer", "poll loop", "verify loop"];
    let mut tasks = vec![stream_task, tick_task, poll_task, verify_task];
    let mut finished = None;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C, shutting down");
        }
        (result, index, _) = futures_util::future::select_all(tasks.iter_mut()) => {
            tracing::error!("{} exited early: {:?}", names[index], result);
            finished = Some(index);
        }
    }

    // Flip the stop signal, then give every loop a chance to wind down
    // cooperatively (the stream closes its connection, the loops log and
    // return) before the runtime tears them down.
    let _ = stop_tx.send(true);
    for (i, mut task) in tasks.into_iter().enumerate() {
        if finished == Some(i) {
            continue;
        }
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await.is_err() {
            tracing::warn!("{} did not stop in time, aborting", names[i]);
            task.abort();
        }
    }

    tracing::info!("breakerbot stopped");
    Ok(())
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "breakerbot=info".to_string()),
        )
        .init();
}

/// Single consumer of the WebSocket events. Trade prices drive the
/// low-latency exit path; ticker and status events are observability only.
async fn tick_consumer_loop(mut events: mpsc::Receiver<StreamEvent>, engine: Arc<BreakoutEngine>) {
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Trade { price, time } => {
                match engine.on_live_tick(price, time) {
                    Ok(Some(signal)) => tracing::info!("live tick: {signal:?}"),
                    Ok(None) => {}
                    Err(e) => tracing::error!("live tick handling failed: {e}"),
                }
            }
            StreamEvent::Ticker { bid, ask, last, .. } => {
                tracing::debug!(bid, ask, last, "ticker");
            }
            StreamEvent::Status(status) => {
                tracing::debug!("stream: {status}");
            }
        }
    }
    tracing::info!("event channel closed, tick consumer done");
}

/// Ingestion loop: poll the REST endpoint on a fixed period, journal and
/// feed each newly closed bar to the engine, then schedule a one-shot
/// verification shortly after the close so late upstream rewrites are
/// caught quickly.
#[allow(clippy::too_many_arguments)]
async fn poll_loop<S: OhlcSource + 'static>(
    mut feed: IngestionFeed<S>,
    engine: Arc<BreakoutEngine>,
    verifier: Arc<CandleVerifier<S>>,
    store: CandleStore,
    journal: Arc<CandleJournal>,
    interval_name: String,
    reference_time: chrono::DateTime<chrono::Utc>,
    cfg: BotConfig,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = interval(Duration::from_secs(cfg.poll_interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut live_seq = 0u32;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => {
                if *stop.borrow() {
                    tracing::info!("poll loop stopped");
                    return;
                }
                continue;
            }
        }

        let accepted = match feed.poll_once().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!("poll cycle failed: {e}");
                continue;
            }
        };

        for (interval, candle) in &accepted {
            live_seq += 1;
            if let Err(e) = journal.record(candle, &format!("LIVE_{live_seq:04}"), interval) {
                tracing::warn!("candle journal write failed: {e}");
            }

            match engine.on_new_close(candle) {
                Ok(Some(signal)) => tracing::info!("close {}: {signal:?}", candle.time),
                Ok(None) => {}
                Err(e) => tracing::error!("close handling failed: {e}"),
            }
        }

        if !accepted.is_empty() {
            // Levels may have been pending if the bot started mid-window.
            if !engine.has_levels() {
                if let Some(levels) = reference_levels(&store, &interval_name, reference_time) {
                    if let Err(e) = engine.set_levels(levels) {
                        tracing::error!("setting levels failed: {e}");
                    }
                }
            }

            let verifier = verifier.clone();
            let delay = Duration::from_secs(cfg.verify_after_close_secs);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = verifier.verify_once().await {
                    tracing::warn!("post-close verification failed: {e}");
                }
            });
        }
    }
}

/// Periodic reconciliation of the stored tail against a fresh fetch.
async fn verify_loop<S: OhlcSource + 'static>(
    verifier: Arc<CandleVerifier<S>>,
    period_secs: u64,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = interval(Duration::from_secs(period_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => {
                if *stop.borrow() {
                    tracing::info!("verify loop stopped");
                    return;
                }
                continue;
            }
        }
        if let Err(e) = verifier.verify_once().await {
            tracing::warn!("verification cycle failed: {e}");
        }
    }
}
