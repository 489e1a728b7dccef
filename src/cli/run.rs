//! Run command: live engine wiring
//!
//! One task per input stream: the filtered trade feed, the option
//! ticker feed, option trades, the two tracker refresh timers and the
//! hub stats timer. All of them watch the same shutdown signal.

use crate::config::Config;
use crate::events::BroadcastEvent;
use crate::feed::{
    DeribitFeed, DeribitRest, InstrumentSource, TickerFeed, Trade, TradeFeed,
};
use crate::filter::StreamFilter;
use crate::hub::EventBroadcastHub;
use crate::optimizer;
use crate::storage::{NullStore, ParquetStore, Persistence, StoreConfig};
use crate::telemetry::{record_latency, set_gauge, GaugeMetric, LatencyMetric};
use crate::tracker::OptionUniverseTracker;
use chrono::Utc;
use clap::Args;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Skip startup threshold calibration even when configured
    #[arg(long)]
    pub no_calibrate: bool,
}

impl RunArgs {
    pub async fn execute(&self, config: Config) -> anyhow::Result<()> {
        let hub = Arc::new(EventBroadcastHub::new(config.hub.clone()));
        let store: Arc<dyn Persistence> = if config.storage.capture_enabled {
            Arc::new(ParquetStore::new(StoreConfig {
                output_dir: config.storage.output_dir.clone(),
                flush_interval_secs: config.storage.rotation_interval_secs,
                ..StoreConfig::default()
            }))
        } else {
            Arc::new(NullStore)
        };

        let rest = Arc::new(DeribitRest::new(Duration::from_secs(
            config.tracker.fetch_timeout_secs,
        ))?);
        let feed = DeribitFeed::new();

        // Optional startup calibration overrides the configured
        // threshold before live processing begins
        let mut filter_config = config.filter.clone();
        if config.optimizer.run_at_startup && !self.no_calibrate {
            match Self::calibrate_threshold(&config, rest.as_ref()).await {
                Ok(Some(threshold)) => {
                    tracing::info!(
                        old = filter_config.vol_threshold,
                        new = threshold,
                        "Applying calibrated threshold"
                    );
                    filter_config.vol_threshold = threshold;
                }
                Ok(None) => {
                    tracing::warn!("Calibration inconclusive, keeping configured threshold");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Calibration failed, keeping configured threshold");
                }
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tracker = Arc::new(OptionUniverseTracker::new(
            config.tracker.clone(),
            config.surface.clone(),
            &config.feed.underlying,
            Arc::clone(&hub),
            Arc::clone(&store),
        ));
        if let Err(e) = tracker.refresh_universe(rest.as_ref()).await {
            tracing::warn!(error = %e, "Initial universe refresh failed, starting empty");
        }

        let source: Arc<dyn InstrumentSource> = rest;
        let mut handles = tracker.spawn_refresh_tasks(source, shutdown_rx.clone());

        // Filtered trade stream
        let trade_rx = feed
            .subscribe_trades(std::slice::from_ref(&config.feed.trade_instrument))
            .await?;
        handles.push(Self::spawn_filter_task(
            trade_rx,
            StreamFilter::new(config.feed.trade_instrument.clone(), filter_config),
            Arc::clone(&hub),
            Arc::clone(&store),
            shutdown_rx.clone(),
        ));

        // Option ticker and trade streams for the tracked set
        let tracked = tracker.tracked_instruments().await;
        if tracked.is_empty() {
            tracing::warn!("No tracked options yet; option streams start on next restart");
        } else {
            let mut ticker_rx = feed.subscribe_tickers(&tracked).await?;
            let ticker_tracker = Arc::clone(&tracker);
            let mut ticker_shutdown = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        update = ticker_rx.recv() => {
                            match update {
                                Some(update) => ticker_tracker.on_ticker_update(&update).await,
                                None => break,
                            }
                        }
                        _ = ticker_shutdown.changed() => break,
                    }
                }
            }));

            let mut option_trade_rx = feed.subscribe_trades(&tracked).await?;
            let trade_tracker = Arc::clone(&tracker);
            let mut trade_shutdown = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        trade = option_trade_rx.recv() => {
                            match trade {
                                Some(trade) => trade_tracker.on_trade(&trade).await,
                                None => break,
                            }
                        }
                        _ = trade_shutdown.changed() => break,
                    }
                }
            }));
        }

        handles.push(Self::spawn_stats_task(
            Arc::clone(&hub),
            Arc::clone(&tracker),
            config.hub.stats_interval_secs,
            shutdown_rx,
        ));

        tracing::info!(
            underlying = %config.feed.underlying,
            trade_instrument = %config.feed.trade_instrument,
            "volcast running, Ctrl-C to stop"
        );
        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutdown requested");

        // Flip the signal, close subscriber connections, then wait
        // for every task (in-flight fits finish, they are not aborted)
        let _ = shutdown_tx.send(true);
        hub.disconnect_all().await;
        for handle in handles {
            let _ = handle.await;
        }

        let stats = tracker.stats().await;
        tracing::info!(
            ticker_updates = stats.ticker_updates,
            anomalies = stats.anomalies_detected,
            changes = stats.changes_detected,
            events_published = hub.events_published(),
            "Stopped"
        );
        Ok(())
    }

    async fn calibrate_threshold(
        config: &Config,
        rest: &DeribitRest,
    ) -> anyhow::Result<Option<f64>> {
        let end_ms = Utc::now().timestamp_millis();
        let start_ms = end_ms - config.optimizer.lookback_hours * 3600 * 1000;
        let trades = rest
            .fetch_trade_history(&config.feed.trade_instrument, start_ms, end_ms)
            .await?;

        Ok(
            optimizer::optimize(&trades, &config.filter, &config.optimizer).map(|report| {
                println!("{}", report.format_table());
                report.best_threshold
            }),
        )
    }

    /// Per-trade pipeline: filter, broadcast, persist, gauges
    fn spawn_filter_task(
        mut trade_rx: mpsc::Receiver<Trade>,
        mut filter: StreamFilter,
        hub: Arc<EventBroadcastHub>,
        store: Arc<dyn Persistence>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    trade = trade_rx.recv() => {
                        let Some(trade) = trade else { break };
                        let lag_ms = Utc::now().timestamp_millis() - trade.timestamp_ms;
                        if lag_ms >= 0 {
                            record_latency(
                                LatencyMetric::TradeFeed,
                                Duration::from_millis(lag_ms as u64),
                            );
                        }
                        let refit_start = std::time::Instant::now();
                        let output = filter.on_trade(&trade);
                        record_latency(LatencyMetric::ModelRefit, refit_start.elapsed());

                        hub.publish(&BroadcastEvent::Trade {
                            timestamp_ms: trade.timestamp_ms,
                            trade: trade.clone(),
                        })
                        .await;
                        if let Err(e) = store.insert_trade(&trade).await {
                            tracing::warn!(error = %e, "Failed to persist trade");
                        }

                        if let Some(volatility) = output.volatility {
                            set_gauge(GaugeMetric::CurrentVolatility, volatility);
                            hub.publish(&BroadcastEvent::VolatilityEstimate {
                                timestamp_ms: trade.timestamp_ms,
                                instrument: trade.instrument.clone(),
                                volatility,
                            })
                            .await;
                        }

                        if let Some(event) = output.event {
                            tracing::info!(
                                volatility = event.volatility,
                                excess = event.excess_ratio,
                                "Volatility threshold breached"
                            );
                            set_gauge(
                                GaugeMetric::VolatilityEvents,
                                filter.stats().events_detected as f64,
                            );
                            if let Err(e) = store.insert_volatility_event(&event).await {
                                tracing::warn!(error = %e, "Failed to persist volatility event");
                            }
                            hub.publish(&BroadcastEvent::VolatilityEvent {
                                timestamp_ms: event.timestamp_ms,
                                event,
                            })
                            .await;
                        }
                    }
                    _ = shutdown.changed() => {
                        filter.stop();
                        break;
                    }
                }
            }
            tracing::debug!("Filter task stopping");
        })
    }

    /// Periodic observability snapshot
    fn spawn_stats_task(
        hub: Arc<EventBroadcastHub>,
        tracker: Arc<OptionUniverseTracker>,
        interval_secs: u64,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(interval_secs.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let clients = hub.client_count().await;
                        let stats = tracker.stats().await;
                        set_gauge(GaugeMetric::Subscribers, clients as f64);
                        set_gauge(
                            GaugeMetric::TrackedInstruments,
                            stats.instruments_tracked as f64,
                        );
                        set_gauge(GaugeMetric::IvAnomalies, stats.anomalies_detected as f64);
                        if let Some(rmse) = stats.last_fit_rmse {
                            set_gauge(GaugeMetric::SurfaceRmse, rmse);
                        }
                        let topics = hub.subscription_stats().await;
                        tracing::info!(
                            clients,
                            topics = ?topics,
                            tracked = stats.instruments_tracked,
                            "Broadcast stats"
                        );
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}
