//! Option universe tracker
//!
//! Maintains the tracked instrument set (a strike/expiry window around
//! spot), caches the latest Greeks per instrument, detects IV
//! anomalies and jumps, and periodically rebuilds the chain and refits
//! the volatility surface.

mod chain;
mod detector;

pub use chain::{ChainEntry, ChainSnapshot, SmoothedIvPoint};
pub use detector::{check_anomaly, check_change, IvEvent, IvEventType, IvHistory, ThresholdType};

use crate::config::{SurfaceConfig, TrackerConfig};
use crate::events::BroadcastEvent;
use crate::feed::{GreeksSnapshot, Instrument, InstrumentKind, InstrumentSource, TickerUpdate, Trade};
use crate::hub::EventBroadcastHub;
use crate::storage::Persistence;
use crate::surface::{fit_surface, SurfaceFit};
use crate::telemetry::{record_latency, set_gauge, GaugeMetric, LatencyMetric};
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

/// Counters exposed for polling
#[derive(Debug, Default, Clone, Serialize)]
pub struct TrackerStats {
    pub instruments_total: usize,
    pub instruments_tracked: usize,
    pub ticker_updates: u64,
    pub option_trades: u64,
    pub anomalies_detected: u64,
    pub changes_detected: u64,
    pub greeks_refreshes: u64,
    pub chain_refreshes: u64,
    pub last_fit_rmse: Option<f64>,
}

/// All mutable tracker state behind one lock; mutated only by the
/// ticker/trade path and the refresh tasks, read by copy everywhere
/// else
struct TrackerState {
    instruments: HashMap<String, Instrument>,
    tracked: HashSet<String>,
    spot: f64,
    greeks: HashMap<String, GreeksSnapshot>,
    iv_history: HashMap<String, IvHistory>,
    last_fit: Option<SurfaceFit>,
    stats: TrackerStats,
}

pub struct OptionUniverseTracker {
    config: TrackerConfig,
    surface_config: SurfaceConfig,
    underlying: String,
    hub: Arc<EventBroadcastHub>,
    store: Arc<dyn Persistence>,
    state: Arc<RwLock<TrackerState>>,
}

impl OptionUniverseTracker {
    pub fn new(
        config: TrackerConfig,
        surface_config: SurfaceConfig,
        underlying: impl Into<String>,
        hub: Arc<EventBroadcastHub>,
        store: Arc<dyn Persistence>,
    ) -> Self {
        Self {
            config,
            surface_config,
            underlying: underlying.into(),
            hub,
            store,
            state: Arc::new(RwLock::new(TrackerState {
                instruments: HashMap::new(),
                tracked: HashSet::new(),
                spot: 0.0,
                greeks: HashMap::new(),
                iv_history: HashMap::new(),
                last_fit: None,
                stats: TrackerStats::default(),
            })),
        }
    }

    pub async fn stats(&self) -> TrackerStats {
        self.state.read().await.stats.clone()
    }

    /// Copy of the most recent published surface fit
    pub async fn latest_fit(&self) -> Option<SurfaceFit> {
        self.state.read().await.last_fit.clone()
    }

    pub async fn is_tracked(&self, instrument: &str) -> bool {
        self.state.read().await.tracked.contains(instrument)
    }

    /// Names of all tracked instruments
    pub async fn tracked_instruments(&self) -> Vec<String> {
        self.state.read().await.tracked.iter().cloned().collect()
    }

    /// Re-pull the universe and spot, then recompute the tracked set
    pub async fn refresh_universe(&self, source: &dyn InstrumentSource) -> anyhow::Result<()> {
        let instruments = source.fetch_instruments(&self.underlying).await?;
        let spot = source.fetch_index_price(&self.underlying).await?;
        let now_ms = Utc::now().timestamp_millis();

        let mut state = self.state.write().await;
        state.spot = spot;
        state.instruments = instruments
            .into_iter()
            .map(|inst| (inst.name.clone(), inst))
            .collect();
        Self::recompute_tracked(&mut state, &self.config, now_ms);

        tracing::info!(
            total = state.stats.instruments_total,
            tracked = state.stats.instruments_tracked,
            spot,
            "Universe refreshed"
        );
        Ok(())
    }

    /// Tracked = active options with strike inside the spot window and
    /// expiry within the horizon (and still in the future)
    fn recompute_tracked(state: &mut TrackerState, config: &TrackerConfig, now_ms: i64) {
        let lo = state.spot * (1.0 - config.strike_range_pct);
        let hi = state.spot * (1.0 + config.strike_range_pct);
        let horizon_ms = now_ms + config.expiry_horizon_days * 24 * 3600 * 1000;

        state.tracked = state
            .instruments
            .values()
            .filter(|inst| {
                inst.is_active
                    && inst.kind == InstrumentKind::Option
                    && inst.strike.is_some_and(|k| k >= lo && k <= hi)
                    && inst
                        .expiry_ms
                        .is_some_and(|e| e > now_ms && e <= horizon_ms)
            })
            .map(|inst| inst.name.clone())
            .collect();

        state.stats.instruments_total = state.instruments.len();
        state.stats.instruments_tracked = state.tracked.len();
    }

    /// Handle one ticker push: cache the snapshot and run both IV
    /// detectors
    pub async fn on_ticker_update(&self, ticker: &TickerUpdate) {
        let snapshot = GreeksSnapshot::from(ticker);
        let mut events = Vec::new();
        {
            let mut state = self.state.write().await;
            if !state.tracked.contains(&ticker.instrument) {
                return;
            }
            state.stats.ticker_updates += 1;
            if state.spot > 0.0 && ticker.underlying_price > 0.0 {
                // Keep spot current between universe refreshes; a
                // move beyond 0.1% shifts the strike window
                let moved = (ticker.underlying_price - state.spot).abs() / state.spot > 1e-3;
                state.spot = ticker.underlying_price;
                if moved {
                    Self::recompute_tracked(&mut state, &self.config, ticker.timestamp_ms);
                }
            }

            if ticker.mark_iv > 0.0 {
                // Jump vs the previous cached observation
                let prev = state.greeks.get(&ticker.instrument).map(|g| g.mark_iv);
                if let Some(prev_iv) = prev {
                    if let Some(rel) =
                        check_change(ticker.mark_iv, prev_iv, self.config.iv_change_threshold)
                    {
                        state.stats.changes_detected += 1;
                        events.push(self.iv_event(
                            &state,
                            ticker.timestamp_ms,
                            &ticker.instrument,
                            IvEventType::IvChange,
                            ticker.mark_iv,
                            prev_iv,
                            rel,
                            None,
                        ));
                    }
                }

                if let Some(event) =
                    self.detect_and_push(&mut state, ticker.timestamp_ms, &ticker.instrument, ticker.mark_iv)
                {
                    events.push(event);
                }
            }

            state
                .greeks
                .insert(ticker.instrument.clone(), snapshot.clone());
        }

        self.hub
            .publish(&BroadcastEvent::OptionGreeksUpdate {
                timestamp_ms: ticker.timestamp_ms,
                snapshot: snapshot.clone(),
            })
            .await;
        for event in events {
            self.publish_iv_event(event).await;
        }
        if let Err(e) = self.store.insert_greeks_snapshot(&snapshot).await {
            tracing::warn!(error = %e, "Failed to persist greeks snapshot");
        }
    }

    /// Handle a trade on a tracked option
    pub async fn on_trade(&self, trade: &Trade) {
        let mut event = None;
        {
            let mut state = self.state.write().await;
            if !state.tracked.contains(&trade.instrument) {
                return;
            }
            state.stats.option_trades += 1;

            if let Some(iv) = trade.iv {
                if iv > 0.0 {
                    event =
                        self.detect_and_push(&mut state, trade.timestamp_ms, &trade.instrument, iv);
                }
            }
        }

        self.hub
            .publish(&BroadcastEvent::OptionTrade {
                timestamp_ms: trade.timestamp_ms,
                trade: trade.clone(),
            })
            .await;
        if let Some(event) = event {
            self.publish_iv_event(event).await;
        }
        if let Err(e) = self.store.insert_trade(trade).await {
            tracing::warn!(error = %e, "Failed to persist option trade");
        }
    }

    /// Z-score the observation against the history, then append it.
    /// Check-then-push, identical for the trade and ticker paths.
    fn detect_and_push(
        &self,
        state: &mut TrackerState,
        timestamp_ms: i64,
        instrument: &str,
        iv: f64,
    ) -> Option<IvEvent> {
        let history = state
            .iv_history
            .entry(instrument.to_string())
            .or_insert_with(|| IvHistory::new(self.config.iv_history_len));

        let hit = check_anomaly(
            history,
            iv,
            self.config.iv_threshold_std,
            self.config.min_history,
        );
        history.push(iv);

        let (z, mean) = hit?;
        state.stats.anomalies_detected += 1;
        Some(self.iv_event(
            state,
            timestamp_ms,
            instrument,
            IvEventType::IvAnomaly,
            iv,
            mean,
            iv - mean,
            Some(z),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn iv_event(
        &self,
        state: &TrackerState,
        timestamp_ms: i64,
        instrument: &str,
        event_type: IvEventType,
        implied_vol: f64,
        reference_vol: f64,
        delta_vol: f64,
        z_score: Option<f64>,
    ) -> IvEvent {
        let inst = state.instruments.get(instrument);
        let (threshold_type, threshold_value) = match event_type {
            IvEventType::IvAnomaly => (ThresholdType::ZScore, self.config.iv_threshold_std),
            IvEventType::IvChange => {
                (ThresholdType::RelativeChange, self.config.iv_change_threshold)
            }
        };
        IvEvent {
            timestamp_ms,
            instrument: instrument.to_string(),
            event_type,
            implied_vol,
            reference_vol,
            delta_vol,
            strike: inst.and_then(|i| i.strike),
            days_to_expiry: inst.and_then(|i| i.days_to_expiry(timestamp_ms)),
            threshold_type,
            threshold_value,
            z_score,
        }
    }

    async fn publish_iv_event(&self, event: IvEvent) {
        tracing::info!(
            instrument = %event.instrument,
            kind = ?event.event_type,
            iv = event.implied_vol,
            z = ?event.z_score,
            "IV event"
        );
        self.hub
            .publish(&BroadcastEvent::OptionVolatilityEvent {
                timestamp_ms: event.timestamp_ms,
                event,
            })
            .await;
    }

    /// Batch re-fetch Greeks for every tracked instrument. Best
    /// effort: a failed instrument is skipped until the next cycle.
    pub async fn refresh_greeks(&self, source: &dyn InstrumentSource) {
        let tracked = self.tracked_instruments().await;
        let mut fetched = 0usize;

        for name in &tracked {
            match source.fetch_greeks(name).await {
                Ok(snapshot) => {
                    let ticker = TickerUpdate {
                        timestamp_ms: snapshot.timestamp_ms,
                        instrument: snapshot.instrument.clone(),
                        mark_price: snapshot.mark_price,
                        mark_iv: snapshot.mark_iv,
                        underlying_price: snapshot.underlying_price,
                        bid_iv: snapshot.bid_iv,
                        ask_iv: snapshot.ask_iv,
                        best_bid: None,
                        best_ask: None,
                        open_interest: snapshot.open_interest,
                        volume: snapshot.volume,
                        delta: snapshot.delta,
                        gamma: snapshot.gamma,
                        vega: snapshot.vega,
                        theta: snapshot.theta,
                        rho: snapshot.rho,
                    };
                    self.on_ticker_update(&ticker).await;
                    fetched += 1;
                }
                Err(e) => {
                    tracing::warn!(instrument = %name, error = %e, "Greeks fetch failed, skipping");
                }
            }
        }

        let mut state = self.state.write().await;
        state.stats.greeks_refreshes += 1;
        tracing::debug!(fetched, total = tracked.len(), "Greeks refresh complete");
    }

    /// Rebuild the chain, persist a snapshot, and refit the surface
    /// when enough valid points exist
    pub async fn chain_refresh(&self, source: &dyn InstrumentSource) {
        if let Err(e) = self.refresh_universe(source).await {
            tracing::warn!(error = %e, "Universe refresh failed, keeping prior chain");
            return;
        }

        let now_ms = Utc::now().timestamp_millis();
        let (snapshot, n_tracked) = {
            let mut state = self.state.write().await;
            state.stats.chain_refreshes += 1;
            let tracked: Vec<Instrument> = state
                .tracked
                .iter()
                .filter_map(|name| state.instruments.get(name).cloned())
                .collect();
            (
                ChainSnapshot::build(
                    now_ms,
                    &self.underlying,
                    state.spot,
                    &tracked,
                    &state.greeks,
                ),
                tracked.len(),
            )
        };

        self.hub
            .publish(&BroadcastEvent::OptionChainUpdate {
                timestamp_ms: now_ms,
                underlying: self.underlying.clone(),
                n_instruments: snapshot.entries.len(),
                n_tracked,
            })
            .await;
        if let Err(e) = self.store.insert_chain_snapshot(&snapshot).await {
            tracing::warn!(error = %e, "Failed to persist chain snapshot");
        }

        let points = snapshot.surface_points(now_ms);
        if points.len() < self.config.min_surface_points {
            tracing::debug!(
                points = points.len(),
                need = self.config.min_surface_points,
                "Too few valid points for a surface fit"
            );
            return;
        }

        // Fit is synchronous within this task; shutdown waits for it
        let fit_start = std::time::Instant::now();
        let result = fit_surface(
            &points,
            snapshot.spot_price,
            now_ms,
            &self.underlying,
            &self.surface_config,
        );
        record_latency(LatencyMetric::SurfaceFit, fit_start.elapsed());
        match result {
            Ok(fit) => {
                {
                    let mut state = self.state.write().await;
                    state.stats.last_fit_rmse = Some(fit.rmse);
                    state.last_fit = Some(fit.clone());
                }
                tracing::info!(
                    model = ?fit.model,
                    rmse = fit.rmse,
                    n_points = fit.n_points,
                    atm_vol = fit.atm_vol,
                    "Surface refit"
                );
                set_gauge(GaugeMetric::AtmVol, fit.atm_vol);
                set_gauge(GaugeMetric::SurfaceRmse, fit.rmse);
                self.hub
                    .publish(&BroadcastEvent::IvSurfaceUpdate {
                        timestamp_ms: now_ms,
                        fit: fit.clone(),
                    })
                    .await;
                if let Err(e) = self.store.insert_surface_fit(&fit).await {
                    tracing::warn!(error = %e, "Failed to persist surface fit");
                }
            }
            Err(e) => {
                // Prior fit stays published
                tracing::warn!(error = %e, "Surface fit failed, keeping prior fit");
            }
        }
    }

    /// Spawn the two independent refresh timers. Both exit when the
    /// shutdown signal flips.
    pub fn spawn_refresh_tasks(
        self: &Arc<Self>,
        source: Arc<dyn InstrumentSource>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let tracker = Arc::clone(self);
        let greeks_source = Arc::clone(&source);
        let mut greeks_shutdown = shutdown.clone();
        let greeks_period = tokio::time::Duration::from_secs(self.config.greeks_refresh_secs);
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(greeks_period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        tracker.refresh_greeks(greeks_source.as_ref()).await;
                    }
                    _ = greeks_shutdown.changed() => {
                        tracing::debug!("Greeks refresh task stopping");
                        break;
                    }
                }
            }
        }));

        let tracker = Arc::clone(self);
        let mut chain_shutdown = shutdown.clone();
        let chain_period = tokio::time::Duration::from_secs(self.config.chain_refresh_secs);
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(chain_period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        tracker.chain_refresh(source.as_ref()).await;
                    }
                    _ = chain_shutdown.changed() => {
                        tracing::debug!("Chain refresh task stopping");
                        break;
                    }
                }
            }
        }));

        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::pricing::OptionType;
    use crate::storage::NullStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const DAY_MS: i64 = 24 * 3600 * 1000;

    struct FakeSource {
        instruments: Vec<Instrument>,
        spot: f64,
        greeks: Mutex<HashMap<String, GreeksSnapshot>>,
    }

    #[async_trait]
    impl InstrumentSource for FakeSource {
        async fn fetch_instruments(&self, _currency: &str) -> anyhow::Result<Vec<Instrument>> {
            Ok(self.instruments.clone())
        }

        async fn fetch_greeks(&self, instrument: &str) -> anyhow::Result<GreeksSnapshot> {
            self.greeks
                .lock()
                .unwrap()
                .get(instrument)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no greeks for {}", instrument))
        }

        async fn fetch_index_price(&self, _currency: &str) -> anyhow::Result<f64> {
            Ok(self.spot)
        }

        async fn fetch_trade_history(
            &self,
            _instrument: &str,
            _start_ms: i64,
            _end_ms: i64,
        ) -> anyhow::Result<Vec<Trade>> {
            Ok(Vec::new())
        }
    }

    fn option(name: &str, strike: f64, days_out: i64) -> Instrument {
        Instrument {
            name: name.to_string(),
            underlying: "BTC".to_string(),
            kind: InstrumentKind::Option,
            strike: Some(strike),
            option_type: Some(OptionType::Call),
            expiry_ms: Some(Utc::now().timestamp_millis() + days_out * DAY_MS),
            contract_size: 1.0,
            is_active: true,
        }
    }

    fn tracker() -> (Arc<OptionUniverseTracker>, Arc<EventBroadcastHub>) {
        let hub = Arc::new(EventBroadcastHub::new(HubConfig {
            send_timeout_ms: 50,
            channel_capacity: 64,
            stats_interval_secs: 60,
        }));
        let tracker = Arc::new(OptionUniverseTracker::new(
            TrackerConfig::default(),
            SurfaceConfig::default(),
            "BTC",
            Arc::clone(&hub),
            Arc::new(NullStore),
        ));
        (tracker, hub)
    }

    fn ticker(instrument: &str, iv: f64, ts: i64) -> TickerUpdate {
        TickerUpdate {
            timestamp_ms: ts,
            instrument: instrument.to_string(),
            mark_price: 0.05,
            mark_iv: iv,
            underlying_price: 50_000.0,
            bid_iv: None,
            ask_iv: None,
            best_bid: None,
            best_ask: None,
            open_interest: 100.0,
            volume: 10.0,
            delta: 0.5,
            gamma: 0.0001,
            vega: 30.0,
            theta: -15.0,
            rho: 5.0,
        }
    }

    fn source() -> FakeSource {
        FakeSource {
            instruments: vec![
                option("NEAR-ATM", 50_000.0, 30),
                option("FAR-STRIKE", 90_000.0, 30),   // outside strike window
                option("FAR-EXPIRY", 50_000.0, 365),  // beyond horizon
            ],
            spot: 50_000.0,
            greeks: Mutex::new(HashMap::new()),
        }
    }

    #[tokio::test]
    async fn test_tracked_set_respects_windows() {
        let (tracker, _hub) = tracker();
        tracker.refresh_universe(&source()).await.unwrap();

        assert!(tracker.is_tracked("NEAR-ATM").await);
        assert!(!tracker.is_tracked("FAR-STRIKE").await);
        assert!(!tracker.is_tracked("FAR-EXPIRY").await);
        let stats = tracker.stats().await;
        assert_eq!(stats.instruments_total, 3);
        assert_eq!(stats.instruments_tracked, 1);
    }

    #[tokio::test]
    async fn test_untracked_ticker_is_ignored() {
        let (tracker, _hub) = tracker();
        tracker.refresh_universe(&source()).await.unwrap();

        tracker
            .on_ticker_update(&ticker("FAR-STRIKE", 0.6, 1))
            .await;
        assert_eq!(tracker.stats().await.ticker_updates, 0);
    }

    #[tokio::test]
    async fn test_iv_change_event_on_jump() {
        let (tracker, hub) = tracker();
        tracker.refresh_universe(&source()).await.unwrap();
        let (_, mut rx) = hub
            .register(vec!["option_volatility_event".to_string()])
            .await;

        tracker.on_ticker_update(&ticker("NEAR-ATM", 0.5, 1)).await;
        // 20% jump over the 10% default threshold
        tracker.on_ticker_update(&ticker("NEAR-ATM", 0.6, 2)).await;

        let msg = rx.recv().await.unwrap();
        assert!(msg.contains("iv_change"));
        let stats = tracker.stats().await;
        assert_eq!(stats.changes_detected, 1);
        assert_eq!(stats.ticker_updates, 2);
    }

    #[tokio::test]
    async fn test_anomaly_requires_min_history_then_fires() {
        let (tracker, hub) = tracker();
        tracker.refresh_universe(&source()).await.unwrap();
        let (_, mut rx) = hub
            .register(vec!["option_volatility_event".to_string()])
            .await;

        // 20 observations jittering around 0.5, below the change
        // threshold step to step
        for i in 0..20 {
            let iv = if i % 2 == 0 { 0.498 } else { 0.502 };
            tracker.on_ticker_update(&ticker("NEAR-ATM", iv, i)).await;
        }
        assert_eq!(tracker.stats().await.anomalies_detected, 0);

        // Clear outlier: many stds away but < 10% relative change
        tracker
            .on_ticker_update(&ticker("NEAR-ATM", 0.52, 21))
            .await;

        let msg = rx.recv().await.unwrap();
        assert!(msg.contains("iv_anomaly"));
        assert!(msg.contains("z_score"));
        assert_eq!(tracker.stats().await.anomalies_detected, 1);
    }

    #[tokio::test]
    async fn test_option_trade_broadcast_and_anomaly_path() {
        let (tracker, hub) = tracker();
        tracker.refresh_universe(&source()).await.unwrap();
        let (_, mut rx) = hub.register(vec!["option_trade".to_string()]).await;

        let trade = Trade {
            timestamp_ms: 1,
            instrument: "NEAR-ATM".to_string(),
            price: rust_decimal_macros::dec!(0.05),
            amount: rust_decimal_macros::dec!(1),
            direction: crate::feed::Direction::Buy,
            trade_id: "t-1".to_string(),
            iv: Some(0.5),
        };
        tracker.on_trade(&trade).await;

        let msg = rx.recv().await.unwrap();
        assert!(msg.contains("option_trade"));
        assert_eq!(tracker.stats().await.option_trades, 1);
    }

    #[tokio::test]
    async fn test_greeks_refresh_skips_failures() {
        let (tracker, _hub) = tracker();
        let source = source();
        source.greeks.lock().unwrap().insert(
            "NEAR-ATM".to_string(),
            GreeksSnapshot {
                instrument: "NEAR-ATM".to_string(),
                timestamp_ms: 5,
                mark_price: 0.05,
                mark_iv: 0.55,
                underlying_price: 50_000.0,
                delta: 0.5,
                gamma: 0.0001,
                vega: 30.0,
                theta: -15.0,
                rho: 5.0,
                bid_iv: None,
                ask_iv: None,
                open_interest: 0.0,
                volume: 0.0,
            },
        );
        tracker.refresh_universe(&source).await.unwrap();

        // Fetch succeeds for NEAR-ATM only; refresh must not error
        tracker.refresh_greeks(&source).await;
        let stats = tracker.stats().await;
        assert_eq!(stats.greeks_refreshes, 1);
        assert_eq!(stats.ticker_updates, 1);
    }

    #[tokio::test]
    async fn test_chain_refresh_without_enough_points_keeps_no_fit() {
        let (tracker, hub) = tracker();
        let (_, mut rx) = hub
            .register(vec!["option_chain_update".to_string()])
            .await;

        tracker.chain_refresh(&source()).await;

        let msg = rx.recv().await.unwrap();
        assert!(msg.contains("option_chain_update"));
        assert!(tracker.latest_fit().await.is_none());
        assert_eq!(tracker.stats().await.chain_refreshes, 1);
    }
}
