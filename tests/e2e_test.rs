//! End-to-end integration tests for the stream filter and broadcast hub

use rust_decimal::Decimal;
use volcast::config::{Config, FilterConfig, HubConfig};
use volcast::events::BroadcastEvent;
use volcast::feed::{Direction, Trade};
use volcast::filter::{FilterState, StreamFilter};
use volcast::hub::EventBroadcastHub;

fn trade(i: i64, price: f64) -> Trade {
    Trade {
        timestamp_ms: 1_700_000_000_000 + i * 500,
        instrument: "BTC-PERPETUAL".to_string(),
        price: Decimal::try_from(price).unwrap(),
        amount: Decimal::ONE,
        direction: Direction::Buy,
        trade_id: format!("t-{}", i),
        iv: None,
    }
}

/// Small deterministic walk around 100: 100, 100.1, 99.9, ...
fn walk_price(i: i64) -> f64 {
    match i % 4 {
        0 => 100.0,
        1 => 100.1,
        2 => 99.9,
        _ => 100.05,
    }
}

#[test]
fn test_example_config_loads() {
    let config = Config::load("config.toml.example").expect("example config must parse");
    assert_eq!(config.feed.exchange, "deribit");
    assert_eq!(config.filter.window_size, 100);
    assert_eq!(config.tracker.iv_threshold_std, 2.0);
    assert_eq!(config.hub.send_timeout_ms, 100);
}

#[test]
fn test_filter_lifecycle_over_25_trades() {
    let mut filter = StreamFilter::new(
        "BTC-PERPETUAL",
        FilterConfig {
            window_size: 20,
            vol_threshold: 0.01,
            min_returns: 20,
            residual_window: 10,
        },
    );
    assert_eq!(filter.state(), FilterState::Idle);

    // Trade 1: Idle -> Warming
    let out = filter.on_trade(&trade(0, walk_price(0)));
    assert_eq!(out.state, FilterState::Warming);
    assert!(out.volatility.is_none());

    // Trades 2..=20 keep warming (19 returns after trade 20)
    for i in 1..20 {
        let out = filter.on_trade(&trade(i, walk_price(i)));
        assert_eq!(out.state, FilterState::Warming);
    }

    // Trade 21 completes the 20-return sample: Active with a defined
    // estimate from here on
    for i in 20..25 {
        let out = filter.on_trade(&trade(i, walk_price(i)));
        assert_eq!(out.state, FilterState::Active);
        let vol = out.volatility.expect("active filter must estimate");
        assert!(!vol.is_nan());
        assert!(vol >= 0.0);
    }

    let stats = filter.stats();
    assert_eq!(stats.trades_processed, 25);
}

#[tokio::test]
async fn test_filter_events_flow_through_hub() {
    let hub = EventBroadcastHub::new(HubConfig {
        send_timeout_ms: 100,
        channel_capacity: 256,
        stats_interval_secs: 60,
    });
    let (_, mut breach_rx) = hub.register(vec!["volatility_event".to_string()]).await;
    let (_, mut estimate_rx) = hub
        .register(vec!["volatility_estimate".to_string()])
        .await;

    // Near-zero threshold so the jitter breaches it
    let mut filter = StreamFilter::new(
        "BTC-PERPETUAL",
        FilterConfig {
            window_size: 20,
            vol_threshold: 1e-9,
            min_returns: 20,
            residual_window: 10,
        },
    );

    let mut breaches = 0;
    for i in 0..30 {
        let t = trade(i, walk_price(i));
        let out = filter.on_trade(&t);
        if let Some(volatility) = out.volatility {
            hub.publish(&BroadcastEvent::VolatilityEstimate {
                timestamp_ms: t.timestamp_ms,
                instrument: t.instrument.clone(),
                volatility,
            })
            .await;
        }
        if let Some(event) = out.event {
            breaches += 1;
            assert!((event.excess_ratio - event.volatility / event.threshold).abs() < 1e-9);
            hub.publish(&BroadcastEvent::VolatilityEvent {
                timestamp_ms: event.timestamp_ms,
                event,
            })
            .await;
        }
    }
    assert!(breaches > 0, "tiny threshold must be breached");

    // Topic filters route each event kind to its own subscriber
    let msg = estimate_rx.recv().await.unwrap();
    assert!(msg.contains(r#""type":"volatility_estimate""#));
    let msg = breach_rx.recv().await.unwrap();
    assert!(msg.contains(r#""type":"volatility_event""#));
    assert!(msg.contains("excess_ratio"));
}

#[tokio::test]
async fn test_hub_survives_subscriber_churn() {
    let hub = EventBroadcastHub::new(HubConfig {
        send_timeout_ms: 50,
        channel_capacity: 8,
        stats_interval_secs: 60,
    });

    let (id_a, mut rx_a) = hub.register(Vec::new()).await;
    let (_id_b, rx_b) = hub.register(Vec::new()).await;
    drop(rx_b); // dead mid-publish

    hub.publish(&BroadcastEvent::VolatilityEstimate {
        timestamp_ms: 1,
        instrument: "BTC-PERPETUAL".to_string(),
        volatility: 0.02,
    })
    .await;

    assert!(rx_a.recv().await.is_some());
    assert_eq!(hub.client_count().await, 1);

    hub.disconnect(id_a).await;
    assert_eq!(hub.client_count().await, 0);
}
