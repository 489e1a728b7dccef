//! Deribit market data implementation
//!
//! Streaming trades/tickers over the JSON-RPC WebSocket plus a REST
//! client for the instrument universe, batch Greeks refreshes and the
//! historical trades the optimizer replays.

use super::types::{parse_instrument_name, Direction, GreeksSnapshot, Instrument, InstrumentKind};
use super::{InstrumentSource, TickerFeed, Trade, TradeFeed, TickerUpdate};
use crate::ws::{WsClient, WsConfig, WsMessage};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

const DERIBIT_WS_URL: &str = "wss://www.deribit.com/ws/api/v2";
const DERIBIT_REST_URL: &str = "https://www.deribit.com/api/v2";

/// Envelope for subscription notifications
#[derive(Debug, Deserialize)]
struct WsNotification {
    method: Option<String>,
    params: Option<WsNotificationParams>,
}

#[derive(Debug, Deserialize)]
struct WsNotificationParams {
    channel: String,
    data: serde_json::Value,
}

/// One trade entry on a `trades.{instrument}.raw` channel
#[derive(Debug, Deserialize)]
struct WsTrade {
    trade_id: String,
    instrument_name: String,
    timestamp: i64,
    price: f64,
    amount: f64,
    direction: String,
    /// Percent, option trades only
    iv: Option<f64>,
}

/// Ticker payload on a `ticker.{instrument}.raw` channel; the REST
/// ticker endpoint returns the same shape
#[derive(Debug, Deserialize)]
struct WsTicker {
    instrument_name: String,
    timestamp: i64,
    mark_price: f64,
    #[serde(default)]
    mark_iv: f64,
    underlying_price: Option<f64>,
    bid_iv: Option<f64>,
    ask_iv: Option<f64>,
    best_bid_price: Option<f64>,
    best_ask_price: Option<f64>,
    #[serde(default)]
    open_interest: f64,
    #[serde(default)]
    stats: WsTickerStats,
    greeks: Option<WsGreeks>,
}

#[derive(Debug, Default, Deserialize)]
struct WsTickerStats {
    #[serde(default)]
    volume: f64,
}

#[derive(Debug, Deserialize)]
struct WsGreeks {
    delta: f64,
    gamma: f64,
    vega: f64,
    theta: f64,
    rho: f64,
}

/// Deribit quotes IVs in percent; everything downstream works in
/// annualized fractions
fn iv_fraction(pct: f64) -> f64 {
    pct / 100.0
}

fn parse_trade(value: &serde_json::Value) -> Option<Trade> {
    let raw: WsTrade = serde_json::from_value(value.clone()).ok()?;
    let direction = match raw.direction.as_str() {
        "buy" => Direction::Buy,
        "sell" => Direction::Sell,
        _ => return None,
    };
    Some(Trade {
        timestamp_ms: raw.timestamp,
        instrument: raw.instrument_name,
        price: Decimal::try_from(raw.price).ok()?,
        amount: Decimal::try_from(raw.amount).ok()?,
        direction,
        trade_id: raw.trade_id,
        iv: raw.iv.map(iv_fraction),
    })
}

fn parse_ticker(value: &serde_json::Value) -> Option<TickerUpdate> {
    let raw: WsTicker = serde_json::from_value(value.clone()).ok()?;
    let greeks = raw.greeks.unwrap_or(WsGreeks {
        delta: 0.0,
        gamma: 0.0,
        vega: 0.0,
        theta: 0.0,
        rho: 0.0,
    });
    Some(TickerUpdate {
        timestamp_ms: raw.timestamp,
        instrument: raw.instrument_name,
        mark_price: raw.mark_price,
        mark_iv: iv_fraction(raw.mark_iv),
        underlying_price: raw.underlying_price.unwrap_or(raw.mark_price),
        bid_iv: raw.bid_iv.map(iv_fraction),
        ask_iv: raw.ask_iv.map(iv_fraction),
        best_bid: raw.best_bid_price,
        best_ask: raw.best_ask_price,
        open_interest: raw.open_interest,
        volume: raw.stats.volume,
        delta: greeks.delta,
        gamma: greeks.gamma,
        vega: greeks.vega,
        theta: greeks.theta,
        rho: greeks.rho,
    })
}

/// Build the JSON-RPC subscribe payload for a set of channels
fn subscribe_payload(channels: &[String]) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "public/subscribe",
        "params": { "channels": channels }
    })
    .to_string()
}

/// Streaming Deribit feed over the JSON-RPC WebSocket
pub struct DeribitFeed {
    ws_url: String,
}

impl Default for DeribitFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl DeribitFeed {
    pub fn new() -> Self {
        Self {
            ws_url: DERIBIT_WS_URL.to_string(),
        }
    }

    pub fn with_url(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
        }
    }

    fn ws_client(&self, channels: &[String]) -> WsClient {
        let config = WsConfig::new(self.ws_url.clone())
            .on_connect(subscribe_payload(channels))
            .initial_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(60))
            .ping_interval(Duration::from_secs(30));
        WsClient::new(config)
    }

    /// Pump one channel kind from the raw WS stream into typed values
    async fn run_message_loop<T, F>(mut ws_rx: mpsc::Receiver<WsMessage>, tx: mpsc::Sender<T>, parse: F)
    where
        T: Send + 'static,
        F: Fn(&str, &serde_json::Value) -> Vec<T>,
    {
        while let Some(msg) = ws_rx.recv().await {
            match msg {
                WsMessage::Text(text) => {
                    let Ok(note) = serde_json::from_str::<WsNotification>(&text) else {
                        continue;
                    };
                    if note.method.as_deref() != Some("subscription") {
                        continue;
                    }
                    let Some(params) = note.params else { continue };
                    for item in parse(&params.channel, &params.data) {
                        if tx.send(item).await.is_err() {
                            tracing::debug!("Receiver dropped, stopping feed");
                            return;
                        }
                    }
                }
                WsMessage::Connected => {
                    tracing::info!("Deribit feed connected");
                }
                WsMessage::Disconnected => {
                    tracing::warn!("Deribit feed disconnected");
                    return;
                }
                WsMessage::Reconnecting { attempt } => {
                    tracing::warn!(attempt, "Deribit feed reconnecting");
                }
            }
        }
    }
}

#[async_trait]
impl TradeFeed for DeribitFeed {
    async fn subscribe_trades(
        &self,
        instruments: &[String],
    ) -> anyhow::Result<mpsc::Receiver<Trade>> {
        let channels: Vec<String> = instruments
            .iter()
            .map(|i| format!("trades.{}.raw", i))
            .collect();
        tracing::info!(?channels, "Subscribing to Deribit trades");

        let ws_rx = self.ws_client(&channels).connect();
        let (tx, rx) = mpsc::channel(1024);

        tokio::spawn(async move {
            Self::run_message_loop(ws_rx, tx, |channel, data| {
                if !channel.starts_with("trades.") {
                    return Vec::new();
                }
                // Trade notifications batch several trades per frame
                data.as_array()
                    .map(|items| items.iter().filter_map(parse_trade).collect())
                    .unwrap_or_default()
            })
            .await;
        });

        Ok(rx)
    }
}

#[async_trait]
impl TickerFeed for DeribitFeed {
    async fn subscribe_tickers(
        &self,
        instruments: &[String],
    ) -> anyhow::Result<mpsc::Receiver<TickerUpdate>> {
        let channels: Vec<String> = instruments
            .iter()
            .map(|i| format!("ticker.{}.raw", i))
            .collect();
        tracing::info!(n = channels.len(), "Subscribing to Deribit tickers");

        let ws_rx = self.ws_client(&channels).connect();
        let (tx, rx) = mpsc::channel(1024);

        tokio::spawn(async move {
            Self::run_message_loop(ws_rx, tx, |channel, data| {
                if !channel.starts_with("ticker.") {
                    return Vec::new();
                }
                parse_ticker(data).into_iter().collect()
            })
            .await;
        });

        Ok(rx)
    }
}

/// REST instrument payload from `public/get_instruments`
#[derive(Debug, Deserialize)]
struct RestInstrument {
    instrument_name: String,
    base_currency: String,
    kind: String,
    strike: Option<f64>,
    option_type: Option<String>,
    expiration_timestamp: Option<i64>,
    #[serde(default = "default_contract_size")]
    contract_size: f64,
    is_active: bool,
}

fn default_contract_size() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
struct RestResponse<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct RestIndexPrice {
    index_price: f64,
}

#[derive(Debug, Deserialize)]
struct RestTradePage {
    trades: Vec<serde_json::Value>,
    has_more: bool,
}

/// REST client for the Deribit public API
pub struct DeribitRest {
    client: reqwest::Client,
    base_url: String,
}

impl DeribitRest {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            base_url: DERIBIT_REST_URL.to_string(),
        })
    }

    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            base_url: base_url.into(),
        })
    }

    fn instrument_from_rest(raw: RestInstrument) -> Option<Instrument> {
        let kind = match raw.kind.as_str() {
            "option" => InstrumentKind::Option,
            "future" => InstrumentKind::Future,
            // Other kinds (spot, combos) are outside the universe
            _ => return None,
        };

        // Prefer the structured fields; fall back to name parsing when
        // the API omits them
        let parsed = parse_instrument_name(&raw.instrument_name);
        let strike = raw.strike.or(parsed.map(|(_, k, _)| k));
        let option_type = match raw.option_type.as_deref() {
            Some("call") => Some(crate::pricing::OptionType::Call),
            Some("put") => Some(crate::pricing::OptionType::Put),
            _ => parsed.map(|(_, _, t)| t),
        };
        let expiry_ms = raw
            .expiration_timestamp
            .or(parsed.map(|(e, _, _)| e.timestamp_millis()));

        Some(Instrument {
            name: raw.instrument_name,
            underlying: raw.base_currency,
            kind,
            strike,
            option_type,
            expiry_ms,
            contract_size: raw.contract_size,
            is_active: raw.is_active,
        })
    }
}

#[async_trait]
impl InstrumentSource for DeribitRest {
    async fn fetch_instruments(&self, currency: &str) -> anyhow::Result<Vec<Instrument>> {
        let url = format!(
            "{}/public/get_instruments?currency={}&kind=option&expired=false",
            self.base_url, currency
        );
        let response: RestResponse<Vec<RestInstrument>> =
            self.client.get(&url).send().await?.json().await?;

        Ok(response
            .result
            .into_iter()
            .filter_map(Self::instrument_from_rest)
            .collect())
    }

    async fn fetch_greeks(&self, instrument: &str) -> anyhow::Result<GreeksSnapshot> {
        let url = format!(
            "{}/public/ticker?instrument_name={}",
            self.base_url, instrument
        );
        let response: RestResponse<serde_json::Value> =
            self.client.get(&url).send().await?.json().await?;

        let ticker = parse_ticker(&response.result)
            .ok_or_else(|| anyhow::anyhow!("malformed ticker for {}", instrument))?;
        Ok(GreeksSnapshot::from(&ticker))
    }

    async fn fetch_index_price(&self, currency: &str) -> anyhow::Result<f64> {
        let url = format!(
            "{}/public/get_index_price?index_name={}_usd",
            self.base_url,
            currency.to_lowercase()
        );
        let response: RestResponse<RestIndexPrice> =
            self.client.get(&url).send().await?.json().await?;
        Ok(response.result.index_price)
    }

    async fn fetch_trade_history(
        &self,
        instrument: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> anyhow::Result<Vec<Trade>> {
        let mut trades = Vec::new();
        let mut cursor = start_ms;

        // Paginate forward by timestamp until the range is covered
        loop {
            let url = format!(
                "{}/public/get_last_trades_by_instrument_and_time?instrument_name={}&start_timestamp={}&end_timestamp={}&count=1000&sorting=asc",
                self.base_url, instrument, cursor, end_ms
            );
            let response: RestResponse<RestTradePage> =
                self.client.get(&url).send().await?.json().await?;

            let page: Vec<Trade> = response
                .result
                .trades
                .iter()
                .filter_map(parse_trade)
                .collect();

            let Some(last_ts) = page.last().map(|t| t.timestamp_ms) else {
                break;
            };
            trades.extend(page);

            if !response.result.has_more || last_ts >= end_ms {
                break;
            }
            cursor = last_ts + 1;
        }

        trades.sort_by_key(|t| t.timestamp_ms);
        Ok(trades)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_payload_shape() {
        let payload = subscribe_payload(&["trades.BTC-PERPETUAL.raw".to_string()]);
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["method"], "public/subscribe");
        assert_eq!(value["params"]["channels"][0], "trades.BTC-PERPETUAL.raw");
    }

    #[test]
    fn test_parse_trade_notification() {
        let data = serde_json::json!({
            "trade_id": "BTC-123456",
            "instrument_name": "BTC-PERPETUAL",
            "timestamp": 1_700_000_000_000_i64,
            "price": 42500.5,
            "amount": 100.0,
            "direction": "buy"
        });
        let trade = parse_trade(&data).unwrap();
        assert_eq!(trade.instrument, "BTC-PERPETUAL");
        assert_eq!(trade.direction, Direction::Buy);
        assert!(trade.iv.is_none());
        assert!(trade.is_valid());
    }

    #[test]
    fn test_parse_option_trade_iv_is_fraction() {
        let data = serde_json::json!({
            "trade_id": "BTC-9",
            "instrument_name": "BTC-27MAR26-50000-C",
            "timestamp": 1_700_000_000_000_i64,
            "price": 0.042,
            "amount": 1.0,
            "direction": "sell",
            "iv": 65.2
        });
        let trade = parse_trade(&data).unwrap();
        assert!((trade.iv.unwrap() - 0.652).abs() < 1e-12);
    }

    #[test]
    fn test_parse_trade_rejects_bad_direction() {
        let data = serde_json::json!({
            "trade_id": "x",
            "instrument_name": "BTC-PERPETUAL",
            "timestamp": 0,
            "price": 1.0,
            "amount": 1.0,
            "direction": "liquidation?"
        });
        assert!(parse_trade(&data).is_none());
    }

    #[test]
    fn test_parse_ticker() {
        let data = serde_json::json!({
            "instrument_name": "BTC-27MAR26-50000-C",
            "timestamp": 1_700_000_000_000_i64,
            "mark_price": 0.055,
            "mark_iv": 62.5,
            "underlying_price": 43000.0,
            "bid_iv": 61.0,
            "ask_iv": 64.0,
            "best_bid_price": 0.054,
            "best_ask_price": 0.056,
            "open_interest": 1500.0,
            "stats": { "volume": 320.0 },
            "greeks": {
                "delta": 0.42, "gamma": 0.0001, "vega": 35.2,
                "theta": -18.5, "rho": 11.0
            }
        });
        let ticker = parse_ticker(&data).unwrap();
        assert!((ticker.mark_iv - 0.625).abs() < 1e-12);
        assert_eq!(ticker.underlying_price, 43000.0);
        assert_eq!(ticker.delta, 0.42);
        assert_eq!(ticker.volume, 320.0);
    }

    #[test]
    fn test_parse_ticker_without_greeks() {
        // Futures tickers carry no greeks block
        let data = serde_json::json!({
            "instrument_name": "BTC-PERPETUAL",
            "timestamp": 1_700_000_000_000_i64,
            "mark_price": 43000.0
        });
        let ticker = parse_ticker(&data).unwrap();
        assert_eq!(ticker.delta, 0.0);
        assert_eq!(ticker.underlying_price, 43000.0);
    }

    #[test]
    fn test_rest_instrument_conversion() {
        let raw = RestInstrument {
            instrument_name: "BTC-27MAR26-50000-C".to_string(),
            base_currency: "BTC".to_string(),
            kind: "option".to_string(),
            strike: Some(50000.0),
            option_type: Some("call".to_string()),
            expiration_timestamp: Some(1_774_598_400_000),
            contract_size: 1.0,
            is_active: true,
        };
        let instrument = DeribitRest::instrument_from_rest(raw).unwrap();
        assert_eq!(instrument.kind, InstrumentKind::Option);
        assert_eq!(instrument.strike, Some(50000.0));
        assert_eq!(
            instrument.option_type,
            Some(crate::pricing::OptionType::Call)
        );
    }

    #[test]
    fn test_rest_instrument_falls_back_to_name_parse() {
        let raw = RestInstrument {
            instrument_name: "BTC-27MAR26-50000-P".to_string(),
            base_currency: "BTC".to_string(),
            kind: "option".to_string(),
            strike: None,
            option_type: None,
            expiration_timestamp: None,
            contract_size: 1.0,
            is_active: true,
        };
        let instrument = DeribitRest::instrument_from_rest(raw).unwrap();
        assert_eq!(instrument.strike, Some(50000.0));
        assert_eq!(
            instrument.option_type,
            Some(crate::pricing::OptionType::Put)
        );
        assert!(instrument.expiry_ms.is_some());
    }

    #[test]
    fn test_rest_instrument_skips_spot() {
        let raw = RestInstrument {
            instrument_name: "BTC_USDC".to_string(),
            base_currency: "BTC".to_string(),
            kind: "spot".to_string(),
            strike: None,
            option_type: None,
            expiration_timestamp: None,
            contract_size: 1.0,
            is_active: true,
        };
        assert!(DeribitRest::instrument_from_rest(raw).is_none());
    }

    #[tokio::test]
    async fn test_message_loop_parses_trade_batch() {
        let (ws_tx, ws_rx) = mpsc::channel(10);
        let (tx, mut rx) = mpsc::channel::<Trade>(10);

        let handle = tokio::spawn(async move {
            DeribitFeed::run_message_loop(ws_rx, tx, |channel, data| {
                if !channel.starts_with("trades.") {
                    return Vec::new();
                }
                data.as_array()
                    .map(|items| items.iter().filter_map(parse_trade).collect())
                    .unwrap_or_default()
            })
            .await;
        });

        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "subscription",
            "params": {
                "channel": "trades.BTC-PERPETUAL.raw",
                "data": [
                    {
                        "trade_id": "1", "instrument_name": "BTC-PERPETUAL",
                        "timestamp": 1, "price": 100.0, "amount": 1.0,
                        "direction": "buy"
                    },
                    {
                        "trade_id": "2", "instrument_name": "BTC-PERPETUAL",
                        "timestamp": 2, "price": 101.0, "amount": 2.0,
                        "direction": "sell"
                    }
                ]
            }
        });
        ws_tx
            .send(WsMessage::Text(frame.to_string()))
            .await
            .unwrap();
        ws_tx.send(WsMessage::Text("not json".into())).await.unwrap();
        ws_tx.send(WsMessage::Disconnected).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.trade_id, "1");
        assert_eq!(second.trade_id, "2");
        assert!(rx.recv().await.is_none());
        handle.await.unwrap();
    }
}
