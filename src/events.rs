//! Broadcast event types
//!
//! Every derived artifact fans out through the hub as one tagged
//! record; the `type` field doubles as the subscription topic.

use crate::feed::{GreeksSnapshot, Trade};
use crate::filter::VolatilityEvent;
use crate::surface::SurfaceFit;
use crate::tracker::IvEvent;
use serde::{Deserialize, Serialize};

/// A broadcast event, tagged by kind
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastEvent {
    /// Raw trade on the filtered instrument
    Trade { timestamp_ms: i64, trade: Trade },
    /// Per-trade AR(1) volatility estimate while the filter is active
    VolatilityEstimate {
        timestamp_ms: i64,
        instrument: String,
        volatility: f64,
    },
    /// Threshold breach from the stream filter
    VolatilityEvent {
        timestamp_ms: i64,
        event: VolatilityEvent,
    },
    /// Trade on a tracked option
    OptionTrade { timestamp_ms: i64, trade: Trade },
    /// Fresh Greeks snapshot for a tracked option
    OptionGreeksUpdate {
        timestamp_ms: i64,
        snapshot: GreeksSnapshot,
    },
    /// Full chain snapshot rebuilt
    OptionChainUpdate {
        timestamp_ms: i64,
        underlying: String,
        n_instruments: usize,
        n_tracked: usize,
    },
    /// A new volatility surface fit
    IvSurfaceUpdate {
        timestamp_ms: i64,
        fit: SurfaceFit,
    },
    /// IV anomaly or jump on a tracked option
    OptionVolatilityEvent {
        timestamp_ms: i64,
        event: IvEvent,
    },
}

impl BroadcastEvent {
    /// Subscription topic; matches the serialized `type` tag
    pub fn topic(&self) -> &'static str {
        match self {
            BroadcastEvent::Trade { .. } => "trade",
            BroadcastEvent::VolatilityEstimate { .. } => "volatility_estimate",
            BroadcastEvent::VolatilityEvent { .. } => "volatility_event",
            BroadcastEvent::OptionTrade { .. } => "option_trade",
            BroadcastEvent::OptionGreeksUpdate { .. } => "option_greeks_update",
            BroadcastEvent::OptionChainUpdate { .. } => "option_chain_update",
            BroadcastEvent::IvSurfaceUpdate { .. } => "iv_surface_update",
            BroadcastEvent::OptionVolatilityEvent { .. } => "option_volatility_event",
        }
    }

    pub fn timestamp_ms(&self) -> i64 {
        match self {
            BroadcastEvent::Trade { timestamp_ms, .. }
            | BroadcastEvent::VolatilityEstimate { timestamp_ms, .. }
            | BroadcastEvent::VolatilityEvent { timestamp_ms, .. }
            | BroadcastEvent::OptionTrade { timestamp_ms, .. }
            | BroadcastEvent::OptionGreeksUpdate { timestamp_ms, .. }
            | BroadcastEvent::OptionChainUpdate { timestamp_ms, .. }
            | BroadcastEvent::IvSurfaceUpdate { timestamp_ms, .. }
            | BroadcastEvent::OptionVolatilityEvent { timestamp_ms, .. } => *timestamp_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches_serialized_tag() {
        let event = BroadcastEvent::VolatilityEstimate {
            timestamp_ms: 1_700_000_000_000,
            instrument: "BTC-PERPETUAL".to_string(),
            volatility: 0.012,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"volatility_estimate""#));
        assert_eq!(event.topic(), "volatility_estimate");
    }

    #[test]
    fn test_chain_update_round_trip() {
        let event = BroadcastEvent::OptionChainUpdate {
            timestamp_ms: 42,
            underlying: "BTC".to_string(),
            n_instruments: 120,
            n_tracked: 48,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: BroadcastEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.topic(), "option_chain_update");
        assert_eq!(back.timestamp_ms(), 42);
    }
}
