//! Fixed-capacity rolling windows

use crate::feed::Trade;
use std::collections::VecDeque;

/// Ring buffer of the most recent items, oldest evicted first
#[derive(Debug, Clone)]
pub struct RollingWindow<T> {
    capacity: usize,
    items: VecDeque<T>,
}

impl<T> RollingWindow<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity),
        }
    }

    /// Append an item, evicting the oldest when at capacity
    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn back(&self) -> Option<&T> {
        self.items.back()
    }
}

/// Log-returns between consecutive trade prices, capacity-aligned with
/// the trade window
#[derive(Debug, Clone)]
pub struct ReturnsWindow {
    window: RollingWindow<f64>,
    last_price: Option<f64>,
}

impl ReturnsWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: RollingWindow::new(capacity),
            last_price: None,
        }
    }

    /// Observe a trade; returns the log-return it produced, if any.
    /// Non-positive prices are ignored (contract violation handled
    /// upstream; this keeps ln() defined).
    pub fn observe(&mut self, trade: &Trade) -> Option<f64> {
        let price = trade.price_f64();
        if price <= 0.0 {
            return None;
        }
        let ret = self.last_price.map(|prev| (price / prev).ln());
        self.last_price = Some(price);
        if let Some(r) = ret {
            self.window.push(r);
        }
        ret
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Returns in arrival order, oldest first
    pub fn as_vec(&self) -> Vec<f64> {
        self.window.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::Direction;
    use rust_decimal::Decimal;

    fn trade(i: i64, price: &str) -> Trade {
        Trade {
            timestamp_ms: 1_700_000_000_000 + i * 1000,
            instrument: "BTC-PERPETUAL".to_string(),
            price: price.parse::<Decimal>().unwrap(),
            amount: Decimal::ONE,
            direction: Direction::Buy,
            trade_id: format!("t-{}", i),
            iv: None,
        }
    }

    #[test]
    fn test_rolling_window_eviction() {
        let mut window = RollingWindow::new(3);
        for i in 0..5 {
            window.push(i);
        }
        assert_eq!(window.len(), 3);
        let items: Vec<_> = window.iter().copied().collect();
        assert_eq!(items, vec![2, 3, 4]);
    }

    #[test]
    fn test_rolling_window_never_exceeds_capacity() {
        let mut window = RollingWindow::new(20);
        for i in 0..1000 {
            window.push(i);
            assert!(window.len() <= 20);
        }
        assert_eq!(*window.back().unwrap(), 999);
    }

    #[test]
    fn test_returns_need_two_prices() {
        let mut returns = ReturnsWindow::new(10);
        assert!(returns.observe(&trade(0, "100")).is_none());
        let r = returns.observe(&trade(1, "101")).unwrap();
        assert!((r - (101.0f64 / 100.0).ln()).abs() < 1e-12);
        assert_eq!(returns.len(), 1);
    }

    #[test]
    fn test_returns_alignment() {
        let mut returns = ReturnsWindow::new(10);
        for (i, p) in ["100", "100.1", "99.9", "100.2"].iter().enumerate() {
            returns.observe(&trade(i as i64, p));
        }
        // n trades -> n-1 returns
        assert_eq!(returns.len(), 3);
    }
}
