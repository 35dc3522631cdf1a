//! Trade — a single print from the exchange's trade archive.

use serde::{Deserialize, Serialize};

/// Relative tolerance for `quote_qty ≈ price × quantity`.
const QUOTE_QTY_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: u64,
    pub price: f64,
    pub quantity: f64,
    pub quote_qty: f64,
    /// Epoch milliseconds.
    pub time: i64,
    pub is_buyer_maker: bool,
}

impl Trade {
    pub fn is_sane(&self) -> bool {
        self.price > 0.0 && self.quantity > 0.0 && self.quote_qty_consistent()
    }

    /// Whether the recorded quote quantity matches `price × quantity`.
    pub fn quote_qty_consistent(&self) -> bool {
        let expected = self.price * self.quantity;
        (self.quote_qty - expected).abs() <= expected.abs() * QUOTE_QTY_TOLERANCE
    }
}
