//! Domain types for market data records.

pub mod kline;
pub mod timeframe;
pub mod trade;

pub use kline::Kline;
pub use timeframe::{DataKind, Timeframe, UnknownDataKind, UnsupportedTimeframe};
pub use trade::Trade;
