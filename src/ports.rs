//! Narrow contracts the engine consumes from a broker gateway.
//!
//! Implementations report failures as [`PortError`]; choosing the safe
//! default for each failure is the engine's job, not the gateway's.

use crate::error::PortError;
use crate::models::{BrokerPosition, Candle, OrderOutcome};
use async_trait::async_trait;

#[async_trait]
pub trait MarketDataPort: Send + Sync {
    /// Most recent `count` candles for `symbol`, oldest first.
    async fn recent_candles(&self, symbol: &str, count: usize) -> Result<Vec<Candle>, PortError>;

    /// Latest traded price, when the venue publishes one.
    async fn latest_price(&self, symbol: &str) -> Result<Option<f64>, PortError>;
}

#[async_trait]
pub trait AccountPort: Send + Sync {
    async fn free_cash(&self) -> Result<f64, PortError>;

    async fn open_position(&self, symbol: &str) -> Result<Option<BrokerPosition>, PortError>;
}

#[async_trait]
pub trait OrderPort: Send + Sync {
    /// Submits a market order. Positive quantities buy, negative quantities sell.
    /// Callers submit at most once per decision; implementations must not retry.
    async fn submit_order(
        &self,
        symbol: &str,
        signed_quantity: f64,
    ) -> Result<OrderOutcome, PortError>;
}
