use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }

    /// Signed order quantity that opens `quantity` units in this direction.
    pub fn opening_quantity(&self, quantity: f64) -> f64 {
        match self {
            Direction::Long => quantity.abs(),
            Direction::Short => -quantity.abs(),
        }
    }

    /// Signed order quantity that flattens `quantity` units held in this direction.
    pub fn closing_quantity(&self, quantity: f64) -> f64 {
        -self.opening_quantity(quantity)
    }

    fn is_more_favorable(&self, candidate: f64, current: f64) -> bool {
        match self {
            Direction::Long => candidate > current,
            Direction::Short => candidate < current,
        }
    }
}

/// The engine's belief about its single open exposure.
///
/// Entry fields are fixed at open; only `extreme_price` moves afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Position {
    direction: Direction,
    entry_price: f64,
    entry_quantity: f64,
    extreme_price: f64,
    opened_at: DateTime<Utc>,
}

impl Position {
    pub fn open(
        direction: Direction,
        entry_price: f64,
        entry_quantity: f64,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            direction,
            entry_price,
            entry_quantity: entry_quantity.abs(),
            extreme_price: entry_price,
            opened_at,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn entry_price(&self) -> f64 {
        self.entry_price
    }

    pub fn entry_quantity(&self) -> f64 {
        self.entry_quantity
    }

    pub fn extreme_price(&self) -> f64 {
        self.extreme_price
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn entry_value(&self) -> f64 {
        self.entry_quantity * self.entry_price
    }

    pub fn pnl_at(&self, price: f64) -> f64 {
        match self.direction {
            Direction::Long => self.entry_quantity * (price - self.entry_price),
            Direction::Short => self.entry_quantity * (self.entry_price - price),
        }
    }

    /// Unrealized P&L at the most favorable price seen since entry.
    pub fn best_possible_pnl(&self) -> f64 {
        self.pnl_at(self.extreme_price)
    }

    /// Ratchets `extreme_price` towards the favorable side. Never moves it back.
    pub fn observe_price(&mut self, price: f64) {
        if price.is_finite() && self.direction.is_more_favorable(price, self.extreme_price) {
            self.extreme_price = price;
        }
    }

    pub fn closing_quantity(&self) -> f64 {
        self.direction.closing_quantity(self.entry_quantity)
    }
}

/// Open exposure as reported by the broker's account endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerPosition {
    pub direction: Direction,
    pub quantity: f64,
    pub average_price: f64,
    pub current_price: Option<f64>,
    pub unrealized_pnl: Option<f64>,
}

impl BrokerPosition {
    /// Best available entry price for a position the engine did not open.
    ///
    /// Prefers the broker's average entry price. Without one, the entry is
    /// backed out of the current price and unrealized P&L, and as a last
    /// resort the current price itself is used.
    pub fn estimated_entry_price(&self) -> Option<f64> {
        let usable = |price: f64| price.is_finite() && price > 0.0;
        if usable(self.average_price) {
            return Some(self.average_price);
        }
        let current = self.current_price.filter(|price| usable(*price))?;
        let derived = self
            .unrealized_pnl
            .filter(|pnl| pnl.is_finite() && self.quantity > 0.0)
            .map(|pnl| match self.direction {
                Direction::Long => current - pnl / self.quantity,
                Direction::Short => current + pnl / self.quantity,
            })
            .filter(|price| usable(*price));
        Some(derived.unwrap_or(current))
    }
}

/// An order the broker accepted (or refused) whose effect does not show in the
/// reported position yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingOrder {
    /// Direction of the exposure being opened or flattened.
    pub direction: Direction,
    pub quantity: f64,
    pub submitted_at: DateTime<Utc>,
    pub accepted: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeOutcome {
    Win,
    Loss,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeRecord {
    pub outcome: TradeOutcome,
    pub direction: Direction,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub realized_pnl: f64,
    pub best_possible_pnl: f64,
    pub closed_at: DateTime<Utc>,
}

impl TradeRecord {
    /// Builds the record for a close. The outcome follows the evaluator's branch
    /// rather than the sign of `realized_pnl`.
    pub fn from_close(
        position: &Position,
        exit_price: f64,
        outcome: TradeOutcome,
        closed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            outcome,
            direction: position.direction(),
            entry_price: position.entry_price(),
            exit_price,
            quantity: position.entry_quantity(),
            realized_pnl: position.pnl_at(exit_price),
            best_possible_pnl: position.best_possible_pnl(),
            closed_at,
        }
    }

    pub fn is_win(&self) -> bool {
        self.outcome == TradeOutcome::Win
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "buy",
            SignalAction::Sell => "sell",
            SignalAction::Hold => "hold",
        }
    }

    pub fn entry_direction(&self) -> Option<Direction> {
        match self {
            SignalAction::Buy => Some(Direction::Long),
            SignalAction::Sell => Some(Direction::Short),
            SignalAction::Hold => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    Hold,
    TakeProfit,
    StopLoss,
}

impl ExitDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitDecision::Hold => "hold",
            ExitDecision::TakeProfit => "take_profit",
            ExitDecision::StopLoss => "stop_loss",
        }
    }

    pub fn outcome(&self) -> Option<TradeOutcome> {
        match self {
            ExitDecision::Hold => None,
            ExitDecision::TakeProfit => Some(TradeOutcome::Win),
            ExitDecision::StopLoss => Some(TradeOutcome::Loss),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderOutcome {
    Accepted { order_id: Option<String> },
    Rejected { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extreme_price_ratchets_per_direction() {
        let mut long = Position::open(Direction::Long, 100.0, 2.0, Utc::now());
        long.observe_price(104.0);
        long.observe_price(101.0);
        assert_eq!(long.extreme_price(), 104.0);
        assert!((long.best_possible_pnl() - 8.0).abs() < 1e-9);

        let mut short = Position::open(Direction::Short, 100.0, 2.0, Utc::now());
        short.observe_price(97.0);
        short.observe_price(99.0);
        short.observe_price(f64::NAN);
        assert_eq!(short.extreme_price(), 97.0);
        assert!((short.best_possible_pnl() - 6.0).abs() < 1e-9);
    }

    #[test]
    fn closing_quantity_flattens_position() {
        let long = Position::open(Direction::Long, 10.0, 3.0, Utc::now());
        assert_eq!(long.closing_quantity(), -3.0);
        let short = Position::open(Direction::Short, 10.0, 3.0, Utc::now());
        assert_eq!(short.closing_quantity(), 3.0);
        assert_eq!(Direction::Short.opening_quantity(1.5), -1.5);
    }

    #[test]
    fn entry_estimate_falls_back_to_unrealized_pnl() {
        let mut reported = BrokerPosition {
            direction: Direction::Long,
            quantity: 2.0,
            average_price: 50.0,
            current_price: Some(51.0),
            unrealized_pnl: Some(2.0),
        };
        assert_eq!(reported.estimated_entry_price(), Some(50.0));

        reported.average_price = 0.0;
        assert_eq!(reported.estimated_entry_price(), Some(50.0));

        reported.direction = Direction::Short;
        assert_eq!(reported.estimated_entry_price(), Some(52.0));

        reported.unrealized_pnl = None;
        assert_eq!(reported.estimated_entry_price(), Some(51.0));

        reported.current_price = None;
        assert_eq!(reported.estimated_entry_price(), None);
    }

    #[test]
    fn trade_record_outcome_comes_from_decision() {
        let position = Position::open(Direction::Long, 100.0, 1.0, Utc::now());
        let record = TradeRecord::from_close(&position, 99.5, TradeOutcome::Win, Utc::now());
        assert!(record.is_win());
        assert!(record.realized_pnl < 0.0);
        assert_eq!(ExitDecision::StopLoss.outcome(), Some(TradeOutcome::Loss));
        assert_eq!(ExitDecision::Hold.outcome(), None);
    }
}
