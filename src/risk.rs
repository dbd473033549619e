use crate::models::{ExitDecision, Position};

/// Numbers behind a single exit evaluation, kept for logging and the ledger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskAssessment {
    pub decision: ExitDecision,
    pub pnl: f64,
    pub best_possible_pnl: f64,
    pub take_profit_threshold: f64,
    pub stop_loss_threshold: f64,
}

/// Decides whether an open position should be closed at `current_price`.
///
/// The take-profit threshold scales with `take_profit_multiplier`; the stop-loss
/// threshold never does. A P&L exactly on either threshold closes. The position's
/// `extreme_price` is updated before the comparison so the closing tick counts
/// towards the best possible gain.
pub fn evaluate(
    position: &mut Position,
    current_price: f64,
    take_profit_multiplier: f64,
    base_risk_fraction: f64,
) -> RiskAssessment {
    position.observe_price(current_price);

    let entry_value = position.entry_value();
    let pnl = position.pnl_at(current_price);
    let stop_loss_threshold = entry_value * base_risk_fraction;
    let take_profit_threshold = stop_loss_threshold * take_profit_multiplier;

    let decision = if pnl >= take_profit_threshold {
        ExitDecision::TakeProfit
    } else if pnl <= -stop_loss_threshold {
        ExitDecision::StopLoss
    } else {
        ExitDecision::Hold
    };

    RiskAssessment {
        decision,
        pnl,
        best_possible_pnl: position.best_possible_pnl(),
        take_profit_threshold,
        stop_loss_threshold,
    }
}
