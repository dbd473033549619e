use crate::ledger::RiskState;
use crate::models::TradeRecord;

/// Below this many closed trades the multiplier is left alone.
pub const MIN_HISTORY: usize = 3;
/// Only the most recent trades feed the controller.
pub const RECENT_WINDOW: usize = 10;
pub const MIN_MULTIPLIER: f64 = 0.5;
pub const MAX_MULTIPLIER: f64 = 3.0;
pub const RAISE_STEP: f64 = 0.10;
pub const LOWER_STEP: f64 = 0.05;
/// Winners whose best possible gain averages more than this multiple of the
/// realized gain were closed too early.
pub const LEFT_ON_TABLE_RATIO: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuningAdjustment {
    InsufficientHistory,
    NoRecentWins,
    LeavingProfitOnTable,
    LossesOutnumberWins,
    Unchanged,
}

impl TuningAdjustment {
    pub fn as_str(&self) -> &'static str {
        match self {
            TuningAdjustment::InsufficientHistory => "insufficient_history",
            TuningAdjustment::NoRecentWins => "no_recent_wins",
            TuningAdjustment::LeavingProfitOnTable => "leaving_profit_on_table",
            TuningAdjustment::LossesOutnumberWins => "losses_outnumber_wins",
            TuningAdjustment::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tuning {
    pub multiplier: f64,
    pub adjustment: TuningAdjustment,
}

/// Recomputes the take-profit multiplier from the state's trade history.
pub fn retune(state: &RiskState) -> Tuning {
    tune(state.take_profit_multiplier, &state.history)
}

/// Discrete-step controller over the last [`RECENT_WINDOW`] trades.
pub fn tune(current: f64, history: &[TradeRecord]) -> Tuning {
    if history.len() < MIN_HISTORY {
        return Tuning {
            multiplier: current,
            adjustment: TuningAdjustment::InsufficientHistory,
        };
    }

    let recent = &history[history.len().saturating_sub(RECENT_WINDOW)..];
    let wins: Vec<&TradeRecord> = recent.iter().filter(|record| record.is_win()).collect();
    let losses = recent.len() - wins.len();

    if wins.is_empty() {
        return Tuning {
            multiplier: lower(current),
            adjustment: TuningAdjustment::NoRecentWins,
        };
    }

    let win_count = wins.len() as f64;
    let avg_best = wins.iter().map(|r| r.best_possible_pnl).sum::<f64>() / win_count;
    let avg_actual = wins.iter().map(|r| r.realized_pnl).sum::<f64>() / win_count;

    if avg_best > LEFT_ON_TABLE_RATIO * avg_actual {
        return Tuning {
            multiplier: raise(current),
            adjustment: TuningAdjustment::LeavingProfitOnTable,
        };
    }

    if losses > wins.len() {
        return Tuning {
            multiplier: lower(current),
            adjustment: TuningAdjustment::LossesOutnumberWins,
        };
    }

    Tuning {
        multiplier: current,
        adjustment: TuningAdjustment::Unchanged,
    }
}

fn raise(current: f64) -> f64 {
    round_multiplier(current + RAISE_STEP).min(MAX_MULTIPLIER)
}

fn lower(current: f64) -> f64 {
    round_multiplier(current - LOWER_STEP).max(MIN_MULTIPLIER)
}

// Keeps repeated steps from accumulating binary rounding noise in the ledger.
fn round_multiplier(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
