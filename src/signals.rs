use crate::models::{Candle, SignalAction};

pub const SHORT_WINDOW: usize = 5;
pub const LONG_WINDOW: usize = 10;
/// Fewer candles than this always score as `Hold`.
pub const MIN_CANDLES: usize = LONG_WINDOW;

/// Inputs the entry decision is made from, computed over the most recent closes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalMetrics {
    pub short_mean: f64,
    pub long_mean: f64,
    pub current_close: f64,
    pub previous_close: f64,
    pub momentum: f64,
}

impl SignalMetrics {
    pub fn from_candles(candles: &[Candle]) -> Option<Self> {
        let n = candles.len();
        if n < MIN_CANDLES {
            return None;
        }

        let short_mean = mean_close(&candles[n - SHORT_WINDOW..]);
        let long_mean = mean_close(&candles[n - LONG_WINDOW..]);
        let current_close = candles[n - 1].close;
        let previous_close = candles[n - 2].close;
        let momentum = current_close - candles[n - 3].close;

        Some(Self {
            short_mean,
            long_mean,
            current_close,
            previous_close,
            momentum,
        })
    }

    pub fn action(&self) -> SignalAction {
        if self.short_mean > self.long_mean
            && self.current_close > self.previous_close
            && self.momentum > 0.0
        {
            return SignalAction::Buy;
        }

        if self.short_mean < self.long_mean
            && self.current_close < self.previous_close
            && self.momentum < 0.0
        {
            return SignalAction::Sell;
        }

        SignalAction::Hold
    }
}

/// Scores an ordered candle window (oldest first) into a directional signal.
pub fn score(candles: &[Candle]) -> SignalAction {
    SignalMetrics::from_candles(candles)
        .map(|metrics| metrics.action())
        .unwrap_or(SignalAction::Hold)
}

fn mean_close(candles: &[Candle]) -> f64 {
    candles.iter().map(|c| c.close).sum::<f64>() / candles.len() as f64
}
