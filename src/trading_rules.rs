pub const PRICE_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub struct EntryAllocation {
    pub quantity: f64,
    pub trade_value: f64,
}

#[derive(Debug, PartialEq)]
pub enum EntrySizingOutcome {
    Sized(EntryAllocation),
    TooSmall,
    InsufficientCash { required: f64 },
}

pub struct EntrySizingParams {
    pub price: f64,
    pub free_cash: f64,
    pub capital_fraction: f64,
    pub max_trade_cap: f64,
    pub min_quantity: f64,
    pub quantity_step: f64,
}

/// Converts a capped cash allocation into an order quantity.
///
/// The allocation is `min(free_cash * capital_fraction, max_trade_cap)`. The
/// quantity is floored to a multiple of `quantity_step` and raised to
/// `min_quantity` when the allocation buys less than that.
pub fn determine_entry_size(params: EntrySizingParams) -> EntrySizingOutcome {
    let EntrySizingParams {
        price,
        free_cash,
        capital_fraction,
        max_trade_cap,
        min_quantity,
        quantity_step,
    } = params;

    if price <= 0.0 || !price.is_finite() || !free_cash.is_finite() {
        return EntrySizingOutcome::TooSmall;
    }

    let allocation = (free_cash.max(0.0) * capital_fraction.max(0.0)).min(max_trade_cap.max(0.0));
    let mut quantity = floor_to_step(allocation / price, quantity_step);

    if quantity + PRICE_EPSILON < min_quantity {
        quantity = min_quantity;
    }
    if quantity <= 0.0 {
        return EntrySizingOutcome::TooSmall;
    }

    let trade_value = quantity * price;
    if trade_value > free_cash + PRICE_EPSILON {
        return EntrySizingOutcome::InsufficientCash {
            required: trade_value,
        };
    }

    EntrySizingOutcome::Sized(EntryAllocation {
        quantity,
        trade_value,
    })
}

/// Strips binary noise from an order quantity before it goes on the wire.
pub fn normalize_quantity(quantity: f64) -> f64 {
    (quantity * 1e9).round() / 1e9
}

fn floor_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 || !step.is_finite() {
        return value.max(0.0);
    }
    // The epsilon keeps 0.3 / 0.1 from flooring to 2 steps.
    let steps = (value / step + PRICE_EPSILON).floor().max(0.0);
    let decimals = step_decimals(step);
    let factor = 10f64.powi(decimals);
    (steps * step * factor).round() / factor
}

fn step_decimals(step: f64) -> i32 {
    let mut decimals = 0;
    let mut scaled = step;
    while decimals < 10 && (scaled - scaled.round()).abs() > 1e-9 {
        scaled *= 10.0;
        decimals += 1;
    }
    decimals
}
