use crate::config::TraderConfig;
use crate::error::PortError;
use crate::ledger::{LedgerSnapshot, RiskState, TradeLedger};
use crate::models::{
    BrokerPosition, Direction, ExitDecision, OrderOutcome, PendingOrder, Position, TradeOutcome,
    TradeRecord,
};
use crate::ports::{AccountPort, MarketDataPort, OrderPort};
use crate::risk;
use crate::signals::{self, SignalMetrics};
use crate::trading_rules::{determine_entry_size, EntrySizingOutcome, EntrySizingParams};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    NoPosition,
    PositionOpen,
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    MarketClosed,
    /// A port failure left the tick without enough information to act.
    Skipped { reason: String },
    Held,
    NoSignal,
    InsufficientCash { free_cash: f64 },
    Opened {
        direction: Direction,
        quantity: f64,
        price: f64,
    },
    EntryRejected { reason: String },
    /// An earlier order is not reflected in the broker's position yet.
    /// `resubmitted` is set when a refused close was sent again this tick.
    AwaitingFill { resubmitted: bool },
    Closed {
        decision: ExitDecision,
        record: TradeRecord,
        close_confirmed: bool,
    },
}

/// Single-instrument, single-slot trading loop.
///
/// Owns the tracked [`Position`] and the [`RiskState`]; both are only touched
/// from `tick`, one tick at a time.
///
/// A trade is booked exactly once, when the engine decides to close it. If the
/// broker keeps reporting that exposure afterwards, it is remembered as a
/// pending close and flattened again without booking another trade.
pub struct Engine {
    config: TraderConfig,
    market: Box<dyn MarketDataPort>,
    account: Box<dyn AccountPort>,
    orders: Box<dyn OrderPort>,
    ledger: TradeLedger,
    risk_state: RiskState,
    position: Option<Position>,
    pending_entry: Option<PendingOrder>,
    pending_close: Option<PendingOrder>,
}

impl Engine {
    pub fn new(
        config: TraderConfig,
        market: Box<dyn MarketDataPort>,
        account: Box<dyn AccountPort>,
        orders: Box<dyn OrderPort>,
        ledger: TradeLedger,
    ) -> Self {
        let LedgerSnapshot {
            risk_state,
            open_position,
            pending_entry,
            pending_close,
        } = ledger.load_or_default();
        if let Some(position) = &open_position {
            info!(
                "Restored tracked {} position in {}: {} @ {:.4}",
                position.direction().as_str(),
                config.symbol,
                position.entry_quantity(),
                position.entry_price()
            );
        }
        if let Some(pending) = &pending_close {
            info!(
                "Restored pending close of {} {} x{}",
                pending.direction.as_str(),
                config.symbol,
                pending.quantity
            );
        }

        Self {
            config,
            market,
            account,
            orders,
            ledger,
            risk_state,
            position: open_position,
            pending_entry,
            pending_close,
        }
    }

    pub fn state(&self) -> EngineState {
        if self.position.is_some() {
            EngineState::PositionOpen
        } else {
            EngineState::NoPosition
        }
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn risk_state(&self) -> &RiskState {
        &self.risk_state
    }

    /// Runs ticks until the process is terminated.
    pub async fn run(&mut self) {
        info!(
            "Starting trading loop for {} (tick every {}s, multiplier {:.2}, {} closed trade(s))",
            self.config.symbol,
            self.config.tick_interval.as_secs(),
            self.risk_state.take_profit_multiplier,
            self.risk_state.history.len()
        );
        loop {
            let outcome = self.tick().await;
            let pause = match outcome {
                TickOutcome::MarketClosed => self.config.closed_market_interval,
                _ => self.config.tick_interval,
            };
            sleep(pause).await;
        }
    }

    pub async fn tick(&mut self) -> TickOutcome {
        self.tick_at(Utc::now()).await
    }

    pub async fn tick_at(&mut self, now: DateTime<Utc>) -> TickOutcome {
        if !self.config.trading_hours.is_open(now) {
            debug!("Market closed at {}; skipping tick", now);
            return TickOutcome::MarketClosed;
        }

        let symbol = self.config.symbol.clone();
        let broker_position =
            match with_timeout(self.config.port_timeout, self.account.open_position(&symbol))
                .await
            {
                Ok(position) => position,
                Err(err) => {
                    warn!("Failed to fetch open position for {}: {}", symbol, err);
                    return TickOutcome::Skipped {
                        reason: format!("position lookup failed: {}", err),
                    };
                }
            };

        if let Some(outcome) = self.reconcile(broker_position.as_ref(), now).await {
            return outcome;
        }

        match self.position.take() {
            Some(position) => {
                self.manage_position(position, broker_position.as_ref(), now)
                    .await
            }
            None => self.seek_entry(now).await,
        }
    }

    /// Aligns the tracked position with what the broker reports. The broker
    /// decides whether a position is open; the tracked copy only contributes
    /// entry and extreme bookkeeping. Returns an outcome when the tick should
    /// end here.
    async fn reconcile(
        &mut self,
        broker_position: Option<&BrokerPosition>,
        now: DateTime<Utc>,
    ) -> Option<TickOutcome> {
        if self.pending_close.is_some() {
            if let Some(outcome) = self.settle_close(broker_position, now).await {
                return Some(outcome);
            }
        }

        let tracked = self
            .position
            .as_ref()
            .map(|position| (position.direction(), position.entry_quantity()));
        match (tracked, broker_position) {
            (Some((direction, quantity)), Some(reported)) if direction == reported.direction => {
                if (quantity - reported.quantity).abs() > 1e-9 {
                    debug!(
                        "Broker reports {} units of {} while {} are tracked",
                        reported.quantity, self.config.symbol, quantity
                    );
                }
                if self.pending_entry.take().is_some() {
                    debug!("Entry order for {} is now filled", self.config.symbol);
                    self.persist();
                }
                None
            }
            (_, Some(reported)) => {
                let Some(entry_price) = reported.estimated_entry_price() else {
                    let reason = format!(
                        "Broker reports an untracked {} position in {} without a usable price",
                        reported.direction.as_str(),
                        self.config.symbol
                    );
                    warn!("{}", reason);
                    return Some(TickOutcome::Skipped { reason });
                };
                if reported.quantity <= 0.0 || !reported.quantity.is_finite() {
                    let reason = format!(
                        "Broker reports an invalid quantity {} for {}",
                        reported.quantity, self.config.symbol
                    );
                    warn!("{}", reason);
                    return Some(TickOutcome::Skipped { reason });
                }

                warn!(
                    "Adopting untracked {} position in {}: {} @ {:.4}",
                    reported.direction.as_str(),
                    self.config.symbol,
                    reported.quantity,
                    entry_price
                );
                self.position = Some(Position::open(
                    reported.direction,
                    entry_price,
                    reported.quantity,
                    now,
                ));
                self.pending_entry = None;
                self.persist();
                None
            }
            (Some((direction, _)), None) => {
                let entry_pending = self
                    .pending_entry
                    .as_ref()
                    .map(|pending| self.within_grace(pending, now));
                if let Some(within_grace) = entry_pending {
                    if within_grace {
                        debug!(
                            "Waiting for the {} entry order in {} to show up",
                            direction.as_str(),
                            self.config.symbol
                        );
                        return Some(TickOutcome::AwaitingFill { resubmitted: false });
                    }
                    warn!(
                        "Entry order for {} never showed up in the broker position; dropping it",
                        self.config.symbol
                    );
                    self.position = None;
                    self.pending_entry = None;
                    self.persist();
                    return Some(TickOutcome::Skipped {
                        reason: format!("entry order for {} was not filled", self.config.symbol),
                    });
                }

                warn!(
                    "Tracked {} position in {} is no longer reported by the broker; dropping it",
                    direction.as_str(),
                    self.config.symbol
                );
                self.position = None;
                self.persist();
                None
            }
            (None, None) => None,
        }
    }

    /// Follows up on an exposure whose trade is already booked. Returns `None`
    /// once the broker no longer holds it.
    async fn settle_close(
        &mut self,
        broker_position: Option<&BrokerPosition>,
        now: DateTime<Utc>,
    ) -> Option<TickOutcome> {
        let pending = self.pending_close.clone()?;
        let Some(reported) =
            broker_position.filter(|reported| reported.direction == pending.direction)
        else {
            info!(
                "Close of {} {} settled",
                pending.direction.as_str(),
                self.config.symbol
            );
            self.pending_close = None;
            self.persist();
            return None;
        };

        if pending.accepted && self.within_grace(&pending, now) {
            debug!(
                "Waiting for the close of {} {} to fill",
                pending.direction.as_str(),
                self.config.symbol
            );
            return Some(TickOutcome::AwaitingFill { resubmitted: false });
        }

        warn!(
            "Broker still holds {} {} x{} after its trade was booked; sending the close again",
            reported.direction.as_str(),
            self.config.symbol,
            reported.quantity
        );
        let accepted = self
            .submit_close(reported.direction.closing_quantity(reported.quantity))
            .await;
        self.pending_close = Some(PendingOrder {
            direction: reported.direction,
            quantity: reported.quantity,
            submitted_at: now,
            accepted,
        });
        self.persist();
        Some(TickOutcome::AwaitingFill { resubmitted: true })
    }

    fn within_grace(&self, pending: &PendingOrder, now: DateTime<Utc>) -> bool {
        let elapsed = (now - pending.submitted_at).to_std().unwrap_or_default();
        elapsed < self.config.order_grace
    }

    async fn manage_position(
        &mut self,
        mut position: Position,
        broker_position: Option<&BrokerPosition>,
        now: DateTime<Utc>,
    ) -> TickOutcome {
        let reported_price = broker_position
            .and_then(|reported| reported.current_price)
            .filter(|price| price.is_finite() && *price > 0.0);
        let price = match reported_price {
            Some(price) => Some(price),
            None => self.latest_price().await,
        };
        let Some(price) = price else {
            warn!(
                "No current price for {}; holding position this tick",
                self.config.symbol
            );
            self.position = Some(position);
            return TickOutcome::Held;
        };

        let previous_extreme = position.extreme_price();
        let assessment = risk::evaluate(
            &mut position,
            price,
            self.risk_state.take_profit_multiplier,
            self.config.base_risk_fraction,
        );
        info!(
            "{} {} @ {:.4}: P&L {:.2} (take profit {:.2}, stop loss -{:.2}, best {:.2})",
            position.direction().as_str(),
            self.config.symbol,
            price,
            assessment.pnl,
            assessment.take_profit_threshold,
            assessment.stop_loss_threshold,
            assessment.best_possible_pnl
        );

        let Some(outcome) = assessment.decision.outcome() else {
            let extreme_moved = position.extreme_price() != previous_extreme;
            self.position = Some(position);
            if extreme_moved {
                self.persist();
            }
            return TickOutcome::Held;
        };

        self.close_position(position, price, assessment.decision, outcome, now)
            .await
    }

    async fn close_position(
        &mut self,
        position: Position,
        price: f64,
        decision: ExitDecision,
        outcome: TradeOutcome,
        now: DateTime<Utc>,
    ) -> TickOutcome {
        let symbol = self.config.symbol.clone();
        let close_confirmed = self.submit_close(position.closing_quantity()).await;

        let record = TradeRecord::from_close(&position, price, outcome, now);
        let previous_multiplier = self.risk_state.take_profit_multiplier;
        let tuning = self.risk_state.record_trade(record.clone());
        info!(
            "Closed {} {} on {}: realized {:.2}, best possible {:.2}, multiplier {:.2} -> {:.2} ({})",
            position.direction().as_str(),
            symbol,
            decision.as_str(),
            record.realized_pnl,
            record.best_possible_pnl,
            previous_multiplier,
            tuning.multiplier,
            tuning.adjustment.as_str()
        );
        info!(
            "Record: {} wins, {} losses, cumulative P&L {:.2}",
            self.risk_state.wins, self.risk_state.losses, self.risk_state.cumulative_pnl
        );

        self.position = None;
        self.pending_entry = None;
        self.pending_close = Some(PendingOrder {
            direction: position.direction(),
            quantity: position.entry_quantity(),
            submitted_at: now,
            accepted: close_confirmed,
        });
        self.persist();

        TickOutcome::Closed {
            decision,
            record,
            close_confirmed,
        }
    }

    async fn seek_entry(&mut self, now: DateTime<Utc>) -> TickOutcome {
        let symbol = self.config.symbol.clone();
        let candles = match with_timeout(
            self.config.port_timeout,
            self.market.recent_candles(&symbol, self.config.candle_count),
        )
        .await
        {
            Ok(candles) => candles,
            Err(err) => {
                warn!("Failed to fetch candles for {}: {}", symbol, err);
                Vec::new()
            }
        };

        let signal = signals::score(&candles);
        match SignalMetrics::from_candles(&candles) {
            Some(metrics) => debug!(
                "{} signal {}: short mean {:.4}, long mean {:.4}, close {:.4}, previous {:.4}, momentum {:.4}",
                symbol,
                signal.as_str(),
                metrics.short_mean,
                metrics.long_mean,
                metrics.current_close,
                metrics.previous_close,
                metrics.momentum
            ),
            None => debug!(
                "{} signal {}: only {} candle(s) available",
                symbol,
                signal.as_str(),
                candles.len()
            ),
        }

        let Some(direction) = signal.entry_direction() else {
            return TickOutcome::NoSignal;
        };
        if direction == Direction::Short && !self.config.allow_short_selling {
            info!("Ignoring sell signal for {}: short selling disabled", symbol);
            return TickOutcome::NoSignal;
        }

        let free_cash = match with_timeout(self.config.port_timeout, self.account.free_cash()).await
        {
            Ok(cash) if cash.is_finite() => cash,
            Ok(cash) => {
                warn!("Broker reported non-finite free cash {}", cash);
                0.0
            }
            Err(err) => {
                warn!("Failed to fetch free cash: {}", err);
                0.0
            }
        };
        info!("{} signal for {}; free cash {:.2}", signal.as_str(), symbol, free_cash);
        if free_cash < self.config.min_free_cash {
            return TickOutcome::InsufficientCash { free_cash };
        }

        let last_close = candles.last().map(|candle| candle.close);
        let Some(price) = self.latest_price().await.or(last_close) else {
            return TickOutcome::Skipped {
                reason: format!("no price available for {}", symbol),
            };
        };

        let allocation = match determine_entry_size(EntrySizingParams {
            price,
            free_cash,
            capital_fraction: self.config.capital_fraction,
            max_trade_cap: self.config.max_trade_cap,
            min_quantity: self.config.min_quantity,
            quantity_step: self.config.quantity_step,
        }) {
            EntrySizingOutcome::Sized(allocation) => allocation,
            EntrySizingOutcome::InsufficientCash { required } => {
                info!(
                    "Skipping {} entry: needs {:.2}, free cash {:.2}",
                    symbol, required, free_cash
                );
                return TickOutcome::InsufficientCash { free_cash };
            }
            EntrySizingOutcome::TooSmall => {
                return TickOutcome::Skipped {
                    reason: format!("entry size too small at price {}", price),
                };
            }
        };

        let signed_quantity = direction.opening_quantity(allocation.quantity);
        info!(
            "Opening {} {} x{} @ ~{:.4} ({:.2})",
            direction.as_str(),
            symbol,
            allocation.quantity,
            price,
            allocation.trade_value
        );
        match with_timeout(
            self.config.port_timeout,
            self.orders.submit_order(&symbol, signed_quantity),
        )
        .await
        {
            Ok(OrderOutcome::Accepted { order_id }) => {
                info!(
                    "Entry order for {} accepted ({})",
                    symbol,
                    order_id.as_deref().unwrap_or("no id")
                );
                self.position = Some(Position::open(direction, price, allocation.quantity, now));
                self.pending_entry = Some(PendingOrder {
                    direction,
                    quantity: allocation.quantity,
                    submitted_at: now,
                    accepted: true,
                });
                self.persist();
                TickOutcome::Opened {
                    direction,
                    quantity: allocation.quantity,
                    price,
                }
            }
            Ok(OrderOutcome::Rejected { reason }) => {
                warn!("Entry order for {} rejected: {}", symbol, reason);
                TickOutcome::EntryRejected { reason }
            }
            Err(err) => {
                warn!("Entry order for {} failed: {}", symbol, err);
                TickOutcome::EntryRejected {
                    reason: err.to_string(),
                }
            }
        }
    }

    /// Sends a flattening order once. Returns whether the broker accepted it.
    async fn submit_close(&self, quantity: f64) -> bool {
        let symbol = &self.config.symbol;
        match with_timeout(self.config.port_timeout, self.orders.submit_order(symbol, quantity)).await
        {
            Ok(OrderOutcome::Accepted { order_id }) => {
                info!(
                    "Close order for {} {} accepted ({})",
                    quantity,
                    symbol,
                    order_id.as_deref().unwrap_or("no id")
                );
                true
            }
            Ok(OrderOutcome::Rejected { reason }) => {
                warn!("Close order for {} {} rejected: {}", quantity, symbol, reason);
                false
            }
            Err(err) => {
                warn!("Close order for {} {} failed: {}", quantity, symbol, err);
                false
            }
        }
    }

    async fn latest_price(&self) -> Option<f64> {
        match with_timeout(
            self.config.port_timeout,
            self.market.latest_price(&self.config.symbol),
        )
        .await
        {
            Ok(price) => price.filter(|price| price.is_finite() && *price > 0.0),
            Err(err) => {
                warn!("Failed to fetch price for {}: {}", self.config.symbol, err);
                None
            }
        }
    }

    fn persist(&self) {
        let snapshot = LedgerSnapshot {
            risk_state: self.risk_state.clone(),
            open_position: self.position.clone(),
            pending_entry: self.pending_entry.clone(),
            pending_close: self.pending_close.clone(),
        };
        if let Err(err) = self.ledger.save(&snapshot) {
            warn!(
                "Failed to write trade ledger {}: {}",
                self.ledger.path().display(),
                err
            );
        }
    }
}

async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, PortError>
where
    F: Future<Output = Result<T, PortError>>,
{
    match timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(PortError::Timeout(limit)),
    }
}
