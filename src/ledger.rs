//! Durable trade ledger: the adaptive risk parameters, the closed-trade
//! history and the tracked open position, kept in one JSON document.
//!
//! The document is rewritten in full on every change. Writes go to a sibling
//! temporary file which is then renamed over the ledger, so a reader (or a
//! restarted process) only ever sees a complete document.

use crate::error::LedgerError;
use crate::models::{PendingOrder, Position, TradeOutcome, TradeRecord};
use crate::tuner::{self, Tuning, MAX_MULTIPLIER, MIN_MULTIPLIER};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const INITIAL_MULTIPLIER: f64 = 1.0;

fn initial_multiplier() -> f64 {
    INITIAL_MULTIPLIER
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskState {
    #[serde(default = "initial_multiplier")]
    pub take_profit_multiplier: f64,
    #[serde(default)]
    pub wins: u64,
    #[serde(default)]
    pub losses: u64,
    #[serde(default)]
    pub cumulative_pnl: f64,
    #[serde(default)]
    pub history: Vec<TradeRecord>,
}

impl Default for RiskState {
    fn default() -> Self {
        Self {
            take_profit_multiplier: INITIAL_MULTIPLIER,
            wins: 0,
            losses: 0,
            cumulative_pnl: 0.0,
            history: Vec::new(),
        }
    }
}

impl RiskState {
    /// Appends a closed trade, updates the counters and retunes the
    /// take-profit multiplier exactly once.
    pub fn record_trade(&mut self, record: TradeRecord) -> Tuning {
        match record.outcome {
            TradeOutcome::Win => self.wins += 1,
            TradeOutcome::Loss => self.losses += 1,
        }
        self.cumulative_pnl += record.realized_pnl;
        self.history.push(record);

        let tuning = tuner::retune(self);
        self.take_profit_multiplier = tuning.multiplier;
        tuning
    }

    fn sanitize(&mut self) {
        if !self.take_profit_multiplier.is_finite() {
            self.take_profit_multiplier = INITIAL_MULTIPLIER;
        }
        self.take_profit_multiplier = self
            .take_profit_multiplier
            .clamp(MIN_MULTIPLIER, MAX_MULTIPLIER);
    }
}

/// Everything that survives a restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LedgerSnapshot {
    #[serde(flatten)]
    pub risk_state: RiskState,
    #[serde(default)]
    pub open_position: Option<Position>,
    /// Entry order for `open_position` that the broker has not reported yet.
    #[serde(default)]
    pub pending_entry: Option<PendingOrder>,
    /// Exposure whose trade is already booked but which the broker still holds.
    #[serde(default)]
    pub pending_close: Option<PendingOrder>,
}

pub struct TradeLedger {
    path: PathBuf,
}

impl TradeLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the ledger. Returns `Ok(None)` when no ledger has been written yet.
    pub fn load(&self) -> Result<Option<LedgerSnapshot>, LedgerError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(LedgerError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let mut snapshot: LedgerSnapshot = serde_json::from_str(&raw)?;
        snapshot.risk_state.sanitize();
        Ok(Some(snapshot))
    }

    /// Reads the ledger, falling back to a fresh state when it is missing or unreadable.
    pub fn load_or_default(&self) -> LedgerSnapshot {
        match self.load() {
            Ok(Some(snapshot)) => {
                info!(
                    "Loaded trade ledger from {}: {} trade(s), multiplier {:.2}",
                    self.path.display(),
                    snapshot.risk_state.history.len(),
                    snapshot.risk_state.take_profit_multiplier
                );
                snapshot
            }
            Ok(None) => {
                info!(
                    "No trade ledger at {}; starting with default risk state",
                    self.path.display()
                );
                LedgerSnapshot::default()
            }
            Err(err) => {
                warn!(
                    "Failed to read trade ledger {}: {}. Starting with default risk state",
                    self.path.display(),
                    err
                );
                LedgerSnapshot::default()
            }
        }
    }

    /// Overwrites the ledger with `snapshot`.
    pub fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), LedgerError> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        let tmp_path = self.temp_path();
        let io_err = |source| LedgerError::Io {
            path: tmp_path.clone(),
            source,
        };

        let mut file = fs::File::create(&tmp_path).map_err(io_err)?;
        file.write_all(&json).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        fs::rename(&tmp_path, &self.path).map_err(|source| LedgerError::Io {
            path: self.path.clone(),
            source,
        })
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".tmp");
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;
    use chrono::{TimeZone, Utc};

    fn closed_trade(outcome: TradeOutcome, realized_pnl: f64) -> TradeRecord {
        TradeRecord {
            outcome,
            direction: Direction::Long,
            entry_price: 100.0,
            exit_price: 100.0 + realized_pnl,
            quantity: 1.0,
            realized_pnl,
            best_possible_pnl: realized_pnl.max(0.0) * 3.0,
            closed_at: Utc.with_ymd_and_hms(2024, 5, 6, 15, 30, 0).unwrap(),
        }
    }

    #[test]
    fn record_trade_updates_counters() {
        let mut state = RiskState::default();
        state.record_trade(closed_trade(TradeOutcome::Win, 4.0));
        state.record_trade(closed_trade(TradeOutcome::Loss, -1.5));
        assert_eq!(state.wins, 1);
        assert_eq!(state.losses, 1);
        assert!((state.cumulative_pnl - 2.5).abs() < 1e-9);
        assert_eq!(state.take_profit_multiplier, 1.0);

        let tuning = state.record_trade(closed_trade(TradeOutcome::Win, 2.0));
        assert_eq!(state.history.len(), 3);
        assert_eq!(state.take_profit_multiplier, tuning.multiplier);
    }

    #[test]
    fn save_and_load_reproduce_state() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = TradeLedger::new(dir.path().join("risk_state.json"));

        let mut snapshot = LedgerSnapshot::default();
        for idx in 0..7 {
            let outcome = if idx % 3 == 0 {
                TradeOutcome::Loss
            } else {
                TradeOutcome::Win
            };
            let pnl = if outcome == TradeOutcome::Win { 1.25 } else { -0.75 };
            snapshot.risk_state.record_trade(closed_trade(outcome, pnl));
        }
        snapshot.open_position = Some(Position::open(
            Direction::Short,
            42.5,
            0.3,
            Utc.with_ymd_and_hms(2024, 5, 7, 14, 45, 0).unwrap(),
        ));
        snapshot.pending_close = Some(PendingOrder {
            direction: Direction::Long,
            quantity: 0.2,
            submitted_at: Utc.with_ymd_and_hms(2024, 5, 7, 14, 40, 0).unwrap(),
            accepted: false,
        });

        ledger.save(&snapshot).unwrap();
        let loaded = ledger.load().unwrap().unwrap();

        assert_eq!(loaded.risk_state.wins, snapshot.risk_state.wins);
        assert_eq!(loaded.risk_state.losses, snapshot.risk_state.losses);
        assert_eq!(
            loaded.risk_state.cumulative_pnl,
            snapshot.risk_state.cumulative_pnl
        );
        assert_eq!(
            loaded.risk_state.take_profit_multiplier,
            snapshot.risk_state.take_profit_multiplier
        );
        assert_eq!(loaded, snapshot);
        assert!(!ledger.temp_path().exists());
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = TradeLedger::new(dir.path().join("absent.json"));
        assert!(ledger.load().unwrap().is_none());
        assert_eq!(ledger.load_or_default(), LedgerSnapshot::default());
    }

    #[test]
    fn corrupt_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("risk_state.json");
        fs::write(&path, "{not json").unwrap();
        let ledger = TradeLedger::new(&path);
        assert!(matches!(ledger.load(), Err(LedgerError::Json(_))));
        assert_eq!(ledger.load_or_default(), LedgerSnapshot::default());
    }

    #[test]
    fn persisted_layout_uses_flat_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("risk_state.json");
        let ledger = TradeLedger::new(&path);
        let mut snapshot = LedgerSnapshot::default();
        snapshot
            .risk_state
            .record_trade(closed_trade(TradeOutcome::Win, 3.0));
        ledger.save(&snapshot).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["take_profit_multiplier"], 1.0);
        assert_eq!(value["wins"], 1);
        assert_eq!(value["history"][0]["outcome"], "WIN");
        assert!(value["open_position"].is_null());
    }

    #[test]
    fn out_of_range_multiplier_is_clamped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("risk_state.json");
        fs::write(&path, r#"{"take_profit_multiplier": 9.0, "wins": 2}"#).unwrap();
        let loaded = TradeLedger::new(&path).load().unwrap().unwrap();
        assert_eq!(loaded.risk_state.take_profit_multiplier, MAX_MULTIPLIER);
        assert_eq!(loaded.risk_state.wins, 2);
        assert!(loaded.risk_state.history.is_empty());
        assert!(loaded.pending_entry.is_none());
        assert!(loaded.pending_close.is_none());
    }

    #[test]
    fn save_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = TradeLedger::new(dir.path().join("missing").join("risk_state.json"));
        assert!(matches!(
            ledger.save(&LedgerSnapshot::default()),
            Err(LedgerError::Io { .. })
        ));
    }
}
