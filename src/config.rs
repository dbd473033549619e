use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_LEDGER_PATH: &str = "risk_state.json";
const DEFAULT_MARKET_HOURS: &str = "14:30-21:00";

/// Collects the process environment into a settings map.
pub fn settings_from_env() -> HashMap<String, String> {
    env::vars().collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    Alpaca,
    Trading212,
}

impl BrokerKind {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "alpaca" => Ok(Self::Alpaca),
            "trading212" | "t212" => Ok(Self::Trading212),
            other => Err(anyhow!(
                "BROKER must be alpaca or trading212 (value: {})",
                other
            )),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Alpaca => "Alpaca",
            Self::Trading212 => "Trading 212",
        }
    }
}

/// When the engine is allowed to touch the broker. Sessions are UTC and only
/// run Monday to Friday; `Always` is for instruments that trade around the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradingHours {
    Always,
    Weekdays { open: NaiveTime, close: NaiveTime },
}

impl TradingHours {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("always") || trimmed == "24/7" {
            return Ok(Self::Always);
        }

        let (open_raw, close_raw) = trimmed.split_once('-').ok_or_else(|| {
            anyhow!(
                "MARKET_HOURS must be HH:MM-HH:MM or always (value: {})",
                trimmed
            )
        })?;
        let parse_time = |value: &str| {
            NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|_| {
                anyhow!(
                    "MARKET_HOURS must be HH:MM-HH:MM or always (value: {})",
                    trimmed
                )
            })
        };
        let open = parse_time(open_raw)?;
        let close = parse_time(close_raw)?;
        if open == close {
            return Err(anyhow!(
                "MARKET_HOURS session must not be empty (value: {})",
                trimmed
            ));
        }

        Ok(Self::Weekdays { open, close })
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Always => true,
            Self::Weekdays { open, close } => {
                if matches!(now.weekday(), Weekday::Sat | Weekday::Sun) {
                    return false;
                }
                let time = now.time();
                if open < close {
                    time >= *open && time < *close
                } else {
                    time >= *open || time < *close
                }
            }
        }
    }
}

/// Everything the engine loop needs, parsed once at startup.
#[derive(Debug, Clone)]
pub struct TraderConfig {
    pub symbol: String,
    pub base_risk_fraction: f64,
    pub tick_interval: Duration,
    pub closed_market_interval: Duration,
    // Entry sizing
    pub capital_fraction: f64,
    pub max_trade_cap: f64,
    pub min_free_cash: f64,
    pub min_quantity: f64,
    pub quantity_step: f64,
    pub allow_short_selling: bool,

    pub candle_count: usize,
    pub port_timeout: Duration,
    /// How long an accepted order may go unreflected in the broker's position
    /// before the engine stops waiting for it.
    pub order_grace: Duration,
    pub ledger_path: PathBuf,
    pub trading_hours: TradingHours,
    pub broker: BrokerKind,
}

impl TraderConfig {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let symbol = require_setting(settings, "SYMBOL")?.to_uppercase();
        let base_risk_fraction =
            setting_positive_f64(settings, "BASE_RISK_FRACTION", 0.01, Some(1.0))?;
        let tick_interval = setting_secs(settings, "TICK_INTERVAL_SECS", 60)?;
        let closed_market_interval = setting_secs(settings, "CLOSED_MARKET_INTERVAL_SECS", 900)?;
        let capital_fraction = setting_positive_f64(settings, "CAPITAL_FRACTION", 0.1, Some(1.0))?;
        let max_trade_cap = setting_positive_f64(settings, "MAX_TRADE_CAP", 20.0, None)?;
        let min_free_cash = setting_f64(settings, "MIN_FREE_CASH", 10.0, Some(0.0), None)?;
        let min_quantity = setting_positive_f64(settings, "MIN_QUANTITY", 0.01, None)?;
        let quantity_step = setting_positive_f64(settings, "QUANTITY_STEP", 0.01, None)?;
        let allow_short_selling = setting_bool(settings, "ALLOW_SHORT_SELLING", true)?;
        let candle_count = setting_usize(
            settings,
            "CANDLE_COUNT",
            20,
            crate::signals::MIN_CANDLES,
        )?;
        let port_timeout = setting_secs(settings, "PORT_TIMEOUT_SECS", 10)?;
        let order_grace = setting_secs(settings, "ORDER_GRACE_SECS", 120)?;
        let ledger_path = optional_setting(settings, "LEDGER_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LEDGER_PATH));
        let trading_hours = TradingHours::parse(
            optional_setting(settings, "MARKET_HOURS").unwrap_or(DEFAULT_MARKET_HOURS),
        )?;
        let broker = BrokerKind::parse(optional_setting(settings, "BROKER").unwrap_or("alpaca"))?;

        Ok(Self {
            symbol,
            base_risk_fraction,
            tick_interval,
            closed_market_interval,
            capital_fraction,
            max_trade_cap,
            min_free_cash,
            min_quantity,
            quantity_step,
            allow_short_selling,
            candle_count,
            port_timeout,
            order_grace,
            ledger_path,
            trading_hours,
            broker,
        })
    }
}

pub(crate) fn optional_setting<'a>(
    settings: &'a HashMap<String, String>,
    key: &str,
) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

pub(crate) fn require_setting<'a>(
    settings: &'a HashMap<String, String>,
    key: &str,
) -> Result<&'a str> {
    optional_setting(settings, key).ok_or_else(|| anyhow!("Missing required setting {}", key))
}

fn setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(value)
}

fn setting_positive_f64(
    settings: &HashMap<String, String>,
    key: &str,
    default: f64,
    max: Option<f64>,
) -> Result<f64> {
    let value = setting_f64(settings, key, default, None, max)?;
    if value <= 0.0 {
        return Err(anyhow!("Setting {} must be > 0 (value: {})", key, value));
    }
    Ok(value)
}

fn setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<usize>()
        .map_err(|_| anyhow!("Setting {} must be an integer (value: {})", key, raw))?;
    if value < min {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value)
}

fn setting_secs(settings: &HashMap<String, String>, key: &str, default: u64) -> Result<Duration> {
    let secs = setting_usize(settings, key, default as usize, 1)?;
    Ok(Duration::from_secs(secs as u64))
}

fn setting_bool(settings: &HashMap<String, String>, key: &str, default: bool) -> Result<bool> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("Setting {} must be true or false (value: {})", key, raw)),
    }
}
