use crate::config::{optional_setting, require_setting};
use crate::error::PortError;
use crate::models::{BrokerPosition, Candle, Direction, OrderOutcome};
use crate::ports::{AccountPort, MarketDataPort, OrderPort};
use crate::trading_rules::normalize_quantity;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::de::{self, DeserializeOwned, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

const ALPACA_PAPER_URL_SETTING: &str = "ALPACA_PAPER_URL";
const ALPACA_LIVE_URL_SETTING: &str = "ALPACA_LIVE_URL";
const ALPACA_DATA_URL_SETTING: &str = "ALPACA_DATA_URL";
const DEFAULT_PAPER_URL: &str = "https://paper-api.alpaca.markets/v2";
const DEFAULT_LIVE_URL: &str = "https://api.alpaca.markets/v2";
const DEFAULT_DATA_URL: &str = "https://data.alpaca.markets/v2";
const DEFAULT_BAR_TIMEFRAME: &str = "1Min";
// Far enough back to span a long weekend when asking for the latest bars.
const BAR_LOOKBACK_DAYS: i64 = 5;

#[derive(Debug, Clone)]
pub struct AlpacaSettings {
    pub api_key: String,
    pub api_secret: String,
    pub base_url: String,
    pub data_url: String,
    pub bar_timeframe: String,
}

impl AlpacaSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let api_key = require_setting(settings, "ALPACA_API_KEY_ID")?.to_string();
        let api_secret = require_setting(settings, "ALPACA_API_SECRET_KEY")?.to_string();
        let environment = optional_setting(settings, "ALPACA_ENVIRONMENT").unwrap_or("paper");
        let base_url = resolve_alpaca_base_url(environment, settings)?;
        let data_url = optional_setting(settings, ALPACA_DATA_URL_SETTING)
            .unwrap_or(DEFAULT_DATA_URL)
            .trim_end_matches('/')
            .to_string();
        let bar_timeframe = optional_setting(settings, "ALPACA_BAR_TIMEFRAME")
            .unwrap_or(DEFAULT_BAR_TIMEFRAME)
            .to_string();

        Ok(Self {
            api_key,
            api_secret,
            base_url,
            data_url,
            bar_timeframe,
        })
    }
}

/// Alpaca trading and market data REST client. Serves all three ports.
#[derive(Clone)]
pub struct AlpacaClient {
    http: Client,
    base_url: String,
    data_url: String,
    bar_timeframe: String,
    headers: HeaderMap,
}

impl AlpacaClient {
    pub fn new(http: Client, settings: &AlpacaSettings) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "APCA-API-KEY-ID",
            HeaderValue::from_str(&settings.api_key).context("invalid Alpaca API key")?,
        );
        headers.insert(
            "APCA-API-SECRET-KEY",
            HeaderValue::from_str(&settings.api_secret).context("invalid Alpaca API secret")?,
        );

        Ok(Self {
            http,
            base_url: settings.base_url.clone(),
            data_url: settings.data_url.clone(),
            bar_timeframe: settings.bar_timeframe.clone(),
            headers,
        })
    }

    async fn get<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, PortError> {
        let response = self
            .http
            .get(url)
            .headers(self.headers.clone())
            .query(query)
            .send()
            .await?;
        let response = ensure_success(response).await?;
        decode_json(response).await
    }

    async fn get_optional<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>, PortError> {
        let response = self
            .http
            .get(url)
            .headers(self.headers.clone())
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = ensure_success(response).await?;
        decode_json(response).await.map(Some)
    }
}

#[async_trait]
impl MarketDataPort for AlpacaClient {
    async fn recent_candles(&self, symbol: &str, count: usize) -> Result<Vec<Candle>, PortError> {
        let url = format!("{}/stocks/{}/bars", self.data_url, symbol);
        let start = (Utc::now() - ChronoDuration::days(BAR_LOOKBACK_DAYS)).to_rfc3339();
        let query = [
            ("timeframe", self.bar_timeframe.clone()),
            ("limit", count.to_string()),
            ("sort", "desc".to_string()),
            ("start", start),
        ];
        let payload: AlpacaBars = self.get(&url, &query).await?;

        let mut candles: Vec<Candle> = payload
            .bars
            .unwrap_or_default()
            .into_iter()
            .filter_map(AlpacaBar::into_candle)
            .collect();
        candles.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        if candles.len() > count {
            candles.drain(..candles.len() - count);
        }
        debug!("Fetched {} bar(s) for {}", candles.len(), symbol);
        Ok(candles)
    }

    async fn latest_price(&self, symbol: &str) -> Result<Option<f64>, PortError> {
        let url = format!("{}/stocks/{}/trades/latest", self.data_url, symbol);
        let payload: Option<AlpacaLatestTrade> = self.get_optional(&url).await?;
        Ok(payload
            .and_then(|latest| latest.trade)
            .and_then(|trade| trade.price))
    }
}

#[async_trait]
impl AccountPort for AlpacaClient {
    async fn free_cash(&self) -> Result<f64, PortError> {
        let url = format!("{}/account", self.base_url);
        let account: AlpacaAccount = self.get(&url, &[]).await?;
        Ok(account.cash.unwrap_or(0.0).max(0.0))
    }

    async fn open_position(&self, symbol: &str) -> Result<Option<BrokerPosition>, PortError> {
        let url = format!("{}/positions/{}", self.base_url, symbol);
        let Some(entry) = self.get_optional::<AlpacaPosition>(&url).await? else {
            return Ok(None);
        };

        let quantity = entry.qty.unwrap_or(0.0).abs();
        if quantity <= 0.0 {
            return Ok(None);
        }
        let side = normalize_side(entry.side.as_deref()).unwrap_or_else(|| "long".to_string());
        let direction = if side == "short" {
            Direction::Short
        } else {
            Direction::Long
        };

        Ok(Some(BrokerPosition {
            direction,
            quantity,
            average_price: entry.avg_entry_price.unwrap_or(0.0),
            current_price: entry.current_price,
            unrealized_pnl: entry.unrealized_pl,
        }))
    }
}

#[async_trait]
impl OrderPort for AlpacaClient {
    async fn submit_order(
        &self,
        symbol: &str,
        signed_quantity: f64,
    ) -> Result<OrderOutcome, PortError> {
        let side = if signed_quantity >= 0.0 { "buy" } else { "sell" };
        let request = AlpacaOrderRequest {
            symbol: symbol.to_string(),
            qty: normalize_quantity(signed_quantity.abs()).to_string(),
            side: side.to_string(),
            order_type: "market".to_string(),
            time_in_force: "day".to_string(),
            client_order_id: Uuid::new_v4().to_string(),
        };

        let url = format!("{}/orders", self.base_url);
        let response = self
            .http
            .post(url)
            .headers(self.headers.clone())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::FORBIDDEN || status == StatusCode::UNPROCESSABLE_ENTITY {
            let body = response.text().await.unwrap_or_default();
            return Ok(OrderOutcome::Rejected {
                reason: rejection_message(status, &body),
            });
        }

        let response = ensure_success(response).await?;
        let order: AlpacaOrder = decode_json(response).await?;
        let order_status = order.normalized_status();
        if is_rejected_status(&order_status) {
            return Ok(OrderOutcome::Rejected {
                reason: format!("order status {}", order_status),
            });
        }

        Ok(OrderOutcome::Accepted {
            order_id: order.id.or(Some(request.client_order_id)),
        })
    }
}

fn resolve_alpaca_base_url(
    environment: &str,
    settings: &HashMap<String, String>,
) -> Result<String> {
    let environment = environment.trim().to_ascii_lowercase();
    let (setting_key, default_url) = match environment.as_str() {
        "live" => (ALPACA_LIVE_URL_SETTING, DEFAULT_LIVE_URL),
        "paper" => (ALPACA_PAPER_URL_SETTING, DEFAULT_PAPER_URL),
        other => {
            return Err(anyhow!(
                "ALPACA_ENVIRONMENT must be paper or live (value: {})",
                other
            ))
        }
    };
    Ok(optional_setting(settings, setting_key)
        .unwrap_or(default_url)
        .trim_end_matches('/')
        .to_string())
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, PortError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(PortError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn decode_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, PortError> {
    response
        .json::<T>()
        .await
        .map_err(|err| PortError::Decode(format!("failed to parse Alpaca response: {}", err)))
}

fn rejection_message(status: StatusCode, body: &str) -> String {
    let message = serde_json::from_str::<AlpacaErrorBody>(body)
        .ok()
        .and_then(|parsed| parsed.message)
        .unwrap_or_else(|| body.trim().to_string());
    format!("{} ({})", message, status.as_u16())
}

#[derive(Debug, Serialize)]
struct AlpacaOrderRequest {
    symbol: String,
    qty: String,
    side: String,
    #[serde(rename = "type")]
    order_type: String,
    time_in_force: String,
    client_order_id: String,
}

#[derive(Debug, Deserialize)]
struct AlpacaErrorBody {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AlpacaAccount {
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    cash: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct AlpacaPosition {
    #[serde(default)]
    side: Option<String>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    qty: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    avg_entry_price: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    current_price: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    unrealized_pl: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct AlpacaOrder {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

impl AlpacaOrder {
    fn normalized_status(&self) -> String {
        self.status
            .as_deref()
            .unwrap_or("unknown")
            .trim()
            .to_lowercase()
    }
}

#[derive(Debug, Deserialize)]
struct AlpacaBars {
    #[serde(default)]
    bars: Option<Vec<AlpacaBar>>,
}

#[derive(Debug, Deserialize)]
struct AlpacaBar {
    #[serde(default)]
    t: Option<String>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    o: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    h: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    l: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    c: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    v: Option<f64>,
}

impl AlpacaBar {
    fn into_candle(self) -> Option<Candle> {
        let timestamp = parse_timestamp(self.t.as_deref())?;
        let close = self.c.filter(|value| value.is_finite())?;
        Some(Candle {
            timestamp,
            open: self.o.unwrap_or(close),
            high: self.h.unwrap_or(close),
            low: self.l.unwrap_or(close),
            close,
            volume: self.v.unwrap_or(0.0),
        })
    }
}

#[derive(Debug, Deserialize)]
struct AlpacaLatestTrade {
    #[serde(default)]
    trade: Option<AlpacaTrade>,
}

#[derive(Debug, Deserialize)]
struct AlpacaTrade {
    #[serde(rename = "p", default, deserialize_with = "deserialize_f64_opt")]
    price: Option<f64>,
}

pub(crate) fn deserialize_f64_opt<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    struct F64OptVisitor;

    impl<'de> Visitor<'de> for F64OptVisitor {
        type Value = Option<f64>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a number or string")
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(value))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(value as f64))
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(value as f64))
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value.trim().parse::<f64>().ok())
        }

        fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(value.trim().parse::<f64>().ok())
        }
    }

    deserializer.deserialize_any(F64OptVisitor)
}

fn normalize_side(value: Option<&str>) -> Option<String> {
    value
        .map(|side| side.trim().to_lowercase())
        .filter(|side| !side.is_empty())
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|value| {
        DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

fn is_rejected_status(status: &str) -> bool {
    matches!(
        status,
        "canceled" | "cancelled" | "expired" | "rejected" | "stopped" | "suspended"
    )
}
