use crate::alpaca::deserialize_f64_opt;
use crate::config::{optional_setting, require_setting};
use crate::error::PortError;
use crate::models::{BrokerPosition, Direction, OrderOutcome};
use crate::ports::{AccountPort, OrderPort};
use crate::trading_rules::normalize_quantity;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const DEFAULT_LIVE_URL: &str = "https://live.trading212.com/api/v0";
const DEFAULT_DEMO_URL: &str = "https://demo.trading212.com/api/v0";
const US_EQUITY_SUFFIX: &str = "_US_EQ";

#[derive(Debug, Clone)]
pub struct Trading212Settings {
    pub api_key: String,
    pub base_url: String,
    pub ticker: Option<String>,
}

impl Trading212Settings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let api_key = require_setting(settings, "TRADING212_API_KEY")?.to_string();
        let base_url = match optional_setting(settings, "TRADING212_BASE_URL") {
            Some(url) => url.to_string(),
            None => {
                let environment =
                    optional_setting(settings, "TRADING212_ENVIRONMENT").unwrap_or("demo");
                match environment.to_ascii_lowercase().as_str() {
                    "live" => DEFAULT_LIVE_URL.to_string(),
                    "demo" => DEFAULT_DEMO_URL.to_string(),
                    other => {
                        return Err(anyhow!(
                            "TRADING212_ENVIRONMENT must be demo or live (value: {})",
                            other
                        ))
                    }
                }
            }
        };
        let ticker = optional_setting(settings, "TRADING212_TICKER").map(str::to_string);

        Ok(Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            ticker,
        })
    }
}

/// Trading 212 equity REST client. Serves the account and order ports; the
/// venue publishes no candle history.
#[derive(Clone)]
pub struct Trading212Client {
    http: Client,
    base_url: String,
    ticker: Option<String>,
    headers: HeaderMap,
}

impl Trading212Client {
    pub fn new(http: Client, settings: &Trading212Settings) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&settings.api_key).context("invalid Trading 212 API key")?,
        );

        Ok(Self {
            http,
            base_url: settings.base_url.clone(),
            ticker: settings.ticker.clone(),
            headers,
        })
    }

    /// Instrument ticker for `symbol`, e.g. `RGLD` becomes `RGLD_US_EQ`.
    pub fn ticker_for(&self, symbol: &str) -> String {
        match &self.ticker {
            Some(ticker) => ticker.clone(),
            None if symbol.contains('_') => symbol.to_string(),
            None => format!("{}{}", symbol, US_EQUITY_SUFFIX),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, PortError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(url)
            .headers(self.headers.clone())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PortError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response.json::<T>().await.map_err(|err| {
            PortError::Decode(format!("failed to parse Trading 212 response: {}", err))
        })
    }
}

#[async_trait]
impl AccountPort for Trading212Client {
    async fn free_cash(&self) -> Result<f64, PortError> {
        let cash: Trading212Cash = self.get("/equity/account/cash").await?;
        Ok(cash.free.unwrap_or(0.0).max(0.0))
    }

    async fn open_position(&self, symbol: &str) -> Result<Option<BrokerPosition>, PortError> {
        let ticker = self.ticker_for(symbol);
        let positions: Vec<Trading212Position> = self.get("/equity/portfolio").await?;
        let Some(entry) = positions
            .into_iter()
            .find(|entry| entry.ticker.as_deref() == Some(ticker.as_str()))
        else {
            return Ok(None);
        };

        let signed_quantity = entry.quantity.unwrap_or(0.0);
        if signed_quantity == 0.0 {
            return Ok(None);
        }
        let direction = if signed_quantity < 0.0 {
            Direction::Short
        } else {
            Direction::Long
        };

        Ok(Some(BrokerPosition {
            direction,
            quantity: signed_quantity.abs(),
            average_price: entry.average_price.unwrap_or(0.0),
            current_price: entry.current_price,
            unrealized_pnl: entry.ppl,
        }))
    }
}

#[async_trait]
impl OrderPort for Trading212Client {
    async fn submit_order(
        &self,
        symbol: &str,
        signed_quantity: f64,
    ) -> Result<OrderOutcome, PortError> {
        let request = Trading212MarketOrder {
            ticker: self.ticker_for(symbol),
            quantity: normalize_quantity(signed_quantity),
        };
        let url = format!("{}/equity/orders/market", self.base_url);
        let response = self
            .http
            .post(url)
            .headers(self.headers.clone())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY {
            let body = response.text().await.unwrap_or_default();
            return Ok(OrderOutcome::Rejected {
                reason: rejection_message(status, &body),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PortError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let order: Trading212Order = response.json().await.map_err(|err| {
            PortError::Decode(format!("failed to parse Trading 212 order: {}", err))
        })?;
        let order_status = order
            .status
            .as_deref()
            .map(|value| value.trim().to_ascii_lowercase())
            .unwrap_or_default();
        if matches!(order_status.as_str(), "rejected" | "cancelled" | "canceled") {
            return Ok(OrderOutcome::Rejected {
                reason: format!("order status {}", order_status),
            });
        }

        Ok(OrderOutcome::Accepted {
            order_id: order.id.map(|id| match id {
                serde_json::Value::String(value) => value,
                other => other.to_string(),
            }),
        })
    }
}

fn rejection_message(status: StatusCode, body: &str) -> String {
    let message = serde_json::from_str::<Trading212ErrorBody>(body)
        .ok()
        .and_then(|parsed| parsed.clarification.or(parsed.code))
        .unwrap_or_else(|| body.trim().to_string());
    format!("{} ({})", message, status.as_u16())
}

#[derive(Debug, Serialize)]
struct Trading212MarketOrder {
    ticker: String,
    quantity: f64,
}

#[derive(Debug, Deserialize)]
struct Trading212ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    clarification: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Trading212Cash {
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    free: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Trading212Position {
    #[serde(default)]
    ticker: Option<String>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    quantity: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    average_price: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    current_price: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_f64_opt")]
    ppl: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Trading212Order {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    status: Option<String>,
}
