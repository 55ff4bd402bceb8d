// Public REST ticker used to drive paper trading with live prices

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::{ExchangeError, ExchangeResult};

#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn latest_price(&self, symbol: &str) -> ExchangeResult<f64>;
}

/// Kraken-style public ticker endpoint (`?pair=XBTUSD`)
pub struct RestTickerFeed {
    client: reqwest::Client,
    base_url: String,
}

impl RestTickerFeed {
    pub fn new(base_url: &str, request_timeout: Duration) -> ExchangeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ExchangeError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PriceFeed for RestTickerFeed {
    async fn latest_price(&self, symbol: &str) -> ExchangeResult<f64> {
        let url = format!("{}?pair={}", self.base_url, symbol);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if response.status().as_u16() == 429 {
            return Err(ExchangeError::RateLimited(format!("ticker {}", symbol)));
        }

        let data: Value = response.json().await.map_err(map_reqwest_error)?;
        parse_last_price(&data).ok_or_else(|| ExchangeError::NotFound(format!("no ticker for {}", symbol)))
    }
}

fn map_reqwest_error(err: reqwest::Error) -> ExchangeError {
    if err.is_timeout() {
        ExchangeError::Network(format!("timeout: {}", err))
    } else {
        ExchangeError::Network(err.to_string())
    }
}

/// Extract the last trade price from a ticker response
pub fn parse_last_price(data: &Value) -> Option<f64> {
    if let Some(errors) = data.get("error").and_then(|e| e.as_array()) {
        if !errors.is_empty() {
            return None;
        }
    }

    let ticker_data = data.get("result")?.as_object()?;
    let (_, ticker) = ticker_data.iter().next()?;
    let last = ticker.get("c")?.get(0)?.as_str()?;
    last.parse::<f64>().ok().filter(|p| *p > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_ticker_response() {
        let data = json!({
            "error": [],
            "result": {
                "XXBTZUSD": {
                    "a": ["97012.10000", "1", "1.000"],
                    "b": ["97012.00000", "2", "2.000"],
                    "c": ["97012.05000", "0.01"]
                }
            }
        });
        assert_eq!(parse_last_price(&data), Some(97012.05));
    }

    #[test]
    fn test_parse_error_response() {
        let data = json!({ "error": ["EQuery:Unknown asset pair"] });
        assert_eq!(parse_last_price(&data), None);
    }
}
