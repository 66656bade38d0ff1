use std::time::Duration as StdDuration;

use aegis_config::secrets::LiveExchangeSecrets;
use aegis_execution::{Balances, ExecutionBackend, ExecutionError, PlaceOrderRequest};
use aegis_money::{Amount, Qty};
use aegis_schemas::{OrderReceipt, OrderRef, Side};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::signing::sign;

pub struct LiveBroker {
    client: reqwest::Client,
    base_url: String,
    secrets: LiveExchangeSecrets,
    last_request_at: Mutex<Option<DateTime<Utc>>>,
    min_request_interval: chrono::Duration,
    poll_interval: StdDuration,
    max_poll_attempts: u32,
    max_retries: u32,
}

impl LiveBroker {
    pub fn new(base_url: impl Into<String>, secrets: LiveExchangeSecrets) -> Self {
        LiveBroker {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            secrets,
            last_request_at: Mutex::new(None),
            min_request_interval: chrono::Duration::milliseconds(100),
            poll_interval: StdDuration::from_millis(250),
            max_poll_attempts: 20,
            max_retries: 3,
        }
    }

    async fn throttle(&self) {
        let mut last = self.last_request_at.lock().await;
        if let Some(previous) = *last {
            let elapsed = Utc::now() - previous;
            if elapsed < self.min_request_interval {
                let remaining = (self.min_request_interval - elapsed)
                    .to_std()
                    .unwrap_or(StdDuration::from_millis(0));
                tokio::time::sleep(remaining).await;
            }
        }
        *last = Some(Utc::now());
    }

    fn sign_query(&self, query: &str) -> String {
        sign(self.secrets.api_secret.expose(), query)
    }

    /// Runs `attempt`, retrying only on the two retryable failure kinds
    /// (§4.5: "retries only for RateLimited/Unavailable"), up to
    /// `max_retries` times with the backend's own advised backoff.
    async fn with_retries<T, F, Fut>(&self, attempt: F) -> Result<T, ExecutionError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ExecutionError>>,
    {
        let mut last_err = None;
        for _ in 0..=self.max_retries {
            self.throttle().await;
            match attempt().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() => {
                    let backoff = match &e {
                        ExecutionError::RateLimited { retry_after } => {
                            retry_after.to_std().unwrap_or(StdDuration::from_secs(1))
                        }
                        _ => StdDuration::from_millis(250),
                    };
                    last_err = Some(e);
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(ExecutionError::Unavailable("retries exhausted".to_string())))
    }

    async fn map_response(resp: reqwest::Response) -> Result<serde_json::Value, ExecutionError> {
        let status = resp.status();
        let retry_after_header = resp
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok());
        let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
        classify_response(status, retry_after_header, body)
    }
}

/// Pure status-code/body classification, split out from `map_response` so
/// it is testable without a live HTTP round trip.
fn classify_response(
    status: StatusCode,
    retry_after_header: Option<i64>,
    body: serde_json::Value,
) -> Result<serde_json::Value, ExecutionError> {
    match status {
        StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED => Ok(body),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ExecutionError::AuthFailed),
        StatusCode::TOO_MANY_REQUESTS => Err(ExecutionError::RateLimited {
            retry_after: chrono::Duration::seconds(retry_after_header.unwrap_or(1)),
        }),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            let code = body.get("error_code").and_then(|v| v.as_str()).unwrap_or("");
            if code.eq_ignore_ascii_case("INSUFFICIENT_FUNDS") {
                Err(ExecutionError::InsufficientFunds)
            } else {
                let message = body
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("order rejected by exchange")
                    .to_string();
                Err(ExecutionError::Rejected(message))
            }
        }
        s if s.is_server_error() => Err(ExecutionError::Unavailable(format!("exchange returned {s}"))),
        s => Err(ExecutionError::Rejected(format!("unexpected status {s}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_carries_retry_after_header() {
        let err = classify_response(StatusCode::TOO_MANY_REQUESTS, Some(7), serde_json::Value::Null).unwrap_err();
        assert_eq!(err, ExecutionError::RateLimited { retry_after: chrono::Duration::seconds(7) });
        assert!(err.is_retryable());
    }

    #[test]
    fn insufficient_funds_is_recognized_by_error_code() {
        let body = serde_json::json!({"error_code": "INSUFFICIENT_FUNDS"});
        let err = classify_response(StatusCode::BAD_REQUEST, None, body).unwrap_err();
        assert_eq!(err, ExecutionError::InsufficientFunds);
        assert!(!err.is_retryable());
    }

    #[test]
    fn other_bad_request_bodies_are_rejected_with_message() {
        let body = serde_json::json!({"message": "symbol not tradeable"});
        let err = classify_response(StatusCode::BAD_REQUEST, None, body).unwrap_err();
        assert_eq!(err, ExecutionError::Rejected("symbol not tradeable".to_string()));
    }

    #[test]
    fn unauthorized_maps_to_auth_failed() {
        let err = classify_response(StatusCode::UNAUTHORIZED, None, serde_json::Value::Null).unwrap_err();
        assert_eq!(err, ExecutionError::AuthFailed);
    }

    #[test]
    fn server_error_is_retryable_unavailable() {
        let err = classify_response(StatusCode::BAD_GATEWAY, None, serde_json::Value::Null).unwrap_err();
        assert!(err.is_retryable());
    }
}

#[derive(Deserialize)]
struct OrderAck {
    order_id: String,
}

#[derive(Deserialize)]
struct OrderStatusDto {
    status: String,
    filled_quantity_raw: i64,
    average_fill_price_cents: i64,
    fee_cents: i64,
}

#[derive(Deserialize)]
struct AccountDto {
    available_cash_cents: i64,
}

#[derive(Deserialize)]
struct OpenOrderDto {
    order_id: String,
    client_order_id: String,
    symbol: String,
}

const TERMINAL_STATUSES: &[&str] = &["FILLED", "CANCELED", "REJECTED"];

#[async_trait]
impl ExecutionBackend for LiveBroker {
    fn name(&self) -> &'static str {
        "live"
    }

    async fn place_market_order(&self, req: PlaceOrderRequest) -> Result<OrderReceipt, ExecutionError> {
        let accepted_at = Utc::now();
        let side_str = match req.side {
            Side::Long => "BUY",
            Side::Short => "SELL",
        };
        let ack: OrderAck = self
            .with_retries(|| async {
                let timestamp = Utc::now().timestamp_millis();
                let query = format!(
                    "symbol={}&side={}&quantity={}&clientOrderId={}&timestamp={}",
                    req.instrument.as_str(),
                    side_str,
                    req.quantity.raw(),
                    req.client_order_id,
                    timestamp
                );
                let signature = self.sign_query(&query);
                let resp = self
                    .client
                    .post(format!("{}/order?{query}&signature={signature}", self.base_url))
                    .header("X-API-KEY", self.secrets.api_key.expose())
                    .send()
                    .await
                    .map_err(|e| ExecutionError::Unavailable(e.to_string()))?;
                let body = Self::map_response(resp).await?;
                serde_json::from_value::<OrderAck>(body)
                    .map_err(|e| ExecutionError::Rejected(format!("malformed order ack: {e}")))
            })
            .await?;

        // §4.5: wait for terminal order state before acknowledging.
        for _ in 0..self.max_poll_attempts {
            let status: OrderStatusDto = self
                .with_retries(|| async {
                    let timestamp = Utc::now().timestamp_millis();
                    let query = format!("orderId={}&timestamp={}", ack.order_id, timestamp);
                    let signature = self.sign_query(&query);
                    let resp = self
                        .client
                        .get(format!("{}/order?{query}&signature={signature}", self.base_url))
                        .header("X-API-KEY", self.secrets.api_key.expose())
                        .send()
                        .await
                        .map_err(|e| ExecutionError::Unavailable(e.to_string()))?;
                    let body = Self::map_response(resp).await?;
                    serde_json::from_value::<OrderStatusDto>(body)
                        .map_err(|e| ExecutionError::Rejected(format!("malformed order status: {e}")))
                })
                .await?;

            if TERMINAL_STATUSES.contains(&status.status.as_str()) {
                if status.status == "REJECTED" {
                    return Err(ExecutionError::Rejected("exchange rejected the order".to_string()));
                }
                return Ok(OrderReceipt {
                    backend_order_id: ack.order_id,
                    filled_quantity: Qty::new(status.filled_quantity_raw),
                    average_fill_price: Amount::new(status.average_fill_price_cents),
                    fees: Amount::new(status.fee_cents),
                    accepted_at,
                    settled_at: Some(Utc::now()),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        Err(ExecutionError::Unavailable("order did not reach a terminal state in time".to_string()))
    }

    async fn cancel_order(&self, backend_order_id: &str) -> Result<(), ExecutionError> {
        self.with_retries(|| async {
            let timestamp = Utc::now().timestamp_millis();
            let query = format!("orderId={backend_order_id}&timestamp={timestamp}");
            let signature = self.sign_query(&query);
            let resp = self
                .client
                .post(format!("{}/order/cancel?{query}&signature={signature}", self.base_url))
                .header("X-API-KEY", self.secrets.api_key.expose())
                .send()
                .await
                .map_err(|e| ExecutionError::Unavailable(e.to_string()))?;
            Self::map_response(resp).await.map(|_| ())
        })
        .await
    }

    async fn get_balances(&self) -> Result<Balances, ExecutionError> {
        let dto: AccountDto = self
            .with_retries(|| async {
                let timestamp = Utc::now().timestamp_millis();
                let query = format!("timestamp={timestamp}");
                let signature = self.sign_query(&query);
                let resp = self
                    .client
                    .get(format!("{}/account?{query}&signature={signature}", self.base_url))
                    .header("X-API-KEY", self.secrets.api_key.expose())
                    .send()
                    .await
                    .map_err(|e| ExecutionError::Unavailable(e.to_string()))?;
                let body = Self::map_response(resp).await?;
                serde_json::from_value::<AccountDto>(body)
                    .map_err(|e| ExecutionError::Rejected(format!("malformed account response: {e}")))
            })
            .await?;
        Ok(Balances { available_cash: Amount::new(dto.available_cash_cents) })
    }

    async fn get_open_orders(&self) -> Result<Vec<OrderRef>, ExecutionError> {
        let dtos: Vec<OpenOrderDto> = self
            .with_retries(|| async {
                let timestamp = Utc::now().timestamp_millis();
                let query = format!("timestamp={timestamp}");
                let signature = self.sign_query(&query);
                let resp = self
                    .client
                    .get(format!("{}/orders/open?{query}&signature={signature}", self.base_url))
                    .header("X-API-KEY", self.secrets.api_key.expose())
                    .send()
                    .await
                    .map_err(|e| ExecutionError::Unavailable(e.to_string()))?;
                let body = Self::map_response(resp).await?;
                serde_json::from_value::<Vec<OpenOrderDto>>(body)
                    .map_err(|e| ExecutionError::Rejected(format!("malformed open orders response: {e}")))
            })
            .await?;
        Ok(dtos
            .into_iter()
            .map(|d| OrderRef {
                backend_order_id: d.order_id,
                client_order_id: d.client_order_id,
                instrument: aegis_schemas::Instrument::new(d.symbol),
            })
            .collect())
    }

    async fn health_check(&self) -> bool {
        let timestamp = Utc::now().timestamp_millis();
        let query = format!("timestamp={timestamp}");
        let signature = self.sign_query(&query);
        match self
            .client
            .get(format!("{}/ping?{query}&signature={signature}", self.base_url))
            .header("X-API-KEY", self.secrets.api_key.expose())
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}
