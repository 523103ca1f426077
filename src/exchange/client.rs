//! Bitget USDT-margined perpetuals REST client (hedge position mode).

use crate::config::ExchangeConfig;
use crate::error::ExchangeError;
use crate::exchange::traits::{ExecutionGateway, MarketDataProvider};
use crate::exchange::types::*;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, instrument};

const SUCCESS_CODE: &str = "00000";
/// Codes Bitget uses when an order exceeds the free balance.
const INSUFFICIENT_MARGIN_CODES: [&str; 3] = ["40762", "40754", "43012"];

/// Bitget API client for market data and futures order execution.
pub struct BitgetClient {
    http: Client,
    api_key: String,
    secret_key: String,
    passphrase: String,
    base_url: String,
    product_type: String,
    margin_coin: String,
    margin_mode: MarginMode,
}

impl BitgetClient {
    /// Create a new Bitget client from configuration.
    pub fn new(config: &ExchangeConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            passphrase: config.passphrase.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            product_type: config.product_type.clone(),
            margin_coin: config.margin_coin.clone(),
            margin_mode: config.margin_mode,
        })
    }

    /// Generate the base64 HMAC-SHA256 signature of `timestamp + method + path + body`.
    fn sign(&self, prehash: &str) -> Result<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .context("Invalid signing key")?;
        mac.update(prehash.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    /// Current timestamp in milliseconds.
    fn timestamp() -> String {
        chrono::Utc::now().timestamp_millis().to_string()
    }

    fn query_string(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Send a request and unwrap the response envelope.
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        body: Option<&Value>,
        signed: bool,
    ) -> Result<Option<T>> {
        let query = Self::query_string(params);
        let path_with_query = if query.is_empty() {
            path.to_string()
        } else {
            format!("{}?{}", path, query)
        };
        let body_text = body.map(|b| b.to_string()).unwrap_or_default();

        let url = format!("{}{}", self.base_url, path_with_query);
        let mut builder = self
            .http
            .request(method.clone(), &url)
            .header("Content-Type", "application/json")
            .header("locale", "en-US");

        if signed {
            let timestamp = Self::timestamp();
            let prehash = format!("{}{}{}{}", timestamp, method.as_str(), path_with_query, body_text);
            builder = builder
                .header("ACCESS-KEY", &self.api_key)
                .header("ACCESS-SIGN", self.sign(&prehash)?)
                .header("ACCESS-TIMESTAMP", timestamp)
                .header("ACCESS-PASSPHRASE", &self.passphrase);
        }

        if body.is_some() {
            builder = builder.body(body_text);
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", path))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .with_context(|| format!("Failed to read response from {}", path))?;

        let envelope: ApiResponse<T> = serde_json::from_str(&text).with_context(|| {
            format!("Failed to parse response from {} (HTTP {}): {}", path, status, text)
        })?;

        Self::check_envelope(envelope)
    }

    fn check_envelope<T>(envelope: ApiResponse<T>) -> Result<Option<T>> {
        if envelope.code == SUCCESS_CODE {
            return Ok(envelope.data);
        }
        if INSUFFICIENT_MARGIN_CODES.contains(&envelope.code.as_str()) {
            return Err(ExchangeError::InsufficientMargin(format!(
                "{}: {}",
                envelope.code, envelope.msg
            ))
            .into());
        }
        Err(ExchangeError::Api {
            code: envelope.code,
            msg: envelope.msg,
        }
        .into())
    }

    fn scope(&self) -> [(&'static str, String); 2] {
        [
            ("productType", self.product_type.clone()),
            ("marginCoin", self.margin_coin.clone()),
        ]
    }

    fn positions_from(raw: Option<Vec<RawPosition>>) -> Vec<Position> {
        raw.unwrap_or_default()
            .iter()
            .filter_map(normalize_position)
            .collect()
    }
}

#[async_trait]
impl MarketDataProvider for BitgetClient {
    #[instrument(skip(self))]
    async fn get_candles(
        &self,
        symbol: &str,
        interval: Interval,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        let params = [
            ("symbol", symbol.to_string()),
            ("productType", self.product_type.clone()),
            ("granularity", interval.as_str().to_string()),
            ("limit", limit.to_string()),
        ];
        let rows: Vec<RawCandle> = self
            .request(Method::GET, "/api/v2/mix/market/candles", &params, None, false)
            .await
            .with_context(|| format!("Failed to fetch {} candles for {}", interval, symbol))?
            .unwrap_or_default();

        let mut bars: Vec<Bar> = rows
            .iter()
            .filter_map(|row| parse_candle(row, interval.millis()))
            .collect();
        bars.sort_by_key(|bar| bar.open_time);

        debug!(%symbol, %interval, count = bars.len(), "Fetched candles");
        Ok(bars)
    }
}

#[async_trait]
impl ExecutionGateway for BitgetClient {
    #[instrument(skip(self))]
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResult> {
        let side = match order.side {
            PositionSide::Long => "buy",
            PositionSide::Short => "sell",
        };
        let mut body = json!({
            "symbol": order.symbol,
            "productType": self.product_type,
            "marginMode": self.margin_mode.as_str(),
            "marginCoin": self.margin_coin,
            "size": order.size.normalize().to_string(),
            "side": side,
            "tradeSide": "open",
            "orderType": "market",
        });
        if let Some(tp) = order.preset_take_profit {
            body["presetStopSurplusPrice"] = json!(tp.normalize().to_string());
        }
        if let Some(sl) = order.preset_stop_loss {
            body["presetStopLossPrice"] = json!(sl.normalize().to_string());
        }
        if let Some(client_oid) = &order.client_oid {
            body["clientOid"] = json!(client_oid);
        }

        debug!("Placing order: {}", body);

        let ack: RawOrderAck = self
            .request(Method::POST, "/api/v2/mix/order/place-order", &[], Some(&body), true)
            .await
            .context("Failed to place order")?
            .context("Order response carried no data")?;

        Ok(OrderResult {
            order_id: ack.order_id,
            client_oid: ack.client_oid,
        })
    }

    #[instrument(skip(self))]
    async fn close_position(
        &self,
        symbol: &str,
        side: PositionSide,
        size: Option<Decimal>,
    ) -> Result<()> {
        match size {
            None => {
                let body = json!({
                    "symbol": symbol,
                    "productType": self.product_type,
                    "holdSide": side.as_str(),
                });
                self.request::<Value>(
                    Method::POST,
                    "/api/v2/mix/order/close-positions",
                    &[],
                    Some(&body),
                    true,
                )
                .await
                .with_context(|| format!("Failed to close {} {}", side, symbol))?;
            }
            Some(size) => {
                // Hedge mode: the close order carries the side of the position it reduces.
                let order_side = match side {
                    PositionSide::Long => "buy",
                    PositionSide::Short => "sell",
                };
                let body = json!({
                    "symbol": symbol,
                    "productType": self.product_type,
                    "marginMode": self.margin_mode.as_str(),
                    "marginCoin": self.margin_coin,
                    "size": size.normalize().to_string(),
                    "side": order_side,
                    "tradeSide": "close",
                    "orderType": "market",
                });
                self.request::<Value>(
                    Method::POST,
                    "/api/v2/mix/order/place-order",
                    &[],
                    Some(&body),
                    true,
                )
                .await
                .with_context(|| format!("Failed to reduce {} {} by {}", side, symbol, size))?;
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_leverage(&self, symbol: &str, leverage: u32, side: PositionSide) -> Result<()> {
        let body = json!({
            "symbol": symbol,
            "productType": self.product_type,
            "marginCoin": self.margin_coin,
            "leverage": leverage.to_string(),
            "holdSide": side.as_str(),
        });
        self.request::<Value>(
            Method::POST,
            "/api/v2/mix/account/set-leverage",
            &[],
            Some(&body),
            true,
        )
        .await
        .with_context(|| format!("Failed to set {}x leverage on {} {}", leverage, side, symbol))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_margin_mode(&self, symbol: &str, mode: MarginMode) -> Result<()> {
        let body = json!({
            "symbol": symbol,
            "productType": self.product_type,
            "marginCoin": self.margin_coin,
            "marginMode": mode.as_str(),
        });
        self.request::<Value>(
            Method::POST,
            "/api/v2/mix/account/set-margin-mode",
            &[],
            Some(&body),
            true,
        )
        .await
        .with_context(|| format!("Failed to set {} margin mode on {}", mode.as_str(), symbol))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_account(&self, symbol: &str) -> Result<AccountSnapshot> {
        let mut params = vec![("symbol", symbol.to_string())];
        params.extend(self.scope());
        let account: RawAccount = self
            .request(Method::GET, "/api/v2/mix/account/account", &params, None, true)
            .await
            .context("Failed to fetch account")?
            .context("Account response carried no data")?;
        Ok(account.to_snapshot(self.margin_mode))
    }

    #[instrument(skip(self))]
    async fn get_all_positions(&self) -> Result<Vec<Position>> {
        let raw: Option<Vec<RawPosition>> = self
            .request(
                Method::GET,
                "/api/v2/mix/position/all-position",
                &self.scope(),
                None,
                true,
            )
            .await
            .context("Failed to fetch positions")?;
        Ok(Self::positions_from(raw))
    }

    #[instrument(skip(self))]
    async fn get_position(&self, symbol: &str) -> Result<Vec<Position>> {
        let mut params = vec![("symbol", symbol.to_string())];
        params.extend(self.scope());
        let raw: Option<Vec<RawPosition>> = self
            .request(
                Method::GET,
                "/api/v2/mix/position/single-position",
                &params,
                None,
                true,
            )
            .await
            .with_context(|| format!("Failed to fetch position for {}", symbol))?;
        Ok(Self::positions_from(raw))
    }

    #[instrument(skip(self))]
    async fn get_contract(&self, symbol: &str) -> Result<ContractSpec> {
        let params = [
            ("symbol", symbol.to_string()),
            ("productType", self.product_type.clone()),
        ];
        let contracts: Vec<RawContract> = self
            .request(Method::GET, "/api/v2/mix/market/contracts", &params, None, false)
            .await
            .with_context(|| format!("Failed to fetch contract for {}", symbol))?
            .unwrap_or_default();

        let wanted = normalize_symbol(symbol);
        contracts
            .iter()
            .find(|c| normalize_symbol(&c.symbol) == wanted)
            .and_then(RawContract::to_spec)
            .with_context(|| format!("No usable contract metadata for {}", symbol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{body_partial_json, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> BitgetClient {
        let config = ExchangeConfig {
            api_key: "key".to_string(),
            secret_key: "secret".to_string(),
            passphrase: "pass".to_string(),
            base_url: server.uri(),
            ..ExchangeConfig::default()
        };
        BitgetClient::new(&config).unwrap()
    }

    fn ok(data: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "code": "00000",
            "msg": "success",
            "requestTime": 1700000000000u64,
            "data": data
        }))
    }

    #[test]
    fn test_signature_is_base64_sha256() {
        let config = ExchangeConfig {
            secret_key: "secret".to_string(),
            ..ExchangeConfig::default()
        };
        let client = BitgetClient::new(&config).unwrap();
        let sig = client.sign("1700000000000GET/api/v2/mix/account/account").unwrap();
        assert_eq!(BASE64.decode(&sig).unwrap().len(), 32);
        assert_eq!(sig, client.sign("1700000000000GET/api/v2/mix/account/account").unwrap());
    }

    #[tokio::test]
    async fn test_candles_are_sorted_ascending() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/mix/market/candles"))
            .and(query_param("granularity", "1H"))
            .respond_with(ok(json!([
                ["1700003600000", "101", "102", "100", "101.5", "10", "1000"],
                ["1700000000000", "100", "101", "99", "101", "12", "1200"]
            ])))
            .mount(&server)
            .await;

        let bars = client_for(&server)
            .get_candles("BTCUSDT", Interval::Hour1, 2)
            .await
            .unwrap();

        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].open_time, 1700000000000);
        assert_eq!(bars[1].close, dec!(101.5));
    }

    #[tokio::test]
    async fn test_latest_price_uses_one_minute_close() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/mix/market/candles"))
            .and(query_param("granularity", "1m"))
            .respond_with(ok(json!([
                ["1700000000000", "100", "101", "99", "100.7", "1", "100"]
            ])))
            .mount(&server)
            .await;

        let price = client_for(&server).latest_price("BTCUSDT").await.unwrap();
        assert_eq!(price, dec!(100.7));
    }

    #[tokio::test]
    async fn test_positions_are_normalized_and_signed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/mix/position/all-position"))
            .and(header_exists("ACCESS-SIGN"))
            .and(header_exists("ACCESS-PASSPHRASE"))
            .respond_with(ok(json!([
                {"symbol": "BTCUSDT", "holdSide": "long", "openPriceAvg": "100", "total": "2", "leverage": "10"},
                {"symbol": "ETHUSDT_UMCBL", "holdSide": "short", "averageOpenPrice": "50", "holdSize": "4", "leverage": 5},
                {"symbol": "XRPUSDT", "holdSide": "??", "openPriceAvg": "1", "total": "1"}
            ])))
            .mount(&server)
            .await;

        let positions = client_for(&server).get_all_positions().await.unwrap();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[1].symbol, "ETHUSDT");
        assert_eq!(positions[1].side, PositionSide::Short);
        assert_eq!(positions[1].size, dec!(4));
    }

    #[tokio::test]
    async fn test_place_order_with_take_profit_only() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/mix/order/place-order"))
            .and(body_partial_json(json!({
                "side": "buy",
                "tradeSide": "open",
                "presetStopSurplusPrice": "100.5"
            })))
            .respond_with(ok(json!({"orderId": "42", "clientOid": null})))
            .mount(&server)
            .await;

        let order = OrderRequest::market_open("BTCUSDT", PositionSide::Long, dec!(0.01))
            .with_take_profit(dec!(100.5));
        let result = client_for(&server).place_order(&order).await.unwrap();
        assert_eq!(result.order_id, "42");

        let requests = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert!(body.get("presetStopLossPrice").is_none());
    }

    #[tokio::test]
    async fn test_insufficient_balance_code_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/mix/order/place-order"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "code": "40762",
                "msg": "The order amount exceeds the balance",
                "data": null
            })))
            .mount(&server)
            .await;

        let order = OrderRequest::market_open("BTCUSDT", PositionSide::Short, dec!(1));
        let err = client_for(&server).place_order(&order).await.unwrap_err();
        assert!(ExchangeError::is_insufficient_margin(&err));
    }

    #[tokio::test]
    async fn test_partial_close_uses_close_trade_side() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/mix/order/place-order"))
            .and(body_partial_json(json!({"side": "sell", "tradeSide": "close", "size": "2.2"})))
            .respond_with(ok(json!({"orderId": "7"})))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server)
            .close_position("ETHUSDT", PositionSide::Short, Some(dec!(2.20)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_contract_metadata() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/mix/market/contracts"))
            .respond_with(ok(json!([{
                "symbol": "BTCUSDT",
                "pricePlace": "1",
                "priceEndStep": "1",
                "volumePlace": "3",
                "sizeMultiplier": "0.001",
                "minTradeNum": "0.001"
            }])))
            .mount(&server)
            .await;

        let spec = client_for(&server).get_contract("BTCUSDT").await.unwrap();
        assert_eq!(spec.price_tick, dec!(0.1));
        assert_eq!(spec.min_trade_size, dec!(0.001));
    }
}
