use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use crate::gateway::{
    ExchangeGateway, GatewayError, GatewayResult, OpenOrder, OrderAck, OrderSide, OrderState,
    OrderStatus, StopKind, SymbolFilters,
};

const LIVE_BASE_URL: &str = "https://fapi.binance.com";
const TESTNET_BASE_URL: &str = "https://testnet.binancefuture.com";
const HTTP_TIMEOUT_SECS: u64 = 10;
const RECV_WINDOW_MS: u64 = 5000;

// API error codes that mean "that order is already gone"
const ERR_UNKNOWN_ORDER: i64 = -2011;
const ERR_NO_SUCH_ORDER: i64 = -2013;

type HmacSha256 = Hmac<Sha256>;

/// USDⓈ-M futures REST gateway. Trading calls are HMAC-signed; symbol
/// filters are cached for the process lifetime since they almost never
/// change.
pub struct BinanceFuturesGateway {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    filters_cache: Mutex<HashMap<String, SymbolFilters>>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderDetail {
    status: String,
    avg_price: String,
    executed_qty: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenOrderRow {
    order_id: i64,
    #[serde(rename = "type")]
    order_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRow {
    position_amt: String,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    filters: Vec<FilterEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilterEntry {
    filter_type: String,
    step_size: Option<String>,
    tick_size: Option<String>,
}

fn to_gateway_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Http(format!("request timed out: {}", err))
    } else {
        GatewayError::Http(err.to_string())
    }
}

fn parse_decimal(value: &str, field: &str) -> GatewayResult<Decimal> {
    Decimal::from_str(value)
        .map_err(|e| GatewayError::InvalidResponse(format!("bad {} '{}': {}", field, value, e)))
}

fn extract_filters(info: &SymbolInfo) -> SymbolFilters {
    let mut lot_step = Decimal::ZERO;
    let mut tick_size = Decimal::ZERO;
    for filter in &info.filters {
        match filter.filter_type.as_str() {
            "LOT_SIZE" => {
                if let Some(step) = filter.step_size.as_deref() {
                    lot_step = Decimal::from_str(step).unwrap_or(Decimal::ZERO);
                }
            }
            "PRICE_FILTER" => {
                if let Some(tick) = filter.tick_size.as_deref() {
                    tick_size = Decimal::from_str(tick).unwrap_or(Decimal::ZERO);
                }
            }
            _ => {}
        }
    }
    SymbolFilters {
        lot_step,
        tick_size,
    }
}

impl BinanceFuturesGateway {
    pub fn from_env(testnet: bool) -> GatewayResult<Self> {
        let api_key = env::var("BINANCE_API_KEY")
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| GatewayError::Other("BINANCE_API_KEY must be set".to_string()))?;
        let api_secret = env::var("BINANCE_API_SECRET")
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| GatewayError::Other("BINANCE_API_SECRET must be set".to_string()))?;

        let base_url = if testnet {
            TESTNET_BASE_URL.to_string()
        } else {
            LIVE_BASE_URL.to_string()
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(to_gateway_error)?;

        Ok(Self {
            client,
            base_url,
            api_key,
            api_secret,
            filters_cache: Mutex::new(HashMap::new()),
        })
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn encode_query(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> GatewayResult<T> {
        let status = response.status();
        let body = response.text().await.map_err(to_gateway_error)?;

        if status.is_success() {
            return serde_json::from_str(&body).map_err(|e| {
                GatewayError::InvalidResponse(format!("failed to decode '{}': {}", body, e))
            });
        }

        if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
            return Err(GatewayError::RateLimited(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        match serde_json::from_str::<ApiErrorBody>(&body) {
            Ok(api_err) => Err(GatewayError::Api {
                code: api_err.code,
                message: api_err.msg,
            }),
            Err(_) => Err(GatewayError::Http(format!("HTTP {}: {}", status, body))),
        }
    }

    /// Signed request against a trading endpoint. The signature covers the
    /// full query string including the timestamp.
    async fn signed_request<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> GatewayResult<T> {
        params.push(("recvWindow", RECV_WINDOW_MS.to_string()));
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));

        let query = Self::encode_query(&params);
        let signature = self.sign(&query);
        let url = format!(
            "{}{}?{}&signature={}",
            self.base_url, path, query, signature
        );

        let response = self
            .client
            .request(method, url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(to_gateway_error)?;

        Self::handle_response(response).await
    }

    async fn public_request<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: Vec<(&str, String)>,
    ) -> GatewayResult<T> {
        let mut url = format!("{}{}", self.base_url, path);
        if !params.is_empty() {
            url = format!("{}?{}", url, Self::encode_query(&params));
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(to_gateway_error)?;

        Self::handle_response(response).await
    }
}

#[async_trait]
impl ExchangeGateway for BinanceFuturesGateway {
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> GatewayResult<()> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("leverage", leverage.to_string()),
        ];
        let _: serde_json::Value = self
            .signed_request(Method::POST, "/fapi/v1/leverage", params)
            .await?;
        Ok(())
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> GatewayResult<OrderAck> {
        let mut params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", quantity.to_string()),
        ];
        if reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        let response: OrderResponse = self
            .signed_request(Method::POST, "/fapi/v1/order", params)
            .await?;
        Ok(OrderAck {
            order_id: response.order_id.to_string(),
        })
    }

    async fn place_stop_order(
        &self,
        symbol: &str,
        side: OrderSide,
        kind: StopKind,
        stop_price: Decimal,
    ) -> GatewayResult<OrderAck> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", kind.as_wire().to_string()),
            ("stopPrice", stop_price.to_string()),
            ("closePosition", "true".to_string()),
            ("timeInForce", "GTC".to_string()),
        ];

        let response: OrderResponse = self
            .signed_request(Method::POST, "/fapi/v1/order", params)
            .await?;
        Ok(OrderAck {
            order_id: response.order_id.to_string(),
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> GatewayResult<()> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        let result: GatewayResult<serde_json::Value> = self
            .signed_request(Method::DELETE, "/fapi/v1/order", params)
            .await;

        match result {
            Ok(_) => Ok(()),
            // already canceled or filled away: nothing left to do
            Err(GatewayError::Api { code, .. })
                if code == ERR_UNKNOWN_ORDER || code == ERR_NO_SUCH_ORDER =>
            {
                log::debug!("[GATEWAY] order {} on {} already gone", order_id, symbol);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> GatewayResult<OrderState> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        let result: GatewayResult<OrderDetail> = self
            .signed_request(Method::GET, "/fapi/v1/order", params)
            .await;

        match result {
            Ok(detail) => Ok(OrderState {
                status: OrderStatus::from_wire(&detail.status),
                avg_price: parse_decimal(&detail.avg_price, "avgPrice")?,
                executed_qty: parse_decimal(&detail.executed_qty, "executedQty")?,
            }),
            Err(GatewayError::Api { code, .. }) if code == ERR_NO_SUCH_ORDER => {
                Ok(OrderState::not_found())
            }
            Err(err) => Err(err),
        }
    }

    async fn get_open_orders(&self, symbol: &str) -> GatewayResult<Vec<OpenOrder>> {
        let params = vec![("symbol", symbol.to_string())];
        let rows: Vec<OpenOrderRow> = self
            .signed_request(Method::GET, "/fapi/v1/openOrders", params)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| OpenOrder {
                order_id: row.order_id.to_string(),
                order_type: row.order_type,
            })
            .collect())
    }

    async fn get_position_amount(&self, symbol: &str) -> GatewayResult<Decimal> {
        let params = vec![("symbol", symbol.to_string())];
        let rows: Vec<PositionRow> = self
            .signed_request(Method::GET, "/fapi/v2/positionRisk", params)
            .await?;

        let mut total = Decimal::ZERO;
        for row in rows {
            total += parse_decimal(&row.position_amt, "positionAmt")?.abs();
        }
        Ok(total)
    }

    async fn get_symbol_filters(&self, symbol: &str) -> GatewayResult<SymbolFilters> {
        if let Some(cached) = self.filters_cache.lock().unwrap().get(symbol) {
            return Ok(*cached);
        }

        let params = vec![("symbol", symbol.to_string())];
        let info: ExchangeInfo = self
            .public_request("/fapi/v1/exchangeInfo", params)
            .await?;

        let symbol_info = info
            .symbols
            .iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| {
                GatewayError::InvalidResponse(format!("symbol {} not in exchange info", symbol))
            })?;

        let filters = extract_filters(symbol_info);
        self.filters_cache
            .lock()
            .unwrap()
            .insert(symbol.to_string(), filters);
        Ok(filters)
    }

    async fn get_mark_price(&self, symbol: &str) -> GatewayResult<Decimal> {
        let params = vec![("symbol", symbol.to_string())];
        let ticker: TickerPrice = self
            .public_request("/fapi/v1/ticker/price", params)
            .await?;
        parse_decimal(&ticker.price, "price")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_extracted_from_exchange_info() {
        let body = r#"{
            "symbols": [{
                "symbol": "ETHUSDC",
                "filters": [
                    {"filterType": "PRICE_FILTER", "tickSize": "0.01", "minPrice": "39.86"},
                    {"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001"},
                    {"filterType": "MARKET_LOT_SIZE", "stepSize": "0.001"}
                ]
            }]
        }"#;
        let info: ExchangeInfo = serde_json::from_str(body).unwrap();
        let filters = extract_filters(&info.symbols[0]);
        assert_eq!(filters.lot_step, Decimal::from_str("0.001").unwrap());
        assert_eq!(filters.tick_size, Decimal::from_str("0.01").unwrap());
    }

    #[test]
    fn order_detail_decodes_wire_shape() {
        let body = r#"{"orderId": 283194212, "status": "FILLED", "avgPrice": "2001.35", "executedQty": "0.025", "symbol": "ETHUSDC"}"#;
        let detail: OrderDetail = serde_json::from_str(body).unwrap();
        assert_eq!(OrderStatus::from_wire(&detail.status), OrderStatus::Filled);
        assert_eq!(
            parse_decimal(&detail.avg_price, "avgPrice").unwrap(),
            Decimal::from_str("2001.35").unwrap()
        );
    }

    #[test]
    fn query_encoding_keeps_parameter_order() {
        let params = vec![
            ("symbol", "ETHUSDC".to_string()),
            ("side", "BUY".to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", "0.025".to_string()),
        ];
        assert_eq!(
            BinanceFuturesGateway::encode_query(&params),
            "symbol=ETHUSDC&side=BUY&type=MARKET&quantity=0.025"
        );
    }

    #[test]
    fn error_body_decodes() {
        let body = r#"{"code": -2013, "msg": "Order does not exist."}"#;
        let err: ApiErrorBody = serde_json::from_str(body).unwrap();
        assert_eq!(err.code, ERR_NO_SUCH_ORDER);
        assert_eq!(err.msg, "Order does not exist.");
    }
}
