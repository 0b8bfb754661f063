//! Binance USDⓈ-M futures REST adapter.
//!
//! Translates between the wire format and typed records. Numeric fields arrive
//! as strings and are parsed into `Decimal` here; anything malformed is a
//! validation error so nothing downstream ever sees a half-parsed record.

use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::Method;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info};

use super::{Credentials, ExchangeApi};
use crate::config::ExchangeConfig;
use crate::types::{
    Balance, Candle, ExchangePosition, OrderAck, OrderBookSnapshot, OrderRequest, OrderStatus,
    OrderType, PositionMode, PositionSide, PriceLevel, Side, SymbolFilters, Timeframe,
};
use crate::{Error, Result};

const QUOTE_ASSET: &str = "USDT";
/// "No need to change position side."
const NO_CHANGE_NEEDED: i64 = -4059;

pub struct BinanceFuturesClient {
    base_url: String,
    recv_window_ms: u64,
    http_client: reqwest::Client,
}

impl BinanceFuturesClient {
    /// Default futures REST base URL.
    pub const DEFAULT_BASE_URL: &'static str = "https://fapi.binance.com";

    pub fn new(config: &ExchangeConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            recv_window_ms: config.recv_window_ms,
            http_client,
        })
    }

    async fn public_get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http_client.get(&url).query(query).send().await?;
        Self::decode(response).await
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        creds: &Credentials,
        params: Vec<(&str, String)>,
    ) -> Result<T> {
        // The serializer is not Send; it must be gone before the first await.
        let query = {
            let mut serializer = url::form_urlencoded::Serializer::new(String::new());
            for (k, v) in &params {
                serializer.append_pair(k, v);
            }
            serializer.append_pair("recvWindow", &self.recv_window_ms.to_string());
            serializer.append_pair("timestamp", &current_timestamp_ms().to_string());
            serializer.finish()
        };
        let signature = sign_query(&creds.secret_key, &query)?;

        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);
        debug!(method = %method, path, "Signed exchange request");
        let response = self
            .http_client
            .request(method, &url)
            .header("X-MBX-APIKEY", &creds.api_key)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            return Ok(serde_json::from_str(&body)?);
        }
        Err(error_from_body(status.as_u16(), &body))
    }
}

/// Map a non-2xx response to an error, preferring the exchange's own code.
fn error_from_body(status: u16, body: &str) -> Error {
    #[derive(Deserialize)]
    struct ErrorBody {
        code: i64,
        msg: String,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(e) if status != 429 && status != 418 && status < 500 => Error::Exchange {
            code: e.code,
            message: e.msg,
        },
        Ok(e) => Error::Api {
            message: format!("{} ({})", e.msg, e.code),
            status: Some(status),
        },
        Err(_) => Error::Api {
            message: format!("HTTP {status}"),
            status: Some(status),
        },
    }
}

fn current_timestamp_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// HMAC-SHA256 of the query string, hex encoded.
pub fn sign_query(secret: &str, query: &str) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|e| Error::Signing {
        message: format!("Failed to create HMAC: {}", e),
    })?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn parse_decimal(field: &str, raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw)
        .map_err(|_| Error::validation(format!("malformed {field}: '{raw}'")))
}

fn parse_positive(field: &str, raw: &str) -> Result<Decimal> {
    let value = parse_decimal(field, raw)?;
    if value <= Decimal::ZERO {
        return Err(Error::validation(format!("non-positive {field}: {value}")));
    }
    Ok(value)
}

fn parse_f64(field: &str, raw: &serde_json::Value) -> Result<f64> {
    raw.as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .ok_or_else(|| Error::validation(format!("malformed {field}: {raw}")))
}

// ============================================================================
// Wire records
// ============================================================================

fn parse_kline(row: &[serde_json::Value]) -> Result<Candle> {
    if row.len() < 6 {
        return Err(Error::validation(format!(
            "kline row has {} fields, expected at least 6",
            row.len()
        )));
    }
    let open_ms = row[0]
        .as_i64()
        .ok_or_else(|| Error::validation("kline open time is not an integer"))?;
    let open_time = Utc
        .timestamp_millis_opt(open_ms)
        .single()
        .ok_or_else(|| Error::validation(format!("kline open time out of range: {open_ms}")))?;

    let candle = Candle {
        open_time,
        open: parse_f64("open", &row[1])?,
        high: parse_f64("high", &row[2])?,
        low: parse_f64("low", &row[3])?,
        close: parse_f64("close", &row[4])?,
        volume: parse_f64("volume", &row[5])?,
    };
    if !candle.is_valid() {
        return Err(Error::validation(format!("inconsistent kline at {open_time}")));
    }
    Ok(candle)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeInfo {
    symbols: Vec<RawSymbol>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSymbol {
    symbol: String,
    status: String,
    #[serde(default)]
    contract_type: String,
    #[serde(default)]
    quote_asset: String,
    #[serde(default)]
    filters: Vec<RawFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFilter {
    filter_type: String,
    tick_size: Option<String>,
    step_size: Option<String>,
    min_qty: Option<String>,
}

impl RawSymbol {
    fn is_tradeable_perpetual(&self) -> bool {
        self.status == "TRADING" && self.contract_type == "PERPETUAL" && self.quote_asset == QUOTE_ASSET
    }

    fn filter(&self, filter_type: &str) -> Result<&RawFilter> {
        self.filters
            .iter()
            .find(|f| f.filter_type == filter_type)
            .ok_or_else(|| Error::validation(format!("{}: missing {filter_type}", self.symbol)))
    }

    fn into_filters(self) -> Result<SymbolFilters> {
        let price = self.filter("PRICE_FILTER")?;
        let lot = self.filter("LOT_SIZE")?;
        let missing = |name: &str| Error::validation(format!("{}: missing {name}", self.symbol));

        let tick_size = parse_positive("tickSize", price.tick_size.as_deref().ok_or_else(|| missing("tickSize"))?)?;
        let step_size = parse_positive("stepSize", lot.step_size.as_deref().ok_or_else(|| missing("stepSize"))?)?;
        let min_qty = parse_decimal("minQty", lot.min_qty.as_deref().ok_or_else(|| missing("minQty"))?)?;

        Ok(SymbolFilters {
            symbol: self.symbol,
            tick_size,
            step_size,
            min_qty,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawLeverageBrackets {
    brackets: Vec<RawBracket>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBracket {
    initial_leverage: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBalance {
    asset: String,
    balance: String,
    available_balance: String,
    cross_un_pnl: String,
}

impl TryFrom<RawBalance> for Balance {
    type Error = Error;

    fn try_from(raw: RawBalance) -> Result<Self> {
        Ok(Balance {
            total: parse_decimal("balance", &raw.balance)?,
            available: parse_decimal("availableBalance", &raw.available_balance)?,
            cross_unrealized_pnl: parse_decimal("crossUnPnl", &raw.cross_un_pnl)?,
            asset: raw.asset,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPosition {
    symbol: String,
    position_amt: String,
    entry_price: String,
    mark_price: String,
    un_realized_profit: String,
    liquidation_price: String,
    leverage: String,
    #[serde(default = "default_position_side")]
    position_side: PositionSide,
}

fn default_position_side() -> PositionSide {
    PositionSide::Both
}

impl RawPosition {
    /// `None` for flat entries, which the endpoint reports for every symbol.
    fn into_position(self) -> Result<Option<ExchangePosition>> {
        let amount = parse_decimal("positionAmt", &self.position_amt)?;
        let Some(side) = Side::from_amount(amount) else {
            return Ok(None);
        };
        let leverage = self
            .leverage
            .parse::<u32>()
            .map_err(|_| Error::validation(format!("malformed leverage: '{}'", self.leverage)))?;
        Ok(Some(ExchangePosition {
            side,
            position_side: self.position_side,
            quantity: amount.abs(),
            entry_price: parse_positive("entryPrice", &self.entry_price)?,
            mark_price: parse_positive("markPrice", &self.mark_price)?,
            leverage,
            unrealized_pnl: parse_decimal("unRealizedProfit", &self.un_realized_profit)?,
            liquidation_price: parse_decimal("liquidationPrice", &self.liquidation_price)?,
            symbol: self.symbol,
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPositionMode {
    dual_side_position: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOrderAck {
    order_id: i64,
    client_order_id: String,
    symbol: String,
    status: OrderStatus,
    executed_qty: String,
    avg_price: Option<String>,
}

impl TryFrom<RawOrderAck> for OrderAck {
    type Error = Error;

    fn try_from(raw: RawOrderAck) -> Result<Self> {
        let avg_price = match raw.avg_price.as_deref() {
            Some(p) => Some(parse_decimal("avgPrice", p)?).filter(|p| !p.is_zero()),
            None => None,
        };
        Ok(OrderAck {
            order_id: raw.order_id,
            client_id: raw.client_order_id,
            symbol: raw.symbol,
            status: raw.status,
            executed_qty: parse_decimal("executedQty", &raw.executed_qty)?,
            avg_price,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawTickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
struct RawDepth {
    bids: Vec<(String, String)>,
    asks: Vec<(String, String)>,
}

fn parse_levels(levels: Vec<(String, String)>) -> Result<Vec<PriceLevel>> {
    levels
        .into_iter()
        .map(|(p, q)| {
            Ok(PriceLevel {
                price: parse_positive("price", &p)?,
                quantity: parse_decimal("quantity", &q)?,
            })
        })
        .collect()
}

fn order_params(order: &OrderRequest) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("symbol", order.symbol.clone()),
        ("side", order.side.as_str().to_string()),
        ("type", order.order_type.as_str().to_string()),
        ("quantity", order.quantity.normalize().to_string()),
        ("newClientOrderId", order.client_id.simple().to_string()),
    ];
    if let Some(stop) = order.stop_price {
        params.push(("stopPrice", stop.normalize().to_string()));
        params.push(("workingType", "MARK_PRICE".to_string()));
    }
    if order.position_side != PositionSide::Both {
        params.push(("positionSide", order.position_side.as_str().to_string()));
    } else if order.reduce_only {
        params.push(("reduceOnly", "true".to_string()));
    }
    if order.order_type == OrderType::Market {
        params.push(("newOrderRespType", "RESULT".to_string()));
    }
    params
}

#[async_trait]
impl ExchangeApi for BinanceFuturesClient {
    async fn klines(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>> {
        let rows: Vec<Vec<serde_json::Value>> = self
            .public_get(
                "/fapi/v1/klines",
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", timeframe.as_str().to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        rows.iter().map(|row| parse_kline(row)).collect()
    }

    async fn trading_symbols(&self) -> Result<Vec<String>> {
        let info: ExchangeInfo = self.public_get("/fapi/v1/exchangeInfo", &[]).await?;
        let symbols: Vec<String> = info
            .symbols
            .into_iter()
            .filter(RawSymbol::is_tradeable_perpetual)
            .map(|s| s.symbol)
            .collect();
        info!(count = symbols.len(), "Fetched tradeable perpetual symbols");
        Ok(symbols)
    }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        let info: ExchangeInfo = self.public_get("/fapi/v1/exchangeInfo", &[]).await?;
        info.symbols
            .into_iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| Error::validation(format!("unknown symbol {symbol}")))?
            .into_filters()
    }

    async fn leverage_bracket(&self, creds: &Credentials, symbol: &str) -> Result<u32> {
        let brackets: Vec<RawLeverageBrackets> = self
            .signed(
                Method::GET,
                "/fapi/v1/leverageBracket",
                creds,
                vec![("symbol", symbol.to_string())],
            )
            .await?;
        brackets
            .first()
            .and_then(|b| b.brackets.first())
            .map(|b| b.initial_leverage)
            .ok_or_else(|| Error::validation(format!("{symbol}: no leverage brackets")))
    }

    async fn balance(&self, creds: &Credentials) -> Result<Balance> {
        let balances: Vec<RawBalance> = self
            .signed(Method::GET, "/fapi/v2/balance", creds, Vec::new())
            .await?;
        match balances.into_iter().find(|b| b.asset == QUOTE_ASSET) {
            Some(raw) => raw.try_into(),
            None => Ok(Balance::empty(QUOTE_ASSET)),
        }
    }

    async fn positions(&self, creds: &Credentials) -> Result<Vec<ExchangePosition>> {
        let raw: Vec<RawPosition> = self
            .signed(Method::GET, "/fapi/v2/positionRisk", creds, Vec::new())
            .await?;
        let mut positions = Vec::new();
        for p in raw {
            if let Some(position) = p.into_position()? {
                positions.push(position);
            }
        }
        Ok(positions)
    }

    async fn set_leverage(&self, creds: &Credentials, symbol: &str, leverage: u32) -> Result<()> {
        let _: serde_json::Value = self
            .signed(
                Method::POST,
                "/fapi/v1/leverage",
                creds,
                vec![("symbol", symbol.to_string()), ("leverage", leverage.to_string())],
            )
            .await?;
        Ok(())
    }

    async fn position_mode(&self, creds: &Credentials) -> Result<PositionMode> {
        let raw: RawPositionMode = self
            .signed(Method::GET, "/fapi/v1/positionSide/dual", creds, Vec::new())
            .await?;
        Ok(PositionMode::from_dual_side(raw.dual_side_position))
    }

    async fn set_position_mode(&self, creds: &Credentials, mode: PositionMode) -> Result<()> {
        let result: Result<serde_json::Value> = self
            .signed(
                Method::POST,
                "/fapi/v1/positionSide/dual",
                creds,
                vec![("dualSidePosition", mode.is_dual_side().to_string())],
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(Error::Exchange { code: NO_CHANGE_NEEDED, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn place_order(&self, creds: &Credentials, order: &OrderRequest) -> Result<OrderAck> {
        let raw: RawOrderAck = self
            .signed(Method::POST, "/fapi/v1/order", creds, order_params(order))
            .await?;
        raw.try_into()
    }

    async fn cancel_order(&self, creds: &Credentials, symbol: &str, order_id: i64) -> Result<()> {
        let _: serde_json::Value = self
            .signed(
                Method::DELETE,
                "/fapi/v1/order",
                creds,
                vec![("symbol", symbol.to_string()), ("orderId", order_id.to_string())],
            )
            .await?;
        Ok(())
    }

    async fn cancel_all_orders(&self, creds: &Credentials, symbol: &str) -> Result<()> {
        let _: serde_json::Value = self
            .signed(
                Method::DELETE,
                "/fapi/v1/allOpenOrders",
                creds,
                vec![("symbol", symbol.to_string())],
            )
            .await?;
        Ok(())
    }

    async fn ticker_price(&self, symbol: &str) -> Result<Decimal> {
        let raw: RawTickerPrice = self
            .public_get("/fapi/v1/ticker/price", &[("symbol", symbol.to_string())])
            .await?;
        parse_positive("price", &raw.price)
    }

    async fn order_book(&self, symbol: &str, depth: usize) -> Result<OrderBookSnapshot> {
        let raw: RawDepth = self
            .public_get(
                "/fapi/v1/depth",
                &[("symbol", symbol.to_string()), ("limit", depth.to_string())],
            )
            .await?;
        Ok(OrderBookSnapshot {
            symbol: symbol.to_string(),
            timestamp: Utc::now(),
            bids: parse_levels(raw.bids)?,
            asks: parse_levels(raw.asks)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sign_query_matches_reference_vector() {
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign_query(secret, query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_parse_kline() {
        let row = vec![
            json!(1_700_000_000_000i64),
            json!("100.0"),
            json!("101.5"),
            json!("99.5"),
            json!("101.0"),
            json!("1234.5"),
            json!(1_700_003_599_999i64),
        ];
        let candle = parse_kline(&row).unwrap();
        assert_eq!(candle.close, 101.0);
        assert_eq!(candle.volume, 1234.5);

        let mut bad = row.clone();
        bad[4] = json!("abc");
        assert!(matches!(parse_kline(&bad), Err(Error::Validation(_))));
        assert!(matches!(parse_kline(&row[..3]), Err(Error::Validation(_))));
    }

    #[test]
    fn test_symbol_filters_require_lot_size() {
        let raw: RawSymbol = serde_json::from_value(json!({
            "symbol": "BTCUSDT",
            "status": "TRADING",
            "contractType": "PERPETUAL",
            "quoteAsset": "USDT",
            "filters": [
                {"filterType": "PRICE_FILTER", "tickSize": "0.10"},
                {"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001"}
            ]
        }))
        .unwrap();
        assert!(raw.is_tradeable_perpetual());
        let filters = raw.into_filters().unwrap();
        assert_eq!(filters.step_size, Decimal::new(1, 3));

        let raw: RawSymbol = serde_json::from_value(json!({
            "symbol": "ETHUSDT",
            "status": "TRADING",
            "filters": [{"filterType": "PRICE_FILTER", "tickSize": "0.01"}]
        }))
        .unwrap();
        assert!(matches!(raw.into_filters(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_position_side_from_signed_amount() {
        let raw: RawPosition = serde_json::from_value(json!({
            "symbol": "ETHUSDT",
            "positionAmt": "-0.500",
            "entryPrice": "3000.0",
            "markPrice": "2950.0",
            "unRealizedProfit": "25.0",
            "liquidationPrice": "3100.0",
            "leverage": "20",
            "positionSide": "BOTH"
        }))
        .unwrap();
        let position = raw.into_position().unwrap().unwrap();
        assert_eq!(position.side, Side::Short);
        assert_eq!(position.quantity, Decimal::new(5, 1));

        let flat: RawPosition = serde_json::from_value(json!({
            "symbol": "ETHUSDT",
            "positionAmt": "0.000",
            "entryPrice": "0.0",
            "markPrice": "2950.0",
            "unRealizedProfit": "0.0",
            "liquidationPrice": "0",
            "leverage": "20"
        }))
        .unwrap();
        assert!(flat.into_position().unwrap().is_none());
    }

    #[test]
    fn test_error_body_mapping() {
        let err = error_from_body(400, r#"{"code":-2019,"msg":"Margin is insufficient."}"#);
        assert!(matches!(err, Error::Exchange { code: -2019, .. }));

        let err = error_from_body(429, r#"{"code":-1003,"msg":"Too many requests"}"#);
        assert!(err.is_retryable());

        let err = error_from_body(502, "<html>bad gateway</html>");
        assert!(matches!(err, Error::Api { status: Some(502), .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_order_params() {
        let order = OrderRequest::stop_loss("BTCUSDT", Side::Long, Decimal::new(17, 3), Decimal::new(640001, 1));
        let params = order_params(&order);
        let get = |k: &str| params.iter().find(|(key, _)| *key == k).map(|(_, v)| v.as_str());
        assert_eq!(get("side"), Some("SELL"));
        assert_eq!(get("type"), Some("STOP_MARKET"));
        assert_eq!(get("quantity"), Some("0.017"));
        assert_eq!(get("stopPrice"), Some("64000.1"));
        assert_eq!(get("reduceOnly"), Some("true"));
        assert_eq!(get("positionSide"), None);
    }

    #[test]
    fn test_signed_request_future_is_send() {
        fn assert_send<T: Send>(_: T) {}
        let client = BinanceFuturesClient::new(&ExchangeConfig::default()).unwrap();
        let creds = Credentials::new("key", "secret");
        assert_send(client.signed::<serde_json::Value>(
            Method::POST,
            "/fapi/v1/positionSide/dual",
            &creds,
            vec![("dualSidePosition", "true".to_string())],
        ));
    }

    #[test]
    fn test_position_mode_body() {
        let raw: RawPositionMode = serde_json::from_value(json!({ "dualSidePosition": true })).unwrap();
        assert_eq!(PositionMode::from_dual_side(raw.dual_side_position), PositionMode::Hedge);
        let raw: RawPositionMode = serde_json::from_value(json!({ "dualSidePosition": false })).unwrap();
        assert_eq!(PositionMode::from_dual_side(raw.dual_side_position), PositionMode::OneWay);
    }
}
