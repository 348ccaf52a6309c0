use async_trait::async_trait;
use lazy_static::lazy_static;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;

use crate::config::{BotConfig, RunMode};
use crate::notifier::notify_rate_limit;
use crate::ports::binance_futures::BinanceFuturesGateway;
use crate::ports::paper::PaperGateway;

lazy_static! {
    static ref FILLED_PROBABILITY_IN_EMULATION: Decimal = {
        match env::var("FILLED_PROBABILITY_IN_EMULATION") {
            Ok(val) => val.parse::<Decimal>().unwrap_or(Decimal::new(1, 0)),
            Err(_) => Decimal::new(1, 0),
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn from_signal(value: &str) -> Option<OrderSide> {
        match value.trim().to_uppercase().as_str() {
            "BUY" | "LONG" => Some(OrderSide::Buy),
            "SELL" | "SHORT" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    TakeProfit,
    StopLoss,
}

impl StopKind {
    /// Exchange order type used for this bracket leg.
    pub fn as_wire(&self) -> &'static str {
        match self {
            StopKind::TakeProfit => "TAKE_PROFIT_MARKET",
            StopKind::StopLoss => "STOP_MARKET",
        }
    }
}

impl fmt::Display for StopKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StopKind::TakeProfit => write!(f, "TP"),
            StopKind::StopLoss => write!(f, "SL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Triggered,
    Canceled,
    Expired,
    Rejected,
    NotFound,
}

impl OrderStatus {
    pub fn from_wire(value: &str) -> OrderStatus {
        match value {
            "NEW" => OrderStatus::New,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "TRIGGERED" => OrderStatus::Triggered,
            "CANCELED" => OrderStatus::Canceled,
            "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Expired,
            "REJECTED" => OrderStatus::Rejected,
            other => {
                // unknown statuses behave like a still-working order
                log::debug!("unknown order status '{}', treating as NEW", other);
                OrderStatus::New
            }
        }
    }

    /// A stop order that went off. TRIGGERED shows up briefly on conditional
    /// orders before they convert into fills.
    pub fn is_fill(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Triggered)
    }

    /// Statuses that abort the entry fill wait.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected
        )
    }

    /// Anything not conclusively off the book counts as resting, including
    /// lookup failures, so reconciliation stays conservative.
    pub fn still_resting(&self) -> bool {
        !matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Expired
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Triggered => "TRIGGERED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Expired => "EXPIRED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::NotFound => "NOT_FOUND",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
}

#[derive(Debug, Clone)]
pub struct OrderState {
    pub status: OrderStatus,
    pub avg_price: Decimal,
    pub executed_qty: Decimal,
}

impl OrderState {
    pub fn not_found() -> Self {
        Self {
            status: OrderStatus::NotFound,
            avg_price: Decimal::ZERO,
            executed_qty: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub order_id: String,
    /// Exchange order type string, e.g. STOP_MARKET.
    pub order_type: String,
}

impl OpenOrder {
    pub fn is_bracket(&self) -> bool {
        matches!(
            self.order_type.as_str(),
            "STOP_MARKET" | "TAKE_PROFIT_MARKET"
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SymbolFilters {
    pub lot_step: Decimal,
    pub tick_size: Decimal,
}

#[derive(Debug)]
pub enum GatewayError {
    Api { code: i64, message: String },
    Http(String),
    RateLimited(String),
    InvalidResponse(String),
    Other(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GatewayError::Api { code, message } => {
                write!(f, "exchange API error {}: {}", code, message)
            }
            GatewayError::Http(e) => write!(f, "HTTP error: {}", e),
            GatewayError::RateLimited(e) => write!(f, "rate limited: {}", e),
            GatewayError::InvalidResponse(e) => write!(f, "invalid response: {}", e),
            GatewayError::Other(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for GatewayError {}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Everything the engine needs from the exchange. Implementations must be
/// safe to share behind an Arc across the signal handlers and the monitor.
#[async_trait]
pub trait ExchangeGateway {
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> GatewayResult<()>;

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> GatewayResult<OrderAck>;

    /// Close-position stop order (closes whatever is open when triggered),
    /// good till canceled.
    async fn place_stop_order(
        &self,
        symbol: &str,
        side: OrderSide,
        kind: StopKind,
        stop_price: Decimal,
    ) -> GatewayResult<OrderAck>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> GatewayResult<()>;

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> GatewayResult<OrderState>;

    async fn get_open_orders(&self, symbol: &str) -> GatewayResult<Vec<OpenOrder>>;

    /// Absolute open position size; zero when flat. Errors are for transport
    /// failures, never for "no position".
    async fn get_position_amount(&self, symbol: &str) -> GatewayResult<Decimal>;

    async fn get_symbol_filters(&self, symbol: &str) -> GatewayResult<SymbolFilters>;

    async fn get_mark_price(&self, symbol: &str) -> GatewayResult<Decimal>;
}

/// Run-mode dispatch over the concrete gateways, with 429 detection reported
/// to the operator notifier on every delegated call.
pub struct GatewayBox {
    pub inner: Box<dyn ExchangeGateway + Send + Sync>,
}

impl GatewayBox {
    fn report_rate_limit(&self, operation: &str, detail: &str, err: &GatewayError) {
        let err_text = err.to_string();
        if matches!(err, GatewayError::RateLimited(_))
            || err_text.contains("429")
            || err_text.contains("Too Many Requests")
        {
            let context = format!("{} ({})", operation, detail);
            notify_rate_limit(&context, &err_text);
        }
    }

    pub fn create(cfg: &BotConfig) -> GatewayResult<Self> {
        match cfg.run_mode {
            RunMode::Paper => {
                let gateway = PaperGateway::new(*FILLED_PROBABILITY_IN_EMULATION);
                Ok(GatewayBox {
                    inner: Box::new(gateway),
                })
            }
            RunMode::Testnet => {
                let gateway = BinanceFuturesGateway::from_env(true)?;
                Ok(GatewayBox {
                    inner: Box::new(gateway),
                })
            }
            RunMode::Live => {
                let gateway = BinanceFuturesGateway::from_env(false)?;
                Ok(GatewayBox {
                    inner: Box::new(gateway),
                })
            }
        }
    }
}

#[async_trait]
impl ExchangeGateway for GatewayBox {
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> GatewayResult<()> {
        let result = self.inner.set_leverage(symbol, leverage).await;
        if let Err(ref err) = result {
            self.report_rate_limit(
                "set_leverage",
                &format!("{} | leverage={}", symbol, leverage),
                err,
            );
        }
        result
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> GatewayResult<OrderAck> {
        let result = self
            .inner
            .place_market_order(symbol, side, quantity, reduce_only)
            .await;
        if let Err(ref err) = result {
            self.report_rate_limit(
                "place_market_order",
                &format!("{} | side={} qty={}", symbol, side, quantity),
                err,
            );
        }
        result
    }

    async fn place_stop_order(
        &self,
        symbol: &str,
        side: OrderSide,
        kind: StopKind,
        stop_price: Decimal,
    ) -> GatewayResult<OrderAck> {
        let result = self
            .inner
            .place_stop_order(symbol, side, kind, stop_price)
            .await;
        if let Err(ref err) = result {
            self.report_rate_limit(
                "place_stop_order",
                &format!("{} | {} stop={}", symbol, kind, stop_price),
                err,
            );
        }
        result
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> GatewayResult<()> {
        let result = self.inner.cancel_order(symbol, order_id).await;
        if let Err(ref err) = result {
            self.report_rate_limit(
                "cancel_order",
                &format!("{} | order_id={}", symbol, order_id),
                err,
            );
        }
        result
    }

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> GatewayResult<OrderState> {
        let result = self.inner.get_order_status(symbol, order_id).await;
        if let Err(ref err) = result {
            self.report_rate_limit(
                "get_order_status",
                &format!("{} | order_id={}", symbol, order_id),
                err,
            );
        }
        result
    }

    async fn get_open_orders(&self, symbol: &str) -> GatewayResult<Vec<OpenOrder>> {
        let result = self.inner.get_open_orders(symbol).await;
        if let Err(ref err) = result {
            self.report_rate_limit("get_open_orders", symbol, err);
        }
        result
    }

    async fn get_position_amount(&self, symbol: &str) -> GatewayResult<Decimal> {
        let result = self.inner.get_position_amount(symbol).await;
        if let Err(ref err) = result {
            self.report_rate_limit("get_position_amount", symbol, err);
        }
        result
    }

    async fn get_symbol_filters(&self, symbol: &str) -> GatewayResult<SymbolFilters> {
        let result = self.inner.get_symbol_filters(symbol).await;
        if let Err(ref err) = result {
            self.report_rate_limit("get_symbol_filters", symbol, err);
        }
        result
    }

    async fn get_mark_price(&self, symbol: &str) -> GatewayResult<Decimal> {
        let result = self.inner.get_mark_price(symbol).await;
        if let Err(ref err) = result {
            self.report_rate_limit("get_mark_price", symbol, err);
        }
        result
    }
}
