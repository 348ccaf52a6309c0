use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Mutex;

use crate::gateway::{
    ExchangeGateway, GatewayResult, OpenOrder, OrderAck, OrderSide, OrderState, OrderStatus,
    StopKind, SymbolFilters,
};

#[derive(Debug, Clone)]
struct PaperOrder {
    symbol: String,
    order_type: String,
    status: OrderStatus,
    avg_price: Decimal,
    executed_qty: Decimal,
    stop_price: Decimal,
}

#[derive(Debug, Default)]
struct PaperState {
    mark_prices: HashMap<String, Decimal>,
    orders: HashMap<String, PaperOrder>,
    positions: HashMap<String, Decimal>,
    leverage: HashMap<String, u32>,
}

/// In-memory exchange emulation for paper runs. Market orders fill at the
/// current mark price (subject to the configured fill probability); stop
/// orders rest until a test hook triggers them.
pub struct PaperGateway {
    state: Mutex<PaperState>,
    fill_probability: Decimal,
    next_id: AtomicUsize,
}

impl PaperGateway {
    pub fn new(fill_probability: Decimal) -> Self {
        Self {
            state: Mutex::new(PaperState::default()),
            fill_probability,
            next_id: AtomicUsize::new(1),
        }
    }

    fn next_order_id(&self) -> String {
        format!("paper-{}", self.next_id.fetch_add(1, AtomicOrdering::SeqCst))
    }

    fn should_fill(&self) -> bool {
        let p = self.fill_probability.to_f64().unwrap_or(1.0);
        p >= 1.0 || rand::random::<f64>() < p
    }

    fn mark_price_or_default(state: &PaperState, symbol: &str) -> Decimal {
        state
            .mark_prices
            .get(symbol)
            .copied()
            .unwrap_or_else(|| Decimal::new(2000, 0))
    }

    pub fn set_mark_price(&self, symbol: &str, price: Decimal) {
        let mut state = self.state.lock().unwrap();
        state.mark_prices.insert(symbol.to_string(), price);
    }

    /// Emulates the exchange executing a resting stop order: the order
    /// reports TRIGGERED and the position is flattened (close-position
    /// semantics).
    pub fn trigger_stop(&self, symbol: &str, order_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(order) = state.orders.get_mut(order_id) {
            order.status = OrderStatus::Triggered;
            order.avg_price = order.stop_price;
            log::info!(
                "[PAPER_FILL] stop {} on {} triggered at {}",
                order_id,
                symbol,
                order.stop_price
            );
        }
        state.positions.insert(symbol.to_string(), Decimal::ZERO);
    }

    /// Emulates the operator flattening the position from the exchange app.
    pub fn close_position(&self, symbol: &str) {
        let mut state = self.state.lock().unwrap();
        state.positions.insert(symbol.to_string(), Decimal::ZERO);
    }
}

#[async_trait]
impl ExchangeGateway for PaperGateway {
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> GatewayResult<()> {
        let mut state = self.state.lock().unwrap();
        state.leverage.insert(symbol.to_string(), leverage);
        Ok(())
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        reduce_only: bool,
    ) -> GatewayResult<OrderAck> {
        let order_id = self.next_order_id();
        let mut state = self.state.lock().unwrap();
        let mark = Self::mark_price_or_default(&state, symbol);

        let (status, avg_price, executed_qty) = if self.should_fill() {
            (OrderStatus::Filled, mark, quantity)
        } else {
            (OrderStatus::New, Decimal::ZERO, Decimal::ZERO)
        };

        if status == OrderStatus::Filled {
            let current = state
                .positions
                .get(symbol)
                .copied()
                .unwrap_or(Decimal::ZERO);
            let updated = if reduce_only {
                // reduce toward flat, never flip the sign
                if current > Decimal::ZERO {
                    (current - quantity).max(Decimal::ZERO)
                } else {
                    (current + quantity).min(Decimal::ZERO)
                }
            } else {
                match side {
                    OrderSide::Buy => current + quantity,
                    OrderSide::Sell => current - quantity,
                }
            };
            state.positions.insert(symbol.to_string(), updated);
            log::info!(
                "[PAPER_FILL] symbol={}, side={}, qty={}, price={}",
                symbol,
                side,
                quantity,
                mark
            );
        }

        state.orders.insert(
            order_id.clone(),
            PaperOrder {
                symbol: symbol.to_string(),
                order_type: "MARKET".to_string(),
                status,
                avg_price,
                executed_qty,
                stop_price: Decimal::ZERO,
            },
        );
        Ok(OrderAck { order_id })
    }

    async fn place_stop_order(
        &self,
        symbol: &str,
        _side: OrderSide,
        kind: StopKind,
        stop_price: Decimal,
    ) -> GatewayResult<OrderAck> {
        let order_id = self.next_order_id();
        let mut state = self.state.lock().unwrap();
        state.orders.insert(
            order_id.clone(),
            PaperOrder {
                symbol: symbol.to_string(),
                order_type: kind.as_wire().to_string(),
                status: OrderStatus::New,
                avg_price: Decimal::ZERO,
                executed_qty: Decimal::ZERO,
                stop_price,
            },
        );
        Ok(OrderAck { order_id })
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> GatewayResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(order) = state.orders.get_mut(order_id) {
            if matches!(order.status, OrderStatus::New | OrderStatus::PartiallyFilled) {
                order.status = OrderStatus::Canceled;
            }
        }
        // unknown ids are treated as already gone, like the real exchange path
        Ok(())
    }

    async fn get_order_status(&self, _symbol: &str, order_id: &str) -> GatewayResult<OrderState> {
        let state = self.state.lock().unwrap();
        match state.orders.get(order_id) {
            Some(order) => Ok(OrderState {
                status: order.status,
                avg_price: order.avg_price,
                executed_qty: order.executed_qty,
            }),
            None => Ok(OrderState::not_found()),
        }
    }

    async fn get_open_orders(&self, symbol: &str) -> GatewayResult<Vec<OpenOrder>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .orders
            .iter()
            .filter(|(_, order)| {
                order.symbol == symbol
                    && matches!(order.status, OrderStatus::New | OrderStatus::PartiallyFilled)
            })
            .map(|(id, order)| OpenOrder {
                order_id: id.clone(),
                order_type: order.order_type.clone(),
            })
            .collect())
    }

    async fn get_position_amount(&self, symbol: &str) -> GatewayResult<Decimal> {
        let state = self.state.lock().unwrap();
        Ok(state
            .positions
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO)
            .abs())
    }

    async fn get_symbol_filters(&self, _symbol: &str) -> GatewayResult<SymbolFilters> {
        Ok(SymbolFilters {
            lot_step: Decimal::new(1, 3),
            tick_size: Decimal::new(1, 2),
        })
    }

    async fn get_mark_price(&self, symbol: &str) -> GatewayResult<Decimal> {
        let state = self.state.lock().unwrap();
        Ok(Self::mark_price_or_default(&state, symbol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[tokio::test]
    async fn market_order_fills_at_mark_price() {
        let gw = PaperGateway::new(Decimal::ONE);
        gw.set_mark_price("ETHUSDC", dec("2000"));

        let ack = gw
            .place_market_order("ETHUSDC", OrderSide::Buy, dec("0.025"), false)
            .await
            .unwrap();
        let state = gw.get_order_status("ETHUSDC", &ack.order_id).await.unwrap();

        assert_eq!(state.status, OrderStatus::Filled);
        assert_eq!(state.avg_price, dec("2000"));
        assert_eq!(
            gw.get_position_amount("ETHUSDC").await.unwrap(),
            dec("0.025")
        );
    }

    #[tokio::test]
    async fn zero_fill_probability_leaves_order_resting() {
        let gw = PaperGateway::new(Decimal::ZERO);
        let ack = gw
            .place_market_order("ETHUSDC", OrderSide::Buy, dec("0.025"), false)
            .await
            .unwrap();
        let state = gw.get_order_status("ETHUSDC", &ack.order_id).await.unwrap();

        assert_eq!(state.status, OrderStatus::New);
        assert_eq!(gw.get_position_amount("ETHUSDC").await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn stop_orders_rest_until_triggered() {
        let gw = PaperGateway::new(Decimal::ONE);
        gw.set_mark_price("ETHUSDC", dec("2000"));
        gw.place_market_order("ETHUSDC", OrderSide::Buy, dec("0.025"), false)
            .await
            .unwrap();

        let tp = gw
            .place_stop_order("ETHUSDC", OrderSide::Sell, StopKind::TakeProfit, dec("2006"))
            .await
            .unwrap();
        let open = gw.get_open_orders("ETHUSDC").await.unwrap();
        assert!(open.iter().any(|o| o.order_id == tp.order_id));
        assert!(open.iter().any(|o| o.is_bracket()));

        gw.trigger_stop("ETHUSDC", &tp.order_id);
        let state = gw.get_order_status("ETHUSDC", &tp.order_id).await.unwrap();
        assert_eq!(state.status, OrderStatus::Triggered);
        assert_eq!(gw.get_position_amount("ETHUSDC").await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn reduce_only_never_flips_the_position() {
        let gw = PaperGateway::new(Decimal::ONE);
        gw.place_market_order("ETHUSDC", OrderSide::Buy, dec("0.025"), false)
            .await
            .unwrap();
        gw.place_market_order("ETHUSDC", OrderSide::Sell, dec("0.1"), true)
            .await
            .unwrap();

        assert_eq!(gw.get_position_amount("ETHUSDC").await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn cancel_of_unknown_order_is_tolerated() {
        let gw = PaperGateway::new(Decimal::ONE);
        assert!(gw.cancel_order("ETHUSDC", "paper-999").await.is_ok());

        let ack = gw
            .place_stop_order("ETHUSDC", OrderSide::Sell, StopKind::StopLoss, dec("1994"))
            .await
            .unwrap();
        gw.cancel_order("ETHUSDC", &ack.order_id).await.unwrap();
        let state = gw.get_order_status("ETHUSDC", &ack.order_id).await.unwrap();
        assert_eq!(state.status, OrderStatus::Canceled);
    }
}
