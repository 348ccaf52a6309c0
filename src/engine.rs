use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::config::{BotConfig, LadderLevel};
use crate::gateway::{ExchangeGateway, OrderSide, OrderStatus, StopKind};
use crate::ledger::{
    BotState, CloseType, HistoryDraft, HistoryKind, HistoryRecord, LedgerStatus, LedgerStore,
    PositionRecord,
};
use crate::locks::SymbolLocks;
use crate::notifier;
use crate::sizing;

pub const REASON_DUPLICATE_ALERT: &str = "duplicate_alert";
pub const REASON_POSITION_ALREADY_OPEN: &str = "position_already_open";
pub const REASON_POSITION_CONFLICT: &str = "position_conflict";
pub const REASON_QUANTITY_INVALID: &str = "quantity_invalid";

/// A validated inbound trading signal, ready for the intake sequence.
#[derive(Debug, Clone)]
pub struct SignalRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub external_time: String,
    pub source: &'static str,
}

impl SignalRequest {
    pub fn alert_id(&self) -> String {
        format!("{}_{}_{}", self.symbol, self.side.as_str(), self.external_time)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalOutcome {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub webhook: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl SignalOutcome {
    fn success(message: String, webhook: &'static str, details: serde_json::Value) -> Self {
        Self {
            status: "success",
            reason: None,
            message: Some(message),
            webhook,
            details: Some(details),
        }
    }

    fn ignored(reason: &'static str, webhook: &'static str, details: Option<serde_json::Value>) -> Self {
        Self {
            status: "ignored",
            reason: Some(reason),
            message: None,
            webhook,
            details,
        }
    }

    fn rejected(reason: &'static str, webhook: &'static str, message: String) -> Self {
        Self {
            status: "error",
            reason: Some(reason),
            message: Some(message),
            webhook,
            details: None,
        }
    }
}

#[derive(Debug)]
pub enum SignalError {
    /// The symbol lock could not be taken within the configured timeout.
    Busy(String),
    /// The open sequence failed after reaching the exchange.
    OpenFailed(String),
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SignalError::Busy(symbol) => write!(f, "symbol {} is busy, lock timeout", symbol),
            SignalError::OpenFailed(detail) => write!(f, "open failed: {}", detail),
        }
    }
}

impl std::error::Error for SignalError {}

/// What became of a just-placed entry order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillWait {
    /// Filled, with the average fill price.
    Confirmed(Decimal),
    /// The watcher's budget ran out without a conclusive answer.
    Unresolved,
    /// The order left the book without filling.
    Aborted(OrderStatus),
}

/// Resolves the fate of an entry order. Kept behind a trait so a push-based
/// notifier (user stream, webhook) can replace polling without touching the
/// open sequence.
#[async_trait]
pub trait FillWatcher: Send + Sync {
    async fn wait_for_entry(
        &self,
        gateway: &(dyn ExchangeGateway + Send + Sync),
        symbol: &str,
        order_id: &str,
    ) -> FillWait;
}

/// Bounded status polling with a fixed spacing between attempts.
pub struct StatusPoller {
    pub attempts: u32,
    pub interval: Duration,
}

#[async_trait]
impl FillWatcher for StatusPoller {
    async fn wait_for_entry(
        &self,
        gateway: &(dyn ExchangeGateway + Send + Sync),
        symbol: &str,
        order_id: &str,
    ) -> FillWait {
        for attempt in 1..=self.attempts {
            match gateway.get_order_status(symbol, order_id).await {
                Ok(state) => {
                    if state.status == OrderStatus::Filled && state.avg_price > Decimal::ZERO {
                        return FillWait::Confirmed(state.avg_price);
                    }
                    if state.status.is_terminal_failure() {
                        return FillWait::Aborted(state.status);
                    }
                    log::debug!(
                        "[ORDER] {} entry {} still {} (attempt {}/{})",
                        symbol,
                        order_id,
                        state.status,
                        attempt,
                        self.attempts
                    );
                }
                Err(e) => {
                    // read errors never abort the wait
                    log::warn!(
                        "[ORDER] {} fill poll for {} failed: {}",
                        symbol,
                        order_id,
                        e
                    );
                }
            }
            if attempt < self.attempts {
                sleep(self.interval).await;
            }
        }
        FillWait::Unresolved
    }
}

struct OpenedBracket {
    entry_order_id: String,
    entry_price: Decimal,
    tp_order_id: String,
    sl_order_id: String,
    tp_price: Decimal,
    sl_price: Decimal,
}

/// Position lifecycle engine: signal intake, bracketed opening, and the
/// reconciliation monitor all live here. One engine instance is shared
/// between the HTTP handlers and the monitor task.
pub struct LadderEngine {
    cfg: BotConfig,
    gateway: Arc<dyn ExchangeGateway + Send + Sync>,
    ledger: Arc<dyn LedgerStore>,
    locks: SymbolLocks,
    fill_watcher: Arc<dyn FillWatcher>,
}

impl LadderEngine {
    pub fn new(
        cfg: BotConfig,
        gateway: Arc<dyn ExchangeGateway + Send + Sync>,
        ledger: Arc<dyn LedgerStore>,
    ) -> Self {
        let locks = SymbolLocks::new(Duration::from_secs(cfg.lock_timeout_secs));
        let fill_watcher = Arc::new(StatusPoller {
            attempts: cfg.fill_wait_attempts,
            interval: Duration::from_secs(cfg.fill_wait_interval_secs),
        });
        Self {
            cfg,
            gateway,
            ledger,
            locks,
            fill_watcher,
        }
    }

    pub fn config(&self) -> &BotConfig {
        &self.cfg
    }

    pub fn current_state(&self) -> BotState {
        self.load_state()
    }

    pub fn history(&self, limit: Option<usize>) -> Vec<HistoryRecord> {
        match self.ledger.read_history(limit) {
            Ok(records) => records,
            Err(e) => {
                log::error!("[LEDGER] history read failed: {:#}", e);
                Vec::new()
            }
        }
    }

    pub fn ledger_status(&self) -> Result<LedgerStatus> {
        self.ledger.status()
    }

    pub async fn symbol_filters(
        &self,
        symbol: &str,
    ) -> crate::gateway::GatewayResult<crate::gateway::SymbolFilters> {
        self.gateway.get_symbol_filters(symbol).await
    }

    fn load_state(&self) -> BotState {
        match self.ledger.load() {
            Ok(state) => state,
            Err(e) => {
                log::error!("[LEDGER] state load failed, running on empty state: {:#}", e);
                BotState::default()
            }
        }
    }

    // ledger failures are logged, never bubbled; the in-memory view stays
    // authoritative for the rest of the request
    fn persist(&self, state: &BotState) {
        if let Err(e) = self.ledger.save(state) {
            log::error!("[LEDGER] state save failed: {:#}", e);
        }
    }

    fn append_history(&self, draft: HistoryDraft) {
        if let Err(e) = self.ledger.append_history(draft) {
            log::error!("[LEDGER] history append failed: {:#}", e);
        }
    }

    // ==================== signal intake ====================

    pub async fn process_signal(
        &self,
        req: &SignalRequest,
    ) -> Result<SignalOutcome, SignalError> {
        let symbol = req.symbol.as_str();

        let _guard = match self.locks.acquire(symbol).await {
            Some(guard) => guard,
            None => return Err(SignalError::Busy(symbol.to_string())),
        };

        let mut state = self.load_state();

        // dedup before anything touches the exchange
        let alert_id = req.alert_id();
        if state.is_duplicate_alert(&alert_id) {
            state.prune_alerts(Utc::now().timestamp(), self.cfg.alert_ttl_secs as i64);
            if state.is_duplicate_alert(&alert_id) {
                log::info!("[SIGNAL] duplicate alert ignored: {}", alert_id);
                return Ok(SignalOutcome::ignored(
                    REASON_DUPLICATE_ALERT,
                    req.source,
                    Some(json!({ "alert_id": alert_id })),
                ));
            }
        }
        state.record_alert(&alert_id, Utc::now().timestamp());

        // one probe serves the already-open rejection and orphan repair;
        // a transport error leaves the answer unknown
        let probe = match self.gateway.get_position_amount(symbol).await {
            Ok(amount) => Some(amount),
            Err(e) => {
                log::warn!(
                    "[SIGNAL] {} position probe failed: {}. proceeding carefully",
                    symbol,
                    e
                );
                None
            }
        };

        if let Some(amount) = probe {
            if amount > Decimal::ZERO {
                log::warn!(
                    "[SIGNAL] {} already open on the exchange ({}), ignoring signal",
                    symbol,
                    amount
                );
                return Ok(SignalOutcome::ignored(
                    REASON_POSITION_ALREADY_OPEN,
                    req.source,
                    Some(json!({ "position_amount": amount })),
                ));
            }
        }

        if probe == Some(Decimal::ZERO) {
            self.cleanup_orphan_before_open(symbol, &mut state).await;
        }

        // a staged reinforcement takes the next accepted signal, whatever
        // its direction
        if let Some(position) = state.positions.get(symbol) {
            if position.pending_reinforcement {
                let next_level = position.next_level;
                if next_level > self.cfg.max_level() {
                    log::warn!(
                        "[SIGNAL] {} staged beyond the last ladder level, resetting chain",
                        symbol
                    );
                    if let Some(position) = state.positions.get_mut(symbol) {
                        position.is_active = false;
                        position.pending_reinforcement = false;
                        position.next_level = 1;
                    }
                    self.persist(&state);
                    // falls through to a fresh level 1 entry
                } else {
                    return self
                        .activate_reinforcement(req, &alert_id, next_level, &mut state)
                        .await;
                }
            }
        }

        // last line of defense against a record the monitor has not caught
        // up with yet
        if let Some(position) = state.positions.get(symbol) {
            if position.is_active {
                let amount = match self.gateway.get_position_amount(symbol).await {
                    Ok(amount) => amount,
                    Err(e) => {
                        log::warn!("[SIGNAL] {} recheck probe failed: {}", symbol, e);
                        Decimal::ZERO
                    }
                };
                if amount != Decimal::ZERO {
                    return Ok(SignalOutcome::ignored(
                        REASON_POSITION_ALREADY_OPEN,
                        req.source,
                        Some(json!({ "position_amount": amount })),
                    ));
                }
                log::info!("[SIGNAL] {} tracked active but flat, marking inactive", symbol);
                if let Some(position) = state.positions.get_mut(symbol) {
                    position.is_active = false;
                }
            }
        }

        self.open_fresh_position(req, &alert_id, &mut state).await
    }

    /// A record marked active while the exchange is flat gets closed out
    /// before a new entry is attempted. Any leftover orders are canceled.
    async fn cleanup_orphan_before_open(&self, symbol: &str, state: &mut BotState) {
        let Some(position) = state.positions.get(symbol) else {
            return;
        };
        if !position.is_active {
            return;
        }
        log::info!(
            "[SIGNAL] {} tracked active but exchange is flat, cleaning up first",
            symbol
        );

        let canceled = self.cancel_all_orders_for_symbol(symbol).await;

        let draft = {
            let position = &state.positions[symbol];
            HistoryDraft {
                entry_type: Some(HistoryKind::PositionClosed),
                symbol: symbol.to_string(),
                direction: position.signal.as_str().to_string(),
                level: position.current_level,
                entry_price: position.entry_price,
                quantity: position.quantity,
                close_type: Some(CloseType::AutoCleanupPreOpen),
                profit_loss: Decimal::ZERO,
                next_reinforcement_level: 1,
                open_timestamp: Some(position.timestamp.clone()),
                ..HistoryDraft::default()
            }
        };
        self.append_history(draft);

        if let Some(position) = state.positions.get_mut(symbol) {
            position.is_active = false;
        }
        log::info!("[SIGNAL] {} orphan cleaned, {} orders canceled", symbol, canceled);
    }

    async fn activate_reinforcement(
        &self,
        req: &SignalRequest,
        alert_id: &str,
        level: u32,
        state: &mut BotState,
    ) -> Result<SignalOutcome, SignalError> {
        let symbol = req.symbol.as_str();
        let level_cfg = match self.cfg.level(level) {
            Some(cfg) => cfg.clone(),
            None => {
                return Err(SignalError::OpenFailed(format!(
                    "no ladder config for level {}",
                    level
                )))
            }
        };

        log::info!(
            "[SIGNAL] {} reinforcement activated: level {} direction {}",
            symbol,
            level,
            req.side
        );

        let quantity = self.sized_quantity(symbol, &level_cfg, req.price).await;
        if quantity <= Decimal::ZERO {
            return Ok(SignalOutcome::rejected(
                REASON_QUANTITY_INVALID,
                req.source,
                format!("quantity works out to zero for level {}", level),
            ));
        }

        // double check right before committing capital
        if self.position_amount_or_zero(symbol).await > Decimal::ZERO {
            log::error!(
                "[SIGNAL] {} position appeared mid-reinforcement, aborting",
                symbol
            );
            return Ok(SignalOutcome::rejected(
                REASON_POSITION_CONFLICT,
                req.source,
                "position became active during reinforcement".to_string(),
            ));
        }

        let opened = self
            .open_bracketed(symbol, req.side, level, &level_cfg, quantity)
            .await?;

        let next_staged = if level < self.cfg.max_level() { level + 1 } else { 1 };
        self.append_history(HistoryDraft {
            entry_type: Some(HistoryKind::ReinforcementOpened),
            symbol: symbol.to_string(),
            direction: req.side.as_str().to_string(),
            level,
            entry_price: opened.entry_price,
            quantity,
            capital: level_cfg.capital,
            leverage: level_cfg.leverage,
            tp_price: opened.tp_price,
            sl_price: opened.sl_price,
            order_id: opened.entry_order_id.clone(),
            tp_order_id: opened.tp_order_id.clone(),
            sl_order_id: opened.sl_order_id.clone(),
            next_reinforcement_level: next_staged,
            ..HistoryDraft::default()
        });

        if let Some(position) = state.positions.get_mut(symbol) {
            position.signal = req.side;
            position.current_level = level;
            position.is_active = true;
            position.pending_reinforcement = false;
            position.quantity = quantity;
            position.entry_price = opened.entry_price;
            position.capital = level_cfg.capital;
            position.leverage = level_cfg.leverage;
            position.order_id = opened.entry_order_id.clone();
            position.tp_order_id = Some(opened.tp_order_id.clone());
            position.sl_order_id = Some(opened.sl_order_id.clone());
            position.alert_id = alert_id.to_string();
            position.timestamp = Utc::now().to_rfc3339();
        }
        self.persist(state);

        log::info!(
            "[SIGNAL] ✅ reinforcement opened: {} {} level {}",
            symbol,
            req.side,
            level
        );

        Ok(SignalOutcome::success(
            format!("Reinforcement {} opened (level {})", req.side, level),
            req.source,
            json!({
                "symbol": symbol,
                "quantity": quantity,
                "entry_price": opened.entry_price,
                "capital": level_cfg.capital,
                "leverage": level_cfg.leverage,
                "order_id": opened.entry_order_id,
                "current_level": level,
                "type": "reinforcement",
            }),
        ))
    }

    async fn open_fresh_position(
        &self,
        req: &SignalRequest,
        alert_id: &str,
        state: &mut BotState,
    ) -> Result<SignalOutcome, SignalError> {
        let symbol = req.symbol.as_str();
        let level = 1;
        let level_cfg = match self.cfg.level(level) {
            Some(cfg) => cfg.clone(),
            None => return Err(SignalError::OpenFailed("empty ladder".to_string())),
        };

        let quantity = self.sized_quantity(symbol, &level_cfg, req.price).await;
        if quantity <= Decimal::ZERO {
            return Ok(SignalOutcome::rejected(
                REASON_QUANTITY_INVALID,
                req.source,
                "quantity works out to zero for level 1".to_string(),
            ));
        }

        if self.position_amount_or_zero(symbol).await > Decimal::ZERO {
            log::error!("[SIGNAL] {} position appeared before opening, aborting", symbol);
            return Ok(SignalOutcome::rejected(
                REASON_POSITION_CONFLICT,
                req.source,
                "position became active before opening".to_string(),
            ));
        }

        let opened = self
            .open_bracketed(symbol, req.side, level, &level_cfg, quantity)
            .await?;

        self.append_history(HistoryDraft {
            entry_type: Some(HistoryKind::PositionOpened),
            symbol: symbol.to_string(),
            direction: req.side.as_str().to_string(),
            level,
            entry_price: opened.entry_price,
            quantity,
            capital: level_cfg.capital,
            leverage: level_cfg.leverage,
            tp_price: opened.tp_price,
            sl_price: opened.sl_price,
            order_id: opened.entry_order_id.clone(),
            tp_order_id: opened.tp_order_id.clone(),
            sl_order_id: opened.sl_order_id.clone(),
            next_reinforcement_level: 2.min(self.cfg.max_level()),
            ..HistoryDraft::default()
        });

        state.positions.insert(
            symbol.to_string(),
            PositionRecord {
                signal: req.side,
                current_level: level,
                is_active: true,
                quantity,
                entry_price: opened.entry_price,
                capital: level_cfg.capital,
                leverage: level_cfg.leverage,
                order_id: opened.entry_order_id.clone(),
                tp_order_id: Some(opened.tp_order_id.clone()),
                sl_order_id: Some(opened.sl_order_id.clone()),
                alert_id: alert_id.to_string(),
                timestamp: Utc::now().to_rfc3339(),
                pending_reinforcement: false,
                next_level: 1,
            },
        );
        self.persist(state);

        log::info!("[SIGNAL] ✅ new position opened: {} {} level 1", symbol, req.side);

        Ok(SignalOutcome::success(
            format!("{} position opened (level 1)", req.side),
            req.source,
            json!({
                "symbol": symbol,
                "quantity": quantity,
                "entry_price": opened.entry_price,
                "capital": level_cfg.capital,
                "leverage": level_cfg.leverage,
                "order_id": opened.entry_order_id,
                "current_level": level,
                "type": "new_position",
            }),
        ))
    }

    async fn sized_quantity(
        &self,
        symbol: &str,
        level_cfg: &LadderLevel,
        price: Decimal,
    ) -> Decimal {
        let filters = match self.gateway.get_symbol_filters(symbol).await {
            Ok(filters) => filters,
            Err(e) => {
                log::error!("[SIGNAL] {} symbol filters unavailable: {}", symbol, e);
                return Decimal::ZERO;
            }
        };
        sizing::compute_quantity(level_cfg.capital, level_cfg.leverage, price, filters.lot_step)
    }

    async fn position_amount_or_zero(&self, symbol: &str) -> Decimal {
        match self.gateway.get_position_amount(symbol).await {
            Ok(amount) => amount,
            Err(e) => {
                log::warn!("[SIGNAL] {} position check failed: {}", symbol, e);
                Decimal::ZERO
            }
        }
    }

    // ==================== order placement ====================

    async fn open_bracketed(
        &self,
        symbol: &str,
        side: OrderSide,
        level: u32,
        level_cfg: &LadderLevel,
        quantity: Decimal,
    ) -> Result<OpenedBracket, SignalError> {
        self.gateway
            .set_leverage(symbol, level_cfg.leverage)
            .await
            .map_err(|e| SignalError::OpenFailed(format!("set_leverage: {}", e)))?;

        let entry_ack = self
            .gateway
            .place_market_order(symbol, side, quantity, false)
            .await
            .map_err(|e| SignalError::OpenFailed(format!("market order: {}", e)))?;
        log::info!(
            "[ORDER] {} {} market order placed: {} (qty {})",
            symbol,
            side,
            entry_ack.order_id,
            quantity
        );

        let entry_price = match self
            .fill_watcher
            .wait_for_entry(self.gateway.as_ref(), symbol, &entry_ack.order_id)
            .await
        {
            FillWait::Confirmed(price) => price,
            FillWait::Aborted(status) => {
                return Err(SignalError::OpenFailed(format!(
                    "entry order {} ended {} before filling",
                    entry_ack.order_id, status
                )));
            }
            FillWait::Unresolved => {
                let mark = self.gateway.get_mark_price(symbol).await.map_err(|e| {
                    SignalError::OpenFailed(format!("fill unresolved and mark price failed: {}", e))
                })?;
                log::warn!(
                    "[ORDER] {} fill unconfirmed for {}, assuming mark price {}",
                    symbol,
                    entry_ack.order_id,
                    mark
                );
                mark
            }
        };

        let decimals = match self.gateway.get_symbol_filters(symbol).await {
            Ok(filters) => sizing::price_decimals(filters.tick_size),
            Err(e) => {
                log::warn!("[ORDER] {} tick size unavailable ({}), using defaults", symbol, e);
                sizing::price_decimals(Decimal::ZERO)
            }
        };
        let (tp_raw, sl_raw) =
            sizing::bracket_prices(side, entry_price, level_cfg.tp_pct, level_cfg.sl_pct);
        let tp_price = sizing::round_price(tp_raw, decimals);
        let sl_price = sizing::round_price(sl_raw, decimals);
        let close_side = side.opposite();

        let tp_order_id = self
            .place_stop_with_retry(symbol, close_side, StopKind::TakeProfit, tp_price)
            .await;
        let sl_order_id = self
            .place_stop_with_retry(symbol, close_side, StopKind::StopLoss, sl_price)
            .await;

        match (tp_order_id, sl_order_id) {
            (Some(tp_order_id), Some(sl_order_id)) => Ok(OpenedBracket {
                entry_order_id: entry_ack.order_id,
                entry_price,
                tp_order_id,
                sl_order_id,
                tp_price,
                sl_price,
            }),
            (tp_id, sl_id) => {
                log::error!(
                    "[ORDER] 🚨 {} bracket placement failed (tp={:?} sl={:?})",
                    symbol,
                    tp_id,
                    sl_id
                );
                self.unwind_failed_open(
                    symbol,
                    side,
                    level,
                    level_cfg,
                    &entry_ack.order_id,
                    entry_price,
                    quantity,
                    tp_id.as_deref(),
                    sl_id.as_deref(),
                )
                .await;
                Err(SignalError::OpenFailed(format!(
                    "bracket orders could not be placed for {}",
                    symbol
                )))
            }
        }
    }

    async fn place_stop_with_retry(
        &self,
        symbol: &str,
        side: OrderSide,
        kind: StopKind,
        stop_price: Decimal,
    ) -> Option<String> {
        for attempt in 1..=self.cfg.bracket_retry_attempts {
            match self
                .gateway
                .place_stop_order(symbol, side, kind, stop_price)
                .await
            {
                Ok(ack) => {
                    log::info!(
                        "[ORDER] {} {} placed at {} (id {})",
                        symbol,
                        kind,
                        stop_price,
                        ack.order_id
                    );
                    return Some(ack.order_id);
                }
                Err(e) => {
                    log::warn!(
                        "[ORDER] {} {} attempt {}/{} failed: {}",
                        symbol,
                        kind,
                        attempt,
                        self.cfg.bracket_retry_attempts,
                        e
                    );
                    if attempt < self.cfg.bracket_retry_attempts {
                        sleep(Duration::from_secs(self.cfg.bracket_retry_delay_secs)).await;
                    }
                }
            }
        }
        None
    }

    /// A filled market order cannot be undone by canceling it, so after a
    /// bracket failure the entry exposure is flattened with a reduce-only
    /// offset order. Every step is best effort; the operator is notified
    /// either way.
    #[allow(clippy::too_many_arguments)]
    async fn unwind_failed_open(
        &self,
        symbol: &str,
        side: OrderSide,
        level: u32,
        level_cfg: &LadderLevel,
        entry_order_id: &str,
        entry_price: Decimal,
        quantity: Decimal,
        tp_order_id: Option<&str>,
        sl_order_id: Option<&str>,
    ) {
        if let Err(e) = self.gateway.cancel_order(symbol, entry_order_id).await {
            log::warn!("[ORDER] {} entry cancel failed: {}", symbol, e);
        }
        for order_id in [tp_order_id, sl_order_id].into_iter().flatten() {
            // a lone close-position stop must not survive the failed open
            if let Err(e) = self.gateway.cancel_order(symbol, order_id).await {
                log::warn!("[ORDER] {} bracket cancel failed for {}: {}", symbol, order_id, e);
            }
        }

        match self
            .gateway
            .place_market_order(symbol, side.opposite(), quantity, true)
            .await
        {
            Ok(ack) => log::warn!(
                "[ORDER] {} exposure offset with reduce-only order {}",
                symbol,
                ack.order_id
            ),
            Err(e) => log::error!(
                "[ORDER] 🚨 {} offset order failed, exposure may remain: {}",
                symbol,
                e
            ),
        }

        self.append_history(HistoryDraft {
            entry_type: Some(HistoryKind::OpenFailedWithExposure),
            symbol: symbol.to_string(),
            direction: side.as_str().to_string(),
            level,
            entry_price,
            quantity,
            capital: level_cfg.capital,
            leverage: level_cfg.leverage,
            order_id: entry_order_id.to_string(),
            tp_order_id: tp_order_id.unwrap_or_default().to_string(),
            sl_order_id: sl_order_id.unwrap_or_default().to_string(),
            next_reinforcement_level: 1,
            ..HistoryDraft::default()
        });

        notifier::notify_open_exposure(
            symbol,
            &format!(
                "entry {} ({} {} @ {}) left without brackets; offset attempted",
                entry_order_id, side, quantity, entry_price
            ),
        );
    }

    pub async fn cancel_all_orders_for_symbol(&self, symbol: &str) -> usize {
        let orders = match self.gateway.get_open_orders(symbol).await {
            Ok(orders) => orders,
            Err(e) => {
                log::warn!("[ORDER] {} open-orders fetch failed: {}", symbol, e);
                return 0;
            }
        };

        let mut canceled = 0;
        for order in orders {
            match self.gateway.cancel_order(symbol, &order.order_id).await {
                Ok(()) => {
                    canceled += 1;
                    log::info!(
                        "[ORDER] {} canceled {} ({})",
                        symbol,
                        order.order_id,
                        order.order_type
                    );
                }
                Err(e) => {
                    log::warn!("[ORDER] {} cancel {} failed: {}", symbol, order.order_id, e)
                }
            }
            sleep(Duration::from_millis(self.cfg.cancel_pause_ms)).await;
        }
        canceled
    }

    // ==================== operator actions ====================

    /// Cancels every resting order for the symbol and retires its record.
    pub async fn cleanup_symbol(&self, symbol: &str) -> usize {
        let canceled = self.cancel_all_orders_for_symbol(symbol).await;
        let mut state = self.load_state();
        if let Some(position) = state.positions.get_mut(symbol) {
            position.is_active = false;
            self.persist(&state);
        }
        log::info!("[STATE] {} cleaned up, {} orders canceled", symbol, canceled);
        canceled
    }

    pub fn reset_state(&self) {
        self.persist(&BotState::default());
        log::warn!("[STATE] state reset by operator");
    }

    // ==================== reconciliation monitor ====================

    pub async fn run_monitor(self: Arc<Self>) {
        log::info!(
            "[MONITOR] reconciliation loop started (tick {}s, grace {}s)",
            self.cfg.monitor_interval_secs,
            self.cfg.grace_period_secs
        );
        loop {
            self.monitor_tick().await;
            sleep(Duration::from_secs(self.cfg.monitor_interval_secs)).await;
        }
    }

    pub async fn monitor_tick(&self) {
        let mut state = self.load_state();
        let symbols: Vec<String> = state
            .positions
            .iter()
            .filter(|(_, position)| position.is_active)
            .map(|(symbol, _)| symbol.clone())
            .collect();

        for symbol in symbols {
            let Some(position) = state.positions.get(&symbol) else {
                continue;
            };
            match position_age_secs(&position.timestamp) {
                Some(age) if age < self.cfg.grace_period_secs as i64 => {
                    log::debug!("[MONITOR] {} is {}s old, inside the grace period", symbol, age);
                    continue;
                }
                None => {
                    log::warn!("[MONITOR] {} open timestamp unreadable, skipping", symbol);
                    continue;
                }
                _ => {}
            }

            // a held lock means a webhook is mid-flight for this symbol
            let Some(_guard) = self.locks.try_acquire(&symbol) else {
                continue;
            };

            if let Err(e) = self.reconcile_position(&symbol, &mut state).await {
                log::error!("[MONITOR] {} reconciliation failed: {:#}", symbol, e);
                notifier::notify_monitor_error(&format!("{}: {:#}", symbol, e));
                sleep(Duration::from_secs(self.cfg.monitor_error_pause_secs)).await;
            }
        }
    }

    async fn reconcile_position(&self, symbol: &str, state: &mut BotState) -> Result<()> {
        let snapshot = match state.positions.get(symbol) {
            Some(position) if position.is_active => position.clone(),
            _ => return Ok(()),
        };

        let tp_status = match snapshot.tp_order_id.as_deref() {
            Some(order_id) => Some(self.order_status_or_resting(symbol, order_id).await),
            None => None,
        };
        let sl_status = match snapshot.sl_order_id.as_deref() {
            Some(order_id) => Some(self.order_status_or_resting(symbol, order_id).await),
            None => None,
        };
        let tp_resting = tp_status.map(|s| s.still_resting()).unwrap_or(false);
        let sl_resting = sl_status.map(|s| s.still_resting()).unwrap_or(false);

        // probe errors count as "position still there" so nothing is closed
        // off a blind read
        let position_amount = match self.gateway.get_position_amount(symbol).await {
            Ok(amount) => amount,
            Err(e) => {
                log::warn!("[MONITOR] {} position probe failed: {}", symbol, e);
                Decimal::ONE
            }
        };

        let has_brackets = match self.gateway.get_open_orders(symbol).await {
            Ok(orders) => orders.iter().any(|order| order.is_bracket()),
            Err(e) => {
                log::warn!("[MONITOR] {} open-orders check failed: {}", symbol, e);
                true
            }
        };

        log::debug!(
            "[MONITOR] {} check: position={} tp={:?} sl={:?} brackets={}",
            symbol,
            position_amount,
            tp_status,
            sl_status,
            has_brackets
        );

        let level_cfg = self.cfg.level(snapshot.current_level).cloned();
        let (tp_close, sl_close) = match &level_cfg {
            Some(cfg) => sizing::bracket_prices(
                snapshot.signal,
                snapshot.entry_price,
                cfg.tp_pct,
                cfg.sl_pct,
            ),
            None => {
                log::error!(
                    "[MONITOR] {} has no ladder config for level {}",
                    symbol,
                    snapshot.current_level
                );
                (snapshot.entry_price, snapshot.entry_price)
            }
        };

        // take-profit first; if both legs ever read as filled only this one
        // counts and the other is canceled
        if tp_status.map(|s| s.is_fill()).unwrap_or(false) {
            log::info!("[MONITOR] 🎯 {} take-profit filled", symbol);
            if let Some(sl_order_id) = snapshot.sl_order_id.as_deref() {
                self.cancel_bracket_leg(symbol, "SL", sl_order_id).await;
            }
            self.close_position_record(
                symbol,
                state,
                &snapshot,
                CloseType::TakeProfit,
                Decimal::ZERO,
                snapshot.realized_pnl(tp_close),
                1,
            );
            return Ok(());
        }

        if sl_status.map(|s| s.is_fill()).unwrap_or(false) {
            log::info!("[MONITOR] 🛑 {} stop-loss filled", symbol);
            if let Some(tp_order_id) = snapshot.tp_order_id.as_deref() {
                self.cancel_bracket_leg(symbol, "TP", tp_order_id).await;
            }
            let staged_level = if snapshot.current_level < self.cfg.max_level() {
                snapshot.current_level + 1
            } else {
                1
            };
            self.append_history(HistoryDraft {
                entry_type: Some(HistoryKind::PositionClosed),
                symbol: symbol.to_string(),
                direction: snapshot.signal.as_str().to_string(),
                level: snapshot.current_level,
                entry_price: snapshot.entry_price,
                quantity: snapshot.quantity,
                close_type: Some(CloseType::StopLoss),
                profit_loss: snapshot.realized_pnl(sl_close),
                next_reinforcement_level: staged_level,
                open_timestamp: Some(snapshot.timestamp.clone()),
                ..HistoryDraft::default()
            });
            self.stage_reinforcement(symbol, state, snapshot.current_level);
            self.persist(state);
            return Ok(());
        }

        // manual close: flat on the exchange with nothing resting
        if !tp_resting && !sl_resting && !has_brackets && position_amount == Decimal::ZERO {
            log::info!("[MONITOR] 🎯 {} closed manually on the exchange", symbol);
            let close_price = self
                .gateway
                .get_mark_price(symbol)
                .await
                .context("mark price for manual close")?;
            self.close_position_record(
                symbol,
                state,
                &snapshot,
                CloseType::ManualClose,
                close_price,
                snapshot.realized_pnl(close_price),
                1,
            );
            return Ok(());
        }

        // flat but orders still resting: cancel them and retire the record
        if position_amount == Decimal::ZERO && (tp_resting || sl_resting || has_brackets) {
            log::info!("[MONITOR] 🧹 {} flat with leftover orders, cleaning up", symbol);
            self.cancel_all_orders_for_symbol(symbol).await;
            let close_price = self
                .gateway
                .get_mark_price(symbol)
                .await
                .context("mark price for cleanup close")?;
            self.close_position_record(
                symbol,
                state,
                &snapshot,
                CloseType::AutoCleanup,
                close_price,
                snapshot.realized_pnl(close_price),
                1,
            );
            return Ok(());
        }

        Ok(())
    }

    async fn cancel_bracket_leg(&self, symbol: &str, leg: &str, order_id: &str) {
        match self.gateway.cancel_order(symbol, order_id).await {
            Ok(()) => log::info!("[MONITOR] ✅ {} {} canceled: {}", symbol, leg, order_id),
            Err(e) => log::warn!("[MONITOR] {} {} cancel failed ({}): {}", symbol, leg, order_id, e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn close_position_record(
        &self,
        symbol: &str,
        state: &mut BotState,
        snapshot: &PositionRecord,
        close_type: CloseType,
        close_price: Decimal,
        profit_loss: Decimal,
        next_reinforcement_level: u32,
    ) {
        self.append_history(HistoryDraft {
            entry_type: Some(HistoryKind::PositionClosed),
            symbol: symbol.to_string(),
            direction: snapshot.signal.as_str().to_string(),
            level: snapshot.current_level,
            entry_price: snapshot.entry_price,
            quantity: snapshot.quantity,
            close_price,
            close_type: Some(close_type),
            profit_loss,
            next_reinforcement_level,
            open_timestamp: Some(snapshot.timestamp.clone()),
            ..HistoryDraft::default()
        });
        if let Some(position) = state.positions.get_mut(symbol) {
            position.is_active = false;
        }
        self.persist(state);
        log::info!(
            "[PNL] {} closed ({}): pnl {}",
            symbol,
            close_type.as_str(),
            profit_loss
        );
    }

    /// After a stop-loss the chain either advances to the next rung or, past
    /// the last one, ends. The staged record waits for the next accepted
    /// signal to pick its direction.
    fn stage_reinforcement(&self, symbol: &str, state: &mut BotState, closed_level: u32) {
        let Some(position) = state.positions.get_mut(symbol) else {
            return;
        };
        let next_level = closed_level + 1;
        if next_level > self.cfg.max_level() {
            log::info!(
                "[MONITOR] 💥 {} ladder exhausted at level {}, chain closed",
                symbol,
                closed_level
            );
            position.is_active = false;
            position.pending_reinforcement = false;
            return;
        }
        log::info!(
            "[MONITOR] ⏳ {} staged for reinforcement at level {}",
            symbol,
            next_level
        );
        position.is_active = false;
        position.pending_reinforcement = true;
        position.next_level = next_level;
    }

    async fn order_status_or_resting(&self, symbol: &str, order_id: &str) -> OrderStatus {
        match self.gateway.get_order_status(symbol, order_id).await {
            Ok(state) => state.status,
            Err(e) => {
                log::warn!("[MONITOR] {} status check for {} failed: {}", symbol, order_id, e);
                OrderStatus::New
            }
        }
    }
}

fn position_age_secs(opened_at: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(opened_at)
        .ok()
        .map(|t| (Utc::now() - t.with_timezone(&Utc)).num_seconds())
}

#[cfg(test)]
impl LadderEngine {
    fn test_instance(
        gateway: Arc<dyn ExchangeGateway + Send + Sync>,
        ledger: Arc<dyn LedgerStore>,
    ) -> Self {
        let cfg = BotConfig {
            run_mode: crate::config::RunMode::Paper,
            default_symbol: "ETHUSDC".to_string(),
            port: 0,
            data_dir: "test-data".to_string(),
            levels: crate::config::default_ladder(),
            lock_timeout_secs: 1,
            monitor_interval_secs: 1,
            monitor_error_pause_secs: 0,
            grace_period_secs: 0,
            fill_wait_attempts: 2,
            fill_wait_interval_secs: 0,
            bracket_retry_attempts: 2,
            bracket_retry_delay_secs: 0,
            alert_ttl_secs: 3600,
            state_backups_kept: 2,
            cancel_pause_ms: 0,
        };
        LadderEngine {
            locks: SymbolLocks::new(Duration::from_millis(50)),
            fill_watcher: Arc::new(StatusPoller {
                attempts: 2,
                interval: Duration::from_millis(1),
            }),
            cfg,
            gateway,
            ledger,
        }
    }
}
