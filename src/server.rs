use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::engine::{
    LadderEngine, SignalError, SignalOutcome, SignalRequest, REASON_POSITION_CONFLICT,
    REASON_QUANTITY_INVALID,
};
use crate::gateway::OrderSide;
use crate::ledger::{HistoryKind, HistoryRecord};
use crate::sizing;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<LadderEngine>,
}

pub fn router(engine: Arc<LadderEngine>) -> Router {
    let state = AppState { engine };
    Router::new()
        .route("/", get(root_banner).post(root_webhook))
        .route("/health", get(health))
        .route("/webhook", post(primary_webhook))
        .route("/webhook2", post(backup_webhook))
        .route("/state", get(current_state))
        .route("/history", get(history))
        .route("/history/stats", get(history_stats))
        .route("/levels", get(levels))
        .route("/precision/{symbol}", get(symbol_precision))
        .route("/ledger/status", get(ledger_status))
        .route("/reset", delete(reset))
        .route("/cleanup/{symbol}", post(cleanup))
        .with_state(state)
}

/// Inbound alert body. Indicators are sloppy about types, so price and time
/// come in as raw values and get coerced here.
#[derive(Debug, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub signal: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub price: Option<Value>,
    #[serde(default)]
    pub time: Option<Value>,
}

fn parse_price(raw: Option<&Value>) -> Option<Decimal> {
    match raw {
        Some(Value::Number(n)) => n.to_string().parse().ok(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

fn external_time(raw: Option<&Value>) -> String {
    match raw {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn build_request(
    default_symbol: &str,
    payload: &WebhookPayload,
    source: &'static str,
) -> Result<SignalRequest, String> {
    let signal_raw = payload.signal.as_deref().unwrap_or("");
    let side = OrderSide::from_signal(signal_raw)
        .ok_or_else(|| format!("unsupported signal '{}'", signal_raw))?;

    let price = parse_price(payload.price.as_ref()).unwrap_or(Decimal::ZERO);
    if price <= Decimal::ZERO {
        return Err("price is missing or not positive".to_string());
    }

    let symbol = payload
        .symbol
        .clone()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| default_symbol.to_string());

    Ok(SignalRequest {
        symbol,
        side,
        price,
        external_time: external_time(payload.time.as_ref()),
        source,
    })
}

fn outcome_status(outcome: &SignalOutcome) -> StatusCode {
    match outcome.reason {
        Some(REASON_QUANTITY_INVALID) => StatusCode::BAD_REQUEST,
        Some(REASON_POSITION_CONFLICT) => StatusCode::CONFLICT,
        _ => StatusCode::OK,
    }
}

fn outcome_body(outcome: &SignalOutcome) -> Value {
    serde_json::to_value(outcome).unwrap_or_else(|e| {
        log::error!("[SERVER] outcome serialization failed: {}", e);
        json!({ "status": outcome.status })
    })
}

async fn handle_signal(
    state: &AppState,
    payload: &WebhookPayload,
    source: &'static str,
) -> (StatusCode, Json<Value>) {
    log::info!(
        "[SERVER] 📥 {} webhook: signal={:?} symbol={:?}",
        source,
        payload.signal,
        payload.symbol
    );

    let req = match build_request(&state.engine.config().default_symbol, payload, source) {
        Ok(req) => req,
        Err(message) => {
            log::warn!("[SERVER] {} webhook rejected: {}", source, message);
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "status": "error", "message": message, "webhook": source })),
            );
        }
    };

    match state.engine.process_signal(&req).await {
        Ok(outcome) => (outcome_status(&outcome), Json(outcome_body(&outcome))),
        Err(SignalError::Busy(symbol)) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "status": "error",
                "message": format!("symbol {} is busy, lock timeout", symbol),
                "webhook": source,
            })),
        ),
        Err(err @ SignalError::OpenFailed(_)) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({
                "status": "error",
                "message": err.to_string(),
                "webhook": source,
            })),
        ),
    }
}

async fn primary_webhook(
    State(state): State<AppState>,
    Json(payload): Json<WebhookPayload>,
) -> (StatusCode, Json<Value>) {
    handle_signal(&state, &payload, "primary").await
}

/// Secondary webhook doubles as the keep-alive target, so a PING short
/// circuits before signal parsing.
async fn backup_webhook(
    State(state): State<AppState>,
    Json(payload): Json<WebhookPayload>,
) -> (StatusCode, Json<Value>) {
    let is_ping = payload
        .signal
        .as_deref()
        .map(|s| s.trim().eq_ignore_ascii_case("PING"))
        .unwrap_or(false);
    if is_ping {
        log::info!("[SERVER] 🔁 keep-alive ping on the backup webhook");
        return (
            StatusCode::OK,
            Json(json!({
                "status": "ping",
                "timestamp": Utc::now().to_rfc3339(),
                "message": "bot awake via backup webhook",
                "webhook": "anti-sleep",
            })),
        );
    }
    handle_signal(&state, &payload, "backup").await
}

async fn root_webhook(
    State(state): State<AppState>,
    Json(payload): Json<WebhookPayload>,
) -> (StatusCode, Json<Value>) {
    log::info!("[SERVER] 🔄 signal posted to the root path");
    handle_signal(&state, &payload, "primary").await
}

async fn root_banner() -> Json<Value> {
    Json(json!({ "message": "ladderbot - dual webhook trading endpoint" }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "timestamp": Utc::now().to_rfc3339() }))
}

async fn current_state(State(state): State<AppState>) -> Json<crate::ledger::BotState> {
    Json(state.engine.current_state())
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Json<Value> {
    let records = state.engine.history(Some(query.limit.unwrap_or(50)));
    Json(json!({ "history": records }))
}

async fn history_stats(State(state): State<AppState>) -> Json<Value> {
    let records = state.engine.history(None);
    Json(aggregate_stats(&records))
}

/// Win/loss aggregation over closed positions only; open and failure rows
/// never count as trades.
fn aggregate_stats(records: &[HistoryRecord]) -> Value {
    let closed: Vec<&HistoryRecord> = records
        .iter()
        .filter(|r| r.entry_type == HistoryKind::PositionClosed)
        .collect();
    if closed.is_empty() {
        return json!({
            "total_trades": 0,
            "total_profit": 0,
            "winning_trades": 0,
            "losing_trades": 0,
            "win_rate": 0,
        });
    }

    let total_profit: Decimal = closed.iter().map(|r| r.profit_loss).sum();
    let winning = closed.iter().filter(|r| r.profit_loss > Decimal::ZERO).count();
    let losing = closed.iter().filter(|r| r.profit_loss < Decimal::ZERO).count();
    let win_rate = (winning as f64 / closed.len() as f64 * 10000.0).round() / 100.0;

    json!({
        "total_trades": closed.len(),
        "total_profit": total_profit.round_dp(2),
        "winning_trades": winning,
        "losing_trades": losing,
        "win_rate": win_rate,
    })
}

async fn levels(State(state): State<AppState>) -> Json<Value> {
    let cfg = state.engine.config();
    Json(json!({
        "strategy": "progressive reinforcement with automatic monitoring",
        "levels": cfg.levels,
        "total_levels": cfg.max_level(),
        "total_capital": cfg.total_capital(),
    }))
}

async fn symbol_precision(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.engine.symbol_filters(&symbol).await {
        Ok(filters) => (
            StatusCode::OK,
            Json(json!({
                "symbol": symbol,
                "price_precision": sizing::price_decimals(filters.tick_size),
                "quantity_precision": sizing::price_decimals(filters.lot_step),
                "step_size": filters.lot_step,
                "tick_size": filters.tick_size,
            })),
        ),
        Err(e) => {
            log::warn!("[SERVER] precision lookup for {} failed: {}", symbol, e);
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

async fn ledger_status(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.engine.ledger_status() {
        Ok(status) => (
            StatusCode::OK,
            Json(serde_json::to_value(&status).unwrap_or_else(|_| json!({ "ok": false }))),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "ok": false, "error": format!("{:#}", e) })),
        ),
    }
}

async fn reset(State(state): State<AppState>) -> Json<Value> {
    state.engine.reset_state();
    Json(json!({ "status": "reset", "message": "positions and alerts cleared" }))
}

async fn cleanup(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Json<Value> {
    let orders_cancelled = state.engine.cleanup_symbol(&symbol).await;
    Json(json!({
        "status": "success",
        "symbol": symbol,
        "orders_cancelled": orders_cancelled,
        "message": format!("cleanup finished for {}", symbol),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).unwrap()
    }

    fn payload(signal: Option<&str>, symbol: Option<&str>, price: Option<Value>) -> WebhookPayload {
        WebhookPayload {
            signal: signal.map(str::to_string),
            symbol: symbol.map(str::to_string),
            price,
            time: None,
        }
    }

    fn closed_record(profit_loss: Decimal) -> HistoryRecord {
        HistoryRecord {
            id: 1,
            timestamp: String::new(),
            entry_type: HistoryKind::PositionClosed,
            symbol: "ETHUSDC".to_string(),
            direction: "BUY".to_string(),
            level: 1,
            entry_price: dec("2000"),
            quantity: dec("0.025"),
            capital: dec("1.0"),
            leverage: 50,
            tp_price: Decimal::ZERO,
            sl_price: Decimal::ZERO,
            close_price: Decimal::ZERO,
            close_type: "TAKE_PROFIT".to_string(),
            profit_loss,
            status: "CLOSED".to_string(),
            order_id: String::new(),
            tp_order_id: String::new(),
            sl_order_id: String::new(),
            next_reinforcement_level: 1,
            duration: String::new(),
            created_at: String::new(),
        }
    }

    #[test]
    fn requests_parse_aliases_and_default_symbol() {
        let req = build_request(
            "ETHUSDC",
            &payload(Some("long"), None, Some(json!(2000.5))),
            "primary",
        )
        .unwrap();
        assert_eq!(req.symbol, "ETHUSDC");
        assert_eq!(req.side, OrderSide::Buy);
        assert_eq!(req.price, dec("2000.5"));

        let req = build_request(
            "ETHUSDC",
            &payload(Some("SHORT"), Some("BTCUSDC"), Some(json!("65000.1"))),
            "primary",
        )
        .unwrap();
        assert_eq!(req.symbol, "BTCUSDC");
        assert_eq!(req.side, OrderSide::Sell);
        assert_eq!(req.price, dec("65000.1"));
    }

    #[test]
    fn requests_without_signal_or_price_are_rejected() {
        assert!(build_request("ETHUSDC", &payload(None, None, Some(json!(2000))), "primary").is_err());
        assert!(build_request("ETHUSDC", &payload(Some("HOLD"), None, Some(json!(2000))), "primary").is_err());
        assert!(build_request("ETHUSDC", &payload(Some("BUY"), None, None), "primary").is_err());
        assert!(build_request("ETHUSDC", &payload(Some("BUY"), None, Some(json!(0))), "primary").is_err());
        assert!(build_request("ETHUSDC", &payload(Some("BUY"), None, Some(json!(-5))), "primary").is_err());
    }

    #[test]
    fn numeric_time_becomes_part_of_the_alert_id() {
        let mut body = payload(Some("BUY"), None, Some(json!(2000)));
        body.time = Some(json!(1735689600));
        let req = build_request("ETHUSDC", &body, "primary").unwrap();
        assert_eq!(req.alert_id(), "ETHUSDC_BUY_1735689600");
    }

    #[test]
    fn outcome_reasons_map_to_http_statuses() {
        let success = SignalOutcome {
            status: "success",
            reason: None,
            message: None,
            webhook: "primary",
            details: None,
        };
        assert_eq!(outcome_status(&success), StatusCode::OK);

        let mut outcome = success.clone();
        outcome.status = "ignored";
        outcome.reason = Some(crate::engine::REASON_DUPLICATE_ALERT);
        assert_eq!(outcome_status(&outcome), StatusCode::OK);

        outcome.reason = Some(REASON_QUANTITY_INVALID);
        assert_eq!(outcome_status(&outcome), StatusCode::BAD_REQUEST);

        outcome.reason = Some(REASON_POSITION_CONFLICT);
        assert_eq!(outcome_status(&outcome), StatusCode::CONFLICT);
    }

    #[test]
    fn stats_cover_only_closed_positions() {
        let mut records = vec![
            closed_record(dec("0.15")),
            closed_record(dec("-0.15")),
            closed_record(dec("0.30")),
            closed_record(dec("0.00")),
        ];
        let mut open = closed_record(Decimal::ZERO);
        open.entry_type = HistoryKind::PositionOpened;
        records.push(open);

        let stats = aggregate_stats(&records);
        assert_eq!(stats["total_trades"], 4);
        assert_eq!(stats["winning_trades"], 2);
        assert_eq!(stats["losing_trades"], 1);
        assert_eq!(stats["total_profit"], json!(dec("0.30")));
        assert_eq!(stats["win_rate"], 50.0);
    }

    #[test]
    fn empty_history_yields_zeroed_stats() {
        let stats = aggregate_stats(&[]);
        assert_eq!(stats["total_trades"], 0);
        assert_eq!(stats["win_rate"], 0);
    }
}
