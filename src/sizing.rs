use rust_decimal::Decimal;

use crate::gateway::OrderSide;

const FALLBACK_PRICE_DECIMALS: u32 = 2;

/// Order size for a ladder rung: capital * leverage worth of contracts at
/// the given price, floored to the exchange lot step. Never rounds up, so
/// the placed notional never exceeds the configured one. Returns zero when
/// the step or price cannot be used; callers must reject zero quantities.
pub fn compute_quantity(
    capital: Decimal,
    leverage: u32,
    price: Decimal,
    lot_step: Decimal,
) -> Decimal {
    if price <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let notional = capital * Decimal::from(leverage);
    let raw = notional / price;
    floor_to_step(raw, lot_step)
}

pub fn floor_to_step(quantity: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    ((quantity / step).floor() * step).normalize()
}

/// Decimal places implied by a tick size. A tick of 1 or more means whole
/// prices; below 1 the count of significant fractional digits applies
/// (0.00010000 parses to four decimals).
pub fn price_decimals(tick_size: Decimal) -> u32 {
    if tick_size <= Decimal::ZERO {
        return FALLBACK_PRICE_DECIMALS;
    }
    if tick_size >= Decimal::ONE {
        return 0;
    }
    tick_size.normalize().scale()
}

pub fn round_price(price: Decimal, decimals: u32) -> Decimal {
    price.round_dp(decimals)
}

pub fn round_pnl(pnl: Decimal) -> Decimal {
    pnl.round_dp(4)
}

/// Unrounded TP and SL trigger prices for an entry. BUY takes profit above
/// and stops below; SELL is mirrored.
pub fn bracket_prices(
    side: OrderSide,
    entry: Decimal,
    tp_pct: Decimal,
    sl_pct: Decimal,
) -> (Decimal, Decimal) {
    match side {
        OrderSide::Buy => (
            entry * (Decimal::ONE + tp_pct),
            entry * (Decimal::ONE - sl_pct),
        ),
        OrderSide::Sell => (
            entry * (Decimal::ONE - tp_pct),
            entry * (Decimal::ONE + sl_pct),
        ),
    }
}
