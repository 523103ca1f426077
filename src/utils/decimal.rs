//! Contract-precision rounding and fee-aware sizing for orders.

use rust_decimal::Decimal;

/// Round a price to the nearest multiple of the contract's price tick.
pub fn round_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    (price / tick).round() * tick
}

/// Largest multiple of `step` not above `size`. Opening sizes never exceed the budget.
pub fn floor_to_step(size: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return size;
    }
    (size / step).floor() * step
}

/// Smallest multiple of `step` not below `size`. A reduction must cover at least `size`.
pub fn ceil_to_step(size: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return size;
    }
    (size / step).ceil() * step
}

/// Margin that, together with the taker fee on its leveraged notional, fits in `budget`.
pub fn margin_net_of_fees(budget: Decimal, leverage: u32, fee_rate: Decimal) -> Decimal {
    let load = Decimal::ONE + Decimal::from(leverage) * fee_rate;
    if load <= Decimal::ZERO {
        return budget;
    }
    budget / load
}
