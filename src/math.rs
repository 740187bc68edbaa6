//! Swap math and float narrowing.
//!
//! All reserve arithmetic runs on U256 with checked multiplication; the
//! final ratio is narrowed to f64 only at the reporting boundary. When a
//! 256-bit intermediate would overflow, the computation retries on
//! right-shifted operands (reduced precision, logged at debug) instead of
//! aborting detection.

use alloy::primitives::U256;
use tracing::debug;

/// Parts-per-million denominator for fee math.
const PPM: u64 = 1_000_000;

/// Q96 scale factor used by concentrated-liquidity sqrt prices.
const X96: f64 = 79228162514264337593543950336.0; // 2^96

/// Bits to drop from each operand when a checked multiply overflows.
/// One shift is always sufficient: reserves are uint112 on-chain, so
/// shifted operands fit comfortably in a 256-bit product.
const OVERFLOW_SHIFT: usize = 64;

/// Constant-product output for a given input, with the fee taken on input.
///
/// out = (in · (1 − fee) · reserve_out) / (reserve_in + in · (1 − fee))
///
/// Returns zero on zero input or empty reserves. Guaranteed `out < reserve_out`
/// for any in > 0, reserve_in > 0, reserve_out > 0, fee < 100%.
pub fn get_amount_out(amount_in: U256, reserve_in: U256, reserve_out: U256, fee_ppm: u32) -> U256 {
    if amount_in.is_zero() || reserve_in.is_zero() || reserve_out.is_zero() {
        return U256::ZERO;
    }

    let fee_keep = U256::from(PPM - fee_ppm as u64);
    let amount_in_with_fee = amount_in.saturating_mul(fee_keep);

    match amount_in_with_fee.checked_mul(reserve_out) {
        Some(numerator) => {
            let denominator = reserve_in
                .saturating_mul(U256::from(PPM))
                .saturating_add(amount_in_with_fee);
            numerator / denominator
        }
        None => {
            // Reduced-precision retry on shifted operands.
            debug!("get_amount_out overflow, falling back to shifted ratio math");
            let ain = (amount_in >> OVERFLOW_SHIFT).max(U256::from(1)) * fee_keep;
            let rin = (reserve_in >> OVERFLOW_SHIFT).max(U256::from(1));
            let rout = reserve_out >> OVERFLOW_SHIFT;
            let numerator = ain.saturating_mul(rout);
            let denominator = rin.saturating_mul(U256::from(PPM)) + ain;
            (numerator / denominator) << OVERFLOW_SHIFT
        }
    }
}

/// Input required for a desired output (inverse of `get_amount_out`).
/// Returns U256::MAX when the pool cannot supply `amount_out`.
pub fn get_amount_in(amount_out: U256, reserve_in: U256, reserve_out: U256, fee_ppm: u32) -> U256 {
    if amount_out.is_zero() || reserve_in.is_zero() || reserve_out.is_zero() {
        return U256::ZERO;
    }
    if amount_out >= reserve_out {
        return U256::MAX;
    }

    let fee_keep = U256::from(PPM - fee_ppm as u64);
    let numerator = reserve_in
        .saturating_mul(amount_out)
        .saturating_mul(U256::from(PPM));
    let denominator = (reserve_out - amount_out).saturating_mul(fee_keep);

    (numerator / denominator) + U256::from(1)
}

/// Execution-vs-spot price impact of a trade, as a fraction in [0, 1].
pub fn price_impact(amount_in: U256, reserve_in: U256, reserve_out: U256, fee_ppm: u32) -> f64 {
    if reserve_in.is_zero() || reserve_out.is_zero() {
        return 1.0;
    }

    let spot = u256_to_f64(reserve_out) / u256_to_f64(reserve_in);
    let amount_out = get_amount_out(amount_in, reserve_in, reserve_out, fee_ppm);
    if amount_out.is_zero() {
        return 1.0;
    }

    let execution = u256_to_f64(amount_out) / u256_to_f64(amount_in);
    ((spot - execution) / spot).clamp(0.0, 1.0)
}

/// Narrow a U256 to f64 by summing limbs. Lossy above 2^53, never panics,
/// always finite (max value ≈ 1.16e77).
pub fn u256_to_f64(v: U256) -> f64 {
    v.as_limbs()
        .iter()
        .enumerate()
        .fold(0.0f64, |acc, (i, &limb)| {
            acc + (limb as f64) * 2f64.powi(64 * i as i32)
        })
}

/// Ratio of two U256 values as f64, with big-integer division when the
/// direct narrowing would lose the integer part.
pub fn ratio_to_f64(numerator: U256, denominator: U256) -> f64 {
    if denominator.is_zero() {
        return 0.0;
    }
    // Split into quotient + remainder so huge numerators keep their
    // integer part exact.
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;
    u256_to_f64(quotient) + u256_to_f64(remainder) / u256_to_f64(denominator)
}

/// Decimal-adjusted constant-product spot price: token1 per token0.
pub fn spot_price(reserve0: U256, reserve1: U256, decimals0: u8, decimals1: u8) -> f64 {
    if reserve0.is_zero() {
        return 0.0;
    }
    let raw = ratio_to_f64(reserve1, reserve0);
    raw * 10f64.powi(decimals0 as i32 - decimals1 as i32)
}

/// Price of token0 in token1 from a Q64.96 sqrt price.
///
/// The float path squares `sqrtPriceX96 / 2^96` directly. When the square
/// is not representable (sqrt price beyond ~2^160), falls back to integer
/// ratio math on pre-shifted operands with reduced precision.
pub fn price_from_sqrt_x96(sqrt_price_x96: U256, decimals0: u8, decimals1: u8) -> f64 {
    let adjustment = 10f64.powi(decimals0 as i32 - decimals1 as i32);

    let s = u256_to_f64(sqrt_price_x96) / X96;
    let raw = s * s;
    if raw.is_finite() && raw > 0.0 {
        return raw * adjustment;
    }

    // Ratio-only fallback: shift 96 bits out before squaring so the
    // product stays inside 256 bits.
    debug!("sqrtPriceX96 outside safe float range, using ratio fallback");
    let shifted: U256 = sqrt_price_x96 >> 96;
    if shifted.is_zero() {
        return 0.0;
    }
    let squared = shifted.saturating_mul(shifted);
    u256_to_f64(squared) * adjustment
}

/// Maximize `profit(x) = second_leg(first_leg(x)) − x` over `[lo, hi]` by
/// ternary search on the unimodal profit curve. Integer arithmetic
/// throughout; both legs take their own fee on input.
///
/// Returns `(best_input, best_output)` where output is the second-leg
/// result; callers treat `output − input` as gross profit in the input
/// token. Returns zeroes when no positive-profit size exists in range.
#[allow(clippy::too_many_arguments)]
pub fn optimal_two_leg_size(
    lo: U256,
    hi: U256,
    buy_reserve_in: U256,
    buy_reserve_out: U256,
    buy_fee_ppm: u32,
    sell_reserve_in: U256,
    sell_reserve_out: U256,
    sell_fee_ppm: u32,
) -> (U256, U256) {
    let profit = |x: U256| -> (U256, U256) {
        let mid = get_amount_out(x, buy_reserve_in, buy_reserve_out, buy_fee_ppm);
        let out = get_amount_out(mid, sell_reserve_in, sell_reserve_out, sell_fee_ppm);
        let p = out.saturating_sub(x);
        (out, p)
    };

    let (mut lo, mut hi) = (lo, hi);
    if lo > hi {
        std::mem::swap(&mut lo, &mut hi);
    }

    // 80 iterations bounds the interval to hi/3^80 — far below one wei.
    for _ in 0..80 {
        if hi - lo <= U256::from(1) {
            break;
        }
        let third = (hi - lo) / U256::from(3);
        let m1 = lo + third;
        let m2 = hi - third;
        if profit(m1).1 < profit(m2).1 {
            lo = m1;
        } else {
            hi = m2;
        }
    }

    let (out, p) = profit(lo);
    if p.is_zero() {
        (U256::ZERO, U256::ZERO)
    } else {
        (lo, out)
    }
}
