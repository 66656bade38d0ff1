//! Fixed-point monetary and quantity types.
//!
//! # Motivation
//!
//! Every monetary comparison on the path from a `TradeProposal` to a
//! committed `Position` must be exact: risk limits are expressed as ratios
//! against portfolio equity, and a rounding error of even one binary-float
//! ULP at the boundary of a drawdown cap is a real-money bug. This crate
//! forbids binary floating point entirely on that path.
//!
//! Three newtypes, three fixed scales, no implicit conversion between them:
//!
//! - [`Amount`] — quote-currency totals (cash, equity, PnL, prices) at 2
//!   fractional digits (`i64` cents).
//! - [`Qty`] — instrument quantities at 8 fractional digits (`i64` at
//!   1e8 scale).
//! - [`Ratio`] — dimensionless fractions (risk limits, confidence, Kelly
//!   coefficients) at 6 fractional digits (`i64` parts-per-million).
//!
//! There is intentionally no `From<i64>` or `From<f64>` for any of these
//! types. Construct via `::new`/`::from_ppm` when the raw integer is known
//! to represent a value at that scale; convert between scales only through
//! the explicit `checked_*` operations below.

use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

// ---------------------------------------------------------------------------
// Amount — quote-currency total, 2 fractional digits (cents)
// ---------------------------------------------------------------------------

/// A fixed-point quote-currency amount at 1e-2 scale (cents).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Amount(i64);

/// 1 unit of quote currency = 100 `Amount` cents.
pub const AMOUNT_SCALE: i64 = 100;

impl Amount {
    pub const ZERO: Amount = Amount(0);
    pub const MAX: Amount = Amount(i64::MAX);
    pub const MIN: Amount = Amount(i64::MIN);

    /// Construct from a raw `i64` count of cents.
    #[inline]
    pub const fn new(cents: i64) -> Self {
        Amount(cents)
    }

    /// Construct from whole units plus a cents remainder (e.g. `Amount::from_units_cents(1200000, 0)`).
    #[inline]
    pub const fn from_units_cents(units: i64, cents: i64) -> Self {
        Amount(units * AMOUNT_SCALE + cents)
    }

    #[inline]
    pub const fn raw(self) -> i64 {
        self.0
    }

    #[inline]
    pub fn saturating_add(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_add(rhs.0))
    }

    #[inline]
    pub fn saturating_sub(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_sub(rhs.0))
    }

    #[inline]
    pub fn checked_add(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    #[inline]
    pub fn checked_sub(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_sub(rhs.0).map(Amount)
    }

    #[inline]
    pub fn abs(self) -> Amount {
        Amount(self.0.saturating_abs())
    }

    #[inline]
    pub fn is_non_negative(self) -> bool {
        self.0 >= 0
    }

    #[inline]
    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn min(self, other: Amount) -> Amount {
        if self <= other {
            self
        } else {
            other
        }
    }

    pub fn max(self, other: Amount) -> Amount {
        if self >= other {
            self
        } else {
            other
        }
    }

    /// Multiply this amount by a dimensionless [`Ratio`] (e.g. `equity * max_single_position_pct`).
    ///
    /// Rounds towards zero. Returns `None` on overflow — callers in the risk
    /// and sizing path must handle `None` explicitly rather than silently
    /// clamping, since an overflow here means a limit or a proposal is
    /// corrupted input, not a routine saturation.
    #[inline]
    pub fn checked_mul_ratio(self, r: Ratio) -> Option<Amount> {
        let prod = (self.0 as i128) * (r.0 as i128);
        let scaled = prod / RATIO_SCALE as i128;
        if scaled > i64::MAX as i128 || scaled < i64::MIN as i128 {
            None
        } else {
            Some(Amount(scaled as i64))
        }
    }

    /// Ratio of `self / other` (e.g. `current_drawdown_pct = (peak - total) / peak`).
    ///
    /// Returns `None` when `other` is zero — callers must apply their own
    /// zero-equity policy (the Risk Gate treats this as `InsufficientEquity`).
    #[inline]
    pub fn checked_div_to_ratio(self, other: Amount) -> Option<Ratio> {
        if other.0 == 0 {
            return None;
        }
        let scaled = (self.0 as i128) * (RATIO_SCALE as i128) / (other.0 as i128);
        if scaled > i64::MAX as i128 || scaled < i64::MIN as i128 {
            None
        } else {
            Some(Ratio(scaled as i64))
        }
    }

    /// Quantity obtained by dividing this amount (a position value) by a
    /// per-unit `price`, floored to a multiple of `lot_size`.
    ///
    /// Returns `None` if `price` is non-positive or the result would
    /// overflow. Rounding is always down (towards zero lots), never up —
    /// a sized position must never exceed its bounded value.
    pub fn checked_div_price_floor_lot(self, price: Amount, lot_size: Qty) -> Option<Qty> {
        if price.0 <= 0 || lot_size.0 <= 0 {
            return None;
        }
        // value_cents * QTY_SCALE / price_cents = qty_raw
        let raw = (self.0 as i128) * (QTY_SCALE as i128) / (price.0 as i128);
        if raw > i64::MAX as i128 {
            return None;
        }
        let raw = raw as i64;
        let floored = raw - raw.rem_euclid(lot_size.0);
        Some(Qty(floored.max(0)))
    }
}

impl Add for Amount {
    type Output = Amount;
    #[inline]
    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl Sub for Amount {
    type Output = Amount;
    #[inline]
    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0 - rhs.0)
    }
}

impl Neg for Amount {
    type Output = Amount;
    #[inline]
    fn neg(self) -> Amount {
        Amount(-self.0)
    }
}

impl AddAssign for Amount {
    #[inline]
    fn add_assign(&mut self, rhs: Amount) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Amount {
    #[inline]
    fn sub_assign(&mut self, rhs: Amount) {
        self.0 -= rhs.0;
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let units = self.0 / AMOUNT_SCALE;
        let frac = (self.0 % AMOUNT_SCALE).abs();
        if self.0 < 0 && units == 0 {
            write!(f, "-{units}.{frac:02}")
        } else {
            write!(f, "{units}.{frac:02}")
        }
    }
}

// ---------------------------------------------------------------------------
// Qty — instrument quantity, 8 fractional digits
// ---------------------------------------------------------------------------

/// A fixed-point instrument quantity at 1e-8 scale.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Qty(i64);

pub const QTY_SCALE: i64 = 100_000_000;

impl Qty {
    pub const ZERO: Qty = Qty(0);
    pub const MAX: Qty = Qty(i64::MAX);
    pub const MIN: Qty = Qty(i64::MIN);

    #[inline]
    pub const fn new(raw: i64) -> Self {
        Qty(raw)
    }

    #[inline]
    pub const fn raw(self) -> i64 {
        self.0
    }

    #[inline]
    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn saturating_add(self, rhs: Qty) -> Qty {
        Qty(self.0.saturating_add(rhs.0))
    }

    #[inline]
    pub fn saturating_sub(self, rhs: Qty) -> Qty {
        Qty(self.0.saturating_sub(rhs.0))
    }

    pub fn min(self, other: Qty) -> Qty {
        if self <= other {
            self
        } else {
            other
        }
    }

    /// Notional value of this quantity at `price` (e.g. `quantity * entry_price`).
    ///
    /// Returns `None` on overflow.
    pub fn checked_mul_price(self, price: Amount) -> Option<Amount> {
        let prod = (self.0 as i128) * (price.raw() as i128);
        let scaled = prod / QTY_SCALE as i128;
        if scaled > i64::MAX as i128 || scaled < i64::MIN as i128 {
            None
        } else {
            Some(Amount::new(scaled as i64))
        }
    }
}

impl Add for Qty {
    type Output = Qty;
    #[inline]
    fn add(self, rhs: Qty) -> Qty {
        Qty(self.0 + rhs.0)
    }
}

impl Sub for Qty {
    type Output = Qty;
    #[inline]
    fn sub(self, rhs: Qty) -> Qty {
        Qty(self.0 - rhs.0)
    }
}

impl std::fmt::Display for Qty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let units = self.0 / QTY_SCALE;
        let frac = (self.0 % QTY_SCALE).abs();
        write!(f, "{units}.{frac:08}")
    }
}

// ---------------------------------------------------------------------------
// Ratio — dimensionless fraction, 6 fractional digits (parts-per-million)
// ---------------------------------------------------------------------------

/// A dimensionless fixed-point fraction at 1e-6 scale (parts-per-million).
///
/// Used for risk limit thresholds, confidence, Kelly coefficients, leverage
/// multiples and every other "percentage-shaped" quantity in the risk and
/// sizing path. `Ratio::new_whole(1) == Ratio::ONE` represents 100%.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Ratio(i64);

pub const RATIO_SCALE: i64 = 1_000_000;

impl Ratio {
    pub const ZERO: Ratio = Ratio(0);
    pub const ONE: Ratio = Ratio(RATIO_SCALE);

    /// Construct directly from parts-per-million.
    #[inline]
    pub const fn from_ppm(ppm: i64) -> Self {
        Ratio(ppm)
    }

    /// Construct from a `(numerator, denominator)` pair representing an
    /// exact decimal fraction already known at call sites (e.g. parsed from
    /// a configuration file as `"0.15"` -> `Ratio::from_decimal_str`).
    pub fn from_decimal_str(s: &str) -> Option<Ratio> {
        let s = s.trim();
        let neg = s.starts_with('-');
        let s = s.strip_prefix('-').unwrap_or(s);
        let mut parts = s.splitn(2, '.');
        let int_part = parts.next()?;
        let frac_part = parts.next().unwrap_or("");
        if frac_part.len() > 6 {
            return None;
        }
        let int_val: i64 = int_part.parse().ok()?;
        let mut frac_digits = frac_part.to_string();
        while frac_digits.len() < 6 {
            frac_digits.push('0');
        }
        let frac_val: i64 = if frac_digits.is_empty() {
            0
        } else {
            frac_digits.parse().ok()?
        };
        let mut raw = int_val * RATIO_SCALE + frac_val;
        if neg {
            raw = -raw;
        }
        Some(Ratio(raw))
    }

    #[inline]
    pub const fn raw(self) -> i64 {
        self.0
    }

    #[inline]
    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    #[inline]
    pub fn abs(self) -> Ratio {
        Ratio(self.0.saturating_abs())
    }

    pub fn clamp(self, lo: Ratio, hi: Ratio) -> Ratio {
        if self < lo {
            lo
        } else if self > hi {
            hi
        } else {
            self
        }
    }

    pub fn min(self, other: Ratio) -> Ratio {
        if self <= other {
            self
        } else {
            other
        }
    }

    pub fn max(self, other: Ratio) -> Ratio {
        if self >= other {
            self
        } else {
            other
        }
    }

    /// Product of two ratios (e.g. `fractional_kelly_coeff * kelly_fraction`).
    pub fn checked_mul(self, other: Ratio) -> Option<Ratio> {
        let prod = (self.0 as i128) * (other.0 as i128) / RATIO_SCALE as i128;
        if prod > i64::MAX as i128 || prod < i64::MIN as i128 {
            None
        } else {
            Some(Ratio(prod as i64))
        }
    }

    /// Quotient `self / other` (e.g. `vol_target / volatility_forecast`).
    pub fn checked_div(self, other: Ratio) -> Option<Ratio> {
        if other.0 == 0 {
            return None;
        }
        let scaled = (self.0 as i128) * (RATIO_SCALE as i128) / (other.0 as i128);
        if scaled > i64::MAX as i128 || scaled < i64::MIN as i128 {
            None
        } else {
            Some(Ratio(scaled as i64))
        }
    }
}

impl Add for Ratio {
    type Output = Ratio;
    #[inline]
    fn add(self, rhs: Ratio) -> Ratio {
        Ratio(self.0 + rhs.0)
    }
}

impl Sub for Ratio {
    type Output = Ratio;
    #[inline]
    fn sub(self, rhs: Ratio) -> Ratio {
        Ratio(self.0 - rhs.0)
    }
}

impl Neg for Ratio {
    type Output = Ratio;
    #[inline]
    fn neg(self) -> Ratio {
        Ratio(-self.0)
    }
}

impl std::fmt::Display for Ratio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let units = self.0 / RATIO_SCALE;
        let frac = (self.0 % RATIO_SCALE).abs();
        write!(f, "{units}.{frac:06}")
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_add_sub_roundtrip() {
        let a = Amount::new(10_000_00);
        let b = Amount::new(2_500_00);
        assert_eq!((a + b) - b, a);
    }

    #[test]
    fn amount_display_formats_cents() {
        assert_eq!(format!("{}", Amount::new(150)), "1.50");
        assert_eq!(format!("{}", Amount::new(-275)), "-2.75");
        assert_eq!(format!("{}", Amount::new(-50)), "-0.50");
    }

    #[test]
    fn ratio_from_decimal_str_exact() {
        let r = Ratio::from_decimal_str("0.15").unwrap();
        assert_eq!(r, Ratio::from_ppm(150_000));
    }

    #[test]
    fn ratio_from_decimal_str_negative() {
        let r = Ratio::from_decimal_str("-0.05").unwrap();
        assert_eq!(r.raw(), -50_000);
    }

    #[test]
    fn amount_div_to_ratio_exact_boundary() {
        // (100000 - 84000) / 100000 = 0.16 exactly.
        let peak = Amount::from_units_cents(100_000, 0);
        let total = Amount::from_units_cents(84_000, 0);
        let dd = (peak - total).checked_div_to_ratio(peak).unwrap();
        assert_eq!(dd, Ratio::from_decimal_str("0.16").unwrap());
    }

    #[test]
    fn amount_div_to_ratio_zero_denominator_is_none() {
        assert_eq!(Amount::new(100).checked_div_to_ratio(Amount::ZERO), None);
    }

    #[test]
    fn amount_mul_ratio_computes_fraction_of_equity() {
        let equity = Amount::from_units_cents(100_000, 0);
        let cap = Ratio::from_decimal_str("0.05").unwrap();
        let bound = equity.checked_mul_ratio(cap).unwrap();
        assert_eq!(bound, Amount::from_units_cents(5_000, 0));
    }

    #[test]
    fn qty_mul_price_computes_notional() {
        // 0.5 units @ $1,200,000.00 = $600,000.00
        let qty = Qty::new(50_000_000); // 0.5 at 1e8 scale
        let price = Amount::from_units_cents(1_200_000, 0);
        let notional = qty.checked_mul_price(price).unwrap();
        assert_eq!(notional, Amount::from_units_cents(600_000, 0));
    }

    #[test]
    fn amount_div_price_floor_lot_rounds_down() {
        let value = Amount::from_units_cents(3_340, 0);
        let price = Amount::from_units_cents(1_200_000, 0);
        let lot = Qty::new(100_000); // 0.001 lot size at 1e8 scale
        let qty = value.checked_div_price_floor_lot(price, lot).unwrap();
        // raw quantity = 3340/1200000 * 1e8 = 278333.33.. -> floor to lot 100_000 -> 200_000
        assert_eq!(qty, Qty::new(200_000));
    }

    #[test]
    fn amount_div_price_floor_lot_rejects_nonpositive_price() {
        let value = Amount::new(1_000);
        assert_eq!(
            value.checked_div_price_floor_lot(Amount::ZERO, Qty::new(1)),
            None
        );
    }

    #[test]
    fn ratio_clamp_into_zero_one() {
        let r = Ratio::from_decimal_str("1.5").unwrap();
        assert_eq!(r.clamp(Ratio::ZERO, Ratio::ONE), Ratio::ONE);
        let neg = Ratio::from_decimal_str("-0.2").unwrap();
        assert_eq!(neg.clamp(Ratio::ZERO, Ratio::ONE), Ratio::ZERO);
    }

    #[test]
    fn ratio_checked_mul_and_div() {
        let half = Ratio::from_decimal_str("0.5").unwrap();
        let quarter = half.checked_mul(half).unwrap();
        assert_eq!(quarter, Ratio::from_decimal_str("0.25").unwrap());
        let two = Ratio::from_decimal_str("1.0")
            .unwrap()
            .checked_div(half)
            .unwrap();
        assert_eq!(two, Ratio::from_decimal_str("2.0").unwrap());
    }

    #[test]
    fn ratio_abs_is_sign_insensitive() {
        let neg = Ratio::from_decimal_str("-0.80").unwrap();
        assert_eq!(neg.abs(), Ratio::from_decimal_str("0.80").unwrap());
    }

    #[test]
    fn amount_min_max() {
        let a = Amount::new(10);
        let b = Amount::new(20);
        assert_eq!(a.min(b), a);
        assert_eq!(a.max(b), b);
    }
}
