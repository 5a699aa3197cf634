use fixed::types::I32F32;

/// Q32.32 fixed-point: 32 integer bits, 32 fractional bits.
///
/// Every simulated quantity goes through this type so that event ordering is
/// total and a replayed run is bit-identical to the original.
pub type Fixed64 = I32F32;

/// Simulated time in hours.
pub type Hours = Fixed64;

/// An amount of some item, expressed in a unit carried alongside it.
pub type Quantity = Fixed64;

/// Energy in kilowatt-hours.
pub type Kwh = Fixed64;

/// Convert an f64 to Fixed64. Use only at the API edge, never in the tick loop.
#[inline]
pub fn f64_to_fixed64(v: f64) -> Fixed64 {
    Fixed64::from_num(v)
}

/// Convert Fixed64 to f64. Use only for display and reporting.
#[inline]
pub fn fixed64_to_f64(v: Fixed64) -> f64 {
    v.to_num::<f64>()
}

/// Checked multiplication for Fixed64 that returns None on overflow.
#[inline]
pub fn checked_mul_64(a: Fixed64, b: Fixed64) -> Option<Fixed64> {
    a.checked_mul(b)
}

/// Checked division for Fixed64 that returns None on zero divisor.
#[inline]
pub fn checked_div_64(a: Fixed64, b: Fixed64) -> Option<Fixed64> {
    a.checked_div(b)
}

/// Length of the overlap between `[a0, a1)` and `[b0, b1)`; zero if disjoint.
#[inline]
pub fn overlap(a0: Fixed64, a1: Fixed64, b0: Fixed64, b1: Fixed64) -> Fixed64 {
    let lo = a0.max(b0);
    let hi = a1.min(b1);
    if hi > lo { hi - lo } else { Fixed64::ZERO }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed64_basic_arithmetic() {
        let a = f64_to_fixed64(1.5);
        let b = f64_to_fixed64(2.0);
        assert_eq!(fixed64_to_f64(a + b), 3.5);
    }

    #[test]
    fn fixed64_checked_mul_overflow() {
        let two = f64_to_fixed64(2.0);
        assert!(checked_mul_64(Fixed64::MAX, two).is_none());
    }

    #[test]
    fn fixed64_checked_div_by_zero() {
        assert!(checked_div_64(Fixed64::ONE, Fixed64::ZERO).is_none());
    }

    #[test]
    fn fixed64_ordering_is_total() {
        let mut times = vec![f64_to_fixed64(2.5), f64_to_fixed64(0.5), f64_to_fixed64(1.0)];
        times.sort();
        assert_eq!(times, vec![f64_to_fixed64(0.5), f64_to_fixed64(1.0), f64_to_fixed64(2.5)]);
    }

    #[test]
    fn overlap_of_intervals() {
        let f = f64_to_fixed64;
        assert_eq!(overlap(f(0.0), f(5.0), f(2.0), f(7.0)), f(3.0));
        assert_eq!(overlap(f(0.0), f(5.0), f(5.0), f(10.0)), Fixed64::ZERO);
        assert_eq!(overlap(f(3.0), f(4.0), f(0.0), f(10.0)), f(1.0));
    }

    #[test]
    fn fixed64_determinism() {
        let a = f64_to_fixed64(1.0 / 3.0);
        let b = f64_to_fixed64(1.0 / 3.0);
        assert_eq!(a * f64_to_fixed64(3.0), b * f64_to_fixed64(3.0));
    }
}
