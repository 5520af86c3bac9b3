//! Negotiated-unit time helpers.
//!
//! RSSI timeouts travel on the wire as small integers in a negotiated unit:
//! a timeout-unit exponent `k` makes a wire value `t` mean `t * 10^k`
//! microseconds. The controller converts at every use.

use std::time::{Duration, Instant};

/// Convert an RSSI time value to a wall-clock duration.
pub fn conv_time(units: u32, timeout_unit: u8) -> Duration {
    Duration::from_micros(u64::from(units) * 10u64.pow(u32::from(timeout_unit)))
}

/// True once more than `units` (in the negotiated unit) have elapsed
/// since `last`, on the monotonic clock.
pub fn time_passed(last: Instant, units: u32, timeout_unit: u8) -> bool {
    last.elapsed() > conv_time(units, timeout_unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conv_time_units() {
        assert_eq!(conv_time(5, 0), Duration::from_micros(5));
        assert_eq!(conv_time(5, 3), Duration::from_millis(5));
        assert_eq!(conv_time(2, 6), Duration::from_secs(2));
        assert_eq!(conv_time(0, 3), Duration::ZERO);
    }

    #[test]
    fn test_time_passed() {
        let past = Instant::now() - Duration::from_millis(50);
        assert!(time_passed(past, 10, 3));
        assert!(!time_passed(Instant::now(), 1000, 3));
    }
}
