//! Clock divider synthesis.
//!
//! The controller divides its base clock by `(counter + 1) * (prescale + 1)`
//! where both fields have fixed register widths. Given a requested maximum
//! frequency this module picks the field values whose achievable frequency is
//! closest to the request without exceeding it.

use super::FamilyConfig;

/// Register-encoded divider fields plus the frequency they achieve.
///
/// Fields store the divisor value minus one, the way the hardware encodes
/// them; the achievable frequency is
/// `base / ((counter + 1) * (prescale + 1))`, truncated to whole hertz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClockDivider {
    pub prescale: u16,
    pub counter: u8,
    pub high_phase: u8,
    pub low_phase: u8,
    /// Feed the base clock straight through, no divider engaged.
    pub bypass: bool,
    pub actual_hz: u32,
}

/// Pick divider fields for `max_hz` against `config`'s base clock.
///
/// Requests at or above the base clock bypass the dividers; requests below
/// the slowest representable rate clamp to the slowest rate. The search
/// space is the fixed register field ranges, so the routine always
/// terminates, and both divisors are used as `+1` denominators so it never
/// divides by zero.
pub(crate) fn synthesize(max_hz: u32, config: &FamilyConfig) -> ClockDivider {
    let base = config.base_clock_hz as u64;
    let request = max_hz as u64;

    if request >= base {
        return ClockDivider {
            prescale: 0,
            counter: 0,
            high_phase: 0,
            low_phase: 0,
            bypass: true,
            actual_hz: config.base_clock_hz,
        };
    }

    let counter_max = 1u64 << config.divider_counter_bits;
    let prescale_max = 1u64 << config.divider_prescale_bits;

    // Counter divisors below 2 cannot carry one high and one low phase, so
    // the search starts at 2. For each counter divisor the ideal pre-divisor
    // is `base / (request * n)` rounded down; probing its ±1 neighborhood
    // covers the rounding boundary in both directions. A candidate is valid
    // when `base / (n * p) <= request`, i.e. `base <= request * n * p`.
    let mut best: Option<(u64, u64, u64)> = None;
    for n in 2..=counter_max {
        let ideal = if request == 0 {
            prescale_max
        } else {
            base / (request * n)
        };
        for p in ideal.saturating_sub(1)..=ideal + 1 {
            let p = p.clamp(1, prescale_max);
            if base > request * n * p {
                continue;
            }
            let achieved = base / (n * p);
            match best {
                Some((current, _, _)) if achieved <= current => {}
                _ => best = Some((achieved, n, p)),
            }
        }
    }

    // Nothing representable stays at or below the request: clamp to the
    // slowest reachable rate instead of failing.
    let (actual, n, p) = best.unwrap_or((
        base / (counter_max * prescale_max),
        counter_max,
        prescale_max,
    ));

    let high = ((128 * n + 127) / 256).max(1);
    ClockDivider {
        prescale: (p - 1) as u16,
        counter: (n - 1) as u8,
        high_phase: (high - 1) as u8,
        low_phase: (n - 1) as u8,
        bypass: false,
        actual_hz: actual as u32,
    }
}
