use std::time::Duration;

// Interval policy: slow stable monitors down, snap flapping ones back.
pub const STABLE_THRESHOLD: u32 = 60;
pub const MAX_SLOWDOWN: f64 = 2.0;
pub const SPEEDUP: f64 = 0.5;
pub const SLOWDOWN_STEP: f64 = 1.25;
pub const MIN_INTERVAL: Duration = Duration::from_secs(5);

/// Next interval multiplier given the monitor's streak counters and the
/// multiplier currently in effect.
pub fn next_multiplier(consec_successes: u32, consec_fails: u32, prev_multiplier: f64) -> f64 {
    let prev = if prev_multiplier <= 0.0 { 1.0 } else { prev_multiplier };
    if consec_successes >= STABLE_THRESHOLD {
        (prev * SLOWDOWN_STEP).min(MAX_SLOWDOWN)
    } else if consec_fails > 0 && consec_successes == 0 && prev > 1.0 {
        // Failure while slowed down: snap back below base to re-check fast.
        SPEEDUP
    } else if consec_successes > 0 {
        1.0
    } else if consec_fails > 0 {
        1.0
    } else {
        prev
    }
}

/// Apply a multiplier to the base interval, clamped to the floor and to
/// `base * MAX_SLOWDOWN`.
pub fn effective_interval(base: Duration, multiplier: f64) -> Duration {
    let scaled = base.mul_f64(multiplier.max(0.0));
    let ceiling = base.mul_f64(MAX_SLOWDOWN);
    scaled.clamp(MIN_INTERVAL, ceiling.max(MIN_INTERVAL))
}
