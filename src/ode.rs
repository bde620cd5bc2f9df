//! Adaptive Cash–Karp integration
//!
//! Embedded 5(4) Runge–Kutta steps with adaptive step-size control, in two
//! flavors: a plain integrator for `y'(t) = f(t)` and an autonomous solver
//! for `y'(t) = f(y)`. Both are used by the curve module for the Bézier
//! element conversions that have no closed form.

use tracing::warn;

/// Iteration cap for a single integration.
pub const MAX_STEP_COUNT: u32 = 10_000;

/// Relative error tolerance.
pub const TOLERANCE: f64 = 1e-9;

/// Smallest usable step magnitude; below this the integration aborts.
pub const MIN_STEP_SIZE: f64 = 1e-9;

// Step-size control constants. ERR_GUARD equals (5 / SAFETY)^(1 / GROW_POWER),
// which caps step growth at a factor of 5.
const SAFETY: f64 = 0.9;
const GROW_POWER: f64 = -0.2;
const SHRINK_POWER: f64 = -0.25;
const ERR_GUARD: f64 = 1.89e-4;

/// Why an integration stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Reached the end of the interval within tolerance.
    Converged,
    /// The adaptive step shrank below `MIN_STEP_SIZE` or underflowed.
    StepUnderflow,
    /// More than `MAX_STEP_COUNT` accepted steps.
    TooManySteps,
}

/// Result of an adaptive integration.
///
/// `value` holds the best estimate reached so far even when the outcome is a
/// failure; callers treat failed integrations as approximate, not fatal.
#[derive(Clone, Copy, Debug)]
pub struct Integration {
    pub value: f64,
    pub steps: u32,
    pub est_err: f64,
    pub outcome: Outcome,
}

/// One Cash–Karp step for `y'(t) = f(t)`.
///
/// Since the right-hand side does not depend on `y`, the second stage (whose
/// weight is zero in both embedded solutions) is skipped. Returns
/// `(y_out, dydt_out, err)` where `dydt_out` is the derivative at the end of
/// the step, reusable as the next step's first stage.
fn step_plain<F: Fn(f64) -> f64>(y_in: f64, t: f64, dydt: f64, step: f64, f: &F) -> (f64, f64, f64) {
    let k1 = dydt;
    let k3 = f(t + 3.0 / 10.0 * step);
    let k4 = f(t + 3.0 / 5.0 * step);
    let k5 = f(t + step);
    let k6 = f(t + 7.0 / 8.0 * step);

    let y_out = y_in
        + step * (37.0 / 378.0 * k1 + 250.0 / 621.0 * k3 + 125.0 / 594.0 * k4 + 512.0 / 1771.0 * k6);

    let y_low = y_in
        + step
            * (2825.0 / 27648.0 * k1
                + 18575.0 / 48384.0 * k3
                + 13525.0 / 55296.0 * k4
                + 277.0 / 14336.0 * k5
                + 1.0 / 4.0 * k6);

    (y_out, k5, y_out - y_low)
}

/// One Cash–Karp step for the autonomous form `y' = f(y)`.
fn step_autonomous<F: Fn(f64) -> f64>(y_in: f64, dydt: f64, step: f64, f: &F) -> (f64, f64) {
    let k1 = dydt;
    let k2 = f(y_in + step * (1.0 / 5.0) * k1);
    let k3 = f(y_in + step * (3.0 / 40.0 * k1 + 9.0 / 40.0 * k2));
    let k4 = f(y_in + step * (3.0 / 10.0 * k1 - 9.0 / 10.0 * k2 + 6.0 / 5.0 * k3));
    let k5 = f(y_in + step * (-11.0 / 54.0 * k1 + 5.0 / 2.0 * k2 - 70.0 / 27.0 * k3 + 35.0 / 27.0 * k4));
    let k6 = f(y_in
        + step
            * (1631.0 / 55296.0 * k1
                + 175.0 / 512.0 * k2
                + 575.0 / 13824.0 * k3
                + 44275.0 / 110592.0 * k4
                + 253.0 / 4096.0 * k5));

    let y_out = y_in
        + step * (37.0 / 378.0 * k1 + 250.0 / 621.0 * k3 + 125.0 / 594.0 * k4 + 512.0 / 1771.0 * k6);

    let y_low = y_in
        + step
            * (2825.0 / 27648.0 * k1
                + 18575.0 / 48384.0 * k3
                + 13525.0 / 55296.0 * k4
                + 277.0 / 14336.0 * k5
                + 1.0 / 4.0 * k6);

    (y_out, y_out - y_low)
}

/// Shrink a failed step, at most by a factor of 10. Returns `None` when the
/// next try would fall below `MIN_STEP_SIZE` or underflow `t`.
fn shrink_step(t: f64, step_try: f64, scaled_err: f64) -> Option<f64> {
    let step_tmp = SAFETY * step_try * scaled_err.powf(SHRINK_POWER);
    let next = if step_try >= 0.0 {
        step_tmp.max(0.1 * step_try)
    } else {
        step_tmp.min(0.1 * step_try)
    };

    if next.abs() <= MIN_STEP_SIZE {
        warn!("step size too small");
        return None;
    }
    if t + next == t {
        warn!("step underflow");
        return None;
    }
    Some(next)
}

/// Next step guess after a successful step.
fn grow_step(step_try: f64, scaled_err: f64) -> f64 {
    if scaled_err > ERR_GUARD {
        SAFETY * step_try * scaled_err.powf(GROW_POWER)
    } else {
        5.0 * step_try
    }
}

/// Integrate `y' = f(t)` from `t_start` to `t_end` starting at `y_start`.
pub fn integrate<F: Fn(f64) -> f64>(
    f: F,
    y_start: f64,
    t_start: f64,
    t_end: f64,
    step_guess: f64,
) -> Integration {
    let mut y = y_start;
    let mut t = t_start;
    let mut dydt = f(t_start);
    let mut step = step_guess;
    let mut it_count: u32 = 0;
    let mut est_err: f64 = 0.0;

    if t_end == t_start {
        return Integration { value: y, steps: 0, est_err, outcome: Outcome::Converged };
    }

    for _ in 0..MAX_STEP_COUNT {
        // Clip the step so it cannot overshoot the end of the interval.
        if (t + step - t_end) * (t + step - t_start) > 0.0 {
            step = t_end - t;
        }

        // Scale eps by a mix of the current value and the first increment; the
        // tiny additive term avoids division by zero.
        let scaled_eps = TOLERANCE * (y.abs() + (step * dydt).abs()) + 1e-30;

        // Inner loop: retry with smaller steps until the error is acceptable.
        let mut step_try = step;
        let mut aborted = false;
        loop {
            let (y_tmp, dydt_tmp, err) = step_plain(y, t, dydt, step_try, &f);
            let scaled_err = (err / scaled_eps).abs();
            it_count += 1;

            if scaled_err <= 1.0 {
                step = grow_step(step_try, scaled_err);
                y = y_tmp;
                dydt = dydt_tmp;
                t += step_try;
                est_err += err.abs();
                break;
            }
            match shrink_step(t, step_try, scaled_err) {
                Some(next) => step_try = next,
                None => {
                    // Keep the failed step's estimate; it is the best we have.
                    y = y_tmp;
                    dydt = dydt_tmp;
                    t += step_try;
                    est_err += err.abs();
                    aborted = true;
                    break;
                }
            }
        }

        if aborted {
            return Integration { value: y, steps: it_count, est_err, outcome: Outcome::StepUnderflow };
        }
        if (t - t_end) * (t - t_start) >= 0.0 {
            return Integration { value: y, steps: it_count, est_err, outcome: Outcome::Converged };
        }
    }

    warn!("too many steps");
    Integration { value: y, steps: it_count, est_err, outcome: Outcome::TooManySteps }
}

/// Integrate the autonomous form `y' = f(y)` over `t ∈ [t_start, t_end]`.
pub fn integrate_autonomous<F: Fn(f64) -> f64>(
    f: F,
    y_start: f64,
    t_start: f64,
    t_end: f64,
    step_guess: f64,
) -> Integration {
    let mut y = y_start;
    let mut t = t_start;
    let mut step = step_guess;
    let mut it_count: u32 = 0;
    let mut est_err: f64 = 0.0;

    if t_end == t_start {
        return Integration { value: y, steps: 0, est_err, outcome: Outcome::Converged };
    }

    for _ in 0..MAX_STEP_COUNT {
        if (t + step - t_end) * (t + step - t_start) > 0.0 {
            step = t_end - t;
        }

        let dydt = f(y);
        let scaled_eps = TOLERANCE * (y.abs() + (step * dydt).abs()) + 1e-30;

        let mut step_try = step;
        let mut aborted = false;
        loop {
            let (y_tmp, err) = step_autonomous(y, dydt, step_try, &f);
            let scaled_err = (err / scaled_eps).abs();
            it_count += 1;

            if scaled_err <= 1.0 {
                step = grow_step(step_try, scaled_err);
                y = y_tmp;
                t += step_try;
                est_err += err.abs();
                break;
            }
            match shrink_step(t, step_try, scaled_err) {
                Some(next) => step_try = next,
                None => {
                    y = y_tmp;
                    t += step_try;
                    est_err += err.abs();
                    aborted = true;
                    break;
                }
            }
        }

        if aborted {
            return Integration { value: y, steps: it_count, est_err, outcome: Outcome::StepUnderflow };
        }
        if (t - t_end) * (t - t_start) >= 0.0 {
            return Integration { value: y, steps: it_count, est_err, outcome: Outcome::Converged };
        }
    }

    warn!("too many steps");
    Integration { value: y, steps: it_count, est_err, outcome: Outcome::TooManySteps }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrate_polynomial() {
        // ∫0..2 3t² dt = 8
        let r = integrate(|t| 3.0 * t * t, 0.0, 0.0, 2.0, 0.1);
        assert_eq!(r.outcome, Outcome::Converged);
        assert!((r.value - 8.0).abs() < 1e-7, "got {}", r.value);
    }

    #[test]
    fn test_integrate_cosine() {
        let r = integrate(f64::cos, 0.0, 0.0, 1.0, 0.1);
        assert_eq!(r.outcome, Outcome::Converged);
        assert!((r.value - 1.0_f64.sin()).abs() < 1e-7);
    }

    #[test]
    fn test_autonomous_exponential() {
        // y' = y, y(0) = 1 → y(1) = e
        let r = integrate_autonomous(|y| y, 1.0, 0.0, 1.0, 0.1);
        assert_eq!(r.outcome, Outcome::Converged);
        assert!((r.value - std::f64::consts::E).abs() < 1e-6, "got {}", r.value);
    }

    #[test]
    fn test_degenerate_interval() {
        let r = integrate(|_| 1.0, 0.5, 2.0, 2.0, 0.1);
        assert_eq!(r.outcome, Outcome::Converged);
        assert_eq!(r.steps, 0);
        assert!((r.value - 0.5).abs() < 1e-15);
    }

    #[test]
    fn test_reports_iteration_count() {
        let r = integrate(|t| t.sin(), 0.0, 0.0, 10.0, 0.1);
        assert_eq!(r.outcome, Outcome::Converged);
        assert!(r.steps > 0);
        assert!((r.value - (1.0 - 10.0_f64.cos())).abs() < 1e-6);
    }
}
