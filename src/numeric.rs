//! Log-domain primitives shared by the engines.

/// Finite stand-in for `log(0)` inside device kernels, where `-inf - -inf`
/// would poison the max-shifted log-sum-exp with NaN.
pub const NEG_INF: f32 = -1e30;

/// Any log value below this is treated as zero probability.
pub const LOG_ZERO_THRESHOLD: f32 = -1e29;

/// `log(exp(a) + exp(b))` without leaving the log domain.
#[inline]
pub fn log_plus(a: f32, b: f32) -> f32 {
    if a == f32::NEG_INFINITY {
        return b;
    }
    if b == f32::NEG_INFINITY {
        return a;
    }
    let (max, min) = if a > b { (a, b) } else { (b, a) };
    max + (min - max).exp().ln_1p()
}

/// Whether a log value carries probability mass.
#[inline]
pub fn is_log_zero(value: f32) -> bool {
    value <= LOG_ZERO_THRESHOLD
}

/// Gradient of `-log P` w.r.t. one input entry.
///
/// `log_alpha_beta` is the class-reduced `log(sum alpha_hat * beta_hat)`,
/// where neither table carries the emission at `t`, so it is `log(dP / dp)`
/// and stays finite when `p` itself is zero. `log_jacobian` is
/// `log(dp / d input)`.
#[inline]
pub fn nll_gradient(log_alpha_beta: f32, log_likelihood: f32, log_jacobian: f32) -> f32 {
    if is_log_zero(log_alpha_beta) || is_log_zero(log_jacobian) {
        return 0.0;
    }
    -(log_alpha_beta - log_likelihood + log_jacobian).exp()
}
