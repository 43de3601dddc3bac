//! Context overflow detection.
//!
//! ```text
//! available = max(window - output_reserve, floor(window * 0.5))
//! threshold = floor(available * ratio)
//! overflow  = tokens > threshold
//! ```
//!
//! An unknown window never overflows.

/// Tokens reserved for the model's reply.
pub const DEFAULT_OUTPUT_RESERVE: u32 = 32_000;
/// Fraction of the available window that may be filled before compaction.
pub const DEFAULT_THRESHOLD_RATIO: f64 = 0.6;

/// Absorbs binary representation error of decimal ratios (0.6 * 96_000 must
/// floor to 57_600, not 57_599).
const RATIO_EPSILON: f64 = 1e-9;

/// Result of an overflow check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverflowCheck {
    pub is_overflow: bool,
    /// `None` when the context window is unknown.
    pub threshold_tokens: Option<u32>,
}

impl OverflowCheck {
    const UNDETERMINED: Self = Self {
        is_overflow: false,
        threshold_tokens: None,
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverflowPolicy {
    output_reserve: u32,
    threshold_ratio: f64,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        Self {
            output_reserve: DEFAULT_OUTPUT_RESERVE,
            threshold_ratio: DEFAULT_THRESHOLD_RATIO,
        }
    }
}

impl OverflowPolicy {
    #[must_use]
    pub fn new(output_reserve: u32, threshold_ratio: f64) -> Self {
        Self {
            output_reserve,
            threshold_ratio: sanitize_ratio(threshold_ratio),
        }
    }

    /// Same reserve, different ratio (per-session override).
    #[must_use]
    pub fn with_threshold_ratio(self, threshold_ratio: f64) -> Self {
        Self::new(self.output_reserve, threshold_ratio)
    }

    #[must_use]
    pub const fn output_reserve(&self) -> u32 {
        self.output_reserve
    }

    #[must_use]
    pub const fn threshold_ratio(&self) -> f64 {
        self.threshold_ratio
    }

    #[must_use]
    pub fn available_window(&self, context_window: u32) -> u32 {
        context_window
            .saturating_sub(self.output_reserve)
            .max(context_window / 2)
    }

    #[must_use]
    pub fn threshold_tokens(&self, context_window: u32) -> u32 {
        let available = f64::from(self.available_window(context_window));
        (available * self.threshold_ratio + RATIO_EPSILON).floor() as u32
    }

    #[must_use]
    pub fn check(&self, tokens: u32, context_window: Option<u32>) -> OverflowCheck {
        let Some(window) = context_window.filter(|w| *w > 0) else {
            return OverflowCheck::UNDETERMINED;
        };
        let threshold = self.threshold_tokens(window);
        OverflowCheck {
            is_overflow: tokens > 0 && tokens > threshold,
            threshold_tokens: Some(threshold),
        }
    }
}

/// Checks `tokens` against `context_window` with the default output reserve.
#[must_use]
pub fn check_overflow(tokens: u32, context_window: Option<u32>, threshold_ratio: f64) -> OverflowCheck {
    OverflowPolicy::default()
        .with_threshold_ratio(threshold_ratio)
        .check(tokens, context_window)
}

/// Ratios outside `(0, 1]` (or NaN) fall back to the default.
#[must_use]
pub fn sanitize_ratio(ratio: f64) -> f64 {
    if ratio.is_finite() && ratio > 0.0 && ratio <= 1.0 {
        ratio
    } else {
        tracing::warn!(ratio, "Invalid compaction threshold ratio; using default");
        DEFAULT_THRESHOLD_RATIO
    }
}

#[cfg(test)]
mod tests {
    use super::{DEFAULT_THRESHOLD_RATIO, OverflowPolicy, check_overflow, sanitize_ratio};

    #[test]
    fn boundary_at_exact_threshold() {
        let check = check_overflow(57_600, Some(128_000), 0.6);
        assert_eq!(check.threshold_tokens, Some(57_600));
        assert!(!check.is_overflow);

        let check = check_overflow(57_601, Some(128_000), 0.6);
        assert!(check.is_overflow);
    }

    #[test]
    fn available_window_never_below_half() {
        let policy = OverflowPolicy::default();
        // 40_000 - 32_000 = 8_000 < 20_000
        assert_eq!(policy.available_window(40_000), 20_000);
        assert_eq!(policy.available_window(128_000), 96_000);
        assert_eq!(policy.available_window(10_000), 5_000);
    }

    #[test]
    fn unknown_window_never_overflows() {
        let check = check_overflow(u32::MAX, None, 0.6);
        assert!(!check.is_overflow);
        assert_eq!(check.threshold_tokens, None);

        let check = check_overflow(u32::MAX, Some(0), 0.6);
        assert!(!check.is_overflow);
    }

    #[test]
    fn zero_tokens_never_overflow() {
        let policy = OverflowPolicy::new(0, 0.01);
        assert!(!policy.check(0, Some(1)).is_overflow);
    }

    #[test]
    fn monotonic_around_threshold() {
        let policy = OverflowPolicy::new(16_000, 0.75);
        let window = Some(200_000);
        let threshold = policy.threshold_tokens(200_000);
        assert_eq!(threshold, 138_000);
        for tokens in [1, threshold / 2, threshold - 1, threshold] {
            assert!(!policy.check(tokens, window).is_overflow, "{tokens}");
        }
        for tokens in [threshold + 1, threshold * 2] {
            assert!(policy.check(tokens, window).is_overflow, "{tokens}");
        }
    }

    #[test]
    fn invalid_ratio_falls_back_to_default() {
        assert_eq!(sanitize_ratio(f64::NAN), DEFAULT_THRESHOLD_RATIO);
        assert_eq!(sanitize_ratio(0.0), DEFAULT_THRESHOLD_RATIO);
        assert_eq!(sanitize_ratio(1.5), DEFAULT_THRESHOLD_RATIO);
        assert_eq!(sanitize_ratio(1.0), 1.0);
        assert_eq!(sanitize_ratio(0.8), 0.8);
    }
}
