// =============================================================================
// Statistics Kernel — trailing-window z-score with degeneracy guard
// =============================================================================
//
// Step 1 — Take the last `window` values (at least 3 required).
// Step 2 — Compute the mean μ and the sample standard deviation σ (n − 1).
// Step 3 — Guard: if σ < max(1e-6, 1e-3·|μ|), the series is degenerate
//          (flat or numerically flat relative to its level) and no z-score
//          is defined.
// Step 4 — z = (xₙ − μ) / σ for the final value in the window.
// =============================================================================

/// Default trailing window used by all z-scored indicators.
pub const Z_WINDOW: usize = 20;

/// Compute the trailing-window z-score of the last value.
///
/// Returns `None` when:
/// - fewer than 3 values fall inside the window, or
/// - the windowed standard deviation is below `max(1e-6, 1e-3·|mean|)`
///   (a constant or near-constant series carries no usable signal).
pub fn z_score(values: &[f64], window: usize) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let start = values.len().saturating_sub(window);
    let tail = &values[start..];
    if tail.len() < 3 {
        return None;
    }

    let n = tail.len() as f64;
    let mean = tail.iter().sum::<f64>() / n;
    let var = tail.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std = var.sqrt();

    if std < f64::max(1e-6, 1e-3 * mean.abs()) {
        return None;
    }

    let last = *tail.last().expect("non-empty tail");
    Some((last - mean) / std)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn z_empty_input() {
        assert!(z_score(&[], 20).is_none());
    }

    #[test]
    fn z_insufficient_data() {
        // Two points is below the minimum of 3.
        assert!(z_score(&[1.0, 2.0], 20).is_none());
    }

    #[test]
    fn z_constant_series_is_degenerate() {
        assert!(z_score(&[5.0; 25], 20).is_none());
    }

    #[test]
    fn z_near_constant_relative_to_level_is_degenerate() {
        // Large level, tiny wiggle: σ < 1e-3·|μ| trips the relative guard.
        let vals = vec![1_000_000.0, 1_000_000.1, 1_000_000.05, 1_000_000.02];
        assert!(z_score(&vals, 20).is_none());
    }

    #[test]
    fn z_simple_known_value() {
        // Values 1..=3: mean 2, sample std 1, last value 3 → z = 1.
        let z = z_score(&[1.0, 2.0, 3.0], 20).unwrap();
        assert!((z - 1.0).abs() < 1e-12, "expected 1.0, got {z}");
    }

    #[test]
    fn z_uses_only_trailing_window() {
        // An extreme old value outside the window must not affect the score.
        let mut vals = vec![1e9];
        vals.extend((0..20).map(|i| i as f64));
        let windowed = z_score(&vals, 20).unwrap();
        let plain = z_score(&vals[1..], 20).unwrap();
        assert!((windowed - plain).abs() < 1e-12);
    }

    #[test]
    fn z_sign_follows_last_value() {
        let up = z_score(&[1.0, 2.0, 3.0, 10.0], 20).unwrap();
        assert!(up > 0.0);
        let down = z_score(&[10.0, 3.0, 2.0, -10.0], 20).unwrap();
        assert!(down < 0.0);
    }
}
