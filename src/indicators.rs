// =============================================================================
// Indicators over close-price history
// =============================================================================
//
// The strategy layer works from a rolling window of close prices only, so the
// ATR here is the simplified close-to-close form:
//
//   ATR = mean(|close_t - close_{t-1}|) over the last `period` differences
//
// rather than the high/low true-range decomposition.
// =============================================================================

/// Simple moving average of the last `period` closes.
///
/// Returns `None` when `period` is zero or there are fewer closes than
/// `period`.
pub fn simple_moving_average(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let sum: f64 = closes[closes.len() - period..].iter().sum();
    let mean = sum / period as f64;
    mean.is_finite().then_some(mean)
}

/// Close-to-close ATR: mean absolute consecutive difference over the last
/// `period` differences.
///
/// Returns `None` when:
/// - `period` is zero,
/// - there are fewer than `period + 1` closes (each difference needs a
///   predecessor),
/// - the result is non-finite.
pub fn average_true_range(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let diffs: Vec<f64> = closes
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).abs())
        .collect();

    let sum: f64 = diffs[diffs.len() - period..].iter().sum();
    let atr = sum / period as f64;
    atr.is_finite().then_some(atr)
}
