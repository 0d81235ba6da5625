// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle band = SMA of the last P closes, upper = SMA + k*σ, lower = SMA - k*σ,
// where σ is the population standard deviation of the same window (divide by
// P, not P-1). The first P-1 positions of a series are undefined.
//
// Pure functions over closed-bar closes; the engine and the dashboard preview
// both go through here so the numbers can never drift apart.

/// One Bollinger point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollPoint {
    pub middle: f64,
    pub upper: f64,
    pub lower: f64,
}

/// Bollinger Bands over the trailing `period` elements of `closes`.
///
/// Returns `None` when fewer than `period` closes are available or when the
/// result is degenerate (non-finite input).
pub fn bollinger_latest(closes: &[f64], period: usize, num_std: f64) -> Option<BollPoint> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let middle = window.iter().sum::<f64>() / period as f64;
    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    let upper = middle + num_std * std_dev;
    let lower = middle - num_std * std_dev;

    if upper.is_finite() && lower.is_finite() {
        Some(BollPoint { middle, upper, lower })
    } else {
        None
    }
}

/// Full-series Bollinger Bands: one entry per input close, `None` for the
/// first `period - 1` positions.
pub fn bollinger_series(closes: &[f64], period: usize, num_std: f64) -> Vec<Option<BollPoint>> {
    if period == 0 {
        return vec![None; closes.len()];
    }
    (0..closes.len())
        .map(|i| {
            if i + 1 < period {
                None
            } else {
                bollinger_latest(&closes[..=i], period, num_std)
            }
        })
        .collect()
}
