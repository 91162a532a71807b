//! Robust statistics over flat pixel samples.
//!
//! These estimators back both the background estimator and the photometry
//! engine: an iteratively sigma-clipped mean, a percentile-based robust
//! dispersion ("scale"), and a plain median. All of them return NaN for an
//! empty sample rather than failing, because an undersized sample is a
//! per-unit degradation, not an error.

/// True when a pixel value is numerically unusable (IEEE NaN or ±Inf).
///
/// Zero is a perfectly valid pixel value and is never classified as invalid.
#[inline]
pub fn is_invalid(value: f64) -> bool {
    !value.is_finite()
}

/// Result of an iterative sigma-clipped mean computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClippedMean {
    /// Mean of the surviving sample (NaN for an empty input).
    pub mean: f64,
    /// Standard error of the mean, `stddev / sqrt(n)`.
    ///
    /// NaN for empty input and for a single-element sample, where the
    /// (n − 1)-denominator sample standard deviation is undefined.
    pub uncertainty: f64,
    /// Number of values remaining after clipping.
    pub n_used: usize,
    /// Number of values rejected across all iterations.
    pub n_rejected: usize,
}

/// Iteratively sigma-clipped mean.
///
/// Computes the mean and sample standard deviation, removes every value
/// farther than `sigma` standard deviations from the mean, and repeats until
/// an iteration rejects nothing or the sample is exhausted. A sample with no
/// outliers beyond `sigma` therefore returns the plain mean with
/// `n_rejected == 0`.
pub fn clipped_mean(sample: &[f64], sigma: f64) -> ClippedMean {
    let mut kept: Vec<f64> = sample.to_vec();
    let mut n_rejected = 0usize;

    loop {
        if kept.is_empty() {
            return ClippedMean {
                mean: f64::NAN,
                uncertainty: f64::NAN,
                n_used: 0,
                n_rejected,
            };
        }

        let n = kept.len() as f64;
        let mean = kept.iter().sum::<f64>() / n;
        let stddev = if kept.len() > 1 {
            let ss = kept.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>();
            (ss / (n - 1.0)).sqrt()
        } else {
            f64::NAN
        };

        let threshold = sigma * stddev;
        let before = kept.len();
        // A NaN threshold (single-element sample) rejects nothing, which
        // terminates the loop.
        kept.retain(|v| !((v - mean).abs() > threshold));
        let rejected_now = before - kept.len();
        n_rejected += rejected_now;

        if rejected_now == 0 {
            return ClippedMean {
                mean,
                uncertainty: stddev / n.sqrt(),
                n_used: kept.len(),
                n_rejected,
            };
        }
    }
}

/// Robust dispersion estimate over a sample.
///
/// Half the spread between the 15.8655th and 84.1345th percentiles, which
/// equals the standard deviation for Gaussian data while ignoring a small
/// fraction of outliers in either tail. Symmetric in sign by construction.
///
/// Returns NaN for an empty sample and 0.0 for a single-element sample (both
/// percentiles coincide).
pub fn scale(sample: &[f64]) -> f64 {
    if sample.is_empty() {
        return f64::NAN;
    }

    let mut sorted = sample.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let lo = percentile_sorted(&sorted, 0.158655);
    let hi = percentile_sorted(&sorted, 0.841345);
    0.5 * (hi - lo)
}

/// Linear-interpolated percentile of an already-sorted sample.
fn percentile_sorted(sorted: &[f64], frac: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let pos = frac * (n - 1) as f64;
    let below = pos.floor() as usize;
    let above = below + 1;
    if above >= n {
        return sorted[n - 1];
    }
    let t = pos - below as f64;
    sorted[below] * (1.0 - t) + sorted[above] * t
}

/// Median of a sample; even counts average the two middle elements.
///
/// Returns NaN for an empty sample.
pub fn median(sample: &[f64]) -> f64 {
    if sample.is_empty() {
        return f64::NAN;
    }

    let mut sorted = sample.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
