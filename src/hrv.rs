//! Short-term heart-rate variability.

/// Root mean square of successive differences over `rr` in the given order.
///
/// Returns 0.0 when fewer than two intervals are available.
pub fn rmssd<I>(rr: I) -> f64
where
    I: IntoIterator,
    I::Item: Into<f64>,
{
    let mut prev: Option<f64> = None;
    let mut sum_sq = 0.0;
    let mut n = 0usize;

    for value in rr {
        let value = value.into();
        if let Some(p) = prev {
            let d = value - p;
            sum_sq += d * d;
            n += 1;
        }
        prev = Some(value);
    }

    if n == 0 {
        return 0.0;
    }
    (sum_sq / n as f64).sqrt()
}
