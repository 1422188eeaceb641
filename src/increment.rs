//! Evenly stepped rating curves from sparse simulation samples.

use crate::config::DegeneratePolicy;
use crate::error::{ConflateError, Result};

// Absorbs float noise when snapping to multiples of the step
const SNAP_TOLERANCE: f64 = 1e-9;

// Longest axis a single curve may be resampled onto
const MAX_AXIS_LEN: usize = 100_000;

/// Axis from the largest multiple of `step` not above `min` to the first
/// value at or past `max`, evenly spaced by `step`.
///
/// Fails with `InvalidStep` unless `step` is positive and finite and the
/// resulting axis stays under `MAX_AXIS_LEN` values.
pub fn stepped_axis(min: f64, max: f64, step: f64) -> Result<Vec<f64>> {
    if !(step.is_finite() && step > 0.0) {
        return Err(ConflateError::InvalidStep(step));
    }
    let start = (min / step + SNAP_TOLERANCE).floor() * step;
    let span = ((max - start) / step - SNAP_TOLERANCE).ceil().max(0.0);
    if !span.is_finite() || span >= MAX_AXIS_LEN as f64 {
        return Err(ConflateError::InvalidStep(step));
    }
    let count = span as usize;
    Ok((0..=count).map(|i| start + i as f64 * step).collect())
}

/// Linear interpolation of `ys` at `x`, clamped to the end values outside
/// the sampled range. `xs` must be sorted ascending; empty input yields NaN.
pub fn interpolate(x: f64, xs: &[f64], ys: &[f64]) -> f64 {
    let Some(last) = xs.len().checked_sub(1) else {
        return f64::NAN;
    };
    if last == 0 || x <= xs[0] {
        return ys[0];
    }
    if x >= xs[last] {
        return ys[last];
    }
    let upper = xs.partition_point(|v| *v <= x).clamp(1, last);
    let (x0, x1) = (xs[upper - 1], xs[upper]);
    let (y0, y1) = (ys[upper - 1], ys[upper]);
    if x1 == x0 {
        return y0;
    }
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

/// Resamples (flow, depth) pairs onto an evenly spaced depth axis.
///
/// Samples need not be ordered. Flow is not checked to rise with depth; a
/// non-monotonic curve interpolates without complaint. With fewer than two
/// distinct depths the `policy` decides between an error and repeating the
/// single flow across the axis.
pub fn increment(
    flows: &[f64],
    depths: &[f64],
    step: f64,
    policy: DegeneratePolicy,
) -> Result<(Vec<f64>, Vec<f64>)> {
    if !(step.is_finite() && step > 0.0) {
        return Err(ConflateError::InvalidStep(step));
    }
    let mut pairs: Vec<(f64, f64)> = depths
        .iter()
        .copied()
        .zip(flows.iter().copied())
        .filter(|(d, q)| d.is_finite() && q.is_finite())
        .collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));

    let (sorted_depths, sorted_flows): (Vec<f64>, Vec<f64>) = pairs.into_iter().unzip();
    let distinct = sorted_depths.windows(2).filter(|w| w[0] != w[1]).count()
        + usize::from(!sorted_depths.is_empty());

    if distinct < 2 {
        return match (policy, sorted_depths.first()) {
            (DegeneratePolicy::Replicate, Some(&depth)) => {
                let axis = stepped_axis(depth, depth, step)?;
                let flow = sorted_flows[0];
                Ok((vec![flow; axis.len()], axis))
            }
            _ => Err(ConflateError::DegenerateRatingCurve(distinct)),
        };
    }

    let min = sorted_depths[0];
    let max = sorted_depths[sorted_depths.len() - 1];
    let new_depths = stepped_axis(min, max, step)?;
    let new_flows = new_depths
        .iter()
        .map(|d| interpolate(*d, &sorted_depths, &sorted_flows))
        .collect();
    Ok((new_flows, new_depths))
}

/// Known water-surface elevations for a KWSE run, stepped like depths.
pub fn kwse_axis(min_wse: f64, max_wse: f64, step: f64) -> Result<Vec<f64>> {
    stepped_axis(min_wse, max_wse, step)
}

/// `count` flows evenly spaced from `low` to `high` inclusive. A collapsed
/// range yields the single flow once.
pub fn initial_flows(low: f64, high: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![low],
        _ if high <= low => vec![low],
        _ => (0..count)
            .map(|i| low + (high - low) * i as f64 / (count - 1) as f64)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_foot_steps() {
        let (flows, depths) = increment(
            &[10.0, 20.0, 30.0],
            &[1.0, 2.0, 3.0],
            0.5,
            DegeneratePolicy::Reject,
        )
        .unwrap();
        assert_eq!(depths, vec![1.0, 1.5, 2.0, 2.5, 3.0]);
        for (got, want) in flows.iter().zip([10.0, 15.0, 20.0, 25.0, 30.0]) {
            assert!((got - want).abs() < 1e-9);
        }
    }

    #[test]
    fn unordered_samples_are_sorted() {
        let (flows, depths) = increment(
            &[30.0, 10.0, 20.0],
            &[3.0, 1.0, 2.0],
            0.5,
            DegeneratePolicy::Reject,
        )
        .unwrap();
        assert_eq!(depths.len(), 5);
        assert!((flows[1] - 15.0).abs() < 1e-9);
    }

    #[test]
    fn axis_snaps_below_min_and_reaches_past_max() {
        let (flows, depths) = increment(
            &[12.0, 40.0],
            &[1.3, 2.2],
            0.5,
            DegeneratePolicy::Reject,
        )
        .unwrap();
        assert_eq!(depths, vec![1.0, 1.5, 2.0, 2.5]);
        // clamped outside the sampled range
        assert_eq!(flows[0], 12.0);
        assert_eq!(flows[3], 40.0);
    }

    #[test]
    fn resampling_on_step_does_not_drift() {
        let depths: Vec<f64> = (0..20).map(|i| 0.3 + i as f64 * 0.1).collect();
        let flows: Vec<f64> = depths.iter().map(|d| 50.0 * d * d).collect();
        let (new_flows, new_depths) =
            increment(&flows, &depths, 0.1, DegeneratePolicy::Reject).unwrap();
        assert_eq!(new_depths.len(), depths.len());
        for (a, b) in new_depths.iter().zip(&depths) {
            assert!((a - b).abs() < 1e-9);
        }
        for (a, b) in new_flows.iter().zip(&flows) {
            assert!(((a - b) / b).abs() <= 1e-6);
        }
    }

    #[test]
    fn non_monotonic_does_not_fail() {
        let result = increment(
            &[10.0, 5.0, 30.0],
            &[1.0, 2.0, 3.0],
            1.0,
            DegeneratePolicy::Reject,
        );
        let (flows, _) = result.unwrap();
        assert_eq!(flows, vec![10.0, 5.0, 30.0]);
    }

    #[test]
    fn degenerate_curve_follows_policy() {
        assert!(matches!(
            increment(&[10.0, 11.0], &[2.0, 2.0], 0.5, DegeneratePolicy::Reject),
            Err(ConflateError::DegenerateRatingCurve(1))
        ));
        assert!(matches!(
            increment(&[], &[], 0.5, DegeneratePolicy::Replicate),
            Err(ConflateError::DegenerateRatingCurve(0))
        ));
        let (flows, depths) =
            increment(&[10.0], &[2.2], 0.5, DegeneratePolicy::Replicate).unwrap();
        assert_eq!(depths, vec![2.0, 2.5]);
        assert_eq!(flows, vec![10.0, 10.0]);
    }

    #[test]
    fn kwse_and_initial_flows() {
        assert_eq!(kwse_axis(101.2, 102.0, 0.5).unwrap(), vec![101.0, 101.5, 102.0]);
        assert_eq!(initial_flows(100.0, 1000.0, 4), vec![100.0, 400.0, 700.0, 1000.0]);
        assert_eq!(initial_flows(100.0, 1000.0, 1), vec![100.0]);
        assert_eq!(initial_flows(100.0, 100.0, 10), vec![100.0]);
    }

    #[test]
    fn step_must_be_positive_and_finite() {
        for step in [0.0, -0.5, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                increment(&[10.0, 20.0, 30.0], &[1.0, 2.0, 3.0], step, DegeneratePolicy::Reject),
                Err(ConflateError::InvalidStep(_))
            ));
            assert!(matches!(
                kwse_axis(101.0, 102.0, step),
                Err(ConflateError::InvalidStep(_))
            ));
        }
    }

    #[test]
    fn tiny_step_is_refused_instead_of_allocating() {
        assert!(matches!(
            increment(&[10.0, 20.0], &[0.0, 1_000.0], 1e-9, DegeneratePolicy::Reject),
            Err(ConflateError::InvalidStep(_))
        ));
    }
}
