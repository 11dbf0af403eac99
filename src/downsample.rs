//! Trend-preserving downsampling for chart rendering.
//!
//! Plain decimation can step straight over a peak or a valley. This sampler
//! walks the series in stride-sized hops and keeps the samples where the
//! direction of change reverses (turning points), while a forced keep every
//! `step` samples bounds the longest gap. A uniform-stride pass then caps the
//! result at `max_points`.
//!
//! Turning points are detected with a one-hop lookahead, not a global
//! extrema search, so reversals closer together than half a stride can be
//! missed. Cost is O(n).

use crate::error::CoreError;
use crate::model::{HistoryRecord, Metric};

/// Smallest accepted `max_points`.
pub const MIN_POINTS: usize = 2;

/// Downsample a plain numeric series.
pub fn downsample(series: &[f64], max_points: usize) -> Result<Vec<f64>, CoreError> {
    downsample_by(series, max_points, |v| *v)
}

/// Downsample history records, judging shape by one metric.
pub fn downsample_records(
    records: &[HistoryRecord],
    metric: Metric,
    max_points: usize,
) -> Result<Vec<HistoryRecord>, CoreError> {
    downsample_by(records, max_points, |r| metric.of(r))
}

/// Downsample `series` (ascending by time) to at most `max_points` samples.
///
/// Series that already fit are returned unchanged. Otherwise the first and
/// last samples are always retained.
pub fn downsample_by<T, F>(series: &[T], max_points: usize, value: F) -> Result<Vec<T>, CoreError>
where
    T: Clone,
    F: Fn(&T) -> f64,
{
    if max_points < MIN_POINTS {
        return Err(CoreError::invalid(format!(
            "max_points must be at least {MIN_POINTS}, got {max_points}"
        )));
    }

    let len = series.len();
    if len <= max_points {
        return Ok(series.to_vec());
    }

    let last = len - 1;
    let step = len / max_points;
    let min_gap = step / 2;

    let mut kept: Vec<usize> = Vec::with_capacity(max_points * 2);
    kept.push(0);
    let mut last_kept_index = 0;
    let mut last_kept_value = value(&series[0]);

    for i in (1..last).step_by(step) {
        let current = value(&series[i]);
        let next = value(&series[(i + step).min(last)]);

        let turning = (current - last_kept_value) * (next - current) < 0.0;
        if turning && i - last_kept_index > min_gap {
            kept.push(i);
            last_kept_index = i;
            last_kept_value = current;
        }

        if i - last_kept_index >= step {
            kept.push(i);
            last_kept_index = i;
            last_kept_value = current;
        }
    }

    // The last sample either follows the last keep or, if it sits too close,
    // takes its place. The first sample is never displaced.
    if last - last_kept_index > min_gap || kept.len() == 1 {
        kept.push(last);
    } else if let Some(tail) = kept.last_mut() {
        *tail = last;
    }

    if kept.len() > max_points {
        kept = cap_uniform(&kept, max_points);
    }

    Ok(kept.into_iter().map(|i| series[i].clone()).collect())
}

/// Keep every `final_step`-th entry so that at most `max_points` remain, with
/// the final entry substituted for the trailing kept one.
fn cap_uniform(kept: &[usize], max_points: usize) -> Vec<usize> {
    let last = kept.len() - 1;
    let final_step = last.div_ceil(max_points - 1);

    let mut capped: Vec<usize> = kept.iter().copied().step_by(final_step).collect();
    if last % final_step != 0 {
        if let Some(tail) = capped.last_mut() {
            *tail = kept[last];
        }
    }
    capped
}
