//! Frequency resampling of one label's series.
//!
//! The native sampling interval of a label is the median gap between its
//! first [`NATIVE_WINDOW`] timestamps, which keeps one long recording gap
//! from skewing the estimate. A request for a rate at or below the native
//! rate keeps every Nth real sample (decimation); a request above it lays a
//! regular grid over the series span and repeats the latest sample at or
//! before each grid point (forward-fill). Neither path synthesizes values.

use snafu::{Backtrace, prelude::*};

use crate::series::LabelSeries;

/// Number of leading samples used to estimate the native interval.
pub const NATIVE_WINDOW: usize = 1000;

/// Largest grid an upsampling request may produce for one label.
pub const MAX_GRID_POINTS: usize = 10_000_000;

const MICROS_PER_SECOND: f64 = 1_000_000.0;

/// Errors raised by resampling.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ResampleError {
    /// Frequencies must be positive, finite numbers of hertz.
    #[snafu(display("Frequency must be a positive, finite number of Hz, got {frequency}"))]
    InvalidFrequency {
        /// Rejected frequency.
        frequency: f64,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The upsampling grid would exceed [`MAX_GRID_POINTS`].
    #[snafu(display(
        "Upsampling {label} at {frequency} Hz needs {points} grid points (limit {MAX_GRID_POINTS})"
    ))]
    GridTooLarge {
        /// Label being resampled.
        label: String,
        /// Requested frequency.
        frequency: f64,
        /// Grid size the request would produce.
        points: u64,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

/// How a series is transformed for a requested frequency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResamplePlan {
    /// Too few distinct timestamps to estimate a native rate.
    Unchanged,
    /// Keep every `stride`th sample.
    Decimate {
        /// Distance between kept samples, at least 1.
        stride: usize,
    },
    /// Forward-fill onto a grid with this step.
    ForwardFill {
        /// Grid step in microseconds, at least 1.
        step_micros: i64,
    },
}

/// Requested sampling interval in microseconds for `frequency` Hz.
pub fn requested_interval_micros(frequency: f64) -> Result<f64, ResampleError> {
    ensure!(
        frequency.is_finite() && frequency > 0.0,
        InvalidFrequencySnafu { frequency }
    );
    Ok(MICROS_PER_SECOND / frequency)
}

/// Median positive gap between the first [`NATIVE_WINDOW`] timestamps.
///
/// `None` when fewer than two distinct timestamps are available.
pub fn native_interval_micros(times: &[i64]) -> Option<f64> {
    let window = &times[..times.len().min(NATIVE_WINDOW)];
    let mut gaps: Vec<i64> = window
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|gap| *gap > 0)
        .collect();
    if gaps.is_empty() {
        return None;
    }
    gaps.sort_unstable();
    let mid = gaps.len() / 2;
    Some(if gaps.len() % 2 == 0 {
        (gaps[mid - 1] as f64 + gaps[mid] as f64) / 2.0
    } else {
        gaps[mid] as f64
    })
}

/// Decide how to resample `times` to `requested_micros`.
pub fn plan(times: &[i64], requested_micros: f64) -> ResamplePlan {
    let Some(native) = native_interval_micros(times) else {
        return ResamplePlan::Unchanged;
    };
    if requested_micros >= native {
        let stride = (requested_micros / native).round().max(1.0) as usize;
        ResamplePlan::Decimate { stride }
    } else {
        let step_micros = requested_micros.round().max(1.0) as i64;
        ResamplePlan::ForwardFill { step_micros }
    }
}

/// Resample `series` to `frequency` Hz.
pub fn resample(series: &LabelSeries, frequency: f64) -> Result<LabelSeries, ResampleError> {
    let requested = requested_interval_micros(frequency)?;
    let plan = plan(&series.times, requested);
    log::debug!(
        "resampling {} ({} samples) at {frequency} Hz: {plan:?}",
        series.label,
        series.len()
    );

    match plan {
        ResamplePlan::Unchanged => Ok(series.clone()),
        ResamplePlan::Decimate { stride } => Ok(decimate(series, stride)),
        ResamplePlan::ForwardFill { step_micros } => {
            let (Some(&first), Some(&last)) = (series.times.first(), series.times.last()) else {
                return Ok(series.clone());
            };
            let points = ((last - first) / step_micros) as u64 + 1;
            ensure!(
                points <= MAX_GRID_POINTS as u64,
                GridTooLargeSnafu {
                    label: series.label.clone(),
                    frequency,
                    points,
                }
            );
            Ok(forward_fill(series, first, last, step_micros))
        }
    }
}

/// Keep samples `0, stride, 2*stride, ...`.
pub fn decimate(series: &LabelSeries, stride: usize) -> LabelSeries {
    let stride = stride.max(1);
    LabelSeries {
        label: series.label.clone(),
        times: series.times.iter().copied().step_by(stride).collect(),
        values: series.values.iter().copied().step_by(stride).collect(),
    }
}

/// Grid `start, start + step, ...` up to `end`, each point carrying the
/// latest sample at or before it. Points before the first sample are `None`.
pub fn forward_fill(series: &LabelSeries, start: i64, end: i64, step_micros: i64) -> LabelSeries {
    let step = step_micros.max(1);
    let mut out = LabelSeries::new(series.label.clone());
    let mut next = 0;
    let mut current = None;
    let mut point = start;
    while point <= end {
        while next < series.times.len() && series.times[next] <= point {
            current = Some(series.values[next]);
            next += 1;
        }
        out.times.push(point);
        out.values.push(current.flatten());
        point += step;
    }
    out
}
