// ============================================================================
// COORDINATE PIPELINE — per-point math and the scalar (CPU) batch renderer
// ============================================================================
//
// Order of operations for one coordinate is fixed:
//   noise → scalar-radius warp → modulus fold → fractal → angular
//         → distance → scale → curve index → checkerboard
// Changing it changes every rendered image.

use rayon::prelude::*;

use super::distortion::{
    apply_angular, apply_fractal, checker, curve_index, distance, fold_point, warp,
};
use super::expr::NoiseFn;
use crate::error::PipelineError;
use crate::model::{Curve, DistortionProfile, Job};

/// Rows per CPU progress band.
pub const CPU_BAND_ROWS: u32 = 64;

/// Result of running one coordinate through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub value: u8,
    pub index: u32,
}

impl Sample {
    /// Substitute used when the noise value is not finite.
    pub fn fallback(curve: &Curve) -> Self {
        Self {
            value: curve.data.first().copied().unwrap_or(0),
            index: 0,
        }
    }
}

/// Run one coordinate through the pipeline, reporting non-finite noise.
///
/// `noise` should return the raw (uncoerced) formula value; a NaN or
/// infinity anywhere in the chain yields `NumericDegenerate`.
pub fn process_checked<F>(
    x: f64,
    y: f64,
    noise: &F,
    curve: &Curve,
    profile: &DistortionProfile,
) -> Result<Sample, PipelineError>
where
    F: Fn(f64, f64) -> f64 + ?Sized,
{
    let degenerate = || PipelineError::NumericDegenerate { x, y };

    let n = noise(x, y);
    if !n.is_finite() {
        return Err(degenerate());
    }

    let (mut wx, mut wy) = warp(x, y, n);

    if profile.distance_modulus > 0.0 {
        (wx, wy) = fold_point(wx, wy, profile.distance_modulus);
    }
    if profile.fractal.enabled {
        (wx, wy) = apply_fractal(wx, wy, &profile.fractal);
    }
    if profile.angular.is_active() {
        (wx, wy) = apply_angular(wx, wy, &profile.angular);
    }

    let d = distance(profile.distance_metric, wx, wy);
    let scaled = d * profile.curve_scaling * curve.index_scaling as f64;
    let index = curve_index(scaled, curve.width).ok_or_else(degenerate)?;
    let mut value = curve.data[index as usize];

    if profile.checkerboard.is_active() {
        // Bands follow the undistorted, unscaled distance of the input point.
        let d0 = distance(profile.distance_metric, x, y);
        value = checker(value, d0, profile.checkerboard.step_size);
    }

    Ok(Sample { value, index })
}

/// Infallible form: degenerate coordinates fall back to curve index 0.
pub fn process<F>(x: f64, y: f64, noise: &F, curve: &Curve, profile: &DistortionProfile) -> Sample
where
    F: Fn(f64, f64) -> f64 + ?Sized,
{
    process_checked(x, y, noise, curve, profile).unwrap_or_else(|_| Sample::fallback(curve))
}

// ============================================================================
// Batch renderer
// ============================================================================

/// Value and index planes for a whole job.
#[derive(Debug, Clone, Default)]
pub struct Planes {
    pub values: Vec<u8>,
    pub indices: Vec<u32>,
    pub degenerate_count: u64,
    /// First coordinate that degenerated, for the job log.
    pub first_degenerate: Option<(f64, f64)>,
}

/// Evaluate every pixel of `job` on the CPU, one rayon task per row.
/// `on_band(done, total)` is called after each band of rows.
pub fn render_planes(job: &Job, noise: &NoiseFn, mut on_band: impl FnMut(u32, u32)) -> Planes {
    let width = job.width as usize;
    let height = job.height;
    let total_bands = height.div_ceil(CPU_BAND_ROWS);
    let raw = |x: f64, y: f64| noise.eval_raw(x, y);

    let mut values = vec![0u8; job.pixel_count()];
    let mut indices = vec![0u32; job.pixel_count()];
    let mut degenerate_count = 0u64;
    let mut first_degenerate = None;

    let band_len = width * CPU_BAND_ROWS as usize;
    for (band, (value_band, index_band)) in values
        .chunks_mut(band_len)
        .zip(indices.chunks_mut(band_len))
        .enumerate()
    {
        let first_row = band as u32 * CPU_BAND_ROWS;
        let row_results: Vec<(u64, Option<(f64, f64)>)> = value_band
            .par_chunks_mut(width)
            .zip(index_band.par_chunks_mut(width))
            .enumerate()
            .map(|(r, (value_row, index_row))| {
                let py = first_row + r as u32;
                let mut bad = 0u64;
                let mut first = None;
                for (px, (v, i)) in value_row.iter_mut().zip(index_row.iter_mut()).enumerate() {
                    let (x, y) = job.coordinate(px as u32, py);
                    let sample = match process_checked(x, y, &raw, &job.curve, &job.distortion_profile) {
                        Ok(s) => s,
                        Err(_) => {
                            bad += 1;
                            first.get_or_insert((x, y));
                            Sample::fallback(&job.curve)
                        }
                    };
                    *v = sample.value;
                    *i = sample.index;
                }
                (bad, first)
            })
            .collect();

        for (bad, first) in row_results {
            degenerate_count += bad;
            if first_degenerate.is_none() {
                first_degenerate = first;
            }
        }
        on_band(band as u32 + 1, total_bands);
    }

    Planes {
        values,
        indices,
        degenerate_count,
        first_degenerate,
    }
}
