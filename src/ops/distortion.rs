// ============================================================================
// DISTORTION MATH — warps, folds, distance metrics, checkerboard
// ============================================================================
//
// Scalar f64 building blocks of the coordinate pipeline.  The WGSL versions
// in gpu/shaders.rs follow these line for line; keep them in sync.

use crate::model::{AngularDistortion, DistanceMetric, FractalDistortion};

const SQRT3_OVER_2: f64 = 0.866_025_403_784_438_6;
const SQRT2_MINUS_1: f64 = std::f64::consts::SQRT_2 - 1.0;

/// Fractal octave weights, strongest first.
pub const FRACTAL_WEIGHTS: [f64; 3] = [0.3, 0.2, 0.1];
/// Angular amplitude is expressed in hundredths of a radian.
pub const ANGULAR_AMPLITUDE_UNIT: f64 = 0.01;

/// Scalar-radius warp: the point keeps its angle, its radius becomes `n`
/// (scaled by `n / r`).  The origin stays at the origin.
pub fn warp(x: f64, y: f64, n: f64) -> (f64, f64) {
    let r = x.hypot(y);
    if r > 0.0 {
        let k = n / r;
        (x * k, y * k)
    } else {
        (0.0, 0.0)
    }
}

/// Fold `v` into `[-m/2, m/2)` with a floored modulo, so negative inputs
/// land in the same tiles as positive ones.
pub fn fold(v: f64, modulus: f64) -> f64 {
    let half = modulus / 2.0;
    (v + half).rem_euclid(modulus) - half
}

pub fn fold_point(x: f64, y: f64, modulus: f64) -> (f64, f64) {
    (fold(x, modulus), fold(y, modulus))
}

/// Rotate the point by a sinusoid of its own angle, keeping its radius.
pub fn apply_angular(x: f64, y: f64, angular: &AngularDistortion) -> (f64, f64) {
    let r = x.hypot(y);
    let mut angle = y.atan2(x) + angular.offset_deg.to_radians();
    angle += (angle * angular.frequency).sin() * angular.amplitude * ANGULAR_AMPLITUDE_UNIT;
    (r * angle.cos(), r * angle.sin())
}

/// Three cross-coupled sinusoidal octaves: x is pushed by y and vice versa.
pub fn apply_fractal(x: f64, y: f64, fractal: &FractalDistortion) -> (f64, f64) {
    let scales = [fractal.scale1, fractal.scale2, fractal.scale3];
    let mut dx = 0.0;
    let mut dy = 0.0;
    for (scale, weight) in scales.iter().zip(FRACTAL_WEIGHTS) {
        dx += (y * scale).sin() * weight;
        dy += (x * scale).sin() * weight;
    }
    (x + dx * fractal.strength, y + dy * fractal.strength)
}

pub fn distance(metric: DistanceMetric, x: f64, y: f64) -> f64 {
    let a = x.abs();
    let b = y.abs();
    match metric {
        DistanceMetric::Radial => x.hypot(y),
        DistanceMetric::CartesianX => a,
        DistanceMetric::CartesianY => b,
        DistanceMetric::Manhattan => a + b,
        DistanceMetric::Chebyshev => a.max(b),
        DistanceMetric::Minkowski3 => (a * a * a + b * b * b).cbrt(),
        DistanceMetric::Triangular => (a + b + (x + y).abs()) / 2.0,
        DistanceMetric::Hexagonal => b.max(a * SQRT3_OVER_2 + b / 2.0),
        DistanceMetric::Octagonal => a.max(b) + SQRT2_MINUS_1 * a.min(b),
        DistanceMetric::Squircle => (a * a * a * a + b * b * b * b).sqrt().sqrt(),
    }
}

/// Invert `value` on odd checker bands of `distance`.  Applying it twice
/// with the same inputs restores the value.
pub fn checker(value: u8, distance: f64, step_size: f64) -> u8 {
    if step_size <= 0.0 || !distance.is_finite() {
        return value;
    }
    let step = (distance / step_size).floor();
    if step.rem_euclid(2.0) == 1.0 {
        255 - value
    } else {
        value
    }
}

/// Map a scaled distance onto `[0, width)`.  Returns `None` for non-finite input.
pub fn curve_index(scaled: f64, width: u32) -> Option<u32> {
    if !scaled.is_finite() || width == 0 {
        return None;
    }
    let w = width as f64;
    let mut idx = (scaled % w).floor();
    if idx < 0.0 {
        idx += w;
    }
    Some((idx as u32).min(width - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn warp_preserves_angle_and_sets_radius() {
        let (x, y) = warp(3.0, 4.0, 10.0);
        assert!((x - 6.0).abs() < EPS && (y - 8.0).abs() < EPS);
        assert_eq!(warp(0.0, 0.0, 7.0), (0.0, 0.0));
        let (x, y) = warp(3.0, 4.0, 5.0);
        assert!((x - 3.0).abs() < EPS && (y - 4.0).abs() < EPS);
    }

    #[test]
    fn fold_matches_worked_example() {
        assert_eq!(fold(5.0, 4.0), 1.0);
        assert_eq!(fold(-5.0, 4.0), -1.0);
        assert_eq!(fold(2.0, 4.0), -2.0);
    }

    #[test]
    fn fold_is_idempotent() {
        for &m in &[0.5, 3.0, 4.0, 17.25] {
            for i in -40..40 {
                let v = i as f64 * 0.731;
                let once = fold(v, m);
                assert!(once >= -m / 2.0 - EPS && once < m / 2.0 + EPS);
                assert!((fold(once, m) - once).abs() < 1e-9, "m={} v={}", m, v);
            }
        }
    }

    #[test]
    fn metrics_closed_forms() {
        let (x, y) = (3.0, -4.0);
        assert_eq!(distance(DistanceMetric::Radial, x, y), 5.0);
        assert_eq!(distance(DistanceMetric::CartesianX, x, y), 3.0);
        assert_eq!(distance(DistanceMetric::CartesianY, x, y), 4.0);
        assert_eq!(distance(DistanceMetric::Manhattan, x, y), 7.0);
        assert_eq!(distance(DistanceMetric::Chebyshev, x, y), 4.0);
        assert!((distance(DistanceMetric::Minkowski3, x, y) - 91f64.cbrt()).abs() < EPS);
        assert_eq!(distance(DistanceMetric::Triangular, x, y), 4.0);
        assert!((distance(DistanceMetric::Octagonal, x, y) - (4.0 + 3.0 * SQRT2_MINUS_1)).abs() < EPS);
        assert!((distance(DistanceMetric::Squircle, 2.0, 0.0) - 2.0).abs() < EPS);
    }

    #[test]
    fn metrics_are_zero_at_origin() {
        for metric in DistanceMetric::ALL {
            assert_eq!(distance(metric, 0.0, 0.0), 0.0, "{:?}", metric);
        }
    }

    #[test]
    fn angular_keeps_radius() {
        let a = AngularDistortion {
            enabled: true,
            frequency: 6.0,
            amplitude: 40.0,
            offset_deg: 30.0,
        };
        let (x, y) = apply_angular(3.0, 4.0, &a);
        assert!((x.hypot(y) - 5.0).abs() < EPS);
    }

    #[test]
    fn angular_offset_alone_rotates() {
        let a = AngularDistortion {
            enabled: true,
            frequency: 0.0,
            amplitude: 0.0,
            offset_deg: 90.0,
        };
        let (x, y) = apply_angular(1.0, 0.0, &a);
        assert!(x.abs() < EPS && (y - 1.0).abs() < EPS);
    }

    #[test]
    fn fractal_is_cross_coupled() {
        let f = FractalDistortion {
            enabled: true,
            scale1: 1.0,
            scale2: 2.0,
            scale3: 4.0,
            strength: 1.0,
        };
        // y = 0 means x receives no push; y is pushed by x.
        let (x, y) = apply_fractal(1.0, 0.0, &f);
        assert_eq!(x, 1.0);
        let expected = 1f64.sin() * 0.3 + 2f64.sin() * 0.2 + 4f64.sin() * 0.1;
        assert!((y - expected).abs() < EPS);
    }

    #[test]
    fn checker_is_self_inverse() {
        for v in [0u8, 1, 77, 128, 254, 255] {
            for d in [0.0, 0.5, 1.5, 2.2, 9.9] {
                assert_eq!(checker(checker(v, d, 1.0), d, 1.0), v);
            }
        }
        assert_eq!(checker(10, 1.5, 1.0), 245);
        assert_eq!(checker(10, 2.5, 1.0), 10);
        assert_eq!(checker(10, 1.5, 0.0), 10);
    }

    #[test]
    fn curve_index_wraps_and_clamps() {
        assert_eq!(curve_index(5.0, 8), Some(5));
        assert_eq!(curve_index(13.7, 8), Some(5));
        assert_eq!(curve_index(-1.0, 8), Some(7));
        assert_eq!(curve_index(-0.5, 8), Some(7));
        assert_eq!(curve_index(f64::NAN, 8), None);
        assert_eq!(curve_index(f64::INFINITY, 8), None);
        for i in -50..50 {
            let idx = curve_index(i as f64 * 0.37, 3).unwrap();
            assert!(idx < 3);
        }
    }
}
