// ============================================================================
// MODEL — curve, palette, distortion profile and job records
// ============================================================================
//
// These are the plain records read from the external store.  Everything here
// is JSON (de)serialisable with camelCase field names and generous defaults
// so partially-specified records still load.

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Largest image a single job may request (64 Mpx).
pub const MAX_JOB_PIXELS: u64 = 1 << 26;

fn one_f32() -> f32 {
    1.0
}

fn one_f64() -> f64 {
    1.0
}

fn opaque() -> u8 {
    255
}

// ============================================================================
// Curve
// ============================================================================

/// A 1-D lookup table of byte values addressed by the computed index.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Curve {
    pub width: u32,
    pub data: Vec<u8>,
    #[serde(default = "one_f32")]
    pub index_scaling: f32,
}

impl Curve {
    /// Build a curve whose width matches `data`.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            width: data.len() as u32,
            data,
            index_scaling: 1.0,
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.width == 0 {
            return Err(PipelineError::InvalidJob("curve width must be >= 1".into()));
        }
        if self.data.len() != self.width as usize {
            return Err(PipelineError::InvalidJob(format!(
                "curve width {} does not match data length {}",
                self.width,
                self.data.len()
            )));
        }
        if !self.index_scaling.is_finite() {
            return Err(PipelineError::InvalidJob("curve indexScaling is not finite".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Palette
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    #[serde(default = "opaque")]
    pub a: u8,
}

impl Rgba {
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    pub fn to_bytes(self) -> [u8; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

/// Number of entries in a normalised palette.
pub const PALETTE_LEN: usize = 256;

/// Exactly 256 colours; the value plane indexes straight into it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(from = "Vec<Rgba>", into = "Vec<Rgba>")]
pub struct Palette {
    entries: Vec<Rgba>,
}

impl Palette {
    /// 256-level grey ramp, used when a job supplies no palette.
    pub fn grayscale() -> Self {
        Self {
            entries: (0..PALETTE_LEN).map(|i| Rgba::rgb(i as u8, i as u8, i as u8)).collect(),
        }
    }

    /// Pad (by repeating the last entry) or truncate to 256 entries.
    /// An empty list yields the grey ramp.
    pub fn from_entries(mut entries: Vec<Rgba>) -> Self {
        let Some(&last) = entries.last() else {
            return Self::grayscale();
        };
        entries.resize(PALETTE_LEN, last);
        Self { entries }
    }

    pub fn entries(&self) -> &[Rgba] {
        &self.entries
    }

    /// Little-endian RGBA packed one colour per u32, as the GPU kernels read it.
    pub fn packed(&self) -> [u32; PALETTE_LEN] {
        let mut out = [0u32; PALETTE_LEN];
        for (slot, c) in out.iter_mut().zip(&self.entries) {
            *slot = u32::from_le_bytes(c.to_bytes());
        }
        out
    }
}

impl Default for Palette {
    fn default() -> Self {
        Self::grayscale()
    }
}

impl From<Vec<Rgba>> for Palette {
    fn from(entries: Vec<Rgba>) -> Self {
        Self::from_entries(entries)
    }
}

impl From<Palette> for Vec<Rgba> {
    fn from(p: Palette) -> Self {
        p.entries
    }
}

// ============================================================================
// Distortion profile
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AngularDistortion {
    pub enabled: bool,
    pub frequency: f64,
    pub amplitude: f64,
    pub offset_deg: f64,
}

impl AngularDistortion {
    /// Enabled and at least one parameter would change the angle.
    pub fn is_active(&self) -> bool {
        self.enabled && (self.frequency != 0.0 || self.amplitude != 0.0 || self.offset_deg != 0.0)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct FractalDistortion {
    pub enabled: bool,
    pub scale1: f64,
    pub scale2: f64,
    pub scale3: f64,
    pub strength: f64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Checkerboard {
    pub enabled: bool,
    pub step_size: f64,
}

impl Checkerboard {
    pub fn is_active(&self) -> bool {
        self.enabled && self.step_size > 0.0
    }
}

/// How a (possibly distorted) coordinate is reduced to a scalar distance.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum DistanceMetric {
    #[default]
    Radial,
    CartesianX,
    CartesianY,
    Manhattan,
    Chebyshev,
    Minkowski3,
    Triangular,
    Hexagonal,
    Octagonal,
    Squircle,
}

impl DistanceMetric {
    pub const ALL: [DistanceMetric; 10] = [
        DistanceMetric::Radial,
        DistanceMetric::CartesianX,
        DistanceMetric::CartesianY,
        DistanceMetric::Manhattan,
        DistanceMetric::Chebyshev,
        DistanceMetric::Minkowski3,
        DistanceMetric::Triangular,
        DistanceMetric::Hexagonal,
        DistanceMetric::Octagonal,
        DistanceMetric::Squircle,
    ];

    /// Selector passed to the coordinate kernel's uniform block.
    pub fn gpu_code(self) -> u32 {
        match self {
            DistanceMetric::Radial => 0,
            DistanceMetric::CartesianX => 1,
            DistanceMetric::CartesianY => 2,
            DistanceMetric::Manhattan => 3,
            DistanceMetric::Chebyshev => 4,
            DistanceMetric::Minkowski3 => 5,
            DistanceMetric::Triangular => 6,
            DistanceMetric::Hexagonal => 7,
            DistanceMetric::Octagonal => 8,
            DistanceMetric::Squircle => 9,
        }
    }
}

/// Everything about the math that is not the noise expression.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DistortionProfile {
    pub angular: AngularDistortion,
    pub fractal: FractalDistortion,
    pub distance_modulus: f64,
    pub distance_metric: DistanceMetric,
    pub curve_scaling: f64,
    pub checkerboard: Checkerboard,
}

impl Default for DistortionProfile {
    fn default() -> Self {
        Self {
            angular: AngularDistortion::default(),
            fractal: FractalDistortion::default(),
            distance_modulus: 0.0,
            distance_metric: DistanceMetric::Radial,
            curve_scaling: 1.0,
            checkerboard: Checkerboard::default(),
        }
    }
}

impl DistortionProfile {
    /// Radial metric, unit scaling, nothing enabled.
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.distance_metric = metric;
        self
    }

    pub fn with_modulus(mut self, modulus: f64) -> Self {
        self.distance_modulus = modulus;
        self
    }
}

// ============================================================================
// Job
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

fn new_job_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// One unit of work for the orchestrator.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[serde(default = "new_job_id")]
    pub id: String,
    pub width: u32,
    pub height: u32,
    pub curve: Curve,
    #[serde(default)]
    pub distortion_profile: DistortionProfile,
    #[serde(default)]
    pub palette: Option<Vec<Rgba>>,
    pub expression: String,
    /// Pixel that maps to coordinate (0, 0); defaults to the image midpoint.
    #[serde(default)]
    pub center: Option<Point>,
    #[serde(default = "one_f64")]
    pub scale: f64,
    /// Request a distance-ordered point list alongside the image.
    #[serde(default)]
    pub sort: Option<SortOrder>,
}

impl Job {
    pub fn new(width: u32, height: u32, curve: Curve, expression: impl Into<String>) -> Self {
        Self {
            id: new_job_id(),
            width,
            height,
            curve,
            distortion_profile: DistortionProfile::default(),
            palette: None,
            expression: expression.into(),
            center: None,
            scale: 1.0,
            sort: None,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn center(&self) -> Point {
        self.center.unwrap_or(Point {
            x: self.width as f64 / 2.0,
            y: self.height as f64 / 2.0,
        })
    }

    /// Map a pixel to its pattern-space coordinate.
    pub fn coordinate(&self, px: u32, py: u32) -> (f64, f64) {
        let c = self.center();
        ((px as f64 - c.x) * self.scale, (py as f64 - c.y) * self.scale)
    }

    pub fn palette(&self) -> Palette {
        self.palette
            .clone()
            .map(Palette::from_entries)
            .unwrap_or_default()
    }

    /// Curve scaling with the curve's own index scaling folded in.
    pub fn effective_curve_scaling(&self) -> f64 {
        self.distortion_profile.curve_scaling * self.curve.index_scaling as f64
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.width == 0 || self.height == 0 {
            return Err(PipelineError::InvalidJob(format!(
                "image size {}x{} is empty",
                self.width, self.height
            )));
        }
        if (self.width as u64) * (self.height as u64) > MAX_JOB_PIXELS {
            return Err(PipelineError::InvalidJob(format!(
                "image size {}x{} exceeds {} pixels",
                self.width, self.height, MAX_JOB_PIXELS
            )));
        }
        self.curve.validate()?;
        if !self.scale.is_finite() {
            return Err(PipelineError::InvalidJob("scale is not finite".into()));
        }
        if let Some(c) = self.center
            && !(c.x.is_finite() && c.y.is_finite())
        {
            return Err(PipelineError::InvalidJob("center is not finite".into()));
        }
        let p = &self.distortion_profile;
        let numbers = [
            p.angular.frequency,
            p.angular.amplitude,
            p.angular.offset_deg,
            p.fractal.scale1,
            p.fractal.scale2,
            p.fractal.scale3,
            p.fractal.strength,
            p.distance_modulus,
            p.curve_scaling,
            p.checkerboard.step_size,
        ];
        if numbers.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::InvalidJob(
                "distortion profile contains a non-finite parameter".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Results
// ============================================================================

/// One entry of the distance-ordered output.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SortedPoint {
    pub pixel_index: u32,
    pub x: f64,
    pub y: f64,
    pub distance: f64,
    pub value: u8,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendUsed {
    Cpu,
    Gpu,
}

/// Terminal payload of a successful job.
#[derive(Clone, Debug)]
pub struct JobOutput {
    pub job_id: String,
    pub width: u32,
    pub height: u32,
    /// RGBA8, row-major.
    pub pixels: Vec<u8>,
    /// Raw curve values, one byte per pixel.
    pub value_plane: Vec<u8>,
    /// Curve index chosen for each pixel.
    pub index_plane: Vec<u32>,
    pub sorted: Option<Vec<SortedPoint>>,
    /// Pixels whose noise value was non-finite and fell back to index 0.
    pub degenerate_count: u64,
    pub backend: BackendUsed,
    pub elapsed_ms: u64,
}
