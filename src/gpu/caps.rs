// ============================================================================
// CAPABILITY NEGOTIATOR — workgroup shape, tile size and dispatch budget
// ============================================================================
//
// `negotiate` is a pure function of the reported limits, so it is unit-tested
// without a device.  The self-test needs a live `GpuContext` and lives below.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::context::GpuContext;
use super::pool::BufferArena;
use super::{linear_dispatch, shaders};
use crate::error::PipelineError;
use crate::{log_info, log_warn};

/// Shapes tried in order; the first one that fits the device wins.
pub const WORKGROUP_CANDIDATES: [(u32, u32, u32); 5] =
    [(16, 16, 1), (8, 16, 2), (8, 8, 4), (8, 8, 1), (4, 4, 1)];

/// Invocations per workgroup a device must offer before Full mode is considered.
pub const FULL_MODE_MIN_INVOCATIONS: u32 = 1024;
/// Smallest chosen workgroup that still counts as Full.
pub const FULL_MODE_MIN_TOTAL: u32 = 256;

const FULL_TILE: u32 = 256;
const FULL_BUDGET: u32 = 4;
const REDUCED_TILE: u32 = 128;
const REDUCED_BUDGET: u32 = 2;

/// Elements written by the self-test kernel.
const SELF_TEST_LEN: u32 = 4096;

/// The subset of `wgpu::Limits` the negotiator looks at.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceLimits {
    pub max_workgroup_size_x: u32,
    pub max_workgroup_size_y: u32,
    pub max_workgroup_size_z: u32,
    pub max_invocations_per_workgroup: u32,
    pub max_workgroups_per_dimension: u32,
    pub max_storage_buffer_binding_size: u64,
    pub max_buffer_size: u64,
}

impl From<&wgpu::Limits> for DeviceLimits {
    fn from(l: &wgpu::Limits) -> Self {
        Self {
            max_workgroup_size_x: l.max_compute_workgroup_size_x,
            max_workgroup_size_y: l.max_compute_workgroup_size_y,
            max_workgroup_size_z: l.max_compute_workgroup_size_z,
            max_invocations_per_workgroup: l.max_compute_invocations_per_workgroup,
            max_workgroups_per_dimension: l.max_compute_workgroups_per_dimension,
            max_storage_buffer_binding_size: l.max_storage_buffer_binding_size as u64,
            max_buffer_size: l.max_buffer_size,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Workgroup {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub total: u32,
}

impl Workgroup {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self {
            x,
            y,
            z,
            total: x * y * z,
        }
    }

    /// Rows covered by one workgroup of the coordinate kernel (y and z both
    /// walk rows).
    pub fn rows(&self) -> u32 {
        self.y * self.z
    }

    fn fits(&self, limits: &DeviceLimits) -> bool {
        self.x <= limits.max_workgroup_size_x
            && self.y <= limits.max_workgroup_size_y
            && self.z <= limits.max_workgroup_size_z
            && self.total <= limits.max_invocations_per_workgroup
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Reduced,
    Full,
}

/// Dispatch parameters for one device session.  Immutable once negotiated.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityProfile {
    pub workgroup: Workgroup,
    /// Workgroup size of the one-dimensional kernels (composite, sort).
    pub linear: u32,
    pub tile_pixels: u32,
    pub per_frame_budget: u32,
    pub mode: Mode,
    pub limits: DeviceLimits,
}

/// Pick the first candidate shape that fits and classify the device.
pub fn negotiate(limits: &DeviceLimits, force_reduced: bool) -> Result<CapabilityProfile, PipelineError> {
    let workgroup = WORKGROUP_CANDIDATES
        .iter()
        .map(|&(x, y, z)| Workgroup::new(x, y, z))
        .find(|wg| wg.fits(limits))
        .ok_or_else(|| {
            PipelineError::CapabilityUnavailable(format!(
                "no workgroup shape fits device limits ({} invocations, {}x{}x{})",
                limits.max_invocations_per_workgroup,
                limits.max_workgroup_size_x,
                limits.max_workgroup_size_y,
                limits.max_workgroup_size_z
            ))
        })?;

    let full = !force_reduced
        && limits.max_invocations_per_workgroup >= FULL_MODE_MIN_INVOCATIONS
        && workgroup.total >= FULL_MODE_MIN_TOTAL;

    let (mode, tile_pixels, per_frame_budget) = if full {
        (Mode::Full, FULL_TILE, FULL_BUDGET)
    } else {
        (Mode::Reduced, REDUCED_TILE, REDUCED_BUDGET)
    };

    Ok(CapabilityProfile {
        workgroup,
        linear: workgroup.total.min(limits.max_workgroup_size_x),
        tile_pixels,
        per_frame_budget,
        mode,
        limits: *limits,
    })
}

// ============================================================================
// Status
// ============================================================================

/// Read-only capability report for tooling (`--status`, `Orchestrator::status`).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityStatus {
    pub gpu_available: bool,
    pub adapter_name: Option<String>,
    pub backend: Option<String>,
    pub mode: Option<Mode>,
    pub workgroup: Option<Workgroup>,
    pub tile_pixels: Option<u32>,
    pub per_frame_budget: Option<u32>,
    pub degraded: bool,
    pub self_test_ms: Option<f64>,
    /// Why the GPU is unavailable or degraded.
    pub detail: Option<String>,
}

impl CapabilityStatus {
    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Default::default()
        }
    }

    pub fn from_profile(ctx: &GpuContext, profile: &CapabilityProfile, test: &SelfTestReport) -> Self {
        Self {
            gpu_available: true,
            adapter_name: Some(ctx.adapter_name.clone()),
            backend: Some(ctx.backend.clone()),
            mode: Some(profile.mode),
            workgroup: Some(profile.workgroup),
            tile_pixels: Some(profile.tile_pixels),
            per_frame_budget: Some(profile.per_frame_budget),
            degraded: test.degraded,
            self_test_ms: test.best_ms,
            detail: test.detail.clone(),
        }
    }

    /// `true` when jobs may be routed to the GPU.
    pub fn usable(&self) -> bool {
        self.gpu_available && !self.degraded
    }
}

// ============================================================================
// Self-test
// ============================================================================

#[derive(Clone, Debug, PartialEq, Default)]
pub struct SelfTestReport {
    pub degraded: bool,
    /// Fastest passing attempt, or the fastest completed attempt when none passed.
    pub best_ms: Option<f64>,
    pub detail: Option<String>,
}

/// Dispatch a trivial kernel up to `attempts` times.  One run that completes
/// correctly within `budget` is enough; otherwise the session is degraded.
pub fn self_test(
    ctx: &GpuContext,
    profile: &CapabilityProfile,
    budget: Duration,
    attempts: u32,
    watchdog: Duration,
) -> SelfTestReport {
    let pipeline = match build_self_test_pipeline(ctx, profile) {
        Ok(p) => p,
        Err(e) => {
            log_warn!("Self-test kernel rejected: {}", e);
            return SelfTestReport {
                degraded: true,
                best_ms: None,
                detail: Some(e.to_string()),
            };
        }
    };

    let mut best: Option<f64> = None;
    let mut last_error = None;
    for attempt in 1..=attempts.max(1) {
        match run_self_test_once(ctx, profile, &pipeline, watchdog) {
            Ok(elapsed) => {
                let ms = elapsed.as_secs_f64() * 1000.0;
                best = Some(best.map_or(ms, |b: f64| b.min(ms)));
                log_info!("Self-test attempt {}: {:.2} ms (budget {} ms)", attempt, ms, budget.as_millis());
                if elapsed <= budget {
                    return SelfTestReport {
                        degraded: false,
                        best_ms: Some(ms),
                        detail: None,
                    };
                }
            }
            Err(e) => {
                log_warn!("Self-test attempt {} failed: {}", attempt, e);
                last_error = Some(e.to_string());
            }
        }
    }

    let detail = last_error.unwrap_or_else(|| {
        format!(
            "self-test exceeded {} ms budget in {} attempts",
            budget.as_millis(),
            attempts.max(1)
        )
    });
    eprintln!("[GPU] {}", PipelineError::degraded(&detail));
    SelfTestReport {
        degraded: true,
        best_ms: best,
        detail: Some(detail),
    }
}

struct SelfTestPipeline {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

fn build_self_test_pipeline(ctx: &GpuContext, profile: &CapabilityProfile) -> Result<SelfTestPipeline, PipelineError> {
    let source = shaders::linear_kernel(shaders::SELF_TEST_SHADER, profile.linear);
    let bind_group_layout = ctx
        .device
        .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("self_test_bgl"),
            entries: &[super::storage_entry(0, false)],
        });
    let pipeline = ctx.compile_compute("self_test", &source, "cs_self_test", &bind_group_layout)?;
    Ok(SelfTestPipeline {
        pipeline,
        bind_group_layout,
    })
}

fn run_self_test_once(
    ctx: &GpuContext,
    profile: &CapabilityProfile,
    st: &SelfTestPipeline,
    watchdog: Duration,
) -> Result<Duration, PipelineError> {
    let mut arena = BufferArena::new("self_test", profile.limits, ctx.error_scopes());
    let out = arena.storage(&ctx.device, "self_test_out", SELF_TEST_LEN as u64 * 4, true)?;

    let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("self_test_bg"),
        layout: &st.bind_group_layout,
        entries: &[wgpu::BindGroupEntry {
            binding: 0,
            resource: arena.get(out).as_entire_binding(),
        }],
    });

    let start = Instant::now();
    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("self_test_encoder"),
        });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("self_test_pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&st.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        let (gx, gy) = linear_dispatch(SELF_TEST_LEN, profile.linear, profile.limits.max_workgroups_per_dimension);
        pass.dispatch_workgroups(gx, gy, 1);
    }
    ctx.submit_one(encoder);
    let data: Vec<u32> = super::compositor::read_buffer(ctx, &mut arena, out, SELF_TEST_LEN as usize, watchdog)?;
    let elapsed = start.elapsed();

    if let Some(bad) = data.iter().enumerate().position(|(i, &v)| v != (i as u32).wrapping_mul(3) + 1) {
        return Err(PipelineError::degraded(format!(
            "self-test kernel wrote {} at slot {}",
            data[bad], bad
        )));
    }
    Ok(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn webgpu_defaults() -> DeviceLimits {
        DeviceLimits {
            max_workgroup_size_x: 256,
            max_workgroup_size_y: 256,
            max_workgroup_size_z: 64,
            max_invocations_per_workgroup: 256,
            max_workgroups_per_dimension: 65535,
            max_storage_buffer_binding_size: 128 << 20,
            max_buffer_size: 256 << 20,
        }
    }

    fn desktop() -> DeviceLimits {
        DeviceLimits {
            max_workgroup_size_x: 1024,
            max_workgroup_size_y: 1024,
            max_workgroup_size_z: 64,
            max_invocations_per_workgroup: 1024,
            ..webgpu_defaults()
        }
    }

    #[test]
    fn desktop_device_is_full() {
        let p = negotiate(&desktop(), false).unwrap();
        assert_eq!(p.workgroup, Workgroup::new(16, 16, 1));
        assert_eq!(p.mode, Mode::Full);
        assert_eq!((p.tile_pixels, p.per_frame_budget), (256, 4));
        assert_eq!(p.linear, 256);
    }

    #[test]
    fn forcing_reduced_keeps_the_shape() {
        let p = negotiate(&desktop(), true).unwrap();
        assert_eq!(p.workgroup.total, 256);
        assert_eq!(p.mode, Mode::Reduced);
        assert_eq!((p.tile_pixels, p.per_frame_budget), (128, 2));
    }

    #[test]
    fn baseline_device_is_reduced() {
        // 256 invocations: shape fits, but the device is below the Full bar.
        let p = negotiate(&webgpu_defaults(), false).unwrap();
        assert_eq!(p.workgroup, Workgroup::new(16, 16, 1));
        assert_eq!(p.mode, Mode::Reduced);
    }

    #[test]
    fn narrow_axes_fall_through_candidates() {
        let mut l = desktop();
        l.max_workgroup_size_x = 8;
        l.max_workgroup_size_y = 8;
        let p = negotiate(&l, false).unwrap();
        assert_eq!(p.workgroup, Workgroup::new(8, 8, 4));
        // Still 256 invocations in total, so the device stays Full.
        assert_eq!(p.mode, Mode::Full);
        assert_eq!(p.linear, 8);

        l.max_workgroup_size_z = 1;
        let p = negotiate(&l, false).unwrap();
        assert_eq!(p.workgroup, Workgroup::new(8, 8, 1));
        assert_eq!(p.mode, Mode::Reduced);

        l.max_invocations_per_workgroup = 32;
        assert_eq!(negotiate(&l, false).unwrap().workgroup, Workgroup::new(4, 4, 1));
    }

    #[test]
    fn second_shape_when_y_is_limited() {
        let mut l = desktop();
        l.max_workgroup_size_x = 8;
        let p = negotiate(&l, false).unwrap();
        assert_eq!(p.workgroup, Workgroup::new(8, 16, 2));
        assert_eq!(p.workgroup.rows(), 32);
    }

    #[test]
    fn nothing_fits_is_unavailable() {
        let mut l = webgpu_defaults();
        l.max_invocations_per_workgroup = 8;
        assert!(matches!(
            negotiate(&l, false),
            Err(PipelineError::CapabilityUnavailable(_))
        ));
    }

    #[test]
    fn status_round_trips_through_json() {
        let status = CapabilityStatus {
            gpu_available: true,
            adapter_name: Some("test".into()),
            mode: Some(Mode::Full),
            workgroup: Some(Workgroup::new(16, 16, 1)),
            ..Default::default()
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"gpuAvailable\":true"));
        let back: CapabilityStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
        assert!(back.usable());
        assert!(!CapabilityStatus::unavailable("none").usable());
    }
}
