// ============================================================================
// GPU SESSION — explicit device context: init, negotiated profile, teardown
// ============================================================================

use std::time::Duration;

use super::caps::{self, CapabilityProfile, CapabilityStatus, DeviceLimits};
use super::compositor::GpuCompositePipeline;
use super::compute::GpuCoordinatePipeline;
use super::context::GpuContext;
use super::pool::BufferArena;
use super::sort::GpuSortPipeline;
use crate::config::EngineConfig;
use crate::error::PipelineError;
use crate::model::SortOrder;
use crate::ops::expr::NoiseFn;
use crate::ops::sort::SortedByDistance;
use crate::{log_info, log_warn};

/// Everything that lives for one device session.  Shared read-only between
/// concurrent jobs; each job brings its own [`BufferArena`].
pub struct GpuSession {
    pub ctx: GpuContext,
    profile: CapabilityProfile,
    status: CapabilityStatus,
    composite: GpuCompositePipeline,
    sort: GpuSortPipeline,
    watchdog: Duration,
}

impl GpuSession {
    /// Bring up a device, negotiate a profile and run the self-test.
    ///
    /// A degraded self-test still returns a session; its status says so and
    /// the orchestrator decides whether to route work to it.
    pub fn init(config: &EngineConfig) -> Result<Self, PipelineError> {
        let ctx = GpuContext::new(&config.preferred_gpu)?;
        let limits = DeviceLimits::from(&ctx.limits);
        let profile = caps::negotiate(&limits, config.force_reduced)?;
        log_info!(
            "Negotiated {:?} mode: workgroup {}x{}x{} ({}), tile {} px, {} dispatches/frame",
            profile.mode,
            profile.workgroup.x,
            profile.workgroup.y,
            profile.workgroup.z,
            profile.workgroup.total,
            profile.tile_pixels,
            profile.per_frame_budget
        );

        let composite = GpuCompositePipeline::new(&ctx, profile.linear)?;
        let sort = GpuSortPipeline::new(&ctx, profile.linear)?;

        let watchdog = config.watchdog();
        let report = caps::self_test(
            &ctx,
            &profile,
            Duration::from_millis(config.self_test_budget_ms),
            config.self_test_attempts,
            watchdog,
        );
        if report.degraded {
            log_warn!("GPU session is degraded: {}", report.detail.as_deref().unwrap_or("unknown"));
        }
        let status = CapabilityStatus::from_profile(&ctx, &profile, &report);

        eprintln!(
            "[GPU] {} ({}) {:?} mode{}",
            ctx.adapter_name,
            ctx.backend,
            profile.mode,
            if report.degraded { ", degraded" } else { "" }
        );

        Ok(Self {
            ctx,
            profile,
            status,
            composite,
            sort,
            watchdog,
        })
    }

    pub fn profile(&self) -> &CapabilityProfile {
        &self.profile
    }

    pub fn status(&self) -> CapabilityStatus {
        self.status.clone()
    }

    /// Healthy enough to take jobs (self-test passed).
    pub fn usable(&self) -> bool {
        self.status.usable()
    }

    pub fn watchdog(&self) -> Duration {
        self.watchdog
    }

    pub fn composite(&self) -> &GpuCompositePipeline {
        &self.composite
    }

    /// A fresh arena bound to this device's limits.
    pub fn arena(&self, label: impl Into<String>) -> BufferArena {
        BufferArena::new(label, self.profile.limits, self.ctx.error_scopes())
    }

    /// Compile the coordinate kernel for one job's expression.
    pub fn coordinate_pipeline(&self, noise: &NoiseFn) -> Result<GpuCoordinatePipeline, PipelineError> {
        GpuCoordinatePipeline::new(&self.ctx, noise, self.profile.workgroup)
    }

    /// GPU bitonic sort using buffers from `arena`.
    pub fn sort_points_in(
        &self,
        arena: &mut BufferArena,
        points: &[[f32; 2]],
        center: [f32; 2],
        order: SortOrder,
    ) -> Result<SortedByDistance, PipelineError> {
        self.sort.sort_points(&self.ctx, arena, points, center, order, self.watchdog)
    }

    /// Stand-alone distance sort with its own short-lived arena.
    pub fn sort_by_distance(
        &self,
        points: &[(f64, f64)],
        center: (f64, f64),
        order: SortOrder,
    ) -> Result<SortedByDistance, PipelineError> {
        let packed: Vec<[f32; 2]> = points.iter().map(|&(x, y)| [x as f32, y as f32]).collect();
        let mut arena = self.arena("sort_by_distance");
        self.sort_points_in(&mut arena, &packed, [center.0 as f32, center.1 as f32], order)
    }

    /// Drain outstanding work and drop the device.
    pub fn teardown(self) {
        if let Err(e) = self.ctx.wait_idle(self.watchdog) {
            log_warn!("Teardown with outstanding GPU work: {}", e);
        }
        log_info!("GPU session on {} closed", self.ctx.adapter_name);
    }
}
