// ============================================================================
// GPU COORDINATE PIPELINE — per-expression kernel, tiled dispatch
// ============================================================================

use bytemuck::{Pod, Zeroable};

use super::caps::Workgroup;
use super::context::GpuContext;
use super::{shaders, storage_entry, uniform_entry};
use crate::error::PipelineError;
use crate::model::Job;
use crate::ops::expr::NoiseFn;

/// Set in a value word by the kernel when the noise value was non-finite.
pub const DEGENERATE_BIT: u32 = 1 << 8;

const FLAG_ANGULAR: u32 = 1;
const FLAG_FRACTAL: u32 = 2;
const FLAG_MODULUS: u32 = 4;
const FLAG_CHECKER: u32 = 8;

/// Rectangle of pixels covered by one dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tile {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Tile {
    /// Workgroups needed to cover this tile.
    pub fn workgroups(&self, wg: Workgroup) -> (u32, u32, u32) {
        (self.w.div_ceil(wg.x), self.h.div_ceil(wg.rows()), 1)
    }
}

/// Cut a `width × height` image into square tiles of side `tile` (edge
/// tiles are clipped), row-major.
pub fn tiles(width: u32, height: u32, tile: u32) -> Vec<Tile> {
    let tile = tile.max(1);
    let mut out = Vec::with_capacity((width.div_ceil(tile) * height.div_ceil(tile)) as usize);
    for y in (0..height).step_by(tile as usize) {
        for x in (0..width).step_by(tile as usize) {
            out.push(Tile {
                x,
                y,
                w: tile.min(width - x),
                h: tile.min(height - y),
            });
        }
    }
    out
}

/// Uniform block of the coordinate kernel.  Field order matches
/// `CoordinateParams` in shaders.rs.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct CoordinateParams {
    pub width: u32,
    pub height: u32,
    pub tile_x: u32,
    pub tile_y: u32,
    pub tile_w: u32,
    pub tile_h: u32,
    pub curve_width: u32,
    pub metric: u32,
    pub flags: u32,
    pub center_x: f32,
    pub center_y: f32,
    pub scale: f32,
    pub curve_scaling: f32,
    pub ang_frequency: f32,
    pub ang_amplitude: f32,
    /// Radians.
    pub ang_offset: f32,
    pub frac_scale1: f32,
    pub frac_scale2: f32,
    pub frac_scale3: f32,
    pub frac_strength: f32,
    pub modulus: f32,
    pub checker_step: f32,
    pub _pad0: u32,
    pub _pad1: u32,
}

impl CoordinateParams {
    pub fn new(job: &Job, tile: Tile) -> Self {
        let p = &job.distortion_profile;
        let center = job.center();

        let mut flags = 0;
        if p.angular.is_active() {
            flags |= FLAG_ANGULAR;
        }
        if p.fractal.enabled {
            flags |= FLAG_FRACTAL;
        }
        if p.distance_modulus > 0.0 {
            flags |= FLAG_MODULUS;
        }
        if p.checkerboard.is_active() {
            flags |= FLAG_CHECKER;
        }

        Self {
            width: job.width,
            height: job.height,
            tile_x: tile.x,
            tile_y: tile.y,
            tile_w: tile.w,
            tile_h: tile.h,
            curve_width: job.curve.width,
            metric: p.distance_metric.gpu_code(),
            flags,
            center_x: center.x as f32,
            center_y: center.y as f32,
            scale: job.scale as f32,
            curve_scaling: job.effective_curve_scaling() as f32,
            ang_frequency: p.angular.frequency as f32,
            ang_amplitude: p.angular.amplitude as f32,
            ang_offset: p.angular.offset_deg.to_radians() as f32,
            frac_scale1: p.fractal.scale1 as f32,
            frac_scale2: p.fractal.scale2 as f32,
            frac_scale3: p.fractal.scale3 as f32,
            frac_strength: p.fractal.strength as f32,
            modulus: p.distance_modulus as f32,
            checker_step: p.checkerboard.step_size as f32,
            _pad0: 0,
            _pad1: 0,
        }
    }
}

/// The coordinate kernel compiled for one noise expression.
pub struct GpuCoordinatePipeline {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    workgroup: Workgroup,
}

impl GpuCoordinatePipeline {
    pub fn new(ctx: &GpuContext, noise: &NoiseFn, workgroup: Workgroup) -> Result<Self, PipelineError> {
        let bind_group_layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("coordinate_bgl"),
                entries: &[
                    uniform_entry(0),
                    storage_entry(1, true),  // curve
                    storage_entry(2, false), // values
                    storage_entry(3, false), // indices
                ],
            });
        let source = shaders::coordinate_kernel(noise, workgroup);
        let pipeline = ctx.compile_compute("coordinate_kernel", &source, "cs_coordinate", &bind_group_layout)?;
        Ok(Self {
            pipeline,
            bind_group_layout,
            workgroup,
        })
    }

    /// Record one tile's dispatch into `encoder`.
    pub fn encode_tile(
        &self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        params: &wgpu::Buffer,
        curve: &wgpu::Buffer,
        values: &wgpu::Buffer,
        indices: &wgpu::Buffer,
        tile: Tile,
    ) {
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("coordinate_bg"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: curve.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: values.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: indices.as_entire_binding(),
                },
            ],
        });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("coordinate_pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        let (gx, gy, gz) = tile.workgroups(self.workgroup);
        pass.dispatch_workgroups(gx, gy, gz);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Checkerboard, Curve, DistanceMetric, DistortionProfile};

    #[test]
    fn params_block_is_uniform_sized() {
        // 24 words; uniform blocks must be a multiple of 16 bytes.
        assert_eq!(std::mem::size_of::<CoordinateParams>(), 96);
    }

    #[test]
    fn tiles_cover_image_exactly_once() {
        let t = tiles(300, 130, 128);
        assert_eq!(t.len(), 3 * 2);
        assert_eq!(t[2], Tile { x: 256, y: 0, w: 44, h: 128 });
        assert_eq!(t[5], Tile { x: 256, y: 128, w: 44, h: 2 });
        let covered: u64 = t.iter().map(|t| t.w as u64 * t.h as u64).sum();
        assert_eq!(covered, 300 * 130);
    }

    #[test]
    fn tile_workgroups_account_for_z_rows() {
        let tile = Tile { x: 0, y: 0, w: 128, h: 128 };
        assert_eq!(tile.workgroups(Workgroup::new(16, 16, 1)), (8, 8, 1));
        assert_eq!(tile.workgroups(Workgroup::new(8, 16, 2)), (16, 4, 1));
        assert_eq!(tile.workgroups(Workgroup::new(8, 8, 4)), (16, 4, 1));
    }

    #[test]
    fn params_reflect_profile() {
        let mut job = Job::new(10, 20, Curve::new(vec![1, 2, 3]), "x");
        job.distortion_profile = DistortionProfile::plain()
            .with_metric(DistanceMetric::Chebyshev)
            .with_modulus(4.0);
        job.distortion_profile.checkerboard = Checkerboard {
            enabled: true,
            step_size: 2.0,
        };
        job.curve.index_scaling = 2.0;
        let p = CoordinateParams::new(&job, Tile { x: 0, y: 0, w: 10, h: 20 });
        assert_eq!(p.metric, DistanceMetric::Chebyshev.gpu_code());
        assert_eq!(p.flags, FLAG_MODULUS | FLAG_CHECKER);
        assert_eq!((p.center_x, p.center_y), (5.0, 10.0));
        assert_eq!(p.curve_scaling, 2.0);
        assert_eq!(p.curve_width, 3);
    }
}
