// ============================================================================
// GPU DISTANCE SORT — bitonic network over (distance, index) pairs
// ============================================================================
//
// Same schedule as ops::sort, one compute pass per step.  Each step has its
// own uniform buffer so the whole network goes into a single submission.

use std::time::Duration;

use bytemuck::{Pod, Zeroable};

use super::context::GpuContext;
use super::pool::BufferArena;
use super::{linear_dispatch, shaders, storage_entry, uniform_entry};
use crate::error::PipelineError;
use crate::model::SortOrder;
use crate::ops::sort::{SortedByDistance, padded_len, schedule};

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct SortParams {
    pub padded: u32,
    pub n: u32,
    pub stage_size: u32,
    pub step_size: u32,
    pub descending: u32,
    pub center_x: f32,
    pub center_y: f32,
    pub _pad0: u32,
}

pub struct GpuSortPipeline {
    seed: wgpu::ComputePipeline,
    step: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    workgroup: u32,
    max_groups: u32,
}

impl GpuSortPipeline {
    pub fn new(ctx: &GpuContext, workgroup: u32) -> Result<Self, PipelineError> {
        let bind_group_layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("bitonic_bgl"),
                entries: &[
                    uniform_entry(0),
                    storage_entry(1, true),  // points
                    storage_entry(2, false), // keys
                    storage_entry(3, false), // tags
                ],
            });
        let source = shaders::linear_kernel(shaders::BITONIC_SHADER, workgroup);
        let seed = ctx.compile_compute("bitonic_seed", &source, "cs_seed", &bind_group_layout)?;
        let step = ctx.compile_compute("bitonic_step", &source, "cs_bitonic_step", &bind_group_layout)?;
        Ok(Self {
            seed,
            step,
            bind_group_layout,
            workgroup,
            max_groups: ctx.limits.max_compute_workgroups_per_dimension,
        })
    }

    /// Sort `points` by distance from `center`.  Buffers are taken from
    /// `arena`, so the caller decides when they are released.
    pub fn sort_points(
        &self,
        ctx: &GpuContext,
        arena: &mut BufferArena,
        points: &[[f32; 2]],
        center: [f32; 2],
        order: SortOrder,
        watchdog: Duration,
    ) -> Result<SortedByDistance, PipelineError> {
        let n = points.len();
        if n == 0 {
            return Ok(SortedByDistance::default());
        }
        let padded = padded_len(n);
        if padded > u32::MAX as usize {
            return Err(PipelineError::ResourceExhausted(format!("{} points cannot be sorted", n)));
        }
        let device = &ctx.device;

        let points_buf = arena.storage_init(device, "sort_points", bytemuck::cast_slice(points))?;
        let keys = arena.storage(device, "sort_keys", padded as u64 * 4, true)?;
        let tags = arena.storage(device, "sort_tags", padded as u64 * 4, true)?;

        let base = SortParams {
            padded: padded as u32,
            n: n as u32,
            stage_size: 0,
            step_size: 0,
            descending: (order == SortOrder::Descending) as u32,
            center_x: center[0],
            center_y: center[1],
            _pad0: 0,
        };

        // Seed pass followed by one pass per (stage, step).
        let mut passes = vec![(&self.seed, base)];
        for (stage_size, step_size) in schedule(padded) {
            passes.push((
                &self.step,
                SortParams {
                    stage_size,
                    step_size,
                    ..base
                },
            ));
        }

        let mut param_bufs = Vec::with_capacity(passes.len());
        for (_, params) in &passes {
            param_bufs.push(arena.uniform(device, "sort_params", bytemuck::bytes_of(params))?);
        }

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("bitonic_encoder"),
        });
        let (gx, gy) = linear_dispatch(padded as u32, self.workgroup, self.max_groups);
        for ((pipeline, _), params) in passes.iter().zip(&param_bufs) {
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("bitonic_bg"),
                layout: &self.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: arena.get(*params).as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: arena.get(points_buf).as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: arena.get(keys).as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: arena.get(tags).as_entire_binding(),
                    },
                ],
            });
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("bitonic_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(gx, gy, 1);
        }
        ctx.submit_one(encoder);
        ctx.wait_idle(watchdog)?;

        let distances: Vec<f32> = super::compositor::read_buffer(ctx, arena, keys, n, watchdog)?;
        let indices: Vec<u32> = super::compositor::read_buffer(ctx, arena, tags, n, watchdog)?;
        Ok(SortedByDistance {
            distances: distances.into_iter().map(f64::from).collect(),
            indices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_block_is_thirty_two_bytes() {
        assert_eq!(std::mem::size_of::<SortParams>(), 32);
    }
}
