// ============================================================================
// GPU COMPOSITOR — palette lookup on the value plane, and buffer readback
// ============================================================================

use std::sync::mpsc;
use std::time::Duration;

use bytemuck::{Pod, Zeroable};

use super::context::GpuContext;
use super::pool::{BufId, BufferArena};
use super::{linear_dispatch, shaders, storage_entry, uniform_entry};
use crate::error::PipelineError;
use crate::log_err;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct CompositeParams {
    pub count: u32,
    pub _pad: [u32; 3],
}

/// Maps the coordinate kernel's value buffer through a packed 256-entry
/// palette into one u32 per pixel.  Reads the value buffer in place, so no
/// host round trip sits between the two stages.
pub struct GpuCompositePipeline {
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    workgroup: u32,
    max_groups: u32,
}

impl GpuCompositePipeline {
    pub fn new(ctx: &GpuContext, workgroup: u32) -> Result<Self, PipelineError> {
        let bind_group_layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("composite_bgl"),
                entries: &[
                    uniform_entry(0),
                    storage_entry(1, true),  // palette
                    storage_entry(2, true),  // values
                    storage_entry(3, false), // pixels
                ],
            });
        let source = shaders::linear_kernel(shaders::COMPOSITE_SHADER, workgroup);
        let pipeline = ctx.compile_compute("composite_kernel", &source, "cs_composite", &bind_group_layout)?;
        Ok(Self {
            pipeline,
            bind_group_layout,
            workgroup,
            max_groups: ctx.limits.max_compute_workgroups_per_dimension,
        })
    }

    pub fn encode(
        &self,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        params: &wgpu::Buffer,
        palette: &wgpu::Buffer,
        values: &wgpu::Buffer,
        pixels: &wgpu::Buffer,
        count: u32,
    ) {
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("composite_bg"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: palette.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: values.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: pixels.as_entire_binding(),
                },
            ],
        });

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("composite_pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        let (gx, gy) = linear_dispatch(count, self.workgroup, self.max_groups);
        pass.dispatch_workgroups(gx, gy, 1);
    }
}

/// Copy the first `count` elements of `src` to a staging buffer and map it.
///
/// The staging buffer is allocated in `arena`, so it goes away with the job.
/// Waiting is watchdog-guarded: an unresponsive device yields
/// `CapabilityUnavailable` instead of blocking forever.
pub fn read_buffer<T: Pod>(
    ctx: &GpuContext,
    arena: &mut BufferArena,
    src: BufId,
    count: usize,
    watchdog: Duration,
) -> Result<Vec<T>, PipelineError> {
    let mut out = vec![T::zeroed(); count];
    if count == 0 {
        return Ok(out);
    }
    let size = std::mem::size_of_val(out.as_slice()) as u64;
    let staging = arena.staging(&ctx.device, "readback_staging", size)?;

    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("readback_encoder"),
        });
    encoder.copy_buffer_to_buffer(arena.get(src), 0, arena.get(staging), 0, size);
    ctx.submit_one(encoder);

    let slice = arena.get(staging).slice(..size);
    let (tx, rx) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    match ctx.wait_for(&rx, watchdog, "buffer readback")? {
        Ok(()) => {}
        Err(e) => {
            log_err!("Readback map error: {:?}", e);
            return Err(PipelineError::degraded(format!("buffer readback failed: {}", e)));
        }
    }

    {
        let mapped = slice.get_mapped_range();
        bytemuck::cast_slice_mut::<T, u8>(&mut out).copy_from_slice(&mapped);
    }
    arena.get(staging).unmap();
    Ok(out)
}
