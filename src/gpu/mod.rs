// ============================================================================
// GPU MODULE — wgpu compute backend for the pattern pipeline
// ============================================================================
//
// Architecture:
//   context.rs    — wgpu Device, Queue, adapter init, kernel compilation, waits
//   caps.rs       — capability negotiation, self-test, status report
//   shaders.rs    — all WGSL source (inline strings + templates)
//   pool.rs       — per-job buffer arena, destroyed as a unit
//   compute.rs    — coordinate kernel (one per compiled expression), tiling
//   compositor.rs — palette kernel and buffer readback
//   sort.rs       — bitonic distance sort
//   renderer.rs   — GpuSession: explicit init/teardown, owns the above
// ============================================================================

pub mod caps;
pub mod compositor;
pub mod compute;
pub mod context;
pub mod pool;
pub mod renderer;
pub mod shaders;
pub mod sort;

pub use caps::{CapabilityProfile, CapabilityStatus, DeviceLimits, Mode, Workgroup, negotiate};
pub use renderer::GpuSession;

/// Split `count` one-dimensional invocations into a 2-D grid of workgroups
/// that respects `max_per_dim`.  Kernels recover the flat index as
/// `gid.x + gid.y * num_workgroups.x * WG`.
pub fn linear_dispatch(count: u32, workgroup: u32, max_per_dim: u32) -> (u32, u32) {
    let groups = count.div_ceil(workgroup.max(1)).max(1);
    let x = groups.min(max_per_dim.max(1));
    (x, groups.div_ceil(x))
}

pub(crate) fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

pub(crate) fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_dispatch_covers_count() {
        assert_eq!(linear_dispatch(1, 256, 65535), (1, 1));
        assert_eq!(linear_dispatch(256, 256, 65535), (1, 1));
        assert_eq!(linear_dispatch(257, 256, 65535), (2, 1));
        // 2^26 elements at 256 per group needs 262144 groups: wraps into y.
        let (x, y) = linear_dispatch(1 << 26, 256, 65535);
        assert_eq!(x, 65535);
        assert!(x as u64 * y as u64 * 256 >= 1 << 26);
    }

    #[test]
    fn empty_dispatch_still_launches_one_group() {
        assert_eq!(linear_dispatch(0, 64, 65535), (1, 1));
    }
}
