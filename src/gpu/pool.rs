// ============================================================================
// BUFFER ARENA — every GPU buffer a job touches, released as one unit
// ============================================================================

use wgpu::util::DeviceExt;

use super::caps::DeviceLimits;
use super::context::ErrorScopes;
use crate::error::PipelineError;
use crate::log_err;

/// Handle to a buffer owned by a [`BufferArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufId(usize);

/// Owns the buffers of one job (or one frame of one job).
///
/// Buffers are only ever added; dropping the arena destroys all of them, so
/// an early `?` return releases a partially built buffer set too.
/// Allocation failures are caught through the device's shared [`ErrorScopes`].
pub struct BufferArena {
    label: String,
    limits: DeviceLimits,
    scopes: ErrorScopes,
    buffers: Vec<wgpu::Buffer>,
    bytes: u64,
}

impl BufferArena {
    pub fn new(label: impl Into<String>, limits: DeviceLimits, scopes: ErrorScopes) -> Self {
        Self {
            label: label.into(),
            limits,
            scopes,
            buffers: Vec::new(),
            bytes: 0,
        }
    }

    pub fn get(&self, id: BufId) -> &wgpu::Buffer {
        &self.buffers[id.0]
    }

    /// Number of live buffers.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Bytes held by live buffers.
    pub fn live_bytes(&self) -> u64 {
        self.bytes
    }

    /// Zeroed storage buffer.  `readable` adds COPY_SRC for readback.
    pub fn storage(
        &mut self,
        device: &wgpu::Device,
        label: &str,
        size: u64,
        readable: bool,
    ) -> Result<BufId, PipelineError> {
        let mut usage = wgpu::BufferUsages::STORAGE;
        if readable {
            usage |= wgpu::BufferUsages::COPY_SRC;
        }
        self.check_binding(label, size)?;
        self.create(device, label, size, usage)
    }

    /// Storage buffer initialised from `contents`.
    pub fn storage_init(
        &mut self,
        device: &wgpu::Device,
        label: &str,
        contents: &[u8],
    ) -> Result<BufId, PipelineError> {
        self.check_binding(label, contents.len() as u64)?;
        self.create_init(device, label, contents, wgpu::BufferUsages::STORAGE)
    }

    pub fn uniform(&mut self, device: &wgpu::Device, label: &str, contents: &[u8]) -> Result<BufId, PipelineError> {
        self.create_init(device, label, contents, wgpu::BufferUsages::UNIFORM)
    }

    /// Host-mappable staging buffer for readback.
    pub fn staging(&mut self, device: &wgpu::Device, label: &str, size: u64) -> Result<BufId, PipelineError> {
        self.create(
            device,
            label,
            size,
            wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        )
    }

    /// Refuse sizes the device cannot bind before asking the driver.
    pub fn check_binding(&self, label: &str, size: u64) -> Result<(), PipelineError> {
        let max = self.limits.max_storage_buffer_binding_size.min(self.limits.max_buffer_size);
        if size > max {
            return Err(PipelineError::ResourceExhausted(format!(
                "{}: {} bytes exceeds the device binding limit of {} bytes",
                label, size, max
            )));
        }
        Ok(())
    }

    fn check_size(&self, label: &str, size: u64) -> Result<(), PipelineError> {
        if size > self.limits.max_buffer_size {
            return Err(PipelineError::ResourceExhausted(format!(
                "{}: {} bytes exceeds the device buffer limit of {} bytes",
                label, size, self.limits.max_buffer_size
            )));
        }
        Ok(())
    }

    fn create(
        &mut self,
        device: &wgpu::Device,
        label: &str,
        size: u64,
        usage: wgpu::BufferUsages,
    ) -> Result<BufId, PipelineError> {
        // Zero-sized bindings are invalid; keep one word.
        let size = size.max(4);
        self.check_size(label, size)?;
        let (buffer, error) = self.scopes.capture(device, wgpu::ErrorFilter::OutOfMemory, || {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage,
                mapped_at_creation: false,
            })
        });
        self.finish(label, buffer, size, error)
    }

    fn create_init(
        &mut self,
        device: &wgpu::Device,
        label: &str,
        contents: &[u8],
        usage: wgpu::BufferUsages,
    ) -> Result<BufId, PipelineError> {
        self.check_size(label, contents.len() as u64)?;
        let (buffer, error) = self.scopes.capture(device, wgpu::ErrorFilter::OutOfMemory, || {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage,
            })
        });
        self.finish(label, buffer, contents.len() as u64, error)
    }

    fn finish(
        &mut self,
        label: &str,
        buffer: wgpu::Buffer,
        size: u64,
        error: Option<wgpu::Error>,
    ) -> Result<BufId, PipelineError> {
        if let Some(e) = error {
            buffer.destroy();
            log_err!("[{}] allocation of {} ({} bytes) failed: {}", self.label, label, size, e);
            return Err(PipelineError::ResourceExhausted(format!(
                "{}: could not allocate {} bytes: {}",
                label, size, e
            )));
        }
        self.buffers.push(buffer);
        self.bytes += size;
        Ok(BufId(self.buffers.len() - 1))
    }

    /// Destroy every buffer now.  Also runs on drop.
    pub fn release(&mut self) {
        for buffer in self.buffers.drain(..) {
            buffer.destroy();
        }
        self.bytes = 0;
    }
}

impl Drop for BufferArena {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_limits() -> DeviceLimits {
        DeviceLimits {
            max_workgroup_size_x: 256,
            max_workgroup_size_y: 256,
            max_workgroup_size_z: 64,
            max_invocations_per_workgroup: 256,
            max_workgroups_per_dimension: 65535,
            max_storage_buffer_binding_size: 1024,
            max_buffer_size: 4096,
        }
    }

    #[test]
    fn binding_limit_is_checked_before_allocation() {
        let arena = BufferArena::new("t", small_limits(), ErrorScopes::default());
        assert!(arena.check_binding("ok", 1024).is_ok());
        assert!(matches!(
            arena.check_binding("values", 1028),
            Err(PipelineError::ResourceExhausted(msg)) if msg.starts_with("values")
        ));
        assert!(arena.is_empty());
        assert_eq!(arena.live_bytes(), 0);
    }

    #[test]
    fn buffer_limit_applies_to_every_kind() {
        let arena = BufferArena::new("t", small_limits(), ErrorScopes::default());
        assert!(arena.check_size("staging", 4096).is_ok());
        assert!(arena.check_size("staging", 4097).is_err());
    }
}
