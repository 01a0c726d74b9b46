// ============================================================================
// GPU CONTEXT — wgpu Device, Queue, and adapter initialization
// ============================================================================

use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::PipelineError;
use crate::{log_err, log_info};

/// Serialises wgpu error scopes on one device.
///
/// The scope stack belongs to the device, not the thread, so two jobs that
/// push and pop concurrently would pop each other's scopes.  Every
/// push/create/pop sequence on a shared device goes through [`ErrorScopes::capture`].
#[derive(Clone, Default)]
pub struct ErrorScopes(Arc<Mutex<()>>);

impl ErrorScopes {
    /// Run `f` inside a `filter` scope; returns its value and the error the
    /// scope caught, if any.
    pub fn capture<T>(
        &self,
        device: &wgpu::Device,
        filter: wgpu::ErrorFilter,
        f: impl FnOnce() -> T,
    ) -> (T, Option<wgpu::Error>) {
        let _guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        device.push_error_scope(filter);
        let value = f();
        let error = pollster::block_on(device.pop_error_scope());
        (value, error)
    }
}

/// Core wgpu handles for one device session.  Passed explicitly to every
/// GPU component; nothing here is global.
pub struct GpuContext {
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    pub adapter_name: String,
    /// Backend in use (Vulkan, Metal, Dx12, Gl, ...).
    pub backend: String,
    /// Limits the device was created with.
    pub limits: wgpu::Limits,
    scopes: ErrorScopes,
}

impl GpuContext {
    /// Attempt to create a GPU context.  Tries hardware first, then falls
    /// back to a software adapter (`force_fallback_adapter`).
    pub fn new(preferred_gpu: &str) -> Result<Self, PipelineError> {
        // 1. Try hardware adapter.
        if let Some(ctx) = pollster::block_on(Self::new_async(preferred_gpu, false)) {
            return Ok(ctx);
        }
        // 2. Fallback: software adapter.
        eprintln!("[GPU] Hardware adapter unavailable, trying software fallback");
        pollster::block_on(Self::new_async(preferred_gpu, true)).ok_or_else(|| {
            PipelineError::CapabilityUnavailable("no compute adapter available".into())
        })
    }

    async fn new_async(preferred_gpu: &str, force_fallback: bool) -> Option<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let power = match preferred_gpu.to_lowercase().as_str() {
            "low power" | "integrated" => wgpu::PowerPreference::LowPower,
            _ => wgpu::PowerPreference::HighPerformance,
        };

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: power,
                compatible_surface: None, // headless, compute only
                force_fallback_adapter: force_fallback,
            })
            .await?;

        let info = adapter.get_info();
        let limits = adapter.limits();

        // Ask for the adapter's own compute limits; the negotiator decides
        // what to actually use.
        let required_limits = wgpu::Limits {
            max_storage_buffer_binding_size: limits.max_storage_buffer_binding_size,
            max_buffer_size: limits.max_buffer_size,
            max_compute_workgroup_size_x: limits.max_compute_workgroup_size_x,
            max_compute_workgroup_size_y: limits.max_compute_workgroup_size_y,
            max_compute_workgroup_size_z: limits.max_compute_workgroup_size_z,
            max_compute_invocations_per_workgroup: limits.max_compute_invocations_per_workgroup,
            max_compute_workgroups_per_dimension: limits.max_compute_workgroups_per_dimension,
            max_compute_workgroup_storage_size: limits.max_compute_workgroup_storage_size,
            ..wgpu::Limits::downlevel_defaults()
        };

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("curveforge device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: required_limits.clone(),
                },
                None,
            )
            .await
            .ok()?;

        // Validation errors outside an error scope would otherwise panic.
        device.on_uncaptured_error(Box::new(|e| {
            log_err!("Uncaptured wgpu error: {}", e);
            eprintln!("[GPU] uncaptured error: {}", e);
        }));

        log_info!(
            "Adapter: {} ({:?}, {:?}){}",
            info.name,
            info.backend,
            info.device_type,
            if force_fallback { " [software fallback]" } else { "" }
        );
        log_info!(
            "Limits: workgroup {}x{}x{} / {} invocations, storage binding {} B, buffer {} B",
            required_limits.max_compute_workgroup_size_x,
            required_limits.max_compute_workgroup_size_y,
            required_limits.max_compute_workgroup_size_z,
            required_limits.max_compute_invocations_per_workgroup,
            required_limits.max_storage_buffer_binding_size,
            required_limits.max_buffer_size
        );

        Some(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            adapter_name: info.name.clone(),
            backend: format!("{:?}", info.backend),
            limits: required_limits,
            scopes: ErrorScopes::default(),
        })
    }

    /// Compile a compute kernel inside a validation error scope so a bad
    /// kernel becomes an error instead of a panic.
    pub fn compile_compute(
        &self,
        label: &str,
        source: &str,
        entry_point: &str,
        bind_group_layout: &wgpu::BindGroupLayout,
    ) -> Result<wgpu::ComputePipeline, PipelineError> {
        let device = &self.device;
        let (pipeline, error) = self.scopes.capture(device, wgpu::ErrorFilter::Validation, || {
            let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
            let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &[bind_group_layout],
                push_constant_ranges: &[],
            });
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&layout),
                module: &shader,
                entry_point,
                compilation_options: Default::default(),
            })
        });

        match error {
            None => Ok(pipeline),
            Some(e) => {
                log_err!("Kernel '{}' rejected: {}", label, e);
                Err(PipelineError::CapabilityUnavailable(format!(
                    "kernel '{}' rejected by device: {}",
                    label, e
                )))
            }
        }
    }

    /// Error-scope guard shared by everything allocating on this device.
    pub fn error_scopes(&self) -> ErrorScopes {
        self.scopes.clone()
    }

    /// Submit a single encoder's commands.
    pub fn submit_one(&self, encoder: wgpu::CommandEncoder) {
        self.queue.submit(std::iter::once(encoder.finish()));
    }

    /// Block until everything submitted so far has finished, or the
    /// watchdog expires.
    pub fn wait_idle(&self, watchdog: Duration) -> Result<(), PipelineError> {
        let (tx, rx) = mpsc::channel();
        self.queue.on_submitted_work_done(move || {
            let _ = tx.send(());
        });
        self.wait_for(&rx, watchdog, "queue completion")
    }

    /// Poll the device until `rx` yields.  An expired watchdog means the
    /// device stopped responding; a running dispatch cannot be cancelled, so
    /// the caller abandons the job instead.
    pub fn wait_for<T>(&self, rx: &Receiver<T>, watchdog: Duration, what: &str) -> Result<T, PipelineError> {
        let start = Instant::now();
        loop {
            let _ = self.device.poll(wgpu::Maintain::Poll);
            match rx.try_recv() {
                Ok(v) => return Ok(v),
                Err(TryRecvError::Disconnected) => {
                    return Err(PipelineError::degraded(format!("{} callback dropped", what)));
                }
                Err(TryRecvError::Empty) => {}
            }
            if start.elapsed() >= watchdog {
                log_err!("Watchdog expired after {} ms waiting for {}", watchdog.as_millis(), what);
                eprintln!("[GPU] watchdog expired waiting for {}", what);
                return Err(PipelineError::degraded(format!(
                    "{} did not finish within {} ms",
                    what,
                    watchdog.as_millis()
                )));
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    }
}
