// ============================================================================
// ORCHESTRATOR — job submission, backend selection, stage sequencing
// ============================================================================
//
// A job is validated and its expression compiled on the caller's thread, so
// `InvalidExpression` / `InvalidJob` come back from `submit` directly.  The
// work itself runs on the rayon pool and reports through a channel:
//
//   Progress { done, total } ... then exactly one of Completed / Failed
//
// GPU jobs own a `BufferArena` for their whole run; it is dropped (and every
// buffer destroyed) before the terminal event is sent.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::time::Instant;

use crate::config::{Backend, EngineConfig};
use crate::error::PipelineError;
use crate::gpu::caps::CapabilityStatus;
use crate::gpu::compositor::{CompositeParams, read_buffer};
use crate::gpu::compute::{self, CoordinateParams, DEGENERATE_BIT};
use crate::gpu::renderer::GpuSession;
use crate::model::{BackendUsed, Job, JobOutput, SortOrder, SortedPoint};
use crate::ops::expr::{self, NoiseFn};
use crate::ops::pipeline::{self, CPU_BAND_ROWS};
use crate::ops::sort::{self, SortedByDistance, padded_len};
use crate::ops::palette;
use crate::{log_err, log_info, log_warn};

/// Messages a running job sends to its [`JobHandle`].
#[derive(Debug)]
pub enum JobEvent {
    Progress { done: u32, total: u32 },
    Completed(Box<JobOutput>),
    Failed { message: String, error: PipelineError },
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobEvent::Progress { .. })
    }
}

/// Caller's side of a submitted job.
pub struct JobHandle {
    id: String,
    rx: Receiver<JobEvent>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next event, blocking.  `None` once the worker is gone.
    pub fn recv(&self) -> Option<JobEvent> {
        self.rx.recv().ok()
    }

    pub fn try_recv(&self) -> Option<JobEvent> {
        self.rx.try_recv().ok()
    }

    /// Block until the job ends, passing progress to `on_progress`.
    pub fn wait_with_progress(self, mut on_progress: impl FnMut(u32, u32)) -> Result<JobOutput, PipelineError> {
        while let Ok(event) = self.rx.recv() {
            match event {
                JobEvent::Progress { done, total } => on_progress(done, total),
                JobEvent::Completed(output) => return Ok(*output),
                JobEvent::Failed { error, .. } => return Err(error),
            }
        }
        Err(PipelineError::degraded(format!("job {} ended without a result", self.id)))
    }

    pub fn wait(self) -> Result<JobOutput, PipelineError> {
        self.wait_with_progress(|_, _| {})
    }
}

/// Everything a worker needs; cheap to clone into a task.
#[derive(Clone)]
struct Runner {
    config: EngineConfig,
    session: Option<Arc<GpuSession>>,
    status: CapabilityStatus,
}

/// Planes and extras produced by one backend.
struct Rendered {
    pixels: Vec<u8>,
    value_plane: Vec<u8>,
    index_plane: Vec<u32>,
    sorted: Option<Vec<SortedPoint>>,
    degenerate_count: u64,
    first_degenerate: Option<(f64, f64)>,
    backend: BackendUsed,
}

pub struct Orchestrator {
    runner: Runner,
}

impl Orchestrator {
    /// Build an orchestrator, bringing up a GPU session unless the config
    /// pins the CPU backend.  A missing GPU is not an error here; it shows
    /// up in [`Orchestrator::status`] and in jobs that require the GPU.
    pub fn new(config: EngineConfig) -> Self {
        let (session, status) = if config.backend == Backend::Cpu {
            (None, CapabilityStatus::unavailable("CPU backend selected"))
        } else {
            match GpuSession::init(&config) {
                Ok(session) => {
                    let status = session.status();
                    (Some(Arc::new(session)), status)
                }
                Err(e) => {
                    log_warn!("GPU unavailable: {}", e);
                    eprintln!("[GPU] unavailable: {}", e);
                    (None, CapabilityStatus::unavailable(e.to_string()))
                }
            }
        };
        Self {
            runner: Runner {
                config,
                session,
                status,
            },
        }
    }

    /// Use an existing session (several orchestrators may share one device).
    pub fn with_session(config: EngineConfig, session: Arc<GpuSession>) -> Self {
        let status = session.status();
        Self {
            runner: Runner {
                config,
                session: Some(session),
                status,
            },
        }
    }

    pub fn cpu_only() -> Self {
        Self::new(EngineConfig::cpu_only())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.runner.config
    }

    pub fn status(&self) -> CapabilityStatus {
        self.runner.status.clone()
    }

    pub fn session(&self) -> Option<&Arc<GpuSession>> {
        self.runner.session.as_ref()
    }

    /// Validate `job` and compile its expression.
    pub fn prepare(&self, job: &Job) -> Result<NoiseFn, PipelineError> {
        job.validate()?;
        expr::compile(&job.expression)
    }

    /// Queue `job` on the worker pool.  Fails synchronously when the job or
    /// its expression is invalid.
    pub fn submit(&self, job: Job) -> Result<JobHandle, PipelineError> {
        let noise = self.prepare(&job).inspect_err(|e| {
            log_err!("Job {} rejected: {}", job.id, e);
        })?;
        let (tx, rx) = mpsc::channel();
        let id = job.id.clone();
        let runner = self.runner.clone();

        rayon::spawn(move || {
            let progress_tx = tx.clone();
            let result = catch_unwind(AssertUnwindSafe(|| {
                runner.execute(&job, &noise, &mut |done, total| {
                    let _ = progress_tx.send(JobEvent::Progress { done, total });
                })
            }))
            .unwrap_or_else(|payload| {
                let msg = panic_message(payload.as_ref());
                log_err!("Job {} worker panicked: {}", job.id, msg);
                Err(PipelineError::degraded(format!("job worker panicked: {}", msg)))
            });

            let event = match result {
                Ok(output) => JobEvent::Completed(Box::new(output)),
                Err(error) => JobEvent::Failed {
                    message: error.to_string(),
                    error,
                },
            };
            let _ = tx.send(event);
        });

        Ok(JobHandle { id, rx })
    }

    /// Run `job` on the calling thread.
    pub fn run(&self, job: &Job, mut on_progress: impl FnMut(u32, u32)) -> Result<JobOutput, PipelineError> {
        let noise = self.prepare(job)?;
        self.runner.execute(job, &noise, &mut on_progress)
    }

    /// Order `points` by distance from `center`, on the GPU when allowed.
    pub fn sort_by_distance(
        &self,
        points: &[(f64, f64)],
        center: (f64, f64),
        order: SortOrder,
    ) -> Result<SortedByDistance, PipelineError> {
        match self.runner.gpu()? {
            Some(session) => session.sort_by_distance(points, center, order),
            None => Ok(sort::sort_by_distance(points, center, order)),
        }
    }

    /// Release the GPU session if this orchestrator holds the last reference.
    pub fn teardown(self) {
        if let Some(session) = self.runner.session
            && let Ok(session) = Arc::try_unwrap(session)
        {
            session.teardown();
        }
    }
}

impl Runner {
    /// The session jobs should use, per the configured backend.
    fn gpu(&self) -> Result<Option<&GpuSession>, PipelineError> {
        let session = self.session.as_deref();
        match self.config.backend {
            Backend::Cpu => Ok(None),
            Backend::Auto => Ok(session.filter(|s| s.usable())),
            Backend::Gpu => match session {
                Some(s) if s.usable() => Ok(Some(s)),
                Some(_) => Err(PipelineError::degraded(
                    self.status.detail.clone().unwrap_or_else(|| "self-test failed".into()),
                )),
                None => Err(PipelineError::CapabilityUnavailable(
                    self.status.detail.clone().unwrap_or_else(|| "no GPU session".into()),
                )),
            },
        }
    }

    fn execute(
        &self,
        job: &Job,
        noise: &NoiseFn,
        progress: &mut dyn FnMut(u32, u32),
    ) -> Result<JobOutput, PipelineError> {
        let start = Instant::now();
        log_info!(
            "Job {} started: {}x{}, expression {:?}",
            job.id,
            job.width,
            job.height,
            noise.source()
        );

        let rendered = match self.gpu()? {
            Some(session) => {
                let mut track = ProgressTrack::new(progress);
                let attempt = run_gpu(session, job, noise, &mut |d, t| track.report(d, t));
                match attempt {
                    Err(e @ PipelineError::CapabilityUnavailable(_)) if self.config.backend == Backend::Auto => {
                        log_warn!("Job {}: GPU path failed ({}), rerunning on CPU", job.id, e);
                        track.restart();
                        run_cpu(job, noise, &mut |d, t| track.report(d, t))
                    }
                    other => other,
                }
            }
            None => run_cpu(job, noise, progress),
        }
        .inspect_err(|e| log_err!("Job {} failed: {}", job.id, e))?;

        if rendered.degenerate_count > 0 {
            let (x, y) = rendered.first_degenerate.unwrap_or((f64::NAN, f64::NAN));
            log_warn!(
                "Job {}: {} non-finite noise values replaced by curve index 0 (first at ({}, {}))",
                job.id,
                rendered.degenerate_count,
                x,
                y
            );
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        log_info!("Job {} finished on {:?} in {} ms", job.id, rendered.backend, elapsed_ms);

        Ok(JobOutput {
            job_id: job.id.clone(),
            width: job.width,
            height: job.height,
            pixels: rendered.pixels,
            value_plane: rendered.value_plane,
            index_plane: rendered.index_plane,
            sorted: rendered.sorted,
            degenerate_count: rendered.degenerate_count,
            backend: rendered.backend,
            elapsed_ms,
        })
    }
}

/// Forwards progress so `done` never goes backwards when a GPU attempt is
/// abandoned and the job reruns on the CPU: the rerun's steps continue from
/// the last step already reported, and `total` grows to cover them.
struct ProgressTrack<'a> {
    sink: &'a mut dyn FnMut(u32, u32),
    offset: u32,
    last: u32,
}

impl<'a> ProgressTrack<'a> {
    fn new(sink: &'a mut dyn FnMut(u32, u32)) -> Self {
        Self { sink, offset: 0, last: 0 }
    }

    fn report(&mut self, done: u32, total: u32) {
        self.last = self.offset + done;
        (self.sink)(self.last, self.offset + total);
    }

    fn restart(&mut self) {
        self.offset = self.last;
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Attach pixel coordinates and values to a sorted index list.
fn sorted_points(job: &Job, sorted: &SortedByDistance, values: &[u8]) -> Vec<SortedPoint> {
    sorted
        .indices
        .iter()
        .zip(&sorted.distances)
        .map(|(&i, &distance)| {
            let (x, y) = job.coordinate(i % job.width, i / job.width);
            SortedPoint {
                pixel_index: i,
                x,
                y,
                distance,
                value: values[i as usize],
            }
        })
        .collect()
}

fn pixel_coordinates(job: &Job) -> impl Iterator<Item = (f64, f64)> + '_ {
    (0..job.height).flat_map(move |py| (0..job.width).map(move |px| job.coordinate(px, py)))
}

// ============================================================================
// CPU path
// ============================================================================

fn run_cpu(job: &Job, noise: &NoiseFn, progress: &mut dyn FnMut(u32, u32)) -> Result<Rendered, PipelineError> {
    let bands = job.height.div_ceil(CPU_BAND_ROWS);
    let total = bands + 1 + job.sort.is_some() as u32;

    let planes = pipeline::render_planes(job, noise, |done, _| progress(done, total));
    let pixels = palette::composite(&planes.values, job.palette().entries());
    progress(bands + 1, total);

    let sorted = job.sort.map(|order| {
        let points: Vec<(f64, f64)> = pixel_coordinates(job).collect();
        let s = sort::sort_by_distance(&points, (0.0, 0.0), order);
        progress(total, total);
        sorted_points(job, &s, &planes.values)
    });

    Ok(Rendered {
        pixels,
        value_plane: planes.values,
        index_plane: planes.indices,
        sorted,
        degenerate_count: planes.degenerate_count,
        first_degenerate: planes.first_degenerate,
        backend: BackendUsed::Cpu,
    })
}

// ============================================================================
// GPU path
// ============================================================================

fn run_gpu(
    session: &GpuSession,
    job: &Job,
    noise: &NoiseFn,
    progress: &mut dyn FnMut(u32, u32),
) -> Result<Rendered, PipelineError> {
    let ctx = &session.ctx;
    let device = &ctx.device;
    let profile = session.profile();
    let watchdog = session.watchdog();
    let count = job.pixel_count();
    let plane_bytes = count as u64 * 4;

    let mut arena = session.arena(format!("job {}", job.id));

    // Refuse oversize jobs before allocating anything.
    arena.check_binding("value plane", plane_bytes)?;
    if job.sort.is_some() {
        arena.check_binding("sort points", count as u64 * 8)?;
        arena.check_binding("sort keys", padded_len(count) as u64 * 4)?;
    }

    let kernel = session.coordinate_pipeline(noise)?;

    let curve_words: Vec<u32> = job.curve.data.iter().map(|&v| v as u32).collect();
    let curve = arena.storage_init(device, "curve", bytemuck::cast_slice(&curve_words))?;
    let palette_buf = arena.storage_init(device, "palette", bytemuck::cast_slice(&job.palette().packed()))?;
    let values = arena.storage(device, "values", plane_bytes, true)?;
    let indices = arena.storage(device, "indices", plane_bytes, true)?;
    let pixels = arena.storage(device, "pixels", plane_bytes, true)?;

    // Stage 1: coordinate kernel, tile by tile, a few tiles per submission.
    let tiles = compute::tiles(job.width, job.height, profile.tile_pixels);
    let total = tiles.len() as u32 + 1 + job.sort.is_some() as u32;
    let mut done = 0u32;
    for batch in tiles.chunks(profile.per_frame_budget.max(1) as usize) {
        let mut frame = session.arena("frame");
        let mut params = Vec::with_capacity(batch.len());
        for &tile in batch {
            let p = CoordinateParams::new(job, tile);
            params.push(frame.uniform(device, "coordinate_params", bytemuck::bytes_of(&p))?);
        }

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("coordinate_encoder"),
        });
        for (&tile, &p) in batch.iter().zip(&params) {
            kernel.encode_tile(
                device,
                &mut encoder,
                frame.get(p),
                arena.get(curve),
                arena.get(values),
                arena.get(indices),
                tile,
            );
        }
        ctx.submit_one(encoder);
        ctx.wait_idle(watchdog)?;

        done += batch.len() as u32;
        progress(done, total);
    }

    // Stage 2: palette composite straight from the value buffer.
    let composite_params = CompositeParams {
        count: count as u32,
        _pad: [0; 3],
    };
    let cparams = arena.uniform(device, "composite_params", bytemuck::bytes_of(&composite_params))?;
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("composite_encoder"),
    });
    session.composite().encode(
        device,
        &mut encoder,
        arena.get(cparams),
        arena.get(palette_buf),
        arena.get(values),
        arena.get(pixels),
        count as u32,
    );
    ctx.submit_one(encoder);
    ctx.wait_idle(watchdog)?;
    done += 1;
    progress(done, total);

    let raw_values: Vec<u32> = read_buffer(ctx, &mut arena, values, count, watchdog)?;
    let index_plane: Vec<u32> = read_buffer(ctx, &mut arena, indices, count, watchdog)?;
    let packed: Vec<u32> = read_buffer(ctx, &mut arena, pixels, count, watchdog)?;

    let mut degenerate_count = 0u64;
    let mut first_degenerate = None;
    let value_plane: Vec<u8> = raw_values
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            if v & DEGENERATE_BIT != 0 {
                degenerate_count += 1;
                first_degenerate.get_or_insert_with(|| {
                    let i = i as u32;
                    job.coordinate(i % job.width, i / job.width)
                });
            }
            (v & 0xFF) as u8
        })
        .collect();

    // Stage 3: optional distance sort, reusing the job arena.
    let sorted = match job.sort {
        Some(order) => {
            let points: Vec<[f32; 2]> = pixel_coordinates(job).map(|(x, y)| [x as f32, y as f32]).collect();
            let s = session.sort_points_in(&mut arena, &points, [0.0, 0.0], order)?;
            progress(total, total);
            Some(sorted_points(job, &s, &value_plane))
        }
        None => None,
    };

    log_info!(
        "Job {}: released {} GPU buffers ({} bytes)",
        job.id,
        arena.len(),
        arena.live_bytes()
    );
    drop(arena);

    Ok(Rendered {
        pixels: palette::unpack_pixels(&packed),
        value_plane,
        index_plane,
        sorted,
        degenerate_count,
        first_degenerate,
        backend: BackendUsed::Gpu,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Curve, DistortionProfile, Point, Rgba};

    fn ramp_job(width: u32, height: u32, expression: &str) -> Job {
        let mut job = Job::new(width, height, Curve::new(vec![0, 32, 64, 96, 128, 160, 192, 224]), expression);
        job.distortion_profile = DistortionProfile::plain();
        job
    }

    #[test]
    fn invalid_expression_is_rejected_before_running() {
        let orch = Orchestrator::cpu_only();
        let err = orch.submit(ramp_job(4, 4, "window.x")).err().unwrap();
        assert!(matches!(err, PipelineError::InvalidExpression { .. }));
    }

    #[test]
    fn invalid_job_is_rejected_before_running() {
        let orch = Orchestrator::cpu_only();
        let mut job = ramp_job(4, 4, "x");
        job.curve.data.pop();
        assert!(matches!(orch.submit(job), Err(PipelineError::InvalidJob(_))));
    }

    #[test]
    fn submitted_job_reports_progress_then_completes() {
        let orch = Orchestrator::cpu_only();
        let job = ramp_job(16, 200, "sqrt(x*x+y*y)");
        let handle = orch.submit(job).unwrap();

        let mut events = Vec::new();
        while let Some(event) = handle.recv() {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        // 200 rows → 4 bands, plus the composite step.
        let progress: Vec<(u32, u32)> = events
            .iter()
            .filter_map(|e| match e {
                JobEvent::Progress { done, total } => Some((*done, *total)),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![(1, 5), (2, 5), (3, 5), (4, 5), (5, 5)]);
        match events.last() {
            Some(JobEvent::Completed(out)) => {
                assert_eq!(out.pixels.len(), 16 * 200 * 4);
                assert_eq!(out.backend, BackendUsed::Cpu);
            }
            other => panic!("unexpected terminal event {:?}", other),
        }
        // Nothing after the terminal event.
        assert!(handle.recv().is_none());
    }

    #[test]
    fn scenario_pixel_through_the_whole_job() {
        // Center at pixel (0, 0): pixel (3, 4) is coordinate (3, 4) → value 160.
        let mut job = ramp_job(8, 8, "sqrt(x*x+y*y)");
        job.center = Some(Point { x: 0.0, y: 0.0 });
        job.palette = Some(vec![Rgba::rgb(255, 0, 0), Rgba::rgb(0, 255, 0), Rgba::rgb(0, 0, 255)]);
        let out = Orchestrator::cpu_only().run(&job, |_, _| {}).unwrap();
        let i = 4 * 8 + 3;
        assert_eq!(out.value_plane[i], 160);
        assert_eq!(out.index_plane[i], 5);
        // 160 is past the 3-entry palette: clamps to blue.
        assert_eq!(&out.pixels[i * 4..i * 4 + 4], &[0, 0, 255, 255]);
    }

    #[test]
    fn sorted_output_is_ordered_from_center() {
        let mut job = ramp_job(5, 5, "sqrt(x*x+y*y)");
        job.sort = Some(SortOrder::Ascending);
        let out = Orchestrator::cpu_only().run(&job, |_, _| {}).unwrap();
        let sorted = out.sorted.unwrap();
        assert_eq!(sorted.len(), 25);
        assert!(sorted.windows(2).all(|w| w[0].distance <= w[1].distance));
        // Default center (2.5, 2.5): the four nearest pixels sit at distance √0.5.
        assert!((sorted[0].distance - 0.5f64.sqrt()).abs() < 1e-12);
        let first = sorted[0];
        assert_eq!(out.value_plane[first.pixel_index as usize], first.value);
    }

    #[test]
    fn degenerate_pixels_do_not_fail_the_job() {
        let mut job = ramp_job(3, 3, "1 / x");
        job.center = Some(Point { x: 1.0, y: 1.0 });
        let out = Orchestrator::cpu_only().run(&job, |_, _| {}).unwrap();
        assert_eq!(out.degenerate_count, 3);
        assert_eq!(out.index_plane[1], 0);
    }

    #[test]
    fn gpu_backend_without_session_is_unavailable() {
        let orch = Orchestrator {
            runner: Runner {
                config: EngineConfig {
                    backend: Backend::Gpu,
                    ..EngineConfig::default()
                },
                session: None,
                status: CapabilityStatus::unavailable("no adapter"),
            },
        };
        let handle = orch.submit(ramp_job(2, 2, "x")).unwrap();
        match handle.wait() {
            Err(PipelineError::CapabilityUnavailable(msg)) => assert!(msg.contains("no adapter")),
            other => panic!("expected CapabilityUnavailable, got {:?}", other.map(|o| o.job_id)),
        }
    }

    #[test]
    fn progress_stays_monotonic_across_a_cpu_rerun() {
        let mut seen = Vec::new();
        let mut sink = |done: u32, total: u32| seen.push((done, total));
        let mut track = ProgressTrack::new(&mut sink);
        // GPU gets through 3 of 7 tiles, then the device stops answering.
        for done in 1..=3 {
            track.report(done, 7);
        }
        track.restart();
        for done in 1..=5 {
            track.report(done, 5);
        }
        drop(track);
        assert_eq!(
            seen,
            vec![(1, 7), (2, 7), (3, 7), (4, 8), (5, 8), (6, 8), (7, 8), (8, 8)]
        );
        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
        assert!(seen.iter().all(|&(done, total)| done <= total));
    }

    #[test]
    fn cpu_sort_by_distance_without_gpu() {
        let orch = Orchestrator::cpu_only();
        let out = orch
            .sort_by_distance(&[(3.0, 4.0), (0.0, 1.0)], (0.0, 0.0), SortOrder::Descending)
            .unwrap();
        assert_eq!(out.indices, vec![0, 1]);
        assert_eq!(out.distances, vec![5.0, 1.0]);
    }
}
