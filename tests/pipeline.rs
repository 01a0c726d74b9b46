// End-to-end runs through the public API.  GPU cases skip themselves when
// no healthy adapter is present.

use std::sync::Arc;

use curveforge::gpu::GpuSession;
use curveforge::{
    Backend, BackendUsed, Curve, DistanceMetric, DistortionProfile, EngineConfig, Job, JobEvent,
    Orchestrator, PipelineError, Point, Rgba, SortOrder,
};

fn ramp() -> Curve {
    Curve::new(vec![0, 32, 64, 96, 128, 160, 192, 224])
}

fn origin_job(width: u32, height: u32, expression: &str) -> Job {
    let mut job = Job::new(width, height, ramp(), expression);
    job.center = Some(Point { x: 0.0, y: 0.0 });
    job
}

fn gpu_session() -> Option<Arc<GpuSession>> {
    let config = EngineConfig {
        backend: Backend::Gpu,
        ..EngineConfig::default()
    };
    match GpuSession::init(&config) {
        Ok(session) if session.usable() => Some(Arc::new(session)),
        Ok(_) => {
            eprintln!("skipping: GPU session is degraded");
            None
        }
        Err(e) => {
            eprintln!("skipping: {}", e);
            None
        }
    }
}

#[test]
fn radial_and_modulus_scenarios() {
    let orch = Orchestrator::cpu_only();

    let out = orch.run(&origin_job(8, 8, "sqrt(x*x+y*y)"), |_, _| {}).unwrap();
    let i = 4 * 8 + 3;
    assert_eq!((out.value_plane[i], out.index_plane[i]), (160, 5));

    let mut job = origin_job(8, 1, "sqrt(x*x+y*y)");
    job.distortion_profile = DistortionProfile::plain().with_modulus(4.0);
    let out = orch.run(&job, |_, _| {}).unwrap();
    assert_eq!((out.value_plane[5], out.index_plane[5]), (32, 1));
}

#[test]
fn short_palette_clamps_to_last_entry() {
    let mut job = origin_job(8, 8, "sqrt(x*x+y*y)");
    job.curve = Curve::new(vec![200; 4]);
    job.palette = Some(vec![Rgba::rgb(255, 0, 0), Rgba::rgb(0, 255, 0), Rgba::rgb(0, 0, 255)]);
    let out = Orchestrator::cpu_only().run(&job, |_, _| {}).unwrap();
    assert!(out.pixels.chunks_exact(4).all(|p| p == [0, 0, 255, 255]));
}

#[test]
fn sandbox_rejects_host_access() {
    let orch = Orchestrator::cpu_only();
    for source in ["document.cookie", "eval('x')", "x; y", "fetch(x)"] {
        let err = orch.submit(origin_job(2, 2, source)).err();
        assert!(
            matches!(err, Some(PipelineError::InvalidExpression { .. })),
            "{} was accepted",
            source
        );
    }
}

#[test]
fn concurrent_jobs_each_end_exactly_once() {
    let orch = Orchestrator::cpu_only();
    let handles: Vec<_> = ["x + y", "sin(x) * 40", "sqrt(x*x+y*y) / 2"]
        .into_iter()
        .map(|e| orch.submit(origin_job(32, 70, e)).unwrap())
        .collect();

    for handle in handles {
        let mut terminals = 0;
        let mut last_done = 0;
        while let Some(event) = handle.recv() {
            match event {
                JobEvent::Progress { done, total } => {
                    assert!(done > last_done && done <= total);
                    last_done = done;
                }
                JobEvent::Completed(out) => {
                    terminals += 1;
                    assert_eq!(out.backend, BackendUsed::Cpu);
                    assert_eq!(out.job_id, handle.id());
                }
                JobEvent::Failed { message, .. } => panic!("job failed: {}", message),
            }
        }
        assert_eq!(terminals, 1);
    }
}

#[test]
fn descending_sort_covers_every_pixel() {
    let mut job = Job::new(7, 5, ramp(), "x * 3");
    job.sort = Some(SortOrder::Descending);
    let out = Orchestrator::cpu_only().run(&job, |_, _| {}).unwrap();
    let sorted = out.sorted.unwrap();
    assert_eq!(sorted.len(), 35);
    assert!(sorted.windows(2).all(|w| w[0].distance >= w[1].distance));
    let mut seen: Vec<u32> = sorted.iter().map(|p| p.pixel_index).collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..35).collect::<Vec<_>>());
}

fn parity_jobs() -> Vec<Job> {
    let mut angular = Job::new(96, 80, ramp(), "sqrt(x*x+y*y) * 0.75 + sin(y * 0.1) * 3");
    angular.distortion_profile = DistortionProfile::plain().with_metric(DistanceMetric::Manhattan);
    angular.distortion_profile.angular.enabled = true;
    angular.distortion_profile.angular.frequency = 4.0;
    angular.distortion_profile.angular.amplitude = 20.0;

    // Negative bases under `^` and pow() must not turn into NaN on the device.
    let mut powers = Job::new(90, 70, ramp(), "sqrt(x ^ 2 + y ^ 2) + pow(x / 10, 3) - clamp(y, -5, 5)");
    powers.distortion_profile = DistortionProfile::plain()
        .with_metric(DistanceMetric::Chebyshev)
        .with_modulus(24.0);
    powers.distortion_profile.fractal.enabled = true;
    powers.distortion_profile.fractal.scale1 = 0.05;
    powers.distortion_profile.fractal.scale2 = 0.2;
    powers.distortion_profile.fractal.scale3 = 0.9;
    powers.distortion_profile.fractal.strength = 1.5;
    powers.distortion_profile.checkerboard.enabled = true;
    powers.distortion_profile.checkerboard.step_size = 7.0;

    let mut smooth = Job::new(64, 64, ramp(), "smoothstep(-20, 20, x) * 40 + (-y) ^ 2 / 16");
    smooth.distortion_profile = DistortionProfile::plain().with_metric(DistanceMetric::Squircle);

    vec![angular, powers, smooth]
}

#[test]
fn gpu_matches_cpu_within_f32_tolerance() {
    let Some(session) = gpu_session() else { return };
    let gpu = Orchestrator::with_session(
        EngineConfig {
            backend: Backend::Gpu,
            ..EngineConfig::default()
        },
        session,
    );
    let cpu = Orchestrator::cpu_only();

    for job in parity_jobs() {
        let g = gpu.run(&job, |_, _| {}).unwrap();
        let c = cpu.run(&job, |_, _| {}).unwrap();
        assert_eq!(g.backend, BackendUsed::Gpu);
        assert_eq!(g.pixels.len(), c.pixels.len());
        assert_eq!(g.degenerate_count, 0, "{}: device produced non-finite values", job.expression);
        assert_eq!(c.degenerate_count, 0);

        // Band edges may land on either side in f32; everything else agrees.
        let differing = g
            .index_plane
            .iter()
            .zip(&c.index_plane)
            .filter(|(a, b)| a != b)
            .count();
        assert!(
            differing * 100 <= g.index_plane.len(),
            "{}: {} pixels differ",
            job.expression,
            differing
        );
    }
    gpu.teardown();
}

#[test]
fn gpu_flags_the_same_domain_errors_as_cpu() {
    let Some(session) = gpu_session() else { return };
    let gpu = Orchestrator::with_session(
        EngineConfig {
            backend: Backend::Gpu,
            ..EngineConfig::default()
        },
        session,
    );
    // Fractional powers and logs of negative x are NaN; column x = 0 is fine
    // for the power but -inf for the log.
    for expression in ["x ^ 0.5 * 4", "log(x) + 10"] {
        let mut job = origin_job(9, 4, expression);
        job.center = Some(Point { x: 4.0, y: 0.0 });
        let g = gpu.run(&job, |_, _| {}).unwrap();
        let c = Orchestrator::cpu_only().run(&job, |_, _| {}).unwrap();
        assert!(c.degenerate_count > 0);
        assert_eq!(g.degenerate_count, c.degenerate_count, "{}", expression);
    }
    gpu.teardown();
}

#[test]
fn concurrent_error_scopes_keep_their_own_errors() {
    let Some(session) = gpu_session() else { return };
    let ctx = &session.ctx;
    std::thread::scope(|scope| {
        for worker in 0..8 {
            let scopes = ctx.error_scopes();
            let device = &ctx.device;
            scope.spawn(move || {
                for round in 0..25 {
                    // Odd workers ask for a mapped buffer with an unaligned size.
                    let invalid = worker % 2 == 1;
                    let (_buffer, error) = scopes.capture(device, wgpu::ErrorFilter::Validation, || {
                        device.create_buffer(&wgpu::BufferDescriptor {
                            label: Some("scope_check"),
                            size: if invalid { 3 } else { 64 },
                            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_WRITE,
                            mapped_at_creation: invalid,
                        })
                    });
                    assert_eq!(error.is_some(), invalid, "worker {} round {}", worker, round);
                }
            });
        }
    });
}

#[test]
fn gpu_distance_sort_orders_points() {
    let Some(session) = gpu_session() else { return };
    let points: Vec<(f64, f64)> = (0..1000)
        .map(|i| {
            let t = i as f64 * 0.731;
            (t.sin() * 50.0, t.cos() * (i % 37) as f64)
        })
        .collect();
    for order in [SortOrder::Ascending, SortOrder::Descending] {
        let sorted = session.sort_by_distance(&points, (1.0, -2.0), order).unwrap();
        assert_eq!(sorted.indices.len(), points.len());
        let ok = sorted.distances.windows(2).all(|w| match order {
            SortOrder::Ascending => w[0] <= w[1],
            SortOrder::Descending => w[0] >= w[1],
        });
        assert!(ok, "{:?} order violated", order);
        let mut seen = sorted.indices.clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..1000).collect::<Vec<u32>>());
    }
}
