// ============================================================================
// curveforge — procedural curve/palette pattern renderer
// ============================================================================
//
// Layout:
//   model.rs   — job, curve, palette and distortion records (serde)
//   ops/       — scalar pipeline: expression sandbox, distortions, sort, palette
//   gpu/       — wgpu compute backend: negotiation, kernels, buffer arenas
//   engine.rs  — orchestrator: validation, backend choice, job events
//   config.rs  — engine configuration
//   io.rs      — job files in, PNG / PGM / JSON out
//   logger.rs  — session log file and log_* macros
// ============================================================================

#![allow(clippy::too_many_arguments)]

pub mod logger;

pub mod config;
pub mod engine;
pub mod error;
pub mod gpu;
pub mod io;
pub mod model;
pub mod ops;

pub use config::{Backend, EngineConfig};
pub use engine::{JobEvent, JobHandle, Orchestrator};
pub use error::PipelineError;
pub use gpu::CapabilityStatus;
pub use model::{
    BackendUsed, Curve, DistanceMetric, DistortionProfile, Job, JobOutput, Palette, Point, Rgba,
    SortOrder, SortedPoint,
};
pub use ops::SortedByDistance;
