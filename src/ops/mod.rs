// ============================================================================
// OPS MODULE — scalar (CPU) math of the pattern pipeline
// ============================================================================
//
// Layout:
//   expr.rs       — noise formula sandbox: validate, parse, interpret, lower to WGSL
//   distortion.rs — warp, modulus fold, angular/fractal distortion, metrics
//   pipeline.rs   — per-coordinate `process` and the rayon batch renderer
//   sort.rs       — bitonic distance sort (reference for the GPU kernel)
//   palette.rs    — value plane → RGBA8 compositing
// ============================================================================

pub mod distortion;
pub mod expr;
pub mod palette;
pub mod pipeline;
pub mod sort;

pub use expr::{NoiseFn, compile};
pub use pipeline::{Sample, process, process_checked};
pub use sort::{SortedByDistance, sort_by_distance};
