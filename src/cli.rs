// ============================================================================
// curveforge CLI — headless batch rendering of job files
// ============================================================================
//
// Usage examples:
//   curveforge --job rings.json --output rings.png
//   curveforge -j jobs/*.json --output-dir out/ --values --sorted
//   curveforge -j big.json --backend gpu --force-reduced --verbose
//   curveforge --status
//
// Jobs are submitted to the orchestrator together and collected in order,
// so independent jobs render concurrently.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;

use curveforge::config::{Backend, EngineConfig};
use curveforge::engine::{JobHandle, Orchestrator};
use curveforge::io::{load_job, write_png, write_sorted, write_value_plane};
use curveforge::model::{JobOutput, SortOrder};
use curveforge::{log_err, log_info};

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// curveforge procedural pattern renderer.
#[derive(Parser, Debug)]
#[command(
    name = "curveforge",
    version,
    about = "Render curve/palette pattern jobs on the GPU or CPU",
    long_about = "Render JSON job files (curve, distortion profile, palette, noise\n\
                  expression) to PNG. Uses a wgpu compute backend when a healthy\n\
                  adapter is found and falls back to the CPU otherwise.\n\n\
                  Example:\n  \
                  curveforge --job rings.json --output rings.png\n  \
                  curveforge -j 'jobs/*.json' --output-dir out/ --values --sorted"
)]
pub struct CliArgs {
    /// Job file(s). Glob patterns accepted (e.g. "jobs/*.json").
    #[arg(short, long, num_args = 1.., required_unless_present = "status")]
    pub job: Vec<String>,

    /// Output PNG path. Only valid for a single job.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output directory for batch runs; files are named after the job file stem.
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Also write the raw value plane as `<stem>.values.pgm`.
    #[arg(long)]
    pub values: bool,

    /// Also write distance-ordered points as `<stem>.sorted.json`
    /// (ascending unless the job asks for descending).
    #[arg(long)]
    pub sorted: bool,

    /// Execution backend: auto, cpu, gpu.
    #[arg(short, long, value_name = "BACKEND")]
    pub backend: Option<Backend>,

    /// Use the Reduced capability profile even on capable hardware.
    #[arg(long)]
    pub force_reduced: bool,

    /// Adapter preference: "high performance" or "low power".
    #[arg(long, value_name = "PREFERENCE")]
    pub gpu: Option<String>,

    /// JSON engine config; command-line flags override it.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Print the GPU capability status as JSON and exit.
    #[arg(long)]
    pub status: bool,

    /// Print per-job progress and timing.
    #[arg(short, long)]
    pub verbose: bool,
}

impl CliArgs {
    /// Defaults, then the config file, then flags.
    pub fn engine_config(&self) -> Result<EngineConfig, String> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load(path).map_err(|e| e.to_string())?,
            None => EngineConfig::default(),
        };
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if self.force_reduced {
            config.force_reduced = true;
        }
        if let Some(pref) = &self.gpu {
            config.preferred_gpu = pref.clone();
        }
        Ok(config)
    }
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run all CLI processing and return an OS exit code.
/// `0` = every job succeeded, `1` = one or more jobs failed.
pub fn run(args: CliArgs) -> ExitCode {
    let config = match args.engine_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let orchestrator = Orchestrator::new(config);

    if args.status {
        return match serde_json::to_string_pretty(&orchestrator.status()) {
            Ok(json) => {
                println!("{}", json);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("error: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    let inputs = resolve_inputs(&args.job);
    if inputs.is_empty() {
        eprintln!("error: no job files matched the given pattern(s).");
        return ExitCode::FAILURE;
    }

    if inputs.len() > 1 && args.output.is_some() && args.output_dir.is_none() {
        eprintln!(
            "error: {} job files given but --output only accepts a single file path.\n\
             Use --output-dir to specify a destination directory for batch runs.",
            inputs.len()
        );
        return ExitCode::FAILURE;
    }

    if let Some(dir) = &args.output_dir
        && let Err(e) = std::fs::create_dir_all(dir)
    {
        eprintln!("error: could not create output directory '{}': {}", dir.display(), e);
        return ExitCode::FAILURE;
    }

    let total = inputs.len();
    let multi = total > 1;
    let mut any_failure = false;

    // Submit everything first; the orchestrator runs jobs in parallel.
    let mut pending: Vec<(PathBuf, PathBuf, JobHandle, Instant)> = Vec::with_capacity(total);
    for input in &inputs {
        let Some(output) = build_output_path(input, args.output.as_deref(), args.output_dir.as_deref()) else {
            eprintln!("error: cannot determine output path for '{}'.", input.display());
            any_failure = true;
            continue;
        };
        let mut job = match load_job(input) {
            Ok(job) => job,
            Err(e) => {
                eprintln!("error: {}", e);
                any_failure = true;
                continue;
            }
        };
        if args.sorted && job.sort.is_none() {
            job.sort = Some(SortOrder::Ascending);
        }
        match orchestrator.submit(job) {
            Ok(handle) => pending.push((input.clone(), output, handle, Instant::now())),
            Err(e) => {
                eprintln!("error: {}: {}", input.display(), e);
                log_err!("{}: {}", input.display(), e);
                any_failure = true;
            }
        }
    }

    for (idx, (input, output, handle, started)) in pending.into_iter().enumerate() {
        if multi || args.verbose {
            println!("[{}/{}] {}", idx + 1, total, input.display());
        }
        let verbose = args.verbose;
        let result = handle.wait_with_progress(|done, total| {
            if verbose {
                println!("  {}/{}", done, total);
            }
        });
        match result.map_err(|e| e.to_string()).and_then(|out| write_outputs(&out, &output, &args)) {
            Ok(()) => {
                log_info!("{} -> {}", input.display(), output.display());
                if verbose || multi {
                    println!(
                        "  → {} ({:.0}ms)",
                        output.display(),
                        started.elapsed().as_secs_f64() * 1000.0
                    );
                }
            }
            Err(e) => {
                eprintln!("  error: {}: {}", input.display(), e);
                any_failure = true;
            }
        }
    }

    orchestrator.teardown();

    if any_failure { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

fn write_outputs(out: &JobOutput, png: &Path, args: &CliArgs) -> Result<(), String> {
    write_png(out, png).map_err(|e| e.to_string())?;
    if args.values {
        write_value_plane(out, &sibling(png, "values.pgm")).map_err(|e| e.to_string())?;
    }
    if args.sorted {
        write_sorted(out, &sibling(png, "sorted.json")).map_err(|e| e.to_string())?;
    }
    if out.degenerate_count > 0 {
        eprintln!(
            "  warning: {} pixels had non-finite noise values and used curve index 0",
            out.degenerate_count
        );
    }
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

/// Expand glob patterns and literal paths into a deduplicated, ordered list.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        let as_path = Path::new(pattern);

        if as_path.exists() {
            if !result.iter().any(|p| p.as_path() == as_path) {
                result.push(as_path.to_path_buf());
            }
            continue;
        }

        match glob::glob(pattern) {
            Ok(entries) => {
                let mut matched = false;
                for entry in entries.flatten() {
                    if !result.contains(&entry) {
                        result.push(entry);
                    }
                    matched = true;
                }
                if !matched {
                    eprintln!("warning: pattern '{}' matched no files.", pattern);
                }
            }
            Err(e) => {
                eprintln!("warning: invalid glob '{}': {}", pattern, e);
            }
        }
    }

    result
}

/// PNG path for one job file.
///
/// Priority:
/// 1. `--output` (explicit path, single job)
/// 2. `--output-dir` (file stem + `.png` inside the directory)
/// 3. next to the job file, same stem, `.png`
fn build_output_path(input: &Path, output: Option<&Path>, output_dir: Option<&Path>) -> Option<PathBuf> {
    if let Some(out) = output {
        return Some(out.to_path_buf());
    }
    let stem = input.file_stem()?.to_string_lossy().into_owned();
    let file = format!("{}.png", stem);
    match output_dir {
        Some(dir) => Some(dir.join(file)),
        None => Some(input.parent().unwrap_or(Path::new(".")).join(file)),
    }
}

/// `dir/stem.png` → `dir/stem.<suffix>`.
fn sibling(png: &Path, suffix: &str) -> PathBuf {
    let stem = png
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    png.with_file_name(format!("{}.{}", stem, suffix))
}
