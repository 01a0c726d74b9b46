// ============================================================================
// IO — job files in, images and sorted point lists out
// ============================================================================

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use image::codecs::png::PngEncoder;
use image::codecs::pnm::{PnmEncoder, PnmSubtype, SampleEncoding};
use image::{ColorType, ImageEncoder};

use crate::error::PipelineError;
use crate::model::{Job, JobOutput};

fn with_path(path: &Path, e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Io(format!("{}: {}", path.display(), e))
}

/// Read a JSON job record.  Missing optional fields take their defaults.
pub fn load_job(path: &Path) -> Result<Job, PipelineError> {
    let file = File::open(path).map_err(|e| with_path(path, e))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|e| with_path(path, e))
}

/// RGBA8 PNG of the composited pixels.
pub fn write_png(output: &JobOutput, path: &Path) -> Result<(), PipelineError> {
    let file = File::create(path).map_err(|e| with_path(path, e))?;
    let mut writer = BufWriter::new(file);
    PngEncoder::new(&mut writer)
        .write_image(&output.pixels, output.width, output.height, ColorType::Rgba8)
        .map_err(|e| with_path(path, e))?;
    writer.flush().map_err(|e| with_path(path, e))
}

/// The raw value plane as a binary 8-bit PGM.
pub fn write_value_plane(output: &JobOutput, path: &Path) -> Result<(), PipelineError> {
    let file = File::create(path).map_err(|e| with_path(path, e))?;
    let mut writer = BufWriter::new(file);
    PnmEncoder::new(&mut writer)
        .with_subtype(PnmSubtype::Graymap(SampleEncoding::Binary))
        .write_image(&output.value_plane, output.width, output.height, ColorType::L8)
        .map_err(|e| with_path(path, e))?;
    writer.flush().map_err(|e| with_path(path, e))
}

/// The distance-ordered points as a JSON array.  Writes `[]` when the job
/// did not ask for sorting.
pub fn write_sorted(output: &JobOutput, path: &Path) -> Result<(), PipelineError> {
    let file = File::create(path).map_err(|e| with_path(path, e))?;
    let mut writer = BufWriter::new(file);
    let points = output.sorted.as_deref().unwrap_or(&[]);
    serde_json::to_writer(&mut writer, points).map_err(|e| with_path(path, e))?;
    writer.flush().map_err(|e| with_path(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BackendUsed, SortedPoint};

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("curveforge-io-{}-{}", name, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn tiny_output() -> JobOutput {
        JobOutput {
            job_id: "t".into(),
            width: 2,
            height: 1,
            pixels: vec![1, 2, 3, 255, 4, 5, 6, 255],
            value_plane: vec![10, 20],
            index_plane: vec![0, 1],
            sorted: Some(vec![SortedPoint {
                pixel_index: 1,
                x: 0.5,
                y: 0.0,
                distance: 0.5,
                value: 20,
            }]),
            degenerate_count: 0,
            backend: BackendUsed::Cpu,
            elapsed_ms: 0,
        }
    }

    #[test]
    fn job_file_with_defaults_loads() {
        let dir = scratch_dir("job");
        let path = dir.join("job.json");
        std::fs::write(
            &path,
            r#"{ "width": 4, "height": 3, "expression": "x + y",
                 "curve": { "width": 2, "data": [0, 255] } }"#,
        )
        .unwrap();
        let job = load_job(&path).unwrap();
        assert_eq!((job.width, job.height), (4, 3));
        assert_eq!(job.scale, 1.0);
        assert!(job.sort.is_none());
        assert!(!job.id.is_empty());
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn missing_job_file_is_io_error() {
        let err = load_job(Path::new("/nonexistent/curveforge/job.json")).unwrap_err();
        assert!(matches!(err, PipelineError::Io(msg) if msg.contains("job.json")));
    }

    #[test]
    fn outputs_are_written() {
        let dir = scratch_dir("out");
        let out = tiny_output();

        let png = dir.join("a.png");
        write_png(&out, &png).unwrap();
        let img = image::open(&png).unwrap().to_rgba8();
        assert_eq!(img.dimensions(), (2, 1));
        assert_eq!(img.get_pixel(1, 0).0, [4, 5, 6, 255]);

        let pgm = dir.join("a.values.pgm");
        write_value_plane(&out, &pgm).unwrap();
        let bytes = std::fs::read(&pgm).unwrap();
        assert!(bytes.starts_with(b"P5"));
        assert_eq!(&bytes[bytes.len() - 2..], &[10, 20]);

        let json = dir.join("a.sorted.json");
        write_sorted(&out, &json).unwrap();
        let back: Vec<SortedPoint> = serde_json::from_slice(&std::fs::read(&json).unwrap()).unwrap();
        assert_eq!(back, out.sorted.unwrap());

        std::fs::remove_dir_all(dir).ok();
    }
}
