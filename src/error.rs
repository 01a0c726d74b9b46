// ============================================================================
// ERRORS — job-level error taxonomy shared by the CPU and GPU paths
// ============================================================================

use std::fmt;

/// Every failure the engine can report.
///
/// `NumericDegenerate` is the only variant that is recovered locally (per
/// coordinate); all others are fatal to the job that raised them.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// The noise expression failed the sandbox checks or did not parse.
    InvalidExpression {
        message: String,
        /// Byte offset into the source, when known.
        position: Option<usize>,
    },
    /// No usable compute device, or the device stopped responding.
    CapabilityUnavailable(String),
    /// The noise function produced a non-finite value at this coordinate.
    NumericDegenerate { x: f64, y: f64 },
    /// A buffer could not be allocated on the device.
    ResourceExhausted(String),
    /// The job description violates an invariant (curve length, size, ...).
    InvalidJob(String),
    /// Reading a job or writing an output failed.
    Io(String),
}

impl PipelineError {
    pub fn invalid_expression(message: impl Into<String>, position: Option<usize>) -> Self {
        PipelineError::InvalidExpression {
            message: message.into(),
            position,
        }
    }

    /// The device was found but is not behaving (self-test or watchdog).
    pub fn degraded(detail: impl fmt::Display) -> Self {
        PipelineError::CapabilityUnavailable(format!(
            "capability negotiation degraded: {}",
            detail
        ))
    }

    /// `true` for errors that abort a whole job.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PipelineError::NumericDegenerate { .. })
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::InvalidExpression {
                message,
                position: Some(pos),
            } => write!(f, "invalid expression at offset {}: {}", pos, message),
            PipelineError::InvalidExpression {
                message,
                position: None,
            } => write!(f, "invalid expression: {}", message),
            PipelineError::CapabilityUnavailable(msg) => {
                write!(f, "GPU capability unavailable: {}", msg)
            }
            PipelineError::NumericDegenerate { x, y } => {
                write!(f, "non-finite noise value at ({}, {})", x, y)
            }
            PipelineError::ResourceExhausted(msg) => write!(f, "resource exhausted: {}", msg),
            PipelineError::InvalidJob(msg) => write!(f, "invalid job: {}", msg),
            PipelineError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Io(format!("JSON: {}", e))
    }
}

impl From<image::ImageError> for PipelineError {
    fn from(e: image::ImageError) -> Self {
        PipelineError::Io(format!("image encode: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degenerate_is_the_only_recoverable_error() {
        assert!(!PipelineError::NumericDegenerate { x: 0.0, y: 1.0 }.is_fatal());
        assert!(PipelineError::ResourceExhausted("x".into()).is_fatal());
        assert!(PipelineError::invalid_expression("bad", None).is_fatal());
    }

    #[test]
    fn degraded_message_is_recognisable() {
        let e = PipelineError::degraded("self-test took 120ms");
        assert!(e.to_string().contains("capability negotiation degraded"));
    }
}
