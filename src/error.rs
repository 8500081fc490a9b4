//! Custom error types for the fly-scan engine.
//!
//! `DaqError` is the single error type shared by the trajectory planner, the
//! PSO controller, the flyer state machine, the collector and the plans. It
//! follows the failure taxonomy of a fly scan:
//!
//! - **`InvalidScanParameters`**: the pre-flight geometry would produce spurious
//!   pulses. Raised before the pulse generator is armed; the scan must not
//!   proceed.
//! - **`ConnectionTimeout`**: a device or command channel did not answer in time.
//!   Fatal for required flyers, skipped with a warning for optional devices.
//! - **`DegenerateParameters`**: zero dwell time, zero encoder resolution or a
//!   non-positive acceleration time. Only the dependent recompute halts; the
//!   last trajectory is kept but marked stale and cannot be flown.
//! - **`Motion`** / **`Command`**: a move or a controller command failed. There is
//!   no automatic retry; the enclosing status fails permanently.
//! - **`Config`** / **`Configuration`**: loading or semantic validation of the
//!   beamline configuration.
//!
//! Hardware-facing capability traits return `anyhow::Result`; conversion into
//! `DaqError` happens at the flyer seam.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid scan parameters: {0}")]
    InvalidScanParameters(String),

    #[error("Could not compute fly-scan parameters: {0}")]
    DegenerateParameters(String),

    #[error("Timed out after {timeout_ms} ms waiting for '{device}'")]
    ConnectionTimeout { device: String, timeout_ms: u64 },

    #[error("Motion error: {0}")]
    Motion(String),

    #[error("Controller command failed: {0}")]
    Command(String),

    #[error("Operation aborted: {0}")]
    Aborted(String),

    #[error("Status failed: {0}")]
    StatusFailed(String),

    #[error("Cannot {action} while flyer is {from}")]
    InvalidTransition { from: String, action: String },

    #[error(
        "Flyer '{device}' produced {found} events but reference flyer '{reference}' produced {expected}"
    )]
    RaggedCollection {
        reference: String,
        device: String,
        expected: usize,
        found: usize,
    },

    #[error("Could not find component: {0}")]
    ComponentNotFound(String),

    #[error("Unknown engineering unit: '{0}'")]
    UnknownUnit(String),

    #[error("Cannot convert {from} to {to}: incompatible dimensions")]
    IncompatibleUnits { from: String, to: String },
}

impl DaqError {
    /// Whether the error should abort the scan that is currently running.
    ///
    /// Degenerate-parameter warnings and unknown optional components halt only
    /// the dependent operation.
    pub fn is_scan_fatal(&self) -> bool {
        !matches!(
            self,
            DaqError::DegenerateParameters(_) | DaqError::ComponentNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::InvalidScanParameters("taxi too long".to_string());
        assert_eq!(err.to_string(), "Invalid scan parameters: taxi too long");
    }

    #[test]
    fn test_timeout_display() {
        let err = DaqError::ConnectionTimeout {
            device: "aerotech_horiz".into(),
            timeout_ms: 500,
        };
        assert_eq!(
            err.to_string(),
            "Timed out after 500 ms waiting for 'aerotech_horiz'"
        );
    }

    #[test]
    fn test_scan_fatal_classification() {
        assert!(DaqError::Motion("stalled".into()).is_scan_fatal());
        assert!(DaqError::InvalidScanParameters("x".into()).is_scan_fatal());
        assert!(!DaqError::DegenerateParameters("dwell".into()).is_scan_fatal());
    }
}
