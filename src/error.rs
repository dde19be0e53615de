//! Error types for sift-gpu.

use thiserror::Error;

/// Result alias for sift-gpu operations.
pub type Result<T> = std::result::Result<T, SiftError>;

/// Errors that can occur while detecting or matching features.
///
/// Keypoint-buffer overflow is deliberately *not* an error: detection
/// truncates at `max_keypoints` and reports the truncation on the returned
/// result instead.
#[derive(Debug, Error)]
pub enum SiftError {
    /// No suitable GPU adapter or device could be acquired.
    #[error("no suitable GPU device: {0}")]
    Unavailable(String),
    /// Options or inputs are out of range.
    #[error("invalid configuration: {0}")]
    BadConfig(String),
    /// An allocation for the pyramid or staging buffers failed.
    #[error("allocation failed in {stage}: {message}")]
    Capacity {
        /// Pipeline stage that failed to allocate.
        stage: &'static str,
        message: String,
    },
    /// A shader failed to validate or compile. Fatal at initialization.
    #[error("shader `{shader}` failed to load: {message}")]
    ShaderLoad {
        shader: &'static str,
        message: String,
    },
    /// The GPU was reset mid-operation; the driver must be reconstructed.
    #[error("device lost during {0}")]
    DeviceLost(&'static str),
    /// I/O failure in the descriptor file formats.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}
