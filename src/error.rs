//! Error types for the compute resource layer.

use thiserror::Error;

/// Errors reported by devices, resources, kernels and the backends behind them.
///
/// Every error is surfaced synchronously to the caller of the operation that
/// detected it. Nothing is retried internally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComputeError {
    /// The adapter index or creation flags were rejected.
    #[error("failed to create device: {0}")]
    DeviceCreationFailed(String),
    /// The backend rejected a resource description, including sizing violations.
    #[error("failed to create resource: {0}")]
    ResourceCreationFailed(String),
    /// A CPU-access-dependent operation was called before `enable_cpu_access`.
    #[error("CPU access is disabled for this resource; call enable_cpu_access first")]
    CpuAccessDisabled,
    /// A region, slice or register lies outside the valid bounds.
    #[error("out of range: {0}")]
    OutOfRange(String),
    /// An argument is malformed or inconsistent with the target.
    #[error("invalid argument: {0}")]
    ArgumentInvalid(String),
    /// A copy or share between resources of mismatched shape, format group or domain.
    #[error("incompatible resource: {0}")]
    IncompatibleResource(String),
    /// Pixel data uses a layout with no texture format mapping.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    /// Kernel source failed to compile.
    #[error("kernel compilation failed: {0}")]
    CompilationFailed(String),
    /// The active backend cannot express the requested operation.
    #[error("feature not supported: {0}")]
    FeatureNotSupported(String),
    /// An internal invariant of a backend was broken.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias used throughout the crate.
pub type ComputeResult<T> = Result<T, ComputeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ComputeError::CpuAccessDisabled;
        assert_eq!(
            err.to_string(),
            "CPU access is disabled for this resource; call enable_cpu_access first"
        );

        let err = ComputeError::OutOfRange("srcX + width = 70 > 64".to_string());
        assert_eq!(err.to_string(), "out of range: srcX + width = 70 > 64");
    }

    #[test]
    fn test_errors_compare_by_kind_and_message() {
        assert_eq!(
            ComputeError::ResourceCreationFailed("a".into()),
            ComputeError::ResourceCreationFailed("a".into())
        );
        assert_ne!(
            ComputeError::ResourceCreationFailed("a".into()),
            ComputeError::ArgumentInvalid("a".into())
        );
    }
}
