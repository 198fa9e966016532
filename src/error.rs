//! Error taxonomy for the job execution engine.
//!
//! Native-API return codes are translated into [`Error`] variants at the
//! boundary (device creation, allocation, submission); internal invariants
//! that a caller cannot violate through the public API use `assert!`/
//! `debug_assert!` instead, matching how `SubmissionNumber::new` panics on a
//! bad queue index rather than returning a `Result`.

use thiserror::Error;

/// Errors that can be reported by the job execution engine.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to initialize the native API")]
    InitializationFailed,

    #[error("out of host memory")]
    OutOfHostMemory,

    #[error("out of device memory")]
    OutOfDeviceMemory,

    #[error("memory fragmentation prevented the allocation")]
    Fragmentation,

    #[error("the device was lost")]
    DeviceLost,

    #[error("the presentation surface was lost")]
    SurfaceLost,

    #[error("the swapchain is out of date")]
    OutOfDate,

    #[error("required layer `{0}` is not present")]
    LayerNotPresent(String),

    #[error("required extension `{0}` is not present")]
    ExtensionNotPresent(String),

    #[error("required feature `{0}` is not present")]
    FeatureNotPresent(String),

    #[error("format is not supported for the requested usage")]
    FormatNotSupported,

    #[error("failed to map host-visible memory")]
    MemoryMapFailed,

    #[error("too many objects of this kind are already live")]
    TooManyObjects,

    #[error("the supplied external handle is invalid")]
    InvalidExternalHandle,

    #[error("operation is not supported by this engine")]
    UnsupportedOperation,

    #[error("internal assertion failed: {0}")]
    AssertionFailed(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Callback invoked when an allocation fails with `OutOfDeviceMemory`, giving
/// the caller a chance to free resources and request a retry. Returning
/// `true` causes the allocation to be retried once; `false` propagates the
/// error.
pub type OutOfMemoryCallback = Box<dyn FnMut() -> bool + Send>;
