//! Error Types
//!
//! The main error type [`CacheError`] covers every failure mode of the state
//! cache: shader module compilation, device object creation, and descriptor
//! pool exhaustion.
//!
//! All public fallible APIs return [`Result<T>`], an alias for
//! `std::result::Result<T, CacheError>`.

use thiserror::Error;

use crate::descriptor::DescriptorType;
use crate::shader::Stage;

/// The main error type for the state cache.
#[derive(Error, Debug)]
pub enum CacheError {
    // ========================================================================
    // Shader Module Errors
    // ========================================================================
    /// The compiler collaborator failed to produce a module for a stage.
    ///
    /// Program construction unwinds: modules inserted for sibling stages
    /// during the same attempt are removed from the shared module cache.
    #[error("Failed to compile shader module for {stage:?} stage")]
    Compile {
        /// The stage whose module failed to compile
        stage: Stage,
    },

    /// A program or descriptor set was requested with no shader bound for a
    /// required stage.
    #[error("No shader bound for {stage:?} stage")]
    NoShaderBound {
        /// The missing stage
        stage: Stage,
    },

    // ========================================================================
    // Device Object Errors
    // ========================================================================
    /// The device collaborator failed to create a native object.
    ///
    /// Nothing is cached for a failed creation; the same request may be
    /// retried on a later draw.
    #[error("Failed to create device object: {0}")]
    DeviceObject(&'static str),

    // ========================================================================
    // Descriptor Pool Errors
    // ========================================================================
    /// A descriptor pool stayed exhausted even after flushing the active
    /// batch and retrying once.
    #[error("Descriptor pool exhausted for {ty:?} sets after flush and retry")]
    PoolExhausted {
        /// The descriptor type whose pool ran dry
        ty: DescriptorType,
    },
}

/// Alias for `Result<T, CacheError>`.
pub type Result<T> = std::result::Result<T, CacheError>;
