//! Error types for the ray-tracing build core
//!
//! Every variant is fatal at this layer: callers abort the build they were
//! performing and tear down whatever they had created. The constructors
//! below log the failure where it is raised.

use ash::vk;
use thiserror::Error;

use crate::config::ConfigError;
use crate::engine::EnginePhase;

/// Ray-tracing core errors
#[derive(Error, Debug)]
pub enum RtxError {
    /// The device refused to create a buffer, memory allocation or structure
    #[error("Resource creation failed ({what}): {result:?}")]
    ResourceCreationFailure {
        /// What was being created
        what: String,
        /// Result code reported by the device
        result: vk::Result,
    },

    /// A device query returned unusable data or failed outright
    #[error("Capability query failed ({what}): {reason}")]
    CapabilityQueryFailure {
        /// Which query failed
        what: String,
        /// Description of the failure
        reason: String,
    },

    /// A construction protocol was called out of order or with bad arguments
    #[error("Protocol violation: {reason}")]
    ProtocolViolation {
        /// Description of the violated precondition
        reason: String,
    },

    /// Command submission or the following queue wait failed
    #[error("Submission failed ({what}): {result:?}")]
    SubmissionFailure {
        /// Which submission step failed
        what: String,
        /// Result code reported by the device
        result: vk::Result,
    },

    /// Mesh or scene input is malformed
    #[error("Invalid scene data: {reason}")]
    InvalidSceneData {
        /// Description of the malformed input
        reason: String,
    },

    /// Instance or device bring-up failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// A render-core operation was called in the wrong phase
    #[error("Phase violation: {operation} requires {expected:?}, current phase is {actual:?}")]
    PhaseViolation {
        /// Operation that was attempted
        operation: &'static str,
        /// Phase the operation requires
        expected: EnginePhase,
        /// Phase the core was in
        actual: EnginePhase,
    },

    /// A shader module could not be loaded
    #[error("Shader error ({path}): {reason}")]
    Shader {
        /// Shader source path
        path: String,
        /// Description of the failure
        reason: String,
    },

    /// Configuration could not be loaded or is invalid
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for ray-tracing core operations
pub type RtxResult<T> = Result<T, RtxError>;

impl RtxError {
    pub(crate) fn resource_creation(what: impl Into<String>, result: vk::Result) -> Self {
        let what = what.into();
        log::error!("Failed to create {}: {:?}", what, result);
        Self::ResourceCreationFailure { what, result }
    }

    pub(crate) fn capability_query(what: impl Into<String>, reason: impl Into<String>) -> Self {
        let what = what.into();
        let reason = reason.into();
        log::error!("Capability query '{}' failed: {}", what, reason);
        Self::CapabilityQueryFailure { what, reason }
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        log::error!("Protocol violation: {}", reason);
        Self::ProtocolViolation { reason }
    }

    pub(crate) fn submission(what: impl Into<String>, result: vk::Result) -> Self {
        let what = what.into();
        log::error!("Submission step '{}' failed: {:?}", what, result);
        Self::SubmissionFailure { what, result }
    }

    pub(crate) fn invalid_scene(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        log::error!("Invalid scene data: {}", reason);
        Self::InvalidSceneData { reason }
    }

    pub(crate) fn phase(operation: &'static str, expected: EnginePhase, actual: EnginePhase) -> Self {
        log::error!("{} called in phase {:?}, requires {:?}", operation, actual, expected);
        Self::PhaseViolation {
            operation,
            expected,
            actual,
        }
    }

    pub(crate) fn initialization(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        log::error!("Initialization failed: {}", reason);
        Self::InitializationFailed(reason)
    }
}
