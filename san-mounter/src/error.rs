use std::time::Duration;

use thiserror::Error;

use crate::types::{AttachState, DetachState};

#[derive(Error, Debug)]
pub enum MounterError {
    #[error("command '{0}' not found on this host")]
    ToolNotFound(String),

    #[error("command '{tool}' failed: {cause}")]
    CommandFailed { tool: String, cause: String },

    #[error("command '{tool}' timed out after {timeout:?}")]
    CommandTimeout { tool: String, timeout: Duration },

    #[error("device for volume '{0}' not found")]
    DeviceNotFound(String),

    #[error("multipath device '{0}' not found")]
    MultipathDeviceNotFound(String),

    #[error("path '{0}' does not match the expected structure")]
    WrongPathStructure(String),

    #[error("device '{device}' is mounted to '{actual}' instead of '{expected}'")]
    AlreadyMountedToWrongMountpoint {
        device: String,
        expected: String,
        actual: String,
    },

    #[error("multipath device '{device}' of volume '{wwn}' has no usable path")]
    FaultyDevice { wwn: String, device: String },

    #[error("invalid volume config: {0}")]
    InvalidVolumeConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MounterError {
    pub(crate) fn command_failed(tool: &str, cause: impl Into<String>) -> Self {
        MounterError::CommandFailed {
            tool: tool.to_string(),
            cause: cause.into(),
        }
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            MounterError::ToolNotFound(_) => "tool_not_found",
            MounterError::CommandFailed { .. } => "command_failed",
            MounterError::CommandTimeout { .. } => "command_timeout",
            MounterError::DeviceNotFound(_) => "device_not_found",
            MounterError::MultipathDeviceNotFound(_) => "multipath_device_not_found",
            MounterError::WrongPathStructure(_) => "wrong_path_structure",
            MounterError::AlreadyMountedToWrongMountpoint { .. } => "mounted_elsewhere",
            MounterError::FaultyDevice { .. } => "faulty_device",
            MounterError::InvalidVolumeConfig(_) => "invalid_volume_config",
            MounterError::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, MounterError>;

/// Failed attach. Displays the underlying error unchanged.
#[derive(Error, Debug)]
#[error("{source}")]
pub struct AttachError {
    /// Last state reached before the failing step
    pub reached: AttachState,
    #[source]
    pub source: MounterError,
}

impl AttachError {
    pub fn new(reached: AttachState, source: MounterError) -> Self {
        Self { reached, source }
    }
}

/// Failed detach. Displays the underlying error unchanged.
#[derive(Error, Debug)]
#[error("{source}")]
pub struct DetachError {
    /// Last state reached before the failing step
    pub reached: DetachState,
    #[source]
    pub source: MounterError,
}

impl DetachError {
    pub fn new(reached: DetachState, source: MounterError) -> Self {
        Self { reached, source }
    }
}
