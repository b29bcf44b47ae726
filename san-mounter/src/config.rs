//! Mounter configuration
//!
//! Built by the binary from command-line flags (with environment fallbacks)
//! or loaded from a JSON file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{MounterError, Result};
use crate::types::{FaultyPathPolicy, Protocol};

pub const DEFAULT_MOUNT_ROOT: &str = "/ubiquity";
pub const DEFAULT_FS_TYPE: &str = "ext4";
pub const DEFAULT_MULTIPATH_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_HBA_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_MOUNT_DIR_MODE: u32 = 0o700;

/// Filesystems `mkfs -t` is allowed to create.
pub const SUPPORTED_FS_TYPES: [&str; 3] = ["ext4", "ext3", "xfs"];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MounterConfig {
    /// SAN transport of this host
    pub protocol: Protocol,
    /// Directory under which per-WWN mount points are created
    pub mount_root: PathBuf,
    /// Filesystem created when the volume config does not name one
    pub default_fs_type: String,
    /// Bound on `multipath` and `sg_inq` invocations
    pub multipath_timeout_secs: u64,
    /// Bound on HBA enumeration
    pub hba_timeout_secs: u64,
    pub faulty_path_policy: FaultyPathPolicy,
    /// Permissions of newly created mount points
    pub mount_dir_mode: u32,
}

impl Default for MounterConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::default(),
            mount_root: PathBuf::from(DEFAULT_MOUNT_ROOT),
            default_fs_type: DEFAULT_FS_TYPE.to_string(),
            multipath_timeout_secs: DEFAULT_MULTIPATH_TIMEOUT_SECS,
            hba_timeout_secs: DEFAULT_HBA_TIMEOUT_SECS,
            faulty_path_policy: FaultyPathPolicy::default(),
            mount_dir_mode: DEFAULT_MOUNT_DIR_MODE,
        }
    }
}

impl MounterConfig {
    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            MounterError::InvalidVolumeConfig(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_path(&self.mount_root.to_string_lossy())?;
        validate_fs_type(&self.default_fs_type)?;
        if self.multipath_timeout_secs == 0 || self.hba_timeout_secs == 0 {
            return Err(MounterError::InvalidVolumeConfig(
                "timeouts must be at least one second".into(),
            ));
        }
        Ok(())
    }

    pub fn multipath_timeout(&self) -> Duration {
        Duration::from_secs(self.multipath_timeout_secs)
    }

    pub fn hba_timeout(&self) -> Duration {
        Duration::from_secs(self.hba_timeout_secs)
    }

    /// Mount point of a volume: `<mount_root>/<wwn>`.
    pub fn mount_point(&self, wwn: &str) -> PathBuf {
        self.mount_root.join(wwn)
    }
}

/// Check that a path is absolute and safe to pass to host tools.
pub fn validate_path(path: &str) -> Result<()> {
    if path.is_empty() || !path.starts_with('/') || path.contains("..") {
        return Err(MounterError::WrongPathStructure(path.to_string()));
    }

    let dangerous_chars = [
        ';', '|', '&', '$', '`', '(', ')', '{', '}', '<', '>', '\n', '\r', ' ',
    ];
    if path.chars().any(|c| dangerous_chars.contains(&c)) {
        return Err(MounterError::WrongPathStructure(path.to_string()));
    }
    Ok(())
}

/// Normalize and check a filesystem type.
pub fn validate_fs_type(fs_type: &str) -> Result<String> {
    let lower = fs_type.trim().to_lowercase();
    if SUPPORTED_FS_TYPES.contains(&lower.as_str()) {
        Ok(lower)
    } else {
        Err(MounterError::InvalidVolumeConfig(format!(
            "unsupported filesystem '{}': supported are {}",
            fs_type,
            SUPPORTED_FS_TYPES.join(", ")
        )))
    }
}
