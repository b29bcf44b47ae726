//! Shared types for the mount/unmount state machine.
//!
//! Volume identity and protocol selection are parsed once at the boundary
//! (`FromStr` / [`VolumeConfig::from_map`]) so the primitives below only see
//! validated values.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{MounterError, Result};

// ============================================================================
// Protocol
// ============================================================================

/// Bus rescan protocol understood by the device primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescanProtocol {
    Scsi,
    Iscsi,
}

impl Display for RescanProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RescanProtocol::Scsi => write!(f, "scsi"),
            RescanProtocol::Iscsi => write!(f, "iscsi"),
        }
    }
}

/// SAN transport used to reach the storage array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Fibre Channel (default)
    #[default]
    Fc,
    Iscsi,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Fc => write!(f, "fc"),
            Protocol::Iscsi => write!(f, "iscsi"),
        }
    }
}

impl FromStr for Protocol {
    type Err = ProtocolParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fc" | "fibre-channel" | "fibrechannel" => Ok(Protocol::Fc),
            "iscsi" => Ok(Protocol::Iscsi),
            _ => Err(ProtocolParseError(s.to_string())),
        }
    }
}

/// Error returned when parsing an invalid protocol.
#[derive(Debug, Clone)]
pub struct ProtocolParseError(String);

impl Display for ProtocolParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown protocol '{}': expected 'fc' or 'iscsi'",
            self.0
        )
    }
}

impl std::error::Error for ProtocolParseError {}

// ============================================================================
// Wwn
// ============================================================================

/// World-Wide Name of a LUN, normalized to lower case without `0x` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Wwn(String);

impl Wwn {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Wwn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Wwn {
    type Err = MounterError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let hex = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(MounterError::InvalidVolumeConfig(format!(
                "'{}' is not a hexadecimal WWN",
                s
            )));
        }
        Ok(Wwn(hex.to_ascii_lowercase()))
    }
}

// ============================================================================
// VolumeConfig
// ============================================================================

/// Typed view over the untyped volume configuration map supplied by the
/// volume broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeConfig {
    pub wwn: Wwn,
    pub fs_type: Option<String>,
    pub lun: Option<u32>,
}

fn lookup<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| map.get(*k))
}

impl VolumeConfig {
    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        let wwn = lookup(map, &["Wwn", "wwn", "WWN"])
            .and_then(Value::as_str)
            .ok_or_else(|| MounterError::InvalidVolumeConfig("missing 'Wwn'".into()))?
            .parse()?;

        let fs_type = lookup(map, &["fstype", "fsType", "FsType"])
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);

        let lun = match lookup(map, &["LunNumber", "lun", "Lun"]) {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => Some(
                n.as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| {
                        MounterError::InvalidVolumeConfig(format!("invalid LUN number {}", n))
                    })?,
            ),
            Some(Value::String(s)) => Some(s.trim().parse().map_err(|_| {
                MounterError::InvalidVolumeConfig(format!("invalid LUN number '{}'", s))
            })?),
            Some(other) => {
                return Err(MounterError::InvalidVolumeConfig(format!(
                    "invalid LUN number {}",
                    other
                )));
            }
        };

        Ok(Self { wwn, fs_type, lun })
    }

    /// Parse a JSON object document.
    pub fn from_json(doc: &str) -> Result<Self> {
        let map: Map<String, Value> = serde_json::from_str(doc)
            .map_err(|e| MounterError::InvalidVolumeConfig(e.to_string()))?;
        Self::from_map(&map)
    }
}

// ============================================================================
// Faulty path policy
// ============================================================================

/// What attach does when the discovered multipath device has no usable path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultyPathPolicy {
    /// Refuse to mount (default)
    #[default]
    Block,
    /// Log a warning and mount anyway
    Warn,
}

impl FromStr for FaultyPathPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "block" => Ok(FaultyPathPolicy::Block),
            "warn" => Ok(FaultyPathPolicy::Warn),
            _ => Err(format!(
                "unknown faulty path policy '{}': expected 'block' or 'warn'",
                s
            )),
        }
    }
}

// ============================================================================
// Operation states
// ============================================================================

/// Progress of an attach operation: the last state reached before a step
/// failed. A completed attach is reported by `Ok`, so there is no terminal
/// variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AttachState {
    Unattached,
    Discovering,
    Discovered,
    FilesystemChecked,
}

impl Display for AttachState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttachState::Unattached => "unattached",
            AttachState::Discovering => "discovering",
            AttachState::Discovered => "discovered",
            AttachState::FilesystemChecked => "filesystem-checked",
        };
        f.write_str(name)
    }
}

/// Progress of a detach operation, the mirror of [`AttachState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DetachState {
    Mounted,
    Discovered,
    Unmounted,
    Cleaned,
}

impl Display for DetachState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DetachState::Mounted => "mounted",
            DetachState::Discovered => "discovered",
            DetachState::Unmounted => "unmounted",
            DetachState::Cleaned => "cleaned",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Tagged outcomes
// ============================================================================

/// A step that failed without stopping the operation.
#[derive(Debug)]
pub struct Advisory {
    pub step: &'static str,
    pub error: MounterError,
}

/// Result of an operation that completed, plus the best-effort steps that
/// failed along the way.
#[derive(Debug)]
pub struct Outcome<T> {
    pub value: T,
    pub advisories: Vec<Advisory>,
}

impl<T> Outcome<T> {
    pub fn clean(value: T) -> Self {
        Self {
            value,
            advisories: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.advisories.is_empty()
    }

    pub(crate) fn advise(&mut self, step: &'static str, error: MounterError) {
        self.advisories.push(Advisory { step, error });
    }

    /// Move advisories from another outcome into this one.
    pub(crate) fn absorb<U>(&mut self, other: Outcome<U>) -> U {
        self.advisories.extend(other.advisories);
        other.value
    }
}
