//! SAN Volume Mounter Library
//!
//! Attaches, mounts, unmounts and detaches Fibre Channel and iSCSI block
//! volumes that sit behind dm-multipath.
//!
//! This library provides:
//! - `exec`: the host command seam ([`Executor`]) and its real implementation
//! - `block_device`: device primitives (rescan, discovery, mkfs, mount)
//! - `multipath`: parsing of `multipath -ll` reports and path health
//! - `connector`: Fibre Channel / iSCSI initiators and the SCSI connector
//! - `mounter`: the mount and unmount device flows
//! - `scbe`: the per-volume attach/detach orchestrator
//! - `locking`: per-WWN read/write locks for concurrent callers
//!
//! No state is kept between calls: every operation re-discovers the device
//! from the host.

pub mod block_device;
pub mod config;
pub mod connector;
pub mod error;
pub mod exec;
pub mod locking;
pub mod metrics;
pub mod mounter;
pub mod multipath;
pub mod scbe;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use block_device::{BlockDeviceUtils, DiscoveredDevice};
pub use config::MounterConfig;
pub use error::{AttachError, DetachError, MounterError, Result};
pub use exec::{CommandOutput, Executor, SystemExecutor};
pub use locking::NamedLocks;
pub use mounter::BlockDeviceMounter;
pub use multipath::PathHealth;
pub use scbe::ScbeMounter;
pub use types::{Outcome, Protocol, VolumeConfig, Wwn};
