//! Initiator and connector layer
//!
//! Protocol-specific bus operations (HBA enumeration, scoped SCSI rescans,
//! SCSI device removal, multipath flush) behind the [`Initiator`] trait, and
//! the protocol-agnostic [`ScsiConnector`] that composes them into connect
//! and disconnect flows.

mod fibre_channel;
mod iscsi;
mod scsi;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::block_device::MULTIPATH;
use crate::error::{MounterError, Result};
use crate::exec::Executor;
use crate::types::Outcome;

pub use fibre_channel::{FC_HOST_DIR, FibreChannelInitiator, SYSTOOL, parse_online_hbas};
pub use iscsi::IscsiInitiator;
pub use scsi::ScsiConnector;

/// Directory holding per-adapter SCSI host control files.
pub const SCSI_HOST_DIR: &str = "/sys/class/scsi_host";
/// Directory holding block devices known to the kernel.
pub const SYS_BLOCK_DIR: &str = "/sys/block";

/// Identity of a volume as seen by the connector.
///
/// `dm_name` and `devices` may be pre-resolved by the caller; when absent the
/// connector discovers them from the multipath report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeMountProperties {
    pub wwn: String,
    pub lun: Option<u32>,
    pub dm_name: Option<String>,
    pub devices: Vec<String>,
}

/// Bus operations of one SAN protocol.
pub trait Initiator: Send + Sync {
    /// Host bus adapters usable for rescans.
    fn get_hbas(&self) -> Result<Vec<String>>;

    /// Ask each adapter to rescan, optionally scoped to one LUN. Failures on
    /// individual adapters are advisories.
    fn rescan_hosts(&self, hbas: &[String], lun: Option<u32>) -> Outcome<()>;

    /// Delete a raw SCSI device node through sysfs.
    fn remove_scsi_device(&self, device: &str) -> Result<()>;

    /// Flush the multipath map of a device-mapper name.
    fn flush_multipath(&self, dm_name: &str) -> Result<()>;
}

/// sysfs and multipath operations shared by every initiator.
pub(crate) struct LinuxScsi {
    exec: Arc<dyn Executor>,
    timeout: Duration,
}

impl LinuxScsi {
    pub(crate) fn new(exec: Arc<dyn Executor>, timeout: Duration) -> Self {
        Self { exec, timeout }
    }

    pub(crate) fn exec(&self) -> &Arc<dyn Executor> {
        &self.exec
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Scan directive written to an adapter's `scan` file.
    pub(crate) fn scan_directive(lun: Option<u32>) -> String {
        match lun {
            Some(lun) => format!("- - {}", lun),
            None => "- - -".to_string(),
        }
    }

    pub(crate) fn rescan_hosts(&self, hbas: &[String], lun: Option<u32>) -> Outcome<()> {
        let directive = Self::scan_directive(lun);
        let mut outcome = Outcome::clean(());
        for hba in hbas {
            let scan = PathBuf::from(SCSI_HOST_DIR).join(hba).join("scan");
            debug!(hba = %hba, path = %scan.display(), directive = %directive, "Scanning host");
            if let Err(e) = self.exec.write_file(&scan, &directive) {
                warn!(hba = %hba, error = %e, "Failed to rescan host adapter, continuing");
                outcome.advise("rescan-host", MounterError::Io(e));
            }
        }
        outcome
    }

    #[instrument(skip(self))]
    pub(crate) fn remove_scsi_device(&self, device: &str) -> Result<()> {
        if device.is_empty() || device.contains('/') || device.contains("..") {
            return Err(MounterError::WrongPathStructure(device.to_string()));
        }
        let delete = PathBuf::from(SYS_BLOCK_DIR)
            .join(device)
            .join("device")
            .join("delete");
        if !self.exec.path_exists(&delete) {
            debug!(device = %device, "SCSI device already removed");
            return Ok(());
        }
        self.exec.write_file(&delete, "1")?;
        info!(device = %device, "SCSI device removed");
        Ok(())
    }

    #[instrument(skip(self))]
    pub(crate) fn flush_multipath(&self, dm_name: &str) -> Result<()> {
        if !self.exec.is_executable(MULTIPATH) {
            return Err(MounterError::ToolNotFound(MULTIPATH.to_string()));
        }
        self.exec
            .execute_with_timeout(self.timeout, MULTIPATH, &["-f", dm_name])?
            .check(MULTIPATH)?;
        info!(device = %dm_name, "Multipath map flushed");
        Ok(())
    }
}
