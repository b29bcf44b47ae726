//! Device mounter flows
//!
//! Compose the device primitives into the idempotent mount and unmount
//! sequences and the host-wide rescan.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::block_device::BlockDeviceUtils;
use crate::error::{AttachError, DetachError, MounterError, Result};
use crate::types::{AttachState, DetachState, Outcome, RescanProtocol};

pub struct BlockDeviceMounter {
    devices: Arc<BlockDeviceUtils>,
}

impl BlockDeviceMounter {
    pub fn new(devices: Arc<BlockDeviceUtils>) -> Self {
        Self { devices }
    }

    /// Create a filesystem if the device has none, then mount it.
    ///
    /// Expects a discovered device; the error carries the state reached.
    #[instrument(skip(self))]
    pub fn mount_device_flow(
        &self,
        device_path: &str,
        fs_type: &str,
        mount_point: &str,
    ) -> std::result::Result<(), AttachError> {
        let needs_fs = self
            .devices
            .check_fs(device_path)
            .map_err(|e| AttachError::new(AttachState::Discovered, e))?;

        if needs_fs {
            self.devices
                .make_fs(device_path, fs_type)
                .map_err(|e| AttachError::new(AttachState::FilesystemChecked, e))?;
        } else {
            info!(device = %device_path, "Device already has a filesystem");
        }

        self.devices
            .mount_fs(device_path, mount_point)
            .map_err(|e| AttachError::new(AttachState::FilesystemChecked, e))?;
        Ok(())
    }

    /// Unmount, then flush the multipath device. Cleanup is skipped when the
    /// unmount fails since flushing a mounted device is unsafe.
    ///
    /// A device that is no longer mounted goes straight to cleanup, so a
    /// detach interrupted after its unmount can be retried.
    #[instrument(skip(self))]
    pub fn unmount_device_flow(
        &self,
        device_path: &str,
        mount_point: &str,
    ) -> std::result::Result<(), DetachError> {
        let discovered = |e: MounterError| DetachError::new(DetachState::Discovered, e);
        let mounted_at = self.devices.mount_points(device_path).map_err(discovered)?;

        if mounted_at.iter().any(|mp| mp == mount_point) {
            self.devices.unmount_fs(mount_point).map_err(discovered)?;
        } else if let Some(actual) = mounted_at.into_iter().next() {
            return Err(discovered(MounterError::AlreadyMountedToWrongMountpoint {
                device: device_path.to_string(),
                expected: mount_point.to_string(),
                actual,
            }));
        } else {
            info!(device = %device_path, mount_point = %mount_point, "Device not mounted, skipping unmount");
        }

        self.devices
            .cleanup(device_path)
            .map_err(|e| DetachError::new(DetachState::Unmounted, e))?;
        Ok(())
    }

    /// Rescan iSCSI (optionally), then SCSI, then reload multipath.
    ///
    /// New raw devices only exist after the bus rescans, and multipathd
    /// only picks them up on the reload that follows. Rescans are
    /// host-wide: devices of unrelated volumes may appear too.
    #[instrument(skip(self))]
    pub fn rescan_all(&self, with_iscsi: bool) -> Result<Outcome<()>> {
        let mut outcome = Outcome::clean(());
        if with_iscsi {
            let iscsi = self.devices.rescan(RescanProtocol::Iscsi)?;
            outcome.absorb(iscsi);
        }
        let scsi = self.devices.rescan(RescanProtocol::Scsi)?;
        outcome.absorb(scsi);
        self.devices.reload_multipath()?;
        Ok(outcome)
    }
}
