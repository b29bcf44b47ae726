//! Volume mount orchestrator
//!
//! Sequences attach (rescan, discover, prepare mount point, mount) and
//! detach (discover, unmount and flush, remove mount point) for one volume.
//! Discovery always runs right before the device is used: multipath state
//! can change between calls (failover, LUN remap) and a cached mapping could
//! point at a stale device.
//!
//! The orchestrator holds no locks. Callers serialize operations on the same
//! WWN (see [`crate::locking::NamedLocks`]).

use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use crate::block_device::{BlockDeviceUtils, DiscoveredDevice};
use crate::config::{MounterConfig, validate_fs_type, validate_path};
use crate::connector::{ScsiConnector, VolumeMountProperties};
use crate::error::{AttachError, DetachError, MounterError, Result};
use crate::exec::Executor;
use crate::metrics::{self, OperationTimer};
use crate::mounter::BlockDeviceMounter;
use crate::types::{
    AttachState, DetachState, FaultyPathPolicy, Outcome, Protocol, VolumeConfig, Wwn,
};

pub struct ScbeMounter {
    exec: Arc<dyn Executor>,
    config: MounterConfig,
    devices: Arc<BlockDeviceUtils>,
    mounter: BlockDeviceMounter,
    connector: ScsiConnector,
}

impl ScbeMounter {
    pub fn new(exec: Arc<dyn Executor>, config: MounterConfig) -> Self {
        let devices = Arc::new(BlockDeviceUtils::new(
            exec.clone(),
            config.multipath_timeout(),
        ));
        let mounter = BlockDeviceMounter::new(devices.clone());
        let connector =
            ScsiConnector::for_protocol(config.protocol, exec.clone(), config.hba_timeout());
        Self {
            exec,
            config,
            devices,
            mounter,
            connector,
        }
    }

    pub fn config(&self) -> &MounterConfig {
        &self.config
    }

    /// Attach and mount a volume, returning its mount point.
    #[instrument(skip(self, volume), fields(wwn = %volume.wwn))]
    pub fn mount(&self, volume: &VolumeConfig) -> std::result::Result<Outcome<String>, AttachError> {
        let timer = OperationTimer::new("attach");
        match self.attach(volume) {
            Ok(outcome) => {
                timer.success();
                metrics::record_advisories("attach", &outcome.advisories);
                info!(mount_point = %outcome.value, advisories = outcome.advisories.len(), "Volume attached");
                Ok(outcome)
            }
            Err(e) => {
                timer.failure(e.source.kind());
                error!(state = %e.reached, error = %e, "Volume attach failed");
                Err(e)
            }
        }
    }

    fn attach(&self, volume: &VolumeConfig) -> std::result::Result<Outcome<String>, AttachError> {
        let mut state = AttachState::Unattached;
        let fail = |state: AttachState| move |e: MounterError| AttachError::new(state, e);

        let fs_type = validate_fs_type(
            volume
                .fs_type
                .as_deref()
                .unwrap_or(&self.config.default_fs_type),
        )
        .map_err(fail(state))?;
        let mount_point = self.config.mount_point(volume.wwn.as_str());
        let mount_point = mount_point.to_string_lossy().into_owned();
        validate_path(&mount_point).map_err(fail(state))?;

        let mut outcome = Outcome::clean(());

        state = AttachState::Discovering;
        if self.config.protocol == Protocol::Fc && volume.lun.is_some() {
            let props = VolumeMountProperties {
                wwn: volume.wwn.to_string(),
                lun: volume.lun,
                ..Default::default()
            };
            let connected = self.connector.connect_volume(&props).map_err(fail(state))?;
            outcome.absorb(connected);
        }
        let rescanned = self.mounter.rescan_all(true).map_err(fail(state))?;
        outcome.absorb(rescanned);

        let device = self
            .devices
            .discover_device(volume.wwn.as_str())
            .map_err(fail(state))?;
        state = AttachState::Discovered;

        if device.health.is_faulty() {
            let faulty = MounterError::FaultyDevice {
                wwn: volume.wwn.to_string(),
                device: device.path.clone(),
            };
            match self.config.faulty_path_policy {
                FaultyPathPolicy::Block => return Err(AttachError::new(state, faulty)),
                FaultyPathPolicy::Warn => {
                    warn!(device = %device.path, "Multipath device has no active path, mounting anyway");
                    outcome.advise("path-health", faulty);
                }
            }
        }

        let mounted_at = self
            .devices
            .mount_points(&device.path)
            .map_err(fail(state))?;
        if mounted_at.iter().any(|mp| *mp == mount_point) {
            info!(device = %device.path, mount_point = %mount_point, "Device already mounted");
            return Ok(Outcome {
                value: mount_point,
                advisories: outcome.advisories,
            });
        }
        if let Some(actual) = mounted_at.into_iter().next() {
            return Err(AttachError::new(
                state,
                MounterError::AlreadyMountedToWrongMountpoint {
                    device: device.path,
                    expected: mount_point,
                    actual,
                },
            ));
        }

        self.ensure_mount_point(&mount_point).map_err(fail(state))?;
        self.mounter
            .mount_device_flow(&device.path, &fs_type, &mount_point)?;

        Ok(Outcome {
            value: mount_point,
            advisories: outcome.advisories,
        })
    }

    fn ensure_mount_point(&self, mount_point: &str) -> Result<()> {
        let path = Path::new(mount_point);
        if self.exec.path_exists(path) {
            return Ok(());
        }
        info!(mount_point = %mount_point, "Creating mount point");
        self.exec
            .create_dir_all(path, self.config.mount_dir_mode)?;
        Ok(())
    }

    /// Unmount a volume, flush its multipath device and remove its mount point.
    #[instrument(skip(self))]
    pub fn unmount(&self, wwn: &Wwn) -> std::result::Result<(), DetachError> {
        let timer = OperationTimer::new("detach");
        match self.detach(wwn) {
            Ok(()) => {
                timer.success();
                info!("Volume detached");
                Ok(())
            }
            Err(e) => {
                timer.failure(e.source.kind());
                error!(state = %e.reached, error = %e, "Volume detach failed");
                Err(e)
            }
        }
    }

    fn detach(&self, wwn: &Wwn) -> std::result::Result<(), DetachError> {
        let device = self
            .devices
            .discover(wwn.as_str())
            .map_err(|e| DetachError::new(DetachState::Mounted, e))?;

        let mount_point = self.config.mount_point(wwn.as_str());
        let mount_point_str = mount_point.to_string_lossy();
        self.mounter
            .unmount_device_flow(&device, &mount_point_str)?;

        if self.exec.path_exists(&mount_point) {
            self.exec
                .remove_dir(&mount_point)
                .map_err(|e| DetachError::new(DetachState::Cleaned, e.into()))?;
            info!(mount_point = %mount_point_str, "Mount point removed");
        }
        Ok(())
    }

    /// Host-wide rescan run after a volume was detached, regardless of the
    /// detach result.
    #[instrument(skip(self))]
    pub fn action_after_detach(&self) -> Result<Outcome<()>> {
        self.mounter.rescan_all(true)
    }

    /// Operator-triggered host rescan.
    #[instrument(skip(self))]
    pub fn rescan(&self, with_iscsi: bool) -> Result<Outcome<()>> {
        self.mounter.rescan_all(with_iscsi)
    }

    /// Delete the raw SCSI devices of a detached volume.
    #[instrument(skip(self))]
    pub fn remove_volume_devices(&self, wwn: &Wwn) -> Result<Outcome<()>> {
        let props = VolumeMountProperties {
            wwn: wwn.to_string(),
            ..Default::default()
        };
        self.connector.disconnect_volume(&props)
    }

    /// Resolve a volume and classify its path health.
    #[instrument(skip(self))]
    pub fn check_health(&self, wwn: &Wwn) -> Result<DiscoveredDevice> {
        let device = self.devices.discover_device(wwn.as_str())?;
        metrics::set_device_faulty(wwn.as_str(), device.health.is_faulty());
        if device.health.is_faulty() {
            warn!(device = %device.path, "Multipath device has no active path");
        }
        Ok(device)
    }
}
