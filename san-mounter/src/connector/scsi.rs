use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use super::{FibreChannelInitiator, Initiator, IscsiInitiator, VolumeMountProperties};
use crate::block_device::BlockDeviceUtils;
use crate::error::{MounterError, Result};
use crate::exec::Executor;
use crate::multipath;
use crate::types::{Outcome, Protocol};

/// Connect and disconnect flows shared by Fibre Channel and iSCSI.
pub struct ScsiConnector {
    initiator: Box<dyn Initiator>,
    devices: BlockDeviceUtils,
}

impl ScsiConnector {
    pub fn new(initiator: Box<dyn Initiator>, devices: BlockDeviceUtils) -> Self {
        Self { initiator, devices }
    }

    /// Build the connector for a protocol.
    pub fn for_protocol(protocol: Protocol, exec: Arc<dyn Executor>, timeout: Duration) -> Self {
        let initiator: Box<dyn Initiator> = match protocol {
            Protocol::Fc => Box::new(FibreChannelInitiator::new(exec.clone(), timeout)),
            Protocol::Iscsi => Box::new(IscsiInitiator::new(exec.clone(), timeout)),
        };
        Self::new(initiator, BlockDeviceUtils::new(exec, timeout))
    }

    /// Make the volume's LUN visible by rescanning every usable adapter.
    /// A host without adapters has nothing to rescan.
    #[instrument(skip(self), fields(wwn = %volume.wwn))]
    pub fn connect_volume(&self, volume: &VolumeMountProperties) -> Result<Outcome<()>> {
        let hbas = self.initiator.get_hbas()?;
        if hbas.is_empty() {
            info!("No host bus adapters to rescan");
            return Ok(Outcome::clean(()));
        }
        let outcome = self.initiator.rescan_hosts(&hbas, volume.lun);
        info!(hbas = ?hbas, lun = ?volume.lun, "Host bus adapters rescanned");
        Ok(outcome)
    }

    /// Flush the multipath map, delete every raw device behind it, then
    /// flush once more. Either flush failing alone is an advisory; the call
    /// fails only when both do.
    #[instrument(skip(self), fields(wwn = %volume.wwn))]
    pub fn disconnect_volume(&self, volume: &VolumeMountProperties) -> Result<Outcome<()>> {
        let (dm_name, devices) = match &volume.dm_name {
            Some(name) if !volume.devices.is_empty() => (name.clone(), volume.devices.clone()),
            _ => self.resolve(&volume.wwn)?,
        };

        // A map held by paths can refuse the first flush; the raw devices
        // are removed regardless and the second flush decides.
        let first_flush = self.initiator.flush_multipath(&dm_name);
        if let Err(e) = &first_flush {
            warn!(device = %dm_name, error = %e, "Multipath flush failed, removing paths first");
        }
        for device in &devices {
            self.initiator.remove_scsi_device(device)?;
        }

        let mut outcome = Outcome::clean(());
        match (first_flush, self.initiator.flush_multipath(&dm_name)) {
            (Err(first), Ok(())) => outcome.advise("flush-multipath", first),
            (Ok(()), Err(second)) => {
                warn!(device = %dm_name, error = %second, "Second multipath flush failed");
                outcome.advise("flush-multipath", second);
            }
            (Err(_), Err(second)) => return Err(second),
            (Ok(()), Ok(())) => {}
        }
        info!(device = %dm_name, removed = ?devices, "Volume disconnected");
        Ok(outcome)
    }

    fn resolve(&self, wwn: &str) -> Result<(String, Vec<String>)> {
        let report = self.devices.multipath_report()?;
        let dm_name = multipath::find_device_mapper_name(&report, wwn)
            .ok_or_else(|| MounterError::DeviceNotFound(wwn.to_string()))?;
        let section = multipath::locate_device_section(&report, &dm_name)?;
        Ok((dm_name, multipath::path_devices(&section)))
    }
}
