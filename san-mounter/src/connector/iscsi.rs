use std::sync::Arc;
use std::time::Duration;

use super::{Initiator, LinuxScsi};
use crate::error::Result;
use crate::exec::Executor;
use crate::types::Outcome;

/// iSCSI initiator.
///
/// iSCSI sessions are rescanned host-wide through `iscsiadm` by the device
/// primitives, so there are no adapters to enumerate or scan here.
pub struct IscsiInitiator {
    linux: LinuxScsi,
}

impl IscsiInitiator {
    pub fn new(exec: Arc<dyn Executor>, timeout: Duration) -> Self {
        Self {
            linux: LinuxScsi::new(exec, timeout),
        }
    }
}

impl Initiator for IscsiInitiator {
    fn get_hbas(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn rescan_hosts(&self, _hbas: &[String], _lun: Option<u32>) -> Outcome<()> {
        Outcome::clean(())
    }

    fn remove_scsi_device(&self, device: &str) -> Result<()> {
        self.linux.remove_scsi_device(device)
    }

    fn flush_multipath(&self, dm_name: &str) -> Result<()> {
        self.linux.flush_multipath(dm_name)
    }
}
