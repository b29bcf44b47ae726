use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{Initiator, LinuxScsi};
use crate::error::Result;
use crate::exec::Executor;
use crate::types::Outcome;

/// Tool listing sysfs class devices with their attributes.
pub const SYSTOOL: &str = "systool";
/// Fibre Channel host adapters known to the kernel.
pub const FC_HOST_DIR: &str = "/sys/class/fc_host";

const ONLINE_PORT_STATE: &str = "Online";

fn quoted_value(line: &str) -> Option<&str> {
    let (_, value) = line.split_once('=')?;
    Some(value.trim().trim_matches('"'))
}

/// Parse `systool -c fc_host -v` output and return the adapters whose port
/// state is `Online`.
pub fn parse_online_hbas(output: &str) -> Vec<String> {
    let mut hbas = Vec::new();
    let mut current: Option<&str> = None;

    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("Class Device")
            && rest.trim_start().starts_with('=')
        {
            current = quoted_value(trimmed);
        } else if let Some(rest) = trimmed.strip_prefix("port_state")
            && rest.trim_start().starts_with('=')
            && quoted_value(trimmed) == Some(ONLINE_PORT_STATE)
            && let Some(hba) = current.take()
        {
            hbas.push(hba.to_string());
        }
    }

    hbas
}

/// Fibre Channel initiator.
pub struct FibreChannelInitiator {
    linux: LinuxScsi,
}

impl FibreChannelInitiator {
    pub fn new(exec: Arc<dyn Executor>, timeout: Duration) -> Self {
        Self {
            linux: LinuxScsi::new(exec, timeout),
        }
    }

    fn hbas_from_systool(&self) -> Option<Vec<String>> {
        let exec = self.linux.exec();
        if !exec.is_executable(SYSTOOL) {
            debug!("systool not installed");
            return None;
        }
        match exec.execute_with_timeout(self.linux.timeout(), SYSTOOL, &["-c", "fc_host", "-v"]) {
            Ok(output) if output.success() => Some(parse_online_hbas(&output.stdout)),
            Ok(output) => {
                warn!(status = %output.explain_exit(), stderr = %output.stderr, "systool failed");
                None
            }
            Err(e) => {
                warn!(error = %e, "Failed to run systool");
                None
            }
        }
    }
}

impl Initiator for FibreChannelInitiator {
    /// Online adapters according to `systool`, or every adapter under
    /// `/sys/class/fc_host` when `systool` is unusable.
    fn get_hbas(&self) -> Result<Vec<String>> {
        if let Some(hbas) = self.hbas_from_systool() {
            info!(hbas = ?hbas, "Found online Fibre Channel adapters");
            return Ok(hbas);
        }

        let fc_hosts = Path::new(FC_HOST_DIR);
        if !self.linux.exec().path_exists(fc_hosts) {
            debug!("No Fibre Channel adapters on this host");
            return Ok(Vec::new());
        }
        let hbas = self.linux.exec().list_dir(fc_hosts)?;
        info!(hbas = ?hbas, "Found Fibre Channel adapters in sysfs (port state unknown)");
        Ok(hbas)
    }

    fn rescan_hosts(&self, hbas: &[String], lun: Option<u32>) -> Outcome<()> {
        self.linux.rescan_hosts(hbas, lun)
    }

    fn remove_scsi_device(&self, device: &str) -> Result<()> {
        self.linux.remove_scsi_device(device)
    }

    fn flush_multipath(&self, dm_name: &str) -> Result<()> {
        self.linux.flush_multipath(dm_name)
    }
}
