//! Device primitives
//!
//! Single-purpose operations over the [`Executor`]: bus rescans, multipath
//! reload/flush, WWN discovery, filesystem probe/creation, mount and
//! unmount. Each one checks that its tool is installed before running it so
//! a missing tool (`ToolNotFound`) is reported differently from a tool that
//! ran and failed (`CommandFailed`).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::error::{MounterError, Result};
use crate::exec::{CommandOutput, Executor};
use crate::multipath::{self, PathHealth};
use crate::types::{Outcome, RescanProtocol};

/// Names under which distributions ship the SCSI rescan script.
pub const SCSI_RESCAN_TOOLS: [&str; 2] = ["rescan-scsi-bus", "rescan-scsi-bus.sh"];
pub const ISCSIADM: &str = "iscsiadm";
pub const MULTIPATH: &str = "multipath";
pub const DMSETUP: &str = "dmsetup";
pub const BLKID: &str = "blkid";
pub const MKFS: &str = "mkfs";
pub const MOUNT: &str = "mount";
pub const UMOUNT: &str = "umount";
pub const SG_INQ: &str = "sg_inq";

/// Directory holding multipath device nodes.
pub const DEVICE_MAPPER_DIR: &str = "/dev/mapper";

/// `blkid` exit status meaning "no recognized filesystem".
const BLKID_NO_FILESYSTEM: i32 = 2;

/// A multipath device resolved from a WWN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Device-mapper name, e.g. `mpathg`
    pub dm_name: String,
    /// `/dev/mapper/<dm_name>`
    pub path: String,
    /// Raw block devices backing the multipath device, e.g. `sdb`
    pub devices: Vec<String>,
    pub health: PathHealth,
}

/// Build `/dev/mapper/<name>`.
pub fn mapper_path(dm_name: &str) -> String {
    format!("{}/{}", DEVICE_MAPPER_DIR, dm_name)
}

/// Extract the device-mapper name from a `/dev/mapper/<name>` path.
pub fn dm_name_from_path(device_path: &str) -> Result<&str> {
    device_path
        .strip_prefix(DEVICE_MAPPER_DIR)
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|name| !name.is_empty() && !name.contains('/') && *name != "..")
        .ok_or_else(|| MounterError::WrongPathStructure(device_path.to_string()))
}

/// Parse `mount` output (`<source> on <target> type <fs> (<opts>)`) and
/// return the targets where `device` is mounted.
pub fn parse_mount_points(mount_output: &str, device: &str) -> Vec<String> {
    mount_output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            if fields.next()? != "on" {
                return None;
            }
            let target = fields.next()?;
            (source == device).then(|| target.to_string())
        })
        .collect()
}

/// Host device operations.
pub struct BlockDeviceUtils {
    exec: Arc<dyn Executor>,
    multipath_timeout: Duration,
}

impl BlockDeviceUtils {
    pub fn new(exec: Arc<dyn Executor>, multipath_timeout: Duration) -> Self {
        Self {
            exec,
            multipath_timeout,
        }
    }

    fn require_tool(&self, tool: &str) -> Result<()> {
        if self.exec.is_executable(tool) {
            Ok(())
        } else {
            warn!(tool = %tool, "Required command is not installed");
            Err(MounterError::ToolNotFound(tool.to_string()))
        }
    }

    fn run_checked(&self, tool: &str, args: &[&str]) -> Result<String> {
        self.require_tool(tool)?;
        self.exec.execute(tool, args)?.check(tool)
    }

    fn run_multipath(&self, args: &[&str]) -> Result<CommandOutput> {
        self.require_tool(MULTIPATH)?;
        self.exec
            .execute_with_timeout(self.multipath_timeout, MULTIPATH, args)
    }

    /// Trigger a bus rescan.
    ///
    /// An iSCSI rescan on a host without `iscsiadm` is not applicable and is
    /// reported as an advisory rather than an error.
    #[instrument(skip(self))]
    pub fn rescan(&self, protocol: RescanProtocol) -> Result<Outcome<()>> {
        match protocol {
            RescanProtocol::Iscsi => {
                if !self.exec.is_executable(ISCSIADM) {
                    info!("iscsiadm not installed, skipping iSCSI rescan");
                    let mut outcome = Outcome::clean(());
                    outcome.advise(
                        "rescan-iscsi",
                        MounterError::ToolNotFound(ISCSIADM.to_string()),
                    );
                    return Ok(outcome);
                }
                self.exec
                    .execute(ISCSIADM, &["-m", "session", "--rescan"])?
                    .check(ISCSIADM)?;
                info!("iSCSI sessions rescanned");
            }
            RescanProtocol::Scsi => {
                let tool = SCSI_RESCAN_TOOLS
                    .iter()
                    .find(|tool| self.exec.is_executable(tool))
                    .ok_or_else(|| {
                        warn!(candidates = ?SCSI_RESCAN_TOOLS, "No SCSI rescan script installed");
                        MounterError::ToolNotFound(SCSI_RESCAN_TOOLS[0].to_string())
                    })?;
                self.exec.execute(tool, &["-r"])?.check(tool)?;
                info!(tool = %tool, "SCSI bus rescanned");
            }
        }
        Ok(Outcome::clean(()))
    }

    /// Ask multipathd to re-evaluate its device tables.
    #[instrument(skip(self))]
    pub fn reload_multipath(&self) -> Result<()> {
        self.run_multipath(&["-r"])?.check(MULTIPATH)?;
        debug!("Multipath tables reloaded");
        Ok(())
    }

    /// Capture the current `multipath -ll` report.
    pub fn multipath_report(&self) -> Result<String> {
        self.run_multipath(&["-ll"])?.check(MULTIPATH)
    }

    /// Resolve a WWN to its `/dev/mapper/<name>` path.
    #[instrument(skip(self))]
    pub fn discover(&self, wwn: &str) -> Result<String> {
        Ok(self.discover_device(wwn)?.path)
    }

    /// Resolve a WWN to its multipath device, raw paths and path health,
    /// all from a single multipath report.
    #[instrument(skip(self))]
    pub fn discover_device(&self, wwn: &str) -> Result<DiscoveredDevice> {
        let report = self.multipath_report()?;

        let dm_name = match multipath::find_device_mapper_name(&report, wwn) {
            Some(name) => name,
            None => self.discover_by_inquiry(&report, wwn)?.ok_or_else(|| {
                info!(wwn = %wwn, "WWN not present in multipath report");
                MounterError::DeviceNotFound(wwn.to_string())
            })?,
        };

        let path = mapper_path(&dm_name);
        if !self.exec.path_exists(Path::new(&path)) {
            warn!(wwn = %wwn, device = %path, "Multipath device listed but missing on disk");
            return Err(MounterError::DeviceNotFound(wwn.to_string()));
        }

        let (devices, health) = match multipath::locate_device_section(&report, &dm_name) {
            Ok(section) => (
                multipath::path_devices(&section),
                multipath::classify_health(&section),
            ),
            Err(e) => {
                debug!(device = %dm_name, error = %e, "No device block in multipath report");
                (Vec::new(), PathHealth::Faulty)
            }
        };

        info!(wwn = %wwn, device = %path, paths = ?devices, health = ?health, "Discovered multipath device");
        Ok(DiscoveredDevice {
            dm_name,
            path,
            devices,
            health,
        })
    }

    /// Fallback discovery: query the device identification VPD page of each
    /// listed multipath device and look for the WWN there.
    fn discover_by_inquiry(&self, report: &str, wwn: &str) -> Result<Option<String>> {
        if !self.exec.is_executable(SG_INQ) {
            debug!("sg_inq not installed, skipping inquiry based discovery");
            return Ok(None);
        }
        let needle = wwn.to_lowercase();
        for name in multipath::device_mapper_names(report) {
            let path = mapper_path(&name);
            let output = match self.exec.execute_with_timeout(
                self.multipath_timeout,
                SG_INQ,
                &["-p", "0x83", &path],
            ) {
                Ok(output) => output,
                Err(e) => {
                    debug!(device = %path, error = %e, "sg_inq did not complete");
                    continue;
                }
            };
            if !output.success() {
                debug!(device = %path, status = %output.explain_exit(), "sg_inq failed");
                continue;
            }
            if output.stdout.to_lowercase().contains(&needle) {
                info!(wwn = %wwn, device = %name, "WWN found by SCSI inquiry");
                return Ok(Some(name));
            }
        }
        Ok(None)
    }

    /// Flush the multipath state of a device that is no longer mounted.
    #[instrument(skip(self))]
    pub fn cleanup(&self, device_path: &str) -> Result<()> {
        let dm_name = dm_name_from_path(device_path)?;

        self.require_tool(DMSETUP)?;
        let output = self
            .exec
            .execute(DMSETUP, &["message", dm_name, "0", "fail_if_no_path"])?;
        if !output.success() {
            let gone = output.stderr.contains("No such device")
                || output.stderr.contains("not found");
            if gone {
                debug!(device = %dm_name, "Device-mapper target already removed");
            } else {
                output.check(DMSETUP)?;
            }
        }

        self.run_multipath(&["-f", dm_name])?.check(MULTIPATH)?;
        info!(device = %device_path, "Multipath device flushed");
        Ok(())
    }

    /// Whether `device_path` needs a filesystem.
    ///
    /// `blkid` exits with status 2 when it finds nothing to report; that is
    /// the "needs a filesystem" answer, not a failure.
    #[instrument(skip(self))]
    pub fn check_fs(&self, device_path: &str) -> Result<bool> {
        self.require_tool(BLKID)?;
        let output = self.exec.execute(BLKID, &[device_path])?;
        match output.code {
            Some(0) => Ok(false),
            Some(BLKID_NO_FILESYSTEM) => {
                info!(device = %device_path, "No filesystem found on device");
                Ok(true)
            }
            _ => output.check(BLKID).map(|_| false),
        }
    }

    #[instrument(skip(self))]
    pub fn make_fs(&self, device_path: &str, fs_type: &str) -> Result<()> {
        info!(device = %device_path, fs_type = %fs_type, "Creating filesystem");
        self.run_checked(MKFS, &["-t", fs_type, device_path])?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn mount_fs(&self, device_path: &str, mount_point: &str) -> Result<()> {
        info!(device = %device_path, mount_point = %mount_point, "Mounting device");
        self.run_checked(MOUNT, &[device_path, mount_point])?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn unmount_fs(&self, mount_point: &str) -> Result<()> {
        info!(mount_point = %mount_point, "Unmounting");
        self.run_checked(UMOUNT, &[mount_point])?;
        Ok(())
    }

    /// Mount points where `device_path` is currently mounted.
    #[instrument(skip(self))]
    pub fn mount_points(&self, device_path: &str) -> Result<Vec<String>> {
        let output = self.run_checked(MOUNT, &[])?;
        Ok(parse_mount_points(&output, device_path))
    }
}
