//! Integration tests for san-mounter
//!
//! These tests drive the public orchestrator API against a scripted host so
//! that the command sequences can be verified without root privileges,
//! multipathd or real SAN hardware.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use san_mounter::types::{AttachState, DetachState, FaultyPathPolicy};
use san_mounter::{
    BlockDeviceUtils, CommandOutput, Executor, MounterConfig, MounterError, NamedLocks,
    PathHealth, ScbeMounter, VolumeConfig, Wwn,
};

const WWN: &str = "6005076306ffd69d0000000000001004";
const MOUNT_POINT: &str = "/ubiquity/6005076306ffd69d0000000000001004";

const HEALTHY_REPORT: &str = "\
mpathf (36005076306ffd69d0000000000001003) dm-2 IBM     ,2107900
size=2.0G features='1 queue_if_no_path' hwhandler='0' wp=rw
`-+- policy='service-time 0' prio=1 status=active
  |- 33:0:0:0 sde 8:64 active ready running
  `- 34:0:0:0 sdf 8:80 failed faulty offline
mpathg (36005076306ffd69d0000000000001004) dm-3 IBM     ,2107900
size=1.0G features='1 queue_if_no_path' hwhandler='0' wp=rw
`-+- policy='service-time 0' prio=1 status=active
  |- 33:0:0:1 sdb 8:16 active ready running
  `- 34:0:0:1 sdc 8:32 active ready running
";

const FAULTY_REPORT: &str = "\
mpathg (36005076306ffd69d0000000000001004) dm-3 IBM     ,2107900
size=1.0G features='1 queue_if_no_path' hwhandler='0' wp=rw
`-+- policy='service-time 0' prio=0 status=enabled
  |- 33:0:0:1 sdb 8:16 failed faulty running
  `- 34:0:0:1 sdc 8:32 failed faulty running
";

// ============================================================================
// Scripted host
// ============================================================================

/// Host double: scripted command results, an in-memory set of existing
/// paths and a log of everything executed.
#[derive(Default)]
struct ScriptedHost {
    responses: HashMap<String, CommandOutput>,
    missing: HashSet<String>,
    paths: Mutex<HashSet<PathBuf>>,
    log: Mutex<Vec<String>>,
}

impl ScriptedHost {
    fn new() -> Self {
        Self::default()
    }

    fn respond(mut self, line: &str, code: i32, stdout: &str, stderr: &str) -> Self {
        self.responses.insert(
            line.to_string(),
            CommandOutput {
                code: Some(code),
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        );
        self
    }

    fn missing(mut self, tool: &str) -> Self {
        self.missing.insert(tool.to_string());
        self
    }

    fn path(self, path: &str) -> Self {
        self.paths.lock().unwrap().insert(PathBuf::from(path));
        self
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.log().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

impl Executor for ScriptedHost {
    fn execute(&self, command: &str, args: &[&str]) -> san_mounter::Result<CommandOutput> {
        if self.missing.contains(command) {
            return Err(MounterError::ToolNotFound(command.to_string()));
        }
        let line = std::iter::once(command)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        self.record(line.clone());
        Ok(self.responses.get(&line).cloned().unwrap_or(CommandOutput {
            code: Some(0),
            ..Default::default()
        }))
    }

    fn execute_with_timeout(
        &self,
        _timeout: Duration,
        command: &str,
        args: &[&str],
    ) -> san_mounter::Result<CommandOutput> {
        self.execute(command, args)
    }

    fn is_executable(&self, name: &str) -> bool {
        !self.missing.contains(name)
    }

    fn path_exists(&self, path: &Path) -> bool {
        self.paths.lock().unwrap().contains(path)
    }

    fn create_dir_all(&self, path: &Path, _mode: u32) -> std::io::Result<()> {
        self.record(format!("mkdir {}", path.display()));
        self.paths.lock().unwrap().insert(path.to_path_buf());
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> std::io::Result<()> {
        self.record(format!("rmdir {}", path.display()));
        self.paths.lock().unwrap().remove(path);
        Ok(())
    }

    fn write_file(&self, path: &Path, contents: &str) -> std::io::Result<()> {
        self.record(format!("write {} {}", path.display(), contents));
        Ok(())
    }

    fn list_dir(&self, _path: &Path) -> std::io::Result<Vec<String>> {
        Err(std::io::Error::from(std::io::ErrorKind::NotFound))
    }
}

fn healthy_host() -> ScriptedHost {
    ScriptedHost::new()
        .respond("multipath -ll", 0, HEALTHY_REPORT, "")
        .path("/dev/mapper/mpathf")
        .path("/dev/mapper/mpathg")
}

fn mount_table() -> String {
    format!("/dev/mapper/mpathg on {} type ext4 (rw)\n", MOUNT_POINT)
}

fn wwn() -> Wwn {
    WWN.parse().unwrap()
}

fn volume() -> VolumeConfig {
    VolumeConfig::from_json(&format!(r#"{{"Wwn": "{}"}}"#, WWN)).unwrap()
}

// ============================================================================
// Discovery
// ============================================================================

#[test]
fn test_discover_healthy_device() {
    let host = Arc::new(healthy_host());
    let devices = BlockDeviceUtils::new(host.clone(), Duration::from_secs(20));

    let device = devices.discover_device(WWN).unwrap();
    assert_eq!(device.path, "/dev/mapper/mpathg");
    assert_eq!(device.devices, vec!["sdb", "sdc"]);
    assert_eq!(device.health, PathHealth::Healthy);
}

#[test]
fn test_discover_is_repeatable() {
    let host = Arc::new(healthy_host());
    let devices = BlockDeviceUtils::new(host.clone(), Duration::from_secs(20));

    let first = devices.discover(WWN).unwrap();
    let second = devices.discover(WWN).unwrap();
    assert_eq!(first, second);
    assert_eq!(host.count("multipath -ll"), 2);
}

#[test]
fn test_discover_faulty_device() {
    let host = Arc::new(
        ScriptedHost::new()
            .respond("multipath -ll", 0, FAULTY_REPORT, "")
            .path("/dev/mapper/mpathg"),
    );
    let devices = BlockDeviceUtils::new(host.clone(), Duration::from_secs(20));
    assert_eq!(devices.discover_device(WWN).unwrap().health, PathHealth::Faulty);
}

// ============================================================================
// Attach
// ============================================================================

#[test]
fn test_attach_formats_blank_device_once() {
    let host = Arc::new(healthy_host().respond("blkid /dev/mapper/mpathg", 2, "", ""));
    let scbe = ScbeMounter::new(host.clone(), MounterConfig::default());

    let outcome = scbe.mount(&volume()).unwrap();
    assert_eq!(outcome.value, MOUNT_POINT);
    assert_eq!(host.count("mkfs"), 1);
    assert_eq!(host.count("mount /dev/mapper/mpathg"), 1);

    let log = host.log();
    let mkfs = log.iter().position(|c| c.starts_with("mkfs")).unwrap();
    let mount = log
        .iter()
        .position(|c| c.starts_with("mount /dev/mapper/mpathg"))
        .unwrap();
    assert!(mkfs < mount);
}

#[test]
fn test_attach_blocks_on_faulty_paths_by_default() {
    let host = Arc::new(
        ScriptedHost::new()
            .respond("multipath -ll", 0, FAULTY_REPORT, "")
            .path("/dev/mapper/mpathg"),
    );
    let scbe = ScbeMounter::new(host.clone(), MounterConfig::default());

    let err = scbe.mount(&volume()).unwrap_err();
    assert_eq!(err.reached, AttachState::Discovered);
    assert!(matches!(err.source, MounterError::FaultyDevice { .. }));
    assert_eq!(host.count("mount /dev"), 0);
}

#[test]
fn test_attach_warn_policy_mounts_faulty_device() {
    let host = Arc::new(
        ScriptedHost::new()
            .respond("multipath -ll", 0, FAULTY_REPORT, "")
            .path("/dev/mapper/mpathg"),
    );
    let config = MounterConfig {
        faulty_path_policy: FaultyPathPolicy::Warn,
        ..Default::default()
    };
    let outcome = ScbeMounter::new(host.clone(), config)
        .mount(&volume())
        .unwrap();
    assert!(!outcome.is_clean());
    assert_eq!(host.count("mount /dev/mapper/mpathg"), 1);
}

#[test]
fn test_attach_without_scsi_rescan_tool() {
    let host = Arc::new(
        healthy_host()
            .missing("rescan-scsi-bus")
            .missing("rescan-scsi-bus.sh"),
    );
    let scbe = ScbeMounter::new(host.clone(), MounterConfig::default());

    let err = scbe.mount(&volume()).unwrap_err();
    assert_eq!(err.reached, AttachState::Discovering);
    assert!(matches!(err.source, MounterError::ToolNotFound(_)));
    assert_eq!(host.count("multipath"), 0);
}

#[test]
fn test_attach_twice_mounts_once() {
    let host = Arc::new(healthy_host().respond("mount", 0, &mount_table(), ""));
    let scbe = ScbeMounter::new(host.clone(), MounterConfig::default());

    scbe.mount(&volume()).unwrap();
    scbe.mount(&volume()).unwrap();
    assert_eq!(host.count("mount /dev"), 0);
    assert_eq!(host.count("mkfs"), 0);
}

#[test]
fn test_concurrent_attaches_under_named_locks() {
    let host = Arc::new(healthy_host());
    let scbe = ScbeMounter::new(host.clone(), MounterConfig::default());
    let locks = NamedLocks::new();
    let volumes = [
        volume(),
        VolumeConfig::from_json(r#"{"wwn": "6005076306FFD69D0000000000001003", "fstype": "xfs"}"#)
            .unwrap(),
    ];

    thread::scope(|s| {
        for volume in &volumes {
            let scbe = &scbe;
            let locks = &locks;
            s.spawn(move || {
                locks
                    .with_write(volume.wwn.as_str(), || scbe.mount(volume))
                    .unwrap()
            });
        }
    });

    assert_eq!(host.count("mount /dev/mapper/mpathg"), 1);
    assert_eq!(host.count("mount /dev/mapper/mpathf"), 1);
    assert_eq!(locks.len(), 2);
}

// ============================================================================
// Detach
// ============================================================================

#[test]
fn test_detach_removes_mount_point() {
    let host = Arc::new(
        healthy_host()
            .path(MOUNT_POINT)
            .respond("mount", 0, &mount_table(), ""),
    );
    let scbe = ScbeMounter::new(host.clone(), MounterConfig::default());

    scbe.unmount(&wwn()).unwrap();
    let log = host.log();
    let umount = log.iter().position(|c| c.starts_with("umount")).unwrap();
    let flush = log.iter().position(|c| c == "multipath -f mpathg").unwrap();
    let rmdir = log.iter().position(|c| c.starts_with("rmdir")).unwrap();
    assert!(umount < flush && flush < rmdir);
    assert!(!host.path_exists(Path::new(MOUNT_POINT)));
}

#[test]
fn test_detach_busy_mount_skips_cleanup() {
    let host = Arc::new(
        healthy_host()
            .path(MOUNT_POINT)
            .respond("mount", 0, &mount_table(), "")
            .respond(&format!("umount {}", MOUNT_POINT), 32, "", "target is busy"),
    );
    let scbe = ScbeMounter::new(host.clone(), MounterConfig::default());

    let err = scbe.unmount(&wwn()).unwrap_err();
    assert_eq!(err.reached, DetachState::Discovered);
    assert!(err.to_string().contains("target is busy"));
    assert_eq!(host.count("dmsetup"), 0);
    assert_eq!(host.count("multipath -f"), 0);
    assert!(host.path_exists(Path::new(MOUNT_POINT)));
}

#[test]
fn test_detach_retry_after_partial_failure() {
    // First attempt unmounted, then the flush failed: device is no longer
    // in the mount table and umount would report "not mounted"
    let host = Arc::new(
        healthy_host()
            .path(MOUNT_POINT)
            .respond(
                &format!("umount {}", MOUNT_POINT),
                32,
                "",
                &format!("umount: {}: not mounted.", MOUNT_POINT),
            ),
    );
    let scbe = ScbeMounter::new(host.clone(), MounterConfig::default());

    scbe.unmount(&wwn()).unwrap();
    assert_eq!(host.count("umount"), 0);
    assert_eq!(host.count("dmsetup message mpathg"), 1);
    assert_eq!(host.count("multipath -f mpathg"), 1);
    assert!(!host.path_exists(Path::new(MOUNT_POINT)));
}

#[test]
fn test_remove_volume_devices_after_detach() {
    let host = Arc::new(
        healthy_host()
            .path("/sys/block/sdb/device/delete")
            .path("/sys/block/sdc/device/delete"),
    );
    let scbe = ScbeMounter::new(host.clone(), MounterConfig::default());

    scbe.remove_volume_devices(&wwn()).unwrap();
    let log = host.log();
    assert!(log.contains(&"write /sys/block/sdb/device/delete 1".to_string()));
    assert!(log.contains(&"write /sys/block/sdc/device/delete 1".to_string()));
    assert_eq!(log.last().map(String::as_str), Some("multipath -f mpathg"));
}

#[test]
fn test_action_after_detach_rescans_host() {
    let host = Arc::new(ScriptedHost::new());
    let scbe = ScbeMounter::new(host.clone(), MounterConfig::default());

    scbe.action_after_detach().unwrap();
    assert_eq!(
        host.log(),
        vec![
            "iscsiadm -m session --rescan",
            "rescan-scsi-bus -r",
            "multipath -r"
        ]
    );
}
