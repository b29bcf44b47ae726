//! Parsing of `multipath -ll` reports
//!
//! A report is a concatenation of per-device blocks:
//!
//! ```text
//! mpathg (36005076306ffd69d0000000000001004) dm-3 IBM     ,2107900
//! size=1.0G features='1 queue_if_no_path' hwhandler='0' wp=rw
//! `-+- policy='service-time 0' prio=1 status=active
//!   |- 33:0:0:1 sdb 8:16 active ready running
//!   `- 34:0:0:1 sdc 8:32 active ready running
//! ```
//!
//! Everything here is a pure function over captured text.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{MounterError, Result};

/// Marker that starts the second line of every device block.
const SIZE_MARKER: &str = "size=";

/// Path status that makes a path usable for I/O.
const ACTIVE_PATH_STATUS: &str = "active ready running";

/// `<host>:<channel>:<target>:<lun> <dev> <major>:<minor> <status...>`
static PATH_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+:\d+:\d+:\d+)\s+(\S+)\s+(\d+:\d+)\s+(.*\S)")
        .expect("Invalid path line pattern")
});

/// Health of a multipath device derived from its path lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathHealth {
    /// At least one path is active, ready and running
    Healthy,
    /// No usable path, including the case where no path line was found
    Faulty,
}

impl PathHealth {
    pub fn is_faulty(self) -> bool {
        self == PathHealth::Faulty
    }
}

/// One raw path of a multipath device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathLine {
    /// host:channel:target:lun tuple
    pub hctl: String,
    /// Raw block device name, e.g. `sdb`
    pub device: String,
    pub status: String,
}

impl PathLine {
    pub fn is_active(&self) -> bool {
        self.status.contains(ACTIVE_PATH_STATUS)
    }
}

/// Return the first whitespace-separated token of the last non-empty line.
fn last_line_first_token(text: &str) -> Option<&str> {
    text.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| line.split_whitespace().next())
}

/// Drop the last non-empty line of `text` (the next device's header).
fn strip_last_line(text: &str) -> &str {
    let trimmed = text.trim_end_matches(['\n', '\r']);
    match trimmed.rfind('\n') {
        Some(idx) => &text[..=idx],
        None => "",
    }
}

/// Isolate the block of `device_name` within a multi-device report.
///
/// The report is split on the `size=` marker; the name of the device owning
/// chunk `i` is the first token of the last line of chunk `i - 1`. The
/// returned block is the header line, the `size=` line and the body, without
/// the header of the following device.
pub fn locate_device_section(report: &str, device_name: &str) -> Result<String> {
    let chunks: Vec<&str> = report.split(SIZE_MARKER).collect();

    for i in 1..chunks.len() {
        let previous = chunks[i - 1];
        let Some(header) = previous
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
        else {
            continue;
        };
        if header.split_whitespace().next() != Some(device_name) {
            continue;
        }

        let body = if i + 1 < chunks.len() {
            strip_last_line(chunks[i])
        } else {
            chunks[i]
        };
        return Ok(format!("{}\n{}{}", header.trim_end(), SIZE_MARKER, body));
    }

    Err(MounterError::MultipathDeviceNotFound(device_name.to_string()))
}

/// All path lines found in a device section.
pub fn path_lines(section: &str) -> Vec<PathLine> {
    section
        .lines()
        .filter_map(|line| PATH_LINE.captures(line))
        .map(|caps| PathLine {
            hctl: caps[1].to_string(),
            device: caps[2].to_string(),
            status: caps[4].to_string(),
        })
        .collect()
}

/// Raw block device names backing a device section.
pub fn path_devices(section: &str) -> Vec<String> {
    path_lines(section).into_iter().map(|p| p.device).collect()
}

/// Classify a device section.
///
/// A section without any path line is faulty. Otherwise the device is
/// healthy as long as one path is `active ready running`.
pub fn classify_health(section: &str) -> PathHealth {
    let paths = path_lines(section);
    if paths.iter().any(PathLine::is_active) {
        PathHealth::Healthy
    } else {
        PathHealth::Faulty
    }
}

/// Find the device-mapper name of the device whose header mentions `wwn`.
///
/// Matching is case-insensitive.
pub fn find_device_mapper_name(report: &str, wwn: &str) -> Option<String> {
    let needle = wwn.to_lowercase();
    report
        .lines()
        .find(|line| line.to_lowercase().contains(&needle))
        .and_then(|line| line.split_whitespace().next())
        .map(str::to_string)
}

/// Names of every device-mapper device listed in a report, in report order.
pub fn device_mapper_names(report: &str) -> Vec<String> {
    let chunks: Vec<&str> = report.split(SIZE_MARKER).collect();
    chunks
        .iter()
        .take(chunks.len().saturating_sub(1))
        .filter_map(|chunk| last_line_first_token(chunk))
        .map(str::to_string)
        .collect()
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_locate_single_device() {
        let section = locate_device_section(HEALTHY_MPATHG, "mpathg").unwrap();
        assert!(section.starts_with("mpathg (36005076306ffd69d0000000000001004)"));
        assert!(section.contains("size=1.0G"));
        assert_eq!(path_devices(&section), vec!["sdb", "sdc", "sdd"]);
    }

    #[test]
    fn test_locate_first_middle_last() {
        let first = locate_device_section(THREE_DEVICES, "mpathf").unwrap();
        assert_eq!(path_devices(&first), vec!["sde", "sdf"]);
        assert!(!first.contains("mpathg"));

        let middle = locate_device_section(THREE_DEVICES, "mpathg").unwrap();
        assert!(middle.starts_with("mpathg "));
        assert_eq!(path_devices(&middle), vec!["sdb", "sdc"]);
        assert!(!middle.contains("mpathh"));
        assert!(!middle.contains("mpathf"));

        let last = locate_device_section(THREE_DEVICES, "mpathh").unwrap();
        assert!(last.starts_with("mpathh "));
        assert_eq!(path_devices(&last), vec!["sdg"]);
    }

    #[test]
    fn test_locate_not_found() {
        let err = locate_device_section(THREE_DEVICES, "mpathz").unwrap_err();
        assert!(matches!(err, MounterError::MultipathDeviceNotFound(name) if name == "mpathz"));
        assert!(locate_device_section("", "mpathg").is_err());
        // Device names must match a whole token
        assert!(locate_device_section(THREE_DEVICES, "mpath").is_err());
    }

    #[test]
    fn test_classify_all_active() {
        assert_eq!(classify_health(HEALTHY_MPATHG), PathHealth::Healthy);
    }

    #[test]
    fn test_classify_all_failed() {
        assert_eq!(classify_health(FAULTY_MPATHG), PathHealth::Faulty);
    }

    #[test]
    fn test_classify_no_paths_is_faulty() {
        let section = "mpathg (36005076306ffd69d0000000000001004) dm-3 IBM ,2107900\n\
                       size=1.0G features='0' hwhandler='0' wp=rw\n";
        assert!(classify_health(section).is_faulty());
        assert!(classify_health("").is_faulty());
    }

    #[test]
    fn test_classify_mixed_paths() {
        let first = locate_device_section(THREE_DEVICES, "mpathf").unwrap();
        assert_eq!(classify_health(&first), PathHealth::Healthy);

        let unknown_status = "\
mpathx (3600) dm-9 IBM ,2107900
size=1.0G features='0' hwhandler='0' wp=rw
  |- 1:0:0:1 sdx 65:112 undef ready running
  `- 2:0:0:1 sdy 65:128 i/o pending
";
        assert!(classify_health(unknown_status).is_faulty());
    }

    #[test]
    fn test_path_line_fields() {
        let lines = path_lines(FAULTY_MPATHG);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].hctl, "33:0:0:1");
        assert_eq!(lines[0].device, "sdb");
        assert_eq!(lines[0].status, "failed faulty running");
        assert!(!lines[0].is_active());
    }

    #[test]
    fn test_find_device_mapper_name_case_insensitive() {
        assert_eq!(
            find_device_mapper_name(THREE_DEVICES, &WWN.to_uppercase()).as_deref(),
            Some("mpathg")
        );
        assert_eq!(
            find_device_mapper_name(THREE_DEVICES, "6005076306ffd69d0000000000001005")
                .as_deref(),
            Some("mpathh")
        );
        assert_eq!(find_device_mapper_name(THREE_DEVICES, "deadbeef"), None);
        assert_eq!(find_device_mapper_name("", WWN), None);
    }

    #[test]
    fn test_device_mapper_names() {
        assert_eq!(
            device_mapper_names(THREE_DEVICES),
            vec!["mpathf", "mpathg", "mpathh"]
        );
        assert!(device_mapper_names("").is_empty());
    }
}
