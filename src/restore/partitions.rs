// restore/partitions.rs
//
// Partition discovery on an attached NBD device via `lsblk -J -b`. The
// scan yields mount candidates; sub-1MB entries (alignment gaps, BIOS boot
// stubs) are skipped.

use serde::{Deserialize, Deserializer, Serialize};

/// Entries smaller than this are never mount candidates.
pub const MIN_PARTITION_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct LsblkOutput {
    #[serde(default)]
    pub blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
pub struct LsblkDevice {
    pub name: String,
    #[serde(default, deserialize_with = "de_size")]
    pub size: u64,
    #[serde(default)]
    pub fstype: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub children: Option<Vec<LsblkDevice>>,
}

// older util-linux emits sizes as JSON strings even with -b
fn de_size<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeRepr {
        Num(u64),
        Text(String),
    }

    Ok(match SizeRepr::deserialize(deserializer)? {
        SizeRepr::Num(n) => n,
        SizeRepr::Text(s) => s.trim().parse().unwrap_or(0),
    })
}

/// One mountable partition found on the device.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionCandidate {
    pub device_name: String,
    pub size: u64,
    pub filesystem: Option<String>,
    pub label: Option<String>,
}

pub fn parse_lsblk(raw: &str) -> Result<LsblkOutput, serde_json::Error> {
    serde_json::from_str(raw)
}

/// Mount candidates from an lsblk scan. Partitioned disks contribute their
/// `part` children; a bare filesystem on the whole device (no partition
/// table) contributes the device itself.
pub fn candidate_partitions(output: &LsblkOutput) -> Vec<PartitionCandidate> {
    let mut candidates = Vec::new();

    for device in &output.blockdevices {
        let children: Vec<&LsblkDevice> = device
            .children
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .filter(|c| c.kind.as_deref() == Some("part"))
            .collect();

        if children.is_empty() {
            if device.fstype.is_some() && device.size >= MIN_PARTITION_BYTES {
                candidates.push(PartitionCandidate {
                    device_name: device.name.clone(),
                    size: device.size,
                    filesystem: device.fstype.clone(),
                    label: device.label.clone(),
                });
            }
            continue;
        }

        for child in children {
            if child.size < MIN_PARTITION_BYTES {
                continue;
            }
            candidates.push(PartitionCandidate {
                device_name: child.name.clone(),
                size: child.size,
                filesystem: child.fstype.clone(),
                label: child.label.clone(),
            });
        }
    }

    candidates
}

/// Metadata persisted per mounted partition, in mount order (`mount_path`
/// indices are 1-based and dense over successful mounts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub partition_name: String,
    pub size: u64,
    pub filesystem: String,
    pub label: String,
    pub mount_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOWS_DISK: &str = r#"{
        "blockdevices": [
            {
                "name": "nbd0", "size": 109521666048, "fstype": null, "label": null, "type": "disk",
                "children": [
                    {"name": "nbd0p1", "size": 524288000, "fstype": "ntfs", "label": "System Reserved", "type": "part"},
                    {"name": "nbd0p2", "size": 108994756608, "fstype": "ntfs", "label": null, "type": "part"},
                    {"name": "nbd0p3", "size": 16384, "fstype": null, "label": null, "type": "part"}
                ]
            }
        ]
    }"#;

    const BARE_FS_DISK: &str = r#"{
        "blockdevices": [
            {"name": "nbd1", "size": 5368709120, "fstype": "ext4", "label": "data", "type": "disk"}
        ]
    }"#;

    #[test]
    fn partitioned_disk_skips_tiny_entries() {
        let output = parse_lsblk(WINDOWS_DISK).unwrap();
        let candidates = candidate_partitions(&output);

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].device_name, "nbd0p1");
        assert_eq!(candidates[0].label.as_deref(), Some("System Reserved"));
        assert_eq!(candidates[1].device_name, "nbd0p2");
    }

    #[test]
    fn bare_filesystem_uses_whole_device() {
        let output = parse_lsblk(BARE_FS_DISK).unwrap();
        let candidates = candidate_partitions(&output);

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].device_name, "nbd1");
        assert_eq!(candidates[0].filesystem.as_deref(), Some("ext4"));
    }

    #[test]
    fn string_sizes_are_tolerated() {
        let raw = r#"{"blockdevices": [{"name": "nbd2", "size": "2097152", "fstype": "xfs", "type": "disk"}]}"#;
        let output = parse_lsblk(raw).unwrap();
        assert_eq!(output.blockdevices[0].size, 2097152);
        assert_eq!(candidate_partitions(&output).len(), 1);
    }

    #[test]
    fn unpartitioned_unformatted_disk_yields_nothing() {
        let raw = r#"{"blockdevices": [{"name": "nbd3", "size": 1073741824, "fstype": null, "type": "disk"}]}"#;
        let output = parse_lsblk(raw).unwrap();
        assert!(candidate_partitions(&output).is_empty());
    }
}
