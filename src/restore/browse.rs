// restore/browse.rs
//
// Path-safe browsing over a restore mount. Request paths arrive in one of
// three shapes: the synthetic partition root ("/"), a partition-prefixed
// path (canonical "/partition-N/..." or the friendly display form the
// listing itself emits), or a bare path on single-partition legacy mounts.
// Every resolution normalizes, maps the virtual prefix, and re-checks
// prefix containment against the mount base after following symlinks.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

use super::partitions::PartitionMeta;
use super::RestoreError;

/// One entry of a directory listing.
#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub file_type: String, // 'directory' | 'file'
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Display label for a partition folder: `Partition {n} - {label} ({size})`.
pub fn friendly_partition_label(index: usize, meta: &PartitionMeta) -> String {
    let label = if meta.label.is_empty() {
        meta.filesystem.clone()
    } else {
        meta.label.clone()
    };
    format!("Partition {} - {} ({})", index, label, human_size(meta.size))
}

pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Extract the partition index from the first path segment, accepting both
/// the canonical `partition-N` form and the friendly `Partition N - ...`
/// form emitted by the root listing.
pub fn parse_partition_segment(segment: &str) -> Option<usize> {
    if let Some(rest) = segment.strip_prefix("partition-") {
        return rest.parse().ok();
    }
    if let Some(rest) = segment.strip_prefix("Partition ") {
        return rest.split_whitespace().next()?.parse().ok();
    }
    None
}

/// Normalize a request path into clean segments, rejecting traversal.
fn normalize_segments(raw: &str) -> Result<Vec<String>, RestoreError> {
    let mut segments = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(RestoreError::PathTraversal(raw.to_string())),
            s => segments.push(s.to_string()),
        }
    }
    Ok(segments)
}

/// Resolve a request path to an absolute filesystem path under the mount
/// base. Partition-prefixed segments map onto `partition-N` directories;
/// on partitioned mounts an unprefixed non-root path is rejected.
pub fn resolve_request_path(
    mount_base: &Path,
    partitioned: bool,
    raw: &str,
) -> Result<PathBuf, RestoreError> {
    let segments = normalize_segments(raw)?;

    let mut resolved = mount_base.to_path_buf();
    let mut rest = segments.as_slice();

    if partitioned {
        let Some(first) = segments.first() else {
            return Ok(resolved);
        };
        let index = parse_partition_segment(first)
            .ok_or_else(|| RestoreError::PathTraversal(raw.to_string()))?;
        resolved.push(format!("partition-{}", index));
        rest = &segments[1..];
    }

    for segment in rest {
        // no segment may smuggle separators or parent references
        if segment.contains("..") || segment.contains('\\') {
            return Err(RestoreError::PathTraversal(raw.to_string()));
        }
        resolved.push(segment);
    }

    Ok(resolved)
}

/// Final containment check after the filesystem resolves symlinks. The
/// canonicalized path must still live under the canonicalized mount base.
pub fn verify_containment(candidate: &Path, mount_base: &Path) -> Result<PathBuf, RestoreError> {
    let canonical_base = mount_base
        .canonicalize()
        .map_err(|_| RestoreError::FileNotFound(mount_base.to_path_buf()))?;
    let canonical = candidate
        .canonicalize()
        .map_err(|_| RestoreError::FileNotFound(candidate.to_path_buf()))?;

    if !canonical.starts_with(&canonical_base) {
        return Err(RestoreError::PathTraversal(
            candidate.to_string_lossy().to_string(),
        ));
    }

    Ok(canonical)
}

/// Deterministic listing: directories first (lexicographic), then files
/// (lexicographic). `virtual_prefix` is the client-visible path prefix.
pub fn list_directory(dir: &Path, virtual_prefix: &str) -> Result<Vec<FileEntry>, RestoreError> {
    let mut directories = Vec::new();
    let mut files = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        let name = entry.file_name().to_string_lossy().to_string();

        let virtual_path = if virtual_prefix.ends_with('/') {
            format!("{}{}", virtual_prefix, name)
        } else {
            format!("{}/{}", virtual_prefix, name)
        };

        let modified = metadata
            .modified()
            .ok()
            .map(DateTime::<Utc>::from);

        let item = FileEntry {
            name,
            path: virtual_path,
            file_type: if metadata.is_dir() {
                "directory".to_string()
            } else {
                "file".to_string()
            },
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            modified,
        };

        if metadata.is_dir() {
            directories.push(item);
        } else {
            files.push(item);
        }
    }

    directories.sort_by(|a, b| a.name.cmp(&b.name));
    files.sort_by(|a, b| a.name.cmp(&b.name));

    directories.extend(files);
    Ok(directories)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(size: u64, label: &str, fs: &str) -> PartitionMeta {
        PartitionMeta {
            partition_name: "nbd0p1".to_string(),
            size,
            filesystem: fs.to_string(),
            label: label.to_string(),
            mount_path: "/mnt/r/m1/partition-1".to_string(),
        }
    }

    #[test]
    fn friendly_labels() {
        let m = meta(56_371_445_760, "System", "ntfs");
        assert_eq!(friendly_partition_label(2, &m), "Partition 2 - System (52.5 GB)");

        let unnamed = meta(524_288_000, "", "ntfs");
        assert_eq!(friendly_partition_label(1, &unnamed), "Partition 1 - ntfs (500.0 MB)");
    }

    #[test]
    fn parses_canonical_and_friendly_segments() {
        assert_eq!(parse_partition_segment("partition-3"), Some(3));
        assert_eq!(parse_partition_segment("Partition 2 - System (52.4 GB)"), Some(2));
        assert_eq!(parse_partition_segment("Partition 11 - ntfs (1.0 TB)"), Some(11));
        assert_eq!(parse_partition_segment("Windows"), None);
        assert_eq!(parse_partition_segment("partition-x"), None);
    }

    #[test]
    fn resolves_partitioned_paths() {
        let base = Path::new("/mnt/r/m1");
        let resolved = resolve_request_path(base, true, "/partition-2/Windows/System32").unwrap();
        assert_eq!(resolved, PathBuf::from("/mnt/r/m1/partition-2/Windows/System32"));

        let friendly =
            resolve_request_path(base, true, "/Partition 2 - System (52.4 GB)/Windows").unwrap();
        assert_eq!(friendly, PathBuf::from("/mnt/r/m1/partition-2/Windows"));
    }

    #[test]
    fn resolves_legacy_single_partition_paths() {
        let base = Path::new("/mnt/r/m1");
        let resolved = resolve_request_path(base, false, "/etc/hosts").unwrap();
        assert_eq!(resolved, PathBuf::from("/mnt/r/m1/etc/hosts"));
    }

    #[test]
    fn rejects_parent_traversal() {
        let base = Path::new("/mnt/r/m1");
        assert!(matches!(
            resolve_request_path(base, true, "/partition-1/../../etc/passwd"),
            Err(RestoreError::PathTraversal(_))
        ));
        assert!(matches!(
            resolve_request_path(base, false, "/../outside"),
            Err(RestoreError::PathTraversal(_))
        ));
        assert!(matches!(
            resolve_request_path(base, false, ".."),
            Err(RestoreError::PathTraversal(_))
        ));
    }

    #[test]
    fn rejects_unprefixed_paths_on_partitioned_mounts() {
        let base = Path::new("/mnt/r/m1");
        assert!(resolve_request_path(base, true, "/Windows/System32").is_err());
    }

    #[test]
    fn root_resolves_to_base() {
        let base = Path::new("/mnt/r/m1");
        assert_eq!(resolve_request_path(base, true, "/").unwrap(), base);
        assert_eq!(resolve_request_path(base, false, "").unwrap(), base);
    }

    #[test]
    fn containment_rejects_symlink_escape() {
        let outer = tempfile::tempdir().unwrap();
        let base = outer.path().join("mount");
        std::fs::create_dir_all(base.join("inner")).unwrap();
        let secret = outer.path().join("secret.txt");
        std::fs::write(&secret, b"x").unwrap();

        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(&secret, base.join("inner/link")).unwrap();
            let candidate = base.join("inner/link");
            assert!(matches!(
                verify_containment(&candidate, &base),
                Err(RestoreError::PathTraversal(_))
            ));
        }

        // a legitimate file passes
        std::fs::write(base.join("inner/ok.txt"), b"y").unwrap();
        let ok = verify_containment(&base.join("inner/ok.txt"), &base).unwrap();
        assert!(ok.starts_with(base.canonicalize().unwrap()));
    }

    #[test]
    fn listing_orders_directories_before_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("zeta")).unwrap();
        std::fs::create_dir(dir.path().join("alpha")).unwrap();
        std::fs::write(dir.path().join("beta.txt"), b"1").unwrap();
        std::fs::write(dir.path().join("aardvark.txt"), b"22").unwrap();

        let entries = list_directory(dir.path(), "/partition-1").unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta", "aardvark.txt", "beta.txt"]);
        assert_eq!(entries[0].file_type, "directory");
        assert_eq!(entries[3].size, 1);
        assert_eq!(entries[2].path, "/partition-1/aardvark.txt");
    }

    #[test]
    fn human_sizes() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(2048), "2.0 KB");
        assert_eq!(human_size(5_368_709_120), "5.0 GB");
    }
}
