use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

pub const GIB: i64 = 1024 * 1024 * 1024;
pub const MIB: i64 = 1024 * 1024;

/// Rounds down the capacity to an easy to read value, choosing the largest
/// unit at which the result is still at least 10 units. Capacities too small
/// for that are passed through unchanged.
pub fn round_down_capacity_pretty(capacity_bytes: i64) -> i64 {
    for unit in [GIB, MIB] {
        let size = capacity_bytes / unit;
        if size >= 10 {
            return size * unit;
        }
    }
    capacity_bytes
}

/// Filesystem and block-device introspection used by the local evaluator.
///
/// Probes answer "what is at this path" without deciding health; a `NotFound`
/// underneath surfaces as `Ok(false)` from the type probes so the evaluator
/// can treat absence as a verdict rather than an error.
pub trait VolumeUtil: Send + Sync {
    fn is_dir(&self, path: &Path) -> io::Result<bool>;

    fn is_block(&self, path: &Path) -> io::Result<bool>;

    /// Total capacity in bytes of the filesystem containing `path`.
    fn fs_capacity_bytes(&self, path: &Path) -> io::Result<i64>;

    /// Size in bytes of the block device at `path`.
    fn block_capacity_bytes(&self, path: &Path) -> io::Result<i64>;

    /// Bytes used by the directory tree rooted at `path`.
    fn dir_usage_bytes(&self, path: &Path) -> io::Result<i64>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub device: String,
    pub path: PathBuf,
    pub fs_type: String,
}

pub trait Mounter: Send + Sync {
    fn list(&self) -> io::Result<Vec<MountPoint>>;
}

/// Production [VolumeUtil] backed by stat, statvfs and a directory walk.
#[derive(Default)]
pub struct StdVolumeUtil;

impl VolumeUtil for StdVolumeUtil {
    fn is_dir(&self, path: &Path) -> io::Result<bool> {
        match fs::metadata(path) {
            Ok(metadata) => Ok(metadata.is_dir()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn is_block(&self, path: &Path) -> io::Result<bool> {
        match fs::metadata(path) {
            Ok(metadata) => Ok(metadata.file_type().is_block_device()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn fs_capacity_bytes(&self, path: &Path) -> io::Result<i64> {
        let stat = nix::sys::statvfs::statvfs(path)
            .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
        Ok((stat.blocks() as u64 * stat.fragment_size() as u64) as i64)
    }

    fn block_capacity_bytes(&self, path: &Path) -> io::Result<i64> {
        let mut device = File::open(path)?;
        Ok(device.seek(SeekFrom::End(0))? as i64)
    }

    fn dir_usage_bytes(&self, path: &Path) -> io::Result<i64> {
        fs_extra::dir::get_size(path)
            .map(|bytes| bytes as i64)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

/// Production [Mounter] reading the kernel mount table.
#[derive(Default)]
pub struct ProcMounter;

impl Mounter for ProcMounter {
    fn list(&self) -> io::Result<Vec<MountPoint>> {
        let contents = fs::read_to_string("/proc/mounts")?;
        Ok(parse_mounts(&contents))
    }
}

fn parse_mounts(contents: &str) -> Vec<MountPoint> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let path = fields.next()?;
            let fs_type = fields.next()?;
            Some(MountPoint {
                device: device.to_string(),
                path: PathBuf::from(unescape_mount_field(path)),
                fs_type: fs_type.to_string(),
            })
        })
        .collect()
}

// /proc/mounts octal-escapes whitespace and backslashes in paths.
fn unescape_mount_field(field: &str) -> String {
    field
        .replace(r"\040", " ")
        .replace(r"\011", "\t")
        .replace(r"\012", "\n")
        .replace(r"\134", "\\")
}
