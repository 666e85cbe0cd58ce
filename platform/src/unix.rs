//! Pieces shared by the Linux and macOS implementations.

use std::fs::File;
use std::path::Path;

/// Bytes in use on the filesystem mounted at `mount_point`.
pub(crate) fn used_bytes(mount_point: &Path) -> Option<u64> {
    match nix::sys::statvfs::statvfs(mount_point) {
        Ok(stat) => {
            let fragment = stat.fragment_size() as u64;
            let blocks = stat.blocks() as u64;
            let free = stat.blocks_free() as u64;
            Some(blocks.saturating_sub(free) * fragment)
        }
        Err(errno) => {
            tracing::debug!(mount_point = %mount_point.display(), %errno, "statvfs failed");
            None
        }
    }
}

/// Schedule all dirty buffers for writeback, then wait on the mount root.
pub(crate) fn flush_mount(mount_point: &Path) -> std::io::Result<()> {
    nix::unistd::sync();
    File::open(mount_point)?.sync_all()
}
