use super::device::read_mounts;
use nix::errno::Errno;
use nix::mount::{umount2, MntFlags};
use std::path::Path;
use std::process::Command;
use subdevil_core::{UnmountError, UnmountTarget};

/// Map a udisks error message onto the unmount taxonomy.
pub(crate) fn classify_udisks_error(stderr: &str) -> UnmountError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();
    if lower.contains("busy") {
        UnmountError::Busy(message)
    } else if lower.contains("not authorized") || lower.contains("permission") {
        UnmountError::PermissionDenied(message)
    } else if lower.contains("input/output") || lower.contains("i/o error") {
        UnmountError::IoFailure(message)
    } else {
        UnmountError::Unknown(message)
    }
}

fn is_mounted_at(mount_point: &Path) -> bool {
    read_mounts().iter().any(|(_, target)| target == mount_point)
}

/// Run `udisksctl` for an unprivileged caller; polkit decides whether
/// the session may touch removable media.
fn udisksctl(verb: &str, block: &str) -> Result<(), UnmountError> {
    let output = Command::new("udisksctl")
        .args([verb, "--block-device", block, "--no-user-interaction"])
        .output()
        .map_err(|e| UnmountError::PermissionDenied(format!("udisksctl unavailable: {}", e)))?;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let message = match output.status.code() {
        Some(code) => format!("{} (udisksctl exit status {})", stderr.trim(), code),
        None => stderr.into_owned(),
    };
    Err(classify_udisks_error(&message))
}

/// Map a `umount2` errno onto the unmount taxonomy. The message ends in
/// `(os error N)` so the code survives into diagnostics.
pub(crate) fn classify_errno(errno: Errno, mount_point: &Path) -> UnmountError {
    let message = format!("umount {}: {}", mount_point.display(), std::io::Error::from(errno));
    match errno {
        Errno::EBUSY => UnmountError::Busy(message),
        Errno::EPERM | Errno::EACCES => UnmountError::PermissionDenied(message),
        Errno::EIO => UnmountError::IoFailure(message),
        _ => UnmountError::Unknown(message),
    }
}

pub(crate) fn unmount(target: &UnmountTarget) -> Result<(), UnmountError> {
    let mount_point = target.mount_point.as_path();
    match umount2(mount_point, MntFlags::empty()) {
        Ok(()) => Ok(()),
        Err(errno @ (Errno::EPERM | Errno::EACCES)) => {
            let block = target.volume_path.as_deref().unwrap_or(&target.device_path);
            tracing::debug!(block, os_code = errno as i32, "umount2 not permitted, asking udisks");
            udisksctl("unmount", block)
        }
        Err(Errno::EINVAL) if !is_mounted_at(mount_point) => {
            tracing::info!(mount_point = %mount_point.display(), "already unmounted");
            Ok(())
        }
        Err(errno) => Err(classify_errno(errno, mount_point)),
    }
}

pub(crate) fn release(target: &UnmountTarget) -> Result<(), UnmountError> {
    udisksctl("power-off", &target.device_path)
}
