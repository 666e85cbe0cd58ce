use std::process::Command;
use subdevil_core::{UnmountError, UnmountTarget};

/// Map diskutil's complaint onto the unmount taxonomy. A dissenting
/// process is how Disk Arbitration reports an open file.
pub(crate) fn classify_diskutil_error(message: &str) -> UnmountError {
    let message = message.trim().to_string();
    let lower = message.to_lowercase();
    if lower.contains("dissent") || lower.contains("busy") || lower.contains("in use") {
        UnmountError::Busy(message)
    } else if lower.contains("not permitted") || lower.contains("permission") || lower.contains("not privileged") {
        UnmountError::PermissionDenied(message)
    } else if lower.contains("i/o error") || lower.contains("input/output") {
        UnmountError::IoFailure(message)
    } else {
        UnmountError::Unknown(message)
    }
}

fn diskutil(args: &[&str]) -> Result<(), UnmountError> {
    let output = Command::new("diskutil")
        .args(args)
        .output()
        .map_err(|e| UnmountError::Unknown(format!("Failed to run diskutil: {}", e)))?;

    if output.status.success() {
        return Ok(());
    }

    // diskutil prints some failures on stdout.
    let stderr = String::from_utf8_lossy(&output.stderr);
    let message = if stderr.trim().is_empty() {
        String::from_utf8_lossy(&output.stdout).into_owned()
    } else {
        stderr.into_owned()
    };
    Err(classify_diskutil_error(&message))
}

pub(crate) fn unmount(target: &UnmountTarget) -> Result<(), UnmountError> {
    let mount_point = target.mount_point.to_string_lossy();
    diskutil(&["unmount", &mount_point])
}

pub(crate) fn release(target: &UnmountTarget) -> Result<(), UnmountError> {
    diskutil(&["eject", &target.device_path])
}
