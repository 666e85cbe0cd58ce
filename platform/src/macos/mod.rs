pub mod device;
mod eject;

use crate::unix::flush_mount;
use device::MacScanner;
use std::path::Path;
use subdevil_core::{DeviceError, DeviceProbe, ScanSink, UnmountError, UnmountTarget, VolumeEjector};

/// Removable storage on macOS through `diskutil`, which goes via Disk
/// Arbitration so other processes get their chance to object.
#[derive(Default)]
pub struct MacOSProbe {
    scanner: MacScanner,
}

impl DeviceProbe for MacOSProbe {
    fn name(&self) -> &'static str {
        "macos"
    }

    fn scan(&self, sink: &ScanSink) -> Result<(), DeviceError> {
        self.scanner.scan(sink)
    }
}

impl VolumeEjector for MacOSProbe {
    fn flush(&self, mount_point: &Path) -> std::io::Result<()> {
        flush_mount(mount_point)
    }

    fn unmount(&self, target: &UnmountTarget) -> Result<(), UnmountError> {
        eject::unmount(target)
    }

    fn release(&self, target: &UnmountTarget) -> Result<(), UnmountError> {
        eject::release(target)
    }
}
