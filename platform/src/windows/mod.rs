pub mod device;
mod eject;

use device::WindowsScanner;
use std::path::Path;
use subdevil_core::{DeviceError, DeviceProbe, ScanSink, UnmountError, UnmountTarget, VolumeEjector};

/// Removable storage on Windows: the Storage cmdlets for discovery and
/// volume ioctls for detaching.
#[derive(Default)]
pub struct WindowsProbe {
    scanner: WindowsScanner,
}

impl DeviceProbe for WindowsProbe {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn scan(&self, sink: &ScanSink) -> Result<(), DeviceError> {
        self.scanner.scan(sink)
    }
}

impl VolumeEjector for WindowsProbe {
    fn flush(&self, mount_point: &Path) -> std::io::Result<()> {
        eject::flush(mount_point)
    }

    fn unmount(&self, target: &UnmountTarget) -> Result<(), UnmountError> {
        eject::unmount(target)
    }

    fn release(&self, target: &UnmountTarget) -> Result<(), UnmountError> {
        eject::release(target)
    }
}
