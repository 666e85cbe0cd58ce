//! Capabilities a platform has to provide: one pass over the attached
//! devices, and the three phases of detaching one of them.

use crate::{DeviceError, RawDeviceInfo, UnmountError, UnmountTarget};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Collects raw entries while a scan runs so a timed-out scan still
/// yields whatever it found.
#[derive(Debug, Clone, Default)]
pub struct ScanSink {
    found: Arc<Mutex<Vec<RawDeviceInfo>>>,
    cancelled: Arc<AtomicBool>,
}

impl ScanSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, info: RawDeviceInfo) {
        if self.is_cancelled() {
            return;
        }
        self.found
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(info);
    }

    /// Probes check this between devices and stop early once set.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Entries gathered so far, in discovery order.
    pub fn snapshot(&self) -> Vec<RawDeviceInfo> {
        self.found
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.found
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Enumerates removable storage. Runs on a blocking worker; the caller
/// enforces the timeout.
pub trait DeviceProbe: Send + Sync + 'static {
    /// Short platform name for diagnostics.
    fn name(&self) -> &'static str;

    /// Push every attached removable device into `sink`. Finding nothing
    /// is not an error.
    fn scan(&self, sink: &ScanSink) -> Result<(), DeviceError>;
}

/// Drives flush, unmount and release for one device. Every call blocks.
pub trait VolumeEjector: Send + Sync + 'static {
    /// Push pending writes for the mount point to the device.
    fn flush(&self, mount_point: &Path) -> std::io::Result<()>;

    /// Detach the volume from the filesystem namespace.
    fn unmount(&self, target: &UnmountTarget) -> Result<(), UnmountError>;

    /// Eject or power off the device after a successful unmount.
    fn release(&self, target: &UnmountTarget) -> Result<(), UnmountError>;
}
