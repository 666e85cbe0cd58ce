use crate::diagnostics::{self, DiagnosticsSink, FallbackEntry};
use crate::probe::{DeviceProbe, VolumeEjector};
use crate::registry::{DeviceRegistry, PollReport};
use crate::unmount::UnmountController;
use crate::{DeviceError, DeviceRecord, ManagerConfig};
use std::path::Path;
use std::sync::Arc;

/// The four operations the binding layer calls. Expected failures come
/// back as typed errors, never panics.
#[async_trait::async_trait]
pub trait DeviceManager: Send + Sync {
    /// Rescan attached devices and return them ordered by id.
    async fn poll(&self) -> Result<PollReport, DeviceError>;

    /// Look up one device in the last snapshot without rescanning.
    async fn get(&self, id: &str) -> Result<DeviceRecord, DeviceError>;

    async fn unmount(&self, id: &str) -> Result<(), DeviceError>;

    /// Redirect diagnostics to `path` (append, created if absent).
    async fn set_log_file(&self, path: &Path) -> Result<(), DeviceError>;
}

pub struct Subdevil {
    registry: Arc<DeviceRegistry>,
    controller: UnmountController,
    diagnostics: &'static DiagnosticsSink,
}

impl Subdevil {
    pub fn new<P>(platform: P, config: &ManagerConfig) -> Self
    where
        P: DeviceProbe + VolumeEjector,
    {
        let platform = Arc::new(platform);
        let probe: Arc<dyn DeviceProbe> = platform.clone();
        let ejector: Arc<dyn VolumeEjector> = platform;
        Self::from_parts(probe, ejector, config)
    }

    pub fn from_parts(
        probe: Arc<dyn DeviceProbe>,
        ejector: Arc<dyn VolumeEjector>,
        config: &ManagerConfig,
    ) -> Self {
        tracing::debug!(
            probe = probe.name(),
            probe_timeout_ms = config.probe_timeout_ms,
            unmount_timeout_ms = config.unmount_timeout_ms,
            eject_after_unmount = config.eject_after_unmount,
            "device manager created"
        );

        let registry = Arc::new(DeviceRegistry::new(probe, config.probe_timeout()));
        let controller = UnmountController::new(
            Arc::clone(&registry),
            ejector,
            config.unmount_timeout(),
            config.eject_after_unmount,
        );

        Self {
            registry,
            controller,
            diagnostics: diagnostics::sink(),
        }
    }

    /// Last computed live snapshot; does not scan.
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        self.registry.snapshot()
    }

    /// Log writes that failed and were dropped.
    pub fn fallback_diagnostics(&self) -> Vec<FallbackEntry> {
        self.diagnostics.fallback_entries()
    }
}

#[async_trait::async_trait]
impl DeviceManager for Subdevil {
    async fn poll(&self) -> Result<PollReport, DeviceError> {
        self.registry.poll().await
    }

    async fn get(&self, id: &str) -> Result<DeviceRecord, DeviceError> {
        self.registry.get(id)
    }

    async fn unmount(&self, id: &str) -> Result<(), DeviceError> {
        self.controller.unmount(id).await
    }

    async fn set_log_file(&self, path: &Path) -> Result<(), DeviceError> {
        self.diagnostics.configure(path)
    }
}
