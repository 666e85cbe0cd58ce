use crate::probe::VolumeEjector;
use crate::registry::DeviceRegistry;
use crate::{DeviceError, UnmountError, UnmountTarget};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;

/// Detaches devices in the order flush, unmount, release and keeps the
/// registry in step with the outcome.
pub struct UnmountController {
    registry: Arc<DeviceRegistry>,
    ejector: Arc<dyn VolumeEjector>,
    timeout: Duration,
    eject_after_unmount: bool,
}

impl UnmountController {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        ejector: Arc<dyn VolumeEjector>,
        timeout: Duration,
        eject_after_unmount: bool,
    ) -> Self {
        Self {
            registry,
            ejector,
            timeout,
            eject_after_unmount,
        }
    }

    /// The OS call and the registry update run on their own task, so
    /// dropping this future or hitting the timeout never strands a
    /// record in UNMOUNTING.
    pub async fn unmount(&self, id: &str) -> Result<(), DeviceError> {
        let target = self.registry.begin_unmount(id)?;

        let registry = Arc::clone(&self.registry);
        let ejector = Arc::clone(&self.ejector);
        let eject = self.eject_after_unmount;
        let task = tokio::spawn(async move {
            let target_id = target.id.clone();
            let joined = tokio::task::spawn_blocking(move || detach(ejector.as_ref(), &target, eject)).await;
            let outcome = settle(joined);
            registry.finish_unmount(&target_id, &outcome);
            outcome
        });

        let outcome = match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) => {
                // The task died before it could settle the record.
                let outcome = settle(Err(join_err));
                self.registry.finish_unmount(id, &outcome);
                outcome
            }
            Err(_) => {
                tracing::warn!(
                    device_id = %id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "unmount still running in the OS, leaving device UNMOUNTING until it returns"
                );
                Err(UnmountError::Timeout(self.timeout))
            }
        };

        outcome.map_err(|source| DeviceError::Unmount {
            id: id.to_string(),
            source,
        })
    }
}

fn settle(joined: Result<Result<(), UnmountError>, JoinError>) -> Result<(), UnmountError> {
    joined.unwrap_or_else(|join_err| Err(UnmountError::Unknown(format!("unmount worker failed: {}", join_err))))
}

/// Runs on a blocking worker.
fn detach(ejector: &dyn VolumeEjector, target: &UnmountTarget, eject: bool) -> Result<(), UnmountError> {
    match ejector.flush(&target.mount_point) {
        Ok(()) => tracing::debug!(device_id = %target.id, phase = "flush", "pending writes flushed"),
        Err(err) => tracing::warn!(
            device_id = %target.id,
            phase = "flush",
            os_code = ?err.raw_os_error(),
            error = %err,
            "flush failed, unmounting anyway; unwritten data may be lost"
        ),
    }

    if let Err(err) = ejector.unmount(target) {
        tracing::warn!(
            device_id = %target.id,
            phase = "unmount",
            os_code = ?err.os_code(),
            error = %err,
            "OS refused to unmount"
        );
        return Err(err);
    }
    tracing::info!(
        device_id = %target.id,
        phase = "unmount",
        mount_point = %target.mount_point.display(),
        "volume unmounted"
    );

    if eject {
        match ejector.release(target) {
            Ok(()) => tracing::info!(device_id = %target.id, phase = "release", "device released"),
            Err(err) => tracing::warn!(
                device_id = %target.id,
                phase = "release",
                os_code = ?err.os_code(),
                error = %err,
                "volume is unmounted but the device could not be released"
            ),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{raw_device, MockPlatform};
    use crate::DeviceState;

    fn controller(platform: &MockPlatform, eject: bool) -> (Arc<DeviceRegistry>, UnmountController) {
        let registry = Arc::new(DeviceRegistry::new(
            Arc::new(platform.clone()),
            Duration::from_secs(2),
        ));
        let controller = UnmountController::new(
            Arc::clone(&registry),
            Arc::new(platform.clone()),
            Duration::from_millis(200),
            eject,
        );
        (registry, controller)
    }

    #[tokio::test]
    async fn phases_run_in_order() {
        let platform = MockPlatform::with_devices(vec![raw_device("D1", Some("/media/d1"))]);
        let (registry, controller) = controller(&platform, true);
        let id = registry.poll().await.unwrap().devices[0].id.clone();

        controller.unmount(&id).await.unwrap();
        assert_eq!(
            platform.calls(),
            vec![
                "flush:/media/d1".to_string(),
                "unmount:/dev/d11".to_string(),
                "release:/dev/d1".to_string(),
            ]
        );
        assert_eq!(registry.get(&id).unwrap().state, DeviceState::Unmounted);
    }

    #[tokio::test]
    async fn flush_failure_is_not_fatal() {
        let platform = MockPlatform::with_devices(vec![raw_device("D1", Some("/media/d1"))]);
        platform.fail_flush("EIO on fsync");
        let (registry, controller) = controller(&platform, false);
        let id = registry.poll().await.unwrap().devices[0].id.clone();

        controller.unmount(&id).await.unwrap();
        assert_eq!(platform.unmount_calls(), 1);
        assert!(!platform.calls().iter().any(|c| c.starts_with("release:")));
    }

    #[tokio::test]
    async fn release_failure_still_reports_success() {
        let platform = MockPlatform::with_devices(vec![raw_device("D1", Some("/media/d1"))]);
        platform.fail_release(UnmountError::Busy("power-off refused".into()));
        let (registry, controller) = controller(&platform, true);
        let id = registry.poll().await.unwrap().devices[0].id.clone();

        controller.unmount(&id).await.unwrap();
        assert_eq!(registry.get(&id).unwrap().state, DeviceState::Unmounted);
    }

    #[tokio::test]
    async fn os_failure_restores_mounted() {
        let platform = MockPlatform::with_devices(vec![raw_device("D1", Some("/media/d1"))]);
        platform.fail_unmount(UnmountError::PermissionDenied(
            "umount /media/d1: Operation not permitted (os error 1)".into(),
        ));
        let (registry, controller) = controller(&platform, false);
        let id = registry.poll().await.unwrap().devices[0].id.clone();

        let err = controller.unmount(&id).await.unwrap_err();
        match &err {
            DeviceError::Unmount { source, .. } => {
                assert!(matches!(source, UnmountError::PermissionDenied(_)));
                assert_eq!(source.os_code(), Some(1));
            }
            other => panic!("unexpected {:?}", other),
        }
        let record = registry.get(&id).unwrap();
        assert_eq!(record.state, DeviceState::Mounted);
        assert!(record.mount_point.is_some());
    }

    #[tokio::test]
    async fn timeout_leaves_unmounting_until_the_os_answers() {
        let platform = MockPlatform::with_devices(vec![raw_device("D1", Some("/media/d1"))]);
        platform.set_unmount_delay(Duration::from_millis(600));
        let (registry, controller) = controller(&platform, false);
        let id = registry.poll().await.unwrap().devices[0].id.clone();

        let err = controller.unmount(&id).await.unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Unmount {
                source: UnmountError::Timeout(_),
                ..
            }
        ));
        assert_eq!(registry.get(&id).unwrap().state, DeviceState::Unmounting);
        assert!(matches!(
            controller.unmount(&id).await,
            Err(DeviceError::InvalidState {
                state: DeviceState::Unmounting,
                ..
            })
        ));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(registry.get(&id).unwrap().state, DeviceState::Unmounted);
        assert_eq!(platform.unmount_calls(), 1);
    }
}
