use crate::normalize::normalize;
use crate::probe::{DeviceProbe, ScanSink};
use crate::{
    DeviceError, DeviceRecord, DeviceState, ErrorKind, RawDeviceInfo, UnmountError, UnmountTarget,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Result of one poll. `timed_out` is the probe-timeout signal; the
/// devices are still the best snapshot available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollReport {
    pub devices: Vec<DeviceRecord>,
    pub timed_out: bool,
}

impl PollReport {
    /// The recoverable condition attached to an otherwise usable result.
    pub fn condition(&self) -> Option<ErrorKind> {
        self.timed_out.then_some(ErrorKind::ProbeTimeout)
    }
}

type SharedOutcome = Option<Result<PollReport, String>>;

/// Owns every device record. All mutations go through the table's
/// write lock: poll diffs and unmount transitions.
pub struct DeviceRegistry {
    probe: Arc<dyn DeviceProbe>,
    probe_timeout: Duration,
    table: RwLock<BTreeMap<String, DeviceRecord>>,
    in_flight: Mutex<Option<watch::Receiver<SharedOutcome>>>,
}

impl DeviceRegistry {
    pub fn new(probe: Arc<dyn DeviceProbe>, probe_timeout: Duration) -> Self {
        Self {
            probe,
            probe_timeout,
            table: RwLock::new(BTreeMap::new()),
            in_flight: Mutex::new(None),
        }
    }

    /// Rescan and return the live snapshot ordered by id. Callers that
    /// arrive while a scan is running share its result.
    pub async fn poll(self: &Arc<Self>) -> Result<PollReport, DeviceError> {
        let mut rx = {
            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            match in_flight.as_ref() {
                Some(rx) => {
                    tracing::debug!("joining in-flight device scan");
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    *in_flight = Some(rx.clone());

                    let registry = Arc::clone(self);
                    tokio::spawn(async move {
                        let outcome = registry.scan().await.map_err(|e| match e {
                            DeviceError::Probe(message) => message,
                            other => other.to_string(),
                        });
                        *registry
                            .in_flight
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
                        let _ = tx.send(Some(outcome));
                    });
                    rx
                }
            }
        };

        let outcome = rx
            .wait_for(|outcome| outcome.is_some())
            .await
            .map_err(|_| DeviceError::Probe("scan worker exited without a result".to_string()))?
            .clone();

        match outcome {
            Some(Ok(report)) => Ok(report),
            Some(Err(message)) => Err(DeviceError::Probe(message)),
            None => Err(DeviceError::Probe("scan produced no result".to_string())),
        }
    }

    async fn scan(&self) -> Result<PollReport, DeviceError> {
        let sink = ScanSink::new();
        let probe = Arc::clone(&self.probe);
        let worker_sink = sink.clone();
        let started = Instant::now();

        tracing::debug!(probe = probe.name(), "starting device scan");
        let worker = tokio::task::spawn_blocking(move || probe.scan(&worker_sink));

        let (raw, timed_out) = match tokio::time::timeout(self.probe_timeout, worker).await {
            Ok(Ok(Ok(()))) => (sink.snapshot(), false),
            Ok(Ok(Err(err))) => {
                tracing::error!(error = %err, "device scan failed, keeping previous snapshot");
                return Err(err);
            }
            Ok(Err(join_err)) => {
                tracing::error!(error = %join_err, "device scan worker crashed");
                return Err(DeviceError::Probe(format!("scan worker failed: {}", join_err)));
            }
            Err(_) => {
                sink.cancel();
                tracing::warn!(
                    timeout_ms = self.probe_timeout.as_millis() as u64,
                    partial = sink.len(),
                    "device scan timed out, applying partial result"
                );
                (sink.snapshot(), true)
            }
        };

        let devices = self.apply_scan(raw, !timed_out);
        tracing::info!(
            devices = devices.len(),
            timed_out,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "device scan complete"
        );

        Ok(PollReport { devices, timed_out })
    }

    /// Diff a scan against the table. Only a complete scan may mark
    /// unseen devices as removed.
    pub(crate) fn apply_scan(&self, raw: Vec<RawDeviceInfo>, complete: bool) -> Vec<DeviceRecord> {
        let mut table = self.write();

        table.retain(|id, record| {
            let keep = record.state != DeviceState::Removed;
            if !keep {
                tracing::debug!(device_id = %id, "purging removed device");
            }
            keep
        });

        let mut seen = HashSet::new();
        for entry in raw {
            let fresh = normalize(entry, &table);
            if !seen.insert(fresh.id.clone()) {
                tracing::warn!(device_id = %fresh.id, "duplicate device in one scan, ignoring");
                continue;
            }

            match table.get_mut(&fresh.id) {
                Some(existing) => refresh(existing, fresh),
                None => {
                    tracing::info!(
                        device_id = %fresh.id,
                        bus = %fresh.bus_type,
                        state = %fresh.state,
                        mount_point = ?fresh.mount_point,
                        "device attached"
                    );
                    table.insert(fresh.id.clone(), fresh);
                }
            }
        }

        if complete {
            for record in table.values_mut() {
                if seen.contains(&record.id) {
                    continue;
                }
                if let Ok(from) = record.transition(DeviceState::Removed) {
                    if from != DeviceState::Removed {
                        tracing::info!(device_id = %record.id, %from, to = %DeviceState::Removed, "device removed");
                    }
                }
            }
        }

        live(&table)
    }

    /// Lookup against the last snapshot; never scans.
    pub fn get(&self, id: &str) -> Result<DeviceRecord, DeviceError> {
        self.read()
            .get(id)
            .filter(|record| record.state != DeviceState::Removed)
            .cloned()
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))
    }

    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        live(&self.read())
    }

    /// Move a MOUNTED record to UNMOUNTING and hand back what the
    /// ejector needs. A second caller sees UNMOUNTING and is refused.
    pub(crate) fn begin_unmount(&self, id: &str) -> Result<UnmountTarget, DeviceError> {
        let mut table = self.write();
        let record = table
            .get_mut(id)
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))?;

        let mount_point = match (&record.mount_point, record.state) {
            (Some(mount_point), DeviceState::Mounted) => mount_point.clone(),
            (_, state) => {
                return Err(DeviceError::InvalidState {
                    id: id.to_string(),
                    state,
                })
            }
        };

        record
            .transition(DeviceState::Unmounting)
            .map_err(|state| DeviceError::InvalidState {
                id: id.to_string(),
                state,
            })?;
        tracing::info!(
            device_id = %id,
            from = %DeviceState::Mounted,
            to = %DeviceState::Unmounting,
            mount_point = %mount_point.display(),
            "unmount started"
        );

        Ok(UnmountTarget {
            id: record.id.clone(),
            mount_point,
            device_path: record.device_path.clone(),
            volume_path: record.volume_path.clone(),
        })
    }

    /// Apply the OS outcome to a record still in UNMOUNTING.
    pub(crate) fn finish_unmount(&self, id: &str, outcome: &Result<(), UnmountError>) {
        let mut table = self.write();
        let Some(record) = table.get_mut(id) else {
            tracing::warn!(device_id = %id, "device purged before its unmount completed");
            return;
        };
        if record.state != DeviceState::Unmounting {
            tracing::warn!(
                device_id = %id,
                state = %record.state,
                "device changed state before its unmount completed"
            );
            return;
        }

        let to = match outcome {
            Ok(()) => DeviceState::Unmounted,
            Err(_) => DeviceState::Mounted,
        };
        if record.transition(to).is_ok() {
            if to == DeviceState::Unmounted {
                record.mount_point = None;
            }
            tracing::info!(device_id = %id, from = %DeviceState::Unmounting, %to, "unmount settled");
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, DeviceRecord>> {
        self.table
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, DeviceRecord>> {
        self.table
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn live(table: &BTreeMap<String, DeviceRecord>) -> Vec<DeviceRecord> {
    table
        .values()
        .filter(|record| record.state != DeviceState::Removed)
        .cloned()
        .collect()
}

/// Refresh an existing record from a new observation. UNMOUNTING belongs
/// to the unmount controller; everything else follows the observed mount.
fn refresh(existing: &mut DeviceRecord, fresh: DeviceRecord) {
    use DeviceState::*;

    let from = existing.state;
    let mounted = fresh.mount_point.is_some();
    let to = match (from, mounted) {
        (Unmounting, _) => Unmounting,
        (_, true) => Mounted,
        (Mounted, false) | (Unmounted, false) => Unmounted,
        (Attached, false) | (Removed, false) => Attached,
    };

    if from == Unmounting {
        let mount_point = existing.mount_point.take();
        let volume_path = existing.volume_path.take();
        *existing = DeviceRecord {
            state: Unmounting,
            mount_point,
            volume_path,
            ..fresh
        };
        return;
    }

    *existing = DeviceRecord { state: to, ..fresh };
    if from != to {
        tracing::info!(
            device_id = %existing.id,
            %from,
            %to,
            "mount state changed outside of this process"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{raw_device, MockPlatform};
    use std::path::PathBuf;

    fn registry(platform: &MockPlatform) -> Arc<DeviceRegistry> {
        Arc::new(DeviceRegistry::new(
            Arc::new(platform.clone()),
            Duration::from_millis(500),
        ))
    }

    #[tokio::test]
    async fn poll_orders_by_id() {
        let platform = MockPlatform::new();
        platform.set_devices(vec![
            raw_device("D3", Some("/media/d3")),
            raw_device("D1", Some("/media/d1")),
            raw_device("D2", None),
        ]);
        let registry = registry(&platform);

        let report = registry.poll().await.unwrap();
        let ids: Vec<_> = report.devices.iter().map(|d| d.id.clone()).collect();
        let mut sorted = ids.clone();
        sorted.sort();

        assert!(!report.timed_out);
        assert_eq!(ids.len(), 3);
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn removal_hides_then_purges() {
        let platform = MockPlatform::new();
        platform.set_devices(vec![raw_device("D1", Some("/media/d1"))]);
        let registry = registry(&platform);
        let id = registry.poll().await.unwrap().devices[0].id.clone();

        platform.set_devices(vec![]);
        assert!(registry.poll().await.unwrap().devices.is_empty());
        assert!(matches!(registry.get(&id), Err(DeviceError::NotFound(_))));
        assert!(matches!(
            registry.begin_unmount(&id),
            Err(DeviceError::InvalidState {
                state: DeviceState::Removed,
                ..
            })
        ));

        registry.poll().await.unwrap();
        assert!(matches!(registry.begin_unmount(&id), Err(DeviceError::NotFound(_))));
    }

    #[test]
    fn partial_scan_does_not_remove() {
        let platform = MockPlatform::new();
        let registry = registry(&platform);
        let first = registry.apply_scan(
            vec![raw_device("D1", Some("/media/d1")), raw_device("D2", None)],
            true,
        );
        assert_eq!(first.len(), 2);

        let partial = registry.apply_scan(vec![raw_device("D2", None)], false);
        assert_eq!(partial.len(), 2);
        assert!(registry.get(&first[0].id).is_ok());
    }

    #[test]
    fn external_mount_changes_are_observed() {
        let platform = MockPlatform::new();
        let registry = registry(&platform);
        let id = registry.apply_scan(vec![raw_device("D1", None)], true)[0].id.clone();
        assert_eq!(registry.get(&id).unwrap().state, DeviceState::Attached);

        registry.apply_scan(vec![raw_device("D1", Some("/media/d1"))], true);
        let record = registry.get(&id).unwrap();
        assert_eq!(record.state, DeviceState::Mounted);
        assert_eq!(record.mount_point, Some(PathBuf::from("/media/d1")));

        registry.apply_scan(vec![raw_device("D1", None)], true);
        assert_eq!(registry.get(&id).unwrap().state, DeviceState::Unmounted);
    }

    #[test]
    fn unmounting_survives_a_rescan() {
        let platform = MockPlatform::new();
        let registry = registry(&platform);
        let id = registry.apply_scan(vec![raw_device("D1", Some("/media/d1"))], true)[0]
            .id
            .clone();

        let target = registry.begin_unmount(&id).unwrap();
        assert_eq!(target.mount_point, PathBuf::from("/media/d1"));

        registry.apply_scan(vec![raw_device("D1", None)], true);
        let record = registry.get(&id).unwrap();
        assert_eq!(record.state, DeviceState::Unmounting);
        assert_eq!(record.mount_point, Some(PathBuf::from("/media/d1")));

        registry.finish_unmount(&id, &Ok(()));
        let record = registry.get(&id).unwrap();
        assert_eq!(record.state, DeviceState::Unmounted);
        assert_eq!(record.mount_point, None);
    }

    #[test]
    fn duplicate_entries_keep_the_first() {
        let platform = MockPlatform::new();
        let registry = registry(&platform);
        let mut second = raw_device("D1", Some("/media/other"));
        second.label = Some("SHADOW".into());

        let devices = registry.apply_scan(vec![raw_device("D1", Some("/media/d1")), second], true);
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].mount_point, Some(PathBuf::from("/media/d1")));
    }

    #[tokio::test]
    async fn probe_failure_keeps_snapshot() {
        let platform = MockPlatform::new();
        platform.set_devices(vec![raw_device("D1", Some("/media/d1"))]);
        let registry = registry(&platform);
        let id = registry.poll().await.unwrap().devices[0].id.clone();

        platform.fail_next_scan("lsblk exited with status 1");
        let err = registry.poll().await.unwrap_err();
        assert!(err.to_string().contains("lsblk"));
        assert_eq!(registry.get(&id).unwrap().state, DeviceState::Mounted);
    }
}
