//! Storage backends for external volumes
//!
//! A backend owns the physical devices. Cloud block storage keeps a device
//! busy for a while after it is detached, so `release` may refuse with a
//! transient [`BusyReason::ReleasePending`] that callers retry.

use crate::common::{BusyReason, Error, Result, METRICS};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

pub trait StorageBackend: Send + Sync {
    /// Create a new physical device for `name`
    fn provision(&self, name: &str) -> Result<Uuid>;

    fn attach(&self, storage_id: Uuid, workload_id: &str) -> Result<()>;

    fn detach(&self, storage_id: Uuid) -> Result<()>;

    /// Permanently remove the device
    fn release(&self, storage_id: Uuid) -> Result<()>;
}

#[derive(Debug)]
struct Device {
    name: String,
    attached_to: Option<String>,
    detached_at: Option<Instant>,
}

/// In-process backend that models delayed release after detach
pub struct InMemoryBackend {
    devices: Mutex<HashMap<Uuid, Device>>,
    release_delay: Duration,
    provisioned: AtomicU64,
}

impl InMemoryBackend {
    pub fn new(release_delay: Duration) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            release_delay,
            provisioned: AtomicU64::new(0),
        }
    }

    /// Devices ever provisioned
    pub fn provisioned_count(&self) -> u64 {
        self.provisioned.load(Ordering::SeqCst)
    }

    pub fn exists(&self, storage_id: Uuid) -> bool {
        self.devices.lock().contains_key(&storage_id)
    }

    pub fn attached_to(&self, storage_id: Uuid) -> Option<String> {
        self.devices
            .lock()
            .get(&storage_id)
            .and_then(|d| d.attached_to.clone())
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl StorageBackend for InMemoryBackend {
    fn provision(&self, name: &str) -> Result<Uuid> {
        let storage_id = Uuid::new_v4();
        self.devices.lock().insert(
            storage_id,
            Device {
                name: name.to_string(),
                attached_to: None,
                detached_at: None,
            },
        );
        self.provisioned.fetch_add(1, Ordering::SeqCst);
        METRICS.volumes_provisioned.inc();
        tracing::info!(volume = name, %storage_id, "Provisioned device");
        Ok(storage_id)
    }

    fn attach(&self, storage_id: Uuid, workload_id: &str) -> Result<()> {
        let mut devices = self.devices.lock();
        let device = devices
            .get_mut(&storage_id)
            .ok_or_else(|| Error::Storage(format!("unknown device {}", storage_id)))?;
        device.attached_to = Some(workload_id.to_string());
        device.detached_at = None;
        Ok(())
    }

    fn detach(&self, storage_id: Uuid) -> Result<()> {
        let mut devices = self.devices.lock();
        let device = devices
            .get_mut(&storage_id)
            .ok_or_else(|| Error::Storage(format!("unknown device {}", storage_id)))?;
        if device.attached_to.take().is_some() {
            device.detached_at = Some(Instant::now());
        }
        Ok(())
    }

    fn release(&self, storage_id: Uuid) -> Result<()> {
        let mut devices = self.devices.lock();
        let Some(device) = devices.get(&storage_id) else {
            // Already gone
            return Ok(());
        };

        let still_held = device.attached_to.is_some()
            || device
                .detached_at
                .is_some_and(|at| at.elapsed() < self.release_delay);
        if still_held {
            return Err(Error::VolumeBusy {
                name: device.name.clone(),
                reason: BusyReason::ReleasePending,
            });
        }

        if let Some(device) = devices.remove(&storage_id) {
            tracing::info!(volume = %device.name, %storage_id, "Released device");
        }
        Ok(())
    }
}

/// In-memory backend with switchable failures
#[cfg(test)]
#[derive(Default)]
pub(crate) struct FaultyBackend {
    pub inner: InMemoryBackend,
    pub fail_attach: std::sync::atomic::AtomicBool,
    pub fail_detach: std::sync::atomic::AtomicBool,
    pub fail_release: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FaultyBackend {
    fn check(flag: &std::sync::atomic::AtomicBool, what: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(Error::Storage(format!("{} failed: device offline", what)));
        }
        Ok(())
    }
}

#[cfg(test)]
impl StorageBackend for FaultyBackend {
    fn provision(&self, name: &str) -> Result<Uuid> {
        self.inner.provision(name)
    }

    fn attach(&self, storage_id: Uuid, workload_id: &str) -> Result<()> {
        Self::check(&self.fail_attach, "attach")?;
        self.inner.attach(storage_id, workload_id)
    }

    fn detach(&self, storage_id: Uuid) -> Result<()> {
        Self::check(&self.fail_detach, "detach")?;
        self.inner.detach(storage_id)
    }

    fn release(&self, storage_id: Uuid) -> Result<()> {
        Self::check(&self.fail_release, "release")?;
        self.inner.release(storage_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provision_attach_release() {
        let backend = InMemoryBackend::default();
        let id = backend.provision("vol-a").unwrap();
        assert_eq!(backend.provisioned_count(), 1);

        backend.attach(id, "w1").unwrap();
        assert_eq!(backend.attached_to(id).as_deref(), Some("w1"));
        assert!(matches!(
            backend.release(id),
            Err(Error::VolumeBusy {
                reason: BusyReason::ReleasePending,
                ..
            })
        ));

        backend.detach(id).unwrap();
        backend.release(id).unwrap();
        assert!(!backend.exists(id));
        // Releasing twice is harmless
        backend.release(id).unwrap();
    }

    #[test]
    fn test_release_delay() {
        let backend = InMemoryBackend::new(Duration::from_millis(50));
        let id = backend.provision("vol-b").unwrap();
        backend.attach(id, "w1").unwrap();
        backend.detach(id).unwrap();

        assert!(backend.release(id).is_err());
        std::thread::sleep(Duration::from_millis(60));
        assert!(backend.release(id).is_ok());
    }

    #[test]
    fn test_unknown_device() {
        let backend = InMemoryBackend::default();
        assert!(matches!(
            backend.attach(Uuid::new_v4(), "w1"),
            Err(Error::Storage(_))
        ));
    }
}
