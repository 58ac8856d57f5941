//! Volume lifecycle manager
//!
//! Sole owner of volume records. A volume name maps to exactly one physical
//! device for its whole life: detaching and reattaching rebinds the same
//! `storage_id`, and only `destroy` gives the device back to the backend.
//!
//! State machine:
//!
//! ```text
//! absent --create--> creating --attach--> attached <--reattach-- detached
//!                                            |                      ^
//!                                            +--------detach--------+
//! creating | detached --attach failure--> error --create--> creating
//! creating | detached | error --destroy--> absent
//! ```

use super::backend::StorageBackend;
use crate::common::{
    validate_name, BusyReason, Error, Result, RetryPolicy, VolumeConfig, METRICS,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeState {
    Absent,
    Creating,
    Attached,
    Detached,
    Error,
}

impl std::fmt::Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VolumeState::Absent => "absent",
            VolumeState::Creating => "creating",
            VolumeState::Attached => "attached",
            VolumeState::Detached => "detached",
            VolumeState::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    /// Identity of the physical device
    pub storage_id: Uuid,
    pub state: VolumeState,
    /// Owning workload while attached
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub detached_at: Option<DateTime<Utc>>,
}

pub struct VolumeManager {
    volumes: Mutex<BTreeMap<String, Volume>>,
    backend: Arc<dyn StorageBackend>,
    destroy_retry: RetryPolicy,
}

/// How a bind request reached the volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bind {
    Attach,
    Reattach,
    Reuse,
}

impl Bind {
    fn as_str(self) -> &'static str {
        match self {
            Bind::Attach => "attach",
            Bind::Reattach => "reattach",
            Bind::Reuse => "reuse",
        }
    }
}

impl VolumeManager {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            volumes: Mutex::new(BTreeMap::new()),
            backend,
            destroy_retry: VolumeConfig::default().destroy_retry,
        }
    }

    /// Policy used by [`destroy_with_default_retry`](Self::destroy_with_default_retry)
    pub fn with_destroy_retry(mut self, policy: RetryPolicy) -> Self {
        self.destroy_retry = policy;
        self
    }

    pub fn destroy_retry(&self) -> &RetryPolicy {
        &self.destroy_retry
    }

    /// Provision a new volume. It stays `creating` until bound to a workload.
    ///
    /// A name held by a volume in `error` is re-provisioned in place once the
    /// backend has released the broken device. If the release fails the error
    /// record, and with it the old `storage_id`, is kept.
    pub fn create(&self, name: &str) -> Result<Volume> {
        validate_name(name)?;
        let mut volumes = self.volumes.lock();
        self.create_locked(&mut volumes, name)
    }

    fn create_locked(
        &self,
        volumes: &mut BTreeMap<String, Volume>,
        name: &str,
    ) -> Result<Volume> {
        if let Some(existing) = volumes.get(name) {
            if existing.state != VolumeState::Error {
                return Err(Error::VolumeAlreadyExists(name.to_string()));
            }
            tracing::warn!(volume = name, "Re-provisioning volume left in error state");
            if let Err(e) = self.backend.release(existing.storage_id) {
                tracing::error!(
                    volume = name,
                    storage_id = %existing.storage_id,
                    error = %e,
                    "Could not release broken device, keeping error record"
                );
                return Err(e);
            }
        }

        let storage_id = self.backend.provision(name)?;
        let volume = Volume {
            name: name.to_string(),
            storage_id,
            state: VolumeState::Creating,
            owner: None,
            created_at: Utc::now(),
            detached_at: None,
        };
        volumes.insert(name.to_string(), volume.clone());
        METRICS.volume_transitions.inc();
        tracing::info!(volume = name, %storage_id, "Volume created");
        Ok(volume)
    }

    /// Bind a `creating` or `detached` volume to `workload_id`
    pub fn attach(&self, name: &str, workload_id: &str) -> Result<Volume> {
        let mut volumes = self.volumes.lock();
        self.bind_locked(&mut volumes, name, workload_id, Bind::Attach)
    }

    /// Rebind a detached volume, possibly to a different workload. The
    /// underlying device is reused. A volume still `creating` has never been
    /// bound and must go through [`attach`](Self::attach).
    pub fn reattach(&self, name: &str, workload_id: &str) -> Result<Volume> {
        let mut volumes = self.volumes.lock();
        self.bind_locked(&mut volumes, name, workload_id, Bind::Reattach)
    }

    fn bind_locked(
        &self,
        volumes: &mut BTreeMap<String, Volume>,
        name: &str,
        workload_id: &str,
        bind: Bind,
    ) -> Result<Volume> {
        let volume = volumes
            .get_mut(name)
            .ok_or_else(|| Error::VolumeNotFound(name.to_string()))?;

        match volume.state {
            VolumeState::Attached => {
                return match volume.owner.as_deref() {
                    Some(owner) if owner == workload_id => Ok(volume.clone()),
                    owner => Err(Error::VolumeBusy {
                        name: name.to_string(),
                        reason: BusyReason::AttachedTo(owner.unwrap_or_default().to_string()),
                    }),
                };
            }
            VolumeState::Error => {
                return Err(Error::Storage(format!(
                    "volume {} is in error state and must be recreated",
                    name
                )));
            }
            VolumeState::Creating if bind == Bind::Reattach => {
                return Err(Error::InvalidTransition {
                    name: name.to_string(),
                    operation: bind.as_str().to_string(),
                    state: volume.state.to_string(),
                });
            }
            VolumeState::Creating | VolumeState::Detached | VolumeState::Absent => {}
        }

        if let Err(e) = self.backend.attach(volume.storage_id, workload_id) {
            tracing::error!(volume = name, workload = workload_id, error = %e, "Attach failed");
            volume.state = VolumeState::Error;
            volume.owner = None;
            return Err(e);
        }

        volume.state = VolumeState::Attached;
        volume.owner = Some(workload_id.to_string());
        volume.detached_at = None;
        METRICS.volume_transitions.inc();
        tracing::info!(
            volume = name,
            workload = workload_id,
            storage_id = %volume.storage_id,
            op = bind.as_str(),
            "Volume attached"
        );
        Ok(volume.clone())
    }

    /// `attached -> detached`. The device is kept. Detaching a volume that is
    /// not attached is a no-op.
    pub fn detach(&self, name: &str) -> Result<Volume> {
        let mut volumes = self.volumes.lock();
        let volume = volumes
            .get_mut(name)
            .ok_or_else(|| Error::VolumeNotFound(name.to_string()))?;
        self.detach_record(volume)
    }

    /// Detach `name` only while it is bound to `workload_id`. A volume owned
    /// by another workload, or by none, is left alone.
    pub fn detach_from(&self, name: &str, workload_id: &str) -> Result<Volume> {
        let mut volumes = self.volumes.lock();
        let volume = volumes
            .get_mut(name)
            .ok_or_else(|| Error::VolumeNotFound(name.to_string()))?;

        if volume.owner.as_deref() != Some(workload_id) {
            tracing::debug!(
                volume = name,
                workload = workload_id,
                owner = ?volume.owner,
                "Volume not owned by workload, leaving it bound"
            );
            return Ok(volume.clone());
        }
        self.detach_record(volume)
    }

    fn detach_record(&self, volume: &mut Volume) -> Result<Volume> {
        if volume.state != VolumeState::Attached {
            tracing::debug!(volume = %volume.name, state = %volume.state, "Detach is a no-op");
            return Ok(volume.clone());
        }

        self.backend.detach(volume.storage_id)?;
        let previous = volume.owner.take();
        volume.state = VolumeState::Detached;
        volume.detached_at = Some(Utc::now());
        METRICS.volume_transitions.inc();
        tracing::info!(volume = %volume.name, workload = ?previous, "Volume detached");
        Ok(volume.clone())
    }

    /// Scale-up entry point: bind an existing volume or create one. Lookup,
    /// provisioning and bind happen under a single lock.
    pub fn create_or_reuse(&self, name: &str, workload_id: &str) -> Result<Volume> {
        validate_name(name)?;
        let mut volumes = self.volumes.lock();
        let reusable = volumes
            .get(name)
            .is_some_and(|v| v.state != VolumeState::Error);

        let bind = if reusable {
            Bind::Reuse
        } else {
            self.create_locked(&mut volumes, name)?;
            Bind::Attach
        };
        self.bind_locked(&mut volumes, name, workload_id, bind)
    }

    /// Permanently remove the volume and its device.
    ///
    /// An attached volume is never detached implicitly. The backend may
    /// report the device busy for a while after detach; that error is
    /// transient and the record is kept so the call can be repeated.
    pub fn destroy(&self, name: &str) -> Result<()> {
        let mut volumes = self.volumes.lock();
        let volume = volumes
            .get(name)
            .ok_or_else(|| Error::VolumeNotFound(name.to_string()))?;

        if volume.state == VolumeState::Attached {
            METRICS.volume_destroy_busy.inc();
            return Err(Error::VolumeBusy {
                name: name.to_string(),
                reason: BusyReason::AttachedTo(volume.owner.clone().unwrap_or_default()),
            });
        }

        if let Err(e) = self.backend.release(volume.storage_id) {
            METRICS.volume_destroy_busy.inc();
            tracing::warn!(volume = name, error = %e, "Destroy refused by storage backend");
            return Err(e);
        }

        volumes.remove(name);
        METRICS.volume_transitions.inc();
        tracing::info!(volume = name, "Volume destroyed");
        Ok(())
    }

    /// [`destroy`](Self::destroy), retrying transient busy errors under `policy`
    pub async fn destroy_with_retry(&self, name: &str, policy: &RetryPolicy) -> Result<()> {
        policy
            .run("destroy volume", || {
                let result = self.destroy(name);
                async move { result }
            })
            .await
    }

    /// [`destroy_with_retry`](Self::destroy_with_retry) under the configured policy
    pub async fn destroy_with_default_retry(&self, name: &str) -> Result<()> {
        self.destroy_with_retry(name, &self.destroy_retry).await
    }

    pub fn get(&self, name: &str) -> Result<Volume> {
        self.volumes
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::VolumeNotFound(name.to_string()))
    }

    /// State of `name`, `Absent` when unknown
    pub fn state(&self, name: &str) -> VolumeState {
        self.volumes
            .lock()
            .get(name)
            .map(|v| v.state)
            .unwrap_or(VolumeState::Absent)
    }

    pub fn list(&self) -> Vec<Volume> {
        self.volumes.lock().values().cloned().collect()
    }
}
