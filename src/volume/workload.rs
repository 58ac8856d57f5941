//! Workload manager
//!
//! Deploys workloads onto the configured agent inventory and turns scale
//! events into volume transitions: scale-up binds the workload's volume with
//! create-or-reuse, scale-to-zero detaches it. The volume outlives the tasks.

use super::manager::VolumeManager;
use crate::common::{validate_name, AgentConfig, AgentRole, Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Deployment request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub id: String,
    #[serde(default = "default_instances")]
    pub instances: usize,
    /// External volume bound to the workload
    #[serde(default)]
    pub volume: Option<String>,
    /// Only place tasks on agents with this role
    #[serde(default)]
    pub constraint: Option<AgentRole>,
}

fn default_instances() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub workload_id: String,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadInstance {
    pub id: String,
    pub instances: usize,
    pub volume: Option<String>,
    pub constraint: Option<AgentRole>,
    pub tasks: Vec<Task>,
}

pub struct WorkloadManager {
    workloads: Mutex<BTreeMap<String, WorkloadInstance>>,
    agents: Vec<AgentConfig>,
    volumes: Arc<VolumeManager>,
}

impl WorkloadManager {
    pub fn new(agents: Vec<AgentConfig>, volumes: Arc<VolumeManager>) -> Self {
        Self {
            workloads: Mutex::new(BTreeMap::new()),
            agents,
            volumes,
        }
    }

    pub fn volumes(&self) -> &Arc<VolumeManager> {
        &self.volumes
    }

    pub fn deploy(&self, spec: WorkloadSpec) -> Result<WorkloadInstance> {
        validate_name(&spec.id)?;
        check_instances(&spec.volume, spec.instances)?;
        // Fail before touching storage when nothing can run the tasks
        self.candidates(spec.constraint)?;

        let mut workloads = self.workloads.lock();
        if workloads.contains_key(&spec.id) {
            return Err(Error::WorkloadAlreadyExists(spec.id));
        }

        let mut workload = WorkloadInstance {
            id: spec.id.clone(),
            instances: 0,
            volume: spec.volume,
            constraint: spec.constraint,
            tasks: Vec::new(),
        };
        self.apply_scale(&mut workload, spec.instances)?;
        workloads.insert(spec.id.clone(), workload.clone());
        tracing::info!(
            workload = %spec.id,
            instances = workload.instances,
            volume = ?workload.volume,
            "Workload deployed"
        );
        Ok(workload)
    }

    pub fn scale(&self, id: &str, instances: usize) -> Result<WorkloadInstance> {
        let mut workloads = self.workloads.lock();
        let workload = workloads
            .get_mut(id)
            .ok_or_else(|| Error::WorkloadNotFound(id.to_string()))?;
        check_instances(&workload.volume, instances)?;

        let from = workload.instances;
        self.apply_scale(workload, instances)?;
        tracing::info!(workload = id, from, to = instances, "Workload scaled");
        Ok(workload.clone())
    }

    pub fn stop(&self, id: &str) -> Result<WorkloadInstance> {
        self.scale(id, 0)
    }

    /// Stop the workload and forget it. Its volume stays, detached.
    pub fn remove(&self, id: &str) -> Result<()> {
        let mut workloads = self.workloads.lock();
        let workload = workloads
            .get_mut(id)
            .ok_or_else(|| Error::WorkloadNotFound(id.to_string()))?;
        self.apply_scale(workload, 0)?;
        workloads.remove(id);
        tracing::info!(workload = id, "Workload removed");
        Ok(())
    }

    pub fn tasks(&self, id: &str) -> Result<Vec<Task>> {
        Ok(self.get(id)?.tasks)
    }

    pub fn get(&self, id: &str) -> Result<WorkloadInstance> {
        self.workloads
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::WorkloadNotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<WorkloadInstance> {
        self.workloads.lock().values().cloned().collect()
    }

    fn apply_scale(&self, workload: &mut WorkloadInstance, instances: usize) -> Result<()> {
        if instances == 0 {
            // Another workload may have taken the volume since this one
            // stopped; only our own binding is released.
            if let Some(volume) = &workload.volume {
                match self.volumes.detach_from(volume, &workload.id) {
                    Ok(_) | Err(Error::VolumeNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            workload.tasks.clear();
            workload.instances = 0;
            return Ok(());
        }

        let hosts = self.candidates(workload.constraint)?;
        if let Some(volume) = &workload.volume {
            self.volumes.create_or_reuse(volume, &workload.id)?;
        }

        workload.tasks.truncate(instances);
        while workload.tasks.len() < instances {
            let host = hosts[workload.tasks.len() % hosts.len()].clone();
            workload.tasks.push(Task {
                id: format!("{}.{}", workload.id, Uuid::new_v4()),
                workload_id: workload.id.clone(),
                host,
            });
        }
        workload.instances = instances;
        Ok(())
    }

    /// Hosts allowed by `constraint`, in configuration order
    fn candidates(&self, constraint: Option<AgentRole>) -> Result<Vec<String>> {
        let hosts: Vec<String> = self
            .agents
            .iter()
            .filter(|a| constraint.map_or(true, |role| a.role == role))
            .map(|a| a.host.clone())
            .collect();
        if hosts.is_empty() {
            return Err(Error::NoMatchingAgent(
                constraint.map_or_else(|| "any".to_string(), |r| r.to_string()),
            ));
        }
        Ok(hosts)
    }
}

/// An external volume has a single writer
fn check_instances(volume: &Option<String>, instances: usize) -> Result<()> {
    if volume.is_some() && instances > 1 {
        return Err(Error::InvalidConfig(
            "workloads with an external volume run at most one instance".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::backend::{FaultyBackend, InMemoryBackend};
    use crate::volume::manager::VolumeState;
    use std::sync::atomic::Ordering;

    fn agents() -> Vec<AgentConfig> {
        vec![
            AgentConfig {
                host: "10.0.1.1".into(),
                role: AgentRole::Private,
            },
            AgentConfig {
                host: "10.0.1.2".into(),
                role: AgentRole::Private,
            },
            AgentConfig {
                host: "10.0.2.1".into(),
                role: AgentRole::Public,
            },
        ]
    }

    fn setup() -> (WorkloadManager, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::default());
        let volumes = Arc::new(VolumeManager::new(backend.clone()));
        (WorkloadManager::new(agents(), volumes), backend)
    }

    fn spec(id: &str, instances: usize) -> WorkloadSpec {
        WorkloadSpec {
            id: id.into(),
            instances,
            volume: None,
            constraint: None,
        }
    }

    #[test]
    fn test_deploy_and_scale() {
        let (workloads, _) = setup();
        let deployed = workloads.deploy(spec("web", 3)).unwrap();
        assert_eq!(deployed.tasks.len(), 3);
        assert!(deployed.tasks.iter().all(|t| t.workload_id == "web"));

        let scaled = workloads.scale("web", 1).unwrap();
        assert_eq!(scaled.tasks.len(), 1);
        assert_eq!(scaled.tasks[0].id, deployed.tasks[0].id);

        assert!(workloads.stop("web").unwrap().tasks.is_empty());
    }

    #[test]
    fn test_duplicate_and_unknown() {
        let (workloads, _) = setup();
        workloads.deploy(spec("web", 1)).unwrap();
        assert!(matches!(
            workloads.deploy(spec("web", 1)),
            Err(Error::WorkloadAlreadyExists(_))
        ));
        assert!(matches!(
            workloads.scale("nope", 2),
            Err(Error::WorkloadNotFound(_))
        ));
        assert!(matches!(workloads.tasks("nope"), Err(Error::WorkloadNotFound(_))));
    }

    #[test]
    fn test_public_constraint() {
        let (workloads, _) = setup();
        let mut public = spec("edge", 2);
        public.constraint = Some(AgentRole::Public);
        let deployed = workloads.deploy(public).unwrap();
        assert!(deployed.tasks.iter().all(|t| t.host == "10.0.2.1"));
    }

    #[test]
    fn test_no_matching_agent() {
        let volumes = Arc::new(VolumeManager::new(Arc::new(InMemoryBackend::default())));
        let workloads = WorkloadManager::new(
            vec![AgentConfig {
                host: "10.0.1.1".into(),
                role: AgentRole::Private,
            }],
            volumes.clone(),
        );
        let mut public = spec("edge", 1);
        public.constraint = Some(AgentRole::Public);
        public.volume = Some("vol-edge".into());

        assert!(matches!(
            workloads.deploy(public),
            Err(Error::NoMatchingAgent(_))
        ));
        // Nothing provisioned for a deployment that cannot run
        assert!(volumes.list().is_empty());
    }

    #[test]
    fn test_volume_follows_scale() {
        let (workloads, backend) = setup();
        let mut stateful = spec("db", 1);
        stateful.volume = Some("vol-db".into());
        workloads.deploy(stateful).unwrap();

        let volumes = workloads.volumes().clone();
        let first = volumes.get("vol-db").unwrap();
        assert_eq!(first.state, VolumeState::Attached);
        assert_eq!(first.owner.as_deref(), Some("db"));

        workloads.scale("db", 0).unwrap();
        assert_eq!(volumes.state("vol-db"), VolumeState::Detached);

        workloads.scale("db", 1).unwrap();
        let again = volumes.get("vol-db").unwrap();
        assert_eq!(again.state, VolumeState::Attached);
        assert_eq!(again.storage_id, first.storage_id);
        assert_eq!(backend.provisioned_count(), 1);

        workloads.remove("db").unwrap();
        assert_eq!(volumes.state("vol-db"), VolumeState::Detached);
        assert!(workloads.list().is_empty());
    }

    #[test]
    fn test_single_instance_with_volume() {
        let (workloads, _) = setup();
        let mut stateful = spec("db", 2);
        stateful.volume = Some("vol-db".into());
        assert!(matches!(
            workloads.deploy(stateful),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_stale_workload_leaves_volume_of_new_owner() {
        let (workloads, _) = setup();
        let volumes = workloads.volumes().clone();
        let mut first = spec("w1", 1);
        first.volume = Some("vol-a".into());
        workloads.deploy(first).unwrap();
        workloads.stop("w1").unwrap();

        let mut second = spec("w2", 1);
        second.volume = Some("vol-a".into());
        workloads.deploy(second).unwrap();

        workloads.stop("w1").unwrap();
        workloads.remove("w1").unwrap();

        let volume = volumes.get("vol-a").unwrap();
        assert_eq!(volume.state, VolumeState::Attached);
        assert_eq!(volume.owner.as_deref(), Some("w2"));
        assert_eq!(workloads.tasks("w2").unwrap().len(), 1);
    }

    #[test]
    fn test_failed_detach_keeps_tasks() {
        let backend = Arc::new(FaultyBackend::default());
        let volumes = Arc::new(VolumeManager::new(backend.clone()));
        let workloads = WorkloadManager::new(agents(), volumes.clone());
        let mut stateful = spec("db", 1);
        stateful.volume = Some("vol-db".into());
        let deployed = workloads.deploy(stateful).unwrap();

        backend.fail_detach.store(true, Ordering::SeqCst);
        assert!(matches!(workloads.stop("db"), Err(Error::Storage(_))));
        let kept = workloads.get("db").unwrap();
        assert_eq!(kept.instances, 1);
        assert_eq!(kept.tasks, deployed.tasks);
        assert_eq!(volumes.state("vol-db"), VolumeState::Attached);

        assert!(workloads.remove("db").is_err());
        assert!(workloads.get("db").is_ok());

        backend.fail_detach.store(false, Ordering::SeqCst);
        workloads.remove("db").unwrap();
        assert_eq!(volumes.state("vol-db"), VolumeState::Detached);
    }

    #[test]
    fn test_remove_after_volume_destroyed() {
        let (workloads, _) = setup();
        let volumes = workloads.volumes().clone();
        let mut stateful = spec("db", 1);
        stateful.volume = Some("vol-db".into());
        workloads.deploy(stateful).unwrap();
        workloads.stop("db").unwrap();
        volumes.destroy("vol-db").unwrap();

        workloads.remove("db").unwrap();
        assert!(workloads.list().is_empty());
    }
}
