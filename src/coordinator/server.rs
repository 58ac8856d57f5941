//! Coordinator server

use crate::common::{timestamp_now_millis, Config, Result};
use crate::coordinator::election::{start_election_tasks, ElectionEngine};
use crate::coordinator::http::{create_router, CoordState, RouterLimits};
use crate::coordinator::membership::{start_membership_tasks, MembershipStore};
use crate::volume::{InMemoryBackend, VolumeManager, WorkloadManager};
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub struct Coordinator {
    config: Config,
    state: CoordState,
}

impl Coordinator {
    pub fn new(config: Config) -> Self {
        let membership = Arc::new(MembershipStore::from_config(
            &config.membership,
            &config.members,
        ));
        let election = Arc::new(ElectionEngine::new(membership.clone()));
        let backend = Arc::new(InMemoryBackend::new(Duration::from_millis(
            config.volumes.release_delay_ms,
        )));
        let volumes = Arc::new(
            VolumeManager::new(backend).with_destroy_retry(config.volumes.destroy_retry.clone()),
        );
        let workloads = Arc::new(WorkloadManager::new(
            config.agents.clone(),
            volumes.clone(),
        ));

        let state = CoordState {
            node_id: config.node_id.clone(),
            membership,
            election,
            volumes,
            workloads,
        };
        Self { config, state }
    }

    pub fn state(&self) -> &CoordState {
        &self.state
    }

    pub fn router(&self) -> Router {
        create_router(
            self.state.clone(),
            RouterLimits {
                request_timeout: self.config.coordinator.request_timeout(),
                max_body_bytes: self.config.coordinator.max_body_bytes,
            },
        )
    }

    /// Bind the configured address and serve until Ctrl-C
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.coordinator.bind_addr).await?;
        self.serve_on(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve_on<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!("Starting coordinator: {}", self.config.node_id);
        tracing::info!("  HTTP API: {}", listener.local_addr()?);
        tracing::info!("  Members: {}", self.config.members.len());
        tracing::info!("  Agents: {}", self.config.agents.len());

        let tasks = self.start_tasks();
        let router = self.router();

        tracing::info!("Coordinator ready ({})", self.state.election.status());
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await;

        for task in tasks {
            task.abort();
        }
        if let Err(e) = &result {
            tracing::error!("HTTP server error: {}", e);
        }
        tracing::info!("Coordinator stopped");
        Ok(result?)
    }

    fn start_tasks(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![
            start_membership_tasks(
                self.state.membership.clone(),
                self.config.membership.clone(),
            ),
            start_election_tasks(self.state.election.clone(), self.config.election.clone()),
        ];

        // A coordinator listed among the members keeps itself alive
        if self.state.membership.get(&self.config.node_id).is_some() {
            let membership = self.state.membership.clone();
            let node_id = self.config.node_id.clone();
            let period = self.config.membership.heartbeat_timeout() / 3;
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
                loop {
                    interval.tick().await;
                    membership.upsert_heartbeat(&node_id, timestamp_now_millis());
                }
            }));
        }
        tasks
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
