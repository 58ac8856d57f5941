//! HTTP client for the coordinator control API

use crate::common::{BusyReason, Error, Result};
use crate::coordinator::{ElectionStatus, LeaderInfo};
use crate::volume::{Task, Volume, WorkloadInstance, WorkloadSpec};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Error body returned by the coordinator
#[derive(Debug, Deserialize)]
struct ApiError {
    error: String,
    #[serde(default)]
    retryable: bool,
}

#[derive(Clone)]
pub struct ControlClient {
    client: reqwest::Client,
    base_url: String,
}

impl ControlClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Current leader, `None` when the service reports no leader
    pub async fn leader(&self) -> Result<Option<LeaderInfo>> {
        let resp = self.client.get(self.url("/v2/leader")).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        json_body(resp).await.map(Some)
    }

    pub async fn leader_status(&self) -> Result<ElectionStatus> {
        let resp = self.client.get(self.url("/v2/leader/status")).send().await?;
        json_body(resp).await
    }

    /// Ask the leader to step down. With `expected` set the request fails
    /// with [`Error::StaleLeader`] when another member leads.
    pub async fn abdicate(&self, expected: Option<&str>) -> Result<()> {
        let mut req = self.client.delete(self.url("/v2/leader"));
        if let Some(expected) = expected {
            req = req.query(&[("expected", expected)]);
        }
        let resp = req.send().await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(Error::LeaderPending("no leader to abdicate".into())),
            StatusCode::CONFLICT => {
                let current = self.leader().await?.and_then(|l| l.leader_id);
                Err(Error::StaleLeader {
                    requested: expected.unwrap_or_default().to_string(),
                    current,
                })
            }
            _ => Err(api_error(resp).await),
        }
    }

    pub async fn volumes(&self) -> Result<Vec<Volume>> {
        #[derive(Deserialize)]
        struct Volumes {
            volumes: Vec<Volume>,
        }
        let resp = self.client.get(self.url("/v2/volumes")).send().await?;
        Ok(json_body::<Volumes>(resp).await?.volumes)
    }

    pub async fn volume(&self, name: &str) -> Result<Volume> {
        let resp = self
            .client
            .get(self.url(&format!("/v2/volumes/{}", name)))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::VolumeNotFound(name.to_string()));
        }
        json_body(resp).await
    }

    pub async fn detach_volume(&self, name: &str) -> Result<Volume> {
        let resp = self
            .client
            .post(self.url(&format!("/v2/volumes/{}/detach", name)))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::VolumeNotFound(name.to_string()));
        }
        json_body(resp).await
    }

    /// One destroy attempt. A refused release maps back to a transient
    /// [`Error::VolumeBusy`] so callers can retry it.
    pub async fn destroy_volume(&self, name: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.url(&format!("/v2/volumes/{}", name)))
            .send()
            .await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(Error::VolumeNotFound(name.to_string())),
            StatusCode::CONFLICT => {
                let body: ApiError = resp.json().await?;
                if body.retryable {
                    return Err(Error::VolumeBusy {
                        name: name.to_string(),
                        reason: BusyReason::ReleasePending,
                    });
                }
                let owner = self.volume(name).await?.owner.unwrap_or_default();
                Err(Error::VolumeBusy {
                    name: name.to_string(),
                    reason: BusyReason::AttachedTo(owner),
                })
            }
            _ => Err(api_error(resp).await),
        }
    }

    pub async fn apps(&self) -> Result<Vec<WorkloadInstance>> {
        #[derive(Deserialize)]
        struct Apps {
            apps: Vec<WorkloadInstance>,
        }
        let resp = self.client.get(self.url("/v2/apps")).send().await?;
        Ok(json_body::<Apps>(resp).await?.apps)
    }

    pub async fn deploy(&self, spec: &WorkloadSpec) -> Result<WorkloadInstance> {
        let resp = self
            .client
            .post(self.url("/v2/apps"))
            .json(spec)
            .send()
            .await?;
        json_body(resp).await
    }

    pub async fn scale(&self, id: &str, instances: usize) -> Result<WorkloadInstance> {
        let resp = self
            .client
            .put(self.url(&format!("/v2/apps/{}/scale", id)))
            .json(&json!({ "instances": instances }))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::WorkloadNotFound(id.to_string()));
        }
        json_body(resp).await
    }

    pub async fn tasks(&self, id: &str) -> Result<Vec<Task>> {
        #[derive(Deserialize)]
        struct Tasks {
            tasks: Vec<Task>,
        }
        let resp = self
            .client
            .get(self.url(&format!("/v2/apps/{}/tasks", id)))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::WorkloadNotFound(id.to_string()));
        }
        Ok(json_body::<Tasks>(resp).await?.tasks)
    }
}

async fn json_body<T: DeserializeOwned>(resp: Response) -> Result<T> {
    if !resp.status().is_success() {
        return Err(api_error(resp).await);
    }
    resp.json()
        .await
        .map_err(|e| Error::Http(format!("malformed response: {}", e)))
}

async fn api_error(resp: Response) -> Error {
    let status = resp.status();
    match resp.json::<ApiError>().await {
        Ok(body) => Error::Http(format!("{}: {}", status, body.error)),
        Err(_) => Error::Http(format!("unexpected status {}", status)),
    }
}
