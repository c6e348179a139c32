//! Compute Engine v1 over its JSON REST API.

mod auth;
mod operation;

use async_trait::async_trait;
use gpufleet_core::compute::{
    ComputeClient, ComputeResult, Disk, Firewall, Instance, LabelFilter, Metadata, Network,
    Scheduling, Subnetwork, Tags,
};
use gpufleet_core::error::ComputeError;
use gpufleet_core::operation::OperationHandle;
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use auth::{Credentials, TOKEN_ENV};
pub use operation::RemoteOperation;

use auth::TokenCache;

const BASE_URL: &str = "https://compute.googleapis.com/compute/v1";
const PAGE_SIZE: &str = "500";

/// Request plumbing shared by the client and its operation handles.
#[derive(Clone)]
pub(crate) struct Api {
    http: reqwest::Client,
    token: TokenCache,
    base_url: String,
}

impl Api {
    pub(crate) fn url(&self, path: &str) -> String {
        if path.starts_with("https://") || path.starts_with("http://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    pub(crate) async fn get<T: DeserializeOwned>(
        &self,
        what: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> ComputeResult<T> {
        debug!(resource = what, "GET {path}");
        let token = self.token.get().await?;
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(token)
            .header("accept", "application/json")
            .query(query)
            .send()
            .await
            .map_err(|e| ComputeError::Transport(e.to_string()))?;
        decode(what, response).await
    }

    /// Issue a mutating call and return the operation it started.
    async fn mutate<B: Serialize + ?Sized>(
        &self,
        method: Method,
        what: &str,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> ComputeResult<OperationHandle> {
        let request_id = uuid::Uuid::new_v4().to_string();
        debug!(resource = what, request_id = %request_id, "{method} {path}");
        let token = self.token.get().await?;
        let mut request = self
            .http
            .request(method, self.url(path))
            .bearer_auth(token)
            .header("accept", "application/json")
            .query(query)
            .query(&[("requestId", request_id.as_str())]);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ComputeError::Transport(e.to_string()))?;
        let resource = decode(what, response).await?;
        Ok(Box::new(RemoteOperation::new(self.clone(), resource)))
    }
}

/// Map an HTTP response to a value, keeping not-found and already-exists apart.
async fn decode<T: DeserializeOwned>(what: &str, response: Response) -> ComputeResult<T> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| ComputeError::Transport(format!("failed to read response body: {e}")))?;
    if !status.is_success() {
        return Err(status_error(what, status, &text));
    }
    serde_json::from_str(&text)
        .map_err(|e| ComputeError::Decode(format!("{what}: {e} - response body: {text}")))
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
}

fn status_error(what: &str, status: StatusCode, body: &str) -> ComputeError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| body.to_string());
    match status {
        StatusCode::NOT_FOUND => ComputeError::NotFound(what.to_string()),
        StatusCode::CONFLICT => ComputeError::AlreadyExists(what.to_string()),
        _ => ComputeError::Api {
            status: status.as_u16(),
            message,
        },
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstancePage {
    #[serde(default)]
    items: Vec<Instance>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// A [`ComputeClient`] bound to one project and zone.
pub struct GoogleCompute {
    api: Api,
    project: String,
    zone: String,
    region: String,
}

impl GoogleCompute {
    /// The token is resolved on the first request, not here.
    pub fn new(
        project: impl Into<String>,
        zone: impl Into<String>,
        region: impl Into<String>,
        credentials: Credentials,
    ) -> Self {
        Self {
            api: Api {
                http: reqwest::Client::new(),
                token: TokenCache::new(credentials),
                base_url: BASE_URL.to_string(),
            },
            project: project.into(),
            zone: zone.into(),
            region: region.into(),
        }
    }

    /// Point the client at another endpoint, e.g. a local emulator.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.api.base_url = base_url.into();
        self
    }

    fn global(&self, kind: &str) -> String {
        format!("projects/{}/global/{kind}", self.project)
    }

    fn regional(&self, kind: &str) -> String {
        format!("projects/{}/regions/{}/{kind}", self.project, self.region)
    }

    fn zonal(&self, kind: &str) -> String {
        format!("projects/{}/zones/{}/{kind}", self.project, self.zone)
    }

    fn instance_path(&self, name: &str) -> String {
        format!("{}/{name}", self.zonal("instances"))
    }

    async fn instance_action<B: Serialize + ?Sized>(
        &self,
        name: &str,
        action: &str,
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> ComputeResult<OperationHandle> {
        let path = format!("{}/{action}", self.instance_path(name));
        self.api
            .mutate(Method::POST, &format!("instance {name}"), &path, query, body)
            .await
    }
}

/// Body for calls that carry none.
const NO_BODY: Option<&()> = None;

#[async_trait]
impl ComputeClient for GoogleCompute {
    async fn get_network(&self, name: &str) -> ComputeResult<Network> {
        let path = format!("{}/{name}", self.global("networks"));
        self.api.get(&format!("network {name}"), &path, &[]).await
    }

    async fn insert_network(&self, network: &Network) -> ComputeResult<OperationHandle> {
        let what = format!("network {}", network.name);
        self.api
            .mutate(Method::POST, &what, &self.global("networks"), &[], Some(network))
            .await
    }

    async fn delete_network(&self, name: &str) -> ComputeResult<OperationHandle> {
        let path = format!("{}/{name}", self.global("networks"));
        self.api
            .mutate(Method::DELETE, &format!("network {name}"), &path, &[], NO_BODY)
            .await
    }

    async fn get_subnetwork(&self, name: &str) -> ComputeResult<Subnetwork> {
        let path = format!("{}/{name}", self.regional("subnetworks"));
        self.api.get(&format!("subnetwork {name}"), &path, &[]).await
    }

    async fn insert_subnetwork(&self, subnetwork: &Subnetwork) -> ComputeResult<OperationHandle> {
        let what = format!("subnetwork {}", subnetwork.name);
        self.api
            .mutate(Method::POST, &what, &self.regional("subnetworks"), &[], Some(subnetwork))
            .await
    }

    async fn delete_subnetwork(&self, name: &str) -> ComputeResult<OperationHandle> {
        let path = format!("{}/{name}", self.regional("subnetworks"));
        self.api
            .mutate(Method::DELETE, &format!("subnetwork {name}"), &path, &[], NO_BODY)
            .await
    }

    async fn get_firewall(&self, name: &str) -> ComputeResult<Firewall> {
        let path = format!("{}/{name}", self.global("firewalls"));
        self.api.get(&format!("firewall {name}"), &path, &[]).await
    }

    async fn insert_firewall(&self, firewall: &Firewall) -> ComputeResult<OperationHandle> {
        let what = format!("firewall {}", firewall.name);
        self.api
            .mutate(Method::POST, &what, &self.global("firewalls"), &[], Some(firewall))
            .await
    }

    async fn patch_firewall(&self, name: &str, firewall: &Firewall) -> ComputeResult<OperationHandle> {
        let path = format!("{}/{name}", self.global("firewalls"));
        self.api
            .mutate(Method::PATCH, &format!("firewall {name}"), &path, &[], Some(firewall))
            .await
    }

    async fn delete_firewall(&self, name: &str) -> ComputeResult<OperationHandle> {
        let path = format!("{}/{name}", self.global("firewalls"));
        self.api
            .mutate(Method::DELETE, &format!("firewall {name}"), &path, &[], NO_BODY)
            .await
    }

    async fn get_instance(&self, name: &str) -> ComputeResult<Instance> {
        self.api
            .get(&format!("instance {name}"), &self.instance_path(name), &[])
            .await
    }

    /// Follows `nextPageToken` until the listing is exhausted.
    async fn list_instances(&self, filter: &LabelFilter) -> ComputeResult<Vec<Instance>> {
        let path = self.zonal("instances");
        let expression = filter.expression();
        let mut instances = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![("filter", expression.as_str()), ("maxResults", PAGE_SIZE)];
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }
            let page: InstancePage = self.api.get("instances", &path, &query).await?;
            instances.extend(page.items);
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        debug!(filter = %expression, count = instances.len(), "listed instances");
        Ok(instances)
    }

    async fn insert_instance(&self, instance: &Instance) -> ComputeResult<OperationHandle> {
        let what = format!("instance {}", instance.name);
        self.api
            .mutate(Method::POST, &what, &self.zonal("instances"), &[], Some(instance))
            .await
    }

    async fn start_instance(&self, name: &str) -> ComputeResult<OperationHandle> {
        self.instance_action(name, "start", &[], NO_BODY).await
    }

    async fn stop_instance(&self, name: &str) -> ComputeResult<OperationHandle> {
        self.instance_action(name, "stop", &[], NO_BODY).await
    }

    async fn delete_instance(&self, name: &str) -> ComputeResult<OperationHandle> {
        self.api
            .mutate(
                Method::DELETE,
                &format!("instance {name}"),
                &self.instance_path(name),
                &[],
                NO_BODY,
            )
            .await
    }

    async fn set_instance_scheduling(
        &self,
        name: &str,
        scheduling: &Scheduling,
    ) -> ComputeResult<OperationHandle> {
        self.instance_action(name, "setScheduling", &[], Some(scheduling))
            .await
    }

    async fn set_instance_tags(&self, name: &str, tags: &Tags) -> ComputeResult<OperationHandle> {
        self.instance_action(name, "setTags", &[], Some(tags)).await
    }

    async fn set_instance_metadata(
        &self,
        name: &str,
        metadata: &Metadata,
    ) -> ComputeResult<OperationHandle> {
        self.instance_action(name, "setMetadata", &[], Some(metadata))
            .await
    }

    async fn set_disk_auto_delete(
        &self,
        instance: &str,
        device_name: &str,
        auto_delete: bool,
    ) -> ComputeResult<OperationHandle> {
        let flag = if auto_delete { "true" } else { "false" };
        self.instance_action(
            instance,
            "setDiskAutoDelete",
            &[("autoDelete", flag), ("deviceName", device_name)],
            NO_BODY,
        )
        .await
    }

    async fn get_disk(&self, name: &str) -> ComputeResult<Disk> {
        let path = format!("{}/{name}", self.zonal("disks"));
        self.api.get(&format!("disk {name}"), &path, &[]).await
    }
}
