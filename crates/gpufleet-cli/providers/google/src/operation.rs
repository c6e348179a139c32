use async_trait::async_trait;
use gpufleet_core::error::ComputeError;
use gpufleet_core::operation::Operation;
use serde::Deserialize;

use crate::Api;

/// The provider's operation resource, zonal, regional or global.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OperationResource {
    pub name: String,
    /// PENDING, RUNNING or DONE.
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub progress: Option<i32>,
    #[serde(default)]
    pub self_link: String,
    #[serde(default)]
    pub error: Option<OperationErrors>,
    #[serde(default)]
    pub http_error_message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct OperationErrors {
    #[serde(default)]
    pub errors: Vec<OperationErrorItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct OperationErrorItem {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl OperationResource {
    fn is_done(&self) -> bool {
        self.status == "DONE"
    }

    /// Joined error messages of a finished operation, if it failed.
    fn failure(&self) -> Option<String> {
        let errors = self.error.as_ref()?;
        if errors.errors.is_empty() {
            return self
                .http_error_message
                .clone()
                .or_else(|| Some("operation reported an error".to_string()));
        }
        let joined = errors
            .errors
            .iter()
            .map(|e| match (e.code.is_empty(), e.message.is_empty()) {
                (false, false) => format!("{}: {}", e.code, e.message),
                (true, _) => e.message.clone(),
                (false, true) => e.code.clone(),
            })
            .collect::<Vec<_>>()
            .join("; ");
        Some(joined)
    }
}

/// Handle for an operation started by a mutating call; polling re-reads it
/// through its self link.
pub struct RemoteOperation {
    api: Api,
    resource: OperationResource,
}

impl RemoteOperation {
    pub(crate) fn new(api: Api, resource: OperationResource) -> Self {
        Self { api, resource }
    }

    fn check(&self) -> Result<(), ComputeError> {
        if !self.resource.is_done() {
            return Ok(());
        }
        match self.resource.failure() {
            Some(message) => Err(ComputeError::Operation {
                name: self.resource.name.clone(),
                message,
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Operation for RemoteOperation {
    fn name(&self) -> &str {
        &self.resource.name
    }

    async fn poll(&mut self) -> Result<(), ComputeError> {
        if !self.resource.is_done() {
            if self.resource.self_link.is_empty() {
                return Err(ComputeError::Decode(format!(
                    "operation {} has no self link",
                    self.resource.name
                )));
            }
            let what = format!("operation {}", self.resource.name);
            let link = self.resource.self_link.clone();
            self.resource = self.api.get(&what, &link, &[]).await?;
        }
        self.check()
    }

    fn done(&self) -> bool {
        self.resource.is_done()
    }

    fn progress(&self) -> u8 {
        match self.resource.progress {
            _ if self.resource.is_done() => 100,
            Some(p) => p.clamp(0, 100) as u8,
            None => 0,
        }
    }
}
