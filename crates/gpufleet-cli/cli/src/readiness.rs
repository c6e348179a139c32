use async_trait::async_trait;
use gpufleet_core::readiness::{Readiness, ReadinessCheck, READINESS_PORT};
use std::time::Duration;

/// Per-request limit; the wait loop decides how long to keep asking.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Asks `http://<host>:34223/` for the node's setup status.
pub struct HttpReadiness {
    http: reqwest::Client,
    port: u16,
}

impl HttpReadiness {
    pub fn new() -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            port: READINESS_PORT,
        })
    }

    fn url(&self, host: &str) -> String {
        format!("http://{}:{}/", host, self.port)
    }
}

#[async_trait]
impl ReadinessCheck for HttpReadiness {
    async fn check(&self, host: &str) -> Readiness {
        let response = match self.http.get(self.url(host)).send().await {
            Ok(response) => response,
            Err(e) => return Readiness::Pending(e.to_string()),
        };
        if response.status() != reqwest::StatusCode::OK {
            return Readiness::Pending(format!("unexpected readiness HTTP status {}", response.status()));
        }
        match response.text().await {
            Ok(body) => Readiness::parse(&body),
            Err(e) => Readiness::Pending(e.to_string()),
        }
    }
}
