use std::sync::Arc;

use gpufleet_core::error::ComputeError;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::debug;

/// Environment variable holding a ready-made OAuth access token.
pub const TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";

/// Where the bearer token comes from.
#[derive(Debug, Clone)]
pub enum Credentials {
    Token(String),
    /// `gcloud auth print-access-token`, run once on first use.
    Gcloud,
}

impl Credentials {
    /// A token from [`TOKEN_ENV`] when set, otherwise the gcloud CLI.
    pub fn from_env() -> Self {
        match std::env::var(TOKEN_ENV) {
            Ok(token) if !token.trim().is_empty() => Credentials::Token(token.trim().to_string()),
            _ => Credentials::Gcloud,
        }
    }
}

/// Resolves the token at most once and shares it between clones.
#[derive(Debug, Clone)]
pub(crate) struct TokenCache {
    credentials: Credentials,
    token: Arc<OnceCell<String>>,
}

impl TokenCache {
    pub(crate) fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            token: Arc::new(OnceCell::new()),
        }
    }

    pub(crate) async fn get(&self) -> Result<&str, ComputeError> {
        let token = self
            .token
            .get_or_try_init(|| async {
                match &self.credentials {
                    Credentials::Token(token) => Ok(token.clone()),
                    Credentials::Gcloud => gcloud_token().await,
                }
            })
            .await?;
        Ok(token.as_str())
    }
}

async fn gcloud_token() -> Result<String, ComputeError> {
    debug!("requesting access token from gcloud");
    let output = Command::new("gcloud")
        .args(["auth", "print-access-token"])
        .output()
        .await
        .map_err(|e| ComputeError::Transport(format!("failed to execute gcloud: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ComputeError::Transport(format!(
            "gcloud auth print-access-token failed with exit code {:?}: {}",
            output.status.code(),
            stderr.trim()
        )));
    }
    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if token.is_empty() {
        return Err(ComputeError::Transport("gcloud returned an empty access token".to_string()));
    }
    Ok(token)
}
