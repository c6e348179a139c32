use thiserror::Error;

pub type Result<T> = std::result::Result<T, FleetError>;

/// Failures reported by a [`ComputeClient`](crate::compute::ComputeClient).
///
/// Not-found and already-exists are kept apart from every other failure
/// because provisioning and cleanup branch on them.
#[derive(Debug, Clone, Error)]
pub enum ComputeError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("request failed: {0}")]
    Transport(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("operation {name} failed: {message}")]
    Operation { name: String, message: String },
}

impl ComputeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ComputeError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ComputeError::AlreadyExists(_))
    }
}

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("{0}")]
    Validation(String),

    #[error("invalid address block: {0}")]
    InvalidAddressBlock(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Compute(#[from] ComputeError),

    #[error("operation {name} failed: {message}")]
    Operation { name: String, message: String },

    #[error("instance {name} (index {index}): {source}")]
    Instance {
        index: usize,
        name: String,
        #[source]
        source: Box<FleetError>,
    },

    #[error("state version {found} is newer than supported {supported}")]
    StateVersion { found: u32, supported: u32 },

    #[error("state file {path}: {message}")]
    StateIo { path: String, message: String },

    #[error("failed to parse state: {0}")]
    StateParse(String),

    #[error("wait cancelled for {0}")]
    Cancelled(String),

    #[error("instance {instance} reported readiness state {state}")]
    NotReady { instance: String, state: String },

    #[error("invalid config: {0}")]
    Config(String),
}

impl FleetError {
    /// True when the error, or the per-instance error it wraps, is a remote not-found.
    pub fn is_not_found(&self) -> bool {
        match self {
            FleetError::Compute(e) => e.is_not_found(),
            FleetError::Instance { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Lift a failed poll, keeping remote operation failures distinct.
    pub(crate) fn from_poll(err: ComputeError) -> Self {
        match err {
            ComputeError::Operation { name, message } => FleetError::Operation { name, message },
            other => FleetError::Compute(other),
        }
    }

    pub(crate) fn for_instance(index: usize, name: &str, source: FleetError) -> Self {
        FleetError::Instance {
            index,
            name: name.to_string(),
            source: Box::new(source),
        }
    }
}
