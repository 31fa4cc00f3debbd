use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("persistence failed: {context}")]
    Persistence {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unsupported estimator state version {found} (expected {expected})")]
    StateVersion { found: u32, expected: u32 },
}

impl ConsensusError {
    pub fn persistence<E>(context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Persistence {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

impl From<rusqlite::Error> for ConsensusError {
    fn from(err: rusqlite::Error) -> Self {
        Self::persistence("sqlite operation failed", err)
    }
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
