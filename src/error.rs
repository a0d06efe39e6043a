use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest_middleware::Error),

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("authentication failed")]
    Authentication,

    #[error("{message}")]
    Api { message: String },

    #[error("a VM record with {field} = {value} already exists")]
    Duplicate { field: &'static str, value: String },

    #[error("VM record is missing required field {field}")]
    MissingField { field: &'static str },

    #[error("VM {vm_id} not found")]
    NotFound { vm_id: u32 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("database migration failed: {reason}")]
    Migration { reason: String },

    #[error("could not allocate a free VMID after {attempts} attempts")]
    VmidExhausted { attempts: u32 },

    #[error("invalid config: {reason}")]
    Config { reason: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("{message}")]
    Usage { message: String },
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transport(reqwest_middleware::Error::Reqwest(e))
    }
}
