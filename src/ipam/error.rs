#[derive(Debug, thiserror::Error)]
pub enum IpamError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A conditional update matched no row in the expected state. Expected
    /// under concurrent allocators; the policy layer decides whether to
    /// retry or treat it as success.
    #[error("not updated")]
    NotUpdated,

    #[error("Floating ip not found: {what}")]
    NotFound { what: String },

    #[error("Allocation for {key} lost too many races")]
    Conflict { key: String },

    #[error("No free floating ip available")]
    PoolExhausted,

    #[error("Invalid subnet: {0}")]
    InvalidSubnet(#[from] ipnetwork::IpNetworkError),

    #[error("Invalid ip address: {0}")]
    InvalidIp(String),
}

pub type IpamResult<T> = Result<T, IpamError>;
