//! Error types for wgmesh

use thiserror::Error;

/// Result type alias using wgmesh Error
pub type Result<T> = std::result::Result<T, Error>;

/// wgmesh error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("mesh secret must not be empty")]
    InvalidSecret,

    #[error("invalid nonce length: {0} bytes")]
    InvalidNonce(usize),

    #[error("decryption failed")]
    DecryptFailed,

    #[error("protocol mismatch: got {0}")]
    ProtocolMismatch(u32),

    #[error("stale message: {age_secs}s outside freshness window")]
    StaleMessage { age_secs: i64 },

    #[error("invalid announcement: {0}")]
    InvalidAnnouncement(String),

    #[error("peer store full at {capacity} peers")]
    PeerStoreFull { capacity: usize },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("global rate limit exceeded")]
    GlobalRateLimited,

    #[error("handler pool exhausted")]
    HandlerPoolFull,

    #[error("wireguard apply failed: {0}")]
    WireGuardApplyFailed(String),

    #[error("interface setup failed: {0}")]
    InterfaceSetupFailed(String),

    #[error("route sync failed: {0}")]
    RouteSyncFailed(String),

    #[error("DHT announce failed: {0}")]
    DhtAnnounceFailed(String),

    #[error("registry request failed: {0}")]
    RegistryRequestFailed(String),

    #[error("unknown RPC method: {0}")]
    RpcUnknownMethod(String),

    #[error("invalid RPC params: {0}")]
    RpcInvalidParams(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("shutdown requested")]
    ShutdownRequested,

    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON-RPC 2.0 error codes, used by the control socket and its clients.
pub mod rpc_code {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
}

impl Error {
    /// Map an error to its JSON-RPC error code at the control-socket edge.
    pub fn rpc_error_code(&self) -> i32 {
        match self {
            Error::RpcUnknownMethod(_) => rpc_code::METHOD_NOT_FOUND,
            Error::RpcInvalidParams(_) => rpc_code::INVALID_PARAMS,
            Error::Serialization(_) => rpc_code::PARSE_ERROR,
            _ => rpc_code::INTERNAL_ERROR,
        }
    }
}
