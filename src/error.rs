//! Error taxonomy for the MCP client runtime.
//!
//! Four kinds, matching the layers a caller can observe a failure at:
//! transport (the pipe to the child), remote (a well-formed JSON-RPC error
//! object), client (protocol/state misuse), and manager (pool-level lookup
//! failures). Each is a distinct enum rather than one flat error so callers
//! can match on the layer without string-sniffing.

/// Failures originating in the process transport: spawn, write, read,
/// framing, or a request that was never answered in time.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to spawn child process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("transport is not connected")]
    NotConnected,

    #[error("write to child stdin failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("read from child stdout failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("malformed JSON-RPC line: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("transport closed")]
    Closed,
}

/// A well-formed JSON-RPC error object returned by a server.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
#[error("remote error {code}: {message}")]
pub struct RemoteError {
    pub code: i64,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

/// Failures at the client (protocol) layer: state misuse or a result shape
/// that does not match what the method promises.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client has not completed initialize")]
    NotInitialized,

    #[error("initialize failed: {0}")]
    InitFailed(#[source] InitFailure),

    #[error("failed to decode {method} result: {source}")]
    Decode {
        method: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("resource read returned an unreadable shape")]
    BadResourceShape,

    #[error("server configuration was absent")]
    NullConfig,

    #[error("server was removed from the pool")]
    ServerRemoved,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// The two ways `initialize` can fail: the transport never got a response,
/// or the server answered with a JSON-RPC error.
#[derive(Debug, thiserror::Error)]
pub enum InitFailure {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Pool-manager-level failures: operations that require a present server id.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ManagerError {
    #[error("no server registered with id '{0}'")]
    UnknownServer(String),
}
