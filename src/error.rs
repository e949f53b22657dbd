//! Error taxonomy for target resolution, key provisioning and chain building.

use thiserror::Error;

/// Result alias used by everything below the CLI boundary.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// No capacity request or running instance matched the tag.
    #[error("no valid target found matching tag {0}")]
    NoTarget(String),

    #[error("instance {0} not found")]
    InstanceNotFound(String),

    #[error("instance {instance} has no {kind} address")]
    NoAddress {
        instance: String,
        kind: &'static str,
    },

    #[error("invalid tag filter '{0}', expected key:value")]
    InvalidTag(String),

    #[error("inventory lookup failed: {0}")]
    Inventory(String),

    /// Any push failure other than throttling.
    #[error("failed to push public key to {instance}: {reason}")]
    KeyPush { instance: String, reason: String },

    /// The push API answered without an error but did not report success.
    #[error("public key push to {instance} failed but no error was returned. Request ID: {request_id}")]
    KeyPushRejected {
        instance: String,
        request_id: String,
    },

    #[error("key error: {0}")]
    Key(String),

    #[error("no private key available for {0}")]
    MissingKey(String),

    #[error("a connection chain needs at least one endpoint")]
    EmptyChain,

    #[error("hop {hop} ({address}): dial failed: {reason}")]
    Dial {
        hop: usize,
        address: String,
        reason: String,
    },

    #[error("hop {hop} ({address}): SSH handshake failed: {reason}")]
    Handshake {
        hop: usize,
        address: String,
        reason: String,
    },

    #[error("hop {hop} ({address}): authentication rejected for user {user}")]
    AuthRejected {
        hop: usize,
        address: String,
        user: String,
    },

    #[error("failed to open connection to {target}: {reason}")]
    Forward { target: String, reason: String },

    #[error("listener on {address} failed: {source}")]
    Listener {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("session error: {0}")]
    Session(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
