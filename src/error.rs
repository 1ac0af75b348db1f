//! Error types for the gateway.

use std::path::PathBuf;

use thiserror::Error;

/// A frame that could not be turned into an envelope.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The frame was not valid JSON, or not a JSON object.
    #[error("Invalid message format: {0}")]
    Malformed(String),

    /// The frame parsed but carried no `type` discriminator.
    #[error("Invalid message format: missing 'type' field")]
    MissingType,
}

/// Failure to deliver a payload to its destination.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("No apps available to handle the request (no local clients and no remote tunnel)")]
    NoApps,

    #[error("No tuis available to handle the request (no local clients and no remote tunnel)")]
    NoTuis,

    #[error("No agents available to handle the message")]
    NoAgents,

    #[error("connection {0} is closed")]
    SocketClosed(String),

    #[error("agent {agent_id} did not become ready within {waited_ms}ms")]
    AgentNotReady { agent_id: String, waited_ms: u64 },

    #[error("remote tunnel is not configured")]
    TunnelUnavailable,

    #[error("failed to start agent {agent_id}: {source}")]
    Supervisor {
        agent_id: String,
        #[source]
        source: SupervisorError,
    },
}

/// Errors raised while fetching, installing or running agent processes.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("agent registry request failed: {0}")]
    Registry(#[from] reqwest::Error),

    #[error("invalid agent registry url: {0}")]
    RegistryUrl(String),

    #[error("agent registry returned {status} for {agent_id}")]
    RegistryStatus { agent_id: String, status: u16 },

    #[error("agent {0} has no downloadable package")]
    NoPackage(String),

    #[error("failed to extract agent package: {0}")]
    Extract(#[from] zip::result::ZipError),

    #[error("agent entry point missing at {}", .0.display())]
    MissingEntryPoint(PathBuf),

    #[error("archive entry escapes agent directory: {0}")]
    UnsafeArchivePath(String),

    #[error("failed to spawn agent process: {0}")]
    Spawn(String),

    #[error("agent {0} is not running")]
    NotRunning(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from the pending request correlator.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PendingError {
    #[error("request {0} is already pending")]
    Duplicate(String),

    #[error("request {request_id} timed out after {waited_ms}ms")]
    Timeout { request_id: String, waited_ms: u64 },

    #[error("request {request_id} was rejected: {reason}")]
    Rejected { request_id: String, reason: String },

    #[error("request {0} was dropped before a response arrived")]
    Dropped(String),
}
