//! Centralized error types for the Maestro core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Separates transport errors (recovered internally) from caller-facing
//!   errors (authorization, missing resources, bad arguments)
//! - Exposes machine-readable error codes for host integrations

use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// REST Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can occur during REST calls to a Lavalink node.
///
/// Non-2xx statuses other than 401/403 are *not* errors: the endpoints are
/// specified to return an empty/failure-shaped payload in that case.
#[derive(Debug, Error)]
pub enum RestError {
    /// The node rejected our credentials (HTTP 401/403). Never retried.
    #[error("unauthorized: node rejected the configured password")]
    Unauthorized,

    /// HTTP request to the node failed at the transport level.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Convenient Result alias for REST operations.
pub type RestResult<T> = Result<T, RestError>;

// ─────────────────────────────────────────────────────────────────────────────
// Library-wide Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Library-wide error type for the Maestro core.
#[derive(Debug, Error)]
pub enum MaestroError {
    /// No node is currently available to serve the request.
    ///
    /// Raised synchronously; never silently retried. The caller decides
    /// whether to wait and retry.
    #[error("no node available")]
    NoNodeAvailable,

    /// No node with the given identifier is registered in the pool.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// No player exists for the given guild.
    #[error("player not found for guild {0}")]
    PlayerNotFound(u64),

    /// A node rejected our credentials. Fatal for that node, never retried.
    #[error("unauthorized: node rejected the configured password")]
    Unauthorized,

    /// A caller passed an out-of-range value: a `play` start/end time
    /// beyond the track length, or a queue index beyond the queue.
    #[error("invalid {field}: {value} (valid up to {length})")]
    InvalidRange {
        /// Which argument was out of range.
        field: &'static str,
        /// The offending value.
        value: u64,
        /// The bound it was checked against.
        length: u64,
    },

    /// A partial track could not be resolved to a playable encoded track.
    #[error("track could not be resolved: {0}")]
    TrackNotFound(String),

    /// A blocking wait for readiness elapsed without the event firing.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Invalid node or pool configuration. Fatal at startup.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// REST request failed at the transport level.
    #[error("rest request failed: {0}")]
    Rest(String),
}

impl MaestroError {
    /// Returns a machine-readable error code for host integrations.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoNodeAvailable => "no_node_available",
            Self::NodeNotFound(_) => "node_not_found",
            Self::PlayerNotFound(_) => "player_not_found",
            Self::Unauthorized => "unauthorized",
            Self::InvalidRange { .. } => "invalid_range",
            Self::TrackNotFound(_) => "track_not_found",
            Self::Timeout(_) => "timeout",
            Self::InvalidConfig(_) => "invalid_configuration",
            Self::Rest(_) => "rest_failed",
        }
    }
}

impl From<RestError> for MaestroError {
    fn from(err: RestError) -> Self {
        match err {
            RestError::Unauthorized => Self::Unauthorized,
            RestError::Http(e) => Self::Rest(e.to_string()),
        }
    }
}

/// Convenient Result alias for library-wide operations.
pub type MaestroResult<T> = Result<T, MaestroError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_rest_error_maps_to_unauthorized() {
        let err: MaestroError = RestError::Unauthorized.into();
        assert_eq!(err.code(), "unauthorized");
    }

    #[test]
    fn invalid_range_formats_field_and_bounds() {
        let err = MaestroError::InvalidRange {
            field: "start_time",
            value: 20_000,
            length: 10_000,
        };
        assert_eq!(err.code(), "invalid_range");
        let msg = err.to_string();
        assert!(msg.contains("start_time"));
        assert!(msg.contains("20000"));
    }
}
