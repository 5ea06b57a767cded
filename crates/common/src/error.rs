use crate::Protocol;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_PORT: i64 = 1;
pub const MAX_PORT: i64 = 65535;

/// Everything the allocator can refuse, keyed by kind so callers match instead of probing.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AllocationError {
    #[error("invalid port {port}: must be between 1 and 65535")]
    InvalidPort { port: i64 },

    #[error("invalid protocol `{protocol}`: must be TCP or UDP")]
    InvalidProtocol { protocol: String },

    #[error("invalid owner id {owner_id}: must be positive")]
    InvalidOwner { owner_id: i64 },

    #[error(
        "port {port}/{protocol} on server {server_id} is held by owner {existing_owner} (requested by {requested_owner})"
    )]
    PortConflict {
        server_id: i64,
        port: u16,
        protocol: Protocol,
        existing_owner: i64,
        requested_owner: i64,
    },

    #[error("no allocation for port {port}/{protocol} on server {server_id}")]
    PortNotFound {
        server_id: i64,
        port: i64,
        protocol: String,
    },

    #[error("store error: {message}")]
    Store { message: String },

    #[error("rollback failed after `{cause}`: {message}")]
    RollbackFailed {
        #[source]
        cause: Box<AllocationError>,
        message: String,
    },
}

impl AllocationError {
    pub fn store(err: impl std::fmt::Display) -> Self {
        Self::Store {
            message: err.to_string(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::PortConflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::PortNotFound { .. })
    }

    /// True for the errors raised before the store is touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidPort { .. } | Self::InvalidProtocol { .. } | Self::InvalidOwner { .. }
        )
    }
}

pub fn validate_port(port: i64) -> Result<u16, AllocationError> {
    if !(MIN_PORT..=MAX_PORT).contains(&port) {
        return Err(AllocationError::InvalidPort { port });
    }
    // In range, so the narrowing cannot truncate.
    Ok(port as u16)
}

pub fn validate_owner(owner_id: i64) -> Result<i64, AllocationError> {
    if owner_id <= 0 {
        return Err(AllocationError::InvalidOwner { owner_id });
    }
    Ok(owner_id)
}

/// Checks a single allocation request in order: port, protocol, owner.
pub fn validate_request(
    port: i64,
    protocol: &str,
    owner_id: i64,
) -> Result<(u16, Protocol), AllocationError> {
    let port = validate_port(port)?;
    let protocol = protocol.parse::<Protocol>()?;
    validate_owner(owner_id)?;
    Ok((port, protocol))
}
