mod error;

pub use error::{validate_owner, validate_port, validate_request, AllocationError, MAX_PORT, MIN_PORT};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exact match only: "tcp" is rejected, not normalized.
impl FromStr for Protocol {
    type Err = AllocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TCP" => Ok(Protocol::Tcp),
            "UDP" => Ok(Protocol::Udp),
            other => Err(AllocationError::InvalidProtocol {
                protocol: other.to_string(),
            }),
        }
    }
}

/// One reserved port on one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAllocation {
    pub server_id: i64,
    pub port: u16,
    pub protocol: Protocol,
    pub owner_id: i64,
    pub allocated_at: DateTime<Utc>,
}

/// A requested host port for a batch allocation. `container_port` is carried
/// for the caller and never checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub host_port: i64,
    pub protocol: String,
    #[serde(default)]
    pub container_port: Option<i64>,
}

impl PortBinding {
    pub fn new(host_port: i64, protocol: impl Into<String>) -> Self {
        Self {
            host_port,
            protocol: protocol.into(),
            container_port: None,
        }
    }

    pub fn with_container_port(mut self, container_port: i64) -> Self {
        self.container_port = Some(container_port);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateRequest {
    pub server_id: i64,
    pub port: i64,
    pub protocol: String,
    pub owner_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchAllocateRequest {
    pub server_id: i64,
    pub bindings: Vec<PortBinding>,
    pub owner_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub server_id: i64,
    pub port: i64,
    pub protocol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseOwnerRequest {
    pub owner_id: i64,
}

/// Query string for the single-port lookups (`/allocation`, `/available`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortQuery {
    pub server_id: i64,
    pub port: i64,
    pub protocol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityResponse {
    pub server_id: i64,
    pub port: i64,
    pub protocol: String,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeQuery {
    pub server_id: i64,
    pub protocol: String,
    pub start: i64,
    pub end: i64,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeResponse {
    pub ports: Vec<u16>,
}
