//! Shared vocabulary types for the opsman deployment manager.
//!
//! Defines the service descriptor, the lifecycle command set, the status
//! state machine, and the per-host result unit exchanged between the
//! dispatchers and their callers. The wire strings here are the contract
//! for remote dispatch: the remote side prints exactly one status token
//! on stdout, which the local side parses back with [`Status::from_str`].

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

// ─── Status ──────────────────────────────────────────────────────────────────

/// Observed lifecycle state of one service instance.
///
/// `Unknown` is the placeholder default before any observation; a completed
/// operation always reports one of the other three. There is no stored
/// history; every dispatch call is a fresh observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Unknown,
    Running,
    Failed,
    Stopped,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Running => write!(f, "running"),
            Self::Failed => write!(f, "failed"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unrecognized status '{0}'")]
pub struct ParseStatusError(pub String);

impl FromStr for Status {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unknown" => Ok(Self::Unknown),
            "running" => Ok(Self::Running),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

// ─── Command ─────────────────────────────────────────────────────────────────

/// A lifecycle operation dispatched against a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Start,
    Stop,
    Restart,
    Status,
}

impl Command {
    /// The status a successful run of this command is expected to yield.
    ///
    /// `None` for [`Command::Status`]: a status query has no single success
    /// value, any well-formed observation is accepted as-is. Remote dispatch
    /// keys its success check off this value instead of assuming `Running`
    /// for every operation.
    pub fn expected_status(&self) -> Option<Status> {
        match self {
            Self::Start | Self::Restart => Some(Status::Running),
            Self::Stop => Some(Status::Stopped),
            Self::Status => None,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
            Self::Restart => write!(f, "restart"),
            Self::Status => write!(f, "status"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unrecognized command '{0}'")]
pub struct ParseCommandError(pub String);

impl FromStr for Command {
    type Err = ParseCommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            "status" => Ok(Self::Status),
            other => Err(ParseCommandError(other.to_string())),
        }
    }
}

// ─── Dispatch results ────────────────────────────────────────────────────────

/// The atomic unit of a dispatch result: one targeted host and the status
/// observed there. A dispatch call returns one of these per targeted host,
/// in host registration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub hostname: String,
    pub status: Status,
}

impl InstanceStatus {
    pub fn new(hostname: impl Into<String>, status: Status) -> Self {
        Self {
            hostname: hostname.into(),
            status,
        }
    }

    /// Shorthand for the failure entry recovered from a runtime error.
    pub fn failed(hostname: impl Into<String>) -> Self {
        Self::new(hostname, Status::Failed)
    }
}

// ─── Service descriptor ──────────────────────────────────────────────────────

/// One manageable service as registered in the service registry.
///
/// Read-only after load; the dispatchers never mutate it. `hosts` is the
/// ordered fan-out target list and may be empty for local-only services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Handler reference resolved against the handler registry at dispatch
    /// time (e.g. `"httpd"`).
    pub handler: String,
    #[serde(default)]
    pub hosts: Vec<String>,
}

// ─── Package distribution ────────────────────────────────────────────────────

/// An installed software package as reported by the package inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDistribution {
    pub name: String,
    pub version: String,
    /// Source checkout location, when the package was installed from one.
    pub path: Option<PathBuf>,
    /// Active git branch of the source checkout, when resolvable.
    pub branch: Option<String>,
    /// Installed in editable/dev mode (running directly from the checkout).
    #[serde(default)]
    pub editable: bool,
}
