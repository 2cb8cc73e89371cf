//! # Over-the-Air (OTA) Update Agent
//!
//! This module provides a network-agnostic OTA update agent. It is designed
//! to be portable and work with any network stack that implements the
//! `libota::network` traits and any flash part that implements the
//! `libota::storage` traits.
//!
//! ## Design
//!
//! The agent is a state machine driven through a transition table. A session
//! walks from `AgentWaiting` through job discovery (`JobConnect` →
//! `JobDownload` → `JobParse` → `JobRedirect`), staging (`StorageOpen`),
//! data download (`DataConnect` → `DataDownload`), verification (`Verify`),
//! result reporting (`ResultRedirect` → `ResultConnect` → `ResultSend`) and
//! completion (`OtaComplete`), then returns to `AgentWaiting` and arms the
//! next-check timer. Every step first offers the application callback a
//! chance to observe, override, or stop the session.
//!
//! Two update flows exist:
//!
//! * **Job flow**: fetch a JSON job document first; it names the server,
//!   transport, file and version of the available update.
//! * **Direct flow**: skip the job document and download from the configured
//!   coordinates immediately.
//!
//! The downloaded image lands in the secondary ("staging") slot via the
//! [`storage`](crate::ota::storage) engine; on success the slot is marked
//! pending for the bootloader and the device optionally reboots.
//!
//! A third, host-driven path exists for short-range wireless links: see
//! [`wireless`].

use core::fmt;
use core::str::FromStr;
use heapless::String;

pub mod callback;
pub mod chunk;
pub mod config;
pub mod error;
pub mod job;
pub mod storage;
pub mod untar;
pub mod verify;
pub mod wireless;

#[cfg(feature = "std")]
pub mod agent;
#[cfg(feature = "std")]
pub mod event;
#[cfg(feature = "std")]
pub mod transport;

#[cfg(feature = "std")]
pub use agent::{AgentHandle, AgentParams, NetworkParams, OtaAgent};
pub use config::{AgentConfig, DeviceIdentity, UpdateFlow};
pub use error::{OtaError, OtaStatus};
#[cfg(feature = "std")]
pub use transport::{Credentials, Transport, TransportAdapter};

/// Maximum length of a host name in server info and job documents.
pub const MAX_HOST_LEN: usize = 256;

/// Maximum length of a file name / path for HTTP requests.
pub const MAX_FILE_LEN: usize = 256;

/// Maximum length of an MQTT topic, including the per-session unique topic.
pub const MAX_TOPIC_LEN: usize = 256;

/// Maximum size of a JSON job document or request body.
pub const MAX_JSON_DOC_LEN: usize = 1024;

/// A firmware version triplet.
///
/// Ordering is lexicographic over `(major, minor, build)`; an update is only
/// accepted when its version is strictly greater than the running one.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    /// Major version number.
    pub major: u16,
    /// Minor version number.
    pub minor: u16,
    /// Build number.
    pub build: u16,
}

impl Version {
    /// Build a version from its parts.
    pub const fn new(major: u16, minor: u16, build: u16) -> Self {
        Self { major, minor, build }
    }
}

impl FromStr for Version {
    type Err = error::OtaError;

    /// Parse a `"major.minor.build"` string.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let major = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or(error::OtaError::MalformedJobDoc)?;
        let minor = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or(error::OtaError::MalformedJobDoc)?;
        let build = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or(error::OtaError::MalformedJobDoc)?;
        if parts.next().is_some() {
            return Err(error::OtaError::MalformedJobDoc);
        }
        Ok(Self { major, minor, build })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

/// The transport used to reach the update server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// MQTT pub/sub broker.
    Mqtt,
    /// Plain HTTP server.
    Http,
    /// HTTP over TLS.
    Https,
}

impl ConnectionKind {
    /// The wire name used in job documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Mqtt => "MQTT",
            ConnectionKind::Http => "HTTP",
            ConnectionKind::Https => "HTTPS",
        }
    }

    /// Parse the job-document wire name.
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "MQTT" => Some(ConnectionKind::Mqtt),
            "HTTP" => Some(ConnectionKind::Http),
            "HTTPS" => Some(ConnectionKind::Https),
            _ => None,
        }
    }
}

/// A broker or server endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Host name or address.
    pub host: String<MAX_HOST_LEN>,
    /// TCP port.
    pub port: u16,
}

impl ServerInfo {
    /// Build server info from a host string and port.
    ///
    /// Returns `None` when the host exceeds [`MAX_HOST_LEN`].
    pub fn new(host: &str, port: u16) -> Option<Self> {
        Some(Self {
            host: String::try_from(host).ok()?,
            port,
        })
    }

    /// Format as the `"host:port"` string [`crate::network::Connect`] takes.
    pub fn remote(&self) -> String<{ MAX_HOST_LEN + 6 }> {
        let mut out = String::new();
        // Capacity covers any host plus ":65535".
        let _ = core::fmt::write(&mut out, format_args!("{}:{}", self.host, self.port));
        out
    }
}

/// The OTA agent state.
///
/// These are the states the orchestrator's transition table walks through;
/// the application callback receives the current state with every
/// notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AgentState {
    /// Agent not initialized.
    NotInitialized = 0,
    /// Agent is shutting down; terminal.
    Exiting,
    /// Agent is initializing.
    Initializing,
    /// Agent started; worker not yet waiting.
    AgentStarted,
    /// Waiting for a timer or an explicit update request.
    AgentWaiting,
    /// Opening (erasing) the staging slot.
    StorageOpen,
    /// Writing a data chunk to the staging slot.
    StorageWrite,
    /// Closing the staging slot.
    StorageClose,
    /// Deciding between the job flow and the direct flow.
    StartUpdate,
    /// Connecting to the job broker/server.
    JobConnect,
    /// Downloading the job document.
    JobDownload,
    /// Disconnecting from the job broker/server.
    JobDisconnect,
    /// Parsing the job document.
    JobParse,
    /// Switching servers per the job document.
    JobRedirect,
    /// Connecting to the data broker/server.
    DataConnect,
    /// Downloading the image data.
    DataDownload,
    /// Disconnecting from the data broker/server.
    DataDisconnect,
    /// Verifying the staged image.
    Verify,
    /// Redirecting back to the initial connection for the result.
    ResultRedirect,
    /// Connecting to the result broker/server.
    ResultConnect,
    /// Sending the result document.
    ResultSend,
    /// Waiting for a result response.
    ResultResponse,
    /// Disconnecting from the result broker/server.
    ResultDisconnect,
    /// Session finished; reboot or re-arm the next-check timer.
    OtaComplete,
}

impl AgentState {
    /// Human-readable state name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::NotInitialized => "NotInitialized",
            AgentState::Exiting => "Exiting",
            AgentState::Initializing => "Initializing",
            AgentState::AgentStarted => "AgentStarted",
            AgentState::AgentWaiting => "AgentWaiting",
            AgentState::StorageOpen => "StorageOpen",
            AgentState::StorageWrite => "StorageWrite",
            AgentState::StorageClose => "StorageClose",
            AgentState::StartUpdate => "StartUpdate",
            AgentState::JobConnect => "JobConnect",
            AgentState::JobDownload => "JobDownload",
            AgentState::JobDisconnect => "JobDisconnect",
            AgentState::JobParse => "JobParse",
            AgentState::JobRedirect => "JobRedirect",
            AgentState::DataConnect => "DataConnect",
            AgentState::DataDownload => "DataDownload",
            AgentState::DataDisconnect => "DataDisconnect",
            AgentState::Verify => "Verify",
            AgentState::ResultRedirect => "ResultRedirect",
            AgentState::ResultConnect => "ResultConnect",
            AgentState::ResultSend => "ResultSend",
            AgentState::ResultResponse => "ResultResponse",
            AgentState::ResultDisconnect => "ResultDisconnect",
            AgentState::OtaComplete => "OtaComplete",
        }
    }
}
