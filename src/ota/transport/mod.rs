//! Transport adapters: how an update session talks to its server.
//!
//! Every transport answers the same five questions - connect, get the job,
//! get the data, report the result, disconnect - expressed as the
//! [`TransportAdapter`] trait. The agent orchestrator drives whichever
//! adapter the session is configured with (and can switch between them
//! mid-session when a job document redirects the data phase to a different
//! transport).
//!
//! [`Transport`] is the production implementation: a tagged dispatcher over
//! the MQTT adapter (pub/sub job/data/result flow with chunk framing) and
//! the HTTP adapter (job GET, ranged data GETs, result POST), both built on
//! an application-supplied [`Connect`] factory. Tests substitute their own
//! [`TransportAdapter`] implementations to drive the state machine without
//! sockets.

pub mod http;
pub mod mqtt;

use super::agent::SessionCore;
use super::callback::AppCallback;
use super::error::{OtaError, OtaStatus};
use super::storage::OtaStorage;
use super::ConnectionKind;
use crate::network::Connect;

pub use http::HttpTransport;
pub use mqtt::MqttTransport;

/// Credentials for transports that authenticate (MQTT brokers, HTTPS
/// servers).
#[derive(Debug, Clone, Copy)]
pub struct Credentials {
    /// User name.
    pub username: &'static str,
    /// Password bytes.
    pub password: &'static [u8],
}

/// The strategy interface every transport implements.
///
/// Methods take the session core so adapters can invoke the application
/// callback mid-phase (with the outgoing request editable), account
/// download progress, and honor the phase watchdogs.
pub trait TransportAdapter {
    /// The transport currently selected.
    fn kind(&self) -> ConnectionKind;

    /// Select a (possibly different) transport for the next phase.
    ///
    /// Only legal while disconnected; a job-document redirect switches here
    /// between the job and data phases.
    fn set_kind(&mut self, kind: ConnectionKind) -> Result<(), OtaError>;

    /// Whether a connection is currently established.
    fn is_connected(&self) -> bool;

    /// Establish the connection to the session's current server.
    fn connect<CB: AppCallback>(&mut self, core: &mut SessionCore<CB>) -> OtaStatus;

    /// Fetch the job document into the session's job buffer.
    fn download_job<CB: AppCallback>(&mut self, core: &mut SessionCore<CB>) -> OtaStatus;

    /// Download the image data into storage.
    fn download_data<CB: AppCallback, S: OtaStorage>(
        &mut self,
        core: &mut SessionCore<CB>,
        storage: &mut S,
    ) -> OtaStatus;

    /// Report the session outcome to the server.
    fn report_result<CB: AppCallback>(
        &mut self,
        core: &mut SessionCore<CB>,
        success: bool,
    ) -> OtaStatus;

    /// Tear the connection down.
    fn disconnect<CB: AppCallback>(&mut self, core: &mut SessionCore<CB>) -> OtaStatus;
}

/// The production transport: MQTT and HTTP(S) adapters behind one tag.
///
/// Owns the connection factory; the adapter selected by
/// [`set_kind`](TransportAdapter::set_kind) borrows it per connect.
pub struct Transport<N: Connect> {
    factory: N,
    kind: ConnectionKind,
    credentials: Option<Credentials>,
    mqtt: MqttTransport<N::Connection>,
    http: HttpTransport<N::Connection>,
}

impl<N: Connect> core::fmt::Debug for Transport<N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Transport")
            .field("kind", &self.kind)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl<N: Connect> Transport<N> {
    /// Build the transport for an initial connection kind.
    ///
    /// `mqtt_one_call` selects between requesting the whole image with one
    /// download request (the default publisher behavior) and requesting it
    /// chunk by chunk.
    pub fn new(
        factory: N,
        kind: ConnectionKind,
        credentials: Option<Credentials>,
        mqtt_one_call: bool,
    ) -> Self {
        Self {
            factory,
            kind,
            credentials,
            mqtt: MqttTransport::new(mqtt_one_call),
            http: HttpTransport::new(),
        }
    }
}

impl<N: Connect> TransportAdapter for Transport<N> {
    fn kind(&self) -> ConnectionKind {
        self.kind
    }

    fn set_kind(&mut self, kind: ConnectionKind) -> Result<(), OtaError> {
        if kind == self.kind {
            return Ok(());
        }
        if self.is_connected() {
            // Switching transports with a live connection would leak it.
            return Err(OtaError::Redirect);
        }
        self.kind = kind;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        match self.kind {
            ConnectionKind::Mqtt => self.mqtt.is_connected(),
            ConnectionKind::Http | ConnectionKind::Https => self.http.is_connected(),
        }
    }

    fn connect<CB: AppCallback>(&mut self, core: &mut SessionCore<CB>) -> OtaStatus {
        match self.kind {
            ConnectionKind::Mqtt => {
                self.mqtt
                    .connect(&mut self.factory, core, self.credentials.as_ref())
            }
            ConnectionKind::Http | ConnectionKind::Https => {
                self.http.connect(&mut self.factory, core)
            }
        }
    }

    fn download_job<CB: AppCallback>(&mut self, core: &mut SessionCore<CB>) -> OtaStatus {
        match self.kind {
            ConnectionKind::Mqtt => self.mqtt.download_job(core),
            ConnectionKind::Http | ConnectionKind::Https => self.http.download_job(core),
        }
    }

    fn download_data<CB: AppCallback, S: OtaStorage>(
        &mut self,
        core: &mut SessionCore<CB>,
        storage: &mut S,
    ) -> OtaStatus {
        match self.kind {
            ConnectionKind::Mqtt => self.mqtt.download_data(core, storage),
            ConnectionKind::Http | ConnectionKind::Https => {
                self.http.download_data(core, storage)
            }
        }
    }

    fn report_result<CB: AppCallback>(
        &mut self,
        core: &mut SessionCore<CB>,
        success: bool,
    ) -> OtaStatus {
        match self.kind {
            ConnectionKind::Mqtt => self.mqtt.report_result(core, success),
            ConnectionKind::Http | ConnectionKind::Https => {
                self.http.report_result(core, success)
            }
        }
    }

    fn disconnect<CB: AppCallback>(&mut self, core: &mut SessionCore<CB>) -> OtaStatus {
        // Always tear both down; a redirect may have left the other side's
        // client behind.
        let mqtt_status = self.mqtt.disconnect(core);
        let http_status = self.http.disconnect(core);
        match self.kind {
            ConnectionKind::Mqtt => mqtt_status,
            ConnectionKind::Http | ConnectionKind::Https => http_status,
        }
    }
}
