//! MQTT (pub/sub) transport adapter.
//!
//! Topic discipline: requests go out on the publisher's well-known listen
//! topic (`<prepend>/<board>/publish_notify`); every request embeds a
//! per-session unique topic (`<prepend>/<board>/OTAImage/<nonce>`) that the
//! agent subscribes to and the publisher addresses its responses to - the
//! job document as a JSON payload, the image as a stream of chunk payloads.
//!
//! Each inbound data publish is parsed against the chunk header: payloads
//! without the magic are ignored, stale versions abort the session,
//! duplicates are dropped without a second write, and every accepted chunk
//! re-arms the per-packet watchdog. End of transfer is declared when the
//! byte count reaches the advertised total; gaps are only enumerated for
//! diagnostics because an incomplete transfer can never reach the total
//! before the data watchdog fires.

use super::Credentials;
use crate::network::application::mqtt::{Client, Options, QoS};
use crate::network::{Connect, Connection};
use crate::ota::agent::{CbBuffers, SessionCore};
use crate::ota::callback::{AppCallback, CallbackReason, CallbackResult};
use crate::ota::chunk::{ChunkHeader, PacketRecord};
use crate::ota::error::{OtaError, OtaStatus};
use crate::ota::event::bits;
use crate::ota::storage::{ChunkInfo, OtaStorage};
use crate::ota::{AgentState, MAX_JSON_DOC_LEN};
use core::fmt::Write as _;
use core::time::Duration;
use heapless::{String, Vec};

/// Keepalive used for broker connections.
const KEEP_ALIVE_SECS: u16 = 60;

/// Poll backoff while no publish is pending.
const POLL_IDLE: Duration = Duration::from_millis(10);

/// MQTT adapter state.
pub struct MqttTransport<C: Connection> {
    client: Option<Client<C>>,
    subscribed_unique: bool,
    one_call: bool,
}

impl<C: Connection> core::fmt::Debug for MqttTransport<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MqttTransport")
            .field("connected", &self.client.is_some())
            .field("subscribed_unique", &self.subscribed_unique)
            .finish()
    }
}

impl<C: Connection> MqttTransport<C> {
    /// A disconnected adapter.
    ///
    /// `one_call` selects the whole-image download request; otherwise the
    /// adapter requests the image chunk by chunk.
    pub fn new(one_call: bool) -> Self {
        Self {
            client: None,
            subscribed_unique: false,
            one_call,
        }
    }

    /// Whether a broker session is live.
    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    pub(crate) fn connect<N, CB>(
        &mut self,
        factory: &mut N,
        core: &mut SessionCore<CB>,
        credentials: Option<&Credentials>,
    ) -> OtaStatus
    where
        N: Connect<Connection = C>,
        CB: AppCallback,
    {
        if self.client.is_some() {
            return OtaStatus::AlreadyConnected;
        }

        let remote = core.curr_server.remote();
        log::info!("MQTT connect to {}", remote);
        let connection = match factory.connect(&remote) {
            Ok(connection) => connection,
            Err(err) => {
                log::error!("MQTT connect to {} failed: {:?}", remote, err);
                return OtaError::Connect.into();
            }
        };

        // Client identifier: configured serial plus the session nonce, so
        // overlapping sessions never collide at the broker.
        let mut client_id: String<64> = String::new();
        let _ = write!(
            client_id,
            "{}-{:04x}",
            core.config.identity.serial_number, core.session_nonce
        );

        let options = Options {
            client_id: client_id.as_str(),
            keep_alive_seconds: KEEP_ALIVE_SECS,
            clean_session: true,
            username: credentials.map(|c| c.username),
            password: credentials.map(|c| c.password),
        };

        match Client::connect(connection, options) {
            Ok(client) => {
                self.client = Some(client);
                self.subscribed_unique = false;
                OtaStatus::Success
            }
            Err(err) => {
                log::error!("MQTT session setup failed: {:?}", err);
                OtaError::Connect.into()
            }
        }
    }

    /// Subscribe to the session's unique topic, once per connection.
    fn subscribe_unique<CB: AppCallback>(
        &mut self,
        core: &mut SessionCore<CB>,
    ) -> Result<(), OtaError> {
        if self.subscribed_unique {
            return Ok(());
        }
        let topic = core.unique_topic.clone();
        let client = self.client.as_mut().ok_or(OtaError::Subscribe)?;
        client
            .subscribe(&topic, QoS::AtLeastOnce)
            .map_err(|err| {
                log::error!("subscribe {} failed: {:?}", topic, err);
                OtaError::Subscribe
            })?;
        log::info!("subscribed to {}", topic);
        self.subscribed_unique = true;
        Ok(())
    }

    pub(crate) fn download_job<CB: AppCallback>(&mut self, core: &mut SessionCore<CB>) -> OtaStatus {
        if let Err(err) = self.subscribe_unique(core) {
            return err.into();
        }

        let mut json = match core.availability_request() {
            Ok(json) => json,
            Err(err) => return err.into(),
        };
        match core.call_cb(
            CallbackReason::StateChange,
            AgentState::JobDownload,
            CbBuffers {
                json_doc: Some(&mut json),
                ..CbBuffers::default()
            },
        ) {
            CallbackResult::Continue => {}
            CallbackResult::Stop => {
                core.stop_session = true;
                return OtaError::AppReturnedStop.into();
            }
            CallbackResult::AppSuccess => return OtaStatus::Success,
            CallbackResult::AppFailed => return OtaError::GetJob.into(),
        }

        let listen_topic = core.publisher_listen_topic();
        {
            let Some(client) = self.client.as_mut() else {
                return OtaError::GetJob.into();
            };
            if let Err(err) = client.publish(&listen_topic, json.as_bytes(), QoS::AtMostOnce) {
                log::error!("job request publish failed: {:?}", err);
                return OtaError::Publish.into();
            }
        }

        // Wait for the publisher to answer on the unique topic.
        loop {
            core.fire_timers();
            if core.events().peek(bits::SHUTDOWN_NOW) != 0 {
                return OtaError::GetJob.into();
            }
            if core.events().take(bits::DOWNLOAD_TIMEOUT) != 0 {
                log::error!("job download timed out");
                return OtaError::GetJob.into();
            }

            let Some(client) = self.client.as_mut() else {
                return OtaError::GetJob.into();
            };
            match client.poll() {
                Ok(Some(packet)) => {
                    if packet.topic.as_str() != core.unique_topic.as_str() {
                        continue;
                    }
                    match Vec::from_slice(&packet.payload) {
                        Ok(doc) => {
                            core.job_doc = doc;
                            log::info!("job document: {} bytes", core.job_doc.len());
                            return OtaStatus::Success;
                        }
                        Err(_) => {
                            log::error!("job document exceeds {} bytes", MAX_JSON_DOC_LEN);
                            return OtaError::GetJob.into();
                        }
                    }
                }
                Ok(None) => std::thread::sleep(POLL_IDLE),
                Err(crate::network::error::Error::ConnectionClosed) => {
                    core.events().set(bits::DROPPED_US);
                    return OtaError::ServerDropped.into();
                }
                Err(err) => {
                    log::error!("poll failed: {:?}", err);
                    return OtaError::GetJob.into();
                }
            }
        }
    }

    pub(crate) fn download_data<CB: AppCallback, S: OtaStorage>(
        &mut self,
        core: &mut SessionCore<CB>,
        storage: &mut S,
    ) -> OtaStatus {
        if let Err(err) = self.subscribe_unique(core) {
            return err.into();
        }

        let mut json = match if self.one_call {
            core.download_request()
        } else {
            core.chunk_request(0, super::http::HTTP_CHUNK_SIZE)
        } {
            Ok(json) => json,
            Err(err) => return err.into(),
        };
        match core.call_cb(
            CallbackReason::StateChange,
            AgentState::DataDownload,
            CbBuffers {
                json_doc: Some(&mut json),
                ..CbBuffers::default()
            },
        ) {
            CallbackResult::Continue => {}
            CallbackResult::Stop => {
                core.stop_session = true;
                return OtaError::AppReturnedStop.into();
            }
            CallbackResult::AppSuccess => return OtaStatus::Success,
            CallbackResult::AppFailed => return OtaError::GetData.into(),
        }

        let listen_topic = core.publisher_listen_topic();
        {
            let Some(client) = self.client.as_mut() else {
                return OtaError::GetData.into();
            };
            if let Err(err) = client.publish(&listen_topic, json.as_bytes(), QoS::AtMostOnce) {
                log::error!("download request publish failed: {:?}", err);
                return OtaError::Publish.into();
            }
        }

        core.arm_packet_timer();

        loop {
            core.fire_timers();
            if core.events().peek(bits::SHUTDOWN_NOW) != 0 {
                return OtaError::GetData.into();
            }
            if core.events().take(bits::PACKET_TIMEOUT) != 0 {
                log::error!(
                    "no packet for {} seconds, aborting download",
                    core.config.packet_interval_secs
                );
                return OtaError::GetData.into();
            }
            if core.events().take(bits::DOWNLOAD_TIMEOUT) != 0 {
                log::error!("data download timed out");
                return OtaError::GetData.into();
            }

            let Some(client) = self.client.as_mut() else {
                return OtaError::GetData.into();
            };
            let packet = match client.poll() {
                Ok(Some(packet)) => packet,
                Ok(None) => {
                    std::thread::sleep(POLL_IDLE);
                    continue;
                }
                Err(crate::network::error::Error::ConnectionClosed) => {
                    core.events().set(bits::DROPPED_US);
                    return OtaError::ServerDropped.into();
                }
                Err(err) => {
                    log::error!("poll failed: {:?}", err);
                    return OtaError::GetData.into();
                }
            };

            if packet.topic.as_str() != core.unique_topic.as_str() {
                continue;
            }

            // Frame the payload. Non-chunk payloads on the data topic are
            // ignored outright.
            let header = match ChunkHeader::parse(&packet.payload) {
                Ok(header) => header,
                Err(_) => {
                    log::warn!("payload without chunk header ignored");
                    continue;
                }
            };
            if header.check_version(core.config.version).is_err() {
                log::error!(
                    "chunk advertises version {} not newer than {}",
                    header.update_version,
                    core.config.version
                );
                core.events().set(bits::INVALID_VERSION);
                return OtaError::InvalidVersion.into();
            }

            core.storage_ctx.packets_received =
                core.storage_ctx.packets_received.saturating_add(1);
            core.arm_packet_timer();

            if core.packet_log.record(header.this_payload_index) == PacketRecord::Duplicate {
                log::debug!("duplicate packet {} dropped", header.this_payload_index);
                continue;
            }

            let chunk = ChunkInfo {
                total_size: header.total_size,
                offset: header.image_offset,
                data: header.data_of(&packet.payload),
                packet_number: header.this_payload_index,
                total_packets: header.total_num_payloads,
            };
            let status = core.write_chunk(storage, &chunk);
            if !status.is_success() {
                return status;
            }

            log::debug!(
                "packet {} of {}: {} of {} bytes ({}%)",
                header.this_payload_index,
                header.total_num_payloads,
                core.storage_ctx.total_bytes_written,
                core.storage_ctx.total_image_size,
                core.storage_ctx.percentage()
            );

            if core.storage_ctx.is_complete() {
                let missing = core
                    .packet_log
                    .missing(core.storage_ctx.total_packets)
                    .count();
                log::info!(
                    "transfer complete: {} packets received, {} never seen",
                    core.packet_log.received(),
                    missing
                );
                core.events().set(bits::DATA_DONE);
                return OtaStatus::Success;
            }

            if !self.one_call {
                // Chunked flow: ask for the next window.
                let next = match core.chunk_request(
                    core.storage_ctx.total_bytes_written,
                    super::http::HTTP_CHUNK_SIZE,
                ) {
                    Ok(json) => json,
                    Err(err) => return err.into(),
                };
                let listen_topic = core.publisher_listen_topic();
                let Some(client) = self.client.as_mut() else {
                    return OtaError::GetData.into();
                };
                if let Err(err) =
                    client.publish(&listen_topic, next.as_bytes(), QoS::AtMostOnce)
                {
                    log::error!("chunk request publish failed: {:?}", err);
                    return OtaError::Publish.into();
                }
            }
        }
    }

    pub(crate) fn report_result<CB: AppCallback>(
        &mut self,
        core: &mut SessionCore<CB>,
        success: bool,
    ) -> OtaStatus {
        let mut json: String<MAX_JSON_DOC_LEN> = String::new();
        if write!(
            json,
            "{{\"Message\":\"{}\", \"UniqueTopicName\": \"{}\"}}",
            if success { "Success" } else { "Failure" },
            core.unique_topic
        )
        .is_err()
        {
            return OtaError::SendingResult.into();
        }

        match core.call_cb(
            CallbackReason::StateChange,
            AgentState::ResultSend,
            CbBuffers {
                json_doc: Some(&mut json),
                ..CbBuffers::default()
            },
        ) {
            CallbackResult::Continue => {}
            CallbackResult::Stop => {
                core.stop_session = true;
                return OtaError::AppReturnedStop.into();
            }
            CallbackResult::AppSuccess => return OtaStatus::Success,
            CallbackResult::AppFailed => return OtaError::SendingResult.into(),
        }

        let listen_topic = core.publisher_listen_topic();
        let Some(client) = self.client.as_mut() else {
            return OtaError::SendingResult.into();
        };
        match client.publish(&listen_topic, json.as_bytes(), QoS::AtLeastOnce) {
            Ok(()) => OtaStatus::Success,
            Err(err) => {
                log::error!("result publish failed: {:?}", err);
                OtaError::SendingResult.into()
            }
        }
    }

    pub(crate) fn disconnect<CB: AppCallback>(&mut self, core: &mut SessionCore<CB>) -> OtaStatus {
        let _ = core;
        self.subscribed_unique = false;
        match self.client.take() {
            Some(client) => match client.disconnect() {
                Ok(()) => OtaStatus::Success,
                Err(_) => OtaError::Disconnect.into(),
            },
            None => OtaStatus::Success,
        }
    }
}
