//! MQTT 3.1.1 client implementation for embedded systems.
//!
//! This module provides a lightweight MQTT client designed for `no_std`
//! environments and embedded systems. It implements the parts of the MQTT
//! 3.1.1 specification the OTA flows need, with a focus on simplicity,
//! reliability, and minimal resource usage.
//!
//! # Examples
//!
//! ```rust,no_run
//! use libota::network::application::mqtt::{Client, Options, QoS};
//! # use libota::network::Connection;
//! # struct MockConnection;
//! # impl Connection for MockConnection {}
//! # impl libota::network::Read for MockConnection {
//! #     type Error = ();
//! #     fn read(&mut self, _buf: &mut [u8]) -> Result<usize, Self::Error> { Ok(0) }
//! # }
//! # impl libota::network::Write for MockConnection {
//! #     type Error = ();
//! #     fn write(&mut self, _buf: &[u8]) -> Result<usize, Self::Error> { Ok(0) }
//! #     fn flush(&mut self) -> Result<(), Self::Error> { Ok(()) }
//! # }
//! # impl libota::network::Close for MockConnection {
//! #     type Error = ();
//! #     fn close(self) -> Result<(), Self::Error> { Ok(()) }
//! # }
//!
//! let connection = MockConnection;
//! let options = Options {
//!     client_id: "ota_device_01",
//!     keep_alive_seconds: 60,
//!     clean_session: true,
//!     username: None,
//!     password: None,
//! };
//!
//! // let mut client = Client::connect(connection, options)?;
//! // client.subscribe("OTAUpdate/MY_BOARD/OTAImage/1234", QoS::AtLeastOnce)?;
//! // client.publish("OTAUpdate/MY_BOARD/publish_notify", b"{...}", QoS::AtMostOnce)?;
//! ```

use crate::network::error::Error;
use crate::network::{Connection, Read, Write};
use heapless::{String, Vec};

// MQTT Control Packet types - these are the fixed header packet type values
/// MQTT CONNECT packet type identifier.
const CONNECT: u8 = 0x10;
/// MQTT CONNACK packet type identifier.
const CONNACK: u8 = 0x20;
/// MQTT PUBLISH packet type identifier.
const PUBLISH: u8 = 0x30;
/// MQTT SUBSCRIBE packet type identifier.
const SUBSCRIBE: u8 = 0x82;
/// MQTT SUBACK packet type identifier.
const SUBACK: u8 = 0x90;
/// MQTT DISCONNECT packet type identifier.
const DISCONNECT: u8 = 0xE0;

// Protocol constants defined by MQTT 3.1.1 specification
/// MQTT protocol name as defined in the specification.
const PROTOCOL_NAME: &[u8] = b"MQTT";
/// MQTT protocol level for version 3.1.1.
const PROTOCOL_LEVEL: u8 = 4; // MQTT 3.1.1

/// Maximum incoming publish payload.
///
/// Sized for one OTA chunk: a 4096-byte data window plus the chunk header
/// and padding allowance.
pub const MAX_PAYLOAD: usize = 4096 + 1024;

/// An incoming MQTT publish message.
///
/// This structure represents a message received from the MQTT broker when
/// subscribed to one or more topics. It contains both the topic name and
/// the message payload.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PublishPacket {
    /// The topic on which the message was published.
    pub topic: String<256>,

    /// The message payload data.
    ///
    /// Sized to hold one OTA image chunk; see [`MAX_PAYLOAD`].
    pub payload: Vec<u8, MAX_PAYLOAD>,
}

/// Quality of Service levels for MQTT messages.
///
/// QoS defines the guarantee of delivery for a specific message. Higher QoS
/// levels provide stronger delivery guarantees but require more network
/// overhead and client state management.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum QoS {
    /// **QoS 0**: At most once delivery.
    ///
    /// Messages are delivered according to the best effort of the underlying
    /// network. Message loss can occur.
    AtMostOnce = 0,

    /// **QoS 1**: At least once delivery.
    ///
    /// Messages are assured to arrive but duplicates can occur. The OTA data
    /// path tolerates duplicates, so this is the default for chunk delivery.
    AtLeastOnce = 1,

    /// **QoS 2**: Exactly once delivery.
    ///
    /// Messages are assured to arrive exactly once. This is the safest but
    /// slowest level.
    ExactlyOnce = 2,
}

/// Configuration options for MQTT client connection.
///
/// These options control how the client connects to the MQTT broker and
/// behaves during the session.
#[derive(Debug, Clone)]
pub struct Options<'a> {
    /// The client identifier, must be unique within the broker.
    ///
    /// The OTA agent builds this from a configured prefix plus a per-session
    /// unique suffix so parallel sessions never collide.
    pub client_id: &'a str,

    /// The keep-alive time interval in seconds. 0 disables keep-alive.
    pub keep_alive_seconds: u16,

    /// Whether to start a clean session.
    ///
    /// - `true`: The broker will discard any previous session state
    /// - `false`: The broker will resume the previous session if one exists
    pub clean_session: bool,

    /// Optional user name. Brokers on the TLS-with-credentials port
    /// conventionally require this.
    pub username: Option<&'a str>,

    /// Optional password; only valid together with `username`.
    pub password: Option<&'a [u8]>,
}

/// An MQTT 3.1.1 client for publish-subscribe messaging.
///
/// The client manages a connection to an MQTT broker and provides methods for
/// publishing messages, subscribing to topics, and receiving incoming
/// messages. It's designed to work with any connection type implementing the
/// [`Connection`] trait.
pub struct Client<C: Connection> {
    connection: C,
    is_connected: bool,
}

impl<C: Connection> Client<C> {
    /// Establish an MQTT connection with the broker.
    ///
    /// This function performs the MQTT connection handshake by sending a
    /// CONNECT packet and waiting for a CONNACK response. If successful, it
    /// returns a connected client ready for publishing and subscribing.
    ///
    /// # Errors
    ///
    /// * [`Error::WriteError`] - Failed to send CONNECT packet
    /// * [`Error::ReadError`] - Failed to read CONNACK response
    /// * [`Error::ConnectionClosed`] - Connection closed during handshake
    /// * [`Error::ConnectionRefused`] - Broker refused the connection
    /// * [`Error::ProtocolError`] - Invalid CONNACK packet received
    pub fn connect(mut connection: C, options: Options) -> Result<Self, Error> {
        // --- Variable Header ---
        let mut vh: Vec<u8, 10> = Vec::new();
        vh.extend_from_slice(&(PROTOCOL_NAME.len() as u16).to_be_bytes())
            .map_err(|_| Error::ProtocolError)?;
        vh.extend_from_slice(PROTOCOL_NAME)
            .map_err(|_| Error::ProtocolError)?;
        vh.push(PROTOCOL_LEVEL).map_err(|_| Error::ProtocolError)?;

        let mut connect_flags = 0;
        if options.clean_session {
            connect_flags |= 0x02;
        }
        if options.username.is_some() {
            connect_flags |= 0x80;
        }
        if options.password.is_some() {
            connect_flags |= 0x40;
        }
        vh.push(connect_flags).map_err(|_| Error::ProtocolError)?;
        vh.extend_from_slice(&options.keep_alive_seconds.to_be_bytes())
            .map_err(|_| Error::ProtocolError)?;

        // --- Payload ---
        let mut payload: Vec<u8, 512> = Vec::new();
        let client_id_bytes = options.client_id.as_bytes();
        payload
            .extend_from_slice(&(client_id_bytes.len() as u16).to_be_bytes())
            .map_err(|_| Error::ProtocolError)?;
        payload
            .extend_from_slice(client_id_bytes)
            .map_err(|_| Error::ProtocolError)?;

        if let Some(username) = options.username {
            payload
                .extend_from_slice(&(username.len() as u16).to_be_bytes())
                .map_err(|_| Error::ProtocolError)?;
            payload
                .extend_from_slice(username.as_bytes())
                .map_err(|_| Error::ProtocolError)?;
        }
        if let Some(password) = options.password {
            payload
                .extend_from_slice(&(password.len() as u16).to_be_bytes())
                .map_err(|_| Error::ProtocolError)?;
            payload
                .extend_from_slice(password)
                .map_err(|_| Error::ProtocolError)?;
        }

        let remaining_len = vh.len() + payload.len();

        // --- Fixed Header ---
        let mut fixed_header: Vec<u8, 5> = Vec::new();
        fixed_header.push(CONNECT).map_err(|_| Error::ProtocolError)?;
        encode_remaining_length(&mut fixed_header, remaining_len)
            .map_err(|_| Error::ProtocolError)?;

        // Write packet to the connection
        connection
            .write(&fixed_header)
            .map_err(|_| Error::WriteError)?;
        connection.write(&vh).map_err(|_| Error::WriteError)?;
        connection.write(&payload).map_err(|_| Error::WriteError)?;
        connection.flush().map_err(|_| Error::WriteError)?;

        // Wait for and parse CONNACK
        let mut connack_buf = [0u8; 4];
        let mut total_read = 0;
        while total_read < connack_buf.len() {
            match connection.read(&mut connack_buf[total_read..]) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => total_read += n,
                Err(_) => return Err(Error::ReadError),
            }
        }

        if connack_buf[0] != CONNACK {
            return Err(Error::ProtocolError);
        }

        if connack_buf[1] != 2 {
            return Err(Error::ProtocolError);
        }

        // Check connection acknowledgement status
        match connack_buf[3] {
            0 => Ok(Self {
                connection,
                is_connected: true,
            }),
            1..=5 => Err(Error::ConnectionRefused),
            _ => Err(Error::ProtocolError),
        }
    }

    /// Publish a message to a specific topic.
    ///
    /// Sends a PUBLISH packet to the broker with the specified topic, payload,
    /// and quality of service level.
    ///
    /// # Errors
    ///
    /// * [`Error::WriteError`] - Failed to send the publish packet
    /// * [`Error::ProtocolError`] - Topic name or payload too large
    pub fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), Error> {
        let mut fixed_header: Vec<u8, 5> = Vec::new();
        let mut packet: Vec<u8, 2048> = Vec::new();

        // --- Variable Header ---
        let topic_bytes = topic.as_bytes();
        packet
            .extend_from_slice(&(topic_bytes.len() as u16).to_be_bytes())
            .map_err(|_| Error::ProtocolError)?;
        packet
            .extend_from_slice(topic_bytes)
            .map_err(|_| Error::ProtocolError)?;
        if qos != QoS::AtMostOnce {
            // Packet identifier is required above QoS 0.
            let packet_id: u16 = 1;
            packet
                .extend_from_slice(&packet_id.to_be_bytes())
                .map_err(|_| Error::ProtocolError)?;
        }

        // --- Payload ---
        packet
            .extend_from_slice(payload)
            .map_err(|_| Error::ProtocolError)?;

        // --- Fixed Header ---
        let mut flags = PUBLISH;
        if qos == QoS::AtLeastOnce || qos == QoS::ExactlyOnce {
            flags |= (qos as u8) << 1;
        }
        fixed_header.push(flags).map_err(|_| Error::ProtocolError)?;
        encode_remaining_length(&mut fixed_header, packet.len())
            .map_err(|_| Error::ProtocolError)?;

        // Write to connection
        self.connection
            .write(&fixed_header)
            .map_err(|_| Error::WriteError)?;
        self.connection
            .write(&packet)
            .map_err(|_| Error::WriteError)?;
        self.connection.flush().map_err(|_| Error::WriteError)?;

        Ok(())
    }

    /// Subscribe to a topic filter to receive messages.
    ///
    /// Sends a SUBSCRIBE packet to the broker requesting to receive messages
    /// published to topics that match the specified topic filter, then waits
    /// for the SUBACK confirmation.
    ///
    /// # Errors
    ///
    /// * [`Error::WriteError`] - Failed to send the subscribe packet
    /// * [`Error::ReadError`] - Failed to read SUBACK response
    /// * [`Error::ConnectionClosed`] - Connection closed during operation
    /// * [`Error::ProtocolError`] - Invalid SUBACK packet or topic filter
    pub fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), Error> {
        let mut fixed_header: Vec<u8, 5> = Vec::new();
        let mut packet: Vec<u8, 1024> = Vec::new();

        // --- Variable Header (Packet Identifier) ---
        let packet_id: u16 = 1;
        packet
            .extend_from_slice(&packet_id.to_be_bytes())
            .map_err(|_| Error::ProtocolError)?;

        // --- Payload ---
        let topic_bytes = topic.as_bytes();
        packet
            .extend_from_slice(&(topic_bytes.len() as u16).to_be_bytes())
            .map_err(|_| Error::ProtocolError)?;
        packet
            .extend_from_slice(topic_bytes)
            .map_err(|_| Error::ProtocolError)?;
        packet.push(qos as u8).map_err(|_| Error::ProtocolError)?;

        // --- Fixed Header ---
        fixed_header
            .push(SUBSCRIBE)
            .map_err(|_| Error::ProtocolError)?;
        encode_remaining_length(&mut fixed_header, packet.len())
            .map_err(|_| Error::ProtocolError)?;

        // Write to connection
        self.connection
            .write(&fixed_header)
            .map_err(|_| Error::WriteError)?;
        self.connection
            .write(&packet)
            .map_err(|_| Error::WriteError)?;
        self.connection.flush().map_err(|_| Error::WriteError)?;

        // Wait for SUBACK
        let mut suback_buf = [0u8; 5];
        let mut total_read = 0;
        while total_read < suback_buf.len() {
            match self.connection.read(&mut suback_buf[total_read..]) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => total_read += n,
                Err(_) => return Err(Error::ReadError),
            }
        }

        if suback_buf[0] != SUBACK {
            return Err(Error::ProtocolError);
        }

        // Check packet identifier
        let suback_packet_id = u16::from_be_bytes([suback_buf[2], suback_buf[3]]);
        if suback_packet_id != packet_id {
            return Err(Error::ProtocolError);
        }

        Ok(())
    }

    /// Poll the connection for incoming PUBLISH messages.
    ///
    /// This method checks for incoming data on the connection and parses any
    /// PUBLISH packets received from the broker. It should be called
    /// regularly in a loop to receive messages from subscribed topics.
    ///
    /// This method is non-blocking in the sense that a read returning 0 bytes
    /// yields `Ok(None)`; blocking behavior depends on the underlying
    /// connection's read semantics.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(packet))` - A publish message was received
    /// * `Ok(None)` - No message available at this time
    /// * `Err(error)` - Network or protocol error occurred
    pub fn poll(&mut self) -> Result<Option<PublishPacket>, Error> {
        let mut header_buf = [0u8; 1];
        match self.connection.read(&mut header_buf) {
            Ok(0) => return Ok(None),
            Ok(_) => {}
            Err(_) => return Err(Error::ReadError),
        }

        if header_buf[0] & 0xF0 != PUBLISH {
            // Not a publish; skip its remaining length so the stream stays
            // in sync.
            let remaining = self.read_remaining_length()?;
            let mut scratch = [0u8; 64];
            let mut left = remaining;
            while left > 0 {
                let take = core::cmp::min(left, scratch.len());
                match self.connection.read(&mut scratch[..take]) {
                    Ok(0) => return Err(Error::ConnectionClosed),
                    Ok(n) => left -= n,
                    Err(_) => return Err(Error::ReadError),
                }
            }
            return Ok(None);
        }

        let qos_bits = (header_buf[0] >> 1) & 0x03;
        let remaining_len = self.read_remaining_length()?;
        if remaining_len > MAX_PAYLOAD {
            return Err(Error::ProtocolError);
        }

        let mut packet_buf = Vec::<u8, MAX_PAYLOAD>::new();
        packet_buf
            .resize(remaining_len, 0)
            .map_err(|_| Error::ProtocolError)?;
        let mut total_read = 0;
        while total_read < remaining_len {
            match self.connection.read(&mut packet_buf[total_read..]) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => total_read += n,
                Err(_) => return Err(Error::ReadError),
            }
        }

        if packet_buf.len() < 2 {
            return Err(Error::ProtocolError);
        }
        let topic_len = u16::from_be_bytes([packet_buf[0], packet_buf[1]]) as usize;
        if packet_buf.len() < 2 + topic_len {
            return Err(Error::ProtocolError);
        }
        let topic_bytes =
            Vec::<u8, 256>::from_slice(&packet_buf[2..2 + topic_len]).map_err(|_| Error::ProtocolError)?;
        let topic = String::from_utf8(topic_bytes).map_err(|_| Error::ProtocolError)?;

        // QoS 1/2 publishes carry a two-byte packet identifier before the payload.
        let mut payload_start = 2 + topic_len;
        if qos_bits > 0 {
            payload_start += 2;
            if packet_buf.len() < payload_start {
                return Err(Error::ProtocolError);
            }
        }
        let payload =
            Vec::from_slice(&packet_buf[payload_start..]).map_err(|_| Error::ProtocolError)?;

        Ok(Some(PublishPacket { topic, payload }))
    }

    /// Send a DISCONNECT packet and close the underlying connection.
    pub fn disconnect(mut self) -> Result<(), Error> {
        let packet = [DISCONNECT, 0x00];
        self.connection
            .write(&packet)
            .map_err(|_| Error::WriteError)?;
        self.connection.flush().map_err(|_| Error::WriteError)?;
        self.is_connected = false;
        self.connection.close().map_err(|_| Error::ProtocolError)
    }

    fn read_remaining_length(&mut self) -> Result<usize, Error> {
        let mut remaining_len = 0usize;
        let mut multiplier = 1usize;
        for _ in 0..4 {
            let mut byte = [0u8; 1];
            match self.connection.read(&mut byte) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(_) => {}
                Err(_) => return Err(Error::ReadError),
            }
            remaining_len += (byte[0] as usize & 127) * multiplier;
            multiplier *= 128;
            if (byte[0] & 0x80) == 0 {
                return Ok(remaining_len);
            }
        }
        Err(Error::ProtocolError)
    }
}

impl<C: Connection> core::fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Client")
            .field("is_connected", &self.is_connected)
            .finish()
    }
}

/// Encode the remaining length field for an MQTT packet.
///
/// The remaining length field is a variable-length encoding scheme used in
/// MQTT to specify the number of bytes following the fixed header. Each byte
/// encodes 7 bits of the length value; the most significant bit indicates if
/// another byte follows. This allows encoding values from 0 to 268,435,455.
fn encode_remaining_length(buf: &mut Vec<u8, 5>, mut len: usize) -> Result<(), ()> {
    loop {
        if buf.is_full() {
            return Err(());
        }
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.push(byte).map_err(|_| ())?;
        if len == 0 {
            break;
        }
    }
    Ok(())
}
