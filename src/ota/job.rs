//! Job document parsing and gating.
//!
//! A job document is a JSON advertisement the update server publishes to
//! describe an available update: what it is (version, board), and where to
//! fetch it (transport, host, port, file or topic). Parsing applies three
//! gates before a download is allowed:
//!
//! 1. the advertised version must be strictly greater than the running one,
//! 2. the board name must match this device,
//! 3. the connection type must be recognized.
//!
//! A document naming a different broker/server (or transport) than the one
//! the job arrived on yields [`JobDecision::ChangingServer`]; the agent
//! redirects the data phase accordingly and returns to the initial
//! connection for result reporting.

use super::error::OtaError;
use super::{ConnectionKind, MAX_FILE_LEN, MAX_TOPIC_LEN, ServerInfo, Version};
use core::fmt::Write as _;
use heapless::String;
use serde::Deserialize;

/// Field capacities, matching the wire format's documented maxima.
const MAX_MESSAGE_LEN: usize = 32;
const MAX_MANUF_LEN: usize = 64;
const MAX_MANUF_ID_LEN: usize = 16;
const MAX_PRODUCT_LEN: usize = 64;
const MAX_SERIAL_LEN: usize = 32;
const MAX_BOARD_LEN: usize = 48;

/// Whether the data download can reuse the connection the job arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDecision {
    /// Same broker/server and port; keep the connection.
    SameServer,
    /// The job names different coordinates; reconnect before the data
    /// phase.
    ChangingServer,
}

/// The raw JSON shape. All fields optional at this level; presence rules
/// are enforced after deserialization so the error taxonomy can distinguish
/// a malformed document from a well-formed non-job document.
#[derive(Debug, Default, Deserialize)]
struct RawJob<'a> {
    #[serde(rename = "Message", default)]
    message: Option<&'a str>,
    #[serde(rename = "Manufacturer", default)]
    manufacturer: Option<&'a str>,
    #[serde(rename = "ManufacturerID", default)]
    manufacturer_id: Option<&'a str>,
    #[serde(rename = "Product", alias = "ProductID", default)]
    product: Option<&'a str>,
    #[serde(rename = "SerialNumber", default)]
    serial_number: Option<&'a str>,
    #[serde(rename = "Version", default)]
    version: Option<&'a str>,
    #[serde(rename = "Board", default)]
    board: Option<&'a str>,
    #[serde(rename = "Connection", default)]
    connection: Option<&'a str>,
    #[serde(rename = "Broker", default)]
    broker: Option<&'a str>,
    #[serde(rename = "Server", default)]
    server: Option<&'a str>,
    #[serde(rename = "Port", default)]
    port: Option<&'a str>,
    #[serde(rename = "File", default)]
    file: Option<&'a str>,
    #[serde(rename = "UniqueTopicName", default)]
    unique_topic: Option<&'a str>,
}

/// A parsed and gated job document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDocument {
    /// The `Message` field, e.g. `"Update Availability"`.
    pub message: String<MAX_MESSAGE_LEN>,
    /// Manufacturer name.
    pub manufacturer: String<MAX_MANUF_LEN>,
    /// Short manufacturer identifier.
    pub manufacturer_id: String<MAX_MANUF_ID_LEN>,
    /// Product name.
    pub product: String<MAX_PRODUCT_LEN>,
    /// Device serial number.
    pub serial_number: String<MAX_SERIAL_LEN>,
    /// Advertised update version.
    pub version: Version,
    /// Board the update is built for.
    pub board: String<MAX_BOARD_LEN>,
    /// Transport to fetch the data over.
    pub connection: ConnectionKind,
    /// Broker/server holding the image. Host and port inherit the current
    /// connection's values when the document leaves them empty.
    pub server: ServerInfo,
    /// File to request (HTTP flows).
    pub file: String<MAX_FILE_LEN>,
    /// Topic the device listens on for the data (pub/sub flows).
    pub unique_topic: String<MAX_TOPIC_LEN>,
}

impl JobDocument {
    /// Parse a job document and apply the gating rules.
    ///
    /// `running` and `board` describe this device; `current_kind` and
    /// `current_server` describe the connection the document arrived on and
    /// provide defaults for empty host/port fields.
    ///
    /// # Errors
    ///
    /// * [`OtaError::MalformedJobDoc`] - JSON syntax error, missing or
    ///   non-`M.N.B` `Version`, bad `Port`, or unrecognized `Connection`
    /// * [`OtaError::NotAJobDoc`] - valid JSON without the required fields
    /// * [`OtaError::InvalidVersion`] - version not strictly newer
    /// * [`OtaError::WrongBoard`] - board mismatch
    pub fn parse(
        raw: &[u8],
        running: Version,
        board: &str,
        current_kind: ConnectionKind,
        current_server: &ServerInfo,
    ) -> Result<(Self, JobDecision), OtaError> {
        if raw.is_empty() {
            return Err(OtaError::BadArg);
        }
        let (doc, _rest): (RawJob, usize) =
            serde_json_core::from_slice(raw).map_err(|_| OtaError::MalformedJobDoc)?;

        // Version gate first: a job without a parseable version is malformed.
        let version: Version = doc
            .version
            .ok_or(OtaError::MalformedJobDoc)?
            .parse()
            .map_err(|_| OtaError::MalformedJobDoc)?;

        // Required fields for a document to count as a job at all.
        let (Some(message), Some(job_board)) = (doc.message, doc.board) else {
            return Err(OtaError::NotAJobDoc);
        };

        if version <= running {
            log::error!(
                "job version {} not newer than running {}",
                version,
                running
            );
            return Err(OtaError::InvalidVersion);
        }

        if job_board != board {
            log::error!("job board {} does not match this device {}", job_board, board);
            return Err(OtaError::WrongBoard);
        }

        let connection = match doc.connection {
            None => current_kind,
            Some(s) => ConnectionKind::from_wire(s).ok_or(OtaError::MalformedJobDoc)?,
        };

        // Empty host/port mean "reuse the current connection's values".
        let host = doc.broker.or(doc.server).unwrap_or("");
        let host = if host.is_empty() {
            current_server.host.as_str()
        } else {
            host
        };
        let port = match doc.port {
            None | Some("") => current_server.port,
            Some(p) => p.parse().map_err(|_| OtaError::MalformedJobDoc)?,
        };
        let port = if port == 0 { current_server.port } else { port };

        warn_on_unconventional_port(connection, port);

        let decision = if connection == current_kind
            && host == current_server.host.as_str()
            && port == current_server.port
        {
            JobDecision::SameServer
        } else {
            JobDecision::ChangingServer
        };

        let job = Self {
            message: String::try_from(message).map_err(|_| OtaError::MalformedJobDoc)?,
            manufacturer: String::try_from(doc.manufacturer.unwrap_or(""))
                .map_err(|_| OtaError::MalformedJobDoc)?,
            manufacturer_id: String::try_from(doc.manufacturer_id.unwrap_or(""))
                .map_err(|_| OtaError::MalformedJobDoc)?,
            product: String::try_from(doc.product.unwrap_or(""))
                .map_err(|_| OtaError::MalformedJobDoc)?,
            serial_number: String::try_from(doc.serial_number.unwrap_or(""))
                .map_err(|_| OtaError::MalformedJobDoc)?,
            version,
            board: String::try_from(job_board).map_err(|_| OtaError::MalformedJobDoc)?,
            connection,
            server: ServerInfo::new(host, port).ok_or(OtaError::MalformedJobDoc)?,
            file: String::try_from(doc.file.unwrap_or("")).map_err(|_| OtaError::MalformedJobDoc)?,
            unique_topic: String::try_from(doc.unique_topic.unwrap_or(""))
                .map_err(|_| OtaError::MalformedJobDoc)?,
        };

        log::info!(
            "job: {} v{} for {} via {} {}:{}",
            job.message,
            job.version,
            job.board,
            job.connection.as_str(),
            job.server.host,
            job.server.port
        );

        Ok((job, decision))
    }

    /// Re-emit the parsed fields as a job document.
    ///
    /// Produces the canonical field order; parsing the output yields the
    /// same struct back.
    pub fn to_json(&self) -> Result<String<{ super::MAX_JSON_DOC_LEN }>, OtaError> {
        let mut out: String<{ super::MAX_JSON_DOC_LEN }> = String::new();
        let host_key = match self.connection {
            ConnectionKind::Mqtt => "Broker",
            _ => "Server",
        };
        write!(
            out,
            "{{\"Message\":\"{}\", \"Manufacturer\":\"{}\", \"ManufacturerID\":\"{}\", \
             \"Product\":\"{}\", \"SerialNumber\":\"{}\", \"Version\":\"{}\", \
             \"Board\":\"{}\", \"Connection\":\"{}\", \"{}\":\"{}\", \"Port\":\"{}\", \
             \"File\":\"{}\", \"UniqueTopicName\":\"{}\"}}",
            self.message,
            self.manufacturer,
            self.manufacturer_id,
            self.product,
            self.serial_number,
            self.version,
            self.board,
            self.connection.as_str(),
            host_key,
            self.server.host,
            self.server.port,
            self.file,
            self.unique_topic,
        )
        .map_err(|_| OtaError::OutOfMemory)?;
        Ok(out)
    }
}

/// Log a warning when the port is unusual for the connection type.
fn warn_on_unconventional_port(connection: ConnectionKind, port: u16) {
    use super::config::{
        HTTP_SERVER_PORT, HTTP_SERVER_PORT_TLS, MQTT_BROKER_PORT, MQTT_BROKER_PORT_TLS,
        MQTT_BROKER_PORT_TLS_CERT,
    };
    let conventional = match connection {
        ConnectionKind::Mqtt => [
            MQTT_BROKER_PORT,
            MQTT_BROKER_PORT_TLS,
            MQTT_BROKER_PORT_TLS_CERT,
        ]
        .contains(&port),
        ConnectionKind::Http | ConnectionKind::Https => {
            [HTTP_SERVER_PORT, HTTP_SERVER_PORT_TLS].contains(&port)
        }
    };
    if !conventional {
        log::warn!(
            "unconventional port {} for {} in job document",
            port,
            connection.as_str()
        );
    }
}
