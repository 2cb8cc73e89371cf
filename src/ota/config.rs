//! Agent configuration: timing, retry counts, flow toggles and device
//! identity.

use super::error::OtaError;

/// Minimum accepted value for the timing intervals, in seconds.
pub const INTERVAL_SECS_MIN: u32 = 5;

/// Maximum accepted value for the timing intervals, in seconds (one year).
pub const INTERVAL_SECS_MAX: u32 = 60 * 60 * 24 * 365;

/// Default MQTT broker port.
pub const MQTT_BROKER_PORT: u16 = 1883;
/// Default MQTT-over-TLS broker port.
pub const MQTT_BROKER_PORT_TLS: u16 = 8883;
/// Default MQTT-over-TLS-with-certificates broker port.
pub const MQTT_BROKER_PORT_TLS_CERT: u16 = 8884;
/// Default HTTP server port.
pub const HTTP_SERVER_PORT: u16 = 80;
/// Default HTTPS server port.
pub const HTTP_SERVER_PORT_TLS: u16 = 443;

/// Default job document path for HTTP job-flow downloads.
pub const DEFAULT_JOB_FILE: &str = "/ota_update.json";

/// Default image path for HTTP direct-flow downloads.
pub const DEFAULT_DATA_FILE: &str = "/ota-update.bin";

/// Which update flow a session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateFlow {
    /// Fetch a job document first, then follow its instructions.
    Job,
    /// Download the image directly from known coordinates.
    Direct,
}

/// Identity fields interpolated into the request documents sent to the
/// update publisher.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    /// Manufacturer name.
    pub manufacturer: &'static str,
    /// Short manufacturer identifier.
    pub manufacturer_id: &'static str,
    /// Product name.
    pub product: &'static str,
    /// Device serial number.
    pub serial_number: &'static str,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            manufacturer: "Express Widgits Corporation",
            manufacturer_id: "EWCO",
            product: "Easy Widgit",
            serial_number: "ABC213450001",
        }
    }
}

/// OTA agent configuration.
///
/// Timing fields are in seconds and validated to
/// `[INTERVAL_SECS_MIN, INTERVAL_SECS_MAX]`; zero disables the timeouts that
/// document it.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Delay from agent start to the first update check.
    pub initial_check_secs: u32,
    /// Delay between the end of a session and the next check.
    pub next_check_secs: u32,
    /// Delay before retrying after a failed connect.
    pub retry_interval_secs: u32,
    /// Watchdog for the job-document phase. 0 disables.
    pub job_check_timeout_secs: u32,
    /// Watchdog for the data phase. 0 disables.
    pub data_check_timeout_secs: u32,
    /// How long the agent stays connected waiting for a download to begin.
    pub check_window_secs: u32,
    /// Maximum gap between data packets before the per-packet watchdog
    /// aborts a pub/sub download.
    pub packet_interval_secs: u32,

    /// Overall session retries.
    pub retries: u8,
    /// Connect attempts per phase before giving up.
    pub connect_retries: u8,
    /// Data-download attempts per session before giving up.
    pub max_download_tries: u8,

    /// Whether a session starts with a job document or goes straight to the
    /// image.
    pub use_flow: UpdateFlow,
    /// Reboot the device when a session completes successfully.
    pub reboot_upon_completion: bool,
    /// When true the application confirms the new image after reboot;
    /// when false the staged image is marked permanent before reboot.
    pub validate_after_reboot: bool,
    /// Skip result reporting entirely.
    pub do_not_send_result: bool,

    /// The running firmware version updates are gated against.
    pub version: super::Version,
    /// Compile-time board name; jobs for other boards are rejected.
    pub board: &'static str,
    /// Identity interpolated into request documents.
    pub identity: DeviceIdentity,

    /// First topic segment for all OTA topics.
    pub company_prepend: &'static str,
    /// Topic leaf the publisher listens for requests on.
    pub publisher_listen_topic: &'static str,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            initial_check_secs: 60,
            next_check_secs: 60 * 60 * 24,
            retry_interval_secs: 5,
            job_check_timeout_secs: 30,
            data_check_timeout_secs: 20 * 60,
            check_window_secs: 10 * 60,
            packet_interval_secs: 60,
            retries: 5,
            connect_retries: 3,
            max_download_tries: 3,
            use_flow: UpdateFlow::Job,
            reboot_upon_completion: true,
            validate_after_reboot: false,
            do_not_send_result: false,
            version: super::Version::new(0, 0, 0),
            board: "UNKNOWN_BOARD",
            identity: DeviceIdentity::default(),
            company_prepend: "OTAUpdate",
            publisher_listen_topic: "publish_notify",
        }
    }
}

impl AgentConfig {
    /// Validate the timing fields.
    ///
    /// The three scheduling intervals must fall inside the documented range;
    /// the phase watchdogs may be zero (disabled) but are range-checked
    /// otherwise.
    pub fn validate(&self) -> Result<(), OtaError> {
        for interval in [
            self.initial_check_secs,
            self.next_check_secs,
            self.retry_interval_secs,
        ] {
            if !(INTERVAL_SECS_MIN..=INTERVAL_SECS_MAX).contains(&interval) {
                return Err(OtaError::BadArg);
            }
        }
        for timeout in [
            self.job_check_timeout_secs,
            self.data_check_timeout_secs,
            self.check_window_secs,
            self.packet_interval_secs,
        ] {
            if timeout != 0 && !(INTERVAL_SECS_MIN..=INTERVAL_SECS_MAX).contains(&timeout) {
                return Err(OtaError::BadArg);
            }
        }
        if self.board.is_empty() {
            return Err(OtaError::BadArg);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(AgentConfig::default().validate().is_ok());
    }

    #[test]
    fn out_of_range_interval_rejected() {
        let mut config = AgentConfig::default();
        config.retry_interval_secs = 2;
        assert_eq!(config.validate(), Err(OtaError::BadArg));

        let mut config = AgentConfig::default();
        config.next_check_secs = INTERVAL_SECS_MAX + 1;
        assert_eq!(config.validate(), Err(OtaError::BadArg));
    }

    #[test]
    fn zero_watchdogs_allowed() {
        let mut config = AgentConfig::default();
        config.job_check_timeout_secs = 0;
        config.data_check_timeout_secs = 0;
        config.packet_interval_secs = 0;
        assert!(config.validate().is_ok());
    }
}
