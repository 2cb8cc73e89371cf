//! HTTP(S) transport adapter.
//!
//! The job document is one plain GET. The image data is a loop of
//! fixed-size `Range: bytes=A-B` GETs; the image's total size comes from the
//! first response's `Content-Range` header (the portion after the `/`). The
//! result report is a POST whose absence of a response counts as success,
//! since many update servers implement only the GETs.

use crate::network::application::http::{Client, Header, Method, Request};
use crate::network::{Close, Connect, Connection};
use crate::ota::agent::{CbBuffers, SessionCore};
use crate::ota::callback::{AppCallback, CallbackReason, CallbackResult};
use crate::ota::error::{OtaError, OtaStatus};
use crate::ota::event::bits;
use crate::ota::storage::{ChunkInfo, OtaStorage};
use crate::ota::{AgentState, MAX_JSON_DOC_LEN};
use core::fmt::Write as _;
use heapless::{String, Vec};

/// Size of one ranged data window.
pub const HTTP_CHUNK_SIZE: u32 = 4096;

/// HTTP adapter state: at most one client at a time.
pub struct HttpTransport<C: Connection> {
    client: Option<Client<C>>,
}

impl<C: Connection> core::fmt::Debug for HttpTransport<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("connected", &self.client.is_some())
            .finish()
    }
}

impl<C: Connection> HttpTransport<C> {
    /// A disconnected adapter.
    pub fn new() -> Self {
        Self { client: None }
    }

    /// Whether a client is live.
    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    pub(crate) fn connect<N, CB>(
        &mut self,
        factory: &mut N,
        core: &mut SessionCore<CB>,
    ) -> OtaStatus
    where
        N: Connect<Connection = C>,
        CB: AppCallback,
    {
        if self.client.is_some() {
            return OtaStatus::AlreadyConnected;
        }
        let remote = core.curr_server.remote();
        log::info!("HTTP connect to {}", remote);
        match factory.connect(&remote) {
            Ok(connection) => {
                self.client = Some(Client::new(connection));
                OtaStatus::Success
            }
            Err(err) => {
                log::error!("HTTP connect to {} failed: {:?}", remote, err);
                OtaError::Connect.into()
            }
        }
    }

    pub(crate) fn download_job<CB: AppCallback>(&mut self, core: &mut SessionCore<CB>) -> OtaStatus {
        let mut file = core.http_file.clone();
        match core.call_cb(
            CallbackReason::StateChange,
            AgentState::JobDownload,
            CbBuffers {
                file: Some(&mut file),
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

        let Some(client) = self.client.as_mut() else {
            return OtaError::GetJob.into();
        };

        let mut request = Request {
            method: Method::Get,
            path: file.as_str(),
            headers: Vec::new(),
            body: None,
        };
        if let Some(host) = host_header(&core.curr_server.remote()) {
            let _ = request.headers.push(host);
        }

        match client.request(&request) {
            Ok(response) if response.status_code == 200 => {
                match Vec::from_slice(&response.body) {
                    Ok(doc) => {
                        core.job_doc = doc;
                        log::info!("job document: {} bytes", core.job_doc.len());
                        OtaStatus::Success
                    }
                    Err(_) => {
                        log::error!("job document exceeds {} bytes", MAX_JSON_DOC_LEN);
                        OtaError::GetJob.into()
                    }
                }
            }
            Ok(response) => {
                log::error!("job GET returned status {}", response.status_code);
                OtaError::GetJob.into()
            }
            Err(err) => {
                log::error!("job GET failed: {:?}", err);
                OtaError::GetJob.into()
            }
        }
    }

    pub(crate) fn download_data<CB: AppCallback, S: OtaStorage>(
        &mut self,
        core: &mut SessionCore<CB>,
        storage: &mut S,
    ) -> OtaStatus {
        let mut file = core.http_file.clone();
        match core.call_cb(
            CallbackReason::StateChange,
            AgentState::DataDownload,
            CbBuffers {
                file: Some(&mut file),
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

        let host = host_header(&core.curr_server.remote());
        let mut offset: u32 = 0;

        loop {
            // Phase watchdogs and shutdown abort the window loop between
            // requests.
            core.fire_timers();
            if core.events().peek(bits::SHUTDOWN_NOW) != 0 {
                log::warn!("data download aborted by shutdown");
                return OtaError::GetData.into();
            }
            if core.events().take(bits::DOWNLOAD_TIMEOUT) != 0 {
                log::error!("data download timed out");
                return OtaError::GetData.into();
            }

            let total = core.storage_ctx.total_image_size;
            let mut range_end = offset + HTTP_CHUNK_SIZE - 1;
            if total > 0 && range_end >= total {
                range_end = total - 1;
            }

            let mut range_value: String<64> = String::new();
            let _ = write!(range_value, "bytes={}-{}", offset, range_end);

            let Some(client) = self.client.as_mut() else {
                return OtaError::GetData.into();
            };
            let mut request = Request {
                method: Method::Get,
                path: file.as_str(),
                headers: Vec::new(),
                body: None,
            };
            if let Some(header) = host.clone() {
                let _ = request.headers.push(header);
            }
            match Header::new("Range", &range_value) {
                Some(header) => {
                    let _ = request.headers.push(header);
                }
                None => return OtaError::GetData.into(),
            }

            let response = match client.request(&request) {
                Ok(response) if response.status_code == 200 || response.status_code == 206 => {
                    response
                }
                Ok(response) => {
                    log::error!("data GET returned status {}", response.status_code);
                    return OtaError::GetData.into();
                }
                Err(err) => {
                    log::error!("data GET failed: {:?}", err);
                    return OtaError::GetData.into();
                }
            };

            let total = if core.storage_ctx.total_image_size > 0 {
                core.storage_ctx.total_image_size
            } else {
                match response
                    .header("Content-Range")
                    .and_then(parse_content_range_total)
                {
                    Some(total) => total,
                    // A server ignoring Range replies 200 with the whole
                    // image.
                    None if response.status_code == 200 => response.body.len() as u32,
                    None => {
                        log::error!("no Content-Range in ranged response");
                        return OtaError::GetData.into();
                    }
                }
            };

            if response.body.is_empty() {
                log::error!("empty data response at offset {}", offset);
                return OtaError::GetData.into();
            }

            let chunk = ChunkInfo {
                total_size: total,
                offset,
                data: &response.body,
                packet_number: 0,
                total_packets: 0,
            };
            let status = core.write_chunk(storage, &chunk);
            if !status.is_success() {
                return status;
            }

            offset += response.body.len() as u32;
            log::debug!(
                "data: {} of {} bytes ({}%)",
                core.storage_ctx.total_bytes_written,
                core.storage_ctx.total_image_size,
                core.storage_ctx.percentage()
            );

            if core.storage_ctx.is_complete() {
                return OtaStatus::Success;
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
            "{{\"Message\":\"{}\", \"File\":\"{}\"}}",
            if success { "Success" } else { "Failure" },
            core.http_file
        )
        .is_err()
        {
            return OtaError::SendingResult.into();
        }

        let mut file = core.http_file.clone();
        match core.call_cb(
            CallbackReason::StateChange,
            AgentState::ResultSend,
            CbBuffers {
                file: Some(&mut file),
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

        let Some(client) = self.client.as_mut() else {
            return OtaError::SendingResult.into();
        };
        let mut request = Request {
            method: Method::Post,
            path: file.as_str(),
            headers: Vec::new(),
            body: Some(json.as_bytes()),
        };
        if let Some(host) = host_header(&core.curr_server.remote()) {
            let _ = request.headers.push(host);
        }

        match client.request(&request) {
            Ok(_) => OtaStatus::Success,
            // Servers commonly implement no POST handler at all; silence is
            // success.
            Err(crate::network::error::Error::ConnectionClosed)
            | Err(crate::network::error::Error::ReadError)
            | Err(crate::network::error::Error::Timeout) => {
                log::info!("no response to result POST, treating as success");
                OtaStatus::Success
            }
            Err(err) => {
                log::error!("result POST failed: {:?}", err);
                OtaError::SendingResult.into()
            }
        }
    }

    pub(crate) fn disconnect<CB: AppCallback>(&mut self, core: &mut SessionCore<CB>) -> OtaStatus {
        let _ = core;
        match self.client.take() {
            Some(client) => match client.into_connection().close() {
                Ok(()) => OtaStatus::Success,
                Err(_) => OtaError::Disconnect.into(),
            },
            None => OtaStatus::Success,
        }
    }
}

impl<C: Connection> Default for HttpTransport<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the `Host: host:port` header.
fn host_header(remote: &str) -> Option<Header> {
    Header::new("Host", remote)
}

/// Extract `TOTAL` from a `Content-Range: bytes A-B/TOTAL` value.
fn parse_content_range_total(value: &str) -> Option<u32> {
    let (_, total) = value.rsplit_once('/')?;
    let total = total.trim();
    if total == "*" {
        return None;
    }
    total.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_total() {
        assert_eq!(
            parse_content_range_total("bytes 0-4095/12000"),
            Some(12000)
        );
        assert_eq!(parse_content_range_total("bytes 0-10/11"), Some(11));
        assert_eq!(parse_content_range_total("bytes 0-10/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }
}
