//! End-to-end agent tests over scripted HTTP and MQTT servers.
//!
//! The mock connections speak just enough of each protocol to serve a job
//! document and an image, so these tests exercise the real transport
//! adapters, chunk framing, storage accounting and result reporting through
//! the public `OtaAgent` API.

use libota::network::{Close, Connect, Connection, Read, Write};
use libota::ota::callback::{AppCallback, CallbackEvent, CallbackResult};
use libota::ota::chunk::{ChunkHeader, IMAGE_TYPE_SINGLE_APP};
use libota::ota::storage::{ChunkInfo, OtaStorage, StorageContext};
use libota::ota::{
    AgentConfig, AgentParams, AgentState, ConnectionKind, NetworkParams, OtaAgent, OtaError,
    ServerInfo, UpdateFlow, Version,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// The singleton agent guard is process-wide; serialize the agent tests.
static AGENT_TEST_LOCK: Mutex<()> = Mutex::new(());

fn lock() -> MutexGuard<'static, ()> {
    AGENT_TEST_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

const BOARD: &str = "TEST_BOARD";

fn test_config() -> AgentConfig {
    let mut config = AgentConfig::default();
    config.board = BOARD;
    config.version = Version::new(1, 9, 9);
    config.reboot_upon_completion = false;
    config
}

/// Vec-backed storage observable from the test thread.
#[derive(Clone, Default)]
struct SharedStorage {
    staged: Arc<Mutex<Vec<u8>>>,
    verified: Arc<Mutex<u32>>,
}

impl OtaStorage for SharedStorage {
    fn open(&mut self, ctx: &mut StorageContext) -> Result<(), OtaError> {
        ctx.reset_progress();
        self.staged.lock().unwrap().clear();
        Ok(())
    }

    fn read(
        &mut self,
        _ctx: &mut StorageContext,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), OtaError> {
        let staged = self.staged.lock().unwrap();
        let offset = offset as usize;
        buf.copy_from_slice(&staged[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, _ctx: &mut StorageContext, chunk: &ChunkInfo<'_>) -> Result<(), OtaError> {
        let mut staged = self.staged.lock().unwrap();
        let end = chunk.offset as usize + chunk.data.len();
        if staged.len() < end {
            staged.resize(end, 0);
        }
        staged[chunk.offset as usize..end].copy_from_slice(chunk.data);
        Ok(())
    }

    fn close(&mut self, _ctx: &mut StorageContext) -> Result<(), OtaError> {
        Ok(())
    }

    fn verify(&mut self, _ctx: &mut StorageContext) -> Result<(), OtaError> {
        *self.verified.lock().unwrap() += 1;
        Ok(())
    }

    fn set_boot_pending(&mut self, _ctx: &mut StorageContext) -> Result<(), OtaError> {
        Ok(())
    }
}

/// Callback counting completed sessions, so tests can wait for one without
/// racing the worker's state transitions.
#[derive(Clone)]
struct Quiet {
    completions: Arc<std::sync::atomic::AtomicU32>,
}

impl Quiet {
    fn new() -> Self {
        Self {
            completions: Arc::new(std::sync::atomic::AtomicU32::new(0)),
        }
    }
}

impl AppCallback for Quiet {
    fn on_event(&mut self, event: &mut CallbackEvent<'_>) -> CallbackResult {
        use libota::ota::callback::CallbackReason;
        if event.state == AgentState::OtaComplete
            && matches!(event.reason, CallbackReason::Success | CallbackReason::Failure)
        {
            self.completions
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        CallbackResult::Continue
    }
}

/// Wait until the agent is parked in `AgentWaiting`.
fn wait_for_waiting(handle: &libota::ota::AgentHandle) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while handle.state() != AgentState::AgentWaiting {
        assert!(Instant::now() < deadline, "agent never reached AgentWaiting");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Kick off one session and wait for it to complete.
fn run_one_session(handle: &libota::ota::AgentHandle, callback: &Quiet) {
    let before = callback
        .completions
        .load(std::sync::atomic::Ordering::SeqCst);
    wait_for_waiting(handle);
    handle.get_update_now().unwrap();

    let deadline = Instant::now() + Duration::from_secs(30);
    while callback
        .completions
        .load(std::sync::atomic::Ordering::SeqCst)
        <= before
    {
        assert!(Instant::now() < deadline, "session never completed");
        std::thread::sleep(Duration::from_millis(5));
    }
    wait_for_waiting(handle);
}

// =====================================================================
// HTTP
// =====================================================================

/// Shared script for the HTTP server mock.
#[derive(Clone)]
struct HttpScript {
    job_doc: String,
    image: Arc<Vec<u8>>,
    posts: Arc<Mutex<Vec<String>>>,
}

struct HttpServerConn {
    script: HttpScript,
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
}

impl Read for HttpServerConn {
    type Error = ();

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let mut count = 0;
        while count < buf.len() {
            match self.outbox.pop_front() {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }
}

impl Write for HttpServerConn {
    type Error = ();

    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.inbox.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        let request = String::from_utf8_lossy(&self.inbox).into_owned();
        self.inbox.clear();
        self.respond(&request);
        Ok(())
    }
}

impl Close for HttpServerConn {
    type Error = ();

    fn close(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl Connection for HttpServerConn {}

impl HttpServerConn {
    fn respond(&mut self, request: &str) {
        let mut lines = request.lines();
        let Some(request_line) = lines.next() else {
            return;
        };
        let mut parts = request_line.split(' ');
        let method = parts.next().unwrap_or("");
        let path = parts.next().unwrap_or("");

        if method == "POST" {
            let body = request
                .split_once("\r\n\r\n")
                .map(|(_, body)| body.to_string())
                .unwrap_or_default();
            self.script.posts.lock().unwrap().push(body);
            self.queue_response(200, None, b"");
            return;
        }

        if path == "/ota_update.json" {
            let body = self.script.job_doc.clone();
            self.queue_response(200, None, body.as_bytes());
            return;
        }

        if path == "/ota.bin" {
            let image = self.script.image.clone();
            let range = request
                .lines()
                .find(|line| line.to_ascii_lowercase().starts_with("range:"))
                .and_then(parse_range);
            let (start, end) = match range {
                Some((start, end)) => (start, end.min(image.len() - 1)),
                None => (0, image.len() - 1),
            };
            let content_range = format!("bytes {}-{}/{}", start, end, image.len());
            let body = image[start..=end].to_vec();
            self.queue_response(206, Some(&content_range), &body);
            return;
        }

        self.queue_response(404, None, b"");
    }

    fn queue_response(&mut self, status: u16, content_range: Option<&str>, body: &[u8]) {
        let reason = match status {
            200 => "OK",
            206 => "Partial Content",
            _ => "Not Found",
        };
        let mut head = format!("HTTP/1.1 {} {}\r\nContent-Length: {}\r\n", status, reason, body.len());
        if let Some(range) = content_range {
            head.push_str(&format!("Content-Range: {}\r\n", range));
        }
        head.push_str("\r\n");
        self.outbox.extend(head.as_bytes());
        self.outbox.extend(body);
    }
}

fn parse_range(line: &str) -> Option<(usize, usize)> {
    let (_, value) = line.split_once('=')?;
    let (start, end) = value.trim().split_once('-')?;
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?))
}

#[derive(Clone)]
struct HttpFactory {
    script: HttpScript,
}

impl Connect for HttpFactory {
    type Connection = HttpServerConn;
    type Error = ();

    fn connect(&mut self, _remote: &str) -> Result<HttpServerConn, ()> {
        Ok(HttpServerConn {
            script: self.script.clone(),
            inbox: Vec::new(),
            outbox: VecDeque::new(),
        })
    }
}

fn http_network(script: HttpScript) -> NetworkParams<HttpFactory> {
    NetworkParams {
        connection: ConnectionKind::Http,
        server: ServerInfo::new("h", 80).unwrap(),
        file: "/ota_update.json",
        credentials: None,
        mqtt_one_call: true,
        connect: HttpFactory { script },
    }
}

#[test]
fn http_job_flow_range_loop_downloads_exact_image() {
    let _guard = lock();

    // Server slices the 12000-byte image into 4096-byte ranges; the agent
    // must accumulate exactly total_image_size bytes.
    let image: Vec<u8> = (0..12_000u32).map(|i| (i % 253) as u8).collect();
    let script = HttpScript {
        job_doc: format!(
            r#"{{"Message":"Update Availability","Manufacturer":"X","ManufacturerID":"X","Product":"P","SerialNumber":"S","Version":"2.0.0","Board":"{}","Connection":"HTTP","Server":"h","Port":"80","File":"/ota.bin"}}"#,
            BOARD
        ),
        image: Arc::new(image.clone()),
        posts: Arc::new(Mutex::new(Vec::new())),
    };
    let storage = SharedStorage::default();
    let staged = storage.staged.clone();
    let verified = storage.verified.clone();
    let posts = script.posts.clone();
    let callback = Quiet::new();

    let handle = OtaAgent::start(
        http_network(script),
        AgentParams {
            config: test_config(),
            callback: callback.clone(),
        },
        storage,
    )
    .unwrap();

    run_one_session(&handle, &callback);

    assert_eq!(handle.last_error(), None);
    assert_eq!(*staged.lock().unwrap(), image);
    assert_eq!(*verified.lock().unwrap(), 1);

    // Result POST declared success.
    let posts = posts.lock().unwrap();
    assert_eq!(posts.len(), 1);
    assert!(posts[0].contains("\"Success\""), "post body: {}", posts[0]);

    assert_eq!(handle.stop(), None);
}

#[test]
fn http_version_rejection_downloads_nothing() {
    let _guard = lock();

    let script = HttpScript {
        job_doc: format!(
            r#"{{"Message":"Update Availability","Version":"1.9.9","Board":"{}","Connection":"HTTP","Server":"h","Port":"80","File":"/ota.bin"}}"#,
            BOARD
        ),
        image: Arc::new(vec![0u8; 1000]),
        posts: Arc::new(Mutex::new(Vec::new())),
    };
    let storage = SharedStorage::default();
    let staged = storage.staged.clone();
    let posts = script.posts.clone();
    let callback = Quiet::new();

    let handle = OtaAgent::start(
        http_network(script),
        AgentParams {
            config: test_config(),
            callback: callback.clone(),
        },
        storage,
    )
    .unwrap();

    run_one_session(&handle, &callback);

    assert_eq!(handle.last_error(), Some(OtaError::InvalidVersion));
    assert!(staged.lock().unwrap().is_empty());
    // The failure is still reported.
    let posts = posts.lock().unwrap();
    assert_eq!(posts.len(), 1);
    assert!(posts[0].contains("\"Failure\""));

    assert_eq!(handle.stop(), Some(OtaError::InvalidVersion));
}

#[test]
fn http_direct_flow_skips_job_document() {
    let _guard = lock();

    let image: Vec<u8> = (0..5_000u32).map(|i| (i % 241) as u8).collect();
    let script = HttpScript {
        job_doc: String::new(),
        image: Arc::new(image.clone()),
        posts: Arc::new(Mutex::new(Vec::new())),
    };
    let storage = SharedStorage::default();
    let staged = storage.staged.clone();
    let posts = script.posts.clone();

    let mut network = http_network(script);
    network.file = "/ota.bin";
    let mut config = test_config();
    config.use_flow = UpdateFlow::Direct;

    let callback = Quiet::new();
    let handle = OtaAgent::start(
        network,
        AgentParams {
            config,
            callback: callback.clone(),
        },
        storage,
    )
    .unwrap();

    run_one_session(&handle, &callback);

    assert_eq!(handle.last_error(), None);
    assert_eq!(*staged.lock().unwrap(), image);
    // Direct flow never reports a result.
    assert!(posts.lock().unwrap().is_empty());

    handle.stop();
}

#[test]
fn second_agent_start_is_rejected() {
    let _guard = lock();

    let script = HttpScript {
        job_doc: String::new(),
        image: Arc::new(Vec::new()),
        posts: Arc::new(Mutex::new(Vec::new())),
    };

    let handle = OtaAgent::start(
        http_network(script.clone()),
        AgentParams {
            config: test_config(),
            callback: Quiet::new(),
        },
        SharedStorage::default(),
    )
    .unwrap();

    let second = OtaAgent::start(
        http_network(script),
        AgentParams {
            config: test_config(),
            callback: Quiet::new(),
        },
        SharedStorage::default(),
    );
    assert!(matches!(second, Err(OtaError::AlreadyStarted)));

    handle.stop();
}

// =====================================================================
// MQTT
// =====================================================================

/// Shared script for the broker mock.
#[derive(Clone)]
struct MqttScript {
    job_doc: String,
    image: Arc<Vec<u8>>,
    /// Results published by the device on the listen topic.
    results: Arc<Mutex<Vec<String>>>,
    /// Inject a duplicate of chunk 1 and a garbage payload mid-stream.
    inject_noise: bool,
}

struct BrokerConn {
    script: MqttScript,
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
    unique_topic: Option<String>,
}

impl Read for BrokerConn {
    type Error = ();

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let mut count = 0;
        while count < buf.len() {
            match self.outbox.pop_front() {
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
                None => break,
            }
        }
        Ok(count)
    }
}

impl Write for BrokerConn {
    type Error = ();

    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.inbox.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        while let Some(consumed) = self.handle_packet() {
            self.inbox.drain(..consumed);
        }
        Ok(())
    }
}

impl Close for BrokerConn {
    type Error = ();

    fn close(self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl Connection for BrokerConn {}

impl BrokerConn {
    /// Parse one complete MQTT packet from the inbox; returns bytes
    /// consumed.
    fn handle_packet(&mut self) -> Option<usize> {
        if self.inbox.len() < 2 {
            return None;
        }
        let packet_type = self.inbox[0] & 0xF0;

        // Decode the remaining-length varint.
        let mut remaining = 0usize;
        let mut multiplier = 1usize;
        let mut header_len = 1;
        loop {
            let byte = *self.inbox.get(header_len)?;
            header_len += 1;
            remaining += (byte as usize & 127) * multiplier;
            multiplier *= 128;
            if byte & 0x80 == 0 {
                break;
            }
        }
        let total = header_len + remaining;
        if self.inbox.len() < total {
            return None;
        }
        let body: Vec<u8> = self.inbox[header_len..total].to_vec();

        match packet_type {
            0x10 => {
                // CONNECT -> CONNACK accepted
                self.outbox.extend([0x20, 0x02, 0x00, 0x00]);
            }
            0x80 => {
                // SUBSCRIBE -> SUBACK (granted QoS 0); remember the topic
                let pid = [body[0], body[1]];
                let topic_len = u16::from_be_bytes([body[2], body[3]]) as usize;
                let topic = String::from_utf8_lossy(&body[4..4 + topic_len]).into_owned();
                self.unique_topic = Some(topic);
                self.outbox.extend([0x90, 0x03, pid[0], pid[1], 0x00]);
            }
            0x30 => {
                // PUBLISH from the device
                let qos = (self.inbox[0] >> 1) & 0x03;
                let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                let mut payload_start = 2 + topic_len;
                if qos > 0 {
                    payload_start += 2;
                }
                let payload = String::from_utf8_lossy(&body[payload_start..]).into_owned();
                self.handle_request(&payload);
            }
            _ => {}
        }
        Some(total)
    }

    fn handle_request(&mut self, payload: &str) {
        // Requests embed the topic to respond on.
        let topic = extract_json_field(payload, "UniqueTopicName")
            .or_else(|| self.unique_topic.clone());

        if payload.contains("\"Update Availability\"") {
            if let Some(topic) = topic {
                let job = self.script.job_doc.clone();
                self.queue_publish(&topic, job.as_bytes());
            }
        } else if payload.contains("\"Request Update\"") {
            if let Some(topic) = topic {
                self.queue_image_chunks(&topic);
            }
        } else if payload.contains("\"Success\"") || payload.contains("\"Failure\"") {
            self.script.results.lock().unwrap().push(payload.to_string());
        }
    }

    fn queue_image_chunks(&mut self, topic: &str) {
        let image = self.script.image.clone();
        const CHUNK: usize = 1024;
        let total_payloads = image.len().div_ceil(CHUNK) as u16;

        let mut index = 0u16;
        let mut offset = 0usize;
        while offset < image.len() {
            let end = (offset + CHUNK).min(image.len());
            let chunk = build_chunk_payload(
                &image[offset..end],
                offset as u32,
                image.len() as u32,
                index,
                total_payloads,
            );
            self.queue_publish(topic, &chunk);

            if self.script.inject_noise && index == 1 {
                // Duplicate of chunk 1 carrying different bytes: must be
                // dropped, not written.
                let bogus = vec![0xEE; end - offset];
                let duplicate = build_chunk_payload(
                    &bogus,
                    offset as u32,
                    image.len() as u32,
                    index,
                    total_payloads,
                );
                self.queue_publish(topic, &duplicate);
                // And a payload without the chunk magic: must be ignored.
                self.queue_publish(topic, b"not a chunk at all");
            }

            offset = end;
            index += 1;
        }
    }

    fn queue_publish(&mut self, topic: &str, payload: &[u8]) {
        let remaining = 2 + topic.len() + payload.len();
        self.outbox.push_back(0x30);
        let mut len = remaining;
        loop {
            let mut byte = (len % 128) as u8;
            len /= 128;
            if len > 0 {
                byte |= 0x80;
            }
            self.outbox.push_back(byte);
            if len == 0 {
                break;
            }
        }
        self.outbox
            .extend((topic.len() as u16).to_be_bytes());
        self.outbox.extend(topic.as_bytes());
        self.outbox.extend(payload);
    }
}

fn extract_json_field(payload: &str, key: &str) -> Option<String> {
    let needle = format!("\"{}\"", key);
    let at = payload.find(&needle)? + needle.len();
    let rest = &payload[at..];
    let open = rest.find('"')?;
    let rest = &rest[open + 1..];
    let close = rest.find('"')?;
    Some(rest[..close].to_string())
}

fn build_chunk_payload(
    data: &[u8],
    image_offset: u32,
    total_size: u32,
    index: u16,
    total_payloads: u16,
) -> Vec<u8> {
    let header = ChunkHeader {
        offset_to_data: ChunkHeader::SIZE as u16,
        image_type: IMAGE_TYPE_SINGLE_APP,
        update_version: Version::new(2, 0, 0),
        total_size,
        image_offset,
        data_size: data.len() as u16,
        total_num_payloads: total_payloads,
        this_payload_index: index,
    };
    let mut payload = vec![0u8; ChunkHeader::SIZE + data.len()];
    header.write_to(&mut payload).unwrap();
    payload[ChunkHeader::SIZE..].copy_from_slice(data);
    payload
}

#[derive(Clone)]
struct MqttFactory {
    script: MqttScript,
}

impl Connect for MqttFactory {
    type Connection = BrokerConn;
    type Error = ();

    fn connect(&mut self, _remote: &str) -> Result<BrokerConn, ()> {
        Ok(BrokerConn {
            script: self.script.clone(),
            inbox: Vec::new(),
            outbox: VecDeque::new(),
            unique_topic: None,
        })
    }
}

#[test]
fn mqtt_job_flow_with_duplicates_and_noise() {
    let _guard = lock();

    let image: Vec<u8> = (0..5_000u32).map(|i| (i % 247) as u8).collect();
    let script = MqttScript {
        job_doc: format!(
            r#"{{"Message":"Update Availability","Version":"2.0.0","Board":"{}","Connection":"MQTT","Broker":"","Port":""}}"#,
            BOARD
        ),
        image: Arc::new(image.clone()),
        results: Arc::new(Mutex::new(Vec::new())),
        inject_noise: true,
    };
    let storage = SharedStorage::default();
    let staged = storage.staged.clone();
    let verified = storage.verified.clone();
    let results = script.results.clone();

    let network = NetworkParams {
        connection: ConnectionKind::Mqtt,
        server: ServerInfo::new("broker", 1883).unwrap(),
        file: "",
        credentials: None,
        mqtt_one_call: true,
        connect: MqttFactory { script },
    };

    let callback = Quiet::new();
    let handle = OtaAgent::start(
        network,
        AgentParams {
            config: test_config(),
            callback: callback.clone(),
        },
        storage,
    )
    .unwrap();

    run_one_session(&handle, &callback);

    assert_eq!(handle.last_error(), None);
    // The duplicate's bogus bytes must not have landed: the staged image is
    // bit-exact.
    assert_eq!(*staged.lock().unwrap(), image);
    assert_eq!(*verified.lock().unwrap(), 1);

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].contains("\"Success\""));

    handle.stop();
}
