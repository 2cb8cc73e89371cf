//! Application layer protocol implementations.
//!
//! The OTA transport adapters are built on two small protocol clients: an
//! HTTP/1.1 client used for job documents, ranged image downloads, and result
//! POSTs, and an MQTT 3.1.1 client used for the pub/sub job/data/result flow.
//! Both are connection agnostic and work with anything implementing
//! [`crate::network::Connection`].

/// HTTP/1.1 protocol implementation
pub mod http;

/// MQTT 3.1.1 protocol implementation
pub mod mqtt;
