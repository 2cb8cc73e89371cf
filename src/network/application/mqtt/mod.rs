//! MQTT 3.1.1 protocol implementation for embedded systems.
//!
//! This module provides an MQTT 3.1.1 client implementation designed for
//! embedded systems and `no_std` environments. MQTT (Message Queuing
//! Telemetry Transport) is a lightweight publish-subscribe messaging protocol
//! ideal for IoT applications.
//!
//! # Protocol Overview
//!
//! MQTT uses a publish-subscribe pattern where:
//! - **Publishers** send messages to topics
//! - **Subscribers** receive messages from topics they're interested in
//! - **Brokers** route messages between publishers and subscribers
//!
//! The OTA agent publishes its update requests on a well-known topic that the
//! update publisher listens on, and subscribes to a per-session unique topic
//! on which the publisher addresses its responses (the job document and the
//! chunked image payloads).
//!
//! # Key Features
//!
//! - MQTT 3.1.1 specification compliance
//! - Quality of Service (QoS) levels 0, 1, and 2
//! - Optional username/password authentication
//! - Clean session and persistent session support
//! - Fixed-size buffers sized for OTA chunk payloads
//!
//! The main entry point is the [`client::Client`] which provides methods for
//! connecting, publishing, subscribing, and receiving messages.

pub mod client;

pub use client::{Client, Options, PublishPacket, QoS};
