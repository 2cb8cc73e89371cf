//! # libota - Rust OTA update agent
//!
//! A Rust library that lets a resource-constrained networked device fetch,
//! validate, stage, and activate over-the-air firmware updates. The agent
//! coordinates with an update server over a pub/sub broker (MQTT), an HTTP(S)
//! server, or a short-range wireless link driven by an external host, and is
//! designed for embedded systems with `no_std` support.
//!
//! ## Features
//!
//! ### Update pipeline
//! - **State machine agent**: timed polling, job discovery, download, verify,
//!   result reporting, reboot
//! - **Job documents**: JSON update advertisements with version/board gating
//!   and server redirection
//! - **Chunked downloads**: custom binary chunk header for pub/sub transports
//!   with duplicate detection; HTTP range requests for HTTP(S)
//! - **Wireless link**: host-driven prepare/download/write/verify/abort flow
//!   with CRC-32 or ECDSA P-256 verification
//!
//! ### Storage
//! - Flash abstraction with named areas and dual image slots
//! - Bootloader trailer handling (set-pending / set-confirmed)
//! - Optional TAR archive demultiplexing into multiple slots
//!
//! ### Application integration
//! - A callback contract that lets the embedding application observe,
//!   short-circuit, or override every step of an update session
//! - A storage interface trait the application may replace wholesale
//!
//! ## Usage
//!
//! Add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! libota = "0.1.0"
//! ```
//!
//! The agent is generic over a connection factory implementing
//! [`network::Connect`]; the embedding application supplies the TCP or TLS
//! plumbing and the agent drives the protocol on top of it.
//!
//! ```rust,no_run
//! use libota::ota::callback::{AppCallback, CallbackEvent, CallbackResult};
//!
//! struct Watcher;
//!
//! impl AppCallback for Watcher {
//!     fn on_event(&mut self, _event: &mut CallbackEvent<'_>) -> CallbackResult {
//!         CallbackResult::Continue
//!     }
//! }
//!
//! // let handle = OtaAgent::start(network_params, agent_params, storage)?;
//! // ...
//! // handle.stop();
//! ```
//!
//! ## Platform support
//!
//! This library is designed to work on:
//! - Embedded microcontrollers (ARM Cortex-M, RISC-V, etc.)
//! - Linux-based IoT devices (Raspberry Pi, etc.)
//! - Any platform supporting Rust's `core` library (the threaded agent
//!   orchestrator itself requires the `std` feature)
//!
//! ## Optional features
//!
//! - `std`: Enable standard library support and the threaded agent (default)
//! - `defmt`: Enable defmt formatting of error types for embedded debugging

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

/// Network abstraction layer providing protocol implementations and connection management.
///
/// Contains the connection traits the embedding application implements plus
/// the HTTP and MQTT client implementations the transport adapters build on.
pub mod network;

/// Storage abstraction layer for flash devices.
///
/// Provides the storage traits the embedding application implements for its
/// flash parts, plus the flash map that carves a device into named areas and
/// handles the bootloader trailer.
pub mod storage;

/// Over-the-air (OTA) update agent combining the network and storage layers.
pub mod ota;
