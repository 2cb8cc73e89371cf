//! HTTP/1.1 protocol implementation for embedded systems.
//!
//! This module provides a lightweight HTTP client implementation designed
//! specifically for embedded systems and `no_std` environments. It focuses on
//! simplicity, predictable memory usage, and compatibility with
//! resource-constrained devices.
//!
//! # Features
//!
//! - HTTP/1.1 protocol compliance
//! - Synchronous request/response model
//! - Fixed-size buffers for predictable memory usage
//! - Support for custom headers (including `Range`)
//! - GET and POST method support
//! - Connection reuse capability
//!
//! # Usage
//!
//! The main entry point is the [`client::Client`] which works with any
//! connection type implementing the [`crate::network::Connection`] trait.
//! The OTA agent uses it for three request shapes: a plain GET for the job
//! document, a `Range: bytes=A-B` GET loop for the image data, and a POST
//! for the result report.

pub mod client;

pub use client::{Client, Header, Method, Request, Response};
