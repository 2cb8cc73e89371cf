//! # Network abstraction layer for embedded systems
//!
//! This module provides the traits the OTA agent uses to talk to an update
//! server without caring about the underlying transport. The embedding
//! application supplies the plumbing (plain TCP, TLS, a modem AT channel) by
//! implementing these traits; the protocol clients in
//! [`application`](crate::network::application) run on top of them.
//!
//! ## Design Philosophy
//!
//! - **Protocol Agnostic**: Core traits work with any underlying transport
//! - **Zero-Cost Abstractions**: Traits compile down to direct function calls
//! - **Embedded-First**: Designed for `no_std` environments with limited resources
//! - **Composable**: Mix and match connection types and protocols
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use libota::network::{Connection, Read, Write};
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
//! fn communicate_with_server<C: Connection>(mut conn: C) {
//!     let data = b"Hello, server!";
//!     if conn.write(data).is_ok() {
//!         let _ = conn.flush();
//!     }
//!
//!     let mut response = [0u8; 64];
//!     let _ = conn.read(&mut response);
//! }
//! ```

#![allow(missing_docs)]
#![deny(unsafe_code)]

/// Common error types for network operations
pub mod error;

/// OSI Layer 7: Application layer protocol implementations
pub mod application;

/// Re-exports of common traits for convenient importing
pub mod prelude {
    pub use super::{Close, Connect, Read, Write};
}

/// Trait for reading data from a network connection.
///
/// This trait provides a synchronous interface for reading data from any
/// network connection. It's designed to be simple and efficient for embedded
/// systems.
pub trait Read {
    /// Associated error type for read operations
    type Error: core::fmt::Debug;

    /// Read data from the connection into the provided buffer.
    ///
    /// Returns the number of bytes read. A return value of 0 indicates that
    /// no data is currently available, or that the connection has been closed
    /// by the remote end.
    ///
    /// # Arguments
    ///
    /// * `buf` - Buffer to read data into
    ///
    /// # Returns
    ///
    /// * `Ok(n)` - Number of bytes read
    /// * `Err(e)` - Read error occurred
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;
}

/// Trait for writing data to a network connection.
///
/// This trait provides a synchronous interface for writing data to any
/// network connection with support for flushing buffered data.
pub trait Write {
    /// Associated error type for write operations
    type Error: core::fmt::Debug;

    /// Write data to the connection.
    ///
    /// Returns the number of bytes written. The implementation may write
    /// fewer bytes than requested.
    ///
    /// # Arguments
    ///
    /// * `buf` - Data to write
    ///
    /// # Returns
    ///
    /// * `Ok(n)` - Number of bytes written
    /// * `Err(e)` - Write error occurred
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error>;

    /// Flush any buffered write data.
    ///
    /// This ensures that all buffered data is sent over the connection.
    /// Some implementations may be no-ops if no buffering is used.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Flush completed successfully
    /// * `Err(e)` - Flush error occurred
    fn flush(&mut self) -> Result<(), Self::Error>;
}

/// Trait for closing network connections.
///
/// Provides a clean way to close connections and free associated resources.
pub trait Close {
    /// Associated error type for close operations
    type Error: core::fmt::Debug;

    /// Close the connection and free any associated resources.
    ///
    /// After calling this method, the connection should not be used for
    /// further operations.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Connection closed successfully
    /// * `Err(e)` - Error occurred while closing
    fn close(self) -> Result<(), Self::Error>;
}

/// A complete synchronous network connection.
///
/// This trait combines reading, writing, and closing capabilities into a
/// single unified interface. Any type implementing this trait can be used
/// with the protocol implementations.
pub trait Connection: Read + Write + Close {}

/// Trait for establishing outbound network connections (client-side).
///
/// The OTA agent holds a value implementing this trait and asks it for a new
/// connection at the start of every job/data/result phase. The `remote`
/// string has the form `"host:port"`; an application-provided implementation
/// decides whether that means plain TCP, TLS, or something else entirely.
pub trait Connect {
    /// The type of connection that will be created
    type Connection: Connection;
    /// Associated error type for connection operations
    type Error: core::fmt::Debug;

    /// Establish a connection to a remote endpoint.
    ///
    /// # Arguments
    ///
    /// * `remote` - Address of the remote endpoint, `"host:port"`
    ///
    /// # Returns
    ///
    /// * `Ok(connection)` - Connection established successfully
    /// * `Err(e)` - Failed to establish connection
    fn connect(&mut self, remote: &str) -> Result<Self::Connection, Self::Error>;
}
