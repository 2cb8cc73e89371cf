//! HTTP/1.1 client implementation for embedded systems.
//!
//! This module provides a lightweight HTTP client designed for `no_std`
//! environments. It supports basic HTTP operations with fixed-size buffers
//! and minimal memory usage.
//!
//! # Limitations
//!
//! - Only supports HTTP/1.1 (no HTTP/2 or HTTP/3)
//! - Limited to GET and POST methods
//! - Maximum header count and sizes are compile-time constants
//! - Response body size is limited by buffer capacity
//! - No automatic redirect handling
//!
//! # Examples
//!
//! ```rust,no_run
//! use libota::network::application::http::{Client, Request, Method};
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
//! let mut client = Client::new(connection);
//!
//! let request = Request {
//!     method: Method::Get,
//!     path: "/ota_update.json",
//!     headers: heapless::Vec::new(),
//!     body: None,
//! };
//!
//! // let response = client.request(&request)?;
//! // println!("Status: {}", response.status_code);
//! ```

use crate::network::Connection;
use crate::network::error::Error;
use core::fmt::Write;
use heapless::{String, Vec};

/// Maximum number of headers allowed per request/response.
const MAX_HEADERS: usize = 16;

/// Maximum length for header names in bytes.
const MAX_HEADER_NAME_LEN: usize = 64;

/// Maximum length for header values in bytes.
const MAX_HEADER_VALUE_LEN: usize = 256;

/// Maximum response body size in bytes.
///
/// Sized to hold one ranged OTA data chunk (4096 bytes) with headroom for
/// smaller documents sharing the same client.
pub const MAX_RESPONSE_BODY: usize = 4096 + 512;

/// HTTP request methods supported by the client.
///
/// The OTA flows only need GET (job document, ranged data) and POST (result
/// report). Additional methods can be added as needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// HTTP GET method for retrieving data.
    Get,
    /// HTTP POST method for sending data.
    Post,
}

impl Method {
    /// Convert the method to its string representation.
    ///
    /// Returns the standard HTTP method name as used in request lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

/// An HTTP header consisting of a name-value pair.
///
/// Both the name and value are stored as heap-free strings with compile-time
/// size limits.
#[derive(Debug, Clone)]
pub struct Header {
    /// The header name (e.g., "Content-Type", "Range").
    pub name: String<MAX_HEADER_NAME_LEN>,
    /// The header value (e.g., "application/json", "bytes=0-4095").
    pub value: String<MAX_HEADER_VALUE_LEN>,
}

impl Header {
    /// Build a header from a name/value pair.
    ///
    /// Returns `None` when either string exceeds its capacity.
    pub fn new(name: &str, value: &str) -> Option<Self> {
        Some(Header {
            name: String::try_from(name).ok()?,
            value: String::try_from(value).ok()?,
        })
    }
}

/// An HTTP request to be sent by the client.
///
/// Contains all the information needed to construct a complete HTTP request,
/// including method, path, headers, and optional body data.
pub struct Request<'a> {
    /// The HTTP method to use for this request.
    pub method: Method,
    /// The request path (e.g., "/ota-update.bin").
    pub path: &'a str,
    /// Optional headers to include with the request.
    pub headers: Vec<Header, MAX_HEADERS>,
    /// Optional request body data.
    pub body: Option<&'a [u8]>,
}

impl core::fmt::Debug for Request<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("path", &self.path)
            .finish()
    }
}

/// An HTTP response received from the server.
///
/// Contains the response status code, headers, and body data returned by the
/// server. The body size is limited by [`MAX_RESPONSE_BODY`].
#[derive(Debug)]
pub struct Response {
    /// HTTP status code (e.g., 200, 206, 404).
    pub status_code: u16,
    /// Response headers sent by the server.
    pub headers: Vec<Header, MAX_HEADERS>,
    /// Response body data.
    pub body: Vec<u8, MAX_RESPONSE_BODY>,
}

impl Response {
    /// Look up a response header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}

/// HTTP client for making requests over any connection type.
///
/// The client is generic over the connection type, allowing it to work with
/// different transport layers (TCP, TLS, etc.) as long as they implement
/// the [`Connection`] trait.
pub struct Client<C: Connection> {
    connection: C,
}

impl<C: Connection> Client<C> {
    /// Create a new HTTP client with the given connection.
    ///
    /// The connection should already be established to the target server.
    /// The client takes ownership of the connection and will use it for
    /// sending requests and receiving responses.
    pub fn new(connection: C) -> Self {
        Self { connection }
    }

    /// Consume the client, returning the underlying connection.
    pub fn into_connection(self) -> C {
        self.connection
    }

    /// Send an HTTP request and receive the response.
    ///
    /// This method constructs a complete HTTP request from the provided
    /// [`Request`], sends it over the connection, and parses the response.
    /// The operation is synchronous and will block until the response is
    /// received or an error occurs.
    ///
    /// # Errors
    ///
    /// * [`Error::WriteError`] - Failed to send the request
    /// * [`Error::ReadError`] - Failed to read the response
    /// * [`Error::ConnectionClosed`] - Connection was closed unexpectedly
    /// * [`Error::ProtocolError`] - Invalid HTTP response format
    pub fn request(&mut self, request: &Request) -> Result<Response, Error> {
        // --- Build Request ---
        let mut request_buf: Vec<u8, 2048> = Vec::new();

        // Request line
        request_buf
            .extend_from_slice(request.method.as_str().as_bytes())
            .map_err(|_| Error::WriteError)?;
        request_buf.push(b' ').map_err(|_| Error::WriteError)?;
        request_buf
            .extend_from_slice(request.path.as_bytes())
            .map_err(|_| Error::WriteError)?;
        request_buf
            .extend_from_slice(b" HTTP/1.1\r\n")
            .map_err(|_| Error::WriteError)?;

        // Headers
        for header in &request.headers {
            request_buf
                .extend_from_slice(header.name.as_bytes())
                .map_err(|_| Error::WriteError)?;
            request_buf
                .extend_from_slice(b": ")
                .map_err(|_| Error::WriteError)?;
            request_buf
                .extend_from_slice(header.value.as_bytes())
                .map_err(|_| Error::WriteError)?;
            request_buf
                .extend_from_slice(b"\r\n")
                .map_err(|_| Error::WriteError)?;
        }

        // Body
        if let Some(body) = request.body {
            let mut len_str: String<10> = String::new();
            write!(len_str, "{}", body.len()).map_err(|_| Error::WriteError)?;

            request_buf
                .extend_from_slice(b"Content-Length: ")
                .map_err(|_| Error::WriteError)?;
            request_buf
                .extend_from_slice(len_str.as_bytes())
                .map_err(|_| Error::WriteError)?;
            request_buf
                .extend_from_slice(b"\r\n\r\n")
                .map_err(|_| Error::WriteError)?;
            request_buf
                .extend_from_slice(body)
                .map_err(|_| Error::WriteError)?;
        } else {
            request_buf
                .extend_from_slice(b"\r\n")
                .map_err(|_| Error::WriteError)?;
        }

        // --- Send Request ---
        self.connection
            .write(&request_buf)
            .map_err(|_| Error::WriteError)?;
        self.connection.flush().map_err(|_| Error::WriteError)?;

        // --- Receive Response ---
        let mut response_buf = [0u8; 2048];
        let mut total_read = 0;
        loop {
            match self.connection.read(&mut response_buf[total_read..]) {
                Ok(0) if total_read > 0 => break, // Connection closed, but we have data
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => {
                    total_read += n;
                    if total_read >= response_buf.len() {
                        break;
                    }
                    if find_slice(&response_buf[..total_read], b"\r\n\r\n").is_some() {
                        // Headers complete; the body tail is read below once
                        // Content-Length is known.
                        break;
                    }
                }
                Err(_) => return Err(Error::ReadError),
            }
        }

        // --- Parse Response ---
        let response_data = &response_buf[..total_read];

        // Find where headers end and body begins
        let header_end_pos = find_slice(response_data, b"\r\n\r\n").ok_or(Error::ProtocolError)?;
        let header_data = &response_data[..header_end_pos];
        let body_data = &response_data[header_end_pos + 4..];

        let header_str = core::str::from_utf8(header_data).map_err(|_| Error::ProtocolError)?;
        let mut lines = header_str.lines();

        // Parse status line
        let status_line = lines.next().ok_or(Error::ProtocolError)?;
        let mut status_parts = status_line.splitn(3, ' ');
        status_parts.next(); // Skip HTTP version
        let status_code_str = status_parts.next().ok_or(Error::ProtocolError)?;
        let status_code = status_code_str
            .parse::<u16>()
            .map_err(|_| Error::ProtocolError)?;

        // Parse headers
        let mut response_headers: Vec<Header, MAX_HEADERS> = Vec::new();
        let mut content_length: Option<usize> = None;

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let mut parts = line.splitn(2, ':');
            let name = parts.next().ok_or(Error::ProtocolError)?.trim();
            let value = parts.next().ok_or(Error::ProtocolError)?.trim();

            if name.eq_ignore_ascii_case("Content-Length") {
                content_length = value.parse::<usize>().ok();
            }

            response_headers
                .push(Header {
                    name: String::try_from(name).map_err(|_| Error::ProtocolError)?,
                    value: String::try_from(value).map_err(|_| Error::ProtocolError)?,
                })
                .map_err(|_| Error::ProtocolError)?;
        }

        let mut body = Vec::from_slice(body_data).map_err(|_| Error::ProtocolError)?;
        if let Some(len) = content_length {
            while body.len() < len {
                if body.len() == body.capacity() {
                    // Body is larger than our buffer.
                    return Err(Error::ProtocolError);
                }

                // Read more data into a temporary buffer, then extend our body vec.
                let mut temp_buf = [0; 256];
                let remaining_len = len - body.len();
                let read_len = core::cmp::min(remaining_len, temp_buf.len());
                if read_len == 0 {
                    break;
                }

                match self.connection.read(&mut temp_buf[..read_len]) {
                    Ok(0) => return Err(Error::ConnectionClosed), // Prematurely closed
                    Ok(n) => {
                        if body.extend_from_slice(&temp_buf[..n]).is_err() {
                            return Err(Error::ProtocolError);
                        }
                    }
                    Err(_) => return Err(Error::ReadError),
                }
            }

            // Truncate to ensure we have exactly `len` bytes.
            if body.len() > len {
                body.truncate(len);
            }
        }

        Ok(Response {
            status_code,
            headers: response_headers,
            body,
        })
    }
}

/// Find the first occurrence of a slice in another slice and return its
/// starting position.
fn find_slice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
