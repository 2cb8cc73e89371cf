//! # Storage abstraction layer for embedded systems
//!
//! This module provides the traits and implementations the OTA agent uses to
//! stage a downloaded firmware image on a flash device. The embedding
//! application implements the core traits for its flash part(s); the
//! [`flash_map`] module then carves the device into the named areas a
//! dual-slot bootloader expects and handles the image trailer.
//!
//! # Design Philosophy
//!
//! - **Technology Agnostic**: Core traits work with any storage technology
//! - **Zero-Cost Abstractions**: Traits compile down to direct hardware calls
//! - **Embedded-First**: Designed for `no_std` environments with limited resources
//! - **Composable**: Mix and match different storage types and interfaces
//!
//! # Core Traits
//!
//! - [`ReadStorage`]: Read data from storage
//! - [`Storage`]: Read and write operations
//! - [`BlockingErase`]: Synchronous erase operations
//! - [`Region`]: Memory region management
//!
//! # Usage Examples
//!
//! ```rust,no_run
//! use libota::storage::{ReadStorage, Storage, BlockingErase};
//!
//! fn stage_block<S: Storage + BlockingErase>(
//!     storage: &mut S,
//!     start_addr: u32,
//!     end_addr: u32,
//!     new_data: &[u8],
//! ) -> Result<(), S::Error> {
//!     // Erase the region first
//!     storage.erase(start_addr, end_addr)?;
//!     // Write new data
//!     storage.write(start_addr, new_data)?;
//!     Ok(())
//! }
//! ```

#![allow(missing_docs)]
#![deny(unsafe_code)]

/// Common error types for storage operations
pub mod error;

/// Flash areas, image slots and the bootloader trailer
pub mod flash_map;

/// Re-exports of common traits for convenient importing
pub mod prelude {
    pub use super::{BlockingErase, ReadStorage, Region, Storage};
}

/// A contiguous memory region with start and end boundaries.
///
/// This trait provides a standardized way to represent memory regions,
/// which is useful for defining valid address ranges, protected areas,
/// or organizing storage into logical partitions.
///
/// # Examples
///
/// ```rust
/// use libota::storage::Region;
///
/// struct FlashRegion {
///     start: u32,
///     size: u32,
/// }
///
/// impl Region for FlashRegion {
///     fn start(&self) -> u32 {
///         self.start
///     }
///
///     fn end(&self) -> u32 {
///         self.start + self.size
///     }
/// }
///
/// let bootloader = FlashRegion { start: 0x0000, size: 0x4000 };
/// let application = FlashRegion { start: 0x4000, size: 0x1C000 };
///
/// assert!(bootloader.contains(0x2000));
/// assert!(!bootloader.contains(0x5000));
/// assert!(application.contains(0x5000));
/// ```
pub trait Region {
    /// Start address of the region (inclusive).
    fn start(&self) -> u32;

    /// End address of the region (exclusive).
    ///
    /// The actual valid range is `start()..end()`.
    fn end(&self) -> u32;

    /// Check if an address is contained within this region.
    ///
    /// Returns `true` if the address is within the valid range
    /// `[start(), end())`, `false` otherwise.
    fn contains(&self, address: u32) -> bool {
        (address >= self.start()) && (address < self.end())
    }
}

/// Trait for reading data from storage devices.
///
/// This is the fundamental trait for all readable storage devices. It
/// provides a simple interface for reading data at specific offsets without
/// requiring write capabilities.
pub trait ReadStorage {
    /// Associated error type for read operations
    type Error: core::fmt::Debug;

    /// Read data from the storage device.
    ///
    /// Reads data from the specified offset into the provided buffer.
    /// The entire buffer will be filled unless an error occurs.
    ///
    /// # Arguments
    ///
    /// * `offset` - Byte offset from the start of the storage device
    /// * `bytes` - Buffer to read data into
    ///
    /// # Errors
    ///
    /// - `OutOfBounds` if offset + buffer length exceeds device capacity
    /// - `ReadError` if hardware read operation fails
    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error>;

    /// Get the total capacity of the storage device in bytes.
    fn capacity(&self) -> usize;
}

/// Trait for storage devices that support both read and write operations.
///
/// This trait extends [`ReadStorage`] to include write capabilities,
/// making it suitable for general-purpose storage operations.
pub trait Storage: ReadStorage {
    /// Write data to the storage device.
    ///
    /// Writes the provided data to the specified offset. The behavior when
    /// writing to already-written locations depends on the storage
    /// technology (flash requires an erase first; the flash map layer
    /// handles that for slot staging).
    ///
    /// # Arguments
    ///
    /// * `offset` - Byte offset from the start of the storage device
    /// * `bytes` - Data to write to the device
    ///
    /// # Errors
    ///
    /// - `OutOfBounds` if offset + data length exceeds device capacity
    /// - `WriteError` if hardware write operation fails
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error>;
}

/// Trait for storage devices that support erase operations.
///
/// Flash memory requires explicit erase operations before writing new data.
/// This trait provides a synchronous interface for erasing storage regions.
pub trait BlockingErase: Storage {
    /// Erase a region of storage.
    ///
    /// Erases all data in the specified address range. After erasing, the
    /// region reads as the device's erased-byte value (0xFF for most NOR
    /// parts, 0x00 for some internal flash).
    ///
    /// # Arguments
    ///
    /// * `from` - Start address of the region to erase (inclusive)
    /// * `to` - End address of the region to erase (exclusive)
    ///
    /// # Errors
    ///
    /// - `OutOfBounds` if the address range is invalid
    /// - `EraseError` if the hardware erase operation fails
    ///
    /// # Note
    ///
    /// Some storage devices have alignment requirements for erase operations
    /// (e.g., must erase entire sectors). Check device documentation for
    /// specific requirements.
    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error>;
}
