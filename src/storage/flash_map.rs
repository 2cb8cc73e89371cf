//! Flash areas, image slots and the bootloader trailer.
//!
//! A dual-slot bootloader sees flash as a set of named areas: the bootloader
//! itself, a primary slot per image (the code being executed), a secondary
//! slot per image (the staging area an update is downloaded into), and
//! optionally a scratch and a swap-status area. The agent only ever writes
//! secondary slots and slot trailers; the bootloader consumes them on the
//! next boot.
//!
//! The trailer sits at the high end of each slot, from high to low offset:
//! a 16-byte magic, then `image_ok`, `copy_done` and `swap_info` bytes, each
//! padded out to the trailer alignment (8 bytes, 256 on some low-power radio
//! parts). Writing the magic is what arms the bootloader; the flag bytes
//! refine the swap behavior on parts that can program them reliably.
//!
//! All writes go through row-size-aware helpers: flash rows can only be
//! programmed whole, so unaligned writes are widened with a
//! read-modify-write of the affected rows.

use super::error::Error;
use super::{BlockingErase, ReadStorage, Region, Storage};
use heapless::Vec;

/// Maximum number of areas a map can hold.
pub const MAX_FLASH_AREAS: usize = 8;

/// Largest supported flash row (program granularity) in bytes.
pub const MAX_ROW_SIZE: usize = 512;

/// The 16-byte trailer magic the bootloader looks for, little-endian.
pub const BOOT_MAGIC: [u8; 16] = [
    0x77, 0xc2, 0x95, 0xf3, 0x60, 0xd2, 0xef, 0x7f, //
    0x35, 0x52, 0x50, 0x0f, 0x2c, 0xb6, 0x79, 0x80,
];

/// Default alignment of the flag bytes within the trailer.
pub const BOOT_TRAILER_ALIGN: u32 = 8;

/// Value written to `image_ok` / `copy_done` when the flag is set.
pub const BOOT_FLAG_SET: u8 = 0x01;

/// Swap operation requested from the bootloader via `swap_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SwapType {
    /// No swap requested.
    None = 1,
    /// Swap to the new image for one boot; revert unless confirmed.
    Test = 2,
    /// Swap to the new image permanently.
    Perm = 3,
    /// Revert to the previous image.
    Revert = 4,
    /// The previous swap failed.
    Fail = 5,
    /// Bootloader panic marker.
    Panic = 0xff,
}

/// The flash device an area lives on.
///
/// The distinction matters twice: the erased-byte value differs, and
/// trailer flag bytes are only programmed reliably on external parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashDevice {
    /// MCU-internal flash. Erases to 0x00.
    Internal,
    /// External (SPI-NOR style) flash. Erases to 0xFF.
    External,
}

impl FlashDevice {
    /// The byte value a freshly erased cell reads as.
    pub fn erased_val(&self) -> u8 {
        match self {
            FlashDevice::Internal => 0x00,
            FlashDevice::External => 0xFF,
        }
    }
}

/// Identity of a named flash area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashAreaId {
    /// The bootloader's own area.
    Bootloader,
    /// Primary (executing) slot for image N.
    PrimarySlot(u8),
    /// Secondary (staging) slot for image N.
    SecondarySlot(u8),
    /// Scratch area used by swap-type bootloaders.
    Scratch,
    /// Swap status bookkeeping area.
    SwapStatus,
}

/// One named, contiguous flash region.
#[derive(Debug, Clone, Copy)]
pub struct FlashArea {
    /// Which role this area plays.
    pub id: FlashAreaId,
    /// The device the area lives on.
    pub device: FlashDevice,
    /// Absolute byte offset of the area on the device.
    pub offset: u32,
    /// Size of the area in bytes.
    pub size: u32,
}

impl Region for FlashArea {
    fn start(&self) -> u32 {
        self.offset
    }

    fn end(&self) -> u32 {
        self.offset + self.size
    }
}

/// Contents of a slot trailer, as the bootloader would read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    /// Whether the 16-byte magic is present.
    pub magic_ok: bool,
    /// The `image_ok` flag byte.
    pub image_ok: u8,
    /// The `copy_done` flag byte.
    pub copy_done: u8,
    /// The `swap_info` byte: `(image << 4) | swap_type`.
    pub swap_info: u8,
}

/// A flash device carved into named areas.
///
/// Generic over any backend implementing the [`storage`](crate::storage)
/// traits. All area I/O is bounds-checked against the area and row-aligned
/// against the device's program granularity.
pub struct FlashMap<F> {
    storage: F,
    areas: Vec<FlashArea, MAX_FLASH_AREAS>,
    row_size: u32,
    trailer_align: u32,
}

impl<F> core::fmt::Debug for FlashMap<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FlashMap")
            .field("areas", &self.areas)
            .field("row_size", &self.row_size)
            .field("trailer_align", &self.trailer_align)
            .finish()
    }
}

impl<F: BlockingErase> FlashMap<F> {
    /// Create a map over `storage` with the given program row size.
    ///
    /// Uses the default trailer alignment of 8 bytes; see
    /// [`with_trailer_align`](Self::with_trailer_align) for parts that need
    /// 256.
    ///
    /// # Errors
    ///
    /// `NotAligned` when `row_size` is zero, not a power of two, or larger
    /// than [`MAX_ROW_SIZE`].
    pub fn new(storage: F, row_size: u32) -> Result<Self, Error> {
        Self::with_trailer_align(storage, row_size, BOOT_TRAILER_ALIGN)
    }

    /// Create a map with an explicit trailer alignment.
    pub fn with_trailer_align(storage: F, row_size: u32, trailer_align: u32) -> Result<Self, Error> {
        if row_size == 0 || !row_size.is_power_of_two() || row_size as usize > MAX_ROW_SIZE {
            return Err(Error::NotAligned);
        }
        if trailer_align == 0 || !trailer_align.is_power_of_two() {
            return Err(Error::NotAligned);
        }
        Ok(Self {
            storage,
            areas: Vec::new(),
            row_size,
            trailer_align,
        })
    }

    /// Register an area with the map.
    ///
    /// # Errors
    ///
    /// `OutOfBounds` when the area does not fit the backing device or the
    /// map is full.
    pub fn add_area(&mut self, area: FlashArea) -> Result<(), Error> {
        let end = area.offset.checked_add(area.size).ok_or(Error::OutOfBounds)?;
        if end as usize > self.storage.capacity() {
            return Err(Error::OutOfBounds);
        }
        self.areas.push(area).map_err(|_| Error::OutOfBounds)
    }

    /// Look up an area by id.
    pub fn area(&self, id: FlashAreaId) -> Result<FlashArea, Error> {
        self.areas
            .iter()
            .find(|a| a.id == id)
            .copied()
            .ok_or(Error::NotInitialized)
    }

    /// The device's program row size in bytes.
    pub fn row_size(&self) -> u32 {
        self.row_size
    }

    /// Read `buf.len()` bytes from `offset` within the area.
    pub fn read_area(&mut self, id: FlashAreaId, offset: u32, buf: &mut [u8]) -> Result<(), Error> {
        let area = self.area(id)?;
        let end = offset
            .checked_add(buf.len() as u32)
            .ok_or(Error::OutOfBounds)?;
        if end > area.size {
            return Err(Error::OutOfBounds);
        }
        self.storage
            .read(area.offset + offset, buf)
            .map_err(|_| Error::ReadError)
    }

    /// Write `data` at `offset` within the area, honoring row alignment.
    ///
    /// Rows touched only partially are read back, merged and re-written;
    /// the aligned middle stretch is written directly.
    pub fn write_area(&mut self, id: FlashAreaId, offset: u32, data: &[u8]) -> Result<(), Error> {
        let area = self.area(id)?;
        let end = offset
            .checked_add(data.len() as u32)
            .ok_or(Error::OutOfBounds)?;
        if end > area.size {
            return Err(Error::OutOfBounds);
        }
        if data.is_empty() {
            return Ok(());
        }

        let row = self.row_size;
        let abs = area.offset + offset;
        let mut written = 0usize;
        let mut cursor = abs;

        // Partial head row
        let head_misalign = cursor % row;
        if head_misalign != 0 {
            let row_start = cursor - head_misalign;
            let take = core::cmp::min((row - head_misalign) as usize, data.len());
            self.rmw_row(row_start, head_misalign as usize, &data[..take])?;
            written += take;
            cursor += take as u32;
        }

        // Aligned middle stretch
        let remaining = data.len() - written;
        let whole_rows = (remaining as u32 / row) * row;
        if whole_rows > 0 {
            self.storage
                .write(cursor, &data[written..written + whole_rows as usize])
                .map_err(|_| Error::WriteError)?;
            written += whole_rows as usize;
            cursor += whole_rows;
        }

        // Partial tail row
        if written < data.len() {
            self.rmw_row(cursor, 0, &data[written..])?;
        }

        Ok(())
    }

    /// Erase the whole area.
    pub fn erase_area(&mut self, id: FlashAreaId) -> Result<(), Error> {
        let area = self.area(id)?;
        self.storage
            .erase(area.offset, area.offset + area.size)
            .map_err(|_| Error::EraseError)
    }

    /// Mark the image in a secondary slot as pending.
    ///
    /// Writes the trailer magic; on external flash additionally writes
    /// `image_ok` (when `permanent`) and the swap-info byte. On the next
    /// boot the bootloader performs a one-time (test) or permanent swap.
    pub fn set_pending(&mut self, image: u8, permanent: bool) -> Result<(), Error> {
        let area = self.area(FlashAreaId::SecondarySlot(image))?;

        self.write_magic(&area)?;

        // Flag-byte programming is only reliable on external parts; the
        // magic alone is enough to trigger the update elsewhere.
        if area.device == FlashDevice::External {
            if permanent {
                self.write_trailer_byte(&area, self.image_ok_off(&area), BOOT_FLAG_SET)?;
            }
            let swap = if permanent { SwapType::Perm } else { SwapType::Test };
            let swap_info = (image << 4) | swap as u8;
            self.write_trailer_byte(&area, self.swap_info_off(&area), swap_info)?;
        }

        Ok(())
    }

    /// Mark the image in a primary slot as confirmed.
    ///
    /// Called by the application after a successful boot of the new image;
    /// writes the magic and `image_ok` so the bootloader stops considering
    /// a revert.
    pub fn set_confirmed(&mut self, image: u8) -> Result<(), Error> {
        let area = self.area(FlashAreaId::PrimarySlot(image))?;
        self.write_magic(&area)?;
        self.write_trailer_byte(&area, self.image_ok_off(&area), BOOT_FLAG_SET)
    }

    /// Read back a slot trailer.
    pub fn read_trailer(&mut self, id: FlashAreaId) -> Result<Trailer, Error> {
        let area = self.area(id)?;
        let mut magic = [0u8; 16];
        self.read_area(id, self.magic_off(&area), &mut magic)?;
        let mut byte = [0u8; 1];
        self.read_area(id, self.image_ok_off(&area), &mut byte)?;
        let image_ok = byte[0];
        self.read_area(id, self.copy_done_off(&area), &mut byte)?;
        let copy_done = byte[0];
        self.read_area(id, self.swap_info_off(&area), &mut byte)?;
        let swap_info = byte[0];
        Ok(Trailer {
            magic_ok: magic == BOOT_MAGIC,
            image_ok,
            copy_done,
            swap_info,
        })
    }

    /// Consume the map, returning the backing storage.
    pub fn into_storage(self) -> F {
        self.storage
    }

    fn magic_off(&self, area: &FlashArea) -> u32 {
        area.size - BOOT_MAGIC.len() as u32
    }

    fn image_ok_off(&self, area: &FlashArea) -> u32 {
        self.magic_off(area) - self.trailer_align
    }

    fn copy_done_off(&self, area: &FlashArea) -> u32 {
        self.image_ok_off(area) - self.trailer_align
    }

    fn swap_info_off(&self, area: &FlashArea) -> u32 {
        self.copy_done_off(area) - self.trailer_align
    }

    fn write_magic(&mut self, area: &FlashArea) -> Result<(), Error> {
        let off = self.magic_off(area);
        let magic = BOOT_MAGIC;
        self.write_area(area.id, off, &magic)
    }

    /// Write one trailer flag byte, padded to the trailer alignment with the
    /// device's erased value.
    fn write_trailer_byte(&mut self, area: &FlashArea, off: u32, value: u8) -> Result<(), Error> {
        let mut buf = [0u8; MAX_ROW_SIZE];
        let pad = core::cmp::min(self.trailer_align as usize, MAX_ROW_SIZE);
        buf[..pad].fill(area.device.erased_val());
        buf[0] = value;
        let mut len = pad as u32;
        if off + len > area.size {
            len = area.size - off;
        }
        self.write_area(area.id, off, &buf[..len as usize])
    }

    /// Read-modify-write one row: load it, overlay `data` at `offset_in_row`,
    /// store it back.
    fn rmw_row(&mut self, row_start: u32, offset_in_row: usize, data: &[u8]) -> Result<(), Error> {
        debug_assert!(offset_in_row + data.len() <= self.row_size as usize);
        let row_len = self.row_size as usize;
        let mut row_buf = [0u8; MAX_ROW_SIZE];
        self.storage
            .read(row_start, &mut row_buf[..row_len])
            .map_err(|_| Error::ReadError)?;
        row_buf[offset_in_row..offset_in_row + data.len()].copy_from_slice(data);
        self.storage
            .write(row_start, &row_buf[..row_len])
            .map_err(|_| Error::WriteError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ReadStorage, Storage};

    const CAPACITY: usize = 64 * 1024;
    const ROW: u32 = 64;

    struct MockFlash {
        memory: std::vec::Vec<u8>,
        erased: u8,
    }

    impl MockFlash {
        fn new(erased: u8) -> Self {
            Self {
                memory: std::vec![erased; CAPACITY],
                erased,
            }
        }
    }

    impl ReadStorage for MockFlash {
        type Error = Error;

        fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
            let offset = offset as usize;
            if offset + bytes.len() > self.memory.len() {
                return Err(Error::OutOfBounds);
            }
            bytes.copy_from_slice(&self.memory[offset..offset + bytes.len()]);
            Ok(())
        }

        fn capacity(&self) -> usize {
            CAPACITY
        }
    }

    impl Storage for MockFlash {
        fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
            let offset = offset as usize;
            if offset + bytes.len() > self.memory.len() {
                return Err(Error::OutOfBounds);
            }
            self.memory[offset..offset + bytes.len()].copy_from_slice(bytes);
            Ok(())
        }
    }

    impl BlockingErase for MockFlash {
        fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
            let (from, to) = (from as usize, to as usize);
            if to > self.memory.len() || from > to {
                return Err(Error::OutOfBounds);
            }
            for byte in &mut self.memory[from..to] {
                *byte = self.erased;
            }
            Ok(())
        }
    }

    fn map_with_slots(device: FlashDevice) -> FlashMap<MockFlash> {
        let mut map = FlashMap::new(MockFlash::new(device.erased_val()), ROW).unwrap();
        map.add_area(FlashArea {
            id: FlashAreaId::PrimarySlot(0),
            device,
            offset: 0,
            size: 0x4000,
        })
        .unwrap();
        map.add_area(FlashArea {
            id: FlashAreaId::SecondarySlot(0),
            device,
            offset: 0x4000,
            size: 0x4000,
        })
        .unwrap();
        map
    }

    #[test]
    fn unaligned_write_read_back() {
        let mut map = map_with_slots(FlashDevice::External);
        let data = [0xAB; 100];
        map.write_area(FlashAreaId::SecondarySlot(0), 37, &data).unwrap();

        let mut back = [0u8; 100];
        map.read_area(FlashAreaId::SecondarySlot(0), 37, &mut back).unwrap();
        assert_eq!(back, data);

        // Neighboring bytes untouched (still erased)
        let mut edge = [0u8; 1];
        map.read_area(FlashAreaId::SecondarySlot(0), 36, &mut edge).unwrap();
        assert_eq!(edge[0], 0xFF);
        map.read_area(FlashAreaId::SecondarySlot(0), 137, &mut edge).unwrap();
        assert_eq!(edge[0], 0xFF);
    }

    #[test]
    fn write_beyond_area_rejected() {
        let mut map = map_with_slots(FlashDevice::External);
        let data = [0u8; 32];
        assert_eq!(
            map.write_area(FlashAreaId::SecondarySlot(0), 0x4000 - 16, &data),
            Err(Error::OutOfBounds)
        );
    }

    #[test]
    fn set_pending_writes_magic_at_slot_end() {
        let mut map = map_with_slots(FlashDevice::External);
        map.set_pending(0, true).unwrap();

        let trailer = map.read_trailer(FlashAreaId::SecondarySlot(0)).unwrap();
        assert!(trailer.magic_ok);
        assert_eq!(trailer.image_ok, BOOT_FLAG_SET);
        assert_eq!(trailer.swap_info, SwapType::Perm as u8);

        let mut magic = [0u8; 16];
        map.read_area(FlashAreaId::SecondarySlot(0), 0x4000 - 16, &mut magic)
            .unwrap();
        assert_eq!(magic, BOOT_MAGIC);
    }

    #[test]
    fn set_pending_test_swap() {
        let mut map = map_with_slots(FlashDevice::External);
        map.set_pending(0, false).unwrap();
        let trailer = map.read_trailer(FlashAreaId::SecondarySlot(0)).unwrap();
        assert!(trailer.magic_ok);
        // Not permanent: image_ok left erased, swap type is Test.
        assert_eq!(trailer.image_ok, 0xFF);
        assert_eq!(trailer.swap_info, SwapType::Test as u8);
    }

    #[test]
    fn set_pending_internal_flash_writes_magic_only() {
        let mut map = map_with_slots(FlashDevice::Internal);
        map.set_pending(0, true).unwrap();
        let trailer = map.read_trailer(FlashAreaId::SecondarySlot(0)).unwrap();
        assert!(trailer.magic_ok);
        assert_eq!(trailer.image_ok, 0x00);
        assert_eq!(trailer.swap_info, 0x00);
    }

    #[test]
    fn set_confirmed_marks_primary() {
        let mut map = map_with_slots(FlashDevice::External);
        map.set_confirmed(0).unwrap();
        let trailer = map.read_trailer(FlashAreaId::PrimarySlot(0)).unwrap();
        assert!(trailer.magic_ok);
        assert_eq!(trailer.image_ok, BOOT_FLAG_SET);
    }

    #[test]
    fn erase_resets_to_device_value() {
        let mut map = map_with_slots(FlashDevice::External);
        map.write_area(FlashAreaId::SecondarySlot(0), 0, &[0u8; 128]).unwrap();
        map.erase_area(FlashAreaId::SecondarySlot(0)).unwrap();
        let mut buf = [0u8; 128];
        map.read_area(FlashAreaId::SecondarySlot(0), 0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xFF));
    }
}
