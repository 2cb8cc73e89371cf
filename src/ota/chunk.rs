//! Chunk framing for the pub/sub data path.
//!
//! Every data publish carries a 32-byte binary header in front of the image
//! bytes: an ASCII magic, the advertised update version, the total image
//! size, and this chunk's position within the image and within the packet
//! sequence. All multi-byte fields are little-endian. The layout is fixed
//! wire format; the codec here reads and writes it explicitly rather than
//! casting packed structs.

use super::Version;
use super::error::OtaError;

/// The 8-byte ASCII magic opening every chunk payload.
pub const CHUNK_MAGIC: &[u8; 8] = b"OTAImage";

/// Image type tag: a single application image. The only type currently
/// defined.
pub const IMAGE_TYPE_SINGLE_APP: u16 = 0;

/// Capacity of the received-packet log; bounds the packet index space
/// (covers a 2 MB image at 1 KB chunks).
pub const MAX_PACKETS: usize = 2048;

/// A parsed chunk payload header.
///
/// Field order matches the wire layout; see [`ChunkHeader::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Offset from the start of the payload to the first data byte.
    pub offset_to_data: u16,
    /// Image type tag; only [`IMAGE_TYPE_SINGLE_APP`] is valid.
    pub image_type: u16,
    /// The update's version.
    pub update_version: Version,
    /// Total size of the assembled image in bytes.
    pub total_size: u32,
    /// Offset of this chunk's data within the image.
    pub image_offset: u32,
    /// Number of data bytes in this payload.
    pub data_size: u16,
    /// Total number of payloads in the transfer.
    pub total_num_payloads: u16,
    /// This payload's index.
    pub this_payload_index: u16,
}

impl ChunkHeader {
    /// Encoded header size in bytes.
    pub const SIZE: usize = 32;

    /// Parse and sanity-check a chunk header from the front of `payload`.
    ///
    /// # Errors
    ///
    /// * [`OtaError::NotAHeader`] - missing/garbled magic, short payload, or
    ///   a field failing its invariant (`offset_to_data` beyond the payload,
    ///   unknown image type, `data_size > total_size`, payload index out of
    ///   range, or the advertised data not actually present)
    pub fn parse(payload: &[u8]) -> Result<Self, OtaError> {
        if payload.len() < Self::SIZE {
            return Err(OtaError::NotAHeader);
        }
        if &payload[0..8] != CHUNK_MAGIC {
            return Err(OtaError::NotAHeader);
        }

        let u16_at = |off: usize| u16::from_le_bytes([payload[off], payload[off + 1]]);
        let u32_at = |off: usize| {
            u32::from_le_bytes([
                payload[off],
                payload[off + 1],
                payload[off + 2],
                payload[off + 3],
            ])
        };

        let header = Self {
            offset_to_data: u16_at(8),
            image_type: u16_at(10),
            update_version: Version::new(u16_at(12), u16_at(14), u16_at(16)),
            total_size: u32_at(18),
            image_offset: u32_at(22),
            data_size: u16_at(26),
            total_num_payloads: u16_at(28),
            this_payload_index: u16_at(30),
        };

        if header.offset_to_data as usize > payload.len()
            || header.image_type != IMAGE_TYPE_SINGLE_APP
            || header.data_size as u32 > header.total_size
            || header.this_payload_index >= header.total_num_payloads
        {
            return Err(OtaError::NotAHeader);
        }
        if header.offset_to_data as usize + header.data_size as usize > payload.len() {
            return Err(OtaError::NotAHeader);
        }

        Ok(header)
    }

    /// Check the advertised version against the running version.
    ///
    /// # Errors
    ///
    /// * [`OtaError::InvalidVersion`] - not strictly greater than `running`
    pub fn check_version(&self, running: Version) -> Result<(), OtaError> {
        if self.update_version > running {
            Ok(())
        } else {
            Err(OtaError::InvalidVersion)
        }
    }

    /// The data bytes this header frames within `payload`.
    ///
    /// Only valid for the `payload` the header was parsed from.
    pub fn data_of<'a>(&self, payload: &'a [u8]) -> &'a [u8] {
        let start = self.offset_to_data as usize;
        &payload[start..start + self.data_size as usize]
    }

    /// Encode the header into the first [`ChunkHeader::SIZE`] bytes of
    /// `out`. Used by publishers and tests.
    pub fn write_to(&self, out: &mut [u8]) -> Result<(), OtaError> {
        if out.len() < Self::SIZE {
            return Err(OtaError::BadArg);
        }
        out[0..8].copy_from_slice(CHUNK_MAGIC);
        out[8..10].copy_from_slice(&self.offset_to_data.to_le_bytes());
        out[10..12].copy_from_slice(&self.image_type.to_le_bytes());
        out[12..14].copy_from_slice(&self.update_version.major.to_le_bytes());
        out[14..16].copy_from_slice(&self.update_version.minor.to_le_bytes());
        out[16..18].copy_from_slice(&self.update_version.build.to_le_bytes());
        out[18..22].copy_from_slice(&self.total_size.to_le_bytes());
        out[22..26].copy_from_slice(&self.image_offset.to_le_bytes());
        out[26..28].copy_from_slice(&self.data_size.to_le_bytes());
        out[28..30].copy_from_slice(&self.total_num_payloads.to_le_bytes());
        out[30..32].copy_from_slice(&self.this_payload_index.to_le_bytes());
        Ok(())
    }
}

/// Outcome of recording a packet index in the [`PacketLog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketRecord {
    /// First sighting of this index.
    First,
    /// The index was already recorded; the chunk is a duplicate.
    Duplicate,
    /// The index does not fit the log; counted but not tracked.
    OutOfRange,
}

/// Receive log indexed by payload index.
///
/// Detects duplicate chunks during the transfer and enumerates missing ones
/// for end-of-transfer diagnostics. Missing chunks never block completion;
/// an incomplete transfer is caught by the byte count never reaching the
/// total before the data watchdog fires.
pub struct PacketLog {
    counts: [u8; MAX_PACKETS],
    received: u16,
}

impl core::fmt::Debug for PacketLog {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PacketLog")
            .field("received", &self.received)
            .finish()
    }
}

impl Default for PacketLog {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketLog {
    /// An empty log.
    pub const fn new() -> Self {
        Self {
            counts: [0; MAX_PACKETS],
            received: 0,
        }
    }

    /// Forget everything; called when a download (re)starts.
    pub fn reset(&mut self) {
        self.counts = [0; MAX_PACKETS];
        self.received = 0;
    }

    /// Record a payload index.
    pub fn record(&mut self, index: u16) -> PacketRecord {
        self.received = self.received.saturating_add(1);
        let Some(slot) = self.counts.get_mut(index as usize) else {
            return PacketRecord::OutOfRange;
        };
        *slot = slot.saturating_add(1);
        if *slot > 1 {
            PacketRecord::Duplicate
        } else {
            PacketRecord::First
        }
    }

    /// Total packets recorded, duplicates included.
    pub fn received(&self) -> u16 {
        self.received
    }

    /// Iterate the indices below `total` that were never recorded.
    pub fn missing(&self, total: u16) -> impl Iterator<Item = u16> + '_ {
        let total = core::cmp::min(total as usize, MAX_PACKETS);
        self.counts[..total]
            .iter()
            .enumerate()
            .filter(|&(_, &count)| count == 0)
            .map(|(index, _)| index as u16)
    }
}
