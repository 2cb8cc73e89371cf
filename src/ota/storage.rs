//! The staging storage engine and the storage interface contract.
//!
//! The agent never touches flash directly: every storage step goes through
//! the [`OtaStorage`] trait, which the embedding application may implement
//! itself (file-backed staging, custom partitioning) or satisfy with the
//! ready-made [`FlashOtaStorage`] engine built on the
//! [flash map](crate::storage::flash_map).
//!
//! The engine stages incoming data blocks into the secondary slot. If the
//! first bytes of the download carry the ustar magic the engine switches to
//! TAR demultiplexing and routes each archive member into the slot its
//! manifest tag dictates. `verify` marks the staged slot pending so the
//! bootloader picks it up on the next boot; `validate` is called by the
//! application after that boot to confirm the new image.

use super::error::OtaError;
use super::untar::{MemberKind, TarStream};
use crate::storage::BlockingErase;
use crate::storage::flash_map::{FlashAreaId, FlashMap};

/// Progress and flags for one staged download.
///
/// Owned by the agent session and handed `&mut` to every storage call; the
/// transport adapters keep the byte/packet counters current as chunks land.
#[derive(Debug, Default, Clone)]
pub struct StorageContext {
    /// Image number for multi-image updates; 0 for the application image.
    pub image_id: u8,
    /// Total size of the OTA image; 0 until known.
    pub total_image_size: u32,
    /// Bytes written to storage so far.
    pub total_bytes_written: u32,
    /// Offset of the last successful write.
    pub last_offset: u32,
    /// Size of the last successful write.
    pub last_size: u32,
    /// Packet number of the last chunk received (pub/sub).
    pub last_packet_received: u16,
    /// Total packets in the transfer (pub/sub); 0 until known.
    pub total_packets: u16,
    /// Packets received so far, duplicates included (pub/sub).
    pub packets_received: u16,
    /// The download turned out to be a TAR archive.
    pub is_tar_archive: bool,
    /// Reboot when the session completes successfully.
    pub reboot_upon_completion: bool,
    /// The application confirms the image after reboot; when false the
    /// staged image is marked permanent immediately.
    pub validate_after_reboot: bool,
}

impl StorageContext {
    /// Clear the per-download counters. Called when a download (re)starts.
    pub fn reset_progress(&mut self) {
        self.total_image_size = 0;
        self.total_bytes_written = 0;
        self.last_offset = 0;
        self.last_size = 0;
        self.last_packet_received = 0;
        self.total_packets = 0;
        self.packets_received = 0;
        self.is_tar_archive = false;
    }

    /// Account for a successfully written chunk.
    pub fn apply_write(&mut self, chunk: &ChunkInfo<'_>) {
        if chunk.total_size > 0 {
            self.total_image_size = chunk.total_size;
        }
        self.total_bytes_written += chunk.data.len() as u32;
        self.last_offset = chunk.offset;
        self.last_size = chunk.data.len() as u32;
        self.last_packet_received = chunk.packet_number;
        if chunk.total_packets > 0 {
            self.total_packets = chunk.total_packets;
        }
    }

    /// Download progress in percent; 0 while the total is unknown.
    pub fn percentage(&self) -> u32 {
        if self.total_image_size == 0 {
            return 0;
        }
        (self.total_bytes_written.saturating_mul(100)) / self.total_image_size
    }

    /// Whether the transfer has delivered every byte.
    pub fn is_complete(&self) -> bool {
        self.total_image_size > 0 && self.total_bytes_written >= self.total_image_size
    }
}

/// One block of image data on its way to storage.
#[derive(Debug, Clone, Copy)]
pub struct ChunkInfo<'a> {
    /// Total size of the image, when the chunk's framing carries it;
    /// 0 otherwise.
    pub total_size: u32,
    /// Offset of this block within the image.
    pub offset: u32,
    /// The block's bytes.
    pub data: &'a [u8],
    /// Packet number within the transfer (pub/sub); 0 otherwise.
    pub packet_number: u16,
    /// Total packets in the transfer (pub/sub); 0 otherwise.
    pub total_packets: u16,
}

/// Version and identity of an installed application image.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AppInfo {
    /// Application identifier.
    pub app_id: u16,
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Build number.
    pub build: u8,
    /// Revision number.
    pub revision: u8,
    /// Slot the image occupies.
    pub slot: u8,
    /// Company identifier.
    pub company_id: u16,
    /// Product identifier.
    pub product_id: u16,
}

/// The storage interface the agent drives.
///
/// Each operation maps to one agent state: `open` at `StorageOpen` (erase
/// the staging slot), `write` at `StorageWrite`, `close` at `StorageClose`,
/// `verify` at `Verify` (mark the staged image pending), and `validate`
/// after the application has booted the new image.
pub trait OtaStorage {
    /// Prepare the staging slot for a download, erasing any previous image.
    fn open(&mut self, ctx: &mut StorageContext) -> Result<(), OtaError>;

    /// Read back staged bytes.
    fn read(
        &mut self,
        ctx: &mut StorageContext,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), OtaError>;

    /// Write one data block at its offset.
    fn write(&mut self, ctx: &mut StorageContext, chunk: &ChunkInfo<'_>) -> Result<(), OtaError>;

    /// Release the staging slot.
    fn close(&mut self, ctx: &mut StorageContext) -> Result<(), OtaError>;

    /// Authenticate the staged image and mark it pending for the
    /// bootloader.
    fn verify(&mut self, ctx: &mut StorageContext) -> Result<(), OtaError>;

    /// Mark the staged image pending without further checks.
    fn set_boot_pending(&mut self, ctx: &mut StorageContext) -> Result<(), OtaError>;

    /// Confirm the running image after a successful post-update boot.
    ///
    /// Optional; the default reports the operation as unsupported.
    fn validate(&mut self, _app_id: u16) -> Result<(), OtaError> {
        Err(OtaError::Unsupported)
    }

    /// Describe the image in a slot, when the platform can.
    fn app_info(&mut self, _slot: u8) -> Option<AppInfo> {
        None
    }
}

/// Flash-map-backed storage engine.
///
/// Stages plain images into secondary slot 0 and demultiplexes TAR archives
/// into the slots their manifest dictates. TAR detection happens on the
/// first write: a block at offset 0 carrying the ustar magic flips the
/// engine into archive mode for the rest of the download.
pub struct FlashOtaStorage<F> {
    map: FlashMap<F>,
    tar: Option<TarStream>,
    probed: bool,
    open: bool,
}

impl<F> core::fmt::Debug for FlashOtaStorage<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FlashOtaStorage")
            .field("probed", &self.probed)
            .field("open", &self.open)
            .finish()
    }
}

impl<F: BlockingErase> FlashOtaStorage<F> {
    /// Build the engine over a prepared flash map.
    ///
    /// The map must contain `SecondarySlot(0)`; a `SecondarySlot(1)` area
    /// is additionally required to stage multi-component archives.
    pub fn new(map: FlashMap<F>) -> Self {
        Self {
            map,
            tar: None,
            probed: false,
            open: false,
        }
    }

    /// Access the underlying flash map.
    pub fn map_mut(&mut self) -> &mut FlashMap<F> {
        &mut self.map
    }

    fn slot_for(kind: MemberKind) -> FlashAreaId {
        match kind {
            MemberKind::Nspe => FlashAreaId::SecondarySlot(0),
            MemberKind::Spe | MemberKind::Fwdb => FlashAreaId::SecondarySlot(1),
        }
    }
}

impl<F: BlockingErase> OtaStorage for FlashOtaStorage<F> {
    fn open(&mut self, ctx: &mut StorageContext) -> Result<(), OtaError> {
        ctx.reset_progress();
        self.tar = None;
        self.probed = false;

        log::info!("erase staging slot {}", ctx.image_id);
        self.map
            .erase_area(FlashAreaId::SecondarySlot(ctx.image_id))
            .map_err(|_| OtaError::OpenStorage)?;
        self.open = true;
        Ok(())
    }

    fn read(
        &mut self,
        ctx: &mut StorageContext,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), OtaError> {
        self.map
            .read_area(FlashAreaId::SecondarySlot(ctx.image_id), offset, buf)
            .map_err(|_| OtaError::ReadStorage)
    }

    fn write(&mut self, ctx: &mut StorageContext, chunk: &ChunkInfo<'_>) -> Result<(), OtaError> {
        if !self.open {
            return Err(OtaError::WriteStorage);
        }

        // First block decides plain image vs TAR archive. Archives only
        // work on in-order transports (HTTP); the pub/sub path delivers
        // offset 0 first as well, so probing the first write is safe.
        if !self.probed && chunk.offset == 0 {
            self.probed = true;
            if TarStream::looks_like_tar(chunk.data) {
                log::info!("download is a TAR archive, demultiplexing");
                ctx.is_tar_archive = true;
                self.tar = Some(TarStream::new());
            }
        }

        let Self { map, tar, .. } = self;
        match tar {
            Some(stream) => {
                let mut sink = |member: &super::untar::TarMember, offset: u32, bytes: &[u8]| {
                    map.write_area(Self::slot_for(member.kind), offset, bytes)
                        .map_err(|_| OtaError::WriteStorage)
                };
                stream.feed(chunk.data, &mut sink)
            }
            None => map
                .write_area(
                    FlashAreaId::SecondarySlot(ctx.image_id),
                    chunk.offset,
                    chunk.data,
                )
                .map_err(|_| OtaError::WriteStorage),
        }
    }

    fn close(&mut self, ctx: &mut StorageContext) -> Result<(), OtaError> {
        let _ = ctx;
        self.open = false;
        Ok(())
    }

    fn verify(&mut self, ctx: &mut StorageContext) -> Result<(), OtaError> {
        self.set_boot_pending(ctx)
    }

    fn set_boot_pending(&mut self, ctx: &mut StorageContext) -> Result<(), OtaError> {
        let permanent = !ctx.validate_after_reboot;
        self.map
            .set_pending(ctx.image_id, permanent)
            .map_err(|_| OtaError::Verify)?;
        // A demultiplexed archive staged a second component; arm its slot
        // too.
        if ctx.is_tar_archive {
            self.map
                .set_pending(1, permanent)
                .map_err(|_| OtaError::Verify)?;
        }
        Ok(())
    }

    fn validate(&mut self, _app_id: u16) -> Result<(), OtaError> {
        self.map.set_confirmed(0).map_err(|_| OtaError::General)
    }
}
