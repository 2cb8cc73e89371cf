//! Host-driven wireless-link update flow.
//!
//! On short-range radio links (Bluetooth-style) the peer host drives the
//! update with explicit commands instead of the agent polling a server:
//!
//! | command | semantics |
//! |---------|-----------|
//! | `PREPARE_DOWNLOAD` (1) | open (erase) the staging slot, reset the integrity context |
//! | `DOWNLOAD` (2) | announce the total transfer size |
//! | data writes | append bytes at the implicit cursor, updating CRC/signature state |
//! | `VERIFY` (3) | check CRC-32 or the ECDSA P-256 signature, then mark the slot pending |
//! | `ABORT` (4) | drop the session, return to waiting |
//!
//! Two integrity modes exist. Unsigned links CRC the whole stream and the
//! host sends the expected CRC-32 with `VERIFY`. Signed links append a
//! 64-byte detached ECDSA signature to the stream; the device hashes
//! everything before it and verifies against its embedded public key. The
//! status reported upstream is a bare OK/BAD byte.

use super::error::OtaError;
use super::storage::{ChunkInfo, OtaStorage, StorageContext};
use super::verify::{Crc32, PublicKey, SIGNATURE_LEN, SignatureVerifier};
use super::AgentState;

/// Commands the peer host issues over the link's control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HostCommand {
    /// Initialize the integrity context and open the staging slot.
    PrepareDownload = 1,
    /// Announce the update size; data writes follow.
    Download = 2,
    /// Verify the received image.
    Verify = 3,
    /// Abandon the update.
    Abort = 4,
}

impl HostCommand {
    /// Decode a command byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(HostCommand::PrepareDownload),
            2 => Some(HostCommand::Download),
            3 => Some(HostCommand::Verify),
            4 => Some(HostCommand::Abort),
            _ => None,
        }
    }
}

/// Status byte reported back to the peer host after each command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UpgradeStatus {
    /// Command succeeded.
    Ok = 0,
    /// Command failed.
    Bad = 1,
}

impl UpgradeStatus {
    /// Collapse a command result into the wire status.
    pub fn from_result<T>(result: &Result<T, OtaError>) -> Self {
        if result.is_ok() {
            UpgradeStatus::Ok
        } else {
            UpgradeStatus::Bad
        }
    }
}

/// Integrity scheme for the link, fixed at construction.
#[derive(Debug, Clone, Copy)]
pub enum LinkSecurity {
    /// CRC-32 over the whole stream; expected value arrives with `VERIFY`.
    Crc32,
    /// ECDSA P-256 over SHA-256; the stream's last 64 bytes are the
    /// detached signature, verified against this key.
    Signed(PublicKey),
}

enum Integrity {
    Idle,
    Crc(Crc32),
    Signature(SignatureVerifier),
}

/// One wireless update session.
///
/// Owns the storage interface and mirrors the agent state machine's states
/// so the application observes the same lifecycle it would for a polled
/// update.
pub struct WirelessLink<S> {
    storage: S,
    ctx: StorageContext,
    security: LinkSecurity,
    integrity: Integrity,
    state: AgentState,
}

impl<S> core::fmt::Debug for WirelessLink<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WirelessLink")
            .field("state", &self.state)
            .field("bytes_written", &self.ctx.total_bytes_written)
            .finish()
    }
}

impl<S: OtaStorage> WirelessLink<S> {
    /// Create a link session over the given storage interface.
    pub fn new(storage: S, security: LinkSecurity) -> Self {
        Self {
            storage,
            ctx: StorageContext::default(),
            security,
            integrity: Integrity::Idle,
            state: AgentState::AgentWaiting,
        }
    }

    /// The mirrored agent state.
    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Download progress in percent.
    pub fn percentage(&self) -> u32 {
        self.ctx.percentage()
    }

    /// Storage context, for the embedding application's bookkeeping.
    pub fn context(&self) -> &StorageContext {
        &self.ctx
    }

    /// `PREPARE_DOWNLOAD`: reset counters and open (erase) the staging
    /// slot.
    pub fn prepare_download(&mut self) -> Result<(), OtaError> {
        self.integrity = Integrity::Idle;
        self.state = AgentState::StorageOpen;

        self.storage.open(&mut self.ctx).map_err(|err| {
            log::error!("wireless: storage open failed: {}", err);
            self.state = AgentState::AgentWaiting;
            OtaError::WirelessStorage
        })?;

        self.state = AgentState::AgentWaiting;
        Ok(())
    }

    /// `DOWNLOAD`: the host announces the total stream size; arm the
    /// integrity context.
    pub fn download(&mut self, update_file_size: u32) -> Result<(), OtaError> {
        log::info!("wireless: update size {}", update_file_size);
        self.ctx.total_image_size = update_file_size;
        self.ctx.total_bytes_written = 0;
        self.ctx.last_offset = 0;
        self.ctx.last_size = 0;

        self.integrity = match self.security {
            LinkSecurity::Crc32 => Integrity::Crc(Crc32::new()),
            LinkSecurity::Signed(key) => {
                Integrity::Signature(SignatureVerifier::new(update_file_size, key)?)
            }
        };

        self.state = AgentState::StartUpdate;
        Ok(())
    }

    /// A data write: append `data` at the implicit cursor.
    ///
    /// The signature trailer is staged to flash like any other bytes, but
    /// the hash excludes it; the [`SignatureVerifier`] handles writes that
    /// straddle the boundary.
    pub fn write(&mut self, data: &[u8]) -> Result<(), OtaError> {
        if matches!(self.integrity, Integrity::Idle) {
            // No DOWNLOAD announced (or the session was aborted).
            return Err(OtaError::BadArg);
        }
        self.state = AgentState::StorageWrite;

        let chunk = ChunkInfo {
            total_size: self.ctx.total_image_size,
            offset: self.ctx.last_offset,
            data,
            packet_number: 0,
            total_packets: 0,
        };
        self.storage.write(&mut self.ctx, &chunk).map_err(|err| {
            log::error!("wireless: storage write failed: {}", err);
            OtaError::WirelessStorage
        })?;

        // The cursor advances with every write; the host never sends
        // explicit image offsets.
        self.ctx.total_bytes_written += data.len() as u32;
        self.ctx.last_size = data.len() as u32;
        self.ctx.last_offset += data.len() as u32;

        match &mut self.integrity {
            Integrity::Crc(crc) => crc.update(data),
            Integrity::Signature(verifier) => verifier.update(data)?,
            Integrity::Idle => unreachable!(),
        }

        log::debug!(
            "wireless: {} of {} bytes ({}%)",
            self.ctx.total_bytes_written,
            self.ctx.total_image_size,
            self.ctx.percentage()
        );
        self.state = AgentState::DataDownload;
        Ok(())
    }

    /// `VERIFY`: check the stream integrity and mark the slot pending.
    ///
    /// `received_crc32` is the host-supplied checksum, ignored in signed
    /// mode. `check_integrity` mirrors the command's skip flag; when false
    /// only the storage verify hook runs.
    pub fn verify(&mut self, received_crc32: u32, check_integrity: bool) -> Result<(), OtaError> {
        self.state = AgentState::Verify;

        if check_integrity {
            match core::mem::replace(&mut self.integrity, Integrity::Idle) {
                Integrity::Crc(crc) => {
                    let computed = crc.finalize();
                    if computed != received_crc32 {
                        log::error!(
                            "wireless: CRC mismatch: computed {:#010x} received {:#010x}",
                            computed,
                            received_crc32
                        );
                        self.state = AgentState::Exiting;
                        return Err(OtaError::WirelessVerify);
                    }
                }
                Integrity::Signature(verifier) => {
                    verifier.verify().map_err(|err| {
                        log::error!("wireless: signature check failed");
                        self.state = AgentState::Exiting;
                        err
                    })?;
                }
                Integrity::Idle => {
                    self.state = AgentState::Exiting;
                    return Err(OtaError::BadArg);
                }
            }
        }

        self.storage.verify(&mut self.ctx).map_err(|err| {
            log::error!("wireless: storage verify failed: {}", err);
            self.state = AgentState::Exiting;
            OtaError::WirelessVerify
        })?;

        log::info!("wireless: verify succeeded, image pending");
        self.state = AgentState::OtaComplete;
        Ok(())
    }

    /// `ABORT`: drop the session and return to waiting.
    pub fn abort(&mut self) -> Result<(), OtaError> {
        self.integrity = Integrity::Idle;
        self.state = AgentState::AgentWaiting;
        Ok(())
    }

    /// Consume the session, returning the storage interface.
    pub fn into_storage(self) -> S {
        self.storage
    }
}

/// Number of bytes a signed stream reserves for the trailing signature.
pub const WIRELESS_SIGNATURE_LEN: usize = SIGNATURE_LEN;

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal in-memory storage for exercising the command flow.
    #[derive(Default)]
    struct VecStorage {
        staged: std::vec::Vec<u8>,
        opened: u32,
        pending: bool,
    }

    impl OtaStorage for VecStorage {
        fn open(&mut self, ctx: &mut StorageContext) -> Result<(), OtaError> {
            ctx.reset_progress();
            self.staged.clear();
            self.opened += 1;
            Ok(())
        }

        fn read(
            &mut self,
            _ctx: &mut StorageContext,
            offset: u32,
            buf: &mut [u8],
        ) -> Result<(), OtaError> {
            let offset = offset as usize;
            buf.copy_from_slice(&self.staged[offset..offset + buf.len()]);
            Ok(())
        }

        fn write(
            &mut self,
            _ctx: &mut StorageContext,
            chunk: &ChunkInfo<'_>,
        ) -> Result<(), OtaError> {
            let end = chunk.offset as usize + chunk.data.len();
            if self.staged.len() < end {
                self.staged.resize(end, 0);
            }
            self.staged[chunk.offset as usize..end].copy_from_slice(chunk.data);
            Ok(())
        }

        fn close(&mut self, _ctx: &mut StorageContext) -> Result<(), OtaError> {
            Ok(())
        }

        fn verify(&mut self, _ctx: &mut StorageContext) -> Result<(), OtaError> {
            self.pending = true;
            Ok(())
        }

        fn set_boot_pending(&mut self, _ctx: &mut StorageContext) -> Result<(), OtaError> {
            self.pending = true;
            Ok(())
        }
    }

    #[test]
    fn crc_flow_accepts_matching_checksum() {
        let image: std::vec::Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let expected = crc32fast::hash(&image);

        let mut link = WirelessLink::new(VecStorage::default(), LinkSecurity::Crc32);
        link.prepare_download().unwrap();
        link.download(image.len() as u32).unwrap();
        for piece in image.chunks(517) {
            link.write(piece).unwrap();
        }
        assert_eq!(link.context().total_bytes_written, image.len() as u32);

        link.verify(expected, true).unwrap();
        assert_eq!(link.state(), AgentState::OtaComplete);
        assert!(link.storage.pending);
        assert_eq!(link.storage.staged, image);
    }

    #[test]
    fn crc_flow_rejects_wrong_checksum() {
        let image = [0x42u8; 1024];
        let mut link = WirelessLink::new(VecStorage::default(), LinkSecurity::Crc32);
        link.prepare_download().unwrap();
        link.download(image.len() as u32).unwrap();
        link.write(&image).unwrap();

        let wrong = crc32fast::hash(&image) ^ 1;
        assert_eq!(link.verify(wrong, true), Err(OtaError::WirelessVerify));
        assert_eq!(link.state(), AgentState::Exiting);
        assert!(!link.storage.pending);
    }

    #[test]
    fn verify_without_check_still_marks_pending() {
        let mut link = WirelessLink::new(VecStorage::default(), LinkSecurity::Crc32);
        link.prepare_download().unwrap();
        link.download(4).unwrap();
        link.write(&[1, 2, 3, 4]).unwrap();
        link.verify(0xDEAD_BEEF, false).unwrap();
        assert!(link.storage.pending);
    }

    #[test]
    fn abort_returns_to_waiting() {
        let mut link = WirelessLink::new(VecStorage::default(), LinkSecurity::Crc32);
        link.prepare_download().unwrap();
        link.download(100).unwrap();
        link.write(&[0u8; 10]).unwrap();
        link.abort().unwrap();
        assert_eq!(link.state(), AgentState::AgentWaiting);
        // Writing after abort is a protocol violation.
        assert_eq!(link.write(&[0u8; 10]), Err(OtaError::BadArg));
    }

    #[test]
    fn prepare_re_erases_on_retry() {
        let mut link = WirelessLink::new(VecStorage::default(), LinkSecurity::Crc32);
        link.prepare_download().unwrap();
        link.prepare_download().unwrap();
        assert_eq!(link.storage.opened, 2);
    }

    #[test]
    fn command_bytes_round_trip() {
        for (byte, cmd) in [
            (1u8, HostCommand::PrepareDownload),
            (2, HostCommand::Download),
            (3, HostCommand::Verify),
            (4, HostCommand::Abort),
        ] {
            assert_eq!(HostCommand::from_u8(byte), Some(cmd));
            assert_eq!(cmd as u8, byte);
        }
        assert_eq!(HostCommand::from_u8(9), None);

        assert_eq!(UpgradeStatus::from_result(&Ok(())), UpgradeStatus::Ok);
        assert_eq!(
            UpgradeStatus::from_result::<()>(&Err(OtaError::WirelessVerify)),
            UpgradeStatus::Bad
        );
    }
}
