//! End-to-end wireless-link update tests over the flash-backed storage
//! engine: host command sequence, CRC and signed verification, and the
//! bootloader trailer left behind.

use libota::ota::storage::FlashOtaStorage;
use libota::ota::verify::{PublicKey, SIGNATURE_LEN};
use libota::ota::wireless::{HostCommand, LinkSecurity, UpgradeStatus, WirelessLink};
use libota::ota::{AgentState, OtaError};
use libota::storage::error::Error as StorageError;
use libota::storage::flash_map::{FlashArea, FlashAreaId, FlashDevice, FlashMap};
use libota::storage::{BlockingErase, ReadStorage, Storage};
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey};
use sha2::{Digest, Sha256};

const CAPACITY: usize = 256 * 1024;
const ROW: u32 = 256;
const SLOT_SIZE: u32 = 0x10000;

struct MockFlash {
    memory: Vec<u8>,
}

impl ReadStorage for MockFlash {
    type Error = StorageError;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let offset = offset as usize;
        if offset + bytes.len() > self.memory.len() {
            return Err(StorageError::OutOfBounds);
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
            return Err(StorageError::OutOfBounds);
        }
        self.memory[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

impl BlockingErase for MockFlash {
    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        for byte in &mut self.memory[from as usize..to as usize] {
            *byte = 0xFF;
        }
        Ok(())
    }
}

fn flash_engine() -> FlashOtaStorage<MockFlash> {
    let flash = MockFlash {
        memory: vec![0xFF; CAPACITY],
    };
    let mut map = FlashMap::new(flash, ROW).unwrap();
    for (index, id) in [
        FlashAreaId::PrimarySlot(0),
        FlashAreaId::SecondarySlot(0),
        FlashAreaId::SecondarySlot(1),
    ]
    .into_iter()
    .enumerate()
    {
        map.add_area(FlashArea {
            id,
            device: FlashDevice::External,
            offset: index as u32 * SLOT_SIZE,
            size: SLOT_SIZE,
        })
        .unwrap();
    }
    FlashOtaStorage::new(map)
}

fn test_key() -> (SigningKey, PublicKey) {
    let signing = SigningKey::from_slice(&[0x2Au8; 32]).unwrap();
    let point = signing.verifying_key().to_encoded_point(false);
    let mut x = [0u8; 32];
    let mut y = [0u8; 32];
    x.copy_from_slice(point.x().unwrap().as_slice());
    y.copy_from_slice(point.y().unwrap().as_slice());
    (signing, PublicKey { x, y })
}

/// Image bytes followed by the detached signature over them.
fn signed_stream(image: &[u8]) -> (Vec<u8>, PublicKey) {
    let (signing, public) = test_key();
    let hash = Sha256::digest(image);
    let signature: Signature = signing.sign_prehash(hash.as_slice()).unwrap();
    let mut stream = image.to_vec();
    stream.extend_from_slice(signature.to_bytes().as_slice());
    (stream, public)
}

/// Drive the full host command sequence for a stream already broken into
/// link-sized writes.
fn drive_link<S: libota::ota::storage::OtaStorage>(
    link: &mut WirelessLink<S>,
    stream: &[u8],
    chunk: usize,
    crc: u32,
) -> Result<(), OtaError> {
    link.prepare_download()?;
    link.download(stream.len() as u32)?;
    for piece in stream.chunks(chunk) {
        link.write(piece)?;
    }
    link.verify(crc, true)
}

#[test]
fn signed_stream_verifies_and_arms_slot() {
    // 100 KB of pseudo-random bytes plus the 64-byte trailer.
    let image: Vec<u8> = (0..100 * 1024u32)
        .map(|i| (i.wrapping_mul(2654435761) >> 24) as u8)
        .collect();
    let (stream, public) = signed_stream(&image);

    let mut link = WirelessLink::new(flash_engine(), LinkSecurity::Signed(public));
    drive_link(&mut link, &stream, 509, 0).unwrap();
    assert_eq!(link.state(), AgentState::OtaComplete);
    assert_eq!(link.percentage(), 100);

    // The staged slot holds the stream (signature included) and is marked
    // pending for the bootloader.
    let mut engine = link.into_storage();
    let mut staged = vec![0u8; stream.len()];
    engine
        .map_mut()
        .read_area(FlashAreaId::SecondarySlot(0), 0, &mut staged)
        .unwrap();
    assert_eq!(staged, stream);

    let trailer = engine
        .map_mut()
        .read_trailer(FlashAreaId::SecondarySlot(0))
        .unwrap();
    assert!(trailer.magic_ok);
}

#[test]
fn flipped_image_bit_fails_signed_verify() {
    let image: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
    let (mut stream, public) = signed_stream(&image);
    stream[4000] ^= 0x10;

    let mut link = WirelessLink::new(flash_engine(), LinkSecurity::Signed(public));
    let result = drive_link(&mut link, &stream, 1024, 0);
    assert_eq!(result, Err(OtaError::WirelessVerify));
    assert_eq!(link.state(), AgentState::Exiting);

    // Slot not armed.
    let mut engine = link.into_storage();
    let trailer = engine
        .map_mut()
        .read_trailer(FlashAreaId::SecondarySlot(0))
        .unwrap();
    assert!(!trailer.magic_ok);
}

#[test]
fn flipped_signature_bit_fails_signed_verify() {
    let image: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
    let (mut stream, public) = signed_stream(&image);
    let last = stream.len() - 1;
    stream[last] ^= 0x01;

    let mut link = WirelessLink::new(flash_engine(), LinkSecurity::Signed(public));
    assert_eq!(
        drive_link(&mut link, &stream, 777, 0),
        Err(OtaError::WirelessVerify)
    );
}

#[test]
fn signature_straddling_writes_still_verifies() {
    // Chunk sizes chosen so the final 64 signature bytes split across
    // writes in different ways.
    let image: Vec<u8> = (0..4096u32).map(|i| (i % 239) as u8).collect();
    let (stream, public) = signed_stream(&image);

    for chunk in [SIGNATURE_LEN - 1, SIGNATURE_LEN, SIGNATURE_LEN + 1, 1000, 4095] {
        let mut link = WirelessLink::new(flash_engine(), LinkSecurity::Signed(public));
        drive_link(&mut link, &stream, chunk, 0)
            .unwrap_or_else(|err| panic!("chunk {} failed: {}", chunk, err));
    }
}

#[test]
fn crc_stream_verifies() {
    let image: Vec<u8> = (0..20_000u32).map(|i| (i % 249) as u8).collect();
    let crc = crc32fast::hash(&image);

    let mut link = WirelessLink::new(flash_engine(), LinkSecurity::Crc32);
    drive_link(&mut link, &image, 512, crc).unwrap();
    assert_eq!(link.state(), AgentState::OtaComplete);

    let mut engine = link.into_storage();
    let trailer = engine
        .map_mut()
        .read_trailer(FlashAreaId::SecondarySlot(0))
        .unwrap();
    assert!(trailer.magic_ok);
}

#[test]
fn crc_mismatch_is_rejected() {
    let image = vec![0x77u8; 2048];
    let crc = crc32fast::hash(&image) ^ 0x8000_0000;

    let mut link = WirelessLink::new(flash_engine(), LinkSecurity::Crc32);
    assert_eq!(
        drive_link(&mut link, &image, 512, crc),
        Err(OtaError::WirelessVerify)
    );
}

#[test]
fn abort_mid_transfer_allows_restart() {
    let image: Vec<u8> = (0..4096u32).map(|i| (i % 245) as u8).collect();
    let crc = crc32fast::hash(&image);

    let mut link = WirelessLink::new(flash_engine(), LinkSecurity::Crc32);
    link.prepare_download().unwrap();
    link.download(image.len() as u32).unwrap();
    link.write(&image[..1000]).unwrap();
    link.abort().unwrap();
    assert_eq!(link.state(), AgentState::AgentWaiting);

    // A fresh PREPARE/DOWNLOAD sequence starts over cleanly.
    drive_link(&mut link, &image, 1024, crc).unwrap();
    assert_eq!(link.state(), AgentState::OtaComplete);
}

#[test]
fn host_command_dispatch() {
    // The byte protocol a link host speaks maps onto the session methods.
    let image = vec![0xA5u8; 1024];
    let crc = crc32fast::hash(&image);
    let mut link = WirelessLink::new(flash_engine(), LinkSecurity::Crc32);

    for (byte, argument) in [(1u8, 0u32), (2, image.len() as u32)] {
        let status = match HostCommand::from_u8(byte).unwrap() {
            HostCommand::PrepareDownload => UpgradeStatus::from_result(&link.prepare_download()),
            HostCommand::Download => UpgradeStatus::from_result(&link.download(argument)),
            HostCommand::Verify => UpgradeStatus::from_result(&link.verify(argument, true)),
            HostCommand::Abort => UpgradeStatus::from_result(&link.abort()),
        };
        assert_eq!(status, UpgradeStatus::Ok);
    }

    link.write(&image).unwrap();
    assert_eq!(
        UpgradeStatus::from_result(&link.verify(crc, true)),
        UpgradeStatus::Ok
    );
    // An unknown command byte is rejected before dispatch.
    assert_eq!(HostCommand::from_u8(0), None);
}
