//! Image verification: CRC-32 and ECDSA P-256 over SHA-256.
//!
//! Two modes exist, selected per transport at configuration time:
//!
//! * **CRC-32** (ISO-HDLC, polynomial 0xEDB88320): the unsigned wireless
//!   mode. The host sends the expected CRC with the `VERIFY` command.
//! * **ECDSA P-256 + SHA-256**: the signed wireless mode. The last 64 bytes
//!   of the stream are the detached `r || s` signature over everything
//!   before them; the device holds the public key as two 32-byte big-endian
//!   coordinates.
//!
//! Both modes hash/checksum incrementally as chunks arrive. In signed mode
//! chunks do not align to the signature boundary, so up to 64 trailing bytes
//! are buffered and only the portion of a write known to precede the
//! signature is hashed.

use super::error::OtaError;
use p256::ecdsa::{Signature, VerifyingKey, signature::hazmat::PrehashVerifier};
use p256::{EncodedPoint, FieldBytes};
use sha2::{Digest, Sha256};

/// Length of the detached signature trailing a signed image.
pub const SIGNATURE_LEN: usize = 64;

/// An embedded ECDSA P-256 public key.
///
/// Coordinates are big-endian, matching how device keys are provisioned.
#[derive(Debug, Clone, Copy)]
pub struct PublicKey {
    /// X coordinate.
    pub x: [u8; 32],
    /// Y coordinate.
    pub y: [u8; 32],
}

/// Incremental verifier for a signed image stream.
///
/// Feed every downloaded byte (including the trailing signature) through
/// [`update`](SignatureVerifier::update); call
/// [`verify`](SignatureVerifier::verify) once `total_len` bytes have been
/// seen.
pub struct SignatureVerifier {
    hasher: Sha256,
    key: PublicKey,
    total_len: u32,
    seen: u32,
    signature: [u8; SIGNATURE_LEN],
    sig_len: usize,
}

impl core::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("total_len", &self.total_len)
            .field("seen", &self.seen)
            .field("sig_len", &self.sig_len)
            .finish()
    }
}

impl SignatureVerifier {
    /// Start verification of a stream of `total_len` bytes (signature
    /// included).
    ///
    /// # Errors
    ///
    /// * [`OtaError::BadArg`] - stream shorter than a signature
    pub fn new(total_len: u32, key: PublicKey) -> Result<Self, OtaError> {
        if (total_len as usize) < SIGNATURE_LEN {
            return Err(OtaError::BadArg);
        }
        Ok(Self {
            hasher: Sha256::new(),
            key,
            total_len,
            seen: 0,
            signature: [0; SIGNATURE_LEN],
            sig_len: 0,
        })
    }

    /// Bytes consumed so far.
    pub fn seen(&self) -> u32 {
        self.seen
    }

    /// Consume the next chunk of the stream.
    ///
    /// Bytes before `total_len - 64` are hashed; the rest are captured as
    /// the signature. A chunk may straddle the boundary.
    ///
    /// # Errors
    ///
    /// * [`OtaError::BadArg`] - more than `total_len` bytes fed in
    pub fn update(&mut self, chunk: &[u8]) -> Result<(), OtaError> {
        let end = self
            .seen
            .checked_add(chunk.len() as u32)
            .ok_or(OtaError::BadArg)?;
        if end > self.total_len {
            return Err(OtaError::BadArg);
        }

        let body_len = (self.total_len as usize) - SIGNATURE_LEN;
        let hash_take = if (self.seen as usize) < body_len {
            core::cmp::min(chunk.len(), body_len - self.seen as usize)
        } else {
            0
        };

        if hash_take > 0 {
            self.hasher.update(&chunk[..hash_take]);
        }
        if hash_take < chunk.len() {
            let tail = &chunk[hash_take..];
            self.signature[self.sig_len..self.sig_len + tail.len()].copy_from_slice(tail);
            self.sig_len += tail.len();
        }

        self.seen = end;
        Ok(())
    }

    /// Finalize the hash and check the captured signature.
    ///
    /// # Errors
    ///
    /// * [`OtaError::WirelessVerify`] - stream incomplete, key invalid, or
    ///   signature mismatch
    pub fn verify(self) -> Result<(), OtaError> {
        if self.seen != self.total_len || self.sig_len != SIGNATURE_LEN {
            return Err(OtaError::WirelessVerify);
        }

        let point = EncodedPoint::from_affine_coordinates(
            FieldBytes::from_slice(&self.key.x),
            FieldBytes::from_slice(&self.key.y),
            false,
        );
        let key =
            VerifyingKey::from_encoded_point(&point).map_err(|_| OtaError::WirelessVerify)?;
        let signature =
            Signature::from_slice(&self.signature).map_err(|_| OtaError::WirelessVerify)?;

        let hash = self.hasher.finalize();
        key.verify_prehash(hash.as_slice(), &signature)
            .map_err(|_| OtaError::WirelessVerify)
    }
}

/// Incremental CRC-32 for the unsigned mode.
///
/// Standard ISO-HDLC CRC-32 (polynomial 0xEDB88320); the chaining value
/// starts at zero so partial updates compose.
#[derive(Debug, Default)]
pub struct Crc32 {
    hasher: crc32fast::Hasher,
}

impl Crc32 {
    /// A fresh checksum context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume the next chunk.
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    /// The checksum over everything consumed so far.
    pub fn finalize(self) -> u32 {
        self.hasher.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::SigningKey;
    use p256::ecdsa::signature::hazmat::PrehashSigner;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    fn test_key() -> (SigningKey, PublicKey) {
        let secret = [0x17u8; 32];
        let signing = SigningKey::from_slice(&secret).unwrap();
        let point = signing.verifying_key().to_encoded_point(false);
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        x.copy_from_slice(point.x().unwrap().as_slice());
        y.copy_from_slice(point.y().unwrap().as_slice());
        (signing, PublicKey { x, y })
    }

    fn signed_stream(image: &[u8]) -> (std::vec::Vec<u8>, PublicKey) {
        let (signing, public) = test_key();
        let hash = Sha256::digest(image);
        let signature: Signature = signing.sign_prehash(hash.as_slice()).unwrap();
        let mut stream = image.to_vec();
        stream.extend_from_slice(signature.to_bytes().as_slice());
        (stream, public)
    }

    #[test]
    fn accepts_valid_signature() {
        let image: std::vec::Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let (stream, public) = signed_stream(&image);

        let mut verifier = SignatureVerifier::new(stream.len() as u32, public).unwrap();
        verifier.update(&stream).unwrap();
        verifier.verify().unwrap();
    }

    #[test]
    fn hash_independent_of_chunk_boundaries() {
        // The SHA-256 over M must come out the same no matter how M || sig64
        // is split across writes.
        let image: std::vec::Vec<u8> = (0..10_000u32).map(|i| (i % 239) as u8).collect();
        let (stream, public) = signed_stream(&image);

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..8 {
            let mut verifier = SignatureVerifier::new(stream.len() as u32, public).unwrap();
            let mut off = 0;
            while off < stream.len() {
                let take = rng.gen_range(1..=core::cmp::min(997, stream.len() - off));
                verifier.update(&stream[off..off + take]).unwrap();
                off += take;
            }
            verifier.verify().unwrap();
        }
    }

    #[test]
    fn rejects_flipped_image_bit() {
        let image: std::vec::Vec<u8> = (0..4096u32).map(|i| (i % 249) as u8).collect();
        let (mut stream, public) = signed_stream(&image);
        stream[1234] ^= 0x01;

        let mut verifier = SignatureVerifier::new(stream.len() as u32, public).unwrap();
        verifier.update(&stream).unwrap();
        assert_eq!(verifier.verify(), Err(OtaError::WirelessVerify));
    }

    #[test]
    fn rejects_flipped_signature_bit() {
        let image: std::vec::Vec<u8> = (0..4096u32).map(|i| (i % 249) as u8).collect();
        let (mut stream, public) = signed_stream(&image);
        let last = stream.len() - 1;
        stream[last] ^= 0x80;

        let mut verifier = SignatureVerifier::new(stream.len() as u32, public).unwrap();
        verifier.update(&stream).unwrap();
        assert_eq!(verifier.verify(), Err(OtaError::WirelessVerify));
    }

    #[test]
    fn rejects_incomplete_stream() {
        let (_, public) = test_key();
        let verifier = SignatureVerifier::new(1000, public).unwrap();
        assert_eq!(verifier.verify(), Err(OtaError::WirelessVerify));
    }

    #[test]
    fn overflow_rejected() {
        let (_, public) = test_key();
        let mut verifier = SignatureVerifier::new(100, public).unwrap();
        assert_eq!(verifier.update(&[0u8; 101]), Err(OtaError::BadArg));
    }

    #[test]
    fn crc_incremental_matches_whole() {
        // CRC over any partition of the input equals CRC over the
        // concatenation.
        let mut rng = StdRng::seed_from_u64(42);
        let data: std::vec::Vec<u8> = (0..65_536).map(|_| rng.r#gen()).collect();

        let whole = crc32fast::hash(&data);

        for _ in 0..8 {
            let mut crc = Crc32::new();
            let mut off = 0;
            while off < data.len() {
                let take = rng.gen_range(1..=core::cmp::min(4093, data.len() - off));
                crc.update(&data[off..off + take]);
                off += take;
            }
            assert_eq!(crc.finalize(), whole);
        }
    }
}
