//! Incremental TAR (ustar) demultiplexer for multi-component updates.
//!
//! A multi-component update arrives as a ustar archive streamed through the
//! normal download path. The first member must be `components.json`, a small
//! manifest naming each following member and tagging it with a component
//! type; the demultiplexer routes each member's body to the slot the tag
//! dictates:
//!
//! | type | destination |
//! |------|-------------|
//! | `"SPE"`  | secondary slot 1 |
//! | `"NSPE"` | secondary slot 0 |
//! | `"FWDB"` | secondary slot 1, at the member's declared offsets |
//!
//! Unknown tags abort the demux. This is not a general-purpose TAR reader:
//! exactly enough of the ustar format is parsed to dispatch named members,
//! and headers split across two inbound chunks are reassembled in a small
//! coalescing buffer.

use super::error::OtaError;
use heapless::{String, Vec};
use serde::Deserialize;

/// Size of a ustar logical record.
pub const TAR_BLOCK_SIZE: usize = 512;

/// Maximum number of members an archive may carry.
pub const MAX_TAR_FILES: usize = 8;

/// ustar member name length.
const NAME_LEN: usize = 100;

/// Offset of the `ustar` magic within a header block.
const MAGIC_OFFSET: usize = 257;

/// Maximum size of the `components.json` manifest member.
const MAX_MANIFEST_LEN: usize = 1024;

/// Name of the manifest member.
const MANIFEST_NAME: &str = "components.json";

/// Component type a member routes by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    /// Secure Processing Environment image; routes to secondary slot 1.
    Spe,
    /// Non-Secure Processing Environment (application) image; routes to
    /// secondary slot 0.
    Nspe,
    /// Firmware data block; routes to secondary slot 1 at the member's
    /// declared offsets.
    Fwdb,
}

impl MemberKind {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "SPE" => Some(MemberKind::Spe),
            "NSPE" => Some(MemberKind::Nspe),
            "FWDB" => Some(MemberKind::Fwdb),
            _ => None,
        }
    }
}

/// One archive member being routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarMember {
    /// Member file name.
    pub name: String<NAME_LEN>,
    /// Routing tag from the manifest.
    pub kind: MemberKind,
    /// Body size in bytes, from the ustar header.
    pub size: u32,
}

#[derive(Debug, Default, Deserialize)]
struct RawComponent<'a> {
    #[serde(rename = "fileName", default)]
    file_name: Option<&'a str>,
    #[serde(rename = "fileType", default)]
    file_type: Option<&'a str>,
    #[serde(rename = "fileSize", default)]
    file_size: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RawManifest<'a> {
    #[serde(rename = "version", default)]
    version: Option<&'a str>,
    #[serde(rename = "files")]
    #[serde(borrow)]
    files: Vec<RawComponent<'a>, MAX_TAR_FILES>,
}

#[derive(Debug, Clone)]
struct ComponentEntry {
    name: String<NAME_LEN>,
    kind: MemberKind,
    size: u32,
}

#[derive(Debug)]
enum State {
    /// Waiting for (the rest of) a 512-byte header block.
    Header,
    /// Streaming the manifest member into the manifest buffer.
    ManifestBody { remaining: u32, padding: u32 },
    /// Streaming a component member to the sink.
    MemberBody {
        member: TarMember,
        offset: u32,
        remaining: u32,
        padding: u32,
    },
    /// Consuming inter-member padding.
    Padding { remaining: u32 },
    /// Saw the end-of-archive marker; everything further is ignored.
    Done,
}

/// Incremental archive demultiplexer.
///
/// Feed the raw download stream through [`feed`](TarStream::feed); the sink
/// closure receives `(member, offset_within_member, bytes)` calls in stream
/// order.
#[derive(Debug)]
pub struct TarStream {
    state: State,
    coalesce: [u8; TAR_BLOCK_SIZE],
    coalesce_len: usize,
    manifest: Vec<u8, MAX_MANIFEST_LEN>,
    components: Vec<ComponentEntry, MAX_TAR_FILES>,
    version: Option<String<16>>,
    seen_manifest: bool,
}

impl Default for TarStream {
    fn default() -> Self {
        Self::new()
    }
}

impl TarStream {
    /// A demultiplexer expecting the start of an archive.
    pub fn new() -> Self {
        Self {
            state: State::Header,
            coalesce: [0; TAR_BLOCK_SIZE],
            coalesce_len: 0,
            manifest: Vec::new(),
            components: Vec::new(),
            version: None,
            seen_manifest: false,
        }
    }

    /// Whether `data` opens a ustar archive.
    ///
    /// Checks the `ustar` magic at its fixed header offset; needs at least
    /// the first 263 bytes of the stream.
    pub fn looks_like_tar(data: &[u8]) -> bool {
        data.len() > MAGIC_OFFSET + 5 && &data[MAGIC_OFFSET..MAGIC_OFFSET + 5] == b"ustar"
    }

    /// The `version` string from the manifest, once parsed.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Whether the end-of-archive marker has been consumed.
    pub fn finished(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// Consume the next stretch of the archive stream.
    ///
    /// `sink` is called for every run of member body bytes with the member,
    /// the offset of the run within the member, and the bytes themselves.
    ///
    /// # Errors
    ///
    /// * [`OtaError::NotAJobDoc`] is never returned here; manifest problems
    ///   and structural problems all surface as [`OtaError::General`], an
    ///   oversized manifest as [`OtaError::OutOfMemory`], and sink errors
    ///   propagate unchanged.
    pub fn feed<F>(&mut self, data: &[u8], sink: &mut F) -> Result<(), OtaError>
    where
        F: FnMut(&TarMember, u32, &[u8]) -> Result<(), OtaError>,
    {
        let mut input = data;

        while !input.is_empty() {
            match &mut self.state {
                State::Done => return Ok(()),

                State::Header => {
                    // Assemble a full header block, buffering a split one.
                    let header_block: &[u8] = if self.coalesce_len == 0
                        && input.len() >= TAR_BLOCK_SIZE
                    {
                        let (block, rest) = input.split_at(TAR_BLOCK_SIZE);
                        input = rest;
                        block
                    } else {
                        let take =
                            core::cmp::min(TAR_BLOCK_SIZE - self.coalesce_len, input.len());
                        self.coalesce[self.coalesce_len..self.coalesce_len + take]
                            .copy_from_slice(&input[..take]);
                        self.coalesce_len += take;
                        input = &input[take..];
                        if self.coalesce_len < TAR_BLOCK_SIZE {
                            return Ok(());
                        }
                        self.coalesce_len = 0;
                        &self.coalesce
                    };

                    if header_block.iter().all(|&b| b == 0) {
                        // End-of-archive marker.
                        self.state = State::Done;
                        return Ok(());
                    }

                    let header = parse_header(header_block)?;
                    self.state = self.classify_member(header)?;
                }

                State::ManifestBody { remaining, padding } => {
                    let take = core::cmp::min(*remaining as usize, input.len());
                    self.manifest
                        .extend_from_slice(&input[..take])
                        .map_err(|_| OtaError::OutOfMemory)?;
                    *remaining -= take as u32;
                    input = &input[take..];
                    if *remaining == 0 {
                        let padding = *padding;
                        self.parse_manifest()?;
                        self.state = State::Padding { remaining: padding };
                    }
                }

                State::MemberBody {
                    member,
                    offset,
                    remaining,
                    padding,
                } => {
                    let take = core::cmp::min(*remaining as usize, input.len());
                    sink(member, *offset, &input[..take])?;
                    *offset += take as u32;
                    *remaining -= take as u32;
                    input = &input[take..];
                    if *remaining == 0 {
                        let pad = *padding;
                        self.state = State::Padding { remaining: pad };
                    }
                }

                State::Padding { remaining } => {
                    let take = core::cmp::min(*remaining as usize, input.len());
                    *remaining -= take as u32;
                    input = &input[take..];
                    if *remaining == 0 {
                        self.state = State::Header;
                    }
                }
            }
        }

        Ok(())
    }

    /// Decide what to do with the member a header announced.
    fn classify_member(&mut self, header: HeaderInfo) -> Result<State, OtaError> {
        let padding = (TAR_BLOCK_SIZE as u32 - header.size % TAR_BLOCK_SIZE as u32)
            % TAR_BLOCK_SIZE as u32;

        // Directories and other non-file entries carry no routable body.
        if header.typeflag == b'5' {
            return Ok(State::Padding { remaining: padding });
        }

        if header.name.as_str() == MANIFEST_NAME {
            if self.seen_manifest {
                log::error!("duplicate components.json in archive");
                return Err(OtaError::General);
            }
            self.seen_manifest = true;
            if header.size as usize > MAX_MANIFEST_LEN {
                return Err(OtaError::OutOfMemory);
            }
            return Ok(State::ManifestBody {
                remaining: header.size,
                padding,
            });
        }

        if !self.seen_manifest {
            log::error!("archive member {} precedes components.json", header.name);
            return Err(OtaError::General);
        }

        let entry = self
            .components
            .iter()
            .find(|c| c.name == header.name)
            .ok_or_else(|| {
                log::error!("archive member {} not in components.json", header.name);
                OtaError::General
            })?;

        if entry.size != 0 && entry.size != header.size {
            log::warn!(
                "member {} size {} differs from manifest {}",
                header.name,
                header.size,
                entry.size
            );
        }

        Ok(State::MemberBody {
            member: TarMember {
                name: header.name,
                kind: entry.kind,
                size: header.size,
            },
            offset: 0,
            remaining: header.size,
            padding,
        })
    }

    fn parse_manifest(&mut self) -> Result<(), OtaError> {
        let (raw, _): (RawManifest, usize) =
            serde_json_core::from_slice(&self.manifest).map_err(|_| OtaError::General)?;

        if let Some(version) = raw.version {
            self.version = String::try_from(version).ok();
        }

        for component in &raw.files {
            let (Some(name), Some(tag)) = (component.file_name, component.file_type) else {
                return Err(OtaError::General);
            };
            let kind = MemberKind::from_tag(tag).ok_or_else(|| {
                log::error!("unknown component type {}", tag);
                OtaError::General
            })?;
            let size = component
                .file_size
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            self.components
                .push(ComponentEntry {
                    name: String::try_from(name).map_err(|_| OtaError::General)?,
                    kind,
                    size,
                })
                .map_err(|_| OtaError::OutOfMemory)?;
        }

        log::info!(
            "components.json: {} members, version {}",
            self.components.len(),
            self.version.as_deref().unwrap_or("?")
        );
        Ok(())
    }
}

struct HeaderInfo {
    name: String<NAME_LEN>,
    size: u32,
    typeflag: u8,
}

/// Parse one 512-byte ustar header block.
fn parse_header(block: &[u8]) -> Result<HeaderInfo, OtaError> {
    debug_assert_eq!(block.len(), TAR_BLOCK_SIZE);

    if &block[MAGIC_OFFSET..MAGIC_OFFSET + 5] != b"ustar" {
        log::error!("archive block without ustar magic");
        return Err(OtaError::General);
    }

    let name_bytes = &block[..NAME_LEN];
    let name_end = name_bytes.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    let name_str =
        core::str::from_utf8(&name_bytes[..name_end]).map_err(|_| OtaError::General)?;
    let name = String::try_from(name_str).map_err(|_| OtaError::General)?;

    let size = parse_octal(&block[124..136]).ok_or(OtaError::General)?;
    let typeflag = block[156];

    Ok(HeaderInfo { name, size, typeflag })
}

/// Parse the ASCII-octal size field (NUL/space padded).
fn parse_octal(field: &[u8]) -> Option<u32> {
    let mut value: u32 = 0;
    let mut seen_digit = false;
    for &byte in field {
        match byte {
            b'0'..=b'7' => {
                value = value.checked_mul(8)?.checked_add((byte - b'0') as u32)?;
                seen_digit = true;
            }
            b' ' | 0 => {
                if seen_digit {
                    break;
                }
            }
            _ => return None,
        }
    }
    seen_digit.then_some(value)
}

#[cfg(test)]
pub(crate) mod tests_support {
    //! Archive builders shared with the storage-engine tests.

    use super::{MANIFEST_NAME, TAR_BLOCK_SIZE};
    use std::vec::Vec as StdVec;

    pub fn header_block(name: &str, size: u32, typeflag: u8) -> [u8; TAR_BLOCK_SIZE] {
        let mut block = [0u8; TAR_BLOCK_SIZE];
        block[..name.len()].copy_from_slice(name.as_bytes());
        let size_field = std::format!("{:011o}\0", size);
        block[124..124 + size_field.len()].copy_from_slice(size_field.as_bytes());
        block[156] = typeflag;
        block[super::MAGIC_OFFSET..super::MAGIC_OFFSET + 6].copy_from_slice(b"ustar\0");
        block[263..265].copy_from_slice(b"00");
        block
    }

    pub fn member(name: &str, body: &[u8]) -> StdVec<u8> {
        let mut out = StdVec::new();
        out.extend_from_slice(&header_block(name, body.len() as u32, b'0'));
        out.extend_from_slice(body);
        let pad = (TAR_BLOCK_SIZE - body.len() % TAR_BLOCK_SIZE) % TAR_BLOCK_SIZE;
        out.extend_from_slice(&std::vec![0u8; pad]);
        out
    }

    /// A two-component archive: `tfm.bin` tagged SPE, `app.bin` tagged NSPE.
    pub fn build_archive(tfm: &[u8], app: &[u8]) -> StdVec<u8> {
        let manifest = std::format!(
            r#"{{"version":"2.1.0","files":[{{"fileName":"tfm.bin","fileType":"SPE","fileSize":"{}"}},{{"fileName":"app.bin","fileType":"NSPE","fileSize":"{}"}}]}}"#,
            tfm.len(),
            app.len()
        );

        let mut archive = StdVec::new();
        archive.extend_from_slice(&member(MANIFEST_NAME, manifest.as_bytes()));
        archive.extend_from_slice(&member("tfm.bin", tfm));
        archive.extend_from_slice(&member("app.bin", app));
        archive.extend_from_slice(&[0u8; TAR_BLOCK_SIZE * 2]);
        archive
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::{build_archive, member};
    use super::*;
    use std::vec::Vec as StdVec;

    fn sample_archive() -> (StdVec<u8>, StdVec<u8>, StdVec<u8>) {
        let app: StdVec<u8> = (0..1000u32).map(|i| (i % 241) as u8).collect();
        let tfm: StdVec<u8> = (0..700u32).map(|i| (i % 199) as u8).collect();
        let archive = build_archive(&tfm, &app);
        (archive, tfm, app)
    }

    /// Collects routed bytes per member kind.
    fn route_all(archive: &[u8], chunk: usize) -> Result<(StdVec<u8>, StdVec<u8>), OtaError> {
        let mut stream = TarStream::new();
        let mut spe = StdVec::new();
        let mut nspe = StdVec::new();
        let mut sink = |member: &TarMember, offset: u32, bytes: &[u8]| {
            let out = match member.kind {
                MemberKind::Spe | MemberKind::Fwdb => &mut spe,
                MemberKind::Nspe => &mut nspe,
            };
            assert_eq!(offset as usize, out.len());
            out.extend_from_slice(bytes);
            Ok(())
        };
        for piece in archive.chunks(chunk) {
            stream.feed(piece, &mut sink)?;
        }
        assert!(stream.finished());
        Ok((spe, nspe))
    }

    #[test]
    fn detects_tar_magic() {
        let (archive, _, _) = sample_archive();
        assert!(TarStream::looks_like_tar(&archive));
        assert!(!TarStream::looks_like_tar(&[0u8; 512]));
        assert!(!TarStream::looks_like_tar(&archive[..100]));
    }

    #[test]
    fn routes_members_by_type() {
        let (archive, tfm, app) = sample_archive();
        let (spe, nspe) = route_all(&archive, archive.len()).unwrap();
        assert_eq!(spe, tfm);
        assert_eq!(nspe, app);
    }

    #[test]
    fn header_split_across_chunks_is_reassembled() {
        let (archive, tfm, app) = sample_archive();
        // Chunk sizes chosen to split headers at awkward boundaries.
        for chunk in [1, 13, 100, 511, 513, 700] {
            let (spe, nspe) = route_all(&archive, chunk).unwrap();
            assert_eq!(spe, tfm, "chunk size {}", chunk);
            assert_eq!(nspe, app, "chunk size {}", chunk);
        }
    }

    #[test]
    fn manifest_version_exposed() {
        let (archive, _, _) = sample_archive();
        let mut stream = TarStream::new();
        let mut sink = |_: &TarMember, _: u32, _: &[u8]| Ok(());
        stream.feed(&archive, &mut sink).unwrap();
        assert_eq!(stream.version(), Some("2.1.0"));
    }

    #[test]
    fn unknown_member_aborts() {
        let manifest = r#"{"version":"1.0.0","files":[{"fileName":"a.bin","fileType":"NSPE","fileSize":"4"}]}"#;
        let mut archive = StdVec::new();
        archive.extend_from_slice(&member(MANIFEST_NAME, manifest.as_bytes()));
        archive.extend_from_slice(&member("rogue.bin", b"data"));

        let mut stream = TarStream::new();
        let mut sink = |_: &TarMember, _: u32, _: &[u8]| Ok(());
        assert_eq!(stream.feed(&archive, &mut sink), Err(OtaError::General));
    }

    #[test]
    fn unknown_component_type_aborts() {
        let manifest =
            r#"{"version":"1.0.0","files":[{"fileName":"a.bin","fileType":"BLOB","fileSize":"4"}]}"#;
        let archive = member(MANIFEST_NAME, manifest.as_bytes());

        let mut stream = TarStream::new();
        let mut sink = |_: &TarMember, _: u32, _: &[u8]| Ok(());
        assert_eq!(stream.feed(&archive, &mut sink), Err(OtaError::General));
    }

    #[test]
    fn member_before_manifest_aborts() {
        let archive = member("a.bin", b"data");
        let mut stream = TarStream::new();
        let mut sink = |_: &TarMember, _: u32, _: &[u8]| Ok(());
        assert_eq!(stream.feed(&archive, &mut sink), Err(OtaError::General));
    }

    #[test]
    fn octal_sizes() {
        assert_eq!(parse_octal(b"00000000017\0"), Some(15));
        assert_eq!(parse_octal(b"017 "), Some(15));
        assert_eq!(parse_octal(b"xyz"), None);
        assert_eq!(parse_octal(b"\0\0\0"), None);
    }
}
