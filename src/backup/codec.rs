//! The chunk codec (meta-tree wire format).
//!
//! Every chunk begins with a format-version byte and a kind tag. A directory
//! or file that fits under `MAX_CHUNK_SIZE` encodes as a single non-split
//! chunk with no continuation pointer. A directory or file that doesn't fit
//! splits into a sequence of peer chunks of the *split* kind, each carrying
//! a left-of-recursion (LoR) pointer to the next. The kind tag alone tells a
//! reader whether an LoR field follows the size field, so the on-wire layout
//! of a small, unsplit chunk carries no split-chain overhead at all.

use std::convert::TryInto;

use bitflags::bitflags;
use thiserror::Error;

use crate::hash::Sha256Digest;

/// Recommended maximum: a directory's encoded children, or a file's raw
/// bytes, are packed into chunks holding at most this many content bytes
/// each (header overhead is additional).
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

pub const FORMAT_VERSION: u8 = 0x00;

pub const KIND_DATA: u8 = 0xFD;
pub const KIND_DATA_SPLIT: u8 = 0xFE;
pub const KIND_DIRECTORY_START: u8 = 0x01;
pub const KIND_DIRECTORY_SPLIT: u8 = 0x02;

/// An ordered list of chunk digests representing one logical file or
/// directory. Length zero means "no data".
pub type ChunkSeq = Vec<Sha256Digest>;

bitflags! {
    /// File attribute flags carried in a directory's child entries.
    #[derive(Default)]
    pub struct FileAttrFlags: u32 {
        const READONLY  = 0b0000_0001;
        const HIDDEN    = 0b0000_0010;
        const SYSTEM    = 0b0000_0100;
        const DIRECTORY = 0b0000_1000;
        const SYMLINK   = 0b0001_0000;
    }
}

/// Owner identity for a child entry, in whichever form the originating
/// platform natively exposes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Owner {
    Posix { user: String, group: String },
    Windows { sddl: String },
}

/// One entry in a directory's child list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildEntry {
    pub name: String,
    pub mode: u32,
    pub owner: Owner,
    pub attrs: FileAttrFlags,
    pub chunk_seq: ChunkSeq,
}

/// A chunk produced by the encoder, ready to be content-addressed and
/// uploaded.
#[derive(Clone, Debug)]
pub struct EncodedChunk {
    pub digest: Sha256Digest,
    pub bytes: Vec<u8>,
    /// This chunk's own encoded length plus everything it logically covers:
    /// identical across every peer of a split sequence, so a reader landing
    /// on any one chunk learns the whole subtree's size.
    pub subtree_size: u64,
}

/// A chunk as read back off the wire.
#[derive(Clone, Debug, PartialEq)]
pub enum ParsedChunk {
    Directory {
        subtree_size: u64,
        lor_next: Option<Sha256Digest>,
        children: Vec<ChildEntry>,
    },
    Data {
        subtree_size: u64,
        lor_next: Option<Sha256Digest>,
        payload: Vec<u8>,
    },
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("truncated chunk: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("unsupported format version {0:#x}")]
    UnsupportedVersion(u8),
    #[error("unknown chunk kind tag {0:#x}")]
    UnknownKind(u8),
    #[error("name is not valid UTF-8")]
    InvalidUtf8,
    #[error("unknown owner-kind tag {0:#x}")]
    UnknownOwnerKind(u8),
}

/// Deterministic: encoding the same children in the same order always
/// produces the same digests.
pub fn encode_directory(children: &[ChildEntry], children_subtree_size_sum: u64) -> Vec<EncodedChunk> {
    let encoded_children: Vec<Vec<u8>> = children.iter().map(encode_child_entry).collect();
    let groups = pack_greedy(&encoded_children);
    build_sequence(groups, children_subtree_size_sum, true)
}

/// Deterministic: files no larger than `MAX_CHUNK_SIZE` always return a
/// single-digest sequence.
pub fn encode_data(data: &[u8]) -> Vec<EncodedChunk> {
    if data.is_empty() {
        return build_sequence(vec![Vec::new()], 0, false);
    }
    let groups: Vec<Vec<u8>> = data.chunks(MAX_CHUNK_SIZE).map(|c| c.to_vec()).collect();
    build_sequence(groups, 0, false)
}

pub fn decode_chunk(bytes: &[u8]) -> Result<ParsedChunk, CodecError> {
    let mut r = Reader::new(bytes);
    let version = r.read_u8()?;
    if version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let kind = r.read_u8()?;
    let subtree_size = r.read_u64()?;
    match kind {
        KIND_DATA => {
            let payload = r.read_remaining().to_vec();
            Ok(ParsedChunk::Data {
                subtree_size,
                lor_next: None,
                payload,
            })
        }
        KIND_DATA_SPLIT => {
            let lor_next = r.read_lor()?;
            let payload = r.read_remaining().to_vec();
            Ok(ParsedChunk::Data {
                subtree_size,
                lor_next,
                payload,
            })
        }
        KIND_DIRECTORY_START => {
            let children = r.read_children()?;
            Ok(ParsedChunk::Directory {
                subtree_size,
                lor_next: None,
                children,
            })
        }
        KIND_DIRECTORY_SPLIT => {
            let lor_next = r.read_lor()?;
            let children = r.read_children()?;
            Ok(ParsedChunk::Directory {
                subtree_size,
                lor_next,
                children,
            })
        }
        other => Err(CodecError::UnknownKind(other)),
    }
}

/// Builds the final chunk sequence from already-grouped payloads (either
/// grouped child-entry bytes, or grouped raw file bytes). Processes groups
/// tail-to-head so each peer's LoR pointer can be the real digest of its
/// successor.
fn build_sequence(groups: Vec<Vec<u8>>, children_subtree_size_sum: u64, is_directory: bool) -> Vec<EncodedChunk> {
    let n = groups.len();
    let is_split = n > 1;

    let lens: Vec<usize> = groups
        .iter()
        .enumerate()
        .map(|(idx, group)| {
            let has_lor = is_split && idx + 1 < n;
            header_len(is_directory, is_split, has_lor) + group.len()
        })
        .collect();
    let total_bytes: u64 = lens.iter().map(|l| *l as u64).sum();
    let subtree_size = total_bytes + children_subtree_size_sum;

    let mut chunks: Vec<Option<EncodedChunk>> = (0..n).map(|_| None).collect();
    let mut next_digest: Option<Sha256Digest> = None;

    for idx in (0..n).rev() {
        let group = &groups[idx];
        let kind = match (is_directory, is_split) {
            (true, false) => KIND_DIRECTORY_START,
            (true, true) => KIND_DIRECTORY_SPLIT,
            (false, false) => KIND_DATA,
            (false, true) => KIND_DATA_SPLIT,
        };

        let mut bytes = Vec::with_capacity(group.len() + 16);
        bytes.push(FORMAT_VERSION);
        bytes.push(kind);
        bytes.extend_from_slice(&subtree_size.to_le_bytes());
        if is_split {
            write_lor(&mut bytes, next_digest);
        }
        if is_directory {
            bytes.extend_from_slice(&((count_children_in_group(group)) as u32).to_le_bytes());
        }
        bytes.extend_from_slice(group);

        let digest = Sha256Digest::hash(&bytes);
        next_digest = Some(digest);
        chunks[idx] = Some(EncodedChunk {
            digest,
            bytes,
            subtree_size,
        });
    }

    chunks.into_iter().map(Option::unwrap).collect()
}

fn header_len(is_directory: bool, is_split: bool, has_lor: bool) -> usize {
    let mut len = 1 + 1 + 8; // version + kind + subtree_size
    if is_split {
        len += 1; // lor presence flag
        if has_lor {
            len += 32;
        }
    }
    if is_directory {
        len += 4; // child count
    }
    len
}

/// For a group of already-encoded child entries concatenated together, the
/// directory path needs the element count, which the caller tracked
/// implicitly while packing; `encode_directory` packs one whole encoded
/// entry at a time, so we recompute it cheaply by re-scanning lengths
/// embedded at pack time instead of threading an extra count parameter
/// through `build_sequence` (which is shared with the data path).
fn count_children_in_group(group: &[u8]) -> usize {
    let mut count = 0;
    let mut r = Reader::new(group);
    while r.remaining() > 0 {
        r.skip_child_entry().expect("pack_greedy only emits whole child entries");
        count += 1;
    }
    count
}

/// Greedily packs already-encoded child entries into groups such that no
/// group's concatenated entry bytes exceed `MAX_CHUNK_SIZE`: add entries to
/// the current group until the next one would overflow, then start a new
/// peer. Order is preserved, which is required for deterministic encoding.
fn pack_greedy(encoded_children: &[Vec<u8>]) -> Vec<Vec<u8>> {
    if encoded_children.is_empty() {
        return vec![Vec::new()];
    }
    let mut groups = Vec::new();
    let mut current = Vec::new();
    let mut current_len = 0usize;
    for entry in encoded_children {
        if current_len > 0 && current_len + entry.len() > MAX_CHUNK_SIZE {
            groups.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current.extend_from_slice(entry);
        current_len += entry.len();
    }
    groups.push(current);
    groups
}

fn write_lor(out: &mut Vec<u8>, next: Option<Sha256Digest>) {
    match next {
        Some(digest) => {
            out.push(1);
            out.extend_from_slice(digest.as_bytes());
        }
        None => out.push(0),
    }
}

fn encode_child_entry(entry: &ChildEntry) -> Vec<u8> {
    let mut out = Vec::new();
    write_string(&mut out, &entry.name);
    out.extend_from_slice(&entry.mode.to_le_bytes());
    match &entry.owner {
        Owner::Posix { user, group } => {
            out.push(1);
            write_string(&mut out, user);
            write_string(&mut out, group);
        }
        Owner::Windows { sddl } => {
            out.push(2);
            write_string(&mut out, sddl);
        }
    }
    out.extend_from_slice(&entry.attrs.bits().to_le_bytes());
    out.extend_from_slice(&(entry.chunk_seq.len() as u32).to_le_bytes());
    for digest in &entry.chunk_seq {
        out.extend_from_slice(digest.as_bytes());
    }
    out
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    out.extend_from_slice(bytes);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn need(&self, n: usize) -> Result<(), CodecError> {
        if self.remaining() < n {
            Err(CodecError::Truncated {
                expected: self.pos + n,
                actual: self.buf.len(),
            })
        } else {
            Ok(())
        }
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        self.need(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn read_u16(&mut self) -> Result<u16, CodecError> {
        self.need(2)?;
        let v = u16::from_le_bytes(self.buf[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        Ok(v)
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        self.need(4)?;
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn read_u64(&mut self) -> Result<u64, CodecError> {
        self.need(8)?;
        let v = u64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        self.need(n)?;
        let v = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(v)
    }

    fn read_remaining(&mut self) -> &'a [u8] {
        let v = &self.buf[self.pos..];
        self.pos = self.buf.len();
        v
    }

    fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    fn read_digest(&mut self) -> Result<Sha256Digest, CodecError> {
        let bytes = self.read_bytes(32)?;
        Ok(Sha256Digest::parse_raw(bytes).expect("length checked by read_bytes"))
    }

    fn read_lor(&mut self) -> Result<Option<Sha256Digest>, CodecError> {
        let present = self.read_u8()?;
        if present == 0 {
            Ok(None)
        } else {
            Ok(Some(self.read_digest()?))
        }
    }

    fn read_chunk_seq(&mut self) -> Result<ChunkSeq, CodecError> {
        let count = self.read_u32()? as usize;
        let mut seq = Vec::with_capacity(count);
        for _ in 0..count {
            seq.push(self.read_digest()?);
        }
        Ok(seq)
    }

    fn read_child_entry(&mut self) -> Result<ChildEntry, CodecError> {
        let name = self.read_string()?;
        let mode = self.read_u32()?;
        let owner_kind = self.read_u8()?;
        let owner = match owner_kind {
            1 => Owner::Posix {
                user: self.read_string()?,
                group: self.read_string()?,
            },
            2 => Owner::Windows {
                sddl: self.read_string()?,
            },
            other => return Err(CodecError::UnknownOwnerKind(other)),
        };
        let attrs = FileAttrFlags::from_bits_truncate(self.read_u32()?);
        let chunk_seq = self.read_chunk_seq()?;
        Ok(ChildEntry {
            name,
            mode,
            owner,
            attrs,
            chunk_seq,
        })
    }

    fn skip_child_entry(&mut self) -> Result<(), CodecError> {
        self.read_child_entry().map(|_| ())
    }

    fn read_children(&mut self) -> Result<Vec<ChildEntry>, CodecError> {
        let count = self.read_u32()? as usize;
        let mut children = Vec::with_capacity(count);
        for _ in 0..count {
            children.push(self.read_child_entry()?);
        }
        Ok(children)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn posix_entry(name: &str, seq: ChunkSeq) -> ChildEntry {
        ChildEntry {
            name: name.to_string(),
            mode: 0o644,
            owner: Owner::Posix {
                user: "root".to_string(),
                group: "root".to_string(),
            },
            attrs: FileAttrFlags::empty(),
            chunk_seq: seq,
        }
    }

    #[test]
    fn empty_directory_round_trips() {
        let chunks = encode_directory(&[], 0);
        assert_eq!(chunks.len(), 1);
        let parsed = decode_chunk(&chunks[0].bytes).unwrap();
        match parsed {
            ParsedChunk::Directory { children, lor_next, .. } => {
                assert!(children.is_empty());
                assert!(lor_next.is_none());
            }
            _ => panic!("expected directory"),
        }
    }

    #[test]
    fn small_file_has_no_lor_field() {
        let data = b"helloworld";
        let chunks = encode_data(data);
        assert_eq!(chunks.len(), 1);
        // format version + kind + 8-byte size, then payload directly.
        assert_eq!(chunks[0].bytes[0], FORMAT_VERSION);
        assert_eq!(chunks[0].bytes[1], KIND_DATA);
        assert_eq!(&chunks[0].bytes[10..], data);
    }

    #[test]
    fn file_one_byte_over_max_splits_into_two() {
        let data = vec![7u8; MAX_CHUNK_SIZE + 1];
        let chunks = encode_data(&data);
        assert_eq!(chunks.len(), 2);
        match decode_chunk(&chunks[0].bytes).unwrap() {
            ParsedChunk::Data { payload, lor_next, .. } => {
                assert_eq!(payload.len(), MAX_CHUNK_SIZE);
                assert_eq!(lor_next, Some(chunks[1].digest));
            }
            _ => panic!("expected data chunk"),
        }

        match decode_chunk(&chunks[1].bytes).unwrap() {
            ParsedChunk::Data { payload, lor_next, .. } => {
                assert_eq!(payload.len(), 1);
                assert!(lor_next.is_none());
            }
            _ => panic!("expected data chunk"),
        }
    }

    #[test]
    fn directory_round_trips_with_children() {
        let a = posix_entry("a.txt", vec![Sha256Digest::hash(b"a")]);
        let b = posix_entry("b.txt", vec![Sha256Digest::hash(b"b")]);
        let chunks = encode_directory(&[a.clone(), b.clone()], 100);
        assert_eq!(chunks.len(), 1);
        match decode_chunk(&chunks[0].bytes).unwrap() {
            ParsedChunk::Directory { children, subtree_size, .. } => {
                assert_eq!(children, vec![a, b]);
                assert_eq!(subtree_size, chunks[0].subtree_size);
                assert!(subtree_size > 100);
            }
            _ => panic!("expected directory"),
        }
    }

    #[test]
    fn encoding_is_deterministic() {
        let a = posix_entry("a.txt", vec![Sha256Digest::hash(b"a")]);
        let b = posix_entry("b.txt", vec![Sha256Digest::hash(b"b")]);
        let first = encode_directory(&[a.clone(), b.clone()], 0);
        let second = encode_directory(&[a, b], 0);
        assert_eq!(first[0].digest, second[0].digest);
    }

    #[test]
    fn many_children_split_on_entry_boundaries() {
        let children: Vec<ChildEntry> = (0..200_000u32)
            .map(|i| posix_entry(&format!("file-{i}"), vec![Sha256Digest::hash(&i.to_le_bytes())]))
            .collect();
        let chunks = encode_directory(&children, 0);
        assert!(chunks.len() > 1);
        let mut total_children = 0;
        for (idx, chunk) in chunks.iter().enumerate() {
            assert!(chunk.bytes.len() <= MAX_CHUNK_SIZE + 64);
            match decode_chunk(&chunk.bytes).unwrap() {
                ParsedChunk::Directory { children, lor_next, .. } => {
                    total_children += children.len();
                    if idx + 1 < chunks.len() {
                        assert_eq!(lor_next, Some(chunks[idx + 1].digest));
                    } else {
                        assert!(lor_next.is_none());
                    }
                }
                _ => panic!("expected directory"),
            }
        }
        assert_eq!(total_children, children.len());
    }
}
