//! Pack archive layout: header, names block, file table, packed files. Pure byte transforms, no I/O.
//!
//! ```text
//! +--------------------+ 0
//! | header (36 bytes)  |
//! +--------------------+ start_of_names
//! | names (compressed) |   sorted, NUL-terminated entry names
//! +--------------------+ start_of_file_table
//! | file table         |   num_files fixed-size records
//! +--------------------+ start_of_packed_files
//! | packed files       |   payloads back to back, in table order
//! +--------------------+
//! ```
//!
//! All integers are little-endian.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{Codec, CodecError};
use crate::integrity;

/// Format marker at offset 0.
pub const MARKER: [u8; 4] = *b"PACK";

/// Header size in bytes: marker, six u32 fields, 8 reserved bytes.
pub const HEADER_SIZE: usize = 36;

/// File-table record size in bytes.
pub const RECORD_SIZE: usize = 28;

/// Compression tag stored in the header (names block) and in each file-table record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum CompressionMethod {
    None = 0,
    Lz4 = 1,
    Lz4Hc = 2,
    /// Raw deflate (RFC 1951).
    Deflate = 3,
}

impl CompressionMethod {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(CompressionMethod::None),
            1 => Some(CompressionMethod::Lz4),
            2 => Some(CompressionMethod::Lz4Hc),
            3 => Some(CompressionMethod::Deflate),
            _ => None,
        }
    }

    pub fn tag(self) -> u32 {
        self as u32
    }
}

/// Decoded archive header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderInfo {
    pub num_files: u32,
    pub names_compressed_size: u32,
    pub names_original_size: u32,
    pub file_table_size: u32,
    pub names_checksum: u32,
    pub file_table_checksum: u32,
    /// Kept in the first four reserved bytes.
    pub names_method: CompressionMethod,
}

impl HeaderInfo {
    /// Header of a zero-entry archive.
    pub fn empty(names_method: CompressionMethod) -> Self {
        Self {
            num_files: 0,
            names_compressed_size: 0,
            names_original_size: 0,
            file_table_size: 0,
            names_checksum: 0,
            file_table_checksum: 0,
            names_method,
        }
    }

    pub fn start_of_names(&self) -> u64 {
        HEADER_SIZE as u64
    }

    pub fn start_of_file_table(&self) -> u64 {
        self.start_of_names() + u64::from(self.names_compressed_size)
    }

    pub fn start_of_packed_files(&self) -> u64 {
        self.start_of_file_table() + u64::from(self.file_table_size)
    }

    /// Bytes a reader needs before it can decode names and table.
    pub fn metadata_len(&self) -> u64 {
        self.start_of_packed_files()
    }

    /// Check the declared layout against the real archive length.
    pub fn validate_total_size(&self, total: u64) -> Result<(), FormatError> {
        if self.start_of_packed_files() > total {
            return Err(FormatError::MalformedHeader(format!(
                "packed files start at {} but archive is {} bytes",
                self.start_of_packed_files(),
                total
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&MARKER);
        let fields = [
            self.num_files,
            self.names_compressed_size,
            self.names_original_size,
            self.file_table_size,
            self.names_checksum,
            self.file_table_checksum,
            self.names_method.tag(),
        ];
        for (i, v) in fields.iter().enumerate() {
            let at = 4 + i * 4;
            out[at..at + 4].copy_from_slice(&v.to_le_bytes());
        }
        out
    }
}

/// One fixed-size file-table record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTableEntry {
    /// Absolute offset of the payload in the archive.
    pub start_offset: u64,
    pub compressed_size: u32,
    pub original_size: u32,
    /// CRC-32 of the compressed payload.
    pub checksum: u32,
    pub method: CompressionMethod,
    pub reserved: u32,
}

impl FileTableEntry {
    pub fn end_offset(&self) -> u64 {
        self.start_offset + u64::from(self.compressed_size)
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.start_offset.to_le_bytes());
        out.extend_from_slice(&self.compressed_size.to_le_bytes());
        out.extend_from_slice(&self.original_size.to_le_bytes());
        out.extend_from_slice(&self.checksum.to_le_bytes());
        out.extend_from_slice(&self.method.tag().to_le_bytes());
        out.extend_from_slice(&self.reserved.to_le_bytes());
    }
}

/// Which part of an archive a checksum covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Names,
    FileTable,
    Entry(usize),
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Section::Names => f.write_str("names block"),
            Section::FileTable => f.write_str("file table"),
            Section::Entry(i) => write!(f, "entry {i}"),
        }
    }
}

/// Decoded metadata of an archive: header, sorted names, table (same order).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackIndex {
    pub header: HeaderInfo,
    pub names: Vec<String>,
    pub entries: Vec<FileTableEntry>,
}

impl PackIndex {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry index by name (names are sorted).
    pub fn find(&self, name: &str) -> Option<usize> {
        self.names
            .binary_search_by(|n| n.as_str().cmp(name))
            .ok()
    }

    pub fn entry(&self, index: usize) -> Option<(&str, &FileTableEntry)> {
        let name = self.names.get(index)?;
        let entry = self.entries.get(index)?;
        Some((name.as_str(), entry))
    }

    /// Size of the packed-files section.
    pub fn packed_size(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| u64::from(e.compressed_size))
            .sum()
    }

    /// Length of the whole archive.
    pub fn total_len(&self) -> u64 {
        self.header.start_of_packed_files() + self.packed_size()
    }
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn le_u64(bytes: &[u8], at: usize) -> u64 {
    u64::from(le_u32(bytes, at)) | (u64::from(le_u32(bytes, at + 4)) << 32)
}

/// Decode and sanity-check the header at the front of `bytes`.
pub fn read_header(bytes: &[u8]) -> Result<HeaderInfo, FormatError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FormatError::TruncatedHeader {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }
    if bytes[0..4] != MARKER {
        return Err(FormatError::MalformedHeader("missing PACK marker".into()));
    }
    let tag = le_u32(bytes, 28);
    let names_method = CompressionMethod::from_u32(tag).ok_or_else(|| {
        FormatError::MalformedHeader(format!("unknown names compression tag {tag}"))
    })?;
    let header = HeaderInfo {
        num_files: le_u32(bytes, 4),
        names_compressed_size: le_u32(bytes, 8),
        names_original_size: le_u32(bytes, 12),
        file_table_size: le_u32(bytes, 16),
        names_checksum: le_u32(bytes, 20),
        file_table_checksum: le_u32(bytes, 24),
        names_method,
    };

    let table_len = u64::from(header.num_files) * RECORD_SIZE as u64;
    if u64::from(header.file_table_size) != table_len {
        return Err(FormatError::MalformedHeader(format!(
            "file table is {} bytes, {} records need {}",
            header.file_table_size, header.num_files, table_len
        )));
    }
    let names_empty = header.names_compressed_size == 0 || header.names_original_size == 0;
    if header.num_files == 0 && (header.names_compressed_size != 0 || header.names_original_size != 0)
    {
        return Err(FormatError::MalformedHeader(
            "empty archive declares a names block".into(),
        ));
    }
    if header.num_files > 0 && names_empty {
        return Err(FormatError::MalformedHeader(format!(
            "{} entries but an empty names block",
            header.num_files
        )));
    }
    Ok(header)
}

/// Decode the fixed-size records. `bytes` is the archive from offset 0.
pub fn read_file_table(
    bytes: &[u8],
    header: &HeaderInfo,
) -> Result<Vec<FileTableEntry>, FormatError> {
    let start = header.start_of_file_table() as usize;
    let count = header.num_files as usize;
    let needed = count * RECORD_SIZE;
    let available = bytes.len().saturating_sub(start);
    if available < needed {
        return Err(FormatError::TruncatedTable { needed, available });
    }

    let mut out = Vec::with_capacity(count);
    let mut expected_start = header.start_of_packed_files();
    for i in 0..count {
        let at = start + i * RECORD_SIZE;
        let tag = le_u32(bytes, at + 20);
        let method = CompressionMethod::from_u32(tag).ok_or_else(|| {
            FormatError::MalformedTable(format!("entry {i}: unknown compression tag {tag}"))
        })?;
        let entry = FileTableEntry {
            start_offset: le_u64(bytes, at),
            compressed_size: le_u32(bytes, at + 8),
            original_size: le_u32(bytes, at + 12),
            checksum: le_u32(bytes, at + 16),
            method,
            reserved: le_u32(bytes, at + 24),
        };
        if entry.start_offset != expected_start {
            return Err(FormatError::MalformedTable(format!(
                "entry {i} starts at {} but the previous payload ends at {expected_start}",
                entry.start_offset
            )));
        }
        expected_start = entry.end_offset();
        out.push(entry);
    }
    Ok(out)
}

/// Decompress the names block and split it into entry names.
pub fn read_names(
    bytes: &[u8],
    header: &HeaderInfo,
    codec: &dyn Codec,
) -> Result<Vec<String>, FormatError> {
    if header.num_files == 0 {
        return Ok(Vec::new());
    }
    let start = header.start_of_names() as usize;
    let needed = header.names_compressed_size as usize;
    let available = bytes.len().saturating_sub(start);
    if available < needed {
        return Err(FormatError::TruncatedNames { needed, available });
    }
    let raw = codec.decompress(
        header.names_method,
        &bytes[start..start + needed],
        header.names_original_size as usize,
    )?;
    parse_names(&raw, header.num_files as usize)
}

fn parse_names(raw: &[u8], expected: usize) -> Result<Vec<String>, FormatError> {
    let body = match raw.split_last() {
        Some((0, body)) => body,
        _ => {
            return Err(FormatError::MalformedNames(
                "names block is not NUL-terminated".into(),
            ))
        }
    };
    let names = body
        .split(|&b| b == 0)
        .map(|s| {
            String::from_utf8(s.to_vec())
                .map_err(|_| FormatError::MalformedNames("entry name is not utf-8".into()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if names.len() != expected {
        return Err(FormatError::NameCountMismatch {
            expected,
            actual: names.len(),
        });
    }
    if names.iter().any(|n| n.is_empty()) {
        return Err(FormatError::MalformedNames("empty entry name".into()));
    }
    if names.windows(2).any(|w| w[0] >= w[1]) {
        return Err(FormatError::MalformedNames("names are not sorted".into()));
    }
    Ok(names)
}

/// Compressed payload of one entry. No decompression happens here.
pub fn extract_entry<'a>(bytes: &'a [u8], entry: &FileTableEntry) -> Result<&'a [u8], FormatError> {
    let start = entry.start_offset as usize;
    let end = start + entry.compressed_size as usize;
    if end > bytes.len() {
        return Err(FormatError::EntryOutOfBounds {
            offset: entry.start_offset,
            size: entry.compressed_size,
            available: bytes.len(),
        });
    }
    Ok(&bytes[start..end])
}

/// Check the names block against its header checksum. Zero-entry archives carry none.
pub fn verify_names_section(bytes: &[u8], header: &HeaderInfo) -> Result<(), FormatError> {
    if header.num_files == 0 {
        return Ok(());
    }
    let start = header.start_of_names() as usize;
    let end = header.start_of_file_table() as usize;
    if bytes.len() < end {
        return Err(FormatError::TruncatedNames {
            needed: end - start,
            available: bytes.len().saturating_sub(start),
        });
    }
    check_section(Section::Names, &bytes[start..end], header.names_checksum)
}

/// Check the file table against its header checksum. Zero-entry archives carry none.
pub fn verify_table_section(bytes: &[u8], header: &HeaderInfo) -> Result<(), FormatError> {
    if header.num_files == 0 {
        return Ok(());
    }
    let start = header.start_of_file_table() as usize;
    let end = header.start_of_packed_files() as usize;
    if bytes.len() < end {
        return Err(FormatError::TruncatedTable {
            needed: end - start,
            available: bytes.len().saturating_sub(start),
        });
    }
    check_section(Section::FileTable, &bytes[start..end], header.file_table_checksum)
}

fn check_section(section: Section, bytes: &[u8], expected: u32) -> Result<(), FormatError> {
    let actual = integrity::compute(bytes);
    if actual != expected {
        return Err(FormatError::SectionChecksum {
            section,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Header, names and table of an archive prefix, with both section checksums verified.
pub fn read_index(bytes: &[u8], codec: &dyn Codec) -> Result<PackIndex, FormatError> {
    let header = read_header(bytes)?;
    verify_names_section(bytes, &header)?;
    verify_table_section(bytes, &header)?;
    let names = read_names(bytes, &header, codec)?;
    let entries = read_file_table(bytes, &header)?;
    Ok(PackIndex {
        header,
        names,
        entries,
    })
}

/// One decoded entry of a whole archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub data: Vec<u8>,
}

/// Decode a complete archive: index, every payload checksum, every payload decompressed.
pub fn decode_archive(bytes: &[u8], codec: &dyn Codec) -> Result<Vec<ArchiveEntry>, FormatError> {
    let index = read_index(bytes, codec)?;
    index.header.validate_total_size(bytes.len() as u64)?;
    let mut out = Vec::with_capacity(index.len());
    for (i, (name, entry)) in index.names.iter().zip(&index.entries).enumerate() {
        let packed = extract_entry(bytes, entry)?;
        check_section(Section::Entry(i), packed, entry.checksum)?;
        let data = codec.decompress(entry.method, packed, entry.original_size as usize)?;
        out.push(ArchiveEntry {
            name: name.clone(),
            data,
        });
    }
    Ok(out)
}

#[derive(Debug, Clone)]
struct PendingEntry {
    data: Vec<u8>,
    method: CompressionMethod,
}

/// Packaging side: collects named files and encodes an archive.
#[derive(Debug, Clone)]
pub struct PackWriter {
    names_method: CompressionMethod,
    entries: BTreeMap<String, PendingEntry>,
}

impl Default for PackWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl PackWriter {
    pub fn new() -> Self {
        Self {
            names_method: CompressionMethod::Lz4Hc,
            entries: BTreeMap::new(),
        }
    }

    /// Compression used for the names block (LZ4HC unless changed).
    pub fn names_method(mut self, method: CompressionMethod) -> Self {
        self.names_method = method;
        self
    }

    /// Add or replace a file. A payload that does not shrink is stored with `None`.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        data: impl Into<Vec<u8>>,
        method: CompressionMethod,
    ) -> &mut Self {
        self.entries.insert(
            name.into(),
            PendingEntry {
                data: data.into(),
                method,
            },
        );
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self, codec: &dyn Codec) -> Result<Vec<u8>, FormatError> {
        if self.entries.is_empty() {
            return Ok(HeaderInfo::empty(self.names_method).encode().to_vec());
        }

        let mut names_raw = Vec::new();
        for name in self.entries.keys() {
            if name.is_empty() || name.as_bytes().contains(&0) {
                return Err(FormatError::MalformedNames(format!(
                    "cannot store entry name {name:?}"
                )));
            }
            names_raw.extend_from_slice(name.as_bytes());
            names_raw.push(0);
        }
        let names_packed = codec.compress(self.names_method, &names_raw)?;

        let mut payloads = Vec::with_capacity(self.entries.len());
        for pending in self.entries.values() {
            let (bytes, method) = match pending.method {
                CompressionMethod::None => (pending.data.clone(), CompressionMethod::None),
                method => {
                    let packed = codec.compress(method, &pending.data)?;
                    if packed.len() < pending.data.len() {
                        (packed, method)
                    } else {
                        (pending.data.clone(), CompressionMethod::None)
                    }
                }
            };
            payloads.push((bytes, method, to_u32(pending.data.len())?));
        }

        let num_files = to_u32(self.entries.len())?;
        let mut header = HeaderInfo {
            num_files,
            names_compressed_size: to_u32(names_packed.len())?,
            names_original_size: to_u32(names_raw.len())?,
            file_table_size: to_u32(self.entries.len() * RECORD_SIZE)?,
            names_checksum: integrity::compute(&names_packed),
            file_table_checksum: 0,
            names_method: self.names_method,
        };

        let mut table = Vec::with_capacity(header.file_table_size as usize);
        let mut offset = header.start_of_packed_files();
        for (bytes, method, original_size) in &payloads {
            let entry = FileTableEntry {
                start_offset: offset,
                compressed_size: to_u32(bytes.len())?,
                original_size: *original_size,
                checksum: integrity::compute(bytes),
                method: *method,
                reserved: 0,
            };
            entry.encode_into(&mut table);
            offset = entry.end_offset();
        }
        header.file_table_checksum = integrity::compute(&table);

        let mut out = Vec::with_capacity(offset as usize);
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&names_packed);
        out.extend_from_slice(&table);
        for (bytes, _, _) in &payloads {
            out.extend_from_slice(bytes);
        }
        Ok(out)
    }
}

fn to_u32(n: usize) -> Result<u32, FormatError> {
    u32::try_from(n).map_err(|_| FormatError::TooLarge)
}

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("header truncated: need {needed} bytes, have {available}")]
    TruncatedHeader { needed: usize, available: usize },
    #[error("malformed header: {0}")]
    MalformedHeader(String),
    #[error("file table truncated: need {needed} bytes, have {available}")]
    TruncatedTable { needed: usize, available: usize },
    #[error("malformed file table: {0}")]
    MalformedTable(String),
    #[error("names block truncated: need {needed} bytes, have {available}")]
    TruncatedNames { needed: usize, available: usize },
    #[error("malformed names block: {0}")]
    MalformedNames(String),
    #[error("names block lists {actual} names, header declares {expected}")]
    NameCountMismatch { expected: usize, actual: usize },
    #[error("entry at {offset} (+{size}) lies outside {available} available bytes")]
    EntryOutOfBounds {
        offset: u64,
        size: u32,
        available: usize,
    },
    #[error("{section} checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    SectionChecksum {
        section: Section,
        expected: u32,
        actual: u32,
    },
    #[error("archive exceeds the 32-bit size fields")]
    TooLarge,
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
}

impl FormatError {
    /// Checksum mismatches may be transfer damage; everything else is a broken archive.
    pub fn is_integrity(&self) -> bool {
        matches!(self, FormatError::SectionChecksum { .. })
    }
}
