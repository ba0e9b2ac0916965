//! Integrity: CRC-32 over byte ranges, verify on receive, empty-archive sentinels.

use crate::archive::CompressionMethod;

/// CRC-32 of the canonical empty archive whose names block is tagged LZ4HC.
pub const EMPTY_LZ4HC_ARCHIVE_CRC32: u32 = 0xCC51_F5F3;

/// CRC-32 of the canonical empty archive whose names block is tagged Deflate.
pub const EMPTY_DEFLATE_ARCHIVE_CRC32: u32 = 0x00FB_F56D;

/// Checksum a byte range (CRC-32/IEEE).
pub fn compute(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Verify bytes against an expected checksum. Empty input is hashed like any other;
/// callers holding a whole empty archive compare against the sentinel instead.
pub fn verify(bytes: &[u8], expected: u32) -> bool {
    compute(bytes) == expected
}

/// Sentinel for an empty archive written with the given names compression, if one exists.
pub fn empty_archive_checksum(method: CompressionMethod) -> Option<u32> {
    match method {
        CompressionMethod::Lz4Hc => Some(EMPTY_LZ4HC_ARCHIVE_CRC32),
        CompressionMethod::Deflate => Some(EMPTY_DEFLATE_ARCHIVE_CRC32),
        CompressionMethod::None | CompressionMethod::Lz4 => None,
    }
}

/// True when `checksum` names an empty archive, so there is nothing to download or mount.
pub fn is_empty_archive_checksum(checksum: u32) -> bool {
    checksum == EMPTY_LZ4HC_ARCHIVE_CRC32 || checksum == EMPTY_DEFLATE_ARCHIVE_CRC32
}
