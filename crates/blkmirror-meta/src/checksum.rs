//! Checksums for metadata blocks and block digests for resync.
//!
//! CRC32C protects activity log transactions and other fixed-size metadata
//! blocks. BLAKE3 digests are used to compare data blocks between peers
//! without transferring them.

use serde::{Deserialize, Serialize};
use tracing::trace;

/// Supported digest algorithms for comparing data blocks across peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DigestAlgorithm {
    /// CRC32C, cheap but weak.
    Crc32c,
    /// BLAKE3, truncated to 128 bits on the wire.
    #[default]
    Blake3,
}

impl std::fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DigestAlgorithm::Crc32c => write!(f, "crc32c"),
            DigestAlgorithm::Blake3 => write!(f, "blake3"),
        }
    }
}

/// Digest of one data block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    /// The algorithm used.
    pub algorithm: DigestAlgorithm,
    /// Raw digest bytes.
    pub bytes: Vec<u8>,
}

/// Computes the digest of `data` with the given algorithm.
pub fn digest(algorithm: DigestAlgorithm, data: &[u8]) -> Digest {
    let bytes = match algorithm {
        DigestAlgorithm::Crc32c => crc32c(data).to_be_bytes().to_vec(),
        DigestAlgorithm::Blake3 => blake3::hash(data).as_bytes()[..16].to_vec(),
    };
    trace!(algorithm = %algorithm, size = data.len(), "computed digest");
    Digest { algorithm, bytes }
}

/// Generates the CRC32C lookup table at compile time.
const fn make_crc32c_table() -> [u32; 256] {
    const POLY: u32 = 0x82F63B78;
    let mut table = [0u32; 256];
    let mut i = 0u32;
    while i < 256 {
        let mut crc = i;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ POLY;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i as usize] = crc;
        i += 1;
    }
    table
}

/// CRC32C (Castagnoli) of `data`.
pub fn crc32c(data: &[u8]) -> u32 {
    crc32c_update(!0, data) ^ !0
}

/// Continues a raw CRC32C computation. Start with `!0`, finish with `^ !0`.
pub fn crc32c_update(mut crc: u32, data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = make_crc32c_table();
    for &byte in data {
        let idx = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ TABLE[idx];
    }
    crc
}

/// CRC32C of a block, computed as if the 4 bytes at `field_offset` were zero.
///
/// Metadata blocks embed their own checksum; this is how it is produced and
/// verified.
pub fn block_crc32c(block: &[u8], field_offset: usize) -> u32 {
    let mut crc = crc32c_update(!0, &block[..field_offset]);
    crc = crc32c_update(crc, &[0u8; 4]);
    crc = crc32c_update(crc, &block[field_offset + 4..]);
    crc ^ !0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32c_known_vectors() {
        assert_eq!(crc32c(b""), 0);
        assert_eq!(crc32c(b"123456789"), 0xE3069283);
    }

    #[test]
    fn test_crc32c_update_is_incremental() {
        let whole = crc32c(b"hello world");
        let part = crc32c_update(!0, b"hello ");
        let part = crc32c_update(part, b"world") ^ !0;
        assert_eq!(whole, part);
    }

    #[test]
    fn test_block_crc_ignores_embedded_field() {
        let mut block = vec![0xabu8; 64];
        let before = block_crc32c(&block, 8);
        block[8..12].copy_from_slice(&before.to_be_bytes());
        assert_eq!(block_crc32c(&block, 8), before);
        block[20] = 0;
        assert_ne!(block_crc32c(&block, 8), before);
    }

    #[test]
    fn test_digest_lengths() {
        let d = digest(DigestAlgorithm::Blake3, &[1, 2, 3]);
        assert_eq!(d.bytes.len(), 16);
        let c = digest(DigestAlgorithm::Crc32c, &[1, 2, 3]);
        assert_eq!(c.bytes.len(), 4);
    }

    #[test]
    fn test_digest_detects_difference() {
        let a = digest(DigestAlgorithm::Blake3, &[0u8; 4096]);
        let mut data = [0u8; 4096];
        data[4095] = 1;
        let b = digest(DigestAlgorithm::Blake3, &data);
        assert_ne!(a, b);
        assert_eq!(a, digest(DigestAlgorithm::Blake3, &[0u8; 4096]));
    }
}
