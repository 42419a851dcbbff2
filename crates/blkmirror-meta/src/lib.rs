#![warn(missing_docs)]

//! blkmirror metadata subsystem: metadata area layout, metadata block I/O, checksums
//!
//! The replication core persists its activity log and out-of-sync bitmap in
//! a metadata area that lives either at the end of the backing device or on
//! a separate device. This crate describes that area as sector ranges and
//! provides block-granular access to it.

pub mod checksum;
pub mod error;
pub mod io;
pub mod layout;

pub use checksum::{block_crc32c, crc32c, digest, Digest, DigestAlgorithm};
pub use error::{MetaError, MetaResult};
pub use io::{FileMetaIo, MemMetaIo, MetaIo, MetaIoStats};
pub use layout::{
    bitmap_pages_for, MetaLayout, Placement, SectorRange, BM_BITS_PER_PAGE, BM_BLOCK_SIZE,
    DEFAULT_AL_SIZE_4K, MD_BLOCK_SECTORS, MD_BLOCK_SIZE,
};
