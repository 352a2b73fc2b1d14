//! Packing, verification and unpacking of batch archive parts.
//!
//! This crate provides:
//! - [`Packer`]: splits a batch's files into parts under a size ceiling and
//!   writes each part as a tar archive with a SHA-256 checksum.
//! - [`Unpacker`]: optionally verifies every part before writing anything, then
//!   restores files (or a subset) under a target directory.
//! - [`verify_part`]: the checksum check shared by both sides.

mod error;
mod packer;
mod unpacker;

pub use error::PackError;
pub use packer::{PackedPart, Packer, PartPlan};
pub use unpacker::{Unpacker, selects};

use std::path::Path;

use jdma_types::Digest;

/// File name of a packed part inside a staging directory.
pub fn part_file_name(index: u32) -> String {
    format!("part-{index:05}.tar")
}

/// Hash the part at `path` and compare it with `expected`.
pub fn verify_part(path: &Path, index: u32, expected: Digest) -> Result<(), PackError> {
    let actual = Digest::of_file(path)?;
    if actual != expected {
        return Err(PackError::ChecksumMismatch {
            part: index,
            expected,
            actual,
        });
    }
    Ok(())
}
