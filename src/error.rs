//! Error types shared across the crate.

use thiserror::Error;

/// Errors produced while preparing a module for profiling or while
/// recording a profile.
///
/// Parse-time errors surface from
/// [`ModuleProfiling::prepare`](crate::ModuleProfiling::prepare) and
/// abort module preparation. Observation-time failures (out-of-bounds
/// guest memory reads, unresolvable symbols) are deliberately *not*
/// represented here: they truncate the affected stack walk or lookup
/// and profiling continues.
#[derive(Error, Debug)]
pub enum Error {
    /// A DWARF custom section required by the symbolizer is absent.
    #[error("dwarf: missing section: {0}")]
    MissingSection(&'static str),

    /// The input ended in the middle of a structure.
    #[error("truncated input at offset {offset}")]
    Truncated {
        /// Byte offset at which more input was expected.
        offset: usize,
    },

    /// A LEB128 integer was malformed or overflowed its target width.
    #[error("invalid LEB128 encoding at offset {offset}")]
    InvalidVarint {
        /// Byte offset of the first byte of the bad encoding.
        offset: usize,
    },

    /// A data segment uses a mode other than mode 0 (active, memory 0,
    /// constant offset).
    #[error("unsupported data segment mode {0:#x}")]
    UnsupportedSegment(u64),

    /// The guest's runtime line table was laid out for a pointer size
    /// other than 8 bytes.
    #[error("unsupported pclntab pointer size {0} (only 64-bit is supported)")]
    UnsupportedPtrSize(u8),

    /// An opcode the code-map parser does not know how to skip.
    #[error("unhandled opcode {0:#04x} in function body")]
    UnknownOpcode(u8),

    /// The runtime line table could not be reconstructed from the data
    /// section.
    #[error("malformed pclntab: {0}")]
    MalformedPclntab(&'static str),

    /// An error reported by the DWARF reader.
    #[error("dwarf: {0}")]
    Dwarf(#[from] gimli::Error),

    /// `start_profile` was called while a profile was already being
    /// recorded.
    #[error("a profile is already being recorded")]
    AlreadyRunning,
}

/// A convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
