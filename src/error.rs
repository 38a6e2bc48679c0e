//! Error types for every setup-time failure
//!
//! Nothing here is ever raised as a hardware fault: all variants are returned
//! synchronously from [`crate::obfuscate_function`] and its helpers, and on
//! any error the target function's bytes and protections are untouched.

use thiserror::Error;

use crate::alloc::AllocError;

/// Errors that can occur while obfuscating a function
#[derive(Debug, Error)]
pub enum ShroudError {
    /// The start or end sentinel was not found within the scan window
    #[error("marker sentinel not found within {0} scanned bytes")]
    MarkerNotFound(usize),
    /// An instruction in the marked range could not be decoded
    #[error("undecodable instruction at {0:#x}")]
    DecodeFailure(usize),
    /// An address-relative operand could not be re-encoded for the new location
    #[error("no safe re-encoding for instruction at {0:#x}")]
    RelocationOverflow(usize),
    /// Executable memory could not be allocated
    #[error("executable allocation failed: {0}")]
    AllocationFailure(#[from] AllocError),
    /// Page protections could not be changed on the target region
    #[error("protection change failed: {0}")]
    ProtectionFailure(#[from] region::Error),
    /// A record overlapping this address range is already registered
    #[error("address range {0:#x}..{1:#x} overlaps an existing registration")]
    DuplicateRegistration(usize, usize),
    /// The marked region is too small to hold the trigger instruction
    #[error("marked region of {0} bytes is too small to overwrite")]
    RegionTooSmall(usize),
}
