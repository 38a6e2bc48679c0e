//! The public obfuscation entry point
//!
//! Ties the pipeline together: scan for the sentinels, relocate the body
//! into executable memory, register the record, then destroy the original
//! bytes. Every step before the overwrite can fail without side effects on
//! the function itself, so an error always leaves the caller with a working,
//! unmodified function.

use log::{debug, info};

use crate::cipher::{CipherConfig, CipherState};
use crate::dispatch;
use crate::error::ShroudError;
use crate::marker;
use crate::overwrite;
use crate::registry;
use crate::relocate;

/// Tuning knobs for [`obfuscate_function_with`].
#[derive(Debug, Clone, Copy)]
pub struct ObfuscateOptions {
    /// How many bytes past the function address to scan for sentinels
    pub scan_limit: usize,
    /// Encrypt the relocated body at rest when set
    pub cipher: Option<CipherConfig>,
}

impl Default for ObfuscateOptions {
    fn default() -> Self {
        ObfuscateOptions {
            scan_limit: 4096,
            cipher: None,
        }
    }
}

/// Obfuscates the marked function at `address` with default options.
///
/// The function must contain a [`mark_start!`](crate::mark_start) and a
/// matching [`mark_end!`](crate::mark_end) sentinel. On return the marked
/// region has been replaced with a fault trigger and decoy bytes, and the
/// relocated body runs via the exception dispatcher.
///
/// # Safety
///
/// `address` must be the entry of a live function containing both sentinels,
/// and no thread may be executing between them during the call.
pub unsafe fn obfuscate_function(address: usize) -> Result<(), ShroudError> {
    obfuscate_function_with(address, ObfuscateOptions::default())
}

/// Obfuscates the marked function at `address` with explicit options.
///
/// # Safety
///
/// Same contract as [`obfuscate_function`].
pub unsafe fn obfuscate_function_with(
    address: usize,
    options: ObfuscateOptions,
) -> Result<(), ShroudError> {
    dispatch::install();

    let region = marker::scan(address, options.scan_limit)?;
    debug!(
        "marked region at {:#x}+{:#x} (scanned from {:#x})",
        region.start,
        region.len,
        address
    );

    // cheap pre-check; register() below is the authoritative one
    if registry::global().is_obfuscated(region.start) {
        return Err(ShroudError::DuplicateRegistration(region.start, region.len));
    }
    // a region too small for any trigger must fail before anything is
    // allocated or registered
    overwrite::trigger_for(region.len)?;

    let mut record = relocate::relocate(&region)?;
    if let Some(config) = options.cipher {
        let cipher = CipherState::new(config, record.relocated_address() as u64);
        cipher.seal(record.relocated_bytes_mut());
        record.set_cipher(cipher);
    }

    let record = registry::global().register(record)?;
    if let Err(err) = overwrite::overwrite(record) {
        // the original bytes are untouched on an overwrite error; back the
        // registration out so the function is not reported as obfuscated
        registry::global().remove(region.start);
        return Err(err);
    }

    info!(
        "obfuscated {:#x}+{:#x} -> {:#x}",
        record.original_address(),
        record.original_extent(),
        record.relocated_address()
    );
    Ok(())
}
