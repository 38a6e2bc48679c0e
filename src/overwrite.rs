//! The overwrite writer
//!
//! Destroys a relocated function's original bytes: the trigger instruction
//! goes first, and the rest of the extent is filled with decoy instructions
//! that disassemble plausibly but mean nothing. The patch covers the extent
//! exactly, so an entry point anywhere inside the region hits the trigger or
//! a harmless decoy, never adjacent code.
//!
//! Runs only on records that have fully relocated; this is what makes every
//! failure before it leave the function bit-for-bit intact.

use std::ptr;

use log::debug;
use region::Protection;

use crate::code::x64;
use crate::error::ShroudError;
use crate::registry::{ObfuscationRecord, RecordState};

/// Decoy encodings: real, side-effect-light x86-64 instructions
const DECOYS: &[&[u8]] = &[
    &[0x90],                               // nop
    &[0x66, 0x90],                         // xchg ax, ax
    &[0x48, 0x89, 0xc0],                   // mov rax, rax
    &[0x48, 0x85, 0xdb],                   // test rbx, rbx
    &[0x87, 0xc9],                         // xchg ecx, ecx
    &[0x8d, 0x76, 0x00],                   // lea esi, [rsi]
    &[0x0f, 0x1f, 0x40, 0x00],             // nop dword [rax]
    &[0x0f, 0x1f, 0x44, 0x00, 0x00],       // nop dword [rax+rax]
    &[0x66, 0x0f, 0x1f, 0x44, 0x00, 0x00], // nop word [rax+rax]
];

/// Replaces a `Relocated` function's original bytes with the trigger and
/// decoy filler, then commits the record to `Overwritten`.
///
/// # Safety
///
/// The record's original range must be live code that no thread is currently
/// executing or about to execute.
pub(crate) unsafe fn overwrite(record: &ObfuscationRecord) -> Result<(), ShroudError> {
    let address = record.original_address();
    let extent = record.original_extent();
    let patch = build_patch(address, extent)?;

    {
        let _guard = region::protect_with_handle(
            address as *const u8,
            patch.len(),
            Protection::READ_WRITE_EXECUTE,
        )?;
        ptr::copy(patch.as_ptr(), address as *mut u8, patch.len());
        // guard drop restores the region's previous protections
    }

    let committed = record.transition(RecordState::Relocated, RecordState::Overwritten);
    debug_assert!(committed, "overwrite of a record not in Relocated state");

    debug!("overwrote {:#x}+{:#x} with trigger and decoys", address, extent);
    Ok(())
}

/// Picks the trigger encoding a region of `extent` bytes can hold.
///
/// Doubles as the up-front extent check: callers run it before relocating or
/// registering anything, so a too-small region fails with no side effects.
pub(crate) fn trigger_for(extent: usize) -> Result<&'static [u8], ShroudError> {
    if extent >= x64::TRIGGER.len() {
        Ok(&x64::TRIGGER)
    } else if extent >= x64::TRIGGER_SHORT.len() {
        Ok(&x64::TRIGGER_SHORT)
    } else {
        Err(ShroudError::RegionTooSmall(extent))
    }
}

/// Builds the exact-extent patch: trigger first, decoys after.
fn build_patch(address: usize, extent: usize) -> Result<Vec<u8>, ShroudError> {
    let trigger = trigger_for(extent)?;

    let mut patch = Vec::with_capacity(extent);
    patch.extend_from_slice(trigger);

    let mut rng = Xorshift::new(address as u64);
    while patch.len() < extent {
        let remaining = extent - patch.len();
        let candidate = DECOYS[(rng.next() as usize) % DECOYS.len()];
        if candidate.len() <= remaining {
            patch.extend_from_slice(candidate);
        }
        // a too-long pick retries; single-byte decoys guarantee progress
    }

    debug_assert_eq!(patch.len(), extent);
    Ok(patch)
}

/// Small xorshift generator, seeded from the patch address so the decoy
/// stream is deterministic per function.
struct Xorshift(u64);

impl Xorshift {
    /// Seeds the generator; zero seeds are nudged to a fixed constant.
    fn new(seed: u64) -> Self {
        Xorshift(if seed == 0 { 0x9E37_79B9 } else { seed })
    }

    /// Next pseudo-random value.
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}
