//! Marker sentinels and the scanner that locates them
//!
//! A marked region is delimited by two 10-byte sentinels: a 2-byte short
//! `jmp` that hops over an 8-byte magic constant. The `jmp` makes a sentinel
//! harmless if it is ever executed, which matters twice: the start sentinel
//! runs on every call before obfuscation, and the end sentinel is the resume
//! point after a relocated body finishes.

use crate::error::ShroudError;

/// Magic bytes identifying the start of a marked region
const START_MAGIC: [u8; 8] = [0x2e, 0x71, 0xa4, 0x5c, 0x19, 0xe3, 0x87, 0xd0];
/// Magic bytes identifying the end of a marked region
const END_MAGIC: [u8; 8] = [0xd0, 0x87, 0xe3, 0x19, 0x5c, 0xa4, 0x71, 0x2e];
/// Short jmp over the 8 magic bytes
const SKIP_JMP: [u8; 2] = [0xeb, 0x08];

/// Total sentinel length in bytes
pub const SENTINEL_LEN: usize = 10;

/// Complete start sentinel encoding
pub const START_SENTINEL: [u8; SENTINEL_LEN] = [
    SKIP_JMP[0],
    SKIP_JMP[1],
    START_MAGIC[0],
    START_MAGIC[1],
    START_MAGIC[2],
    START_MAGIC[3],
    START_MAGIC[4],
    START_MAGIC[5],
    START_MAGIC[6],
    START_MAGIC[7],
];

/// Complete end sentinel encoding
pub const END_SENTINEL: [u8; SENTINEL_LEN] = [
    SKIP_JMP[0],
    SKIP_JMP[1],
    END_MAGIC[0],
    END_MAGIC[1],
    END_MAGIC[2],
    END_MAGIC[3],
    END_MAGIC[4],
    END_MAGIC[5],
    END_MAGIC[6],
    END_MAGIC[7],
];

/// Emits the start-of-region sentinel at the current code position.
///
/// Everything between `mark_start!()` and `mark_end!()` in the same function
/// body becomes the region that [`crate::obfuscate_function`] relocates. The
/// surrounding function must not be inlined and the compiler must not move
/// code across the markers; use `#[inline(never)]` and keep the marked body
/// free of early returns.
#[macro_export]
macro_rules! mark_start {
    () => {
        unsafe {
            ::core::arch::asm!(
                ".byte 0xEB, 0x08, 0x2E, 0x71, 0xA4, 0x5C, 0x19, 0xE3, 0x87, 0xD0",
                options(nostack)
            )
        }
    };
}

/// Emits the end-of-region sentinel at the current code position.
///
/// See [`mark_start!`].
#[macro_export]
macro_rules! mark_end {
    () => {
        unsafe {
            ::core::arch::asm!(
                ".byte 0xEB, 0x08, 0xD0, 0x87, 0xE3, 0x19, 0x5C, 0xA4, 0x71, 0x2E",
                options(nostack)
            )
        }
    };
}

/// A located marked region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkedRegion {
    /// First byte after the start sentinel
    pub start: usize,
    /// Length of the region, up to the end sentinel
    pub len: usize,
    /// Address of the end sentinel, where the caller's control flow resumes
    pub trampoline: usize,
}

/// Scans `[address, address + limit)` for a start and end sentinel pair.
///
/// # Safety
///
/// `address` must be valid for reads of `limit` bytes.
pub unsafe fn scan(address: usize, limit: usize) -> Result<MarkedRegion, ShroudError> {
    let window = std::slice::from_raw_parts(address as *const u8, limit);
    scan_window(window, address).ok_or(ShroudError::MarkerNotFound(limit))
}

/// Sentinel search over an in-memory window. Separated out so tests can run
/// against synthetic buffers.
fn scan_window(window: &[u8], base: usize) -> Option<MarkedRegion> {
    let start_pos = find(window, &START_SENTINEL)?;
    let body = start_pos + SENTINEL_LEN;
    let end_pos = body + find(&window[body..], &END_SENTINEL)?;

    Some(MarkedRegion {
        start: base + body,
        len: end_pos - body,
        trampoline: base + end_pos,
    })
}

/// First occurrence of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
