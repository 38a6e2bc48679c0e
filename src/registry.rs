//! The obfuscation registry
//!
//! Single source of truth mapping original function ranges to their
//! relocation records. Registration happens at setup time under one lock;
//! lookups happen on every hardware fault, from any thread, including while
//! another thread is registering. Lookups therefore go through an immutable
//! snapshot behind an `AtomicPtr`: a sorted vec plus binary search, nothing
//! that can allocate, block, or deadlock inside a signal handler.

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};
use std::sync::Mutex;

use log::debug;

use crate::alloc::ExecutableMemory;
use crate::cipher::CipherState;
use crate::error::ShroudError;

/// Lifecycle of one obfuscated function
///
/// `Unprotected -> Relocated -> Overwritten` happens once at setup; after
/// that the record oscillates `Overwritten <-> Faulted` on every entry and
/// exit through the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordState {
    /// Freshly built, relocated copy not yet committed
    Unprotected = 0,
    /// Relocated copy complete, original bytes still intact
    Relocated = 1,
    /// Original bytes replaced by the trigger and decoys
    Overwritten = 2,
    /// A thread is currently executing the relocated body
    Faulted = 3,
}

impl RecordState {
    /// Decodes the atomic representation.
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RecordState::Unprotected,
            1 => RecordState::Relocated,
            2 => RecordState::Overwritten,
            _ => RecordState::Faulted,
        }
    }
}

/// Relocation metadata for one obfuscated function
///
/// Owned exclusively by the registry for the lifetime of the process; other
/// components only see references handed out by the lookup methods.
pub struct ObfuscationRecord {
    /// Start of the original marked region; immutable once set
    original_address: usize,
    /// Byte length of the original marked region; immutable once set
    original_extent: usize,
    /// Start of the relocated copy
    relocated_address: usize,
    /// Byte length of the relocated copy, epilogue included
    relocated_extent: usize,
    /// Instruction following the marked region, captured before overwrite
    return_trampoline: usize,
    /// Address of the epilogue trigger inside the relocated copy
    trap_address: usize,
    /// Present only when payload encryption is enabled
    cipher: Option<CipherState>,
    /// Current [`RecordState`]
    state: AtomicU8,
    /// Keeps the relocated pages mapped until teardown
    #[allow(unused)]
    memory: ExecutableMemory,
}

impl ObfuscationRecord {
    /// Builds a record in the `Unprotected` state. The relocation engine
    /// commits it to `Relocated` only after the destination buffer is
    /// completely written.
    pub(crate) fn new(
        original_address: usize,
        original_extent: usize,
        return_trampoline: usize,
        trap_address: usize,
        memory: ExecutableMemory,
    ) -> Self {
        Self {
            original_address,
            original_extent,
            relocated_address: memory.as_ptr() as usize,
            relocated_extent: memory.len(),
            return_trampoline,
            trap_address,
            cipher: None,
            state: AtomicU8::new(RecordState::Unprotected as u8),
            memory,
        }
    }

    /// Attaches cipher state. Only valid before registration.
    pub(crate) fn set_cipher(&mut self, cipher: CipherState) {
        self.cipher = Some(cipher);
    }

    /// Start of the original marked region
    pub fn original_address(&self) -> usize {
        self.original_address
    }

    /// Byte length of the original marked region
    pub fn original_extent(&self) -> usize {
        self.original_extent
    }

    /// Start of the relocated copy
    pub fn relocated_address(&self) -> usize {
        self.relocated_address
    }

    /// Byte length of the relocated copy
    pub fn relocated_extent(&self) -> usize {
        self.relocated_extent
    }

    /// Where the caller's control flow resumes after the body finishes
    pub fn return_trampoline(&self) -> usize {
        self.return_trampoline
    }

    /// The epilogue trigger address inside the relocated copy
    pub fn trap_address(&self) -> usize {
        self.trap_address
    }

    /// Cipher state, if payload encryption is enabled
    pub fn cipher(&self) -> Option<&CipherState> {
        self.cipher.as_ref()
    }

    /// Current state
    pub fn state(&self) -> RecordState {
        RecordState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Attempts the `from -> to` transition; false if another thread moved
    /// the state first.
    pub fn transition(&self, from: RecordState, to: RecordState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The relocated copy as a mutable slice, for in-place cipher work.
    ///
    /// # Safety
    ///
    /// The caller must be the only thread touching the relocated bytes, which
    /// the dispatcher guarantees by claiming the cipher's decrypt flag first.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn relocated_bytes_mut(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.relocated_address as *mut u8, self.relocated_extent)
    }
}

// Manual impl: the memory handle is not Debug, and the raw bytes behind it
// are not worth printing anyway.
impl fmt::Debug for ObfuscationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObfuscationRecord")
            .field(
                "original_address",
                &format_args!("{:#x}", self.original_address),
            )
            .field("original_extent", &self.original_extent)
            .field(
                "relocated_address",
                &format_args!("{:#x}", self.relocated_address),
            )
            .field("relocated_extent", &self.relocated_extent)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// One immutable lookup snapshot
struct Snapshot {
    /// (start, extent, record), sorted by start
    by_original: Vec<(usize, usize, *const ObfuscationRecord)>,
    /// (trap address, record), sorted
    by_trap: Vec<(usize, *const ObfuscationRecord)>,
}

/// The process-wide registry
pub struct Registry {
    /// Owns every record; all registration is serialized through this lock
    records: Mutex<Vec<Box<ObfuscationRecord>>>,
    /// Current lookup snapshot, swapped whole on each registration
    snapshot: AtomicPtr<Snapshot>,
}

/// The process-wide registry instance
pub(crate) static REGISTRY: Registry = Registry::new();

/// The registry the dispatcher consults; the only sanctioned way for user
/// code to query obfuscation metadata.
pub fn global() -> &'static Registry {
    &REGISTRY
}

impl Registry {
    /// Creates an empty registry.
    const fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            snapshot: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Registers a record, failing if its original or relocated range
    /// overlaps any existing registration.
    ///
    /// Serialized under the registration lock; concurrent lookups keep
    /// reading the previous snapshot until the swap.
    pub fn register(&self, record: Box<ObfuscationRecord>) -> Result<&ObfuscationRecord, ShroudError> {
        let mut records = self.records.lock().unwrap();

        let new_ranges = [
            (record.original_address, record.original_extent),
            (record.relocated_address, record.relocated_extent),
        ];
        for existing in records.iter() {
            for (start, extent) in [
                (existing.original_address, existing.original_extent),
                (existing.relocated_address, existing.relocated_extent),
            ] {
                for (new_start, new_extent) in new_ranges {
                    if ranges_overlap(start, extent, new_start, new_extent) {
                        return Err(ShroudError::DuplicateRegistration(
                            record.original_address,
                            record.original_address + record.original_extent,
                        ));
                    }
                }
            }
        }

        debug!(
            "registering {:#x}+{:#x} -> {:#x}+{:#x}",
            record.original_address,
            record.original_extent,
            record.relocated_address,
            record.relocated_extent
        );

        records.push(record);
        let ptr = records.last().unwrap().as_ref() as *const ObfuscationRecord;
        self.publish(&records);
        // Boxed records have stable addresses and live until teardown
        Ok(unsafe { &*ptr })
    }

    /// Rebuilds and swaps in the lookup snapshot. Must be called with the
    /// registration lock held.
    fn publish(&self, records: &[Box<ObfuscationRecord>]) {
        let mut by_original: Vec<_> = records
            .iter()
            .map(|r| (r.original_address, r.original_extent, r.as_ref() as *const _))
            .collect();
        by_original.sort_unstable_by_key(|e| e.0);

        let mut by_trap: Vec<_> = records
            .iter()
            .map(|r| (r.trap_address, r.as_ref() as *const _))
            .collect();
        by_trap.sort_unstable_by_key(|e| e.0);

        let fresh = Box::into_raw(Box::new(Snapshot {
            by_original,
            by_trap,
        }));
        let old = self.snapshot.swap(fresh, Ordering::AcqRel);
        // The dispatcher may still be reading the old snapshot on another
        // thread, so retired snapshots are leaked. Registration is a finite
        // setup-time activity; the leak is bounded by the number of
        // registrations.
        let _ = old;
    }

    /// Removes a record by its original address, dropping its relocated
    /// memory. Used to back out of a registration whose overwrite step
    /// failed; at that point the original bytes are intact and the record
    /// still in `Relocated` state, so no fault can reference it.
    pub(crate) fn remove(&self, original_address: usize) -> bool {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|r| r.original_address != original_address);
        let removed = records.len() != before;
        if removed {
            self.publish(&records);
        }
        removed
    }

    /// Record whose original range contains `address`.
    ///
    /// Signal-safe: one atomic load plus a binary search over the snapshot.
    pub fn lookup_by_original(&self, address: usize) -> Option<&ObfuscationRecord> {
        let snapshot = self.load_snapshot()?;
        let table = &snapshot.by_original;
        let idx = match table.binary_search_by_key(&address, |e| e.0) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let (start, extent, record) = table[idx];
        if address >= start && address < start + extent {
            // Records live until explicit teardown, which is documented as
            // unsafe to run concurrently with lookups
            Some(unsafe { &*record })
        } else {
            None
        }
    }

    /// Record whose relocated epilogue trigger is exactly `address`.
    pub fn lookup_by_trap(&self, address: usize) -> Option<&ObfuscationRecord> {
        let snapshot = self.load_snapshot()?;
        let table = &snapshot.by_trap;
        let idx = table.binary_search_by_key(&address, |e| e.0).ok()?;
        Some(unsafe { &*table[idx].1 })
    }

    /// Whether `address` falls inside any registered original range.
    pub fn is_obfuscated(&self, address: usize) -> bool {
        self.lookup_by_original(address).is_some()
    }

    /// Loads the current snapshot, if any registration has happened.
    fn load_snapshot(&self) -> Option<&Snapshot> {
        let ptr = self.snapshot.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*ptr })
        }
    }

    /// Drops every record and its relocated memory.
    ///
    /// # Safety
    ///
    /// Must not run while any thread might fault into an obfuscated function
    /// or still be executing a relocated body. Callers uninstall the
    /// dispatcher first and serialize teardown themselves.
    pub unsafe fn teardown(&self) {
        let mut records = self.records.lock().unwrap();
        let old = self.snapshot.swap(ptr::null_mut(), Ordering::AcqRel);
        if !old.is_null() {
            drop(Box::from_raw(old));
        }
        records.clear();
    }
}

/// True if `[a, a+a_len)` and `[b, b+b_len)` intersect.
fn ranges_overlap(a: usize, a_len: usize, b: usize, b_len: usize) -> bool {
    a < b + b_len && b < a + a_len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::allocate_executable;

    fn record(original: usize, extent: usize) -> Box<ObfuscationRecord> {
        let memory = allocate_executable(32).unwrap();
        let trap = memory.as_ptr() as usize + memory.len() - 2;
        Box::new(ObfuscationRecord::new(
            original,
            extent,
            original + extent,
            trap,
            memory,
        ))
    }

    #[test]
    /// Register then look up by original address, including interior bytes
    fn test_register_and_lookup() {
        let registry = Registry::new();
        let rec = record(0x10_0000, 0x20);
        let trap = rec.trap_address();
        registry.register(rec).unwrap();

        assert!(registry.lookup_by_original(0x10_0000).is_some());
        assert!(registry.lookup_by_original(0x10_001f).is_some());
        assert!(registry.lookup_by_original(0x10_0020).is_none());
        assert!(registry.lookup_by_original(0x0f_ffff).is_none());

        let found = registry.lookup_by_trap(trap).unwrap();
        assert_eq!(found.original_address(), 0x10_0000);
        assert!(registry.lookup_by_trap(trap + 1).is_none());

        // records render in diagnostics and unwrap messages
        let rendered = format!("{:?}", found);
        assert!(rendered.contains("0x100000"));
        assert!(rendered.contains("Unprotected"));
    }

    #[test]
    /// Overlapping original ranges are rejected and leave the table unchanged
    fn test_duplicate_registration() {
        let registry = Registry::new();
        registry.register(record(0x20_0000, 0x40)).unwrap();

        let err = registry.register(record(0x20_0030, 0x10)).unwrap_err();
        assert!(matches!(err, ShroudError::DuplicateRegistration(..)));

        // exact duplicate
        let err = registry.register(record(0x20_0000, 0x40)).unwrap_err();
        assert!(matches!(err, ShroudError::DuplicateRegistration(..)));

        // the registry still serves the first record
        assert!(registry.is_obfuscated(0x20_0000));
        assert!(!registry.is_obfuscated(0x20_0030 + 0x40));
    }

    #[test]
    /// A removed record stops resolving and frees its range for re-use
    fn test_remove_backs_out_registration() {
        let registry = Registry::new();
        registry.register(record(0x25_0000, 0x20)).unwrap();
        assert!(registry.is_obfuscated(0x25_0000));

        assert!(registry.remove(0x25_0000));
        assert!(!registry.is_obfuscated(0x25_0000));
        assert!(!registry.remove(0x25_0000));

        // the range registers cleanly again
        registry.register(record(0x25_0000, 0x20)).unwrap();
        assert!(registry.is_obfuscated(0x25_0010));
    }

    #[test]
    /// Adjacent, non-overlapping ranges both register
    fn test_adjacent_ranges_ok() {
        let registry = Registry::new();
        registry.register(record(0x30_0000, 0x10)).unwrap();
        registry.register(record(0x30_0010, 0x10)).unwrap();

        assert!(registry.is_obfuscated(0x30_000f));
        assert!(registry.is_obfuscated(0x30_0010));
    }

    #[test]
    /// Drive the state machine exactly as the dispatcher would
    fn test_state_machine() {
        let rec = record(0x40_0000, 0x10);
        assert_eq!(rec.state(), RecordState::Unprotected);

        assert!(rec.transition(RecordState::Unprotected, RecordState::Relocated));
        assert!(rec.transition(RecordState::Relocated, RecordState::Overwritten));

        // entry and exit oscillate
        assert!(rec.transition(RecordState::Overwritten, RecordState::Faulted));
        assert!(rec.transition(RecordState::Faulted, RecordState::Overwritten));
        assert!(rec.transition(RecordState::Overwritten, RecordState::Faulted));

        // illegal transitions are refused without changing state
        assert!(!rec.transition(RecordState::Overwritten, RecordState::Faulted));
        assert!(!rec.transition(RecordState::Unprotected, RecordState::Relocated));
        assert_eq!(rec.state(), RecordState::Faulted);
    }

    #[test]
    /// Lookups from another thread race registration without corruption
    fn test_concurrent_lookup() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let registry = Arc::new(Registry::new());
        let stop = Arc::new(AtomicBool::new(false));

        let reader = {
            let registry = Arc::clone(&registry);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    // must never crash or return a half-built record
                    if let Some(rec) = registry.lookup_by_original(0x50_0000) {
                        assert_eq!(rec.original_address(), 0x50_0000);
                    }
                }
            })
        };

        for i in 0..64usize {
            registry.register(record(0x50_0000 + i * 0x100, 0x10)).unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        reader.join().unwrap();

        assert!(registry.is_obfuscated(0x50_0000));
        assert!(registry.is_obfuscated(0x50_0000 + 63 * 0x100));
    }
}
