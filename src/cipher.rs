//! Optional at-rest encryption for relocated bytes
//!
//! XTEA in counter mode: the keystream XOR is self-inverse and preserves
//! length, so the address fix-ups computed during relocation stay valid.
//! Decryption runs inside the dispatcher on first entry, which means it must
//! be plain arithmetic over an already-writable buffer: no allocation, no
//! syscalls, no locks. Threads racing the first entry spin on an atomic flag
//! instead of taking a lock.

use std::sync::atomic::{AtomicBool, Ordering};

/// Caller-visible cipher settings
#[derive(Debug, Clone, Copy)]
pub struct CipherConfig {
    /// Master key; expanded to the XTEA key schedule per record
    pub key: u64,
    /// Re-encrypt the relocated bytes each time the body finishes.
    ///
    /// Only valid for functions that are never re-entered while a call is in
    /// flight: no recursion, no concurrent callers.
    pub reencrypt: bool,
}

/// Per-record cipher state
pub struct CipherState {
    /// XTEA key schedule
    key: [u32; 4],
    /// CTR nonce; the relocated address, fixed at registration
    nonce: u64,
    /// Whether to re-encrypt on exit
    reencrypt: bool,
    /// True while the relocated bytes are executable plaintext
    plaintext: AtomicBool,
    /// Claimed by the one thread performing the decrypt
    claim: AtomicBool,
}

impl CipherState {
    /// Builds the per-record state. `nonce` must be unique per record; the
    /// registry passes the relocated address. Bytes start out as plaintext
    /// until [`CipherState::seal`] runs at registration.
    pub fn new(config: CipherConfig, nonce: u64) -> Self {
        Self {
            key: derive_key(config.key),
            nonce,
            reencrypt: config.reencrypt,
            plaintext: AtomicBool::new(true),
            claim: AtomicBool::new(true),
        }
    }

    /// XORs the CTR keystream over `data`. Encrypts and decrypts alike.
    pub fn apply(&self, data: &mut [u8]) {
        for (i, chunk) in data.chunks_mut(8).enumerate() {
            let counter = self.nonce.wrapping_add(i as u64);
            let keystream = xtea_encrypt_block(counter, &self.key).to_le_bytes();
            for (b, k) in chunk.iter_mut().zip(keystream) {
                *b ^= k;
            }
        }
    }

    /// Makes `bytes` executable plaintext before the dispatcher redirects
    /// into them. Exactly one thread performs the decrypt; any thread racing
    /// it spins until the bytes are ready.
    pub(crate) fn ensure_plaintext(&self, bytes: &mut [u8]) {
        // The claim is re-attempted on every spin: losing the race against a
        // seal still in flight must end with someone decrypting once the
        // sealer releases the claim, not with this thread waiting on a
        // plaintext flag nobody will set.
        loop {
            if self.plaintext.load(Ordering::Acquire) {
                return;
            }
            if self
                .claim
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
                .is_ok()
            {
                self.apply(bytes);
                self.plaintext.store(true, Ordering::Release);
                return;
            }
            std::hint::spin_loop();
        }
    }

    /// Puts `bytes` back at rest. The caller must guarantee no thread is
    /// executing or entering the region; see [`CipherConfig::reencrypt`].
    pub(crate) fn seal(&self, bytes: &mut [u8]) {
        self.plaintext.store(false, Ordering::Release);
        self.apply(bytes);
        self.claim.store(false, Ordering::Release);
    }

    /// Whether the relocated bytes are currently in decrypted form.
    pub fn is_plaintext(&self) -> bool {
        self.plaintext.load(Ordering::Acquire)
    }

    /// Whether the body should be re-encrypted when it finishes.
    pub fn reencrypt_on_exit(&self) -> bool {
        self.reencrypt
    }
}

/// Splitmix64 finalizer, used to expand the master key.
fn splitmix_finalize(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
    h ^= h >> 33;
    h = h.wrapping_mul(0xC4CE_B9FE_1A85_EC53);
    h ^= h >> 33;
    h
}

/// Derives the XTEA key schedule from a u64 master key.
fn derive_key(master: u64) -> [u32; 4] {
    let lo = splitmix_finalize(master);
    let hi = splitmix_finalize(lo ^ 0x6A09_E667_F3BC_C908);
    let lo = if lo == 0 { 1 } else { lo };
    let hi = if hi == 0 { 1 } else { hi };
    [lo as u32, (lo >> 32) as u32, hi as u32, (hi >> 32) as u32]
}

/// One XTEA block encryption (32 rounds), used as the CTR keystream.
fn xtea_encrypt_block(block: u64, key: &[u32; 4]) -> u64 {
    const DELTA: u32 = 0x9E37_79B9;

    let mut v0 = block as u32;
    let mut v1 = (block >> 32) as u32;
    let mut sum = 0u32;
    for _ in 0..32 {
        v0 = v0.wrapping_add(
            (((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1)) ^ sum.wrapping_add(key[(sum & 3) as usize]),
        );
        sum = sum.wrapping_add(DELTA);
        v1 = v1.wrapping_add(
            (((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0))
                ^ sum.wrapping_add(key[((sum >> 11) & 3) as usize]),
        );
    }
    (v0 as u64) | ((v1 as u64) << 32)
}
