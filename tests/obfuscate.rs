//! End-to-end tests against real machine code.
//!
//! The compiler is free to reorder or duplicate anything between two inline
//! asm sentinels in optimized builds, so these tests do not obfuscate Rust
//! functions. Instead each test assembles a small function by hand into an
//! executable buffer (sentinels included) and calls it through a function
//! pointer, which pins the byte layout these tests depend on.

use std::mem;

use shroud::alloc::allocate_executable;
use shroud::code::x64;
use shroud::error::ShroudError;
use shroud::marker::{END_SENTINEL, SENTINEL_LEN, START_SENTINEL};
use shroud::{obfuscate_function, obfuscate_function_with, CipherConfig, ObfuscateOptions};

type MarkedFn = extern "C" fn(u64) -> u64;

/// Leaks an executable buffer and hands back its address and a writable view.
fn make_buffer(total: usize) -> (usize, &'static mut [u8]) {
    let memory = allocate_executable(total).unwrap();
    let address = memory.as_ptr() as usize;
    mem::forget(memory);
    (address, unsafe {
        std::slice::from_raw_parts_mut(address as *mut u8, total)
    })
}

/// Assembles `start sentinel | body | end sentinel | ret` and returns the
/// function address. The body must leave its result in rax.
fn install_marked(body: &[u8]) -> usize {
    let total = 2 * SENTINEL_LEN + body.len() + 1;
    let (address, buffer) = make_buffer(total);
    buffer[..SENTINEL_LEN].copy_from_slice(&START_SENTINEL);
    buffer[SENTINEL_LEN..SENTINEL_LEN + body.len()].copy_from_slice(body);
    buffer[SENTINEL_LEN + body.len()..total - 1].copy_from_slice(&END_SENTINEL);
    buffer[total - 1] = 0xc3;
    address
}

fn as_fn(address: usize) -> MarkedFn {
    unsafe { mem::transmute(address) }
}

/// mov rax, rdi; add rax, 5
const ADD5: [u8; 7] = [0x48, 0x89, 0xf8, 0x48, 0x83, 0xc0, 0x05];

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_obfuscated_behavior_preserved() {
    init_logging();
    let address = install_marked(&ADD5);
    let f = as_fn(address);
    assert_eq!(f(10), 15);

    unsafe { obfuscate_function(address).unwrap() };

    // the marked region now starts with the trigger, not the old body
    let region = unsafe {
        std::slice::from_raw_parts((address + SENTINEL_LEN) as *const u8, ADD5.len())
    };
    assert_eq!(&region[..x64::TRIGGER.len()], &x64::TRIGGER);

    // behavior is unchanged, across repeated calls
    assert_eq!(f(10), 15);
    assert_eq!(f(0), 5);
    assert_eq!(f(u64::MAX - 5), u64::MAX);
}

#[test]
fn test_obfuscate_twice_is_an_error() {
    init_logging();
    let address = install_marked(&ADD5);
    unsafe { obfuscate_function(address).unwrap() };

    let err = unsafe { obfuscate_function(address).unwrap_err() };
    assert!(matches!(err, ShroudError::DuplicateRegistration(..)));

    // the first obfuscation is still intact
    assert_eq!(as_fn(address)(3), 8);
}

#[test]
fn test_missing_markers() {
    init_logging();
    // a plain ret with no sentinels anywhere near it
    let (address, buffer) = make_buffer(64);
    buffer[0] = 0xc3;

    let err = unsafe {
        obfuscate_function_with(
            address,
            ObfuscateOptions {
                scan_limit: 64,
                cipher: None,
            },
        )
        .unwrap_err()
    };
    assert!(matches!(err, ShroudError::MarkerNotFound(64)));
}

#[test]
fn test_too_small_region_leaves_no_trace() {
    init_logging();
    // a single nop cannot hold either trigger encoding
    let address = install_marked(&[0x90]);
    let region_start = address + SENTINEL_LEN;

    let err = unsafe { obfuscate_function(address).unwrap_err() };
    assert!(matches!(err, ShroudError::RegionTooSmall(1)));

    // the failed attempt is not observable: nothing registered, and a
    // retry reports the same error rather than a duplicate
    assert!(!shroud::registry::global().is_obfuscated(region_start));
    let err = unsafe { obfuscate_function(address).unwrap_err() };
    assert!(matches!(err, ShroudError::RegionTooSmall(1)));

    // the function still runs: the sentinel-wrapped nop was never touched
    let _ = as_fn(address)(0);
}

/// Builds a self-recursive sum body: `f(n) = n + f(n - 1)`, `f(0) = 0`.
///
/// The recursive call goes through the function's own public address, so
/// after obfuscation every level of the recursion re-enters through the
/// trigger and the dispatcher.
fn install_recursive_sum() -> usize {
    let mut body: Vec<u8> = vec![
        0x48, 0x85, 0xff, // test rdi, rdi
        0x74, 0x1a, // je +0x1a (to the xor below)
        0x53, // push rbx
        0x48, 0x89, 0xfb, // mov rbx, rdi
        0x48, 0x8d, 0x7f, 0xff, // lea rdi, [rdi - 1]
        0x48, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, // movabs rax, <self>
        0xff, 0xd0, // call rax
        0x48, 0x01, 0xd8, // add rax, rbx
        0x5b, // pop rbx
        0xeb, 0x02, // jmp past the xor
        0x31, 0xc0, // xor eax, eax
    ];
    let total = 2 * SENTINEL_LEN + body.len() + 1;
    let (address, buffer) = make_buffer(total);
    body[15..23].copy_from_slice(&(address as u64).to_le_bytes());

    buffer[..SENTINEL_LEN].copy_from_slice(&START_SENTINEL);
    buffer[SENTINEL_LEN..SENTINEL_LEN + body.len()].copy_from_slice(&body);
    buffer[SENTINEL_LEN + body.len()..total - 1].copy_from_slice(&END_SENTINEL);
    buffer[total - 1] = 0xc3;
    address
}

#[test]
fn test_obfuscated_recursion() {
    init_logging();
    let address = install_recursive_sum();
    let f = as_fn(address);
    assert_eq!(f(5), 15);

    unsafe { obfuscate_function(address).unwrap() };

    assert_eq!(f(0), 0);
    assert_eq!(f(1), 1);
    assert_eq!(f(5), 15);
    assert_eq!(f(100), 5050);
}

#[test]
fn test_obfuscated_function_calling_obfuscated_function() {
    init_logging();
    let inner = install_marked(&ADD5);

    // movabs rax, <inner>; call rax; add rax, 1
    let mut outer_body: Vec<u8> = vec![
        0x48, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, // movabs rax, <inner>
        0xff, 0xd0, // call rax
        0x48, 0x83, 0xc0, 0x01, // add rax, 1
    ];
    outer_body[2..10].copy_from_slice(&(inner as u64).to_le_bytes());
    let outer = install_marked(&outer_body);

    unsafe {
        obfuscate_function(inner).unwrap();
        obfuscate_function(outer).unwrap();
    }

    assert_eq!(as_fn(inner)(4), 9);
    assert_eq!(as_fn(outer)(4), 10);
}

#[test]
fn test_concurrent_callers() {
    init_logging();
    let a = install_marked(&ADD5);
    // mov rax, rdi; add rax, rax
    let b = install_marked(&[0x48, 0x89, 0xf8, 0x48, 0x01, 0xc0]);
    unsafe {
        obfuscate_function(a).unwrap();
        obfuscate_function(b).unwrap();
    }

    let threads: Vec<_> = (0..4)
        .map(|t| {
            std::thread::spawn(move || {
                let (address, expect): (usize, fn(u64) -> u64) = if t % 2 == 0 {
                    (a, |x| x + 5)
                } else {
                    (b, |x| x * 2)
                };
                let f = as_fn(address);
                for i in 0..1000u64 {
                    assert_eq!(f(i), expect(i));
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }
}

#[test]
fn test_cipher_at_rest() {
    init_logging();
    let address = install_marked(&ADD5);
    let options = ObfuscateOptions {
        scan_limit: 4096,
        cipher: Some(CipherConfig {
            key: 0x5eed_f00d_dead_beef,
            reencrypt: false,
        }),
    };
    unsafe { obfuscate_function_with(address, options).unwrap() };

    let record = shroud::registry::global()
        .lookup_by_original(address + SENTINEL_LEN)
        .unwrap();
    // sealed at rest until the first entry decrypts it
    assert!(!record.cipher().unwrap().is_plaintext());
    let sealed = unsafe {
        std::slice::from_raw_parts(record.relocated_address() as *const u8, ADD5.len())
    };
    assert_ne!(&sealed[..3], &ADD5[..3]);

    let f = as_fn(address);
    assert_eq!(f(7), 12);
    assert!(record.cipher().unwrap().is_plaintext());
    assert_eq!(f(9), 14);
}

#[test]
fn test_cipher_reencrypt_on_exit() {
    init_logging();
    let address = install_marked(&ADD5);
    let options = ObfuscateOptions {
        scan_limit: 4096,
        cipher: Some(CipherConfig {
            key: 0x0123_4567_89ab_cdef,
            reencrypt: true,
        }),
    };
    unsafe { obfuscate_function_with(address, options).unwrap() };

    let record = shroud::registry::global()
        .lookup_by_original(address + SENTINEL_LEN)
        .unwrap();
    let f = as_fn(address);
    assert_eq!(f(1), 6);
    // back at rest after the call completed
    assert!(!record.cipher().unwrap().is_plaintext());
    assert_eq!(f(2), 7);
    assert!(!record.cipher().unwrap().is_plaintext());
}
