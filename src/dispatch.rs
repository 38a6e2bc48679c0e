//! The process-wide exception dispatcher
//!
//! One signal handler, installed once ahead of whatever was there before,
//! claims SIGSEGV and SIGILL for every thread in the process. On each fault
//! it consults the registry by the faulting thread's RIP and either redirects
//! execution (entry into a relocated body, or exit back to the caller) or
//! hands the fault to the previously installed handler untouched.
//!
//! Everything on the fault path is async-signal-safe: registry lookups are
//! an atomic load plus binary search, state changes are atomic
//! compare-exchanges, and the optional cipher is pure arithmetic. No
//! allocation, no locks, no logging.

use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use libc::{c_int, c_void, siginfo_t};
use log::debug;

use crate::registry::{RecordState, REGISTRY};

/// Whether the handler pair is currently installed
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Serializes install/uninstall
static LIFECYCLE: Mutex<()> = Mutex::new(());

/// Previous SIGSEGV disposition, restored at uninstall and used for
/// pass-through. Written only under [`LIFECYCLE`], read by the handler.
static mut OLD_SEGV: MaybeUninit<libc::sigaction> = MaybeUninit::uninit();

/// Previous SIGILL disposition; see [`OLD_SEGV`]
static mut OLD_ILL: MaybeUninit<libc::sigaction> = MaybeUninit::uninit();

/// Installs the dispatcher for the whole process. Idempotent.
pub fn install() {
    let _guard = LIFECYCLE.lock().unwrap();
    if INSTALLED.load(Ordering::Acquire) {
        return;
    }

    unsafe {
        let handler: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) = handler;
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as *const () as usize;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);

        libc::sigaction(libc::SIGSEGV, &action, ptr::addr_of_mut!(OLD_SEGV).cast());
        libc::sigaction(libc::SIGILL, &action, ptr::addr_of_mut!(OLD_ILL).cast());
    }

    INSTALLED.store(true, Ordering::Release);
    debug!("exception dispatcher installed");
}

/// Restores the previous signal dispositions.
///
/// # Safety
///
/// Must not be called while any obfuscated function can still be entered:
/// after uninstall, a call into an overwritten function is an ordinary
/// crash. Callers serialize this with [`crate::registry::Registry::teardown`].
pub unsafe fn uninstall() {
    let _guard = LIFECYCLE.lock().unwrap();
    if !INSTALLED.load(Ordering::Acquire) {
        return;
    }

    libc::sigaction(
        libc::SIGSEGV,
        ptr::addr_of!(OLD_SEGV).cast(),
        ptr::null_mut(),
    );
    libc::sigaction(libc::SIGILL, ptr::addr_of!(OLD_ILL).cast(), ptr::null_mut());

    INSTALLED.store(false, Ordering::Release);
    debug!("exception dispatcher uninstalled");
}

/// Whether the dispatcher is currently installed.
pub fn is_installed() -> bool {
    INSTALLED.load(Ordering::Acquire)
}

/// What the dispatcher decided for one faulting RIP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    /// Redirect the thread into the relocated body
    EnterBody(usize),
    /// The relocated epilogue fired: resume the caller's control flow
    ReturnToCaller(usize),
    /// Not ours; leave the thread context alone
    PassThrough,
}

/// The dispatch decision, separated from signal plumbing so the state
/// machine can be driven directly in tests without real faults.
pub(crate) fn resolve(rip: usize) -> Resolution {
    if let Some(record) = REGISTRY.lookup_by_original(rip) {
        let state = record.state();
        if matches!(state, RecordState::Overwritten | RecordState::Faulted) {
            if let Some(cipher) = record.cipher() {
                // one thread decrypts, racers spin until the bytes are ready
                cipher.ensure_plaintext(unsafe { record.relocated_bytes_mut() });
            }
            // Faulted stays Faulted on reentrant/nested entry
            let _ = record.transition(RecordState::Overwritten, RecordState::Faulted);
            return Resolution::EnterBody(record.relocated_address());
        }
        // A record that is not yet overwritten cannot own this fault
        return Resolution::PassThrough;
    }

    if let Some(record) = REGISTRY.lookup_by_trap(rip) {
        let state = record.state();
        if matches!(state, RecordState::Faulted | RecordState::Overwritten) {
            let exited = record.transition(RecordState::Faulted, RecordState::Overwritten);
            if exited {
                if let Some(cipher) = record.cipher() {
                    if cipher.reencrypt_on_exit() {
                        cipher.seal(unsafe { record.relocated_bytes_mut() });
                    }
                }
            }
            return Resolution::ReturnToCaller(record.return_trampoline());
        }
    }

    Resolution::PassThrough
}

/// The process-wide signal handler.
extern "C" fn handler(signal: c_int, info: *mut siginfo_t, context: *mut c_void) {
    if context.is_null() {
        return;
    }

    let ucontext = unsafe { &mut *(context as *mut libc::ucontext_t) };
    let rip_slot = &mut ucontext.uc_mcontext.gregs[libc::REG_RIP as usize];
    let rip = *rip_slot as usize;

    match resolve(rip) {
        Resolution::EnterBody(target) | Resolution::ReturnToCaller(target) => {
            // returning from the handler resumes the thread at the new RIP
            *rip_slot = target as i64;
        }
        Resolution::PassThrough => unsafe { pass_through(signal, info, context) },
    }
}

/// Delivers an unclaimed fault to whatever handled it before install.
///
/// # Safety
///
/// Must only be called from inside [`handler`].
unsafe fn pass_through(signal: c_int, info: *mut siginfo_t, context: *mut c_void) {
    let old = if signal == libc::SIGSEGV {
        ptr::addr_of!(OLD_SEGV).cast::<libc::sigaction>().read()
    } else {
        ptr::addr_of!(OLD_ILL).cast::<libc::sigaction>().read()
    };

    let previous = old.sa_sigaction;
    if previous == libc::SIG_DFL || previous == libc::SIG_IGN {
        // Reinstate the previous disposition and return; the faulting
        // instruction re-executes and the kernel applies the default
        // behavior, exactly as if we were never installed.
        libc::sigaction(signal, &old, ptr::null_mut());
    } else if old.sa_flags & libc::SA_SIGINFO != 0 {
        let chained: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) =
            std::mem::transmute(previous);
        chained(signal, info, context);
    } else {
        let chained: extern "C" fn(c_int) = std::mem::transmute(previous);
        chained(signal);
    }
}
