use std::mem;

/// Store to the never-mapped null page; deterministically raises SIGSEGV
/// with RIP at the instruction (mov dword ptr [0x10], eax)
pub const TRIGGER: [u8; 7] = [0x89, 0x04, 0x25, 0x10, 0x00, 0x00, 0x00];

/// ud2; raises SIGILL. Fallback trigger for regions shorter than [`TRIGGER`]
pub const TRIGGER_SHORT: [u8; 2] = [0x0f, 0x0b];

#[repr(packed)]
#[allow(dead_code)]
/// Struct helper for generating an absolute jump
struct JmpAbs {
    /// Absolute jmp instruction (jmp [rip + 6])
    jmp: [u8; 6],
    /// Absolute address to jump to
    target: usize,
}

/// Generates an absolute jump to a specified address and returns bytecode
pub fn jmp_abs(target: usize) -> [u8; mem::size_of::<JmpAbs>()] {
    unsafe {
        mem::transmute(JmpAbs {
            jmp: [0xff, 0x25, 0x00, 0x00, 0x00, 0x00],
            target,
        })
    }
}

#[repr(packed)]
#[allow(dead_code)]
/// Struct helper for generating an absolute call
struct CallAbs {
    /// Absolute call instruction (call [rip + 2])
    call: [u8; 6],
    /// Short jmp over the target slot, so the callee returns past it
    skip: [u8; 2],
    /// Absolute address to call
    target: usize,
}

/// Generates an absolute call to a specified address and returns bytecode
///
/// The callee's return address points at the embedded short jmp, so control
/// flow falls through past the target slot after the call.
pub fn call_abs(target: usize) -> [u8; mem::size_of::<CallAbs>()] {
    unsafe {
        mem::transmute(CallAbs {
            call: [0xff, 0x15, 0x02, 0x00, 0x00, 0x00],
            skip: [0xeb, 0x08],
            target,
        })
    }
}

#[repr(packed)]
#[allow(dead_code)]
/// Struct helper for generating an absolute conditional jump
struct JccAbs {
    /// Short jcc with the negated condition, hopping over the jmp
    jcc: [u8; 2],
    /// Absolute jmp instruction (jmp [rip + 0])
    jmp: [u8; 6],
    /// Absolute address to jump to when the original condition holds
    target: usize,
}

/// Generates an absolute conditional jump and returns bytecode
///
/// `negated_cc` is the tttn condition field (0x0..=0xF) of the *negated*
/// condition: the short jcc skips the absolute jmp when the original branch
/// would not be taken. Flags and registers are untouched either way.
pub fn jcc_abs(negated_cc: u8, target: usize) -> [u8; mem::size_of::<JccAbs>()] {
    debug_assert!(negated_cc <= 0xf);
    unsafe {
        mem::transmute(JccAbs {
            jcc: [0x70 | negated_cc, 0x0e],
            jmp: [0xff, 0x25, 0x00, 0x00, 0x00, 0x00],
            target,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// jmp_abs embeds the absolute target after the indirect jmp
    fn test_jmp_abs_layout() {
        let code = jmp_abs(0x1122_3344_5566_7788);
        assert_eq!(code.len(), 14);
        assert_eq!(&code[..6], &[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(&code[6..], &0x1122_3344_5566_7788usize.to_le_bytes());
    }

    #[test]
    /// call_abs returns past the embedded target slot
    fn test_call_abs_layout() {
        let code = call_abs(0xAABB_CCDD);
        assert_eq!(code.len(), 16);
        // call [rip + 2] reads the quad at offset 8
        assert_eq!(&code[..6], &[0xff, 0x15, 0x02, 0x00, 0x00, 0x00]);
        // the return address lands on a jmp that skips the quad
        assert_eq!(&code[6..8], &[0xeb, 0x08]);
        assert_eq!(&code[8..], &0xAABB_CCDDusize.to_le_bytes());
    }

    #[test]
    /// jcc_abs skips exactly over its own jmp_abs tail
    fn test_jcc_abs_layout() {
        // negated condition `ne` (0x5) guarding a jump taken on `e`
        let code = jcc_abs(0x5, 0x1000);
        assert_eq!(code.len(), 16);
        assert_eq!(code[0], 0x75);
        // rel8 hops over the 6-byte jmp and 8-byte target
        assert_eq!(code[1] as usize, code.len() - 2);
        assert_eq!(&code[2..8], &[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    /// Triggers decode to the documented encodings
    fn test_trigger_bytes() {
        assert_eq!(TRIGGER.len(), 7);
        assert_eq!(TRIGGER[0], 0x89); // store, not a privileged or serializing opcode
        assert_eq!(TRIGGER_SHORT, [0x0f, 0x0b]); // ud2
    }
}
