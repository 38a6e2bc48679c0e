//! The relocation engine
//!
//! Copies a marked region's instructions into a freshly allocated executable
//! buffer, rewriting every operand whose meaning depends on its own address.
//! The destination stream is built completely (epilogue included) before
//! anything else happens to the original bytes; on any error the buffer is
//! released and nothing observable has changed.
//!
//! Branches and calls that stay inside the region are remapped to their new
//! instruction addresses. Targets outside the region keep their absolute
//! address: IP-relative forms are re-encoded when the displacement still
//! fits, and substituted with an equivalent absolute sequence (see
//! [`crate::code::x64`]) when it does not. An instruction with no safe
//! substitution aborts the whole relocation.

use std::collections::HashMap;

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, ConditionCode, Instruction, InstructionBlock, Mnemonic,
};
use log::{debug, trace};

use crate::alloc;
use crate::code::x64;
use crate::decode::{self, InstructionDescriptor, OperandKind};
use crate::error::ShroudError;
use crate::marker::MarkedRegion;
use crate::registry::{ObfuscationRecord, RecordState};

/// Worst-case destination bytes per instruction: the 16-byte absolute
/// call/jcc substitutions dominate the 15-byte maximum encoding length.
const MAX_RELOCATED_INSTR_LEN: usize = 16;

/// Displacement budget for keeping an IP-relative form. Leaves headroom
/// under i32 range for the instruction length itself.
const REACHABLE: i64 = 0x7fff_0000;

/// Relocates a marked region into fresh executable memory.
///
/// On success the returned record is in the [`RecordState::Relocated`] state
/// and the destination buffer holds the rewritten body followed by the trap
/// epilogue. The original bytes have not been touched.
///
/// # Safety
///
/// The region must describe live, readable code.
pub unsafe fn relocate(region: &MarkedRegion) -> Result<Box<ObfuscationRecord>, ShroudError> {
    // Decode the whole range up front; a single unrecognized instruction
    // aborts before any allocation.
    let instructions = decode::decode_range(region.start, region.len)?;

    let capacity = instructions.len() * MAX_RELOCATED_INSTR_LEN + x64::TRIGGER.len();
    let mut memory = alloc::allocate_executable(capacity.max(x64::TRIGGER.len()))?;
    let dest = memory.as_ptr() as usize;

    let chunks = rewrite(region, &instructions, dest)?;

    // Two-phase commit: the buffer is fully assembled here, and only the
    // overwrite writer (which runs after registration) touches the original.
    let mut cursor = 0;
    for chunk in &chunks {
        memory[cursor..cursor + chunk.len()].copy_from_slice(chunk);
        cursor += chunk.len();
    }
    let trap = dest + cursor;
    memory[cursor..cursor + x64::TRIGGER.len()].copy_from_slice(&x64::TRIGGER);

    debug!(
        "relocated {:#x}+{:#x} to {:#x} ({} instructions, {} bytes)",
        region.start,
        region.len,
        dest,
        instructions.len(),
        cursor + x64::TRIGGER.len()
    );

    let record = ObfuscationRecord::new(region.start, region.len, region.trampoline, trap, memory);
    record.transition(RecordState::Unprotected, RecordState::Relocated);
    Ok(Box::new(record))
}

/// Produces one destination byte chunk per source instruction.
///
/// Instruction lengths can grow while rewriting (short jcc to near jcc, near
/// call to an absolute sequence), which shifts every later destination
/// address and can in turn change intra-region branch encodings. The layout
/// is iterated to a fixed point; chunk sizes only ever grow (shorter
/// re-encodings are nop-padded to their previously assumed size), so the
/// iteration terminates.
fn rewrite(
    region: &MarkedRegion,
    instructions: &[InstructionDescriptor],
    dest: usize,
) -> Result<Vec<Vec<u8>>, ShroudError> {
    let index_by_addr: HashMap<usize, usize> = instructions
        .iter()
        .enumerate()
        .map(|(i, d)| (d.address, i))
        .collect();

    let mut lens: Vec<usize> = instructions.iter().map(|d| d.len()).collect();

    // Every pass can grow each chunk at most to MAX_RELOCATED_INSTR_LEN, so
    // the fixed point arrives well within this bound.
    for _ in 0..instructions.len() + 2 {
        let mut addrs = Vec::with_capacity(instructions.len());
        let mut cursor = dest;
        for len in &lens {
            addrs.push(cursor);
            cursor += len;
        }

        let mut chunks = Vec::with_capacity(instructions.len());
        let mut stable = true;
        for (i, descriptor) in instructions.iter().enumerate() {
            let mut chunk =
                rewrite_instruction(descriptor, addrs[i], region, &index_by_addr, &addrs)?;
            if chunk.len() > lens[i] {
                lens[i] = chunk.len();
                stable = false;
            } else {
                // pad shorter re-encodings so earlier layout stays valid
                chunk.resize(lens[i], 0x90);
            }
            chunks.push(chunk);
        }

        if stable {
            return Ok(chunks);
        }
        trace!("relocation layout moved, re-running fixups");
    }

    Err(ShroudError::RelocationOverflow(region.start))
}

/// Rewrites a single instruction for placement at `address`.
fn rewrite_instruction(
    descriptor: &InstructionDescriptor,
    address: usize,
    region: &MarkedRegion,
    index_by_addr: &HashMap<usize, usize>,
    addrs: &[usize],
) -> Result<Vec<u8>, ShroudError> {
    let in_region = |target: usize| target >= region.start && target < region.start + region.len;

    match descriptor.kind {
        // Position-independent bytes move verbatim.
        OperandKind::Plain => Ok(descriptor.bytes.clone()),

        OperandKind::RipRelativeMemory { .. } => {
            let target = descriptor.inner.ip_rel_memory_address() as usize;
            if in_region(target) {
                // The referenced bytes are themselves about to be destroyed;
                // there is no safe rewrite for data embedded in the region.
                return Err(ShroudError::RelocationOverflow(descriptor.address));
            }
            if !reachable(address, target) {
                // Widening a RIP-relative memory operand would need a scratch
                // register, which cannot be proven free here. Fail closed.
                return Err(ShroudError::RelocationOverflow(descriptor.address));
            }
            encode_at(&descriptor.inner, address, descriptor.address)
        }

        OperandKind::RelativeBranch { .. } | OperandKind::RelativeCall { .. } => {
            let target = descriptor.inner.near_branch_target() as usize;

            if in_region(target) {
                // Remap to the destination copy of the target instruction.
                // A branch into the middle of an instruction has no
                // relocatable meaning.
                let j = *index_by_addr
                    .get(&target)
                    .ok_or(ShroudError::RelocationOverflow(descriptor.address))?;
                let mut instr = descriptor.inner;
                instr.set_near_branch64(addrs[j] as u64);
                return encode_at(&instr, address, descriptor.address);
            }

            if reachable(address, target) {
                // iced re-derives the displacement (widening short forms to
                // near forms as needed) from the absolute target.
                return encode_at(&descriptor.inner, address, descriptor.address);
            }

            substitute_absolute(descriptor, target)
        }
    }
}

/// Builds an equivalent absolute-target sequence for a branch or call whose
/// IP-relative displacement cannot span the relocation distance.
fn substitute_absolute(
    descriptor: &InstructionDescriptor,
    target: usize,
) -> Result<Vec<u8>, ShroudError> {
    if matches!(descriptor.kind, OperandKind::RelativeCall { .. }) {
        return Ok(x64::call_abs(target).to_vec());
    }
    if descriptor.inner.mnemonic() == Mnemonic::Jmp {
        return Ok(x64::jmp_abs(target).to_vec());
    }
    // Conditional branch: hop over an absolute jmp with the negated
    // condition. jrcxz/loopcc have no negatable condition field and cannot
    // be substituted this way.
    match condition_bits(descriptor.inner.condition_code()) {
        Some(cc) => Ok(x64::jcc_abs(cc ^ 1, target).to_vec()),
        None => Err(ShroudError::RelocationOverflow(descriptor.address)),
    }
}

/// Re-encodes one instruction at a new address, letting iced fix up the
/// IP-relative displacement. `origin` is only used for error reporting.
fn encode_at(instr: &Instruction, address: usize, origin: usize) -> Result<Vec<u8>, ShroudError> {
    let block = InstructionBlock::new(std::slice::from_ref(instr), address as u64);
    BlockEncoder::encode(64, block, BlockEncoderOptions::NONE)
        .map(|result| result.code_buffer)
        .map_err(|_| ShroudError::RelocationOverflow(origin))
}

/// Whether an IP-relative displacement from `address` can span to `target`.
fn reachable(address: usize, target: usize) -> bool {
    let delta = (target as i64).wrapping_sub(address as i64);
    (-REACHABLE..=REACHABLE).contains(&delta)
}

/// The tttn condition field for an iced condition code, if the instruction
/// has one.
fn condition_bits(cc: ConditionCode) -> Option<u8> {
    match cc {
        ConditionCode::None => None,
        ConditionCode::o => Some(0x0),
        ConditionCode::no => Some(0x1),
        ConditionCode::b => Some(0x2),
        ConditionCode::ae => Some(0x3),
        ConditionCode::e => Some(0x4),
        ConditionCode::ne => Some(0x5),
        ConditionCode::be => Some(0x6),
        ConditionCode::a => Some(0x7),
        ConditionCode::s => Some(0x8),
        ConditionCode::ns => Some(0x9),
        ConditionCode::p => Some(0xa),
        ConditionCode::np => Some(0xb),
        ConditionCode::l => Some(0xc),
        ConditionCode::ge => Some(0xd),
        ConditionCode::le => Some(0xe),
        ConditionCode::g => Some(0xf),
    }
}
