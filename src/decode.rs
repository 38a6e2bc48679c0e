//! Instruction decoding
//!
//! Thin wrapper around `iced-x86` that turns raw bytes into descriptors
//! classifying how each instruction depends on its own address. The decoder
//! never mutates or takes ownership of the bytes it reads; an unrecognized
//! byte pattern is surfaced as a [`ShroudError::DecodeFailure`], never
//! silently skipped.

use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction, OpKind};

use crate::error::ShroudError;

/// How an instruction's encoding depends on its own address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// Position-independent; can be copied verbatim
    Plain,
    /// Near jump (conditional or not) with an IP-relative displacement
    RelativeBranch {
        /// Byte offset of the displacement within the instruction
        offset: usize,
        /// Encoded width of the displacement in bytes
        width: usize,
    },
    /// Near call with an IP-relative displacement
    RelativeCall {
        /// Byte offset of the displacement within the instruction
        offset: usize,
        /// Encoded width of the displacement in bytes
        width: usize,
    },
    /// Memory operand addressed relative to RIP
    RipRelativeMemory {
        /// Byte offset of the displacement within the instruction
        offset: usize,
        /// Encoded width of the displacement in bytes
        width: usize,
    },
}

/// One decoded instruction
pub struct InstructionDescriptor {
    /// Address the instruction was decoded at
    pub address: usize,
    /// Raw encoding
    pub bytes: Vec<u8>,
    /// Address-dependence classification
    pub kind: OperandKind,
    /// Decoded form, used by the relocation engine's re-encoder
    pub(crate) inner: Instruction,
}

impl InstructionDescriptor {
    /// Encoded length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True for a zero-length descriptor (never produced by the reader)
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Lazy, restartable reader over a byte range
///
/// Yields descriptors until the end of the range, or an error for the first
/// position that does not decode.
pub struct InstructionReader<'a> {
    /// Bytes being decoded
    bytes: &'a [u8],
    /// Underlying decoder, IP-tracking
    decoder: Decoder<'a>,
    /// Address of `bytes[0]`
    base: usize,
}

impl<'a> InstructionReader<'a> {
    /// Creates a reader over `bytes`, treating them as located at `address`.
    pub fn new(bytes: &'a [u8], address: usize) -> Self {
        let decoder = Decoder::with_ip(64, bytes, address as u64, DecoderOptions::NONE);
        Self {
            bytes,
            decoder,
            base: address,
        }
    }
}

impl Iterator for InstructionReader<'_> {
    type Item = Result<InstructionDescriptor, ShroudError>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.decoder.can_decode() {
            return None;
        }

        let start = self.decoder.position();
        let instr = self.decoder.decode();
        if instr.is_invalid() {
            return Some(Err(ShroudError::DecodeFailure(self.base + start)));
        }
        let end = self.decoder.position();

        let kind = classify(&self.decoder, &instr);
        Some(Ok(InstructionDescriptor {
            address: self.base + start,
            bytes: self.bytes[start..end].to_vec(),
            kind,
            inner: instr,
        }))
    }
}

/// Classifies an instruction's address dependence.
fn classify(decoder: &Decoder<'_>, instr: &Instruction) -> OperandKind {
    let offsets = decoder.get_constant_offsets(instr);

    let near_branch = matches!(
        instr.op0_kind(),
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
    );
    if near_branch {
        // iced reports a near branch displacement as an immediate
        let offset = offsets.immediate_offset();
        let width = offsets.immediate_size();
        return match instr.flow_control() {
            FlowControl::Call => OperandKind::RelativeCall { offset, width },
            _ => OperandKind::RelativeBranch { offset, width },
        };
    }

    if instr.is_ip_rel_memory_operand() {
        return OperandKind::RipRelativeMemory {
            offset: offsets.displacement_offset(),
            width: offsets.displacement_size(),
        };
    }

    OperandKind::Plain
}

/// Decodes the full byte range `[address, address + len)`.
///
/// Any decode failure aborts the whole walk.
///
/// # Safety
///
/// `address` must be valid for reads of `len` bytes.
pub unsafe fn decode_range(
    address: usize,
    len: usize,
) -> Result<Vec<InstructionDescriptor>, ShroudError> {
    let bytes = std::slice::from_raw_parts(address as *const u8, len);
    InstructionReader::new(bytes, address).collect()
}
