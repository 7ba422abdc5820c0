//! Two-pass binary assembler.
//!
//! Pass one lays out byte offsets, using the worst-case 4-byte encoding
//! for every jump and call so offsets never shift afterwards; pass two
//! writes opcodes and resolved operands. Sub-objects are assembled
//! first: their scripts and the object's `data` items are appended after
//! the code in declaration order (sub-objects before data items), which
//! is also the convention behind `dataoffset`/`datasize`.
//!
//! Jump operands are little-endian `i32` offsets relative to the start
//! of the jump instruction. Syscall operands are the first four bytes of
//! the SHA-256 of the service name.

use crate::codegen::CompiledObject;
use crate::ir::{word_to_bytes32, Instruction, LabelId, Op, Operand};
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AssembleError {
    #[error("undefined label L{label}")]
    UndefinedLabel { label: LabelId },

    #[error("duplicate label L{label}")]
    DuplicateLabel { label: LabelId },

    #[error("jump to L{label} does not fit in a 4-byte offset")]
    OffsetTooWide { label: LabelId },

    #[error("push payload of {len} bytes exceeds the PUSHDATA4 range")]
    PayloadTooWide { len: usize },

    #[error("unknown data segment or sub-object \"{name}\"")]
    UnknownBlob { name: String },

    #[error("instruction {op:?} carries an incompatible operand")]
    BadOperand { op: Op },
}

/// One entry of the span → byte offset debug map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugEntry {
    pub offset: u32,
    pub line: u32,
    pub column: u32,
}

/// Result of assembling one object (and, recursively, its children).
#[derive(Debug)]
pub struct Assembled {
    pub name: String,
    /// Code followed by appended blobs.
    pub script: Vec<u8>,
    /// Length of the code part, before blobs.
    pub code_len: usize,
    pub label_offsets: HashMap<LabelId, usize>,
    /// name → (offset, len) of each appended blob.
    pub blobs: Vec<(String, usize, usize)>,
    pub sub_objects: Vec<Assembled>,
    pub debug_map: Vec<DebugEntry>,
}

impl Assembled {
    /// Byte offset of a label, once assembly succeeded.
    pub fn offset_of(&self, label: LabelId) -> Option<u32> {
        self.label_offsets.get(&label).map(|o| *o as u32)
    }
}

// Wire opcodes for the push family; everything else comes from
// `Op::opcode`.
const PUSHINT8: u8 = 0x00;
const PUSHINT16: u8 = 0x01;
const PUSHINT32: u8 = 0x02;
const PUSHINT64: u8 = 0x03;
const PUSHDATA1: u8 = 0x0C;
const PUSHDATA2: u8 = 0x0D;
const PUSHDATA4: u8 = 0x0E;
const PUSH0: u8 = 0x10;

// Short-form bases for slot access (index 0..=6 folds into the opcode).
const LDSFLD0: u8 = 0x58;
const STSFLD0: u8 = 0x60;
const LDLOC0: u8 = 0x68;
const STLOC0: u8 = 0x70;
const LDARG0: u8 = 0x78;
const STARG0: u8 = 0x80;

/// First four bytes of SHA-256 of the service name.
pub fn syscall_id(name: &str) -> [u8; 4] {
    let digest = Sha256::digest(name.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Assembles an object tree, children first.
pub fn assemble(object: &CompiledObject) -> Result<Assembled, Vec<AssembleError>> {
    let mut sub_objects = Vec::new();
    let mut errors = Vec::new();
    for sub in &object.sub_objects {
        match assemble(sub) {
            Ok(assembled) => sub_objects.push(assembled),
            Err(mut errs) => errors.append(&mut errs),
        }
    }
    if !errors.is_empty() {
        return Err(errors);
    }

    // Blob table: sub-object scripts first, then data items.
    let mut blob_bytes: Vec<(String, Vec<u8>)> = sub_objects
        .iter()
        .map(|sub| (sub.name.clone(), sub.script.clone()))
        .collect();
    for (name, payload) in &object.data_items {
        blob_bytes.push((name.clone(), payload.clone()));
    }

    let assembler = Assembler {
        instructions: &object.instructions,
        blob_bytes: &blob_bytes,
    };
    let (script, code_len, label_offsets, blobs, debug_map) = assembler.run()?;

    Ok(Assembled {
        name: object.name.clone(),
        script,
        code_len,
        label_offsets,
        blobs,
        sub_objects,
        debug_map,
    })
}

struct Assembler<'a> {
    instructions: &'a [Instruction],
    blob_bytes: &'a [(String, Vec<u8>)],
}

type Layout = (Vec<usize>, HashMap<LabelId, usize>, usize);

impl Assembler<'_> {
    #[allow(clippy::type_complexity)]
    fn run(
        &self,
    ) -> Result<
        (
            Vec<u8>,
            usize,
            HashMap<LabelId, usize>,
            Vec<(String, usize, usize)>,
            Vec<DebugEntry>,
        ),
        Vec<AssembleError>,
    > {
        let (offsets, labels, code_len) = self.layout()?;

        // Blob offsets are known once the code length is fixed.
        let mut blobs = Vec::new();
        let mut cursor = code_len;
        for (name, bytes) in self.blob_bytes {
            blobs.push((name.clone(), cursor, bytes.len()));
            cursor += bytes.len();
        }

        let mut errors = Vec::new();
        let mut script = Vec::with_capacity(cursor);
        let mut debug_map = Vec::new();

        for (index, instruction) in self.instructions.iter().enumerate() {
            let at = offsets[index];
            if let Some(span) = &instruction.span {
                if !instruction.is_label() {
                    debug_map.push(DebugEntry {
                        offset: at as u32,
                        line: span.line,
                        column: span.column,
                    });
                }
            }
            if let Err(err) = self.encode(instruction, at, &labels, &blobs, &mut script) {
                errors.push(err);
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        debug_assert_eq!(script.len(), code_len);
        for (_, bytes) in self.blob_bytes {
            script.extend_from_slice(bytes);
        }

        Ok((script, code_len, labels, blobs, debug_map))
    }

    /// Pass one: byte offset of each instruction and label.
    fn layout(&self) -> Result<Layout, Vec<AssembleError>> {
        let mut offsets = Vec::with_capacity(self.instructions.len());
        let mut labels: HashMap<LabelId, usize> = HashMap::new();
        let mut errors = Vec::new();
        let mut cursor = 0usize;

        for instruction in self.instructions {
            offsets.push(cursor);
            if let Some(id) = instruction.label_id() {
                if labels.insert(id, cursor).is_some() {
                    errors.push(AssembleError::DuplicateLabel { label: id });
                }
                continue;
            }
            match self.width(instruction) {
                Ok(width) => cursor += width,
                Err(err) => errors.push(err),
            }
        }

        if errors.is_empty() {
            Ok((offsets, labels, cursor))
        } else {
            Err(errors)
        }
    }

    fn blob(&self, name: &str) -> Result<&[u8], AssembleError> {
        self.blob_bytes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, b)| b.as_slice())
            .ok_or_else(|| AssembleError::UnknownBlob {
                name: name.to_string(),
            })
    }

    fn width(&self, instruction: &Instruction) -> Result<usize, AssembleError> {
        Ok(match (&instruction.op, &instruction.operand) {
            (Op::Label, _) => 0,
            (Op::Push, Operand::Word(word)) => push_word_encoding(word).len(),
            (Op::Push, Operand::Bytes(bytes)) => push_data_encoding(bytes)?.len(),
            // Worst-case fixed width; the value is only known after
            // layout completes.
            (Op::Push, Operand::DataOffset(_) | Operand::DataSize(_)) => 5,
            (Op::Push, Operand::DataBlob(name)) => push_data_encoding(self.blob(name)?)?.len(),
            (Op::Push, _) => return Err(AssembleError::BadOperand { op: Op::Push }),
            (Op::Jmp | Op::JmpIf | Op::JmpIfNot | Op::Call, Operand::Target(_)) => 5,
            (Op::Jmp | Op::JmpIf | Op::JmpIfNot | Op::Call, _) => {
                return Err(AssembleError::BadOperand {
                    op: instruction.op,
                })
            }
            (Op::Syscall, Operand::Service(_)) => 5,
            (Op::Syscall, _) => return Err(AssembleError::BadOperand { op: Op::Syscall }),
            (Op::InitSSlot, _) => 2,
            (Op::InitSlot, _) => 3,
            (Op::LdSFld | Op::StSFld | Op::LdLoc | Op::StLoc | Op::LdArg | Op::StArg,
                Operand::Slot(slot)) => {
                if *slot <= 6 {
                    1
                } else {
                    2
                }
            }
            _ => 1,
        })
    }

    fn encode(
        &self,
        instruction: &Instruction,
        at: usize,
        labels: &HashMap<LabelId, usize>,
        blobs: &[(String, usize, usize)],
        out: &mut Vec<u8>,
    ) -> Result<(), AssembleError> {
        match (&instruction.op, &instruction.operand) {
            (Op::Label, _) => {}
            (Op::Push, Operand::Word(word)) => out.extend_from_slice(&push_word_encoding(word)),
            (Op::Push, Operand::Bytes(bytes)) => {
                out.extend_from_slice(&push_data_encoding(bytes)?)
            }
            (Op::Push, Operand::DataOffset(name)) => {
                let (_, offset, _) = blobs
                    .iter()
                    .find(|(n, _, _)| n == name)
                    .ok_or_else(|| AssembleError::UnknownBlob { name: name.clone() })?;
                out.push(PUSHINT32);
                out.extend_from_slice(&(*offset as u32).to_le_bytes());
            }
            (Op::Push, Operand::DataSize(name)) => {
                let (_, _, len) = blobs
                    .iter()
                    .find(|(n, _, _)| n == name)
                    .ok_or_else(|| AssembleError::UnknownBlob { name: name.clone() })?;
                out.push(PUSHINT32);
                out.extend_from_slice(&(*len as u32).to_le_bytes());
            }
            (Op::Push, Operand::DataBlob(name)) => {
                out.extend_from_slice(&push_data_encoding(self.blob(name)?)?)
            }
            (Op::Push, _) => return Err(AssembleError::BadOperand { op: Op::Push }),
            (Op::Jmp | Op::JmpIf | Op::JmpIfNot | Op::Call, Operand::Target(label)) => {
                let target = *labels
                    .get(label)
                    .ok_or(AssembleError::UndefinedLabel { label: *label })?;
                let delta = target as i64 - at as i64;
                let delta = i32::try_from(delta)
                    .map_err(|_| AssembleError::OffsetTooWide { label: *label })?;
                out.push(instruction.op.opcode().expect("fixed opcode"));
                out.extend_from_slice(&delta.to_le_bytes());
            }
            (Op::Syscall, Operand::Service(name)) => {
                out.push(instruction.op.opcode().expect("fixed opcode"));
                out.extend_from_slice(&syscall_id(name));
            }
            (Op::InitSSlot, Operand::Slot(count)) => {
                out.push(instruction.op.opcode().expect("fixed opcode"));
                out.push(*count);
            }
            (Op::InitSlot, Operand::Slots(locals, params)) => {
                out.push(instruction.op.opcode().expect("fixed opcode"));
                out.push(*locals);
                out.push(*params);
            }
            (op @ (Op::LdSFld | Op::StSFld | Op::LdLoc | Op::StLoc | Op::LdArg | Op::StArg),
                Operand::Slot(slot)) => {
                let base = match op {
                    Op::LdSFld => LDSFLD0,
                    Op::StSFld => STSFLD0,
                    Op::LdLoc => LDLOC0,
                    Op::StLoc => STLOC0,
                    Op::LdArg => LDARG0,
                    Op::StArg => STARG0,
                    _ => unreachable!(),
                };
                if *slot <= 6 {
                    out.push(base + slot);
                } else {
                    out.push(op.opcode().expect("fixed opcode"));
                    out.push(*slot);
                }
            }
            (op, Operand::None) => {
                out.push(op.opcode().ok_or(AssembleError::BadOperand { op: *op })?)
            }
            (op, _) => return Err(AssembleError::BadOperand { op: *op }),
        }
        Ok(())
    }
}

/// Tightest encoding of a constant word: PUSH0..PUSH16 for tiny values,
/// PUSHINT8/16/32/64 for anything fitting eight bytes, and PUSHDATA of
/// the 32-byte big-endian word beyond that.
fn push_word_encoding(word: &BigUint) -> Vec<u8> {
    if let Some(value) = word.to_u64() {
        if value <= 16 {
            return vec![PUSH0 + value as u8];
        }
        if value < 1 << 7 {
            return vec![PUSHINT8, value as u8];
        }
        if value < 1 << 15 {
            let mut out = vec![PUSHINT16];
            out.extend_from_slice(&(value as u16).to_le_bytes());
            return out;
        }
        if value < 1 << 31 {
            let mut out = vec![PUSHINT32];
            out.extend_from_slice(&(value as u32).to_le_bytes());
            return out;
        }
        if value < 1 << 63 {
            let mut out = vec![PUSHINT64];
            out.extend_from_slice(&value.to_le_bytes());
            return out;
        }
    }
    let mut out = vec![PUSHDATA1, 32];
    out.extend_from_slice(&word_to_bytes32(word));
    out
}

fn push_data_encoding(bytes: &[u8]) -> Result<Vec<u8>, AssembleError> {
    let mut out;
    match bytes.len() {
        0..=0xFF => {
            out = vec![PUSHDATA1, bytes.len() as u8];
        }
        0x100..=0xFFFF => {
            out = vec![PUSHDATA2];
            out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
        }
        0x1_0000..=0xFFFF_FFFF => {
            out = vec![PUSHDATA4];
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        }
        len => return Err(AssembleError::PayloadTooWide { len }),
    }
    out.extend_from_slice(bytes);
    Ok(out)
}
