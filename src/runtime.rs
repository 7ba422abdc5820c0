//! Runtime support library emitted into every contract.
//!
//! NeoVM has no EVM-style linear memory, no 256-bit wrapping arithmetic
//! and no calldata register, so the generated code links against a fixed
//! set of helper routines built here, one instruction at a time. Each
//! helper is a regular function in the contract's calling convention
//! (args on the evaluation stack, `INITSLOT`, result left on the stack)
//! with a stable label recorded in the function table. Helpers are
//! deduplicated: a body is emitted once no matter how many sites call it.
//!
//! Bridge conventions live here as well: static slot layout, system
//! service names, and the byte-array word encoding used for storage keys.

use crate::ir::{
    word_max, FunctionEntry, FunctionTable, Instruction, LabelGen, LabelId, Op, Operand,
};
use num_bigint::BigUint;
use num_traits::One;
use std::collections::BTreeSet;

/// Static slot layout installed by the entry stub.
pub const MEM_SLOT: u8 = 0;
pub const CALLDATA_SLOT: u8 = 1;
pub const MSIZE_SLOT: u8 = 2;
pub const RETDATA_SLOT: u8 = 3;
pub const STATIC_SLOTS: u8 = 4;

/// System services the generated code may invoke.
pub mod services {
    pub const STORAGE_GET_CONTEXT: &str = "System.Storage.GetContext";
    pub const STORAGE_GET: &str = "System.Storage.Get";
    pub const STORAGE_PUT: &str = "System.Storage.Put";
    pub const KECCAK256: &str = "System.Crypto.Keccak256";
    pub const NOTIFY: &str = "System.Runtime.Notify";
    pub const EXIT: &str = "System.Runtime.Exit";
    pub const CONTRACT_CALL: &str = "System.Contract.Call";
    pub const CALLING_SCRIPT_HASH: &str = "System.Runtime.GetCallingScriptHash";
    pub const EXECUTING_SCRIPT_HASH: &str = "System.Runtime.GetExecutingScriptHash";
    pub const ENTRY_SCRIPT_HASH: &str = "System.Runtime.GetEntryScriptHash";
    pub const TIME: &str = "System.Runtime.GetTime";
    pub const NETWORK: &str = "System.Runtime.GetNetwork";
    pub const BLOCK_HEIGHT: &str = "System.Blockchain.GetHeight";
    pub const GAS_LEFT: &str = "System.Runtime.GasLeft";
    pub const EXEC_FEE_FACTOR: &str = "System.Runtime.GetExecFeeFactor";
}

/// Method name used when calling into another contract's dispatcher.
pub const ENTRY_METHOD: &str = "main";

/// All helper routines the library can provide.
#[derive(Debug, Clone, Copy)]
pub struct HelperDef {
    pub name: &'static str,
    pub params: usize,
    pub returns: usize,
    pub locals: usize,
}

const fn h(name: &'static str, params: usize, returns: usize, locals: usize) -> HelperDef {
    HelperDef {
        name,
        params,
        returns,
        locals,
    }
}

pub static HELPERS: &[HelperDef] = &[
    h("__mgrow", 1, 0, 0),
    h("__mstore", 2, 0, 1),
    h("__mstore8", 2, 0, 0),
    h("__mload", 1, 1, 2),
    h("__mslice", 2, 1, 2),
    h("__mwrite", 2, 0, 1),
    h("__mwriten", 3, 0, 1),
    h("__cdload", 1, 1, 3),
    h("__cdslice", 2, 1, 2),
    h("__rdslice", 2, 1, 2),
    h("__w2b", 1, 1, 2),
    h("__b2w", 1, 1, 2),
    h("__sload", 1, 1, 0),
    h("__sstore", 2, 0, 0),
    h("__keccak", 2, 1, 0),
    h("__return", 2, 0, 0),
    h("__revert", 2, 0, 0),
    h("__log0", 2, 0, 1),
    h("__log1", 3, 0, 1),
    h("__log2", 4, 0, 1),
    h("__log3", 5, 0, 1),
    h("__log4", 6, 0, 1),
    h("__extcall", 5, 1, 1),
    h("__exp", 2, 1, 3),
    h("__signed", 1, 1, 0),
    h("__unsigned", 1, 1, 0),
    h("__sdiv", 2, 1, 0),
    h("__smod", 2, 1, 0),
    h("__sar", 2, 1, 0),
    h("__signext", 2, 1, 2),
    h("__byte", 2, 1, 0),
];

fn helper_def(name: &str) -> Option<&'static HelperDef> {
    HELPERS.iter().find(|def| def.name == name)
}

/// 2^255, used to wrap between signed and unsigned word views without
/// materializing 2^256 (which is one bit too wide for a word push).
fn half_modulus() -> BigUint {
    BigUint::one() << 255u32
}

/// Tracks which helpers a compilation actually uses.
#[derive(Debug, Default)]
pub struct RuntimeLibrary {
    used: BTreeSet<&'static str>,
}

impl RuntimeLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves a helper name to its entry label, registering it in the
    /// function table on first use.
    pub fn require(
        &mut self,
        name: &str,
        table: &mut FunctionTable,
        labels: &mut LabelGen,
    ) -> LabelId {
        let def = helper_def(name)
            .unwrap_or_else(|| panic!("unknown runtime helper '{name}'"));
        self.used.insert(def.name);
        if let Some(entry) = table.get(def.name) {
            return entry.entry;
        }
        let label = labels.fresh();
        table.insert(
            def.name.to_string(),
            FunctionEntry {
                entry: label,
                params: def.params,
                returns: def.returns,
                locals: def.locals,
                emitted: false,
                is_helper: true,
            },
        );
        label
    }

    /// Emits bodies for every used helper, following transitive helper
    /// dependencies to a fixpoint. Bodies come out in name order, so the
    /// library section is deterministic.
    pub fn emit_bodies(
        &mut self,
        table: &mut FunctionTable,
        labels: &mut LabelGen,
    ) -> Vec<Instruction> {
        let mut out = Vec::new();
        loop {
            let pending: Vec<&'static str> = self
                .used
                .iter()
                .copied()
                .filter(|name| table.get(*name).map(|e| !e.emitted).unwrap_or(false))
                .collect();
            if pending.is_empty() {
                break;
            }
            for name in pending {
                let entry_label = table[name].entry;
                let def = helper_def(name).expect("registered helper");
                {
                    let mut asm = HelperAsm {
                        out: &mut out,
                        labels,
                        table,
                        lib_used: &mut self.used,
                    };
                    asm.label(entry_label);
                    asm.op(
                        Op::InitSlot,
                        Operand::Slots(def.locals as u8, def.params as u8),
                    );
                    emit_helper_body(name, &mut asm);
                }
                table.get_mut(name).expect("registered helper").emitted = true;
            }
        }
        out
    }
}

/// Small emission facade handed to the helper body builders.
struct HelperAsm<'a> {
    out: &'a mut Vec<Instruction>,
    labels: &'a mut LabelGen,
    table: &'a mut FunctionTable,
    lib_used: &'a mut BTreeSet<&'static str>,
}

impl HelperAsm<'_> {
    fn op(&mut self, op: Op, operand: Operand) {
        self.out.push(Instruction::with(op, operand));
    }

    fn simple(&mut self, op: Op) {
        self.out.push(Instruction::new(op));
    }

    fn push(&mut self, value: u64) {
        self.out.push(Instruction::push_small(value));
    }

    fn push_word(&mut self, word: BigUint) {
        self.out.push(Instruction::push_word(word));
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        self.out.push(Instruction::push_bytes(bytes.to_vec()));
    }

    fn fresh(&mut self) -> LabelId {
        self.labels.fresh()
    }

    fn label(&mut self, id: LabelId) {
        self.out.push(Instruction::label(id));
    }

    fn jump(&mut self, op: Op, target: LabelId) {
        self.out.push(Instruction::jump(op, target));
    }

    fn syscall(&mut self, service: &str) {
        self.out.push(Instruction::syscall(service));
    }

    fn ldarg(&mut self, index: u8) {
        self.op(Op::LdArg, Operand::Slot(index));
    }

    fn starg(&mut self, index: u8) {
        self.op(Op::StArg, Operand::Slot(index));
    }

    fn ldloc(&mut self, index: u8) {
        self.op(Op::LdLoc, Operand::Slot(index));
    }

    fn stloc(&mut self, index: u8) {
        self.op(Op::StLoc, Operand::Slot(index));
    }

    fn ldsfld(&mut self, index: u8) {
        self.op(Op::LdSFld, Operand::Slot(index));
    }

    fn stsfld(&mut self, index: u8) {
        self.op(Op::StSFld, Operand::Slot(index));
    }

    /// Emits a call to a sibling helper, registering it for emission.
    fn call(&mut self, name: &'static str) {
        let def = helper_def(name).expect("known helper");
        self.lib_used.insert(def.name);
        let label = if let Some(entry) = self.table.get(def.name) {
            entry.entry
        } else {
            let label = self.labels.fresh();
            self.table.insert(
                def.name.to_string(),
                FunctionEntry {
                    entry: label,
                    params: def.params,
                    returns: def.returns,
                    locals: def.locals,
                    emitted: false,
                    is_helper: true,
                },
            );
            label
        };
        self.jump(Op::Call, label);
    }
}

fn emit_helper_body(name: &str, asm: &mut HelperAsm<'_>) {
    match name {
        "__mgrow" => emit_mgrow(asm),
        "__mstore" => emit_mstore(asm),
        "__mstore8" => emit_mstore8(asm),
        "__mload" => emit_mload(asm),
        "__mslice" => emit_mslice(asm),
        "__mwrite" => emit_mwrite(asm),
        "__mwriten" => emit_mwriten(asm),
        "__cdload" => emit_cdload(asm),
        "__cdslice" => emit_buffer_slice(asm, CALLDATA_SLOT),
        "__rdslice" => emit_buffer_slice(asm, RETDATA_SLOT),
        "__w2b" => emit_w2b(asm),
        "__b2w" => emit_b2w(asm),
        "__sload" => emit_sload(asm),
        "__sstore" => emit_sstore(asm),
        "__keccak" => emit_keccak(asm),
        "__return" => emit_return(asm),
        "__revert" => emit_revert(asm),
        "__log0" => emit_log(asm, 0),
        "__log1" => emit_log(asm, 1),
        "__log2" => emit_log(asm, 2),
        "__log3" => emit_log(asm, 3),
        "__log4" => emit_log(asm, 4),
        "__extcall" => emit_extcall(asm),
        "__exp" => emit_exp(asm),
        "__signed" => emit_signed(asm),
        "__unsigned" => emit_unsigned(asm),
        "__sdiv" => emit_sdiv(asm),
        "__smod" => emit_smod(asm),
        "__sar" => emit_sar(asm),
        "__signext" => emit_signext(asm),
        "__byte" => emit_byte(asm),
        other => unreachable!("no body builder for helper '{other}'"),
    }
}

/// `__mgrow(size)`: append zero bytes until the memory array holds at
/// least `size` entries, and raise the high-water mark.
fn emit_mgrow(asm: &mut HelperAsm<'_>) {
    let l_loop = asm.fresh();
    let l_end = asm.fresh();
    asm.label(l_loop);
    asm.ldsfld(MEM_SLOT);
    asm.simple(Op::Size);
    asm.ldarg(0);
    asm.simple(Op::Lt);
    asm.jump(Op::JmpIfNot, l_end);
    asm.ldsfld(MEM_SLOT);
    asm.push(0);
    asm.simple(Op::Append);
    asm.jump(Op::Jmp, l_loop);
    asm.label(l_end);
    asm.ldsfld(MSIZE_SLOT);
    asm.ldarg(0);
    asm.simple(Op::Max);
    asm.stsfld(MSIZE_SLOT);
    asm.simple(Op::Ret);
}

/// `__mstore(off, val)`: big-endian store of a 32-byte word.
fn emit_mstore(asm: &mut HelperAsm<'_>) {
    let l_loop = asm.fresh();
    let l_end = asm.fresh();
    asm.ldarg(0);
    asm.push(32);
    asm.simple(Op::Add);
    asm.call("__mgrow");
    asm.push(31);
    asm.stloc(0); // i counts down from the least significant byte
    asm.label(l_loop);
    asm.ldsfld(MEM_SLOT);
    asm.ldarg(0);
    asm.ldloc(0);
    asm.simple(Op::Add);
    asm.ldarg(1);
    asm.push(256);
    asm.simple(Op::Mod);
    asm.simple(Op::SetItem);
    asm.ldarg(1);
    asm.push(256);
    asm.simple(Op::Div);
    asm.starg(1);
    asm.ldloc(0);
    asm.push(0);
    asm.simple(Op::NumEqual);
    asm.jump(Op::JmpIf, l_end);
    asm.ldloc(0);
    asm.simple(Op::Dec);
    asm.stloc(0);
    asm.jump(Op::Jmp, l_loop);
    asm.label(l_end);
    asm.simple(Op::Ret);
}

/// `__mstore8(off, val)`: store the low byte of `val`.
fn emit_mstore8(asm: &mut HelperAsm<'_>) {
    asm.ldarg(0);
    asm.push(1);
    asm.simple(Op::Add);
    asm.call("__mgrow");
    asm.ldsfld(MEM_SLOT);
    asm.ldarg(0);
    asm.ldarg(1);
    asm.push(256);
    asm.simple(Op::Mod);
    asm.simple(Op::SetItem);
    asm.simple(Op::Ret);
}

/// `__mload(off)`: big-endian load of a 32-byte word.
fn emit_mload(asm: &mut HelperAsm<'_>) {
    let l_loop = asm.fresh();
    let l_end = asm.fresh();
    asm.ldarg(0);
    asm.push(32);
    asm.simple(Op::Add);
    asm.call("__mgrow");
    asm.push(0);
    asm.stloc(0); // acc
    asm.push(0);
    asm.stloc(1); // i
    asm.label(l_loop);
    asm.ldloc(1);
    asm.push(32);
    asm.simple(Op::Lt);
    asm.jump(Op::JmpIfNot, l_end);
    asm.ldloc(0);
    asm.push(256);
    asm.simple(Op::Mul);
    asm.ldsfld(MEM_SLOT);
    asm.ldarg(0);
    asm.ldloc(1);
    asm.simple(Op::Add);
    asm.simple(Op::PickItem);
    asm.simple(Op::Add);
    asm.stloc(0);
    asm.ldloc(1);
    asm.simple(Op::Inc);
    asm.stloc(1);
    asm.jump(Op::Jmp, l_loop);
    asm.label(l_end);
    asm.ldloc(0);
    asm.simple(Op::Ret);
}

/// `__mslice(off, len)`: copy a memory range into a fresh byte array.
fn emit_mslice(asm: &mut HelperAsm<'_>) {
    let l_loop = asm.fresh();
    let l_end = asm.fresh();
    asm.ldarg(0);
    asm.ldarg(1);
    asm.simple(Op::Add);
    asm.call("__mgrow");
    asm.simple(Op::NewArray0);
    asm.stloc(0);
    asm.push(0);
    asm.stloc(1);
    asm.label(l_loop);
    asm.ldloc(1);
    asm.ldarg(1);
    asm.simple(Op::Lt);
    asm.jump(Op::JmpIfNot, l_end);
    asm.ldloc(0);
    asm.ldsfld(MEM_SLOT);
    asm.ldarg(0);
    asm.ldloc(1);
    asm.simple(Op::Add);
    asm.simple(Op::PickItem);
    asm.simple(Op::Append);
    asm.ldloc(1);
    asm.simple(Op::Inc);
    asm.stloc(1);
    asm.jump(Op::Jmp, l_loop);
    asm.label(l_end);
    asm.ldloc(0);
    asm.simple(Op::Ret);
}

/// `__mwrite(off, bytes)`: copy a byte array into memory.
fn emit_mwrite(asm: &mut HelperAsm<'_>) {
    let l_loop = asm.fresh();
    let l_end = asm.fresh();
    asm.ldarg(0);
    asm.ldarg(1);
    asm.simple(Op::Size);
    asm.simple(Op::Add);
    asm.call("__mgrow");
    asm.push(0);
    asm.stloc(0);
    asm.label(l_loop);
    asm.ldloc(0);
    asm.ldarg(1);
    asm.simple(Op::Size);
    asm.simple(Op::Lt);
    asm.jump(Op::JmpIfNot, l_end);
    asm.ldsfld(MEM_SLOT);
    asm.ldarg(0);
    asm.ldloc(0);
    asm.simple(Op::Add);
    asm.ldarg(1);
    asm.ldloc(0);
    asm.simple(Op::PickItem);
    asm.simple(Op::SetItem);
    asm.ldloc(0);
    asm.simple(Op::Inc);
    asm.stloc(0);
    asm.jump(Op::Jmp, l_loop);
    asm.label(l_end);
    asm.simple(Op::Ret);
}

/// `__mwriten(off, bytes, n)`: copy exactly `n` bytes, zero-filling past
/// the end of the source.
fn emit_mwriten(asm: &mut HelperAsm<'_>) {
    let l_loop = asm.fresh();
    let l_zero = asm.fresh();
    let l_store = asm.fresh();
    let l_end = asm.fresh();
    asm.ldarg(0);
    asm.ldarg(2);
    asm.simple(Op::Add);
    asm.call("__mgrow");
    asm.push(0);
    asm.stloc(0);
    asm.label(l_loop);
    asm.ldloc(0);
    asm.ldarg(2);
    asm.simple(Op::Lt);
    asm.jump(Op::JmpIfNot, l_end);
    asm.ldsfld(MEM_SLOT);
    asm.ldarg(0);
    asm.ldloc(0);
    asm.simple(Op::Add);
    asm.ldloc(0);
    asm.ldarg(1);
    asm.simple(Op::Size);
    asm.simple(Op::Lt);
    asm.jump(Op::JmpIfNot, l_zero);
    asm.ldarg(1);
    asm.ldloc(0);
    asm.simple(Op::PickItem);
    asm.jump(Op::Jmp, l_store);
    asm.label(l_zero);
    asm.push(0);
    asm.label(l_store);
    asm.simple(Op::SetItem);
    asm.ldloc(0);
    asm.simple(Op::Inc);
    asm.stloc(0);
    asm.jump(Op::Jmp, l_loop);
    asm.label(l_end);
    asm.simple(Op::Ret);
}

/// `__cdload(off)`: 32-byte big-endian read from calldata, zero-padded
/// past the end.
fn emit_cdload(asm: &mut HelperAsm<'_>) {
    let l_loop = asm.fresh();
    let l_skip = asm.fresh();
    let l_end = asm.fresh();
    asm.push(0);
    asm.stloc(0); // acc
    asm.push(0);
    asm.stloc(1); // i
    asm.label(l_loop);
    asm.ldloc(1);
    asm.push(32);
    asm.simple(Op::Lt);
    asm.jump(Op::JmpIfNot, l_end);
    asm.ldloc(0);
    asm.push(256);
    asm.simple(Op::Mul);
    asm.stloc(0);
    asm.ldarg(0);
    asm.ldloc(1);
    asm.simple(Op::Add);
    asm.stloc(2); // idx
    asm.ldloc(2);
    asm.ldsfld(CALLDATA_SLOT);
    asm.simple(Op::Size);
    asm.simple(Op::Lt);
    asm.jump(Op::JmpIfNot, l_skip);
    asm.ldloc(0);
    asm.ldsfld(CALLDATA_SLOT);
    asm.ldloc(2);
    asm.simple(Op::PickItem);
    asm.simple(Op::Add);
    asm.stloc(0);
    asm.label(l_skip);
    asm.ldloc(1);
    asm.simple(Op::Inc);
    asm.stloc(1);
    asm.jump(Op::Jmp, l_loop);
    asm.label(l_end);
    asm.ldloc(0);
    asm.simple(Op::Ret);
}

/// `__cdslice` / `__rdslice` `(src, len)`: zero-padded slice of a static
/// byte buffer as a fresh byte array.
fn emit_buffer_slice(asm: &mut HelperAsm<'_>, slot: u8) {
    let l_loop = asm.fresh();
    let l_pad = asm.fresh();
    let l_append = asm.fresh();
    let l_end = asm.fresh();
    asm.simple(Op::NewArray0);
    asm.stloc(0);
    asm.push(0);
    asm.stloc(1);
    asm.label(l_loop);
    asm.ldloc(1);
    asm.ldarg(1);
    asm.simple(Op::Lt);
    asm.jump(Op::JmpIfNot, l_end);
    asm.ldloc(0);
    asm.ldarg(0);
    asm.ldloc(1);
    asm.simple(Op::Add);
    asm.simple(Op::Dup);
    asm.ldsfld(slot);
    asm.simple(Op::Size);
    asm.simple(Op::Lt);
    asm.jump(Op::JmpIfNot, l_pad);
    asm.ldsfld(slot);
    asm.simple(Op::Swap);
    asm.simple(Op::PickItem);
    asm.jump(Op::Jmp, l_append);
    asm.label(l_pad);
    asm.simple(Op::Drop);
    asm.push(0);
    asm.label(l_append);
    asm.simple(Op::Append);
    asm.ldloc(1);
    asm.simple(Op::Inc);
    asm.stloc(1);
    asm.jump(Op::Jmp, l_loop);
    asm.label(l_end);
    asm.ldloc(0);
    asm.simple(Op::Ret);
}

/// `__w2b(word)`: 32-byte big-endian encoding, the storage key format.
fn emit_w2b(asm: &mut HelperAsm<'_>) {
    let l_loop = asm.fresh();
    let l_end = asm.fresh();
    asm.simple(Op::NewArray0);
    asm.stloc(0);
    asm.push(0);
    asm.stloc(1);
    asm.label(l_loop);
    asm.ldloc(1);
    asm.push(32);
    asm.simple(Op::Lt);
    asm.jump(Op::JmpIfNot, l_end);
    asm.ldloc(0);
    asm.ldarg(0);
    asm.push(31);
    asm.ldloc(1);
    asm.simple(Op::Sub);
    asm.push(8);
    asm.simple(Op::Mul);
    asm.simple(Op::Shr);
    asm.push(256);
    asm.simple(Op::Mod);
    asm.simple(Op::Append);
    asm.ldloc(1);
    asm.simple(Op::Inc);
    asm.stloc(1);
    asm.jump(Op::Jmp, l_loop);
    asm.label(l_end);
    asm.ldloc(0);
    asm.simple(Op::Ret);
}

/// `__b2w(bytes)`: big-endian byte array back to a word.
fn emit_b2w(asm: &mut HelperAsm<'_>) {
    let l_loop = asm.fresh();
    let l_end = asm.fresh();
    asm.push(0);
    asm.stloc(0);
    asm.push(0);
    asm.stloc(1);
    asm.label(l_loop);
    asm.ldloc(1);
    asm.ldarg(0);
    asm.simple(Op::Size);
    asm.simple(Op::Lt);
    asm.jump(Op::JmpIfNot, l_end);
    asm.ldloc(0);
    asm.push(256);
    asm.simple(Op::Mul);
    asm.ldarg(0);
    asm.ldloc(1);
    asm.simple(Op::PickItem);
    asm.simple(Op::Add);
    asm.stloc(0);
    asm.ldloc(1);
    asm.simple(Op::Inc);
    asm.stloc(1);
    asm.jump(Op::Jmp, l_loop);
    asm.label(l_end);
    asm.ldloc(0);
    asm.simple(Op::Ret);
}

/// `__sload(slot)`: storage read with the missing-key-is-zero rule.
fn emit_sload(asm: &mut HelperAsm<'_>) {
    let l_have = asm.fresh();
    asm.syscall(services::STORAGE_GET_CONTEXT);
    asm.ldarg(0);
    asm.call("__w2b");
    asm.syscall(services::STORAGE_GET);
    asm.simple(Op::Dup);
    asm.simple(Op::IsNull);
    asm.jump(Op::JmpIfNot, l_have);
    asm.simple(Op::Drop);
    asm.push(0);
    asm.simple(Op::Ret);
    asm.label(l_have);
    asm.call("__b2w");
    asm.simple(Op::Ret);
}

/// `__sstore(slot, val)`.
fn emit_sstore(asm: &mut HelperAsm<'_>) {
    asm.syscall(services::STORAGE_GET_CONTEXT);
    asm.ldarg(0);
    asm.call("__w2b");
    asm.ldarg(1);
    asm.call("__w2b");
    asm.syscall(services::STORAGE_PUT);
    asm.simple(Op::Ret);
}

/// `__keccak(off, len)`: hash a memory slice to a word.
fn emit_keccak(asm: &mut HelperAsm<'_>) {
    asm.ldarg(0);
    asm.ldarg(1);
    asm.call("__mslice");
    asm.syscall(services::KECCAK256);
    asm.call("__b2w");
    asm.simple(Op::Ret);
}

/// `__return(off, len)`: halt the whole invocation with a memory slice
/// as the contract output.
fn emit_return(asm: &mut HelperAsm<'_>) {
    asm.ldarg(0);
    asm.ldarg(1);
    asm.call("__mslice");
    asm.syscall(services::EXIT);
    asm.simple(Op::Ret);
}

/// `__revert(off, len)`: abort with a memory slice as the reason.
fn emit_revert(asm: &mut HelperAsm<'_>) {
    asm.ldarg(0);
    asm.ldarg(1);
    asm.call("__mslice");
    asm.simple(Op::Throw);
}

/// `__logN(off, len, t1..tN)`: System.Runtime.Notify with the topics and
/// the data slice packed into the state array.
fn emit_log(asm: &mut HelperAsm<'_>, topics: u8) {
    asm.simple(Op::NewArray0);
    asm.stloc(0);
    for k in 0..topics {
        asm.ldloc(0);
        asm.ldarg(2 + k);
        asm.simple(Op::Append);
    }
    asm.ldloc(0);
    asm.ldarg(0);
    asm.ldarg(1);
    asm.call("__mslice");
    asm.simple(Op::Append);
    asm.push_bytes(format!("Log{topics}").as_bytes());
    asm.ldloc(0);
    asm.syscall(services::NOTIFY);
    asm.simple(Op::Ret);
}

/// `__extcall(addr, inOff, inLen, outOff, outLen)`: cross-contract call
/// through the dispatcher entry, return data captured and copied out.
fn emit_extcall(asm: &mut HelperAsm<'_>) {
    asm.ldarg(0);
    asm.call("__w2b");
    asm.push_bytes(ENTRY_METHOD.as_bytes());
    asm.push(15); // CallFlags.All
    asm.simple(Op::NewArray0);
    asm.stloc(0);
    asm.ldloc(0);
    asm.ldarg(1);
    asm.ldarg(2);
    asm.call("__mslice");
    asm.simple(Op::Append);
    asm.ldloc(0);
    asm.syscall(services::CONTRACT_CALL);
    asm.simple(Op::Dup);
    asm.stsfld(RETDATA_SLOT);
    asm.ldarg(3);
    asm.simple(Op::Swap);
    asm.ldarg(4);
    asm.call("__mwriten");
    asm.push(1);
    asm.simple(Op::Ret);
}

/// `__exp(base, e)`: square-and-multiply modulo 2^256.
fn emit_exp(asm: &mut HelperAsm<'_>) {
    let l_loop = asm.fresh();
    let l_skip = asm.fresh();
    let l_end = asm.fresh();
    asm.push(1);
    asm.stloc(0); // result
    asm.ldarg(0);
    asm.stloc(1); // base
    asm.ldarg(1);
    asm.stloc(2); // exponent
    asm.label(l_loop);
    asm.ldloc(2);
    asm.push(0);
    asm.simple(Op::NumEqual);
    asm.jump(Op::JmpIf, l_end);
    asm.ldloc(2);
    asm.push(1);
    asm.simple(Op::And);
    asm.jump(Op::JmpIfNot, l_skip);
    asm.ldloc(0);
    asm.ldloc(1);
    asm.simple(Op::Mul);
    asm.push_word(word_max().clone());
    asm.simple(Op::And);
    asm.stloc(0);
    asm.label(l_skip);
    asm.ldloc(1);
    asm.ldloc(1);
    asm.simple(Op::Mul);
    asm.push_word(word_max().clone());
    asm.simple(Op::And);
    asm.stloc(1);
    asm.ldloc(2);
    asm.push(1);
    asm.simple(Op::Shr);
    asm.stloc(2);
    asm.jump(Op::Jmp, l_loop);
    asm.label(l_end);
    asm.ldloc(0);
    asm.simple(Op::Ret);
}

/// `__signed(x)`: canonical word to signed integer view.
fn emit_signed(asm: &mut HelperAsm<'_>) {
    let l_big = asm.fresh();
    asm.ldarg(0);
    asm.push_word(half_modulus());
    asm.simple(Op::Lt);
    asm.jump(Op::JmpIfNot, l_big);
    asm.ldarg(0);
    asm.simple(Op::Ret);
    asm.label(l_big);
    // x - 2^256, kept one half at a time so constants stay word-sized.
    asm.ldarg(0);
    asm.push_word(half_modulus());
    asm.simple(Op::Sub);
    asm.push_word(half_modulus());
    asm.simple(Op::Sub);
    asm.simple(Op::Ret);
}

/// `__unsigned(x)`: signed integer view back to the canonical word.
fn emit_unsigned(asm: &mut HelperAsm<'_>) {
    let l_pos = asm.fresh();
    asm.ldarg(0);
    asm.push(0);
    asm.simple(Op::Lt);
    asm.jump(Op::JmpIfNot, l_pos);
    asm.ldarg(0);
    asm.push_word(half_modulus());
    asm.simple(Op::Add);
    asm.push_word(half_modulus());
    asm.simple(Op::Add);
    asm.simple(Op::Ret);
    asm.label(l_pos);
    asm.ldarg(0);
    asm.simple(Op::Ret);
}

/// `__sdiv(a, b)`: truncated signed division, zero divisor yields zero.
fn emit_sdiv(asm: &mut HelperAsm<'_>) {
    let l_zero = asm.fresh();
    asm.ldarg(1);
    asm.push(0);
    asm.simple(Op::NumEqual);
    asm.jump(Op::JmpIf, l_zero);
    asm.ldarg(0);
    asm.call("__signed");
    asm.ldarg(1);
    asm.call("__signed");
    asm.simple(Op::Div);
    asm.call("__unsigned");
    asm.simple(Op::Ret);
    asm.label(l_zero);
    asm.push(0);
    asm.simple(Op::Ret);
}

/// `__smod(a, b)`: signed remainder, sign of the dividend.
fn emit_smod(asm: &mut HelperAsm<'_>) {
    let l_zero = asm.fresh();
    asm.ldarg(1);
    asm.push(0);
    asm.simple(Op::NumEqual);
    asm.jump(Op::JmpIf, l_zero);
    asm.ldarg(0);
    asm.call("__signed");
    asm.ldarg(1);
    asm.call("__signed");
    asm.simple(Op::Mod);
    asm.call("__unsigned");
    asm.simple(Op::Ret);
    asm.label(l_zero);
    asm.push(0);
    asm.simple(Op::Ret);
}

/// `__sar(shift, value)`: arithmetic shift right.
fn emit_sar(asm: &mut HelperAsm<'_>) {
    asm.ldarg(1);
    asm.call("__signed");
    asm.ldarg(0);
    asm.push(255);
    asm.simple(Op::Min);
    asm.simple(Op::Shr);
    asm.call("__unsigned");
    asm.simple(Op::Ret);
}

/// `__signext(b, x)`: sign-extend from byte width `b+1`.
fn emit_signext(asm: &mut HelperAsm<'_>) {
    let l_small = asm.fresh();
    let l_pos = asm.fresh();
    asm.ldarg(0);
    asm.push(30);
    asm.simple(Op::Gt);
    asm.jump(Op::JmpIfNot, l_small);
    asm.ldarg(1);
    asm.simple(Op::Ret);
    asm.label(l_small);
    // m = 1 << (8 * (b + 1))
    asm.push(1);
    asm.ldarg(0);
    asm.simple(Op::Inc);
    asm.push(8);
    asm.simple(Op::Mul);
    asm.simple(Op::Shl);
    asm.stloc(0);
    // r = x mod m
    asm.ldarg(1);
    asm.ldloc(0);
    asm.simple(Op::Mod);
    asm.stloc(1);
    asm.ldloc(1);
    asm.ldloc(0);
    asm.push(1);
    asm.simple(Op::Shr);
    asm.simple(Op::Lt);
    asm.jump(Op::JmpIf, l_pos);
    // r - m + 2^256, computed as (max - m) + r + 1
    asm.push_word(word_max().clone());
    asm.ldloc(0);
    asm.simple(Op::Sub);
    asm.ldloc(1);
    asm.simple(Op::Add);
    asm.simple(Op::Inc);
    asm.simple(Op::Ret);
    asm.label(l_pos);
    asm.ldloc(1);
    asm.simple(Op::Ret);
}

/// `__byte(i, x)`: i-th most significant byte of the word.
fn emit_byte(asm: &mut HelperAsm<'_>) {
    let l_zero = asm.fresh();
    asm.ldarg(0);
    asm.push(31);
    asm.simple(Op::Gt);
    asm.jump(Op::JmpIf, l_zero);
    asm.ldarg(1);
    asm.push(31);
    asm.ldarg(0);
    asm.simple(Op::Sub);
    asm.push(8);
    asm.simple(Op::Mul);
    asm.simple(Op::Shr);
    asm.push(256);
    asm.simple(Op::Mod);
    asm.simple(Op::Ret);
    asm.label(l_zero);
    asm.push(0);
    asm.simple(Op::Ret);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit_one(name: &str) -> (Vec<Instruction>, FunctionTable) {
        let mut lib = RuntimeLibrary::new();
        let mut table = FunctionTable::new();
        let mut labels = LabelGen::new();
        lib.require(name, &mut table, &mut labels);
        let body = lib.emit_bodies(&mut table, &mut labels);
        (body, table)
    }

    #[test]
    fn helper_dedup() {
        let mut lib = RuntimeLibrary::new();
        let mut table = FunctionTable::new();
        let mut labels = LabelGen::new();
        let first = lib.require("__mload", &mut table, &mut labels);
        let second = lib.require("__mload", &mut table, &mut labels);
        assert_eq!(first, second);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn transitive_dependencies_are_emitted() {
        let (_, table) = emit_one("__keccak");
        // keccak pulls in the slice builder, which pulls in grow, and the
        // byte-to-word conversion for the digest.
        for dep in ["__keccak", "__mslice", "__mgrow", "__b2w"] {
            let entry = table.get(dep).unwrap_or_else(|| panic!("{dep} missing"));
            assert!(entry.emitted, "{dep} not emitted");
            assert!(entry.is_helper);
        }
    }

    #[test]
    fn every_helper_body_builds() {
        for def in HELPERS {
            let (body, table) = emit_one(def.name);
            assert!(!body.is_empty(), "{} produced no body", def.name);
            assert!(table[def.name].emitted);
            // Every body starts with its entry label and an INITSLOT
            // matching the declared frame.
            let entry = table[def.name].entry;
            let at = body
                .iter()
                .position(|i| i.label_id() == Some(entry))
                .unwrap_or_else(|| panic!("{} entry label missing", def.name));
            assert_eq!(body[at + 1].op, Op::InitSlot);
            assert_eq!(
                body[at + 1].operand,
                Operand::Slots(def.locals as u8, def.params as u8)
            );
        }
    }

    #[test]
    fn storage_helpers_use_storage_services() {
        let (body, _) = emit_one("__sstore");
        let services: Vec<_> = body
            .iter()
            .filter_map(|i| match (&i.op, &i.operand) {
                (Op::Syscall, Operand::Service(name)) => Some(name.clone()),
                _ => None,
            })
            .collect();
        assert!(services.contains(&services::STORAGE_PUT.to_string()));
        assert!(services.contains(&services::STORAGE_GET_CONTEXT.to_string()));
    }

    #[test]
    fn jump_targets_are_defined_within_library() {
        let mut lib = RuntimeLibrary::new();
        let mut table = FunctionTable::new();
        let mut labels = LabelGen::new();
        for def in HELPERS {
            lib.require(def.name, &mut table, &mut labels);
        }
        let body = lib.emit_bodies(&mut table, &mut labels);
        let defined: std::collections::HashSet<_> =
            body.iter().filter_map(|i| i.label_id()).collect();
        for instruction in &body {
            if let Some(target) = instruction.jump_target() {
                assert!(
                    defined.contains(&target),
                    "undefined target L{target} in {instruction}"
                );
            }
        }
    }
}
