//! Instruction-level intermediate representation.
//!
//! The code generator produces a flat `Vec<Instruction>` in which jump
//! targets are symbolic label ids; the assembler later assigns byte
//! offsets. Push instructions stay abstract (`Operand::Word`) and the
//! assembler picks the tightest NeoVM encoding, so optimizer passes can
//! pattern-match pushes without caring about widths.

use num_bigint::BigUint;
use num_traits::One;
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::fmt;

/// Symbolic forward reference resolved at assembly time.
pub type LabelId = u32;

/// 2^256, the modulus of the Yul word domain.
pub fn word_modulus() -> &'static BigUint {
    static MODULUS: Lazy<BigUint> = Lazy::new(|| BigUint::one() << 256u32);
    &MODULUS
}

/// 2^256 - 1, the all-ones word.
pub fn word_max() -> &'static BigUint {
    static MAX: Lazy<BigUint> = Lazy::new(|| (BigUint::one() << 256u32) - BigUint::one());
    &MAX
}

/// Encodes a word as exactly 32 big-endian bytes.
pub fn word_to_bytes32(word: &BigUint) -> [u8; 32] {
    let raw = word.to_bytes_be();
    let mut out = [0u8; 32];
    out[32 - raw.len()..].copy_from_slice(&raw);
    out
}

/// NeoVM operations, plus the `Label` pseudo-op that marks a jump target
/// and emits no bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Pseudo: position of a label definition.
    Label,
    /// Abstract constant push; the assembler selects PUSH0..PUSH16,
    /// PUSHINT8..PUSHINT256 or PUSHDATA encodings.
    Push,

    Nop,
    Jmp,
    JmpIf,
    JmpIfNot,
    Call,
    Abort,
    Assert,
    Throw,
    Ret,
    Syscall,

    Depth,
    Drop,
    Nip,
    Dup,
    Over,
    Pick,
    Tuck,
    Swap,
    Rot,
    Roll,

    InitSSlot,
    InitSlot,
    LdSFld,
    StSFld,
    LdLoc,
    StLoc,
    LdArg,
    StArg,

    Sign,
    Abs,
    Negate,
    Inc,
    Dec,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Sqrt,
    ModMul,
    ModPow,
    Shl,
    Shr,
    Not,
    BoolAnd,
    BoolOr,
    NumEqual,
    NumNotEqual,
    Lt,
    Le,
    Gt,
    Ge,
    Min,
    Max,
    Within,
    Invert,
    And,
    Or,
    Xor,

    Pack,
    Unpack,
    PickItem,
    SetItem,
    NewArray0,
    NewArray,
    NewMap,
    Size,
    HasKey,
    Append,
    IsNull,
}

impl Op {
    /// Wire opcode for fixed-encoding operations. `Label` and `Push`
    /// have no single byte value; the assembler handles them.
    pub fn opcode(self) -> Option<u8> {
        let byte = match self {
            Op::Label | Op::Push => return None,
            Op::Nop => 0x21,
            Op::Jmp => 0x22,
            Op::JmpIf => 0x23,
            Op::JmpIfNot => 0x24,
            Op::Call => 0x2B,
            Op::Abort => 0x2E,
            Op::Assert => 0x2F,
            Op::Throw => 0x3A,
            Op::Ret => 0x40,
            Op::Syscall => 0x41,
            Op::Depth => 0x43,
            Op::Drop => 0x45,
            Op::Nip => 0x46,
            Op::Dup => 0x4A,
            Op::Over => 0x4B,
            Op::Pick => 0x4D,
            Op::Tuck => 0x4E,
            Op::Swap => 0x50,
            Op::Rot => 0x51,
            Op::Roll => 0x52,
            Op::InitSSlot => 0x56,
            Op::InitSlot => 0x57,
            Op::LdSFld => 0x5F,
            Op::StSFld => 0x67,
            Op::LdLoc => 0x6F,
            Op::StLoc => 0x77,
            Op::LdArg => 0x7F,
            Op::StArg => 0x87,
            Op::Sign => 0x90,
            Op::Abs => 0x91,
            Op::Negate => 0x92,
            Op::Inc => 0x93,
            Op::Dec => 0x94,
            Op::Add => 0x95,
            Op::Sub => 0x96,
            Op::Mul => 0x97,
            Op::Div => 0x98,
            Op::Mod => 0x99,
            Op::Pow => 0x9A,
            Op::Sqrt => 0x9B,
            Op::ModMul => 0x9C,
            Op::ModPow => 0x9D,
            Op::Shl => 0x9E,
            Op::Shr => 0x9F,
            Op::Not => 0xA0,
            Op::BoolAnd => 0xA1,
            Op::BoolOr => 0xA2,
            Op::NumEqual => 0xA3,
            Op::NumNotEqual => 0xA4,
            Op::Lt => 0xA5,
            Op::Le => 0xA6,
            Op::Gt => 0xA7,
            Op::Ge => 0xA8,
            Op::Min => 0xA9,
            Op::Max => 0xAA,
            Op::Within => 0xAB,
            Op::Invert => 0xAC,
            Op::And => 0xAD,
            Op::Or => 0xAE,
            Op::Xor => 0xAF,
            Op::Pack => 0xC0,
            Op::Unpack => 0xC1,
            Op::PickItem => 0xC2,
            Op::SetItem => 0xC3,
            Op::NewArray0 => 0xC4,
            Op::NewArray => 0xC5,
            Op::NewMap => 0xC9,
            Op::Size => 0xCA,
            Op::HasKey => 0xCB,
            Op::Append => 0xD0,
            Op::IsNull => 0xD8,
        };
        Some(byte)
    }

    /// True for operations after which control does not fall through.
    pub fn ends_flow(self) -> bool {
        matches!(self, Op::Jmp | Op::Ret | Op::Throw | Op::Abort)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Operand {
    #[default]
    None,
    /// Constant word for `Push`.
    Word(BigUint),
    /// Raw byte payload for `Push` of strings and blobs.
    Bytes(Vec<u8>),
    /// Jump / call target.
    Target(LabelId),
    /// Slot index for local/arg/static load and store.
    Slot(u8),
    /// `INITSLOT locals, params`.
    Slots(u8, u8),
    /// Named system service.
    Service(String),
    /// Assembly-time constant: byte offset of a data blob.
    DataOffset(String),
    /// Assembly-time constant: byte length of a data blob.
    DataSize(String),
    /// Assembly-time payload: the data blob itself, pushed inline.
    DataBlob(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: Op,
    pub operand: Operand,
    pub span: Option<crate::lexer::Span>,
}

impl Instruction {
    pub fn new(op: Op) -> Self {
        Self {
            op,
            operand: Operand::None,
            span: None,
        }
    }

    pub fn with(op: Op, operand: Operand) -> Self {
        Self {
            op,
            operand,
            span: None,
        }
    }

    pub fn push_word(word: BigUint) -> Self {
        Self::with(Op::Push, Operand::Word(word % word_modulus()))
    }

    pub fn push_small(value: u64) -> Self {
        Self::push_word(BigUint::from(value))
    }

    pub fn push_bytes(bytes: Vec<u8>) -> Self {
        Self::with(Op::Push, Operand::Bytes(bytes))
    }

    pub fn label(id: LabelId) -> Self {
        Self::with(Op::Label, Operand::Target(id))
    }

    pub fn jump(op: Op, target: LabelId) -> Self {
        debug_assert!(matches!(op, Op::Jmp | Op::JmpIf | Op::JmpIfNot | Op::Call));
        Self::with(op, Operand::Target(target))
    }

    pub fn syscall(service: &str) -> Self {
        Self::with(Op::Syscall, Operand::Service(service.to_string()))
    }

    pub fn at(mut self, span: crate::lexer::Span) -> Self {
        self.span = Some(span);
        self
    }

    /// The constant word this instruction pushes, when it is a word push.
    pub fn pushed_word(&self) -> Option<&BigUint> {
        match (&self.op, &self.operand) {
            (Op::Push, Operand::Word(word)) => Some(word),
            _ => None,
        }
    }

    pub fn is_label(&self) -> bool {
        self.op == Op::Label
    }

    pub fn label_id(&self) -> Option<LabelId> {
        match (&self.op, &self.operand) {
            (Op::Label, Operand::Target(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn jump_target(&self) -> Option<LabelId> {
        match (&self.op, &self.operand) {
            (Op::Jmp | Op::JmpIf | Op::JmpIfNot | Op::Call, Operand::Target(id)) => Some(*id),
            _ => None,
        }
    }

    /// Optimizer passes must not move or fold across these.
    pub fn is_barrier(&self) -> bool {
        matches!(
            self.op,
            Op::Label | Op::Syscall | Op::Jmp | Op::JmpIf | Op::JmpIfNot | Op::Call | Op::Ret
                | Op::Throw | Op::Abort | Op::Assert
        )
    }

    /// (pops, pushes) on the evaluation stack.
    pub fn stack_effect(&self) -> (u32, u32) {
        match self.op {
            Op::Label | Op::Nop | Op::Jmp | Op::Ret | Op::Abort => (0, 0),
            Op::Push => (0, 1),
            Op::JmpIf | Op::JmpIfNot | Op::Assert | Op::Throw | Op::Drop => (1, 0),
            // CALL effects depend on the callee; the generator accounts
            // for them at the call site.
            Op::Call => (0, 0),
            Op::Syscall => match &self.operand {
                Operand::Service(name) => syscall_effect(name),
                _ => (0, 0),
            },
            Op::Depth => (0, 1),
            Op::Nip => (2, 1),
            Op::Dup => (1, 2),
            Op::Over => (2, 3),
            Op::Pick => (2, 2),
            Op::Tuck => (2, 3),
            Op::Swap => (2, 2),
            Op::Rot => (3, 3),
            Op::Roll => (2, 1),
            Op::InitSSlot | Op::InitSlot => (0, 0),
            Op::LdSFld | Op::LdLoc | Op::LdArg => (0, 1),
            Op::StSFld | Op::StLoc | Op::StArg => (1, 0),
            Op::Sign | Op::Abs | Op::Negate | Op::Inc | Op::Dec | Op::Sqrt | Op::Not
            | Op::Invert => (1, 1),
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod | Op::Pow | Op::Shl | Op::Shr
            | Op::BoolAnd | Op::BoolOr | Op::NumEqual | Op::NumNotEqual | Op::Lt | Op::Le
            | Op::Gt | Op::Ge | Op::Min | Op::Max | Op::And | Op::Or | Op::Xor => (2, 1),
            Op::ModMul | Op::ModPow | Op::Within => (3, 1),
            Op::Pack => (1, 1),
            Op::Unpack => (1, 1),
            Op::PickItem => (2, 1),
            Op::SetItem => (3, 0),
            Op::NewArray0 | Op::NewMap => (0, 1),
            Op::NewArray => (1, 1),
            Op::Size | Op::IsNull => (1, 1),
            Op::HasKey => (2, 1),
            Op::Append => (2, 0),
        }
    }
}

/// Stack effect of a named system call.
fn syscall_effect(name: &str) -> (u32, u32) {
    match name {
        "System.Storage.GetContext" => (0, 1),
        "System.Storage.Get" => (2, 1),
        "System.Storage.Put" => (3, 0),
        "System.Crypto.Keccak256" => (1, 1),
        "System.Runtime.Notify" => (2, 0),
        "System.Runtime.Exit" => (1, 0),
        "System.Contract.Call" => (4, 1),
        // Environment getters
        _ => (0, 1),
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.op, &self.operand) {
            (Op::Label, Operand::Target(id)) => write!(f, "L{id}:"),
            (Op::Push, Operand::Word(word)) => write!(f, "PUSH {word}"),
            (Op::Push, Operand::Bytes(bytes)) => write!(f, "PUSHDATA 0x{}", hex::encode(bytes)),
            (Op::Push, Operand::DataOffset(name)) => write!(f, "PUSH dataoffset({name})"),
            (Op::Push, Operand::DataSize(name)) => write!(f, "PUSH datasize({name})"),
            (Op::Push, Operand::DataBlob(name)) => write!(f, "PUSHDATA datablob({name})"),
            (op, Operand::Target(id)) => write!(f, "{op:?} L{id}"),
            (op, Operand::Slot(index)) => write!(f, "{op:?} {index}"),
            (op, Operand::Slots(locals, params)) => write!(f, "{op:?} {locals}, {params}"),
            (op, Operand::Service(name)) => write!(f, "{op:?} {name}"),
            (op, _) => write!(f, "{op:?}"),
        }
    }
}

/// Renders an instruction list as readable assembly, one per line.
pub fn disassemble(instructions: &[Instruction]) -> String {
    let mut out = String::new();
    for instruction in instructions {
        if instruction.is_label() {
            out.push_str(&instruction.to_string());
        } else {
            out.push_str("    ");
            out.push_str(&instruction.to_string());
        }
        out.push('\n');
    }
    out
}

/// One function known to the code generator.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionEntry {
    pub entry: LabelId,
    pub params: usize,
    pub returns: usize,
    pub locals: usize,
    pub emitted: bool,
    /// True for runtime-support helpers, which stay out of the ABI.
    pub is_helper: bool,
}

/// Name → entry map. Ordered so manifests and statistics come out
/// deterministic.
pub type FunctionTable = BTreeMap<String, FunctionEntry>;

/// Sequential label allocator.
#[derive(Debug, Default)]
pub struct LabelGen {
    next: LabelId,
}

impl LabelGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&mut self) -> LabelId {
        let id = self.next;
        self.next += 1;
        id
    }
}
