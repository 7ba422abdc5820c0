//! Registry of Yul builtin functions.
//!
//! One table shared by the semantic analyzer (arity and return counts)
//! and the code generator (effect classification, support gating). The
//! solc IR subset is accepted in full; builtins NeoVM cannot express are
//! kept in the table so the analyzer resolves them, and the code
//! generator reports them as unsupported.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Observable effect class of a builtin, used for manifest safe-flags
/// and optimizer barriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// No state access; value depends only on arguments.
    Pure,
    /// Reads chain or execution state.
    ReadState,
    /// Writes storage or emits notifications.
    WriteState,
    /// Ends execution of the current context.
    Terminating,
}

#[derive(Debug, Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub params: usize,
    pub returns: usize,
    pub effect: Effect,
    /// False for EVM builtins with no NeoVM lowering; calling one is a
    /// codegen error, not a semantic error.
    pub supported: bool,
    /// The argument must be a literal string naming a data segment or
    /// sub-object (`datasize`, `dataoffset`).
    pub wants_name_argument: bool,
}

const fn b(name: &'static str, params: usize, returns: usize, effect: Effect) -> Builtin {
    Builtin {
        name,
        params,
        returns,
        effect,
        supported: true,
        wants_name_argument: false,
    }
}

const fn unsupported(name: &'static str, params: usize, returns: usize, effect: Effect) -> Builtin {
    Builtin {
        name,
        params,
        returns,
        effect,
        supported: false,
        wants_name_argument: false,
    }
}

const fn named_arg(name: &'static str) -> Builtin {
    Builtin {
        name,
        params: 1,
        returns: 1,
        effect: Effect::Pure,
        supported: true,
        wants_name_argument: true,
    }
}

static TABLE: &[Builtin] = &[
    // Arithmetic
    b("add", 2, 1, Effect::Pure),
    b("sub", 2, 1, Effect::Pure),
    b("mul", 2, 1, Effect::Pure),
    b("div", 2, 1, Effect::Pure),
    b("sdiv", 2, 1, Effect::Pure),
    b("mod", 2, 1, Effect::Pure),
    b("smod", 2, 1, Effect::Pure),
    b("exp", 2, 1, Effect::Pure),
    b("addmod", 3, 1, Effect::Pure),
    b("mulmod", 3, 1, Effect::Pure),
    b("signextend", 2, 1, Effect::Pure),
    // Comparison
    b("lt", 2, 1, Effect::Pure),
    b("gt", 2, 1, Effect::Pure),
    b("slt", 2, 1, Effect::Pure),
    b("sgt", 2, 1, Effect::Pure),
    b("eq", 2, 1, Effect::Pure),
    b("iszero", 1, 1, Effect::Pure),
    // Bitwise and shifts
    b("and", 2, 1, Effect::Pure),
    b("or", 2, 1, Effect::Pure),
    b("xor", 2, 1, Effect::Pure),
    b("not", 1, 1, Effect::Pure),
    b("byte", 2, 1, Effect::Pure),
    b("shl", 2, 1, Effect::Pure),
    b("shr", 2, 1, Effect::Pure),
    b("sar", 2, 1, Effect::Pure),
    // Memory
    b("mload", 1, 1, Effect::ReadState),
    b("mstore", 2, 0, Effect::WriteState),
    b("mstore8", 2, 0, Effect::WriteState),
    b("msize", 0, 1, Effect::ReadState),
    b("mcopy", 3, 0, Effect::WriteState),
    b("memoryguard", 1, 1, Effect::Pure),
    // Storage
    b("sload", 1, 1, Effect::ReadState),
    b("sstore", 2, 0, Effect::WriteState),
    // Calldata and return data
    b("calldataload", 1, 1, Effect::ReadState),
    b("calldatasize", 0, 1, Effect::ReadState),
    b("calldatacopy", 3, 0, Effect::WriteState),
    b("returndatasize", 0, 1, Effect::ReadState),
    b("returndatacopy", 3, 0, Effect::WriteState),
    // Hashing
    b("keccak256", 2, 1, Effect::ReadState),
    // Events
    b("log0", 2, 0, Effect::WriteState),
    b("log1", 3, 0, Effect::WriteState),
    b("log2", 4, 0, Effect::WriteState),
    b("log3", 5, 0, Effect::WriteState),
    b("log4", 6, 0, Effect::WriteState),
    // Execution environment
    b("caller", 0, 1, Effect::ReadState),
    b("address", 0, 1, Effect::ReadState),
    b("origin", 0, 1, Effect::ReadState),
    b("callvalue", 0, 1, Effect::ReadState),
    b("timestamp", 0, 1, Effect::ReadState),
    b("number", 0, 1, Effect::ReadState),
    b("chainid", 0, 1, Effect::ReadState),
    b("gasprice", 0, 1, Effect::ReadState),
    b("gas", 0, 1, Effect::ReadState),
    // Termination
    b("return", 2, 0, Effect::Terminating),
    b("revert", 2, 0, Effect::Terminating),
    b("stop", 0, 0, Effect::Terminating),
    b("invalid", 0, 0, Effect::Terminating),
    // Misc
    b("pop", 1, 0, Effect::Pure),
    // Cross-contract calls
    b("call", 7, 1, Effect::WriteState),
    b("staticcall", 6, 1, Effect::ReadState),
    b("delegatecall", 6, 1, Effect::WriteState),
    // Object data access
    named_arg("datasize"),
    named_arg("dataoffset"),
    b("datacopy", 3, 0, Effect::WriteState),
    // Accepted by the analyzer, rejected by the code generator.
    unsupported("balance", 1, 1, Effect::ReadState),
    unsupported("selfbalance", 0, 1, Effect::ReadState),
    unsupported("extcodesize", 1, 1, Effect::ReadState),
    unsupported("extcodecopy", 4, 0, Effect::WriteState),
    unsupported("extcodehash", 1, 1, Effect::ReadState),
    unsupported("codesize", 0, 1, Effect::ReadState),
    unsupported("codecopy", 3, 0, Effect::WriteState),
    unsupported("create", 3, 1, Effect::WriteState),
    unsupported("create2", 4, 1, Effect::WriteState),
    unsupported("callcode", 7, 1, Effect::WriteState),
    unsupported("selfdestruct", 1, 0, Effect::Terminating),
    unsupported("blockhash", 1, 1, Effect::ReadState),
    unsupported("blobhash", 1, 1, Effect::ReadState),
    unsupported("coinbase", 0, 1, Effect::ReadState),
    unsupported("difficulty", 0, 1, Effect::ReadState),
    unsupported("prevrandao", 0, 1, Effect::ReadState),
    unsupported("gaslimit", 0, 1, Effect::ReadState),
    unsupported("basefee", 0, 1, Effect::ReadState),
    unsupported("blobbasefee", 0, 1, Effect::ReadState),
    unsupported("setimmutable", 3, 0, Effect::WriteState),
    unsupported("loadimmutable", 1, 1, Effect::ReadState),
];

static BY_NAME: Lazy<HashMap<&'static str, &'static Builtin>> =
    Lazy::new(|| TABLE.iter().map(|entry| (entry.name, entry)).collect());

/// Looks up a builtin descriptor by Yul name.
pub fn lookup(name: &str) -> Option<&'static Builtin> {
    BY_NAME.get(name).copied()
}

pub fn is_builtin(name: &str) -> bool {
    BY_NAME.contains_key(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_builtins_present() {
        for name in ["add", "sload", "sstore", "keccak256", "log3", "calldataload"] {
            assert!(lookup(name).is_some(), "{name} missing from registry");
        }
    }

    #[test]
    fn arities_match_evm() {
        assert_eq!(lookup("addmod").unwrap().params, 3);
        assert_eq!(lookup("log4").unwrap().params, 6);
        assert_eq!(lookup("call").unwrap().params, 7);
        assert_eq!(lookup("staticcall").unwrap().params, 6);
        assert_eq!(lookup("sstore").unwrap().returns, 0);
    }

    #[test]
    fn unsupported_are_resolvable() {
        let entry = lookup("create2").unwrap();
        assert!(!entry.supported);
        assert_eq!(entry.params, 4);
    }

    #[test]
    fn data_builtins_want_names() {
        assert!(lookup("datasize").unwrap().wants_name_argument);
        assert!(lookup("dataoffset").unwrap().wants_name_argument);
        assert!(!lookup("datacopy").unwrap().wants_name_argument);
    }
}
