//! Contract manifest generation.
//!
//! The manifest is the sidecar document wallets and nodes read: contract
//! name, supported standards, the ABI (methods with byte offsets and
//! safe flags, events), permissions and trusts. Methods are recovered
//! from the function table; a method is marked safe when its body
//! reaches no storage write and emits no notifications.

use crate::assembler::Assembled;
use crate::ir::{FunctionTable, Instruction, Op, Operand};
use crate::runtime::services;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub name: String,
    pub groups: Vec<serde_json::Value>,
    pub features: BTreeMap<String, serde_json::Value>,
    #[serde(rename = "supportedstandards")]
    pub supported_standards: Vec<String>,
    pub abi: Abi,
    pub permissions: Vec<Permission>,
    pub trusts: Vec<String>,
    pub extra: Extra,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Abi {
    pub methods: Vec<Method>,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Method {
    pub name: String,
    pub parameters: Vec<Parameter>,
    #[serde(rename = "returntype")]
    pub return_type: String,
    pub offset: u32,
    pub safe: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub name: String,
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Permission {
    pub contract: String,
    pub methods: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Extra {
    pub compiler: String,
    #[serde(rename = "sourceLanguage")]
    pub source_language: String,
}

/// Builds the manifest for an assembled runtime script.
pub fn build(
    contract_name: &str,
    standards: &[String],
    table: &FunctionTable,
    assembled: &Assembled,
    instructions: &[Instruction],
) -> Manifest {
    let mut methods = Vec::new();

    // The dispatcher entry: offset 0, one byte-string argument.
    methods.push(Method {
        name: crate::runtime::ENTRY_METHOD.to_string(),
        parameters: vec![Parameter {
            name: "input".to_string(),
            kind: "ByteArray".to_string(),
        }],
        return_type: "ByteArray".to_string(),
        offset: 0,
        safe: false,
    });

    for (name, entry) in table {
        if entry.is_helper || !entry.emitted {
            continue;
        }
        let offset = match assembled.offset_of(entry.entry) {
            Some(offset) => offset,
            None => continue,
        };
        methods.push(Method {
            name: name.clone(),
            parameters: (0..entry.params)
                .map(|index| Parameter {
                    name: format!("arg{index}"),
                    kind: "Integer".to_string(),
                })
                .collect(),
            return_type: if entry.returns == 0 {
                "Void".to_string()
            } else {
                "Integer".to_string()
            },
            offset,
            safe: is_safe(instructions, table, name),
        });
    }

    let events = (0..=4u8)
        .filter(|n| {
            table.contains_key(format!("__log{n}").as_str())
        })
        .map(|n| Event {
            name: format!("Log{n}"),
            parameters: (0..n)
                .map(|index| Parameter {
                    name: format!("topic{index}"),
                    kind: "Integer".to_string(),
                })
                .chain(std::iter::once(Parameter {
                    name: "data".to_string(),
                    kind: "ByteArray".to_string(),
                }))
                .collect(),
        })
        .collect();

    Manifest {
        name: contract_name.to_string(),
        groups: Vec::new(),
        features: BTreeMap::new(),
        supported_standards: standards.to_vec(),
        abi: Abi { methods, events },
        permissions: vec![Permission {
            contract: "*".to_string(),
            methods: serde_json::Value::String("*".to_string()),
        }],
        trusts: Vec::new(),
        extra: Extra {
            compiler: crate::COMPILER_NAME.to_string(),
            source_language: "Yul".to_string(),
        },
    }
}

/// A function is safe when the instruction range of its body performs no
/// storage write and emits no notification, directly or through a
/// helper it calls.
fn is_safe(instructions: &[Instruction], table: &FunctionTable, name: &str) -> bool {
    let mut visited = std::collections::BTreeSet::new();
    safe_walk(instructions, table, name, &mut visited)
}

fn safe_walk(
    instructions: &[Instruction],
    table: &FunctionTable,
    name: &str,
    visited: &mut std::collections::BTreeSet<String>,
) -> bool {
    if !visited.insert(name.to_string()) {
        return true;
    }
    let Some(entry) = table.get(name) else {
        return false;
    };
    let Some(range) = body_range(instructions, table, entry.entry) else {
        return false;
    };

    for instruction in &instructions[range.0..range.1] {
        if let (Op::Syscall, Operand::Service(service)) = (&instruction.op, &instruction.operand) {
            if service == services::STORAGE_PUT || service == services::NOTIFY {
                return false;
            }
        }
        if instruction.op == Op::Call {
            if let Some(target) = instruction.jump_target() {
                let callee = table
                    .iter()
                    .find(|(_, e)| e.entry == target)
                    .map(|(n, _)| n.clone());
                match callee {
                    Some(callee) => {
                        if !safe_walk(instructions, table, &callee, visited) {
                            return false;
                        }
                    }
                    None => return false,
                }
            }
        }
    }
    true
}

/// Instruction index range of a routine: from its entry label to the
/// next routine's entry label (routines are emitted contiguously).
fn body_range(
    instructions: &[Instruction],
    table: &FunctionTable,
    entry: crate::ir::LabelId,
) -> Option<(usize, usize)> {
    let entries: std::collections::BTreeSet<_> = table.values().map(|e| e.entry).collect();
    let start = instructions
        .iter()
        .position(|i| i.label_id() == Some(entry))?;
    let end = instructions
        .iter()
        .enumerate()
        .skip(start + 1)
        .find(|(_, i)| i.label_id().map(|l| entries.contains(&l)).unwrap_or(false))
        .map(|(index, _)| index)
        .unwrap_or(instructions.len());
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn manifest_serializes_with_expected_keys() {
        let manifest = Manifest {
            name: "Token".to_string(),
            groups: Vec::new(),
            features: BTreeMap::new(),
            supported_standards: vec!["NEP-17".to_string()],
            abi: Abi {
                methods: vec![Method {
                    name: "main".to_string(),
                    parameters: Vec::new(),
                    return_type: "ByteArray".to_string(),
                    offset: 0,
                    safe: false,
                }],
                events: Vec::new(),
            },
            permissions: vec![Permission {
                contract: "*".to_string(),
                methods: serde_json::Value::String("*".to_string()),
            }],
            trusts: Vec::new(),
            extra: Extra {
                compiler: "neo-yul".to_string(),
                source_language: "Yul".to_string(),
            },
        };
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["supportedstandards"][0], "NEP-17");
        assert_eq!(json["abi"]["methods"][0]["returntype"], "ByteArray");
        assert!(json["permissions"][0]["contract"].is_string());
    }
}
