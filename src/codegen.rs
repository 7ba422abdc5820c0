//! Lowering from the annotated AST to NeoVM instructions.
//!
//! One generator instance produces the script for one Yul object;
//! sub-objects are compiled recursively into their own scripts. The
//! emission order inside a script is: entry stub, runtime support
//! library, user functions, top-level code body. Jumps use symbolic
//! labels throughout; nothing here knows about byte offsets.
//!
//! Calling convention: arguments are pushed leftmost first and popped
//! into argument slots by the callee's `INITSLOT`; results are left on
//! the evaluation stack in declaration order. Variables live in dense
//! local slots per frame; nested blocks extend the parent layout and
//! release their slots on exit.

use crate::ast::{Block, Call, Expression, FunctionDef, LiteralValue, Object, Statement};
use crate::builtins;
use crate::compiler::CompilerConfig;
use crate::diagnostics::{DiagnosticSink, Stage};
use crate::ir::{
    word_max, FunctionEntry, FunctionTable, Instruction, LabelGen, LabelId, Op, Operand,
};
use crate::lexer::Span;
use crate::runtime::{self, services, RuntimeLibrary};
use num_bigint::BigUint;
use num_traits::One;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CodegenError {
    #[error("builtin '{name}' has no NeoVM lowering")]
    UnsupportedBuiltin { name: String, span: Span },

    #[error("evaluation stack depth {depth} exceeds the configured maximum of {limit}")]
    StackOverflow { depth: usize, limit: usize, span: Span },

    #[error("emitted code size {bytes} bytes exceeds the memory limit of {limit}")]
    SizeLimit { bytes: usize, limit: usize },

    #[error("datacopy source must be dataoffset(\"...\")")]
    ComputedDataCopy { span: Span },
}

impl CodegenError {
    fn span(&self) -> Option<Span> {
        match self {
            CodegenError::UnsupportedBuiltin { span, .. }
            | CodegenError::StackOverflow { span, .. }
            | CodegenError::ComputedDataCopy { span } => Some(*span),
            CodegenError::SizeLimit { .. } => None,
        }
    }
}

/// Compiled form of one Yul object and its nested objects.
#[derive(Debug)]
pub struct CompiledObject {
    pub name: String,
    pub instructions: Vec<Instruction>,
    pub function_table: FunctionTable,
    pub sub_objects: Vec<CompiledObject>,
    pub data_items: Vec<(String, Vec<u8>)>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum VarSlot {
    Local(u8),
    Arg(u8),
}

#[derive(Debug, Default)]
struct Scope {
    vars: HashMap<String, VarSlot>,
    /// Source function name → function-table key (unique per script).
    funcs: HashMap<String, String>,
    slot_base: usize,
}

struct FunctionFrame {
    epilogue: LabelId,
}

struct LoopFrame {
    post: LabelId,
    end: LabelId,
}

pub struct CodeGenerator<'a> {
    config: &'a CompilerConfig,
    sink: &'a mut DiagnosticSink,
    labels: LabelGen,
    table: FunctionTable,
    lib: RuntimeLibrary,
    out: Vec<Instruction>,
    finished_functions: Vec<Vec<Instruction>>,
    scopes: Vec<Scope>,
    next_slot: usize,
    slot_watermark: usize,
    stack: usize,
    max_stack: usize,
    loops: Vec<LoopFrame>,
    function: Option<FunctionFrame>,
    /// One stack/slot overflow report per frame is enough.
    depth_error_reported: bool,
}

impl<'a> CodeGenerator<'a> {
    pub fn new(config: &'a CompilerConfig, sink: &'a mut DiagnosticSink) -> Self {
        Self {
            config,
            sink,
            labels: LabelGen::new(),
            table: FunctionTable::new(),
            lib: RuntimeLibrary::new(),
            out: Vec::new(),
            finished_functions: Vec::new(),
            scopes: Vec::new(),
            next_slot: 0,
            slot_watermark: 0,
            stack: 0,
            max_stack: 0,
            loops: Vec::new(),
            function: None,
            depth_error_reported: false,
        }
    }

    /// Compiles an object tree. Errors are reported through the sink;
    /// the returned script is best-effort and only meaningful when the
    /// sink stayed clean.
    pub fn generate(mut self, object: &Object) -> CompiledObject {
        let body_label = self.labels.fresh();

        // Top-level code body, functions peeled off into side buffers.
        self.enter_scope();
        self.bind_block_functions(&object.code);
        for statement in &object.code.statements {
            self.gen_statement(statement);
        }
        self.exit_scope();
        let body = std::mem::take(&mut self.out);
        let body_locals = self.slot_watermark.min(u8::MAX as usize) as u8;

        let helpers = self.lib.emit_bodies(&mut self.table, &mut self.labels);

        let mut instructions = Vec::new();
        // Entry stub: script entry is offset 0, takes the calldata byte
        // string as its only argument and installs the static slots.
        instructions.push(Instruction::with(
            Op::InitSSlot,
            Operand::Slot(runtime::STATIC_SLOTS),
        ));
        instructions.push(Instruction::with(
            Op::InitSlot,
            Operand::Slots(body_locals, 1),
        ));
        instructions.push(Instruction::with(Op::LdArg, Operand::Slot(0)));
        instructions.push(Instruction::with(
            Op::StSFld,
            Operand::Slot(runtime::CALLDATA_SLOT),
        ));
        instructions.push(Instruction::new(Op::NewArray0));
        instructions.push(Instruction::with(
            Op::StSFld,
            Operand::Slot(runtime::MEM_SLOT),
        ));
        instructions.push(Instruction::push_small(0));
        instructions.push(Instruction::with(
            Op::StSFld,
            Operand::Slot(runtime::MSIZE_SLOT),
        ));
        instructions.push(Instruction::new(Op::NewArray0));
        instructions.push(Instruction::with(
            Op::StSFld,
            Operand::Slot(runtime::RETDATA_SLOT),
        ));
        instructions.push(Instruction::jump(Op::Jmp, body_label));

        instructions.extend(helpers);
        for function in std::mem::take(&mut self.finished_functions) {
            instructions.extend(function);
        }
        instructions.push(Instruction::label(body_label));
        instructions.extend(body);
        instructions.push(Instruction::new(Op::Ret));

        self.check_emitted_size(&instructions);
        tracing::debug!(
            object = %object.name,
            instructions = instructions.len(),
            functions = self.table.len(),
            max_stack = self.max_stack,
            "generated object code"
        );

        let mut sub_objects = Vec::new();
        for sub in &object.sub_objects {
            let generator = CodeGenerator::new(self.config, &mut *self.sink);
            sub_objects.push(generator.generate(sub));
        }

        CompiledObject {
            name: object.name.clone(),
            instructions,
            function_table: self.table,
            sub_objects,
            data_items: object
                .data_items
                .iter()
                .map(|item| (item.name.clone(), item.payload.clone()))
                .collect(),
        }
    }

    // --- statements -------------------------------------------------------

    fn gen_statement(&mut self, statement: &Statement) {
        match statement {
            Statement::VarDecl { names, init, span } => {
                match init {
                    Some(expr) => self.gen_expression(expr),
                    None => {
                        for _ in names {
                            self.emit(Instruction::push_small(0));
                        }
                    }
                }
                // Values sit on the stack in declaration order, so the
                // last name is stored first.
                let slots: Vec<u8> = names.iter().map(|n| self.alloc_slot(n, *span)).collect();
                for slot in slots.iter().rev() {
                    self.emit(Instruction::with(Op::StLoc, Operand::Slot(*slot)));
                }
            }
            Statement::Assign { targets, value, .. } => {
                self.gen_expression(value);
                for target in targets.iter().rev() {
                    match self.lookup_var(target) {
                        Some(VarSlot::Local(slot)) => {
                            self.emit(Instruction::with(Op::StLoc, Operand::Slot(slot)))
                        }
                        Some(VarSlot::Arg(slot)) => {
                            self.emit(Instruction::with(Op::StArg, Operand::Slot(slot)))
                        }
                        None => {
                            // Semantic analysis already reported this;
                            // keep the stack balanced.
                            self.emit(Instruction::new(Op::Drop));
                        }
                    }
                }
            }
            Statement::Expr(expr) => {
                let before = self.stack;
                self.gen_expression(expr);
                // Discard anything a malformed expression left behind.
                while self.stack > before {
                    self.emit(Instruction::new(Op::Drop));
                }
            }
            Statement::If { condition, body, .. } => {
                let end = self.labels.fresh();
                self.gen_expression(condition);
                self.emit(Instruction::jump(Op::JmpIfNot, end));
                self.gen_block(body);
                self.emit(Instruction::label(end));
            }
            Statement::Switch {
                scrutinee,
                cases,
                default,
                ..
            } => self.gen_switch(scrutinee, cases, default.as_ref()),
            Statement::For {
                init,
                condition,
                post,
                body,
                ..
            } => self.gen_for(init, condition, post, body),
            Statement::Break(span) => {
                let target = self.loops.last().map(|frame| frame.end);
                if let Some(end) = target {
                    self.emit(Instruction::jump(Op::Jmp, end).at(*span));
                }
            }
            Statement::Continue(span) => {
                let target = self.loops.last().map(|frame| frame.post);
                if let Some(post) = target {
                    self.emit(Instruction::jump(Op::Jmp, post).at(*span));
                }
            }
            Statement::Leave(span) => {
                let target = self.function.as_ref().map(|frame| frame.epilogue);
                if let Some(epilogue) = target {
                    self.emit(Instruction::jump(Op::Jmp, epilogue).at(*span));
                }
            }
            Statement::FunctionDef(def) => self.gen_function(def),
            Statement::Block(block) => self.gen_block(block),
        }
    }

    fn gen_block(&mut self, block: &Block) {
        self.enter_scope();
        self.bind_block_functions(block);
        for statement in &block.statements {
            self.gen_statement(statement);
        }
        self.exit_scope();
    }

    fn gen_switch(
        &mut self,
        scrutinee: &Expression,
        cases: &[crate::ast::SwitchCase],
        default: Option<&Block>,
    ) {
        let end = self.labels.fresh();
        self.gen_expression(scrutinee);
        let entry_stack = self.stack;

        let case_labels: Vec<LabelId> = cases.iter().map(|_| self.labels.fresh()).collect();
        for (case, label) in cases.iter().zip(&case_labels) {
            self.emit(Instruction::new(Op::Dup));
            self.emit(Instruction::push_word(case.value.as_word()));
            self.emit(Instruction::new(Op::NumEqual));
            self.emit(Instruction::jump(Op::JmpIf, *label));
        }

        // Fall-through path: the scrutinee is still on the stack.
        self.set_stack(entry_stack);
        self.emit(Instruction::new(Op::Drop));
        if let Some(block) = default {
            self.gen_block(block);
        }
        self.emit(Instruction::jump(Op::Jmp, end));

        for (case, label) in cases.iter().zip(&case_labels) {
            self.set_stack(entry_stack);
            self.emit(Instruction::label(*label));
            self.emit(Instruction::new(Op::Drop));
            self.gen_block(&case.body);
            self.emit(Instruction::jump(Op::Jmp, end));
        }

        self.emit(Instruction::label(end));
        self.set_stack(entry_stack.saturating_sub(1));
    }

    fn gen_for(&mut self, init: &Block, condition: &Expression, post: &Block, body: &Block) {
        // The init block's scope spans the whole loop.
        self.enter_scope();
        self.bind_block_functions(init);
        for statement in &init.statements {
            self.gen_statement(statement);
        }

        let l_loop = self.labels.fresh();
        let l_post = self.labels.fresh();
        let l_end = self.labels.fresh();

        self.emit(Instruction::label(l_loop));
        self.gen_expression(condition);
        self.emit(Instruction::jump(Op::JmpIfNot, l_end));

        self.loops.push(LoopFrame {
            post: l_post,
            end: l_end,
        });
        self.gen_block(body);
        self.loops.pop();

        self.emit(Instruction::label(l_post));
        self.gen_block(post);
        self.emit(Instruction::jump(Op::Jmp, l_loop));
        self.emit(Instruction::label(l_end));

        self.exit_scope();
    }

    fn gen_function(&mut self, def: &FunctionDef) {
        let key = self.function_key(&def.name);
        let entry = self.table[&key].entry;
        let epilogue = self.labels.fresh();

        // Fresh frame: swap out the emission buffer and slot state.
        let saved_out = std::mem::take(&mut self.out);
        let saved_next = std::mem::replace(&mut self.next_slot, def.returns.len());
        let saved_watermark = std::mem::replace(&mut self.slot_watermark, def.returns.len());
        let saved_stack = std::mem::replace(&mut self.stack, 0);
        let saved_max = std::mem::replace(&mut self.max_stack, 0);
        let saved_loops = std::mem::take(&mut self.loops);
        let saved_function = self.function.replace(FunctionFrame { epilogue });
        let saved_reported = std::mem::replace(&mut self.depth_error_reported, false);

        self.emit(Instruction::label(entry).at(def.span));
        let initslot_at = self.out.len();
        self.emit(Instruction::with(Op::InitSlot, Operand::Slots(0, def.params.len() as u8)));

        self.enter_scope();
        for (index, param) in def.params.iter().enumerate() {
            self.scopes
                .last_mut()
                .expect("scope present")
                .vars
                .insert(param.clone(), VarSlot::Arg(index as u8));
        }
        // Return variables are zero-initialized locals 0..n.
        for (index, name) in def.returns.iter().enumerate() {
            self.scopes
                .last_mut()
                .expect("scope present")
                .vars
                .insert(name.clone(), VarSlot::Local(index as u8));
            self.emit(Instruction::push_small(0));
            self.emit(Instruction::with(Op::StLoc, Operand::Slot(index as u8)));
        }

        self.bind_block_functions(&def.body);
        for statement in &def.body.statements {
            self.gen_statement(statement);
        }
        self.exit_scope();

        self.emit(Instruction::label(epilogue));
        for index in 0..def.returns.len() {
            self.emit(Instruction::with(Op::LdLoc, Operand::Slot(index as u8)));
        }
        self.emit(Instruction::new(Op::Ret));

        let locals = self.slot_watermark.min(u8::MAX as usize) as u8;
        self.out[initslot_at].operand = Operand::Slots(locals, def.params.len() as u8);

        if let Some(entry) = self.table.get_mut(&key) {
            entry.locals = self.slot_watermark;
            entry.emitted = true;
        }

        let finished = std::mem::replace(&mut self.out, saved_out);
        self.finished_functions.push(finished);
        self.next_slot = saved_next;
        self.slot_watermark = saved_watermark;
        self.stack = saved_stack;
        self.max_stack = self.max_stack.max(saved_max);
        self.loops = saved_loops;
        self.function = saved_function;
        self.depth_error_reported = saved_reported;
    }

    // --- expressions ------------------------------------------------------

    fn gen_expression(&mut self, expr: &Expression) {
        match expr {
            Expression::Literal(lit) => {
                self.emit(Instruction::push_word(lit.as_word()).at(lit.span));
            }
            Expression::Ident { name, span } => match self.lookup_var(name) {
                Some(VarSlot::Local(slot)) => {
                    self.emit(Instruction::with(Op::LdLoc, Operand::Slot(slot)).at(*span))
                }
                Some(VarSlot::Arg(slot)) => {
                    self.emit(Instruction::with(Op::LdArg, Operand::Slot(slot)).at(*span))
                }
                None => {
                    // Reported by semantic analysis; keep codegen total.
                    self.emit(Instruction::push_small(0).at(*span));
                }
            },
            Expression::Call(call) => self.gen_call(call),
        }
    }

    fn gen_call(&mut self, call: &Call) {
        if builtins::is_builtin(&call.callee) && self.lookup_function(&call.callee).is_none() {
            self.gen_builtin(call);
            return;
        }

        match self.lookup_function(&call.callee) {
            Some(key) => {
                for arg in &call.args {
                    self.gen_expression(arg);
                }
                let entry = &self.table[&key];
                let (target, params, returns) = (entry.entry, entry.params, entry.returns);
                self.emit(Instruction::jump(Op::Call, target).at(call.span));
                self.adjust_stack(params, returns);
            }
            None => {
                // Semantic analysis reported the unresolved callee.
                for arg in &call.args {
                    self.gen_expression(arg);
                    self.emit(Instruction::new(Op::Drop));
                }
                self.emit(Instruction::push_small(0));
            }
        }
    }

    fn call_helper(&mut self, name: &str, span: Span) {
        let label = self.lib.require(name, &mut self.table, &mut self.labels);
        let entry = &self.table[name];
        let (params, returns) = (entry.params, entry.returns);
        self.emit(Instruction::jump(Op::Call, label).at(span));
        self.adjust_stack(params, returns);
    }

    fn gen_builtin(&mut self, call: &Call) {
        let span = call.span;
        let builtin = builtins::lookup(&call.callee).expect("checked by caller");
        if !builtin.supported {
            self.report(CodegenError::UnsupportedBuiltin {
                name: call.callee.clone(),
                span,
            });
            self.set_stack(self.stack + builtin.returns);
            return;
        }

        // Forms that consume their argument list specially.
        match call.callee.as_str() {
            "datasize" | "dataoffset" => {
                if let Some(Expression::Literal(lit)) = call.args.first() {
                    if let LiteralValue::Str(name) = &lit.value {
                        let operand = if call.callee == "datasize" {
                            Operand::DataSize(name.clone())
                        } else {
                            Operand::DataOffset(name.clone())
                        };
                        self.emit(Instruction::with(Op::Push, operand).at(span));
                        return;
                    }
                }
                // Malformed argument, already diagnosed.
                self.emit(Instruction::push_small(0));
                return;
            }
            "datacopy" => {
                let blob = match call.args.get(1) {
                    Some(Expression::Call(inner)) if inner.callee == "dataoffset" => {
                        match inner.args.first() {
                            Some(Expression::Literal(lit)) => match &lit.value {
                                LiteralValue::Str(name) => Some(name.clone()),
                                _ => None,
                            },
                            _ => None,
                        }
                    }
                    _ => None,
                };
                let Some(name) = blob else {
                    self.report(CodegenError::ComputedDataCopy { span });
                    return;
                };
                self.gen_expression(&call.args[0]);
                self.emit(Instruction::with(Op::Push, Operand::DataBlob(name)).at(span));
                // The length argument is a constant in the canonical
                // pattern, but evaluate it for its value discipline.
                if let Some(len) = call.args.get(2) {
                    self.gen_expression(len);
                    self.emit(Instruction::new(Op::Drop));
                }
                self.call_helper("__mwrite", span);
                return;
            }
            "memoryguard" => {
                if let Some(arg) = call.args.first() {
                    self.gen_expression(arg);
                } else {
                    self.emit(Instruction::push_small(0));
                }
                return;
            }
            "call" => {
                // call(gas, addr, value, in, insize, out, outsize):
                // gas and value have no NeoVM counterpart.
                self.gen_discarded(call.args.first());
                self.gen_arg(call, 1);
                self.gen_discarded(call.args.get(2));
                for index in 3..7 {
                    self.gen_arg(call, index);
                }
                self.call_helper("__extcall", span);
                return;
            }
            "staticcall" | "delegatecall" => {
                self.gen_discarded(call.args.first());
                for index in 1..6 {
                    self.gen_arg(call, index);
                }
                self.call_helper("__extcall", span);
                return;
            }
            _ => {}
        }

        for arg in &call.args {
            self.gen_expression(arg);
        }

        match call.callee.as_str() {
            "add" => {
                self.emit(Instruction::new(Op::Add));
                self.emit(Instruction::push_word(word_max().clone()));
                self.emit(Instruction::new(Op::And));
            }
            "sub" => {
                self.emit(Instruction::new(Op::Sub));
                let ok = self.labels.fresh();
                self.emit(Instruction::new(Op::Dup));
                self.emit(Instruction::push_small(0));
                self.emit(Instruction::new(Op::Lt));
                self.emit(Instruction::jump(Op::JmpIfNot, ok));
                self.emit(Instruction::push_word(half_modulus()));
                self.emit(Instruction::new(Op::Add));
                self.emit(Instruction::push_word(half_modulus()));
                self.emit(Instruction::new(Op::Add));
                self.emit(Instruction::label(ok));
            }
            "mul" => {
                self.emit(Instruction::new(Op::Mul));
                self.emit(Instruction::push_word(word_max().clone()));
                self.emit(Instruction::new(Op::And));
            }
            "div" => self.gen_zero_guarded(Op::Div),
            "mod" => self.gen_zero_guarded(Op::Mod),
            "sdiv" => self.call_helper("__sdiv", span),
            "smod" => self.call_helper("__smod", span),
            "exp" => self.call_helper("__exp", span),
            "addmod" => {
                let entry = self.stack;
                let zero = self.labels.fresh();
                let done = self.labels.fresh();
                self.emit(Instruction::new(Op::Dup));
                self.emit(Instruction::push_small(0));
                self.emit(Instruction::new(Op::NumEqual));
                self.emit(Instruction::jump(Op::JmpIf, zero));
                self.emit(Instruction::new(Op::Rot));
                self.emit(Instruction::new(Op::Rot));
                self.emit(Instruction::new(Op::Add));
                self.emit(Instruction::new(Op::Swap));
                self.emit(Instruction::new(Op::Mod));
                self.emit(Instruction::jump(Op::Jmp, done));
                self.emit(Instruction::label(zero));
                self.emit(Instruction::new(Op::Drop));
                self.emit(Instruction::new(Op::Drop));
                self.emit(Instruction::new(Op::Drop));
                self.emit(Instruction::push_small(0));
                self.emit(Instruction::label(done));
                self.set_stack(entry.saturating_sub(3) + 1);
            }
            "mulmod" => {
                let entry = self.stack;
                let zero = self.labels.fresh();
                let done = self.labels.fresh();
                self.emit(Instruction::new(Op::Dup));
                self.emit(Instruction::push_small(0));
                self.emit(Instruction::new(Op::NumEqual));
                self.emit(Instruction::jump(Op::JmpIf, zero));
                self.emit(Instruction::new(Op::ModMul));
                self.emit(Instruction::jump(Op::Jmp, done));
                self.emit(Instruction::label(zero));
                self.emit(Instruction::new(Op::Drop));
                self.emit(Instruction::new(Op::Drop));
                self.emit(Instruction::new(Op::Drop));
                self.emit(Instruction::push_small(0));
                self.emit(Instruction::label(done));
                self.set_stack(entry.saturating_sub(3) + 1);
            }
            "signextend" => self.call_helper("__signext", span),
            "byte" => self.call_helper("__byte", span),
            "lt" => self.emit(Instruction::new(Op::Lt)),
            "gt" => self.emit(Instruction::new(Op::Gt)),
            "eq" => self.emit(Instruction::new(Op::NumEqual)),
            "iszero" => {
                self.emit(Instruction::push_small(0));
                self.emit(Instruction::new(Op::NumEqual));
            }
            "slt" | "sgt" => {
                self.call_helper("__signed", span);
                self.emit(Instruction::new(Op::Swap));
                self.call_helper("__signed", span);
                self.emit(Instruction::new(Op::Swap));
                self.emit(Instruction::new(if call.callee == "slt" {
                    Op::Lt
                } else {
                    Op::Gt
                }));
            }
            "and" => self.emit(Instruction::new(Op::And)),
            "or" => self.emit(Instruction::new(Op::Or)),
            "xor" => self.emit(Instruction::new(Op::Xor)),
            "not" => {
                self.emit(Instruction::push_word(word_max().clone()));
                self.emit(Instruction::new(Op::Xor));
            }
            "shl" => {
                self.emit(Instruction::new(Op::Swap));
                self.emit(Instruction::push_small(256));
                self.emit(Instruction::new(Op::Min));
                self.emit(Instruction::new(Op::Shl));
                self.emit(Instruction::push_word(word_max().clone()));
                self.emit(Instruction::new(Op::And));
            }
            "shr" => {
                self.emit(Instruction::new(Op::Swap));
                self.emit(Instruction::push_small(256));
                self.emit(Instruction::new(Op::Min));
                self.emit(Instruction::new(Op::Shr));
            }
            "sar" => self.call_helper("__sar", span),
            "mload" => {
                self.gen_bounds_check_top(32);
                self.call_helper("__mload", span);
            }
            "mstore" => {
                self.gen_bounds_check_under(32);
                self.call_helper("__mstore", span);
            }
            "mstore8" => {
                self.gen_bounds_check_under(1);
                self.call_helper("__mstore8", span);
            }
            "msize" => self.emit(Instruction::with(
                Op::LdSFld,
                Operand::Slot(runtime::MSIZE_SLOT),
            )),
            "mcopy" => {
                self.gen_bounds_check_copy();
                self.call_helper("__mslice", span);
                self.call_helper("__mwrite", span);
            }
            "sload" => self.call_helper("__sload", span),
            "sstore" => self.call_helper("__sstore", span),
            "keccak256" => self.call_helper("__keccak", span),
            "calldataload" => self.call_helper("__cdload", span),
            "calldatasize" => {
                self.emit(Instruction::with(
                    Op::LdSFld,
                    Operand::Slot(runtime::CALLDATA_SLOT),
                ));
                self.emit(Instruction::new(Op::Size));
            }
            "calldatacopy" => {
                self.gen_bounds_check_copy();
                self.call_helper("__cdslice", span);
                self.call_helper("__mwrite", span);
            }
            "returndatasize" => {
                self.emit(Instruction::with(
                    Op::LdSFld,
                    Operand::Slot(runtime::RETDATA_SLOT),
                ));
                self.emit(Instruction::new(Op::Size));
            }
            "returndatacopy" => {
                self.gen_bounds_check_copy();
                self.call_helper("__rdslice", span);
                self.call_helper("__mwrite", span);
            }
            "log0" => self.call_helper("__log0", span),
            "log1" => self.call_helper("__log1", span),
            "log2" => self.call_helper("__log2", span),
            "log3" => self.call_helper("__log3", span),
            "log4" => self.call_helper("__log4", span),
            "caller" => {
                self.emit(Instruction::syscall(services::CALLING_SCRIPT_HASH));
                self.call_helper("__b2w", span);
            }
            "address" => {
                self.emit(Instruction::syscall(services::EXECUTING_SCRIPT_HASH));
                self.call_helper("__b2w", span);
            }
            "origin" => {
                self.emit(Instruction::syscall(services::ENTRY_SCRIPT_HASH));
                self.call_helper("__b2w", span);
            }
            "callvalue" => self.emit(Instruction::push_small(0)),
            "timestamp" => self.emit(Instruction::syscall(services::TIME)),
            "number" => self.emit(Instruction::syscall(services::BLOCK_HEIGHT)),
            "chainid" => self.emit(Instruction::syscall(services::NETWORK)),
            "gasprice" => self.emit(Instruction::syscall(services::EXEC_FEE_FACTOR)),
            "gas" => self.emit(Instruction::syscall(services::GAS_LEFT)),
            "return" => {
                self.call_helper("__return", span);
                // The helper halts the invocation; the RET both keeps
                // the frame well formed and marks the flow end for
                // dead-code elimination.
                self.emit(Instruction::new(Op::Ret));
            }
            "revert" => {
                self.call_helper("__revert", span);
                self.emit(Instruction::new(Op::Abort));
            }
            "stop" => {
                self.emit(Instruction::new(Op::NewArray0));
                self.emit(Instruction::syscall(services::EXIT));
                self.emit(Instruction::new(Op::Ret));
            }
            "invalid" => self.emit(Instruction::new(Op::Abort)),
            "pop" => self.emit(Instruction::new(Op::Drop)),
            other => {
                self.report(CodegenError::UnsupportedBuiltin {
                    name: other.to_string(),
                    span,
                });
            }
        }
    }

    fn gen_arg(&mut self, call: &Call, index: usize) {
        match call.args.get(index) {
            Some(arg) => self.gen_expression(arg),
            None => self.emit(Instruction::push_small(0)),
        }
    }

    fn gen_discarded(&mut self, arg: Option<&Expression>) {
        if let Some(expr) = arg {
            self.gen_expression(expr);
            self.emit(Instruction::new(Op::Drop));
        }
    }

    /// EVM division semantics: a zero divisor yields zero instead of a
    /// fault. `DUP; PUSH 0; EQ; JMPIF` guards the zero path.
    fn gen_zero_guarded(&mut self, op: Op) {
        // Both operands are on the stack; the construct nets one value.
        let entry = self.stack;
        let zero = self.labels.fresh();
        let done = self.labels.fresh();
        self.emit(Instruction::new(Op::Dup));
        self.emit(Instruction::push_small(0));
        self.emit(Instruction::new(Op::NumEqual));
        self.emit(Instruction::jump(Op::JmpIf, zero));
        self.emit(Instruction::new(op));
        self.emit(Instruction::jump(Op::Jmp, done));
        self.emit(Instruction::label(zero));
        self.emit(Instruction::new(Op::Drop));
        self.emit(Instruction::new(Op::Drop));
        self.emit(Instruction::push_small(0));
        self.emit(Instruction::label(done));
        self.set_stack(entry.saturating_sub(2) + 1);
    }

    /// Range check for an access at the top-of-stack offset.
    fn gen_bounds_check_top(&mut self, width: u64) {
        if !self.config.enable_bounds_checks {
            return;
        }
        let ok = self.labels.fresh();
        self.emit(Instruction::new(Op::Dup));
        self.emit(Instruction::push_small(width));
        self.emit(Instruction::new(Op::Add));
        self.emit(Instruction::push_small(self.config.memory_limit as u64));
        self.emit(Instruction::new(Op::Gt));
        self.emit(Instruction::jump(Op::JmpIfNot, ok));
        self.emit(Instruction::new(Op::Abort));
        self.emit(Instruction::label(ok));
    }

    /// Range check when the offset sits under one value.
    fn gen_bounds_check_under(&mut self, width: u64) {
        if !self.config.enable_bounds_checks {
            return;
        }
        let ok = self.labels.fresh();
        self.emit(Instruction::new(Op::Over));
        self.emit(Instruction::push_small(width));
        self.emit(Instruction::new(Op::Add));
        self.emit(Instruction::push_small(self.config.memory_limit as u64));
        self.emit(Instruction::new(Op::Gt));
        self.emit(Instruction::jump(Op::JmpIfNot, ok));
        self.emit(Instruction::new(Op::Abort));
        self.emit(Instruction::label(ok));
    }

    /// Range check for `(dst, src, len)` copy builtins: dst + len must
    /// stay inside the memory limit.
    fn gen_bounds_check_copy(&mut self) {
        if !self.config.enable_bounds_checks {
            return;
        }
        let ok = self.labels.fresh();
        self.emit(Instruction::push_small(2));
        self.emit(Instruction::new(Op::Pick));
        self.emit(Instruction::push_small(1));
        self.emit(Instruction::new(Op::Pick));
        self.emit(Instruction::new(Op::Add));
        self.emit(Instruction::push_small(self.config.memory_limit as u64));
        self.emit(Instruction::new(Op::Gt));
        self.emit(Instruction::jump(Op::JmpIfNot, ok));
        self.emit(Instruction::new(Op::Abort));
        self.emit(Instruction::label(ok));
    }

    // --- scopes, slots, stack --------------------------------------------

    fn enter_scope(&mut self) {
        self.scopes.push(Scope {
            slot_base: self.next_slot,
            ..Scope::default()
        });
    }

    fn exit_scope(&mut self) {
        if let Some(scope) = self.scopes.pop() {
            // Block-local slots are released for siblings to reuse.
            self.next_slot = scope.slot_base;
        }
    }

    /// Hoists the block's function definitions: unique table keys and
    /// entry labels exist before any call site is generated.
    fn bind_block_functions(&mut self, block: &Block) {
        for statement in &block.statements {
            if let Statement::FunctionDef(def) = statement {
                let mut key = def.name.clone();
                let mut counter = 1usize;
                while self.table.contains_key(&key) {
                    counter += 1;
                    key = format!("{}${counter}", def.name);
                }
                let entry = self.labels.fresh();
                self.table.insert(
                    key.clone(),
                    FunctionEntry {
                        entry,
                        params: def.params.len(),
                        returns: def.returns.len(),
                        locals: 0,
                        emitted: false,
                        is_helper: false,
                    },
                );
                self.scopes
                    .last_mut()
                    .expect("scope present")
                    .funcs
                    .insert(def.name.clone(), key);
            }
        }
    }

    fn function_key(&self, name: &str) -> String {
        self.lookup_function(name)
            .unwrap_or_else(|| name.to_string())
    }

    fn lookup_function(&self, name: &str) -> Option<String> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.funcs.get(name).cloned())
    }

    fn lookup_var(&self, name: &str) -> Option<VarSlot> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.vars.get(name).copied())
    }

    fn alloc_slot(&mut self, name: &str, span: Span) -> u8 {
        let slot = self.next_slot;
        if slot >= self.config.max_stack_depth && !self.depth_error_reported {
            self.depth_error_reported = true;
            self.report(CodegenError::StackOverflow {
                depth: slot + 1,
                limit: self.config.max_stack_depth,
                span,
            });
        }
        self.next_slot += 1;
        self.slot_watermark = self.slot_watermark.max(self.next_slot);
        let slot = slot.min(u8::MAX as usize) as u8;
        self.scopes
            .last_mut()
            .expect("scope present")
            .vars
            .insert(name.to_string(), VarSlot::Local(slot));
        slot
    }

    fn emit(&mut self, instruction: Instruction) {
        let (pops, pushes) = instruction.stack_effect();
        self.stack = self.stack.saturating_sub(pops as usize) + pushes as usize;
        self.bump_stack();
        self.out.push(instruction);
    }

    fn adjust_stack(&mut self, pops: usize, pushes: usize) {
        self.stack = self.stack.saturating_sub(pops) + pushes;
        self.bump_stack();
    }

    fn set_stack(&mut self, depth: usize) {
        self.stack = depth;
        self.bump_stack();
    }

    fn bump_stack(&mut self) {
        if self.stack > self.max_stack {
            self.max_stack = self.stack;
            if self.max_stack > self.config.max_stack_depth && !self.depth_error_reported {
                self.depth_error_reported = true;
                self.report(CodegenError::StackOverflow {
                    depth: self.max_stack,
                    limit: self.config.max_stack_depth,
                    span: Span::default(),
                });
            }
        }
    }

    fn check_emitted_size(&mut self, instructions: &[Instruction]) {
        let estimate: usize = instructions.iter().map(worst_case_width).sum();
        if estimate > self.config.memory_limit {
            self.report(CodegenError::SizeLimit {
                bytes: estimate,
                limit: self.config.memory_limit,
            });
        }
    }

    fn report(&mut self, error: CodegenError) {
        self.sink
            .error(Stage::Codegen, error.span(), error.to_string());
    }
}

fn half_modulus() -> BigUint {
    BigUint::one() << 255u32
}

/// Worst-case encoded width of one instruction, used for the size limit
/// check before assembly.
fn worst_case_width(instruction: &Instruction) -> usize {
    match (&instruction.op, &instruction.operand) {
        (Op::Label, _) => 0,
        // PUSHDATA1 + length byte + the 32-byte padded word.
        (Op::Push, Operand::Word(_)) => 34,
        (Op::Push, Operand::Bytes(bytes)) => 5 + bytes.len(),
        // The assembler encodes both as a fixed 5-byte PUSHINT32.
        (Op::Push, Operand::DataOffset(_) | Operand::DataSize(_)) => 5,
        // Blob payloads are counted by the assembler once known.
        (Op::Push, Operand::DataBlob(_)) => 5,
        (Op::Jmp | Op::JmpIf | Op::JmpIfNot | Op::Call, _) => 5,
        (Op::Syscall, _) => 5,
        (Op::InitSlot, _) => 3,
        (_, Operand::Slot(_)) => 2,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;

    fn generate(source: &str) -> (CompiledObject, DiagnosticSink) {
        generate_with(source, &CompilerConfig::default())
    }

    fn generate_with(source: &str, config: &CompilerConfig) -> (CompiledObject, DiagnosticSink) {
        let (object, errors) = parse_source(source);
        assert!(errors.is_empty(), "parse errors: {errors:?}");
        let object = object.unwrap();
        let mut sink = DiagnosticSink::new();
        crate::semantic::analyze(&object, &mut sink);
        let compiled = CodeGenerator::new(config, &mut sink).generate(&object);
        (compiled, sink)
    }

    fn ops(compiled: &CompiledObject) -> Vec<Op> {
        compiled.instructions.iter().map(|i| i.op).collect()
    }

    fn syscalls(compiled: &CompiledObject) -> Vec<String> {
        compiled
            .instructions
            .iter()
            .filter_map(|i| match (&i.op, &i.operand) {
                (Op::Syscall, Operand::Service(name)) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn empty_object_still_has_entry_stub() {
        let (compiled, sink) = generate(r#"object "C" { code { } }"#);
        assert!(!sink.has_errors(), "{:?}", sink.all());
        assert_eq!(compiled.instructions[0].op, Op::InitSSlot);
        assert!(ops(&compiled).contains(&Op::Ret));
    }

    #[test]
    fn storage_builtins_reach_syscalls() {
        let (compiled, sink) = generate("{ sstore(0, sload(1)) }");
        assert!(!sink.has_errors(), "{:?}", sink.all());
        let services = syscalls(&compiled);
        assert!(services.contains(&services::STORAGE_GET.to_string()));
        assert!(services.contains(&services::STORAGE_PUT.to_string()));
    }

    #[test]
    fn log_lowers_to_notify() {
        let (compiled, sink) = generate("{ log3(0, 32, 1, 2, 3) }");
        assert!(!sink.has_errors(), "{:?}", sink.all());
        assert!(syscalls(&compiled).contains(&services::NOTIFY.to_string()));
    }

    #[test]
    fn function_table_records_user_functions() {
        let (compiled, sink) = generate(
            r#"{
                function safeAdd(a, b) -> c { c := add(a, b) }
                function gte(a, b) -> r { r := iszero(lt(a, b)) }
                pop(safeAdd(1, gte(2, 3)))
            }"#,
        );
        assert!(!sink.has_errors(), "{:?}", sink.all());
        let entry = &compiled.function_table["safeAdd"];
        assert_eq!(entry.params, 2);
        assert_eq!(entry.returns, 1);
        assert!(entry.emitted);
        assert!(!entry.is_helper);
        assert!(compiled.function_table.contains_key("gte"));
    }

    #[test]
    fn sixteen_parameter_function_compiles() {
        let params: Vec<String> = (0..16).map(|i| format!("p{i}")).collect();
        let source = format!(
            "{{ function wide({}) -> r {{ r := add(p0, p15) }} pop(wide({})) }}",
            params.join(", "),
            (0..16).map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
        );
        let (compiled, sink) = generate(&source);
        assert!(!sink.has_errors(), "{:?}", sink.all());
        assert_eq!(compiled.function_table["wide"].params, 16);
    }

    #[test]
    fn slot_flood_hits_stack_limit() {
        let mut body = String::from("{ ");
        for i in 0..4096 {
            body.push_str(&format!("let v{i} := {i} "));
        }
        body.push('}');
        let config = CompilerConfig {
            max_stack_depth: 256,
            ..CompilerConfig::default()
        };
        let (_, sink) = generate_with(&body, &config);
        assert!(sink.has_errors());
        let message = &sink.all()[0].message;
        assert!(message.contains("stack depth"), "{message}");
        // One structured error, not thousands.
        assert_eq!(sink.error_count(), 1);
    }

    #[test]
    fn division_emits_zero_guard() {
        let (compiled, sink) = generate("{ sstore(0, div(calldataload(0), calldataload(32))) }");
        assert!(!sink.has_errors(), "{:?}", sink.all());
        let listing = crate::ir::disassemble(&compiled.instructions);
        assert!(listing.contains("Div"));
        // The guard compares the divisor against zero before dividing.
        assert!(listing.contains("NumEqual"));
    }

    #[test]
    fn unsupported_builtin_is_codegen_error() {
        let (_, sink) = generate("{ pop(blockhash(1)) }");
        assert!(sink.has_errors());
        assert!(sink.all()[0].message.contains("no NeoVM lowering"));
        assert_eq!(sink.all()[0].stage, Stage::Codegen);
    }

    #[test]
    fn break_and_continue_target_loop_labels() {
        let (compiled, sink) = generate(
            "{ for { let i := 0 } lt(i, 10) { i := add(i, 1) } { if eq(i, 5) { break } continue } }",
        );
        assert!(!sink.has_errors(), "{:?}", sink.all());
        let jumps = compiled
            .instructions
            .iter()
            .filter(|i| i.op == Op::Jmp)
            .count();
        assert!(jumps >= 3, "loop back-edge, break and continue expected");
    }

    #[test]
    fn switch_duplicates_scrutinee_per_case() {
        let (compiled, sink) = generate(
            "{ switch calldataload(0) case 1 { sstore(0, 1) } case 2 { sstore(0, 2) } default { revert(0, 0) } }",
        );
        assert!(!sink.has_errors(), "{:?}", sink.all());
        let dups = compiled
            .instructions
            .iter()
            .filter(|i| i.op == Op::Dup)
            .count();
        assert!(dups >= 2);
        let drops = compiled
            .instructions
            .iter()
            .filter(|i| i.op == Op::Drop)
            .count();
        assert!(drops >= 3, "each arm drops the scrutinee");
    }

    #[test]
    fn bounds_checks_are_gated_by_config() {
        let plain = generate("{ mstore(0, 1) }").0;
        let config = CompilerConfig {
            enable_bounds_checks: true,
            ..CompilerConfig::default()
        };
        let checked = generate_with("{ mstore(0, 1) }", &config).0;
        let aborts = |c: &CompiledObject| {
            c.instructions.iter().filter(|i| i.op == Op::Abort).count()
        };
        assert_eq!(aborts(&plain), 0);
        assert!(aborts(&checked) >= 1);
    }

    #[test]
    fn size_limit_is_enforced() {
        let config = CompilerConfig {
            memory_limit: 64,
            ..CompilerConfig::default()
        };
        let (_, sink) = generate_with("{ sstore(0, add(1, mul(2, 3))) }", &config);
        assert!(sink
            .all()
            .iter()
            .any(|d| d.message.contains("memory limit")));
    }

    #[test]
    fn data_builtins_become_pseudo_operands() {
        let (compiled, sink) = generate(
            r#"object "C" {
                code {
                    datacopy(0, dataoffset("runtime"), datasize("runtime"))
                    return(0, datasize("runtime"))
                }
                object "runtime" { code { } }
            }"#,
        );
        assert!(!sink.has_errors(), "{:?}", sink.all());
        let has_blob = compiled
            .instructions
            .iter()
            .any(|i| matches!(&i.operand, Operand::DataBlob(name) if name == "runtime"));
        let has_size = compiled
            .instructions
            .iter()
            .any(|i| matches!(&i.operand, Operand::DataSize(name) if name == "runtime"));
        assert!(has_blob && has_size);
    }

    #[test]
    fn helpers_are_shared_between_call_sites() {
        let (compiled, sink) = generate("{ sstore(0, 1) sstore(1, 2) sstore(2, 3) }");
        assert!(!sink.has_errors(), "{:?}", sink.all());
        let sstore_entries = compiled
            .function_table
            .iter()
            .filter(|(name, _)| name.as_str() == "__sstore")
            .count();
        assert_eq!(sstore_entries, 1);
        // Exactly one Storage.Put in the whole script: the shared body.
        assert_eq!(
            syscalls(&compiled)
                .iter()
                .filter(|s| s.as_str() == services::STORAGE_PUT)
                .count(),
            1
        );
    }
}
