//! Semantic analysis: scope building and identifier resolution.
//!
//! Two passes per block, matching Yul's scoping rules. The declaration
//! pass hoists function definitions so forward references resolve; the
//! resolution pass then walks statements in order, introducing variables
//! at their declaration point and checking every use.
//!
//! Function bodies are variable barriers: a function sees enclosing
//! functions but never enclosing variables. Shadowing a visible name is
//! an error, as in Yul.
//!
//! All findings go to the diagnostic sink; analysis always runs to
//! completion.

use crate::ast::{Block, Call, Expression, FunctionDef, Object, Statement};
use crate::builtins;
use crate::diagnostics::{DiagnosticSink, Stage};
use crate::lexer::Span;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub enum Symbol {
    Variable,
    Function { params: usize, returns: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Block,
    Function,
}

#[derive(Debug)]
struct Scope {
    parent: Option<usize>,
    kind: ScopeKind,
    symbols: HashMap<String, Symbol>,
}

/// Summary returned to the driver after analysis.
#[derive(Debug, Default, Clone)]
pub struct SemanticInfo {
    pub function_count: usize,
    pub variable_count: usize,
}

pub struct Analyzer<'a> {
    sink: &'a mut DiagnosticSink,
    scopes: Vec<Scope>,
    current: usize,
    /// Names valid as `datasize`/`dataoffset` arguments in the object
    /// currently being analyzed.
    data_names: HashSet<String>,
    loop_depth: usize,
    function_depth: usize,
    info: SemanticInfo,
}

impl<'a> Analyzer<'a> {
    pub fn new(sink: &'a mut DiagnosticSink) -> Self {
        Self {
            sink,
            scopes: vec![Scope {
                parent: None,
                kind: ScopeKind::Block,
                symbols: HashMap::new(),
            }],
            current: 0,
            data_names: HashSet::new(),
            loop_depth: 0,
            function_depth: 0,
            info: SemanticInfo::default(),
        }
    }

    /// Analyzes an object tree, including nested sub-objects.
    pub fn analyze_object(&mut self, object: &Object) -> SemanticInfo {
        let saved_names = std::mem::take(&mut self.data_names);
        self.data_names = object
            .sub_objects
            .iter()
            .map(|o| o.name.clone())
            .chain(object.data_items.iter().map(|d| d.name.clone()))
            .collect();

        self.analyze_block(&object.code);
        for sub in &object.sub_objects {
            self.analyze_object(sub);
        }

        self.data_names = saved_names;
        self.info.clone()
    }

    fn analyze_block(&mut self, block: &Block) {
        self.enter_scope(ScopeKind::Block);
        self.declare_functions(block);
        for statement in &block.statements {
            self.analyze_statement(statement);
        }
        self.exit_scope();
    }

    /// Declaration pass: hoist every function defined directly in this
    /// block so statements before the definition can call it.
    fn declare_functions(&mut self, block: &Block) {
        for statement in &block.statements {
            if let Statement::FunctionDef(def) = statement {
                self.declare(
                    &def.name,
                    Symbol::Function {
                        params: def.params.len(),
                        returns: def.returns.len(),
                    },
                    def.span,
                );
                self.info.function_count += 1;
            }
        }
    }

    fn analyze_statement(&mut self, statement: &Statement) {
        match statement {
            Statement::VarDecl { names, init, span } => {
                if let Some(expr) = init {
                    let produced = self.analyze_expression(expr);
                    if produced != names.len() {
                        self.error(
                            *span,
                            format!(
                                "declaration of {} variable(s) initialized with {} value(s)",
                                names.len(),
                                produced
                            ),
                        );
                    }
                }
                for name in names {
                    self.declare(name, Symbol::Variable, *span);
                    self.info.variable_count += 1;
                }
            }
            Statement::Assign {
                targets,
                value,
                span,
            } => {
                let produced = self.analyze_expression(value);
                if produced != targets.len() {
                    self.error(
                        *span,
                        format!(
                            "assignment to {} target(s) from {} value(s)",
                            targets.len(),
                            produced
                        ),
                    );
                }
                for target in targets {
                    match self.resolve(target) {
                        Some(Symbol::Variable) => {}
                        Some(Symbol::Function { .. }) => {
                            self.error(*span, format!("cannot assign to function '{target}'"));
                        }
                        None => {
                            self.error(*span, format!("assignment to undeclared variable '{target}'"));
                        }
                    }
                }
            }
            Statement::Expr(expr) => {
                let produced = self.analyze_expression(expr);
                if produced != 0 {
                    self.error(
                        expr.span(),
                        format!("expression statement discards {produced} value(s)"),
                    );
                }
            }
            Statement::If {
                condition, body, ..
            } => {
                self.expect_single_value(condition);
                self.analyze_block(body);
            }
            Statement::Switch {
                scrutinee,
                cases,
                default,
                ..
            } => {
                self.expect_single_value(scrutinee);
                let mut seen = HashSet::new();
                for case in cases {
                    let word = case.value.as_word();
                    if !seen.insert(word) {
                        self.error(case.span, "duplicate switch case value".to_string());
                    }
                    self.analyze_block(&case.body);
                }
                if let Some(block) = default {
                    self.analyze_block(block);
                }
            }
            Statement::For {
                init,
                condition,
                post,
                body,
                ..
            } => {
                // The init block's scope encloses condition, post and
                // body; break/continue are legal only inside the body.
                self.enter_scope(ScopeKind::Block);
                self.declare_functions(init);
                for statement in &init.statements {
                    self.analyze_statement(statement);
                }
                self.expect_single_value(condition);
                self.analyze_block(post);
                self.loop_depth += 1;
                self.analyze_block(body);
                self.loop_depth -= 1;
                self.exit_scope();
            }
            Statement::Break(span) => {
                if self.loop_depth == 0 {
                    self.error(*span, "'break' outside of a for loop".to_string());
                }
            }
            Statement::Continue(span) => {
                if self.loop_depth == 0 {
                    self.error(*span, "'continue' outside of a for loop".to_string());
                }
            }
            Statement::Leave(span) => {
                if self.function_depth == 0 {
                    self.error(*span, "'leave' outside of a function".to_string());
                }
            }
            Statement::FunctionDef(def) => self.analyze_function(def),
            Statement::Block(block) => self.analyze_block(block),
        }
    }

    fn analyze_function(&mut self, def: &FunctionDef) {
        self.enter_scope(ScopeKind::Function);
        self.function_depth += 1;
        let saved_loop_depth = std::mem::replace(&mut self.loop_depth, 0);

        for param in &def.params {
            self.declare(param, Symbol::Variable, def.span);
        }
        for ret in &def.returns {
            self.declare(ret, Symbol::Variable, def.span);
        }

        // The body shares the parameter scope in Yul; reuse the
        // function scope as the body scope.
        self.declare_functions(&def.body);
        for statement in &def.body.statements {
            self.analyze_statement(statement);
        }

        self.loop_depth = saved_loop_depth;
        self.function_depth -= 1;
        self.exit_scope();
    }

    /// Analyzes an expression and returns how many values it produces.
    fn analyze_expression(&mut self, expr: &Expression) -> usize {
        match expr {
            Expression::Literal(_) => 1,
            Expression::Ident { name, span } => match self.resolve(name) {
                Some(Symbol::Variable) => 1,
                Some(Symbol::Function { .. }) => {
                    self.error(*span, format!("function '{name}' used as a value"));
                    1
                }
                None => {
                    self.error(*span, format!("undeclared identifier '{name}'"));
                    1
                }
            },
            Expression::Call(call) => self.analyze_call(call),
        }
    }

    fn analyze_call(&mut self, call: &Call) -> usize {
        if let Some(builtin) = builtins::lookup(&call.callee) {
            if builtin.wants_name_argument {
                match call.args.as_slice() {
                    [Expression::Literal(lit)]
                        if matches!(lit.value, crate::ast::LiteralValue::Str(_)) =>
                    {
                        if let crate::ast::LiteralValue::Str(name) = &lit.value {
                            if !self.data_names.contains(name) {
                                self.error(
                                    lit.span,
                                    format!(
                                        "'{}' argument \"{name}\" names no data segment or object",
                                        call.callee
                                    ),
                                );
                            }
                        }
                    }
                    _ => {
                        self.error(
                            call.span,
                            format!("'{}' takes a single literal string argument", call.callee),
                        );
                    }
                }
                return builtin.returns;
            }

            if call.args.len() != builtin.params {
                self.error(
                    call.span,
                    format!(
                        "builtin '{}' expects {} argument(s), got {}",
                        call.callee,
                        builtin.params,
                        call.args.len()
                    ),
                );
            }
            for arg in &call.args {
                self.expect_single_value(arg);
            }
            return builtin.returns;
        }

        match self.resolve(&call.callee) {
            Some(Symbol::Function { params, returns }) => {
                if call.args.len() != params {
                    self.error(
                        call.span,
                        format!(
                            "function '{}' expects {} argument(s), got {}",
                            call.callee,
                            params,
                            call.args.len()
                        ),
                    );
                }
                for arg in &call.args {
                    self.expect_single_value(arg);
                }
                returns
            }
            Some(Symbol::Variable) => {
                self.error(
                    call.callee_span,
                    format!("'{}' is a variable, not a function", call.callee),
                );
                for arg in &call.args {
                    self.expect_single_value(arg);
                }
                1
            }
            None => {
                self.error(
                    call.callee_span,
                    format!("call to undeclared function '{}'", call.callee),
                );
                for arg in &call.args {
                    self.expect_single_value(arg);
                }
                1
            }
        }
    }

    fn expect_single_value(&mut self, expr: &Expression) {
        let produced = self.analyze_expression(expr);
        if produced != 1 {
            self.error(
                expr.span(),
                format!("expected a single value, expression produces {produced}"),
            );
        }
    }

    // --- scope arena ------------------------------------------------------

    fn enter_scope(&mut self, kind: ScopeKind) {
        let scope = Scope {
            parent: Some(self.current),
            kind,
            symbols: HashMap::new(),
        };
        self.scopes.push(scope);
        self.current = self.scopes.len() - 1;
    }

    fn exit_scope(&mut self) {
        if let Some(parent) = self.scopes[self.current].parent {
            self.current = parent;
        }
    }

    fn declare(&mut self, name: &str, symbol: Symbol, span: Span) {
        if self.is_visible(name) {
            self.error(span, format!("'{name}' shadows an existing declaration"));
            return;
        }
        self.scopes[self.current]
            .symbols
            .insert(name.to_string(), symbol);
    }

    /// Walks parent indices outward. Variable lookups stop at function
    /// boundaries; function lookups cross them.
    fn resolve(&self, name: &str) -> Option<Symbol> {
        let mut index = Some(self.current);
        let mut crossed_function = false;
        while let Some(i) = index {
            let scope = &self.scopes[i];
            if let Some(symbol) = scope.symbols.get(name) {
                match symbol {
                    Symbol::Variable if crossed_function => {
                        // Hidden by the function barrier; keep walking in
                        // case an outer function shares the name.
                    }
                    _ => return Some(symbol.clone()),
                }
            }
            if scope.kind == ScopeKind::Function {
                crossed_function = true;
            }
            index = scope.parent;
        }
        None
    }

    fn is_visible(&self, name: &str) -> bool {
        let mut index = Some(self.current);
        let mut crossed_function = false;
        while let Some(i) = index {
            let scope = &self.scopes[i];
            if let Some(symbol) = scope.symbols.get(name) {
                match symbol {
                    // Variables beyond the function barrier are not
                    // visible, so they cannot conflict.
                    Symbol::Variable if crossed_function => {}
                    _ => return true,
                }
            }
            if scope.kind == ScopeKind::Function {
                crossed_function = true;
            }
            index = scope.parent;
        }
        false
    }

    fn error(&mut self, span: Span, message: String) {
        self.sink.error(Stage::Semantic, span, message);
    }
}

/// Convenience wrapper running analysis over a parsed object.
pub fn analyze(object: &Object, sink: &mut DiagnosticSink) -> SemanticInfo {
    Analyzer::new(sink).analyze_object(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;

    fn analyze_src(source: &str) -> DiagnosticSink {
        let (object, errors) = parse_source(source);
        assert!(errors.is_empty(), "parse errors: {errors:?}");
        let mut sink = DiagnosticSink::new();
        analyze(&object.unwrap(), &mut sink);
        sink
    }

    fn error_messages(source: &str) -> Vec<String> {
        analyze_src(source)
            .all()
            .iter()
            .map(|d| d.message.clone())
            .collect()
    }

    #[test]
    fn clean_program_has_no_diagnostics() {
        let sink = analyze_src(
            r#"{
                function double(x) -> y { y := add(x, x) }
                let a := double(21)
                sstore(0, a)
            }"#,
        );
        assert!(!sink.has_errors(), "{:?}", sink.all());
    }

    #[test]
    fn undeclared_identifier_is_one_error() {
        let sink = analyze_src("{ let x := y }");
        assert_eq!(sink.error_count(), 1);
        assert!(sink.all()[0].message.contains("undeclared identifier 'y'"));
    }

    #[test]
    fn forward_function_reference_resolves() {
        let sink = analyze_src("{ let a := f(1) function f(x) -> r { r := x } }");
        assert!(!sink.has_errors(), "{:?}", sink.all());
    }

    #[test]
    fn function_cannot_see_outer_variables() {
        let messages = error_messages("{ let outer := 1 function f() -> r { r := outer } }");
        assert!(messages.iter().any(|m| m.contains("undeclared identifier 'outer'")));
    }

    #[test]
    fn arity_mismatch_reported() {
        let messages = error_messages("{ let a := add(1) }");
        assert!(messages.iter().any(|m| m.contains("expects 2 argument(s)")));
    }

    #[test]
    fn misplaced_break_and_leave() {
        let messages = error_messages("{ break leave }");
        assert!(messages.iter().any(|m| m.contains("'break' outside")));
        assert!(messages.iter().any(|m| m.contains("'leave' outside")));
    }

    #[test]
    fn break_in_for_init_is_rejected() {
        let messages =
            error_messages("{ for { break } 1 { } { } }");
        assert!(messages.iter().any(|m| m.contains("'break' outside")));
    }

    #[test]
    fn break_in_for_body_is_fine() {
        let sink = analyze_src("{ for { let i := 0 } lt(i, 3) { i := add(i, 1) } { break } }");
        assert!(!sink.has_errors(), "{:?}", sink.all());
    }

    #[test]
    fn shadowing_is_rejected() {
        let messages = error_messages("{ let x := 1 { let x := 2 } }");
        assert!(messages.iter().any(|m| m.contains("shadows")));
    }

    #[test]
    fn assignment_targets_checked() {
        let messages = error_messages("{ function f() { } f := 1 }");
        assert!(messages.iter().any(|m| m.contains("cannot assign to function")));
    }

    #[test]
    fn value_count_mismatch() {
        let messages =
            error_messages("{ function two() -> a, b { } let x := two() }");
        assert!(messages
            .iter()
            .any(|m| m.contains("1 variable(s) initialized with 2")));
    }

    #[test]
    fn expression_statement_must_discard_nothing() {
        let messages = error_messages("{ add(1, 2) }");
        assert!(messages.iter().any(|m| m.contains("discards 1 value")));
    }

    #[test]
    fn datasize_requires_known_name() {
        let messages = error_messages(
            r#"object "C" {
                code { let s := datasize("nope") }
                object "runtime" { code { } }
            }"#,
        );
        assert!(messages.iter().any(|m| m.contains("names no data segment")));
    }

    #[test]
    fn datasize_of_subobject_resolves() {
        let sink = analyze_src(
            r#"object "C" {
                code { let s := datasize("runtime") }
                object "runtime" { code { } }
            }"#,
        );
        assert!(!sink.has_errors(), "{:?}", sink.all());
    }

    #[test]
    fn duplicate_case_values() {
        let messages = error_messages("{ switch 1 case 0 { } case 0 { } default { } }");
        assert!(messages.iter().any(|m| m.contains("duplicate switch case")));
    }
}
