//! Diagnostics collected across the compilation pipeline.
//!
//! Stages never abort on user errors; they push [`Diagnostic`]s into a
//! [`DiagnosticSink`] owned by the driver and keep going wherever
//! continuation is meaningful. A compilation failed iff at least one
//! error-severity diagnostic was recorded.

use crate::lexer::Span;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a diagnostic. Errors fail the build, warnings do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// Pipeline stage a diagnostic originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Lex,
    Parse,
    Semantic,
    Codegen,
    Optimize,
    Assemble,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Lex => "lex",
            Stage::Parse => "parse",
            Stage::Semantic => "semantic",
            Stage::Codegen => "codegen",
            Stage::Optimize => "optimize",
            Stage::Assemble => "assemble",
        };
        write!(f, "{name}")
    }
}

/// A single diagnostic with an optional source span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub stage: Stage,
    pub message: String,
    pub span: Option<Span>,
}

impl Diagnostic {
    pub fn error(stage: Stage, span: impl Into<Option<Span>>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            stage,
            message: message.into(),
            span: span.into(),
        }
    }

    pub fn warning(stage: Stage, span: impl Into<Option<Span>>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            stage,
            message: message.into(),
            span: span.into(),
        }
    }

    pub fn info(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            stage,
            message: message.into(),
            span: None,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sev = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        match &self.span {
            Some(span) => write!(
                f,
                "{sev}[{}] {}:{}: {}",
                self.stage, span.line, span.column, self.message
            ),
            None => write!(f, "{sev}[{}]: {}", self.stage, self.message),
        }
    }
}

/// Ordered collector threaded through the pipeline stages.
///
/// Diagnostics are kept in insertion order, which the driver arranges to
/// be source order within each stage.
#[derive(Debug, Default)]
pub struct DiagnosticSink {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn error(&mut self, stage: Stage, span: impl Into<Option<Span>>, message: impl Into<String>) {
        self.push(Diagnostic::error(stage, span, message));
    }

    pub fn warning(
        &mut self,
        stage: Stage,
        span: impl Into<Option<Span>>,
        message: impl Into<String>,
    ) {
        self.push(Diagnostic::warning(stage, span, message));
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .count()
    }

    pub fn all(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn into_parts(self) -> (Vec<Diagnostic>, Vec<Diagnostic>) {
        let (errors, rest): (Vec<_>, Vec<_>) = self
            .diagnostics
            .into_iter()
            .partition(|d| d.severity == Severity::Error);
        (errors, rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_partitions_by_severity() {
        let mut sink = DiagnosticSink::new();
        sink.error(Stage::Semantic, None, "undeclared identifier");
        sink.warning(Stage::Assemble, None, "script close to size limit");
        assert!(sink.has_errors());
        assert_eq!(sink.error_count(), 1);

        let (errors, warnings) = sink.into_parts();
        assert_eq!(errors.len(), 1);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn display_includes_stage_and_position() {
        let d = Diagnostic::error(
            Stage::Parse,
            Span {
                line: 3,
                column: 7,
                offset: 21,
                len: 1,
            },
            "expected '}'",
        );
        let text = d.to_string();
        assert!(text.contains("parse"));
        assert!(text.contains("3:7"));
    }
}
