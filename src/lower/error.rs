use crate::error::{Diagnostic, ErrorReported, Location};
use crate::ir::Span;
use crate::parser::SourceCode;
use thiserror::Error;

#[must_use]
#[derive(Clone, PartialEq, Eq, Debug, Error)]
pub enum LowerError {
    /// A combination the lowering engine does not implement.
    #[error("compiler limitation: {what}")]
    Limitation { what: String, span: Option<Span> },
    /// A descriptor the dispatch did not expect; a logic error upstream.
    #[error("internal compiler error: {what} (in {construct})")]
    InternalBug {
        what: String,
        construct: String,
        span: Option<Span>,
    },
}

pub type LowerResult<T> = Result<T, LowerError>;

impl LowerError {
    pub fn limitation(what: impl Into<String>, span: Option<Span>) -> Self {
        LowerError::Limitation {
            what: what.into(),
            span,
        }
    }

    pub fn bug(what: impl Into<String>, construct: impl Into<String>, span: Option<Span>) -> Self {
        LowerError::InternalBug {
            what: what.into(),
            construct: construct.into(),
            span,
        }
    }

    pub fn is_limitation(&self) -> bool {
        matches!(self, LowerError::Limitation { .. })
    }

    pub fn span(&self) -> Option<Span> {
        match self {
            LowerError::Limitation { span, .. } | LowerError::InternalBug { span, .. } => *span,
        }
    }

    pub fn diagnostic(&self, source: &SourceCode) -> Diagnostic {
        let (what, annotation) = match self {
            LowerError::Limitation { what, .. } => {
                (format!("compiler limitation: {}", what), "not supported here")
            }
            LowerError::InternalBug { what, .. } => {
                (format!("internal compiler error: {}", what), "unexpected construct")
            }
        };
        let mut diag = Diagnostic::new(what);
        if let Some(loc) = self.span().and_then(|span| locate(source, span)) {
            diag = diag.at(loc, annotation);
        }
        if let LowerError::InternalBug { construct, .. } = self {
            diag = diag.note(format!("while lowering {}", construct));
        }
        diag
    }

    pub fn emit(&self, source: &SourceCode) -> ErrorReported {
        self.diagnostic(source).emit(Some(source))
    }
}

/// The columns a span covers on its first line.
fn locate(source: &SourceCode, span: Span) -> Option<Location> {
    let (line, begin) = source.get_line_col(span.begin)?;
    let end = match source.get_line_col(span.end) {
        Some((end_line, end)) if end_line == line => end,
        _ => usize::MAX,
    };
    Some(Location {
        line,
        begin: begin - 1,
        end: end.saturating_sub(1),
    })
}
