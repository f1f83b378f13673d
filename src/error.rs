use crate::parser::SourceCode;
use annotate_snippets::display_list::{DisplayList, FormatOptions};
use annotate_snippets::snippet::{Annotation, AnnotationType, Slice, Snippet, SourceAnnotation};
use std::fmt::Formatter;

#[must_use]
pub struct FileIOError<'a> {
    file_path: &'a str,
    io_error: std::io::Error,
}

impl<'a> FileIOError<'a> {
    pub fn new(file_path: &'a str, io_error: std::io::Error) -> Self {
        FileIOError {
            file_path,
            io_error,
        }
    }

    pub fn emit(&self) -> ErrorReported {
        Diagnostic::new(format!("couldn't read {}: {}", self.file_path, self.io_error)).emit(None)
    }
}

impl std::fmt::Debug for FileIOError<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.io_error)
    }
}

pub fn default_format() -> FormatOptions {
    FormatOptions {
        color: true,
        anonymized_line_numbers: false,
        margin: None,
    }
}

/// Columns `begin..end` (0-based, end exclusive) of line `line` (1-based).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Location {
    pub line: usize,
    pub begin: usize,
    pub end: usize,
}

/// An error message, optionally pointing into a descriptor source, with trailing notes.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Diagnostic {
    title: String,
    at: Option<(Location, String)>,
    notes: Vec<String>,
}

impl Diagnostic {
    pub fn new(title: impl Into<String>) -> Self {
        Diagnostic {
            title: title.into(),
            at: None,
            notes: vec![],
        }
    }

    pub fn at(mut self, location: Location, annotation: impl Into<String>) -> Self {
        self.at = Some((location, annotation.into()));
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    /// Renders the diagnostic. The source line is shown only if `source` has it.
    pub fn render(&self, source: Option<&SourceCode>) -> String {
        let slices = match (&self.at, source) {
            (Some((loc, annotation)), Some(source)) => match source.get_line(loc.line) {
                Some(line) => vec![Slice {
                    source: line,
                    line_start: loc.line,
                    origin: source.file_path,
                    annotations: vec![SourceAnnotation {
                        range: (loc.begin, loc.end.min(line.len()).max(loc.begin)),
                        label: annotation.as_str(),
                        annotation_type: AnnotationType::Error,
                    }],
                    fold: false,
                }],
                None => vec![],
            },
            _ => vec![],
        };
        let snippet = Snippet {
            title: Some(Annotation {
                id: None,
                label: Some(self.title.as_str()),
                annotation_type: AnnotationType::Error,
            }),
            footer: self
                .notes
                .iter()
                .map(|note| Annotation {
                    id: None,
                    label: Some(note.as_str()),
                    annotation_type: AnnotationType::Note,
                })
                .collect(),
            slices,
            opt: default_format(),
        };
        DisplayList::from(snippet).to_string()
    }

    pub fn emit(&self, source: Option<&SourceCode>) -> ErrorReported {
        eprintln!("{}", self.render(source));
        ErrorReported
    }
}

/// Prints a diagnostic without source context.
pub fn emit_message(label: &str) -> ErrorReported {
    Diagnostic::new(label).emit(None)
}

pub struct ErrorReported;

impl std::fmt::Debug for ErrorReported {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Aborting due to previous error.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> Diagnostic {
        Diagnostic::new("expected `;`")
    }

    fn uncolored(diag: &Diagnostic, source: Option<&SourceCode>) -> String {
        // strip ANSI escapes so the assertions read the text only
        let rendered = diag.render(source);
        let mut out = String::new();
        let mut chars = rendered.chars();
        while let Some(c) = chars.next() {
            if c == '\u{1b}' {
                for c in chars.by_ref() {
                    if c == 'm' {
                        break;
                    }
                }
            } else {
                out.push(c);
            }
        }
        out
    }

    #[test]
    fn shows_the_offending_line() {
        let source = SourceCode::new("const n = 4\nlet x: i64 = \n".to_string());
        let diag = plain().at(
            Location {
                line: 2,
                begin: 4,
                end: 5,
            },
            "unexpected input",
        );
        let text = uncolored(&diag, Some(&source));
        assert!(text.contains("expected `;`"));
        assert!(text.contains("let x: i64 ="), "source line missing:\n{}", text);
        assert!(text.contains("unexpected input"));
    }

    #[test]
    fn location_past_the_source_keeps_the_title() {
        let source = SourceCode::new("x".to_string());
        let diag = plain().at(
            Location {
                line: 9,
                begin: 0,
                end: 1,
            },
            "here",
        );
        let text = uncolored(&diag, Some(&source));
        assert!(text.contains("expected `;`"));
        assert!(!text.contains("here"));
    }

    #[test]
    fn notes_follow_the_message() {
        let text = uncolored(&plain().note("while lowering segscan"), None);
        assert!(text.contains("while lowering segscan"));
    }
}
