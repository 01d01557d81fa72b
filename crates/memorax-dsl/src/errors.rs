use miette::Diagnostic;
use thiserror::Error;

use crate::ast::Span;

#[derive(Debug, Error, Diagnostic)]
pub enum ParseError {
    #[error("Syntax error: {message}")]
    #[diagnostic(code(memorax::parse::syntax))]
    Syntax {
        message: String,
        #[label("here")]
        span: miette::SourceSpan,
        #[source_code]
        src: miette::NamedSource<String>,
    },

    #[error("Missing required section: {section}")]
    #[diagnostic(code(memorax::parse::missing_section))]
    MissingSection { section: String },

    #[error("Duplicate declaration: {name}")]
    #[diagnostic(code(memorax::parse::duplicate))]
    Duplicate {
        name: String,
        #[label("redeclared here")]
        span: miette::SourceSpan,
        #[source_code]
        src: miette::NamedSource<String>,
    },

    #[error("Invalid integer literal '{literal}'")]
    #[diagnostic(code(memorax::parse::invalid_integer))]
    InvalidInteger {
        literal: String,
        #[label("does not fit in a 64-bit integer")]
        span: miette::SourceSpan,
        #[source_code]
        src: miette::NamedSource<String>,
    },

    #[error("Empty domain [{lo}:{hi}]")]
    #[diagnostic(
        code(memorax::parse::empty_domain),
        help("the lower bound of a domain must not exceed the upper bound")
    )]
    EmptyDomain {
        lo: i64,
        hi: i64,
        #[label("empty domain")]
        span: miette::SourceSpan,
        #[source_code]
        src: miette::NamedSource<String>,
    },

    #[error("{0}")]
    #[diagnostic(code(memorax::parse::multiple))]
    MultipleErrors(#[from] ParseErrors),
}

/// Wrapper for collecting multiple semantic parse errors.
///
/// After pest produces a valid parse tree, the AST-building phase can
/// encounter multiple recoverable semantic errors (duplicate
/// declarations, malformed literals, empty domains). This type collects
/// them all instead of failing on the first.
#[derive(Debug, Error)]
#[error("{}", format_parse_errors(.errors))]
pub struct ParseErrors {
    pub errors: Vec<ParseError>,
}

fn format_parse_errors(errors: &[ParseError]) -> String {
    if errors.len() == 1 {
        return errors[0].to_string();
    }
    let mut s = format!("{} parse errors:\n", errors.len());
    for (i, e) in errors.iter().enumerate() {
        s.push_str(&format!("  {}. {}\n", i + 1, e));
    }
    s
}

impl ParseErrors {
    /// Enrich all contained errors with source context.
    pub fn with_source_context(mut self, source: &str, filename: &str) -> Self {
        self.errors = self
            .errors
            .into_iter()
            .map(|e| e.with_source_context(source, filename))
            .collect();
        self
    }
}

impl ParseError {
    pub fn syntax(message: impl Into<String>, span: Span, source: &str, filename: &str) -> Self {
        ParseError::Syntax {
            message: message.into(),
            span: (span.start, span.end.saturating_sub(span.start)).into(),
            src: miette::NamedSource::new(filename, source.to_owned()),
        }
    }

    /// Enrich span-only error variants with source context for CLI
    /// rendering.
    ///
    /// Variants collected during the AST-building phase carry raw byte
    /// offsets. This method attaches the source text and filename so
    /// miette can render highlighted code snippets.
    pub fn with_source_context(self, source: &str, filename: &str) -> Self {
        match self {
            ParseError::Duplicate { name, span, .. } => ParseError::Duplicate {
                name,
                span,
                src: miette::NamedSource::new(filename, source.to_owned()),
            },
            ParseError::InvalidInteger { literal, span, .. } => ParseError::InvalidInteger {
                literal,
                span,
                src: miette::NamedSource::new(filename, source.to_owned()),
            },
            ParseError::EmptyDomain { lo, hi, span, .. } => ParseError::EmptyDomain {
                lo,
                hi,
                span,
                src: miette::NamedSource::new(filename, source.to_owned()),
            },
            ParseError::MultipleErrors(errs) => {
                ParseError::MultipleErrors(errs.with_source_context(source, filename))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_syntax_error() {
        let err = ParseError::syntax("unexpected token", Span::new(3, 7), "forbidden", "t.rmm");
        assert_eq!(err.to_string(), "Syntax error: unexpected token");
        match &err {
            ParseError::Syntax { span, .. } => {
                assert_eq!(span.offset(), 3);
                assert_eq!(span.len(), 4);
            }
            _ => panic!("expected Syntax variant"),
        }
    }

    #[test]
    fn display_missing_section() {
        let err = ParseError::MissingSection {
            section: "process".into(),
        };
        assert_eq!(err.to_string(), "Missing required section: process");
    }

    #[test]
    fn display_duplicate() {
        let err = ParseError::Duplicate {
            name: "x".into(),
            span: (0, 1).into(),
            src: miette::NamedSource::new("t.rmm", "x".to_owned()),
        };
        assert_eq!(err.to_string(), "Duplicate declaration: x");
    }

    #[test]
    fn parse_errors_single_formats_without_numbering() {
        let errs = ParseErrors {
            errors: vec![ParseError::MissingSection {
                section: "process".into(),
            }],
        };
        assert_eq!(errs.to_string(), "Missing required section: process");
    }

    #[test]
    fn parse_errors_multiple_format_with_count_and_numbering() {
        let errs = ParseErrors {
            errors: vec![
                ParseError::Duplicate {
                    name: "x".into(),
                    span: (0, 1).into(),
                    src: miette::NamedSource::new("", String::new()),
                },
                ParseError::MissingSection {
                    section: "process".into(),
                },
            ],
        };
        let msg = errs.to_string();
        assert!(msg.starts_with("2 parse errors:\n"));
        assert!(msg.contains("1. Duplicate declaration: x"));
        assert!(msg.contains("2. Missing required section: process"));
    }

    #[test]
    fn with_source_context_enriches_duplicate() {
        let err = ParseError::Duplicate {
            name: "x".into(),
            span: (0, 1).into(),
            src: miette::NamedSource::new("", String::new()),
        };
        match err.with_source_context("x = 0", "new.rmm") {
            ParseError::Duplicate { src, .. } => assert_eq!(src.name(), "new.rmm"),
            _ => panic!("expected Duplicate variant"),
        }
    }

    #[test]
    fn with_source_context_recurses_into_multiple() {
        let err = ParseError::MultipleErrors(ParseErrors {
            errors: vec![ParseError::EmptyDomain {
                lo: 2,
                hi: 1,
                span: (0, 5).into(),
                src: miette::NamedSource::new("", String::new()),
            }],
        });
        match err.with_source_context("[2:1]", "new.rmm") {
            ParseError::MultipleErrors(errs) => match &errs.errors[0] {
                ParseError::EmptyDomain { src, .. } => assert_eq!(src.name(), "new.rmm"),
                _ => panic!("expected EmptyDomain variant"),
            },
            _ => panic!("expected MultipleErrors variant"),
        }
    }
}
