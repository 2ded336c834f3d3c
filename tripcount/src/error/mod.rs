//! Error types and reporting
//!
//! Trip-count analysis itself never fails: "cannot determine" is an explicit
//! `None`. The errors here come from the surfaces around the engine: reading
//! and parsing textual IR, validating a built function, and loading config.

use crate::span::Span;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, NiterError>;

/// Error raised outside the analysis proper
#[derive(Debug, Error)]
pub enum NiterError {
    #[error("Lexer error at {span:?}: {message}")]
    Lexer { message: String, span: Span },

    #[error("Parser error at {span:?}: {message}")]
    Parser { message: String, span: Span },

    /// Structurally invalid function (dangling label, double definition, ...)
    #[error("Invalid IR: {message}")]
    Ir { message: String },

    #[error("Config error: {message}")]
    Config { message: String },

    #[error("IO error: {message}")]
    Io { message: String },
}

impl NiterError {
    pub fn lexer(message: impl Into<String>, span: Span) -> Self {
        Self::Lexer {
            message: message.into(),
            span,
        }
    }

    pub fn parser(message: impl Into<String>, span: Span) -> Self {
        Self::Parser {
            message: message.into(),
            span,
        }
    }

    pub fn ir(message: impl Into<String>) -> Self {
        Self::Ir {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn io_error(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    pub fn span(&self) -> Option<Span> {
        match self {
            Self::Lexer { span, .. } => Some(*span),
            Self::Parser { span, .. } => Some(*span),
            Self::Ir { .. } | Self::Config { .. } | Self::Io { .. } => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Lexer { message, .. } => message,
            Self::Parser { message, .. } => message,
            Self::Ir { message } => message,
            Self::Config { message } => message,
            Self::Io { message } => message,
        }
    }
}

impl From<std::io::Error> for NiterError {
    fn from(err: std::io::Error) -> Self {
        Self::io_error(err.to_string())
    }
}

/// Report error with ariadne
pub fn report_error(filename: &str, source: &str, error: &NiterError) -> std::io::Result<()> {
    use ariadne::{Color, Label, Report, ReportKind, Source};

    let kind = match error {
        NiterError::Lexer { .. } => "Lexer",
        NiterError::Parser { .. } => "Parser",
        NiterError::Ir { .. } => "IR",
        NiterError::Config { .. } => "Config",
        NiterError::Io { .. } => "IO",
    };

    if let Some(span) = error.span() {
        Report::build(ReportKind::Error, (filename, span.range()))
            .with_message(format!("{kind} error"))
            .with_label(
                Label::new((filename, span.range()))
                    .with_message(error.message())
                    .with_color(Color::Red),
            )
            .finish()
            .eprint((filename, Source::from(source)))
    } else {
        // Errors without span (IR validation, config, IO)
        Report::build(ReportKind::Error, (filename, 0..0))
            .with_message(format!("{kind} error: {}", error.message()))
            .finish()
            .eprint((filename, Source::from(source)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_only_on_source_errors() {
        let err = NiterError::parser("expected `:`", Span::new(3, 4));
        assert_eq!(err.span(), Some(Span::new(3, 4)));
        assert!(NiterError::ir("duplicate block `entry`").span().is_none());
    }

    #[test]
    fn test_io_conversion_keeps_message() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.ir");
        let err: NiterError = io.into();
        assert!(matches!(err, NiterError::Io { .. }));
        assert!(err.message().contains("missing.ir"));
    }
}
