//! Lexer implementation using logos

mod token;

pub use token::{IntLit, Token};

use crate::error::{NiterError, Result};
use crate::span::Span;
use logos::Logos;

/// Tokenize loop IR source
pub fn tokenize(source: &str) -> Result<Vec<(Token, Span)>> {
    let mut tokens = Vec::new();
    let mut lexer = Token::lexer(source);

    while let Some(result) = lexer.next() {
        let span = Span::from(lexer.span());
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(_) => {
                return Err(NiterError::lexer(
                    format!("unexpected input: {:?}", lexer.slice()),
                    span,
                ));
            }
        }
    }

    Ok(tokens)
}
