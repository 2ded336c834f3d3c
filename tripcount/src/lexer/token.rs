//! Token definitions

use crate::ir::Type;
use logos::Logos;

/// Integer literal with an optional type suffix (`10u32`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntLit {
    pub value: u128,
    pub suffix: Option<Type>,
}

fn int_literal(text: &str, radix: u32) -> Option<IntLit> {
    let (digits, suffix) = match text.find(['i', 'u']) {
        Some(at) => (&text[..at], Some(Type::from_name(&text[at..])?)),
        None => (text, None),
    };
    let digits: String = digits.chars().filter(|&c| c != '_').collect();
    let value = u128::from_str_radix(&digits, radix).ok()?;
    Some(IntLit { value, suffix })
}

/// Loop IR token
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\n\r]+")]
#[logos(skip r"//[^\n]*")]
pub enum Token {
    // Keywords
    #[token("fn")]
    Fn,
    #[token("phi")]
    Phi,
    #[token("load")]
    Load,
    #[token("store")]
    Store,
    #[token("call")]
    Call,
    #[token("br")]
    Br,
    #[token("goto")]
    Goto,
    #[token("return")]
    Return,
    #[token("true")]
    True,
    #[token("false")]
    False,

    // Literals
    #[regex(r"0[xX][0-9a-fA-F][0-9a-fA-F_]*([iu][0-9]+)?", |lex| int_literal(&lex.slice()[2..], 16))]
    #[regex(r"[0-9][0-9_]*([iu][0-9]+)?", |lex| int_literal(lex.slice(), 10))]
    IntLit(IntLit),

    /// Variable, label, function or type name; `.` may appear after the
    /// first character (`i.next`)
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_.]*", |lex| lex.slice().to_string(), priority = 1)]
    Ident(String),

    // Delimiters
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token("=")]
    Eq,
    #[token("?")]
    Question,

    // Arithmetic and bitwise operators
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
    #[token("~")]
    Tilde,
    #[token("<<")]
    LtLt,
    #[token(">>")]
    GtGt,

    // Logical operators
    #[token("!")]
    Bang,
    #[token("&&")]
    AmpAmp,
    #[token("||")]
    PipePipe,

    // Comparison operators
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<")]
    Lt,
    #[token("<=")]
    LtEq,
    #[token(">")]
    Gt,
    #[token(">=")]
    GtEq,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Token::Fn => "fn",
            Token::Phi => "phi",
            Token::Load => "load",
            Token::Store => "store",
            Token::Call => "call",
            Token::Br => "br",
            Token::Goto => "goto",
            Token::Return => "return",
            Token::True => "true",
            Token::False => "false",
            Token::IntLit(lit) => {
                return match lit.suffix {
                    Some(ty) => write!(f, "{}{ty}", lit.value),
                    None => write!(f, "{}", lit.value),
                };
            }
            Token::Ident(name) => return write!(f, "{name}"),
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::Comma => ",",
            Token::Colon => ":",
            Token::Eq => "=",
            Token::Question => "?",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Percent => "%",
            Token::Amp => "&",
            Token::Pipe => "|",
            Token::Caret => "^",
            Token::Tilde => "~",
            Token::LtLt => "<<",
            Token::GtGt => ">>",
            Token::Bang => "!",
            Token::AmpAmp => "&&",
            Token::PipePipe => "||",
            Token::EqEq => "==",
            Token::NotEq => "!=",
            Token::Lt => "<",
            Token::LtEq => "<=",
            Token::Gt => ">",
            Token::GtEq => ">=",
        };
        write!(f, "{text}")
    }
}
