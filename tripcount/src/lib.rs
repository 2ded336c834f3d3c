//! Loop trip-count inference
//!
//! Given a loop whose exit condition compares affine induction variables,
//! the engine in [`niter`] derives the number of iterations before the exit,
//! the assumptions that count depends on, and whether the loop may not run
//! at all. It also keeps a per-loop ledger of proven bounds that answers
//! whether an induction variable can be counted in a wider type.
//!
//! Loops are read from a small textual SSA IR (see [`parser`]).

pub mod config;
pub mod error;
pub mod ir;
pub mod lexer;
pub mod niter;
pub mod parser;
pub mod report;
pub mod span;

pub use config::NiterConfig;
pub use error::{NiterError, Result};
pub use niter::{NiterAnalyzer, NiterDescriptor};
pub use parser::{Program, parse};
pub use span::Span;
