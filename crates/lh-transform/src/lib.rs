//! Transform-expression engine and payload fingerprinting.
//!
//! A transform is a small JSON-path-plus-object-construction expression that
//! turns an arbitrary webhook payload into a canonical event candidate:
//!
//! ```text
//! {"publisher": "github",
//!  "resource": {"type": "pull_request", "id": pull_request.id},
//!  "action": action = "opened" ? "created" : "updated",
//!  "timestamp": pull_request.created_at}
//! ```
//!
//! The language supports literals, field paths (`a.b.c`), equality and
//! ordering comparisons, conditional chains (`c ? t : e`), arithmetic,
//! string concatenation with `&`, and a handful of `$functions` (enough to
//! turn a Unix timestamp into ISO-8601 and pull fields apart).
//!
//! Evaluation is pure: `apply` never touches the outside world. A missing
//! path yields [`Value::Undefined`]; type-mismatched arithmetic is an error.
//! Schema validation of the *result* is the canonicaliser's job, not ours.

pub mod eval;
pub mod fingerprint;
pub mod lexer;
pub mod parser;
pub mod value;

pub use eval::apply;
pub use fingerprint::{canonical_string, fingerprint, type_skeleton};
pub use parser::{Expr, parse};
pub use value::Value;

use thiserror::Error;

/// Errors from parsing or evaluating a transform expression.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransformError {
    #[error("lex error at byte {pos}: {msg}")]
    Lex { pos: usize, msg: String },
    #[error("parse error at token {pos}: {msg}")]
    Parse { pos: usize, msg: String },
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("unknown function ${0}")]
    UnknownFunction(String),
    #[error("${name} expects {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("${name}: {msg}")]
    BadArgument { name: String, msg: String },
}

/// Parse `source` and evaluate it against `payload` in one step.
///
/// Stored mapping expressions are parsed on every application; expressions
/// are tiny and the parse cost is dwarfed by the surrounding I/O.
pub fn transform(source: &str, payload: &serde_json::Value) -> Result<Value, TransformError> {
    let expr = parse(source)?;
    apply(&expr, payload)
}
