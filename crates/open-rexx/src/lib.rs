#![forbid(unsafe_code)]
//! A REXX-family scripting language interpreter with pluggable ADDRESS
//! targets.
//!
//! This crate provides:
//!
//! - **Lexer & Parser**: total tokenizer, recursive-descent parser with
//!   heredocs, `LINES(n)` capture and PARSE templates
//! - **Interpreter Core**: expression evaluation, DO/IF/SELECT control
//!   flow, CALL/RETURN on an explicit cursor stack, PROCEDURE scoping
//! - **Function Table**: built-in string, array and JSON functions, plus
//!   host-registered ones
//! - **ADDRESS Dispatch**: async host handlers with a JSON response
//!   envelope and `RC`/`RESULT`/`ERRORTEXT` bookkeeping
//!
//! ```no_run
//! # async fn demo() -> Result<(), open_rexx::InterpError> {
//! let result = open_rexx::interpret("SAY 'Hello' 1 + 1").await?;
//! assert_eq!(result.output, vec!["Hello 2"]);
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod ast;
mod builtins;
pub mod config;
pub mod env;
pub mod error;
pub(crate) mod eval;
pub mod functions;
pub mod interpolate;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod source;
pub mod template;
pub mod token;
pub mod value;

pub use address::{
    AddressHandler, AddressRegistry, AddressRequest, AddressTarget, DispatchKind, HandlerError,
    HandlerFuture, Response, SourceContext,
};
pub use ast::{Command, CommandKind, Expr, Program};
pub use config::{AddressConfig, ConfigError, FailurePolicy, InterpolationConfig, InterpreterConfig};
pub use env::{CallFrame, Environment};
pub use error::{ErrorKind, InterpError, RuntimeError};
pub use functions::{CallArgs, FunctionError, FunctionTable};
pub use interpolate::{interpolate, InterpolationOptions, PlaceholderStyle};
pub use interpreter::{interpret, ExecResult, Interpreter};
pub use lexer::lex;
pub use parser::{parse, ParseError};
pub use source::SourceText;
pub use token::{Span, Token, TokenKind};
pub use value::Value;
