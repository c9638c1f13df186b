//! Interpreter error types.

use miette::Diagnostic;
use thiserror::Error;

use crate::env::CallFrame;
use crate::functions::FunctionError;
use crate::parser::ParseError;

/// What went wrong at runtime.
#[derive(Debug, Clone, PartialEq, Error, Diagnostic)]
pub enum ErrorKind {
    /// Division or remainder by zero.
    #[error("Division by zero")]
    #[diagnostic(code(rexx::division_by_zero))]
    DivisionByZero,

    /// A value could not be used as the required type.
    #[error("cannot use '{value}' as {expected}")]
    #[diagnostic(code(rexx::type_coercion))]
    TypeCoercion {
        /// Rendered offending value.
        value: String,
        /// What was required ("a number", "a collection", ...).
        expected: String,
    },

    /// CALL target is neither a label nor a registered function.
    #[error("undefined subroutine '{name}'")]
    #[diagnostic(code(rexx::undefined_subroutine))]
    UndefinedSubroutine { name: String },

    /// Function call to a name that is not registered.
    #[error("undefined function '{name}'")]
    #[diagnostic(code(rexx::undefined_function))]
    UndefinedFunction { name: String },

    /// Read of an unset variable with strict variables enabled.
    #[error("undefined variable '{name}'")]
    #[diagnostic(code(rexx::undefined_variable))]
    UndefinedVariable { name: String },

    /// Strict interpolation found a placeholder with no value.
    #[error("unresolved placeholder '{name}'")]
    #[diagnostic(code(rexx::unresolved_placeholder))]
    UnresolvedPlaceholder { name: String },

    /// A registered function failed.
    #[error("{name}: {source}")]
    #[diagnostic(code(rexx::function))]
    Function {
        name: String,
        #[source]
        source: FunctionError,
    },

    /// Dispatch to an ADDRESS target that is not registered.
    #[error("no ADDRESS target named '{name}'")]
    #[diagnostic(code(rexx::no_such_address_target))]
    NoSuchAddressTarget { name: String },

    /// A command clause with no active ADDRESS target.
    #[error("no active ADDRESS target for command '{command}'")]
    #[diagnostic(
        code(rexx::no_active_address),
        help("select a target with `ADDRESS name` or set address.default_target")
    )]
    NoActiveAddress { command: String },

    /// A method the target does not advertise.
    #[error("ADDRESS target '{target}' has no method '{method}'")]
    #[diagnostic(code(rexx::unknown_address_method))]
    UnknownAddressMethod { target: String, method: String },

    /// A handler raised an error and the failure policy is `abort`.
    #[error("handler for ADDRESS '{target}' failed: {message}")]
    #[diagnostic(code(rexx::handler_execution))]
    HandlerExecution { target: String, message: String },

    /// A handler reported failure and the failure policy is `abort`.
    #[error("ADDRESS '{target}' reported failure: {message}")]
    #[diagnostic(code(rexx::address_failure))]
    AddressFailure { target: String, message: String },

    /// CALL nesting exceeded `max_call_depth`.
    #[error("call depth limit of {limit} exceeded")]
    #[diagnostic(code(rexx::call_depth))]
    CallDepthExceeded { limit: usize },

    /// Bad loop header (zero step, bad repetition count).
    #[error("{message}")]
    #[diagnostic(code(rexx::invalid_loop))]
    InvalidLoop { message: String },

    /// LEAVE/ITERATE/PROCEDURE used where it has no meaning.
    #[error("{message}")]
    #[diagnostic(code(rexx::misplaced))]
    Misplaced { message: String },

    /// Indexed assignment past the end of an array.
    #[error("index {index} out of range for array of length {len}")]
    #[diagnostic(code(rexx::index_out_of_range))]
    IndexOutOfRange { index: i64, len: usize },
}

impl ErrorKind {
    pub(crate) fn coercion(value: impl ToString, expected: &str) -> Self {
        ErrorKind::TypeCoercion {
            value: value.to_string(),
            expected: expected.to_string(),
        }
    }

    pub(crate) fn misplaced(message: impl Into<String>) -> Self {
        ErrorKind::Misplaced {
            message: message.into(),
        }
    }
}

/// A runtime failure with the line it happened on and the active CALL
/// stack at that moment (outermost call first).
#[derive(Debug, Clone, PartialEq, Error)]
#[error("line {line}: {kind}")]
pub struct RuntimeError {
    pub line: u32,
    pub kind: ErrorKind,
    pub call_stack: Vec<CallFrame>,
}

impl Diagnostic for RuntimeError {
    fn code<'a>(&'a self) -> Option<Box<dyn std::fmt::Display + 'a>> {
        self.kind.code()
    }

    fn help<'a>(&'a self) -> Option<Box<dyn std::fmt::Display + 'a>> {
        if let Some(help) = self.kind.help() {
            return Some(help);
        }
        if self.call_stack.is_empty() {
            return None;
        }
        let frames: Vec<String> = self
            .call_stack
            .iter()
            .rev()
            .map(|f| format!("in {} (called from line {})", f.subroutine, f.caller_line))
            .collect();
        Some(Box::new(frames.join("\n")))
    }
}

/// Anything [`crate::Interpreter::run_source`] can fail with.
#[derive(Debug, Error, Diagnostic)]
pub enum InterpError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Runtime(#[from] RuntimeError),
}

impl InterpError {
    /// Line the error is attributed to.
    pub fn line(&self) -> u32 {
        match self {
            InterpError::Parse(e) => e.line(),
            InterpError::Runtime(e) => e.line,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_error_display_has_line() {
        let err = RuntimeError {
            line: 7,
            kind: ErrorKind::DivisionByZero,
            call_stack: Vec::new(),
        };
        assert_eq!(err.to_string(), "line 7: Division by zero");
    }

    #[test]
    fn runtime_error_help_lists_call_stack() {
        let err = RuntimeError {
            line: 9,
            kind: ErrorKind::DivisionByZero,
            call_stack: vec![
                CallFrame {
                    subroutine: "OUTER".to_string(),
                    caller_line: 1,
                    entry_line: 4,
                },
                CallFrame {
                    subroutine: "INNER".to_string(),
                    caller_line: 5,
                    entry_line: 8,
                },
            ],
        };
        let help = err.help().map(|h| h.to_string()).unwrap_or_default();
        assert_eq!(help, "in INNER (called from line 5)\nin OUTER (called from line 1)");
        assert_eq!(err.code().map(|c| c.to_string()).as_deref(), Some("rexx::division_by_zero"));
    }
}
