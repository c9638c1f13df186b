//! Function registry.
//!
//! Every callable name in an expression (`NAME(args)`, `x |> NAME`) and
//! every `CALL` target that is not a label resolves through a
//! [`FunctionTable`]. Functions declare their parameter names so callers
//! may pass arguments positionally, by name (`SEQ(start=1, end=5)`), or mix
//! the two. A function declared with no parameters is variadic and only
//! accepts positional arguments.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use miette::Diagnostic;
use thiserror::Error;

use crate::value::Value;

/// Errors raised by function implementations and argument binding.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum FunctionError {
    #[error("Invalid JSON: {0}")]
    #[diagnostic(code(rexx::function::invalid_json))]
    InvalidJson(String),

    #[error("Invalid array JSON: {0}")]
    #[diagnostic(code(rexx::function::invalid_array_json))]
    InvalidArrayJson(String),

    #[error("step cannot be zero")]
    #[diagnostic(code(rexx::function::zero_step))]
    ZeroStep,

    #[error("missing required argument '{0}'")]
    #[diagnostic(code(rexx::function::missing_argument))]
    MissingArgument(String),

    #[error("unknown parameter '{0}'")]
    #[diagnostic(code(rexx::function::unknown_parameter))]
    UnknownParameter(String),

    #[error("too many arguments (at most {max})")]
    #[diagnostic(code(rexx::function::too_many_arguments))]
    TooManyArguments { max: usize },

    #[error("cannot use '{value}' as {expected}")]
    #[diagnostic(code(rexx::function::bad_argument))]
    BadArgument { value: String, expected: String },

    #[error("index {index} out of range for array of length {len}")]
    #[diagnostic(code(rexx::function::index_out_of_range))]
    IndexOutOfRange { index: i64, len: usize },

    #[error("{0}")]
    #[diagnostic(code(rexx::function::failed))]
    Failed(String),
}

impl FunctionError {
    pub fn bad_argument(value: &Value, expected: &str) -> Self {
        FunctionError::BadArgument {
            value: value.to_string(),
            expected: expected.to_string(),
        }
    }
}

/// Signature of a native function: bound arguments in parameter order.
pub type NativeFn = Rc<dyn Fn(&[Value]) -> Result<Value, FunctionError>>;

/// A registered function.
#[derive(Clone)]
pub struct FunctionDef {
    name: String,
    params: Vec<String>,
    func: NativeFn,
}

impl FunctionDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn is_variadic(&self) -> bool {
        self.params.is_empty()
    }

    /// Call with already bound arguments.
    pub fn invoke(&self, args: &[Value]) -> Result<Value, FunctionError> {
        (self.func)(args)
    }

    /// Bind `args` to this function's parameters.
    ///
    /// Positional arguments fill parameters from the left; named arguments
    /// then fill by name (case-insensitive). Gaps become `Null` and
    /// trailing `Null`s are trimmed so functions can tell an omitted
    /// argument from an explicit one by length.
    pub fn bind(&self, args: CallArgs) -> Result<Vec<Value>, FunctionError> {
        if self.is_variadic() {
            if let Some((name, _)) = args.named.first() {
                return Err(FunctionError::UnknownParameter(name.clone()));
            }
            return Ok(args.positional);
        }

        if args.positional.len() > self.params.len() {
            return Err(FunctionError::TooManyArguments {
                max: self.params.len(),
            });
        }
        let mut bound: Vec<Option<Value>> = args.positional.into_iter().map(Some).collect();
        bound.resize(self.params.len(), None);

        for (name, value) in args.named {
            let slot = self
                .params
                .iter()
                .position(|p| p.eq_ignore_ascii_case(&name))
                .ok_or_else(|| FunctionError::UnknownParameter(name.clone()))?;
            if bound[slot].is_some() {
                return Err(FunctionError::Failed(format!(
                    "parameter '{}' given more than once",
                    self.params[slot]
                )));
            }
            bound[slot] = Some(value);
        }

        while matches!(bound.last(), Some(None)) {
            bound.pop();
        }
        Ok(bound.into_iter().map(Option::unwrap_or_default).collect())
    }
}

impl fmt::Debug for FunctionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDef")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Arguments as written at a call site.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub positional: Vec<Value>,
    pub named: Vec<(String, Value)>,
}

impl CallArgs {
    pub fn positional(values: Vec<Value>) -> Self {
        Self {
            positional: values,
            named: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.named.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Name to function map. Names are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct FunctionTable {
    defs: HashMap<String, FunctionDef>,
}

impl FunctionTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// A table preloaded with the built-in library.
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        crate::builtins::register_all(&mut table);
        table
    }

    /// Register (or replace) a function.
    pub fn register<F>(&mut self, name: &str, params: &[&str], func: F)
    where
        F: Fn(&[Value]) -> Result<Value, FunctionError> + 'static,
    {
        let def = FunctionDef {
            name: name.to_ascii_uppercase(),
            params: params.iter().map(|p| p.to_string()).collect(),
            func: Rc::new(func),
        };
        self.defs.insert(def.name.clone(), def);
    }

    pub fn get(&self, name: &str) -> Option<&FunctionDef> {
        self.defs.get(&name.to_ascii_uppercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<FunctionDef> {
        self.defs.remove(&name.to_ascii_uppercase())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.defs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Bind and invoke `name`. Returns `None` if it is not registered.
    pub fn call(&self, name: &str, args: CallArgs) -> Option<Result<Value, FunctionError>> {
        let def = self.get(name)?;
        Some(def.bind(args).and_then(|bound| def.invoke(&bound)))
    }
}
