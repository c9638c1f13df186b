//! Expression evaluation.
//!
//! An [`Evaluator`] borrows the environment, function table and
//! configuration of an interpreter and turns an [`Expr`] into a [`Value`].
//! It never assigns variables; the only side effects are those of the
//! functions it calls (`ARRAY_PUSH` mutating a shared array, say).

use crate::ast::{Arg, BinOp, Expr, UnaryOp};
use crate::config::InterpreterConfig;
use crate::env::Environment;
use crate::error::ErrorKind;
use crate::functions::{CallArgs, FunctionTable};
use crate::interpolate::{interpolate, PlaceholderStyle};
use crate::value::{parse_number, Value};

/// Evaluates expressions against one environment.
pub struct Evaluator<'a> {
    pub env: &'a Environment,
    pub functions: &'a FunctionTable,
    pub config: &'a InterpreterConfig,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        env: &'a Environment,
        functions: &'a FunctionTable,
        config: &'a InterpreterConfig,
    ) -> Self {
        Self {
            env,
            functions,
            config,
        }
    }

    pub fn eval(&self, expr: &Expr) -> Result<Value, ErrorKind> {
        match expr {
            Expr::Str { value, interpolate } => {
                if *interpolate {
                    self.interpolate(value, PlaceholderStyle::Double).map(Value::String)
                } else {
                    Ok(Value::string(value.as_str()))
                }
            }
            Expr::Number(text) => parse_number(text)
                .filter(|n| n.is_finite())
                .map(Value::Number)
                .ok_or_else(|| ErrorKind::coercion(text, "a finite number")),
            Expr::Variable(name) => self.variable(name),
            Expr::Array(items) => {
                let values = items
                    .iter()
                    .map(|item| self.eval(item))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::array(values))
            }
            Expr::Index { target, index } => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                Ok(index_value(&target, &index))
            }
            Expr::Binary { left, op, right } => self.binary(left, *op, right),
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Neg => Ok(Value::Number(-number(&value)?)),
                    UnaryOp::Plus => Ok(Value::Number(number(&value)?)),
                    UnaryOp::Not => Ok(Value::Boolean(!value.is_truthy())),
                }
            }
            Expr::Call { name, args } => {
                let args = self.call_args(None, args)?;
                self.call_function(name, args)
            }
            Expr::Pipe { input, name, args } => {
                let input = self.eval(input)?;
                let args = self.call_args(Some(input), args)?;
                self.call_function(name, args)
            }
        }
    }

    fn call_args(&self, first: Option<Value>, args: &[Arg]) -> Result<CallArgs, ErrorKind> {
        let mut call = CallArgs::positional(first.into_iter().collect());
        for arg in args {
            let value = self.eval(&arg.value)?;
            match &arg.name {
                Some(name) => call.named.push((name.clone(), value)),
                None => call.positional.push(value),
            }
        }
        Ok(call)
    }

    /// Call a registered function, or the `ARG([n])` intrinsic.
    pub fn call_function(&self, name: &str, args: CallArgs) -> Result<Value, ErrorKind> {
        if name.eq_ignore_ascii_case("ARG") && args.named.is_empty() {
            return self.arg_intrinsic(&args.positional);
        }
        match self.functions.call(name, args) {
            Some(result) => result.map_err(|source| ErrorKind::Function {
                name: name.to_ascii_uppercase(),
                source,
            }),
            None => Err(ErrorKind::UndefinedFunction {
                name: name.to_string(),
            }),
        }
    }

    /// `ARG()` is the argument count; `ARG(n)` the n-th argument, or an
    /// empty string when it was not passed.
    fn arg_intrinsic(&self, positional: &[Value]) -> Result<Value, ErrorKind> {
        let args = self.env.args();
        match positional.first() {
            None => Ok(Value::Number(args.len() as f64)),
            Some(n) => {
                let index = n
                    .as_integer()
                    .filter(|&i| i >= 1)
                    .ok_or_else(|| ErrorKind::coercion(n, "a positive whole number"))?;
                Ok(args
                    .get(index as usize - 1)
                    .cloned()
                    .unwrap_or_else(|| Value::string("")))
            }
        }
    }

    fn binary(&self, left: &Expr, op: BinOp, right: &Expr) -> Result<Value, ErrorKind> {
        // Logical operators short-circuit.
        match op {
            BinOp::And => {
                let l = self.eval(left)?.is_truthy();
                return Ok(Value::Boolean(l && self.eval(right)?.is_truthy()));
            }
            BinOp::Or => {
                let l = self.eval(left)?.is_truthy();
                return Ok(Value::Boolean(l || self.eval(right)?.is_truthy()));
            }
            _ => {}
        }

        let l = self.eval(left)?;
        let r = self.eval(right)?;
        let value = match op {
            BinOp::Add => Value::Number(number(&l)? + number(&r)?),
            BinOp::Sub => Value::Number(number(&l)? - number(&r)?),
            BinOp::Mul => Value::Number(number(&l)? * number(&r)?),
            BinOp::Div => {
                let (a, b) = (number(&l)?, number(&r)?);
                if b == 0.0 {
                    return Err(ErrorKind::DivisionByZero);
                }
                Value::Number(a / b)
            }
            BinOp::Mod => {
                let (a, b) = (number(&l)?, number(&r)?);
                if b == 0.0 {
                    return Err(ErrorKind::DivisionByZero);
                }
                Value::Number(a % b)
            }
            BinOp::Power => Value::Number(number(&l)?.powf(number(&r)?)),
            BinOp::Concat => Value::String(format!("{l}{r}")),
            BinOp::BlankConcat => Value::String(format!("{l} {r}")),
            BinOp::Eq => Value::Boolean(l.compare(&r).is_eq()),
            BinOp::Ne => Value::Boolean(l.compare(&r).is_ne()),
            BinOp::Gt => Value::Boolean(l.compare(&r).is_gt()),
            BinOp::Lt => Value::Boolean(l.compare(&r).is_lt()),
            BinOp::Ge => Value::Boolean(l.compare(&r).is_ge()),
            BinOp::Le => Value::Boolean(l.compare(&r).is_le()),
            BinOp::Xor => Value::Boolean(l.is_truthy() != r.is_truthy()),
            BinOp::And | BinOp::Or => unreachable!("handled above"),
        };
        Ok(value)
    }

    /// Value of a variable reference.
    ///
    /// An exact name wins, then a property path from a defined root. Unset
    /// `TRUE`, `FALSE` and `NULL` are literals. Any other unset name is its
    /// own text, or an error with strict variables.
    pub fn variable(&self, name: &str) -> Result<Value, ErrorKind> {
        if let Some(value) = self.resolve(name) {
            return Ok(value);
        }
        match name.to_ascii_uppercase().as_str() {
            "TRUE" => return Ok(Value::Boolean(true)),
            "FALSE" => return Ok(Value::Boolean(false)),
            "NULL" => return Ok(Value::Null),
            _ => {}
        }
        if self.config.strict_variables {
            return Err(ErrorKind::UndefinedVariable {
                name: name.to_string(),
            });
        }
        Ok(Value::string(name))
    }

    /// Look up `name` as a variable or a property path (`user.address.city`).
    /// `None` when neither the name nor the path's root is set.
    pub fn resolve(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.env.get(name) {
            return Some(value);
        }
        let (root, path) = name.split_once('.')?;
        let root = self.env.get(root)?;
        let segments: Vec<&str> = path.split('.').collect();
        Some(root.get_path(&segments))
    }

    /// Substitute placeholders in `template` from the current frame.
    pub fn interpolate(&self, template: &str, style: PlaceholderStyle) -> Result<String, ErrorKind> {
        let options = self.config.interpolation_options();
        interpolate(template, style, &options, |name| {
            self.resolve(name)
                .filter(|value| !value.is_null())
                .map(|value| value.to_string())
        })
        .map_err(|unresolved| ErrorKind::UnresolvedPlaceholder {
            name: unresolved.name,
        })
    }
}

fn number(value: &Value) -> Result<f64, ErrorKind> {
    value
        .as_number()
        .ok_or_else(|| ErrorKind::coercion(value, "a number"))
}

/// `target[index]`: arrays are 1-based, objects are keyed by the index
/// text. Anything else yields `Null`.
fn index_value(target: &Value, index: &Value) -> Value {
    match target {
        Value::Array(items) => index
            .as_integer()
            .filter(|&i| i >= 1)
            .and_then(|i| items.borrow().get(i as usize - 1).cloned())
            .unwrap_or_default(),
        Value::Object(entries) => entries
            .borrow()
            .get(&index.to_string())
            .cloned()
            .unwrap_or_default(),
        _ => Value::Null,
    }
}
