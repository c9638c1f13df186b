//! Statement executor.
//!
//! The interpreter runs a parsed [`Program`] against its [`Environment`].
//! Control flow uses an explicit stack of cursors instead of host
//! recursion: the main program, every IF/SELECT/DO body, every loop and
//! every active CALL is one cursor over a slice of commands. CALL pushes a
//! cursor over the commands following the label; RETURN (or reaching the
//! next label) pops back to it.
//!
//! The only suspension point is ADDRESS dispatch. Each handler future is
//! awaited before the next command runs.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::address::{AddressRegistry, AddressRequest, AddressTarget, DispatchKind, SourceContext};
use crate::ast::{AssignTarget, Command, CommandKind, DoControl, Expr, LetValue, ParseSource, Program};
use crate::config::{FailurePolicy, InterpreterConfig};
use crate::env::{CallFrame, Environment};
use crate::error::{ErrorKind, InterpError, RuntimeError};
use crate::eval::Evaluator;
use crate::functions::{CallArgs, FunctionTable};
use crate::interpolate::PlaceholderStyle;
use crate::parser::parse;
use crate::template::{execute_parse, Template, TemplateElement};
use crate::value::{parse_number, Value};

/// Tolerance when counting `DO i = a TO b BY c` iterations, so that
/// fractional steps such as `BY 0.1` reach their end value.
const STEP_EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
//  Public API
// ---------------------------------------------------------------------------

/// Parse and run `source` with a default interpreter.
pub async fn interpret(source: &str) -> Result<ExecResult, InterpError> {
    Interpreter::new().run_source(source).await
}

/// Result of running a program.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecResult {
    /// Return code: the integer value of `EXIT`/top-level `RETURN`, else 0.
    pub rc: i64,
    /// Value given to `EXIT` or a top-level `RETURN`.
    pub value: Option<Value>,
    /// Lines produced by SAY.
    pub output: Vec<String>,
    /// `>> line statement` records, when tracing is enabled.
    pub trace: Vec<String>,
}

/// A script interpreter.
///
/// Owns its variables, function table and ADDRESS targets; nothing is
/// shared between instances. Values are reference counted without
/// synchronization, so an interpreter stays on one thread.
#[derive(Debug)]
pub struct Interpreter {
    env: Environment,
    functions: FunctionTable,
    targets: AddressRegistry,
    config: InterpreterConfig,
    script_name: Option<String>,
    output: Vec<String>,
    trace: Vec<String>,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    pub fn new() -> Self {
        Self::with_config(InterpreterConfig::default())
    }

    pub fn with_config(config: InterpreterConfig) -> Self {
        Self {
            env: Environment::new(),
            functions: FunctionTable::with_builtins(),
            targets: AddressRegistry::new(),
            config,
            script_name: None,
            output: Vec::new(),
            trace: Vec::new(),
        }
    }

    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut InterpreterConfig {
        &mut self.config
    }

    pub fn functions(&self) -> &FunctionTable {
        &self.functions
    }

    /// The function table, for registering host functions.
    pub fn functions_mut(&mut self) -> &mut FunctionTable {
        &mut self.functions
    }

    /// Register an ADDRESS target, replacing one with the same name.
    pub fn register_target(&mut self, target: AddressTarget) -> Option<AddressTarget> {
        debug!(target_name = target.name(), "registering ADDRESS target");
        self.targets.register(target)
    }

    pub fn targets(&self) -> &AddressRegistry {
        &self.targets
    }

    /// Name reported to handlers in [`SourceContext::script`].
    pub fn set_script_name(&mut self, name: impl Into<String>) {
        self.script_name = Some(name.into());
    }

    /// Arguments seen by `PARSE ARG` and `ARG()` in the main program.
    pub fn set_args(&mut self, args: Vec<Value>) {
        self.env.set_script_args(args);
    }

    pub fn set_variable(&mut self, name: &str, value: impl Into<Value>) {
        self.env.set(name, value.into());
    }

    pub fn variable(&self, name: &str) -> Option<Value> {
        self.env.get(name)
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// SAY output of the last run, including a run that failed.
    pub fn output(&self) -> &[String] {
        &self.output
    }

    /// Parse and run `source`.
    pub async fn run_source(&mut self, source: &str) -> Result<ExecResult, InterpError> {
        let program = parse(source)?;
        Ok(self.run(&program).await?)
    }

    /// Run a parsed program. Variables persist across runs; output and
    /// trace are collected afresh.
    pub async fn run(&mut self, program: &Program) -> Result<ExecResult, RuntimeError> {
        self.output.clear();
        self.trace.clear();
        let mut line = 0;
        match self.execute(program, &mut line).await {
            Ok(value) => Ok(ExecResult {
                rc: value.as_ref().and_then(Value::as_integer).unwrap_or(0),
                value,
                output: self.output.clone(),
                trace: self.trace.clone(),
            }),
            Err(kind) => {
                let err = RuntimeError {
                    line,
                    kind,
                    call_stack: self.env.call_stack().to_vec(),
                };
                self.env.unwind();
                debug!(line, error = %err.kind, "script failed");
                Err(err)
            }
        }
    }
}

// ---------------------------------------------------------------------------
//  Cursors
// ---------------------------------------------------------------------------

/// Position in one command list.
struct Cursor<'p> {
    commands: &'p [Command],
    next: usize,
    kind: CursorKind<'p>,
}

impl<'p> Cursor<'p> {
    fn new(commands: &'p [Command], kind: CursorKind<'p>) -> Self {
        Self {
            commands,
            next: 0,
            kind,
        }
    }
}

enum CursorKind<'p> {
    Main,
    /// IF, SELECT and plain DO bodies.
    Block,
    /// An active CALL. `assign_to` is the `LET x = CALL ...` target.
    Subroutine { assign_to: Option<&'p AssignTarget> },
    Loop(LoopState<'p>),
}

/// Iteration state of a DO loop.
enum LoopState<'p> {
    Forever,
    Repeat {
        remaining: u64,
    },
    Range {
        var: &'p str,
        start: f64,
        step: f64,
        count: u64,
        index: u64,
    },
    While(&'p Expr),
    Until(&'p Expr),
    Over {
        var: &'p str,
        items: Vec<Value>,
        index: usize,
    },
}

impl LoopState<'_> {
    fn var(&self) -> Option<&str> {
        match self {
            LoopState::Range { var, .. } | LoopState::Over { var, .. } => Some(*var),
            _ => None,
        }
    }
}

/// What the executor does after a command.
enum Flow {
    Next,
    /// The program is over, with the `EXIT`/`RETURN` value if any.
    End(Option<Value>),
}

fn push_block<'p>(stack: &mut Vec<Cursor<'p>>, body: &'p [Command]) {
    if !body.is_empty() {
        stack.push(Cursor::new(body, CursorKind::Block));
    }
}

/// Innermost loop cursor, optionally the one controlled by `name`. The
/// search stops at the current subroutine.
fn find_loop(stack: &[Cursor<'_>], name: Option<&str>) -> Option<usize> {
    for (i, cursor) in stack.iter().enumerate().rev() {
        match &cursor.kind {
            CursorKind::Loop(state) => {
                let matches = match name {
                    None => true,
                    Some(name) => state.var().is_some_and(|v| v.eq_ignore_ascii_case(name)),
                };
                if matches {
                    return Some(i);
                }
            }
            CursorKind::Block => {}
            CursorKind::Main | CursorKind::Subroutine { .. } => return None,
        }
    }
    None
}

// ---------------------------------------------------------------------------
//  Execution
// ---------------------------------------------------------------------------

impl Interpreter {
    async fn execute<'p>(
        &mut self,
        program: &'p Program,
        line: &mut u32,
    ) -> Result<Option<Value>, ErrorKind> {
        let mut stack = vec![Cursor::new(&program.commands, CursorKind::Main)];
        loop {
            let Some(cursor) = stack.last_mut() else {
                return Ok(None);
            };

            if cursor.next >= cursor.commands.len() {
                let finished = match &mut cursor.kind {
                    CursorKind::Main => return Ok(None),
                    CursorKind::Block => true,
                    CursorKind::Loop(state) => {
                        if self.advance_loop(state, false)? {
                            cursor.next = 0;
                            false
                        } else {
                            true
                        }
                    }
                    CursorKind::Subroutine { .. } => {
                        // Falling off the end of the program returns.
                        if let Flow::End(value) = self.return_from(&mut stack, None)? {
                            return Ok(value);
                        }
                        continue;
                    }
                };
                if finished {
                    stack.pop();
                }
                continue;
            }

            let commands = cursor.commands;
            let command = &commands[cursor.next];
            cursor.next += 1;
            *line = command.line;
            if let Flow::End(value) = self.step(program, &mut stack, command).await? {
                return Ok(value);
            }
        }
    }

    async fn step<'p>(
        &mut self,
        program: &'p Program,
        stack: &mut Vec<Cursor<'p>>,
        command: &'p Command,
    ) -> Result<Flow, ErrorKind> {
        let line = command.line;
        if !matches!(command.kind, CommandKind::Label(_) | CommandKind::Return(_)) {
            self.trace_line(command);
        }

        match &command.kind {
            // A label reached in sequence ends the subroutine (or program).
            CommandKind::Label(_) => return self.return_from(stack, None),
            CommandKind::Nop => {}
            CommandKind::Say(expr) => {
                let text = self.eval(expr)?.to_string();
                self.say(text);
            }
            CommandKind::Assign { target, value } => {
                self.assign_let(program, stack, line, target, value).await?;
            }
            CommandKind::If {
                condition,
                then_body,
                else_body,
            } => {
                let body = if self.eval(condition)?.is_truthy() {
                    then_body
                } else {
                    else_body
                };
                push_block(stack, body);
            }
            CommandKind::Select { whens, otherwise } => {
                let mut chosen = otherwise.as_deref();
                for when in whens {
                    if self.eval(&when.condition)?.is_truthy() {
                        chosen = Some(when.body.as_slice());
                        break;
                    }
                }
                if let Some(body) = chosen {
                    push_block(stack, body);
                }
            }
            CommandKind::Do { control, body } => self.enter_do(stack, control, body)?,
            CommandKind::Call { name, args } => self.call(program, stack, line, name, args, None)?,
            CommandKind::Return(expr) => {
                let value = expr.as_ref().map(|e| self.eval(e)).transpose()?;
                return self.return_from(stack, value);
            }
            CommandKind::Exit(expr) => {
                let value = expr.as_ref().map(|e| self.eval(e)).transpose()?;
                self.env.unwind();
                return Ok(Flow::End(value));
            }
            CommandKind::AddressSwitch(target) => {
                debug!(target_name = ?target, line, "ADDRESS switch");
                self.env.set_address(target.clone());
            }
            CommandKind::AddressCommand { target, payload } => {
                let source = self.source_context(line, DispatchKind::Command);
                self.dispatch(target, payload, source).await?;
            }
            CommandKind::AddressLines {
                target, payload, ..
            } => {
                let source = self.source_context(line, DispatchKind::Lines);
                self.dispatch(target, payload, source).await?;
            }
            CommandKind::AddressHeredoc {
                target,
                delimiter,
                payload,
            } => {
                let target = match target {
                    Some(target) => target.clone(),
                    None => self.active_target().ok_or_else(|| ErrorKind::NoActiveAddress {
                        command: format!("<<{delimiter}"),
                    })?,
                };
                let source = self.source_context(line, DispatchKind::Heredoc);
                self.dispatch(&target, payload, source).await?;
            }
            CommandKind::Raw { text, expr } => match self.active_target() {
                Some(target) => {
                    let source = self.source_context(line, DispatchKind::Instruction);
                    self.dispatch(&target, text, source).await?;
                }
                None => match expr {
                    // A bare function call runs for its side effects.
                    Some(expr) if expr.is_call() => {
                        self.eval(expr)?;
                    }
                    _ => {
                        return Err(ErrorKind::NoActiveAddress {
                            command: text.clone(),
                        })
                    }
                },
            },
            CommandKind::Parse {
                upper,
                source,
                template,
            } => self.parse_into(*upper, source, template)?,
            CommandKind::Procedure { expose } => {
                if self.env.depth() == 0 {
                    return Err(ErrorKind::misplaced("PROCEDURE is only valid inside a subroutine"));
                }
                self.env.make_private(expose);
            }
            CommandKind::Drop(names) => {
                for name in names {
                    self.env.drop_var(name);
                }
            }
            CommandKind::Leave(name) => {
                let index = find_loop(stack, name.as_deref())
                    .ok_or_else(|| ErrorKind::misplaced(no_loop("LEAVE", name.as_deref())))?;
                stack.truncate(index);
            }
            CommandKind::Iterate(name) => {
                let index = find_loop(stack, name.as_deref())
                    .ok_or_else(|| ErrorKind::misplaced(no_loop("ITERATE", name.as_deref())))?;
                stack.truncate(index + 1);
                let cursor = &mut stack[index];
                cursor.next = cursor.commands.len();
            }
        }
        Ok(Flow::Next)
    }

    fn trace_line(&mut self, command: &Command) {
        trace!(line = command.line, statement = %command.kind, "execute");
        if self.config.trace {
            let record = format!(">> {} {}", command.line, command.kind);
            if self.config.echo {
                eprintln!("{record}");
            }
            self.trace.push(record);
        }
    }

    fn say(&mut self, text: String) {
        if self.config.echo {
            println!("{text}");
        }
        self.output.push(text);
    }

    fn evaluator(&self) -> Evaluator<'_> {
        Evaluator::new(&self.env, &self.functions, &self.config)
    }

    fn eval(&self, expr: &Expr) -> Result<Value, ErrorKind> {
        self.evaluator().eval(expr)
    }

    fn number(&self, expr: &Expr) -> Result<f64, ErrorKind> {
        let value = self.eval(expr)?;
        value
            .as_number()
            .ok_or_else(|| ErrorKind::coercion(&value, "a number"))
    }

    // -- Loops --------------------------------------------------------------

    fn enter_do<'p>(
        &mut self,
        stack: &mut Vec<Cursor<'p>>,
        control: &'p DoControl,
        body: &'p [Command],
    ) -> Result<(), ErrorKind> {
        let mut state = match control {
            DoControl::Simple => {
                push_block(stack, body);
                return Ok(());
            }
            DoControl::Forever => LoopState::Forever,
            DoControl::Repeat(count) => {
                let value = self.eval(count)?;
                let remaining = value.as_integer().filter(|n| *n >= 0).ok_or_else(|| {
                    ErrorKind::InvalidLoop {
                        message: format!("repetition count '{value}' is not a whole number"),
                    }
                })?;
                LoopState::Repeat {
                    remaining: remaining as u64,
                }
            }
            DoControl::Range { var, from, to, by } => {
                let start = self.number(from)?;
                let end = self.number(to)?;
                let step = match by {
                    Some(by) => self.number(by)?,
                    None if end < start => -1.0,
                    None => 1.0,
                };
                if step == 0.0 {
                    return Err(ErrorKind::InvalidLoop {
                        message: "step cannot be zero".to_string(),
                    });
                }
                let span = (end - start) / step;
                if !span.is_finite() {
                    return Err(ErrorKind::InvalidLoop {
                        message: format!("range {start} TO {end} BY {step} is not finite"),
                    });
                }
                let count = if span < -STEP_EPSILON {
                    0
                } else {
                    let passes = (span + STEP_EPSILON).floor() + 1.0;
                    if passes >= u64::MAX as f64 {
                        u64::MAX
                    } else {
                        passes as u64
                    }
                };
                LoopState::Range {
                    var,
                    start,
                    step,
                    count,
                    index: 0,
                }
            }
            DoControl::While(cond) => LoopState::While(cond),
            DoControl::Until(cond) => LoopState::Until(cond),
            DoControl::Over { var, collection } => LoopState::Over {
                var,
                items: over_items(&self.eval(collection)?)?,
                index: 0,
            },
        };

        if self.advance_loop(&mut state, true)? {
            stack.push(Cursor::new(body, CursorKind::Loop(state)));
        }
        Ok(())
    }

    /// Decide whether the loop runs (again), binding the control variable
    /// for the coming pass. `first` is the check before the first pass.
    fn advance_loop(&mut self, state: &mut LoopState<'_>, first: bool) -> Result<bool, ErrorKind> {
        let again = match state {
            LoopState::Forever => true,
            LoopState::Repeat { remaining } => {
                if *remaining == 0 {
                    false
                } else {
                    *remaining -= 1;
                    true
                }
            }
            LoopState::Range {
                var,
                start,
                step,
                count,
                index,
            } => {
                if !first {
                    *index += 1;
                }
                if *index >= *count {
                    false
                } else {
                    let value = *start + *index as f64 * *step;
                    self.env.set(*var, Value::Number(value));
                    true
                }
            }
            LoopState::While(cond) => self.eval(*cond)?.is_truthy(),
            LoopState::Until(cond) => first || !self.eval(*cond)?.is_truthy(),
            LoopState::Over { var, items, index } => {
                if !first {
                    *index += 1;
                }
                match items.get(*index) {
                    Some(item) => {
                        self.env.set(*var, item.clone());
                        true
                    }
                    None => false,
                }
            }
        };
        Ok(again)
    }

    // -- Calls --------------------------------------------------------------

    fn call<'p>(
        &mut self,
        program: &'p Program,
        stack: &mut Vec<Cursor<'p>>,
        line: u32,
        name: &str,
        args: &[Expr],
        assign_to: Option<&'p AssignTarget>,
    ) -> Result<(), ErrorKind> {
        let values = args
            .iter()
            .map(|arg| self.eval(arg))
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(index) = program.label(name) {
            let limit = self.config.max_call_depth;
            if self.env.depth() >= limit {
                return Err(ErrorKind::CallDepthExceeded { limit });
            }
            let entry_line = program.commands[index].line;
            debug!(subroutine = name, line, depth = self.env.depth() + 1, "CALL");
            self.env.push_call(
                CallFrame {
                    subroutine: name.to_string(),
                    caller_line: line,
                    entry_line,
                },
                values,
            );
            stack.push(Cursor::new(
                &program.commands[index + 1..],
                CursorKind::Subroutine { assign_to },
            ));
            return Ok(());
        }

        // No such label: try the function table.
        let result = self
            .evaluator()
            .call_function(name, CallArgs::positional(values))
            .map_err(|err| match err {
                ErrorKind::UndefinedFunction { .. } => ErrorKind::UndefinedSubroutine {
                    name: name.to_string(),
                },
                other => other,
            })?;
        self.env.set("RESULT", result.clone());
        if let Some(target) = assign_to {
            self.assign(target, result)?;
        }
        Ok(())
    }

    /// Leave the innermost subroutine, or end the program when there is
    /// none.
    fn return_from(
        &mut self,
        stack: &mut Vec<Cursor<'_>>,
        value: Option<Value>,
    ) -> Result<Flow, ErrorKind> {
        let Some(index) = stack
            .iter()
            .rposition(|c| matches!(c.kind, CursorKind::Subroutine { .. }))
        else {
            return Ok(Flow::End(value));
        };
        let assign_to = match stack[index].kind {
            CursorKind::Subroutine { assign_to } => assign_to,
            _ => None,
        };
        stack.truncate(index);

        if let Some(frame) = self.env.pop_call() {
            debug!(subroutine = %frame.subroutine, "RETURN");
        }
        match &value {
            Some(value) => self.env.set("RESULT", value.clone()),
            None => {
                self.env.drop_var("RESULT");
            }
        }
        if let Some(target) = assign_to {
            self.assign(target, value.unwrap_or_default())?;
        }
        Ok(Flow::Next)
    }

    // -- Assignment ---------------------------------------------------------

    async fn assign_let<'p>(
        &mut self,
        program: &'p Program,
        stack: &mut Vec<Cursor<'p>>,
        line: u32,
        target: &'p AssignTarget,
        value: &'p LetValue,
    ) -> Result<(), ErrorKind> {
        match value {
            LetValue::Expr(expr) => {
                let value = self.eval(expr)?;
                self.assign(target, value)
            }
            LetValue::Call { name, args } => self.call(program, stack, line, name, args, Some(target)),
            LetValue::Heredoc { body, .. } => self.assign(target, Value::string(body.as_str())),
            LetValue::Method { name, params, raw } => {
                let mut named = Vec::with_capacity(params.len());
                for (param, expr) in params {
                    named.push((param.clone(), self.eval(expr)?));
                }

                if self.functions.contains(name) {
                    let value = self.evaluator().call_function(
                        name,
                        CallArgs {
                            positional: Vec::new(),
                            named,
                        },
                    )?;
                    return self.assign(target, value);
                }

                let Some(active) = self.active_target() else {
                    return Err(ErrorKind::UndefinedFunction { name: name.clone() });
                };
                let accepts = self
                    .targets
                    .get(&active)
                    .map(|t| t.accepts_method(name))
                    .ok_or_else(|| ErrorKind::NoSuchAddressTarget {
                        name: active.clone(),
                    })?;
                if !accepts {
                    return Err(ErrorKind::UnknownAddressMethod {
                        target: active,
                        method: name.clone(),
                    });
                }
                let mut source = self.source_context(line, DispatchKind::Method);
                source.method = Some(name.clone());
                source.params = named.into_iter().collect();
                let value = self.dispatch(&active, raw, source).await?;
                self.assign(target, value)
            }
        }
    }

    fn assign(&mut self, target: &AssignTarget, value: Value) -> Result<(), ErrorKind> {
        let Some(index) = &target.index else {
            return self.assign_name(&target.name, value);
        };
        let index = self.eval(index)?;
        let key = index.to_string();
        let container = self
            .evaluator()
            .resolve(&target.name)
            .filter(|v| !v.is_null());
        match container {
            Some(container @ (Value::Array(_) | Value::Object(_))) => {
                set_member(&container, &key, value)
            }
            Some(other) => Err(ErrorKind::coercion(&other, "an array or object")),
            None => {
                let container = if index.as_integer() == Some(1) {
                    Value::array(Vec::new())
                } else {
                    Value::object(BTreeMap::new())
                };
                set_member(&container, &key, value)?;
                self.assign_name(&target.name, container)
            }
        }
    }

    /// Assign a plain or dotted name. A dotted name whose root holds a
    /// collection (or is unset) writes through the property path.
    fn assign_name(&mut self, name: &str, value: Value) -> Result<(), ErrorKind> {
        if let Some((root, path)) = name.split_once('.') {
            if !self.env.contains(name) {
                let segments: Vec<&str> = path.split('.').collect();
                match self.env.get(root) {
                    Some(container @ (Value::Array(_) | Value::Object(_))) => {
                        return set_path(&container, &segments, value);
                    }
                    None => {
                        let container = Value::object(BTreeMap::new());
                        set_path(&container, &segments, value)?;
                        self.env.set(root, container);
                        return Ok(());
                    }
                    Some(_) => {}
                }
            }
        }
        self.env.set(name, value);
        Ok(())
    }

    // -- PARSE --------------------------------------------------------------

    fn parse_into(
        &mut self,
        upper: bool,
        source: &ParseSource,
        template: &Template,
    ) -> Result<(), ErrorKind> {
        let pairs = match source {
            ParseSource::Arg => self.parse_args(upper, template),
            ParseSource::Var(name) => {
                let text = self.evaluator().variable(name)?.to_string();
                self.apply_template(&[text], template, upper)
            }
            ParseSource::Value(expr) => {
                let text = self.eval(expr)?.to_string();
                self.apply_template(&[text], template, upper)
            }
        };

        let local = matches!(source, ParseSource::Arg);
        for (name, value) in pairs {
            if local {
                self.env.set_local(&name, value);
            } else {
                self.env.set(&name, value);
            }
        }
        Ok(())
    }

    /// `PARSE ARG`. A lone variable, or a plain name list with several
    /// arguments, binds argument values as they are (collections stay
    /// shared). Anything else parses the arguments' text.
    fn parse_args(&self, upper: bool, template: &Template) -> Vec<(String, Value)> {
        let args = self.env.args().to_vec();
        let raw = |value: Option<&Value>| match value {
            Some(Value::String(s)) if upper => Value::String(s.to_uppercase()),
            Some(value) => value.clone(),
            None => Value::string(""),
        };

        if let [piece] = template.pieces.as_slice() {
            if let [TemplateElement::Variable(name)] = piece.as_slice() {
                return vec![(name.clone(), raw(args.first()))];
            }
            if template.is_name_list() && args.len() > 1 {
                return piece
                    .iter()
                    .enumerate()
                    .filter_map(|(i, element)| match element {
                        TemplateElement::Variable(name) => Some((name.clone(), raw(args.get(i)))),
                        _ => None,
                    })
                    .collect();
            }
        }

        let texts: Vec<String> = args.iter().map(Value::to_string).collect();
        self.apply_template(&texts, template, upper)
    }

    /// Apply template piece `i` to `sources[i]` (empty when missing).
    fn apply_template(
        &self,
        sources: &[String],
        template: &Template,
        upper: bool,
    ) -> Vec<(String, Value)> {
        let evaluator = self.evaluator();
        let resolve = |name: &str| {
            evaluator
                .variable(name)
                .map(|v| v.to_string())
                .unwrap_or_default()
        };
        let mut pairs = Vec::new();
        for (i, piece) in template.pieces.iter().enumerate() {
            let text = sources.get(i).map(String::as_str).unwrap_or("");
            pairs.extend(
                execute_parse(text, piece, upper, &resolve)
                    .into_iter()
                    .map(|(name, value)| (name, Value::String(value))),
            );
        }
        pairs
    }

    // -- ADDRESS ------------------------------------------------------------

    /// Target for commands without an explicit one.
    fn active_target(&self) -> Option<String> {
        self.env
            .address()
            .map(str::to_string)
            .or_else(|| self.config.address.default_target.clone())
    }

    fn source_context(&self, line: u32, kind: DispatchKind) -> SourceContext {
        SourceContext {
            line,
            kind,
            method: None,
            params: BTreeMap::new(),
            script: self.script_name.clone(),
        }
    }

    /// Send `payload` to the target `name` and record the outcome in `RC`,
    /// `RESULT` and `ERRORTEXT`. Returns the result value (`Null` on
    /// failure or when the handler gave none).
    async fn dispatch(
        &mut self,
        name: &str,
        payload: &str,
        source: SourceContext,
    ) -> Result<Value, ErrorKind> {
        let target = self
            .targets
            .get(name)
            .cloned()
            .ok_or_else(|| ErrorKind::NoSuchAddressTarget {
                name: name.to_string(),
            })?;
        let message = if target.interpolates() {
            self.evaluator().interpolate(payload, PlaceholderStyle::Single)?
        } else {
            payload.to_string()
        };

        debug!(
            target_name = target.name(),
            line = source.line,
            kind = ?source.kind,
            "ADDRESS dispatch"
        );
        let request = AddressRequest {
            target: target.name().to_string(),
            message,
            context: self.env.snapshot(),
            source,
        };
        let response = target.dispatch(request).await;

        let rc = if response.success { 0.0 } else { 1.0 };
        self.env.set("RC", Value::Number(rc));
        if response.success {
            self.env.drop_var("ERRORTEXT");
            match &response.result {
                Some(result) => self.env.set("RESULT", result.clone()),
                None => {
                    self.env.drop_var("RESULT");
                }
            }
            return Ok(response.result.unwrap_or_default());
        }

        let message = response.message.clone().unwrap_or_default();
        self.env.set("ERRORTEXT", Value::string(message.as_str()));
        if self.config.address.failure_policy == FailurePolicy::Abort {
            let target = target.name().to_string();
            return Err(
                if response.operation.as_deref() == Some("handler_execution") {
                    ErrorKind::HandlerExecution { target, message }
                } else {
                    ErrorKind::AddressFailure { target, message }
                },
            );
        }
        Ok(Value::Null)
    }
}

fn no_loop(keyword: &str, name: Option<&str>) -> String {
    match name {
        Some(name) => format!("{keyword} {name}: no active loop controlled by '{name}'"),
        None => format!("{keyword} outside of a loop"),
    }
}

/// Items a `DO var OVER collection` visits: array elements, object keys in
/// order, or the words of a string.
fn over_items(value: &Value) -> Result<Vec<Value>, ErrorKind> {
    match value {
        Value::Array(items) => Ok(items.borrow().clone()),
        Value::Object(entries) => Ok(entries
            .borrow()
            .keys()
            .map(|k| Value::string(k.as_str()))
            .collect()),
        Value::String(s) => Ok(s.split_whitespace().map(|w| Value::string(w)).collect()),
        Value::Null => Ok(Vec::new()),
        other => Err(ErrorKind::coercion(other, "a collection")),
    }
}

/// Store `value` under `key`: an object key, or a 1-based array index
/// that replaces an element or appends one past the end.
fn set_member(container: &Value, key: &str, value: Value) -> Result<(), ErrorKind> {
    match container {
        Value::Object(entries) => {
            entries.borrow_mut().insert(key.to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = parse_number(key)
                .filter(|n| n.fract() == 0.0)
                .map(|n| n as i64)
                .ok_or_else(|| ErrorKind::coercion(key, "an array index"))?;
            let mut items = items.borrow_mut();
            let len = items.len();
            if index >= 1 && (index as usize) <= len {
                items[index as usize - 1] = value;
            } else if index >= 1 && index as usize == len + 1 {
                items.push(value);
            } else {
                return Err(ErrorKind::IndexOutOfRange { index, len });
            }
            Ok(())
        }
        other => Err(ErrorKind::coercion(other, "an object")),
    }
}

/// Store `value` at a property path below `container`, creating
/// intermediate objects.
fn set_path(container: &Value, segments: &[&str], value: Value) -> Result<(), ErrorKind> {
    let Some((last, parents)) = segments.split_last() else {
        return Ok(());
    };
    let mut current = container.clone();
    for segment in parents {
        let next = current.get_member(segment);
        current = match next {
            Value::Array(_) | Value::Object(_) => next,
            Value::Null => {
                let child = Value::object(BTreeMap::new());
                set_member(&current, segment, child.clone())?;
                child
            }
            other => return Err(ErrorKind::coercion(&other, "an object")),
        };
    }
    set_member(&current, last, value)
}

// ---------------------------------------------------------------------------
//  Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }

    fn run_with(interp: &mut Interpreter, source: &str) -> Result<ExecResult, InterpError> {
        block_on(interp.run_source(source))
    }

    fn run(source: &str) -> ExecResult {
        run_with(&mut Interpreter::new(), source).expect("script failed")
    }

    fn output(source: &str) -> Vec<String> {
        run(source).output
    }

    fn runtime_error(interp: &mut Interpreter, source: &str) -> RuntimeError {
        match run_with(interp, source) {
            Err(InterpError::Runtime(err)) => err,
            other => panic!("expected a runtime error, got {other:?}"),
        }
    }

    #[test]
    fn test_say_and_assignment() {
        assert_eq!(output("SAY 'Hello'"), vec!["Hello"]);
        assert_eq!(output("x = 10\ny = x * 2 + 1\nSAY y"), vec!["21"]);
        assert_eq!(output("LET msg = 'hi'\nSAY msg"), vec!["hi"]);
    }

    #[test]
    fn test_inline_if_else() {
        let src = "x = 5\nIF x > 3 THEN SAY 'big'\nELSE SAY 'small'";
        assert_eq!(output(src), vec!["big"]);
        let src = "x = 1\nIF x > 3 THEN SAY 'big'\nELSE SAY 'small'";
        assert_eq!(output(src), vec!["small"]);
    }

    #[test]
    fn test_block_if() {
        let src = "x = 5\nIF x > 3 THEN\n  SAY 'a'\n  SAY 'b'\nELSE\n  SAY 'c'\nENDIF\nSAY 'end'";
        assert_eq!(output(src), vec!["a", "b", "end"]);
    }

    #[test]
    fn test_select_runs_first_true_when_only() {
        let src = "x = 5\nSELECT\n  WHEN x > 1 THEN SAY 'first'\n  WHEN x > 2 THEN SAY 'second'\n  OTHERWISE SAY 'none'\nEND";
        assert_eq!(output(src), vec!["first"]);
        let src = "x = 0\nSELECT\n  WHEN x > 1 THEN SAY 'first'\n  OTHERWISE SAY 'none'\nEND";
        assert_eq!(output(src), vec!["none"]);
    }

    #[test]
    fn test_do_range_keeps_last_value() {
        let src = "DO i = 1 TO 3\n  SAY i\nEND\nSAY 'after' i";
        assert_eq!(output(src), vec!["1", "2", "3", "after 3"]);
    }

    #[test]
    fn test_do_range_counts_down_without_by() {
        assert_eq!(output("DO i = 3 TO 1\n  SAY i\nEND"), vec!["3", "2", "1"]);
        assert_eq!(output("DO i = 1 TO 10 BY 4\n  SAY i\nEND"), vec!["1", "5", "9"]);
        assert!(output("DO i = 1 TO 0 BY 1\n  SAY i\nEND").is_empty());
    }

    #[test]
    fn test_do_fractional_step_reaches_end() {
        let result = run("n = 0\nDO i = 0 TO 1 BY 0.25\n  n = n + 1\nEND\nSAY n");
        assert_eq!(result.output, vec!["5"]);
    }

    #[test]
    fn test_do_huge_finite_range_runs_until_leave() {
        let result = run("n = 0\nDO i = 1 TO 1E300\n  n = n + 1\n  IF n = 3 THEN LEAVE\nEND\nSAY n i");
        assert_eq!(result.output, vec!["3 3"]);
    }

    #[test]
    fn test_do_infinite_range_is_rejected() {
        let err = runtime_error(
            &mut Interpreter::new(),
            "n = 0\nDO i = 1 TO 10 ** 400\n  n = n + 1\n  IF n = 3 THEN LEAVE\nEND",
        );
        assert_eq!(err.line, 2);
        assert!(matches!(err.kind, ErrorKind::InvalidLoop { .. }));

        let err = runtime_error(&mut Interpreter::new(), "DO i = 0 TO 1E300 BY 1E-300\n  NOP\nEND");
        assert!(matches!(err.kind, ErrorKind::InvalidLoop { .. }));
    }

    #[test]
    fn test_do_zero_step() {
        let err = runtime_error(&mut Interpreter::new(), "DO i = 1 TO 5 BY 0\n  SAY i\nEND");
        assert_eq!(err.line, 1);
        assert_eq!(err.kind.to_string(), "step cannot be zero");
    }

    #[test]
    fn test_do_repeat_while_until() {
        assert_eq!(output("DO 3\n  SAY 'x'\nEND"), vec!["x", "x", "x"]);
        assert_eq!(output("n = 0\nDO WHILE n < 3\n  n = n + 1\nEND\nSAY n"), vec!["3"]);
        // UNTIL is checked after the body, so it runs at least once.
        assert_eq!(output("n = 10\nDO UNTIL n > 5\n  n = n + 1\nEND\nSAY n"), vec!["11"]);
    }

    #[test]
    fn test_do_forever_leave() {
        let src = "n = 0\nDO FOREVER\n  n = n + 1\n  IF n = 3 THEN LEAVE\nEND\nSAY n";
        assert_eq!(output(src), vec!["3"]);
    }

    #[test]
    fn test_iterate() {
        let src = "DO i = 1 TO 5\n  IF i % 2 = 0 THEN ITERATE\n  SAY i\nEND";
        assert_eq!(output(src), vec!["1", "3", "5"]);
    }

    #[test]
    fn test_leave_named_outer_loop() {
        let src = "DO i = 1 TO 3\n  DO j = 1 TO 3\n    IF j = 2 THEN LEAVE i\n    SAY i j\n  END\nEND\nSAY 'done'";
        assert_eq!(output(src), vec!["1 1", "done"]);
    }

    #[test]
    fn test_leave_outside_loop() {
        let err = runtime_error(&mut Interpreter::new(), "SAY 'a'\nLEAVE");
        assert_eq!(err.line, 2);
        assert!(matches!(err.kind, ErrorKind::Misplaced { .. }));
    }

    #[test]
    fn test_do_over() {
        let src = "items = [10, 20]\nDO item OVER items\n  SAY item\nEND";
        assert_eq!(output(src), vec!["10", "20"]);
        let src = "obj = JSON_PARSE('{\"b\": 1, \"a\": 2}')\nDO key OVER obj\n  SAY key\nEND";
        assert_eq!(output(src), vec!["a", "b"]);
    }

    #[test]
    fn test_call_sets_result() {
        let src = "CALL double 21\nSAY RESULT\nEXIT\ndouble:\n  PARSE ARG n\n  RETURN n * 2";
        assert_eq!(output(src), vec!["42"]);
    }

    #[test]
    fn test_let_call_assigns_return_value() {
        let src = "LET x = CALL add 2, 3\nSAY x\nEXIT\nadd:\n  PARSE ARG a, b\n  RETURN a + b";
        assert_eq!(output(src), vec!["5"]);
    }

    #[test]
    fn test_arg_intrinsic_in_subroutine() {
        let src = "CALL count 'a', 'b', 'c'\nSAY RESULT\nEXIT\ncount:\n  RETURN ARG()";
        assert_eq!(output(src), vec!["3"]);
    }

    #[test]
    fn test_nested_call_trace() {
        let src = "CALL sub1\nSAY \"done\"\nsub1:\nSAY \"in sub1\"\nCALL sub2\nRETURN\nsub2:\nSAY \"in sub2\"\nRETURN";
        let mut interp = Interpreter::new();
        interp.config_mut().trace = true;
        let result = run_with(&mut interp, src).unwrap();
        assert_eq!(result.output, vec!["in sub1", "in sub2", "done"]);
        assert_eq!(
            result.trace,
            vec![
                ">> 1 CALL sub1 (0 args)",
                ">> 4 SAY \"in sub1\"",
                ">> 5 CALL sub2 (0 args)",
                ">> 8 SAY \"in sub2\"",
                ">> 2 SAY \"done\"",
            ]
        );
    }

    #[test]
    fn test_array_argument_shared_unless_copied() {
        let src = "arr = [\"original\"]\nCALL modify arr\nSAY arr[1]\narr[1] = \"original\"\nCALL modify COPY(arr)\nSAY arr[1]\nEXIT\nmodify:\n  PARSE ARG a\n  a[1] = \"changed\"\n  RETURN";
        assert_eq!(output(src), vec!["changed", "original"]);
    }

    #[test]
    fn test_subroutine_inherits_caller_variables() {
        let src = "x = 1\nCALL bump\nSAY x\nEXIT\nbump:\n  x = x + 1\n  RETURN";
        assert_eq!(output(src), vec!["2"]);
    }

    #[test]
    fn test_procedure_expose() {
        let src = "x = 1\ny = 2\nCALL sub\nSAY x y\nEXIT\nsub:\n  PROCEDURE EXPOSE x\n  x = 10\n  y = 20\n  RETURN";
        assert_eq!(output(src), vec!["10 2"]);
    }

    #[test]
    fn test_procedure_at_top_level() {
        let err = runtime_error(&mut Interpreter::new(), "PROCEDURE");
        assert!(matches!(err.kind, ErrorKind::Misplaced { .. }));
    }

    #[test]
    fn test_main_program_ends_at_label() {
        assert_eq!(output("SAY 'main'\nsub:\nSAY 'sub'"), vec!["main"]);
    }

    #[test]
    fn test_exit_sets_rc() {
        let result = run("SAY 'a'\nEXIT 3\nSAY 'b'");
        assert_eq!(result.rc, 3);
        assert_eq!(result.value, Some(Value::Number(3.0)));
        assert_eq!(result.output, vec!["a"]);
    }

    #[test]
    fn test_exit_inside_subroutine_ends_program() {
        let result = run("CALL sub\nSAY 'not reached'\nsub:\n  EXIT 2");
        assert_eq!(result.rc, 2);
        assert!(result.output.is_empty());
    }

    #[test]
    fn test_division_by_zero_stops_script() {
        let mut interp = Interpreter::new();
        let err = runtime_error(&mut interp, "SAY 'before'\nSAY 10 / 0\nSAY 'after'");
        assert_eq!(err.line, 2);
        assert_eq!(err.kind, ErrorKind::DivisionByZero);
        assert_eq!(interp.output(), ["before"]);
    }

    #[test]
    fn test_error_carries_call_stack() {
        let src = "CALL outer\nEXIT\nouter:\n  CALL inner\n  RETURN\ninner:\n  x = 1 / 0\n  RETURN";
        let mut interp = Interpreter::new();
        let err = runtime_error(&mut interp, src);
        assert_eq!(err.line, 7);
        let names: Vec<&str> = err.call_stack.iter().map(|f| f.subroutine.as_str()).collect();
        assert_eq!(names, vec!["outer", "inner"]);
        assert_eq!(err.call_stack[1].caller_line, 4);
        assert_eq!(err.call_stack[1].entry_line, 6);
        assert_eq!(interp.environment().depth(), 0);
    }

    #[test]
    fn test_undefined_subroutine() {
        let err = runtime_error(&mut Interpreter::new(), "CALL nowhere");
        assert_eq!(
            err.kind,
            ErrorKind::UndefinedSubroutine {
                name: "nowhere".to_string()
            }
        );
    }

    #[test]
    fn test_call_falls_back_to_function() {
        assert_eq!(output("CALL UPPER 'abc'\nSAY RESULT"), vec!["ABC"]);
    }

    #[test]
    fn test_call_depth_limit() {
        let mut interp = Interpreter::new();
        interp.config_mut().max_call_depth = 5;
        let err = runtime_error(&mut interp, "CALL again\nEXIT\nagain:\n  CALL again\n  RETURN");
        assert_eq!(err.kind, ErrorKind::CallDepthExceeded { limit: 5 });
        assert_eq!(err.call_stack.len(), 5);
    }

    #[test]
    fn test_parse_value_and_var() {
        let src = "PARSE VALUE 'John Smith 42' WITH first last age\nSAY last first age";
        assert_eq!(output(src), vec!["Smith John 42"]);
        let src = "s = 'a,b'\nPARSE VAR s x ',' y\nSAY y x";
        assert_eq!(output(src), vec!["b a"]);
        let src = "PARSE UPPER VALUE 'quiet words' WITH w1 w2\nSAY w2";
        assert_eq!(output(src), vec!["WORDS"]);
    }

    #[test]
    fn test_script_args() {
        let mut interp = Interpreter::new();
        interp.set_args(vec!["first".into(), "second".into()]);
        let result = run_with(&mut interp, "PARSE ARG a, b\nSAY b a ARG()").unwrap();
        assert_eq!(result.output, vec!["second first 2"]);
    }

    #[test]
    fn test_indexed_assignment() {
        let src = "list = []\nlist[1] = 'a'\nlist[2] = 'b'\nSAY ARRAY_LENGTH(list) list[2]";
        assert_eq!(output(src), vec!["2 b"]);
        let err = runtime_error(&mut Interpreter::new(), "list = ['a']\nlist[5] = 'x'");
        assert_eq!(err.kind, ErrorKind::IndexOutOfRange { index: 5, len: 1 });
    }

    #[test]
    fn test_indexed_assignment_creates_collection() {
        assert_eq!(output("m['k'] = 1\nSAY m.k"), vec!["1"]);
        assert_eq!(output("a[1] = 'x'\nSAY ARRAY_LENGTH(a)"), vec!["1"]);
    }

    #[test]
    fn test_dotted_assignment_builds_objects() {
        let src = "user.name = 'Ada'\nuser.address.city = 'London'\nSAY user.name user.address.city";
        assert_eq!(output(src), vec!["Ada London"]);
    }

    #[test]
    fn test_drop() {
        assert_eq!(output("x = 1\nDROP x\nSAY x"), vec!["x"]);
    }

    #[test]
    fn test_interpolated_say() {
        assert_eq!(output("name = 'Ada'\nSAY \"Hi {{name}}\""), vec!["Hi Ada"]);
    }

    #[test]
    fn test_raw_without_target() {
        let err = runtime_error(&mut Interpreter::new(), "hello world");
        assert_eq!(
            err.kind,
            ErrorKind::NoActiveAddress {
                command: "hello world".to_string()
            }
        );
        // A bare function call is evaluated instead.
        let src = "list = []\nARRAY_PUSH(list, 1)\nSAY ARRAY_LENGTH(list)";
        assert_eq!(output(src), vec!["1"]);
    }

    #[test]
    fn test_strict_variables() {
        let mut interp = Interpreter::new();
        interp.config_mut().strict_variables = true;
        let err = runtime_error(&mut interp, "SAY nope");
        assert_eq!(
            err.kind,
            ErrorKind::UndefinedVariable {
                name: "nope".to_string()
            }
        );
    }

    #[test]
    fn test_variables_persist_between_runs() {
        let mut interp = Interpreter::new();
        interp.set_variable("greeting", "hello");
        run_with(&mut interp, "count = 1").unwrap();
        let result = run_with(&mut interp, "SAY greeting count").unwrap();
        assert_eq!(result.output, vec!["hello 1"]);
        assert_eq!(interp.variable("COUNT"), Some(Value::Number(1.0)));
    }

    #[test]
    fn test_interpret_free_function() {
        let result = block_on(interpret("SAY 1 + 1")).unwrap();
        assert_eq!(result.output, vec!["2"]);
        let err = block_on(interpret("SAY (")).unwrap_err();
        assert!(matches!(err, InterpError::Parse(_)));
    }
}
