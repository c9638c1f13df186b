//! Abstract syntax tree.
//!
//! A program is a flat list of top-level commands plus a label table.
//! Block commands (`IF`, `DO`, `SELECT`) own their bodies as nested command
//! lists. Labels only appear at the top level, so a label resolves to an
//! index into [`Program::commands`] and a subroutine body is simply the
//! commands that follow it.
//!
//! `Display` renders commands and expressions in canonical form. The
//! executor uses it for trace lines, so string literals always render with
//! double quotes.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::template::Template;

/// A parsed program.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Program {
    pub commands: Vec<Command>,
    /// Uppercased label name to its index in `commands`. The first
    /// definition of a name wins.
    pub labels: HashMap<String, usize>,
}

impl Program {
    /// Index of the label `name` (case-insensitive).
    pub fn label(&self, name: &str) -> Option<usize> {
        self.labels.get(&name.to_ascii_uppercase()).copied()
    }
}

/// A single command with the line it starts on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub line: u32,
    pub kind: CommandKind,
}

/// Command variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CommandKind {
    /// `name:`
    Label(String),
    /// `SAY expr`
    Say(Expr),
    /// `[LET] target = value`
    Assign { target: AssignTarget, value: LetValue },
    /// `IF cond THEN ... [ELSE ...] [ENDIF]`
    If {
        condition: Expr,
        then_body: Vec<Command>,
        else_body: Vec<Command>,
    },
    /// `SELECT; WHEN cond THEN ...; OTHERWISE ...; END`
    Select {
        whens: Vec<WhenClause>,
        otherwise: Option<Vec<Command>>,
    },
    /// Any `DO` form.
    Do { control: DoControl, body: Vec<Command> },
    /// `CALL name args...`
    Call { name: String, args: Vec<Expr> },
    /// `RETURN [expr]`
    Return(Option<Expr>),
    /// `EXIT [expr]`
    Exit(Option<Expr>),
    /// `ADDRESS [name]`: switch (or reset) the active target.
    AddressSwitch(Option<String>),
    /// `ADDRESS name command text`: one-shot command to a named target.
    AddressCommand { target: String, payload: String },
    /// `ADDRESS name LINES(n)` with the next `n` physical lines.
    AddressLines {
        target: String,
        count: usize,
        payload: String,
    },
    /// `[ADDRESS name] <<DELIM ... DELIM`
    AddressHeredoc {
        target: Option<String>,
        delimiter: String,
        payload: String,
    },
    /// A clause that is not an instruction. Sent to the active ADDRESS
    /// target; `expr` holds the clause parsed as an expression, when it is
    /// one, for evaluation when no target is active.
    Raw { text: String, expr: Option<Expr> },
    /// `PARSE [UPPER] source template` or `ARG template`
    Parse {
        upper: bool,
        source: ParseSource,
        template: Template,
    },
    /// `PROCEDURE [EXPOSE names]`
    Procedure { expose: Vec<String> },
    /// `DROP names`
    Drop(Vec<String>),
    /// `LEAVE [name]`
    Leave(Option<String>),
    /// `ITERATE [name]`
    Iterate(Option<String>),
    /// `NOP`
    Nop,
}

/// Left-hand side of an assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignTarget {
    /// Variable name, possibly a dotted property path.
    pub name: String,
    /// `name[index]` form.
    pub index: Option<Expr>,
}

/// Right-hand side of an assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LetValue {
    Expr(Expr),
    /// `LET x = CALL name args`
    Call { name: String, args: Vec<Expr> },
    /// `LET x = <<DELIM ... DELIM`
    Heredoc { delimiter: String, body: String },
    /// `LET x = method p1=v1 p2=v2`: a registered function called with
    /// named arguments, or a method on the active ADDRESS target.
    Method {
        name: String,
        params: Vec<(String, Expr)>,
        raw: String,
    },
}

/// One `WHEN cond THEN ...` arm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhenClause {
    pub condition: Expr,
    pub body: Vec<Command>,
}

/// DO loop control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DoControl {
    /// `DO; ... END` (a plain block, not a loop).
    Simple,
    /// `DO FOREVER`
    Forever,
    /// `DO count`
    Repeat(Expr),
    /// `DO var = from TO to [BY step]`
    Range {
        var: String,
        from: Expr,
        to: Expr,
        by: Option<Expr>,
    },
    /// `DO WHILE cond` (tested before each iteration)
    While(Expr),
    /// `DO UNTIL cond` (tested after each iteration)
    Until(Expr),
    /// `DO var OVER collection`
    Over { var: String, collection: Expr },
}

/// PARSE source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ParseSource {
    Arg,
    Var(String),
    Value(Expr),
}

/// An expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Expr {
    /// A string literal. Double-quoted literals interpolate `{{name}}`.
    Str { value: String, interpolate: bool },
    /// A number literal, as written.
    Number(String),
    /// A variable reference, possibly a dotted path (`user.name`).
    Variable(String),
    /// `[a, b, c]`
    Array(Vec<Expr>),
    /// `target[index]`
    Index { target: Box<Expr>, index: Box<Expr> },
    Binary {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
    Unary { op: UnaryOp, operand: Box<Expr> },
    /// `name(args)`
    Call { name: String, args: Vec<Arg> },
    /// `input |> name(args)`: `input` becomes the first positional argument.
    Pipe {
        input: Box<Expr>,
        name: String,
        args: Vec<Arg>,
    },
}

impl Expr {
    pub fn string(value: impl Into<String>) -> Self {
        Expr::Str {
            value: value.into(),
            interpolate: false,
        }
    }

    /// True for expressions whose evaluation calls a function.
    pub fn is_call(&self) -> bool {
        matches!(self, Expr::Call { .. } | Expr::Pipe { .. })
    }
}

/// A function call argument, optionally named (`name=value`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Arg {
    pub name: Option<String>,
    pub value: Expr,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Power,
    /// `||`
    Concat,
    /// Blank concatenation (abuttal with whitespace).
    BlankConcat,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
    Xor,
}

impl BinOp {
    /// Binding strength; higher binds tighter.
    pub fn precedence(self) -> u8 {
        match self {
            BinOp::Or | BinOp::Xor => 1,
            BinOp::And => 2,
            BinOp::Eq | BinOp::Ne | BinOp::Gt | BinOp::Lt | BinOp::Ge | BinOp::Le => 3,
            BinOp::Concat | BinOp::BlankConcat => 4,
            BinOp::Add | BinOp::Sub => 5,
            BinOp::Mul | BinOp::Div | BinOp::Mod => 6,
            BinOp::Power => 7,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Power => "**",
            BinOp::Concat => "||",
            BinOp::BlankConcat => " ",
            BinOp::Eq => "=",
            BinOp::Ne => "\\=",
            BinOp::Gt => ">",
            BinOp::Lt => "<",
            BinOp::Ge => ">=",
            BinOp::Le => "<=",
            BinOp::And => "&",
            BinOp::Or => "|",
            BinOp::Xor => "&&",
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

/// Render `expr` as an operand of an operator with precedence `parent`.
fn operand(expr: &Expr, parent: u8) -> String {
    match expr {
        Expr::Binary { op, .. } if op.precedence() < parent => format!("({expr})"),
        Expr::Pipe { .. } => format!("({expr})"),
        _ => expr.to_string(),
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Str { value, .. } => write!(f, "{}", quote(value)),
            Expr::Number(n) => write!(f, "{n}"),
            Expr::Variable(name) => write!(f, "{name}"),
            Expr::Array(items) => write!(f, "[{}]", join(items)),
            Expr::Index { target, index } => write!(f, "{}[{index}]", operand(target, u8::MAX)),
            Expr::Binary { left, op, right } => {
                let p = op.precedence();
                let (l, r) = (operand(left, p), operand(right, p + 1));
                match op {
                    BinOp::BlankConcat => write!(f, "{l} {r}"),
                    BinOp::Concat => write!(f, "{l}||{r}"),
                    _ => write!(f, "{l} {} {r}", op.symbol()),
                }
            }
            Expr::Unary { op, operand: inner } => {
                let sign = match op {
                    UnaryOp::Neg => "-",
                    UnaryOp::Plus => "+",
                    UnaryOp::Not => "\\",
                };
                write!(f, "{sign}{}", operand(inner, u8::MAX))
            }
            Expr::Call { name, args } => write!(f, "{name}({})", join(args)),
            Expr::Pipe { input, name, args } => {
                write!(f, "{input} |> {name}")?;
                if !args.is_empty() {
                    write!(f, "({})", join(args))?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name}={}", self.value),
            None => write!(f, "{}", self.value),
        }
    }
}

impl fmt::Display for AssignTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.index {
            Some(index) => write!(f, "{}[{index}]", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl fmt::Display for LetValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LetValue::Expr(e) => write!(f, "{e}"),
            LetValue::Call { name, args } => {
                write!(f, "CALL {name}")?;
                if !args.is_empty() {
                    write!(f, " {}", join(args))?;
                }
                Ok(())
            }
            LetValue::Heredoc { delimiter, .. } => write!(f, "<<{delimiter}"),
            LetValue::Method { raw, .. } => write!(f, "{raw}"),
        }
    }
}

impl fmt::Display for DoControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DoControl::Simple => write!(f, "DO"),
            DoControl::Forever => write!(f, "DO FOREVER"),
            DoControl::Repeat(count) => write!(f, "DO {count}"),
            DoControl::Range { var, from, to, by } => {
                write!(f, "DO {var} = {from} TO {to}")?;
                if let Some(by) = by {
                    write!(f, " BY {by}")?;
                }
                Ok(())
            }
            DoControl::While(cond) => write!(f, "DO WHILE {cond}"),
            DoControl::Until(cond) => write!(f, "DO UNTIL {cond}"),
            DoControl::Over { var, collection } => write!(f, "DO {var} OVER {collection}"),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKind::Label(name) => write!(f, "{name}:"),
            CommandKind::Say(e) => write!(f, "SAY {e}"),
            CommandKind::Assign { target, value } => write!(f, "LET {target} = {value}"),
            CommandKind::If { condition, .. } => write!(f, "IF {condition} THEN"),
            CommandKind::Select { .. } => write!(f, "SELECT"),
            CommandKind::Do { control, .. } => write!(f, "{control}"),
            CommandKind::Call { name, args } => write!(f, "CALL {name} ({} args)", args.len()),
            CommandKind::Return(Some(e)) => write!(f, "RETURN {e}"),
            CommandKind::Return(None) => write!(f, "RETURN"),
            CommandKind::Exit(Some(e)) => write!(f, "EXIT {e}"),
            CommandKind::Exit(None) => write!(f, "EXIT"),
            CommandKind::AddressSwitch(Some(name)) => write!(f, "ADDRESS {name}"),
            CommandKind::AddressSwitch(None) => write!(f, "ADDRESS"),
            CommandKind::AddressCommand { target, payload } => {
                write!(f, "ADDRESS {target} {}", quote(payload))
            }
            CommandKind::AddressLines { target, count, .. } => {
                write!(f, "ADDRESS {target} LINES({count})")
            }
            CommandKind::AddressHeredoc {
                target: Some(target),
                delimiter,
                ..
            } => write!(f, "ADDRESS {target} <<{delimiter}"),
            CommandKind::AddressHeredoc { delimiter, .. } => write!(f, "<<{delimiter}"),
            CommandKind::Raw { text, .. } => write!(f, "{text}"),
            CommandKind::Parse {
                upper,
                source,
                template,
            } => {
                write!(f, "PARSE ")?;
                if *upper {
                    write!(f, "UPPER ")?;
                }
                match source {
                    ParseSource::Arg => write!(f, "ARG")?,
                    ParseSource::Var(name) => write!(f, "VAR {name}")?,
                    ParseSource::Value(e) => write!(f, "VALUE {e} WITH")?,
                }
                write!(f, " {template}")
            }
            CommandKind::Procedure { expose } if expose.is_empty() => write!(f, "PROCEDURE"),
            CommandKind::Procedure { expose } => write!(f, "PROCEDURE EXPOSE {}", expose.join(" ")),
            CommandKind::Drop(names) => write!(f, "DROP {}", names.join(" ")),
            CommandKind::Leave(Some(name)) => write!(f, "LEAVE {name}"),
            CommandKind::Leave(None) => write!(f, "LEAVE"),
            CommandKind::Iterate(Some(name)) => write!(f, "ITERATE {name}"),
            CommandKind::Iterate(None) => write!(f, "ITERATE"),
            CommandKind::Nop => write!(f, "NOP"),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}
