//! Parser: builds a [`Program`] from a token stream.
//!
//! There are no reserved words, so the parser decides by position what a
//! symbol means. A clause that starts `name =` (or `name[...] =`) is an
//! assignment; a clause starting with an instruction keyword is that
//! instruction; a `name:` is a label; anything else is a command for the
//! active ADDRESS target.
//!
//! `ADDRESS target LINES(n)` captures physical lines straight from the
//! source and lexing restarts after them, so the captured text is never
//! tokenized for parsing.

use miette::Diagnostic;
use thiserror::Error;

use crate::ast::*;
use crate::lexer::{lex_from_line, lex_source};
use crate::source::SourceText;
use crate::template::{Template, TemplateElement};
use crate::token::{LexErrorKind, Token, TokenKind};

/// Parse error.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum ParseError {
    #[error("line {line}: expected {expected}, found {found}")]
    #[diagnostic(code(rexx::parse::unexpected))]
    Unexpected {
        expected: String,
        found: String,
        line: u32,
    },

    #[error("line {line}: unterminated string")]
    #[diagnostic(code(rexx::parse::unterminated_string))]
    UnterminatedString { line: u32 },

    #[error("line {line}: unterminated comment")]
    #[diagnostic(code(rexx::parse::unterminated_comment))]
    UnterminatedComment { line: u32 },

    #[error("line {line}: {keyword} is never closed")]
    #[diagnostic(code(rexx::parse::unterminated_block))]
    UnterminatedBlock { keyword: String, line: u32 },

    #[error("line {line}: heredoc <<{delimiter} is never closed")]
    #[diagnostic(
        code(rexx::parse::unterminated_heredoc),
        help("end the heredoc with a line containing only the delimiter")
    )]
    UnterminatedHeredoc { delimiter: String, line: u32 },

    #[error("line {line}: unexpected character '{ch}'")]
    #[diagnostic(code(rexx::parse::unexpected_char))]
    UnexpectedChar { ch: char, line: u32 },

    #[error("line {line}: {message}")]
    #[diagnostic(code(rexx::parse::syntax))]
    Syntax { line: u32, message: String },
}

impl ParseError {
    /// Line the error was found on.
    pub fn line(&self) -> u32 {
        match self {
            ParseError::Unexpected { line, .. }
            | ParseError::UnterminatedString { line }
            | ParseError::UnterminatedComment { line }
            | ParseError::UnterminatedBlock { line, .. }
            | ParseError::UnterminatedHeredoc { line, .. }
            | ParseError::UnexpectedChar { line, .. }
            | ParseError::Syntax { line, .. } => *line,
        }
    }
}

/// Parse script text into a program.
pub fn parse(source: &str) -> Result<Program, ParseError> {
    parse_source(&SourceText::new(source))
}

/// Parse already-normalized source.
pub fn parse_source(source: &SourceText) -> Result<Program, ParseError> {
    Parser::new(source).parse_program()
}

/// Symbols that end an abutted expression: clause keywords that may follow
/// an expression on the same line, plus the word operators.
const STOP_WORDS: &[&str] = &[
    "THEN", "ELSE", "ENDIF", "TO", "BY", "WHILE", "UNTIL", "OVER", "WITH", "END", "WHEN",
    "OTHERWISE", "AND", "OR",
];

/// Keywords that close a block and cannot start a command.
const CLOSERS: &[&str] = &["END", "ELSE", "ENDIF", "WHEN", "OTHERWISE", "THEN"];

fn is_keyword(sym: &str, kw: &str) -> bool {
    sym.eq_ignore_ascii_case(kw)
}

fn is_stop_word(sym: &str) -> bool {
    STOP_WORDS.iter().any(|kw| is_keyword(sym, kw))
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Eol | TokenKind::Eof | TokenKind::Error(_) => kind.to_string(),
        other => format!("'{other}'"),
    }
}

fn lex_error(kind: &LexErrorKind, line: u32) -> ParseError {
    match kind {
        LexErrorKind::UnterminatedString => ParseError::UnterminatedString { line },
        LexErrorKind::UnterminatedComment => ParseError::UnterminatedComment { line },
        LexErrorKind::UnterminatedHeredoc { delimiter } => ParseError::UnterminatedHeredoc {
            delimiter: delimiter.clone(),
            line,
        },
        LexErrorKind::HeredocMarker { delimiter } => ParseError::Syntax {
            line,
            message: format!("unexpected text after heredoc marker <<{delimiter}"),
        },
        LexErrorKind::UnexpectedChar(ch) => ParseError::UnexpectedChar { ch: *ch, line },
    }
}

/// Drop comments from raw command text, leaving quoted text alone.
fn strip_comments(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut quote: Option<char> = None;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                out.push(c);
                i += 1;
            }
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                out.push(c);
                i += 1;
            }
            None if c == '-' && chars.get(i + 1) == Some(&'-') => break,
            None if c == '/' && chars.get(i + 1) == Some(&'*') => {
                let mut depth = 1;
                i += 2;
                while i < chars.len() && depth > 0 {
                    if chars[i] == '*' && chars.get(i + 1) == Some(&'/') {
                        depth -= 1;
                        i += 2;
                    } else if chars[i] == '/' && chars.get(i + 1) == Some(&'*') {
                        depth += 1;
                        i += 2;
                    } else {
                        i += 1;
                    }
                }
            }
            None => {
                out.push(c);
                i += 1;
            }
        }
    }
    out.trim().to_string()
}

struct Parser<'a> {
    source: &'a SourceText,
    tokens: Vec<Token>,
    pos: usize,
    /// Block nesting; labels are only legal at depth 0.
    depth: usize,
    /// Inside the THEN arm of a one-line IF, where `ELSE` ends a clause.
    inline_then: usize,
    /// Whether juxtaposed terms concatenate. Off for CALL and method
    /// arguments, where blanks separate arguments.
    abuttal: bool,
}

impl<'a> Parser<'a> {
    fn new(source: &'a SourceText) -> Self {
        Self {
            source,
            tokens: lex_source(source),
            pos: 0,
            depth: 0,
            inline_then: 0,
            abuttal: true,
        }
    }

    fn parse_program(&mut self) -> Result<Program, ParseError> {
        let mut program = Program::default();

        loop {
            self.skip_separators();
            if self.at_eof() {
                break;
            }
            let command = self.parse_command()?;
            if let CommandKind::Label(name) = &command.kind {
                program
                    .labels
                    .entry(name.to_ascii_uppercase())
                    .or_insert(program.commands.len());
            }
            program.commands.push(command);
        }

        Ok(program)
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    fn parse_command(&mut self) -> Result<Command, ParseError> {
        self.check_clause()?;
        let line = self.current_line();
        let kind = self.parse_command_kind(line)?;
        Ok(Command { line, kind })
    }

    fn parse_command_kind(&mut self, line: u32) -> Result<CommandKind, ParseError> {
        if let TokenKind::Heredoc { delimiter, body } = self.kind().clone() {
            self.advance();
            self.end_clause()?;
            return Ok(CommandKind::AddressHeredoc {
                target: None,
                delimiter,
                payload: body,
            });
        }

        if self.is_label() {
            let name = self.expect_symbol()?;
            if self.depth > 0 {
                return Err(ParseError::Syntax {
                    line,
                    message: format!("label '{name}' is not allowed inside a block"),
                });
            }
            self.advance(); // skip ':'
            return Ok(CommandKind::Label(name));
        }

        if self.is_assignment_at(self.pos) {
            return self.parse_assignment();
        }
        if self.peek_keyword("LET") && self.is_assignment_at(self.pos + 1) {
            self.advance();
            return self.parse_assignment();
        }

        let keyword = match self.kind() {
            TokenKind::Symbol(s) => s.to_ascii_uppercase(),
            _ => String::new(),
        };
        match keyword.as_str() {
            "SAY" => self.parse_say(),
            "IF" => self.parse_if(line),
            "DO" => self.parse_do(line),
            "SELECT" => self.parse_select(line),
            "CALL" => self.parse_call(),
            "RETURN" => {
                self.advance();
                let value = self.parse_optional_expr()?;
                self.end_clause()?;
                Ok(CommandKind::Return(value))
            }
            "EXIT" => {
                self.advance();
                let value = self.parse_optional_expr()?;
                self.end_clause()?;
                Ok(CommandKind::Exit(value))
            }
            "ADDRESS" => self.parse_address(),
            "PARSE" => self.parse_parse(),
            "ARG" => {
                self.advance();
                let template = self.parse_template()?;
                self.end_clause()?;
                Ok(CommandKind::Parse {
                    upper: false,
                    source: ParseSource::Arg,
                    template,
                })
            }
            "PROCEDURE" => {
                self.advance();
                let mut expose = Vec::new();
                if self.peek_keyword("EXPOSE") {
                    self.advance();
                    expose = self.parse_name_list()?;
                }
                self.end_clause()?;
                Ok(CommandKind::Procedure { expose })
            }
            "DROP" => {
                self.advance();
                let names = self.parse_name_list()?;
                if names.is_empty() {
                    return Err(self.unexpected("variable name"));
                }
                self.end_clause()?;
                Ok(CommandKind::Drop(names))
            }
            "LEAVE" => {
                self.advance();
                let name = self.parse_optional_name()?;
                self.end_clause()?;
                Ok(CommandKind::Leave(name))
            }
            "ITERATE" => {
                self.advance();
                let name = self.parse_optional_name()?;
                self.end_clause()?;
                Ok(CommandKind::Iterate(name))
            }
            "NOP" => {
                self.advance();
                self.end_clause()?;
                Ok(CommandKind::Nop)
            }
            kw if CLOSERS.contains(&kw) => Err(self.unexpected("instruction")),
            _ => self.parse_raw(),
        }
    }

    fn parse_say(&mut self) -> Result<CommandKind, ParseError> {
        self.advance(); // skip SAY
        let expr = self
            .parse_optional_expr()?
            .unwrap_or_else(|| Expr::string(""));
        self.end_clause()?;
        Ok(CommandKind::Say(expr))
    }

    fn parse_assignment(&mut self) -> Result<CommandKind, ParseError> {
        let name = self.expect_symbol()?;
        let index = if self.kind() == &TokenKind::LBracket {
            self.advance();
            let index = self.with_abuttal(true, Self::parse_expr)?;
            self.expect(TokenKind::RBracket, "']'")?;
            Some(index)
        } else {
            None
        };
        self.expect(TokenKind::Eq, "'='")?;
        let value = self.parse_let_value()?;
        self.end_clause()?;
        Ok(CommandKind::Assign {
            target: AssignTarget { name, index },
            value,
        })
    }

    fn parse_let_value(&mut self) -> Result<LetValue, ParseError> {
        if let TokenKind::Heredoc { delimiter, body } = self.kind().clone() {
            self.advance();
            return Ok(LetValue::Heredoc { delimiter, body });
        }

        if self.peek_keyword("CALL") && matches!(self.kind_at(self.pos + 1), TokenKind::Symbol(_))
        {
            self.advance();
            let (name, args) = self.parse_call_target()?;
            return Ok(LetValue::Call { name, args });
        }

        // `name p=v ...`: a symbol, then a parameter assignment on the same line.
        if matches!(self.kind(), TokenKind::Symbol(_))
            && matches!(self.kind_at(self.pos + 1), TokenKind::Symbol(_))
            && self.kind_at(self.pos + 2) == &TokenKind::Eq
            && self.token_at(self.pos + 1).line() == self.current_line()
        {
            return self.parse_method();
        }

        Ok(LetValue::Expr(self.parse_expr()?))
    }

    fn parse_method(&mut self) -> Result<LetValue, ParseError> {
        let start = self.pos;
        let name = self.expect_symbol()?;
        let mut params = Vec::new();
        while !self.at_clause_end() {
            let param = self.expect_symbol()?;
            self.expect(TokenKind::Eq, "'='")?;
            let value = self.with_abuttal(false, Self::parse_expr)?;
            params.push((param, value));
            if self.kind() == &TokenKind::Comma {
                self.advance();
            }
        }
        let raw = self.raw_text(start, self.pos);
        Ok(LetValue::Method { name, params, raw })
    }

    fn parse_if(&mut self, line: u32) -> Result<CommandKind, ParseError> {
        self.advance(); // skip IF
        let condition = self.parse_expr()?;
        self.expect_keyword("THEN")?;

        if matches!(self.kind(), TokenKind::Eol | TokenKind::Semicolon) {
            // Block form, closed by ENDIF.
            let then_body = self.parse_body(&["ELSE", "ENDIF"], "IF", line)?;
            let else_body = if self.peek_keyword("ELSE") {
                self.advance();
                self.parse_body(&["ENDIF"], "IF", line)?
            } else {
                Vec::new()
            };
            self.advance(); // skip ENDIF
            self.end_clause()?;
            return Ok(CommandKind::If {
                condition,
                then_body,
                else_body,
            });
        }

        self.depth += 1;
        self.inline_then += 1;
        let then_cmd = self.parse_command();
        self.inline_then -= 1;
        let then_body = vec![then_cmd?];

        // ELSE may follow on the same line or a later one, but only when a
        // statement follows it on its own line. A bare ELSE belongs to an
        // enclosing block IF.
        let resume = self.pos;
        self.skip_separators();
        let else_body = if self.peek_keyword("ELSE") && self.else_has_statement() {
            self.advance();
            vec![self.parse_command()?]
        } else {
            self.pos = resume;
            Vec::new()
        };
        self.depth -= 1;

        Ok(CommandKind::If {
            condition,
            then_body,
            else_body,
        })
    }

    fn else_has_statement(&self) -> bool {
        let else_line = self.current_line();
        let next = self.token_at(self.pos + 1);
        !next.kind.is_clause_end() && next.line() == else_line
    }

    fn parse_do(&mut self, line: u32) -> Result<CommandKind, ParseError> {
        self.advance(); // skip DO
        let control = self.parse_do_control()?;
        self.end_clause()?;

        let body = self.parse_body(&["END"], "DO", line)?;
        self.advance(); // skip END

        let end_name = match self.kind() {
            TokenKind::Symbol(s) if !is_keyword(s, "ELSE") => Some(s.clone()),
            _ => None,
        };
        if let Some(name) = end_name {
            let loop_var = match &control {
                DoControl::Range { var, .. } | DoControl::Over { var, .. } => Some(var.as_str()),
                _ => None,
            };
            if let Some(var) = loop_var {
                if !name.eq_ignore_ascii_case(var) {
                    return Err(ParseError::Syntax {
                        line: self.current_line(),
                        message: format!("END {name} does not match DO {var}"),
                    });
                }
            }
            self.advance();
        }
        self.end_clause()?;

        Ok(CommandKind::Do { control, body })
    }

    fn parse_do_control(&mut self) -> Result<DoControl, ParseError> {
        if self.at_clause_end() {
            return Ok(DoControl::Simple);
        }
        if self.peek_keyword("FOREVER") {
            self.advance();
            return Ok(DoControl::Forever);
        }
        if self.peek_keyword("WHILE") {
            self.advance();
            return Ok(DoControl::While(self.parse_expr()?));
        }
        if self.peek_keyword("UNTIL") {
            self.advance();
            return Ok(DoControl::Until(self.parse_expr()?));
        }

        if matches!(self.kind(), TokenKind::Symbol(_)) {
            let next = self.kind_at(self.pos + 1);
            if next == &TokenKind::Eq {
                let var = self.expect_symbol()?;
                self.advance(); // skip '='
                let from = self.parse_expr()?;
                self.expect_keyword("TO")?;
                let to = self.parse_expr()?;
                let by = if self.peek_keyword("BY") {
                    self.advance();
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                return Ok(DoControl::Range { var, from, to, by });
            }
            if matches!(next, TokenKind::Symbol(s) if is_keyword(s, "OVER")) {
                let var = self.expect_symbol()?;
                self.advance(); // skip OVER
                let collection = self.parse_expr()?;
                return Ok(DoControl::Over { var, collection });
            }
        }

        Ok(DoControl::Repeat(self.parse_expr()?))
    }

    fn parse_select(&mut self, line: u32) -> Result<CommandKind, ParseError> {
        self.advance(); // skip SELECT
        self.end_clause()?;

        let mut whens = Vec::new();
        let mut otherwise = None;

        loop {
            self.skip_separators();
            if self.at_eof() {
                return Err(ParseError::UnterminatedBlock {
                    keyword: "SELECT".to_string(),
                    line,
                });
            }
            if self.at_closer("END") {
                self.advance();
                break;
            }
            if self.at_closer("WHEN") && otherwise.is_none() {
                self.advance();
                let condition = self.parse_expr()?;
                self.expect_keyword("THEN")?;
                let body = self.parse_body(&["WHEN", "OTHERWISE", "END"], "SELECT", line)?;
                whens.push(WhenClause { condition, body });
            } else if self.at_closer("OTHERWISE") && otherwise.is_none() {
                self.advance();
                otherwise = Some(self.parse_body(&["END"], "SELECT", line)?);
            } else {
                return Err(self.unexpected("WHEN, OTHERWISE or END"));
            }
        }
        if whens.is_empty() {
            return Err(ParseError::Syntax {
                line,
                message: "SELECT needs at least one WHEN".to_string(),
            });
        }
        self.end_clause()?;

        Ok(CommandKind::Select { whens, otherwise })
    }

    /// Parse commands until one of `closers` starts a clause. The closer is
    /// left for the caller.
    fn parse_body(
        &mut self,
        closers: &[&str],
        keyword: &str,
        open_line: u32,
    ) -> Result<Vec<Command>, ParseError> {
        self.depth += 1;
        let inline_then = std::mem::take(&mut self.inline_then);
        let mut body = Vec::new();
        let result = loop {
            self.skip_separators();
            if self.at_eof() {
                break Err(ParseError::UnterminatedBlock {
                    keyword: keyword.to_string(),
                    line: open_line,
                });
            }
            if closers.iter().any(|kw| self.at_closer(kw)) {
                break Ok(());
            }
            match self.parse_command() {
                Ok(command) => body.push(command),
                Err(e) => break Err(e),
            }
        };
        self.depth -= 1;
        self.inline_then = inline_then;
        result.map(|()| body)
    }

    fn parse_call(&mut self) -> Result<CommandKind, ParseError> {
        self.advance(); // skip CALL
        let (name, args) = self.parse_call_target()?;
        self.end_clause()?;
        Ok(CommandKind::Call { name, args })
    }

    /// `name arg1 arg2`, `name arg1, arg2` or `name(arg1, arg2)`.
    fn parse_call_target(&mut self) -> Result<(String, Vec<Expr>), ParseError> {
        let name_tok = self.peek().clone();
        let name = self.expect_symbol()?;

        if self.kind() == &TokenKind::LParen && self.abuts(&name_tok, &name) {
            let args = self.parse_call_args()?;
            let positional = args.into_iter().map(|arg| arg.value).collect();
            return Ok((name, positional));
        }

        let mut args = Vec::new();
        while !self.at_clause_end() {
            if !args.is_empty() && self.kind() == &TokenKind::Comma {
                self.advance();
            }
            args.push(self.with_abuttal(false, Self::parse_expr)?);
        }
        Ok((name, args))
    }

    fn parse_address(&mut self) -> Result<CommandKind, ParseError> {
        self.advance(); // skip ADDRESS
        if self.at_clause_end() {
            self.end_clause()?;
            return Ok(CommandKind::AddressSwitch(None));
        }

        let target = match self.kind().clone() {
            TokenKind::Symbol(s) => s,
            TokenKind::StringLit { value, .. } => value,
            _ => return Err(self.unexpected("ADDRESS target name")),
        };
        self.advance();

        if self.at_clause_end() {
            self.end_clause()?;
            return Ok(CommandKind::AddressSwitch(Some(target)));
        }

        if let TokenKind::Heredoc { delimiter, body } = self.kind().clone() {
            self.advance();
            self.end_clause()?;
            return Ok(CommandKind::AddressHeredoc {
                target: Some(target),
                delimiter,
                payload: body,
            });
        }

        if self.peek_keyword("LINES") && self.kind_at(self.pos + 1) == &TokenKind::LParen {
            return self.parse_address_lines(target);
        }

        let payload = self.clause_payload();
        self.end_clause()?;
        Ok(CommandKind::AddressCommand { target, payload })
    }

    fn parse_address_lines(&mut self, target: String) -> Result<CommandKind, ParseError> {
        self.advance(); // skip LINES
        self.advance(); // skip '('
        let count = match self.kind().clone() {
            TokenKind::Number(n) => n.parse::<usize>().ok().filter(|&n| n > 0),
            _ => None,
        }
        .ok_or_else(|| self.unexpected("positive line count"))?;
        self.advance();
        self.expect(TokenKind::RParen, "')'")?;

        if !matches!(self.kind(), TokenKind::Eol | TokenKind::Eof) {
            return Err(self.unexpected("end of line after LINES(n)"));
        }
        let last = self.current_line();
        let first = last + 1;
        let end = last + count as u32;
        let payload = self.source.lines(first, end).ok_or_else(|| {
            let available = self.source.line_count().saturating_sub(last as usize);
            ParseError::Syntax {
                line: last,
                message: format!(
                    "LINES({count}) needs {count} more lines but only {available} remain"
                ),
            }
        })?;

        // Resume lexing after the captured lines.
        self.tokens.truncate(self.pos);
        self.tokens.extend(lex_from_line(self.source, end + 1));

        Ok(CommandKind::AddressLines {
            target,
            count,
            payload,
        })
    }

    fn parse_parse(&mut self) -> Result<CommandKind, ParseError> {
        self.advance(); // skip PARSE
        let upper = self.peek_keyword("UPPER");
        if upper {
            self.advance();
        }

        let source = if self.peek_keyword("ARG") {
            self.advance();
            ParseSource::Arg
        } else if self.peek_keyword("VAR") {
            self.advance();
            ParseSource::Var(self.expect_symbol()?)
        } else if self.peek_keyword("VALUE") {
            self.advance();
            let expr = self.parse_expr()?;
            self.expect_keyword("WITH")?;
            ParseSource::Value(expr)
        } else {
            return Err(self.unexpected("ARG, VAR or VALUE"));
        };

        let template = self.parse_template()?;
        self.end_clause()?;
        Ok(CommandKind::Parse {
            upper,
            source,
            template,
        })
    }

    fn parse_template(&mut self) -> Result<Template, ParseError> {
        let mut pieces = vec![Vec::new()];

        while !self.at_clause_end() {
            let element = match self.kind().clone() {
                TokenKind::Symbol(name) => TemplateElement::Variable(name),
                TokenKind::Dot => TemplateElement::Dot,
                TokenKind::StringLit { value, .. } => TemplateElement::Literal(value),
                TokenKind::Number(_) => TemplateElement::AbsolutePos(self.position_number()?),
                TokenKind::Eq => {
                    self.advance();
                    TemplateElement::AbsolutePos(self.position_number()?)
                }
                TokenKind::Plus => {
                    self.advance();
                    TemplateElement::RelativePos(self.position_number()? as i64)
                }
                TokenKind::Minus => {
                    self.advance();
                    TemplateElement::RelativePos(-(self.position_number()? as i64))
                }
                TokenKind::LParen => {
                    self.advance();
                    let name = self.expect_symbol()?;
                    if self.kind() != &TokenKind::RParen {
                        return Err(self.unexpected("')'"));
                    }
                    TemplateElement::VarPattern(name)
                }
                TokenKind::Comma => {
                    self.advance();
                    pieces.push(Vec::new());
                    continue;
                }
                _ => return Err(self.unexpected("template element")),
            };
            self.advance();
            if let Some(piece) = pieces.last_mut() {
                piece.push(element);
            }
        }

        Ok(Template::new(pieces))
    }

    /// A whole number in a template position. Leaves the number as the
    /// current token.
    fn position_number(&self) -> Result<usize, ParseError> {
        match self.kind() {
            TokenKind::Number(n) => n
                .parse::<usize>()
                .map_err(|_| self.unexpected("whole number position")),
            _ => Err(self.unexpected("position number")),
        }
    }

    fn parse_raw(&mut self) -> Result<CommandKind, ParseError> {
        let start = self.pos;
        let end = self.clause_end_index(start);

        let expr = {
            let parsed = self.parse_expr();
            match parsed {
                Ok(expr) if self.pos == end => Some(expr),
                _ => None,
            }
        };
        self.pos = start;
        let text = self.clause_payload();
        self.end_clause()?;

        Ok(CommandKind::Raw { text, expr })
    }

    /// The rest of the clause as a command payload: the content of a lone
    /// string literal, otherwise the raw source text. Consumes the clause.
    fn clause_payload(&mut self) -> String {
        let start = self.pos;
        let end = self.clause_end_index(start);
        self.pos = end;
        if end == start + 1 {
            if let TokenKind::StringLit { value, .. } = &self.tokens[start].kind {
                return value.clone();
            }
        }
        self.raw_text(start, end)
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn parse_optional_expr(&mut self) -> Result<Option<Expr>, ParseError> {
        if self.at_clause_end() || self.at_inline_else() {
            Ok(None)
        } else {
            self.parse_expr().map(Some)
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_or()?;
        while self.kind() == &TokenKind::Pipe {
            self.advance();
            let name_tok = self.peek().clone();
            let name = self.expect_symbol()?;
            let args = if self.kind() == &TokenKind::LParen && self.abuts(&name_tok, &name) {
                self.parse_call_args()?
            } else {
                Vec::new()
            };
            left = Expr::Pipe {
                input: Box::new(left),
                name,
                args,
            };
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        loop {
            let op = match self.kind() {
                TokenKind::Or => BinOp::Or,
                TokenKind::Xor => BinOp::Xor,
                TokenKind::Symbol(s) if is_keyword(s, "OR") => BinOp::Or,
                _ => break,
            };
            self.advance();
            let right = self.parse_and()?;
            left = binary(left, op, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_comparison()?;
        loop {
            match self.kind() {
                TokenKind::And => {}
                TokenKind::Symbol(s) if is_keyword(s, "AND") => {}
                _ => break,
            }
            self.advance();
            let right = self.parse_comparison()?;
            left = binary(left, BinOp::And, right);
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_concat()?;
        loop {
            let op = match self.kind() {
                TokenKind::Eq => BinOp::Eq,
                TokenKind::Ne => BinOp::Ne,
                TokenKind::Gt => BinOp::Gt,
                TokenKind::Lt => BinOp::Lt,
                TokenKind::Ge => BinOp::Ge,
                TokenKind::Le => BinOp::Le,
                _ => break,
            };
            self.advance();
            let right = self.parse_concat()?;
            left = binary(left, op, right);
        }
        Ok(left)
    }

    fn parse_concat(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = if self.kind() == &TokenKind::Concat {
                self.advance();
                BinOp::Concat
            } else if self.starts_abuttal() {
                if self.blank_before(self.peek()) {
                    BinOp::BlankConcat
                } else {
                    BinOp::Concat
                }
            } else {
                break;
            };
            let right = self.parse_additive()?;
            left = binary(left, op, right);
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.kind() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = binary(left, op, right);
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_power()?;
        loop {
            let op = match self.kind() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_power()?;
            left = binary(left, op, right);
        }
        Ok(left)
    }

    /// `**` is right-associative.
    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_unary()?;
        if self.kind() == &TokenKind::StarStar {
            self.advance();
            let exponent = self.parse_power()?;
            return Ok(binary(base, BinOp::Power, exponent));
        }
        Ok(base)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.kind() {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Plus => UnaryOp::Plus,
            TokenKind::Not => UnaryOp::Not,
            _ => return self.parse_postfix(),
        };
        self.advance();
        let operand = self.parse_unary()?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        while self.kind() == &TokenKind::LBracket {
            self.advance();
            let index = self.with_abuttal(true, Self::parse_expr)?;
            self.expect(TokenKind::RBracket, "']'")?;
            expr = Expr::Index {
                target: Box::new(expr),
                index: Box::new(index),
            };
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.kind().clone() {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::Number(n))
            }
            TokenKind::StringLit { value, interpolate } => {
                self.advance();
                Ok(Expr::Str { value, interpolate })
            }
            TokenKind::Symbol(name) => {
                let tok = self.peek().clone();
                self.advance();
                if self.kind() == &TokenKind::LParen && self.abuts(&tok, &name) {
                    let args = self.parse_call_args()?;
                    return Ok(Expr::Call { name, args });
                }
                Ok(Expr::Variable(name))
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.with_abuttal(true, Self::parse_expr)?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(expr)
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                if self.kind() != &TokenKind::RBracket {
                    loop {
                        items.push(self.with_abuttal(true, Self::parse_expr)?);
                        if self.kind() != &TokenKind::Comma {
                            break;
                        }
                        self.advance();
                    }
                }
                self.expect(TokenKind::RBracket, "']'")?;
                Ok(Expr::Array(items))
            }
            _ => Err(self.unexpected("expression")),
        }
    }

    /// `(a, b, name=c)`; the current token is the `(`.
    fn parse_call_args(&mut self) -> Result<Vec<Arg>, ParseError> {
        self.advance(); // skip '('
        let mut args = Vec::new();
        if self.kind() == &TokenKind::RParen {
            self.advance();
            return Ok(args);
        }
        loop {
            let name = if matches!(self.kind(), TokenKind::Symbol(_))
                && self.kind_at(self.pos + 1) == &TokenKind::Eq
            {
                let name = self.expect_symbol()?;
                self.advance(); // skip '='
                Some(name)
            } else {
                None
            };
            let value = self.with_abuttal(true, Self::parse_expr)?;
            args.push(Arg { name, value });
            if self.kind() != &TokenKind::Comma {
                break;
            }
            self.advance();
        }
        self.expect(TokenKind::RParen, "')'")?;
        Ok(args)
    }

    fn with_abuttal<T>(
        &mut self,
        on: bool,
        f: impl FnOnce(&mut Self) -> Result<T, ParseError>,
    ) -> Result<T, ParseError> {
        let saved = std::mem::replace(&mut self.abuttal, on);
        let result = f(self);
        self.abuttal = saved;
        result
    }

    fn starts_abuttal(&self) -> bool {
        if !self.abuttal {
            return false;
        }
        match self.kind() {
            TokenKind::StringLit { .. } | TokenKind::Number(_) | TokenKind::LParen => true,
            TokenKind::Symbol(s) => !is_stop_word(s),
            _ => false,
        }
    }

    /// Is there whitespace (or a line break) just before `tok`?
    fn blank_before(&self, tok: &Token) -> bool {
        let Some(prev) = self.pos.checked_sub(1).map(|i| &self.tokens[i]) else {
            return false;
        };
        if prev.line() != tok.line() || tok.span.col < 2 {
            return true;
        }
        self.source
            .line(tok.line())
            .and_then(|text| text.chars().nth(tok.span.col as usize - 2))
            .is_some_and(char::is_whitespace)
    }

    /// Does the current token immediately follow the symbol `name` at `tok`?
    fn abuts(&self, tok: &Token, name: &str) -> bool {
        let next = self.peek();
        next.line() == tok.line() && next.span.col == tok.span.col + name.chars().count() as u32
    }

    // -----------------------------------------------------------------------
    // Token utilities
    // -----------------------------------------------------------------------

    fn token_at(&self, index: usize) -> &Token {
        &self.tokens[index.min(self.tokens.len() - 1)]
    }

    fn peek(&self) -> &Token {
        self.token_at(self.pos)
    }

    fn kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn kind_at(&self, index: usize) -> &TokenKind {
        &self.token_at(index).kind
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
    }

    fn current_line(&self) -> u32 {
        self.peek().line()
    }

    fn at_eof(&self) -> bool {
        self.kind() == &TokenKind::Eof
    }

    fn at_clause_end(&self) -> bool {
        self.kind().is_clause_end()
    }

    fn at_inline_else(&self) -> bool {
        self.inline_then > 0 && self.peek_keyword("ELSE")
    }

    fn peek_keyword(&self, kw: &str) -> bool {
        matches!(self.kind(), TokenKind::Symbol(s) if is_keyword(s, kw))
    }

    /// A block keyword at the start of a clause, and not the target of an
    /// assignment (`end = 1`).
    fn at_closer(&self, kw: &str) -> bool {
        self.peek_keyword(kw) && !self.is_assignment_at(self.pos)
    }

    fn skip_separators(&mut self) {
        while matches!(self.kind(), TokenKind::Eol | TokenKind::Semicolon) {
            self.advance();
        }
    }

    /// Index of the token that ends the clause starting at `from`.
    fn clause_end_index(&self, from: usize) -> usize {
        let mut i = from;
        while i < self.tokens.len() - 1 {
            let kind = &self.tokens[i].kind;
            if kind.is_clause_end() {
                break;
            }
            if self.inline_then > 0 && matches!(kind, TokenKind::Symbol(s) if is_keyword(s, "ELSE"))
            {
                break;
            }
            i += 1;
        }
        i
    }

    /// Report lexical errors in the clause ahead. Stray characters are left
    /// for the expression parser, since command text may contain them.
    fn check_clause(&self) -> Result<(), ParseError> {
        let end = self.clause_end_index(self.pos);
        for tok in &self.tokens[self.pos..end] {
            if let TokenKind::Error(kind) = &tok.kind {
                if !matches!(kind, LexErrorKind::UnexpectedChar(_)) {
                    return Err(lex_error(kind, tok.line()));
                }
            }
        }
        Ok(())
    }

    /// Finish a clause: consume `;`/end of line, or accept a clause that
    /// ends where a label, a captured block of lines or an inline `ELSE`
    /// does.
    fn end_clause(&mut self) -> Result<(), ParseError> {
        match self.kind() {
            TokenKind::Eol | TokenKind::Semicolon => {
                self.advance();
                return Ok(());
            }
            TokenKind::Eof => return Ok(()),
            _ => {}
        }
        if self.at_inline_else() {
            return Ok(());
        }
        if let Some(prev) = self.pos.checked_sub(1).map(|i| &self.tokens[i]) {
            if prev.kind == TokenKind::Colon || prev.line() < self.current_line() {
                return Ok(());
            }
        }
        Err(self.unexpected("end of clause"))
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        let tok = self.peek();
        if let TokenKind::Error(kind) = &tok.kind {
            return lex_error(kind, tok.line());
        }
        ParseError::Unexpected {
            expected: expected.to_string(),
            found: describe(&tok.kind),
            line: tok.line(),
        }
    }

    fn expect(&mut self, expected: TokenKind, what: &str) -> Result<(), ParseError> {
        if self.kind() == &expected {
            self.advance();
            Ok(())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<(), ParseError> {
        if self.peek_keyword(kw) {
            self.advance();
            Ok(())
        } else {
            Err(self.unexpected(kw))
        }
    }

    fn expect_symbol(&mut self) -> Result<String, ParseError> {
        match self.kind() {
            TokenKind::Symbol(s) => {
                let s = s.clone();
                self.advance();
                Ok(s)
            }
            _ => Err(self.unexpected("symbol")),
        }
    }

    fn parse_optional_name(&mut self) -> Result<Option<String>, ParseError> {
        if self.at_clause_end() || self.at_inline_else() {
            Ok(None)
        } else {
            self.expect_symbol().map(Some)
        }
    }

    fn parse_name_list(&mut self) -> Result<Vec<String>, ParseError> {
        let mut names = Vec::new();
        while !self.at_clause_end() && !self.at_inline_else() {
            names.push(self.expect_symbol()?);
        }
        Ok(names)
    }

    /// Is the clause at `index` an assignment: `name =` or `name[...] =`?
    fn is_assignment_at(&self, index: usize) -> bool {
        if !matches!(self.kind_at(index), TokenKind::Symbol(_)) {
            return false;
        }
        match self.kind_at(index + 1) {
            TokenKind::Eq => true,
            TokenKind::LBracket => {
                let mut depth = 0usize;
                let mut i = index + 1;
                while i < self.tokens.len() {
                    match &self.tokens[i].kind {
                        TokenKind::LBracket => depth += 1,
                        TokenKind::RBracket => {
                            depth -= 1;
                            if depth == 0 {
                                return self.kind_at(i + 1) == &TokenKind::Eq;
                            }
                        }
                        kind if kind.is_clause_end() => return false,
                        _ => {}
                    }
                    i += 1;
                }
                false
            }
            _ => false,
        }
    }

    /// Is the current position a label? (symbol followed by ':')
    fn is_label(&self) -> bool {
        matches!(self.kind(), TokenKind::Symbol(_))
            && self.kind_at(self.pos + 1) == &TokenKind::Colon
            && self.token_at(self.pos + 1).line() == self.current_line()
    }

    /// Source text of tokens `start..end`, comments removed. A clause
    /// continued over several lines is joined with single blanks.
    fn raw_text(&self, start: usize, end: usize) -> String {
        if start >= end {
            return String::new();
        }
        let first = self.tokens[start].span;
        let stop = self.token_at(end).span;

        if stop.line == first.line {
            return self
                .source
                .slice(first.line, first.col, stop.col)
                .map(strip_comments)
                .unwrap_or_default();
        }

        let mut parts = Vec::new();
        for line in first.line..=stop.line {
            let text = if line == first.line {
                self.source.rest_of_line(line, first.col)
            } else if line == stop.line {
                self.source.slice(line, 1, stop.col)
            } else {
                self.source.line(line)
            };
            let text = strip_comments(text.unwrap_or_default());
            let text = text.strip_suffix(',').unwrap_or(&text).trim().to_string();
            if !text.is_empty() {
                parts.push(text);
            }
        }
        parts.join(" ")
    }
}

fn binary(left: Expr, op: BinOp, right: Expr) -> Expr {
    Expr::Binary {
        left: Box::new(left),
        op,
        right: Box::new(right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commands(src: &str) -> Vec<Command> {
        parse(src).unwrap().commands
    }

    fn single(src: &str) -> CommandKind {
        let mut cmds = commands(src);
        assert_eq!(cmds.len(), 1, "expected one command in {src:?}");
        cmds.remove(0).kind
    }

    fn render(src: &str) -> String {
        match single(&format!("SAY {src}")) {
            CommandKind::Say(e) => e.to_string(),
            other => panic!("not a SAY: {other:?}"),
        }
    }

    #[test]
    fn test_say_and_lines() {
        let cmds = commands("SAY 'a'\n\nSAY 'b'; SAY 'c'");
        let lines: Vec<u32> = cmds.iter().map(|c| c.line).collect();
        assert_eq!(lines, vec![1, 3, 3]);
    }

    #[test]
    fn test_precedence() {
        assert_eq!(render("1 + 2 * 3"), "1 + 2 * 3");
        assert_eq!(render("(1 + 2) * 3"), "(1 + 2) * 3");
        assert_eq!(render("-2 ** 2"), "-2 ** 2");
        assert!(matches!(
            single("SAY -2 ** 2"),
            CommandKind::Say(Expr::Binary { op: BinOp::Power, .. })
        ));
        assert!(matches!(
            single("SAY a = 1 & b = 2 | c"),
            CommandKind::Say(Expr::Binary { op: BinOp::Or, .. })
        ));
    }

    #[test]
    fn test_power_is_right_associative() {
        let CommandKind::Say(Expr::Binary { right, .. }) = single("SAY 2 ** 3 ** 2") else {
            panic!("expected binary");
        };
        assert!(matches!(*right, Expr::Binary { op: BinOp::Power, .. }));
    }

    #[test]
    fn test_abuttal() {
        let CommandKind::Say(e) = single("SAY 'a' name 'b'") else { panic!() };
        assert!(matches!(e, Expr::Binary { op: BinOp::BlankConcat, .. }));
        let CommandKind::Say(e) = single("SAY 'a'name") else { panic!() };
        assert!(matches!(e, Expr::Binary { op: BinOp::Concat, .. }));
    }

    #[test]
    fn test_word_operators() {
        let CommandKind::Say(e) = single("SAY x > 1 AND y < 2 OR z") else { panic!() };
        assert!(matches!(e, Expr::Binary { op: BinOp::Or, .. }));
    }

    #[test]
    fn test_function_call_needs_adjacent_paren() {
        assert!(matches!(single("SAY f(1, 2)"), CommandKind::Say(Expr::Call { .. })));
        assert!(matches!(
            single("SAY f (1)"),
            CommandKind::Say(Expr::Binary { op: BinOp::BlankConcat, .. })
        ));
    }

    #[test]
    fn test_named_args() {
        let CommandKind::Say(Expr::Call { args, .. }) = single("SAY SEQ(start=1, end=5)") else {
            panic!()
        };
        assert_eq!(args[0].name.as_deref(), Some("start"));
        assert_eq!(args[1].name.as_deref(), Some("end"));
    }

    #[test]
    fn test_pipe() {
        let CommandKind::Say(e) = single("SAY 'abc' |> UPPER |> LEFT(2)") else { panic!() };
        let Expr::Pipe { input, name, args } = e else { panic!() };
        assert_eq!(name, "LEFT");
        assert_eq!(args.len(), 1);
        assert!(matches!(*input, Expr::Pipe { .. }));
    }

    #[test]
    fn test_array_literal_and_index() {
        let CommandKind::Say(e) = single("SAY [1, 'two', [3]][2]") else { panic!() };
        assert!(matches!(e, Expr::Index { .. }));
    }

    #[test]
    fn test_assignment_forms() {
        assert!(matches!(single("x = 1"), CommandKind::Assign { .. }));
        assert!(matches!(single("LET x = 1"), CommandKind::Assign { .. }));
        let CommandKind::Assign { target, .. } = single("list[2] = 'b'") else { panic!() };
        assert_eq!(target.name, "list");
        assert!(target.index.is_some());
        let CommandKind::Assign { target, .. } = single("say = 3") else { panic!() };
        assert_eq!(target.name, "say");
    }

    #[test]
    fn test_let_call() {
        let CommandKind::Assign { value, .. } = single("LET r = CALL add 1 2") else { panic!() };
        let LetValue::Call { name, args } = value else { panic!() };
        assert_eq!(name, "add");
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn test_let_method() {
        let CommandKind::Assign { value, .. } = single("LET r = query table=\"users\" limit=5")
        else {
            panic!()
        };
        let LetValue::Method { name, params, raw } = value else { panic!() };
        assert_eq!(name, "query");
        assert_eq!(params.len(), 2);
        assert_eq!(params[1].0, "limit");
        assert_eq!(raw, "query table=\"users\" limit=5");
    }

    #[test]
    fn test_let_heredoc() {
        let cmds = commands("LET q = <<SQL\nSELECT 1\nSQL\nSAY q");
        assert_eq!(cmds.len(), 2);
        let CommandKind::Assign { value, .. } = &cmds[0].kind else { panic!() };
        assert!(matches!(value, LetValue::Heredoc { body, .. } if body == "SELECT 1"));
        assert_eq!(cmds[1].line, 4);
    }

    #[test]
    fn test_inline_if_else() {
        let CommandKind::If { then_body, else_body, .. } = single("IF x THEN SAY 1 ELSE SAY 2")
        else {
            panic!()
        };
        assert_eq!(then_body.len(), 1);
        assert_eq!(else_body.len(), 1);
    }

    #[test]
    fn test_inline_if_else_on_next_line() {
        let CommandKind::If { else_body, .. } = single("IF x THEN SAY 1\nELSE SAY 2") else {
            panic!()
        };
        assert_eq!(else_body.len(), 1);
    }

    #[test]
    fn test_block_if() {
        let src = "IF x > 1 THEN\n  SAY 'a'\n  SAY 'b'\nELSE\n  SAY 'c'\nENDIF\nSAY 'after'";
        let cmds = commands(src);
        assert_eq!(cmds.len(), 2);
        let CommandKind::If { then_body, else_body, .. } = &cmds[0].kind else { panic!() };
        assert_eq!(then_body.len(), 2);
        assert_eq!(else_body.len(), 1);
        assert_eq!(else_body[0].line, 5);
    }

    #[test]
    fn test_nested_inline_if_leaves_bare_else_to_block() {
        let src = "IF a THEN\n  IF b THEN SAY 1\nELSE\n  SAY 2\nENDIF";
        let CommandKind::If { then_body, else_body, .. } = single(src) else { panic!() };
        assert!(matches!(&then_body[0].kind, CommandKind::If { else_body, .. } if else_body.is_empty()));
        assert_eq!(else_body.len(), 1);
    }

    #[test]
    fn test_unterminated_block_if() {
        let err = parse("SAY 0\nIF x THEN\n  SAY 1\n").unwrap_err();
        assert_eq!(err, ParseError::UnterminatedBlock {
            keyword: "IF".to_string(),
            line: 2,
        });
    }

    #[test]
    fn test_do_forms() {
        let controls: Vec<String> = [
            "DO\nEND",
            "DO FOREVER\nLEAVE\nEND",
            "DO 3\nEND",
            "DO i = 1 TO 10 BY 2\nEND i",
            "DO WHILE x < 3\nEND",
            "DO UNTIL x\nEND",
            "DO item OVER items\nEND",
        ]
        .iter()
        .map(|src| match single(src) {
            CommandKind::Do { control, .. } => control.to_string(),
            other => panic!("not a DO: {other:?}"),
        })
        .collect();
        assert_eq!(controls, vec![
            "DO",
            "DO FOREVER",
            "DO 3",
            "DO i = 1 TO 10 BY 2",
            "DO WHILE x < 3",
            "DO UNTIL x",
            "DO item OVER items",
        ]);
    }

    #[test]
    fn test_end_name_mismatch() {
        assert!(matches!(
            parse("DO i = 1 TO 2\nEND j").unwrap_err(),
            ParseError::Syntax { line: 2, .. }
        ));
    }

    #[test]
    fn test_unterminated_do() {
        let err = parse("DO i = 1 TO 3\n  SAY i\n").unwrap_err();
        assert_eq!(err, ParseError::UnterminatedBlock {
            keyword: "DO".to_string(),
            line: 1,
        });
    }

    #[test]
    fn test_select() {
        let src = "SELECT\n  WHEN x = 1 THEN SAY 'one'\n  WHEN x = 2 THEN\n    SAY 'two'\n    SAY 'deux'\n  OTHERWISE SAY 'many'\nEND";
        let CommandKind::Select { whens, otherwise } = single(src) else { panic!() };
        assert_eq!(whens.len(), 2);
        assert_eq!(whens[1].body.len(), 2);
        assert_eq!(otherwise.map(|o| o.len()), Some(1));
    }

    #[test]
    fn test_select_rejects_stray_clause() {
        let err = parse("SELECT\n SAY 1\nEND").unwrap_err();
        assert!(matches!(err, ParseError::Unexpected { line: 2, .. }));
    }

    #[test]
    fn test_call_forms() {
        for src in ["CALL sub 1 2", "CALL sub 1, 2", "CALL sub(1, 2)"] {
            let CommandKind::Call { name, args } = single(src) else { panic!() };
            assert_eq!(name, "sub");
            assert_eq!(args.len(), 2, "{src}");
        }
        let CommandKind::Call { args, .. } = single("CALL sub") else { panic!() };
        assert!(args.is_empty());
    }

    #[test]
    fn test_labels() {
        let program = parse("CALL sub1\nEXIT\nsub1:\nSAY 'x'\nRETURN\nSUB1:\n").unwrap();
        assert_eq!(program.label("SUB1"), Some(2));
        assert_eq!(program.commands[2].line, 3);
    }

    #[test]
    fn test_label_with_statement_on_same_line() {
        let cmds = commands("here: SAY 1");
        assert!(matches!(cmds[0].kind, CommandKind::Label(_)));
        assert!(matches!(cmds[1].kind, CommandKind::Say(_)));
    }

    #[test]
    fn test_label_inside_block_rejected() {
        assert!(matches!(
            parse("DO\nx:\nEND").unwrap_err(),
            ParseError::Syntax { line: 2, .. }
        ));
    }

    #[test]
    fn test_parse_templates() {
        let CommandKind::Parse { upper, source, template } =
            single("PARSE UPPER VALUE 'a,b' WITH first ',' second")
        else {
            panic!()
        };
        assert!(upper);
        assert!(matches!(source, ParseSource::Value(_)));
        assert_eq!(template.pieces[0], vec![
            TemplateElement::Variable("first".to_string()),
            TemplateElement::Literal(",".to_string()),
            TemplateElement::Variable("second".to_string()),
        ]);

        let CommandKind::Parse { template, .. } = single("PARSE VAR line a 5 b +2 . =10 c (sep) d")
        else {
            panic!()
        };
        assert_eq!(template.pieces[0][1], TemplateElement::AbsolutePos(5));
        assert_eq!(template.pieces[0][3], TemplateElement::RelativePos(2));
        assert_eq!(template.pieces[0][4], TemplateElement::Dot);
        assert_eq!(template.pieces[0][5], TemplateElement::AbsolutePos(10));
        assert_eq!(template.pieces[0][7], TemplateElement::VarPattern("sep".to_string()));

        let CommandKind::Parse { source, template, .. } = single("ARG a, b") else { panic!() };
        assert!(matches!(source, ParseSource::Arg));
        assert_eq!(template.pieces.len(), 2);
    }

    #[test]
    fn test_procedure_drop_leave() {
        let CommandKind::Procedure { expose } = single("PROCEDURE EXPOSE a b") else { panic!() };
        assert_eq!(expose, vec!["a", "b"]);
        assert!(matches!(single("DROP x y"), CommandKind::Drop(names) if names.len() == 2));
        assert!(matches!(single("NOP"), CommandKind::Nop));
    }

    #[test]
    fn test_address_forms() {
        assert!(matches!(single("ADDRESS"), CommandKind::AddressSwitch(None)));
        assert!(matches!(single("ADDRESS calc"), CommandKind::AddressSwitch(Some(t)) if t == "calc"));
        let CommandKind::AddressCommand { target, payload } = single("ADDRESS calc \"add 1 2\"")
        else {
            panic!()
        };
        assert_eq!((target.as_str(), payload.as_str()), ("calc", "add 1 2"));
        let CommandKind::AddressCommand { payload, .. } = single("ADDRESS sys ls -l /tmp -- list")
        else {
            panic!()
        };
        assert_eq!(payload, "ls -l /tmp");
    }

    #[test]
    fn test_address_lines() {
        let src = "ADDRESS test LINES(2)\nfirst 'unterminated\n  second /* open\nSAY 'after'";
        let cmds = commands(src);
        assert_eq!(cmds.len(), 2);
        let CommandKind::AddressLines { target, count, payload } = &cmds[0].kind else {
            panic!()
        };
        assert_eq!(target, "test");
        assert_eq!(*count, 2);
        assert_eq!(payload, "first 'unterminated\n  second /* open");
        assert_eq!(cmds[1].line, 4);
    }

    #[test]
    fn test_address_lines_short() {
        assert!(matches!(
            parse("ADDRESS test LINES(3)\nonly one").unwrap_err(),
            ParseError::Syntax { line: 1, .. }
        ));
    }

    #[test]
    fn test_heredocs() {
        let cmds = commands("ADDRESS db <<END\nSELECT *\nEND\n<<X\nraw\nX\nSAY 1");
        assert_eq!(cmds.len(), 3);
        assert!(matches!(
            &cmds[0].kind,
            CommandKind::AddressHeredoc { target: Some(t), payload, .. } if t == "db" && payload == "SELECT *"
        ));
        assert!(matches!(&cmds[1].kind, CommandKind::AddressHeredoc { target: None, .. }));
        assert_eq!(cmds[2].line, 7);
    }

    #[test]
    fn test_raw_instructions() {
        let CommandKind::Raw { text, expr } = single("'list files'") else { panic!() };
        assert_eq!(text, "list files");
        assert!(expr.is_some());

        let CommandKind::Raw { text, expr } = single("create user ~admin") else { panic!() };
        assert_eq!(text, "create user ~admin");
        assert!(expr.is_none());

        let CommandKind::Raw { expr, .. } = single("ARRAY_PUSH(list, 4)") else { panic!() };
        assert!(expr.is_some_and(|e| e.is_call()));
    }

    #[test]
    fn test_stray_closer() {
        let err = parse("SAY 1\nEND").unwrap_err();
        assert_eq!(err, ParseError::Unexpected {
            expected: "instruction".to_string(),
            found: "'END'".to_string(),
            line: 2,
        });
    }

    #[test]
    fn test_lexical_errors_carry_lines() {
        assert_eq!(
            parse("SAY 1\nSAY 'oops").unwrap_err(),
            ParseError::UnterminatedString { line: 2 }
        );
        assert_eq!(
            parse("SAY 1 /* never").unwrap_err(),
            ParseError::UnterminatedComment { line: 1 }
        );
        assert!(matches!(
            parse("x = 1\nLET y = <<EOF\nbody\n").unwrap_err(),
            ParseError::UnterminatedHeredoc { line: 2, .. }
        ));
        assert_eq!(
            parse("SAY 1 ~ 2").unwrap_err(),
            ParseError::UnexpectedChar { ch: '~', line: 1 }
        );
    }

    #[test]
    fn test_unexpected_reports_expected_and_found() {
        let err = parse("DO i = 1 10\nEND").unwrap_err();
        assert_eq!(err.line(), 1);
        assert!(err.to_string().contains("expected TO"));
    }

    #[test]
    fn test_strip_comments_keeps_quoted_text() {
        assert_eq!(strip_comments("echo '--x' /* c */ y -- tail"), "echo '--x'  y");
    }
}
