//! Script token types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Source location for a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Span {
    /// Line number (1-based).
    pub line: u32,
    /// Column number (1-based, in characters).
    pub col: u32,
}

/// A script token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    /// The token's text as it would be written in source.
    pub fn text(&self) -> String {
        self.kind.to_string()
    }

    pub fn line(&self) -> u32 {
        self.span.line
    }
}

/// Why the lexer could not form a token.
///
/// The lexer never aborts; it emits [`TokenKind::Error`] and keeps going.
/// The parser reports the error only if it actually reaches the token, so
/// malformed text inside a `LINES(n)` capture is never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LexErrorKind {
    UnterminatedString,
    UnterminatedComment,
    /// A heredoc whose closing delimiter line never appeared.
    UnterminatedHeredoc { delimiter: String },
    /// Text after a `<<DELIM` marker on the same line.
    HeredocMarker { delimiter: String },
    UnexpectedChar(char),
}

/// Token types.
///
/// There are no reserved words: `SAY`, `DO`, `IF` and friends are all
/// [`TokenKind::Symbol`] and the parser disambiguates by position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TokenKind {
    // -- Literals --
    /// Integer or decimal number (e.g., `42`, `3.14`, `1E10`).
    Number(String),
    /// Quoted string. Double-quoted literals take `{{name}}` placeholders.
    StringLit { value: String, interpolate: bool },
    /// `<<DELIM` followed by every line up to the one reading `DELIM`.
    Heredoc { delimiter: String, body: String },

    /// An identifier or keyword, spelled as written.
    Symbol(String),

    // -- Operators --
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Star,
    /// `/`
    Slash,
    /// `%` (remainder)
    Percent,
    /// `**`
    StarStar,
    /// `||`
    Concat,
    /// `|>`
    Pipe,
    /// `\`, `¬` or `!`
    Not,
    /// `=` or `==`
    Eq,
    /// `\=`, `¬=`, `!=` or `<>`
    Ne,
    /// `>`
    Gt,
    /// `<`
    Lt,
    /// `>=` or `\<`
    Ge,
    /// `<=` or `\>`
    Le,
    /// `&`
    And,
    /// `|`
    Or,
    /// `&&`
    Xor,

    // -- Delimiters --
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Semicolon,
    /// `:` (label terminator)
    Colon,
    /// A lone `.` (placeholder in parse templates)
    Dot,

    // -- Special --
    /// Text the lexer could not tokenize.
    Error(LexErrorKind),
    /// End of line (implicit clause terminator).
    Eol,
    /// End of source.
    Eof,
}

impl TokenKind {
    /// Check if this is an operator token.
    pub fn is_operator(&self) -> bool {
        matches!(
            self,
            TokenKind::Plus
                | TokenKind::Minus
                | TokenKind::Star
                | TokenKind::Slash
                | TokenKind::Percent
                | TokenKind::StarStar
                | TokenKind::Concat
                | TokenKind::Pipe
                | TokenKind::Not
                | TokenKind::Eq
                | TokenKind::Ne
                | TokenKind::Gt
                | TokenKind::Lt
                | TokenKind::Ge
                | TokenKind::Le
                | TokenKind::And
                | TokenKind::Or
                | TokenKind::Xor
        )
    }

    /// Clause terminators: end of line, `;` and end of source.
    pub fn is_clause_end(&self) -> bool {
        matches!(self, TokenKind::Eol | TokenKind::Semicolon | TokenKind::Eof)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Number(n) => write!(f, "{n}"),
            TokenKind::StringLit { value, interpolate } => {
                let quote = if *interpolate { '"' } else { '\'' };
                let doubled = format!("{quote}{quote}");
                write!(f, "{quote}{}{quote}", value.replace(quote, &doubled))
            }
            TokenKind::Heredoc { delimiter, .. } => write!(f, "<<{delimiter}"),
            TokenKind::Symbol(s) => write!(f, "{s}"),
            TokenKind::Plus => write!(f, "+"),
            TokenKind::Minus => write!(f, "-"),
            TokenKind::Star => write!(f, "*"),
            TokenKind::Slash => write!(f, "/"),
            TokenKind::Percent => write!(f, "%"),
            TokenKind::StarStar => write!(f, "**"),
            TokenKind::Concat => write!(f, "||"),
            TokenKind::Pipe => write!(f, "|>"),
            TokenKind::Not => write!(f, "\\"),
            TokenKind::Eq => write!(f, "="),
            TokenKind::Ne => write!(f, "\\="),
            TokenKind::Gt => write!(f, ">"),
            TokenKind::Lt => write!(f, "<"),
            TokenKind::Ge => write!(f, ">="),
            TokenKind::Le => write!(f, "<="),
            TokenKind::And => write!(f, "&"),
            TokenKind::Or => write!(f, "|"),
            TokenKind::Xor => write!(f, "&&"),
            TokenKind::LParen => write!(f, "("),
            TokenKind::RParen => write!(f, ")"),
            TokenKind::LBracket => write!(f, "["),
            TokenKind::RBracket => write!(f, "]"),
            TokenKind::Comma => write!(f, ","),
            TokenKind::Semicolon => write!(f, ";"),
            TokenKind::Colon => write!(f, ":"),
            TokenKind::Dot => write!(f, "."),
            TokenKind::Error(_) => write!(f, "invalid token"),
            TokenKind::Eol => write!(f, "end of line"),
            TokenKind::Eof => write!(f, "end of file"),
        }
    }
}
