//! Lexer: tokenizes normalized script text into a stream of tokens.
//!
//! Lexical rules:
//! - Comments: `/* ... */` (nestable) and `--` to end of line
//! - Strings: `'...'` or `"..."`, a doubled quote escapes itself
//! - Heredocs: `<<DELIM` at the end of a line captures the following lines
//!   up to a line whose trimmed text is `DELIM`
//! - Continuation: a comma at the end of a line joins the next line
//! - No reserved words: every identifier is a `Symbol` token
//!
//! The lexer is total. Anything it cannot tokenize becomes a
//! [`TokenKind::Error`] token carrying the line it was found on.

use crate::source::SourceText;
use crate::token::{LexErrorKind, Span, Token, TokenKind};

/// Tokenize raw script text (line endings are normalized first).
pub fn lex(source: &str) -> Vec<Token> {
    lex_source(&SourceText::new(source))
}

/// Tokenize already-normalized source.
pub fn lex_source(source: &SourceText) -> Vec<Token> {
    Lexer::new(source.text(), 1).tokenize()
}

/// Tokenize `source` starting at physical line `first_line`. Tokens keep
/// their absolute line numbers. Past the last line only `Eof` remains.
pub fn lex_from_line(source: &SourceText, first_line: u32) -> Vec<Token> {
    let text = source
        .line_start(first_line)
        .map(|offset| &source.text()[offset..])
        .unwrap_or("");
    Lexer::new(text, first_line).tokenize()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    col: u32,
}

impl Lexer {
    fn new(text: &str, first_line: u32) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            line: first_line,
            col: 1,
        }
    }

    fn tokenize(&mut self) -> Vec<Token> {
        let mut tokens = Vec::new();

        while let Some(c) = self.peek() {
            match c {
                ' ' | '\t' => self.advance(),
                '\n' => {
                    tokens.push(self.make_token(TokenKind::Eol));
                    self.newline();
                }
                '/' if self.peek_at(1) == Some('*') => {
                    if let Some(tok) = self.skip_comment() {
                        tokens.push(tok);
                    }
                }
                '-' if self.peek_at(1) == Some('-') => self.skip_line_comment(),
                '\'' | '"' => tokens.push(self.lex_string(c)),
                '<' if self.peek_at(1) == Some('<')
                    && self.peek_at(2).is_some_and(|c| c.is_ascii_alphabetic() || c == '_') =>
                {
                    tokens.push(self.lex_heredoc());
                }
                '+' => self.single(&mut tokens, TokenKind::Plus),
                '-' => self.single(&mut tokens, TokenKind::Minus),
                '%' => self.single(&mut tokens, TokenKind::Percent),
                '/' => self.single(&mut tokens, TokenKind::Slash),
                '(' => self.single(&mut tokens, TokenKind::LParen),
                ')' => self.single(&mut tokens, TokenKind::RParen),
                '[' => self.single(&mut tokens, TokenKind::LBracket),
                ']' => self.single(&mut tokens, TokenKind::RBracket),
                ';' => self.single(&mut tokens, TokenKind::Semicolon),
                ':' => self.single(&mut tokens, TokenKind::Colon),
                ',' => {
                    let span = self.span();
                    self.advance();
                    if self.is_line_end() {
                        self.skip_to_next_line();
                    } else {
                        tokens.push(Token { kind: TokenKind::Comma, span });
                    }
                }
                '*' => {
                    let kind = self.pair('*', TokenKind::StarStar, TokenKind::Star);
                    tokens.push(kind);
                }
                '&' => {
                    let kind = self.pair('&', TokenKind::Xor, TokenKind::And);
                    tokens.push(kind);
                }
                '=' => {
                    let kind = self.pair('=', TokenKind::Eq, TokenKind::Eq);
                    tokens.push(kind);
                }
                '!' => {
                    let kind = self.pair('=', TokenKind::Ne, TokenKind::Not);
                    tokens.push(kind);
                }
                '|' => {
                    let span = self.span();
                    self.advance();
                    let kind = match self.peek() {
                        Some('|') => {
                            self.advance();
                            TokenKind::Concat
                        }
                        Some('>') => {
                            self.advance();
                            TokenKind::Pipe
                        }
                        _ => TokenKind::Or,
                    };
                    tokens.push(Token { kind, span });
                }
                '>' => {
                    let kind = self.pair('=', TokenKind::Ge, TokenKind::Gt);
                    tokens.push(kind);
                }
                '<' => {
                    let span = self.span();
                    self.advance();
                    let kind = match self.peek() {
                        Some('=') => {
                            self.advance();
                            TokenKind::Le
                        }
                        Some('>') => {
                            self.advance();
                            TokenKind::Ne
                        }
                        _ => TokenKind::Lt,
                    };
                    tokens.push(Token { kind, span });
                }
                '\\' | '¬' => {
                    let span = self.span();
                    self.advance();
                    let kind = match self.peek() {
                        Some('=') => {
                            self.advance();
                            TokenKind::Ne
                        }
                        // "not greater than"
                        Some('>') => {
                            self.advance();
                            TokenKind::Le
                        }
                        // "not less than"
                        Some('<') => {
                            self.advance();
                            TokenKind::Ge
                        }
                        _ => TokenKind::Not,
                    };
                    tokens.push(Token { kind, span });
                }
                _ if c.is_ascii_digit() => tokens.push(self.lex_number()),
                _ if is_symbol_start(c) => tokens.push(self.lex_symbol()),
                '.' => {
                    if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
                        tokens.push(self.lex_number());
                    } else {
                        self.single(&mut tokens, TokenKind::Dot);
                    }
                }
                _ => {
                    let tok = self.make_token(TokenKind::Error(LexErrorKind::UnexpectedChar(c)));
                    tokens.push(tok);
                    self.advance();
                }
            }
        }

        tokens.push(self.make_token(TokenKind::Eof));
        tokens
    }

    fn advance(&mut self) {
        self.pos += 1;
        self.col += 1;
    }

    fn newline(&mut self) {
        self.pos += 1;
        self.line += 1;
        self.col = 1;
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn span(&self) -> Span {
        Span { line: self.line, col: self.col }
    }

    fn make_token(&self, kind: TokenKind) -> Token {
        Token { kind, span: self.span() }
    }

    fn single(&mut self, tokens: &mut Vec<Token>, kind: TokenKind) {
        tokens.push(self.make_token(kind));
        self.advance();
    }

    /// Lex a one-character operator that becomes `double` when followed by
    /// `next`.
    fn pair(&mut self, next: char, double: TokenKind, single: TokenKind) -> Token {
        let span = self.span();
        self.advance();
        if self.peek() == Some(next) {
            self.advance();
            Token { kind: double, span }
        } else {
            Token { kind: single, span }
        }
    }

    /// Skip a `/* ... */` comment (nestable). Returns an error token if the
    /// comment never closes.
    fn skip_comment(&mut self) -> Option<Token> {
        let span = self.span();
        self.advance();
        self.advance();
        let mut depth = 1u32;

        while let Some(c) = self.peek() {
            if depth == 0 {
                break;
            }
            if c == '/' && self.peek_at(1) == Some('*') {
                depth += 1;
                self.advance();
                self.advance();
            } else if c == '*' && self.peek_at(1) == Some('/') {
                depth -= 1;
                self.advance();
                self.advance();
            } else if c == '\n' {
                self.newline();
            } else {
                self.advance();
            }
        }

        (depth > 0).then(|| Token {
            kind: TokenKind::Error(LexErrorKind::UnterminatedComment),
            span,
        })
    }

    /// Skip a `--` comment, leaving the newline in place.
    fn skip_line_comment(&mut self) {
        while self.peek().is_some_and(|c| c != '\n') {
            self.advance();
        }
    }

    fn lex_string(&mut self, quote: char) -> Token {
        let span = self.span();
        self.advance();
        let mut value = String::new();

        loop {
            match self.peek() {
                None | Some('\n') => {
                    return Token {
                        kind: TokenKind::Error(LexErrorKind::UnterminatedString),
                        span,
                    };
                }
                Some(c) if c == quote => {
                    self.advance();
                    if self.peek() == Some(quote) {
                        value.push(quote);
                        self.advance();
                    } else {
                        break;
                    }
                }
                Some(c) => {
                    value.push(c);
                    self.advance();
                }
            }
        }

        Token {
            kind: TokenKind::StringLit {
                value,
                interpolate: quote == '"',
            },
            span,
        }
    }

    /// Lex `<<DELIM` and capture the lines that follow it.
    ///
    /// The closing delimiter line is consumed up to (not including) its
    /// newline, so the clause still ends with a normal `Eol`.
    fn lex_heredoc(&mut self) -> Token {
        let span = self.span();
        self.advance();
        self.advance();

        let mut delimiter = String::new();
        while let Some(c) = self.peek().filter(|c| c.is_ascii_alphanumeric() || *c == '_') {
            delimiter.push(c);
            self.advance();
        }
        while matches!(self.peek(), Some(' ' | '\t')) {
            self.advance();
        }

        match self.peek() {
            Some('\n') => self.newline(),
            None => {
                return Token {
                    kind: TokenKind::Error(LexErrorKind::UnterminatedHeredoc { delimiter }),
                    span,
                };
            }
            Some(_) => {
                self.skip_line_comment();
                return Token {
                    kind: TokenKind::Error(LexErrorKind::HeredocMarker { delimiter }),
                    span,
                };
            }
        }

        let mut body = Vec::new();
        loop {
            if self.peek().is_none() {
                return Token {
                    kind: TokenKind::Error(LexErrorKind::UnterminatedHeredoc { delimiter }),
                    span,
                };
            }
            let start = self.pos;
            while self.peek().is_some_and(|c| c != '\n') {
                self.advance();
            }
            let line: String = self.chars[start..self.pos].iter().collect();
            if line.trim() == delimiter {
                return Token {
                    kind: TokenKind::Heredoc {
                        delimiter,
                        body: body.join("\n"),
                    },
                    span,
                };
            }
            body.push(line);
            if self.peek() == Some('\n') {
                self.newline();
            }
        }
    }

    /// Lex a number (integer, decimal, or exponential).
    fn lex_number(&mut self) -> Token {
        let span = self.span();
        let mut num = String::new();

        while let Some(c) = self.peek().filter(char::is_ascii_digit) {
            num.push(c);
            self.advance();
        }

        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            num.push('.');
            self.advance();
            while let Some(c) = self.peek().filter(char::is_ascii_digit) {
                num.push(c);
                self.advance();
            }
        }

        // Only take the exponent when digits actually follow it.
        if matches!(self.peek(), Some('E' | 'e')) {
            let sign = matches!(self.peek_at(1), Some('+' | '-'));
            let digit_at = if sign { 2 } else { 1 };
            if self.peek_at(digit_at).is_some_and(|c| c.is_ascii_digit()) {
                num.push('E');
                self.advance();
                if sign {
                    if let Some(s) = self.peek() {
                        num.push(s);
                    }
                    self.advance();
                }
                while let Some(c) = self.peek().filter(char::is_ascii_digit) {
                    num.push(c);
                    self.advance();
                }
            }
        }

        Token { kind: TokenKind::Number(num), span }
    }

    /// Lex a symbol (identifier or keyword), keeping its spelling.
    fn lex_symbol(&mut self) -> Token {
        let span = self.span();
        let mut sym = String::new();
        while let Some(c) = self.peek().filter(|c| is_symbol_char(*c)) {
            sym.push(c);
            self.advance();
        }
        Token { kind: TokenKind::Symbol(sym), span }
    }

    /// Check if the rest of the current line is blank or only comments.
    fn is_line_end(&self) -> bool {
        let mut i = self.pos;
        while let Some(&c) = self.chars.get(i) {
            match c {
                '\n' => return true,
                ' ' | '\t' => i += 1,
                '-' if self.chars.get(i + 1) == Some(&'-') => return true,
                '/' if self.chars.get(i + 1) == Some(&'*') => {
                    i += 2;
                    let mut depth = 1;
                    while i < self.chars.len() && depth > 0 {
                        if self.chars[i] == '*' && self.chars.get(i + 1) == Some(&'/') {
                            depth -= 1;
                            i += 2;
                        } else if self.chars[i] == '/' && self.chars.get(i + 1) == Some(&'*') {
                            depth += 1;
                            i += 2;
                        } else {
                            i += 1;
                        }
                    }
                }
                _ => return false,
            }
        }
        true
    }

    /// Skip to the beginning of the next line.
    fn skip_to_next_line(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                self.newline();
                return;
            }
            self.advance();
        }
    }
}

fn is_symbol_start(c: char) -> bool {
    c.is_ascii_alphabetic() || matches!(c, '_' | '@' | '#' | '$' | '?')
}

fn is_symbol_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '@' | '#' | '$' | '?' | '.')
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        lex(src)
            .into_iter()
            .filter(|t| !matches!(t.kind, TokenKind::Eol | TokenKind::Eof))
            .map(|t| t.kind)
            .collect()
    }

    fn sym(s: &str) -> TokenKind {
        TokenKind::Symbol(s.to_string())
    }

    fn single(s: &str) -> TokenKind {
        TokenKind::StringLit {
            value: s.to_string(),
            interpolate: false,
        }
    }

    #[test]
    fn test_say_string() {
        assert_eq!(kinds("SAY 'Hello World'"), vec![sym("SAY"), single("Hello World")]);
    }

    #[test]
    fn test_symbols_keep_spelling() {
        assert_eq!(kinds("myVar = 42"), vec![
            sym("myVar"),
            TokenKind::Eq,
            TokenKind::Number("42".to_string()),
        ]);
    }

    #[test]
    fn test_double_quotes_interpolate() {
        assert_eq!(kinds("\"Hi {{name}}\""), vec![TokenKind::StringLit {
            value: "Hi {{name}}".to_string(),
            interpolate: true,
        }]);
    }

    #[test]
    fn test_doubled_quote_escape() {
        assert_eq!(kinds("'it''s'"), vec![single("it's")]);
    }

    #[test]
    fn test_operators() {
        assert_eq!(kinds("a + b - c * d / e % f ** g"), vec![
            sym("a"), TokenKind::Plus,
            sym("b"), TokenKind::Minus,
            sym("c"), TokenKind::Star,
            sym("d"), TokenKind::Slash,
            sym("e"), TokenKind::Percent,
            sym("f"), TokenKind::StarStar,
            sym("g"),
        ]);
    }

    #[test]
    fn test_not_equal_spellings() {
        assert_eq!(kinds("a \\= b <> c != d ¬= e"), vec![
            sym("a"), TokenKind::Ne,
            sym("b"), TokenKind::Ne,
            sym("c"), TokenKind::Ne,
            sym("d"), TokenKind::Ne,
            sym("e"),
        ]);
    }

    #[test]
    fn test_concat_pipe_and_or() {
        assert_eq!(kinds("a || b |> f | c & d && e"), vec![
            sym("a"), TokenKind::Concat,
            sym("b"), TokenKind::Pipe,
            sym("f"), TokenKind::Or,
            sym("c"), TokenKind::And,
            sym("d"), TokenKind::Xor,
            sym("e"),
        ]);
    }

    #[test]
    fn test_brackets() {
        assert_eq!(kinds("arr[1]"), vec![
            sym("arr"),
            TokenKind::LBracket,
            TokenKind::Number("1".to_string()),
            TokenKind::RBracket,
        ]);
    }

    #[test]
    fn test_comments() {
        assert_eq!(kinds("/* outer /* inner */ */ SAY 1 -- trailing"), vec![
            sym("SAY"),
            TokenKind::Number("1".to_string()),
        ]);
    }

    #[test]
    fn test_numbers() {
        assert_eq!(kinds("3.14 .5 1E10 2e-3"), vec![
            TokenKind::Number("3.14".to_string()),
            TokenKind::Number(".5".to_string()),
            TokenKind::Number("1E10".to_string()),
            TokenKind::Number("2E-3".to_string()),
        ]);
    }

    #[test]
    fn test_exponent_needs_digits() {
        assert_eq!(kinds("3else"), vec![TokenKind::Number("3".to_string()), sym("else")]);
    }

    #[test]
    fn test_continuation() {
        let toks = lex("SAY 'a',\n  'b'");
        let eols = toks.iter().filter(|t| t.kind == TokenKind::Eol).count();
        assert_eq!(eols, 0);
        assert_eq!(toks[2].span.line, 2);
    }

    #[test]
    fn test_dotted_symbol_and_lone_dot() {
        assert_eq!(kinds("user.name ."), vec![sym("user.name"), TokenKind::Dot]);
    }

    #[test]
    fn test_line_numbers() {
        let toks = lex("x = 1\ny = 2\n");
        assert_eq!(toks[0].span, Span { line: 1, col: 1 });
        assert_eq!(toks[4].span, Span { line: 2, col: 1 });
    }

    #[test]
    fn test_heredoc_captures_body() {
        let toks = lex("LET q = <<SQL\nSELECT *\n  FROM t\nSQL\nSAY q");
        assert_eq!(toks[3].kind, TokenKind::Heredoc {
            delimiter: "SQL".to_string(),
            body: "SELECT *\n  FROM t".to_string(),
        });
        assert_eq!(toks[4].kind, TokenKind::Eol);
        assert_eq!(toks[4].span.line, 4);
        assert_eq!(toks[5].kind, sym("SAY"));
        assert_eq!(toks[5].span.line, 5);
    }

    #[test]
    fn test_heredoc_delimiter_may_be_indented() {
        let toks = lex("<<EOF\nbody\n   EOF\n");
        assert!(matches!(&toks[0].kind, TokenKind::Heredoc { body, .. } if body == "body"));
    }

    #[test]
    fn test_unterminated_heredoc() {
        let toks = lex("<<EOF\nno end here\n");
        assert_eq!(
            toks[0].kind,
            TokenKind::Error(LexErrorKind::UnterminatedHeredoc { delimiter: "EOF".to_string() })
        );
        assert_eq!(toks[0].span.line, 1);
    }

    #[test]
    fn test_unterminated_string_is_error_token() {
        let toks = lex("SAY 'oops\nSAY 2");
        assert_eq!(toks[1].kind, TokenKind::Error(LexErrorKind::UnterminatedString));
        // lexing resumes on the next line
        assert_eq!(toks[3].kind, sym("SAY"));
        assert_eq!(toks[3].span.line, 2);
    }

    #[test]
    fn test_unterminated_comment_is_error_token() {
        let toks = lex("SAY 1 /* never closed\n");
        assert_eq!(toks[2].kind, TokenKind::Error(LexErrorKind::UnterminatedComment));
    }

    #[test]
    fn test_lex_from_line_keeps_absolute_lines() {
        let source = SourceText::new("SAY 1\n/* junk\nSAY 3\n");
        let toks = lex_from_line(&source, 3);
        assert_eq!(toks[0].kind, sym("SAY"));
        assert_eq!(toks[0].span.line, 3);
        let past_end = lex_from_line(&source, 10);
        assert_eq!(past_end.len(), 1);
        assert_eq!(past_end[0].kind, TokenKind::Eof);
    }

    #[test]
    fn test_unexpected_char() {
        assert_eq!(kinds("a ~ b")[1], TokenKind::Error(LexErrorKind::UnexpectedChar('~')));
    }
}
