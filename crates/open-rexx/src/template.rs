//! PARSE templates.
//!
//! A template splits a source string into variables:
//! - **Word parsing**: `PARSE VALUE s WITH a b c` (split on whitespace)
//! - **Literal patterns**: `PARSE VALUE s WITH a ',' b`
//! - **Absolute positions**: `PARSE VALUE s WITH a 5 b` (1-based columns)
//! - **Relative positions**: `PARSE VALUE s WITH a +3 b`
//! - **Variable patterns**: `PARSE VALUE s WITH a (delim) b`
//!
//! Commas separate templates for successive arguments (`PARSE ARG a, b`).
//! Positions count characters, not bytes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single element in a PARSE template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemplateElement {
    /// Variable name to receive the parsed value.
    Variable(String),
    /// `.` placeholder; the parsed value is discarded.
    Dot,
    /// Literal string delimiter.
    Literal(String),
    /// Absolute column position (1-based).
    AbsolutePos(usize),
    /// Relative offset from the current position.
    RelativePos(i64),
    /// `(name)`: the variable's value is the delimiter.
    VarPattern(String),
}

/// A full template: one element list per comma-separated piece.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub pieces: Vec<Vec<TemplateElement>>,
}

impl Template {
    pub fn new(pieces: Vec<Vec<TemplateElement>>) -> Self {
        Self { pieces }
    }

    /// True when every piece is plain variable names (and dots), which
    /// allows binding arguments positionally.
    pub fn is_name_list(&self) -> bool {
        self.pieces.iter().flatten().all(|e| {
            matches!(e, TemplateElement::Variable(_) | TemplateElement::Dot)
        })
    }

    /// Every variable the template assigns, in order.
    pub fn variables(&self) -> Vec<&str> {
        self.pieces
            .iter()
            .flatten()
            .filter_map(|e| match e {
                TemplateElement::Variable(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Apply one template piece to `source`.
///
/// Returns `(variable, value)` pairs in template order. `resolve` supplies
/// the value of a `(name)` pattern.
pub fn execute_parse(
    source: &str,
    template: &[TemplateElement],
    upper: bool,
    resolve: &dyn Fn(&str) -> String,
) -> Vec<(String, String)> {
    let text = if upper {
        source.to_uppercase()
    } else {
        source.to_string()
    };
    let input: Vec<char> = text.chars().collect();
    let mut result = Vec::new();
    let mut pos = 0usize;
    let mut i = 0;

    while i < template.len() {
        let target = match &template[i] {
            TemplateElement::Variable(name) => Some(name.clone()),
            TemplateElement::Dot => None,
            other => {
                // A pattern with no preceding target just moves the cursor.
                pos = advance_cursor(other, &input, pos, resolve).1;
                i += 1;
                continue;
            }
        };
        i += 1;

        let value = match template.get(i) {
            None => {
                let rest: String = input[pos.min(input.len())..].iter().collect();
                pos = input.len();
                rest.trim_start().to_string()
            }
            Some(TemplateElement::Variable(_) | TemplateElement::Dot) => {
                let (word, next) = next_word(&input, pos);
                pos = next;
                word
            }
            Some(pattern) => {
                let (start, next) = advance_cursor(pattern, &input, pos, resolve);
                let value = if pos < start {
                    input[pos..start].iter().collect()
                } else {
                    String::new()
                };
                pos = next;
                i += 1;
                value
            }
        };

        if let Some(name) = target {
            result.push((name, value));
        }
    }

    result
}

/// Take the next blank-delimited word starting at `pos`.
fn next_word(input: &[char], pos: usize) -> (String, usize) {
    let mut start = pos.min(input.len());
    while start < input.len() && input[start].is_whitespace() {
        start += 1;
    }
    let mut end = start;
    while end < input.len() && !input[end].is_whitespace() {
        end += 1;
    }
    let word = input[start..end].iter().collect();
    let next = if end < input.len() { end + 1 } else { end };
    (word, next)
}

/// Locate a pattern. Returns `(value_end, next_cursor)`.
fn advance_cursor(
    pattern: &TemplateElement,
    input: &[char],
    pos: usize,
    resolve: &dyn Fn(&str) -> String,
) -> (usize, usize) {
    let pos = pos.min(input.len());
    match pattern {
        TemplateElement::Literal(lit) => find_literal(input, pos, lit),
        TemplateElement::VarPattern(name) => find_literal(input, pos, &resolve(name)),
        TemplateElement::AbsolutePos(col) => {
            let target = col.saturating_sub(1).min(input.len());
            (target, target)
        }
        TemplateElement::RelativePos(offset) => {
            let target = (pos as i64 + offset).clamp(0, input.len() as i64) as usize;
            (target, target)
        }
        TemplateElement::Variable(_) | TemplateElement::Dot => (pos, pos),
    }
}

fn find_literal(input: &[char], pos: usize, lit: &str) -> (usize, usize) {
    let needle: Vec<char> = lit.chars().collect();
    if needle.is_empty() {
        return (input.len(), input.len());
    }
    let found = input[pos..]
        .windows(needle.len())
        .position(|w| w == needle.as_slice());
    match found {
        Some(offset) => (pos + offset, pos + offset + needle.len()),
        None => (input.len(), input.len()),
    }
}

impl fmt::Display for TemplateElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateElement::Variable(name) => write!(f, "{name}"),
            TemplateElement::Dot => write!(f, "."),
            TemplateElement::Literal(lit) => write!(f, "\"{}\"", lit.replace('"', "\"\"")),
            TemplateElement::AbsolutePos(col) => write!(f, "{col}"),
            TemplateElement::RelativePos(offset) if *offset >= 0 => write!(f, "+{offset}"),
            TemplateElement::RelativePos(offset) => write!(f, "{offset}"),
            TemplateElement::VarPattern(name) => write!(f, "({name})"),
        }
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pieces: Vec<String> = self
            .pieces
            .iter()
            .map(|piece| {
                piece
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect();
        write!(f, "{}", pieces.join(", "))
    }
}
