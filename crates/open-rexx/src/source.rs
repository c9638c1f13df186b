//! Script source preprocessing.
//!
//! Every script passes through [`SourceText::new()`] before tokenization.
//! Line endings are normalized to `\n` first, then a line index is built
//! from the normalized text so that physical lines can be recovered by
//! number. The parser needs this for `ADDRESS target LINES(n)`, which
//! captures the raw text of the lines that follow an instruction, and for
//! slicing the raw text of command clauses.

/// Normalized script text plus a line-offset index.
#[derive(Debug, Clone)]
pub struct SourceText {
    text: String,
    /// Byte offset where each line (0-indexed) begins.
    offsets: Vec<usize>,
}

impl SourceText {
    /// Normalize `raw` and index its lines.
    pub fn new(raw: &str) -> Self {
        let text = normalize_line_endings(raw);
        let mut offsets = vec![0];
        for (i, byte) in text.bytes().enumerate() {
            if byte == b'\n' {
                offsets.push(i + 1);
            }
        }
        Self { text, offsets }
    }

    /// The normalized text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Number of physical lines.
    pub fn line_count(&self) -> usize {
        self.offsets.len()
    }

    /// Byte offset of the start of a 1-based line.
    pub fn line_start(&self, line: u32) -> Option<usize> {
        let index = (line as usize).checked_sub(1)?;
        self.offsets.get(index).copied()
    }

    /// Text of a 1-based line, without its terminator.
    pub fn line(&self, line: u32) -> Option<&str> {
        let start = self.line_start(line)?;
        let end = self
            .offsets
            .get(line as usize)
            .map(|next| next - 1)
            .unwrap_or(self.text.len());
        Some(&self.text[start..end])
    }

    /// Join the physical lines `first..=last` with `\n`.
    ///
    /// Returns `None` when any line in the range does not exist.
    pub fn lines(&self, first: u32, last: u32) -> Option<String> {
        let mut out = Vec::new();
        for n in first..=last {
            out.push(self.line(n)?);
        }
        Some(out.join("\n"))
    }

    /// Text from `(line, col)` to the end of that line. Columns are
    /// 1-based and counted in characters.
    pub fn rest_of_line(&self, line: u32, col: u32) -> Option<&str> {
        let text = self.line(line)?;
        let skip = (col as usize).saturating_sub(1);
        let byte = text
            .char_indices()
            .nth(skip)
            .map(|(i, _)| i)
            .unwrap_or(text.len());
        Some(&text[byte..])
    }

    /// Text between two positions on the same line (`end_col` exclusive).
    pub fn slice(&self, line: u32, start_col: u32, end_col: u32) -> Option<&str> {
        let text = self.line(line)?;
        let to_byte = |col: u32| {
            let skip = (col as usize).saturating_sub(1);
            text.char_indices()
                .nth(skip)
                .map(|(i, _)| i)
                .unwrap_or(text.len())
        };
        let (start, end) = (to_byte(start_col), to_byte(end_col));
        if start > end {
            return None;
        }
        Some(&text[start..end])
    }
}

/// Normalize line endings to Unix style (`\n`).
///
/// Converts `\r\n` and bare `\r` to `\n`.
pub fn normalize_line_endings(text: &str) -> String {
    if !text.contains('\r') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\r' {
            out.push('\n');
            if chars.peek() == Some(&'\n') {
                chars.next();
            }
        } else {
            out.push(c);
        }
    }
    out
}
