//! Built-in function library.
//!
//! - Values: COPY, DATATYPE, SEQ
//! - String: COPIES, LEFT, LENGTH, LOWER, POS, REVERSE, RIGHT, STRIP,
//!   SUBSTR, TRIM, UPPER, WORD, WORDS
//! - Numeric: ABS, MAX, MIN, ROUND
//! - Array: ARRAY_GET, ARRAY_LENGTH, ARRAY_POP, ARRAY_PUSH, ARRAY_SET
//! - JSON: ARRAY_FROM_JSON, JSON_PARSE, JSON_STRINGIFY
//! - Text: INTERPOLATE
//!
//! String positions are 1-based and count characters.

use crate::functions::{FunctionError, FunctionTable};
use crate::interpolate::{interpolate, InterpolationOptions, PlaceholderStyle};
use crate::value::{ArrayRef, Value};

/// Upper bound on the length of a `SEQ` result.
const MAX_SEQ_LEN: usize = 10_000_000;

/// Register the whole library into `table`.
pub fn register_all(table: &mut FunctionTable) {
    // -- Values --
    table.register("COPY", &["value"], fn_copy);
    table.register("DATATYPE", &["value", "type"], fn_datatype);
    table.register("SEQ", &["start", "end", "step"], fn_seq);

    // -- String functions --
    table.register("COPIES", &["string", "count"], fn_copies);
    table.register("LEFT", &["string", "length", "pad"], fn_left);
    table.register("LENGTH", &["value"], fn_length);
    table.register("LOWER", &["string"], |args| Ok(text(args, 0).to_lowercase().into()));
    table.register("POS", &["needle", "haystack", "start"], fn_pos);
    table.register("REVERSE", &["string"], |args| {
        Ok(text(args, 0).chars().rev().collect::<String>().into())
    });
    table.register("RIGHT", &["string", "length", "pad"], fn_right);
    table.register("STRIP", &["string", "option", "char"], fn_strip);
    table.register("SUBSTR", &["string", "start", "length", "pad"], fn_substr);
    table.register("TRIM", &["string"], |args| Ok(text(args, 0).trim().into()));
    table.register("UPPER", &["string"], |args| Ok(text(args, 0).to_uppercase().into()));
    table.register("WORD", &["string", "n"], fn_word);
    table.register("WORDS", &["string"], |args| {
        Ok(Value::Number(text(args, 0).split_whitespace().count() as f64))
    });

    // -- Numeric functions --
    table.register("ABS", &["number"], |args| Ok(number(args, 0, "number")?.abs().into()));
    table.register("MAX", &[], |args| extremum(args, f64::max));
    table.register("MIN", &[], |args| extremum(args, f64::min));
    table.register("ROUND", &["number", "digits"], fn_round);

    // -- Array functions --
    table.register("ARRAY_GET", &["array", "index"], fn_array_get);
    table.register("ARRAY_LENGTH", &["array"], |args| {
        Ok(Value::Number(array(args, 0)?.borrow().len() as f64))
    });
    table.register("ARRAY_POP", &["array"], |args| {
        Ok(array(args, 0)?.borrow_mut().pop().unwrap_or_default())
    });
    table.register("ARRAY_PUSH", &["array", "value"], fn_array_push);
    table.register("ARRAY_SET", &["array", "index", "value"], fn_array_set);

    // -- JSON --
    table.register("ARRAY_FROM_JSON", &["text"], fn_array_from_json);
    table.register("JSON_PARSE", &["text"], fn_json_parse);
    table.register("JSON_STRINGIFY", &["value", "indent"], fn_json_stringify);

    // -- Text --
    table.register("INTERPOLATE", &["template", "values"], fn_interpolate);
}

// ---------------------------------------------------------------------------
//  Helpers
// ---------------------------------------------------------------------------

fn value(args: &[Value], i: usize) -> Value {
    args.get(i).cloned().unwrap_or_default()
}

fn text(args: &[Value], i: usize) -> String {
    args.get(i).map(ToString::to_string).unwrap_or_default()
}

fn is_given(args: &[Value], i: usize) -> bool {
    args.get(i).is_some_and(|v| !v.is_null())
}

fn number(args: &[Value], i: usize, name: &str) -> Result<f64, FunctionError> {
    match args.get(i) {
        None | Some(Value::Null) => Err(FunctionError::MissingArgument(name.to_string())),
        Some(v) => v.as_number().ok_or_else(|| FunctionError::bad_argument(v, "a number")),
    }
}

/// Optional non-negative whole number.
fn count(args: &[Value], i: usize) -> Result<Option<usize>, FunctionError> {
    if !is_given(args, i) {
        return Ok(None);
    }
    let v = &args[i];
    match v.as_integer() {
        Some(n) if n >= 0 => Ok(Some(n as usize)),
        _ => Err(FunctionError::bad_argument(v, "a non-negative whole number")),
    }
}

fn pad_char(args: &[Value], i: usize) -> char {
    text(args, i).chars().next().unwrap_or(' ')
}

fn array(args: &[Value], i: usize) -> Result<ArrayRef, FunctionError> {
    match args.get(i) {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(other) => Err(FunctionError::bad_argument(other, "an array")),
        None => Err(FunctionError::MissingArgument("array".to_string())),
    }
}

// ---------------------------------------------------------------------------
//  Values
// ---------------------------------------------------------------------------

fn fn_copy(args: &[Value]) -> Result<Value, FunctionError> {
    Ok(value(args, 0).deep_copy())
}

fn fn_datatype(args: &[Value]) -> Result<Value, FunctionError> {
    let v = value(args, 0);
    if !is_given(args, 1) {
        let kind = match &v {
            Value::Array(_) => "ARRAY",
            Value::Object(_) => "OBJECT",
            Value::Boolean(_) => "BOOLEAN",
            Value::Null => "NULL",
            other if other.as_number().is_some() => "NUM",
            _ => "CHAR",
        };
        return Ok(kind.into());
    }

    let s = v.to_string();
    let non_empty = !s.is_empty();
    let matches = match text(args, 1).to_ascii_uppercase().chars().next() {
        Some('N') => v.as_number().is_some(),
        Some('W') => v.as_integer().is_some(),
        Some('A') => non_empty && s.chars().all(|c| c.is_alphanumeric()),
        Some('M') => non_empty && s.chars().all(|c| c.is_alphabetic()),
        Some('U') => non_empty && s.chars().all(|c| c.is_uppercase()),
        Some('L') => non_empty && s.chars().all(|c| c.is_lowercase()),
        Some('B') => matches!(v, Value::Boolean(_)),
        _ => return Err(FunctionError::bad_argument(&value(args, 1), "a DATATYPE option")),
    };
    Ok(Value::Number(if matches { 1.0 } else { 0.0 }))
}

/// `SEQ(start, end[, step])`: inclusive arithmetic sequence.
fn fn_seq(args: &[Value]) -> Result<Value, FunctionError> {
    let start = number(args, 0, "start")?;
    let end = number(args, 1, "end")?;
    let step = if is_given(args, 2) {
        number(args, 2, "step")?
    } else if end < start {
        -1.0
    } else {
        1.0
    };

    if step == 0.0 {
        return Err(FunctionError::ZeroStep);
    }
    if !step.is_finite() || !start.is_finite() || !end.is_finite() {
        return Err(FunctionError::Failed("SEQ bounds must be finite".to_string()));
    }
    if step < 0.0 && end > start {
        return Err(FunctionError::Failed("negative step requires end <= start".to_string()));
    }
    if step > 0.0 && end < start {
        return Err(FunctionError::Failed("positive step requires end >= start".to_string()));
    }

    let len = ((end - start) / step).floor() + 1.0;
    if !len.is_finite() || len > MAX_SEQ_LEN as f64 {
        return Err(FunctionError::Failed(format!(
            "SEQ would produce more than {MAX_SEQ_LEN} items"
        )));
    }
    let len = len as usize;
    let items = (0..len)
        .map(|k| Value::Number(start + k as f64 * step))
        .collect();
    Ok(Value::array(items))
}

// ---------------------------------------------------------------------------
//  String functions
// ---------------------------------------------------------------------------

fn fn_copies(args: &[Value]) -> Result<Value, FunctionError> {
    let n = count(args, 1)?.unwrap_or(0);
    Ok(text(args, 0).repeat(n).into())
}

fn fn_left(args: &[Value]) -> Result<Value, FunctionError> {
    let s = text(args, 0);
    let n = count(args, 1)?.unwrap_or(0);
    let pad = pad_char(args, 2);
    let mut out: String = s.chars().take(n).collect();
    let have = out.chars().count();
    out.extend(std::iter::repeat(pad).take(n - have));
    Ok(out.into())
}

fn fn_right(args: &[Value]) -> Result<Value, FunctionError> {
    let s: Vec<char> = text(args, 0).chars().collect();
    let n = count(args, 1)?.unwrap_or(0);
    let pad = pad_char(args, 2);
    let out: String = if s.len() >= n {
        s[s.len() - n..].iter().collect()
    } else {
        std::iter::repeat(pad).take(n - s.len()).chain(s.iter().copied()).collect()
    };
    Ok(out.into())
}

fn fn_length(args: &[Value]) -> Result<Value, FunctionError> {
    let n = match value(args, 0) {
        Value::Array(items) => items.borrow().len(),
        Value::Object(entries) => entries.borrow().len(),
        other => other.to_string().chars().count(),
    };
    Ok(Value::Number(n as f64))
}

fn fn_pos(args: &[Value]) -> Result<Value, FunctionError> {
    let needle: Vec<char> = text(args, 0).chars().collect();
    let haystack: Vec<char> = text(args, 1).chars().collect();
    let start = count(args, 2)?.unwrap_or(1).max(1) - 1;
    if needle.is_empty() || start >= haystack.len() {
        return Ok(Value::Number(0.0));
    }
    let found = haystack[start..]
        .windows(needle.len())
        .position(|w| w == needle.as_slice())
        .map(|i| i + start + 1)
        .unwrap_or(0);
    Ok(Value::Number(found as f64))
}

fn fn_strip(args: &[Value]) -> Result<Value, FunctionError> {
    let s = text(args, 0);
    let option = text(args, 1).to_ascii_uppercase();
    let strip: Option<char> = is_given(args, 2).then(|| pad_char(args, 2));
    let matches = |c: char| match strip {
        Some(target) => c == target,
        None => c.is_whitespace(),
    };
    let out = match option.chars().next() {
        Some('L') => s.trim_start_matches(matches),
        Some('T') => s.trim_end_matches(matches),
        None | Some('B') => s.trim_matches(matches),
        Some(_) => return Err(FunctionError::bad_argument(&value(args, 1), "B, L or T")),
    };
    Ok(out.into())
}

fn fn_substr(args: &[Value]) -> Result<Value, FunctionError> {
    let s: Vec<char> = text(args, 0).chars().collect();
    let start = count(args, 1)?.unwrap_or(1);
    if start == 0 {
        return Err(FunctionError::bad_argument(&value(args, 1), "a positive start"));
    }
    let from = start - 1;
    let pad = pad_char(args, 3);
    let out: String = match count(args, 2)? {
        Some(len) => (from..from + len)
            .map(|i| s.get(i).copied().unwrap_or(pad))
            .collect(),
        None => s.iter().skip(from).collect(),
    };
    Ok(out.into())
}

fn fn_word(args: &[Value]) -> Result<Value, FunctionError> {
    let s = text(args, 0);
    let n = count(args, 1)?.unwrap_or(0);
    let word = n
        .checked_sub(1)
        .and_then(|i| s.split_whitespace().nth(i))
        .unwrap_or("");
    Ok(word.into())
}

// ---------------------------------------------------------------------------
//  Numeric functions
// ---------------------------------------------------------------------------

fn extremum(args: &[Value], pick: fn(f64, f64) -> f64) -> Result<Value, FunctionError> {
    if args.is_empty() {
        return Err(FunctionError::MissingArgument("number".to_string()));
    }
    let mut best: Option<f64> = None;
    for (i, _) in args.iter().enumerate() {
        let n = number(args, i, "number")?;
        best = Some(best.map_or(n, |b| pick(b, n)));
    }
    Ok(best.map(Value::Number).unwrap_or_default())
}

fn fn_round(args: &[Value]) -> Result<Value, FunctionError> {
    let n = number(args, 0, "number")?;
    let digits = count(args, 1)?.unwrap_or(0).min(15) as i32;
    let factor = 10f64.powi(digits);
    Ok(Value::Number((n * factor).round() / factor))
}

// ---------------------------------------------------------------------------
//  Array functions
// ---------------------------------------------------------------------------

/// Convert a 1-based index argument to a 0-based position.
fn index(args: &[Value], i: usize) -> Result<i64, FunctionError> {
    let v = value(args, i);
    v.as_integer()
        .ok_or_else(|| FunctionError::bad_argument(&v, "a whole-number index"))
}

fn fn_array_get(args: &[Value]) -> Result<Value, FunctionError> {
    let items = array(args, 0)?;
    let i = index(args, 1)?;
    let items = items.borrow();
    let got = usize::try_from(i - 1).ok().and_then(|i| items.get(i).cloned());
    Ok(got.unwrap_or_default())
}

fn fn_array_set(args: &[Value]) -> Result<Value, FunctionError> {
    let cell = array(args, 0)?;
    let i = index(args, 1)?;
    let v = value(args, 2);
    {
        let mut items = cell.borrow_mut();
        let len = items.len();
        match usize::try_from(i - 1) {
            Ok(pos) if pos < len => items[pos] = v,
            Ok(pos) if pos == len => items.push(v),
            _ => return Err(FunctionError::IndexOutOfRange { index: i, len }),
        }
    }
    Ok(Value::Array(cell))
}

fn fn_array_push(args: &[Value]) -> Result<Value, FunctionError> {
    let cell = array(args, 0)?;
    cell.borrow_mut().push(value(args, 1));
    Ok(Value::Array(cell))
}

// ---------------------------------------------------------------------------
//  JSON
// ---------------------------------------------------------------------------

fn fn_json_parse(args: &[Value]) -> Result<Value, FunctionError> {
    let json: serde_json::Value = serde_json::from_str(&text(args, 0))
        .map_err(|e| FunctionError::InvalidJson(e.to_string()))?;
    Ok(Value::from_json(json))
}

fn fn_array_from_json(args: &[Value]) -> Result<Value, FunctionError> {
    let json: serde_json::Value = serde_json::from_str(&text(args, 0))
        .map_err(|e| FunctionError::InvalidArrayJson(e.to_string()))?;
    match json {
        serde_json::Value::Array(_) => Ok(Value::from_json(json)),
        other => Err(FunctionError::InvalidArrayJson(format!(
            "expected an array, found {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(json: &serde_json::Value) -> &'static str {
    match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

fn fn_json_stringify(args: &[Value]) -> Result<Value, FunctionError> {
    let json = value(args, 0).to_json();
    let indent = count(args, 1)?.unwrap_or(0);
    let out = if indent == 0 {
        serde_json::to_string(&json)
    } else {
        serde_json::to_string_pretty(&json)
    };
    out.map(Value::String)
        .map_err(|e| FunctionError::Failed(e.to_string()))
}

// ---------------------------------------------------------------------------
//  Text
// ---------------------------------------------------------------------------

/// `INTERPOLATE(template, values)`: fill `{{path}}` placeholders from an
/// object. Unresolved placeholders are left as written.
fn fn_interpolate(args: &[Value]) -> Result<Value, FunctionError> {
    let template = text(args, 0);
    let values = value(args, 1);
    let out = interpolate(
        &template,
        PlaceholderStyle::Double,
        &InterpolationOptions::default(),
        |name| {
            let segments: Vec<&str> = name.split('.').collect();
            let found = values.get_path(&segments);
            (!found.is_null()).then(|| found.to_string())
        },
    )
    .map_err(|e| FunctionError::Failed(e.to_string()))?;
    Ok(out.into())
}
