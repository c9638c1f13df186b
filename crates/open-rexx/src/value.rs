//! Runtime values.
//!
//! Scalars are copied on assignment. Arrays and objects are shared cells:
//! cloning a [`Value`] clones the handle, so two variables bound to the same
//! array observe each other's mutations. [`Value::deep_copy`] produces an
//! independent structure.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

use serde::{Serialize, Serializer};

/// Shared array storage.
pub type ArrayRef = Rc<RefCell<Vec<Value>>>;
/// Shared object storage. Keys iterate in sorted order.
pub type ObjectRef = Rc<RefCell<BTreeMap<String, Value>>>;

/// Nesting beyond this renders as a marker instead of recursing, and
/// structural equality gives up (unequal) beyond it.
const MAX_RENDER_DEPTH: usize = 64;

/// A dynamically typed script value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Number(f64),
    String(String),
    Boolean(bool),
    Array(ArrayRef),
    Object(ObjectRef),
}

impl Value {
    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn object(entries: BTreeMap<String, Value>) -> Self {
        Value::Object(Rc::new(RefCell::new(entries)))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Boolean(_) => "boolean",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True when both values are the same shared collection.
    pub fn same_ref(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Recursively copy arrays and objects so the result shares nothing
    /// with `self`.
    ///
    /// Sharing inside the structure is reproduced in the copy: a collection
    /// reachable twice is copied once, and a collection that contains
    /// itself yields a copy that contains the copy.
    pub fn deep_copy(&self) -> Value {
        self.copy_into(&mut HashMap::new())
    }

    fn copy_into(&self, copies: &mut HashMap<*const (), Value>) -> Value {
        match self {
            Value::Array(items) => {
                let key = Rc::as_ptr(items).cast::<()>();
                if let Some(copy) = copies.get(&key) {
                    return copy.clone();
                }
                let cell: ArrayRef = Rc::default();
                copies.insert(key, Value::Array(Rc::clone(&cell)));
                let copied: Vec<Value> = items.borrow().iter().map(|v| v.copy_into(copies)).collect();
                *cell.borrow_mut() = copied;
                Value::Array(cell)
            }
            Value::Object(entries) => {
                let key = Rc::as_ptr(entries).cast::<()>();
                if let Some(copy) = copies.get(&key) {
                    return copy.clone();
                }
                let cell: ObjectRef = Rc::default();
                copies.insert(key, Value::Object(Rc::clone(&cell)));
                let copied: BTreeMap<String, Value> = entries
                    .borrow()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.copy_into(copies)))
                    .collect();
                *cell.borrow_mut() = copied;
                Value::Object(cell)
            }
            scalar => scalar.clone(),
        }
    }

    fn eq_depth(&self, other: &Value, depth: usize) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                if depth >= MAX_RENDER_DEPTH {
                    return false;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.eq_depth(y, depth + 1))
            }
            (Value::Object(a), Value::Object(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                if depth >= MAX_RENDER_DEPTH {
                    return false;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && va.eq_depth(vb, depth + 1))
            }
            _ => false,
        }
    }

    /// Truthiness.
    ///
    /// Numbers are true when non-zero. Strings are true when non-empty,
    /// except numeric strings, which follow the number rule so that `"0"`
    /// is false. Collections are true when non-empty; null is false.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Boolean(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => match parse_number(s) {
                Some(n) => n != 0.0,
                None => !s.is_empty(),
            },
            Value::Array(items) => !items.borrow().is_empty(),
            Value::Object(entries) => !entries.borrow().is_empty(),
        }
    }

    /// Numeric view of the value, if it has one.
    ///
    /// Numbers and numeric strings convert; booleans are 1 and 0; null,
    /// collections and other strings do not.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::String(s) => parse_number(s),
            Value::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// A number that is integral, if the value has one.
    pub fn as_integer(&self) -> Option<i64> {
        self.as_number()
            .filter(|n| n.is_finite() && n.fract() == 0.0)
            .map(|n| n as i64)
    }

    /// Compare two values. Numeric when both sides are numeric, otherwise
    /// the rendered strings compare with surrounding blanks ignored.
    pub fn compare(&self, other: &Value) -> Ordering {
        let numeric = !matches!(self, Value::Boolean(_)) && !matches!(other, Value::Boolean(_));
        if numeric {
            if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
                return a.partial_cmp(&b).unwrap_or(Ordering::Equal);
            }
        }
        let (a, b) = (self.to_string(), other.to_string());
        a.trim().cmp(b.trim())
    }

    /// Follow a property path (`["user", "name"]`). Array segments are
    /// 1-based indices. Missing segments yield `Null`.
    pub fn get_path<S: AsRef<str>>(&self, segments: &[S]) -> Value {
        let mut current = self.clone();
        for segment in segments {
            let next = current.get_member(segment.as_ref());
            current = next;
            if current.is_null() {
                break;
            }
        }
        current
    }

    /// One step of property access: object key or 1-based array index.
    pub fn get_member(&self, key: &str) -> Value {
        match self {
            Value::Object(entries) => entries.borrow().get(key).cloned().unwrap_or_default(),
            Value::Array(items) => key
                .parse::<usize>()
                .ok()
                .and_then(|i| i.checked_sub(1))
                .and_then(|i| items.borrow().get(i).cloned())
                .unwrap_or_default(),
            _ => Value::Null,
        }
    }

    /// Convert to a JSON tree.
    ///
    /// A collection nested inside itself renders as `"[Circular]"`.
    pub fn to_json(&self) -> serde_json::Value {
        self.to_json_depth(&mut Vec::new())
    }

    /// `open` holds the collections currently being rendered.
    fn to_json_depth(&self, open: &mut Vec<*const ()>) -> serde_json::Value {
        use serde_json::Value as Json;
        let cell = match self {
            Value::Array(items) => Some(Rc::as_ptr(items).cast::<()>()),
            Value::Object(entries) => Some(Rc::as_ptr(entries).cast::<()>()),
            _ => None,
        };
        if let Some(cell) = cell {
            if open.len() > MAX_RENDER_DEPTH || open.contains(&cell) {
                return Json::String("[Circular]".to_string());
            }
            open.push(cell);
        }
        let json = match self {
            Value::Null => Json::Null,
            Value::Boolean(b) => Json::Bool(*b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9.0e15 {
                    Json::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n).map(Json::Number).unwrap_or(Json::Null)
                }
            }
            Value::String(s) => Json::String(s.clone()),
            Value::Array(items) => Json::Array(
                items
                    .borrow()
                    .iter()
                    .map(|v| v.to_json_depth(open))
                    .collect(),
            ),
            Value::Object(entries) => Json::Object(
                entries
                    .borrow()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json_depth(open)))
                    .collect(),
            ),
        };
        if cell.is_some() {
            open.pop();
        }
        json
    }

    /// Build a value from a JSON tree.
    pub fn from_json(json: serde_json::Value) -> Value {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Boolean(b),
            Json::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::array(items.into_iter().map(Value::from_json).collect()),
            Json::Object(entries) => Value::object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

/// Parse a numeric string. Surrounding blanks are allowed; `inf`, `nan`
/// and the like are not numbers here.
pub fn parse_number(s: &str) -> Option<f64> {
    let t = s.trim();
    if t.is_empty()
        || !t
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
        || !t.chars().any(|c| c.is_ascii_digit())
    {
        return None;
    }
    t.parse().ok()
}

/// Render a number. Integral values print without a fractional part.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else {
        format!("{n}")
    }
}

/// Structural equality. Two handles to the same collection are equal
/// without being walked.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        self.eq_depth(other, 0)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Number(n) => f.debug_tuple("Number").field(n).finish(),
            Value::String(s) => f.debug_tuple("String").field(s).finish(),
            Value::Boolean(b) => f.debug_tuple("Boolean").field(b).finish(),
            Value::Array(_) => write!(f, "Array({})", self.to_json()),
            Value::Object(_) => write!(f, "Object({})", self.to_json()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::String(s) => write!(f, "{s}"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Array(_) | Value::Object(_) => write!(f, "{}", self.to_json()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::array(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Value::object(entries)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::from_json(json)
    }
}
