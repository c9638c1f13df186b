//! Variable environment and call frames.
//!
//! The environment is a stack of [`Frame`]s: the global frame at the bottom
//! and one frame per active CALL above it. Variable names are
//! case-insensitive; a frame stores them uppercased along with the
//! spelling they were first written with.
//!
//! Scoping rules:
//! - A subroutine frame *inherits*: reads and writes of names it does not
//!   hold itself go to the caller, and new variables land in the nearest
//!   non-inheriting frame (the global frame unless a PROCEDURE intervenes).
//! - `PROCEDURE` makes the frame private. Only `EXPOSE`d names still reach
//!   the caller.
//! - Arguments bound by `PARSE ARG` are always local to the frame.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use tracing::trace;

use crate::value::Value;

#[derive(Debug, Clone)]
struct Binding {
    /// Spelling of the name when first assigned.
    name: String,
    value: Value,
}

/// One activation record.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    vars: HashMap<String, Binding>,
    args: Vec<Value>,
    inherits: bool,
    exposed: HashSet<String>,
    address: Option<String>,
}

impl Frame {
    /// The global frame.
    fn global() -> Self {
        Self::default()
    }

    /// A frame for a CALL, inheriting the caller's variables and ADDRESS.
    fn for_call(args: Vec<Value>, address: Option<String>) -> Self {
        Self {
            args,
            inherits: true,
            address,
            ..Self::default()
        }
    }

    /// Does a lookup of `key` in this frame continue to the caller?
    fn delegates(&self, key: &str) -> bool {
        self.inherits || self.exposed.contains(key)
    }
}

/// Trace record of one active CALL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallFrame {
    /// Subroutine name as written at the call site.
    pub subroutine: String,
    /// Line of the CALL.
    pub caller_line: u32,
    /// Line of the subroutine's label.
    pub entry_line: u32,
}

/// Frame stack plus the CALL trace stack.
#[derive(Debug, Clone)]
pub struct Environment {
    frames: Vec<Frame>,
    calls: Vec<CallFrame>,
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

fn key(name: &str) -> String {
    name.to_ascii_uppercase()
}

impl Environment {
    pub fn new() -> Self {
        Self {
            frames: vec![Frame::global()],
            calls: Vec::new(),
        }
    }

    /// Number of active CALLs.
    pub fn depth(&self) -> usize {
        self.frames.len() - 1
    }

    pub fn call_stack(&self) -> &[CallFrame] {
        &self.calls
    }

    fn top(&self) -> &Frame {
        &self.frames[self.frames.len() - 1]
    }

    fn top_mut(&mut self) -> &mut Frame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    /// Index of the frame that holds `key`, if any frame visible from the
    /// top does.
    fn owner(&self, key: &str) -> Option<usize> {
        let mut i = self.frames.len() - 1;
        loop {
            let frame = &self.frames[i];
            if frame.vars.contains_key(key) {
                return Some(i);
            }
            if i == 0 || !frame.delegates(key) {
                return None;
            }
            i -= 1;
        }
    }

    /// Frame where a new variable named `key` is created.
    fn home(&self, key: &str) -> usize {
        let mut i = self.frames.len() - 1;
        while i > 0 && self.frames[i].delegates(key) {
            i -= 1;
        }
        i
    }

    /// Read a variable.
    pub fn get(&self, name: &str) -> Option<Value> {
        let key = key(name);
        self.owner(&key)
            .and_then(|i| self.frames[i].vars.get(&key))
            .map(|b| b.value.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.owner(&key(name)).is_some()
    }

    /// Assign a variable, following the scoping rules.
    pub fn set(&mut self, name: &str, value: Value) {
        let key = key(name);
        let index = self.owner(&key).unwrap_or_else(|| self.home(&key));
        Self::bind(&mut self.frames[index], key, name, value);
    }

    /// Assign in the top frame regardless of inheritance.
    pub fn set_local(&mut self, name: &str, value: Value) {
        let key = key(name);
        Self::bind(self.top_mut(), key, name, value);
    }

    fn bind(frame: &mut Frame, key: String, name: &str, value: Value) {
        match frame.vars.entry(key) {
            Entry::Occupied(mut slot) => slot.get_mut().value = value,
            Entry::Vacant(slot) => {
                slot.insert(Binding {
                    name: name.to_string(),
                    value,
                });
            }
        }
    }

    /// Remove a variable. Returns whether it existed.
    pub fn drop_var(&mut self, name: &str) -> bool {
        let key = key(name);
        match self.owner(&key) {
            Some(i) => self.frames[i].vars.remove(&key).is_some(),
            None => false,
        }
    }

    /// Arguments of the current frame.
    pub fn args(&self) -> &[Value] {
        &self.top().args
    }

    /// Set the arguments of the global frame (script arguments).
    pub fn set_script_args(&mut self, args: Vec<Value>) {
        self.frames[0].args = args;
    }

    /// The current frame's active ADDRESS target.
    pub fn address(&self) -> Option<&str> {
        self.top().address.as_deref()
    }

    pub fn set_address(&mut self, target: Option<String>) {
        self.top_mut().address = target;
    }

    /// Enter a subroutine.
    pub fn push_call(&mut self, call: CallFrame, args: Vec<Value>) {
        let address = self.top().address.clone();
        trace!(subroutine = %call.subroutine, line = call.caller_line, depth = self.frames.len(), "push frame");
        self.frames.push(Frame::for_call(args, address));
        self.calls.push(call);
    }

    /// Leave the innermost subroutine. The global frame is never popped.
    pub fn pop_call(&mut self) -> Option<CallFrame> {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
        let call = self.calls.pop();
        if let Some(call) = &call {
            trace!(subroutine = %call.subroutine, depth = self.frames.len(), "pop frame");
        }
        call
    }

    /// `PROCEDURE [EXPOSE names]` on the current frame.
    pub fn make_private(&mut self, expose: &[String]) {
        let frame = self.top_mut();
        frame.inherits = false;
        frame.exposed = expose.iter().map(|n| key(n)).collect();
    }

    /// Drop every subroutine frame, keeping globals.
    pub fn unwind(&mut self) {
        if self.frames.len() > 1 {
            trace!(frames = self.frames.len() - 1, "unwind");
        }
        self.frames.truncate(1);
        self.calls.clear();
    }

    /// Every variable visible from the current frame, by the name it was
    /// first written with. Inner frames shadow outer ones.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        let mut visible: Vec<(usize, Option<&HashSet<String>>)> = Vec::new();
        let mut i = self.frames.len() - 1;
        visible.push((i, None));
        while i > 0 {
            let frame = &self.frames[i];
            let filter = if frame.inherits { None } else { Some(&frame.exposed) };
            if filter.is_some_and(HashSet::is_empty) {
                break;
            }
            i -= 1;
            visible.push((i, filter));
            if filter.is_some() {
                break;
            }
        }

        let mut out = BTreeMap::new();
        let mut seen = HashSet::new();
        for (index, filter) in visible {
            for (k, binding) in &self.frames[index].vars {
                if filter.is_some_and(|names| !names.contains(k)) {
                    continue;
                }
                if seen.insert(k.clone()) {
                    out.insert(binding.name.clone(), binding.value.clone());
                }
            }
        }
        out
    }
}
