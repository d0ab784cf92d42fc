//! The evaluation context: request-scoped variable bindings.
//!
//! A [`Context`] parameterizes every computation in the engine. Nodes read
//! the current frame and user-defined variables, and push temporary bindings
//! through an [`EditableScope`] while delegating to upstream nodes.
//!
//! A scope is an owned copy of its parent: edits never alias the parent
//! context, so prior bindings are restored on every exit path — normal
//! return, early return or propagated failure — without any cleanup code.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::geometry::V2i;

/// Variable holding the current frame number.
pub const FRAME_VAR: &str = "frame";

// =============================================================================
// Value
// =============================================================================

/// A context variable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    String(String),
    Int(i64),
    Float(f64),
    V2i(V2i),
    IntList(Vec<i32>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::V2i(v) => write!(f, "{},{}", v.x, v.y),
            Value::IntList(list) => {
                for (i, v) in list.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", v)?;
                }
                Ok(())
            }
        }
    }
}

// =============================================================================
// Context
// =============================================================================

/// An ordered mapping from variable name to value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    vars: BTreeMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.vars.get(name) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.vars.get(name) {
            Some(Value::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn get_v2i(&self, name: &str) -> Option<V2i> {
        match self.vars.get(name) {
            Some(Value::V2i(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) {
        self.vars.remove(name);
    }

    /// The current frame number, if bound.
    pub fn frame(&self) -> Option<i32> {
        self.get_int(FRAME_VAR).map(|f| f as i32)
    }

    pub fn set_frame(&mut self, frame: i32) {
        self.set(FRAME_VAR, Value::Int(frame as i64));
    }

    /// Begins a scope of temporary bindings layered over this context.
    pub fn scope(&self) -> EditableScope {
        EditableScope { ctx: self.clone() }
    }

    /// Substitutes `${name}` variable references and `#` frame padding in
    /// `input`.
    ///
    /// An unbound variable substitutes to the empty string. A run of `#`
    /// characters substitutes the current frame, zero-padded to the run
    /// length; with no frame bound the run is left untouched.
    pub fn substitute(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut chars = input.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '$' if chars.peek() == Some(&'{') => {
                    chars.next();
                    let mut name = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    if closed {
                        if let Some(value) = self.get(&name) {
                            out.push_str(&value.to_string());
                        }
                    } else {
                        // Unterminated reference passes through literally.
                        out.push_str("${");
                        out.push_str(&name);
                    }
                }
                '#' => {
                    let mut width = 1;
                    while chars.peek() == Some(&'#') {
                        chars.next();
                        width += 1;
                    }
                    match self.frame() {
                        Some(frame) => out.push_str(&format!("{:0width$}", frame)),
                        None => out.extend(std::iter::repeat('#').take(width)),
                    }
                }
                c => out.push(c),
            }
        }

        out
    }
}

/// Whether `input` contains frame-substitution tokens.
///
/// A file name that varies by frame must fold the current frame into its
/// dependency hash even though the raw configuration string does not change.
pub fn has_frame_token(input: &str) -> bool {
    input.contains('#')
}

// =============================================================================
// EditableScope
// =============================================================================

/// A temporary layer of context edits.
///
/// The scope owns its own copy of the parent context; dropping it discards
/// every edit, restoring the caller's view unconditionally.
#[derive(Debug, Clone)]
pub struct EditableScope {
    ctx: Context,
}

impl EditableScope {
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.ctx.set(name, value);
    }

    pub fn remove(&mut self, name: &str) {
        self.ctx.remove(name);
    }

    pub fn set_frame(&mut self, frame: i32) {
        self.ctx.set_frame(frame);
    }

    /// The context as seen inside this scope.
    pub fn context(&self) -> &Context {
        &self.ctx
    }
}

impl Deref for EditableScope {
    type Target = Context;

    fn deref(&self) -> &Context {
        &self.ctx
    }
}
