//! Script value model
//!
//! `Value` is the dynamically-typed value graph a worker and its owner
//! exchange. Arrays and objects are reference cells (`Rc<RefCell<..>>`),
//! so aliasing and cycles are expressible and `Rc` pointer identity is
//! what the codec uses to detect them. `Value` is deliberately `!Send`:
//! a value can never cross the owner/worker boundary directly, only its
//! codec snapshot can.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use crate::error::{WorkerError, WorkerResult};

/// Object entries in insertion order
pub type ObjectEntries = Vec<(String, Value)>;

/// A dynamically-typed script value
#[derive(Debug, Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// Mutable array, aliasable via `clone`
    Array(Rc<RefCell<Vec<Value>>>),
    /// Mutable object, aliasable via `clone`; entries keep insertion order
    Object(Rc<RefCell<ObjectEntries>>),
    /// Live callback function; not transferable across contexts
    Callback(HostCallback),
    /// Opaque native bridge object; not transferable across contexts
    HostObject(HostObject),
}

impl Value {
    /// Build an array value from items
    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    /// Build an object value from key/value entries
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Object(Rc::new(RefCell::new(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        )))
    }

    /// Look up an object property, cloning the value handle
    pub fn get(&self, key: &str) -> Option<Value> {
        match self {
            Value::Object(cells) => cells
                .borrow()
                .iter()
                .find(|(k, _)| k.as_str() == key)
                .map(|(_, v)| v.clone()),
            _ => None,
        }
    }

    /// Index into an array value, cloning the value handle
    pub fn at(&self, index: usize) -> Option<Value> {
        match self {
            Value::Array(cells) => cells.borrow().get(index).cloned(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Convert to a JSON value. Fails on cycles and non-transferable
    /// variants, which have no JSON form.
    pub fn to_json(&self) -> WorkerResult<serde_json::Value> {
        self.to_json_inner(&mut HashSet::new())
    }

    fn to_json_inner(&self, active: &mut HashSet<usize>) -> WorkerResult<serde_json::Value> {
        Ok(match self {
            Value::Undefined | Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(cells) => {
                let key = Rc::as_ptr(cells) as *const () as usize;
                if !active.insert(key) {
                    return Err(WorkerError::Serialization(
                        "cyclic value has no JSON form".into(),
                    ));
                }
                let items = cells.borrow();
                let mut out = Vec::with_capacity(items.len());
                for item in items.iter() {
                    out.push(item.to_json_inner(active)?);
                }
                active.remove(&key);
                serde_json::Value::Array(out)
            }
            Value::Object(cells) => {
                let key = Rc::as_ptr(cells) as *const () as usize;
                if !active.insert(key) {
                    return Err(WorkerError::Serialization(
                        "cyclic value has no JSON form".into(),
                    ));
                }
                let entries = cells.borrow();
                let mut out = serde_json::Map::new();
                for (k, v) in entries.iter() {
                    out.insert(k.clone(), v.to_json_inner(active)?);
                }
                active.remove(&key);
                serde_json::Value::Object(out)
            }
            Value::Callback(_) | Value::HostObject(_) => {
                return Err(WorkerError::Serialization(
                    "function and host values have no JSON form".into(),
                ));
            }
        })
    }

    /// Build a value from JSON
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                Value::object(map.iter().map(|(k, v)| (k.clone(), Value::from_json(v))))
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Number(v as f64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(v as f64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// A live callback function value
///
/// Callbacks can be stored inside a value graph and invoked within the
/// context that created them, but the codec refuses to transfer them.
#[derive(Clone)]
pub struct HostCallback(Rc<dyn Fn(&[Value]) -> Value>);

impl HostCallback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Value + 'static,
    {
        Self(Rc::new(f))
    }

    pub fn invoke(&self, args: &[Value]) -> Value {
        (self.0)(args)
    }
}

impl fmt::Debug for HostCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HostCallback")
    }
}

/// An opaque handle to a native object from the platform bridge
#[derive(Clone)]
pub struct HostObject(Rc<dyn Any>);

impl HostObject {
    pub fn new<T: Any>(inner: T) -> Self {
        Self(Rc::new(inner))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HostObject")
    }
}

/// Structural equality over two value graphs
///
/// Numbers compare NaN-equal. Callbacks and host objects compare by
/// identity. Cycles are handled by treating an already-visited pair of
/// nodes as equal.
pub fn deep_eq(a: &Value, b: &Value) -> bool {
    deep_eq_inner(a, b, &mut HashSet::new())
}

fn deep_eq_inner(a: &Value, b: &Value, seen: &mut HashSet<(usize, usize)>) -> bool {
    match (a, b) {
        (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y || (x.is_nan() && y.is_nan()),
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => {
            let key = (
                Rc::as_ptr(x) as *const () as usize,
                Rc::as_ptr(y) as *const () as usize,
            );
            if !seen.insert(key) {
                return true;
            }
            let xs = x.borrow();
            let ys = y.borrow();
            xs.len() == ys.len()
                && xs
                    .iter()
                    .zip(ys.iter())
                    .all(|(u, v)| deep_eq_inner(u, v, seen))
        }
        (Value::Object(x), Value::Object(y)) => {
            let key = (
                Rc::as_ptr(x) as *const () as usize,
                Rc::as_ptr(y) as *const () as usize,
            );
            if !seen.insert(key) {
                return true;
            }
            let xs = x.borrow();
            let ys = y.borrow();
            xs.len() == ys.len()
                && xs
                    .iter()
                    .zip(ys.iter())
                    .all(|((ka, va), (kb, vb))| ka == kb && deep_eq_inner(va, vb, seen))
        }
        (Value::Callback(x), Value::Callback(y)) => Rc::ptr_eq(&x.0, &y.0),
        (Value::HostObject(x), Value::HostObject(y)) => Rc::ptr_eq(&x.0, &y.0),
        _ => false,
    }
}
