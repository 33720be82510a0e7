//! Serialization codec for cross-context message passing
//!
//! `encode` flattens a value graph into a self-contained `Snapshot`: an
//! arena of array/object nodes plus a root slot. Aliased and cyclic nodes
//! are detected by `Rc` pointer identity and encoded once, so identity is
//! preserved within a single snapshot. `decode` rebuilds a fresh graph
//! every time; two decodes of the same snapshot share no storage with each
//! other or with the original value.
//!
//! Non-transferable values (live callbacks, native bridge objects) fail
//! encoding with a `Serialization` error, which `postMessage` surfaces
//! synchronously to the caller.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::{WorkerError, WorkerResult};
use crate::value::Value;

/// A leaf value or a reference into the snapshot's node arena
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Slot {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Node(u32),
}

/// A compound node in the arena
#[derive(Debug, Clone, Serialize, Deserialize)]
enum SnapshotNode {
    Array(Vec<Slot>),
    Object(Vec<(String, Slot)>),
}

/// A context-independent serialized copy of a value graph
///
/// Snapshots are plain data (`Send`) and serde-serializable, so they can
/// cross threads or be persisted as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    nodes: Vec<SnapshotNode>,
    root: Slot,
}

impl Snapshot {
    /// Number of compound nodes captured by this snapshot
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Convert a value graph into a transport-safe snapshot
pub fn encode(value: &Value) -> WorkerResult<Snapshot> {
    let mut encoder = Encoder {
        nodes: Vec::new(),
        seen: HashMap::new(),
    };
    let root = encoder.encode_slot(value)?;
    Ok(Snapshot {
        nodes: encoder.nodes,
        root,
    })
}

/// Reconstruct an independent copy of the snapshot's value graph
pub fn decode(snapshot: &Snapshot) -> WorkerResult<Value> {
    // First pass allocates an empty shell per node so cyclic references
    // have something to point at before their contents exist.
    let shells: Vec<Value> = snapshot
        .nodes
        .iter()
        .map(|node| match node {
            SnapshotNode::Array(_) => Value::Array(Rc::new(RefCell::new(Vec::new()))),
            SnapshotNode::Object(_) => Value::Object(Rc::new(RefCell::new(Vec::new()))),
        })
        .collect();

    for (index, node) in snapshot.nodes.iter().enumerate() {
        match node {
            SnapshotNode::Array(slots) => {
                if let Value::Array(cells) = &shells[index] {
                    let mut items = cells.borrow_mut();
                    for slot in slots {
                        items.push(decode_slot(slot, &shells)?);
                    }
                }
            }
            SnapshotNode::Object(entries) => {
                if let Value::Object(cells) = &shells[index] {
                    let mut out = cells.borrow_mut();
                    for (key, slot) in entries {
                        out.push((key.clone(), decode_slot(slot, &shells)?));
                    }
                }
            }
        }
    }

    decode_slot(&snapshot.root, &shells)
}

fn decode_slot(slot: &Slot, shells: &[Value]) -> WorkerResult<Value> {
    Ok(match slot {
        Slot::Undefined => Value::Undefined,
        Slot::Null => Value::Null,
        Slot::Bool(b) => Value::Bool(*b),
        Slot::Number(n) => Value::Number(*n),
        Slot::String(s) => Value::String(s.clone()),
        Slot::Node(index) => shells.get(*index as usize).cloned().ok_or_else(|| {
            WorkerError::Serialization(format!("snapshot references missing node {index}"))
        })?,
    })
}

struct Encoder {
    nodes: Vec<SnapshotNode>,
    seen: HashMap<usize, u32>,
}

impl Encoder {
    fn encode_slot(&mut self, value: &Value) -> WorkerResult<Slot> {
        Ok(match value {
            Value::Undefined => Slot::Undefined,
            Value::Null => Slot::Null,
            Value::Bool(b) => Slot::Bool(*b),
            Value::Number(n) => Slot::Number(*n),
            Value::String(s) => Slot::String(s.clone()),
            Value::Array(cells) => {
                let key = Rc::as_ptr(cells) as *const () as usize;
                if let Some(&index) = self.seen.get(&key) {
                    return Ok(Slot::Node(index));
                }
                let index = self.reserve(key);
                let items = cells.borrow();
                let mut slots = Vec::with_capacity(items.len());
                for item in items.iter() {
                    slots.push(self.encode_slot(item)?);
                }
                self.nodes[index as usize] = SnapshotNode::Array(slots);
                Slot::Node(index)
            }
            Value::Object(cells) => {
                let key = Rc::as_ptr(cells) as *const () as usize;
                if let Some(&index) = self.seen.get(&key) {
                    return Ok(Slot::Node(index));
                }
                let index = self.reserve(key);
                let entries = cells.borrow();
                let mut slots = Vec::with_capacity(entries.len());
                for (name, item) in entries.iter() {
                    slots.push((name.clone(), self.encode_slot(item)?));
                }
                self.nodes[index as usize] = SnapshotNode::Object(slots);
                Slot::Node(index)
            }
            Value::Callback(_) => {
                return Err(WorkerError::Serialization(
                    "function values cannot be cloned across contexts".into(),
                ));
            }
            Value::HostObject(_) => {
                return Err(WorkerError::Serialization(
                    "host objects cannot be cloned across contexts".into(),
                ));
            }
        })
    }

    // Reserve the node's arena index before walking its children so a
    // cycle back to it resolves through `seen` instead of recursing.
    fn reserve(&mut self, key: usize) -> u32 {
        let index = self.nodes.len() as u32;
        self.nodes.push(SnapshotNode::Array(Vec::new()));
        self.seen.insert(key, index);
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{HostCallback, HostObject, deep_eq};

    fn roundtrip(value: &Value) -> Value {
        decode(&encode(value).unwrap()).unwrap()
    }

    #[test]
    fn primitives_roundtrip() {
        for value in [
            Value::Undefined,
            Value::Null,
            Value::Bool(true),
            Value::Number(123456.22),
            Value::from("a string that crosses the boundary intact"),
        ] {
            assert!(deep_eq(&roundtrip(&value), &value));
        }
    }

    #[test]
    fn object_roundtrips_deep_equal_but_independent() {
        let original = Value::object(vec![
            ("data", Value::from("A message from main")),
            ("sig", Value::from("X")),
            ("arbitraryNumber", Value::from(42.0)),
        ]);
        let copy = roundtrip(&original);
        assert!(deep_eq(&copy, &original));

        // mutating the copy must not leak into the original
        if let Value::Object(cells) = &copy {
            cells.borrow_mut().push(("extra".into(), Value::from(1.0)));
        }
        assert!(!deep_eq(&copy, &original));
        assert!(original.get("extra").is_none());
    }

    #[test]
    fn shared_references_keep_identity_within_one_decode() {
        let shared = Value::array(vec![Value::from(1.0)]);
        let outer = Value::array(vec![shared.clone(), shared]);
        let copy = roundtrip(&outer);

        let (first, second) = (copy.at(0).unwrap(), copy.at(1).unwrap());
        match (&first, &second) {
            (Value::Array(a), Value::Array(b)) => assert!(Rc::ptr_eq(a, b)),
            _ => panic!("expected arrays"),
        }
        // and the snapshot stored the shared node only once
        assert_eq!(encode(&outer).unwrap().node_count(), 2);
    }

    #[test]
    fn cycles_roundtrip() {
        let outer = Value::array(vec![Value::from("head")]);
        if let Value::Array(cells) = &outer {
            let self_ref = outer.clone();
            cells.borrow_mut().push(self_ref);
        }

        let copy = roundtrip(&outer);
        match (&copy, &copy.at(1).unwrap()) {
            (Value::Array(a), Value::Array(b)) => assert!(Rc::ptr_eq(a, b)),
            _ => panic!("expected cyclic array"),
        }
        assert_eq!(copy.at(0).unwrap().as_str(), Some("head"));
    }

    #[test]
    fn separate_decodes_share_nothing() {
        let snapshot = encode(&Value::object(vec![("n", Value::from(1.0))])).unwrap();
        let first = decode(&snapshot).unwrap();
        let second = decode(&snapshot).unwrap();

        if let Value::Object(cells) = &first {
            cells.borrow_mut().push(("mutated".into(), Value::Null));
        }
        assert!(second.get("mutated").is_none());
        match (&first, &second) {
            (Value::Object(a), Value::Object(b)) => assert!(!Rc::ptr_eq(a, b)),
            _ => panic!("expected objects"),
        }
    }

    #[test]
    fn callbacks_fail_encoding() {
        let value = Value::object(vec![(
            "cb",
            Value::Callback(HostCallback::new(|_| Value::Undefined)),
        )]);
        assert!(matches!(
            encode(&value),
            Err(WorkerError::Serialization(_))
        ));
    }

    #[test]
    fn host_objects_fail_encoding() {
        let value = Value::array(vec![Value::HostObject(HostObject::new(5u8))]);
        assert!(matches!(
            encode(&value),
            Err(WorkerError::Serialization(_))
        ));
    }

    #[test]
    fn snapshots_serialize_as_plain_data() {
        let snapshot = encode(&Value::object(vec![("sig", Value::from("X"))])).unwrap();
        let wire = serde_json::to_string(&snapshot).unwrap();
        let back: Snapshot = serde_json::from_str(&wire).unwrap();
        assert!(deep_eq(
            &decode(&back).unwrap(),
            &decode(&snapshot).unwrap()
        ));
    }
}
