//! StructureCodec: value graphs to and from wire structures.
//!
//! Serialization walks the graph once, assigning ref ids in pre-order into
//! an arena. Each node is registered before its children are visited, so a
//! child that points back at an ancestor resolves to the ancestor's id.
//! If the walk met no cycle, shared node or special kind, the arena is
//! discarded and the value is written as plain JSON.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use num_bigint::BigInt;
use serde_json::{json, Map as JsonMap, Number};

use crate::buffer::{Buffer, BufferKind};
use crate::channel::{MessageChannel, Transferable};
use crate::error::{Error, Result};
use crate::value::{ErrorKind, ErrorValue, Object, RegExp, Shared, Value};
use crate::wire::{ref_id, ChannelId, Ref, SpecialKind, Structure};

const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Deepest container nesting either direction of the codec accepts.
///
/// Kept below serde_json's parser limit so that any graph written in the
/// plain form can also be read back by the peer.
pub const MAX_DEPTH: usize = 100;

// Integers up to 2^53 are exact in an f64 and are written without a fraction.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// The result of decoding a structure.
#[derive(Debug, Clone)]
pub struct Deserialized {
    pub data: Value,
    /// Ports materialized while decoding. Each must be registered with the
    /// connection that delivered it to complete the transfer.
    pub transferred: Vec<Transferable>,
}

/// Serialize a value graph into a wire structure.
///
/// Fails with [`Error::TransferRequired`] when the graph holds a port that
/// has not been transferred.
pub fn serialize(value: &Value) -> Result<Structure> {
    if value.is_primitive() {
        return Ok(Structure {
            root: primitive_json(value),
            ..Structure::default()
        });
    }

    let mut walker = Serializer::default();
    let root = walker.visit(value)?;

    if walker.tagged {
        let refs = walker
            .arena
            .into_iter()
            .enumerate()
            .map(|(index, entry)| (ref_id(index), entry))
            .collect();
        Ok(Structure {
            root,
            refs: Some(refs),
            channel: None,
        })
    } else {
        Ok(Structure {
            root: plain_json(value),
            ..Structure::default()
        })
    }
}

/// Rebuild the value graph described by `structure`.
pub fn deserialize(structure: &Structure) -> Result<Deserialized> {
    let Some(refs) = &structure.refs else {
        return Ok(Deserialized {
            data: structure.root.as_ref().map(from_plain).unwrap_or_default(),
            transferred: Vec::new(),
        });
    };

    let root = structure
        .root
        .as_ref()
        .ok_or_else(|| Error::corrupt("structure with refs has no root"))?;
    let id = marker(root)?;

    let mut resolver = Deserializer {
        refs,
        cache: HashMap::new(),
        transferred: Vec::new(),
        depth: 0,
    };
    let data = resolver.resolve(id)?;
    Ok(Deserialized {
        data,
        transferred: resolver.transferred,
    })
}

#[derive(Default)]
struct Serializer {
    arena: Vec<Ref>,
    seen: HashMap<usize, usize>,
    tagged: bool,
    depth: usize,
}

impl Serializer {
    fn alloc(&mut self, identity: Option<usize>) -> usize {
        let index = self.arena.len();
        self.arena.push(Ref::plain(serde_json::Value::Null));
        if let Some(identity) = identity {
            self.seen.insert(identity, index);
        }
        index
    }

    fn finish(&mut self, index: usize, entry: Ref) -> Option<serde_json::Value> {
        if entry.kind.is_some() {
            self.tagged = true;
        }
        self.arena[index] = entry;
        Some(json!([ref_id(index)]))
    }

    fn enter(&mut self) -> Result<()> {
        if self.depth >= MAX_DEPTH {
            return Err(Error::NestingTooDeep(MAX_DEPTH));
        }
        self.depth += 1;
        Ok(())
    }

    /// Returns `None` for `undefined`, which has no JSON form.
    fn visit(&mut self, value: &Value) -> Result<Option<serde_json::Value>> {
        if value.is_primitive() {
            return Ok(primitive_json(value));
        }

        let identity = value.identity();
        if let Some(index) = identity.and_then(|id| self.seen.get(&id)) {
            self.tagged = true;
            return Ok(Some(json!([ref_id(*index)])));
        }

        self.enter()?;
        let json = self.visit_node(value, identity)?;
        self.depth -= 1;
        Ok(json)
    }

    fn visit_node(
        &mut self,
        value: &Value,
        identity: Option<usize>,
    ) -> Result<Option<serde_json::Value>> {
        let index = self.alloc(identity);
        let entry = match value {
            Value::Buffer(buffer) => {
                let buffer = buffer.lock();
                Ref::special(
                    buffer.kind().special_kind(),
                    json!(BASE64.encode(buffer.bytes())),
                )
            }
            Value::BigInt(n) => Ref::special(SpecialKind::BigInt, json!(n.to_string())),
            Value::Array(items) => {
                let items = items.snapshot();
                let root = self.visit_elements(&items)?;
                Ref::plain(serde_json::Value::Array(root))
            }
            Value::Date(at) => Ref::special(
                SpecialKind::Date,
                json!(at.to_rfc3339_opts(SecondsFormat::Millis, true)),
            ),
            Value::RegExp(re) => Ref::special(
                SpecialKind::RegExp,
                json!({ "source": re.source, "flags": re.flags }),
            ),
            Value::Map(entries) => {
                let entries = entries.snapshot();
                let mut root = Vec::with_capacity(entries.len());
                for (key, value) in &entries {
                    // The pair ref is a level of its own when decoded.
                    self.enter()?;
                    let pair = self.alloc(None);
                    let key = self.visit(key)?.unwrap_or(serde_json::Value::Null);
                    let value = self.visit(value)?.unwrap_or(serde_json::Value::Null);
                    root.push(json!([ref_id(pair)]));
                    self.arena[pair] = Ref::plain(json!([key, value]));
                    self.depth -= 1;
                }
                Ref::special(SpecialKind::Map, serde_json::Value::Array(root))
            }
            Value::Set(items) => {
                let items = items.snapshot();
                let root = self.visit_elements(&items)?;
                Ref::special(SpecialKind::Set, serde_json::Value::Array(root))
            }
            Value::Error(error) => {
                let mut root = JsonMap::new();
                root.insert("name".into(), json!(error.name));
                if let Some(message) = &error.message {
                    root.insert("message".into(), json!(message));
                }
                if let Some(stack) = &error.stack {
                    root.insert("stack".into(), json!(stack));
                }
                Ref::special(SpecialKind::Error, serde_json::Value::Object(root))
            }
            Value::Port(port) => {
                if !port.is_transferred() {
                    return Err(Error::TransferRequired(port.channel_id().clone()));
                }
                Ref::special(SpecialKind::Port, json!({ "channel": port.channel_id() }))
            }
            Value::Object(fields) => {
                let fields = fields.snapshot();
                let mut root = JsonMap::new();
                for (key, value) in &fields {
                    if let Some(json) = self.visit(value)? {
                        root.insert(key.clone(), json);
                    }
                }
                Ref::plain(serde_json::Value::Object(root))
            }
            Value::Undefined
            | Value::Null
            | Value::Bool(_)
            | Value::Number(_)
            | Value::String(_) => unreachable!("primitives return before allocation"),
        };

        Ok(self.finish(index, entry))
    }

    fn visit_elements(&mut self, items: &[Value]) -> Result<Vec<serde_json::Value>> {
        items
            .iter()
            .map(|item| Ok(self.visit(item)?.unwrap_or(serde_json::Value::Null)))
            .collect()
    }
}

struct Deserializer<'a> {
    refs: &'a BTreeMap<String, Ref>,
    cache: HashMap<String, Value>,
    transferred: Vec<Transferable>,
    depth: usize,
}

impl Deserializer<'_> {
    fn resolve(&mut self, id: &str) -> Result<Value> {
        if let Some(value) = self.cache.get(id) {
            return Ok(value.clone());
        }

        if self.depth >= MAX_DEPTH {
            return Err(Error::corrupt(format!(
                "{}: nested deeper than {} levels",
                id, MAX_DEPTH
            )));
        }
        self.depth += 1;
        let value = self.resolve_entry(id)?;
        self.depth -= 1;
        Ok(value)
    }

    fn resolve_entry(&mut self, id: &str) -> Result<Value> {
        let entry = self
            .refs
            .get(id)
            .ok_or_else(|| Error::corrupt(format!("missing reference {}", id)))?;

        let Some(kind) = entry.kind else {
            return self.resolve_plain(id, &entry.root);
        };

        if let Some(buffer_kind) = BufferKind::from_special(kind) {
            let text = expect_str(&entry.root, id)?;
            let bytes = BASE64
                .decode(text)
                .map_err(|e| Error::corrupt(format!("{}: invalid base64: {}", id, e)))?;
            let value = Value::Buffer(Shared::new(Buffer::new(buffer_kind, bytes)?));
            return Ok(self.remember(id, value));
        }

        let value = match kind {
            SpecialKind::BigInt => {
                let text = expect_str(&entry.root, id)?;
                let n: BigInt = text
                    .parse()
                    .map_err(|e| Error::corrupt(format!("{}: invalid bigint: {}", id, e)))?;
                self.remember(id, Value::BigInt(n))
            }
            SpecialKind::Date => {
                let text = expect_str(&entry.root, id)?;
                let at = DateTime::parse_from_rfc3339(text)
                    .map_err(|e| Error::corrupt(format!("{}: invalid date: {}", id, e)))?;
                self.remember(id, Value::date(at.with_timezone(&Utc)))
            }
            SpecialKind::RegExp => {
                let source = field_str(&entry.root, "source").unwrap_or_default();
                let flags = field_str(&entry.root, "flags").unwrap_or_default();
                self.remember(id, Value::RegExp(Arc::new(RegExp::new(source, flags))))
            }
            SpecialKind::Map => {
                let entries = Shared::new(Vec::new());
                self.remember(id, Value::Map(entries.clone()));
                for item in expect_array(&entry.root, id)? {
                    let pair = self.resolve_item(item)?;
                    let key = pair.at(0).unwrap_or_default();
                    let value = pair.at(1).unwrap_or_default();
                    entries.lock().push((key, value));
                }
                Value::Map(entries)
            }
            SpecialKind::Set => {
                let items = Shared::new(Vec::new());
                self.remember(id, Value::Set(items.clone()));
                for item in expect_array(&entry.root, id)? {
                    let value = self.resolve_item(item)?;
                    items.lock().push(value);
                }
                Value::Set(items)
            }
            SpecialKind::Error => {
                let name = field_str(&entry.root, "name").unwrap_or_default();
                let error = ErrorValue {
                    name: ErrorKind::from_name(name).name().to_string(),
                    message: field_str(&entry.root, "message").map(str::to_string),
                    stack: field_str(&entry.root, "stack").map(str::to_string),
                };
                self.remember(id, Value::Error(Arc::new(error)))
            }
            SpecialKind::Port => {
                let channel: ChannelId = entry
                    .root
                    .get("channel")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()?
                    .ok_or_else(|| Error::corrupt(format!("{}: port without channel", id)))?;
                let MessageChannel { port1, port2 } = MessageChannel::with_id(channel);
                self.transferred.push(Transferable::Port(port2));
                self.remember(id, Value::Port(port1))
            }
            _ => unreachable!("binary kinds handled above"),
        };
        Ok(value)
    }

    fn resolve_plain(&mut self, id: &str, root: &serde_json::Value) -> Result<Value> {
        match root {
            serde_json::Value::Array(items) => {
                let array = Shared::new(Vec::with_capacity(items.len()));
                self.remember(id, Value::Array(array.clone()));
                for item in items {
                    let value = self.resolve_item(item)?;
                    array.lock().push(value);
                }
                Ok(Value::Array(array))
            }
            serde_json::Value::Object(fields) => {
                let object = Shared::new(Object::new());
                self.remember(id, Value::Object(object.clone()));
                for (key, item) in fields {
                    let value = self.resolve_item(item)?;
                    object.lock().insert(key.clone(), value);
                }
                Ok(Value::Object(object))
            }
            other => Ok(self.remember(id, from_plain(other))),
        }
    }

    /// A field or element: either a `[RefId]` marker or a primitive.
    fn resolve_item(&mut self, item: &serde_json::Value) -> Result<Value> {
        if item.is_array() {
            let id = marker(item)?;
            self.resolve(id)
        } else {
            Ok(from_plain(item))
        }
    }

    fn remember(&mut self, id: &str, value: Value) -> Value {
        self.cache.insert(id.to_string(), value.clone());
        value
    }
}

fn marker(json: &serde_json::Value) -> Result<&str> {
    json.as_array()
        .and_then(|items| items.first())
        .and_then(|first| first.as_str())
        .ok_or_else(|| Error::corrupt(format!("expected a [RefId] marker, found {}", json)))
}

fn expect_str<'a>(json: &'a serde_json::Value, id: &str) -> Result<&'a str> {
    json.as_str()
        .ok_or_else(|| Error::corrupt(format!("{}: expected a string payload", id)))
}

fn expect_array<'a>(json: &'a serde_json::Value, id: &str) -> Result<&'a Vec<serde_json::Value>> {
    json.as_array()
        .ok_or_else(|| Error::corrupt(format!("{}: expected an array payload", id)))
}

fn field_str<'a>(json: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    json.get(key).and_then(|v| v.as_str())
}

fn number_json(n: f64) -> serde_json::Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        // -0 is written as 0, matching JSON text produced by the runtime.
        serde_json::Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

fn primitive_json(value: &Value) -> Option<serde_json::Value> {
    match value {
        Value::Undefined => None,
        Value::Null => Some(serde_json::Value::Null),
        Value::Bool(b) => Some(serde_json::Value::Bool(*b)),
        Value::Number(n) => Some(number_json(*n)),
        Value::String(s) => Some(serde_json::Value::String(s.clone())),
        _ => None,
    }
}

/// JSON for a graph known to hold only primitives, arrays and objects.
///
/// Only called after a full walk, so the depth is already bounded.
fn plain_json(value: &Value) -> Option<serde_json::Value> {
    match value {
        Value::Array(items) => Some(serde_json::Value::Array(
            items
                .snapshot()
                .iter()
                .map(|item| plain_json(item).unwrap_or(serde_json::Value::Null))
                .collect(),
        )),
        Value::Object(fields) => Some(serde_json::Value::Object(
            fields
                .snapshot()
                .iter()
                .filter_map(|(key, value)| plain_json(value).map(|json| (key.clone(), json)))
                .collect(),
        )),
        other => primitive_json(other),
    }
}

/// Value for JSON that carries no refs.
fn from_plain(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => Value::array(items.iter().map(from_plain)),
        serde_json::Value::Object(fields) => {
            Value::object(fields.iter().map(|(k, v)| (k.clone(), from_plain(v))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelFactory, Side};
    use chrono::TimeZone;

    fn roundtrip(value: &Value) -> Value {
        let structure = serialize(value).unwrap();
        let text = structure.to_json().unwrap();
        deserialize(&Structure::from_json(&text).unwrap())
            .unwrap()
            .data
    }

    #[test]
    fn primitives_roundtrip() {
        for value in [
            Value::Bool(true),
            Value::Bool(false),
            Value::from(0),
            Value::from(1),
            Value::from("s"),
            Value::Undefined,
            Value::Null,
        ] {
            let structure = serialize(&value).unwrap();
            assert!(structure.refs.is_none());
            assert_eq!(roundtrip(&value), value);
        }
    }

    #[test]
    fn undefined_root_is_omitted() {
        assert_eq!(serialize(&Value::Undefined).unwrap().to_json().unwrap(), "{}");
    }

    #[test]
    fn fractional_numbers_keep_precision() {
        assert_eq!(roundtrip(&Value::from(2.75)), Value::from(2.75));
        let structure = serialize(&Value::from(99)).unwrap();
        assert_eq!(structure.to_json().unwrap(), r#"{"root":99}"#);
    }

    #[test]
    fn acyclic_tree_uses_plain_form() {
        let value = Value::object([(
            "a",
            Value::object([("b", Value::object([("c", Value::from(3))]))]),
        )]);
        let structure = serialize(&value).unwrap();
        assert!(structure.refs.is_none());
        assert_eq!(structure.root, Some(json!({"a": {"b": {"c": 3}}})));
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn undefined_fields_are_dropped() {
        let value = Value::object([("gone", Value::Undefined), ("kept", Value::Null)]);
        let structure = serialize(&value).unwrap();
        assert_eq!(structure.root, Some(json!({"kept": null})));
    }

    #[test]
    fn three_node_cycle_keeps_identity() {
        let obj3 = Value::Object(Shared::new(Object::new()));
        let obj2 = Value::object([("obj3", obj3.clone())]);
        let obj1 = Value::object([("obj2", obj2)]);
        if let Value::Object(fields) = &obj3 {
            fields.lock().insert("obj1".into(), obj1.clone());
        }

        let structure = serialize(&obj1).unwrap();
        assert_eq!(structure.root, Some(json!(["$0"])));
        let refs = structure.refs.as_ref().unwrap();
        assert_eq!(refs["$0"].root, json!({"obj2": ["$1"]}));
        assert_eq!(refs["$1"].root, json!({"obj3": ["$2"]}));
        assert_eq!(refs["$2"].root, json!({"obj1": ["$0"]}));

        let result = deserialize(&structure).unwrap().data;
        let back = result
            .get("obj2")
            .and_then(|v| v.get("obj3"))
            .and_then(|v| v.get("obj1"))
            .unwrap();
        assert!(back.ptr_eq(&result));
    }

    #[test]
    fn self_referential_array() {
        let list = Value::array([Value::from("x")]);
        if let Value::Array(items) = &list {
            items.lock().push(list.clone());
        }
        let structure = serialize(&list).unwrap();
        assert_eq!(structure.refs.as_ref().unwrap()["$0"].root, json!(["x", ["$0"]]));

        let result = deserialize(&structure).unwrap().data;
        assert_eq!(result.at(0), Some(Value::from("x")));
        assert!(result.at(1).unwrap().ptr_eq(&result));
    }

    #[test]
    fn shared_node_is_written_once() {
        let shared = Value::object([("n", Value::from(1))]);
        let value = Value::array([shared.clone(), shared]);
        let structure = serialize(&value).unwrap();
        let refs = structure.refs.as_ref().unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs["$0"].root, json!([["$1"], ["$1"]]));

        let result = deserialize(&structure).unwrap().data;
        assert!(result.at(0).unwrap().ptr_eq(&result.at(1).unwrap()));
    }

    #[test]
    fn zeroed_buffer_in_object() {
        let buffer = Value::from(Buffer::array_buffer(vec![0; 64]));
        let value = Value::object([("buffer", buffer)]);

        let structure = serialize(&value).unwrap();
        let refs = structure.refs.as_ref().unwrap();
        assert_eq!(refs["$0"].root, json!({"buffer": ["$1"]}));
        assert_eq!(refs["$1"].kind, Some(SpecialKind::ArrayBuffer));
        assert_eq!(refs["$1"].root, json!(BASE64.encode([0u8; 64])));

        let result = roundtrip(&value);
        match result.get("buffer") {
            Some(Value::Buffer(b)) => {
                let b = b.lock();
                assert_eq!(b.kind(), BufferKind::ArrayBuffer);
                assert_eq!(b.bytes(), &[0u8; 64][..]);
            }
            other => panic!("expected buffer, got {:?}", other),
        }
    }

    #[test]
    fn typed_arrays_keep_their_kind() {
        let value = Value::array([
            Value::from(Buffer::from_elements(&[1i8, -1])),
            Value::from(Buffer::from_elements(&[300u16])),
            Value::from(Buffer::from_elements(&[-5i32, 7])),
        ]);
        let result = roundtrip(&value);
        assert_eq!(result, value);
        if let Some(Value::Buffer(b)) = result.at(2) {
            assert_eq!(b.lock().elements::<i32>(), Some(vec![-5, 7]));
        } else {
            panic!("expected Int32Array");
        }
    }

    #[test]
    fn misaligned_typed_array_is_corrupt() {
        let text = r#"{"root":["$0"],"refs":{"$0":{"root":"AAAA","type":"Uint32Array"}}}"#;
        let structure = Structure::from_json(text).unwrap();
        assert!(matches!(
            deserialize(&structure),
            Err(Error::CorruptStructure(_))
        ));
    }

    #[test]
    fn bigint_structure() {
        let n: BigInt = "989898434684646".parse().unwrap();
        let structure = serialize(&Value::BigInt(n.clone())).unwrap();
        assert_eq!(
            serde_json::to_value(&structure).unwrap(),
            json!({"root": ["$0"], "refs": {"$0": {"root": "989898434684646", "type": "BigInt"}}})
        );
        assert_eq!(roundtrip(&Value::BigInt(n.clone())), Value::BigInt(n));
    }

    #[test]
    fn huge_bigint_roundtrip() {
        let n: BigInt = "-123456789012345678901234567890".parse().unwrap();
        assert_eq!(roundtrip(&Value::BigInt(n.clone())), Value::BigInt(n));
    }

    #[test]
    fn map_with_composite_key() {
        let bob = Value::object([("name", Value::from("bob"))]);
        let value = Value::map([
            (Value::from("key"), Value::from("value")),
            (bob, Value::from(99)),
        ]);

        let structure = serialize(&value).unwrap();
        let refs = structure.refs.as_ref().unwrap();
        assert_eq!(refs["$0"].kind, Some(SpecialKind::Map));
        assert_eq!(refs["$0"].root, json!([["$1"], ["$2"]]));
        assert_eq!(refs["$1"].root, json!(["key", "value"]));
        assert_eq!(refs["$2"].root, json!([["$3"], 99]));
        assert_eq!(refs["$3"].root, json!({"name": "bob"}));

        let result = roundtrip(&value);
        assert_eq!(result, value);
        if let Value::Map(entries) = &result {
            let entries = entries.lock();
            assert_eq!(entries[1].0.get("name"), Some(Value::from("bob")));
            assert_eq!(entries[1].1, Value::from(99));
        } else {
            panic!("expected map");
        }
    }

    #[test]
    fn set_roundtrip() {
        let value = Value::set([Value::from(1), Value::from("two"), Value::array([])]);
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn date_uses_iso_format() {
        let at = Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap();
        let structure = serialize(&Value::date(at)).unwrap();
        assert_eq!(
            structure.refs.as_ref().unwrap()["$0"].root,
            json!("2020-01-02T03:04:05.000Z")
        );
        assert_eq!(roundtrip(&Value::date(at)), Value::date(at));
    }

    #[test]
    fn regexp_roundtrip() {
        let value = Value::from(RegExp::new("^a+$", "gi"));
        let structure = serialize(&value).unwrap();
        assert_eq!(
            structure.refs.as_ref().unwrap()["$0"].root,
            json!({"source": "^a+$", "flags": "gi"})
        );
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn errors_keep_builtin_kinds_only() {
        let value = Value::from(ErrorValue::new(ErrorKind::RangeError, "out of range").with_stack("at f"));
        let result = roundtrip(&value);
        match &result {
            Value::Error(e) => {
                assert_eq!(e.kind(), ErrorKind::RangeError);
                assert_eq!(e.message.as_deref(), Some("out of range"));
                assert_eq!(e.stack.as_deref(), Some("at f"));
            }
            other => panic!("expected error, got {:?}", other),
        }

        let custom = Value::from(ErrorValue {
            name: "MyError".into(),
            message: Some("boom".into()),
            stack: None,
        });
        match roundtrip(&custom) {
            Value::Error(e) => assert_eq!(e.name, "Error"),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn untransferred_port_fails() {
        let channel = ChannelFactory::new(Side::Host).channel();
        let value = Value::object([("port", Value::from(channel.port2))]);
        assert!(matches!(serialize(&value), Err(Error::TransferRequired(_))));
    }

    #[test]
    fn port_materializes_a_fresh_channel() {
        let channel = MessageChannel::with_id(ChannelId::Number(17));
        channel.port2.transfer(Arc::new(|_, _| Ok(()))).unwrap();
        let value = Value::object([("port", Value::from(channel.port2.clone()))]);

        let structure = serialize(&value).unwrap();
        assert_eq!(
            structure.refs.as_ref().unwrap()["$1"].root,
            json!({"channel": 17})
        );

        let decoded = deserialize(&structure).unwrap();
        let port = decoded.data.get("port").unwrap();
        let port = port.as_port().unwrap();
        assert_eq!(port.channel_id(), &ChannelId::Number(17));
        assert!(!port.ptr_eq(&channel.port2));
        assert!(!port.is_transferred());

        assert_eq!(decoded.transferred.len(), 1);
        let other = decoded.transferred[0].as_port().unwrap();
        assert_eq!(other.channel_id(), &ChannelId::Number(17));
    }

    #[test]
    fn missing_reference_is_corrupt() {
        let text = r#"{"root":["$0"],"refs":{"$0":{"root":{"a":["$9"]}}}}"#;
        let structure = Structure::from_json(text).unwrap();
        match deserialize(&structure) {
            Err(Error::CorruptStructure(message)) => assert!(message.contains("$9")),
            other => panic!("expected corrupt structure, got {:?}", other.map(|d| d.data)),
        }
    }

    #[test]
    fn refs_without_marker_root_is_corrupt() {
        let structure = Structure::from_json(r#"{"root":5,"refs":{}}"#).unwrap();
        assert!(matches!(
            deserialize(&structure),
            Err(Error::CorruptStructure(_))
        ));
    }

    fn ref_chain(len: usize) -> Structure {
        let refs = (0..len)
            .map(|i| {
                let root = if i + 1 < len {
                    json!([[ref_id(i + 1)]])
                } else {
                    json!([])
                };
                (ref_id(i), Ref::plain(root))
            })
            .collect();
        Structure {
            root: Some(json!([ref_id(0)])),
            refs: Some(refs),
            channel: None,
        }
    }

    fn nested_arrays(depth: usize) -> Value {
        let mut value = Value::array(Vec::<Value>::new());
        for _ in 1..depth {
            value = Value::array([value]);
        }
        value
    }

    #[test]
    fn long_ref_chain_is_rejected() {
        match deserialize(&ref_chain(100_000)) {
            Err(Error::CorruptStructure(message)) => assert!(message.contains("nested deeper")),
            other => panic!("expected corrupt structure, got {:?}", other.map(|d| d.data)),
        }
    }

    #[test]
    fn ref_chain_at_the_limit_decodes() {
        let mut value = deserialize(&ref_chain(MAX_DEPTH)).unwrap().data;
        let mut depth = 1;
        while let Some(inner) = value.at(0) {
            value = inner;
            depth += 1;
        }
        assert_eq!(depth, MAX_DEPTH);
    }

    #[test]
    fn deep_graph_is_rejected_on_serialize() {
        assert!(matches!(
            serialize(&nested_arrays(MAX_DEPTH + 1)),
            Err(Error::NestingTooDeep(MAX_DEPTH))
        ));

        let deep_map = Value::map([(nested_arrays(MAX_DEPTH - 1), Value::Null)]);
        assert!(matches!(
            serialize(&deep_map),
            Err(Error::NestingTooDeep(_))
        ));
    }

    #[test]
    fn deepest_plain_graph_parses_back() {
        let value = nested_arrays(MAX_DEPTH);
        assert_eq!(roundtrip(&value), value);
    }
}
