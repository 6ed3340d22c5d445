//! Wire documents exchanged between the two ends of a connection.
//!
//! A [`Structure`] is the JSON body of exactly one frame. When the value it
//! carries contains a cycle or a special kind, the graph is flattened into a
//! `refs` table and `root` becomes a one-element array naming the entry
//! point:
//!
//! ```text
//! {"root": ["$0"], "refs": {"$0": {"root": "989898434684646", "type": "BigInt"}}}
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Identifies one virtual port pair across the connection.
///
/// The host allocates numbers and the guest allocates strings, so ids minted
/// on either end never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelId {
    Number(u64),
    String(String),
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::Number(n) => write!(f, "{}", n),
            ChannelId::String(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<u64> for ChannelId {
    fn from(n: u64) -> Self {
        ChannelId::Number(n)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        ChannelId::String(s.to_string())
    }
}

/// The closed set of tagged value kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecialKind {
    ArrayBuffer,
    Uint8Array,
    Uint16Array,
    Uint32Array,
    Int8Array,
    Int16Array,
    Int32Array,
    BigInt,
    Date,
    RegExp,
    Map,
    Set,
    Error,
    #[serde(rename = "MessagePort")]
    Port,
}

/// One entry of a structure's reference table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ref {
    /// Plain container (fields may be `[RefId]` markers) or kind payload.
    pub root: serde_json::Value,

    /// Present for special kinds only.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<SpecialKind>,
}

impl Ref {
    pub fn plain(root: serde_json::Value) -> Self {
        Self { root, kind: None }
    }

    pub fn special(kind: SpecialKind, root: serde_json::Value) -> Self {
        Self {
            root,
            kind: Some(kind),
        }
    }
}

/// The wire document for one message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    /// `None` encodes an undefined root, which JSON can only express by
    /// omitting the field.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub root: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refs: Option<BTreeMap<String, Ref>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelId>,
}

impl Structure {
    /// Parse a structure from frame text.
    pub fn from_json(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Render this structure as single-line frame text.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// A present `null` must stay `Some(Null)` instead of collapsing to `None`.
fn present<'de, D>(deserializer: D) -> std::result::Result<Option<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

/// Format the ref id for arena slot `index`.
pub fn ref_id(index: usize) -> String {
    format!("${}", index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn channel_ids_keep_their_json_type() {
        assert_eq!(serde_json::to_value(ChannelId::Number(3)).unwrap(), json!(3));
        assert_eq!(
            serde_json::to_value(ChannelId::from("a1")).unwrap(),
            json!("a1")
        );
        let n: ChannelId = serde_json::from_value(json!(12)).unwrap();
        let s: ChannelId = serde_json::from_value(json!("12")).unwrap();
        assert_ne!(n, s);
    }

    #[test]
    fn port_kind_uses_message_port_name() {
        let r = Ref::special(SpecialKind::Port, json!({"channel": 1}));
        let text = serde_json::to_string(&r).unwrap();
        assert!(text.contains("\"type\":\"MessagePort\""));
    }

    #[test]
    fn null_root_differs_from_missing_root() {
        let null = Structure::from_json(r#"{"root":null}"#).unwrap();
        assert_eq!(null.root, Some(serde_json::Value::Null));

        let missing = Structure::from_json("{}").unwrap();
        assert_eq!(missing.root, None);
        assert_eq!(missing.to_json().unwrap(), "{}");
    }

    #[test]
    fn plain_ref_omits_type() {
        let r = Ref::plain(json!({"a": 1}));
        assert_eq!(serde_json::to_string(&r).unwrap(), r#"{"root":{"a":1}}"#);
    }
}
