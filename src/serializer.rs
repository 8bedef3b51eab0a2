//! Pluggable serializer: an external collaborator that turns values into
//! self-delimiting bytes and back. Also hosts the internal record framing
//! and the recurse-mode child reference tag.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Error, Result};

/// `encode`/`decode` over a single top-level value. Implementations must be
/// deterministic; `decode(encode(v)) == v` for every `v` in the domain.
pub trait Serializer<T> {
    fn encode(&self, value: &T) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

/// Default binding: `bincode` over `serde`, a binary encoding that is
/// self-delimiting for a bare top-level value, unlike a text-based format.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeSerializer;

impl<T> Serializer<T> for BincodeSerializer
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// One update-stream payload: `(op, key, value)`. `value` is absent for
/// deletes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Record<K, V> {
    pub op: u8,
    pub key: K,
    pub value: Option<V>,
}

pub(crate) const OP_DELETE: u8 = 0;
pub(crate) const OP_SET: u8 = 1;

/// Recurse-mode wrapper: rather than asking the general serializer to
/// understand a live child map handle, a mapping-valued entry is stored as
/// a tagged reference to the child's control-segment name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRef {
    pub segment_name: String,
}

/// A small dynamically-typed value, used by [`crate::recurse::NestedMap`] so
/// that mapping-valued entries have somewhere to nest without requiring every
/// `SharedMap<K, V>` instantiation to carry recurse support.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(u64), // bit pattern, so `Value` can implement `Eq`-friendly comparisons via `PartialEq`
    Str(String),
    Bytes(Vec<u8>),
    Map(std::collections::BTreeMap<String, Value>),
    Child(ChildRef),
}

impl Value {
    pub fn float(v: f64) -> Value {
        Value::Float(v.to_bits())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(bits) => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&std::collections::BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}
