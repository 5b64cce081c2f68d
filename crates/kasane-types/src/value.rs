//! Typed attribute values.
//!
//! Attributes attached to files are drawn from a closed set of encodings —
//! a tagged union rather than open dynamic dispatch. Two variants deserve
//! a note:
//!
//! - [`AttrValue::Void`] is a tombstone: "this attribute is deliberately
//!   cleared here", distinct from the attribute never having been set. The
//!   `level` counts how many times the tombstone has been re-wrapped when
//!   one layered filesystem stores values inside another; see [`voidify`]
//!   and [`devoidify`].
//! - [`AttrValue::Factory`] replaces the original design's reflective
//!   method/constructor references with a key into an explicitly
//!   registered [`FactoryRegistry`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A typed attribute value. The set is closed; anything else must be
/// encoded as a [`AttrValue::Blob`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttrValue {
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Bool(bool),
    Char(char),
    Str(String),
    /// A URL kept as text; resolution is the caller's concern.
    Url(String),
    /// A localization bundle key.
    BundleKey(String),
    /// Opaque serialized payload for values outside the closed set.
    Blob(Vec<u8>),
    /// Key into the process-wide [`FactoryRegistry`].
    Factory(String),
    /// Tombstone: attribute deliberately cleared at this layer.
    Void { level: u32 },
}

impl AttrValue {
    /// Numeric view, for weight evaluation. Non-numeric variants are `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Byte(v) => Some(*v as f64),
            AttrValue::Short(v) => Some(*v as f64),
            AttrValue::Int(v) => Some(*v as f64),
            AttrValue::Long(v) => Some(*v as f64),
            AttrValue::Float(v) => Some(*v as f64),
            AttrValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// True for the [`AttrValue::Void`] tombstone.
    pub fn is_void(&self) -> bool {
        matches!(self, AttrValue::Void { .. })
    }

    /// String view for the text-bearing variants.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) | AttrValue::Url(s) | AttrValue::BundleKey(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Byte(v) => write!(f, "{v}"),
            AttrValue::Short(v) => write!(f, "{v}"),
            AttrValue::Int(v) => write!(f, "{v}"),
            AttrValue::Long(v) => write!(f, "{v}"),
            AttrValue::Float(v) => write!(f, "{v}"),
            AttrValue::Double(v) => write!(f, "{v}"),
            AttrValue::Bool(v) => write!(f, "{v}"),
            AttrValue::Char(v) => write!(f, "{v}"),
            AttrValue::Str(s) => write!(f, "{s}"),
            AttrValue::Url(s) => write!(f, "{s}"),
            AttrValue::BundleKey(s) => write!(f, "bundle:{s}"),
            AttrValue::Blob(b) => write!(f, "<blob {} bytes>", b.len()),
            AttrValue::Factory(k) => write!(f, "factory:{k}"),
            AttrValue::Void { level } => write!(f, "<void#{level}>"),
        }
    }
}

/// Add one void-wrapping to a value being stored.
///
/// `None` becomes a level-0 tombstone; an existing tombstone gains a
/// level. Real values pass through unchanged.
pub fn voidify(value: Option<AttrValue>) -> AttrValue {
    match value {
        None => AttrValue::Void { level: 0 },
        Some(AttrValue::Void { level }) => AttrValue::Void { level: level + 1 },
        Some(v) => v,
    }
}

/// Strip one void-wrapping from a value being read.
///
/// A level-0 tombstone reads as `None`; deeper tombstones lose a level.
/// Real values pass through unchanged.
pub fn devoidify(value: AttrValue) -> Option<AttrValue> {
    match value {
        AttrValue::Void { level: 0 } => None,
        AttrValue::Void { level } => Some(AttrValue::Void { level: level - 1 }),
        v => Some(v),
    }
}

/// Error reconstructing a stored attribute value.
#[derive(Debug, Error)]
pub enum ValueDecodeError {
    /// A `Factory` value named a key nothing has registered.
    #[error("no factory registered for key {0:?}")]
    UnknownFactory(String),

    /// A `Blob` payload could not be decoded by the caller's codec.
    #[error("undecodable blob payload ({0} bytes)")]
    BadBlob(usize),
}

type FactoryFn = dyn Fn() -> AttrValue + Send + Sync;

/// Registry of value factories.
///
/// The original system let attributes name arbitrary methods and
/// constructors to invoke reflectively. Here construction is opt-in:
/// factories are registered under a key at init time, and a
/// [`AttrValue::Factory`] attribute resolves through this table.
#[derive(Default)]
pub struct FactoryRegistry {
    factories: HashMap<String, Arc<FactoryFn>>,
}

impl FactoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `key`, replacing any previous one.
    pub fn register<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn() -> AttrValue + Send + Sync + 'static,
    {
        self.factories.insert(key.into(), Arc::new(factory));
    }

    /// Instantiate the value for `key`.
    pub fn instantiate(&self, key: &str) -> Result<AttrValue, ValueDecodeError> {
        match self.factories.get(key) {
            Some(f) => Ok(f()),
            None => Err(ValueDecodeError::UnknownFactory(key.to_string())),
        }
    }

    /// True if `key` has a registered factory.
    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }
}

impl fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryRegistry")
            .field("keys", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_void_round_trip() {
        // Clearing stores a level-0 tombstone, which reads back as None.
        let stored = voidify(None);
        assert_eq!(stored, AttrValue::Void { level: 0 });
        assert_eq!(devoidify(stored), None);
    }

    #[test]
    fn test_void_nesting() {
        // A layered fs storing another's tombstone bumps the level; each
        // read strips exactly one.
        let inner = voidify(None);
        let outer = voidify(Some(inner));
        assert_eq!(outer, AttrValue::Void { level: 1 });

        let once = devoidify(outer).unwrap();
        assert_eq!(once, AttrValue::Void { level: 0 });
        assert_eq!(devoidify(once), None);
    }

    #[test]
    fn test_voidify_passes_real_values() {
        let v = voidify(Some(AttrValue::Int(7)));
        assert_eq!(v, AttrValue::Int(7));
        assert_eq!(devoidify(v), Some(AttrValue::Int(7)));
    }

    #[test]
    fn test_as_f64() {
        assert_eq!(AttrValue::Int(10).as_f64(), Some(10.0));
        assert_eq!(AttrValue::Double(2.5).as_f64(), Some(2.5));
        assert_eq!(AttrValue::Str("x".into()).as_f64(), None);
    }

    #[test]
    fn test_factory_registry() {
        let mut reg = FactoryRegistry::new();
        reg.register("answer", || AttrValue::Int(42));

        assert_eq!(reg.instantiate("answer").unwrap(), AttrValue::Int(42));
        assert!(matches!(
            reg.instantiate("missing"),
            Err(ValueDecodeError::UnknownFactory(_))
        ));
    }

    #[test]
    fn test_serde_tagged_form() {
        let v = AttrValue::Str("red".into());
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#"{"str":"red"}"#);
        let back: AttrValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);

        let void = AttrValue::Void { level: 1 };
        let json = serde_json::to_string(&void).unwrap();
        assert_eq!(json, r#"{"void":{"level":1}}"#);
        assert_eq!(serde_json::from_str::<AttrValue>(&json).unwrap(), void);
    }
}
