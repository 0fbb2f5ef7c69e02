use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::core::container::{Container, ContainerInner};
use crate::core::engine::Engine;
use crate::error::{Error, ErrorKind, Result};

/// Access flags on a registered field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldFlags(u32);

impl FieldFlags {
    pub const NONE: FieldFlags = FieldFlags(0);
    /// Writes are rejected with `invalid_property`.
    pub const READ_ONLY: FieldFlags = FieldFlags(1);
    /// Omitted from enumeration, readable by name.
    pub const HIDDEN: FieldFlags = FieldFlags(2);
    /// Serialized on every commit of the container.
    pub const PERSISTENT: FieldFlags = FieldFlags(4);
    /// Survives the transition to Dead; cleared on Stopped.
    pub const POSTMORTEM: FieldFlags = FieldFlags(8);
    /// Never persisted, recomputed on read.
    pub const RUNTIME: FieldFlags = FieldFlags(16);
    /// Reads return `not_supported`.
    pub const UNSUPPORTED: FieldFlags = FieldFlags(32);

    pub fn has(self, other: FieldFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for FieldFlags {
    type Output = FieldFlags;
    fn bitor(self, rhs: FieldFlags) -> FieldFlags {
        FieldFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Str,
    Bool,
    Int,
    Uint,
    UintMap,
    Text,
}

/// A field value. `UintMap` is keyed by interface or device name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Uint(u64),
    Int(i64),
    UintMap(BTreeMap<String, u64>),
    Str(String),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Str(_) => ValueKind::Str,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Uint(_) => ValueKind::Uint,
            Value::UintMap(_) => ValueKind::UintMap,
        }
    }

    /// RPC representation; every field crosses the wire as a string.
    pub fn display(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Uint(u) => u.to_string(),
            Value::UintMap(m) => {
                let mut out = String::new();
                for (k, v) in m {
                    if !out.is_empty() {
                        out.push_str("; ");
                    }
                    out.push_str(&format!("{k}: {v}"));
                }
                out
            }
        }
    }

    /// Parse the wire string form for a field of the given kind.
    pub fn parse(kind: ValueKind, s: &str) -> Result<Value> {
        let invalid = |what: &str| Error::new(ErrorKind::InvalidValue, what.to_string());
        Ok(match kind {
            ValueKind::Str | ValueKind::Text => Value::Str(s.to_string()),
            ValueKind::Bool => match s {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => return Err(invalid(&format!("expected true/false, got '{s}'"))),
            },
            ValueKind::Int => Value::Int(
                s.trim()
                    .parse()
                    .map_err(|_| invalid(&format!("bad integer '{s}'")))?,
            ),
            ValueKind::Uint => Value::Uint(
                s.trim()
                    .parse()
                    .map_err(|_| invalid(&format!("bad unsigned integer '{s}'")))?,
            ),
            ValueKind::UintMap => {
                let mut map = BTreeMap::new();
                for part in s.split(';') {
                    let part = part.trim();
                    if part.is_empty() {
                        continue;
                    }
                    let (key, val) = part
                        .split_once(':')
                        .ok_or_else(|| invalid(&format!("bad map entry '{part}'")))?;
                    let val: u64 = val
                        .trim()
                        .parse()
                        .map_err(|_| invalid(&format!("bad map value in '{part}'")))?;
                    map.insert(key.trim().to_string(), val);
                }
                Value::UintMap(map)
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldClass {
    /// Writable configuration.
    Property,
    /// Read-only observation.
    Data,
}

pub type DefaultFn = fn(&Engine, &Container, &ContainerInner) -> Result<Value>;
pub type IndexedFn = fn(&Engine, &Container, &ContainerInner, &str) -> Result<Value>;
pub type ValidateFn = fn(&Value) -> Result<()>;

/// Descriptor of one per-container field. The registry is a flat table of
/// these; there is no per-field type hierarchy.
pub struct FieldDesc {
    pub key: &'static str,
    pub kind: ValueKind,
    pub class: FieldClass,
    pub flags: FieldFlags,
    pub desc: &'static str,
    pub default: Option<DefaultFn>,
    /// Fixed default for fields without a producer.
    pub default_value: Option<Value>,
    pub validate: Option<ValidateFn>,
    pub indexed: Option<IndexedFn>,
}

impl FieldDesc {
    pub fn property(key: &'static str, kind: ValueKind, desc: &'static str) -> Self {
        Self {
            key,
            kind,
            class: FieldClass::Property,
            flags: FieldFlags::PERSISTENT,
            desc,
            default: None,
            default_value: None,
            validate: None,
            indexed: None,
        }
    }

    pub fn data(key: &'static str, kind: ValueKind, desc: &'static str) -> Self {
        Self {
            key,
            kind,
            class: FieldClass::Data,
            flags: FieldFlags::READ_ONLY,
            desc,
            default: None,
            default_value: None,
            validate: None,
            indexed: None,
        }
    }

    pub fn with_flags(mut self, flags: FieldFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_default(mut self, f: DefaultFn) -> Self {
        self.default = Some(f);
        self
    }

    pub fn with_default_value(mut self, v: Value) -> Self {
        self.default_value = Some(v);
        self
    }

    /// The zero of this field's kind, used when a runtime read fails.
    pub fn zero_value(&self) -> Value {
        match self.kind {
            ValueKind::Str | ValueKind::Text => Value::Str(String::new()),
            ValueKind::Bool => Value::Bool(false),
            ValueKind::Int => Value::Int(0),
            ValueKind::Uint => Value::Uint(0),
            ValueKind::UintMap => Value::UintMap(Default::default()),
        }
    }

    pub fn with_validate(mut self, f: ValidateFn) -> Self {
        self.validate = Some(f);
        self
    }

    pub fn with_indexed(mut self, f: IndexedFn) -> Self {
        self.indexed = Some(f);
        self
    }
}

/// Process-wide field table. Built once at daemon startup and read-only
/// afterwards; tests build their own instances.
pub struct Registry {
    fields: Vec<FieldDesc>,
    index: HashMap<&'static str, usize>,
}

impl Registry {
    pub fn empty() -> Self {
        Self {
            fields: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn register(&mut self, field: FieldDesc) {
        let prev = self.index.insert(field.key, self.fields.len());
        assert!(prev.is_none(), "duplicate field {}", field.key);
        self.fields.push(field);
    }

    pub fn get(&self, key: &str) -> Option<&FieldDesc> {
        self.index.get(key).map(|i| &self.fields[*i])
    }

    pub fn lookup(&self, key: &str) -> Result<&FieldDesc> {
        self.get(key)
            .ok_or_else(|| Error::new(ErrorKind::InvalidProperty, format!("unknown field '{key}'")))
    }

    /// Enumerate visible fields of one class, in registration order.
    pub fn list(&self, class: FieldClass) -> impl Iterator<Item = &FieldDesc> {
        self.fields
            .iter()
            .filter(move |f| f.class == class && !f.flags.has(FieldFlags::HIDDEN))
    }

    pub fn all(&self) -> impl Iterator<Item = &FieldDesc> {
        self.fields.iter()
    }

    /// Flip a field to unsupported, used by startup probes.
    pub fn mark_unsupported(&mut self, key: &str) {
        if let Some(i) = self.index.get(key) {
            let f = &mut self.fields[*i];
            f.flags = f.flags | FieldFlags::UNSUPPORTED;
        }
    }
}

/// Sparse per-container value storage; absent keys fall through to the
/// field's default producer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValueMap {
    values: HashMap<String, Value>,
}

impl ValueMap {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    pub fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    /// Drop values whose field carries any of `flags` (e.g. postmortem data
    /// when a container returns to Stopped).
    pub fn drop_flagged(&mut self, registry: &Registry, flags: FieldFlags) {
        self.values.retain(|key, _| {
            registry
                .get(key)
                .map(|f| !f.flags.has(flags))
                .unwrap_or(false)
        });
    }

    /// String snapshot of every stored value whose field carries `flags`.
    pub fn collect_flagged(&self, registry: &Registry, flags: FieldFlags) -> BTreeMap<String, String> {
        self.values
            .iter()
            .filter(|(key, _)| {
                registry
                    .get(key)
                    .map(|f| f.flags.has(flags))
                    .unwrap_or(false)
            })
            .map(|(key, value)| (key.clone(), value.display()))
            .collect()
    }
}
