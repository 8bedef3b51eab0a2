//! Recursive composition of shared maps: a mapping-valued entry becomes its
//! own child map instead of being flattened into the parent's value.
//! Scoped to the dynamically-typed [`Value`] so the core `SharedMap<K, V>`
//! stays a plain generic map for the common, non-recursive case — nesting
//! only makes sense where a value can itself *be* a mapping, which `Value`
//! models explicitly via `Value::Map`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::SharedMapConfig;
use crate::error::Result;
use crate::map::SharedMap;
use crate::segment::Segment;
use crate::serializer::{ChildRef, Value};

/// A `SharedMap<String, Value>` that, when constructed with `recurse=true`,
/// wraps mapping-valued entries as child maps on `set` and transparently
/// reconstitutes them on `get`/`items`.
pub struct NestedMap {
    inner: SharedMap<String, Value>,
    registry: Option<SharedMap<String, ()>>,
}

static CHILD_COUNTER: AtomicU32 = AtomicU32::new(0);

impl NestedMap {
    pub fn new(config: SharedMapConfig) -> Result<Self> {
        let recurse = config.recurse;
        let recurse_register_override = config.recurse_register.clone();
        let shared_lock = config.shared_lock;

        let inner = SharedMap::new(config)?;

        let registry = if recurse {
            let registry_name =
                recurse_register_override.unwrap_or_else(|| format!("{}_register", inner.name()));
            Some(SharedMap::new(
                SharedMapConfig::new()
                    .name(registry_name)
                    .recurse(false)
                    .auto_unlink(false)
                    .shared_lock(shared_lock),
            )?)
        } else {
            None
        };

        Ok(NestedMap { inner, registry })
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) -> Result<()> {
        let key = key.into();
        if self.inner.recurse_enabled() {
            if let Value::Map(fields) = value {
                let child_ref = self.wrap_as_child(&fields)?;
                return self.inner.set(key, Value::Child(child_ref));
            }
        }
        self.inner.set(key, value)
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.inner.get(&key.to_string())? {
            Some(Value::Child(child_ref)) => Ok(Some(self.unwrap_child(&child_ref)?)),
            other => Ok(other),
        }
    }

    pub fn items(&self) -> Result<Vec<(String, Value)>> {
        let mut out = Vec::new();
        for (key, value) in self.inner.items()? {
            let resolved = match value {
                Value::Child(child_ref) => self.unwrap_child(&child_ref)?,
                other => other,
            };
            out.push((key, resolved));
        }
        Ok(out)
    }

    fn wrap_as_child(&self, fields: &BTreeMap<String, Value>) -> Result<ChildRef> {
        let suffix = CHILD_COUNTER.fetch_add(1, Ordering::Relaxed);
        let child_name = format!("{}_{}_{}", self.inner.name(), std::process::id(), suffix);

        let child = NestedMap::new(
            SharedMapConfig::new()
                .name(child_name.clone())
                .recurse(true)
                .shared_lock(self.inner.status().shared_lock)
                .buffer_size(self.inner.buffer_size())
                .auto_unlink(false),
        )?;
        for (k, v) in fields {
            child.set(k.clone(), v.clone())?;
        }

        if let Some(registry) = &self.registry {
            registry.set(child_name.clone(), ())?;
        }

        Ok(ChildRef { segment_name: child_name })
    }

    fn unwrap_child(&self, child_ref: &ChildRef) -> Result<Value> {
        let child = NestedMap::new(
            SharedMapConfig::new()
                .name(child_ref.segment_name.clone())
                .recurse(true)
                .shared_lock(self.inner.status().shared_lock)
                .auto_unlink(false),
        )?;

        let mut map = BTreeMap::new();
        for (key, value) in child.items()? {
            map.insert(key, value);
        }
        Ok(Value::Map(map))
    }

    /// Teardown: unlink every registered child's segments, then the
    /// registry, then this map itself.
    pub fn unlink(self) -> Result<()> {
        if let Some(registry) = &self.registry {
            for (child_name, _) in registry.items()? {
                let _ = Segment::unlink_by_name(&child_name, true);
                let _ = Segment::unlink_by_name(&format!("{child_name}_memory"), true);
                let _ = Segment::unlink_by_name(&format!("{child_name}_full"), true);
                let _ = Segment::unlink_by_name(&format!("{child_name}_register"), true);
            }
        }
        self.inner.unlink()?;
        if let Some(registry) = self.registry {
            registry.unlink()?;
        }
        Ok(())
    }
}
