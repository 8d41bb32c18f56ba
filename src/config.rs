//! Typed configuration lookup.
//!
//! Dotted lower-case keys map to typed, reloadable values. Modules register
//! their entries once with [`lookup`] and keep the returned handle in a
//! static; operators reload values from a JSON document with [`load_json`].
//! Change listeners are invoked with the old and the new value, in that order.
//!
//! ```no_run
//! let timeout = strand::config::lookup("tcp.connect.timeout", 5000u64, "tcp connect timeout");
//! timeout.add_listener(|old, new| log::info!("timeout changed {} -> {}", old, new));
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::error;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Bound for values a [`ConfigVar`] can hold.
pub trait ConfigValue:
    Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> ConfigValue for T where
    T: Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

type Listener<T> = Box<dyn Fn(&T, &T) + Send + Sync>;

/// A single named configuration entry.
pub struct ConfigVar<T> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: Mutex<HashMap<u64, Listener<T>>>,
    next_listener: AtomicU64,
}

impl<T: ConfigValue> ConfigVar<T> {
    fn new(name: &str, default: T, description: &str) -> Self {
        ConfigVar {
            name: name.into(),
            description: description.into(),
            value: RwLock::new(default),
            listeners: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(0),
        }
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline(always)]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Current value, by clone.
    #[inline]
    pub fn value(&self) -> T {
        self.value.read().expect("config lock poisoned").clone()
    }

    /// Replaces the value; listeners run only on an actual change, with
    /// `(old, new)`.
    pub fn set(&self, new: T) {
        let old = {
            let mut value = self.value.write().expect("config lock poisoned");
            if *value == new {
                return;
            }
            std::mem::replace(&mut *value, new.clone())
        };
        let listeners = self.listeners.lock().expect("config lock poisoned");
        for listener in listeners.values() {
            listener(&old, &new);
        }
    }

    /// Registers a change listener; the returned key can be passed to
    /// [`del_listener`](Self::del_listener).
    pub fn add_listener<F>(&self, listener: F) -> u64
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let key = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .expect("config lock poisoned")
            .insert(key, Box::new(listener));
        key
    }

    pub fn del_listener(&self, key: u64) {
        self.listeners
            .lock()
            .expect("config lock poisoned")
            .remove(&key);
    }
}

trait AnyVar: Send + Sync {
    fn entry_name(&self) -> &str;
    fn set_json(&self, value: &serde_json::Value) -> crate::Result<()>;
    fn to_json(&self) -> serde_json::Value;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: ConfigValue> AnyVar for ConfigVar<T> {
    fn entry_name(&self) -> &str {
        &self.name
    }

    fn set_json(&self, value: &serde_json::Value) -> crate::Result<()> {
        let new: T = serde_json::from_value(value.clone())?;
        self.set(new);
        Ok(())
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.value()).unwrap_or(serde_json::Value::Null)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

static REGISTRY: Lazy<RwLock<HashMap<String, Arc<dyn AnyVar>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'_')
}

/// Returns the entry named `name`, registering it with `default` if it does
/// not exist yet.
///
/// Panics on an invalid key or when the key is already registered with a
/// different value type; both are programming errors.
pub fn lookup<T: ConfigValue>(name: &str, default: T, description: &str) -> Arc<ConfigVar<T>> {
    assert!(valid_name(name), "invalid config key: {:?}", name);
    if let Some(var) = get::<T>(name) {
        return var;
    }
    let mut registry = REGISTRY.write().expect("config lock poisoned");
    // Racing registration: somebody may have inserted between the lookup
    // above and taking the write lock.
    if let Some(existing) = registry.get(name) {
        return existing
            .clone()
            .into_any()
            .downcast::<ConfigVar<T>>()
            .unwrap_or_else(|_| panic!("config key {:?} registered with another type", name));
    }
    let var = Arc::new(ConfigVar::new(name, default, description));
    registry.insert(name.into(), var.clone() as Arc<dyn AnyVar>);
    var
}

/// Returns an already registered entry, `None` if the name is unknown.
/// Panics if the entry exists with a different type.
pub fn get<T: ConfigValue>(name: &str) -> Option<Arc<ConfigVar<T>>> {
    let registry = REGISTRY.read().expect("config lock poisoned");
    let var = registry.get(name)?.clone();
    Some(
        var.into_any()
            .downcast::<ConfigVar<T>>()
            .unwrap_or_else(|_| panic!("config key {:?} registered with another type", name)),
    )
}

/// Applies a JSON document to the registry. Nested objects are flattened with
/// `.` into dotted keys; keys without a registered entry are ignored, and an
/// entry that fails to decode keeps its previous value.
pub fn load_json(root: &serde_json::Value) {
    let mut flat = Vec::new();
    flatten("", root, &mut flat);
    let vars: Vec<Arc<dyn AnyVar>> = {
        let registry = REGISTRY.read().expect("config lock poisoned");
        flat.iter()
            .filter_map(|(key, _)| registry.get(key).cloned())
            .collect()
    };
    let by_name: HashMap<&str, &serde_json::Value> =
        flat.iter().map(|(k, v)| (k.as_str(), *v)).collect();
    for var in vars {
        if let Some(value) = by_name.get(var.entry_name()) {
            if let Err(e) = var.set_json(value) {
                error!("config: failed to load {:?}: {}", var.entry_name(), e);
            }
        }
    }
}

/// A JSON snapshot of every registered entry, keyed by dotted name.
pub fn dump_json() -> serde_json::Value {
    let registry = REGISTRY.read().expect("config lock poisoned");
    let map = registry
        .iter()
        .map(|(name, var)| (name.clone(), var.to_json()))
        .collect();
    serde_json::Value::Object(map)
}

fn flatten<'v>(prefix: &str, value: &'v serde_json::Value, out: &mut Vec<(String, &'v serde_json::Value)>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, sub) in map {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(&name, sub, out);
            }
        }
        _ => {
            if !prefix.is_empty() {
                out.push((prefix.to_string(), value));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn lookup_returns_same_entry() {
        let a = lookup("test.lookup.entry", 17u32, "test entry");
        let b = lookup("test.lookup.entry", 99u32, "ignored default");
        assert_eq!(b.value(), 17);
        a.set(23);
        assert_eq!(b.value(), 23);
    }

    #[test]
    fn listener_sees_old_and_new() {
        let var = lookup("test.listener.entry", 5u64, "restart interval");
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        var.add_listener(move |old, new| {
            *seen2.lock().unwrap() = Some((*old, *new));
        });
        var.set(9);
        assert_eq!(*seen.lock().unwrap(), Some((5, 9)));
    }

    #[test]
    fn set_same_value_does_not_fire() {
        let var = lookup("test.listener.noop", 1i32, "");
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        var.add_listener(move |_, _| fired2.store(true, Ordering::SeqCst));
        var.set(1);
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn load_json_applies_nested_and_flat_keys() {
        let nested = lookup("test.load.nested", 0u64, "");
        let flat = lookup("test.load.flat", String::new(), "");
        load_json(&serde_json::json!({
            "test": { "load": { "nested": 120000 } },
            "test.load.flat": "hello",
            "test.load.unknown": true,
        }));
        assert_eq!(nested.value(), 120_000);
        assert_eq!(flat.value(), "hello");
    }

    #[test]
    fn bad_value_keeps_previous() {
        let var = lookup("test.load.badvalue", 44u16, "");
        load_json(&serde_json::json!({ "test.load.badvalue": "not a number" }));
        assert_eq!(var.value(), 44);
    }
}
