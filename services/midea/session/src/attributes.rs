//! Attribute store and observer registry shared between a session worker and its handles.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Attribute key reporting whether the session is connected
pub const AVAILABLE: &str = "available";

/// Value of a device attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Switch-like state
    Bool(bool),
    /// Integer reading or setting
    Int(i64),
    /// Fractional reading
    Float(f64),
    /// Named option (mode, fan speed, ...)
    Text(String),
    /// Not reported yet
    Null,
}

impl AttributeValue {
    /// Boolean value, if this is a `Bool`
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer value, if this is an `Int`
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric value of an `Int` or `Float`
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Int(v) => Some(*v as f64),
            AttributeValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Text value, if this is a `Text`
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(v) => write!(f, "{}", v),
            AttributeValue::Int(v) => write!(f, "{}", v),
            AttributeValue::Float(v) => write!(f, "{}", v),
            AttributeValue::Text(v) => write!(f, "{}", v),
            AttributeValue::Null => write!(f, "null"),
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<u8> for AttributeValue {
    fn from(value: u8) -> Self {
        AttributeValue::Int(value as i64)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Float(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl<T: Into<AttributeValue>> From<Option<T>> for AttributeValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(AttributeValue::Null)
    }
}

/// Attribute name → value
pub type AttributeMap = BTreeMap<String, AttributeValue>;

/// Callback invoked with every set of changed attributes
pub type Observer = Arc<dyn Fn(&AttributeMap) + Send + Sync>;

/// State visible outside the session worker
#[derive(Default)]
pub struct SharedState {
    attributes: RwLock<AttributeMap>,
    observers: RwLock<Vec<Observer>>,
    available: AtomicBool,
    running: AtomicBool,
}

impl fmt::Debug for SharedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedState")
            .field("attributes", &*self.attributes())
            .field("available", &self.is_available())
            .field("running", &self.is_running())
            .finish()
    }
}

impl SharedState {
    /// Empty state, not available, not running
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot guard over the attribute map
    pub fn attributes(&self) -> RwLockReadGuard<'_, AttributeMap> {
        self.attributes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn attributes_mut(&self) -> RwLockWriteGuard<'_, AttributeMap> {
        self.attributes.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Merge `changes` into the attribute map
    pub fn apply(&self, changes: &AttributeMap) {
        let mut attributes = self.attributes_mut();
        for (key, value) in changes {
            attributes.insert(key.clone(), value.clone());
        }
    }

    /// Append an observer
    pub fn register(&self, observer: Observer) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    /// Invoke every observer with `changes`, synchronously and in registration order.
    ///
    /// The list is snapshotted first, so an observer registered from inside a
    /// callback is only called from the next update on.
    pub fn update_all(&self, changes: &AttributeMap) {
        debug!("Status update: {:?}", changes);
        let observers = self
            .observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for observer in &observers {
            observer(changes);
        }
    }

    /// Record availability and broadcast it as the `available` attribute
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        let mut changes = AttributeMap::new();
        changes.insert(AVAILABLE.to_string(), AttributeValue::Bool(available));
        self.apply(&changes);
        self.update_all(&changes);
    }

    /// Whether the session is connected and refreshed
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Whether the worker should keep running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Set the run flag observed by the worker at loop boundaries
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}
