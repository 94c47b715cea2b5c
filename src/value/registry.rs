use super::{Value, ValueFlags, ValueType};
use crate::error::{OpError, ParseError};
use core::ops::Deref;

/// Values owned by one endpoint, in creation order.
#[derive(Debug, Clone, Default)]
pub struct ValueSet {
    values: Vec<Value>,
}

impl ValueSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value. New values start dirty so the next idle sweep publishes them.
    pub fn create(&mut self, mut value: Value) -> Result<&mut Value, OpError> {
        if self.contains(value.name()) {
            return Err(OpError::Duplicate(value.name().to_string()));
        }
        value.mark_dirty();
        self.values.push(value);
        let last = self.values.len() - 1;
        Ok(&mut self.values[last])
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.iter().find(|v| v.name() == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.values.iter_mut().find(|v| v.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn dirty(&self) -> impl Iterator<Item = &Value> {
        self.values.iter().filter(|v| v.is_dirty())
    }

    pub fn has_dirty(&self) -> bool {
        self.values.iter().any(Value::is_dirty)
    }

    pub fn clear_dirty(&mut self) {
        self.values.iter_mut().for_each(Value::clear_dirty);
    }

    /// Local assignment from text; marks the value dirty.
    pub fn set(&mut self, name: &str, text: &str) -> Result<(), OpError> {
        let value = self
            .get_mut(name)
            .ok_or_else(|| OpError::UnknownValue(name.to_string()))?;
        value.set(text)?;
        Ok(())
    }
}

/// Read-only copy of a value owned by a peer.
///
/// Created by a metainfo record and changed only by the connection that replicates it.
#[derive(Debug, Clone)]
pub struct Mirror {
    value: Value,
}

impl Mirror {
    pub fn announce(type_code: u32, name: &str, description: &str) -> Result<Self, ParseError> {
        let value_type = ValueType::from_code(type_code)?;
        let value = Value::new(name, description, value_type)
            .with_flags(ValueFlags::from_bits(type_code));
        Ok(Self { value })
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub(crate) fn replicate(&mut self, text: &str) -> Result<(), ParseError> {
        self.value.set(text)
    }

    pub(crate) fn add_symbol(&mut self, symbol: &str) -> bool {
        self.value.add_symbol(symbol)
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.value.clear_dirty();
    }
}

impl Deref for Mirror {
    type Target = Value;

    fn deref(&self) -> &Value {
        &self.value
    }
}
