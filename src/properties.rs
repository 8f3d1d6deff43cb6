//! # Typed Property Bag
//!
//! A string-keyed map of typed scalar values used in three places: user
//! message properties, packet header maps, and connection configuration
//! input. Values keep the type they were stored with; reading a key back
//! through an accessor of a different type fails with
//! [`MqError::PropertyWrongValueType`] rather than coercing.
//!
//! Property files are JSON objects of scalars; integers load as `i64`,
//! fractional numbers as `f64`.

use crate::error::{MqError, MqResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// A single typed property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    String(String),
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl PropertyValue {
    /// Human-readable name of the stored type, used in log output.
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::String(_) => "string",
            PropertyValue::Bool(_) => "bool",
            PropertyValue::I8(_) => "int8",
            PropertyValue::I16(_) => "int16",
            PropertyValue::I32(_) => "int32",
            PropertyValue::I64(_) => "int64",
            PropertyValue::F32(_) => "float32",
            PropertyValue::F64(_) => "float64",
        }
    }
}

/// String-keyed map of [`PropertyValue`]s.
///
/// Keys iterate in sorted order, which keeps serialized header maps and
/// test output deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Properties {
    entries: BTreeMap<String, PropertyValue>,
}

macro_rules! typed_accessors {
    ($set:ident, $get:ident, $ty:ty, $variant:ident) => {
        pub fn $set(&mut self, key: &str, value: $ty) {
            self.entries
                .insert(key.to_string(), PropertyValue::$variant(value.into()));
        }

        /// Returns the value stored under `key`, failing with
        /// [`MqError::NotFound`] if absent and
        /// [`MqError::PropertyWrongValueType`] if present with another type.
        pub fn $get(&self, key: &str) -> MqResult<$ty> {
            match self.entries.get(key) {
                Some(PropertyValue::$variant(v)) => Ok(v.clone()),
                Some(_) => Err(MqError::PropertyWrongValueType),
                None => Err(MqError::NotFound),
            }
        }
    };
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    typed_accessors!(set_bool, get_bool, bool, Bool);
    typed_accessors!(set_int8, get_int8, i8, I8);
    typed_accessors!(set_int16, get_int16, i16, I16);
    typed_accessors!(set_int32, get_int32, i32, I32);
    typed_accessors!(set_int64, get_int64, i64, I64);
    typed_accessors!(set_float32, get_float32, f32, F32);
    typed_accessors!(set_float64, get_float64, f64, F64);

    pub fn set_string(&mut self, key: &str, value: &str) {
        self.entries
            .insert(key.to_string(), PropertyValue::String(value.to_string()));
    }

    pub fn get_string(&self, key: &str) -> MqResult<String> {
        match self.entries.get(key) {
            Some(PropertyValue::String(v)) => Ok(v.clone()),
            Some(_) => Err(MqError::PropertyWrongValueType),
            None => Err(MqError::NotFound),
        }
    }

    /// Raw value lookup, any type.
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.entries.get(key)
    }

    pub fn set(&mut self, key: &str, value: PropertyValue) {
        self.entries.insert(key.to_string(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<PropertyValue> {
        self.entries.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Iterates keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Loads properties from a JSON file of scalar values.
    ///
    /// Nested objects and arrays are rejected as
    /// [`MqError::PropertyFileError`].
    pub fn from_file(path: &Path) -> MqResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MqError::FileNotFound
            } else {
                MqError::PropertyFileError
            }
        })?;
        let parsed: serde_json::Value =
            serde_json::from_str(&text).map_err(|_| MqError::PropertyFileError)?;
        let obj = parsed.as_object().ok_or(MqError::PropertyFileError)?;

        let mut props = Properties::new();
        for (key, value) in obj {
            let value = match value {
                serde_json::Value::String(s) => PropertyValue::String(s.clone()),
                serde_json::Value::Bool(b) => PropertyValue::Bool(*b),
                serde_json::Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        PropertyValue::I64(i)
                    } else {
                        PropertyValue::F64(n.as_f64().ok_or(MqError::PropertyFileError)?)
                    }
                }
                _ => return Err(MqError::PropertyFileError),
            };
            props.set(key, value);
        }
        Ok(props)
    }
}
