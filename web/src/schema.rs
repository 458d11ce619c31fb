//! Thin validation seam for request bodies, sync responses, and outgoing
//! event payloads.
//!
//! Validation returns the value to use downstream, so a schema may normalize
//! what it accepts.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ValidationError {}

pub trait Schema: Send + Sync {
    fn validate(&self, value: &Value) -> Result<Value, ValidationError>;
}

/// Accepts every value unchanged.
pub struct AnySchema;

impl Schema for AnySchema {
    fn validate(&self, value: &Value) -> Result<Value, ValidationError> {
        Ok(value.clone())
    }
}

/// Requires a JSON object carrying every listed field.
pub struct RequiredFields(pub Vec<&'static str>);

impl RequiredFields {
    pub fn new(fields: &[&'static str]) -> Self {
        Self(fields.to_vec())
    }
}

impl Schema for RequiredFields {
    fn validate(&self, value: &Value) -> Result<Value, ValidationError> {
        let Some(object) = value.as_object() else {
            return Err(ValidationError::new("expected a JSON object"));
        };
        let missing: Vec<&str> = self
            .0
            .iter()
            .copied()
            .filter(|field| !object.contains_key(*field))
            .collect();

        if missing.is_empty() {
            Ok(value.clone())
        } else {
            Err(ValidationError::new(format!(
                "missing field(s): {}",
                missing.join(", ")
            )))
        }
    }
}

/// Validation by round-tripping through a serde type, which also drops
/// unknown fields and fills defaults.
pub struct Typed<T>(PhantomData<fn() -> T>);

impl<T> Typed<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for Typed<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Schema for Typed<T>
where
    T: DeserializeOwned + Serialize,
{
    fn validate(&self, value: &Value) -> Result<Value, ValidationError> {
        let typed: T = serde_json::from_value(value.clone())
            .map_err(|e| ValidationError::new(e.to_string()))?;
        serde_json::to_value(typed).map_err(|e| ValidationError::new(e.to_string()))
    }
}

/// Adapts a closure into a `Schema`.
pub struct FnSchema<F>(pub F);

impl<F> Schema for FnSchema<F>
where
    F: Fn(&Value) -> Result<Value, ValidationError> + Send + Sync,
{
    fn validate(&self, value: &Value) -> Result<Value, ValidationError> {
        (self.0)(value)
    }
}
