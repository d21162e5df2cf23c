//! Resource descriptors: what the caller wants to exist.

use serde_json::{Map, Value};

use crate::error::ConfigError;

/// A target resource identified by its kind and a human-meaningful key.
///
/// IDs are never known up front and are not assumed stable across runs, so
/// the natural key is the only lookup criterion.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDescriptor {
    kind: String,
    natural_key: String,
    desired_properties: Map<String, Value>,
}

impl ResourceDescriptor {
    pub fn new(kind: impl Into<String>, natural_key: impl Into<String>) -> Result<Self, ConfigError> {
        let kind: String = kind.into();
        let natural_key: String = natural_key.into();
        let kind = kind.trim().to_string();
        let natural_key = natural_key.trim().to_string();
        if kind.is_empty() {
            return Err(ConfigError::EmptyKind);
        }
        if natural_key.is_empty() {
            return Err(ConfigError::EmptyNaturalKey(kind));
        }
        Ok(Self {
            kind,
            natural_key,
            desired_properties: Map::new(),
        })
    }

    pub fn with_properties(mut self, properties: Map<String, Value>) -> Self {
        self.desired_properties = properties;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.desired_properties.insert(key.into(), value);
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn natural_key(&self) -> &str {
        &self.natural_key
    }

    pub fn desired_properties(&self) -> &Map<String, Value> {
        &self.desired_properties
    }
}
