//! Payload schemas per topic.
//!
//! Schemas are JSON Schema documents, compiled once when registered.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use jsonschema::JSONSchema;
use serde_json::Value;

use crate::error::EventsError;

#[derive(Clone)]
struct CompiledSchema {
    document: Value,
    validator: Arc<JSONSchema>,
}

#[derive(Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, CompiledSchema>,
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.schemas.keys()).finish()
    }
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `schema` and use it for `topic`, replacing any earlier one.
    pub fn register(&mut self, topic: &str, schema: Value) -> anyhow::Result<()> {
        let validator = JSONSchema::compile(&schema)
            .map_err(|e| anyhow::anyhow!("compile schema for {topic}: {e}"))?;
        self.schemas.insert(
            topic.to_owned(),
            CompiledSchema {
                document: schema,
                validator: Arc::new(validator),
            },
        );
        Ok(())
    }

    pub fn with_schema(mut self, topic: &str, schema: Value) -> anyhow::Result<Self> {
        self.register(topic, schema)?;
        Ok(self)
    }

    pub fn get(&self, topic: &str) -> Option<&Value> {
        self.schemas.get(topic).map(|s| &s.document)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Load every `<topic>.json` file in `dir`.
    pub fn load_dir(dir: &Path) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("read schema dir {}", dir.display()))?;
        for entry in entries {
            let path = entry.context("read schema dir entry")?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(topic) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("read schema {}", path.display()))?;
            let schema: Value = serde_json::from_str(&contents)
                .with_context(|| format!("parse schema {}", path.display()))?;
            registry
                .register(topic, schema)
                .with_context(|| format!("load schema {}", path.display()))?;
        }
        Ok(registry)
    }

    /// Validate `payload` against the topic's schema. Topics without a
    /// schema always pass.
    pub fn validate(&self, topic: &str, payload: &Value) -> Result<(), EventsError> {
        let Some(schema) = self.schemas.get(topic) else {
            return Ok(());
        };
        // Reasons are prefixed with the JSON pointer of the offending value, `$` for the root.
        if let Err(errors) = schema.validator.validate(payload) {
            let reason = errors
                .map(|e| format!("${}: {e}", e.instance_path))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(EventsError::SchemaViolation {
                topic: topic.to_owned(),
                reason,
            });
        }
        Ok(())
    }
}
