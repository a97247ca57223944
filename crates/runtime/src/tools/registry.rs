use std::sync::Arc;

use serde_json::Value;

use crate::model::ToolSpec;
use crate::tools::{RegistryError, Tool, ToolError};

#[derive(Clone)]
struct Entry {
    spec: ToolSpec,
    tool: Arc<dyn Tool>,
}

/// Tools available to agents, in registration order.
///
/// Contracts are checked once at registration, so a registered tool's spec
/// can be handed to the model without further validation.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    entries: Vec<Entry>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|e| &e.spec.name))
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool after validating its contract.
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let spec = tool.spec();
        validate_spec(&spec)?;
        if self.get(&spec.name).is_some() {
            return Err(RegistryError::DuplicateName(spec.name));
        }
        tracing::debug!(tool = %spec.name, "tool registered");
        self.entries.push(Entry { spec, tool });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.entry(name).map(|e| Arc::clone(&e.tool))
    }

    fn entry(&self, name: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.spec.name == name)
    }

    /// Contracts of every registered tool, in registration order.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.entries.iter().map(|e| e.spec.clone()).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.spec.name.as_str()).collect()
    }

    /// A registry holding only `names`, in that order.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Self, RegistryError> {
        let mut selected = Self::new();
        for name in names {
            let name = name.as_ref();
            let entry = self
                .entry(name)
                .ok_or_else(|| RegistryError::Unknown(name.to_string()))?;
            if selected.entry(name).is_some() {
                return Err(RegistryError::DuplicateName(name.to_string()));
            }
            selected.entries.push(entry.clone());
        }
        Ok(selected)
    }

    /// Validate `input` against the tool's required fields and call it.
    pub fn call(&self, name: &str, input: Value) -> Result<Value, ToolError> {
        let entry = self
            .entry(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        check_input(&entry.spec, &input)?;
        entry.tool.call(input)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn validate_spec(spec: &ToolSpec) -> Result<(), RegistryError> {
    let invalid = |reason: &str| RegistryError::InvalidSpec {
        name: spec.name.clone(),
        reason: reason.to_string(),
    };

    if spec.name.trim().is_empty() {
        return Err(invalid("name is empty"));
    }
    if spec.input_schema.get("type").and_then(Value::as_str) != Some("object") {
        return Err(invalid("input schema must have type \"object\""));
    }
    let properties = spec.input_schema.get("properties");
    if properties.is_some_and(|p| !p.is_object()) {
        return Err(invalid("input schema properties must be an object"));
    }
    for field in required_fields(&spec.input_schema) {
        if !properties.is_some_and(|p| p.get(field).is_some()) {
            return Err(invalid(&format!(
                "required field '{field}' is not declared under properties"
            )));
        }
    }
    if !spec.output_schema.is_object() {
        return Err(invalid("output schema is missing"));
    }
    Ok(())
}

fn required_fields(schema: &Value) -> impl Iterator<Item = &str> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
}

fn check_input(spec: &ToolSpec, input: &Value) -> Result<(), ToolError> {
    let Some(object) = input.as_object() else {
        return Err(ToolError::InvalidInput(format!(
            "{} expects a JSON object",
            spec.name
        )));
    };
    for field in required_fields(&spec.input_schema) {
        if !object.contains_key(field) {
            return Err(ToolError::InvalidInput(format!(
                "{}: missing required field '{field}'",
                spec.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo {
        name: &'static str,
        input_schema: Value,
    }

    impl Echo {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                input_schema: json!({
                    "type": "object",
                    "properties": {"message": {"type": "string"}},
                    "required": ["message"]
                }),
            }
        }
    }

    impl Tool for Echo {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: self.name.to_string(),
                description: "Echoes the message back.".into(),
                input_schema: self.input_schema.clone(),
                output_schema: json!({"type": "object"}),
            }
        }

        fn call(&self, input: Value) -> Result<Value, ToolError> {
            Ok(json!({"echo": input["message"]}))
        }
    }

    #[test]
    fn register_and_call() {
        let mut registry = ToolRegistry::new();
        registry.register(Echo::new("echo")).unwrap();

        assert_eq!(registry.len(), 1);
        let out = registry.call("echo", json!({"message": "hi"})).unwrap();
        assert_eq!(out, json!({"echo": "hi"}));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(Echo::new("echo")).unwrap();
        assert_eq!(
            registry.register(Echo::new("echo")).unwrap_err(),
            RegistryError::DuplicateName("echo".into())
        );
    }

    #[test]
    fn contract_is_validated_at_registration() {
        let mut registry = ToolRegistry::new();

        let mut not_object = Echo::new("a");
        not_object.input_schema = json!({"type": "string"});
        assert!(matches!(
            registry.register(not_object),
            Err(RegistryError::InvalidSpec { .. })
        ));

        let mut undeclared = Echo::new("b");
        undeclared.input_schema = json!({"type": "object", "required": ["path"]});
        assert!(matches!(
            registry.register(undeclared),
            Err(RegistryError::InvalidSpec { .. })
        ));

        assert!(registry.register(Echo::new(" ")).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn call_checks_required_fields() {
        let mut registry = ToolRegistry::new();
        registry.register(Echo::new("echo")).unwrap();

        assert!(matches!(
            registry.call("echo", json!({})),
            Err(ToolError::InvalidInput(_))
        ));
        assert!(matches!(
            registry.call("echo", json!("hi")),
            Err(ToolError::InvalidInput(_))
        ));
        assert_eq!(
            registry.call("missing", json!({})).unwrap_err(),
            ToolError::NotFound("missing".into())
        );
    }

    #[test]
    fn select_keeps_requested_order() {
        let mut registry = ToolRegistry::new();
        registry.register(Echo::new("a")).unwrap();
        registry.register(Echo::new("b")).unwrap();

        let selected = registry.select(&["b", "a"]).unwrap();
        assert_eq!(selected.names(), vec!["b", "a"]);
        assert_eq!(
            registry.select(&["c"]).unwrap_err(),
            RegistryError::Unknown("c".into())
        );
    }
}
