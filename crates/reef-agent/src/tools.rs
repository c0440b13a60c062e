//! Named callables agents can invoke and offer to language models.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use reef_llm::ToolSpec;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::ToolError;

/// JSON type of a tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl ParamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }

    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

/// One argument of a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    pub kind: ParamKind,
    pub description: String,
    pub required: bool,
}

impl ToolParameter {
    pub fn required(name: impl Into<String>, kind: ParamKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            description: description.into(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParamKind, description: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }
}

/// The callable behind a tool. Receives the validated arguments object.
pub type ToolFn = dyn Fn(&Map<String, Value>) -> Result<Value, ToolError> + Send + Sync;

/// A named callable with typed parameters.
///
/// A tool with an `owner` is offered only to that agent; one without is
/// shared by all agents.
#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
    pub owner: Option<String>,
    func: Arc<ToolFn>,
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("parameters", &self.parameters)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl Tool {
    pub fn new<F>(name: impl Into<String>, description: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
            owner: None,
            func: Arc::new(func),
        }
    }

    pub fn param(mut self, parameter: ToolParameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn owned_by(mut self, agent: impl Into<String>) -> Self {
        self.owner = Some(agent.into());
        self
    }

    pub fn is_available_to(&self, agent: &str) -> bool {
        self.owner.as_deref().map_or(true, |owner| owner == agent)
    }

    /// The description handed to language models.
    pub fn spec(&self) -> ToolSpec {
        let properties: Map<String, Value> = self
            .parameters
            .iter()
            .map(|p| {
                (
                    p.name.clone(),
                    json!({"type": p.kind.as_str(), "description": p.description}),
                )
            })
            .collect();
        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }

    /// Validates `args` against the parameters and calls the tool.
    ///
    /// # Errors
    ///
    /// `InvalidArguments` for a non-object, a missing required argument or
    /// a wrongly typed one; otherwise whatever the tool returns.
    pub fn invoke(&self, args: &Value) -> Result<Value, ToolError> {
        let invalid = |reason: String| ToolError::InvalidArguments {
            tool: self.name.clone(),
            reason,
        };
        let args = args
            .as_object()
            .ok_or_else(|| invalid("arguments must be an object".into()))?;
        for parameter in &self.parameters {
            match args.get(&parameter.name) {
                None | Some(Value::Null) if parameter.required => {
                    return Err(invalid(format!("missing `{}`", parameter.name)));
                }
                Some(value) if !value.is_null() && !parameter.kind.matches(value) => {
                    return Err(invalid(format!(
                        "`{}` must be {}",
                        parameter.name,
                        parameter.kind.as_str()
                    )));
                }
                _ => {}
            }
        }
        (self.func)(args)
    }
}

/// Tools shared across agents, keyed by name.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: RwLock<BTreeMap<String, Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tool, returning the one it replaced.
    pub fn register(&self, tool: Tool) -> Option<Tool> {
        tracing::debug!(tool = %tool.name, owner = ?tool.owner, "tool registered");
        self.tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tool.name.clone(), tool)
    }

    pub fn get(&self, name: &str) -> Option<Tool> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn remove(&self, name: &str) -> Option<Tool> {
        self.tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    pub fn clear(&self) {
        self.tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// # Errors
    ///
    /// `NotFound` for an unknown tool, otherwise see [`Tool::invoke`].
    pub fn invoke(&self, name: &str, args: &Value) -> Result<Value, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.invoke(args)
    }

    /// Tools owned by `agent` plus shared ones.
    pub fn tools_for_agent(&self, agent: &str) -> Vec<Tool> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|t| t.is_available_to(agent))
            .cloned()
            .collect()
    }

    pub fn specs_for_agent(&self, agent: &str) -> Vec<ToolSpec> {
        self.tools_for_agent(agent).iter().map(Tool::spec).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adder() -> Tool {
        Tool::new("add", "adds two integers", |args| {
            let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
            let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(a + b))
        })
        .param(ToolParameter::required("a", ParamKind::Integer, "left"))
        .param(ToolParameter::optional("b", ParamKind::Integer, "right"))
    }

    #[test]
    fn invoke_validates_arguments() {
        let registry = ToolRegistry::new();
        registry.register(adder());

        assert_eq!(
            registry
                .invoke("add", &json!({"a": 2, "b": 3}))
                .expect("should add"),
            json!(5)
        );
        assert_eq!(
            registry.invoke("add", &json!({"a": 2})).expect("b is optional"),
            json!(2)
        );
        assert!(matches!(
            registry.invoke("add", &json!({"b": 3})),
            Err(ToolError::InvalidArguments { .. })
        ));
        assert!(matches!(
            registry.invoke("add", &json!({"a": "two"})),
            Err(ToolError::InvalidArguments { .. })
        ));
        assert!(matches!(
            registry.invoke("add", &json!([1, 2])),
            Err(ToolError::InvalidArguments { .. })
        ));
        assert!(matches!(
            registry.invoke("sub", &json!({})),
            Err(ToolError::NotFound(_))
        ));
    }

    #[test]
    fn ownership_limits_visibility() {
        let registry = ToolRegistry::new();
        registry.register(adder());
        registry.register(
            Tool::new("secret", "private", |_| Ok(Value::Null)).owned_by("analyst"),
        );

        let names = |agent: &str| -> Vec<String> {
            registry
                .tools_for_agent(agent)
                .into_iter()
                .map(|t| t.name)
                .collect()
        };
        assert_eq!(names("analyst"), vec!["add", "secret"]);
        assert_eq!(names("writer"), vec!["add"]);
    }

    #[test]
    fn spec_describes_parameters() {
        let spec = adder().spec();
        assert_eq!(spec.name, "add");
        assert_eq!(spec.parameters["properties"]["a"]["type"], "integer");
        assert_eq!(spec.parameters["required"], json!(["a"]));
    }

    #[test]
    fn register_replaces_and_clear_empties() {
        let registry = ToolRegistry::new();
        assert!(registry.register(adder()).is_none());
        assert!(registry.register(adder()).is_some());
        assert_eq!(registry.names(), vec!["add"]);
        assert!(registry.remove("add").is_some());
        registry.register(adder());
        registry.clear();
        assert!(registry.names().is_empty());
    }
}
