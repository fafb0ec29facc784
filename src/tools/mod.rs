pub mod handoff;
pub mod think;

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures_util::future::BoxFuture;
use serde_json::{Map, Value};

use crate::error::{SchemaError, ToolError};
use crate::llm::ModelToolDefinition;
use crate::policy::ToolId;

pub use handoff::handoff_tool;
pub use think::think_tool;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolOutcome {
    Text(String),
    /// Ends the run with this message, if the requirements allow it.
    Done(String),
}

type DynDependency = Arc<dyn Any + Send + Sync>;
type ToolHandler = dyn Fn(Value, &DependencyMap) -> BoxFuture<'static, Result<ToolOutcome, ToolError>>
    + Send
    + Sync;

/// Type-keyed values handed to tool handlers.
#[derive(Clone, Default, Debug)]
pub struct DependencyMap {
    values: Arc<RwLock<HashMap<TypeId, DynDependency>>>,
}

impl DependencyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T>(&self, value: T)
    where
        T: Send + Sync + 'static,
    {
        if let Ok(mut values) = self.values.write() {
            values.insert(TypeId::of::<T>(), Arc::new(value));
        }
    }

    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let values = self.values.read().ok()?;
        let value = values.get(&TypeId::of::<T>())?.clone();
        Arc::downcast::<T>(value).ok()
    }

    /// Entries of `overrides` replace entries of `self`.
    pub fn merged_with(&self, overrides: &DependencyMap) -> DependencyMap {
        let mut merged = HashMap::new();
        for source in [self, overrides] {
            if let Ok(values) = source.values.read() {
                merged.extend(values.iter().map(|(key, value)| (*key, value.clone())));
            }
        }
        DependencyMap {
            values: Arc::new(RwLock::new(merged)),
        }
    }
}

#[derive(Clone)]
pub struct ToolSpec {
    id: ToolId,
    description: String,
    json_schema: Value,
    handler: Arc<ToolHandler>,
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("id", &self.id)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl ToolSpec {
    pub fn new(name: impl Into<ToolId>, description: impl Into<String>) -> Self {
        Self {
            id: name.into(),
            description: description.into(),
            json_schema: serde_json::json!({
                "type": "object",
                "properties": {},
                "required": [],
                "additionalProperties": true,
            }),
            handler: Arc::new(|_args, _deps| {
                Box::pin(async {
                    Err(ToolError::Execution(
                        "tool handler not configured".to_string(),
                    ))
                })
            }),
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Result<Self, SchemaError> {
        check_schema(&schema)?;
        self.json_schema = schema;
        Ok(self)
    }

    /// Schema for built-in tools, known to be well formed.
    pub(crate) fn with_builtin_schema(mut self, schema: Value) -> Self {
        debug_assert!(check_schema(&schema).is_ok());
        self.json_schema = schema;
        self
    }

    pub fn with_handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Value, &DependencyMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutcome, ToolError>> + Send + 'static,
    {
        self.handler = Arc::new(move |args, deps| Box::pin(handler(args, deps)));
        self
    }

    pub fn id(&self) -> &ToolId {
        &self.id
    }

    pub fn name(&self) -> &str {
        self.id.as_str()
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn json_schema(&self) -> &Value {
        &self.json_schema
    }

    pub fn definition(&self) -> ModelToolDefinition {
        ModelToolDefinition {
            name: self.name().to_string(),
            description: self.description.clone(),
            parameters: self.json_schema.clone(),
        }
    }

    pub async fn execute(
        &self,
        args: Value,
        dependencies: &DependencyMap,
    ) -> Result<ToolOutcome, ToolError> {
        check_arguments(self.name(), &self.json_schema, &args)?;
        (self.handler)(args, dependencies).await
    }
}

fn check_schema(schema: &Value) -> Result<(), SchemaError> {
    let root = schema.as_object().ok_or(SchemaError::SchemaNotObject)?;

    if root.get("type").and_then(Value::as_str) != Some("object") {
        return Err(SchemaError::RootTypeMustBeObject);
    }

    match root.get("required") {
        None => Ok(()),
        Some(Value::Array(fields)) if fields.iter().all(Value::is_string) => Ok(()),
        Some(_) => Err(SchemaError::InvalidRequired),
    }
}

fn check_arguments(tool: &str, schema: &Value, args: &Value) -> Result<(), ToolError> {
    let invalid = |message: String| ToolError::InvalidArguments {
        tool: tool.to_string(),
        message,
    };

    let args = args
        .as_object()
        .ok_or_else(|| invalid("arguments must be a JSON object".to_string()))?;
    let schema = schema
        .as_object()
        .ok_or_else(|| invalid("tool schema must be a JSON object".to_string()))?;

    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str);
    for field in required {
        if !args.contains_key(field) {
            return Err(invalid(format!("missing required field: {field}")));
        }
    }

    let empty = Map::new();
    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let closed = schema.get("additionalProperties").and_then(Value::as_bool) == Some(false);

    for (key, value) in args {
        let Some(field_schema) = properties.get(key) else {
            if closed {
                return Err(invalid(format!("unknown field: {key}")));
            }
            continue;
        };
        if let Some(type_name) = field_schema.get("type").and_then(Value::as_str) {
            if !matches_type(value, type_name) {
                return Err(invalid(format!("field '{key}' must be of type {type_name}")));
            }
        }
    }

    Ok(())
}

fn matches_type(value: &Value, type_name: &str) -> bool {
    match type_name {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}
