//! Declarative argument schemas for registered tools.
//!
//! Every tool declares its arguments as a static table of [`ArgSpec`]s; the
//! dispatcher validates and coerces raw model-produced JSON against that
//! table before the handler runs. The contract: unknown fields are rejected,
//! required fields are enforced, enum membership is enforced, declared
//! defaults are applied for missing optional fields. Validation failure never
//! reaches a handler.

use serde_json::{Map, Value};

/// Declared type of a tool argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ArgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArgType::String => "string",
            ArgType::Integer => "integer",
            ArgType::Number => "number",
            ArgType::Boolean => "boolean",
            ArgType::Array => "array",
            ArgType::Object => "object",
        }
    }
}

/// One declared argument in a tool's schema table.
#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub name: String,
    pub description: String,
    pub arg_type: ArgType,
    pub required: bool,
    /// Applied when an optional argument is absent.
    pub default: Option<Value>,
    /// Enum constraint: the coerced value must be one of these.
    pub allowed: Option<Vec<Value>>,
}

impl ArgSpec {
    pub fn required(name: &str, arg_type: ArgType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            arg_type,
            required: true,
            default: None,
            allowed: None,
        }
    }

    pub fn optional(name: &str, arg_type: ArgType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            arg_type,
            required: false,
            default: None,
            allowed: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn one_of(mut self, allowed: Vec<Value>) -> Self {
        self.allowed = Some(allowed);
        self
    }
}

/// A per-field validation failure, phrased for both logs and the model.
#[derive(Debug, Clone)]
pub struct FieldError {
    pub field: String,
    pub reason: String,
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// Arguments that passed validation. Handlers may rely on required fields
/// being present with their declared types and defaults applied.
#[derive(Debug, Clone, Default)]
pub struct ValidatedArgs {
    map: Map<String, Value>,
}

impl ValidatedArgs {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.map.get(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.map.get(name).and_then(|v| v.as_str())
    }

    pub fn i64(&self, name: &str) -> Option<i64> {
        self.map.get(name).and_then(|v| v.as_i64())
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.map.get(name).and_then(|v| v.as_f64())
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.map.get(name).and_then(|v| v.as_bool())
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.map.clone())
    }
}

/// Validate raw model-produced arguments against a declared table.
///
/// `raw` must be a JSON object; `null` is treated as an empty object since
/// models routinely omit the arguments field for zero-argument tools.
pub fn validate(specs: &[ArgSpec], raw: &Value) -> Result<ValidatedArgs, Vec<FieldError>> {
    let empty = Map::new();
    let obj = match raw {
        Value::Object(m) => m,
        Value::Null => &empty,
        other => {
            return Err(vec![FieldError {
                field: "<arguments>".to_string(),
                reason: format!("expected a JSON object, got {}", type_name(other)),
            }]);
        }
    };

    let mut errors = Vec::new();
    let mut out = Map::new();

    // Unknown fields are rejected, not silently dropped.
    for key in obj.keys() {
        if !specs.iter().any(|s| s.name == *key) {
            errors.push(FieldError {
                field: key.clone(),
                reason: "unknown field".to_string(),
            });
        }
    }

    for spec in specs {
        match obj.get(&spec.name) {
            Some(value) => match coerce(value, spec.arg_type) {
                Ok(coerced) => {
                    if let Some(allowed) = &spec.allowed {
                        if !allowed.contains(&coerced) {
                            errors.push(FieldError {
                                field: spec.name.clone(),
                                reason: format!(
                                    "value {} is not one of {}",
                                    coerced,
                                    Value::Array(allowed.clone())
                                ),
                            });
                            continue;
                        }
                    }
                    out.insert(spec.name.clone(), coerced);
                }
                Err(reason) => errors.push(FieldError {
                    field: spec.name.clone(),
                    reason,
                }),
            },
            None if spec.required => errors.push(FieldError {
                field: spec.name.clone(),
                reason: "required field is missing".to_string(),
            }),
            None => {
                if let Some(default) = &spec.default {
                    out.insert(spec.name.clone(), default.clone());
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(ValidatedArgs { map: out })
    } else {
        Err(errors)
    }
}

/// Coerce a value to the declared type. Lenient where the intent is
/// unambiguous (numeric strings, "true"/"false"), strict everywhere else.
fn coerce(value: &Value, target: ArgType) -> Result<Value, String> {
    match target {
        ArgType::String => match value {
            Value::String(_) => Ok(value.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            other => Err(format!("expected string, got {}", type_name(other))),
        },
        ArgType::Integer => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            Value::Number(n) => match n.as_f64() {
                Some(f) if f.fract() == 0.0 => Ok(Value::from(f as i64)),
                _ => Err("expected integer, got fractional number".to_string()),
            },
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("expected integer, got string {s:?}")),
            other => Err(format!("expected integer, got {}", type_name(other))),
        },
        ArgType::Number => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("expected number, got string {s:?}")),
            other => Err(format!("expected number, got {}", type_name(other))),
        },
        ArgType::Boolean => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(format!("expected boolean, got string {s:?}")),
            },
            other => Err(format!("expected boolean, got {}", type_name(other))),
        },
        ArgType::Array => match value {
            Value::Array(_) => Ok(value.clone()),
            other => Err(format!("expected array, got {}", type_name(other))),
        },
        ArgType::Object => match value {
            Value::Object(_) => Ok(value.clone()),
            other => Err(format!("expected object, got {}", type_name(other))),
        },
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Render a declared table as a JSON-schema-shaped object for model prompts.
pub fn to_json_schema(specs: &[ArgSpec]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for spec in specs {
        let mut prop = Map::new();
        prop.insert("type".to_string(), Value::from(spec.arg_type.as_str()));
        prop.insert(
            "description".to_string(),
            Value::from(spec.description.clone()),
        );
        if let Some(allowed) = &spec.allowed {
            prop.insert("enum".to_string(), Value::Array(allowed.clone()));
        }
        if let Some(default) = &spec.default {
            prop.insert("default".to_string(), default.clone());
        }
        properties.insert(spec.name.clone(), Value::Object(prop));
        if spec.required {
            required.push(Value::from(spec.name.clone()));
        }
    }
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false
    })
}
