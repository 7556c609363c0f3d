use serde::{Deserialize, Serialize};
use std::fmt;

/// Typed attribute, argument and result value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::List(_) => "list",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Best-effort typing of a command-line literal.
    pub fn infer(literal: &str) -> Value {
        match literal {
            "null" => Value::Null,
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => {
                if let Ok(i) = literal.parse::<i64>() {
                    Value::Int(i)
                } else if let Ok(f) = literal.parse::<f64>() {
                    Value::Float(f)
                } else {
                    Value::Text(literal.to_string())
                }
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => f.write_str(s),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infer_types_literals() {
        assert_eq!(Value::infer("42"), Value::Int(42));
        assert_eq!(Value::infer("true"), Value::Bool(true));
        assert_eq!(Value::infer("1.5"), Value::Float(1.5));
        assert_eq!(Value::infer("changed state"), Value::from("changed state"));
    }

    #[test]
    fn wire_form_is_adjacently_tagged() {
        let json = serde_json::to_string(&Value::from("on")).unwrap();
        assert_eq!(json, r#"{"type":"text","value":"on"}"#);
        let null: Value = serde_json::from_str(r#"{"type":"null"}"#).unwrap();
        assert_eq!(null, Value::Null);
    }
}
