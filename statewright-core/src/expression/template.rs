//! Parameter templates
//!
//! A template is a JSON value in which object keys ending in `.$` carry an
//! expression instead of a literal: `{"id.$": "$.order.id", "kind": "ping"}`
//! renders to `{"id": <value at $.order.id>, "kind": "ping"}`.

use super::parser::Expr;
use super::EvalError;
use serde_json::{Map, Value};

const DYNAMIC_SUFFIX: &str = ".$";

#[derive(Debug, Clone, PartialEq)]
pub enum Template {
    Literal(Value),
    Expr(Expr),
    Object(Vec<(String, Template)>),
    Array(Vec<Template>),
}

impl Template {
    /// Compile a template, parsing every dynamic entry up front
    pub fn compile(value: &Value) -> Result<Self, EvalError> {
        if !has_dynamic_keys(value) {
            return Ok(Template::Literal(value.clone()));
        }

        match value {
            Value::Object(map) => {
                let mut entries = Vec::with_capacity(map.len());
                for (key, entry) in map {
                    if let Some(name) = key.strip_suffix(DYNAMIC_SUFFIX) {
                        let source = entry.as_str().ok_or_else(|| {
                            EvalError::TypeMismatch(format!(
                                "template key '{}' must hold an expression string",
                                key
                            ))
                        })?;
                        entries.push((name.to_string(), Template::Expr(Expr::parse(source)?)));
                    } else {
                        entries.push((key.clone(), Template::compile(entry)?));
                    }
                }
                Ok(Template::Object(entries))
            }
            Value::Array(items) => Ok(Template::Array(
                items.iter().map(Template::compile).collect::<Result<_, _>>()?,
            )),
            other => Ok(Template::Literal(other.clone())),
        }
    }

    /// Render against the working document
    pub fn render(&self, document: &Value) -> Result<Value, EvalError> {
        match self {
            Template::Literal(value) => Ok(value.clone()),
            Template::Expr(expr) => expr.evaluate(document),
            Template::Object(entries) => {
                let mut map = Map::new();
                for (key, template) in entries {
                    map.insert(key.clone(), template.render(document)?);
                }
                Ok(Value::Object(map))
            }
            Template::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|item| item.render(document))
                    .collect::<Result<_, _>>()?,
            )),
        }
    }
}

fn has_dynamic_keys(value: &Value) -> bool {
    match value {
        Value::Object(map) => map
            .iter()
            .any(|(key, entry)| key.ends_with(DYNAMIC_SUFFIX) || has_dynamic_keys(entry)),
        Value::Array(items) => items.iter().any(has_dynamic_keys),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_container_overrides() {
        let template = Template::compile(&json!({
            "command.$": "$.ping.args",
            "env": {"TARGET.$": "$.ping.host", "MODE": "fast"},
            "static": [1, 2]
        }))
        .unwrap();

        let doc = json!({"ping": {"args": ["-c", "10"], "host": "example.com"}});
        assert_eq!(
            template.render(&doc).unwrap(),
            json!({
                "command": ["-c", "10"],
                "env": {"TARGET": "example.com", "MODE": "fast"},
                "static": [1, 2]
            })
        );
    }

    #[test]
    fn test_literal_template_is_untouched() {
        let value = json!({"a": "$.not_a_path"});
        assert_eq!(Template::compile(&value).unwrap(), Template::Literal(value));
    }

    #[test]
    fn test_dynamic_key_requires_string() {
        assert!(Template::compile(&json!({"n.$": 5})).is_err());
    }
}
