//! Document paths: `$`, `$.field`, `$['field name']`, `$.items[0]`

use super::EvalError;
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// One step of a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Field(String),
    Index(usize),
}

/// Parsed reference into the working document
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Path {
    segments: Vec<Segment>,
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

impl Path {
    /// The whole document
    pub fn root() -> Self {
        Self::default()
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Parse a path expression
    pub fn parse(input: &str) -> Result<Self, EvalError> {
        let source = input.trim();
        let invalid = |reason: &str| EvalError::InvalidPath {
            path: source.to_string(),
            reason: reason.to_string(),
        };

        let rest = source
            .strip_prefix('$')
            .ok_or_else(|| invalid("must start with '$'"))?;

        let mut segments = Vec::new();
        let mut i = 0;
        while i < rest.len() {
            let tail = &rest[i..];
            if let Some(after_dot) = tail.strip_prefix('.') {
                let len = after_dot
                    .find(|c: char| !is_ident_char(c))
                    .unwrap_or(after_dot.len());
                if len == 0 {
                    return Err(invalid("empty field name"));
                }
                segments.push(Segment::Field(after_dot[..len].to_string()));
                i += 1 + len;
            } else if tail.starts_with('[') {
                let close = tail.find(']').ok_or_else(|| invalid("unclosed '['"))?;
                let inner = tail[1..close].trim();
                let quoted = inner
                    .strip_prefix('\'')
                    .and_then(|s| s.strip_suffix('\''))
                    .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
                match quoted {
                    Some(name) if !name.is_empty() => segments.push(Segment::Field(name.to_string())),
                    Some(_) => return Err(invalid("empty field name")),
                    None => {
                        let index = inner
                            .parse::<usize>()
                            .map_err(|_| invalid("index must be a non-negative integer"))?;
                        segments.push(Segment::Index(index));
                    }
                }
                i += close + 1;
            } else {
                return Err(invalid("expected '.' or '['"));
            }
        }

        Ok(Self { segments })
    }

    /// Length of the longest prefix of `input` that has path shape.
    ///
    /// Used by the expression lexer; the prefix still goes through [`Path::parse`].
    pub(crate) fn scan(input: &str) -> usize {
        if !input.starts_with('$') {
            return 0;
        }
        let mut i = 1;
        loop {
            let tail = &input[i..];
            if let Some(after_dot) = tail.strip_prefix('.') {
                let len = after_dot
                    .find(|c: char| !is_ident_char(c))
                    .unwrap_or(after_dot.len());
                i += 1 + len;
            } else if tail.starts_with('[') {
                match tail.find(']') {
                    Some(close) => i += close + 1,
                    None => return input.len(),
                }
            } else {
                return i;
            }
        }
    }

    fn not_found(&self) -> EvalError {
        EvalError::PathNotFound {
            path: self.to_string(),
        }
    }

    /// Look up the value at this path
    pub fn get<'a>(&self, document: &'a Value) -> Result<&'a Value, EvalError> {
        let mut current = document;
        for segment in &self.segments {
            current = match (segment, current) {
                (Segment::Field(name), Value::Object(map)) => map.get(name),
                (Segment::Index(index), Value::Array(items)) => items.get(*index),
                _ => None,
            }
            .ok_or_else(|| self.not_found())?;
        }
        Ok(current)
    }

    /// Write `value` at this path, creating intermediate objects for missing fields.
    ///
    /// Array elements must already exist.
    pub fn set(&self, document: &mut Value, value: Value) -> Result<(), EvalError> {
        let Some((last, parents)) = self.segments.split_last() else {
            *document = value;
            return Ok(());
        };

        let mut current = document;
        for segment in parents {
            current = match segment {
                Segment::Field(name) => object_mut(current, self)?
                    .entry(name.clone())
                    .or_insert(Value::Null),
                Segment::Index(index) => current
                    .as_array_mut()
                    .and_then(|items| items.get_mut(*index))
                    .ok_or_else(|| self.not_found())?,
            };
        }

        match last {
            Segment::Field(name) => {
                object_mut(current, self)?.insert(name.clone(), value);
            }
            Segment::Index(index) => {
                let slot = current
                    .as_array_mut()
                    .and_then(|items| items.get_mut(*index))
                    .ok_or_else(|| self.not_found())?;
                *slot = value;
            }
        }
        Ok(())
    }
}

fn object_mut<'a>(value: &'a mut Value, path: &Path) -> Result<&'a mut Map<String, Value>, EvalError> {
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    value.as_object_mut().ok_or_else(|| {
        EvalError::TypeMismatch(format!("cannot write '{}' through a non-object value", path))
    })
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "$")?;
        for segment in &self.segments {
            match segment {
                Segment::Field(name) if !name.is_empty() && name.chars().all(is_ident_char) => {
                    write!(f, ".{}", name)?
                }
                Segment::Field(name) => write!(f, "['{}']", name)?,
                Segment::Index(index) => write!(f, "[{}]", index)?,
            }
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = EvalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_and_display() {
        let path = Path::parse("$.orders[2]['ship to'].city").unwrap();
        assert_eq!(path.segments().len(), 4);
        assert_eq!(path.to_string(), "$.orders[2]['ship to'].city");
        assert!(Path::parse("$").unwrap().is_root());
    }

    #[test]
    fn test_parse_rejects_malformed_paths() {
        assert!(matches!(Path::parse("count"), Err(EvalError::InvalidPath { .. })));
        assert!(matches!(Path::parse("$."), Err(EvalError::InvalidPath { .. })));
        assert!(matches!(Path::parse("$.a[x]"), Err(EvalError::InvalidPath { .. })));
        assert!(matches!(Path::parse("$.a[0"), Err(EvalError::InvalidPath { .. })));
    }

    #[test]
    fn test_get_missing_path() {
        let doc = json!({"a": {"b": [1, 2]}});
        assert_eq!(Path::parse("$.a.b[1]").unwrap().get(&doc).unwrap(), &json!(2));
        let err = Path::parse("$.a.c").unwrap().get(&doc).unwrap_err();
        assert_eq!(
            err,
            EvalError::PathNotFound {
                path: "$.a.c".to_string()
            }
        );
    }

    #[test]
    fn test_set_creates_intermediate_objects() {
        let mut doc = json!({});
        Path::parse("$.result.inner").unwrap().set(&mut doc, json!(5)).unwrap();
        assert_eq!(doc, json!({"result": {"inner": 5}}));

        Path::root().set(&mut doc, json!("replaced")).unwrap();
        assert_eq!(doc, json!("replaced"));
    }

    #[test]
    fn test_set_through_scalar_fails() {
        let mut doc = json!({"a": 1});
        let err = Path::parse("$.a.b").unwrap().set(&mut doc, json!(2)).unwrap_err();
        assert!(matches!(err, EvalError::TypeMismatch(_)));
    }

    #[test]
    fn test_scan_stops_at_operator() {
        assert_eq!(Path::scan("$.count == 0"), 7);
        assert_eq!(Path::scan("$.items[1]+2"), 10);
        assert_eq!(Path::scan("x"), 0);
    }
}
