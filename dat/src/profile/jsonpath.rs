//! A compact JSONPath subset.
//!
//! Supported syntax: `$` or `@` root, `.key`, `['key']`, `[n]` (negative
//! indexes count from the end), `[*]`, `.*` and recursive `..key`. A path
//! without a root marker is read as relative to the root.

use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::errors::{DatError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Child(String),
    Index(i64),
    Wildcard,
    Descendant(String),
}

/// A parsed JSONPath.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    source: String,
    segments: Vec<Segment>,
}

impl JsonPath {
    /// Parses a path.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::JsonPath`] on malformed syntax.
    pub fn parse(source: &str) -> Result<Self> {
        let fail = |message: &str| DatError::JsonPath {
            path: source.to_string(),
            message: message.to_string(),
        };
        let chars: Vec<char> = source.trim().chars().collect();
        let mut segments = Vec::new();
        let mut i = 0;

        if matches!(chars.first(), Some('$' | '@')) {
            i = 1;
        } else if !chars.is_empty() && chars[0] != '.' && chars[0] != '[' {
            let (name, next) = read_name(&chars, 0);
            segments.push(Segment::Child(name));
            i = next;
        }

        while i < chars.len() {
            match chars[i] {
                '.' if chars.get(i + 1) == Some(&'.') => {
                    let (name, next) = read_name(&chars, i + 2);
                    if name.is_empty() {
                        return Err(fail("expected a key after '..'"));
                    }
                    segments.push(Segment::Descendant(name));
                    i = next;
                }
                '.' => {
                    let (name, next) = read_name(&chars, i + 1);
                    if name.is_empty() {
                        return Err(fail("expected a key after '.'"));
                    }
                    segments.push(if name == "*" {
                        Segment::Wildcard
                    } else {
                        Segment::Child(name)
                    });
                    i = next;
                }
                '[' => {
                    let close = chars[i..]
                        .iter()
                        .position(|c| *c == ']')
                        .map(|p| p + i)
                        .ok_or_else(|| fail("unclosed '['"))?;
                    let inner: String = chars[i + 1..close].iter().collect();
                    let inner = inner.trim();
                    let segment = if inner == "*" {
                        Segment::Wildcard
                    } else if let Some(quoted) = strip_quotes(inner) {
                        Segment::Child(quoted.to_string())
                    } else {
                        Segment::Index(
                            inner
                                .parse::<i64>()
                                .map_err(|_| fail("bracket must hold an index, '*' or a quoted key"))?,
                        )
                    };
                    segments.push(segment);
                    i = close + 1;
                }
                other => return Err(fail(&format!("unexpected character '{other}'"))),
            }
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Returns the path source text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns true if the path addresses the root itself.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns every value the path matches, in document order.
    #[must_use]
    pub fn select<'a>(&self, root: &'a Value) -> Vec<&'a Value> {
        let mut current = vec![root];
        for segment in &self.segments {
            let mut next = Vec::new();
            for value in current {
                match segment {
                    Segment::Child(key) => {
                        if let Some(v) = value.as_object().and_then(|m| m.get(key)) {
                            next.push(v);
                        }
                    }
                    Segment::Index(idx) => {
                        if let Some(items) = value.as_array() {
                            let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
                            let pos = if *idx < 0 { len + idx } else { *idx };
                            if let Some(v) = usize::try_from(pos).ok().and_then(|p| items.get(p)) {
                                next.push(v);
                            }
                        }
                    }
                    Segment::Wildcard => match value {
                        Value::Array(items) => next.extend(items.iter()),
                        Value::Object(map) => next.extend(map.values()),
                        _ => {}
                    },
                    Segment::Descendant(key) => collect_descendants(value, key, &mut next),
                }
            }
            current = next;
        }
        current
    }

    /// Returns the first match, if any.
    #[must_use]
    pub fn select_one<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        self.select(root).into_iter().next()
    }
}

impl FromStr for JsonPath {
    type Err = DatError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn read_name(chars: &[char], start: usize) -> (String, usize) {
    let mut end = start;
    while end < chars.len() && chars[end] != '.' && chars[end] != '[' {
        end += 1;
    }
    (chars[start..end].iter().collect::<String>().trim().to_string(), end)
}

fn strip_quotes(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'\'' || first == b'"') && first == last {
            return Some(&text[1..text.len() - 1]);
        }
    }
    None
}

fn collect_descendants<'a>(value: &'a Value, key: &str, out: &mut Vec<&'a Value>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                if key == "*" || k == key {
                    out.push(v);
                }
                collect_descendants(v, key, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                if key == "*" {
                    out.push(item);
                }
                collect_descendants(item, key, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "run": {"lot": "L42", "tool id": "T-7"},
            "sites": [
                {"id": 1, "value": 10.5},
                {"id": 2, "value": 11.0},
                {"id": 3, "value": 9.5}
            ]
        })
    }

    #[test]
    fn test_child_and_bracket_keys() {
        let d = doc();
        assert_eq!(JsonPath::parse("$.run.lot").unwrap().select_one(&d), Some(&json!("L42")));
        assert_eq!(
            JsonPath::parse("$.run['tool id']").unwrap().select_one(&d),
            Some(&json!("T-7"))
        );
        assert_eq!(JsonPath::parse("run.lot").unwrap().select_one(&d), Some(&json!("L42")));
        assert!(JsonPath::parse("$").unwrap().is_root());
    }

    #[test]
    fn test_indexes_and_wildcards() {
        let d = doc();
        assert_eq!(
            JsonPath::parse("$.sites[-1].id").unwrap().select_one(&d),
            Some(&json!(3))
        );
        assert_eq!(JsonPath::parse("$.sites[*].value").unwrap().select(&d).len(), 3);
        assert_eq!(JsonPath::parse("@.run.*").unwrap().select(&d).len(), 2);
        assert!(JsonPath::parse("$.sites[7]").unwrap().select(&d).is_empty());
    }

    #[test]
    fn test_recursive_descent() {
        let d = doc();
        let ids = JsonPath::parse("$..id").unwrap().select(&d);
        assert_eq!(ids, vec![&json!(1), &json!(2), &json!(3)]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(JsonPath::parse("$.sites[").is_err());
        assert!(JsonPath::parse("$.sites[abc]").is_err());
        assert!(JsonPath::parse("$.").is_err());
        let err = JsonPath::parse("$..").unwrap_err();
        assert_eq!(err.code(), "DAT-JSONPATH");
    }
}
