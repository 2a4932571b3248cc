//! Declarative context key definitions.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::frame::value;

/// Policy when a content or regex pattern fails to evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextOnFail {
    /// Record a diagnostic and fall through to the next pattern.
    #[default]
    Warn,
    /// Fail resolution for the file.
    Error,
    /// Fall through silently.
    Skip,
}

/// A transform applied to a matched value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueTransform {
    /// Strip surrounding whitespace.
    Trim,
    /// Upper-case.
    Upper,
    /// Lower-case.
    Lower,
    /// Parse as an integer.
    ToInt,
    /// Parse as a float.
    ToFloat,
    /// Keep a regex capture group of the text.
    Extract {
        /// Pattern searched in the text.
        pattern: String,
        /// Capture group (1 when the pattern has groups, else the whole match).
        #[serde(default)]
        group: Option<usize>,
    },
}

impl ValueTransform {
    /// Applies the transform.
    ///
    /// # Errors
    ///
    /// Returns a message when the value cannot be transformed.
    pub fn apply(&self, input: &Value) -> Result<Value, String> {
        let text = value::to_text(input);
        match self {
            Self::Trim => Ok(Value::String(text.trim().to_string())),
            Self::Upper => Ok(Value::String(text.to_uppercase())),
            Self::Lower => Ok(Value::String(text.to_lowercase())),
            Self::ToInt => {
                #[allow(clippy::cast_possible_truncation)]
                let parsed = text
                    .trim()
                    .parse::<i64>()
                    .ok()
                    .or_else(|| value::as_f64(input).filter(|f| f.fract() == 0.0).map(|f| f as i64));
                parsed
                    .map(Value::from)
                    .ok_or_else(|| format!("'{text}' is not an integer"))
            }
            Self::ToFloat => value::as_f64(input)
                .map(value::number)
                .ok_or_else(|| format!("'{text}' is not a number")),
            Self::Extract { pattern, group } => {
                let re = Regex::new(pattern).map_err(|e| e.to_string())?;
                capture(&re, &text, *group)
                    .map(Value::String)
                    .ok_or_else(|| format!("pattern '{pattern}' did not match '{text}'"))
            }
        }
    }
}

/// Returns the requested capture group of the first match.
///
/// Without an explicit group, group 1 is used when the pattern has one and
/// the whole match otherwise.
pub(crate) fn capture(re: &Regex, text: &str, group: Option<usize>) -> Option<String> {
    let caps = re.captures(text)?;
    let idx = group.unwrap_or(usize::from(caps.len() > 1));
    caps.get(idx).map(|m| m.as_str().to_string())
}

fn default_priority() -> i32 {
    0
}

/// A JSONPath evaluated against file content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPattern {
    /// JSONPath into the document.
    pub path: String,
    /// Transform applied to the match.
    #[serde(default)]
    pub transform: Option<ValueTransform>,
    /// Failure policy.
    #[serde(default)]
    pub on_fail: ContextOnFail,
    /// Higher priorities are tried first; ties keep declaration order.
    #[serde(default = "default_priority")]
    pub priority: i32,
}

/// What a regex pattern is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegexTarget {
    /// The file name only.
    #[default]
    Filename,
    /// The workspace-relative path.
    Path,
}

/// A regular expression evaluated against the file name or path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegexPattern {
    /// The pattern.
    pub pattern: String,
    /// Match target.
    #[serde(default)]
    pub target: RegexTarget,
    /// Capture group (1 when the pattern has groups, else the whole match).
    #[serde(default)]
    pub group: Option<usize>,
    /// Transform applied to the match.
    #[serde(default)]
    pub transform: Option<ValueTransform>,
    /// Failure policy.
    #[serde(default)]
    pub on_fail: ContextOnFail,
    /// Higher priorities are tried first; ties keep declaration order.
    #[serde(default = "default_priority")]
    pub priority: i32,
}

/// One context key and its resolution sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextKeyDef {
    /// Key name.
    pub key: String,
    /// Static default.
    #[serde(default)]
    pub default: Option<Value>,
    /// Content patterns.
    #[serde(default)]
    pub content_patterns: Vec<ContentPattern>,
    /// File name/path patterns.
    #[serde(default)]
    pub regex_patterns: Vec<RegexPattern>,
}

/// The context section of a profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Declared keys.
    #[serde(default)]
    pub keys: Vec<ContextKeyDef>,
    /// Keys users may override.
    #[serde(default)]
    pub allowed_overrides: Vec<String>,
}

impl ContextConfig {
    /// Returns the key definition for `key`.
    #[must_use]
    pub fn key(&self, key: &str) -> Option<&ContextKeyDef> {
        self.keys.iter().find(|k| k.key == key)
    }

    /// Returns true if `key` may be overridden.
    #[must_use]
    pub fn allows_override(&self, key: &str) -> bool {
        self.allowed_overrides.iter().any(|k| k == key)
    }

    /// Appends structural problems.
    pub fn check(&self, errors: &mut Vec<String>) {
        let mut seen = std::collections::HashSet::new();
        for def in &self.keys {
            if !seen.insert(def.key.as_str()) {
                errors.push(format!("context: duplicate key '{}'", def.key));
            }
            for pattern in &def.content_patterns {
                if let Err(e) = crate::profile::JsonPath::parse(&pattern.path) {
                    errors.push(format!("context key '{}': {e}", def.key));
                }
                check_transform(&def.key, pattern.transform.as_ref(), errors);
            }
            for pattern in &def.regex_patterns {
                if let Err(e) = Regex::new(&pattern.pattern) {
                    errors.push(format!("context key '{}': {e}", def.key));
                }
                check_transform(&def.key, pattern.transform.as_ref(), errors);
            }
        }
        for key in &self.allowed_overrides {
            if self.key(key).is_none() {
                errors.push(format!("context: override allowed for undeclared key '{key}'"));
            }
        }
    }
}

fn check_transform(key: &str, transform: Option<&ValueTransform>, errors: &mut Vec<String>) {
    if let Some(ValueTransform::Extract { pattern, .. }) = transform {
        if let Err(e) = Regex::new(pattern) {
            errors.push(format!("context key '{key}': {e}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transforms() {
        assert_eq!(ValueTransform::Trim.apply(&json!("  L1 ")), Ok(json!("L1")));
        assert_eq!(ValueTransform::Upper.apply(&json!("ab")), Ok(json!("AB")));
        assert_eq!(ValueTransform::ToInt.apply(&json!("42")), Ok(json!(42)));
        assert_eq!(ValueTransform::ToInt.apply(&json!(7.0)), Ok(json!(7)));
        assert!(ValueTransform::ToInt.apply(&json!("4.5")).is_err());
        assert_eq!(ValueTransform::ToFloat.apply(&json!("2.5")), Ok(json!(2.5)));

        let extract = ValueTransform::Extract {
            pattern: r"LOT-(\d+)".to_string(),
            group: None,
        };
        assert_eq!(extract.apply(&json!("id LOT-0042 x")), Ok(json!("0042")));
        assert!(extract.apply(&json!("none")).is_err());
    }

    #[test]
    fn test_config_deserialize_and_check() {
        let config: ContextConfig = serde_json::from_value(json!({
            "keys": [{
                "key": "lot",
                "default": "UNKNOWN",
                "content_patterns": [{"path": "$.header.lot", "transform": {"type": "upper"}, "priority": 5}],
                "regex_patterns": [{"pattern": "lot_(\\w+)", "on_fail": "skip"}]
            }],
            "allowed_overrides": ["lot", "ghost"]
        }))
        .unwrap();
        assert!(config.allows_override("lot"));
        assert_eq!(config.keys[0].content_patterns[0].priority, 5);
        assert_eq!(config.keys[0].regex_patterns[0].target, RegexTarget::Filename);

        let mut errors = Vec::new();
        config.check(&mut errors);
        assert_eq!(errors, vec!["context: override allowed for undeclared key 'ghost'"]);
    }
}
