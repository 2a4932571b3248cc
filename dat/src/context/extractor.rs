//! Four-level context resolution.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::config::{capture, ContextConfig, ContextOnFail, RegexTarget, ValueTransform};
use crate::errors::{DatError, Diagnostic, Result};
use crate::profile::JsonPath;

/// The level that produced a context value, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionLevel {
    /// An allow-listed user override.
    UserOverride = 1,
    /// A JSONPath match in the file content.
    ContentPattern = 2,
    /// A regex match on the file name or path.
    RegexPattern = 3,
    /// The profile's static default.
    Default = 4,
}

/// A resolved context value and where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedValue {
    /// The value.
    pub value: Value,
    /// The producing level.
    pub level: ResolutionLevel,
}

/// The resolved context of one file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionContext {
    /// Workspace-relative file path.
    pub file: String,
    /// Resolved values by key. Keys with no match and no default are absent.
    pub values: BTreeMap<String, ResolvedValue>,
    /// Pattern failures recorded under the `warn` policy.
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

impl ExtractionContext {
    /// Returns the value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key).map(|r| &r.value)
    }

    /// Returns the level that produced `key`.
    #[must_use]
    pub fn level(&self, key: &str) -> Option<ResolutionLevel> {
        self.values.get(key).map(|r| r.level)
    }

    /// Returns the values as a flat JSON object.
    #[must_use]
    pub fn to_map(&self) -> Map<String, Value> {
        self.values
            .iter()
            .map(|(k, r)| (k.clone(), r.value.clone()))
            .collect()
    }

    /// Returns the number of resolved keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing was resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone)]
struct CompiledContent {
    path: JsonPath,
    transform: Option<ValueTransform>,
    on_fail: ContextOnFail,
}

#[derive(Debug, Clone)]
struct CompiledRegex {
    pattern: Regex,
    target: RegexTarget,
    group: Option<usize>,
    transform: Option<ValueTransform>,
    on_fail: ContextOnFail,
}

#[derive(Debug, Clone)]
struct CompiledKey {
    key: String,
    default: Option<Value>,
    content: Vec<CompiledContent>,
    regex: Vec<CompiledRegex>,
}

enum Attempt {
    Matched(Value),
    NoMatch,
    Failed(String, ContextOnFail),
}

/// Resolves context keys for files using a profile's context definitions.
///
/// Patterns are compiled once; [`ContextExtractor::extract`] is then cheap
/// to call per file.
#[derive(Debug, Clone)]
pub struct ContextExtractor {
    profile: String,
    keys: Vec<CompiledKey>,
    allowed: Vec<String>,
}

impl ContextExtractor {
    /// Compiles a context config.
    ///
    /// Patterns within a level are ordered by descending priority, ties in
    /// declaration order.
    ///
    /// # Errors
    ///
    /// Returns an error if a JSONPath or regex fails to compile.
    pub fn new(profile: impl Into<String>, config: &ContextConfig) -> Result<Self> {
        let mut keys = Vec::with_capacity(config.keys.len());
        for def in &config.keys {
            let mut content: Vec<(i32, CompiledContent)> = def
                .content_patterns
                .iter()
                .map(|p| {
                    Ok((
                        p.priority,
                        CompiledContent {
                            path: JsonPath::parse(&p.path)?,
                            transform: p.transform.clone(),
                            on_fail: p.on_fail,
                        },
                    ))
                })
                .collect::<Result<_>>()?;
            content.sort_by(|a, b| b.0.cmp(&a.0));

            let mut regex: Vec<(i32, CompiledRegex)> = def
                .regex_patterns
                .iter()
                .map(|p| {
                    Ok((
                        p.priority,
                        CompiledRegex {
                            pattern: Regex::new(&p.pattern)?,
                            target: p.target,
                            group: p.group,
                            transform: p.transform.clone(),
                            on_fail: p.on_fail,
                        },
                    ))
                })
                .collect::<Result<_>>()?;
            regex.sort_by(|a, b| b.0.cmp(&a.0));

            keys.push(CompiledKey {
                key: def.key.clone(),
                default: def.default.clone(),
                content: content.into_iter().map(|(_, c)| c).collect(),
                regex: regex.into_iter().map(|(_, r)| r).collect(),
            });
        }
        Ok(Self {
            profile: profile.into(),
            keys,
            allowed: config.allowed_overrides.clone(),
        })
    }

    /// Rejects overrides for keys outside the allow-list.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::OverrideRejected`] for the first rejected key.
    pub fn check_overrides(&self, overrides: &BTreeMap<String, Value>) -> Result<()> {
        match overrides.keys().find(|k| !self.allowed.contains(k)) {
            Some(key) => Err(DatError::OverrideRejected {
                key: key.clone(),
                profile: self.profile.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Resolves every declared key for one file.
    ///
    /// `content` is the parsed document (or a bounded sample of it); `None`
    /// means the content is unavailable and every content pattern fails.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::OverrideRejected`] for a non-allow-listed
    /// override, or [`DatError::Context`] when a pattern fails under the
    /// `error` policy.
    pub fn extract(
        &self,
        file: &str,
        content: Option<&Value>,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<ExtractionContext> {
        self.check_overrides(overrides)?;
        let file_name = file.rsplit('/').next().unwrap_or(file);
        let mut ctx = ExtractionContext {
            file: file.to_string(),
            ..ExtractionContext::default()
        };

        for key in &self.keys {
            let resolved = self.resolve_key(key, file, file_name, content, overrides, &mut ctx.diagnostics)?;
            if let Some(resolved) = resolved {
                debug!(file, key = %key.key, level = ?resolved.level, "Context key resolved");
                ctx.values.insert(key.key.clone(), resolved);
            }
        }
        Ok(ctx)
    }

    /// Resolves only the static defaults, used when extraction degrades.
    #[must_use]
    pub fn defaults(&self, file: &str) -> ExtractionContext {
        let values = self
            .keys
            .iter()
            .filter_map(|k| {
                k.default.as_ref().filter(|v| !v.is_null()).map(|v| {
                    (
                        k.key.clone(),
                        ResolvedValue {
                            value: v.clone(),
                            level: ResolutionLevel::Default,
                        },
                    )
                })
            })
            .collect();
        ExtractionContext {
            file: file.to_string(),
            values,
            diagnostics: Vec::new(),
        }
    }

    fn resolve_key(
        &self,
        key: &CompiledKey,
        file: &str,
        file_name: &str,
        content: Option<&Value>,
        overrides: &BTreeMap<String, Value>,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<Option<ResolvedValue>> {
        if let Some(value) = overrides.get(&key.key) {
            return Ok(Some(ResolvedValue {
                value: value.clone(),
                level: ResolutionLevel::UserOverride,
            }));
        }

        for pattern in &key.content {
            let attempt = match content {
                None => Attempt::Failed("file content unavailable".to_string(), pattern.on_fail),
                Some(doc) => match pattern.path.select_one(doc) {
                    None | Some(Value::Null) => Attempt::NoMatch,
                    Some(found) => apply_transform(found, pattern.transform.as_ref(), pattern.on_fail),
                },
            };
            let origin = format!("content pattern '{}'", pattern.path);
            if let Some(value) = self.settle(attempt, &key.key, file, &origin, diagnostics)? {
                return Ok(Some(ResolvedValue {
                    value,
                    level: ResolutionLevel::ContentPattern,
                }));
            }
        }

        for pattern in &key.regex {
            let target = match pattern.target {
                RegexTarget::Filename => file_name,
                RegexTarget::Path => file,
            };
            let attempt = match capture(&pattern.pattern, target, pattern.group) {
                None => Attempt::NoMatch,
                Some(text) => apply_transform(&Value::String(text), pattern.transform.as_ref(), pattern.on_fail),
            };
            let origin = format!("regex pattern '{}'", pattern.pattern);
            if let Some(value) = self.settle(attempt, &key.key, file, &origin, diagnostics)? {
                return Ok(Some(ResolvedValue {
                    value,
                    level: ResolutionLevel::RegexPattern,
                }));
            }
        }

        Ok(key.default.as_ref().filter(|v| !v.is_null()).map(|v| ResolvedValue {
            value: v.clone(),
            level: ResolutionLevel::Default,
        }))
    }

    fn settle(
        &self,
        attempt: Attempt,
        key: &str,
        file: &str,
        origin: &str,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<Option<Value>> {
        match attempt {
            Attempt::Matched(value) => Ok(Some(value)),
            Attempt::NoMatch => Ok(None),
            Attempt::Failed(message, policy) => match policy {
                ContextOnFail::Skip => Ok(None),
                ContextOnFail::Warn => {
                    warn!(profile = %self.profile, file, key, "{origin} failed: {message}");
                    diagnostics.push(
                        Diagnostic::new("DAT-CONTEXT", format!("key '{key}': {origin} failed: {message}"))
                            .with_file(file),
                    );
                    Ok(None)
                }
                ContextOnFail::Error => Err(DatError::Context {
                    key: key.to_string(),
                    file: file.to_string(),
                    message: format!("{origin} failed: {message}"),
                }),
            },
        }
    }
}

fn apply_transform(found: &Value, transform: Option<&ValueTransform>, on_fail: ContextOnFail) -> Attempt {
    match transform {
        None => Attempt::Matched(found.clone()),
        Some(t) => match t.apply(found) {
            Ok(v) => Attempt::Matched(v),
            Err(message) => Attempt::Failed(message, on_fail),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> ContextConfig {
        serde_json::from_value(json!({
            "keys": [
                {
                    "key": "lot",
                    "default": "DEFAULT",
                    "content_patterns": [
                        {"path": "$.meta.lot_low", "priority": 1},
                        {"path": "$.meta.lot", "transform": {"type": "upper"}, "priority": 9}
                    ],
                    "regex_patterns": [{"pattern": "lot_([a-z0-9]+)", "transform": {"type": "upper"}}]
                },
                {"key": "tool", "regex_patterns": [{"pattern": "tool-(\\d+)", "transform": {"type": "to_int"}}]},
                {"key": "site", "content_patterns": [{"path": "$.meta.site", "transform": {"type": "to_int"}, "on_fail": "error"}]},
                {"key": "absent"}
            ],
            "allowed_overrides": ["lot"]
        }))
        .unwrap()
    }

    fn overrides(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[test]
    fn test_priority_chain_falls_through_each_level() {
        let extractor = ContextExtractor::new("p", &config()).unwrap();
        let file = "runs/lot_ab12_tool-7.json";
        let doc = json!({"meta": {"lot": "c3", "lot_low": "low"}});

        let ctx = extractor.extract(file, Some(&doc), &overrides(&[("lot", json!("USER"))])).unwrap();
        assert_eq!(ctx.get("lot"), Some(&json!("USER")));
        assert_eq!(ctx.level("lot"), Some(ResolutionLevel::UserOverride));

        let ctx = extractor.extract(file, Some(&doc), &BTreeMap::new()).unwrap();
        assert_eq!(ctx.get("lot"), Some(&json!("C3")));
        assert_eq!(ctx.level("lot"), Some(ResolutionLevel::ContentPattern));

        let ctx = extractor.extract(file, Some(&json!({})), &BTreeMap::new()).unwrap();
        assert_eq!(ctx.get("lot"), Some(&json!("AB12")));
        assert_eq!(ctx.level("lot"), Some(ResolutionLevel::RegexPattern));
        assert_eq!(ctx.get("tool"), Some(&json!(7)));

        let ctx = extractor.extract("other.json", Some(&json!({})), &BTreeMap::new()).unwrap();
        assert_eq!(ctx.get("lot"), Some(&json!("DEFAULT")));
        assert_eq!(ctx.level("lot"), Some(ResolutionLevel::Default));
        assert_eq!(ctx.get("absent"), None);
    }

    #[test]
    fn test_override_outside_allow_list_rejected() {
        let extractor = ContextExtractor::new("p", &config()).unwrap();
        let err = extractor
            .extract("a.json", None, &overrides(&[("tool", json!(3))]))
            .unwrap_err();
        assert!(matches!(err, DatError::OverrideRejected { ref key, .. } if key == "tool"));
    }

    #[test]
    fn test_on_fail_policies() {
        let extractor = ContextExtractor::new("p", &config()).unwrap();

        let err = extractor
            .extract("a.json", Some(&json!({"meta": {"site": "north"}})), &BTreeMap::new())
            .unwrap_err();
        assert_eq!(err.code(), "DAT-CONTEXT");

        // Missing content fails the "lot" patterns under warn and the "site" pattern under error.
        let err = extractor.extract("a.json", None, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, DatError::Context { ref key, .. } if key == "site"));

        let ctx = extractor
            .extract("a.json", Some(&json!({"meta": {"lot": 5, "site": "4"}})), &BTreeMap::new())
            .unwrap();
        assert_eq!(ctx.get("site"), Some(&json!(4)));
        assert_eq!(ctx.get("lot"), Some(&json!("5")));
        assert!(ctx.diagnostics.is_empty());
    }

    #[test]
    fn test_warn_policy_records_diagnostic() {
        let config: ContextConfig = serde_json::from_value(json!({
            "keys": [{"key": "n", "default": 0, "content_patterns": [{"path": "$.n", "transform": {"type": "to_int"}}]}]
        }))
        .unwrap();
        let extractor = ContextExtractor::new("p", &config).unwrap();
        let ctx = extractor.extract("x.json", Some(&json!({"n": "abc"})), &BTreeMap::new()).unwrap();
        assert_eq!(ctx.get("n"), Some(&json!(0)));
        assert_eq!(ctx.diagnostics.len(), 1);
        assert_eq!(extractor.defaults("x.json").to_map()["n"], json!(0));
    }
}
