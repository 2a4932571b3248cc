//! Validation engine.
//!
//! Three rule classes, each with its own `on_fail` policy:
//!
//! - schema rules, evaluated once per table;
//! - row rules, evaluated per row into a pass mask;
//! - aggregate rules, evaluated once after row-level processing.

mod engine;
mod rules;

pub use engine::{aggregate, validate, ValidationOutcome};
pub use rules::{
    AggregateRule, AggregateStat, ColumnType, OnFail, RowCheck, RowRule, SchemaCheck, SchemaRule,
    ValidationConfig,
};

use serde::{Deserialize, Serialize};

/// The class of rule a violation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleClass {
    /// Table-level schema rule.
    #[default]
    Schema,
    /// Per-row rule.
    Row,
    /// Summary-statistic rule.
    Aggregate,
}

/// A failed rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Rule identifier.
    pub rule_id: String,
    /// What failed.
    pub message: String,
    /// Rule class.
    #[serde(default)]
    pub class: RuleClass,
    /// Policy of the violated rule.
    #[serde(default)]
    pub on_fail: OnFail,
    /// Number of rows affected.
    #[serde(default)]
    pub failed_rows: usize,
}

impl Violation {
    /// Creates a violation with the default class and policy.
    #[must_use]
    pub fn new(rule_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            message: message.into(),
            class: RuleClass::default(),
            on_fail: OnFail::default(),
            failed_rows: 0,
        }
    }

    /// Sets the rule class.
    #[must_use]
    pub fn with_class(mut self, class: RuleClass) -> Self {
        self.class = class;
        self
    }

    /// Sets the policy.
    #[must_use]
    pub fn with_policy(mut self, on_fail: OnFail) -> Self {
        self.on_fail = on_fail;
        self
    }

    /// Sets the affected row count.
    #[must_use]
    pub fn with_failed_rows(mut self, failed_rows: usize) -> Self {
        self.failed_rows = failed_rows;
        self
    }
}

/// Summary of validating one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// The validated table.
    pub table_id: String,
    /// Number of rules evaluated.
    pub rules_checked: usize,
    /// Rows before validation.
    pub input_rows: usize,
    /// Rows that passed.
    pub passed_rows: usize,
    /// Rows moved to quarantine.
    pub quarantined_rows: usize,
    /// Violations under `quarantine` and `continue` policies.
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    /// Returns true if no rule failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}
