//! Stage graph configuration: order, optional stages, gating and cascades.
//!
//! A [`StageGraphConfig`] is an immutable value injected into each
//! orchestrator. The default graph is the eight-stage DAT pipeline; tests and
//! deployments may build their own.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::core::{StageStatus, StageType};
use crate::errors::{DatError, Result};

/// Preconditions for locking a stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatingRule {
    /// Stages that must be LOCKED (or COMPLETED).
    pub required: Vec<StageType>,
    /// Require COMPLETED instead of merely LOCKED.
    #[serde(default)]
    pub require_completion: bool,
}

/// The stage graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageGraphConfig {
    order: Vec<StageType>,
    optional: BTreeSet<StageType>,
    gating: BTreeMap<StageType, GatingRule>,
    cascades: BTreeMap<StageType, Vec<StageType>>,
}

impl Default for StageGraphConfig {
    fn default() -> Self {
        use StageType::{Context, Discovery, Export, Parse, Preview, Selection, TableAvailability, TableSelection};
        Self::new(StageType::ALL.to_vec())
            .with_optional(Context)
            .with_optional(Preview)
            .with_gating(Selection, &[Discovery], false)
            .with_gating(Context, &[Selection], false)
            .with_gating(TableAvailability, &[Selection], false)
            .with_gating(TableSelection, &[TableAvailability], false)
            .with_gating(Preview, &[TableSelection], false)
            .with_gating(Parse, &[TableSelection], false)
            .with_gating(Export, &[Parse], true)
            .with_cascade(
                Discovery,
                &[Selection, Context, TableAvailability, TableSelection, Preview, Parse, Export],
            )
            .with_cascade(
                Selection,
                &[Context, TableAvailability, TableSelection, Preview, Parse, Export],
            )
            .with_cascade(TableAvailability, &[TableSelection, Preview, Parse, Export])
            .with_cascade(TableSelection, &[Preview, Parse, Export])
            .with_cascade(Parse, &[Export])
    }
}

impl StageGraphConfig {
    /// Creates a graph over `order` with no rules.
    #[must_use]
    pub fn new(order: Vec<StageType>) -> Self {
        Self {
            order,
            optional: BTreeSet::new(),
            gating: BTreeMap::new(),
            cascades: BTreeMap::new(),
        }
    }

    /// Marks a stage optional (skippable).
    #[must_use]
    pub fn with_optional(mut self, stage: StageType) -> Self {
        self.optional.insert(stage);
        self
    }

    /// Sets the gating rule of a stage.
    #[must_use]
    pub fn with_gating(mut self, stage: StageType, required: &[StageType], require_completion: bool) -> Self {
        self.gating.insert(
            stage,
            GatingRule {
                required: required.to_vec(),
                require_completion,
            },
        );
        self
    }

    /// Sets the explicit cascade targets of a stage.
    #[must_use]
    pub fn with_cascade(mut self, stage: StageType, targets: &[StageType]) -> Self {
        self.cascades.insert(stage, targets.to_vec());
        self
    }

    /// Stages in dependency order.
    #[must_use]
    pub fn order(&self) -> &[StageType] {
        &self.order
    }

    /// Returns true if `stage` is part of the graph.
    #[must_use]
    pub fn contains(&self, stage: StageType) -> bool {
        self.order.contains(&stage)
    }

    /// Returns true if `stage` may be skipped.
    #[must_use]
    pub fn is_optional(&self, stage: StageType) -> bool {
        self.optional.contains(&stage)
    }

    /// Returns the gating rule of `stage`, if any.
    #[must_use]
    pub fn gating(&self, stage: StageType) -> Option<&GatingRule> {
        self.gating.get(&stage)
    }

    /// Returns the stages unlocked together with `stage`.
    #[must_use]
    pub fn cascade_targets(&self, stage: StageType) -> &[StageType] {
        self.cascades.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns true if some gating rule requires `stage` to be COMPLETED.
    #[must_use]
    pub fn completion_required(&self, stage: StageType) -> bool {
        self.gating
            .values()
            .any(|rule| rule.require_completion && rule.required.contains(&stage))
    }

    /// Returns the first unmet dependency of `stage` given current statuses.
    #[must_use]
    pub fn unmet_dependency<F>(&self, stage: StageType, status_of: F) -> Option<StageType>
    where
        F: Fn(StageType) -> StageStatus,
    {
        let rule = self.gating.get(&stage)?;
        rule.required.iter().copied().find(|dep| {
            let status = status_of(*dep);
            if rule.require_completion {
                status != StageStatus::Completed
            } else {
                !status.is_locked_or_completed()
            }
        })
    }

    /// Checks the graph for dangling references and misordered rules.
    ///
    /// # Errors
    ///
    /// Returns [`DatError::Config`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        let position = |stage: StageType| self.order.iter().position(|s| *s == stage);
        let mut seen = BTreeSet::new();
        for stage in &self.order {
            if !seen.insert(*stage) {
                return Err(DatError::Config(format!("stage '{stage}' appears twice in the graph")));
            }
        }
        for stage in &self.optional {
            if position(*stage).is_none() {
                return Err(DatError::Config(format!("optional stage '{stage}' is not in the graph")));
            }
        }
        for (stage, rule) in &self.gating {
            let Some(at) = position(*stage) else {
                return Err(DatError::Config(format!("gated stage '{stage}' is not in the graph")));
            };
            for dep in &rule.required {
                if !position(*dep).is_some_and(|p| p < at) {
                    return Err(DatError::Config(format!(
                        "stage '{stage}' depends on '{dep}', which does not precede it"
                    )));
                }
            }
        }
        for (stage, targets) in &self.cascades {
            let Some(at) = position(*stage) else {
                return Err(DatError::Config(format!("cascading stage '{stage}' is not in the graph")));
            };
            for target in targets {
                if !position(*target).is_some_and(|p| p > at) {
                    return Err(DatError::Config(format!(
                        "stage '{stage}' cascades to '{target}', which does not follow it"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use StageType::*;

    #[test]
    fn test_default_graph_is_valid() {
        let graph = StageGraphConfig::default();
        graph.validate().unwrap();
        assert_eq!(graph.order().len(), 8);
        assert!(graph.is_optional(Context));
        assert!(graph.is_optional(Preview));
        assert!(!graph.is_optional(Parse));
        assert!(graph.completion_required(Parse));
        assert!(!graph.completion_required(TableSelection));
    }

    #[test]
    fn test_default_cascades() {
        let graph = StageGraphConfig::default();
        assert_eq!(graph.cascade_targets(Discovery).len(), 7);
        assert_eq!(
            graph.cascade_targets(Selection),
            &[Context, TableAvailability, TableSelection, Preview, Parse, Export]
        );
        assert_eq!(graph.cascade_targets(TableAvailability), &[TableSelection, Preview, Parse, Export]);
        assert_eq!(graph.cascade_targets(Parse), &[Export]);
        assert!(graph.cascade_targets(Context).is_empty());
        assert!(graph.cascade_targets(Preview).is_empty());
        assert!(graph.cascade_targets(Export).is_empty());
    }

    #[test]
    fn test_unmet_dependency() {
        let graph = StageGraphConfig::default();
        let parse_locked = |s: StageType| if s == Parse { StageStatus::Locked } else { StageStatus::Unlocked };
        assert_eq!(graph.unmet_dependency(Export, parse_locked), Some(Parse));
        assert_eq!(graph.unmet_dependency(Discovery, parse_locked), None);
        assert_eq!(graph.unmet_dependency(Selection, parse_locked), Some(Discovery));

        let parse_done = |s: StageType| if s == Parse { StageStatus::Completed } else { StageStatus::Unlocked };
        assert_eq!(graph.unmet_dependency(Export, parse_done), None);
    }

    #[test]
    fn test_validate_rejects_backward_rules() {
        let graph = StageGraphConfig::new(vec![Discovery, Selection]).with_gating(Discovery, &[Selection], false);
        assert!(graph.validate().is_err());

        let graph = StageGraphConfig::new(vec![Discovery, Selection]).with_cascade(Selection, &[Discovery]);
        assert!(graph.validate().is_err());

        let graph = StageGraphConfig::new(vec![Discovery]).with_optional(Parse);
        assert!(graph.validate().is_err());
    }
}
