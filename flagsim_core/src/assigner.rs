//! Variation assignment - classifying evaluations as control or treatment.
//!
//! The platform shows several conventions for what "control" means: boolean
//! flags treat the `false` variation as control, while experiment flags mark
//! an explicit baseline variation. Resolution is therefore pluggable per
//! flag type rather than assuming one convention.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The population an evaluation is classified into, relative to the
/// baseline variation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Group {
    Control,
    Treatment,
}

impl Group {
    /// Lowercase label used in logs and status payloads.
    pub fn label(&self) -> &'static str {
        match self {
            Group::Control => "control",
            Group::Treatment => "treatment",
        }
    }
}

/// How the baseline ("control") variation is determined for a flag.
///
/// Resolved once at `start`; if the platform cannot supply a baseline for an
/// experiment flag, `start` fails with a resolution error instead of
/// guessing.
#[derive(Debug, Clone, PartialEq)]
pub enum BaselineRule {
    /// Boolean-flag convention: the `false` variation is control.
    BooleanFalse,

    /// Experiment convention: the variation marked as baseline in the
    /// experiment's current configuration is control.
    Experiment { baseline: Value },
}

impl BaselineRule {
    /// Classifies an evaluated variation value against this rule.
    ///
    /// Works for variation sets of any size and any index ordering; only
    /// value equality with the baseline matters.
    pub fn classify(&self, evaluated: &Value) -> Group {
        match self {
            BaselineRule::BooleanFalse => {
                if matches!(evaluated, Value::Bool(false)) {
                    Group::Control
                } else {
                    Group::Treatment
                }
            }
            BaselineRule::Experiment { baseline } => {
                if evaluated == baseline {
                    Group::Control
                } else {
                    Group::Treatment
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_boolean_convention() {
        let rule = BaselineRule::BooleanFalse;
        assert_eq!(rule.classify(&json!(false)), Group::Control);
        assert_eq!(rule.classify(&json!(true)), Group::Treatment);
        // non-boolean values under the boolean rule are not the baseline
        assert_eq!(rule.classify(&json!("variant-a")), Group::Treatment);
    }

    #[test]
    fn test_experiment_baseline_string_variations() {
        let rule = BaselineRule::Experiment {
            baseline: json!("legacy-checkout"),
        };
        assert_eq!(rule.classify(&json!("legacy-checkout")), Group::Control);
        assert_eq!(rule.classify(&json!("one-click")), Group::Treatment);
        assert_eq!(rule.classify(&json!("three-step")), Group::Treatment);
    }

    #[test]
    fn test_experiment_baseline_structured_variation() {
        let baseline = json!({"layout": "grid", "columns": 2});
        let rule = BaselineRule::Experiment {
            baseline: baseline.clone(),
        };
        assert_eq!(rule.classify(&baseline), Group::Control);
        assert_eq!(
            rule.classify(&json!({"layout": "list", "columns": 1})),
            Group::Treatment
        );
    }

    #[test]
    fn test_experiment_baseline_may_be_true() {
        // the baseline need not be the falsy variation
        let rule = BaselineRule::Experiment {
            baseline: json!(true),
        };
        assert_eq!(rule.classify(&json!(true)), Group::Control);
        assert_eq!(rule.classify(&json!(false)), Group::Treatment);
    }
}
