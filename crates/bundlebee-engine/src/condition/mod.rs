//! Boolean conditions gating dependencies, descriptors and patches (`includeIf`).
use crate::{
    config::Configuration,
    manifest::{Condition, ConditionOperator, ConditionType, Conditions},
};

pub mod json;

const DEFAULT_EXPECTED_VALUE: &str = "true";

/// Evaluates [`Conditions`] against the engine [`Configuration`].
///
/// [`ConditionType::Env`] reads the environment, [`ConditionType::SystemProperty`] reads the
/// configuration properties and the active placeholder scope.
#[derive(Clone, Debug, Default)]
pub struct ConditionEvaluator {
    configuration: Configuration,
}

impl ConditionEvaluator {
    pub fn new(configuration: Configuration) -> Self {
        Self { configuration }
    }

    /// Absent conditions always pass.
    pub fn test(&self, conditions: Option<&Conditions>) -> bool {
        let Some(conditions) = conditions else {
            return true;
        };

        let mut results = conditions
            .conditions
            .iter()
            .map(|condition| self.evaluate(condition));
        match conditions.operator {
            ConditionOperator::All => results.all(|it| it),
            ConditionOperator::Any => results.any(|it| it),
        }
    }

    fn evaluate(&self, condition: &Condition) -> bool {
        let result = match condition.key.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(key) => {
                let expected = condition.value.as_deref().unwrap_or(DEFAULT_EXPECTED_VALUE);
                self.read(condition.type_, key).unwrap_or_default() == expected
            }
        };
        condition.negate != result
    }

    fn read(&self, type_: ConditionType, key: &str) -> Option<String> {
        match type_ {
            ConditionType::Env => self.configuration.env_var(key),
            ConditionType::SystemProperty => self
                .configuration
                .property(key)
                .or_else(|| crate::config::PlaceholderScope::get(key)),
        }
    }
}
