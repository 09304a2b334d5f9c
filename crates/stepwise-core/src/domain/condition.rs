//! Declarative boolean conditions over a flow's context
//!
//! Conditions are JMESPath expressions evaluated against the context
//! rendered as a JSON object. The result's JMESPath truthiness is the
//! boolean, so keys that are absent evaluate to `null` and hence `false`.

use crate::types::FlowContext;
use crate::CoreError;
use serde::{Deserialize, Serialize};

/// Expression language understood by [`JmesPathConditionEvaluator`]
pub const JMESPATH: &str = "jmespath";

fn default_language() -> String {
    JMESPATH.to_string()
}

/// Condition expression attached to a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionExpression {
    /// The condition expression
    pub expression: String,

    /// The language of the expression
    #[serde(default = "default_language")]
    pub language: String,

    /// Context keys that must be present; evaluation fails otherwise
    #[serde(default)]
    pub requires: Vec<String>,
}

impl ConditionExpression {
    /// A JMESPath condition
    pub fn jmespath(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            language: default_language(),
            requires: Vec::new(),
        }
    }

    /// Require a context key
    pub fn requiring(mut self, key: impl Into<String>) -> Self {
        self.requires.push(key.into());
        self
    }

    /// Check the language and compile the expression
    pub fn validate(&self) -> Result<(), CoreError> {
        match self.language.as_str() {
            JMESPATH => jmespath::compile(&self.expression).map(|_| ()).map_err(|e| {
                CoreError::ValidationError(format!(
                    "Invalid condition expression {:?}: {}",
                    self.expression, e
                ))
            }),
            other => Err(CoreError::ValidationError(format!(
                "Unsupported condition language: {}",
                other
            ))),
        }
    }
}

/// Evaluates a condition against a flow context
///
/// Implementations must be pure: identical context and expression always
/// yield the same boolean.
pub trait ConditionEvaluator: Send + Sync {
    /// Evaluate the condition
    fn evaluate(
        &self,
        condition: &ConditionExpression,
        context: &FlowContext,
    ) -> Result<bool, CoreError>;
}

/// Default condition evaluator using JMESPath
#[derive(Debug, Clone, Copy, Default)]
pub struct JmesPathConditionEvaluator;

impl ConditionEvaluator for JmesPathConditionEvaluator {
    fn evaluate(
        &self,
        condition: &ConditionExpression,
        context: &FlowContext,
    ) -> Result<bool, CoreError> {
        if condition.language != JMESPATH {
            return Err(CoreError::ValidationError(format!(
                "Unsupported condition language: {}",
                condition.language
            )));
        }

        if let Some(missing) = condition
            .requires
            .iter()
            .find(|key| !context.contains_key(key))
        {
            return Err(CoreError::ValidationError(format!(
                "Condition {:?} requires missing context key: {}",
                condition.expression, missing
            )));
        }

        let compiled = jmespath::compile(&condition.expression).map_err(|e| {
            CoreError::ValidationError(format!(
                "Failed to compile JMESPath expression: {}: {}",
                condition.expression, e
            ))
        })?;

        let result = compiled.search(context.to_value()).map_err(|e| {
            CoreError::ValidationError(format!(
                "Failed to evaluate JMESPath expression: {}: {}",
                condition.expression, e
            ))
        })?;

        Ok(result.is_truthy())
    }
}
