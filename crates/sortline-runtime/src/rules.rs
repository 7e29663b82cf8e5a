//! Ordered label → actuator rule table.
//!
//! Labels come from an external classifier whose vocabulary drifts
//! (`"plastic_cap_v2"`, `"Metal-Screw"`), so a rule matches when its pattern
//! occurs anywhere in the label, case-insensitively.  Rules are checked in
//! table order and the first match wins; a label that contains patterns from
//! two rules (e.g. `"metal_cap"`) therefore resolves to whichever rule is
//! listed first.  No match means pass-through.

use serde::{Deserialize, Serialize};
use sortline_types::{ActuatorCommand, SortError};

/// One substring rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRule {
    pub pattern: String,
    pub command: ActuatorCommand,
}

impl LabelRule {
    pub fn new(pattern: impl Into<String>, command: ActuatorCommand) -> Self {
        Self {
            pattern: pattern.into(),
            command,
        }
    }
}

/// A validated, ordered rule list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleTable {
    rules: Vec<LabelRule>,
}

impl RuleTable {
    /// Build a table, lower-casing every pattern.
    ///
    /// # Errors
    ///
    /// Returns [`SortError::Config`] if any pattern is empty after trimming;
    /// an empty pattern would match every label.
    pub fn new(rules: Vec<LabelRule>) -> Result<Self, SortError> {
        let rules = rules
            .into_iter()
            .enumerate()
            .map(|(index, rule)| {
                let pattern = rule.pattern.trim().to_lowercase();
                if pattern.is_empty() {
                    Err(SortError::Config(format!("rule #{} has an empty pattern", index + 1)))
                } else {
                    Ok(LabelRule::new(pattern, rule.command))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[LabelRule] {
        &self.rules
    }

    /// First rule whose pattern occurs in `label`.
    pub fn classify(&self, label: &str) -> Option<&LabelRule> {
        let label = label.to_lowercase();
        self.rules.iter().find(|rule| label.contains(&rule.pattern))
    }

    /// The command for `label`, defaulting to pass-through.
    pub fn command_for(&self, label: &str) -> ActuatorCommand {
        self.classify(label)
            .map_or(ActuatorCommand::PassThrough, |rule| rule.command)
    }
}

impl Default for RuleTable {
    /// Right-family rules precede left-family rules.
    fn default() -> Self {
        use ActuatorCommand::{RouteLeft, RouteRight};
        Self {
            rules: vec![
                LabelRule::new("direita", RouteRight),
                LabelRule::new("right", RouteRight),
                LabelRule::new("metal", RouteRight),
                LabelRule::new("screw", RouteRight),
                LabelRule::new("esquerda", RouteLeft),
                LabelRule::new("left", RouteLeft),
                LabelRule::new("plastic", RouteLeft),
                LabelRule::new("cap", RouteLeft),
            ],
        }
    }
}
