//! What to do with a trigger that arrives while a cycle is already running.

use serde::{Deserialize, Serialize};

/// Handling for triggers received while the bridge is not idle.  Cycles never
/// overlap under any policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RetriggerPolicy {
    /// Log and discard the extra trigger.
    Drop,
    /// Remember up to `capacity` triggers and run one cycle for each, in
    /// arrival order, once the current cycle ends.
    Queue { capacity: usize },
    /// Release the extra object immediately with a pass-through command,
    /// without consulting the queue.
    PassThrough,
}

impl Default for RetriggerPolicy {
    fn default() -> Self {
        RetriggerPolicy::Queue { capacity: 8 }
    }
}
