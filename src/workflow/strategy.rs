//! Failure Strategies
//!
//! A failure strategy pairs a failure-type filter with an action. When a
//! state fails, the engine looks up the first strategy whose filter
//! matches, walking from the state itself outwards.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::status::FailureType;

/// What to do when a state fails.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureAction {
    /// Abort the whole workflow execution.
    AbortWorkflow,
    /// Let sibling branches finish, then fail the enclosing scope.
    FailAfterRemaining,
    /// Ignore the failure and follow the success transition.
    Continue,
    /// Re-run the state up to `attempts` more times.
    Retry {
        attempts: u32,
        /// Delay before each attempt; the last entry repeats.
        #[serde(default)]
        backoff_secs: Vec<u64>,
        /// Applied once attempts are exhausted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        then: Option<Box<FailureAction>>,
    },
    /// Run the rollback machine of the nearest enclosing phase.
    RollbackPhase,
}

impl FailureAction {
    /// Backoff before retry number `attempt` (zero based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        match self {
            Self::Retry { backoff_secs, .. } if !backoff_secs.is_empty() => {
                let idx = (attempt as usize).min(backoff_secs.len() - 1);
                Duration::from_secs(backoff_secs[idx])
            }
            _ => Duration::ZERO,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FailureStrategy {
    /// Failure types this strategy applies to; empty matches any failure.
    #[serde(default)]
    pub failure_types: Vec<FailureType>,

    #[serde(flatten)]
    pub action: FailureAction,
}

impl FailureStrategy {
    pub fn new(action: FailureAction) -> Self {
        Self {
            failure_types: Vec::new(),
            action,
        }
    }

    pub fn for_types(mut self, types: &[FailureType]) -> Self {
        self.failure_types = types.to_vec();
        self
    }

    pub fn matches(&self, failure_types: &[FailureType]) -> bool {
        self.failure_types.is_empty()
            || self.failure_types.iter().any(|t| failure_types.contains(t))
    }
}

/// Returns the first matching strategy, scanning scopes in order.
///
/// Scopes are passed innermost first: the failing state, its ancestors,
/// then the workflow-level list.
pub fn select_strategy<'a, I>(scopes: I, failure_types: &[FailureType]) -> Option<&'a FailureStrategy>
where
    I: IntoIterator<Item = &'a [FailureStrategy]>,
{
    scopes
        .into_iter()
        .flat_map(|scope| scope.iter())
        .find(|strategy| strategy.matches(failure_types))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_innermost_strategy_wins() {
        let state = vec![FailureStrategy::new(FailureAction::Continue).for_types(&[FailureType::Verification])];
        let phase = vec![FailureStrategy::new(FailureAction::RollbackPhase)];
        let workflow = vec![FailureStrategy::new(FailureAction::AbortWorkflow)];

        let selected = select_strategy(
            [state.as_slice(), phase.as_slice(), workflow.as_slice()],
            &[FailureType::Verification],
        )
        .unwrap();
        assert_eq!(selected.action, FailureAction::Continue);

        let selected = select_strategy(
            [state.as_slice(), phase.as_slice(), workflow.as_slice()],
            &[FailureType::Application],
        )
        .unwrap();
        assert_eq!(selected.action, FailureAction::RollbackPhase);
    }

    #[test]
    fn test_no_match() {
        let state = vec![FailureStrategy::new(FailureAction::Continue).for_types(&[FailureType::Timeout])];
        assert!(select_strategy([state.as_slice()], &[FailureType::Application]).is_none());
    }

    #[test]
    fn test_backoff_repeats_last_entry() {
        let action = FailureAction::Retry {
            attempts: 5,
            backoff_secs: vec![1, 5],
            then: None,
        };
        assert_eq!(action.backoff_for(0), Duration::from_secs(1));
        assert_eq!(action.backoff_for(1), Duration::from_secs(5));
        assert_eq!(action.backoff_for(4), Duration::from_secs(5));
        assert_eq!(FailureAction::Continue.backoff_for(0), Duration::ZERO);
    }

    #[test]
    fn test_strategy_yaml_shape() {
        let yaml = r#"
failure_types: [TIMEOUT]
action: RETRY
attempts: 2
backoff_secs: [10]
then:
  action: ROLLBACK_PHASE
"#;
        let strategy: FailureStrategy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(strategy.failure_types, vec![FailureType::Timeout]);
        match strategy.action {
            FailureAction::Retry { attempts, then, .. } => {
                assert_eq!(attempts, 2);
                assert_eq!(then.as_deref(), Some(&FailureAction::RollbackPhase));
            }
            other => panic!("unexpected action {:?}", other),
        }
    }
}
