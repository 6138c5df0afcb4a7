//! Pipeline states and the transitions allowed between them.

use serde::Serialize;
use std::fmt;

/// A processing stage, used to attribute failures and timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Retrieval,
    Generation,
    Validation,
    Execution,
    Summarization,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Retrieval => "retrieval",
            Stage::Generation => "generation",
            Stage::Validation => "validation",
            Stage::Execution => "execution",
            Stage::Summarization => "summarization",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    Received,
    Retrieving,
    Generating,
    Validating,
    Executing,
    Summarizing,
    Completed,
    Failed { stage: Stage, reason: String },
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed { .. })
    }

    /// Stage that runs while in this state.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineState::Retrieving => Some(Stage::Retrieval),
            PipelineState::Generating => Some(Stage::Generation),
            PipelineState::Validating => Some(Stage::Validation),
            PipelineState::Executing => Some(Stage::Execution),
            PipelineState::Summarizing => Some(Stage::Summarization),
            _ => None,
        }
    }

    /// Forward edges, the validation-to-generation edge, generation retrying
    /// in place, and failure from any non-terminal state. Caller-supplied SQL
    /// enters at validation.
    pub fn can_transition(&self, next: &PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (s, _) if s.is_terminal() => false,
            (_, Failed { .. }) => true,
            (Received, Retrieving)
            // caller-supplied SQL
            | (Received, Validating)
            | (Retrieving, Generating)
            | (Generating, Generating)
            | (Generating, Validating)
            | (Validating, Generating)
            | (Validating, Executing)
            | (Executing, Summarizing)
            | (Summarizing, Completed) => true,
            _ => false,
        }
    }
}

/// Ordered record of the states one request went through.
#[derive(Debug, Clone, Serialize)]
pub struct StateTrace {
    states: Vec<PipelineState>,
}

impl StateTrace {
    pub fn new() -> Self {
        Self {
            states: vec![PipelineState::Received],
        }
    }

    pub fn current(&self) -> &PipelineState {
        // never empty: starts at Received
        &self.states[self.states.len() - 1]
    }

    /// Move to `next`. Returns false, leaving the trace unchanged, when the
    /// transition is not allowed.
    pub fn advance(&mut self, next: PipelineState) -> bool {
        if !self.current().can_transition(&next) {
            return false;
        }
        self.states.push(next);
        true
    }

    /// Times the generation stage was entered.
    pub fn generations(&self) -> usize {
        self.states
            .iter()
            .filter(|s| **s == PipelineState::Generating)
            .count()
    }

    pub fn states(&self) -> &[PipelineState] {
        &self.states
    }

    pub fn into_states(self) -> Vec<PipelineState> {
        self.states
    }
}

impl Default for StateTrace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_path() {
        let mut trace = StateTrace::new();
        for next in [
            PipelineState::Retrieving,
            PipelineState::Generating,
            PipelineState::Validating,
            PipelineState::Generating,
            PipelineState::Validating,
            PipelineState::Executing,
            PipelineState::Summarizing,
            PipelineState::Completed,
        ] {
            assert!(trace.advance(next));
        }
        assert_eq!(trace.generations(), 2);
        assert!(trace.current().is_terminal());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut trace = StateTrace::new();
        assert!(!trace.advance(PipelineState::Executing));
        assert!(trace.advance(PipelineState::Retrieving));
        assert!(!trace.advance(PipelineState::Received));
        assert!(trace.advance(PipelineState::Failed {
            stage: Stage::Retrieval,
            reason: "down".to_string(),
        }));
        assert!(!trace.advance(PipelineState::Generating));
        assert_eq!(trace.states().len(), 3);
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::Execution.to_string(), "execution");
        assert_eq!(PipelineState::Summarizing.stage(), Some(Stage::Summarization));
    }
}
