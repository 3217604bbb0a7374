use std::fmt;

use crate::error::PipelineError;

/// Orchestrator state for one processing run
///
/// `Idle -> Initializing -> Running -> Draining -> Done`, with `Failed`
/// reachable from every non-terminal state. A terminal stage goes back to
/// `Idle` when the next run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineStage {
    #[default]
    Idle,
    Initializing,
    Running,
    /// Decoder input exhausted, waiting for both queues to flush
    Draining,
    Done,
    Failed,
}

impl PipelineStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineStage::Done | PipelineStage::Failed)
    }

    pub fn can_transition_to(self, next: PipelineStage) -> bool {
        use PipelineStage::*;
        match (self, next) {
            (Idle, Initializing) | (Initializing, Running) | (Running, Draining) | (Draining, Done) => true,
            (Done | Failed, Idle) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn transition_to(&mut self, next: PipelineStage) -> Result<(), PipelineError> {
        if !self.can_transition_to(next) {
            return Err(PipelineError::InvalidStage { from: *self, to: next });
        }
        tracing::debug!("Pipeline stage {} -> {}", self, next);
        *self = next;
        Ok(())
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Idle => "idle",
            PipelineStage::Initializing => "initializing",
            PipelineStage::Running => "running",
            PipelineStage::Draining => "draining",
            PipelineStage::Done => "done",
            PipelineStage::Failed => "failed",
        };
        f.write_str(name)
    }
}
