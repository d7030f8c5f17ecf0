//! Per-request lifecycle tracking

use std::fmt;

use crate::{Error, Result};

/// Where a request is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Parsing the raw input
    Validating,
    /// Choosing the transfer path
    Dispatching,
    /// Transfer in flight
    Executing,
    /// Resolved
    Succeeded,
    /// Rejected
    Failed,
}

impl Phase {
    /// Whether no further transition is allowed
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed)
    }

    /// Whether moving from `self` to `next` is a legal forward step
    pub fn can_advance_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Validating, Phase::Dispatching)
                | (Phase::Dispatching, Phase::Executing)
                | (Phase::Executing, Phase::Succeeded)
                | (Phase::Validating | Phase::Dispatching | Phase::Executing, Phase::Failed)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Validating => "validating",
            Phase::Dispatching => "dispatching",
            Phase::Executing => "executing",
            Phase::Succeeded => "succeeded",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Transfer strategy picked while dispatching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPath {
    /// Delegated to the OS download manager
    Managed,
    /// Streamed by the courier itself
    Unmanaged,
}

impl fmt::Display for TransferPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransferPath::Managed => "managed",
            TransferPath::Unmanaged => "unmanaged",
        })
    }
}

pub(crate) struct Lifecycle {
    operation: &'static str,
    task_id: Option<String>,
    phase: Phase,
}

impl Lifecycle {
    pub(crate) fn new(operation: &'static str) -> Self {
        Self {
            operation,
            task_id: None,
            phase: Phase::Validating,
        }
    }

    #[cfg(test)]
    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn validated(&mut self, task_id: &str) {
        self.task_id = Some(task_id.to_string());
        self.advance(Phase::Dispatching);
    }

    pub(crate) fn dispatch(&mut self, path: TransferPath) {
        tracing::debug!(
            "{} {}: taking the {} path",
            self.operation,
            self.task(),
            path
        );
        self.advance(Phase::Executing);
    }

    /// Record the terminal phase for `result` and pass it through
    pub(crate) fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => {
                self.advance(Phase::Succeeded);
            }
            Err(Error::Cancelled) => {
                tracing::info!("{} {} was cancelled", self.operation, self.task());
                self.advance(Phase::Failed);
            }
            Err(e) => {
                tracing::error!("{} {} failed: {} ({})", self.operation, self.task(), e, e.code());
                self.advance(Phase::Failed);
            }
        }
        result
    }

    fn advance(&mut self, next: Phase) -> bool {
        if !self.phase.can_advance_to(next) {
            tracing::warn!(
                "{} {}: refusing transition {} -> {}",
                self.operation,
                self.task(),
                self.phase,
                next
            );
            return false;
        }

        tracing::debug!("{} {}: {} -> {}", self.operation, self.task(), self.phase, next);
        self.phase = next;
        true
    }

    fn task(&self) -> &str {
        self.task_id.as_deref().unwrap_or("<unvalidated>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_only() {
        assert!(Phase::Validating.can_advance_to(Phase::Dispatching));
        assert!(Phase::Validating.can_advance_to(Phase::Failed));
        assert!(!Phase::Validating.can_advance_to(Phase::Executing));
        assert!(!Phase::Executing.can_advance_to(Phase::Dispatching));
        assert!(!Phase::Succeeded.can_advance_to(Phase::Failed));
        assert!(!Phase::Failed.can_advance_to(Phase::Succeeded));
    }

    #[test]
    fn test_full_run() {
        let mut lifecycle = Lifecycle::new("fetch");
        lifecycle.validated("t");
        lifecycle.dispatch(TransferPath::Unmanaged);
        assert_eq!(lifecycle.phase(), Phase::Executing);

        assert_eq!(lifecycle.finish(Ok(1)).unwrap(), 1);
        assert_eq!(lifecycle.phase(), Phase::Succeeded);

        // Terminal phases are final
        let _ = lifecycle.finish::<()>(Err(Error::Cancelled));
        assert_eq!(lifecycle.phase(), Phase::Succeeded);
    }

    #[test]
    fn test_validation_failure() {
        let mut lifecycle = Lifecycle::new("upload");
        let result = lifecycle.finish::<()>(Err(Error::empty("url")));
        assert!(result.is_err());
        assert_eq!(lifecycle.phase(), Phase::Failed);
        assert!(lifecycle.phase().is_terminal());
    }
}
