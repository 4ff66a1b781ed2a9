use serde::Serialize;

use crate::error::{Error, Result};

/// Lifecycle of one streaming job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    Idle,
    Segmenting,
    /// Selecting keyframes for a skip-frame segment
    Preparing,
    Dispatching,
    Composing,
    Done,
    Failed,
}

impl SegmentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SegmentState::Done | SegmentState::Failed)
    }

    fn allows(self, next: SegmentState) -> bool {
        use SegmentState::*;
        match (self, next) {
            (Done | Failed, _) => false,
            (_, Failed) => true,
            (Idle, Segmenting) => true,
            (Segmenting, Preparing | Dispatching | Done) => true,
            (Preparing, Dispatching) => true,
            // A failed segment moves straight on to the next one.
            (Dispatching, Composing | Preparing | Dispatching | Done) => true,
            (Composing, Preparing | Dispatching | Done) => true,
            _ => false,
        }
    }

    /// Move to `next`, rejecting transitions the job lifecycle does not have.
    pub fn advance(&mut self, next: SegmentState) -> Result<()> {
        if !self.allows(next) {
            return Err(Error::InvalidInput(format!(
                "illegal segment transition {:?} -> {:?}",
                self, next
            )));
        }
        *self = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut state = SegmentState::Idle;
        for next in [
            SegmentState::Segmenting,
            SegmentState::Preparing,
            SegmentState::Dispatching,
            SegmentState::Composing,
            SegmentState::Dispatching,
            SegmentState::Composing,
            SegmentState::Done,
        ] {
            state.advance(next).unwrap();
        }
        assert!(state.is_terminal());
    }

    #[test]
    fn test_illegal_transitions() {
        let mut state = SegmentState::Idle;
        assert!(state.advance(SegmentState::Composing).is_err());
        assert_eq!(state, SegmentState::Idle);

        state.advance(SegmentState::Failed).unwrap();
        assert!(state.advance(SegmentState::Segmenting).is_err());
    }
}
