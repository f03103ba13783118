use crate::errors::BigmlerError;
use crate::logging::append_run_log;
use crate::types::{Stage, StageState};
use serde_json::json;
use std::collections::BTreeMap;

/// Per-run progress through the fixed stage sequence.
///
/// `resume` starts as the invocation's `--resume` flag and drops to false
/// the first time a stage finds no checkpoint: nothing later in the run can
/// have been created by the interrupted attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineCursor {
    states: BTreeMap<Stage, StageState>,
    resume: bool,
    failure_reason: Option<String>,
}

impl PipelineCursor {
    pub fn new(resume: bool) -> Self {
        Self {
            states: Stage::ALL
                .iter()
                .map(|stage| (*stage, StageState::NotStarted))
                .collect(),
            resume,
            failure_reason: None,
        }
    }

    pub fn state(&self, stage: Stage) -> StageState {
        self.states
            .get(&stage)
            .copied()
            .unwrap_or(StageState::NotStarted)
    }

    pub fn resuming(&self) -> bool {
        self.resume
    }

    pub fn checkpoint_missing(&mut self) {
        if self.resume {
            append_run_log("info", "resume.ended", json!({}));
        }
        self.resume = false;
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn transition(&mut self, stage: Stage, next: StageState) -> Result<(), BigmlerError> {
        let current = self.state(stage);
        validate_transition(current, next, self.resume)?;
        append_run_log(
            "debug",
            "stage.transition",
            json!({"stage": stage.as_str(), "from": current.as_str(), "to": next.as_str()}),
        );
        self.states.insert(stage, next);
        Ok(())
    }

    /// Runs `body` as `stage`, recording completion or failure.
    pub fn run<T>(
        &mut self,
        stage: Stage,
        body: impl FnOnce(&mut Self) -> Result<T, BigmlerError>,
    ) -> Result<T, BigmlerError> {
        if self.state(stage) == StageState::Completed {
            return Err(BigmlerError::InvalidConfig(format!(
                "stage {} already completed",
                stage.as_str()
            )));
        }
        if self.state(stage) == StageState::NotStarted || self.state(stage) == StageState::Failed {
            self.transition(stage, StageState::InProgress)?;
        }
        match body(self) {
            Ok(value) => {
                self.transition(stage, StageState::Completed)?;
                Ok(value)
            }
            Err(error) => {
                self.failure_reason = Some(format!("{}: {error}", stage.as_str()));
                self.transition(stage, StageState::Failed)?;
                Err(error)
            }
        }
    }
}

pub fn validate_transition(
    from: StageState,
    to: StageState,
    resume: bool,
) -> Result<(), BigmlerError> {
    use StageState as S;

    let allowed = match from {
        S::NotStarted => matches!(to, S::InProgress),
        S::InProgress => matches!(to, S::Completed | S::Failed),
        S::Failed => resume && matches!(to, S::InProgress),
        S::Completed => false,
    };

    if !allowed {
        return Err(BigmlerError::InvalidConfig(format!(
            "illegal stage transition: {:?} -> {:?}",
            from, to
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_stage_completes() {
        let mut cursor = PipelineCursor::new(false);
        let value = cursor.run(Stage::Source, |_| Ok(7)).expect("run");
        assert_eq!(value, 7);
        assert_eq!(cursor.state(Stage::Source), StageState::Completed);
        assert_eq!(cursor.state(Stage::Dataset), StageState::NotStarted);
    }

    #[test]
    fn failing_stage_is_marked_failed_and_reason_kept() {
        let mut cursor = PipelineCursor::new(false);
        let err = cursor
            .run::<()>(Stage::Model, |_| Err(BigmlerError::Api("boom".to_string())))
            .expect_err("fails");
        assert!(matches!(err, BigmlerError::Api(_)));
        assert_eq!(cursor.state(Stage::Model), StageState::Failed);
        assert!(cursor.failure_reason().unwrap_or_default().contains("boom"));
    }

    #[test]
    fn failed_stage_is_retried_only_under_resume() {
        assert!(validate_transition(StageState::Failed, StageState::InProgress, true).is_ok());
        let err = validate_transition(StageState::Failed, StageState::InProgress, false)
            .expect_err("must reject");
        assert!(matches!(
            err,
            BigmlerError::InvalidConfig(message) if message.contains("illegal stage transition")
        ));
    }

    #[test]
    fn completed_stage_cannot_run_again() {
        let mut cursor = PipelineCursor::new(true);
        cursor.run(Stage::Dataset, |_| Ok(())).expect("run");
        assert!(cursor.run(Stage::Dataset, |_| Ok(())).is_err());
        assert!(validate_transition(StageState::NotStarted, StageState::Completed, true).is_err());
    }

    #[test]
    fn resume_ends_at_first_missing_checkpoint() {
        let mut cursor = PipelineCursor::new(true);
        assert!(cursor.resuming());
        cursor.checkpoint_missing();
        assert!(!cursor.resuming());
        let mut fresh = PipelineCursor::new(false);
        fresh.checkpoint_missing();
        assert!(!fresh.resuming());
    }
}
