//! Stable exit codes for `meta run`.

use pipeline::error::{ErrorKind, kind_of};

use crate::state::MetaRunStatus;

pub const PASS: i32 = 0;
pub const FAILED: i32 = 1;
/// Bad arguments, config, or preconditions.
pub const INVALID: i32 = 2;
pub const STALLED: i32 = 3;
pub const SELF_HEAL_EXHAUSTED: i32 = 4;
pub const RESUME_INCONSISTENCY: i32 = 5;

pub fn for_status(status: MetaRunStatus) -> i32 {
    match status {
        MetaRunStatus::Pass => PASS,
        MetaRunStatus::Stalled => STALLED,
        MetaRunStatus::MaxSelfHealAttemptsReached => SELF_HEAL_EXHAUSTED,
        MetaRunStatus::Failed | MetaRunStatus::Running => FAILED,
    }
}

pub fn for_error(err: &anyhow::Error) -> i32 {
    match kind_of(err) {
        Some(ErrorKind::ResumeInconsistency) => RESUME_INCONSISTENCY,
        Some(ErrorKind::SelfHealStalled) => STALLED,
        Some(ErrorKind::SelfHealExhausted) => SELF_HEAL_EXHAUSTED,
        Some(ErrorKind::Collaborator | ErrorKind::Workspace) => FAILED,
        _ => INVALID,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::error::PipelineError;

    #[test]
    fn statuses_map_to_distinct_codes() {
        assert_eq!(for_status(MetaRunStatus::Pass), 0);
        assert_eq!(for_status(MetaRunStatus::Failed), 1);
        assert_eq!(for_status(MetaRunStatus::Stalled), 3);
        assert_eq!(for_status(MetaRunStatus::MaxSelfHealAttemptsReached), 4);
    }

    #[test]
    fn errors_map_by_kind() {
        let inconsistent: anyhow::Error =
            PipelineError::new(ErrorKind::ResumeInconsistency, "ids differ").into();
        assert_eq!(for_error(&inconsistent), RESUME_INCONSISTENCY);
        assert_eq!(for_error(&anyhow::anyhow!("task must not be empty")), INVALID);
    }
}
