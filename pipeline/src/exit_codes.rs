//! Stable exit codes for `pipeline` commands.

use crate::error::ErrorKind;
use crate::run::RunOutcome;

/// The run reached `PASS` (or `init` succeeded).
pub const OK: i32 = 0;
/// The run ended `FAILED` and was rolled back.
pub const FAILED: i32 = 1;
/// Precondition, config, or guard failure.
pub const INVALID: i32 = 2;

pub fn for_outcome(outcome: &RunOutcome) -> i32 {
    if outcome.passed() {
        OK
    } else if outcome.error_kind == Some(ErrorKind::Guard) {
        INVALID
    } else {
        FAILED
    }
}
