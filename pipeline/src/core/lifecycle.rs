//! Run lifecycle state machine.
//!
//! The transition table is the only source of legal state changes. A second,
//! independently spelled copy of the graph is compared against it once at
//! startup; any drift between the two is fatal.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, PipelineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Init,
    ResearchDone,
    DesignDone,
    PlanDone,
    Implemented,
    Validating,
    Retrying,
    Pass,
    Failed,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 9] = [
        LifecycleState::Init,
        LifecycleState::ResearchDone,
        LifecycleState::DesignDone,
        LifecycleState::PlanDone,
        LifecycleState::Implemented,
        LifecycleState::Validating,
        LifecycleState::Retrying,
        LifecycleState::Pass,
        LifecycleState::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Init => "INIT",
            LifecycleState::ResearchDone => "RESEARCH_DONE",
            LifecycleState::DesignDone => "DESIGN_DONE",
            LifecycleState::PlanDone => "PLAN_DONE",
            LifecycleState::Implemented => "IMPLEMENTED",
            LifecycleState::Validating => "VALIDATING",
            LifecycleState::Retrying => "RETRYING",
            LifecycleState::Pass => "PASS",
            LifecycleState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Pass | LifecycleState::Failed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allowed targets for each source state.
pub fn allowed_targets(state: LifecycleState) -> &'static [LifecycleState] {
    use LifecycleState as S;
    match state {
        S::Init => &[S::ResearchDone],
        S::ResearchDone => &[S::DesignDone],
        S::DesignDone => &[S::PlanDone],
        S::PlanDone => &[S::Implemented],
        S::Implemented => &[S::Validating],
        S::Validating => &[S::Retrying, S::Pass, S::Failed],
        S::Retrying => &[S::Implemented],
        S::Pass | S::Failed => &[],
    }
}

/// Independently declared copy of the graph, compared against
/// [`allowed_targets`] by [`verify_transition_table`].
const DECLARED_STATES: &[&str] = &[
    "INIT",
    "RESEARCH_DONE",
    "DESIGN_DONE",
    "PLAN_DONE",
    "IMPLEMENTED",
    "VALIDATING",
    "RETRYING",
    "PASS",
    "FAILED",
];

const DECLARED_EDGES: &[(&str, &str)] = &[
    ("INIT", "RESEARCH_DONE"),
    ("RESEARCH_DONE", "DESIGN_DONE"),
    ("DESIGN_DONE", "PLAN_DONE"),
    ("PLAN_DONE", "IMPLEMENTED"),
    ("IMPLEMENTED", "VALIDATING"),
    ("VALIDATING", "RETRYING"),
    ("VALIDATING", "PASS"),
    ("VALIDATING", "FAILED"),
    ("RETRYING", "IMPLEMENTED"),
];

/// Compare the live table with the declared copy. Call once at startup.
pub fn verify_transition_table() -> Result<(), PipelineError> {
    compare_tables(DECLARED_STATES, DECLARED_EDGES)
}

fn compare_tables(declared_states: &[&str], declared_edges: &[(&str, &str)]) -> Result<(), PipelineError> {
    let live_states: BTreeSet<&str> = LifecycleState::ALL.iter().map(|s| s.as_str()).collect();
    let live_edges: BTreeSet<(&str, &str)> = LifecycleState::ALL
        .iter()
        .flat_map(|from| {
            allowed_targets(*from)
                .iter()
                .map(move |to| (from.as_str(), to.as_str()))
        })
        .collect();

    let declared_state_set: BTreeSet<&str> = declared_states.iter().copied().collect();
    let declared_edge_set: BTreeSet<(&str, &str)> = declared_edges.iter().copied().collect();

    if live_states != declared_state_set {
        let missing: Vec<_> = live_states.symmetric_difference(&declared_state_set).collect();
        return Err(PipelineError::new(
            ErrorKind::Guard,
            format!("lifecycle state sets differ: {missing:?}"),
        ));
    }
    if live_edges != declared_edge_set {
        let drift: Vec<_> = live_edges.symmetric_difference(&declared_edge_set).collect();
        return Err(PipelineError::new(
            ErrorKind::Guard,
            format!("lifecycle transition sets differ: {drift:?}"),
        ));
    }
    Ok(())
}

/// Reject any change not present in the table.
pub fn assert_valid_transition(current: LifecycleState, next: LifecycleState) -> Result<(), PipelineError> {
    if allowed_targets(current).contains(&next) {
        return Ok(());
    }
    Err(PipelineError::new(
        ErrorKind::Guard,
        format!("illegal lifecycle transition {current} -> {next}"),
    ))
}

/// The live lifecycle of one run. The guard and the mutation happen in the
/// same call so nothing can observe or change state between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    state: LifecycleState,
    history: Vec<LifecycleState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: LifecycleState::Init,
            history: vec![LifecycleState::Init],
        }
    }
}

impl Lifecycle {
    pub fn current(&self) -> LifecycleState {
        self.state
    }

    /// Every state this lifecycle has held, in order.
    pub fn history(&self) -> &[LifecycleState] {
        &self.history
    }

    pub fn advance(&mut self, next: LifecycleState) -> Result<(), PipelineError> {
        assert_valid_transition(self.state, next)?;
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Assert the current state is one of `expected`.
    pub fn expect_one_of(&self, expected: &[LifecycleState]) -> Result<(), PipelineError> {
        if expected.contains(&self.state) {
            return Ok(());
        }
        let names: Vec<&str> = expected.iter().map(|s| s.as_str()).collect();
        Err(PipelineError::new(
            ErrorKind::Guard,
            format!("expected lifecycle in {names:?}, found {}", self.state),
        ))
    }

    /// Move to `FAILED` for an unrecoverable error outside the validation
    /// round. From `VALIDATING` this is the ordinary table edge.
    ///
    /// From every other non-terminal state this is the one sanctioned bypass
    /// of [`assert_valid_transition`]: the table has no `X -> FAILED` edge for
    /// those states, and a run that fails during research, planning or apply
    /// must still end `FAILED` and be rolled back. Terminal states never move.
    pub fn abort(&mut self) -> Result<(), PipelineError> {
        if self.state.is_terminal() {
            return Err(PipelineError::new(
                ErrorKind::Guard,
                format!("cannot abort from terminal state {}", self.state),
            ));
        }
        if self.state == LifecycleState::Validating {
            return self.advance(LifecycleState::Failed);
        }
        self.state = LifecycleState::Failed;
        self.history.push(LifecycleState::Failed);
        Ok(())
    }
}
