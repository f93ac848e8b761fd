//! Autonomous patch-application pipeline.
//!
//! A run takes a task through research, design and plan reports, asks the
//! change generator for a unified diff, applies it with an in-process diff
//! engine, and validates the result. Failed attempts are rolled back through
//! git-backed workspace snapshots; a run that exhausts its retries leaves the
//! repository exactly as it found it.
//!
//! - **[`core`]**: Pure logic (diff parsing and application, lifecycle table,
//!   scans, contract maps, failure diagnostics). No I/O.
//! - **[`io`]**: Side effects (git, processes, artifacts, config).
//!
//! [`run`], [`gate`] and [`rollback`] compose the two into `pipeline run`.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod gate;
pub mod io;
pub mod logging;
pub mod rollback;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
