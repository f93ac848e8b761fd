//! Side-effecting adapters: filesystem, git, processes and collaborators.

pub mod artifacts;
pub mod atomic;
pub mod config;
pub mod contract_scan;
pub mod disk_store;
pub mod generator;
pub mod git;
pub mod init;
pub mod pattern_memory;
pub mod process;
pub mod prompt;
pub mod snapshot;
pub mod validation;
