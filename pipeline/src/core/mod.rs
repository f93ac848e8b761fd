//! Deterministic, pure logic shared by the pipeline.
//!
//! Core modules must be free of process and filesystem side effects. They
//! operate on in-memory data (diff text, file contents, scan inputs) and return
//! deterministic outputs suitable for tests. Storage reaches the diff engine
//! only through the [`apply::FileStore`] trait.

pub mod apply;
pub mod contract;
pub mod diagnostics;
pub mod diff;
pub mod lifecycle;
pub mod policy;
pub mod scan;
