//! AWS runtime for the cross-account transfer pipeline.
//!
//! Ports (credential broker, object store, manifest store, notifier) live in
//! `adapters`, with their AWS implementations in `adapters::aws`. Stage logic
//! lives in `handlers` and only talks to the ports, so the whole pipeline can
//! run against the in-memory fakes in `test_support`.

pub mod adapters;
pub mod config;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod retry;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_support;
