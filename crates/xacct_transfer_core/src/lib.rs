//! Shared cross-account transfer domain primitives.
//!
//! This crate owns the deterministic parts of the pipeline: the manifest and
//! report contracts, the error taxonomy, key mapping, multipart planning,
//! backoff computation and validation sampling. It intentionally excludes AWS
//! SDK, Lambda runtime and async executor concerns.

pub mod backoff;
pub mod contract;
pub mod error;
pub mod multipart;
pub mod sampling;
pub mod storage_keys;
