//! Shared fixtures for the crate-level integration tests.
//!
//! These tests wire the real engine pieces (executor, hook, cache, handle
//! table) together against a `mockito` server standing in for the object
//! store's REST endpoint, the same way `executor.rs`'s own unit tests drive
//! a single transaction — just composed across components instead of one at
//! a time. They exercise C1-C4 directly rather than through the FUSE
//! `Filesystem` trait, since `fuser::Request` has no public test constructor
//! and C5 is a thin translation layer over the same calls.

#![allow(dead_code)]

use s3fs_fuse::hook::Hook;
use s3fs_fuse::hooks::S3Hook;
use std::sync::Arc;
use std::time::Duration;

pub const TEST_BUCKET: &str = "test-bucket";

/// A default-keyed `S3Hook` pointed at `TEST_BUCKET`, identical to the one
/// `main.rs` would build from a resolved `Config`.
pub fn test_hook() -> Arc<dyn Hook> {
    Arc::new(S3Hook::new("AKIDEXAMPLE", "secretkey", "us-east-1", TEST_BUCKET))
}

/// The path prefix every mock path needs, now that the hook inserts the
/// bucket segment via `adjust_url`.
pub fn bucket_path(key: &str) -> String {
    format!("/{TEST_BUCKET}/{key}")
}

pub const SHORT_TIMEOUT: Duration = Duration::from_secs(5);
