//! Concrete [`crate::hook::Hook`] implementations. One ships today: plain
//! S3-compatible REST (AWS SigV4, `ListObjectsV2` XML). A second dialect
//! (e.g. Swift or GCS XML compat) would live beside it as another module.

pub mod s3;

pub use s3::S3Hook;
