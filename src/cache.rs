//! The object metadata cache — path → descriptor with TTL coherence,
//! single-flight coalescing, and directory resolution.
//!
//! Positive and negative entries live in a pair of `moka::sync::Cache`s with
//! a TTL; concurrent fetches for the same path are coalesced through a
//! `DashMap` of `crossbeam_channel` leader/waiter pairs rather than each
//! caller issuing its own HEAD.

use crate::error::{FsError, FsResult};
use crate::executor::{Method, RequestExecutor};
use crate::hook::Hook;
use crossbeam_channel::{bounded, Sender};
use dashmap::mapref::entry::Entry as DashEntry;
use dashmap::DashMap;
use moka::sync::Cache;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// What kind of remote object a descriptor reflects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    File,
    Directory,
    Symlink,
}

/// A hint narrowing how [`ObjectCache::get`] resolves a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
    None,
    IsDir,
    IsFile,
}

/// In-memory reflection of a remote blob's metadata.
#[derive(Debug, Clone)]
pub struct ObjectDescriptor {
    pub path: String,
    pub kind: ObjectKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: SystemTime,
    pub size: u64,
    pub etag: Option<String>,
    pub content_type: String,
    /// Keys preserved case as written, compared case-insensitively on read.
    pub user_metadata: HashMap<String, String>,
    pub fetch_timestamp: Instant,
}

impl ObjectDescriptor {
    /// Case-insensitive lookup into `user_metadata`.
    pub fn metadata_get(&self, key: &str) -> Option<&str> {
        self.user_metadata
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// Path-strip: canonical cache keys never carry a leading slash.
pub fn canonical_path(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

enum FetchOutcome {
    Found(ObjectDescriptor),
    NotFound,
    Failed(FsError),
}

impl Clone for FetchOutcome {
    fn clone(&self) -> Self {
        match self {
            FetchOutcome::Found(d) => FetchOutcome::Found(d.clone()),
            FetchOutcome::NotFound => FetchOutcome::NotFound,
            FetchOutcome::Failed(e) => FetchOutcome::Failed(e.clone()),
        }
    }
}

/// Object metadata cache with TTL coherence and single-flight fetch
/// coalescing.
pub struct ObjectCache {
    positive: Cache<String, ObjectDescriptor>,
    /// Negative entries (confirmed 404) get a shorter TTL than positive ones
    /// so a repeatedly-probed nonexistent path doesn't re-HEAD every call
    /// Any mutation invalidates the cache before returning success, so a
    /// negative entry never outlives the write that disproved it.
    negative: Cache<String, ()>,
    /// Leader/waiter coordination for concurrent cold-path fetches. An
    /// occupied entry means a HEAD is already in flight for that path; new
    /// callers attach as waiters instead of issuing a second HEAD.
    in_flight: DashMap<String, Vec<Sender<FetchOutcome>>>,
}

impl ObjectCache {
    pub fn new(ttl: Duration, negative_ttl: Duration) -> Self {
        Self {
            positive: Cache::builder().time_to_live(ttl).build(),
            negative: Cache::builder().time_to_live(negative_ttl).build(),
            in_flight: DashMap::new(),
        }
    }

    /// Returns a fresh-enough descriptor, issuing HEAD(s) if absent or
    /// expired. Concurrent `get()` calls for the same cold path share one
    /// HEAD.
    pub fn get(
        &self,
        path: &str,
        hint: Hint,
        hook: &Arc<dyn Hook>,
        base_url: &str,
        executor: &mut RequestExecutor,
        timeout: Duration,
    ) -> FsResult<ObjectDescriptor> {
        let key = canonical_path(path);

        if let Some(d) = self.positive.get(&key) {
            return Ok(d);
        }
        if self.negative.get(&key).is_some() {
            return Err(FsError::NotFound);
        }

        // Try to become the leader for this key: whoever finds the entry
        // vacant claims it (and inserts the empty waiter list); everyone
        // else attaches as a waiter. Presence of the key, not an emptiness
        // check, is what distinguishes leader from waiter — so a waiter can
        // never be mistaken for a second leader.
        let (tx, rx) = bounded(1);
        let became_leader = match self.in_flight.entry(key.clone()) {
            DashEntry::Vacant(v) => {
                v.insert(Vec::new());
                true
            }
            DashEntry::Occupied(mut o) => {
                o.get_mut().push(tx);
                false
            }
        };

        if !became_leader {
            return match rx.recv() {
                Ok(FetchOutcome::Found(d)) => Ok(d),
                Ok(FetchOutcome::NotFound) => Err(FsError::NotFound),
                Ok(FetchOutcome::Failed(e)) => Err(e),
                Err(_) => Err(FsError::Shutdown),
            };
        }

        let outcome = self.resolve(&key, hint, hook, base_url, executor, timeout);

        let waiters = self
            .in_flight
            .remove(&key)
            .map(|(_, v)| v)
            .unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }

        match outcome {
            FetchOutcome::Found(d) => Ok(d),
            FetchOutcome::NotFound => Err(FsError::NotFound),
            FetchOutcome::Failed(e) => Err(e),
        }
    }

    fn resolve(
        &self,
        key: &str,
        hint: Hint,
        hook: &Arc<dyn Hook>,
        base_url: &str,
        executor: &mut RequestExecutor,
        timeout: Duration,
    ) -> FetchOutcome {
        // If hint != is-file, try "path/" first; if that 404s and
        // hint != is-dir, try bare "path".
        if !matches!(hint, Hint::IsFile) {
            match self.head(key, true, hook, base_url, executor, timeout) {
                Ok(Some(d)) => {
                    self.positive.insert(key.to_string(), d.clone());
                    return FetchOutcome::Found(d);
                }
                Ok(None) => {}
                Err(e) => return FetchOutcome::Failed(e),
            }
        }
        if !matches!(hint, Hint::IsDir) {
            match self.head(key, false, hook, base_url, executor, timeout) {
                Ok(Some(d)) => {
                    self.positive.insert(key.to_string(), d.clone());
                    return FetchOutcome::Found(d);
                }
                Ok(None) => {}
                Err(e) => return FetchOutcome::Failed(e),
            }
        }
        self.negative.insert(key.to_string(), ());
        FetchOutcome::NotFound
    }

    fn head(
        &self,
        path: &str,
        as_dir: bool,
        hook: &Arc<dyn Hook>,
        base_url: &str,
        executor: &mut RequestExecutor,
        timeout: Duration,
    ) -> FsResult<Option<ObjectDescriptor>> {
        let key = if as_dir {
            format!("{path}/")
        } else {
            path.to_string()
        };
        executor.init(Method::Head)?;
        executor.set_hook(Arc::clone(hook));
        executor.set_url(&format!("{base_url}/{key}"), &[]);
        executor.run(timeout)?;

        match executor.response_code() {
            Some(200) => Ok(Some(descriptor_from_head(
                path, as_dir, hook, executor,
            ))),
            Some(404) => Ok(None),
            Some(403) => Err(FsError::PermissionDenied),
            Some(code) if code >= 500 => Err(FsError::HttpServer(code)),
            Some(code) => Err(FsError::HttpClient(code)),
            None => Err(FsError::TransportFatal("no response code".to_string())),
        }
    }

    /// Drops a cached entry (both positive and negative), used by mutation
    /// operations before they return success to FUSE.
    pub fn invalidate(&self, path: &str) {
        let key = canonical_path(path);
        self.positive.invalidate(&key);
        self.negative.invalidate(&key);
    }

    /// Publishes a descriptor directly, skipping a HEAD round-trip — used
    /// after a PUT to record the freshly written etag.
    pub fn insert(&self, path: &str, descriptor: ObjectDescriptor) {
        let key = canonical_path(path);
        self.negative.invalidate(&key);
        self.positive.insert(key, descriptor);
    }

    pub fn entry_count(&self) -> u64 {
        self.positive.entry_count()
    }
}

fn descriptor_from_head(
    path: &str,
    as_dir: bool,
    hook: &Arc<dyn Hook>,
    executor: &RequestExecutor,
) -> ObjectDescriptor {
    let prefix = hook.metadata_header_prefix();
    let mut user_metadata = HashMap::new();
    for (name, value) in executor.response_headers() {
        if let Some(stripped) = name
            .to_ascii_lowercase()
            .strip_prefix(&prefix.to_ascii_lowercase())
        {
            user_metadata.insert(stripped.to_string(), value.clone());
        }
    }

    let mode = user_metadata
        .get("mode")
        .and_then(|v| u32::from_str_radix(v, 8).ok())
        .unwrap_or(if as_dir { 0o755 } else { 0o644 });
    let uid = user_metadata
        .get("uid")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let gid = user_metadata
        .get("gid")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mtime = user_metadata
        .get("mtime")
        .and_then(|v| v.parse::<u64>().ok())
        .map(|secs| SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
        .or_else(|| executor.last_modified())
        .unwrap_or_else(SystemTime::now);
    let size = executor
        .response_header("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let content_type = executor
        .response_header("content-type")
        .unwrap_or("application/octet-stream")
        .to_string();
    let etag = executor.response_header("etag").map(ToString::to_string);

    ObjectDescriptor {
        path: canonical_path(path),
        kind: if as_dir {
            ObjectKind::Directory
        } else {
            ObjectKind::File
        },
        mode,
        uid,
        gid,
        mtime,
        size,
        etag,
        content_type,
        user_metadata,
        fetch_timestamp: Instant::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::ListingPage;

    #[derive(Debug)]
    struct NullHook;
    impl Hook for NullHook {
        fn adjust_url(&self, url: &str) -> String {
            url.to_string()
        }
        fn pre_run(&self, _txn: &mut crate::executor::Transaction, _attempt: u32) {}
        fn should_retry(&self, _txn: &crate::executor::Transaction, _attempt: u32) -> bool {
            false
        }
        fn list_query(&self, _prefix: &str, _marker: Option<&str>) -> String {
            String::new()
        }
        fn parse_listing(&self, _body: &[u8]) -> FsResult<ListingPage> {
            Ok(ListingPage::default())
        }
        fn metadata_header_prefix(&self) -> &str {
            "x-amz-meta-"
        }
    }

    #[test]
    fn canonical_path_strips_leading_slash() {
        assert_eq!(canonical_path("/a/b"), "a/b");
        assert_eq!(canonical_path("a/b"), "a/b");
    }

    #[test]
    fn insert_then_get_hits_without_http() {
        let cache = ObjectCache::new(Duration::from_secs(30), Duration::from_secs(5));
        let desc = ObjectDescriptor {
            path: "a".to_string(),
            kind: ObjectKind::File,
            mode: 0o644,
            uid: 0,
            gid: 0,
            mtime: SystemTime::now(),
            size: 5,
            etag: Some("\"x\"".to_string()),
            content_type: "text/plain".to_string(),
            user_metadata: HashMap::new(),
            fetch_timestamp: Instant::now(),
        };
        cache.insert("/a", desc);
        let hook: Arc<dyn Hook> = Arc::new(NullHook);
        let mut exec = RequestExecutor::new(1);
        let got = cache
            .get("/a", Hint::IsFile, &hook, "http://unused", &mut exec, Duration::from_secs(1))
            .unwrap();
        assert_eq!(got.size, 5);
    }

    #[test]
    fn invalidate_drops_positive_and_negative() {
        let cache = ObjectCache::new(Duration::from_secs(30), Duration::from_secs(5));
        cache.negative.insert("a".to_string(), ());
        cache.invalidate("/a");
        assert!(cache.negative.get("a").is_none());
    }

    #[test]
    fn metadata_get_is_case_insensitive() {
        let mut md = HashMap::new();
        md.insert("Content-Disposition".to_string(), "inline".to_string());
        let desc = ObjectDescriptor {
            path: "a".to_string(),
            kind: ObjectKind::File,
            mode: 0o644,
            uid: 0,
            gid: 0,
            mtime: SystemTime::now(),
            size: 0,
            etag: None,
            content_type: "text/plain".to_string(),
            user_metadata: md,
            fetch_timestamp: Instant::now(),
        };
        assert_eq!(desc.metadata_get("content-disposition"), Some("inline"));
    }
}
