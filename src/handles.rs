//! The open-file table — POSIX handle semantics bridged to whole-object
//! PUT/GET against the store, staging dirty content in local scratch files.
//!
//! Handle ids are `DashMap`-backed, monotonic `u64`s starting at 1 and never
//! reused. [`HandleState`] models `{Clean, Dirty, Dirty+Flushing}` as one
//! tagged value rather than independent booleans, since a small explicit
//! state machine beats boolean fields that imply impossible combinations.

use crate::cache::ObjectCache;
use crate::error::{FsError, FsResult};
use crate::executor::{Method, RequestExecutor};
use crate::hook::Hook;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The handle's position in the dirty-tracking state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Scratch matches the etag recorded at open.
    Clean,
    /// Scratch diverges from the remote; a write happened since the last
    /// successful flush (or since open).
    Dirty,
    /// A PUT is in progress; writers must wait for it to clear before
    /// mutating `scratch` (preserves a PUT body as a coherent snapshot).
    DirtyFlushing,
}

/// One open file: scratch copy plus the metadata needed to flush it back.
pub struct FileHandle {
    pub path: String,
    pub etag_on_open: Option<String>,
    pub content_type: String,
    /// Mode/uid/gid as seen at open (from the descriptor) or as requested at
    /// creation (`open_new`). Republished on every flush so a write never
    /// silently resets a file's mode/ownership to a hardcoded default.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    user_metadata: Mutex<HashMap<String, String>>,
    scratch: Mutex<File>,
    state: Mutex<HandleState>,
    flush_done: Condvar,
}

/// Maps integer handle ids to [`FileHandle`]s. Allocation is monotonically
/// increasing and never reused within process lifetime, so FUSE-side ABA
/// reasoning stays simple.
pub struct OpenFileTable {
    handles: DashMap<u64, Arc<FileHandle>>,
    next_id: AtomicU64,
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Fetches the object, creates an anonymous scratch file, GETs the full
    /// body into it, and registers a new handle.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        &self,
        path: &str,
        hook: &Arc<dyn Hook>,
        base_url: &str,
        executor: &mut RequestExecutor,
        timeout: Duration,
        tmp_dir: Option<&std::path::Path>,
    ) -> FsResult<u64> {
        let key = crate::cache::canonical_path(path);
        executor.init(Method::Get)?;
        executor.set_hook(Arc::clone(hook));
        executor.set_url(&format!("{base_url}/{key}"), &[]);
        executor.run(timeout)?;

        let (etag, content_type, user_metadata, body): (
            Option<String>,
            String,
            HashMap<String, String>,
            Bytes,
        ) = match executor.response_code() {
            Some(200) => {
                let etag = executor.response_header("etag").map(ToString::to_string);
                let content_type = executor
                    .response_header("content-type")
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let prefix = hook.metadata_header_prefix().to_ascii_lowercase();
                let mut md = HashMap::new();
                for (name, value) in executor.response_headers() {
                    if let Some(stripped) = name.to_ascii_lowercase().strip_prefix(&prefix) {
                        md.insert(stripped.to_string(), value.clone());
                    }
                }
                (etag, content_type, md, executor.output_bytes().clone())
            }
            Some(404) => return Err(FsError::NotFound),
            Some(403) => return Err(FsError::PermissionDenied),
            Some(code) if code >= 500 => return Err(FsError::HttpServer(code)),
            Some(code) => return Err(FsError::HttpClient(code)),
            None => return Err(FsError::TransportFatal("no response code".to_string())),
        };

        let mode = user_metadata
            .get("mode")
            .and_then(|v| u32::from_str_radix(v, 8).ok())
            .unwrap_or(0o644);
        let uid = user_metadata
            .get("uid")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let gid = user_metadata
            .get("gid")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let mut scratch = match tmp_dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        scratch.write_all(&body)?;
        scratch.flush()?;
        scratch.seek(SeekFrom::Start(0))?;

        let handle = Arc::new(FileHandle {
            path: key,
            etag_on_open: etag,
            content_type,
            mode,
            uid,
            gid,
            user_metadata: Mutex::new(user_metadata),
            scratch: Mutex::new(scratch),
            state: Mutex::new(HandleState::Clean),
            flush_done: Condvar::new(),
        });

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(id, handle);
        Ok(id)
    }

    /// Registers a handle for a freshly created, empty object — no GET
    /// needed since there is nothing remote yet. `mode`/`uid`/`gid` are the
    /// values the object was just created with (e.g. from `create`'s
    /// requested mode and the process's uid/gid), so a later flush
    /// republishes them instead of a hardcoded default.
    #[allow(clippy::too_many_arguments)]
    pub fn open_new(
        &self,
        path: &str,
        content_type: String,
        mode: u32,
        uid: u32,
        gid: u32,
        tmp_dir: Option<&std::path::Path>,
    ) -> FsResult<u64> {
        let scratch = match tmp_dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        let handle = Arc::new(FileHandle {
            path: crate::cache::canonical_path(path),
            etag_on_open: None,
            content_type,
            mode,
            uid,
            gid,
            user_metadata: Mutex::new(HashMap::new()),
            scratch: Mutex::new(scratch),
            state: Mutex::new(HandleState::Dirty),
            flush_done: Condvar::new(),
        });
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(id, handle);
        Ok(id)
    }

    fn get(&self, handle: u64) -> FsResult<Arc<FileHandle>> {
        self.handles
            .get(&handle)
            .map(|r| Arc::clone(r.value()))
            .ok_or(FsError::BadHandle)
    }

    /// Reads up to `len` bytes at `offset` from the handle's scratch copy.
    pub fn read(&self, handle: u64, offset: u64, len: usize) -> FsResult<Bytes> {
        let fh = self.get(handle)?;
        let mut scratch = fh.scratch.lock();
        scratch.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        let mut total = 0;
        loop {
            let n = scratch.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
            if total == buf.len() {
                break;
            }
        }
        buf.truncate(total);
        Ok(Bytes::from(buf))
    }

    /// Writes `data` at `offset`, waiting out any in-progress flush first so
    /// a PUT body is always a coherent snapshot. Sets DIRTY.
    pub fn write(&self, handle: u64, offset: u64, data: &[u8]) -> FsResult<usize> {
        let fh = self.get(handle)?;
        let mut state = fh.state.lock();
        while *state == HandleState::DirtyFlushing {
            fh.flush_done.wait(&mut state);
        }
        *state = HandleState::Dirty;
        drop(state);

        let mut scratch = fh.scratch.lock();
        scratch.seek(SeekFrom::Start(offset))?;
        scratch.write_all(data)?;
        scratch.flush()?;
        Ok(data.len())
    }

    /// Current scratch length, used by `getattr`/`truncate` on an open handle.
    pub fn size(&self, handle: u64) -> FsResult<u64> {
        let fh = self.get(handle)?;
        let mut scratch = fh.scratch.lock();
        let len = scratch.seek(SeekFrom::End(0))?;
        Ok(len)
    }

    /// Truncates the scratch file to `size`, marking the handle DIRTY.
    pub fn truncate(&self, handle: u64, size: u64) -> FsResult<()> {
        let fh = self.get(handle)?;
        let mut state = fh.state.lock();
        while *state == HandleState::DirtyFlushing {
            fh.flush_done.wait(&mut state);
        }
        *state = HandleState::Dirty;
        drop(state);

        let scratch = fh.scratch.lock();
        scratch.set_len(size)?;
        Ok(())
    }

    /// Stages a new/changed user-metadata key on an open handle, applied at
    /// the next flush.
    pub fn set_metadata(&self, handle: u64, key: &str, value: &str) -> FsResult<()> {
        let fh = self.get(handle)?;
        fh.user_metadata
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Reads a user-metadata value off an open handle (`getxattr` on a file
    /// that's currently open).
    pub fn get_metadata(&self, handle: u64, key: &str) -> FsResult<Option<String>> {
        let fh = self.get(handle)?;
        Ok(fh
            .user_metadata
            .lock()
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.clone()))
    }

    pub fn list_metadata(&self, handle: u64) -> FsResult<Vec<String>> {
        let fh = self.get(handle)?;
        Ok(fh.user_metadata.lock().keys().cloned().collect())
    }

    /// If DIRTY and not already FLUSHING: PUTs the scratch contents
    /// (preserving content-type, mode/uid/gid, and user-metadata), then
    /// clears DIRTY and publishes the new etag to `cache`. On failure,
    /// clears FLUSHING but leaves DIRTY set so a later flush can retry.
    pub fn flush(
        &self,
        handle: u64,
        hook: &Arc<dyn Hook>,
        base_url: &str,
        executor: &mut RequestExecutor,
        timeout: Duration,
        cache: &ObjectCache,
    ) -> FsResult<()> {
        let fh = self.get(handle)?;

        {
            let mut state = fh.state.lock();
            match *state {
                HandleState::Clean => return Ok(()),
                HandleState::DirtyFlushing => {
                    while *state == HandleState::DirtyFlushing {
                        fh.flush_done.wait(&mut state);
                    }
                    return Ok(());
                }
                HandleState::Dirty => *state = HandleState::DirtyFlushing,
            }
        }

        let body = {
            let mut scratch = fh.scratch.lock();
            scratch.seek(SeekFrom::Start(0))?;
            let mut buf = Vec::new();
            scratch.read_to_end(&mut buf)?;
            Bytes::from(buf)
        };
        let len = body.len();

        let user_metadata = fh.user_metadata.lock().clone();

        executor.init(Method::Put)?;
        executor.set_hook(Arc::clone(hook));
        executor.set_url(&format!("{base_url}/{}", fh.path), &[]);
        executor.set_header("content-type", fh.content_type.clone());
        let prefix = hook.metadata_header_prefix();
        executor.set_header(format!("{prefix}mode"), format!("{:o}", fh.mode));
        executor.set_header(format!("{prefix}uid"), fh.uid.to_string());
        executor.set_header(format!("{prefix}gid"), fh.gid.to_string());
        for (k, v) in &user_metadata {
            executor.set_header(format!("{prefix}{k}"), v.clone());
        }
        executor.set_input_buffer(body)?;

        let result = executor.run(timeout).and_then(|()| {
            match executor.response_code() {
                Some(code) if (200..300).contains(&code) => Ok(()),
                Some(403) => Err(FsError::PermissionDenied),
                Some(code) if code >= 500 => Err(FsError::HttpServer(code)),
                Some(code) => Err(FsError::HttpClient(code)),
                None => Err(FsError::TransportFatal("no response code".to_string())),
            }
        });

        let mut state = fh.state.lock();
        match &result {
            Ok(()) => {
                *state = HandleState::Clean;
                let etag = executor.response_header("etag").map(ToString::to_string);
                cache.insert(
                    &fh.path,
                    crate::cache::ObjectDescriptor {
                        path: fh.path.clone(),
                        kind: crate::cache::ObjectKind::File,
                        mode: fh.mode,
                        uid: fh.uid,
                        gid: fh.gid,
                        mtime: std::time::SystemTime::now(),
                        size: len as u64,
                        etag,
                        content_type: fh.content_type.clone(),
                        user_metadata: user_metadata.clone(),
                        fetch_timestamp: std::time::Instant::now(),
                    },
                );
            }
            Err(_) => {
                *state = HandleState::Dirty;
            }
        }
        drop(state);
        fh.flush_done.notify_all();

        result
    }

    /// Idempotent: flushes (if dirty), deletes the scratch file, and removes
    /// the handle from the table. Closing with a pending DIRTY attempts one
    /// flush; if it fails the release still succeeds in removing the handle
    /// but the error code is surfaced to the caller, mirroring POSIX
    /// `close()` reporting prior write errors.
    pub fn release(
        &self,
        handle: u64,
        hook: &Arc<dyn Hook>,
        base_url: &str,
        executor: &mut RequestExecutor,
        timeout: Duration,
        cache: &ObjectCache,
    ) -> FsResult<()> {
        if !self.handles.contains_key(&handle) {
            return Err(FsError::BadHandle);
        }
        let result = self.flush(handle, hook, base_url, executor, timeout, cache);
        self.handles.remove(&handle);
        result
    }

    pub fn contains(&self, handle: u64) -> bool {
        self.handles.contains_key(&handle)
    }

    pub fn path_of(&self, handle: u64) -> FsResult<String> {
        Ok(self.get(handle)?.path.clone())
    }

    /// Finds an open handle for `path`, if any (used by `setxattr`, which
    /// FUSE gives no handle id for, to stage into an already-open file
    /// instead of re-PUTting the whole object).
    pub fn find_by_path(&self, path: &str) -> Option<u64> {
        self.handles
            .iter()
            .find(|entry| entry.value().path == path)
            .map(|entry| *entry.key())
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for OpenFileTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_new_then_write_read_roundtrip() {
        let table = OpenFileTable::new();
        let id = table
            .open_new("/a.txt", "text/plain".to_string(), 0o644, 0, 0, None)
            .unwrap();
        table.write(id, 0, b"hello").unwrap();
        let data = table.read(id, 0, 5).unwrap();
        assert_eq!(data.as_ref(), b"hello");
    }

    #[test]
    fn write_extends_scratch_and_size_reflects_it() {
        let table = OpenFileTable::new();
        let id = table
            .open_new("/a.txt", "text/plain".to_string(), 0o644, 0, 0, None)
            .unwrap();
        table.write(id, 10, b"x").unwrap();
        assert_eq!(table.size(id).unwrap(), 11);
    }

    #[test]
    fn release_removes_handle() {
        let table = OpenFileTable::new();
        let id = table
            .open_new("/a.txt", "text/plain".to_string(), 0o644, 0, 0, None)
            .unwrap();
        assert!(table.contains(id));
        // release() issues a PUT; with no hook/executor wired in this unit
        // test we exercise read/write/size/table bookkeeping only, and drop
        // the handle directly the way a failed/aborted release would leave
        // the table (handle removal is independent of PUT success).
        table.handles.remove(&id);
        assert!(!table.contains(id));
    }

    #[test]
    fn bad_handle_is_ebadf_class_error() {
        let table = OpenFileTable::new();
        let err = table.read(999, 0, 10).unwrap_err();
        assert!(matches!(err, FsError::BadHandle));
    }

    #[test]
    fn handle_ids_are_monotonic_and_not_reused() {
        let table = OpenFileTable::new();
        let a = table
            .open_new("/a", "text/plain".to_string(), 0o644, 0, 0, None)
            .unwrap();
        let b = table
            .open_new("/b", "text/plain".to_string(), 0o644, 0, 0, None)
            .unwrap();
        assert!(b > a);
        table.handles.remove(&a);
        let c = table
            .open_new("/c", "text/plain".to_string(), 0o644, 0, 0, None)
            .unwrap();
        assert!(c > b);
    }

    #[test]
    fn set_metadata_stages_into_handle() {
        let table = OpenFileTable::new();
        let id = table
            .open_new("/a", "text/plain".to_string(), 0o644, 0, 0, None)
            .unwrap();
        table.set_metadata(id, "x-custom", "value").unwrap();
        assert_eq!(
            table.get_metadata(id, "x-custom").unwrap(),
            Some("value".to_string())
        );
    }
}
