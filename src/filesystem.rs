//! The filesystem facade — translates FUSE callbacks into work items
//! submitted to the dispatcher, consulting the object cache and open-file
//! table, and maps the result back to a POSIX errno.
//!
//! Each `Filesystem` trait method builds a closure capturing what it needs,
//! submits it to [`Dispatcher::run_fg`], and blocks on the one-shot result —
//! translate, dispatch, block.

use crate::cache::{self, Hint, ObjectCache, ObjectDescriptor, ObjectKind};
use crate::config::Config;
use crate::error::{FsError, FsResult};
use crate::executor::RequestExecutor;
use crate::handles::OpenFileTable;
use crate::hook::Hook;
use crate::inode::{InodeTable, ROOT_INODE};
use crate::pool::Dispatcher;

use dashmap::DashMap;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use libc::c_int;
use parking_lot::Mutex;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, trace};

/// Reported block size for `statfs`/`FileAttr`.
const BLOCK_SIZE: u32 = 4096;
/// How long the kernel may cache a returned attr/entry before re-asking.
const ATTR_TTL: Duration = Duration::from_secs(1);
/// Content-type used to mark an object as a symlink; the body holds the
/// target path. The store has no native symlink kind, so this is the
/// convention this hook family uses.
pub const SYMLINK_CONTENT_TYPE: &str = "application/vnd.s3fs-fuse.symlink";
/// Content-type used to mark a zero-byte directory placeholder object.
pub const DIRECTORY_CONTENT_TYPE: &str = "application/x-directory";

fn child_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// S3-backed FUSE filesystem: wires the request executor, worker pool,
/// object cache, and open-file table together behind the `Filesystem` trait.
pub struct S3Fs {
    dispatcher: Dispatcher,
    cache: Arc<ObjectCache>,
    handles: Arc<OpenFileTable>,
    inodes: Arc<InodeTable>,
    hook: Arc<dyn Hook>,
    base_url: String,
    timeout: Duration,
    tmp_dir: Option<std::path::PathBuf>,
    uid: u32,
    gid: u32,
    next_dir_handle: AtomicU64,
    dir_handles: DashMap<u64, Vec<(String, FileType, u64)>>,
}

impl S3Fs {
    pub fn new(config: &Config, hook: Arc<dyn Hook>) -> Self {
        let dispatcher = Dispatcher::new(
            config.fg_worker_count,
            config.bg_worker_count,
            /* queue_bound */ 256,
            config.max_transfer_retries,
            config.request_timeout,
            Arc::clone(&hook),
        );
        Self {
            dispatcher,
            cache: Arc::new(ObjectCache::new(config.cache_ttl, config.negative_cache_ttl)),
            handles: Arc::new(OpenFileTable::new()),
            inodes: Arc::new(InodeTable::new()),
            hook,
            base_url: config.base_url(),
            timeout: config.request_timeout,
            tmp_dir: None,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            next_dir_handle: AtomicU64::new(1),
            dir_handles: DashMap::new(),
        }
    }

    /// Probes the bucket at startup so the caller can exit with a distinct
    /// code for an unreachable endpoint versus an auth failure.
    pub fn probe(&self) -> FsResult<()> {
        let hook = Arc::clone(&self.hook);
        let base_url = self.base_url.clone();
        let timeout = self.timeout;
        self.run_fg(move |executor| {
            executor.init(crate::executor::Method::Get)?;
            executor.set_hook(Arc::clone(&hook));
            let query = hook.list_query("", None);
            executor.set_raw_query(&query);
            executor.set_url(&base_url, &[]);
            executor.run(timeout)?;
            match executor.response_code() {
                Some(code) if (200..300).contains(&code) => Ok(()),
                Some(403) => Err(FsError::PermissionDenied),
                Some(code) => Err(FsError::HttpClient(code)),
                None => Err(FsError::TransportFatal("no response code".to_string())),
            }
        })
    }

    pub fn shutdown(self) {
        self.dispatcher.shutdown();
    }

    /// Submits `f` to the FG pool and blocks for its typed result. The
    /// thunk itself still returns the plain integer the pool expects
    /// (spec's "work item ... producing an integer result"); the real
    /// payload rides out through a one-shot cell the closure fills before
    /// returning.
    fn run_fg<T, F>(&self, f: F) -> FsResult<T>
    where
        F: FnOnce(&mut RequestExecutor) -> FsResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let slot: Arc<Mutex<Option<FsResult<T>>>> = Arc::new(Mutex::new(None));
        let slot2 = Arc::clone(&slot);
        let code = self.dispatcher.run_fg(Box::new(move |executor| {
            let result = f(executor);
            let errno = match &result {
                Ok(_) => 0,
                Err(e) => -e.to_errno(),
            };
            *slot2.lock() = Some(result);
            errno
        }));
        match slot.lock().take() {
            Some(result) => result,
            None if code == -libc::ESHUTDOWN => Err(FsError::Shutdown),
            None => Err(FsError::Misuse("worker produced no result".to_string())),
        }
    }

    fn post_bg<F>(&self, f: F)
    where
        F: FnOnce(&mut RequestExecutor) + Send + 'static,
    {
        self.dispatcher.post_bg(Box::new(move |executor| {
            f(executor);
            0
        }));
    }

    fn path_for_ino(&self, ino: u64) -> FsResult<String> {
        self.inodes.path_of(ino).ok_or(FsError::BadHandle)
    }

    fn attr_from_descriptor(&self, ino: u64, desc: &ObjectDescriptor) -> FileAttr {
        let kind = match desc.kind {
            ObjectKind::Directory => FileType::Directory,
            ObjectKind::Symlink => FileType::Symlink,
            ObjectKind::File => FileType::RegularFile,
        };
        let perm = (desc.mode & 0o7777) as u16;
        FileAttr {
            ino,
            size: desc.size,
            blocks: desc.size.div_ceil(u64::from(BLOCK_SIZE)),
            atime: desc.mtime,
            mtime: desc.mtime,
            ctime: desc.mtime,
            crtime: desc.mtime,
            kind,
            perm,
            nlink: if kind == FileType::Directory { 2 } else { 1 },
            uid: desc.uid,
            gid: desc.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    /// `getattr` against a descriptor, but preferring an open handle's live
    /// scratch size over the last-fetched remote size (a write before
    /// flush must be visible to `getattr` on the same handle).
    fn attr_with_open_handle(&self, ino: u64, fh: Option<u64>, desc: &ObjectDescriptor) -> FileAttr {
        let mut attr = self.attr_from_descriptor(ino, desc);
        if let Some(fh) = fh {
            if let Ok(size) = self.handles.size(fh) {
                attr.size = size;
                attr.blocks = size.div_ceil(u64::from(BLOCK_SIZE));
            }
        }
        attr
    }

    fn fetch_descriptor(&self, path: String, hint: Hint) -> FsResult<ObjectDescriptor> {
        let cache = Arc::clone(&self.cache);
        let hook = Arc::clone(&self.hook);
        let base_url = self.base_url.clone();
        let timeout = self.timeout;
        self.run_fg(move |executor| cache.get(&path, hint, &hook, &base_url, executor, timeout))
    }

    fn prefill(&self, path: String, hint: Hint) {
        let cache = Arc::clone(&self.cache);
        let hook = Arc::clone(&self.hook);
        let base_url = self.base_url.clone();
        let timeout = self.timeout;
        self.post_bg(move |executor| {
            let _ = cache.get(&path, hint, &hook, &base_url, executor, timeout);
        });
    }

    /// Lists everything directly under `dir_path`, paginating via the
    /// hook's continuation tokens.
    fn list_directory(&self, dir_path: &str) -> FsResult<Vec<(String, FileType)>> {
        let prefix = if dir_path.is_empty() {
            String::new()
        } else {
            format!("{dir_path}/")
        };
        let hook = Arc::clone(&self.hook);
        let base_url = self.base_url.clone();
        let timeout = self.timeout;

        self.run_fg(move |executor| {
            let mut entries = Vec::new();
            let mut marker: Option<String> = None;
            loop {
                executor.init(crate::executor::Method::Get)?;
                executor.set_hook(Arc::clone(&hook));
                let query = hook.list_query(&prefix, marker.as_deref());
                executor.set_raw_query(&query);
                executor.set_url(&base_url, &[]);
                executor.run(timeout)?;
                match executor.response_code() {
                    Some(code) if (200..300).contains(&code) => {}
                    Some(403) => return Err(FsError::PermissionDenied),
                    Some(code) if code >= 500 => return Err(FsError::HttpServer(code)),
                    Some(code) => return Err(FsError::HttpClient(code)),
                    None => return Err(FsError::TransportFatal("no response code".to_string())),
                }
                let page = hook.parse_listing(executor.output_bytes())?;
                for p in &page.prefixes {
                    let name = p.trim_end_matches('/').rsplit('/').next().unwrap_or(p);
                    if !name.is_empty() {
                        entries.push((name.to_string(), FileType::Directory));
                    }
                }
                for obj in &page.keys {
                    if obj.key.ends_with('/') {
                        continue;
                    }
                    let name = obj.key.rsplit('/').next().unwrap_or(&obj.key);
                    if !name.is_empty() {
                        entries.push((name.to_string(), FileType::RegularFile));
                    }
                }
                if page.is_truncated {
                    marker = page.continuation_token;
                    if marker.is_none() {
                        break;
                    }
                } else {
                    break;
                }
            }
            Ok(entries)
        })
    }

    /// PUTs a zero-byte or supplied body with mode/uid/gid metadata headers,
    /// then publishes the descriptor.
    #[allow(clippy::too_many_arguments)]
    fn put_object(
        &self,
        path: String,
        body: Vec<u8>,
        content_type: String,
        mode: u32,
    ) -> FsResult<ObjectDescriptor> {
        let hook = Arc::clone(&self.hook);
        let base_url = self.base_url.clone();
        let timeout = self.timeout;
        let uid = self.uid;
        let gid = self.gid;
        let cache = Arc::clone(&self.cache);

        self.run_fg(move |executor| {
            executor.init(crate::executor::Method::Put)?;
            executor.set_hook(Arc::clone(&hook));
            executor.set_url(&format!("{base_url}/{path}"), &[]);
            executor.set_header("content-type", content_type.clone());
            let prefix = hook.metadata_header_prefix();
            executor.set_header(format!("{prefix}mode"), format!("{mode:o}"));
            executor.set_header(format!("{prefix}uid"), uid.to_string());
            executor.set_header(format!("{prefix}gid"), gid.to_string());
            let len = body.len() as u64;
            executor.set_input_buffer(bytes::Bytes::from(body))?;
            executor.run(timeout)?;
            match executor.response_code() {
                Some(code) if (200..300).contains(&code) => {}
                Some(403) => return Err(FsError::PermissionDenied),
                Some(code) if code >= 500 => return Err(FsError::HttpServer(code)),
                Some(code) => return Err(FsError::HttpClient(code)),
                None => return Err(FsError::TransportFatal("no response code".to_string())),
            }
            let etag = executor.response_header("etag").map(ToString::to_string);
            let kind = if content_type == DIRECTORY_CONTENT_TYPE {
                ObjectKind::Directory
            } else if content_type == SYMLINK_CONTENT_TYPE {
                ObjectKind::Symlink
            } else {
                ObjectKind::File
            };
            let desc = ObjectDescriptor {
                path: cache::canonical_path(&path),
                kind,
                mode,
                uid,
                gid,
                mtime: SystemTime::now(),
                size: len,
                etag,
                content_type: content_type.clone(),
                user_metadata: std::collections::HashMap::new(),
                fetch_timestamp: std::time::Instant::now(),
            };
            cache.insert(&path, desc.clone());
            Ok(desc)
        })
    }

    fn delete_object(&self, path: String) -> FsResult<()> {
        let hook = Arc::clone(&self.hook);
        let base_url = self.base_url.clone();
        let timeout = self.timeout;
        let cache = Arc::clone(&self.cache);
        let result = self.run_fg(move |executor| {
            executor.init(crate::executor::Method::Delete)?;
            executor.set_hook(Arc::clone(&hook));
            executor.set_url(&format!("{base_url}/{path}"), &[]);
            executor.run(timeout)?;
            match executor.response_code() {
                Some(code) if (200..300).contains(&code) || code == 404 => Ok(()),
                Some(403) => Err(FsError::PermissionDenied),
                Some(code) if code >= 500 => Err(FsError::HttpServer(code)),
                Some(code) => Err(FsError::HttpClient(code)),
                None => Err(FsError::TransportFatal("no response code".to_string())),
            }
        });
        cache.invalidate(&path);
        result
    }
}

impl Filesystem for S3Fs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        debug!("filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        debug!("filesystem destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Ok(parent_path) = self.path_for_ino(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = child_path(&parent_path, name);
        trace!(parent, name, "lookup");

        match self.fetch_descriptor(path.clone(), Hint::None) {
            Ok(desc) => {
                let ino = self.inodes.get_or_insert(&path);
                reply.entry(&ATTR_TTL, &self.attr_from_descriptor(ino, &desc), 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        if ino == ROOT_INODE {
            let now = SystemTime::now();
            let attr = FileAttr {
                ino: ROOT_INODE,
                size: 0,
                blocks: 0,
                atime: now,
                mtime: now,
                ctime: now,
                crtime: now,
                kind: FileType::Directory,
                perm: 0o755,
                nlink: 2,
                uid: self.uid,
                gid: self.gid,
                rdev: 0,
                blksize: BLOCK_SIZE,
                flags: 0,
            };
            reply.attr(&ATTR_TTL, &attr);
            return;
        }
        let Ok(path) = self.path_for_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        trace!(ino, "getattr");
        match self.fetch_descriptor(path, Hint::None) {
            Ok(desc) => reply.attr(&ATTR_TTL, &self.attr_with_open_handle(ino, fh, &desc)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Ok(path) = self.path_for_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        if let Some(size) = size {
            if let Some(fh) = fh {
                if let Err(e) = self.handles.truncate(fh, size) {
                    reply.error(e.to_errno());
                    return;
                }
            }
        }

        // mode/uid/gid changes on an object without an open handle require a
        // full re-PUT (whole-object semantics, spec Non-goals: no partial
        // writes), so round-trip through a GET when there is no live handle.
        if mode.is_some() || uid.is_some() || gid.is_some() {
            let desc = match self.fetch_descriptor(path.clone(), Hint::None) {
                Ok(d) => d,
                Err(e) => {
                    reply.error(e.to_errno());
                    return;
                }
            };
            if desc.kind == ObjectKind::File {
                let hook = Arc::clone(&self.hook);
                let base_url = self.base_url.clone();
                let timeout = self.timeout;
                let body = match self.run_fg({
                    let path = path.clone();
                    move |executor| {
                        executor.init(crate::executor::Method::Get)?;
                        executor.set_hook(Arc::clone(&hook));
                        executor.set_url(&format!("{base_url}/{path}"), &[]);
                        executor.run(timeout)?;
                        match executor.response_code() {
                            Some(200) => Ok(executor.output_bytes().clone()),
                            Some(code) => Err(FsError::HttpClient(code)),
                            None => Err(FsError::TransportFatal("no response code".to_string())),
                        }
                    }
                }) {
                    Ok(b) => b,
                    Err(e) => {
                        reply.error(e.to_errno());
                        return;
                    }
                };
                let new_mode = mode.unwrap_or(desc.mode);
                let new_uid = uid.unwrap_or(desc.uid);
                let new_gid = gid.unwrap_or(desc.gid);
                match self.put_object_with_metadata(
                    path.clone(),
                    body.to_vec(),
                    desc.content_type,
                    new_mode,
                    new_uid,
                    new_gid,
                    desc.user_metadata.clone(),
                ) {
                    Ok(_) => {}
                    Err(e) => {
                        reply.error(e.to_errno());
                        return;
                    }
                }
            }
        }

        self.cache.invalidate(&path);
        match self.fetch_descriptor(path, Hint::None) {
            Ok(desc) => reply.attr(&ATTR_TTL, &self.attr_with_open_handle(ino, fh, &desc)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Ok(path) = self.path_for_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let hook = Arc::clone(&self.hook);
        let base_url = self.base_url.clone();
        let timeout = self.timeout;
        let result = self.run_fg(move |executor| {
            executor.init(crate::executor::Method::Get)?;
            executor.set_hook(Arc::clone(&hook));
            executor.set_url(&format!("{base_url}/{path}"), &[]);
            executor.run(timeout)?;
            match executor.response_code() {
                Some(200) => Ok(executor.output_bytes().clone()),
                Some(404) => Err(FsError::NotFound),
                Some(code) => Err(FsError::HttpClient(code)),
                None => Err(FsError::TransportFatal("no response code".to_string())),
            }
        });
        match result {
            Ok(body) => reply.data(&body),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Some(name) = link_name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Ok(parent_path) = self.path_for_ino(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = child_path(&parent_path, name);
        let target_bytes = target.to_string_lossy().into_owned().into_bytes();

        match self.put_object(path.clone(), target_bytes, SYMLINK_CONTENT_TYPE.to_string(), 0o777) {
            Ok(desc) => {
                let ino = self.inodes.get_or_insert(&path);
                reply.entry(&ATTR_TTL, &self.attr_from_descriptor(ino, &desc), 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Ok(parent_path) = self.path_for_ino(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = child_path(&parent_path, name);
        match self.put_object(path.clone(), Vec::new(), "application/octet-stream".to_string(), mode) {
            Ok(desc) => {
                let ino = self.inodes.get_or_insert(&path);
                reply.entry(&ATTR_TTL, &self.attr_from_descriptor(ino, &desc), 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Ok(parent_path) = self.path_for_ino(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = child_path(&parent_path, name);

        match self.put_object(path.clone(), Vec::new(), "application/octet-stream".to_string(), mode) {
            Ok(desc) => match self.handles.open_new(
                &path,
                desc.content_type.clone(),
                desc.mode,
                desc.uid,
                desc.gid,
                self.tmp_dir.as_deref(),
            ) {
                Ok(fh) => {
                    let ino = self.inodes.get_or_insert(&path);
                    reply.created(&ATTR_TTL, &self.attr_from_descriptor(ino, &desc), 0, fh, 0);
                }
                Err(e) => reply.error(e.to_errno()),
            },
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Ok(parent_path) = self.path_for_ino(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = child_path(&parent_path, name);
        match self.put_object(
            format!("{path}/"),
            Vec::new(),
            DIRECTORY_CONTENT_TYPE.to_string(),
            mode,
        ) {
            Ok(desc) => {
                let ino = self.inodes.get_or_insert(&path);
                reply.entry(&ATTR_TTL, &self.attr_from_descriptor(ino, &desc), 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Ok(parent_path) = self.path_for_ino(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = child_path(&parent_path, name);
        match self.delete_object(path.clone()) {
            Ok(()) => {
                self.inodes.invalidate_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Ok(parent_path) = self.path_for_ino(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = child_path(&parent_path, name);
        match self.list_directory(&path) {
            Ok(entries) if !entries.is_empty() => {
                reply.error(libc::ENOTEMPTY);
            }
            Err(e) => reply.error(e.to_errno()),
            Ok(_) => match self.delete_object(format!("{path}/")) {
                Ok(()) => {
                    self.inodes.invalidate_path(&path);
                    reply.ok();
                }
                Err(e) => reply.error(e.to_errno()),
            },
        }
    }

    /// Renames by COPY-or-GET+PUT then DELETE source, then invalidates both
    /// paths. This hook family has no server-side COPY, so it is always
    /// GET+PUT+DELETE here.
    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(name), Some(newname)) = (name.to_str(), newname.to_str()) else {
            reply.error(libc::EINVAL);
            return;
        };
        let (Ok(parent_path), Ok(newparent_path)) =
            (self.path_for_ino(parent), self.path_for_ino(newparent))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        let from = child_path(&parent_path, name);
        let to = child_path(&newparent_path, newname);

        let desc = match self.fetch_descriptor(from.clone(), Hint::None) {
            Ok(d) => d,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        if desc.kind == ObjectKind::Directory {
            let children = match self.list_directory(&from) {
                Ok(c) => c,
                Err(e) => {
                    reply.error(e.to_errno());
                    return;
                }
            };
            for (child_name, _) in &children {
                if let Err(e) = self.rename_one(&child_path(&from, child_name), &child_path(&to, child_name)) {
                    reply.error(e.to_errno());
                    return;
                }
            }
            match self.rename_one(&format!("{from}/"), &format!("{to}/")) {
                Ok(()) => {
                    self.inodes.rename(self.inodes.get_or_insert_no_lookup(&from), &from, &to);
                    reply.ok();
                }
                Err(e) => reply.error(e.to_errno()),
            }
        } else {
            match self.rename_one(&from, &to) {
                Ok(()) => {
                    self.inodes.rename(self.inodes.get_or_insert_no_lookup(&from), &from, &to);
                    reply.ok();
                }
                Err(e) => reply.error(e.to_errno()),
            }
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Ok(path) = self.path_for_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let hook = Arc::clone(&self.hook);
        let base_url = self.base_url.clone();
        let timeout = self.timeout;
        let handles = Arc::clone(&self.handles);
        let tmp_dir = self.tmp_dir.clone();
        let result = self.run_fg(move |executor| {
            handles.open(&path, &hook, &base_url, executor, timeout, tmp_dir.as_deref())
        });
        match result {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.handles.read(fh, offset.max(0) as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.handles.write(fh, offset.max(0) as u64, data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let hook = Arc::clone(&self.hook);
        let base_url = self.base_url.clone();
        let timeout = self.timeout;
        let handles = Arc::clone(&self.handles);
        let cache = Arc::clone(&self.cache);
        let result = self.run_fg(move |executor| {
            handles.flush(fh, &hook, &base_url, executor, timeout, &cache)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let hook = Arc::clone(&self.hook);
        let base_url = self.base_url.clone();
        let timeout = self.timeout;
        let handles = Arc::clone(&self.handles);
        let cache = Arc::clone(&self.cache);
        let result = self.run_fg(move |executor| {
            handles.release(fh, &hook, &base_url, executor, timeout, &cache)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Ok(path) = self.path_for_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.list_directory(&path) {
            Ok(entries) => {
                let fh = self.next_dir_handle.fetch_add(1, Ordering::Relaxed);
                let with_ino: Vec<_> = entries
                    .into_iter()
                    .map(|(name, kind)| {
                        let full = child_path(&path, &name);
                        let entry_ino = self.inodes.get_or_insert_no_lookup(&full);
                        (name, kind, entry_ino)
                    })
                    .collect();
                for (name, kind, _) in &with_ino {
                    if *kind == FileType::RegularFile {
                        self.prefill(child_path(&path, name), Hint::IsFile);
                    }
                }
                self.dir_handles.insert(fh, with_ino);
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(entries) = self.dir_handles.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let mut all = vec![(".".to_string(), FileType::Directory, ino)];
        all.push(("..".to_string(), FileType::Directory, ROOT_INODE));
        all.extend(entries.iter().cloned());
        drop(entries);

        for (i, (name, kind, entry_ino)) in all.iter().enumerate().skip(offset.max(0) as usize) {
            if reply.add(*entry_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.dir_handles.remove(&fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        reply.statfs(
            u64::MAX / u64::from(BLOCK_SIZE),
            u64::MAX / u64::from(BLOCK_SIZE),
            u64::MAX / u64::from(BLOCK_SIZE),
            u64::MAX,
            u64::MAX,
            BLOCK_SIZE,
            1024,
            BLOCK_SIZE,
        );
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let Ok(path) = self.path_for_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let value = match self.fetch_descriptor(path, Hint::None) {
            Ok(desc) => desc.metadata_get(name).map(ToString::to_string),
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        match value {
            None => reply.error(libc::ENODATA),
            Some(v) if size == 0 => reply.size(v.len() as u32),
            Some(v) if (v.len() as u32) > size => reply.error(libc::ERANGE),
            Some(v) => reply.data(v.as_bytes()),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(name), Ok(value)) = (name.to_str(), std::str::from_utf8(value)) else {
            reply.error(libc::EINVAL);
            return;
        };
        let Ok(path) = self.path_for_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        // An open handle stages the change for the next flush; otherwise
        // this is a full re-PUT of the object with the new metadata header,
        // preserving the stored content-type.
        if let Some(fh) = self.open_handle_for(ino) {
            match self.handles.set_metadata(fh, name, value) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.to_errno()),
            }
            return;
        }

        let desc = match self.fetch_descriptor(path.clone(), Hint::IsFile) {
            Ok(d) => d,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let hook = Arc::clone(&self.hook);
        let base_url = self.base_url.clone();
        let timeout = self.timeout;
        let body = match self.run_fg({
            let path = path.clone();
            move |executor| {
                executor.init(crate::executor::Method::Get)?;
                executor.set_hook(Arc::clone(&hook));
                executor.set_url(&format!("{base_url}/{path}"), &[]);
                executor.run(timeout)?;
                match executor.response_code() {
                    Some(200) => Ok(executor.output_bytes().clone()),
                    Some(code) => Err(FsError::HttpClient(code)),
                    None => Err(FsError::TransportFatal("no response code".to_string())),
                }
            }
        }) {
            Ok(b) => b,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let mut metadata = desc.user_metadata.clone();
        metadata.insert(name.to_string(), value.to_string());
        match self.put_object_with_metadata(
            path,
            body.to_vec(),
            desc.content_type,
            desc.mode,
            desc.uid,
            desc.gid,
            metadata,
        ) {
            Ok(_) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let Ok(path) = self.path_for_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let keys = match self.fetch_descriptor(path, Hint::None) {
            Ok(desc) => desc.user_metadata.into_keys().collect::<Vec<_>>(),
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let mut buf = Vec::new();
        for k in keys {
            buf.extend_from_slice(k.as_bytes());
            buf.push(0);
        }
        if size == 0 {
            reply.size(buf.len() as u32);
        } else if (buf.len() as u32) > size {
            reply.error(libc::ERANGE);
        } else {
            reply.data(&buf);
        }
    }
}

impl S3Fs {
    fn open_handle_for(&self, ino: u64) -> Option<u64> {
        let path = self.path_for_ino(ino).ok()?;
        self.handles.find_by_path(&path)
    }

    #[allow(clippy::too_many_arguments)]
    fn put_object_with_metadata(
        &self,
        path: String,
        body: Vec<u8>,
        content_type: String,
        mode: u32,
        uid: u32,
        gid: u32,
        metadata: std::collections::HashMap<String, String>,
    ) -> FsResult<ObjectDescriptor> {
        let hook = Arc::clone(&self.hook);
        let base_url = self.base_url.clone();
        let timeout = self.timeout;
        let cache = Arc::clone(&self.cache);

        self.run_fg(move |executor| {
            executor.init(crate::executor::Method::Put)?;
            executor.set_hook(Arc::clone(&hook));
            executor.set_url(&format!("{base_url}/{path}"), &[]);
            executor.set_header("content-type", content_type.clone());
            let prefix = hook.metadata_header_prefix();
            executor.set_header(format!("{prefix}mode"), format!("{mode:o}"));
            executor.set_header(format!("{prefix}uid"), uid.to_string());
            executor.set_header(format!("{prefix}gid"), gid.to_string());
            for (k, v) in &metadata {
                executor.set_header(format!("{prefix}{k}"), v.clone());
            }
            let len = body.len() as u64;
            executor.set_input_buffer(bytes::Bytes::from(body))?;
            executor.run(timeout)?;
            match executor.response_code() {
                Some(code) if (200..300).contains(&code) => {}
                Some(403) => return Err(FsError::PermissionDenied),
                Some(code) if code >= 500 => return Err(FsError::HttpServer(code)),
                Some(code) => return Err(FsError::HttpClient(code)),
                None => return Err(FsError::TransportFatal("no response code".to_string())),
            }
            let etag = executor.response_header("etag").map(ToString::to_string);
            let desc = ObjectDescriptor {
                path: cache::canonical_path(&path),
                kind: ObjectKind::File,
                mode,
                uid,
                gid,
                mtime: SystemTime::now(),
                size: len,
                etag,
                content_type: content_type.clone(),
                user_metadata: metadata.clone(),
                fetch_timestamp: std::time::Instant::now(),
            };
            cache.insert(&path, desc.clone());
            Ok(desc)
        })
    }

    /// GET+PUT+DELETE for one object; no server-side COPY in this hook
    /// family. The GET's metadata headers (mode/uid/gid/xattrs) are carried
    /// into the destination PUT so a rename doesn't reset permissions.
    fn rename_one(&self, from: &str, to: &str) -> FsResult<()> {
        let hook = Arc::clone(&self.hook);
        let base_url = self.base_url.clone();
        let timeout = self.timeout;
        let from_owned = from.to_string();
        let hook_for_headers = Arc::clone(&self.hook);

        let (body, content_type, mode, uid, gid, metadata) = self.run_fg(move |executor| {
            executor.init(crate::executor::Method::Get)?;
            executor.set_hook(Arc::clone(&hook));
            executor.set_url(&format!("{base_url}/{from_owned}"), &[]);
            executor.run(timeout)?;
            match executor.response_code() {
                Some(200) => {
                    let content_type = executor
                        .response_header("content-type")
                        .unwrap_or("application/octet-stream")
                        .to_string();
                    let prefix = hook_for_headers.metadata_header_prefix();
                    let mut user_metadata = std::collections::HashMap::new();
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
                        .unwrap_or(0o644);
                    let uid = user_metadata
                        .get("uid")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0);
                    let gid = user_metadata
                        .get("gid")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0);
                    user_metadata.remove("mode");
                    user_metadata.remove("uid");
                    user_metadata.remove("gid");
                    Ok((
                        executor.output_bytes().clone(),
                        content_type,
                        mode,
                        uid,
                        gid,
                        user_metadata,
                    ))
                }
                Some(404) => Err(FsError::NotFound),
                Some(code) => Err(FsError::HttpClient(code)),
                None => Err(FsError::TransportFatal("no response code".to_string())),
            }
        })?;

        self.put_object_with_metadata(to.to_string(), body.to_vec(), content_type, mode, uid, gid, metadata)?;
        self.delete_object(from.to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_path_joins_with_slash() {
        assert_eq!(child_path("", "a"), "a");
        assert_eq!(child_path("a", "b"), "a/b");
    }
}
