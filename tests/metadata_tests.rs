//! User-metadata and POSIX attribute round trips through `x-amz-meta-*`
//! headers, on both the read path (HEAD into a descriptor) and the write
//! path (staged handle metadata flushed as headers on PUT).

mod common;

use common::{bucket_path, test_hook};
use s3fs_fuse::cache::{Hint, ObjectCache, ObjectKind};
use s3fs_fuse::executor::RequestExecutor;
use s3fs_fuse::handles::OpenFileTable;
use std::time::Duration;

#[test]
fn head_response_metadata_headers_populate_descriptor() {
    let mut server = mockito::Server::new();
    let head_mock = server
        .mock("HEAD", bucket_path("owned.bin").as_str())
        .with_status(200)
        .with_header("etag", "\"m1\"")
        .with_header("content-length", "42")
        .with_header("content-type", "application/octet-stream")
        .with_header("x-amz-meta-mode", "600")
        .with_header("x-amz-meta-uid", "1000")
        .with_header("x-amz-meta-gid", "1000")
        .with_header("x-amz-meta-custom-key", "custom-value")
        .create();

    let hook = test_hook();
    let cache = ObjectCache::new(Duration::from_secs(30), Duration::from_secs(5));
    let mut exec = RequestExecutor::new(3);

    let descriptor = cache
        .get(
            "/owned.bin",
            Hint::IsFile,
            &hook,
            &server.url(),
            &mut exec,
            Duration::from_secs(5),
        )
        .unwrap();

    assert_eq!(descriptor.kind, ObjectKind::File);
    assert_eq!(descriptor.mode, 0o600);
    assert_eq!(descriptor.uid, 1000);
    assert_eq!(descriptor.gid, 1000);
    assert_eq!(descriptor.size, 42);
    assert_eq!(descriptor.metadata_get("custom-key"), Some("custom-value"));
    // Case-insensitive lookup, matching the attribute's storage contract.
    assert_eq!(descriptor.metadata_get("Custom-Key"), Some("custom-value"));
    head_mock.assert();
}

#[test]
fn directory_hint_defaults_to_directory_mode_when_unset() {
    let mut server = mockito::Server::new();
    let head_mock = server
        .mock("HEAD", bucket_path("a-dir/").as_str())
        .with_status(200)
        .with_header("content-length", "0")
        .create();

    let hook = test_hook();
    let cache = ObjectCache::new(Duration::from_secs(30), Duration::from_secs(5));
    let mut exec = RequestExecutor::new(3);

    let descriptor = cache
        .get(
            "/a-dir",
            Hint::IsDir,
            &hook,
            &server.url(),
            &mut exec,
            Duration::from_secs(5),
        )
        .unwrap();

    assert_eq!(descriptor.kind, ObjectKind::Directory);
    assert_eq!(descriptor.mode, 0o755);
    head_mock.assert();
}

#[test]
fn staged_handle_metadata_is_sent_as_headers_on_flush() {
    let mut server = mockito::Server::new();
    let put_mock = server
        .mock("PUT", bucket_path("tagged.txt").as_str())
        .match_header("x-amz-meta-owner", "alice")
        .with_status(200)
        .with_header("etag", "\"tagged\"")
        .create();

    let hook = test_hook();
    let table = OpenFileTable::new();
    let cache = ObjectCache::new(Duration::from_secs(30), Duration::from_secs(5));
    let mut exec = RequestExecutor::new(3);

    let id = table
        .open_new("/tagged.txt", "text/plain".to_string(), 0o644, 0, 0, None)
        .unwrap();
    table.write(id, 0, b"content").unwrap();
    table.set_metadata(id, "owner", "alice").unwrap();

    table
        .release(id, &hook, &server.url(), &mut exec, Duration::from_secs(5), &cache)
        .unwrap();

    put_mock.assert();
}

#[test]
fn flush_republishes_requested_mode_and_owner() {
    let mut server = mockito::Server::new();
    let put_mock = server
        .mock("PUT", bucket_path("owned-new.bin").as_str())
        .match_header("x-amz-meta-mode", "600")
        .match_header("x-amz-meta-uid", "1000")
        .match_header("x-amz-meta-gid", "1000")
        .with_status(200)
        .with_header("etag", "\"own1\"")
        .create();

    let hook = test_hook();
    let table = OpenFileTable::new();
    let cache = ObjectCache::new(Duration::from_secs(30), Duration::from_secs(5));
    let mut exec = RequestExecutor::new(3);

    let id = table
        .open_new(
            "/owned-new.bin",
            "application/octet-stream".to_string(),
            0o600,
            1000,
            1000,
            None,
        )
        .unwrap();
    table.write(id, 0, b"secret").unwrap();
    table
        .release(id, &hook, &server.url(), &mut exec, Duration::from_secs(5), &cache)
        .unwrap();

    put_mock.assert();

    let desc = cache
        .get(
            "/owned-new.bin",
            Hint::IsFile,
            &hook,
            &server.url(),
            &mut exec,
            Duration::from_secs(5),
        )
        .unwrap();
    assert_eq!(desc.mode, 0o600);
    assert_eq!(desc.uid, 1000);
    assert_eq!(desc.gid, 1000);
}
