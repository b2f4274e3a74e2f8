//! Create/read/update/delete round trips through the open-file table and
//! object cache, against a mocked store endpoint.

mod common;

use common::{bucket_path, test_hook, TEST_BUCKET};
use s3fs_fuse::cache::{Hint, ObjectCache};
use s3fs_fuse::executor::RequestExecutor;
use s3fs_fuse::handles::OpenFileTable;
use std::time::Duration;

#[test]
fn create_write_release_then_head_sees_new_etag() {
    let mut server = mockito::Server::new();
    let put_mock = server
        .mock("PUT", bucket_path("new.txt").as_str())
        .with_status(200)
        .with_header("etag", "\"written\"")
        .create();
    let head_mock = server
        .mock("HEAD", bucket_path("new.txt/").as_str())
        .with_status(404)
        .expect(0)
        .create();

    let hook = test_hook();
    let table = OpenFileTable::new();
    let cache = ObjectCache::new(Duration::from_secs(30), Duration::from_secs(5));
    let mut exec = RequestExecutor::new(3);

    let id = table
        .open_new("/new.txt", "text/plain".to_string(), 0o644, 0, 0, None)
        .unwrap();
    table.write(id, 0, b"hello world").unwrap();
    table
        .release(id, &hook, &server.url(), &mut exec, Duration::from_secs(5), &cache)
        .unwrap();

    put_mock.assert();
    assert!(!table.contains(id));

    // release() already published the fresh descriptor into the cache, so a
    // subsequent get() hits it directly and never issues the HEAD at all.
    let descriptor = cache
        .get("/new.txt", Hint::IsFile, &hook, &server.url(), &mut exec, Duration::from_secs(5))
        .unwrap();
    assert_eq!(descriptor.etag.as_deref(), Some("\"written\""));
    assert_eq!(descriptor.size, 11);
    head_mock.assert();
}

#[test]
fn zero_length_put_succeeds_and_reads_back_empty() {
    let mut server = mockito::Server::new();
    let put_mock = server
        .mock("PUT", bucket_path("empty.txt").as_str())
        .match_body("")
        .with_status(200)
        .with_header("etag", "\"empty\"")
        .create();

    let hook = test_hook();
    let table = OpenFileTable::new();
    let cache = ObjectCache::new(Duration::from_secs(30), Duration::from_secs(5));
    let mut exec = RequestExecutor::new(3);

    let id = table
        .open_new("/empty.txt", "text/plain".to_string(), 0o644, 0, 0, None)
        .unwrap();
    table
        .release(id, &hook, &server.url(), &mut exec, Duration::from_secs(5), &cache)
        .unwrap();

    put_mock.assert();
}

#[test]
fn get_on_nonexistent_path_is_not_found() {
    let mut server = mockito::Server::new();
    let dir_head = server
        .mock("HEAD", bucket_path("missing.txt/").as_str())
        .with_status(404)
        .expect(1)
        .create();
    let file_head = server
        .mock("HEAD", bucket_path("missing.txt").as_str())
        .with_status(404)
        .expect(1)
        .create();

    let hook = test_hook();
    let cache = ObjectCache::new(Duration::from_secs(30), Duration::from_secs(5));
    let mut exec = RequestExecutor::new(3);

    let err = cache
        .get("/missing.txt", Hint::None, &hook, &server.url(), &mut exec, Duration::from_secs(5))
        .unwrap_err();
    assert!(matches!(err, s3fs_fuse::error::FsError::NotFound));

    // The 404 is now cached negatively: a second lookup issues no further
    // HEADs, so both mocks still see exactly the one call each from above.
    let err2 = cache
        .get("/missing.txt", Hint::None, &hook, &server.url(), &mut exec, Duration::from_secs(5))
        .unwrap_err();
    assert!(matches!(err2, s3fs_fuse::error::FsError::NotFound));
    dir_head.assert();
    file_head.assert();
}

#[test]
fn open_existing_object_stages_body_for_read() {
    let mut server = mockito::Server::new();
    let get_mock = server
        .mock("GET", bucket_path("existing.txt").as_str())
        .with_status(200)
        .with_header("etag", "\"abc\"")
        .with_header("content-type", "text/plain")
        .with_body("payload")
        .create();

    let hook = test_hook();
    let table = OpenFileTable::new();
    let mut exec = RequestExecutor::new(3);

    let id = table
        .open(
            "/existing.txt",
            &hook,
            &server.url(),
            &mut exec,
            Duration::from_secs(5),
            None,
        )
        .unwrap();
    get_mock.assert();

    let data = table.read(id, 0, 7).unwrap();
    assert_eq!(data.as_ref(), b"payload");
}

#[test]
fn bucket_name_is_inserted_into_every_request_path() {
    assert_eq!(bucket_path("k"), format!("/{TEST_BUCKET}/k"));
}
