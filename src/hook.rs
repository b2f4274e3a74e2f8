//! The hook interface: the plug-in seam for a store's REST dialect.
//!
//! [`crate::executor::RequestExecutor`] is dialect-agnostic; everything that
//! differs between object stores (URL shaping, request signing, retry
//! policy for 401/5xx, listing query construction and XML parsing) is
//! injected through a `dyn Hook`: one trait, one concrete implementation
//! shipped per backend ([`crate::hooks::s3::S3Hook`] here).

use crate::error::FsResult;
use crate::executor::Transaction;

/// One object key returned by a LIST operation.
#[derive(Debug, Clone)]
pub struct ListedObject {
    /// Full key path (no leading slash).
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// Server-assigned etag, if present.
    pub etag: Option<String>,
}

/// One page of a (possibly paginated) LIST response.
#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    /// Objects found directly under the queried prefix.
    pub keys: Vec<ListedObject>,
    /// Common prefixes ("subdirectories") under the queried prefix.
    pub prefixes: Vec<String>,
    /// Opaque continuation token for the next page, if the listing was truncated.
    pub continuation_token: Option<String>,
    /// Whether the store indicated more pages remain.
    pub is_truncated: bool,
}

/// Plug-in supplying store-specific URL shaping, signing, and retry policy.
///
/// Implementations must be `Send + Sync`: one `Arc<dyn Hook>` is shared by
/// every worker across both pools.
pub trait Hook: Send + Sync + std::fmt::Debug {
    /// Rewrites a base URL, e.g. adding a bucket subdomain or path prefix.
    fn adjust_url(&self, url: &str) -> String;

    /// Signs the request ahead of one attempt: adds `Date`, `Authorization`, etc.
    ///
    /// Called once per attempt (not once per `run()`) so that signatures
    /// computed from the current date stay valid across retries.
    fn pre_run(&self, txn: &mut Transaction, attempt: u32);

    /// Inspects a completed HTTP-level response and decides whether to retry.
    ///
    /// Only called for responses the executor itself wouldn't already retry
    /// as transport failures; typically used to refresh credentials on 401
    /// or back off on 5xx.
    fn should_retry(&self, txn: &Transaction, attempt: u32) -> bool;

    /// Builds the query string for a LIST request.
    fn list_query(&self, prefix: &str, marker: Option<&str>) -> String;

    /// Parses one page of a LIST response body.
    fn parse_listing(&self, body: &[u8]) -> FsResult<ListingPage>;

    /// Header name prefix under which user metadata is stored, e.g. `x-amz-meta-`.
    fn metadata_header_prefix(&self) -> &str;
}
