//! The S3 dialect: path-style addressing, SigV4 request signing, and
//! `ListObjectsV2` XML parsing.
//!
//! Path-style addressing (`https://endpoint/bucket/key`) is used rather than
//! virtual-hosted-style (`https://bucket.endpoint/key`) so this hook works
//! unmodified against MinIO, Ceph RGW, and other S3-compatible stores that
//! don't provision wildcard TLS certificates per bucket.

use crate::error::{FsError, FsResult};
use crate::executor::Transaction;
use crate::hook::{Hook, ListedObject, ListingPage};
use chrono::Utc;
use ring::{digest, hmac};
use serde::Deserialize;

/// Credentials and addressing for one S3-compatible bucket.
pub struct S3Hook {
    access_key: String,
    secret_key: String,
    region: String,
    bucket: String,
}

impl std::fmt::Debug for S3Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Hook")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .finish()
    }
}

impl S3Hook {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        region: impl Into<String>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            region: region.into(),
            bucket: bucket.into(),
        }
    }
}

/// Splits a URL into its `scheme://host[:port]` head and its path
/// (beginning with `/`, empty if none). No query component is expected.
fn split_scheme_host(url: &str) -> (&str, &str) {
    let after_scheme = url.find("://").map_or(0, |i| i + 3);
    let path_start = url[after_scheme..]
        .find('/')
        .map_or(url.len(), |i| after_scheme + i);
    (&url[..path_start], &url[path_start..])
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> hmac::Tag {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::sign(&key, data)
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(digest::digest(&digest::SHA256, data).as_ref())
}

fn percent_encode_path_segment(s: &str) -> String {
    const ENCODE: percent_encoding::AsciiSet = percent_encoding::NON_ALPHANUMERIC
        .remove(b'-')
        .remove(b'_')
        .remove(b'.')
        .remove(b'~')
        .remove(b'/');
    percent_encoding::utf8_percent_encode(s, &ENCODE).to_string()
}

fn percent_encode_query_value(s: &str) -> String {
    const ENCODE: percent_encoding::AsciiSet = percent_encoding::NON_ALPHANUMERIC
        .remove(b'-')
        .remove(b'_')
        .remove(b'.')
        .remove(b'~');
    percent_encoding::utf8_percent_encode(s, &ENCODE).to_string()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct XmlListBucketResult {
    #[serde(rename = "Contents")]
    contents: Vec<XmlContents>,
    #[serde(rename = "CommonPrefixes")]
    common_prefixes: Vec<XmlCommonPrefix>,
    next_continuation_token: Option<String>,
    is_truncated: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct XmlContents {
    key: String,
    size: u64,
    #[serde(rename = "ETag", default)]
    etag: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct XmlCommonPrefix {
    prefix: String,
}

impl Hook for S3Hook {
    fn adjust_url(&self, url: &str) -> String {
        let (head, path) = split_scheme_host(url);
        format!("{head}/{}{path}", self.bucket)
    }

    fn pre_run(&self, txn: &mut Transaction, _attempt: u32) {
        let amzdate = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
        let datestamp = &amzdate[..8];

        let payload_hash = txn
            .input_buffer
            .as_ref()
            .map_or_else(|| sha256_hex(b""), |b| sha256_hex(b));

        let (head, path) = split_scheme_host(&txn.url);
        let host = head
            .find("://")
            .map_or(head, |i| &head[i + 3..]);
        let canonical_uri = if path.is_empty() {
            "/".to_string()
        } else {
            percent_encode_path_segment(path)
        };

        txn.set_header("host", host);
        txn.set_header("x-amz-date", amzdate.clone());
        txn.set_header("x-amz-content-sha256", payload_hash.clone());

        let mut signed_headers: Vec<(&str, String)> = vec![
            ("host", host.to_string()),
            ("x-amz-content-sha256", payload_hash.clone()),
            ("x-amz-date", amzdate.clone()),
        ];
        if let Some(ct) = txn
            .headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("content-type"))
        {
            signed_headers.push(("content-type", ct.1.clone()));
        }
        signed_headers.sort_by(|a, b| a.0.cmp(b.0));

        let canonical_headers: String = signed_headers
            .iter()
            .map(|(name, value)| format!("{name}:{}\n", value.trim()))
            .collect();
        let signed_header_names = signed_headers
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(";");

        let method_str = match txn.method {
            crate::executor::Method::Get => "GET",
            crate::executor::Method::Head => "HEAD",
            crate::executor::Method::Put => "PUT",
            crate::executor::Method::Post => "POST",
            crate::executor::Method::Delete => "DELETE",
        };

        let mut query_pairs = txn.query.clone();
        query_pairs.sort();
        let canonical_query = query_pairs
            .iter()
            .map(|(k, v)| {
                format!(
                    "{}={}",
                    percent_encode_query_value(k),
                    percent_encode_query_value(v)
                )
            })
            .collect::<Vec<_>>()
            .join("&");

        let canonical_request = format!(
            "{method_str}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed_header_names}\n{payload_hash}"
        );

        let credential_scope = format!("{datestamp}/{}/s3/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amzdate}\n{credential_scope}\n{}",
            sha256_hex(canonical_request.as_bytes())
        );

        let k_date = hmac_sha256(format!("AWS4{}", self.secret_key).as_bytes(), datestamp.as_bytes());
        let k_region = hmac_sha256(k_date.as_ref(), self.region.as_bytes());
        let k_service = hmac_sha256(k_region.as_ref(), b"s3");
        let k_signing = hmac_sha256(k_service.as_ref(), b"aws4_request");
        let signature = hex::encode(hmac_sha256(k_signing.as_ref(), string_to_sign.as_bytes()).as_ref());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{credential_scope}, SignedHeaders={signed_header_names}, Signature={signature}",
            self.access_key
        );
        txn.set_header("authorization", authorization);
    }

    fn should_retry(&self, txn: &Transaction, attempt: u32) -> bool {
        match txn.response_code {
            // Expired/skewed-clock signatures: one retry is enough, the next
            // attempt's pre_run recomputes Date/Authorization from scratch.
            Some(401) | Some(403) => attempt == 1,
            Some(code) if (500..600).contains(&code) => attempt < 3,
            _ => false,
        }
    }

    fn list_query(&self, prefix: &str, marker: Option<&str>) -> String {
        let mut parts = vec!["list-type=2".to_string(), "delimiter=%2F".to_string()];
        if !prefix.is_empty() {
            parts.push(format!("prefix={}", percent_encode_query_value(prefix)));
        }
        if let Some(token) = marker {
            parts.push(format!(
                "continuation-token={}",
                percent_encode_query_value(token)
            ));
        }
        parts.join("&")
    }

    fn parse_listing(&self, body: &[u8]) -> FsResult<ListingPage> {
        let text = std::str::from_utf8(body)
            .map_err(|e| FsError::Corrupt(format!("listing body not UTF-8: {e}")))?;
        let parsed: XmlListBucketResult = quick_xml::de::from_str(text)
            .map_err(|e| FsError::Corrupt(format!("malformed listing XML: {e}")))?;

        Ok(ListingPage {
            keys: parsed
                .contents
                .into_iter()
                .map(|c| ListedObject {
                    key: c.key,
                    size: c.size,
                    etag: c.etag,
                })
                .collect(),
            prefixes: parsed
                .common_prefixes
                .into_iter()
                .map(|p| p.prefix)
                .collect(),
            continuation_token: parsed.next_continuation_token,
            is_truncated: parsed.is_truncated,
        })
    }

    fn metadata_header_prefix(&self) -> &str {
        "x-amz-meta-"
    }
}
