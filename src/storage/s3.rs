//! S3 object store.
//!
//! Talks to the S3 REST API directly with AWS Signature V4 authentication
//! (`hmac` + `sha2`, no C dependencies). Works against AWS and S3-compatible
//! services (MinIO, LocalStack) when `endpoint_url` is set, in which case
//! path-style addressing is used.
//!
//! # Configuration
//!
//! ```toml
//! [storage.s3]
//! region = "eu-west-1"
//! # endpoint_url = "http://localhost:9000"   # MinIO
//! ```
//!
//! Credentials come from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and the
//! optional `AWS_SESSION_TOKEN`.
//!
//! # Checksums
//!
//! Every upload carries `x-amz-checksum-sha256` and every server-side copy
//! asks for a SHA-256 checksum, so `HeadObject` with checksum mode enabled
//! returns the same digest a local file hashes to. Objects larger than
//! [`MAX_SINGLE_COPY`] are copied with multipart `UploadPartCopy`; their
//! checksum is composite and content hashing falls back to a download.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::{ChunkSink, ObjectMeta, ObjectPage, ObjectStore, RetryPolicy};
use crate::config::S3Config;
use crate::error::StorageError;

type HmacSha256 = Hmac<Sha256>;

/// Largest object `CopyObject` accepts in one request (5 GiB).
pub const MAX_SINGLE_COPY: u64 = 5 * 1024 * 1024 * 1024;

const COPY_PART_SIZE: u64 = 512 * 1024 * 1024;
const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// AWS credentials loaded from environment variables.
#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl AwsCredentials {
    pub fn from_env() -> Result<Self, StorageError> {
        let var = |name: &str| {
            std::env::var(name)
                .map_err(|_| StorageError::NoRemoteStore(format!("{} is not set", name)))
        };
        Ok(Self {
            access_key_id: var("AWS_ACCESS_KEY_ID")?,
            secret_access_key: var("AWS_SECRET_ACCESS_KEY")?,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok(),
        })
    }
}

/// [`ObjectStore`] backed by S3.
pub struct S3Store {
    client: reqwest::Client,
    creds: AwsCredentials,
    region: String,
    endpoint: Option<String>,
    retry: RetryPolicy,
    multipart_threshold: u64,
    part_size: u64,
}

/// Where a request goes and what its canonical URI is.
struct Target {
    url: String,
    host: String,
    canonical_uri: String,
}

impl S3Store {
    pub fn new(config: &S3Config, creds: AwsCredentials, retry: RetryPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            creds,
            region: config.region.clone(),
            endpoint: config.endpoint_url.clone(),
            retry,
            multipart_threshold: MAX_SINGLE_COPY,
            part_size: COPY_PART_SIZE,
        }
    }

    /// Copy objects larger than `threshold` bytes in parts of `part_size`.
    /// S3-compatible services may accept smaller parts than AWS does.
    pub fn with_multipart_copy(mut self, threshold: u64, part_size: u64) -> Self {
        self.multipart_threshold = threshold;
        self.part_size = part_size.max(1);
        self
    }

    pub fn from_env(config: &S3Config, retry: RetryPolicy) -> Result<Self, StorageError> {
        Ok(Self::new(config, AwsCredentials::from_env()?, retry))
    }

    fn target(&self, bucket: &str, key: &str) -> Target {
        let encoded_key = encode_key(key);
        match &self.endpoint {
            Some(endpoint) => {
                let base = endpoint.trim_end_matches('/');
                let base = if base.contains("://") {
                    base.to_string()
                } else {
                    format!("https://{}", base)
                };
                let host = base
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .to_string();
                let canonical_uri = format!("/{}/{}", bucket, encoded_key);
                Target {
                    url: format!("{}{}", base, canonical_uri),
                    host,
                    canonical_uri,
                }
            }
            None => {
                let host = format!("{}.s3.{}.amazonaws.com", bucket, self.region);
                let canonical_uri = format!("/{}", encoded_key);
                Target {
                    url: format!("https://{}{}", host, canonical_uri),
                    host,
                    canonical_uri,
                }
            }
        }
    }

    /// Build a signed request. `headers` are signed and sent; names must be lowercase.
    fn signed(
        &self,
        method: Method,
        bucket: &str,
        key: &str,
        query: &[(&str, &str)],
        headers: &[(&str, String)],
        payload_hash: &str,
    ) -> reqwest::RequestBuilder {
        let target = self.target(bucket, key);
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut sorted_query: Vec<(String, String)> = query
            .iter()
            .map(|(k, v)| (uri_encode(k), uri_encode(v)))
            .collect();
        sorted_query.sort();
        let canonical_querystring = sorted_query
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let mut signed_headers: Vec<(String, String)> = vec![
            ("host".to_string(), target.host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.to_string()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            signed_headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        for (name, value) in headers {
            signed_headers.push((name.to_string(), value.trim().to_string()));
        }
        signed_headers.sort();

        let header_names = signed_headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = signed_headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            target.canonical_uri,
            canonical_querystring,
            canonical_headers,
            header_names,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key =
            derive_signing_key(&self.creds.secret_access_key, &date_stamp, &self.region, "s3");
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, header_names, signature
        );

        let url = if canonical_querystring.is_empty() {
            target.url
        } else {
            format!("{}?{}", target.url, canonical_querystring)
        };

        let mut builder = self
            .client
            .request(method, url)
            .header("authorization", authorization);
        for (name, value) in signed_headers.iter().filter(|(k, _)| k != "host") {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        operation: &str,
        address: &str,
    ) -> Result<reqwest::Response, StorageError> {
        let resp = request
            .send()
            .await
            .map_err(|e| StorageError::Remote(format!("{} {}: {}", operation, address, e)))?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(status_error(operation, address, status, &body))
    }

    async fn head_once(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>, StorageError> {
        let address = object_address(bucket, key);
        let request = self.signed(
            Method::HEAD,
            bucket,
            key,
            &[],
            &[("x-amz-checksum-mode", "ENABLED".to_string())],
            EMPTY_PAYLOAD_SHA256,
        );
        let resp = match self.send(request, "HeadObject", &address).await {
            Ok(resp) => resp,
            Err(StorageError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let header = |name: &str| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Ok(Some(ObjectMeta {
            key: key.to_string(),
            size: header("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            sha256: header("x-amz-checksum-sha256").and_then(|v| full_object_sha256(&v)),
            content_type: header("content-type"),
        }))
    }

    async fn open_get(&self, bucket: &str, key: &str) -> Result<reqwest::Response, StorageError> {
        let request = self.signed(Method::GET, bucket, key, &[], &[], EMPTY_PAYLOAD_SHA256);
        self.send(request, "GetObject", &object_address(bucket, key))
            .await
    }

    async fn put_once(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let digest = Sha256::digest(&body);
        let headers = [
            ("content-type", content_type.to_string()),
            ("x-amz-checksum-sha256", BASE64.encode(digest)),
        ];
        let request = self
            .signed(Method::PUT, bucket, key, &[], &headers, &hex::encode(digest))
            .body(body);
        self.send(request, "PutObject", &object_address(bucket, key))
            .await?;
        Ok(())
    }

    async fn copy_once(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<(), StorageError> {
        let address = object_address(dst_bucket, dst_key);
        let headers = [
            ("x-amz-copy-source", copy_source(src_bucket, src_key)),
            ("x-amz-checksum-algorithm", "SHA256".to_string()),
        ];
        let request = self.signed(
            Method::PUT,
            dst_bucket,
            dst_key,
            &[],
            &headers,
            EMPTY_PAYLOAD_SHA256,
        );
        let resp = self.send(request, "CopyObject", &address).await?;
        // CopyObject can report failure in a 200 response body.
        let body = resp
            .text()
            .await
            .map_err(|e| StorageError::Remote(format!("CopyObject {}: {}", address, e)))?;
        if body.contains("<Error>") {
            return Err(StorageError::Remote(format!(
                "CopyObject {}: {}",
                address,
                extract_xml_value(&body, "Message").unwrap_or(body)
            )));
        }
        Ok(())
    }

    async fn multipart_copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        size: u64,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<(), StorageError> {
        let address = object_address(dst_bucket, dst_key);
        let upload_id = self
            .retry
            .run("CreateMultipartUpload", &address, |_| {
                self.create_multipart(dst_bucket, dst_key)
            })
            .await?;
        debug!(%address, %upload_id, size, "multipart copy started");

        // Completed parts are kept; a part that fails is retried on its own.
        let mut parts: Vec<(u32, String)> = Vec::new();
        let mut start = 0u64;
        while start < size {
            let end = (start + self.part_size).min(size) - 1;
            let part_number = parts.len() as u32 + 1;
            let range = format!("bytes={}-{}", start, end);
            let outcome = self
                .retry
                .run("UploadPartCopy", &address, |_| {
                    self.copy_part(
                        src_bucket,
                        src_key,
                        dst_bucket,
                        dst_key,
                        &upload_id,
                        part_number,
                        &range,
                    )
                })
                .await;
            match outcome {
                Ok(etag) => parts.push((part_number, etag)),
                Err(e) => {
                    self.abort_multipart(dst_bucket, dst_key, &upload_id).await;
                    return Err(e);
                }
            }
            start = end + 1;
        }

        let completed = self
            .retry
            .run("CompleteMultipartUpload", &address, |_| {
                self.complete_multipart(dst_bucket, dst_key, &upload_id, &parts)
            })
            .await;
        if let Err(e) = completed {
            self.abort_multipart(dst_bucket, dst_key, &upload_id).await;
            return Err(e);
        }
        Ok(())
    }

    async fn create_multipart(&self, bucket: &str, key: &str) -> Result<String, StorageError> {
        let address = object_address(bucket, key);
        let request = self.signed(
            Method::POST,
            bucket,
            key,
            &[("uploads", "")],
            &[("x-amz-checksum-algorithm", "SHA256".to_string())],
            EMPTY_PAYLOAD_SHA256,
        );
        let body = self
            .send(request, "CreateMultipartUpload", &address)
            .await?
            .text()
            .await
            .map_err(|e| StorageError::Remote(format!("CreateMultipartUpload {}: {}", address, e)))?;
        extract_xml_value(&body, "UploadId").ok_or_else(|| {
            StorageError::Remote(format!("CreateMultipartUpload {}: no UploadId", address))
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn copy_part(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        upload_id: &str,
        part_number: u32,
        range: &str,
    ) -> Result<String, StorageError> {
        let address = object_address(dst_bucket, dst_key);
        let part = part_number.to_string();
        let headers = [
            ("x-amz-copy-source", copy_source(src_bucket, src_key)),
            ("x-amz-copy-source-range", range.to_string()),
        ];
        let request = self.signed(
            Method::PUT,
            dst_bucket,
            dst_key,
            &[("partNumber", &part), ("uploadId", upload_id)],
            &headers,
            EMPTY_PAYLOAD_SHA256,
        );
        let body = self
            .send(request, "UploadPartCopy", &address)
            .await?
            .text()
            .await
            .map_err(|e| StorageError::Remote(format!("UploadPartCopy {}: {}", address, e)))?;
        extract_xml_value(&body, "ETag")
            .ok_or_else(|| StorageError::Remote(format!("UploadPartCopy {}: no ETag", address)))
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> Result<(), StorageError> {
        let address = object_address(bucket, key);
        let mut xml = String::from("<CompleteMultipartUpload>");
        for (number, etag) in parts {
            xml.push_str(&format!(
                "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
                number, etag
            ));
        }
        xml.push_str("</CompleteMultipartUpload>");
        let body = xml.into_bytes();
        let request = self
            .signed(
                Method::POST,
                bucket,
                key,
                &[("uploadId", upload_id)],
                &[],
                &hex_sha256(&body),
            )
            .body(body);
        let text = self
            .send(request, "CompleteMultipartUpload", &address)
            .await?
            .text()
            .await
            .map_err(|e| StorageError::Remote(format!("CompleteMultipartUpload {}: {}", address, e)))?;
        if text.contains("<Error>") {
            return Err(StorageError::Remote(format!(
                "CompleteMultipartUpload {}: {}",
                address,
                extract_xml_value(&text, "Message").unwrap_or(text)
            )));
        }
        Ok(())
    }

    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) {
        let address = object_address(bucket, key);
        let request = self.signed(
            Method::DELETE,
            bucket,
            key,
            &[("uploadId", upload_id)],
            &[],
            EMPTY_PAYLOAD_SHA256,
        );
        if let Err(e) = self.send(request, "AbortMultipartUpload", &address).await {
            warn!(%address, upload_id, error = %e, "failed to abort multipart copy");
        }
    }

    async fn delete_once(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let request = self.signed(Method::DELETE, bucket, key, &[], &[], EMPTY_PAYLOAD_SHA256);
        self.send(request, "DeleteObject", &object_address(bucket, key))
            .await?;
        Ok(())
    }

    async fn list_once(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ObjectPage, StorageError> {
        let mut query = vec![("list-type", "2"), ("max-keys", "1000")];
        if !prefix.is_empty() {
            query.push(("prefix", prefix));
        }
        if let Some(token) = continuation {
            query.push(("continuation-token", token));
        }
        let request = self.signed(Method::GET, bucket, "", &query, &[], EMPTY_PAYLOAD_SHA256);
        let xml = self
            .send(request, "ListObjectsV2", &object_address(bucket, prefix))
            .await?
            .text()
            .await
            .map_err(|e| StorageError::Remote(format!("ListObjectsV2 {}: {}", bucket, e)))?;
        Ok(parse_list_objects_response(&xml))
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>, StorageError> {
        self.retry
            .run("HeadObject", &object_address(bucket, key), |_| {
                self.head_once(bucket, key)
            })
            .await
    }

    async fn get(
        &self,
        bucket: &str,
        key: &str,
        sink: &mut ChunkSink<'_>,
    ) -> Result<u64, StorageError> {
        let address = object_address(bucket, key);
        let mut resp = self
            .retry
            .run("GetObject", &address, |_| self.open_get(bucket, key))
            .await?;
        let mut total = 0u64;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| StorageError::Remote(format!("GetObject {}: {}", address, e)))?
        {
            sink(&chunk).map_err(|e| StorageError::io(&address, e))?;
            total += chunk.len() as u64;
        }
        Ok(total)
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.retry
            .run("PutObject", &object_address(bucket, key), |_| {
                self.put_once(bucket, key, body.clone(), content_type)
            })
            .await
    }

    async fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<(), StorageError> {
        let meta = self
            .head(src_bucket, src_key)
            .await?
            .ok_or_else(|| StorageError::NotFound(object_address(src_bucket, src_key)))?;
        if meta.size > self.multipart_threshold {
            return self
                .multipart_copy(src_bucket, src_key, meta.size, dst_bucket, dst_key)
                .await;
        }
        self.retry
            .run("CopyObject", &object_address(dst_bucket, dst_key), |_| {
                self.copy_once(src_bucket, src_key, dst_bucket, dst_key)
            })
            .await
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        self.retry
            .run("DeleteObject", &object_address(bucket, key), |_| {
                self.delete_once(bucket, key)
            })
            .await
    }

    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        continuation: Option<&str>,
    ) -> Result<ObjectPage, StorageError> {
        self.retry
            .run("ListObjectsV2", &object_address(bucket, prefix), |_| {
                self.list_once(bucket, prefix, continuation)
            })
            .await
    }
}

// ============ Helpers ============

fn object_address(bucket: &str, key: &str) -> String {
    format!("s3://{}/{}", bucket, key)
}

fn copy_source(bucket: &str, key: &str) -> String {
    format!("/{}/{}", bucket, encode_key(key))
}

fn status_error(operation: &str, address: &str, status: StatusCode, body: &str) -> StorageError {
    if status == StatusCode::NOT_FOUND {
        return StorageError::NotFound(address.to_string());
    }
    let detail = format!(
        "{} {} failed (HTTP {}): {}",
        operation,
        address,
        status,
        body.chars().take(500).collect::<String>()
    );
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        StorageError::Remote(detail)
    } else {
        StorageError::Rejected(detail)
    }
}

/// Hex digest from a base64 `x-amz-checksum-sha256` value. Composite
/// (multipart) checksums end in `-<parts>` and do not describe the full
/// object, so they yield `None`.
pub fn full_object_sha256(value: &str) -> Option<String> {
    if value.contains('-') {
        return None;
    }
    let raw = BASE64.decode(value.trim()).ok()?;
    (raw.len() == 32).then(|| hex::encode(raw))
}

fn encode_key(key: &str) -> String {
    key.split('/').map(uri_encode).collect::<Vec<_>>().join("/")
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Derive the SigV4 signing key.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding; everything but `A-Z a-z 0-9 - _ . ~` is escaped.
fn uri_encode(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}

fn parse_list_objects_response(xml: &str) -> ObjectPage {
    let mut objects = Vec::new();
    let is_truncated = extract_xml_value(xml, "IsTruncated").as_deref() == Some("true");
    let next_token = extract_xml_value(xml, "NextContinuationToken");

    let mut remaining = xml;
    while let Some(start) = remaining.find("<Contents>") {
        let block_start = start + "<Contents>".len();
        let Some(end) = remaining[block_start..].find("</Contents>") else {
            break;
        };
        let block = &remaining[block_start..block_start + end];
        remaining = &remaining[block_start + end + "</Contents>".len()..];

        let key = extract_xml_value(block, "Key").map(|k| unescape_xml(&k));
        let Some(key) = key.filter(|k| !k.is_empty()) else {
            continue;
        };
        objects.push(ObjectMeta {
            key,
            size: extract_xml_value(block, "Size")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            sha256: None,
            content_type: None,
        });
    }

    ObjectPage {
        objects,
        next_token: if is_truncated { next_token } else { None },
    }
}

/// Text content of the first `<tag>` (simple, non-nested).
fn extract_xml_value(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let value_start = xml.find(&open)? + open.len();
    let end = xml[value_start..].find(&close)?;
    Some(xml[value_start..value_start + end].to_string())
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
