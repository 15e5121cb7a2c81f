//! S3 server-side copies against a fake S3 endpoint.
//!
//! The fake keeps object sizes only. `UploadPartCopy` requests fail with
//! HTTP 503 as often as the test asks for a given `(key, part)`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;

use doc_intake::config::S3Config;
use doc_intake::error::StorageError;
use doc_intake::storage::s3::AwsCredentials;
use doc_intake::storage::{RetryPolicy, S3Store, Storage};

#[derive(Default)]
struct FakeState {
    objects: HashMap<String, u64>,
    /// Remaining 503 answers per `(key, part number)`.
    failing_parts: HashMap<(String, u32), u32>,
    /// Every part request as `(key, part number, succeeded)`.
    part_calls: Vec<(String, u32, bool)>,
    /// Copied ranges by part number for each destination key.
    ranges: HashMap<String, Vec<(u32, String)>>,
    uploads_created: u32,
    completed: Vec<String>,
    aborted: Vec<String>,
}

#[derive(Clone, Default)]
struct FakeS3 {
    state: Arc<Mutex<FakeState>>,
}

impl FakeS3 {
    fn add_object(&self, key: &str, size: u64) {
        self.state.lock().unwrap().objects.insert(key.to_string(), size);
    }

    fn fail_part(&self, key: &str, part: u32, times: u32) {
        self.state
            .lock()
            .unwrap()
            .failing_parts
            .insert((key.to_string(), part), times);
    }
}

fn query_pairs(uri: &Uri) -> HashMap<String, String> {
    uri.query()
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

async fn handle(
    State(fake): State<FakeS3>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    _body: Bytes,
) -> Response {
    // Path style: /<bucket>/<key>
    let path = uri.path().trim_start_matches('/');
    let key = path.split_once('/').map(|(_, k)| k).unwrap_or("").to_string();
    let query = query_pairs(&uri);
    let source_key = headers
        .get("x-amz-copy-source")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start_matches('/').split_once('/').map(|(_, k)| k.to_string()).unwrap_or_default());
    let mut state = fake.state.lock().unwrap();

    match method {
        Method::HEAD => match state.objects.get(&key) {
            Some(size) => (StatusCode::OK, [(header::CONTENT_LENGTH, size.to_string())]).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        Method::POST if query.contains_key("uploads") => {
            state.uploads_created += 1;
            "<InitiateMultipartUploadResult><UploadId>upload-1</UploadId></InitiateMultipartUploadResult>"
                .into_response()
        }
        Method::POST if query.contains_key("uploadId") => {
            let size: u64 = state
                .ranges
                .get(&key)
                .into_iter()
                .flatten()
                .filter_map(|(_, range)| range.strip_prefix("bytes=")?.split_once('-'))
                .map(|(start, end)| end.parse::<u64>().unwrap() - start.parse::<u64>().unwrap() + 1)
                .sum();
            state.completed.push(key.clone());
            state.objects.insert(key, size);
            "<CompleteMultipartUploadResult></CompleteMultipartUploadResult>".into_response()
        }
        Method::PUT if query.contains_key("partNumber") => {
            let part: u32 = query["partNumber"].parse().unwrap();
            let remaining = state.failing_parts.get_mut(&(key.clone(), part));
            if let Some(remaining) = remaining.filter(|r| **r > 0) {
                *remaining -= 1;
                state.part_calls.push((key, part, false));
                return (StatusCode::SERVICE_UNAVAILABLE, "SlowDown").into_response();
            }
            let range = headers
                .get("x-amz-copy-source-range")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            state.part_calls.push((key.clone(), part, true));
            state.ranges.entry(key).or_default().push((part, range));
            format!("<CopyPartResult><ETag>etag-{}</ETag></CopyPartResult>", part).into_response()
        }
        Method::PUT => match source_key.and_then(|k| state.objects.get(&k).copied()) {
            Some(size) => {
                state.objects.insert(key, size);
                "<CopyObjectResult></CopyObjectResult>".into_response()
            }
            None => StatusCode::NOT_FOUND.into_response(),
        },
        Method::DELETE if query.contains_key("uploadId") => {
            state.aborted.push(key);
            StatusCode::NO_CONTENT.into_response()
        }
        Method::DELETE => {
            state.objects.remove(&key);
            StatusCode::NO_CONTENT.into_response()
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

/// Objects above 8 bytes are copied in 4-byte parts.
async fn serve() -> (Storage, FakeS3) {
    let fake = FakeS3::default();
    let app = Router::new().fallback(handle).with_state(fake.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let config = S3Config {
        region: "us-east-1".to_string(),
        endpoint_url: Some(format!("http://{}", addr)),
    };
    let creds = AwsCredentials {
        access_key_id: "AKIDEXAMPLE".to_string(),
        secret_access_key: "secret".to_string(),
        session_token: None,
    };
    let retry = RetryPolicy::new(3).with_base_delay(Duration::from_millis(1));
    let store = S3Store::new(&config, creds, retry).with_multipart_copy(8, 4);
    let storage = Storage::with_object_store(Arc::new(store), None).unwrap();
    (storage, fake)
}

#[tokio::test]
async fn multipart_copy_retries_only_the_failed_part() {
    let (storage, fake) = serve().await;
    fake.add_object("in/big.pdf", 10);
    fake.fail_part("processing/big.pdf", 2, 1);

    let src = storage.path("s3://bucket/in/big.pdf").unwrap();
    let dest = storage.path("s3://bucket/processing/big.pdf").unwrap();
    src.move_to(&dest).await.unwrap();

    let state = fake.state.lock().unwrap();
    assert_eq!(state.uploads_created, 1);
    let calls: Vec<(u32, bool)> = state.part_calls.iter().map(|(_, p, ok)| (*p, *ok)).collect();
    assert_eq!(calls, vec![(1, true), (2, false), (2, true), (3, true)]);
    assert_eq!(
        state.ranges["processing/big.pdf"],
        vec![
            (1, "bytes=0-3".to_string()),
            (2, "bytes=4-7".to_string()),
            (3, "bytes=8-9".to_string()),
        ]
    );
    assert_eq!(state.completed, vec!["processing/big.pdf".to_string()]);
    assert!(state.aborted.is_empty());
    assert!(!state.objects.contains_key("in/big.pdf"));
    assert_eq!(state.objects.get("processing/big.pdf"), Some(&10));
}

#[tokio::test]
async fn exhausted_part_retries_abort_and_fail_only_that_file() {
    let (storage, fake) = serve().await;
    fake.add_object("in/big.pdf", 10);
    fake.add_object("in/small.pdf", 5);
    fake.fail_part("processing/big.pdf", 2, 100);

    let big = storage.path("s3://bucket/in/big.pdf").unwrap();
    let err = big
        .move_to(&storage.path("s3://bucket/processing/big.pdf").unwrap())
        .await
        .unwrap_err();
    match err {
        StorageError::RetriesExhausted {
            operation, attempts, ..
        } => {
            assert_eq!(operation, "UploadPartCopy");
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected error {:?}", other),
    }

    let small = storage.path("s3://bucket/in/small.pdf").unwrap();
    small
        .move_to(&storage.path("s3://bucket/processing/small.pdf").unwrap())
        .await
        .unwrap();

    let state = fake.state.lock().unwrap();
    assert_eq!(state.aborted, vec!["processing/big.pdf".to_string()]);
    assert!(state.completed.is_empty());
    let part_two = state
        .part_calls
        .iter()
        .filter(|(_, part, _)| *part == 2)
        .count();
    assert_eq!(part_two, 3);
    assert!(!state.part_calls.iter().any(|(_, part, _)| *part == 3));
    // The failed file stays at its source; the other one moved.
    assert!(state.objects.contains_key("in/big.pdf"));
    assert!(!state.objects.contains_key("processing/big.pdf"));
    assert!(!state.objects.contains_key("in/small.pdf"));
    assert_eq!(state.objects.get("processing/small.pdf"), Some(&5));
}
