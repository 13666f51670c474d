/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! An in-memory S3 that speaks the exact wire subset the client uses:
//! ranged GETs with `Content-Range`, the multipart-upload lifecycle, and
//! S3-style XML error bodies. Failures can be injected per operation and
//! part to exercise the retry and abort paths.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode};

use crate::http::{
    AcquireFuture, CallFuture, ConnectionManager, ConnectorError, HttpChannel, HttpClient,
    HttpRequest, HttpResponse, SharedConnectionManager, SharedHttpChannel, SharedHttpClient,
};

/// The operations the mock distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    /// Plain or ranged object GET.
    GetObject,
    /// `POST ?uploads`
    CreateUpload,
    /// `PUT ?partNumber=N&uploadId=U`
    UploadPart,
    /// `POST ?uploadId=U`
    CompleteUpload,
    /// `DELETE ?uploadId=U`
    AbortUpload,
    /// Anything else (HEAD, service calls).
    Other,
}

/// One request the mock served, for assertions on ordering.
#[derive(Debug, Clone)]
pub struct MockOperation {
    /// Operation classification.
    pub op: MockOp,
    /// Part number, for part uploads.
    pub part_number: Option<u32>,
    /// Upload id, for multipart calls.
    pub upload_id: Option<String>,
    /// Requested byte range, for ranged GETs.
    pub range: Option<(u64, u64)>,
}

/// How an injected failure presents.
#[derive(Debug, Clone)]
pub enum FailureMode {
    /// Respond with this HTTP status and body.
    Status(u16, &'static str),
    /// Fail below HTTP with an I/O error.
    Transport,
}

#[derive(Debug)]
struct FailureRule {
    op: MockOp,
    part_number: Option<u32>,
    range_start: Option<u64>,
    remaining: u32,
    mode: FailureMode,
}

#[derive(Debug)]
struct Upload {
    key: String,
    parts: BTreeMap<u32, (Bytes, String)>,
}

#[derive(Debug, Default)]
struct MockS3State {
    objects: HashMap<String, Bytes>,
    uploads: HashMap<String, Upload>,
    next_upload_id: u64,
    rules: Vec<FailureRule>,
    log: Vec<MockOperation>,
    completed: Vec<String>,
    aborted: Vec<String>,
    response_delay: Duration,
}

/// Shareable in-memory S3.
#[derive(Clone, Default)]
pub struct MockS3 {
    state: Arc<Mutex<MockS3State>>,
}

impl MockS3 {
    /// Creates an empty mock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an object.
    pub fn put_object(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(key.into(), data.into());
    }

    /// Reads an object back.
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    /// Injects `times` failures for matching requests.
    pub fn inject_failure(
        &self,
        op: MockOp,
        part_number: Option<u32>,
        times: u32,
        mode: FailureMode,
    ) {
        self.state.lock().unwrap().rules.push(FailureRule {
            op,
            part_number,
            range_start: None,
            remaining: times,
            mode,
        });
    }

    /// Injects `times` failures for ranged GETs starting at `offset`.
    pub fn inject_failure_at_offset(&self, offset: u64, times: u32, mode: FailureMode) {
        self.state.lock().unwrap().rules.push(FailureRule {
            op: MockOp::GetObject,
            part_number: None,
            range_start: Some(offset),
            remaining: times,
            mode,
        });
    }

    /// Every request served, in arrival order.
    pub fn operations(&self) -> Vec<MockOperation> {
        self.state.lock().unwrap().log.clone()
    }

    /// Upload ids that were completed.
    pub fn completed_uploads(&self) -> Vec<String> {
        self.state.lock().unwrap().completed.clone()
    }

    /// Upload ids that were aborted.
    pub fn aborted_uploads(&self) -> Vec<String> {
        self.state.lock().unwrap().aborted.clone()
    }

    /// Delays every response, so tests can observe transfers mid-flight.
    pub fn set_response_delay(&self, delay: Duration) {
        self.state.lock().unwrap().response_delay = delay;
    }

    fn response_delay(&self) -> Duration {
        self.state.lock().unwrap().response_delay
    }

    /// An [`HttpClient`] seam backed by this mock.
    pub fn http_client(&self) -> SharedHttpClient {
        SharedHttpClient::new(MockHttpClient { s3: self.clone() })
    }

    fn handle(&self, request: HttpRequest) -> Result<HttpResponse, ConnectorError> {
        let key = request.uri().path().trim_start_matches('/').to_string();
        let query = parse_query(request.uri().query().unwrap_or(""));
        let upload_id = query.get("uploadId").cloned();
        let part_number = query
            .get("partNumber")
            .and_then(|value| value.parse::<u32>().ok());
        let range = request
            .headers()
            .get(http::header::RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_range);

        let op = if query.contains_key("uploads") {
            MockOp::CreateUpload
        } else if part_number.is_some() && upload_id.is_some() {
            MockOp::UploadPart
        } else if upload_id.is_some() {
            if request.method() == Method::POST {
                MockOp::CompleteUpload
            } else if request.method() == Method::DELETE {
                MockOp::AbortUpload
            } else {
                MockOp::Other
            }
        } else if request.method() == Method::GET {
            MockOp::GetObject
        } else {
            MockOp::Other
        };

        let mut state = self.state.lock().unwrap();
        state.log.push(MockOperation {
            op,
            part_number,
            upload_id: upload_id.clone(),
            range,
        });

        if let Some(mode) = take_failure(&mut state, op, part_number, range) {
            return match mode {
                FailureMode::Status(code, body) => Ok(status_response(code, body)),
                FailureMode::Transport => Err(ConnectorError::io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "injected transport failure",
                ))),
            };
        }

        if !request.headers().contains_key(http::header::AUTHORIZATION) {
            return Ok(error_response(
                StatusCode::FORBIDDEN,
                "AccessDenied",
                "request is not signed",
            ));
        }

        match op {
            MockOp::CreateUpload => {
                state.next_upload_id += 1;
                let id = format!("upload-{}", state.next_upload_id);
                state.uploads.insert(
                    id.clone(),
                    Upload {
                        key,
                        parts: BTreeMap::new(),
                    },
                );
                let body = format!(
                    "<InitiateMultipartUploadResult><UploadId>{id}</UploadId></InitiateMultipartUploadResult>"
                );
                Ok(xml_response(StatusCode::OK, body))
            }
            MockOp::UploadPart => {
                let id = upload_id.expect("part uploads carry an upload id");
                let part = part_number.expect("part uploads carry a part number");
                let Some(upload) = state.uploads.get_mut(&id) else {
                    return Ok(error_response(
                        StatusCode::NOT_FOUND,
                        "NoSuchUpload",
                        "unknown upload id",
                    ));
                };
                let body = request.body().cloned().unwrap_or_default();
                let etag = format!("\"etag-{part}-{}\"", body.len());
                upload.parts.insert(part, (body, etag.clone()));
                let mut headers = HeaderMap::new();
                headers.insert(
                    http::header::ETAG,
                    HeaderValue::from_str(&etag).expect("etag is ascii"),
                );
                Ok(HttpResponse::new(StatusCode::OK, headers, Bytes::new()))
            }
            MockOp::CompleteUpload => {
                let id = upload_id.expect("complete carries an upload id");
                let Some(upload) = state.uploads.remove(&id) else {
                    return Ok(error_response(
                        StatusCode::NOT_FOUND,
                        "NoSuchUpload",
                        "unknown upload id",
                    ));
                };
                let mut data = Vec::new();
                for (expected, (number, entry)) in upload.parts.iter().enumerate() {
                    if *number != expected as u32 + 1 {
                        return Ok(error_response(
                            StatusCode::BAD_REQUEST,
                            "InvalidPart",
                            "part numbers are not contiguous",
                        ));
                    }
                    data.extend_from_slice(&entry.0);
                }
                state.objects.insert(upload.key.clone(), data.into());
                state.completed.push(id);
                Ok(xml_response(
                    StatusCode::OK,
                    "<CompleteMultipartUploadResult/>".to_string(),
                ))
            }
            MockOp::AbortUpload => {
                let id = upload_id.expect("abort carries an upload id");
                state.uploads.remove(&id);
                state.aborted.push(id);
                Ok(HttpResponse::new(
                    StatusCode::NO_CONTENT,
                    HeaderMap::new(),
                    Bytes::new(),
                ))
            }
            MockOp::GetObject => {
                let Some(object) = state.objects.get(&key).cloned() else {
                    return Ok(error_response(
                        StatusCode::NOT_FOUND,
                        "NoSuchKey",
                        "no such key",
                    ));
                };
                Ok(get_response(&object, range))
            }
            MockOp::Other => {
                let mut headers = HeaderMap::new();
                headers.insert("content-length", HeaderValue::from_static("0"));
                Ok(HttpResponse::new(StatusCode::OK, headers, Bytes::new()))
            }
        }
    }
}

impl fmt::Debug for MockS3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockS3").finish_non_exhaustive()
    }
}

fn take_failure(
    state: &mut MockS3State,
    op: MockOp,
    part_number: Option<u32>,
    range: Option<(u64, u64)>,
) -> Option<FailureMode> {
    for rule in state.rules.iter_mut() {
        if rule.remaining == 0 || rule.op != op {
            continue;
        }
        if let Some(wanted) = rule.part_number {
            if part_number != Some(wanted) {
                continue;
            }
        }
        if let Some(wanted) = rule.range_start {
            if range.map(|(start, _)| start) != Some(wanted) {
                continue;
            }
        }
        rule.remaining -= 1;
        return Some(rule.mode.clone());
    }
    None
}

fn parse_query(query: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        match pair.split_once('=') {
            Some((name, value)) => map.insert(name.to_string(), value.to_string()),
            None => map.insert(pair.to_string(), String::new()),
        };
    }
    map
}

/// Parses `bytes=START-END`.
fn parse_range(value: &str) -> Option<(u64, u64)> {
    let rest = value.strip_prefix("bytes=")?;
    let (start, end) = rest.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

fn get_response(object: &Bytes, range: Option<(u64, u64)>) -> HttpResponse {
    let total = object.len() as u64;
    match range {
        None => {
            let mut headers = HeaderMap::new();
            headers.insert(
                "content-length",
                HeaderValue::from_str(&total.to_string()).expect("digits"),
            );
            headers.insert("accept-ranges", HeaderValue::from_static("bytes"));
            HttpResponse::new(StatusCode::OK, headers, object.clone())
        }
        Some((start, end)) => {
            let mut headers = HeaderMap::new();
            headers.insert("accept-ranges", HeaderValue::from_static("bytes"));
            if total == 0 {
                headers.insert(
                    "content-range",
                    HeaderValue::from_static("bytes 0-0/0"),
                );
                headers.insert("content-length", HeaderValue::from_static("0"));
                return HttpResponse::new(StatusCode::PARTIAL_CONTENT, headers, Bytes::new());
            }
            let end = end.min(total - 1);
            let body = object.slice(start as usize..=end as usize);
            headers.insert(
                "content-range",
                HeaderValue::from_str(&format!("bytes {start}-{end}/{total}")).expect("ascii"),
            );
            headers.insert(
                "content-length",
                HeaderValue::from_str(&body.len().to_string()).expect("digits"),
            );
            HttpResponse::new(StatusCode::PARTIAL_CONTENT, headers, body)
        }
    }
}

fn xml_response(status: StatusCode, body: String) -> HttpResponse {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/xml"));
    HttpResponse::new(status, headers, body.into())
}

fn error_response(status: StatusCode, code: &str, message: &str) -> HttpResponse {
    let body = format!("<Error><Code>{code}</Code><Message>{message}</Message></Error>");
    xml_response(status, body)
}

fn status_response(code: u16, body: &'static str) -> HttpResponse {
    let status = StatusCode::from_u16(code).expect("valid status code");
    xml_response(status, body.to_string())
}

#[derive(Debug)]
struct MockHttpClient {
    s3: MockS3,
}

impl HttpClient for MockHttpClient {
    fn connection_manager(&self, _host: &str, _address: IpAddr) -> SharedConnectionManager {
        SharedConnectionManager::new(MockConnectionManager {
            s3: self.s3.clone(),
        })
    }
}

#[derive(Debug)]
struct MockConnectionManager {
    s3: MockS3,
}

impl ConnectionManager for MockConnectionManager {
    fn acquire(&self) -> AcquireFuture {
        let channel = SharedHttpChannel::new(MockChannel {
            s3: self.s3.clone(),
        });
        AcquireFuture::ready(Ok(channel))
    }

    fn release(&self, _channel: SharedHttpChannel) {}
}

#[derive(Debug)]
struct MockChannel {
    s3: MockS3,
}

impl HttpChannel for MockChannel {
    fn call(&self, request: HttpRequest) -> CallFuture {
        let s3 = self.s3.clone();
        CallFuture::new(async move {
            let delay = s3.response_delay();
            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
            s3.handle(request)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_get(path: &str, range: Option<&str>) -> HttpRequest {
        let mut request = HttpRequest::new(Method::GET, path.parse().unwrap());
        request
            .headers_mut()
            .insert(http::header::AUTHORIZATION, HeaderValue::from_static("x"));
        if let Some(range) = range {
            request.headers_mut().insert(
                http::header::RANGE,
                HeaderValue::from_str(range).unwrap(),
            );
        }
        request
    }

    #[test]
    fn ranged_get_returns_content_range() {
        let s3 = MockS3::new();
        s3.put_object("key", Bytes::from_static(b"0123456789"));
        let response = s3.handle(signed_get("/key", Some("bytes=2-5"))).unwrap();
        assert_eq!(StatusCode::PARTIAL_CONTENT, response.status());
        assert_eq!(Some("bytes 2-5/10"), response.header_str("content-range"));
        assert_eq!(b"2345".as_slice(), &response.body()[..]);
    }

    #[test]
    fn range_past_the_end_is_clamped() {
        let s3 = MockS3::new();
        s3.put_object("key", Bytes::from_static(b"0123456789"));
        let response = s3.handle(signed_get("/key", Some("bytes=8-99"))).unwrap();
        assert_eq!(Some("bytes 8-9/10"), response.header_str("content-range"));
        assert_eq!(b"89".as_slice(), &response.body()[..]);
    }

    #[test]
    fn unsigned_requests_are_denied() {
        let s3 = MockS3::new();
        s3.put_object("key", Bytes::from_static(b"data"));
        let mut request = HttpRequest::new(Method::GET, "/key".parse().unwrap());
        request.headers_mut().insert(
            http::header::RANGE,
            HeaderValue::from_static("bytes=0-3"),
        );
        let response = s3.handle(request).unwrap();
        assert_eq!(StatusCode::FORBIDDEN, response.status());
    }

    #[test]
    fn multipart_lifecycle_assembles_object() {
        let s3 = MockS3::new();
        let create = {
            let mut request = HttpRequest::new(Method::POST, "/key?uploads".parse().unwrap());
            request
                .headers_mut()
                .insert(http::header::AUTHORIZATION, HeaderValue::from_static("x"));
            request
        };
        let response = s3.handle(create).unwrap();
        let body = String::from_utf8_lossy(response.body()).to_string();
        let upload_id = crate::xml::top_level_tag(&body, "UploadId").unwrap();

        for (part, data) in [(1u32, "hello "), (2, "world")] {
            let mut request = HttpRequest::new(
                Method::PUT,
                format!("/key?partNumber={part}&uploadId={upload_id}")
                    .parse()
                    .unwrap(),
            );
            request
                .headers_mut()
                .insert(http::header::AUTHORIZATION, HeaderValue::from_static("x"));
            request.set_body(Bytes::from(data.as_bytes()));
            let response = s3.handle(request).unwrap();
            assert!(response.header_str("etag").is_some());
        }

        let mut complete = HttpRequest::new(
            Method::POST,
            format!("/key?uploadId={upload_id}").parse().unwrap(),
        );
        complete
            .headers_mut()
            .insert(http::header::AUTHORIZATION, HeaderValue::from_static("x"));
        let response = s3.handle(complete).unwrap();
        assert_eq!(StatusCode::OK, response.status());
        assert_eq!(
            Bytes::from_static(b"hello world"),
            s3.object("key").unwrap()
        );
        assert_eq!(vec![upload_id], s3.completed_uploads());
    }

    #[test]
    fn injected_failures_are_consumed() {
        let s3 = MockS3::new();
        s3.put_object("key", Bytes::from_static(b"data"));
        s3.inject_failure(
            MockOp::GetObject,
            None,
            1,
            FailureMode::Status(503, "<Error><Code>SlowDown</Code></Error>"),
        );
        let first = s3.handle(signed_get("/key", Some("bytes=0-3"))).unwrap();
        assert_eq!(StatusCode::SERVICE_UNAVAILABLE, first.status());
        let second = s3.handle(signed_get("/key", Some("bytes=0-3"))).unwrap();
        assert_eq!(StatusCode::PARTIAL_CONTENT, second.status());
    }
}
