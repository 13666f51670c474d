/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Auto-ranged PUT: the multipart upload state machine.
//!
//! Create -> N x UploadPart -> Complete, or a best-effort Abort after any
//! non-recoverable failure past Create. The input stream is read strictly
//! sequentially, one part per work-loop pass; parts may complete out of
//! order and their ETags are slotted by part number.

use std::fmt::Write as _;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST};
use http::{HeaderValue, Method, Uri};
use tracing::debug;

use crate::client::ClientInner;
use crate::endpoint::query_encode;
use crate::error::{ErrorKind, TransferError};
use crate::http::{copy_headers, HttpRequest, HttpResponse};
use crate::io::{read_part, InputStream};
use crate::meta_request::{FinishedActions, MetaRequestShared, NextRequest, TransferProgress};
use crate::request::{Request, RequestKind};
use crate::xml;

enum PutPhase {
    /// CreateMultipartUpload not yet issued / in flight.
    Create { sent: bool },
    /// Reading the stream and uploading parts.
    Upload,
    /// CompleteMultipartUpload in flight.
    Complete,
    /// AbortMultipartUpload in flight.
    Abort,
    Done,
}

pub(crate) struct PutState {
    message: HttpRequest,
    part_size: usize,
    phase: PutPhase,
    upload_id: Option<String>,
    etags: Vec<Option<String>>,
    /// 1-based number of the next part to read from the stream.
    next_part_number: u32,
    stream: Box<dyn InputStream>,
    stream_done: bool,
    total_parts: Option<u32>,
    outstanding: u32,
    parts_completed: u32,
    failed: bool,
    skip_abort: bool,
    bytes_uploaded: u64,
}

impl PutState {
    pub(crate) fn new(
        message: HttpRequest,
        part_size: usize,
        stream: Box<dyn InputStream>,
    ) -> Self {
        Self {
            message,
            part_size,
            phase: PutPhase::Create { sent: false },
            upload_id: None,
            etags: Vec::new(),
            next_part_number: 1,
            stream,
            stream_done: false,
            total_parts: None,
            outstanding: 0,
            parts_completed: 0,
            failed: false,
            skip_abort: false,
            bytes_uploaded: 0,
        }
    }

    pub(crate) fn next_request(
        &mut self,
        shared: &Arc<MetaRequestShared>,
        client: &Arc<ClientInner>,
        cancelled: bool,
    ) -> Result<NextRequest, TransferError> {
        if self.failed || cancelled {
            if self.outstanding > 0 {
                return Ok(NextRequest::Pending);
            }
            return Ok(match self.phase {
                PutPhase::Done => NextRequest::Finished,
                PutPhase::Abort => NextRequest::Pending,
                _ => {
                    if self.upload_id.is_some() && !self.skip_abort {
                        self.phase = PutPhase::Abort;
                        self.outstanding += 1;
                        NextRequest::Ready(self.abort_request(shared, client)?)
                    } else {
                        self.phase = PutPhase::Done;
                        NextRequest::Finished
                    }
                }
            });
        }
        match self.phase {
            PutPhase::Create { sent: false } => {
                self.phase = PutPhase::Create { sent: true };
                self.outstanding += 1;
                Ok(NextRequest::Ready(self.create_request(shared, client)?))
            }
            PutPhase::Create { sent: true } => Ok(NextRequest::Pending),
            PutPhase::Upload => {
                if !self.stream_done {
                    let body = read_part(self.stream.as_mut(), self.part_size).map_err(|err| {
                        TransferError::new(ErrorKind::Internal, "failed to read the upload body")
                            .with_source(err)
                    })?;
                    let part_number = self.next_part_number;
                    if body.is_empty() && part_number > 1 {
                        self.stream_done = true;
                        self.total_parts = Some(part_number - 1);
                    } else {
                        // A short (or empty, for a zero-byte object) read is
                        // the last part.
                        if body.len() < self.part_size {
                            self.stream_done = true;
                            self.total_parts = Some(part_number);
                        }
                        self.next_part_number = part_number + 1;
                        if self.etags.len() < part_number as usize {
                            self.etags.resize(part_number as usize, None);
                        }
                        self.outstanding += 1;
                        return Ok(NextRequest::Ready(self.part_request(
                            shared,
                            client,
                            part_number,
                            body,
                        )?));
                    }
                }
                if self.stream_done
                    && self.outstanding == 0
                    && Some(self.parts_completed) == self.total_parts
                {
                    self.phase = PutPhase::Complete;
                    self.outstanding += 1;
                    return Ok(NextRequest::Ready(self.complete_request(shared, client)?));
                }
                Ok(NextRequest::Pending)
            }
            PutPhase::Complete | PutPhase::Abort => Ok(NextRequest::Pending),
            PutPhase::Done => Ok(NextRequest::Finished),
        }
    }

    pub(crate) fn on_request_finished(
        &mut self,
        request: &Request,
        result: Result<HttpResponse, TransferError>,
    ) -> FinishedActions {
        self.outstanding = self.outstanding.saturating_sub(1);
        let mut actions = FinishedActions::default();
        match request.kind {
            RequestKind::CreateMultipartUpload => match result {
                Ok(response) => {
                    let body = String::from_utf8_lossy(response.body());
                    match xml::top_level_tag(&body, "UploadId").filter(|id| !id.is_empty()) {
                        Some(id) => {
                            debug!(upload_id = %id, "multipart upload created");
                            self.upload_id = Some(id);
                            self.phase = PutPhase::Upload;
                        }
                        None => {
                            self.failed = true;
                            actions.error = Some(TransferError::new(
                                ErrorKind::Internal,
                                "create response is missing an UploadId",
                            ));
                        }
                    }
                }
                Err(err) => {
                    self.failed = true;
                    actions.error = Some(err);
                }
            },
            RequestKind::UploadPart => match result {
                Ok(response) => match response.header_str("etag") {
                    Some(etag) => {
                        self.etags[(request.part_number - 1) as usize] = Some(etag.to_string());
                        self.parts_completed += 1;
                        self.bytes_uploaded += request
                            .message
                            .body()
                            .map(|body| body.len() as u64)
                            .unwrap_or(0);
                        actions.progress = Some(TransferProgress {
                            bytes_transferred: self.bytes_uploaded,
                            content_length: None,
                        });
                    }
                    None => {
                        self.failed = true;
                        actions.error = Some(TransferError::new(
                            ErrorKind::Internal,
                            "part response is missing an ETag",
                        ));
                    }
                },
                Err(err) => {
                    self.failed = true;
                    actions.error = Some(err);
                }
            },
            RequestKind::CompleteMultipartUpload => match result {
                Ok(response) => {
                    self.phase = PutPhase::Done;
                    actions.headers = Some((response.status(), response.headers().clone()));
                }
                Err(err) => {
                    // No abort once a complete has been issued.
                    self.failed = true;
                    self.skip_abort = true;
                    actions.error = Some(err);
                }
            },
            RequestKind::AbortMultipartUpload => {
                // Best effort; the abort's outcome never replaces the
                // original failure.
                if let Err(err) = result {
                    debug!(error = %err, "abort multipart upload failed");
                }
                self.phase = PutPhase::Done;
            }
            _ => {}
        }
        actions
    }

    pub(crate) fn on_cancel(&mut self, skip_abort: bool) {
        if skip_abort {
            self.skip_abort = true;
        }
    }

    pub(crate) fn is_complete(&self, _cancelled: bool) -> bool {
        matches!(self.phase, PutPhase::Done) && self.outstanding == 0
    }

    fn host_value(&self) -> Result<HeaderValue, TransferError> {
        self.message
            .headers()
            .get(HOST)
            .cloned()
            .ok_or_else(|| TransferError::new(ErrorKind::Internal, "message template lost its Host header"))
    }

    fn sub_request_uri(&self, query: &str) -> Result<Uri, TransferError> {
        let path = self.message.uri().path();
        Uri::try_from(format!("{path}?{query}")).map_err(|err| {
            TransferError::new(ErrorKind::Internal, "failed to build sub-request uri")
                .with_source(err)
        })
    }

    fn upload_id_query(&self) -> Result<String, TransferError> {
        let upload_id = self.upload_id.as_deref().ok_or_else(|| {
            TransferError::new(ErrorKind::Internal, "upload id is not set yet")
        })?;
        Ok(format!("uploadId={}", query_encode(upload_id)))
    }

    fn create_request(
        &self,
        shared: &Arc<MetaRequestShared>,
        client: &Arc<ClientInner>,
    ) -> Result<Request, TransferError> {
        let mut message = HttpRequest::new(Method::POST, self.sub_request_uri("uploads")?);
        // User metadata and content headers belong on the create call.
        copy_headers(self.message.headers(), message.headers_mut());
        message.headers_mut().remove(CONTENT_LENGTH);
        Ok(Request::new(
            Arc::downgrade(shared),
            RequestKind::CreateMultipartUpload,
            message,
            client.pending_request_guard(),
        ))
    }

    fn part_request(
        &self,
        shared: &Arc<MetaRequestShared>,
        client: &Arc<ClientInner>,
        part_number: u32,
        body: Bytes,
    ) -> Result<Request, TransferError> {
        let query = format!("partNumber={}&{}", part_number, self.upload_id_query()?);
        let mut message = HttpRequest::new(Method::PUT, self.sub_request_uri(&query)?);
        message.headers_mut().insert(HOST, self.host_value()?);
        message
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        message.set_body(body);
        Ok(Request::new(
            Arc::downgrade(shared),
            RequestKind::UploadPart,
            message,
            client.pending_request_guard(),
        )
        .with_part(part_number, part_number - 1))
    }

    fn complete_request(
        &self,
        shared: &Arc<MetaRequestShared>,
        client: &Arc<ClientInner>,
    ) -> Result<Request, TransferError> {
        let body = complete_body(&self.etags)?;
        let mut message = HttpRequest::new(Method::POST, self.sub_request_uri(&self.upload_id_query()?)?);
        message.headers_mut().insert(HOST, self.host_value()?);
        message
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/xml"));
        message
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        message.set_body(body);
        Ok(Request::new(
            Arc::downgrade(shared),
            RequestKind::CompleteMultipartUpload,
            message,
            client.pending_request_guard(),
        ))
    }

    fn abort_request(
        &self,
        shared: &Arc<MetaRequestShared>,
        client: &Arc<ClientInner>,
    ) -> Result<Request, TransferError> {
        let mut message = HttpRequest::new(Method::DELETE, self.sub_request_uri(&self.upload_id_query()?)?);
        message.headers_mut().insert(HOST, self.host_value()?);
        Ok(Request::new(
            Arc::downgrade(shared),
            RequestKind::AbortMultipartUpload,
            message,
            client.pending_request_guard(),
        ))
    }
}

/// Renders the CompleteMultipartUpload payload with parts ascending.
fn complete_body(etags: &[Option<String>]) -> Result<Bytes, TransferError> {
    let mut body = String::from("<CompleteMultipartUpload>");
    for (index, etag) in etags.iter().enumerate() {
        let etag = etag.as_deref().ok_or_else(|| {
            TransferError::new(
                ErrorKind::Internal,
                "complete issued with a missing part ETag",
            )
        })?;
        let _ = write!(
            body,
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            index + 1,
            xml::escape(etag)
        );
    }
    body.push_str("</CompleteMultipartUpload>");
    Ok(body.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_body_orders_parts() {
        let etags = vec![
            Some("\"e1\"".to_string()),
            Some("\"e2\"".to_string()),
            Some("\"e3\"".to_string()),
        ];
        let body = complete_body(&etags).unwrap();
        let rendered = std::str::from_utf8(&body).unwrap();
        assert_eq!(
            "<CompleteMultipartUpload>\
             <Part><PartNumber>1</PartNumber><ETag>\"e1\"</ETag></Part>\
             <Part><PartNumber>2</PartNumber><ETag>\"e2\"</ETag></Part>\
             <Part><PartNumber>3</PartNumber><ETag>\"e3\"</ETag></Part>\
             </CompleteMultipartUpload>",
            rendered
        );
    }

    #[test]
    fn complete_body_rejects_missing_etag() {
        let etags = vec![Some("\"e1\"".to_string()), None];
        assert!(complete_body(&etags).is_err());
    }
}
