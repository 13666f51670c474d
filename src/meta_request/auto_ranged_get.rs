/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Auto-ranged GET: discover the object size with a first-part probe, then
//! fan the remaining parts out as parallel ranged GETs. Part 0 is the probe
//! itself; its body is delivered like any other part.

use std::sync::Arc;

use http::header::RANGE;
use http::HeaderValue;

use crate::client::ClientInner;
use crate::error::{ErrorKind, TransferError};
use crate::http::{HttpRequest, HttpResponse};
use crate::meta_request::{FinishedActions, MetaRequestShared, NextRequest};
use crate::request::{Request, RequestKind};

pub(crate) struct GetState {
    message: HttpRequest,
    part_size: usize,
    probe_sent: bool,
    total_size: Option<u64>,
    num_parts: Option<u32>,
    next_part_index: u32,
    outstanding: u32,
    failed: bool,
}

impl GetState {
    pub(crate) fn new(message: HttpRequest, part_size: usize) -> Self {
        Self {
            message,
            part_size,
            probe_sent: false,
            total_size: None,
            num_parts: None,
            next_part_index: 0,
            outstanding: 0,
            failed: false,
        }
    }

    pub(crate) fn next_request(
        &mut self,
        shared: &Arc<MetaRequestShared>,
        client: &Arc<ClientInner>,
        cancelled: bool,
    ) -> Result<NextRequest, TransferError> {
        if cancelled || self.failed {
            return Ok(if self.outstanding == 0 {
                NextRequest::Finished
            } else {
                NextRequest::Pending
            });
        }
        if !self.probe_sent {
            // The probe is part 0: a ranged GET of the first part_size
            // bytes whose Content-Range reveals the object size.
            self.probe_sent = true;
            self.outstanding += 1;
            let end = self.part_size as u64 - 1;
            return Ok(NextRequest::Ready(
                self.part_request(shared, client, 0, (0, end)),
            ));
        }
        let Some(num_parts) = self.num_parts else {
            // Probe still in flight.
            return Ok(NextRequest::Pending);
        };
        if self.next_part_index < num_parts {
            let index = self.next_part_index;
            self.next_part_index += 1;
            self.outstanding += 1;
            let total = self
                .total_size
                .expect("object size is known once the part count is");
            let start = index as u64 * self.part_size as u64;
            let end = ((index as u64 + 1) * self.part_size as u64).min(total) - 1;
            Ok(NextRequest::Ready(
                self.part_request(shared, client, index, (start, end)),
            ))
        } else if self.outstanding == 0 {
            Ok(NextRequest::Finished)
        } else {
            Ok(NextRequest::Pending)
        }
    }

    fn part_request(
        &self,
        shared: &Arc<MetaRequestShared>,
        client: &Arc<ClientInner>,
        part_index: u32,
        range: (u64, u64),
    ) -> Request {
        let mut message = self.message.clone();
        let value = format!("bytes={}-{}", range.0, range.1);
        message.headers_mut().insert(
            RANGE,
            HeaderValue::from_str(&value).expect("range header value is valid ascii"),
        );
        Request::new(
            Arc::downgrade(shared),
            RequestKind::RangedGetPart,
            message,
            client.pending_request_guard(),
        )
        .with_part(part_index + 1, part_index)
        .with_range(range)
    }

    pub(crate) fn on_request_finished(
        &mut self,
        request: &Request,
        result: Result<HttpResponse, TransferError>,
    ) -> FinishedActions {
        self.outstanding = self.outstanding.saturating_sub(1);
        let mut actions = FinishedActions::default();
        match result {
            Err(err) => {
                self.failed = true;
                actions.error = Some(err);
            }
            Ok(response) => {
                if request.part_index == 0 {
                    match discover_size(&response, self.part_size) {
                        Ok((total, num_parts)) => {
                            self.total_size = Some(total);
                            self.num_parts = Some(num_parts);
                            self.next_part_index = 1;
                            actions.content_length = Some(total);
                            actions.headers =
                                Some((response.status(), response.headers().clone()));
                            actions.deliver = Some((0, 0, response.into_body()));
                        }
                        Err(err) => {
                            self.failed = true;
                            actions.error = Some(err);
                        }
                    }
                } else {
                    let offset = request.range.map(|(start, _)| start).unwrap_or(0);
                    actions.deliver =
                        Some((request.part_index, offset, response.into_body()));
                }
            }
        }
        actions
    }

    pub(crate) fn on_cancel(&mut self) {}

    pub(crate) fn is_complete(&self, cancelled: bool) -> bool {
        if cancelled || self.failed {
            return self.outstanding == 0;
        }
        match self.num_parts {
            Some(num_parts) => self.next_part_index >= num_parts && self.outstanding == 0,
            None => false,
        }
    }
}

/// Works out the object size and part count from the probe response.
///
/// A 206 carries `Content-Range: bytes START-END/TOTAL`. A plain 200 means
/// the server ignored the range and returned the whole object, so the probe
/// body is the whole object regardless of size.
fn discover_size(response: &HttpResponse, part_size: usize) -> Result<(u64, u32), TransferError> {
    if response.status() == http::StatusCode::PARTIAL_CONTENT {
        let header = response.header_str("content-range").ok_or_else(|| {
            TransferError::new(
                ErrorKind::Internal,
                "206 response is missing the Content-Range header",
            )
        })?;
        let (_, _, total) = parse_content_range(header).ok_or_else(|| {
            TransferError::new(
                ErrorKind::Internal,
                "could not parse the Content-Range header",
            )
        })?;
        let num_parts = if total <= part_size as u64 {
            1
        } else {
            (total.div_ceil(part_size as u64)) as u32
        };
        Ok((total, num_parts))
    } else {
        let total = match response.header_str("content-length") {
            Some(value) => value.parse::<u64>().map_err(|err| {
                TransferError::new(ErrorKind::Internal, "invalid Content-Length header")
                    .with_source(err)
            })?,
            None => response.body().len() as u64,
        };
        Ok((total, 1))
    }
}

/// Parses `bytes START-END/TOTAL`. `None` for unsatisfied (`*`) forms.
pub(crate) fn parse_content_range(value: &str) -> Option<(u64, u64, u64)> {
    let rest = value.strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let total = total.trim().parse::<u64>().ok()?;
    if total == 0 {
        // "bytes 0-0/0" style responses for empty objects
        return Some((0, 0, 0));
    }
    let (start, end) = range.split_once('-')?;
    Some((
        start.trim().parse().ok()?,
        end.trim().parse().ok()?,
        total,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_parses() {
        assert_eq!(
            Some((0, 7, 17)),
            parse_content_range("bytes 0-7/17")
        );
        assert_eq!(
            Some((8388608, 16777215, 17825792)),
            parse_content_range("bytes 8388608-16777215/17825792")
        );
        assert_eq!(Some((0, 0, 0)), parse_content_range("bytes 0-0/0"));
        assert_eq!(None, parse_content_range("bytes */17"));
        assert_eq!(None, parse_content_range("octets 0-7/17"));
        assert_eq!(None, parse_content_range("bytes 0-7"));
    }

    #[test]
    fn part_count_math() {
        let response = |total: u64| {
            let mut headers = http::HeaderMap::new();
            headers.insert(
                "content-range",
                format!("bytes 0-7/{total}").parse().unwrap(),
            );
            HttpResponse::new(
                http::StatusCode::PARTIAL_CONTENT,
                headers,
                bytes::Bytes::new(),
            )
        };
        let part_size = 8;
        assert_eq!((17, 3), discover_size(&response(17), part_size).unwrap());
        assert_eq!((16, 2), discover_size(&response(16), part_size).unwrap());
        assert_eq!((8, 1), discover_size(&response(8), part_size).unwrap());
        assert_eq!((3, 1), discover_size(&response(3), part_size).unwrap());
        assert_eq!((0, 1), discover_size(&response(0), part_size).unwrap());
    }

    #[test]
    fn plain_200_is_single_part() {
        let mut headers = http::HeaderMap::new();
        headers.insert("content-length", "40".parse().unwrap());
        let response = HttpResponse::new(
            http::StatusCode::OK,
            headers,
            bytes::Bytes::from(vec![0u8; 40]),
        );
        assert_eq!((40, 1), discover_size(&response, 8).unwrap());
    }
}
