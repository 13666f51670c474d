/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! One HTTP exchange on behalf of a meta request.

use std::fmt;
use std::sync::Weak;

use crate::client::PendingCountGuard;
use crate::http::HttpRequest;
use crate::meta_request::MetaRequestShared;
use crate::retries::RetryToken;

/// What a sub-request does on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    /// A ranged GET of one part. Part 0 doubles as the size probe.
    RangedGetPart,
    /// `POST /key?uploads`
    CreateMultipartUpload,
    /// `PUT /key?partNumber=N&uploadId=U`
    UploadPart,
    /// `POST /key?uploadId=U`
    CompleteMultipartUpload,
    /// `DELETE /key?uploadId=U`
    AbortMultipartUpload,
    /// The caller's message forwarded verbatim.
    Default,
}

impl RequestKind {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            RequestKind::RangedGetPart => "ranged get part",
            RequestKind::CreateMultipartUpload => "create multipart upload",
            RequestKind::UploadPart => "upload part",
            RequestKind::CompleteMultipartUpload => "complete multipart upload",
            RequestKind::AbortMultipartUpload => "abort multipart upload",
            RequestKind::Default => "default",
        }
    }
}

/// Immutable descriptor of one HTTP exchange, plus its retry state.
///
/// Holding a `Request` holds one unit of the client's pending-request
/// budget; the guard gives it back (and re-schedules the work loop) when
/// the request is destroyed.
pub(crate) struct Request {
    pub(crate) meta_request: Weak<MetaRequestShared>,
    pub(crate) kind: RequestKind,
    /// 1-based wire part number; 0 for control and default requests.
    pub(crate) part_number: u32,
    /// 0-based delivery index for downloads.
    pub(crate) part_index: u32,
    /// Inclusive byte range for ranged downloads.
    pub(crate) range: Option<(u64, u64)>,
    /// The prepared, unsigned message. Cloned per attempt so retries start
    /// from a clean template.
    pub(crate) message: HttpRequest,
    pub(crate) retry_token: Option<RetryToken>,
    pub(crate) send_attempts: u32,
    pub(crate) _pending: PendingCountGuard,
}

impl Request {
    pub(crate) fn new(
        meta_request: Weak<MetaRequestShared>,
        kind: RequestKind,
        message: HttpRequest,
        pending: PendingCountGuard,
    ) -> Self {
        Self {
            meta_request,
            kind,
            part_number: 0,
            part_index: 0,
            range: None,
            message,
            retry_token: None,
            send_attempts: 0,
            _pending: pending,
        }
    }

    pub(crate) fn with_part(mut self, part_number: u32, part_index: u32) -> Self {
        self.part_number = part_number;
        self.part_index = part_index;
        self
    }

    pub(crate) fn with_range(mut self, range: (u64, u64)) -> Self {
        self.range = Some(range);
        self
    }

    /// Short human-readable description for diagnostics.
    pub(crate) fn describe(&self) -> String {
        match self.kind {
            RequestKind::RangedGetPart | RequestKind::UploadPart => {
                format!("{} {}", self.kind.name(), self.part_number)
            }
            _ => self.kind.name().to_string(),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("kind", &self.kind)
            .field("part_number", &self.part_number)
            .field("range", &self.range)
            .field("send_attempts", &self.send_attempts)
            .finish_non_exhaustive()
    }
}
