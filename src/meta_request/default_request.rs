/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Default meta request: the caller's message forwarded verbatim on one
//! connection, with the same signing and retry pipeline as ranged
//! transfers. Used for HEAD, small GET/PUT, and service calls.

use std::sync::Arc;

use crate::client::ClientInner;
use crate::error::TransferError;
use crate::http::{HttpRequest, HttpResponse};
use crate::meta_request::{FinishedActions, MetaRequestShared, NextRequest};
use crate::request::{Request, RequestKind};

pub(crate) struct DefaultState {
    message: HttpRequest,
    sent: bool,
    outstanding: u32,
}

impl DefaultState {
    pub(crate) fn new(message: HttpRequest) -> Self {
        Self {
            message,
            sent: false,
            outstanding: 0,
        }
    }

    pub(crate) fn next_request(
        &mut self,
        shared: &Arc<MetaRequestShared>,
        client: &Arc<ClientInner>,
        cancelled: bool,
    ) -> Result<NextRequest, TransferError> {
        if cancelled {
            return Ok(if self.outstanding == 0 {
                NextRequest::Finished
            } else {
                NextRequest::Pending
            });
        }
        if !self.sent {
            self.sent = true;
            self.outstanding += 1;
            return Ok(NextRequest::Ready(Request::new(
                Arc::downgrade(shared),
                RequestKind::Default,
                self.message.clone(),
                client.pending_request_guard(),
            )));
        }
        Ok(if self.outstanding == 0 {
            NextRequest::Finished
        } else {
            NextRequest::Pending
        })
    }

    pub(crate) fn on_request_finished(
        &mut self,
        _request: &Request,
        result: Result<HttpResponse, TransferError>,
    ) -> FinishedActions {
        self.outstanding = self.outstanding.saturating_sub(1);
        let mut actions = FinishedActions::default();
        match result {
            Ok(response) => {
                actions.content_length = Some(response.body().len() as u64);
                actions.headers = Some((response.status(), response.headers().clone()));
                actions.deliver = Some((0, 0, response.into_body()));
            }
            Err(err) => actions.error = Some(err),
        }
        actions
    }

    pub(crate) fn on_cancel(&mut self) {}

    pub(crate) fn is_complete(&self, cancelled: bool) -> bool {
        if cancelled {
            return self.outstanding == 0;
        }
        self.sent && self.outstanding == 0
    }
}
