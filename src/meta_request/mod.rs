/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Meta requests: one user-level object transfer, decomposed into many
//! part-level sub-requests.
//!
//! The base in this module owns everything the three variants share: the
//! user callbacks, the ordered body-delivery queue, finish accounting (the
//! finish callback fires exactly once, strictly after the last body
//! callback), cancellation, and per-request diagnostics. The variants drive
//! their own wire state machines in [`auto_ranged_get`], [`auto_ranged_put`]
//! and [`default_request`].

pub(crate) mod auto_ranged_get;
pub(crate) mod auto_ranged_put;
pub(crate) mod default_request;

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::client::ClientInner;
use crate::error::{BoxError, ErrorKind, TransferError};
use crate::http::{HttpRequest, HttpResponse};
use crate::io::InputStream;
use crate::request::Request;

use self::auto_ranged_get::GetState;
use self::auto_ranged_put::PutState;
use self::default_request::DefaultState;

/// Which transfer state machine a meta request runs.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaRequestType {
    /// Auto-ranged download: a size probe followed by parallel part GETs.
    GetObject,
    /// Multipart upload: create, parallel part PUTs, complete or abort.
    PutObject,
    /// The caller's message forwarded as-is on a single connection.
    Default,
}

/// Invoked once with the response status and headers of the transfer's
/// defining response.
pub type HeadersCallback = Box<dyn FnMut(StatusCode, &HeaderMap) + Send>;

/// Invoked per body chunk, in strict object order. The `u64` is the chunk's
/// byte offset within the object. Returning an error cancels the transfer.
pub type BodyCallback = Box<dyn FnMut(u64, &Bytes) -> Result<(), BoxError> + Send>;

/// Invoked as the transfer makes progress.
pub type ProgressCallback = Box<dyn FnMut(&TransferProgress) + Send>;

/// Invoked exactly once when the meta request finishes.
pub type FinishCallback = Box<dyn FnOnce(MetaRequestResult) + Send>;

/// Progress snapshot handed to the progress callback.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Bytes transferred so far.
    pub bytes_transferred: u64,
    /// Total object size, when known.
    pub content_length: Option<u64>,
}

/// Outcome of one failed sub-request, surfaced in the finish result.
#[derive(Debug, Clone)]
pub struct RequestDiagnostic {
    /// What the sub-request was doing.
    pub description: String,
    /// Wire part number, when the request carried one.
    pub part_number: Option<u32>,
    /// How many attempts were made.
    pub attempts: u32,
    /// Final HTTP status, when a response was received.
    pub response_status: Option<u16>,
    /// Rendered error.
    pub message: String,
}

/// Final outcome of a meta request.
#[derive(Debug)]
pub struct MetaRequestResult {
    error: Option<TransferError>,
    response_status: Option<u16>,
    diagnostics: Vec<RequestDiagnostic>,
}

impl MetaRequestResult {
    /// Whether the transfer succeeded.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// The first terminal error, if the transfer failed.
    pub fn error(&self) -> Option<&TransferError> {
        self.error.as_ref()
    }

    /// Status of the defining response or of the failing response.
    pub fn response_status(&self) -> Option<u16> {
        self.response_status
    }

    /// Per-request failure details, in completion order.
    pub fn diagnostics(&self) -> &[RequestDiagnostic] {
        &self.diagnostics
    }
}

/// Options for [`Client::make_meta_request`](crate::client::Client::make_meta_request).
pub struct MetaRequestOptions {
    pub(crate) kind: MetaRequestType,
    pub(crate) message: HttpRequest,
    pub(crate) body: Option<Box<dyn InputStream>>,
    pub(crate) on_headers: Option<HeadersCallback>,
    pub(crate) on_body: Option<BodyCallback>,
    pub(crate) on_progress: Option<ProgressCallback>,
    pub(crate) on_finish: Option<FinishCallback>,
}

impl MetaRequestOptions {
    /// Creates options for a transfer of the given type. The message is the
    /// caller's HTTP template: its method, path and headers (including
    /// `Host`) describe the object operation.
    pub fn new(kind: MetaRequestType, message: HttpRequest) -> Self {
        Self {
            kind,
            message,
            body: None,
            on_headers: None,
            on_body: None,
            on_progress: None,
            on_finish: None,
        }
    }

    /// Supplies the upload body stream (required for `PutObject`).
    pub fn body(mut self, body: impl InputStream + 'static) -> Self {
        self.body = Some(Box::new(body));
        self
    }

    /// Sets the headers callback.
    pub fn on_headers(mut self, callback: impl FnMut(StatusCode, &HeaderMap) + Send + 'static) -> Self {
        self.on_headers = Some(Box::new(callback));
        self
    }

    /// Sets the ordered body callback (required for `GetObject`).
    pub fn on_body(
        mut self,
        callback: impl FnMut(u64, &Bytes) -> Result<(), BoxError> + Send + 'static,
    ) -> Self {
        self.on_body = Some(Box::new(callback));
        self
    }

    /// Sets the progress callback.
    pub fn on_progress(mut self, callback: impl FnMut(&TransferProgress) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    /// Sets the finish callback.
    pub fn on_finish(mut self, callback: impl FnOnce(MetaRequestResult) + Send + 'static) -> Self {
        self.on_finish = Some(Box::new(callback));
        self
    }

    pub(crate) fn validate(&self) -> Result<(), InvalidMetaRequest> {
        if self.message.host().is_none() {
            return Err(InvalidMetaRequest::MissingHostHeader);
        }
        match self.kind {
            MetaRequestType::GetObject => {
                if self.message.method() != Method::GET {
                    return Err(InvalidMetaRequest::WrongMethod {
                        expected: Method::GET,
                        found: self.message.method().clone(),
                    });
                }
                if self.on_body.is_none() {
                    return Err(InvalidMetaRequest::MissingBodyCallback);
                }
            }
            MetaRequestType::PutObject => {
                if self.message.method() != Method::PUT {
                    return Err(InvalidMetaRequest::WrongMethod {
                        expected: Method::PUT,
                        found: self.message.method().clone(),
                    });
                }
                if self.body.is_none() {
                    return Err(InvalidMetaRequest::MissingInputStream);
                }
            }
            MetaRequestType::Default => {}
        }
        Ok(())
    }
}

impl fmt::Debug for MetaRequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaRequestOptions")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Rejected meta-request submission.
#[non_exhaustive]
#[derive(Debug)]
pub enum InvalidMetaRequest {
    /// The message template has no `Host` header.
    MissingHostHeader,
    /// The message method does not match the transfer type.
    WrongMethod {
        /// Method the transfer type requires.
        expected: Method,
        /// Method the message carried.
        found: Method,
    },
    /// A `GetObject` transfer needs a body callback.
    MissingBodyCallback,
    /// A `PutObject` transfer needs an input stream.
    MissingInputStream,
    /// The client has begun shutting down.
    ClientShuttingDown,
}

impl fmt::Display for InvalidMetaRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidMetaRequest::MissingHostHeader => {
                write!(f, "the message template must carry a Host header")
            }
            InvalidMetaRequest::WrongMethod { expected, found } => {
                write!(f, "expected method {expected} for this transfer type, found {found}")
            }
            InvalidMetaRequest::MissingBodyCallback => {
                write!(f, "GetObject transfers require a body callback")
            }
            InvalidMetaRequest::MissingInputStream => {
                write!(f, "PutObject transfers require an input stream")
            }
            InvalidMetaRequest::ClientShuttingDown => {
                write!(f, "the client has begun shutting down")
            }
        }
    }
}

impl Error for InvalidMetaRequest {}

/// User handle to an in-flight meta request.
#[derive(Clone)]
pub struct MetaRequest {
    pub(crate) shared: Arc<MetaRequestShared>,
}

impl MetaRequest {
    /// Cancels the transfer. In-flight sub-requests run to completion and
    /// their bodies are discarded; a started multipart upload is aborted
    /// best-effort. The finish callback still fires exactly once.
    pub fn cancel(&self) {
        self.shared.cancel_with(TransferError::cancelled());
    }
}

impl fmt::Debug for MetaRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaRequest")
            .field("kind", &self.shared.kind_name)
            .finish_non_exhaustive()
    }
}

/// What the work loop gets back when it asks for the next sub-request.
pub(crate) enum NextRequest {
    /// A prepared request, ready to bind to a connection.
    Ready(Request),
    /// Nothing to hand out right now; ask again after the next completion.
    Pending,
    /// The state machine is done; remove the meta request from the list.
    Finished,
}

pub(crate) enum KindState {
    Get(GetState),
    Put(PutState),
    Default(DefaultState),
}

/// Actions the base applies after a variant processed a completion.
#[derive(Default)]
pub(crate) struct FinishedActions {
    /// Body to enqueue for ordered delivery: (part index, offset, bytes).
    pub(crate) deliver: Option<(u32, u64, Bytes)>,
    /// Response headers to surface through the headers callback.
    pub(crate) headers: Option<(StatusCode, HeaderMap)>,
    /// Terminal error for this sub-request.
    pub(crate) error: Option<TransferError>,
    /// Upload-side progress to report.
    pub(crate) progress: Option<TransferProgress>,
    /// Discovered total object size.
    pub(crate) content_length: Option<u64>,
}

#[derive(PartialEq, Eq)]
struct QueuedBody {
    part_index: u32,
    offset: u64,
    body: Bytes,
}

impl Ord for QueuedBody {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.part_index.cmp(&other.part_index)
    }
}

impl PartialOrd for QueuedBody {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct Delivery {
    heap: BinaryHeap<Reverse<QueuedBody>>,
    next_part: u32,
    draining: bool,
    bytes_delivered: u64,
    content_length: Option<u64>,
}

pub(crate) struct Callbacks {
    on_headers: Option<HeadersCallback>,
    on_body: Option<BodyCallback>,
    on_progress: Option<ProgressCallback>,
}

/// Finish accounting. The finish callback lives here, not with the other
/// callbacks, so firing it never re-enters the callbacks mutex (a body or
/// headers callback may itself cancel the meta request).
struct FinishState {
    error: Option<TransferError>,
    response_status: Option<u16>,
    diagnostics: Vec<RequestDiagnostic>,
    on_finish: Option<FinishCallback>,
}

/// Shared core of a meta request.
///
/// The kind-specific state machine is driven from the work loop and from
/// per-request pipeline completions, serialized by its mutex. The delivery
/// queue has its own mutex and a single-drainer flag so bodies are handed
/// to the user from exactly one streaming task at a time.
pub(crate) struct MetaRequestShared {
    kind_name: &'static str,
    client: Weak<ClientInner>,
    streaming_handle: Handle,
    state: Mutex<KindState>,
    delivery: Mutex<Delivery>,
    callbacks: Mutex<Callbacks>,
    finish: Mutex<FinishState>,
    cancelled: AtomicBool,
    finish_fired: AtomicBool,
}

impl MetaRequestShared {
    pub(crate) fn new(
        options: MetaRequestOptions,
        part_size: usize,
        client: Weak<ClientInner>,
        streaming_handle: Handle,
    ) -> Arc<Self> {
        let MetaRequestOptions {
            kind,
            message,
            body,
            on_headers,
            on_body,
            on_progress,
            on_finish,
        } = options;
        let (kind_name, state) = match kind {
            MetaRequestType::GetObject => (
                "auto-ranged-get",
                KindState::Get(GetState::new(message, part_size)),
            ),
            MetaRequestType::PutObject => (
                "auto-ranged-put",
                KindState::Put(PutState::new(
                    message,
                    part_size,
                    body.expect("validated: input stream present"),
                )),
            ),
            MetaRequestType::Default => {
                ("default", KindState::Default(DefaultState::new(message)))
            }
        };
        Arc::new(Self {
            kind_name,
            client,
            streaming_handle,
            state: Mutex::new(state),
            delivery: Mutex::new(Delivery {
                heap: BinaryHeap::new(),
                next_part: 0,
                draining: false,
                bytes_delivered: 0,
                content_length: None,
            }),
            callbacks: Mutex::new(Callbacks {
                on_headers,
                on_body,
                on_progress,
            }),
            finish: Mutex::new(FinishState {
                error: None,
                response_status: None,
                diagnostics: Vec::new(),
                on_finish,
            }),
            cancelled: AtomicBool::new(false),
            finish_fired: AtomicBool::new(false),
        })
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        self.kind_name
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finish_fired.load(Ordering::SeqCst)
    }

    /// Asks the state machine for its next prepared sub-request.
    ///
    /// Non-blocking; `Pending` is idempotent and the work loop will ask
    /// again after the next completion.
    pub(crate) fn next_request(self: &Arc<Self>, client: &Arc<ClientInner>) -> NextRequest {
        let cancelled = self.is_cancelled();
        let outcome = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                KindState::Get(s) => s.next_request(self, client, cancelled),
                KindState::Put(s) => s.next_request(self, client, cancelled),
                KindState::Default(s) => s.next_request(self, client, cancelled),
            }
        };
        match outcome {
            Ok(next) => {
                if matches!(next, NextRequest::Finished) {
                    self.try_finish();
                }
                next
            }
            Err(err) => {
                debug!(meta_request = self.kind_name, error = %err, "failed to prepare next request");
                self.record_failure(err, None);
                self.cancelled.store(true, Ordering::SeqCst);
                self.try_finish();
                NextRequest::Pending
            }
        }
    }

    /// Applies the outcome of one completed sub-request.
    pub(crate) fn on_request_finished(
        self: &Arc<Self>,
        request: Request,
        result: Result<HttpResponse, TransferError>,
    ) {
        trace!(
            meta_request = self.kind_name,
            request = %request.describe(),
            success = result.is_ok(),
            "sub-request finished"
        );
        let actions = {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                KindState::Get(s) => s.on_request_finished(&request, result),
                KindState::Put(s) => s.on_request_finished(&request, result),
                KindState::Default(s) => s.on_request_finished(&request, result),
            }
        };
        if let Some(err) = actions.error {
            // The first terminal sub-request error cancels the whole meta
            // request; queued bodies that can no longer form a contiguous
            // run are discarded rather than waited on.
            self.record_failure(err, Some(&request));
            self.cancelled.store(true, Ordering::SeqCst);
        }
        if let Some(total) = actions.content_length {
            self.delivery.lock().unwrap().content_length = Some(total);
        }
        if let Some((status, headers)) = actions.headers {
            self.finish.lock().unwrap().response_status = Some(status.as_u16());
            let mut callbacks = self.callbacks.lock().unwrap();
            if let Some(on_headers) = callbacks.on_headers.as_mut() {
                on_headers(status, &headers);
            }
        }
        if let Some(progress) = actions.progress {
            let mut callbacks = self.callbacks.lock().unwrap();
            if let Some(on_progress) = callbacks.on_progress.as_mut() {
                on_progress(&progress);
            }
        }
        if let Some((part_index, offset, body)) = actions.deliver {
            self.enqueue_body(part_index, offset, body);
        }
        drop(request);
        self.maybe_drain();
        self.try_finish();
    }

    /// Cancels the meta request with `error` as its reported outcome.
    ///
    /// Idempotent; the first terminal error wins. In-flight sub-requests
    /// run to completion and their bodies are discarded.
    pub(crate) fn cancel_with(self: &Arc<Self>, error: TransferError) {
        let skip_abort = error.kind() == ErrorKind::ClientShutdown;
        {
            let mut finish = self.finish.lock().unwrap();
            if finish.error.is_none() {
                finish.error = Some(error);
            }
        }
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(meta_request = self.kind_name, "meta request cancelled");
        {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                KindState::Get(s) => s.on_cancel(),
                KindState::Put(s) => s.on_cancel(skip_abort),
                KindState::Default(s) => s.on_cancel(),
            }
        }
        self.try_finish();
        if let Some(client) = self.client.upgrade() {
            client.schedule_process_work();
        }
    }

    /// Shutdown cancellation. Unlike [`cancel_with`](Self::cancel_with)
    /// this applies even to an already-cancelled meta request: with the
    /// client going away there is no connection left to run a best-effort
    /// abort on, so the upload state machine is told to settle without one.
    pub(crate) fn cancel_for_shutdown(self: &Arc<Self>) {
        {
            let mut finish = self.finish.lock().unwrap();
            if finish.error.is_none() {
                finish.error = Some(TransferError::shutdown());
            }
        }
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            debug!(meta_request = self.kind_name, "meta request cancelled by shutdown");
        }
        {
            let mut state = self.state.lock().unwrap();
            match &mut *state {
                KindState::Get(s) => s.on_cancel(),
                KindState::Put(s) => s.on_cancel(true),
                KindState::Default(s) => s.on_cancel(),
            }
        }
        self.try_finish();
    }

    fn record_failure(&self, error: TransferError, request: Option<&Request>) {
        let mut finish = self.finish.lock().unwrap();
        if let Some(request) = request {
            finish.diagnostics.push(RequestDiagnostic {
                description: request.describe(),
                part_number: (request.part_number > 0).then_some(request.part_number),
                attempts: request.send_attempts,
                response_status: error.response_status(),
                message: error.to_string(),
            });
        }
        if finish.error.is_none() {
            if let Some(status) = error.response_status() {
                finish.response_status = Some(status);
            }
            finish.error = Some(error);
        }
    }

    /// Queues a body for in-order delivery. Empty bodies still pass through
    /// the queue so the delivery cursor advances past them.
    fn enqueue_body(&self, part_index: u32, offset: u64, body: Bytes) {
        if self.is_cancelled() {
            return;
        }
        let mut delivery = self.delivery.lock().unwrap();
        delivery.heap.push(Reverse(QueuedBody {
            part_index,
            offset,
            body,
        }));
    }

    /// Spawns the streaming drain task when the next expected part is at
    /// the head of the queue and no drain is already running.
    fn maybe_drain(self: &Arc<Self>) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        let mut delivery = self.delivery.lock().unwrap();
        if delivery.draining {
            return;
        }
        let head = delivery.heap.peek().map(|Reverse(q)| q.part_index);
        if head == Some(delivery.next_part) {
            delivery.draining = true;
            drop(delivery);
            let this = Arc::clone(self);
            let internal = client.internal_ref();
            self.streaming_handle.spawn(async move {
                this.drain_bodies();
                drop(internal);
            });
        }
    }

    /// Delivers queued bodies in strict part order until the queue runs dry
    /// or the next part is missing. Runs on the body-streaming runtime.
    fn drain_bodies(self: &Arc<Self>) {
        loop {
            let (batch, content_length) = {
                let mut delivery = self.delivery.lock().unwrap();
                let mut batch = Vec::new();
                while let Some(Reverse(head)) = delivery.heap.peek() {
                    if head.part_index != delivery.next_part {
                        break;
                    }
                    let Reverse(body) = delivery.heap.pop().expect("peeked entry");
                    delivery.next_part += 1;
                    delivery.bytes_delivered += body.body.len() as u64;
                    batch.push((body.offset, body.body, delivery.bytes_delivered));
                }
                if batch.is_empty() {
                    delivery.draining = false;
                    break;
                }
                (batch, delivery.content_length)
            };
            let mut failed: Option<BoxError> = None;
            {
                let mut callbacks = self.callbacks.lock().unwrap();
                for (offset, body, cumulative) in &batch {
                    if self.is_cancelled() {
                        break;
                    }
                    if !body.is_empty() {
                        if let Some(on_body) = callbacks.on_body.as_mut() {
                            if let Err(err) = on_body(*offset, body) {
                                failed = Some(err);
                                break;
                            }
                        }
                        if let Some(on_progress) = callbacks.on_progress.as_mut() {
                            on_progress(&TransferProgress {
                                bytes_transferred: *cumulative,
                                content_length,
                            });
                        }
                    }
                }
            }
            if let Some(err) = failed {
                self.cancel_with(
                    TransferError::new(ErrorKind::UserCancelled, "body callback rejected delivery")
                        .with_source(err),
                );
            }
        }
        self.try_finish();
    }

    fn kind_complete(&self) -> bool {
        let cancelled = self.is_cancelled();
        let state = self.state.lock().unwrap();
        match &*state {
            KindState::Get(s) => s.is_complete(cancelled),
            KindState::Put(s) => s.is_complete(cancelled),
            KindState::Default(s) => s.is_complete(cancelled),
        }
    }

    /// Fires the finish callback when the state machine is done and every
    /// queued body has been delivered. Safe to call repeatedly.
    pub(crate) fn try_finish(self: &Arc<Self>) {
        if !self.kind_complete() {
            return;
        }
        {
            let delivery = self.delivery.lock().unwrap();
            if delivery.draining || (!self.is_cancelled() && !delivery.heap.is_empty()) {
                return;
            }
        }
        if self.finish_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let (callback, result) = {
            let mut finish = self.finish.lock().unwrap();
            (
                finish.on_finish.take(),
                MetaRequestResult {
                    error: finish.error.take(),
                    response_status: finish.response_status,
                    diagnostics: std::mem::take(&mut finish.diagnostics),
                },
            )
        };
        debug!(
            meta_request = self.kind_name,
            success = result.is_success(),
            "meta request finished"
        );
        if let Some(callback) = callback {
            callback(result);
        }
        if let Some(client) = self.client.upgrade() {
            client.schedule_process_work();
        }
    }

}

impl fmt::Debug for MetaRequestShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaRequestShared")
            .field("kind", &self.kind_name)
            .field("cancelled", &self.cancelled)
            .field("finish_fired", &self.finish_fired)
            .finish_non_exhaustive()
    }
}
