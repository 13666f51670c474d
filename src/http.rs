/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! HTTP message types and the connection seam.
//!
//! The actual HTTP/1.1 transport and TLS live behind [`HttpClient`] /
//! [`ConnectionManager`] / [`HttpChannel`]: the client asks an
//! [`HttpClient`] for one connection manager per resolved endpoint address,
//! acquires channels from the manager, and sends fully-buffered request and
//! response bodies over them.

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::error::BoxError;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// A prepared HTTP request with an optional in-memory body.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl HttpRequest {
    /// Creates a request with no headers and no body.
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request URI.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Replaces the request URI.
    pub fn set_uri(&mut self, uri: Uri) {
        self.uri = uri;
    }

    /// The request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the request headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// The request body, if any.
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Sets the request body.
    pub fn set_body(&mut self, body: Bytes) {
        self.body = Some(body);
    }

    /// The `Host` header, if present.
    pub fn host(&self) -> Option<&str> {
        self.headers
            .get(http::header::HOST)
            .and_then(|value| value.to_str().ok())
    }
}

/// A fully buffered HTTP response.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// The response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The response body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Consumes the response, returning its body.
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Returns the named header as a string, if present and valid UTF-8.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// Copies every header from `from` into `to`.
///
/// Duplicate names are preserved: each value is appended, so repeated
/// headers in the source appear the same number of times in the
/// destination, in iteration order.
pub fn copy_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from.iter() {
        to.append(name.clone(), value.clone());
    }
}

/// Error produced by the transport.
#[derive(Debug)]
pub struct ConnectorError {
    kind: ConnectorErrorKind,
    source: BoxError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectorErrorKind {
    Timeout,
    Io,
    Other,
}

impl ConnectorError {
    /// A timeout establishing or using a connection.
    pub fn timeout(source: impl Into<BoxError>) -> Self {
        Self {
            kind: ConnectorErrorKind::Timeout,
            source: source.into(),
        }
    }

    /// An I/O failure (connect, TLS, read/write, abrupt close).
    pub fn io(source: impl Into<BoxError>) -> Self {
        Self {
            kind: ConnectorErrorKind::Io,
            source: source.into(),
        }
    }

    /// Any other transport-level failure.
    pub fn other(source: impl Into<BoxError>) -> Self {
        Self {
            kind: ConnectorErrorKind::Other,
            source: source.into(),
        }
    }

    /// Whether this was a timeout.
    pub fn is_timeout(&self) -> bool {
        self.kind == ConnectorErrorKind::Timeout
    }

    /// Whether this was an I/O failure.
    pub fn is_io(&self) -> bool {
        self.kind == ConnectorErrorKind::Io
    }
}

impl fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ConnectorErrorKind::Timeout => write!(f, "transport timeout"),
            ConnectorErrorKind::Io => write!(f, "transport i/o error"),
            ConnectorErrorKind::Other => write!(f, "transport error"),
        }
    }
}

impl Error for ConnectorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.source.as_ref() as _)
    }
}

/// Future returned by [`HttpChannel::call`].
#[must_use]
pub struct CallFuture(BoxFuture<Result<HttpResponse, ConnectorError>>);

impl CallFuture {
    /// Boxes the provided future.
    pub fn new(
        future: impl Future<Output = Result<HttpResponse, ConnectorError>> + Send + 'static,
    ) -> Self {
        Self(Box::pin(future))
    }

    /// A future that is immediately ready with `result`.
    pub fn ready(result: Result<HttpResponse, ConnectorError>) -> Self {
        Self::new(std::future::ready(result))
    }
}

impl Future for CallFuture {
    type Output = Result<HttpResponse, ConnectorError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.as_mut().poll(cx)
    }
}

/// Future returned by [`ConnectionManager::acquire`].
#[must_use]
pub struct AcquireFuture(BoxFuture<Result<SharedHttpChannel, ConnectorError>>);

impl AcquireFuture {
    /// Boxes the provided future.
    pub fn new(
        future: impl Future<Output = Result<SharedHttpChannel, ConnectorError>> + Send + 'static,
    ) -> Self {
        Self(Box::pin(future))
    }

    /// A future that is immediately ready with `result`.
    pub fn ready(result: Result<SharedHttpChannel, ConnectorError>) -> Self {
        Self::new(std::future::ready(result))
    }
}

impl Future for AcquireFuture {
    type Output = Result<SharedHttpChannel, ConnectorError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.as_mut().poll(cx)
    }
}

/// One live HTTP connection.
pub trait HttpChannel: Send + Sync + fmt::Debug {
    /// Sends a request and resolves with the complete response.
    fn call(&self, request: HttpRequest) -> CallFuture;
}

/// Shareable handle to an [`HttpChannel`].
#[derive(Clone, Debug)]
pub struct SharedHttpChannel(Arc<dyn HttpChannel>);

impl SharedHttpChannel {
    /// Wraps an [`HttpChannel`] implementation for sharing.
    pub fn new(channel: impl HttpChannel + 'static) -> Self {
        Self(Arc::new(channel))
    }
}

impl HttpChannel for SharedHttpChannel {
    fn call(&self, request: HttpRequest) -> CallFuture {
        self.0.call(request)
    }
}

/// A pool of connections to a single endpoint address.
///
/// The manager enforces its own per-address concurrency; `acquire` resolves
/// once a channel is available.
pub trait ConnectionManager: Send + Sync + fmt::Debug {
    /// Acquires a live channel.
    fn acquire(&self) -> AcquireFuture;

    /// Returns a channel to the pool.
    fn release(&self, channel: SharedHttpChannel);
}

/// Shareable handle to a [`ConnectionManager`].
#[derive(Clone, Debug)]
pub struct SharedConnectionManager(Arc<dyn ConnectionManager>);

impl SharedConnectionManager {
    /// Wraps a [`ConnectionManager`] implementation for sharing.
    pub fn new(manager: impl ConnectionManager + 'static) -> Self {
        Self(Arc::new(manager))
    }
}

impl ConnectionManager for SharedConnectionManager {
    fn acquire(&self) -> AcquireFuture {
        self.0.acquire()
    }

    fn release(&self, channel: SharedHttpChannel) {
        self.0.release(channel)
    }
}

/// Supplies one [`ConnectionManager`] per resolved endpoint address.
pub trait HttpClient: Send + Sync + fmt::Debug {
    /// Creates a connection manager for `host` pinned to `address`.
    fn connection_manager(&self, host: &str, address: IpAddr) -> SharedConnectionManager;
}

/// Shareable handle to an [`HttpClient`].
#[derive(Clone, Debug)]
pub struct SharedHttpClient(Arc<dyn HttpClient>);

impl SharedHttpClient {
    /// Wraps an [`HttpClient`] implementation for sharing.
    pub fn new(client: impl HttpClient + 'static) -> Self {
        Self(Arc::new(client))
    }
}

impl HttpClient for SharedHttpClient {
    fn connection_manager(&self, host: &str, address: IpAddr) -> SharedConnectionManager {
        self.0.connection_manager(host, address)
    }
}
