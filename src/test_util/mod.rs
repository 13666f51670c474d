/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! In-memory collaborators for exercising transfers without a network: a
//! wire-faithful mock S3, a recording signer, and a fixed-address host
//! resolver.

mod mock_s3;

pub use mock_s3::{FailureMode, MockOp, MockOperation, MockS3};

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::auth::{SigningConfig, SigningError, SigningFuture, SignHttpRequest};
use crate::dns::{HostAddresses, HostListener, HostResolver};
use crate::http::HttpRequest;
use crate::meta_request::{MetaRequestOptions, MetaRequestResult};

/// Signer that stamps a fake SigV4 authorization header and counts calls.
#[derive(Clone, Debug, Default)]
pub struct MockSigner {
    signed: Arc<AtomicUsize>,
}

impl MockSigner {
    /// Creates a mock signer.
    pub fn new() -> Self {
        Self::default()
    }

    /// How many requests have been signed.
    pub fn signed_count(&self) -> usize {
        self.signed.load(Ordering::SeqCst)
    }
}

impl SignHttpRequest for MockSigner {
    fn sign(
        &self,
        mut request: HttpRequest,
        config: &SigningConfig,
        _now: SystemTime,
    ) -> SigningFuture {
        let value = format!(
            "AWS4-HMAC-SHA256 Credential=mock/{}/{}",
            config.region(),
            config.service()
        );
        let header = match http::HeaderValue::from_str(&value) {
            Ok(header) => header,
            Err(err) => {
                return SigningFuture::ready(Err(
                    SigningError::new("invalid authorization value").with_source(err)
                ))
            }
        };
        request
            .headers_mut()
            .insert(http::header::AUTHORIZATION, header);
        self.signed.fetch_add(1, Ordering::SeqCst);
        SigningFuture::ready(Ok(request))
    }
}

/// Resolver that immediately announces a fixed set of addresses and then
/// goes quiet.
#[derive(Clone, Debug)]
pub struct StaticHostResolver {
    addresses: Vec<IpAddr>,
}

impl StaticHostResolver {
    /// Creates a resolver over `addresses`.
    pub fn new(addresses: Vec<IpAddr>) -> Self {
        Self { addresses }
    }

    /// A resolver announcing `count` distinct loopback-style addresses.
    pub fn with_address_count(count: u8) -> Self {
        let addresses = (0..count)
            .map(|i| IpAddr::from([127, 0, 0, i + 1]))
            .collect();
        Self { addresses }
    }
}

impl HostResolver for StaticHostResolver {
    fn listen(&self, _host: &str) -> HostListener {
        let (tx, listener) = HostListener::channel();
        let _ = tx.send(HostAddresses::Added(self.addresses.clone()));
        listener
    }
}

/// Captured callback traffic for one meta request.
pub struct TransferRecording {
    /// `(offset, bytes)` pairs in delivery order.
    pub bodies: Arc<Mutex<Vec<(u64, Bytes)>>>,
    /// Response statuses seen by the headers callback.
    pub statuses: Arc<Mutex<Vec<u16>>>,
    /// Resolves with the finish result.
    pub finished: oneshot::Receiver<MetaRequestResult>,
}

impl TransferRecording {
    /// Concatenation of every delivered chunk, in delivery order.
    pub fn collected_bytes(&self) -> Vec<u8> {
        let bodies = self.bodies.lock().unwrap();
        let mut all = Vec::new();
        for (_, chunk) in bodies.iter() {
            all.extend_from_slice(chunk);
        }
        all
    }
}

/// Attaches recording callbacks to `options`.
pub fn record_transfer(options: MetaRequestOptions) -> (MetaRequestOptions, TransferRecording) {
    let bodies: Arc<Mutex<Vec<(u64, Bytes)>>> = Arc::new(Mutex::new(Vec::new()));
    let statuses: Arc<Mutex<Vec<u16>>> = Arc::new(Mutex::new(Vec::new()));
    let (finish_tx, finished) = oneshot::channel();
    let bodies_writer = Arc::clone(&bodies);
    let statuses_writer = Arc::clone(&statuses);
    let options = options
        .on_body(move |offset, chunk| {
            bodies_writer.lock().unwrap().push((offset, chunk.clone()));
            Ok(())
        })
        .on_headers(move |status, _headers| {
            statuses_writer.lock().unwrap().push(status.as_u16());
        })
        .on_finish(move |result| {
            let _ = finish_tx.send(result);
        });
    (
        options,
        TransferRecording {
            bodies,
            statuses,
            finished,
        },
    )
}
