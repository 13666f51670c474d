/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! The single work-loop task.
//!
//! All threaded data lives here as task-local state; nothing else touches
//! it. Each pass splices the pending lists out from under the client lock,
//! integrates returned connections, and pairs idle connections with the
//! next ready sub-request, round-robin across meta requests for fairness.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::trace;

use crate::client::pipeline;
use crate::client::vip::{VipConnection, VipConnectionState};
use crate::client::{
    ClientInner, InternalRef, MAX_REQUESTS_IN_FLIGHT, PENDING_REQUEST_SOFT_CAP,
};
use crate::error::TransferError;
use crate::meta_request::{MetaRequestShared, NextRequest};

/// Work-loop-only state.
pub(crate) struct ThreadedData {
    idle_connections: VecDeque<VipConnection>,
    meta_requests: Vec<Arc<MetaRequestShared>>,
    /// Round-robin cursor over `meta_requests`.
    next_meta_request: usize,
    requests_in_flight: usize,
}

pub(crate) async fn run(inner: Arc<ClientInner>, internal: InternalRef) {
    let mut threaded = ThreadedData {
        idle_connections: VecDeque::new(),
        meta_requests: Vec::new(),
        next_meta_request: 0,
        requests_in_flight: 0,
    };
    loop {
        inner.work_notify.notified().await;
        if !process_work(&inner, &mut threaded) {
            break;
        }
    }
    trace!("work loop stopped");
    drop(internal);
}

/// One work pass. Returns `false` once the client is inactive and fully
/// drained, ending the loop.
fn process_work(inner: &Arc<ClientInner>, threaded: &mut ThreadedData) -> bool {
    let (active, new_connections, new_meta_requests, finished) = {
        let mut synced = inner.synced.lock().unwrap();
        synced.process_work_scheduled = false;
        (
            synced.active,
            std::mem::take(&mut synced.pending_connection_updates),
            std::mem::take(&mut synced.pending_meta_requests),
            std::mem::replace(&mut synced.requests_finished, 0),
        )
    };
    threaded.requests_in_flight = threaded.requests_in_flight.saturating_sub(finished);
    for connection in new_connections {
        integrate_connection(threaded, connection, active);
    }
    threaded.meta_requests.extend(new_meta_requests);

    if !active {
        inner.cancel_all(&threaded.meta_requests);
        threaded.idle_connections.clear();
        for meta_request in &threaded.meta_requests {
            // Drive cancelled state machines so they settle without a
            // connection; anything they still yield is failed on the spot.
            while let NextRequest::Ready(request) = meta_request.next_request(inner) {
                meta_request.on_request_finished(request, Err(TransferError::shutdown()));
            }
        }
        threaded.meta_requests.retain(|meta| !meta.is_finished());
        let drained = threaded.meta_requests.is_empty() && threaded.requests_in_flight == 0;
        if drained {
            trace!("work loop drained after shutdown");
        }
        return !drained;
    }

    threaded.meta_requests.retain(|meta| !meta.is_finished());
    pair_work(inner, threaded);
    true
}

/// Returned and newly created connections come back through the pending
/// updates; worn-out slots are replaced here, dead ones dropped.
fn integrate_connection(threaded: &mut ThreadedData, mut connection: VipConnection, active: bool) {
    if !active {
        return;
    }
    if connection.should_retire() {
        if let Some(vip) = connection.vip() {
            if vip.is_active() {
                trace!(address = %vip.address(), "recycling connection slot");
                threaded.idle_connections.push_back(VipConnection::new(&vip));
            }
        }
        return;
    }
    connection.state = VipConnectionState::Idle;
    threaded.idle_connections.push_back(connection);
}

fn pop_idle(threaded: &mut ThreadedData) -> Option<VipConnection> {
    while let Some(connection) = threaded.idle_connections.pop_front() {
        if connection.is_usable() {
            return Some(connection);
        }
        // VIP removed while the slot sat idle; the slot dies with it.
    }
    None
}

fn pair_work(inner: &Arc<ClientInner>, threaded: &mut ThreadedData) {
    loop {
        if threaded.requests_in_flight >= MAX_REQUESTS_IN_FLIGHT {
            trace!(
                in_flight = threaded.requests_in_flight,
                "in-flight cap reached"
            );
            break;
        }
        if inner.pending_request_count() >= PENDING_REQUEST_SOFT_CAP {
            trace!("pending request soft cap reached");
            break;
        }
        if threaded.meta_requests.is_empty() {
            break;
        }
        let Some(connection) = pop_idle(threaded) else {
            break;
        };

        let mut prepared = None;
        let mut scanned = 0;
        while scanned < threaded.meta_requests.len() {
            if threaded.next_meta_request >= threaded.meta_requests.len() {
                threaded.next_meta_request = 0;
            }
            let index = threaded.next_meta_request;
            let meta_request = Arc::clone(&threaded.meta_requests[index]);
            match meta_request.next_request(inner) {
                NextRequest::Ready(request) => {
                    threaded.next_meta_request = index + 1;
                    prepared = Some(request);
                    break;
                }
                NextRequest::Pending => {
                    threaded.next_meta_request = index + 1;
                    scanned += 1;
                }
                NextRequest::Finished => {
                    // The entry after the removed one slides into this
                    // slot, so the cursor stays put.
                    threaded.meta_requests.remove(index);
                }
            }
            if threaded.meta_requests.is_empty() {
                break;
            }
        }

        match prepared {
            Some(request) => {
                threaded.requests_in_flight += 1;
                trace!(
                    in_flight = threaded.requests_in_flight,
                    request = %request.describe(),
                    "dispatching request"
                );
                inner.work_handle.spawn(pipeline::run(
                    Arc::clone(inner),
                    connection,
                    request,
                    inner.internal_ref(),
                ));
            }
            None => {
                // Nothing ready anywhere; park the connection until the
                // next completion schedules another pass.
                threaded.idle_connections.push_front(connection);
                break;
            }
        }
    }
}
