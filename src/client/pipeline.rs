/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! The per-request pipeline: acquire a channel, sign, send, classify, and
//! retry until the sub-request succeeds or fails terminally. One pipeline
//! task runs per bound (connection, request) pair; the connection travels
//! back to the work loop through the pending updates when the task ends.

use std::sync::Arc;

use tracing::debug;

use crate::auth::{ProvideCredentials, SignHttpRequest};
use crate::client::vip::{VipConnection, VipConnectionState};
use crate::client::{ClientInner, InternalRef};
use crate::error::{ErrorKind, TransferError};
use crate::http::{ConnectionManager, HttpChannel, HttpResponse};
use crate::request::Request;
use crate::retries::classifiers::{classify_connector_error, classify_response};
use crate::retries::RetryStrategy;
use crate::time::TimeSource;

pub(crate) async fn run(
    inner: Arc<ClientInner>,
    mut connection: VipConnection,
    mut request: Request,
    internal: InternalRef,
) {
    let result = execute(&inner, &mut connection, &mut request).await;
    if let Err(err) = &result {
        debug!(request = %request.describe(), error = %err, "request failed");
    }
    match request.meta_request.upgrade() {
        Some(meta_request) => meta_request.on_request_finished(request, result),
        None => drop(request),
    }
    connection.state = if connection.should_retire() {
        VipConnectionState::Retired
    } else {
        VipConnectionState::Idle
    };
    {
        let mut synced = inner.synced.lock().unwrap();
        synced.requests_finished += 1;
        synced.pending_connection_updates.push(connection);
    }
    inner.schedule_process_work();
    drop(internal);
}

async fn execute(
    inner: &Arc<ClientInner>,
    connection: &mut VipConnection,
    request: &mut Request,
) -> Result<HttpResponse, TransferError> {
    let partition = request
        .message
        .host()
        .unwrap_or("default")
        .to_string();
    loop {
        // The retry token rides on the request between attempts.
        let token = match request.retry_token.take() {
            Some(token) => token,
            None => inner.retry_strategy.acquire_token(&partition).await?,
        };
        let attempt_result = attempt(inner, connection, request).await;
        request.send_attempts = token.attempts();
        match attempt_result {
            Ok(response) => {
                inner.retry_strategy.record_success(token);
                return Ok(response);
            }
            Err(error) => {
                let refreshable_auth = error.kind() == ErrorKind::Auth
                    && inner
                        .signing_cache
                        .credentials_provider()
                        .can_refresh();
                if !(error.kind().is_retryable() || refreshable_auth) {
                    inner.retry_strategy.release_token(token);
                    return Err(error);
                }
                connection.state = VipConnectionState::RetryWaiting;
                match inner.retry_strategy.schedule_retry(token, error.kind()).await {
                    Ok(next_token) => {
                        request.retry_token = Some(next_token);
                        let cancelled = request
                            .meta_request
                            .upgrade()
                            .map(|meta| meta.is_cancelled())
                            .unwrap_or(true);
                        if cancelled {
                            return Err(error);
                        }
                    }
                    Err(denied) => {
                        debug!(error = %denied, "retry strategy declined");
                        return Err(error);
                    }
                }
            }
        }
    }
}

/// One attempt: acquire-http, sign, send, classify.
async fn attempt(
    inner: &Arc<ClientInner>,
    connection: &mut VipConnection,
    request: &Request,
) -> Result<HttpResponse, TransferError> {
    let vip = connection
        .vip()
        .filter(|vip| vip.is_active())
        .ok_or_else(|| {
            TransferError::new(ErrorKind::Transport, "endpoint address went away")
        })?;
    connection.state = VipConnectionState::AcquiringHttp;
    let channel = vip
        .manager()
        .acquire()
        .await
        .map_err(classify_connector_error)?;
    connection.state = VipConnectionState::Signing;
    let signing_config = inner.signing_cache.config_for_request();
    let signed = inner
        .signer
        .sign(
            request.message.clone(),
            &signing_config,
            inner.time_source.now(),
        )
        .await
        .map_err(|err| {
            TransferError::new(ErrorKind::Auth, "failed to sign request").with_source(err)
        })?;
    connection.state = VipConnectionState::InFlight;
    let call_result = channel.call(signed).await;
    vip.manager().release(channel);
    connection.request_count += 1;
    let response = call_result.map_err(classify_connector_error)?;
    match classify_response(response.status(), response.body()) {
        None => Ok(response),
        Some(error) => Err(error),
    }
}
