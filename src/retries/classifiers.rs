/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Maps HTTP responses and transport failures to error classes.

use http::StatusCode;

use crate::error::{ErrorKind, TransferError};
use crate::http::ConnectorError;
use crate::xml;

/// Classifies a non-success HTTP response.
///
/// `None` for success statuses. Throttling is recognized from 429 and from
/// 503 responses whose body carries a top-level `SlowDown` code; all other
/// 5xx (except 501) and 408 are transient; remaining 4xx are permanent.
/// 401/403 classify as auth failures.
pub fn classify_response(status: StatusCode, body: &[u8]) -> Option<TransferError> {
    if status.is_success() {
        return None;
    }
    let code = xml::error_code(body);
    let kind = match status.as_u16() {
        429 => ErrorKind::Throttling,
        503 if code.as_deref() == Some("SlowDown") => ErrorKind::Throttling,
        401 | 403 => ErrorKind::Auth,
        408 => ErrorKind::ServerTransient,
        501 => ErrorKind::ServerPermanent,
        500..=599 => ErrorKind::ServerTransient,
        _ => ErrorKind::ServerPermanent,
    };
    let message = match code {
        Some(code) => format!("request failed with {code}"),
        None => "request failed".to_string(),
    };
    Some(TransferError::new(kind, message).with_status(status.as_u16()))
}

/// Classifies a transport failure. Everything below HTTP is retryable.
pub fn classify_connector_error(error: ConnectorError) -> TransferError {
    let message = if error.is_timeout() {
        "request timed out"
    } else if error.is_io() {
        "connection failed"
    } else {
        "transport failed"
    };
    TransferError::new(ErrorKind::Transport, message).with_source(error)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind_of(status: u16, body: &[u8]) -> Option<ErrorKind> {
        classify_response(StatusCode::from_u16(status).unwrap(), body).map(|err| err.kind())
    }

    #[test]
    fn success_is_none() {
        assert_eq!(None, kind_of(200, b""));
        assert_eq!(None, kind_of(206, b""));
    }

    #[test]
    fn classification_table() {
        assert_eq!(Some(ErrorKind::Throttling), kind_of(429, b""));
        assert_eq!(
            Some(ErrorKind::Throttling),
            kind_of(503, b"<Error><Code>SlowDown</Code></Error>")
        );
        assert_eq!(Some(ErrorKind::ServerTransient), kind_of(503, b""));
        assert_eq!(Some(ErrorKind::ServerTransient), kind_of(500, b""));
        assert_eq!(Some(ErrorKind::ServerTransient), kind_of(502, b""));
        assert_eq!(Some(ErrorKind::ServerTransient), kind_of(408, b""));
        assert_eq!(Some(ErrorKind::ServerPermanent), kind_of(501, b""));
        assert_eq!(Some(ErrorKind::ServerPermanent), kind_of(404, b""));
        assert_eq!(Some(ErrorKind::ServerPermanent), kind_of(400, b""));
        assert_eq!(Some(ErrorKind::Auth), kind_of(403, b""));
    }

    #[test]
    fn error_code_lands_in_message() {
        let err = classify_response(
            StatusCode::NOT_FOUND,
            b"<Error><Code>NoSuchKey</Code></Error>",
        )
        .unwrap();
        assert!(err.message().contains("NoSuchKey"));
        assert_eq!(Some(404), err.response_status());
    }

    #[test]
    fn connector_errors_are_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = classify_connector_error(ConnectorError::io(io));
        assert_eq!(ErrorKind::Transport, err.kind());
    }
}
