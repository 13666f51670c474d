/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Error types shared across the transfer client.

use std::borrow::Cow;
use std::error::Error;
use std::fmt;

/// A type-erased error.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Broad classification of a transfer failure.
///
/// The kind determines whether the retry strategy is consulted and with
/// which token cost. See [`ErrorKind::is_retryable`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connect, TLS, read/write, or abrupt close failures below HTTP.
    Transport,
    /// HTTP 5xx (other than 501) and other transient server conditions.
    ServerTransient,
    /// 503 SlowDown and 429 responses.
    Throttling,
    /// 4xx responses (other than 408) that will not succeed on retry.
    ServerPermanent,
    /// Signing or credential failures.
    Auth,
    /// The user cancelled the meta request.
    UserCancelled,
    /// The owning client began shutting down.
    ClientShutdown,
    /// An internal invariant was violated.
    Internal,
}

impl ErrorKind {
    /// Whether an error of this kind may be handed to the retry strategy.
    ///
    /// Auth errors are retryable only when the credentials provider reports
    /// that a refresh could help; that check is made at the call site since
    /// the kind alone does not know the provider.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Transport | ErrorKind::ServerTransient | ErrorKind::Throttling
        )
    }

    /// Whether this kind terminates the whole meta request immediately.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ErrorKind::UserCancelled | ErrorKind::ClientShutdown)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Transport => "transport error",
            ErrorKind::ServerTransient => "transient server error",
            ErrorKind::Throttling => "throttling error",
            ErrorKind::ServerPermanent => "permanent server error",
            ErrorKind::Auth => "authentication error",
            ErrorKind::UserCancelled => "cancelled by user",
            ErrorKind::ClientShutdown => "client shut down",
            ErrorKind::Internal => "internal error",
        };
        write!(f, "{name}")
    }
}

/// An error produced while executing a meta request or one of its
/// sub-requests.
#[derive(Debug)]
pub struct TransferError {
    kind: ErrorKind,
    message: Cow<'static, str>,
    response_status: Option<u16>,
    source: Option<BoxError>,
}

impl TransferError {
    /// Creates a new error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
            response_status: None,
            source: None,
        }
    }

    /// Attaches the HTTP status that produced this error.
    pub fn with_status(mut self, status: u16) -> Self {
        self.response_status = Some(status);
        self
    }

    /// Attaches an underlying cause.
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// The error classification.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The HTTP status of the response that produced this error, if any.
    pub fn response_status(&self) -> Option<u16> {
        self.response_status
    }

    /// Human-readable description of what failed.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn shutdown() -> Self {
        Self::new(ErrorKind::ClientShutdown, "client is shutting down")
    }

    pub(crate) fn cancelled() -> Self {
        Self::new(ErrorKind::UserCancelled, "meta request was cancelled")
    }
}

impl Clone for TransferError {
    fn clone(&self) -> Self {
        // The source is not cloneable; the clone keeps the rendered message
        // and classification, which is all downstream consumers read.
        Self {
            kind: self.kind,
            message: self.message.clone(),
            response_status: self.response_status,
            source: None,
        }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(status) = self.response_status {
            write!(f, " (http status {status})")?;
        }
        Ok(())
    }
}

impl Error for TransferError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_deref().map(|err| err as _)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::Transport.is_retryable());
        assert!(ErrorKind::ServerTransient.is_retryable());
        assert!(ErrorKind::Throttling.is_retryable());
        assert!(!ErrorKind::ServerPermanent.is_retryable());
        assert!(!ErrorKind::Auth.is_retryable());
        assert!(!ErrorKind::UserCancelled.is_retryable());
        assert!(!ErrorKind::Internal.is_retryable());
    }

    #[test]
    fn display_includes_status() {
        let err = TransferError::new(ErrorKind::Throttling, "slow down").with_status(503);
        assert_eq!(
            "throttling error: slow down (http status 503)",
            format!("{err}")
        );
    }

    #[test]
    fn source_is_chained() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = TransferError::new(ErrorKind::Transport, "send failed").with_source(io);
        assert!(err.source().is_some());
    }
}
