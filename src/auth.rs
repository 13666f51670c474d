/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Credentials and request signing seams.
//!
//! The SigV4 implementation itself is supplied by the caller through
//! [`SignHttpRequest`]; this module owns the configuration that is handed to
//! it and the cached copy of that configuration the client reuses for every
//! sub-request.

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use crate::error::BoxError;
use crate::http::HttpRequest;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// A set of AWS credentials.
#[derive(Clone)]
pub struct Credentials(Arc<CredentialsInner>);

struct CredentialsInner {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl Credentials {
    /// Creates a credential set.
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        Self(Arc::new(CredentialsInner {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token,
        }))
    }

    /// The access key id.
    pub fn access_key_id(&self) -> &str {
        &self.0.access_key_id
    }

    /// The secret access key.
    pub fn secret_access_key(&self) -> &str {
        &self.0.secret_access_key
    }

    /// The session token, if any.
    pub fn session_token(&self) -> Option<&str> {
        self.0.session_token.as_deref()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log secrets.
        f.debug_struct("Credentials")
            .field("access_key_id", &self.0.access_key_id)
            .field("secret_access_key", &"** redacted **")
            .finish_non_exhaustive()
    }
}

/// Error produced while resolving credentials.
#[derive(Debug)]
pub struct CredentialsError {
    source: BoxError,
}

impl CredentialsError {
    /// Wraps an underlying failure.
    pub fn new(source: impl Into<BoxError>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

impl fmt::Display for CredentialsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to resolve credentials")
    }
}

impl Error for CredentialsError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.source.as_ref() as _)
    }
}

/// Future returned by [`ProvideCredentials::provide_credentials`].
#[must_use]
pub struct CredentialsFuture(BoxFuture<Result<Credentials, CredentialsError>>);

impl CredentialsFuture {
    /// Boxes the provided future.
    pub fn new(
        future: impl Future<Output = Result<Credentials, CredentialsError>> + Send + 'static,
    ) -> Self {
        Self(Box::pin(future))
    }

    /// A future that is immediately ready with `result`.
    pub fn ready(result: Result<Credentials, CredentialsError>) -> Self {
        Self::new(std::future::ready(result))
    }
}

impl Future for CredentialsFuture {
    type Output = Result<Credentials, CredentialsError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.as_mut().poll(cx)
    }
}

/// Asynchronously resolves credentials.
pub trait ProvideCredentials: Send + Sync + fmt::Debug {
    /// Resolves a credential set.
    fn provide_credentials(&self) -> CredentialsFuture;

    /// Whether resolving again may return fresher credentials, making an
    /// auth failure worth one retry.
    fn can_refresh(&self) -> bool {
        false
    }
}

/// Shareable handle to a [`ProvideCredentials`] implementation.
#[derive(Clone, Debug)]
pub struct SharedCredentialsProvider(Arc<dyn ProvideCredentials>);

impl SharedCredentialsProvider {
    /// Wraps a provider for sharing.
    pub fn new(provider: impl ProvideCredentials + 'static) -> Self {
        Self(Arc::new(provider))
    }
}

impl ProvideCredentials for SharedCredentialsProvider {
    fn provide_credentials(&self) -> CredentialsFuture {
        self.0.provide_credentials()
    }

    fn can_refresh(&self) -> bool {
        self.0.can_refresh()
    }
}

/// Provider that always returns the same credential set.
#[derive(Debug)]
pub struct StaticCredentialsProvider {
    credentials: Credentials,
}

impl StaticCredentialsProvider {
    /// Creates a provider over a fixed credential set.
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

impl ProvideCredentials for StaticCredentialsProvider {
    fn provide_credentials(&self) -> CredentialsFuture {
        CredentialsFuture::ready(Ok(self.credentials.clone()))
    }
}

/// Configuration handed to the signer for each request.
#[derive(Clone, Debug)]
pub struct SigningConfig {
    region: String,
    service: String,
    signed_body_header: Option<String>,
    signed_body_value: Option<String>,
    use_double_uri_encode: bool,
    expiration: Option<Duration>,
    credentials_provider: SharedCredentialsProvider,
}

impl SigningConfig {
    /// Starts building a signing configuration.
    pub fn builder() -> SigningConfigBuilder {
        SigningConfigBuilder::default()
    }

    /// The signing region.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// The signing service name.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Header name carrying the signed body value, if any.
    pub fn signed_body_header(&self) -> Option<&str> {
        self.signed_body_header.as_deref()
    }

    /// The signed body value, if any.
    pub fn signed_body_value(&self) -> Option<&str> {
        self.signed_body_value.as_deref()
    }

    /// Whether the signer should double-URI-encode paths.
    pub fn use_double_uri_encode(&self) -> bool {
        self.use_double_uri_encode
    }

    /// Signature expiration, if any.
    pub fn expiration(&self) -> Option<Duration> {
        self.expiration
    }

    /// The credentials provider.
    pub fn credentials_provider(&self) -> &SharedCredentialsProvider {
        &self.credentials_provider
    }
}

/// Builder for [`SigningConfig`].
#[derive(Debug, Default)]
pub struct SigningConfigBuilder {
    region: Option<String>,
    service: Option<String>,
    signed_body_header: Option<String>,
    signed_body_value: Option<String>,
    use_double_uri_encode: bool,
    expiration: Option<Duration>,
    credentials_provider: Option<SharedCredentialsProvider>,
}

impl SigningConfigBuilder {
    /// Sets the signing region.
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Sets the signing service. Defaults to `s3`.
    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Sets the signed body header name.
    pub fn signed_body_header(mut self, name: impl Into<String>) -> Self {
        self.signed_body_header = Some(name.into());
        self
    }

    /// Sets the signed body value.
    pub fn signed_body_value(mut self, value: impl Into<String>) -> Self {
        self.signed_body_value = Some(value.into());
        self
    }

    /// Sets whether the signer double-URI-encodes paths.
    pub fn use_double_uri_encode(mut self, value: bool) -> Self {
        self.use_double_uri_encode = value;
        self
    }

    /// Sets the signature expiration.
    pub fn expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Sets the credentials provider.
    pub fn credentials_provider(mut self, provider: SharedCredentialsProvider) -> Self {
        self.credentials_provider = Some(provider);
        self
    }

    /// Builds the configuration.
    ///
    /// # Panics
    /// Panics if region or credentials provider were not set.
    pub fn build(self) -> SigningConfig {
        SigningConfig {
            region: self.region.expect("signing region is required"),
            service: self.service.unwrap_or_else(|| "s3".to_string()),
            signed_body_header: self.signed_body_header,
            signed_body_value: self.signed_body_value,
            use_double_uri_encode: self.use_double_uri_encode,
            expiration: self.expiration,
            credentials_provider: self
                .credentials_provider
                .expect("credentials provider is required"),
        }
    }
}

/// The client's owned copy of the caller's signing configuration.
///
/// Built once at client creation and read-only afterwards, so sub-requests
/// never reach back into caller-owned memory.
#[derive(Debug)]
pub(crate) struct SigningCache {
    config: SigningConfig,
}

impl SigningCache {
    pub(crate) fn new(source: &SigningConfig) -> Self {
        // Field-by-field copy. The signed body value is kept only when it
        // is non-empty; the gate is the value itself, not the service name.
        let config = SigningConfig {
            region: source.region.clone(),
            service: source.service.clone(),
            signed_body_header: source
                .signed_body_header
                .as_ref()
                .filter(|h| !h.is_empty())
                .cloned(),
            signed_body_value: source
                .signed_body_value
                .as_ref()
                .filter(|v| !v.is_empty())
                .cloned(),
            use_double_uri_encode: source.use_double_uri_encode,
            expiration: source.expiration,
            credentials_provider: source.credentials_provider.clone(),
        };
        Self { config }
    }

    /// A fresh per-request config cloned from the cached copy.
    pub(crate) fn config_for_request(&self) -> SigningConfig {
        self.config.clone()
    }

    pub(crate) fn credentials_provider(&self) -> &SharedCredentialsProvider {
        &self.config.credentials_provider
    }
}

/// Error produced by a signer.
#[derive(Debug)]
pub struct SigningError {
    message: String,
    source: Option<BoxError>,
}

impl SigningError {
    /// Creates a signing error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Attaches an underlying cause.
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl fmt::Display for SigningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "signing failed: {}", self.message)
    }
}

impl Error for SigningError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_deref().map(|err| err as _)
    }
}

/// Future returned by [`SignHttpRequest::sign`].
#[must_use]
pub struct SigningFuture(BoxFuture<Result<HttpRequest, SigningError>>);

impl SigningFuture {
    /// Boxes the provided future.
    pub fn new(
        future: impl Future<Output = Result<HttpRequest, SigningError>> + Send + 'static,
    ) -> Self {
        Self(Box::pin(future))
    }

    /// A future that is immediately ready with `result`.
    pub fn ready(result: Result<HttpRequest, SigningError>) -> Self {
        Self::new(std::future::ready(result))
    }
}

impl Future for SigningFuture {
    type Output = Result<HttpRequest, SigningError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.as_mut().poll(cx)
    }
}

/// Signs an HTTP request.
pub trait SignHttpRequest: Send + Sync + fmt::Debug {
    /// Resolves credentials and signs `request` for the instant `now`.
    fn sign(&self, request: HttpRequest, config: &SigningConfig, now: SystemTime)
        -> SigningFuture;
}

/// Shareable handle to a [`SignHttpRequest`] implementation.
#[derive(Clone, Debug)]
pub struct SharedSigner(Arc<dyn SignHttpRequest>);

impl SharedSigner {
    /// Wraps a signer for sharing.
    pub fn new(signer: impl SignHttpRequest + 'static) -> Self {
        Self(Arc::new(signer))
    }
}

impl SignHttpRequest for SharedSigner {
    fn sign(
        &self,
        request: HttpRequest,
        config: &SigningConfig,
        now: SystemTime,
    ) -> SigningFuture {
        self.0.sign(request, config, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> SharedCredentialsProvider {
        SharedCredentialsProvider::new(StaticCredentialsProvider::new(Credentials::new(
            "AKID", "SECRET", None,
        )))
    }

    #[test]
    fn cache_copies_fields() {
        let config = SigningConfig::builder()
            .region("us-east-1")
            .signed_body_header("x-amz-content-sha256")
            .signed_body_value("UNSIGNED-PAYLOAD")
            .credentials_provider(provider())
            .build();
        let cache = SigningCache::new(&config);
        let copy = cache.config_for_request();
        assert_eq!("us-east-1", copy.region());
        assert_eq!("s3", copy.service());
        assert_eq!(Some("UNSIGNED-PAYLOAD"), copy.signed_body_value());
    }

    #[test]
    fn cache_drops_empty_signed_body_value() {
        // The copy is gated on the value being non-empty, regardless of the
        // service field.
        let config = SigningConfig::builder()
            .region("us-east-1")
            .service("s3")
            .signed_body_value("")
            .credentials_provider(provider())
            .build();
        let cache = SigningCache::new(&config);
        assert_eq!(None, cache.config_for_request().signed_body_value());
    }

    #[test]
    fn debug_redacts_secret() {
        let creds = Credentials::new("AKID", "sekrit", None);
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("sekrit"));
        assert!(rendered.contains("AKID"));
    }

    #[tokio::test]
    async fn static_provider_resolves() {
        let creds = provider().provide_credentials().await.unwrap();
        assert_eq!("AKID", creds.access_key_id());
        assert!(!provider().can_refresh());
    }
}
