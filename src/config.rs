/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Client configuration.

use std::error::Error;
use std::fmt;

use tokio::runtime::Handle;

use crate::auth::{SharedSigner, SigningConfig};
use crate::client::ShutdownCallback;
use crate::dns::{SharedHostResolver, TokioHostResolver};
use crate::http::SharedHttpClient;
use crate::retries::{SharedRetryStrategy, StandardRetryStrategy};
use crate::time::SharedTimeSource;

/// Smallest allowed part size (the S3 multipart minimum for all but the
/// last part).
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;
const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;
const DEFAULT_MAX_PART_SIZE: usize = 5 * 1024 * 1024 * 1024;
const DEFAULT_THROUGHPUT_TARGET_GBPS: f64 = 10.0;

/// Validated configuration for [`Client::new`](crate::client::Client::new).
pub struct Config {
    pub(crate) region: String,
    pub(crate) part_size: usize,
    pub(crate) max_part_size: usize,
    pub(crate) throughput_target_gbps: f64,
    pub(crate) signing: SigningConfig,
    pub(crate) signer: SharedSigner,
    pub(crate) http_client: SharedHttpClient,
    pub(crate) host_resolver: SharedHostResolver,
    pub(crate) retry_strategy: SharedRetryStrategy,
    pub(crate) time_source: SharedTimeSource,
    pub(crate) work_handle: Option<Handle>,
    pub(crate) streaming_handle: Option<Handle>,
    pub(crate) shutdown_callback: Option<ShutdownCallback>,
}

impl Config {
    /// Starts building a configuration.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("region", &self.region)
            .field("part_size", &self.part_size)
            .field("max_part_size", &self.max_part_size)
            .field("throughput_target_gbps", &self.throughput_target_gbps)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Config`].
#[derive(Default)]
pub struct ConfigBuilder {
    region: Option<String>,
    part_size: Option<usize>,
    max_part_size: Option<usize>,
    throughput_target_gbps: Option<f64>,
    signing: Option<SigningConfig>,
    signer: Option<SharedSigner>,
    http_client: Option<SharedHttpClient>,
    host_resolver: Option<SharedHostResolver>,
    retry_strategy: Option<SharedRetryStrategy>,
    time_source: Option<SharedTimeSource>,
    work_handle: Option<Handle>,
    streaming_handle: Option<Handle>,
    shutdown_callback: Option<ShutdownCallback>,
}

impl ConfigBuilder {
    /// Sets the region transfers run against. Required.
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Sets the part size for ranged transfers. Defaults to 8 MiB.
    pub fn part_size(mut self, part_size: usize) -> Self {
        self.part_size = Some(part_size);
        self
    }

    /// Sets the largest allowed part size. Defaults to 5 GiB.
    pub fn max_part_size(mut self, max_part_size: usize) -> Self {
        self.max_part_size = Some(max_part_size);
        self
    }

    /// Sets the network throughput to size the VIP pool for. Defaults to
    /// 10 Gbps.
    pub fn throughput_target_gbps(mut self, target: f64) -> Self {
        self.throughput_target_gbps = Some(target);
        self
    }

    /// Sets the signing configuration. Required.
    pub fn signing(mut self, signing: SigningConfig) -> Self {
        self.signing = Some(signing);
        self
    }

    /// Sets the request signer. Required.
    pub fn signer(mut self, signer: SharedSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Sets the HTTP transport. Required.
    pub fn http_client(mut self, http_client: SharedHttpClient) -> Self {
        self.http_client = Some(http_client);
        self
    }

    /// Sets the host resolver. Defaults to [`TokioHostResolver`].
    pub fn host_resolver(mut self, host_resolver: SharedHostResolver) -> Self {
        self.host_resolver = Some(host_resolver);
        self
    }

    /// Sets the retry strategy. Defaults to [`StandardRetryStrategy`].
    pub fn retry_strategy(mut self, retry_strategy: SharedRetryStrategy) -> Self {
        self.retry_strategy = Some(retry_strategy);
        self
    }

    /// Sets the time source. Defaults to the system clock.
    pub fn time_source(mut self, time_source: SharedTimeSource) -> Self {
        self.time_source = Some(time_source);
        self
    }

    /// Runtime the work loop and request pipelines run on. Defaults to the
    /// ambient runtime at client creation.
    pub fn work_handle(mut self, handle: Handle) -> Self {
        self.work_handle = Some(handle);
        self
    }

    /// Runtime body delivery runs on. Defaults to the ambient runtime at
    /// client creation.
    pub fn streaming_handle(mut self, handle: Handle) -> Self {
        self.streaming_handle = Some(handle);
        self
    }

    /// Callback fired once the client has fully shut down.
    pub fn shutdown_callback(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.shutdown_callback = Some(Box::new(callback));
        self
    }

    /// Validates and builds the configuration.
    pub fn build(self) -> Result<Config, ConfigError> {
        let region = self.region.ok_or(ConfigError::MissingField("region"))?;
        let signing = self.signing.ok_or(ConfigError::MissingField("signing"))?;
        let signer = self.signer.ok_or(ConfigError::MissingField("signer"))?;
        let http_client = self
            .http_client
            .ok_or(ConfigError::MissingField("http_client"))?;
        let part_size = self.part_size.unwrap_or(DEFAULT_PART_SIZE);
        let max_part_size = self.max_part_size.unwrap_or(DEFAULT_MAX_PART_SIZE);
        if part_size < MIN_PART_SIZE || part_size > max_part_size {
            return Err(ConfigError::InvalidPartSize {
                part_size,
                min: MIN_PART_SIZE,
                max: max_part_size,
            });
        }
        let throughput_target_gbps = self
            .throughput_target_gbps
            .unwrap_or(DEFAULT_THROUGHPUT_TARGET_GBPS);
        if !throughput_target_gbps.is_finite() || throughput_target_gbps <= 0.0 {
            return Err(ConfigError::InvalidThroughputTarget {
                target: throughput_target_gbps,
            });
        }
        Ok(Config {
            region,
            part_size,
            max_part_size,
            throughput_target_gbps,
            signing,
            signer,
            http_client,
            host_resolver: self
                .host_resolver
                .unwrap_or_else(|| SharedHostResolver::new(TokioHostResolver::default())),
            retry_strategy: self
                .retry_strategy
                .unwrap_or_else(|| SharedRetryStrategy::new(StandardRetryStrategy::default())),
            time_source: self.time_source.unwrap_or_default(),
            work_handle: self.work_handle,
            streaming_handle: self.streaming_handle,
            shutdown_callback: self.shutdown_callback,
        })
    }
}

impl fmt::Debug for ConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigBuilder")
            .field("region", &self.region)
            .field("part_size", &self.part_size)
            .finish_non_exhaustive()
    }
}

/// Rejected configuration.
#[non_exhaustive]
#[derive(Debug)]
pub enum ConfigError {
    /// A required field was not set.
    MissingField(&'static str),
    /// The part size is outside `[MIN_PART_SIZE, max_part_size]`.
    InvalidPartSize {
        /// Requested part size.
        part_size: usize,
        /// Smallest allowed part size.
        min: usize,
        /// Largest allowed part size.
        max: usize,
    },
    /// The throughput target is not a positive finite number.
    InvalidThroughputTarget {
        /// Requested target.
        target: f64,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingField(field) => write!(f, "missing required field `{field}`"),
            ConfigError::InvalidPartSize {
                part_size,
                min,
                max,
            } => write!(
                f,
                "part_size {part_size} is outside the allowed range [{min}, {max}]"
            ),
            ConfigError::InvalidThroughputTarget { target } => {
                write!(f, "throughput target {target} must be positive and finite")
            }
        }
    }
}

impl Error for ConfigError {}

#[cfg(all(test, feature = "test-util"))]
mod tests {
    use super::*;
    use crate::auth::{
        Credentials, SharedCredentialsProvider, SharedSigner, StaticCredentialsProvider,
    };
    use crate::test_util::{MockS3, MockSigner};

    fn base_builder() -> ConfigBuilder {
        let provider = SharedCredentialsProvider::new(StaticCredentialsProvider::new(
            Credentials::new("AKID", "SECRET", None),
        ));
        Config::builder()
            .region("us-east-1")
            .signing(
                SigningConfig::builder()
                    .region("us-east-1")
                    .credentials_provider(provider)
                    .build(),
            )
            .signer(SharedSigner::new(MockSigner::default()))
            .http_client(MockS3::new().http_client())
    }

    #[test]
    fn defaults_apply() {
        let config = base_builder().build().unwrap();
        assert_eq!(DEFAULT_PART_SIZE, config.part_size);
        assert_eq!(DEFAULT_MAX_PART_SIZE, config.max_part_size);
    }

    #[test]
    fn part_size_bounds_are_enforced() {
        let err = base_builder().part_size(1024).build().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPartSize { .. }));

        let err = base_builder()
            .part_size(64 * 1024 * 1024)
            .max_part_size(32 * 1024 * 1024)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPartSize { .. }));
    }

    #[test]
    fn throughput_target_must_be_positive() {
        let err = base_builder().throughput_target_gbps(0.0).build().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidThroughputTarget { .. }));
    }

    #[test]
    fn missing_region_is_rejected() {
        let err = ConfigBuilder::default().build().unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("region")));
    }
}
