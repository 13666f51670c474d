/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Shared setup for the integration scenarios: a client wired entirely to
//! in-memory collaborators.

#![allow(dead_code)]

use std::time::Duration;

use aws_s3_transfer::auth::{
    Credentials, SharedCredentialsProvider, SharedSigner, SigningConfig, StaticCredentialsProvider,
};
use aws_s3_transfer::config::ConfigBuilder;
use aws_s3_transfer::dns::SharedHostResolver;
use aws_s3_transfer::endpoint::virtual_hosted_endpoint;
use aws_s3_transfer::http::HttpRequest;
use aws_s3_transfer::retries::{SharedRetryStrategy, StandardRetryStrategy};
use aws_s3_transfer::test_util::{MockS3, MockSigner, StaticHostResolver};
use aws_s3_transfer::{Client, Config};
use http::Method;

pub const REGION: &str = "us-east-1";
pub const BUCKET: &str = "test-bucket";

/// A config builder wired to the mock S3, a recording signer, two static
/// endpoint addresses, and a fast deterministic retry strategy.
pub fn config_builder(s3: &MockS3) -> (ConfigBuilder, MockSigner) {
    let signer = MockSigner::new();
    let provider = SharedCredentialsProvider::new(StaticCredentialsProvider::new(
        Credentials::new("AKID", "SECRET", None),
    ));
    let builder = Config::builder()
        .region(REGION)
        .signing(
            SigningConfig::builder()
                .region(REGION)
                .credentials_provider(provider)
                .build(),
        )
        .signer(SharedSigner::new(signer.clone()))
        .http_client(s3.http_client())
        .host_resolver(SharedHostResolver::new(
            StaticHostResolver::with_address_count(2),
        ))
        .retry_strategy(SharedRetryStrategy::new(
            StandardRetryStrategy::builder()
                .initial_backoff(Duration::from_millis(1))
                .use_static_base(true)
                .build(),
        ));
    (builder, signer)
}

pub fn test_client(s3: &MockS3) -> Client {
    let (builder, _signer) = config_builder(s3);
    Client::new(builder.build().expect("valid test config"))
}

/// A message template addressing `key` in the test bucket.
pub fn message(method: Method, key: &str) -> HttpRequest {
    let mut message = HttpRequest::new(method, format!("/{key}").parse().expect("valid path"));
    message.headers_mut().insert(
        http::header::HOST,
        virtual_hosted_endpoint(BUCKET, REGION)
            .parse()
            .expect("valid host header"),
    );
    message
}

/// Deterministic payload of `len` bytes.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
