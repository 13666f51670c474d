/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Auto-ranged download scenarios against the in-memory S3.

mod common;

use std::time::Duration;

use aws_s3_transfer::test_util::{record_transfer, FailureMode, MockOp, MockS3};
use aws_s3_transfer::{ErrorKind, MetaRequestOptions, MetaRequestType};
use bytes::Bytes;
use http::Method;
use pretty_assertions::assert_eq;
use tokio::time::timeout;

const MIB: usize = 1024 * 1024;

async fn download(
    s3: &MockS3,
    key: &str,
) -> (
    aws_s3_transfer::MetaRequestResult,
    Vec<(u64, usize)>,
    Vec<u8>,
) {
    let client = common::test_client(s3);
    let options = MetaRequestOptions::new(MetaRequestType::GetObject, common::message(Method::GET, key));
    let (options, mut recording) = record_transfer(options);
    let _meta_request = client.make_meta_request(options).expect("valid options");
    let result = timeout(Duration::from_secs(30), &mut recording.finished)
        .await
        .expect("transfer finished in time")
        .expect("finish callback fired");
    let chunks: Vec<(u64, usize)> = recording
        .bodies
        .lock()
        .unwrap()
        .iter()
        .map(|(offset, chunk)| (*offset, chunk.len()))
        .collect();
    let collected = recording.collected_bytes();
    (result, chunks, collected)
}

#[tokio::test]
async fn zero_byte_object_finishes_with_no_body_callbacks() {
    let s3 = MockS3::new();
    s3.put_object("empty", Bytes::new());
    let (result, chunks, collected) = download(&s3, "empty").await;
    assert!(result.is_success(), "error: {:?}", result.error());
    assert_eq!(Vec::<(u64, usize)>::new(), chunks);
    assert!(collected.is_empty());
}

#[tokio::test]
async fn seventeen_mib_object_arrives_as_three_ordered_parts() {
    let data = common::pattern(17 * MIB);
    let s3 = MockS3::new();
    s3.put_object("large", Bytes::from(data.clone()));

    let (result, chunks, collected) = download(&s3, "large").await;
    assert!(result.is_success(), "error: {:?}", result.error());
    assert_eq!(
        vec![
            (0, 8 * MIB),
            (8 * MIB as u64, 8 * MIB),
            (16 * MIB as u64, MIB),
        ],
        chunks
    );
    assert_eq!(data, collected);
    assert_eq!(Some(206), result.response_status());
}

#[tokio::test]
async fn object_smaller_than_a_part_is_served_by_the_probe_alone() {
    let data = common::pattern(1000);
    let s3 = MockS3::new();
    s3.put_object("small", Bytes::from(data.clone()));

    let (result, chunks, collected) = download(&s3, "small").await;
    assert!(result.is_success(), "error: {:?}", result.error());
    assert_eq!(vec![(0, 1000)], chunks);
    assert_eq!(data, collected);

    let gets = s3
        .operations()
        .iter()
        .filter(|op| op.op == MockOp::GetObject)
        .count();
    assert_eq!(1, gets);
}

#[tokio::test]
async fn throttled_part_is_retried_and_order_is_preserved() {
    let data = common::pattern(17 * MIB);
    let s3 = MockS3::new();
    s3.put_object("large", Bytes::from(data.clone()));
    // Part index 2 starts at 16 MiB; its first attempt gets a SlowDown.
    s3.inject_failure_at_offset(
        16 * MIB as u64,
        1,
        FailureMode::Status(503, "<Error><Code>SlowDown</Code></Error>"),
    );

    let (result, chunks, collected) = download(&s3, "large").await;
    assert!(result.is_success(), "error: {:?}", result.error());
    assert_eq!(
        vec![(0u64, 8 * MIB), (8 * MIB as u64, 8 * MIB), (16 * MIB as u64, MIB)],
        chunks
    );
    assert_eq!(data, collected);

    // Probe + two parts + one retried attempt.
    let gets = s3
        .operations()
        .iter()
        .filter(|op| op.op == MockOp::GetObject)
        .count();
    assert_eq!(4, gets);
}

#[tokio::test]
async fn missing_object_fails_with_a_permanent_error() {
    let s3 = MockS3::new();
    let (result, chunks, _) = download(&s3, "does-not-exist").await;
    assert!(!result.is_success());
    let error = result.error().expect("transfer failed");
    assert_eq!(ErrorKind::ServerPermanent, error.kind());
    assert_eq!(Some(404), error.response_status());
    assert!(chunks.is_empty());
    assert_eq!(1, result.diagnostics().len());
}

#[tokio::test]
async fn transport_failures_are_retried() {
    let data = common::pattern(9 * MIB);
    let s3 = MockS3::new();
    s3.put_object("flaky", Bytes::from(data.clone()));
    s3.inject_failure(MockOp::GetObject, None, 2, FailureMode::Transport);

    let (result, _chunks, collected) = download(&s3, "flaky").await;
    assert!(result.is_success(), "error: {:?}", result.error());
    assert_eq!(data, collected);
}

#[tokio::test]
async fn every_request_is_signed() {
    let data = common::pattern(9 * MIB);
    let s3 = MockS3::new();
    s3.put_object("signed", Bytes::from(data));

    let (builder, signer) = common::config_builder(&s3);
    let client = aws_s3_transfer::Client::new(builder.build().unwrap());
    let options = MetaRequestOptions::new(
        MetaRequestType::GetObject,
        common::message(Method::GET, "signed"),
    );
    let (options, recording) = record_transfer(options);
    let _meta_request = client.make_meta_request(options).unwrap();
    let result = timeout(Duration::from_secs(30), recording.finished)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_success());
    // Probe plus one more part.
    assert_eq!(2, signer.signed_count());
}
