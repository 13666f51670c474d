/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Multipart upload scenarios against the in-memory S3.

mod common;

use std::time::Duration;

use aws_s3_transfer::io::BytesInputStream;
use aws_s3_transfer::test_util::{record_transfer, FailureMode, MockOp, MockS3};
use aws_s3_transfer::{ErrorKind, MetaRequestOptions, MetaRequestType};
use bytes::Bytes;
use http::Method;
use pretty_assertions::assert_eq;
use tokio::time::timeout;

const MIB: usize = 1024 * 1024;

async fn upload(s3: &MockS3, key: &str, data: Vec<u8>) -> aws_s3_transfer::MetaRequestResult {
    let client = common::test_client(s3);
    let options = MetaRequestOptions::new(MetaRequestType::PutObject, common::message(Method::PUT, key))
        .body(BytesInputStream::new(Bytes::from(data)));
    let (options, recording) = record_transfer(options);
    let _meta_request = client.make_meta_request(options).expect("valid options");
    timeout(Duration::from_secs(30), recording.finished)
        .await
        .expect("transfer finished in time")
        .expect("finish callback fired")
}

#[tokio::test]
async fn twenty_five_mib_upload_runs_the_full_lifecycle() {
    let data = common::pattern(25 * MIB);
    let s3 = MockS3::new();
    let result = upload(&s3, "dest", data.clone()).await;
    assert!(result.is_success(), "error: {:?}", result.error());
    assert_eq!(Bytes::from(data), s3.object("dest").unwrap());

    let operations = s3.operations();
    let create_index = operations
        .iter()
        .position(|op| op.op == MockOp::CreateUpload)
        .expect("create issued");
    let complete_index = operations
        .iter()
        .position(|op| op.op == MockOp::CompleteUpload)
        .expect("complete issued");
    let mut part_numbers: Vec<u32> = operations
        .iter()
        .filter(|op| op.op == MockOp::UploadPart)
        .map(|op| op.part_number.unwrap())
        .collect();
    part_numbers.sort_unstable();
    assert_eq!(vec![1, 2, 3, 4], part_numbers);

    // Create precedes every part; complete follows them all.
    for (index, op) in operations.iter().enumerate() {
        if op.op == MockOp::UploadPart {
            assert!(create_index < index && index < complete_index);
        }
    }
    assert_eq!(1, s3.completed_uploads().len());
    assert!(s3.aborted_uploads().is_empty());
}

#[tokio::test]
async fn failed_part_aborts_the_upload_and_reports_the_original_error() {
    let data = common::pattern(25 * MIB);
    let s3 = MockS3::new();
    s3.inject_failure(
        MockOp::UploadPart,
        Some(3),
        1,
        FailureMode::Status(400, "<Error><Code>InvalidRequest</Code></Error>"),
    );

    let result = upload(&s3, "dest", data).await;
    assert!(!result.is_success());
    let error = result.error().expect("upload failed");
    assert_eq!(ErrorKind::ServerPermanent, error.kind());
    assert_eq!(Some(400), error.response_status());
    assert!(error.message().contains("InvalidRequest"));

    let operations = s3.operations();
    assert!(operations.iter().all(|op| op.op != MockOp::CompleteUpload));
    let abort = operations
        .iter()
        .find(|op| op.op == MockOp::AbortUpload)
        .expect("abort issued");
    // The abort names the upload that create returned.
    assert_eq!(s3.aborted_uploads(), vec![abort.upload_id.clone().unwrap()]);
    assert!(s3.completed_uploads().is_empty());
    assert!(s3.object("dest").is_none());

    let diagnostics = result.diagnostics();
    assert_eq!(1, diagnostics.len());
    assert_eq!(Some(3), diagnostics[0].part_number);
}

#[tokio::test]
async fn throttled_part_is_retried_until_it_succeeds() {
    let data = common::pattern(9 * MIB);
    let s3 = MockS3::new();
    s3.inject_failure(
        MockOp::UploadPart,
        Some(2),
        1,
        FailureMode::Status(503, "<Error><Code>SlowDown</Code></Error>"),
    );
    let result = upload(&s3, "dest", data.clone()).await;
    assert!(result.is_success(), "error: {:?}", result.error());
    assert_eq!(Bytes::from(data), s3.object("dest").unwrap());

    let part_two_attempts = s3
        .operations()
        .iter()
        .filter(|op| op.op == MockOp::UploadPart && op.part_number == Some(2))
        .count();
    assert_eq!(2, part_two_attempts);
}

#[tokio::test]
async fn empty_stream_still_uploads_one_part() {
    let s3 = MockS3::new();
    let result = upload(&s3, "empty", Vec::new()).await;
    assert!(result.is_success(), "error: {:?}", result.error());
    assert_eq!(Bytes::new(), s3.object("empty").unwrap());

    let parts: Vec<u32> = s3
        .operations()
        .iter()
        .filter(|op| op.op == MockOp::UploadPart)
        .map(|op| op.part_number.unwrap())
        .collect();
    assert_eq!(vec![1], parts);
    assert_eq!(1, s3.completed_uploads().len());
}

#[tokio::test]
async fn create_failure_reports_without_aborting() {
    let data = common::pattern(9 * MIB);
    let s3 = MockS3::new();
    s3.inject_failure(
        MockOp::CreateUpload,
        None,
        1,
        FailureMode::Status(403, "<Error><Code>AccessDenied</Code></Error>"),
    );
    let result = upload(&s3, "dest", data).await;
    assert!(!result.is_success());
    assert_eq!(ErrorKind::Auth, result.error().unwrap().kind());
    // No upload id exists, so nothing to abort.
    assert!(s3.aborted_uploads().is_empty());
    assert!(s3
        .operations()
        .iter()
        .all(|op| op.op != MockOp::UploadPart && op.op != MockOp::AbortUpload));
}

#[tokio::test]
async fn uploaded_bytes_round_trip_through_a_ranged_download() {
    let data = common::pattern(21 * MIB);
    let s3 = MockS3::new();
    let client = common::test_client(&s3);

    let put_options = MetaRequestOptions::new(
        MetaRequestType::PutObject,
        common::message(Method::PUT, "round-trip"),
    )
    .body(BytesInputStream::new(Bytes::from(data.clone())));
    let (put_options, put_recording) = record_transfer(put_options);
    let _put = client.make_meta_request(put_options).unwrap();
    let put_result = timeout(Duration::from_secs(30), put_recording.finished)
        .await
        .unwrap()
        .unwrap();
    assert!(put_result.is_success(), "error: {:?}", put_result.error());

    let get_options = MetaRequestOptions::new(
        MetaRequestType::GetObject,
        common::message(Method::GET, "round-trip"),
    );
    let (get_options, mut get_recording) = record_transfer(get_options);
    let _get = client.make_meta_request(get_options).unwrap();
    let get_result = timeout(Duration::from_secs(30), &mut get_recording.finished)
        .await
        .unwrap()
        .unwrap();
    assert!(get_result.is_success(), "error: {:?}", get_result.error());
    assert_eq!(data, get_recording.collected_bytes());
}
