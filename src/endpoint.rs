/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Endpoint construction helpers.

use std::fmt::Write;

/// Builds the virtual-hosted-style endpoint for a bucket in a region.
pub fn virtual_hosted_endpoint(bucket: &str, region: &str) -> String {
    format!("{bucket}.s3.{region}.amazonaws.com")
}

/// Percent-encodes a query parameter value.
///
/// Unreserved characters (RFC 3986) pass through; everything else is
/// encoded. Upload ids in particular may carry `+` and `/`.
pub(crate) fn query_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => {
                let _ = write!(out, "%{byte:02X}");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_hosted_format() {
        assert_eq!(
            "my-bucket.s3.us-west-2.amazonaws.com",
            virtual_hosted_endpoint("my-bucket", "us-west-2")
        );
    }

    #[test]
    fn query_encoding() {
        assert_eq!("abc-123_~.", query_encode("abc-123_~."));
        assert_eq!("a%2Bb%2Fc%3D%3D", query_encode("a+b/c=="));
    }
}
