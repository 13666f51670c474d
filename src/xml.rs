/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Minimal XML extraction for the handful of S3 response bodies the client
//! reads: `InitiateMultipartUploadResult` and error documents.

use xmlparser::{ElementEnd, Token, Tokenizer};

/// Returns the text content of the first immediate child of the root element
/// whose local name matches `tag_name`.
///
/// Only the root's direct children are considered; a matching element nested
/// deeper is ignored. Parsing stops as soon as the match closes. Returns
/// `None` when the tag is absent or the document fails to parse.
pub fn top_level_tag(doc: &str, tag_name: &str) -> Option<String> {
    let mut depth = 0usize;
    let mut last_open: Option<&str> = None;
    let mut capturing = false;
    let mut captured = String::new();

    for token in Tokenizer::from(doc) {
        match token.ok()? {
            Token::ElementStart { local, .. } => {
                last_open = Some(local.as_str());
            }
            Token::ElementEnd {
                end: ElementEnd::Open,
                ..
            } => {
                depth += 1;
                if depth == 2 && last_open == Some(tag_name) {
                    capturing = true;
                }
            }
            Token::ElementEnd {
                end: ElementEnd::Empty,
                ..
            } => {
                // Self-closing child of the root: matches with empty text.
                if depth == 1 && last_open == Some(tag_name) {
                    return Some(String::new());
                }
            }
            Token::ElementEnd {
                end: ElementEnd::Close(..),
                ..
            } => {
                if capturing && depth == 2 {
                    return Some(captured);
                }
                depth = depth.saturating_sub(1);
            }
            Token::Text { text } => {
                if capturing && depth == 2 {
                    captured.push_str(text.as_str());
                }
            }
            _ => {}
        }
    }
    None
}

/// Escapes text for embedding in an XML element body.
pub(crate) fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Extracts the top-level `<Code>` element of an S3 error document, if the
/// body parses as one.
pub fn error_code(body: &[u8]) -> Option<String> {
    let doc = std::str::from_utf8(body).ok()?;
    top_level_tag(doc, "Code")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_upload_id() {
        let doc = r#"<?xml version="1.0" encoding="UTF-8"?>
            <InitiateMultipartUploadResult>
                <Bucket>my-bucket</Bucket>
                <Key>my-key</Key>
                <UploadId>VXBsb2FkSWQ</UploadId>
            </InitiateMultipartUploadResult>"#;
        assert_eq!(
            Some("VXBsb2FkSWQ".to_string()),
            top_level_tag(doc, "UploadId")
        );
    }

    #[test]
    fn extracts_error_code() {
        let doc = br#"<Error><Code>SlowDown</Code><Message>Reduce your request rate.</Message></Error>"#;
        assert_eq!(Some("SlowDown".to_string()), error_code(doc));
    }

    #[test]
    fn ignores_nested_match() {
        let doc = "<Root><Outer><Code>nested</Code></Outer><Code>top</Code></Root>";
        assert_eq!(Some("top".to_string()), top_level_tag(doc, "Code"));
    }

    #[test]
    fn missing_tag_is_none() {
        let doc = "<Root><Bucket>b</Bucket></Root>";
        assert_eq!(None, top_level_tag(doc, "UploadId"));
    }

    #[test]
    fn self_closing_tag_is_empty() {
        let doc = "<Root><UploadId/></Root>";
        assert_eq!(Some(String::new()), top_level_tag(doc, "UploadId"));
    }

    #[test]
    fn malformed_document_is_none() {
        assert_eq!(None, top_level_tag("<Root><UploadId>oops", "UploadId"));
        assert_eq!(None, top_level_tag("not xml at all", "UploadId"));
    }

    #[test]
    fn non_utf8_error_body_is_none() {
        assert_eq!(None, error_code(&[0xff, 0xfe, 0x00]));
    }

    #[test]
    fn escapes_markup() {
        assert_eq!("\"plain\"", escape("\"plain\""));
        assert_eq!("a&amp;b&lt;c&gt;d", escape("a&b<c>d"));
    }
}
