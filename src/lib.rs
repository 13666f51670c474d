/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! High-throughput Amazon S3 transfer client.
//!
//! A single logical object transfer (a *meta request*) is decomposed into
//! fixed-size part requests and fanned out over many HTTP connections
//! spread across the service endpoint's resolved addresses, saturating a
//! configured throughput target. Downloads probe the object size with a
//! first-part ranged GET and stream parts back to the caller in strict
//! object order; uploads run the multipart-upload protocol with parallel
//! part PUTs. Retries, signing, and endpoint discovery are applied
//! per part.
//!
//! The HTTP transport, SigV4 signer, and credentials provider are supplied
//! by the caller through the seams in [`http`], [`auth`], and [`dns`]; the
//! `test-util` feature ships in-memory implementations for exercising
//! transfers without a network.

#![warn(
    missing_docs,
    rustdoc::missing_crate_level_docs,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod auth;
pub mod client;
pub mod config;
pub mod dns;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod io;
pub mod meta_request;
pub(crate) mod request;
pub mod retries;
pub mod rt;
#[cfg(feature = "test-util")]
pub mod test_util;
pub mod time;
pub mod xml;

pub use client::Client;
pub use config::Config;
pub use error::{ErrorKind, TransferError};
pub use meta_request::{
    MetaRequest, MetaRequestOptions, MetaRequestResult, MetaRequestType,
};
