/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Endpoint address discovery.
//!
//! S3 publishes many front-end addresses per endpoint; the client listens
//! for address updates and opens a connection pool per address. The
//! [`HostResolver`] trait produces a [`HostListener`]: a push stream of
//! added/removed addresses for one host name.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// A batch of address changes for a listened host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostAddresses {
    /// Addresses newly observed for the host.
    Added(Vec<IpAddr>),
    /// Addresses that stopped resolving for the host.
    Removed(Vec<IpAddr>),
}

/// Receiving side of a host subscription.
///
/// Dropping the listener ends the subscription; resolver tasks notice the
/// closed channel on their next send.
#[derive(Debug)]
pub struct HostListener {
    events: mpsc::UnboundedReceiver<HostAddresses>,
}

impl HostListener {
    /// Creates a listener and the sender a resolver pushes events through.
    pub fn channel() -> (mpsc::UnboundedSender<HostAddresses>, HostListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, HostListener { events: rx })
    }

    /// Waits for the next address event. `None` means the resolver stopped.
    pub async fn recv(&mut self) -> Option<HostAddresses> {
        self.events.recv().await
    }
}

/// Resolves host names into a stream of address updates.
pub trait HostResolver: Send + Sync + fmt::Debug {
    /// Starts listening for address changes on `host`.
    fn listen(&self, host: &str) -> HostListener;
}

/// Shareable handle to a [`HostResolver`].
#[derive(Clone, Debug)]
pub struct SharedHostResolver(Arc<dyn HostResolver>);

impl SharedHostResolver {
    /// Wraps a [`HostResolver`] implementation for sharing.
    pub fn new(resolver: impl HostResolver + 'static) -> Self {
        Self(Arc::new(resolver))
    }
}

impl HostResolver for SharedHostResolver {
    fn listen(&self, host: &str) -> HostListener {
        self.0.listen(host)
    }
}

/// Default resolver: re-resolves through the standard library on a blocking
/// task, diffing each round against the last and pushing the changes.
#[derive(Debug, Clone)]
pub struct TokioHostResolver {
    poll_interval: Duration,
}

impl Default for TokioHostResolver {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl TokioHostResolver {
    /// Creates a resolver that re-resolves every `poll_interval`.
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }
}

impl HostResolver for TokioHostResolver {
    fn listen(&self, host: &str) -> HostListener {
        let (tx, listener) = HostListener::channel();
        let host = host.to_string();
        let poll_interval = self.poll_interval;
        tokio::spawn(async move {
            let mut known: HashSet<IpAddr> = HashSet::new();
            loop {
                let name = host.clone();
                let resolved =
                    tokio::task::spawn_blocking(move || (name.as_str(), 0u16).to_socket_addrs())
                        .await;
                match resolved {
                    Ok(Ok(addrs)) => {
                        let current: HashSet<IpAddr> =
                            addrs.into_iter().map(|addr| addr.ip()).collect();
                        let added: Vec<IpAddr> =
                            current.difference(&known).copied().collect();
                        let removed: Vec<IpAddr> =
                            known.difference(&current).copied().collect();
                        known = current;
                        if !added.is_empty() {
                            trace!(host = %host, count = added.len(), "addresses added");
                            if tx.send(HostAddresses::Added(added)).is_err() {
                                break;
                            }
                        }
                        if !removed.is_empty() {
                            trace!(host = %host, count = removed.len(), "addresses removed");
                            if tx.send(HostAddresses::Removed(removed)).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Err(err)) => {
                        debug!(host = %host, error = %err, "host resolution failed");
                    }
                    Err(_join_err) => break,
                }
                if tx.is_closed() {
                    break;
                }
                tokio::time::sleep(poll_interval).await;
            }
        });
        listener
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listener_receives_pushed_events() {
        let (tx, mut listener) = HostListener::channel();
        let addr: IpAddr = "10.0.0.1".parse().unwrap();
        tx.send(HostAddresses::Added(vec![addr])).unwrap();
        assert_eq!(Some(HostAddresses::Added(vec![addr])), listener.recv().await);
        drop(tx);
        assert_eq!(None, listener.recv().await);
    }

    #[tokio::test]
    async fn localhost_resolves() {
        let resolver = TokioHostResolver::new(Duration::from_secs(60));
        let mut listener = resolver.listen("localhost");
        match listener.recv().await {
            Some(HostAddresses::Added(addrs)) => assert!(!addrs.is_empty()),
            other => panic!("expected added addresses, got {other:?}"),
        }
    }
}
