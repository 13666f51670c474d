/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! VIPs and their connection slots.
//!
//! A VIP is one resolved endpoint address with its own connection manager;
//! the client fans part requests out across every VIP's connections. A
//! `VipConnection` is an owned slot that moves between the work loop's idle
//! list, a per-request pipeline task, and the pending-updates list on its
//! way back.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::client::{InternalRef, MAX_REQUESTS_PER_CONNECTION};
use crate::http::SharedConnectionManager;

pub(crate) struct Vip {
    address: IpAddr,
    manager: SharedConnectionManager,
    active: AtomicBool,
    /// Keeps the client's internal count up while this VIP exists; its
    /// teardown is asynchronous with respect to removal from the list.
    _internal: InternalRef,
}

impl Vip {
    pub(crate) fn new(
        address: IpAddr,
        manager: SharedConnectionManager,
        internal: InternalRef,
    ) -> Arc<Self> {
        Arc::new(Self {
            address,
            manager,
            active: AtomicBool::new(true),
            _internal: internal,
        })
    }

    pub(crate) fn address(&self) -> IpAddr {
        self.address
    }

    pub(crate) fn manager(&self) -> &SharedConnectionManager {
        &self.manager
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn set_inactive(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for Vip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vip")
            .field("address", &self.address)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

/// Where a connection slot currently is in the request pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VipConnectionState {
    Idle,
    AcquiringHttp,
    Signing,
    InFlight,
    RetryWaiting,
    Retired,
}

/// One reusable connection slot on a VIP.
pub(crate) struct VipConnection {
    vip: Weak<Vip>,
    pub(crate) state: VipConnectionState,
    /// Exchanges served; connections are recycled past a soft cap.
    pub(crate) request_count: u32,
}

impl VipConnection {
    pub(crate) fn new(vip: &Arc<Vip>) -> Self {
        Self {
            vip: Arc::downgrade(vip),
            state: VipConnectionState::Idle,
            request_count: 0,
        }
    }

    /// The owning VIP, while it still exists.
    pub(crate) fn vip(&self) -> Option<Arc<Vip>> {
        self.vip.upgrade()
    }

    /// Whether the slot can still serve requests.
    pub(crate) fn is_usable(&self) -> bool {
        if self.state == VipConnectionState::Retired {
            return false;
        }
        match self.vip.upgrade() {
            Some(vip) => vip.is_active(),
            None => false,
        }
    }

    /// Whether the slot has served its quota and should be replaced.
    pub(crate) fn should_retire(&self) -> bool {
        self.request_count >= MAX_REQUESTS_PER_CONNECTION || !self.is_usable()
    }
}

impl fmt::Debug for VipConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VipConnection")
            .field("state", &self.state)
            .field("request_count", &self.request_count)
            .finish_non_exhaustive()
    }
}
