/*
 * Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0
 */

//! The transfer client: VIP pool management, meta-request submission, the
//! work loop, and shutdown.
//!
//! The client carries two independent reference counts. The external count
//! is the user's [`Client`] handles; dropping the last one begins shutdown.
//! The internal count is held by every resource whose teardown is
//! asynchronous: the work-loop task, the host-listener task, each VIP, each
//! live sub-request, and each streaming drain. The user's shutdown callback
//! fires only once both counts reach zero, which places it strictly after
//! the last meta-request finish callback.

pub(crate) mod pipeline;
pub(crate) mod vip;
pub(crate) mod work_loop;

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::auth::{SharedSigner, SigningCache};
use crate::config::Config;
use crate::dns::{HostAddresses, HostListener, HostResolver, SharedHostResolver};
use crate::error::TransferError;
use crate::http::{HttpClient, SharedHttpClient};
use crate::meta_request::{
    InvalidMetaRequest, MetaRequest, MetaRequestOptions, MetaRequestShared,
};
use crate::retries::SharedRetryStrategy;
use crate::time::SharedTimeSource;

use self::vip::{Vip, VipConnection};

/// Modeled throughput of a single VIP; the pool grows until
/// `throughput_target_gbps` is covered.
pub(crate) const THROUGHPUT_PER_VIP_GBPS: f64 = 4.0;
/// Connection slots allocated per VIP.
pub(crate) const CONNECTIONS_PER_VIP: usize = 10;
/// Hard cap on concurrently executing sub-requests per client.
pub(crate) const MAX_REQUESTS_IN_FLIGHT: usize = 32;
/// A connection that served this many exchanges is retired and replaced.
pub(crate) const MAX_REQUESTS_PER_CONNECTION: u32 = 100;
/// Soft cap on allocated-but-not-destroyed sub-requests; meta requests stop
/// preparing parts while the count is at the cap.
pub(crate) const PENDING_REQUEST_SOFT_CAP: usize = 64;

/// Invoked once the client and all of its resources have shut down.
pub type ShutdownCallback = Box<dyn FnOnce() + Send>;

/// Handle to a transfer client.
///
/// Clones share one client; dropping the last clone begins shutdown.
/// In-flight transfers are cancelled with a shutdown error, their finish
/// callbacks fire, and the shutdown callback (if configured) fires last.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
    _external: Arc<ExternalRef>,
}

impl Client {
    /// Creates a client and starts its work loop.
    ///
    /// # Panics
    /// Panics when no runtime handles were configured and the calling
    /// thread is not inside a Tokio runtime.
    pub fn new(config: Config) -> Self {
        let work_handle = config
            .work_handle
            .clone()
            .unwrap_or_else(Handle::current);
        let streaming_handle = config
            .streaming_handle
            .clone()
            .unwrap_or_else(Handle::current);
        let ideal_vip_count =
            ((config.throughput_target_gbps / THROUGHPUT_PER_VIP_GBPS).ceil() as usize).max(1);
        let inner = Arc::new(ClientInner {
            region: config.region,
            part_size: config.part_size,
            max_part_size: config.max_part_size,
            ideal_vip_count,
            signing_cache: SigningCache::new(&config.signing),
            signer: config.signer,
            retry_strategy: config.retry_strategy,
            http_client: config.http_client,
            host_resolver: config.host_resolver,
            time_source: config.time_source,
            work_handle,
            streaming_handle,
            shutdown_callback: Mutex::new(config.shutdown_callback),
            synced: Mutex::new(SyncedData {
                active: true,
                endpoint_host: None,
                vips: Vec::new(),
                vip_count: 0,
                pending_connection_updates: Vec::new(),
                pending_meta_requests: Vec::new(),
                requests_finished: 0,
                process_work_scheduled: false,
                host_listener: None,
            }),
            work_notify: Notify::new(),
            internal_count: AtomicUsize::new(0),
            external_released: AtomicBool::new(false),
            pending_request_count: AtomicUsize::new(0),
        });
        debug!(
            region = %inner.region,
            part_size = inner.part_size,
            ideal_vip_count = inner.ideal_vip_count,
            "transfer client created"
        );
        let internal = inner.internal_ref();
        inner
            .work_handle
            .spawn(work_loop::run(Arc::clone(&inner), internal));
        Self {
            _external: Arc::new(ExternalRef {
                inner: Arc::clone(&inner),
            }),
            inner,
        }
    }

    /// Submits a meta request.
    ///
    /// Validates the options, queues the transfer for the work loop, and
    /// returns a handle that can cancel it. The first submission pins the
    /// client to the message's endpoint host and starts address discovery.
    pub fn make_meta_request(
        &self,
        options: MetaRequestOptions,
    ) -> Result<MetaRequest, InvalidMetaRequest> {
        options.validate()?;
        let host = options
            .message
            .host()
            .expect("validated: host header present")
            .to_string();
        let shared = MetaRequestShared::new(
            options,
            self.inner.part_size,
            Arc::downgrade(&self.inner),
            self.inner.streaming_handle.clone(),
        );
        let start_listening = {
            let mut synced = self.inner.synced.lock().unwrap();
            if !synced.active {
                return Err(InvalidMetaRequest::ClientShuttingDown);
            }
            synced.pending_meta_requests.push(Arc::clone(&shared));
            if synced.endpoint_host.is_none() {
                synced.endpoint_host = Some(host.clone());
                true
            } else {
                false
            }
        };
        if start_listening {
            self.inner.start_host_listener(&host);
        }
        trace!(kind = shared.kind_name(), host = %host, "meta request submitted");
        self.inner.schedule_process_work();
        Ok(MetaRequest { shared })
    }

    /// The configured part size.
    pub fn part_size(&self) -> usize {
        self.inner.part_size
    }

    /// The configured region.
    pub fn region(&self) -> &str {
        &self.inner.region
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("region", &self.inner.region)
            .field("part_size", &self.inner.part_size)
            .finish_non_exhaustive()
    }
}

struct ExternalRef {
    inner: Arc<ClientInner>,
}

impl Drop for ExternalRef {
    fn drop(&mut self) {
        self.inner.external_released.store(true, Ordering::SeqCst);
        self.inner.begin_shutdown();
        self.inner.maybe_fire_shutdown();
    }
}

/// Data guarded by the client lock: touched from any thread, held only for
/// list splices and flag flips.
pub(crate) struct SyncedData {
    pub(crate) active: bool,
    pub(crate) endpoint_host: Option<String>,
    pub(crate) vips: Vec<Arc<Vip>>,
    pub(crate) vip_count: usize,
    pub(crate) pending_connection_updates: Vec<VipConnection>,
    pub(crate) pending_meta_requests: Vec<Arc<MetaRequestShared>>,
    /// Completed pipelines since the last work-loop pass; drained to
    /// decrement the in-flight count.
    pub(crate) requests_finished: usize,
    pub(crate) process_work_scheduled: bool,
    pub(crate) host_listener: Option<JoinHandle<()>>,
}

pub(crate) struct ClientInner {
    pub(crate) region: String,
    pub(crate) part_size: usize,
    #[allow(dead_code)]
    pub(crate) max_part_size: usize,
    pub(crate) ideal_vip_count: usize,
    pub(crate) signing_cache: SigningCache,
    pub(crate) signer: SharedSigner,
    pub(crate) retry_strategy: SharedRetryStrategy,
    pub(crate) http_client: SharedHttpClient,
    pub(crate) host_resolver: SharedHostResolver,
    pub(crate) time_source: SharedTimeSource,
    pub(crate) work_handle: Handle,
    pub(crate) streaming_handle: Handle,
    shutdown_callback: Mutex<Option<ShutdownCallback>>,
    pub(crate) synced: Mutex<SyncedData>,
    pub(crate) work_notify: Notify,
    internal_count: AtomicUsize,
    external_released: AtomicBool,
    pending_request_count: AtomicUsize,
}

impl ClientInner {
    /// Takes an internal reference; the shutdown callback waits on these.
    pub(crate) fn internal_ref(self: &Arc<Self>) -> InternalRef {
        self.internal_count.fetch_add(1, Ordering::SeqCst);
        InternalRef {
            client: Arc::clone(self),
        }
    }

    /// Accounts one allocated sub-request against the soft cap.
    pub(crate) fn pending_request_guard(self: &Arc<Self>) -> PendingCountGuard {
        self.pending_request_count.fetch_add(1, Ordering::SeqCst);
        PendingCountGuard {
            internal: self.internal_ref(),
        }
    }

    pub(crate) fn pending_request_count(&self) -> usize {
        self.pending_request_count.load(Ordering::SeqCst)
    }

    /// Queues a work-loop pass unless one is already queued.
    pub(crate) fn schedule_process_work(&self) {
        let mut synced = self.synced.lock().unwrap();
        if !synced.process_work_scheduled {
            synced.process_work_scheduled = true;
            self.work_notify.notify_one();
        }
    }

    fn start_host_listener(self: &Arc<Self>, host: &str) {
        let listener = self.host_resolver.listen(host);
        let internal = self.internal_ref();
        let task = self
            .work_handle
            .spawn(run_host_listener(Arc::clone(self), listener, internal));
        let mut synced = self.synced.lock().unwrap();
        if synced.active {
            synced.host_listener = Some(task);
        } else {
            task.abort();
        }
    }

    /// Adopts newly resolved addresses, up to the ideal VIP count, creating
    /// the VIP's connection slots as pending updates for the work loop.
    pub(crate) fn add_host_addresses(self: &Arc<Self>, addresses: Vec<IpAddr>) {
        {
            let mut synced = self.synced.lock().unwrap();
            if !synced.active {
                return;
            }
            let Some(host) = synced.endpoint_host.clone() else {
                return;
            };
            for address in addresses {
                if synced.vip_count >= self.ideal_vip_count {
                    break;
                }
                if synced.vips.iter().any(|vip| vip.address() == address) {
                    continue;
                }
                let manager = self.http_client.connection_manager(&host, address);
                let vip = Vip::new(address, manager, self.internal_ref());
                debug!(address = %vip.address(), "vip added");
                for _ in 0..CONNECTIONS_PER_VIP {
                    synced.pending_connection_updates.push(VipConnection::new(&vip));
                }
                synced.vips.push(vip);
                synced.vip_count += 1;
            }
        }
        self.schedule_process_work();
    }

    /// Drops VIPs whose addresses stopped resolving. Their connections are
    /// retired as they surface; slots are not replaced.
    pub(crate) fn remove_host_addresses(&self, addresses: Vec<IpAddr>) {
        {
            let mut synced = self.synced.lock().unwrap();
            synced.vips.retain(|vip| {
                if addresses.contains(&vip.address()) {
                    debug!(address = %vip.address(), "vip removed");
                    vip.set_inactive();
                    false
                } else {
                    true
                }
            });
            synced.vip_count = synced.vips.len();
        }
        self.schedule_process_work();
    }

    /// Begins shutdown: stop accepting work, drop the VIP pool, and let the
    /// work loop cancel whatever is queued. Idempotent.
    pub(crate) fn begin_shutdown(&self) {
        let (listener, vips) = {
            let mut synced = self.synced.lock().unwrap();
            if !synced.active {
                return;
            }
            synced.active = false;
            synced.vip_count = 0;
            (synced.host_listener.take(), std::mem::take(&mut synced.vips))
        };
        debug!("client shutdown started");
        if let Some(listener) = listener {
            listener.abort();
        }
        for vip in &vips {
            vip.set_inactive();
        }
        drop(vips);
        self.schedule_process_work();
    }

    pub(crate) fn maybe_fire_shutdown(&self) {
        if !self.external_released.load(Ordering::SeqCst) {
            return;
        }
        if self.internal_count.load(Ordering::SeqCst) != 0 {
            return;
        }
        if let Some(callback) = self.shutdown_callback.lock().unwrap().take() {
            debug!("client shutdown complete");
            self.work_handle.spawn(async move { callback() });
        }
    }

    /// Cancels every queued and active meta request with a shutdown error.
    pub(crate) fn cancel_all(&self, meta_requests: &[Arc<MetaRequestShared>]) {
        for meta_request in meta_requests {
            meta_request.cancel_for_shutdown();
        }
    }
}

impl fmt::Debug for ClientInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientInner")
            .field("region", &self.region)
            .field("part_size", &self.part_size)
            .field("ideal_vip_count", &self.ideal_vip_count)
            .finish_non_exhaustive()
    }
}

/// Counted reference held by every asynchronously torn-down resource.
pub(crate) struct InternalRef {
    client: Arc<ClientInner>,
}

impl InternalRef {
    pub(crate) fn client(&self) -> &Arc<ClientInner> {
        &self.client
    }
}

impl Clone for InternalRef {
    fn clone(&self) -> Self {
        self.client.internal_count.fetch_add(1, Ordering::SeqCst);
        Self {
            client: Arc::clone(&self.client),
        }
    }
}

impl Drop for InternalRef {
    fn drop(&mut self) {
        if self.client.internal_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.client.maybe_fire_shutdown();
        }
    }
}

impl fmt::Debug for InternalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InternalRef")
    }
}

/// Drop guard for one unit of the pending-request budget.
pub(crate) struct PendingCountGuard {
    internal: InternalRef,
}

impl Drop for PendingCountGuard {
    fn drop(&mut self) {
        let client = self.internal.client();
        client.pending_request_count.fetch_sub(1, Ordering::SeqCst);
        client.schedule_process_work();
    }
}

impl fmt::Debug for PendingCountGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PendingCountGuard")
    }
}

async fn run_host_listener(
    inner: Arc<ClientInner>,
    mut listener: HostListener,
    internal: InternalRef,
) {
    while let Some(event) = listener.recv().await {
        if !inner.synced.lock().unwrap().active {
            break;
        }
        match event {
            HostAddresses::Added(addresses) => inner.add_host_addresses(addresses),
            HostAddresses::Removed(addresses) => inner.remove_host_addresses(addresses),
        }
    }
    drop(internal);
}
