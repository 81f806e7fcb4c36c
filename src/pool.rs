use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::{AbortHandle, Abortable, BoxFuture};
use futures::FutureExt;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::config::TimeoutSetting;
use crate::error::RpcError;
use crate::net::{UnifyAddr, UnifyStream};
use crate::stub::Stub;

/// External connector the pool uses to open fresh streams. Endpoint
/// resolution and any transport security handshake happen behind this
/// interface.
pub trait SocketClient: Send + Sync + 'static {
    fn connect<'a>(
        &'a self, endpoint: &'a str, tls: bool, timeout: Duration,
    ) -> BoxFuture<'a, Result<UnifyStream, RpcError>>;
}

/// Plain connector for "host:port" and "/path" endpoints. It carries no
/// transport security; asking for tls yields [RpcError::Unavailable].
pub struct DefaultSocketClient;

impl SocketClient for DefaultSocketClient {
    fn connect<'a>(
        &'a self, endpoint: &'a str, tls: bool, timeout: Duration,
    ) -> BoxFuture<'a, Result<UnifyStream, RpcError>> {
        async move {
            if tls {
                warn!("tls requested but no tls-capable socket client is configured");
                return Err(RpcError::Unavailable);
            }
            let Ok(addr) = UnifyAddr::from_str(endpoint) else {
                return Err(RpcError::InvalidArgument);
            };
            match UnifyStream::connect_timeout(&addr, timeout).await {
                Ok(s) => Ok(s),
                Err(_e) => {
                    warn!("connect {} failed: {:?}", endpoint, _e);
                    Err(RpcError::Unavailable)
                }
            }
        }
        .boxed()
    }
}

/// Connector pinned to one unix socket path, whatever endpoint key the pool
/// asks for.
pub struct UdsSocketClient {
    path: PathBuf,
}

impl UdsSocketClient {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl SocketClient for UdsSocketClient {
    fn connect<'a>(
        &'a self, _endpoint: &'a str, tls: bool, timeout: Duration,
    ) -> BoxFuture<'a, Result<UnifyStream, RpcError>> {
        async move {
            if tls {
                return Err(RpcError::Unavailable);
            }
            let addr = UnifyAddr::Path(self.path.clone());
            match UnifyStream::connect_timeout(&addr, timeout).await {
                Ok(s) => Ok(s),
                Err(_e) => {
                    warn!("connect {} failed: {:?}", self.path.display(), _e);
                    Err(RpcError::Unavailable)
                }
            }
        }
        .boxed()
    }
}

struct PoolSlot {
    stub: Option<Stub>,
    refcount: usize,
    last_used: Instant,
}

struct PoolInner {
    slots: StdMutex<FxHashMap<String, Arc<Mutex<PoolSlot>>>>,
    timeout: TimeoutSetting,
    client: Arc<dyn SocketClient>,
}

/// Endpoint-keyed cache of live [Stub]s.
///
/// `get_stub` hands out a cached stub when one is alive, otherwise connects
/// through the configured [SocketClient]; concurrent callers of the same
/// endpoint ride on a single connection attempt. Entries whose refcount
/// dropped to zero are evicted once they sit idle past the expiration, by a
/// background sweeper or lazily on access.
pub struct StubPool {
    inner: Arc<PoolInner>,
    sweeper_abort: AbortHandle,
}

impl Drop for StubPool {
    fn drop(&mut self) {
        self.sweeper_abort.abort();
    }
}

impl StubPool {
    /// Must be called within a tokio runtime; the pool runs a background
    /// sweeper task until dropped.
    pub fn new(timeout: TimeoutSetting, client: Arc<dyn SocketClient>) -> Self {
        let inner = Arc::new(PoolInner {
            slots: StdMutex::new(FxHashMap::default()),
            timeout,
            client,
        });
        let tick = (timeout.expiration / 4)
            .max(Duration::from_millis(10))
            .min(Duration::from_secs(1));
        let (sweeper_abort, abort_reg) = AbortHandle::new_pair();
        let sweep_inner = inner.clone();
        tokio::spawn(
            Abortable::new(
                async move {
                    loop {
                        sleep(tick).await;
                        sweep_inner.sweep().await;
                    }
                },
                abort_reg,
            )
            .map(|_| ()),
        );
        Self { inner, sweeper_abort }
    }

    /// Default deadline for calls issued through stubs of this pool.
    #[inline(always)]
    pub fn get_timeout(&self) -> Duration {
        self.inner.timeout.rpc_timeout
    }

    /// Fetch the stub for `endpoint`, connecting when no healthy one is
    /// cached. `tls` is handed to the socket client on creation; it does not
    /// partition the cache.
    pub async fn get_stub(&self, endpoint: &str, tls: bool) -> Result<Stub, RpcError> {
        let inner = &self.inner;
        let slot = inner.slot(endpoint);
        // one connection initiator per endpoint, the rest wait here
        let mut slot = slot.lock().await;
        if let Some(stub) = slot.stub.as_ref() {
            let expired =
                slot.refcount == 0 && slot.last_used.elapsed() >= inner.timeout.expiration;
            if !stub.is_closed() && !expired {
                let stub = stub.clone();
                slot.refcount += 1;
                slot.last_used = Instant::now();
                return Ok(stub);
            }
            let stale = slot.stub.take().unwrap();
            tokio::spawn(async move {
                stale.close().await;
            });
        }
        debug!("stub pool connecting to {} (tls={})", endpoint, tls);
        let stream = inner.client.connect(endpoint, tls, inner.timeout.connect_timeout).await?;
        let stub = Stub::new(stream);
        slot.stub = Some(stub.clone());
        slot.refcount = 1;
        slot.last_used = Instant::now();
        Ok(stub)
    }

    /// Non-creating lookup. None when nothing live is cached for `endpoint`.
    pub async fn acquire(&self, endpoint: &str) -> Option<Stub> {
        let slot = self.inner.slots.lock().unwrap().get(endpoint).cloned()?;
        let mut slot = slot.lock().await;
        let stub = slot.stub.clone()?;
        if stub.is_closed() {
            return None;
        }
        slot.refcount += 1;
        slot.last_used = Instant::now();
        Some(stub)
    }

    /// Release one reference taken by `get_stub`/`acquire`. With
    /// `immediately` the entry is dropped and its stream closed no matter
    /// how many references remain; otherwise it is left to age out.
    /// Returns false when `endpoint` has no entry.
    pub async fn put_stub(&self, endpoint: &str, immediately: bool) -> bool {
        let Some(slot) = self.inner.slots.lock().unwrap().get(endpoint).cloned() else {
            return false;
        };
        let mut slot = slot.lock().await;
        if slot.refcount > 0 {
            slot.refcount -= 1;
        }
        slot.last_used = Instant::now();
        if immediately {
            slot.refcount = 0;
            if let Some(stub) = slot.stub.take() {
                drop(slot);
                stub.close().await;
            }
        }
        true
    }
}

impl PoolInner {
    fn slot(&self, endpoint: &str) -> Arc<Mutex<PoolSlot>> {
        let mut slots = self.slots.lock().unwrap();
        slots
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(PoolSlot {
                    stub: None,
                    refcount: 0,
                    last_used: Instant::now(),
                }))
            })
            .clone()
    }

    async fn sweep(&self) {
        let slots: Vec<(String, Arc<Mutex<PoolSlot>>)> = {
            self.slots.lock().unwrap().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let mut vacant = Vec::new();
        for (key, slot_arc) in slots {
            // a held lock means the slot is busy, skip it this round
            let Ok(mut slot) = slot_arc.try_lock() else { continue };
            if let Some(stub) = slot.stub.as_ref() {
                let idle =
                    slot.refcount == 0 && slot.last_used.elapsed() >= self.timeout.expiration;
                if idle || stub.is_closed() {
                    debug!("stub pool dropping stub of {}", key);
                    let stale = slot.stub.take().unwrap();
                    stale.close().await;
                }
            }
            if slot.stub.is_none() && slot.refcount == 0 {
                vacant.push(key);
            }
        }
        if !vacant.is_empty() {
            let mut slots = self.slots.lock().unwrap();
            for key in vacant {
                let remove = match slots.get(&key) {
                    Some(s) => match s.try_lock() {
                        Ok(slot) => slot.stub.is_none() && slot.refcount == 0,
                        Err(_) => false,
                    },
                    None => false,
                };
                if remove {
                    slots.remove(&key);
                }
            }
        }
    }
}
