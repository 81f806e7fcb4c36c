use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use futures::future::{AbortHandle, Abortable, BoxFuture};
use futures::FutureExt;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{watch, Mutex, Semaphore};
use zerocopy::AsBytes;

use crate::error::RpcError;
use crate::iov::{BufferList, IoAlloc, IoVector};
use crate::message::{Decode, Encode, Operation};
use crate::net::{
    StreamInfo, UnifyListener, UnifyReadHalf, UnifyStream, UnifyWriteHalf, READ_BUF_SIZE,
    WRITE_BUF_SIZE,
};
use crate::proto::{FunctionId, Header, RPC_HEADER_LEN};

/// A registered request handler: gets the request payload and a one-shot
/// [ResponseSender]. Whatever state it needs beyond these it must own.
pub type RpcHandler =
    Arc<dyn Fn(BufferList, ResponseSender) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback fired when `serve` picks up or finishes a connection.
/// Must not block the dispatcher.
pub type Notifier = Arc<dyn Fn(&StreamInfo) + Send + Sync>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Running,
    Draining { reject: bool },
    Terminated,
}

/// Sends the response of one request back on its connection, exactly once.
///
/// The sender owns its half of the connection state, so it may outlive the
/// handler invocation that received it.
pub struct ResponseSender {
    tag: u64,
    function: FunctionId,
    writer: Arc<Mutex<BufWriter<UnifyWriteHalf>>>,
}

impl ResponseSender {
    #[inline(always)]
    pub fn tag(&self) -> u64 {
        self.tag
    }

    #[inline(always)]
    pub fn function(&self) -> FunctionId {
        self.function
    }

    /// Write `header || payload` under the connection's write lock.
    pub async fn send(self, iov: &IoVector<'_>) -> Result<(), RpcError> {
        let size = iov.sum();
        if size > u32::MAX as usize {
            return Err(RpcError::InvalidArgument);
        }
        let header = Header::new(self.function, self.tag, size as u32);
        let mut writer = self.writer.lock().await;
        let res: io::Result<()> = async {
            writer.write_all(header.as_bytes()).await?;
            for part in iov.iter() {
                writer.write_all(part).await?;
            }
            writer.flush().await
        }
        .await;
        if let Err(_e) = res {
            debug!("send resp tag={} err: {:?}", self.tag, _e);
            return Err(RpcError::ConnectionClosed);
        }
        trace!("sent resp tag={} {}B", self.tag, size);
        Ok(())
    }

    /// A zero-length reply carrying just the request's tag.
    #[inline]
    pub async fn send_empty(self) -> Result<(), RpcError> {
        self.send(&IoVector::new()).await
    }
}

/// One operation of a service object, invoked by the skeleton once the
/// request has been decoded.
pub trait Service<O: Operation>: Send + Sync + 'static {
    fn serve(&self, req: O::Request) -> impl Future<Output = O::Response> + Send;
}

/// Server-side dispatcher.
///
/// Routes incoming frames to the handler registered for their function id
/// and runs the handlers on a bounded worker pool. `serve` is invoked once
/// per accepted connection and may run concurrently; handlers can be
/// registered and removed while serving.
#[derive(Clone)]
pub struct Skeleton {
    inner: Arc<SkeletonInner>,
}

struct SkeletonInner {
    funcs: RwLock<FxHashMap<u64, RpcHandler>>,
    accept_notify: RwLock<Option<Notifier>>,
    close_notify: RwLock<Option<Notifier>>,
    alloc: RwLock<IoAlloc>,
    worker_sem: Arc<Semaphore>,
    pool_size: usize,
    state_tx: watch::Sender<State>,
    state_rx: watch::Receiver<State>,
    listeners: StdMutex<Vec<AbortHandle>>,
}

impl Skeleton {
    /// `pool_size` bounds how many request handlers may run at once.
    pub fn new(pool_size: usize) -> Self {
        let pool_size = pool_size.clamp(1, u32::MAX as usize);
        let (state_tx, state_rx) = watch::channel(State::Running);
        Self {
            inner: Arc::new(SkeletonInner {
                funcs: RwLock::new(FxHashMap::default()),
                accept_notify: RwLock::new(None),
                close_notify: RwLock::new(None),
                alloc: RwLock::new(IoAlloc::default()),
                worker_sem: Arc::new(Semaphore::new(pool_size)),
                pool_size,
                state_tx,
                state_rx,
                listeners: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// Register `func` for `func_id`, replacing any previous handler.
    pub fn add_function(&self, func_id: FunctionId, func: RpcHandler) {
        self.inner.funcs.write().unwrap().insert(func_id.as_raw(), func);
    }

    /// Returns false when nothing was registered under `func_id`.
    pub fn remove_function(&self, func_id: FunctionId) -> bool {
        self.inner.funcs.write().unwrap().remove(&func_id.as_raw()).is_some()
    }

    pub fn set_accept_notify(&self, notifier: Notifier) {
        *self.inner.accept_notify.write().unwrap() = Some(notifier);
    }

    pub fn set_close_notify(&self, notifier: Notifier) {
        *self.inner.close_notify.write().unwrap() = Some(notifier);
    }

    /// Allocator for request payload buffers.
    pub fn set_allocator(&self, alloc: IoAlloc) {
        *self.inner.alloc.write().unwrap() = alloc;
    }

    /// Bind one [Operation] to a [Service] implementation: decode the
    /// request, run the service method on a worker, reply with the encoded
    /// response. A request that fails to decode gets an empty reply.
    pub fn register_service<O, S>(&self, service: Arc<S>)
    where
        O: Operation + 'static,
        S: Service<O>,
    {
        let func: RpcHandler = Arc::new(move |req: BufferList, sender: ResponseSender| {
            let service = service.clone();
            async move {
                let Some(request) = O::Request::decode(&req) else {
                    warn!("function {} decode request failed", sender.function());
                    let _ = sender.send_empty().await;
                    return;
                };
                let response = service.serve(request).await;
                let mut iov = IoVector::new();
                response.encode(&mut iov);
                if let Err(_e) = sender.send(&iov).await {
                    debug!("function {} response dropped: {:?}", O::id(), _e);
                }
            }
            .boxed()
        });
        self.add_function(O::id(), func);
    }

    /// Handle one accepted connection until it closes or the skeleton shuts
    /// down. Frames with an unknown function id get a zero-length reply on
    /// the original tag; an invalid frame closes the connection.
    pub async fn serve(&self, stream: UnifyStream) -> Result<(), RpcError> {
        let inner = &self.inner;
        if !inner.accepting() {
            return Err(RpcError::Unavailable);
        }
        let info = stream.info();
        let (read_half, write_half) = stream.into_split();
        let reader = BufReader::with_capacity(READ_BUF_SIZE, read_half);
        let writer = Arc::new(Mutex::new(BufWriter::with_capacity(WRITE_BUF_SIZE, write_half)));
        if let Some(notify) = inner.accept_notify.read().unwrap().clone() {
            notify(&info);
        }
        debug!("serving {}", info);
        let res = inner.serve_conn(reader, &writer, &info).await;
        match res {
            Err(RpcError::Protocol) | Err(RpcError::ConnectionClosed) => {
                // a broken stream is torn down even while response senders
                // still hold it
                let _ = writer.lock().await.shutdown().await;
            }
            // a draining exit must not cut off in-flight responses; the
            // write half stays with the outstanding senders and the socket
            // closes once the last of them is done
            _ => {}
        }
        if let Some(notify) = inner.close_notify.read().unwrap().clone() {
            notify(&info);
        }
        debug!("{} serve done: {:?}", info, res);
        res
    }

    /// Accept connections from `listener` and feed them to [serve](Self::serve)
    /// until the skeleton shuts down.
    pub fn serve_listener(&self, mut listener: UnifyListener) {
        let (abort_handle, abort_reg) = AbortHandle::new_pair();
        self.inner.listeners.lock().unwrap().push(abort_handle);
        let skeleton = self.clone();
        let accept_loop = async move {
            debug!("listening on {}", listener);
            loop {
                match listener.accept().await {
                    Err(e) => {
                        warn!("{} accept error: {}", listener, e);
                        return;
                    }
                    Ok(stream) => {
                        let skeleton = skeleton.clone();
                        tokio::spawn(async move {
                            let _ = skeleton.serve(stream).await;
                        });
                    }
                }
            }
        };
        tokio::spawn(Abortable::new(accept_loop, abort_reg).map(|x| match x {
            Ok(_) => {}
            Err(_e) => {
                debug!("rpc skeleton exit listening as {:?}", _e);
            }
        }));
    }

    /// Stop serving and wait for in-flight handlers to finish.
    ///
    /// With `no_more_requests` set, listeners stop accepting and connections
    /// stop reading right away; otherwise requests keep flowing while the
    /// worker pool drains, and everything is closed only on termination.
    /// Never call this from inside a handler, it would wait for its own
    /// worker slot; spawn a task instead.
    pub async fn shutdown(&self, no_more_requests: bool) {
        let inner = &self.inner;
        info!("rpc skeleton draining (no_more_requests={})", no_more_requests);
        let _ = inner.state_tx.send(State::Draining { reject: no_more_requests });
        if no_more_requests {
            for h in inner.listeners.lock().unwrap().drain(..) {
                h.abort();
            }
        }
        // all permits home means the worker pool is quiet
        match inner.worker_sem.acquire_many(inner.pool_size as u32).await {
            Ok(permits) => drop(permits),
            Err(_) => {} // closed by shutdown_no_wait
        }
        let _ = inner.state_tx.send(State::Terminated);
        for h in inner.listeners.lock().unwrap().drain(..) {
            h.abort();
        }
        info!("rpc skeleton terminated");
    }

    /// Terminate without waiting. In-flight handlers finish best-effort;
    /// their responses are dropped when the stream is already gone.
    pub fn shutdown_no_wait(&self) {
        let inner = &self.inner;
        info!("rpc skeleton terminating");
        for h in inner.listeners.lock().unwrap().drain(..) {
            h.abort();
        }
        let _ = inner.state_tx.send(State::Terminated);
        inner.worker_sem.close();
    }
}

impl SkeletonInner {
    fn accepting(&self) -> bool {
        match *self.state_rx.borrow() {
            State::Running => true,
            State::Draining { reject } => !reject,
            State::Terminated => false,
        }
    }

    async fn serve_conn(
        &self, mut reader: BufReader<UnifyReadHalf>,
        writer: &Arc<Mutex<BufWriter<UnifyWriteHalf>>>, info: &StreamInfo,
    ) -> Result<(), RpcError> {
        let mut state_rx = self.state_tx.subscribe();
        let mut head_buf = [0u8; RPC_HEADER_LEN];
        loop {
            if !self.accepting() {
                return Err(RpcError::Unavailable);
            }
            tokio::select! {
                r = reader.read_exact(&mut head_buf) => {
                    if let Err(e) = r {
                        if e.kind() == io::ErrorKind::UnexpectedEof {
                            trace!("{} closed by peer", info);
                            return Ok(());
                        }
                        debug!("{} read head err: {:?}", info, e);
                        return Err(RpcError::ConnectionClosed);
                    }
                }
                _ = state_rx.changed() => {
                    continue;
                }
            }
            let head = match Header::decode(&head_buf) {
                Ok(h) => h,
                Err(e) => {
                    warn!("{} invalid frame, closing", info);
                    return Err(e);
                }
            };
            trace!("{} recv req {}", info, head);
            let size = head.size() as usize;
            let mut req = BufferList::with_alloc(self.alloc.read().unwrap().clone());
            if size > 0 {
                req.register(size);
                if let Err(_e) = req.fill_from(&mut reader, size).await {
                    debug!("{} read body err: {:?}", info, _e);
                    return Err(RpcError::ConnectionClosed);
                }
                req.freeze();
            }
            let fid = head.function();
            let func = self.funcs.read().unwrap().get(&fid.as_raw()).cloned();
            let sender =
                ResponseSender { tag: head.tag(), function: fid, writer: writer.clone() };
            match func {
                None => {
                    debug!("{} unknown function {}", info, fid);
                    sender.send_empty().await?;
                }
                Some(func) => {
                    let permit = match self.worker_sem.clone().acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => return Err(RpcError::Unavailable),
                    };
                    let fut = func(req, sender);
                    tokio::spawn(async move {
                        fut.await;
                        drop(permit);
                    });
                }
            }
        }
    }
}

/// Register one service object for several operations at once.
///
/// ```ignore
/// register_services!(skeleton, svc, [EchoOp, StatOp, ReadOp]);
/// ```
#[macro_export]
macro_rules! register_services {
    ($skeleton:expr, $service:expr, [$($op:ty),+ $(,)?]) => {{
        $( $skeleton.register_service::<$op, _>($service.clone()); )+
    }};
}
