use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use std::{fmt, mem};

use futures::future::{AbortHandle, Abortable};
use rustc_hash::FxHashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{oneshot, Mutex};
use tokio::time::{timeout_at, Instant};
use zerocopy::AsBytes;

use crate::error::RpcError;
use crate::iov::{BufferList, IoVector};
use crate::message::{Decode, Encode, Operation};
use crate::net::{
    StreamInfo, UnifyReadHalf, UnifyStream, UnifyWriteHalf, READ_BUF_SIZE, WRITE_BUF_SIZE,
};
use crate::proto::{FunctionId, Header, RPC_HEADER_LEN};

type CallResult = Result<(BufferList, usize), RpcError>;

struct PendingCall {
    /// Receive windows, taken by the reader once the response header lands
    target: Option<BufferList>,
    tx: oneshot::Sender<CallResult>,
    /// Once set, the call is in its body phase and no longer times out
    header_seen: bool,
}

/// Client endpoint of one stream.
///
/// A stub multiplexes concurrent calls over a single connection: every call
/// gets a fresh tag, responses are matched back by tag and may complete in
/// any order. Cheap to clone, safe to share between tasks.
///
/// Dropping the last clone aborts the reader task and fails whatever is
/// still pending.
#[derive(Clone)]
pub struct Stub {
    inner: Arc<StubInner>,
    // dropping the last clone stops the reader, see CloseGuard
    _guard: Arc<CloseGuard>,
}

impl fmt::Display for Stub {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl Stub {
    /// Take ownership of `stream` and start the reader task. Must be called
    /// within a tokio runtime.
    pub fn new(stream: UnifyStream) -> Self {
        let info = stream.info();
        let (read_half, write_half) = stream.into_split();
        let inner = Arc::new(StubInner {
            writer: Mutex::new(BufWriter::with_capacity(WRITE_BUF_SIZE, write_half)),
            pending: StdMutex::new(FxHashMap::default()),
            tag: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            info: StdMutex::new(info),
            reader_abort: StdMutex::new(None),
        });
        StubInner::spawn_reader(&inner, read_half);
        Self { _guard: Arc::new(CloseGuard { inner: inner.clone() }), inner }
    }

    /// Issue one call and decode the response.
    ///
    /// `resp` carries the registered receive windows; the reader fills them
    /// in place, so the payload lands in caller memory in a single read. An
    /// empty list allocates from its attached allocator instead once the
    /// response size is known.
    ///
    /// `timeout` runs from here until the response header is received; the
    /// response body is not timed. Returns the decoded response and the
    /// number of payload bytes received.
    pub async fn call<O: Operation>(
        &self, req: &O::Request, resp: &mut BufferList, timeout: Duration,
    ) -> Result<(O::Response, usize), RpcError> {
        let layout = O::Response::recv_layout();
        if layout.var_bufs > 1 {
            // the receive path hands the payload to exactly one awaiter
            return Err(RpcError::NoBufferSpace);
        }
        let registered = !resp.is_empty();
        let expected = resp.sum();
        if registered && expected < layout.fixed {
            // the windows cannot hold even the fixed part of the response
            return Err(RpcError::InvalidArgument);
        }
        let mut reqmsg = IoVector::new();
        req.encode(&mut reqmsg);

        let n = self.do_call(O::id(), &reqmsg, resp, timeout).await?;

        let response = O::Response::decode(resp).ok_or(RpcError::InvalidArgument)?;
        if registered && n == expected && !response.validate_checksum(resp) {
            return Err(RpcError::ChecksumMismatch);
        }
        Ok((response, n))
    }

    /// [call](Self::call) without pre-registered buffers; response memory
    /// comes from the default allocator and is owned by the returned views.
    #[inline]
    pub async fn call_alloc<O: Operation>(
        &self, req: &O::Request, timeout: Duration,
    ) -> Result<(O::Response, usize), RpcError> {
        let mut resp = BufferList::default();
        self.call::<O>(req, &mut resp, timeout).await
    }

    // Sends the framed request and waits for the tagged response. May be
    // invoked concurrently; completions can arrive out of order.
    async fn do_call(
        &self, function: FunctionId, reqmsg: &IoVector<'_>, resp: &mut BufferList,
        timeout: Duration,
    ) -> Result<usize, RpcError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(RpcError::ConnectionClosed);
        }
        let size = reqmsg.sum();
        if size > u32::MAX as usize {
            return Err(RpcError::InvalidArgument);
        }
        let deadline = Instant::now() + timeout;
        let tag = inner.tag.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = oneshot::channel();

        {
            let mut writer = match timeout_at(deadline, inner.writer.lock()).await {
                Ok(w) => w,
                Err(_) => return Err(RpcError::Timeout),
            };
            // The awaiter must be registered before any header byte can reach
            // the peer, or a fast response would find no tag to deliver to.
            {
                let target = mem::take(resp);
                let mut pending = inner.pending.lock().unwrap();
                pending.insert(tag, PendingCall { target: Some(target), tx, header_seen: false });
            }
            let header = Header::new(function, tag, size as u32);
            trace!("{} send req {}", self, header);
            let res: io::Result<()> = async {
                writer.write_all(header.as_bytes()).await?;
                for part in reqmsg.iter() {
                    writer.write_all(part).await?;
                }
                writer.flush().await
            }
            .await;
            if let Err(_e) = res {
                warn!("{} write tag={} err: {:?}", self, tag, _e);
                if let Some(mut ent) = inner.pending.lock().unwrap().remove(&tag) {
                    if let Some(t) = ent.target.take() {
                        *resp = t;
                    }
                }
                inner.closed.store(true, Ordering::Release);
                inner.fail_pending(RpcError::ConnectionClosed);
                return Err(RpcError::ConnectionClosed);
            }
        }

        let res: CallResult = match timeout_at(deadline, &mut rx).await {
            Ok(Ok(r)) => r,
            Ok(Err(_)) => Err(RpcError::ConnectionClosed),
            Err(_) => {
                // the deadline covers waiting for the response header only;
                // once the header is in, the body read is allowed to finish
                let expired = {
                    let mut pending = inner.pending.lock().unwrap();
                    match pending.get(&tag) {
                        Some(ent) if !ent.header_seen => {
                            pending.remove(&tag).map(|mut e| e.target.take())
                        }
                        _ => None,
                    }
                };
                match expired {
                    Some(target) => {
                        trace!("{} tag={} timeout", self, tag);
                        if let Some(t) = target {
                            *resp = t;
                        }
                        return Err(RpcError::Timeout);
                    }
                    None => match (&mut rx).await {
                        Ok(r) => r,
                        Err(_) => Err(RpcError::ConnectionClosed),
                    },
                }
            }
        };
        match res {
            Ok((list, n)) => {
                *resp = list;
                Ok(n)
            }
            Err(e) => Err(e),
        }
    }

    /// Number of calls still waiting for their response.
    #[inline]
    pub fn get_queue_count(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    /// Address pair of the underlying stream.
    #[inline]
    pub fn stream_info(&self) -> StreamInfo {
        self.inner.info.lock().unwrap().clone()
    }

    #[inline(always)]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Swap in a fresh stream. The old one is shut down and every call
    /// pending on it fails with [RpcError::ConnectionClosed].
    pub async fn set_stream(&self, stream: UnifyStream) {
        let info = stream.info();
        let (read_half, write_half) = stream.into_split();
        {
            let mut writer = self.inner.writer.lock().await;
            self.inner.generation.fetch_add(1, Ordering::AcqRel);
            let _ = writer.shutdown().await;
            *writer = BufWriter::with_capacity(WRITE_BUF_SIZE, write_half);
        }
        if let Some(h) = self.inner.reader_abort.lock().unwrap().take() {
            h.abort();
        }
        self.inner.fail_pending(RpcError::ConnectionClosed);
        *self.inner.info.lock().unwrap() = info;
        self.inner.closed.store(false, Ordering::Release);
        StubInner::spawn_reader(&self.inner, read_half);
    }

    /// Shut the stream down and fail whatever is pending.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        if let Some(h) = self.inner.reader_abort.lock().unwrap().take() {
            h.abort();
        }
        {
            let mut writer = self.inner.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        self.inner.fail_pending(RpcError::ConnectionClosed);
    }
}

struct StubInner {
    writer: Mutex<BufWriter<UnifyWriteHalf>>,
    pending: StdMutex<FxHashMap<u64, PendingCall>>,
    tag: AtomicU64,
    closed: AtomicBool,
    /// Bumped by set_stream so a finished reader of the old stream cannot
    /// tear down its replacement
    generation: AtomicU64,
    info: StdMutex<StreamInfo>,
    reader_abort: StdMutex<Option<AbortHandle>>,
}

impl fmt::Display for StubInner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "rpc stub {}", self.info.lock().unwrap())
    }
}

// The reader task keeps its own Arc<StubInner> alive, so cleanup hangs off
// the handles the callers hold instead.
struct CloseGuard {
    inner: Arc<StubInner>,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
        if let Some(h) = self.inner.reader_abort.lock().unwrap().take() {
            h.abort();
        }
        self.inner.fail_pending(RpcError::ConnectionClosed);
    }
}

impl StubInner {
    fn spawn_reader(inner: &Arc<StubInner>, read_half: UnifyReadHalf) {
        let (handle, reg) = AbortHandle::new_pair();
        *inner.reader_abort.lock().unwrap() = Some(handle);
        let generation = inner.generation.load(Ordering::Acquire);
        let inner = inner.clone();
        tokio::spawn(async move {
            let reader = BufReader::with_capacity(READ_BUF_SIZE, read_half);
            match Abortable::new(inner.clone().receive_loop(reader), reg).await {
                Ok(()) => {
                    // stream is gone for good, every awaiter gets the news
                    let mut writer = inner.writer.lock().await;
                    if inner.generation.load(Ordering::Acquire) == generation {
                        inner.closed.store(true, Ordering::Release);
                        let _ = writer.shutdown().await;
                        drop(writer);
                        inner.fail_pending(RpcError::ConnectionClosed);
                    }
                }
                Err(_aborted) => {}
            }
        });
    }

    // Reads one header, routes the body to the tagged awaiter, repeats.
    // Exactly one instance runs per stream.
    async fn receive_loop(self: Arc<Self>, mut reader: BufReader<UnifyReadHalf>) {
        let mut head_buf = [0u8; RPC_HEADER_LEN];
        loop {
            if let Err(_e) = reader.read_exact(&mut head_buf).await {
                debug!("{} read head err: {:?}", self, _e);
                return;
            }
            let head = match Header::decode(&head_buf) {
                Ok(h) => h,
                Err(_) => {
                    warn!("{} invalid frame, closing", self);
                    return;
                }
            };
            trace!("{} recv head {}", self, head);
            let size = head.size() as usize;
            let tag = head.tag();
            let target = {
                let mut pending = self.pending.lock().unwrap();
                match pending.get_mut(&tag) {
                    Some(ent) => {
                        ent.header_seen = true;
                        ent.target.take()
                    }
                    None => None,
                }
            };
            let Some(mut list) = target else {
                // expired or unknown tag, dump the body to keep the framing
                debug!("{} tag={} has no awaiter, dump {} bytes", self, tag, size);
                if drain_stream(&mut reader, size).await.is_err() {
                    return;
                }
                continue;
            };
            if list.is_empty() {
                if size > 0 {
                    list.register(size);
                }
            } else if size > list.sum() {
                debug!(
                    "{} tag={} response of {}B exceeds the {}B window",
                    self,
                    tag,
                    size,
                    list.sum()
                );
                let drained = drain_stream(&mut reader, size).await;
                self.complete(tag, Err(RpcError::InvalidArgument));
                if drained.is_err() {
                    return;
                }
                continue;
            }
            match list.fill_from(&mut reader, size).await {
                Ok(()) => {
                    list.truncate(size);
                    list.freeze();
                    self.complete(tag, Ok((list, size)));
                }
                Err(_e) => {
                    debug!("{} tag={} read body err: {:?}", self, tag, _e);
                    self.complete(tag, Err(RpcError::ConnectionClosed));
                    return;
                }
            }
        }
    }

    fn complete(&self, tag: u64, res: CallResult) {
        let ent = self.pending.lock().unwrap().remove(&tag);
        if let Some(ent) = ent {
            let _ = ent.tx.send(res);
        }
    }

    fn fail_pending(&self, err: RpcError) {
        let ents: Vec<PendingCall> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().map(|(_, v)| v).collect()
        };
        for ent in ents {
            let _ = ent.tx.send(Err(err));
        }
    }
}

/// Read and discard `n` bytes.
pub(crate) async fn drain_stream<R>(reader: &mut R, mut n: usize) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut scratch = [0u8; 4096];
    while n > 0 {
        let take = n.min(scratch.len());
        reader.read_exact(&mut scratch[..take]).await?;
        n -= take;
    }
    Ok(())
}
