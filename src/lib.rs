//! # muon-rpc
//!
//! A lightweight, zero-copy, binary RPC core over reliable byte streams
//! (tcp and unix sockets).
//!
//! - A [Stub] multiplexes concurrent calls over one stream: requests carry
//!   an always-increasing tag, responses are matched back by tag and may
//!   complete in any order, each call has its own deadline.
//! - A [Skeleton] serves the other side: it maps the function id of every
//!   incoming frame to a registered handler and runs handlers on a bounded
//!   worker pool, replying through a one-shot [ResponseSender].
//! - A [StubPool] caches live stubs by endpoint, with refcounts and idle
//!   expiration.
//!
//! Messages describe themselves as scatter/gather slices ([Encode] /
//! [Decode]), so variable-length payload travels between the socket and
//! caller-owned buffers without intermediate copies.
//!
//! ## Wire format
//!
//! Every message is a 40-byte little-endian header followed by the payload:
//! magic, version, payload size, 64-bit function id (interface low, method
//! high), tag, and a reserved word. See [proto::Header].
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use bytes::Bytes;
//! use muon_rpc::*;
//!
//! struct Data { body: Bytes }
//!
//! impl Encode for Data {
//!     fn encode<'a>(&'a self, iov: &mut IoVector<'a>) {
//!         iov.push(&self.body);
//!     }
//! }
//!
//! impl Decode for Data {
//!     fn decode(buf: &BufferList) -> Option<Self> {
//!         Some(Self { body: buf.slice(0, buf.sum())? })
//!     }
//! }
//!
//! enum EchoOp {}
//! impl Operation for EchoOp {
//!     const IID: u32 = 1;
//!     const FID: u32 = 1;
//!     type Request = Data;
//!     type Response = Data;
//! }
//!
//! struct EchoService;
//! impl Service<EchoOp> for EchoService {
//!     async fn serve(&self, req: Data) -> Data {
//!         req
//!     }
//! }
//!
//! # async fn run() -> Result<(), RpcError> {
//! // server
//! let skeleton = new_skeleton(128);
//! skeleton.register_service::<EchoOp, _>(Arc::new(EchoService));
//! skeleton.serve_listener(listen_on_addr("127.0.0.1:7000").await.unwrap());
//!
//! // client
//! let pool = new_stub_pool(Duration::from_secs(60), Duration::from_secs(5), None);
//! let stub = pool.get_stub("127.0.0.1:7000", false).await?;
//! let req = Data { body: Bytes::from_static(b"hi") };
//! let (resp, n) = stub.call_alloc::<EchoOp>(&req, pool.get_timeout()).await?;
//! assert_eq!(n, 2);
//! assert_eq!(resp.body, req.body);
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate log;

pub mod config;
pub mod error;
pub mod iov;
pub mod message;
pub mod net;
pub mod pool;
pub mod proto;
pub mod skeleton;
pub mod stub;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use config::{RpcConfig, TimeoutSetting};
pub use error::RpcError;
pub use iov::{BufferList, IoAlloc, IoVector};
pub use message::{Decode, Encode, Operation, RecvLayout};
pub use net::{listen_on_addr, StreamInfo, UnifyAddr, UnifyListener, UnifyStream};
pub use pool::{DefaultSocketClient, SocketClient, StubPool, UdsSocketClient};
pub use proto::{FunctionId, Header};
pub use skeleton::{Notifier, ResponseSender, RpcHandler, Service, Skeleton};
pub use stub::Stub;

/// Build a [Stub] owning `stream`. Must run within a tokio runtime.
#[inline]
pub fn new_rpc_stub(stream: UnifyStream) -> Stub {
    Stub::new(stream)
}

/// Build a [StubPool]. Entries unreferenced for `expiration` are dropped;
/// `timeout` is both the default call deadline and the connect deadline.
/// Without a `socket_client` the plain tcp connector is used.
pub fn new_stub_pool(
    expiration: Duration, timeout: Duration, socket_client: Option<Arc<dyn SocketClient>>,
) -> StubPool {
    let setting = TimeoutSetting {
        rpc_timeout: timeout,
        connect_timeout: timeout,
        expiration,
    };
    let client = socket_client.unwrap_or_else(|| Arc::new(DefaultSocketClient));
    StubPool::new(setting, client)
}

/// Build a [StubPool] whose connections all go to the unix socket at `path`.
pub fn new_uds_stub_pool<P: Into<PathBuf>>(
    path: P, expiration: Duration, timeout: Duration,
) -> StubPool {
    let setting = TimeoutSetting {
        rpc_timeout: timeout,
        connect_timeout: timeout,
        expiration,
    };
    StubPool::new(setting, Arc::new(UdsSocketClient::new(path)))
}

/// Build a [Skeleton] whose worker pool admits `pool_size` concurrent
/// request handlers.
#[inline]
pub fn new_skeleton(pool_size: usize) -> Skeleton {
    Skeleton::new(pool_size)
}
