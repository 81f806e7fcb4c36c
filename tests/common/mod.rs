#![allow(dead_code)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use muon_rpc::*;

pub const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Raw byte blob; the payload slice points at caller memory on send and at
/// the receive buffer on decode.
pub struct Blob {
    pub data: Bytes,
}

impl Blob {
    pub fn new<B: Into<Bytes>>(data: B) -> Self {
        Self { data: data.into() }
    }
}

impl Encode for Blob {
    fn encode<'a>(&'a self, iov: &mut IoVector<'a>) {
        iov.push(&self.data);
    }
}

impl Decode for Blob {
    fn decode(buf: &BufferList) -> Option<Self> {
        Some(Self { data: buf.slice(0, buf.sum())? })
    }
}

pub enum EchoOp {}

impl Operation for EchoOp {
    const IID: u32 = 1;
    const FID: u32 = 1;
    type Request = Blob;
    type Response = Blob;
}

/// Asks the server to sleep before answering, so tests can force response
/// ordering and timeouts.
pub struct DelayReq {
    wire: [u8; 16],
}

impl DelayReq {
    pub fn new(id: u64, sleep_ms: u64) -> Self {
        let mut wire = [0u8; 16];
        wire[..8].copy_from_slice(&id.to_le_bytes());
        wire[8..].copy_from_slice(&sleep_ms.to_le_bytes());
        Self { wire }
    }

    pub fn id(&self) -> u64 {
        u64::from_le_bytes(self.wire[..8].try_into().unwrap())
    }

    pub fn sleep_ms(&self) -> u64 {
        u64::from_le_bytes(self.wire[8..].try_into().unwrap())
    }
}

impl Encode for DelayReq {
    fn encode<'a>(&'a self, iov: &mut IoVector<'a>) {
        iov.push(&self.wire);
    }
}

impl Decode for DelayReq {
    fn recv_layout() -> RecvLayout {
        RecvLayout { fixed: 16, var_bufs: 0 }
    }

    fn decode(buf: &BufferList) -> Option<Self> {
        let b = buf.slice(0, 16)?;
        let mut wire = [0u8; 16];
        wire.copy_from_slice(&b);
        Some(Self { wire })
    }
}

pub struct DelayResp {
    wire: [u8; 8],
}

impl DelayResp {
    pub fn new(id: u64) -> Self {
        Self { wire: id.to_le_bytes() }
    }

    pub fn id(&self) -> u64 {
        u64::from_le_bytes(self.wire)
    }
}

impl Encode for DelayResp {
    fn encode<'a>(&'a self, iov: &mut IoVector<'a>) {
        iov.push(&self.wire);
    }
}

impl Decode for DelayResp {
    fn recv_layout() -> RecvLayout {
        RecvLayout { fixed: 8, var_bufs: 0 }
    }

    fn decode(buf: &BufferList) -> Option<Self> {
        let b = buf.slice(0, 8)?;
        let mut wire = [0u8; 8];
        wire.copy_from_slice(&b);
        Some(Self { wire })
    }
}

pub enum DelayOp {}

impl Operation for DelayOp {
    const IID: u32 = 1;
    const FID: u32 = 2;
    type Request = DelayReq;
    type Response = DelayResp;
}

/// A response advertising two variable receive buffers; issuing a call with
/// it must fail before anything hits the wire.
pub struct TwoBufResp;

impl Encode for TwoBufResp {
    fn encode<'a>(&'a self, _iov: &mut IoVector<'a>) {}
}

impl Decode for TwoBufResp {
    fn recv_layout() -> RecvLayout {
        RecvLayout { fixed: 0, var_bufs: 2 }
    }

    fn decode(_buf: &BufferList) -> Option<Self> {
        Some(Self)
    }
}

pub enum TwoBufOp {}

impl Operation for TwoBufOp {
    const IID: u32 = 1;
    const FID: u32 = 3;
    type Request = Blob;
    type Response = TwoBufResp;
}

/// A response that always fails its integrity check.
pub struct BadSumResp {
    wire: [u8; 4],
}

impl BadSumResp {
    pub fn new() -> Self {
        Self { wire: *b"nope" }
    }
}

impl Encode for BadSumResp {
    fn encode<'a>(&'a self, iov: &mut IoVector<'a>) {
        iov.push(&self.wire);
    }
}

impl Decode for BadSumResp {
    fn recv_layout() -> RecvLayout {
        RecvLayout { fixed: 4, var_bufs: 0 }
    }

    fn decode(buf: &BufferList) -> Option<Self> {
        let b = buf.slice(0, 4)?;
        let mut wire = [0u8; 4];
        wire.copy_from_slice(&b);
        Some(Self { wire })
    }

    fn validate_checksum(&self, _buf: &BufferList) -> bool {
        false
    }
}

pub enum BadSumOp {}

impl Operation for BadSumOp {
    const IID: u32 = 1;
    const FID: u32 = 4;
    type Request = Blob;
    type Response = BadSumResp;
}

/// Never registered on any test server.
pub enum UnknownOp {}

impl Operation for UnknownOp {
    const IID: u32 = 7;
    const FID: u32 = 99;
    type Request = Blob;
    type Response = Blob;
}

pub struct TestService;

impl Service<EchoOp> for TestService {
    async fn serve(&self, req: Blob) -> Blob {
        req
    }
}

impl Service<DelayOp> for TestService {
    async fn serve(&self, req: DelayReq) -> DelayResp {
        tokio::time::sleep(Duration::from_millis(req.sleep_ms())).await;
        DelayResp::new(req.id())
    }
}

impl Service<BadSumOp> for TestService {
    async fn serve(&self, _req: Blob) -> BadSumResp {
        BadSumResp::new()
    }
}

/// Spin up a skeleton serving the test operations on an ephemeral port.
pub async fn start_server(pool_size: usize) -> (Skeleton, String) {
    let skeleton = new_skeleton(pool_size);
    let service = Arc::new(TestService);
    register_services!(skeleton, service, [EchoOp, DelayOp, BadSumOp]);
    let listener = listen_on_addr("127.0.0.1:0").await.expect("listen");
    let addr = listener.local_addr().expect("local addr").to_string();
    skeleton.serve_listener(listener);
    (skeleton, addr)
}

pub async fn connect_stub(addr: &str) -> Stub {
    let addr = UnifyAddr::from_str(addr).expect("parse addr");
    let stream = UnifyStream::connect(&addr).await.expect("connect");
    new_rpc_stub(stream)
}
