mod common;

use std::time::Duration;

use common::*;
use muon_rpc::*;
use tokio::time::Instant;

#[tokio::test(flavor = "multi_thread")]
async fn test_call_timeout() {
    let (_skeleton, addr) = start_server(128).await;
    let stub = connect_stub(&addr).await;

    let req = DelayReq::new(1, 200);
    let started = Instant::now();
    let r = stub.call_alloc::<DelayOp>(&req, Duration::from_millis(50)).await;
    assert_eq!(r.err(), Some(RpcError::Timeout));
    assert!(started.elapsed() < Duration::from_millis(180));
    assert_eq!(stub.get_queue_count(), 0);

    // the late response is drained off the stream; framing survives and the
    // stub keeps working
    tokio::time::sleep(Duration::from_millis(250)).await;
    let req = Blob::new(&b"hi"[..]);
    let (resp, n) = stub.call_alloc::<EchoOp>(&req, CALL_TIMEOUT).await.expect("echo");
    assert_eq!(n, 2);
    assert_eq!(&resp.data[..], b"hi");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timeout_isolation() {
    let (_skeleton, addr) = start_server(128).await;
    let stub = connect_stub(&addr).await;

    let slow = {
        let stub = stub.clone();
        tokio::spawn(async move {
            let req = DelayReq::new(1, 200);
            stub.call_alloc::<DelayOp>(&req, Duration::from_millis(50)).await
        })
    };
    let patient = {
        let stub = stub.clone();
        tokio::spawn(async move {
            let req = DelayReq::new(2, 100);
            stub.call_alloc::<DelayOp>(&req, Duration::from_secs(2)).await
        })
    };

    let r = slow.await.unwrap();
    assert_eq!(r.err(), Some(RpcError::Timeout));

    let (resp, _) = patient.await.unwrap().expect("patient call");
    assert_eq!(resp.id(), 2);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(stub.get_queue_count(), 0);
}
