mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use futures::future::join_all;
use futures::FutureExt;
use muon_rpc::*;

#[tokio::test(flavor = "multi_thread")]
async fn test_out_of_order_completion() {
    let (_skeleton, addr) = start_server(128).await;
    let stub = connect_stub(&addr).await;

    // the slowest call goes out first; the server answers in reverse order
    let mut tasks = Vec::new();
    for (id, sleep_ms) in [(1u64, 120u64), (2, 60), (3, 0)] {
        let stub = stub.clone();
        tasks.push(tokio::spawn(async move {
            let req = DelayReq::new(id, sleep_ms);
            let (resp, n) = stub.call_alloc::<DelayOp>(&req, CALL_TIMEOUT).await.expect("delay");
            (id, resp.id(), n)
        }));
        // keep the issue order deterministic
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for task in tasks {
        let (id, resp_id, n) = task.await.unwrap();
        assert_eq!(resp_id, id);
        assert_eq!(n, 8);
    }
    assert_eq!(stub.get_queue_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_many_concurrent_callers() {
    let (_skeleton, addr) = start_server(128).await;
    let stub = connect_stub(&addr).await;

    let mut futs = Vec::new();
    for i in 0..32u64 {
        let stub = stub.clone();
        futs.push(async move {
            let body = format!("payload-{}", i);
            let req = Blob::new(body.clone().into_bytes());
            let (resp, _) = stub.call_alloc::<EchoOp>(&req, CALL_TIMEOUT).await.expect("echo");
            assert_eq!(&resp.data[..], body.as_bytes());
        });
    }
    join_all(futs).await;
    assert_eq!(stub.get_queue_count(), 0);
}

enum TagOp {}

impl Operation for TagOp {
    const IID: u32 = 5;
    const FID: u32 = 5;
    type Request = Blob;
    type Response = Blob;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tags_strictly_increasing() {
    let (skeleton, addr) = start_server(128).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        skeleton.add_function(
            TagOp::id(),
            Arc::new(move |_req: BufferList, sender: ResponseSender| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(sender.tag());
                    let _ = sender.send_empty().await;
                }
                .boxed()
            }),
        );
    }

    let stub = connect_stub(&addr).await;
    let req = Blob::new(&b"x"[..]);
    for _ in 0..10 {
        let _ = stub.call_alloc::<TagOp>(&req, CALL_TIMEOUT).await.expect("call");
    }
    let tags = seen.lock().unwrap().clone();
    assert_eq!(tags.len(), 10);
    for pair in tags.windows(2) {
        assert!(pair[0] < pair[1], "tags not increasing: {:?}", tags);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_close_fails_all_pending() {
    // a server that accepts, answers nothing, and hangs up shortly after
    let mut listener = listen_on_addr("127.0.0.1:0").await.expect("listen");
    let addr = listener.local_addr().expect("local addr").to_string();
    tokio::spawn(async move {
        let stream = listener.accept().await.expect("accept");
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(stream);
    });

    let stub = connect_stub(&addr).await;
    let mut tasks = Vec::new();
    for i in 0..3u64 {
        let stub = stub.clone();
        tasks.push(tokio::spawn(async move {
            let req = DelayReq::new(i, 0);
            stub.call_alloc::<DelayOp>(&req, CALL_TIMEOUT).await
        }));
    }
    for task in tasks {
        let r = task.await.unwrap();
        assert_eq!(r.err(), Some(RpcError::ConnectionClosed));
    }
    assert_eq!(stub.get_queue_count(), 0);
    assert!(stub.is_closed());
}
