//! One end-to-end exchange over the QUIC transport on localhost.
//!
//! The scenario coverage lives in `scenarios.rs` over the in-memory
//! transport; this test only proves the QUIC path carries the same
//! protocol.

use filament::prelude::*;
use filament::transport::quic::QuicTransport;
use filament::{Closure, LocalNode, ProcBody, RemoteTable};

fn table() -> RemoteTable {
    RemoteTable::builder()
        .register_body("smoke.echo", |(): ()| {
            ProcBody::new(|p| async move {
                let (from, n): (ProcessId, i64) = p.expect().await?;
                p.send(from, &n);
                Ok(())
            })
        })
        .build()
}

#[tokio::test]
async fn test_echo_over_quic() {
    let a = LocalNode::start(
        QuicTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap(),
        table(),
    );
    let b = LocalNode::start(
        QuicTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap(),
        table(),
    );
    let b_id = b.id();

    let reason = a
        .run(move |process| async move {
            let echo = Closure::<ProcBody>::from_env("smoke.echo", &()).map_err(Fault::from)?;
            let pid = process.spawn(&b_id, echo).await?;
            process.send(pid, &(process.pid(), 64i64));
            assert_eq!(process.expect::<i64>().await?, 64);
            Ok(())
        })
        .await;
    assert_eq!(reason, DiedReason::Normal);
}
