//! End-to-end scenarios across two nodes over the in-memory transport.
//!
//! Every closure label used here must be registered in both nodes' remote
//! tables, which is why each node gets the same `test_table()`.

use filament::prelude::*;
use filament::transport::memory::MemoryHub;
use filament::{Closure, DynValue, LocalNode, Message, ProcBody, RemoteTable, StepBody};
use std::time::Duration;

fn fib(n: u64) -> u64 {
    match n {
        0 => 0,
        1 => 1,
        _ => {
            let (mut a, mut b) = (0u64, 1u64);
            for _ in 2..=n {
                let next = a + b;
                a = b;
                b = next;
            }
            b
        }
    }
}

fn test_table() -> RemoteTable {
    RemoteTable::builder()
        .register_body("test.echo", |(): ()| {
            ProcBody::new(|p| async move {
                loop {
                    let (from, n): (ProcessId, i64) = p.expect().await?;
                    p.send(from, &n);
                }
            })
        })
        .register_body("test.fib_service", |(): ()| {
            ProcBody::new(|p| async move {
                loop {
                    let (from, n): (ProcessId, u64) = p.expect().await?;
                    p.send(from, &fib(n));
                }
            })
        })
        .register_body("test.oneshot", |(): ()| {
            ProcBody::new(|_p| async move { Ok(()) })
        })
        .register_body("test.idle", |(): ()| {
            ProcBody::new(|p| async move {
                let (): () = p.expect().await?;
                Ok(())
            })
        })
        .register_body("test.fail_on_go", |(): ()| {
            ProcBody::new(|p| async move {
                let (): () = p.expect().await?;
                Err(Fault::Error("deliberate failure".to_string()))
            })
        })
        .register_body("test.broken", |(): ()| {
            ProcBody::new(|_p| async move { Err(Fault::Error("broken from the start".to_string())) })
        })
        .register_body("test.square", |n: u64| {
            ProcBody::returning(move |_p| async move { Ok::<u64, Fault>(n * n) })
        })
        .register_body("test.feeder", |port: SendPort<i64>| {
            ProcBody::new(move |p| async move {
                for i in 0..3i64 {
                    p.send_chan(&port, &i);
                }
                Ok(())
            })
        })
        .register("test.plus_one", |_table, _env| {
            Ok(DynValue::new(StepBody::new(|_p, n: u64| async move {
                let message = Message::pack(&(n + 1)).map_err(Fault::from)?;
                Ok(Some(message))
            })))
        })
        .build()
}

fn two_nodes(hub: &std::sync::Arc<MemoryHub>) -> (LocalNode, LocalNode) {
    (
        LocalNode::start(hub.open("node-a").unwrap(), test_table()),
        LocalNode::start(hub.open("node-b").unwrap(), test_table()),
    )
}

fn closure(label: &str) -> Closure<ProcBody> {
    Closure::<ProcBody>::from_env(label, &()).unwrap()
}

#[tokio::test]
async fn test_echo_across_nodes() {
    let hub = MemoryHub::new();
    let (a, b) = two_nodes(&hub);
    let b_id = b.id();

    let reason = a
        .run(move |process| async move {
            let echo = process.spawn(&b_id, closure("test.echo")).await?;

            process.send(echo.clone(), &(process.pid(), 42i64));
            let reply: i64 = process.expect().await?;
            assert_eq!(reply, 42);

            // Exactly one reply.
            let extra = process.expect_timeout::<i64>(Duration::from_millis(50)).await?;
            assert!(extra.is_none());

            // The echo process stays alive for further messages.
            process.send(echo, &(process.pid(), 7i64));
            assert_eq!(process.expect::<i64>().await?, 7);
            Ok(())
        })
        .await;
    assert_eq!(reason, DiedReason::Normal);
}

#[tokio::test]
async fn test_work_push_fibonacci() {
    let hub = MemoryHub::new();
    let (a, b) = two_nodes(&hub);
    let b_id = b.id();

    let reason = a
        .run(move |process| async move {
            const N: u64 = 12;
            const SLAVES: usize = 3;

            let mut slaves = Vec::with_capacity(SLAVES);
            for _ in 0..SLAVES {
                slaves.push(process.spawn(&b_id, closure("test.fib_service")).await?);
            }

            // Distribute 1..=N round-robin.
            for i in 1..=N {
                let slave = slaves[(i as usize - 1) % SLAVES].clone();
                process.send(slave, &(process.pid(), i));
            }

            let mut sum = 0u64;
            for _ in 0..N {
                sum += process.expect::<u64>().await?;
            }
            let expected: u64 = (1..=N).map(fib).sum();
            assert_eq!(sum, expected);
            Ok(())
        })
        .await;
    assert_eq!(reason, DiedReason::Normal);
}

#[tokio::test]
async fn test_link_propagation_across_nodes() {
    let hub = MemoryHub::new();
    let (a, b) = two_nodes(&hub);
    let b_id = b.id();

    let reason = a
        .run(move |process| async move {
            let victim = process.spawn(&b_id, closure("test.fail_on_go")).await?;

            let victim_for_linker = victim.clone();
            let linker = process.spawn_local(move |p| async move {
                p.link(victim_for_linker);
                // Parked; only the link exit ends this process.
                let _: i64 = p.expect().await?;
                Ok(())
            });
            let mref = process.monitor(linker);

            // Let the link reach the remote controller before the failure.
            tokio::time::sleep(Duration::from_millis(50)).await;
            process.send(victim.clone(), &());

            let n: MonitorNotification = process.expect().await?;
            assert_eq!(n.mref, mref);
            match n.reason {
                DiedReason::LinkedDeath(dead, inner) => {
                    assert_eq!(dead, victim);
                    assert!(
                        matches!(*inner, DiedReason::Exception(_)),
                        "inner reason: {inner}"
                    );
                }
                other => panic!("expected linked death, got {other}"),
            }
            Ok(())
        })
        .await;
    assert_eq!(reason, DiedReason::Normal);
}

#[tokio::test]
async fn test_monitor_across_disconnect() {
    let hub = MemoryHub::new();
    let (a, b) = two_nodes(&hub);
    let b_id = b.id();

    let reason = a
        .run(move |process| async move {
            let remote = process.spawn(&b_id, closure("test.idle")).await?;
            let mref = process.monitor(remote.clone());

            // Let the monitor install remotely, then cut the node down.
            tokio::time::sleep(Duration::from_millis(50)).await;
            b.shutdown();

            let n: MonitorNotification = process.expect().await?;
            assert_eq!(n.mref, mref);
            assert_eq!(n.pid, remote);
            assert_eq!(n.reason, DiedReason::Disconnected);

            // Exactly one notification.
            let extra = process
                .expect_timeout::<MonitorNotification>(Duration::from_millis(100))
                .await?;
            assert!(extra.is_none());

            // The node is marked failed permanently: a fresh monitor toward
            // it resolves immediately as unreachable.
            let ghost = ProcessId::new(b_id.clone(), 999);
            let mref2 = process.monitor(ghost.clone());
            let n2: MonitorNotification = process.expect().await?;
            assert_eq!(n2.mref, mref2);
            assert_eq!(n2.pid, ghost);
            assert_eq!(n2.reason, DiedReason::Unreachable);
            Ok(())
        })
        .await;
    assert_eq!(reason, DiedReason::Normal);
}

#[tokio::test]
async fn test_selective_receive_order() {
    let hub = MemoryHub::new();
    let (a, _b) = two_nodes(&hub);

    let reason = a
        .run(|process| async move {
            let me = process.pid();
            process.send(me.clone(), &"a".to_string());
            process.send(me.clone(), &7i64);
            process.send(me, &"b".to_string());

            let n = process
                .receive_wait(&mut [Match::of(|n: i64| n)])
                .await?;
            assert_eq!(n, 7);

            // The skipped strings are still there, in order.
            assert_eq!(process.expect::<String>().await?, "a");
            assert_eq!(process.expect::<String>().await?, "b");
            Ok(())
        })
        .await;
    assert_eq!(reason, DiedReason::Normal);
}

#[tokio::test]
async fn test_round_robin_merge_over_channels() {
    let hub = MemoryHub::new();
    let (a, _b) = two_nodes(&hub);

    let reason = a
        .run(|process| async move {
            let (s1, r1) = process.new_chan::<i64>();
            let (s2, r2) = process.new_chan::<i64>();

            process.send_chan(&s1, &1);
            process.send_chan(&s2, &2);
            process.send_chan(&s1, &3);
            process.send_chan(&s2, &4);

            let mut merged = merge_ports_rr(&[r1, r2]);
            let mut got = Vec::new();
            for _ in 0..4 {
                got.push(process.receive_chan(&mut merged).await?);
            }
            assert_eq!(got, vec![1, 2, 3, 4]);
            Ok(())
        })
        .await;
    assert_eq!(reason, DiedReason::Normal);
}

#[tokio::test]
async fn test_send_port_travels_across_nodes() {
    let hub = MemoryHub::new();
    let (a, b) = two_nodes(&hub);
    let b_id = b.id();

    let reason = a
        .run(move |process| async move {
            let (port, mut receive) = process.new_chan::<i64>();
            let feeder = Closure::<ProcBody>::from_env("test.feeder", &port).map_err(Fault::from)?;
            process.spawn(&b_id, feeder).await?;

            for expected in 0..3i64 {
                let got = process.receive_chan(&mut receive).await?;
                assert_eq!(got, expected);
            }
            Ok(())
        })
        .await;
    assert_eq!(reason, DiedReason::Normal);
}

#[tokio::test]
async fn test_spawn_then_monitor_notifies_exactly_once() {
    let hub = MemoryHub::new();
    let (a, b) = two_nodes(&hub);
    let b_id = b.id();

    let reason = a
        .run(move |process| async move {
            let short_lived = process.spawn(&b_id, closure("test.oneshot")).await?;
            let mref = process.monitor(short_lived.clone());

            let n: MonitorNotification = process.expect().await?;
            assert_eq!(n.mref, mref);
            assert_eq!(n.pid, short_lived);
            assert_eq!(n.reason, DiedReason::Normal);

            let extra = process
                .expect_timeout::<MonitorNotification>(Duration::from_millis(100))
                .await?;
            assert!(extra.is_none());
            Ok(())
        })
        .await;
    assert_eq!(reason, DiedReason::Normal);
}

#[tokio::test]
async fn test_call_returns_remote_result() {
    let hub = MemoryHub::new();
    let (a, b) = two_nodes(&hub);
    let b_id = b.id();

    let reason = a
        .run(move |process| async move {
            let square = Closure::<ProcBody>::from_env("test.square", &7u64).map_err(Fault::from)?;
            let squared: u64 = process.call(&b_id, square).await?;
            assert_eq!(squared, 49);
            Ok(())
        })
        .await;
    assert_eq!(reason, DiedReason::Normal);
}

#[tokio::test]
async fn test_call_surfaces_remote_failure() {
    let hub = MemoryHub::new();
    let (a, b) = two_nodes(&hub);
    let b_id = b.id();

    let reason = a
        .run(move |process| async move {
            let outcome: ProcessResult<u64> = process.call(&b_id, closure("test.broken")).await;
            match outcome {
                Err(Fault::Error(msg)) => assert!(msg.contains("died"), "got: {msg}"),
                other => panic!("expected call failure, got {other:?}"),
            }
            Ok(())
        })
        .await;
    assert_eq!(reason, DiedReason::Normal);
}

#[tokio::test]
async fn test_spawn_supervised_monitors_child() {
    let hub = MemoryHub::new();
    let (a, b) = two_nodes(&hub);
    let b_id = b.id();

    let reason = a
        .run(move |process| async move {
            // A supervised child that completes: the monitor reports a
            // normal death and the parent is untouched.
            let (child, mref) = process
                .spawn_supervised(&b_id, closure("test.oneshot"))
                .await?;
            let n: MonitorNotification = process.expect().await?;
            assert_eq!(n.mref, mref);
            assert_eq!(n.pid, child);
            assert_eq!(n.reason, DiedReason::Normal);
            Ok(())
        })
        .await;
    assert_eq!(reason, DiedReason::Normal);
}

#[tokio::test]
async fn test_spawn_supervised_links_child_to_parent() {
    let hub = MemoryHub::new();
    let (a, b) = two_nodes(&hub);
    let b_id = b.id();

    let reason = a
        .run(move |process| async move {
            // A middleman supervises a failing child; the link-back kills
            // the middleman, which we observe from the outside.
            let b_for_parent = b_id.clone();
            let parent = process.spawn_local(move |p| async move {
                let _ = p.spawn_supervised(&b_for_parent, closure("test.broken")).await?;
                // Parked; the child's failure propagates over the link.
                let _: i64 = p.expect().await?;
                Ok(())
            });
            let mref = process.monitor(parent);

            let n: MonitorNotification = process.expect().await?;
            assert_eq!(n.mref, mref);
            assert!(
                matches!(n.reason, DiedReason::LinkedDeath(_, _)),
                "got: {}",
                n.reason
            );
            Ok(())
        })
        .await;
    assert_eq!(reason, DiedReason::Normal);
}

#[tokio::test]
async fn test_bad_closure_becomes_death_reason() {
    let hub = MemoryHub::new();
    let (a, b) = two_nodes(&hub);
    let b_id = b.id();

    let reason = a
        .run(move |process| async move {
            let bogus = Closure::<ProcBody>::new("no.such.label", Vec::new());
            let pid = process.spawn(&b_id, bogus).await?;
            let mref = process.monitor(pid);

            let n: MonitorNotification = process.expect().await?;
            assert_eq!(n.mref, mref);
            match n.reason {
                DiedReason::Exception(msg) => assert!(msg.contains("unknown closure label")),
                other => panic!("expected exception, got {other}"),
            }
            Ok(())
        })
        .await;
    assert_eq!(reason, DiedReason::Normal);
}

#[tokio::test]
async fn test_un_closure_resolves_locally() {
    let hub = MemoryHub::new();
    let (a, _b) = two_nodes(&hub);

    let reason = a
        .run(|process| async move {
            let body = process.un_closure(&closure("test.oneshot"));
            assert!(body.is_ok());

            let bogus = Closure::<ProcBody>::new("no.such.label", Vec::new());
            assert!(process.un_closure(&bogus).is_err());
            Ok(())
        })
        .await;
    assert_eq!(reason, DiedReason::Normal);
}

#[tokio::test]
async fn test_cp_bind_threads_the_result() {
    let hub = MemoryHub::new();
    let (a, b) = two_nodes(&hub);
    let b_id = b.id();

    let reason = a
        .run(move |process| async move {
            // bind(square(7), plus_one) == 50, computed on the far node.
            let square = Closure::<ProcBody>::from_env("test.square", &7u64).map_err(Fault::from)?;
            let step = Closure::<StepBody>::new("test.plus_one", Vec::new());
            let composed = filament::cp_bind(square, step).map_err(Fault::from)?;

            let result: u64 = process.call(&b_id, composed).await?;
            assert_eq!(result, 50);
            Ok(())
        })
        .await;
    assert_eq!(reason, DiedReason::Normal);
}

#[tokio::test]
async fn test_cp_seq_runs_both_halves_remotely() {
    let hub = MemoryHub::new();
    let (a, b) = two_nodes(&hub);
    let b_id = b.id();

    let reason = a
        .run(move |process| async move {
            // seq(idle, echo): the composed process first waits for a go
            // signal, then serves echoes. Proves the combinator round-trips
            // the wire and runs in order.
            let composed = filament::cp_seq(closure("test.idle"), closure("test.echo"))
                .map_err(Fault::from)?;
            let pid = process.spawn(&b_id, composed).await?;

            process.send(pid.clone(), &()); // releases the idle half
            process.send(pid, &(process.pid(), 5i64));
            assert_eq!(process.expect::<i64>().await?, 5);
            Ok(())
        })
        .await;
    assert_eq!(reason, DiedReason::Normal);
}
