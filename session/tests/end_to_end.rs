//! End-to-end transfers between two managers over an in-memory link
//!
//! Time is paused in every test, so window and inactivity timeouts fire
//! deterministically as soon as the link quiesces.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use lot_session::{
    memory_pair, BlockDelivery, FailureReason, MemoryTransport, SessionConfig, SessionError,
    SessionEvent, SessionManager, SessionPhase, TransferParams, Transport,
};
use lot_wire::{Frame, MessageType};
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("lot_session=debug,lot_wire=debug")
        .with_test_writer()
        .try_init();
}

/// Transport wrapper that drops scripted frames and logs data sends
struct ScriptedTransport {
    inner: MemoryTransport,
    /// Data seqs to swallow, each at most once
    drop_data_once: Mutex<HashSet<u64>>,
    drop_all_data: AtomicBool,
    drop_acks: AtomicBool,
    sent_data: Mutex<Vec<u64>>,
}

impl ScriptedTransport {
    fn new(inner: MemoryTransport) -> Self {
        Self {
            inner,
            drop_data_once: Mutex::new(HashSet::new()),
            drop_all_data: AtomicBool::new(false),
            drop_acks: AtomicBool::new(false),
            sent_data: Mutex::new(Vec::new()),
        }
    }

    fn drop_data_once(&self, seq: u64) {
        self.drop_data_once.lock().unwrap().insert(seq);
    }

    fn sent_data(&self) -> Vec<u64> {
        self.sent_data.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, datagram: Bytes) -> io::Result<usize> {
        if let Ok(frame) = Frame::decode(datagram.clone()) {
            match frame.head.typ {
                MessageType::Data => {
                    self.sent_data.lock().unwrap().push(frame.head.seq);
                    if self.drop_all_data.load(Ordering::SeqCst)
                        || self.drop_data_once.lock().unwrap().remove(&frame.head.seq)
                    {
                        return Ok(datagram.len());
                    }
                }
                MessageType::Ack => {
                    if self.drop_acks.load(Ordering::SeqCst) {
                        return Ok(datagram.len());
                    }
                }
                _ => {}
            }
        }
        self.inner.send(datagram).await
    }

    async fn recv(&self) -> io::Result<Bytes> {
        self.inner.recv().await
    }

    fn max_datagram_size(&self) -> usize {
        self.inner.max_datagram_size()
    }
}

struct Peer {
    manager: SessionManager,
    transport: Arc<ScriptedTransport>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    handle: u64,
}

fn make_peers(config: SessionConfig) -> (Peer, Peer) {
    let (near, far) = memory_pair(4096);
    let mut peers = Vec::new();
    for endpoint in [near, far] {
        let transport = Arc::new(ScriptedTransport::new(endpoint));
        let manager = SessionManager::new(transport.clone(), config.clone());
        let (event_tx, events) = mpsc::unbounded_channel();
        let handle = manager.create(event_tx).unwrap();
        peers.push(Peer {
            manager,
            transport,
            events,
            handle,
        });
    }
    let receiver = peers.pop().unwrap();
    let sender = peers.pop().unwrap();
    (sender, receiver)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(300), events.recv())
        .await
        .expect("no event before deadline")
        .expect("event channel closed")
}

async fn wait_for_announce(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> (u64, u64) {
    loop {
        if let SessionEvent::Receive {
            handle,
            object_size,
            ..
        } = next_event(events).await
        {
            return (handle, object_size);
        }
    }
}

fn test_object(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

#[tokio::test(start_paused = true)]
async fn test_lockstep_transfer_delivers_in_order() {
    init_tracing();
    let (sender, mut receiver) = make_peers(SessionConfig::default());
    let object = test_object(10_000);

    let send_mgr = sender.manager.clone();
    let send_handle = sender.handle;
    let sent = object.clone();
    let send_task = tokio::spawn(async move {
        send_mgr
            .send(
                send_handle,
                sent,
                TransferParams {
                    block_size: Some(1_000),
                    ..Default::default()
                },
            )
            .await
    });

    let (handle, object_size) = wait_for_announce(&mut receiver.events).await;
    assert_eq!(handle, receiver.handle);
    assert_eq!(object_size, 10_000);

    let (block_tx, mut blocks) = mpsc::unbounded_channel::<BlockDelivery>();
    let assembled = receiver
        .manager
        .receive(
            handle,
            BytesMut::with_capacity(object_size as usize),
            block_tx,
            TransferParams {
                window_size: Some(4),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(assembled, object);
    send_task.await.unwrap().unwrap();

    // blocks stream to the application in offset order
    let mut expected_offset = 0u64;
    while let Ok(delivery) = blocks.try_recv() {
        assert_eq!(delivery.offset, expected_offset);
        assert_eq!(
            delivery.data.as_ref(),
            &object[delivery.offset as usize..delivery.offset as usize + delivery.data.len()]
        );
        expected_offset += delivery.data.len() as u64;
    }
    assert_eq!(expected_offset, 10_000);

    // the receiver's window preference capped the sender
    let stats = sender.manager.stats(sender.handle).await.unwrap();
    assert_eq!(stats.phase, SessionPhase::Completed);
    assert_eq!(stats.blocks_total, 10);
    assert!(matches!(
        next_event(&mut receiver.events).await,
        SessionEvent::Complete { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_block_is_resent_alone() {
    init_tracing();
    let (sender, mut receiver) = make_peers(SessionConfig::default());
    let object = test_object(10_000);
    sender.transport.drop_data_once(1);

    let send_mgr = sender.manager.clone();
    let send_handle = sender.handle;
    let sent = object.clone();
    let send_task = tokio::spawn(async move {
        send_mgr
            .send(
                send_handle,
                sent,
                TransferParams {
                    block_size: Some(1_000),
                    timeout_ms: Some(200),
                    ..Default::default()
                },
            )
            .await
    });

    let (handle, object_size) = wait_for_announce(&mut receiver.events).await;
    let (block_tx, _blocks) = mpsc::unbounded_channel();
    let assembled = receiver
        .manager
        .receive(
            handle,
            BytesMut::with_capacity(object_size as usize),
            block_tx,
            TransferParams {
                window_size: Some(4),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    send_task.await.unwrap().unwrap();
    assert_eq!(assembled, object);

    // only the dropped block went out twice; the selective bits spared the rest
    let sent_log = sender.transport.sent_data();
    for seq in 0..10u64 {
        let count = sent_log.iter().filter(|&&s| s == seq).count();
        let expected = if seq == 1 { 2 } else { 1 };
        assert_eq!(count, expected, "block {seq} sent {count} times");
    }

    // the ack that advanced past the resent block restored the budget
    let stats = sender.manager.stats(sender.handle).await.unwrap();
    assert_eq!(stats.retries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_budget_renews_on_ack_progress() {
    init_tracing();
    let (sender, mut receiver) = make_peers(SessionConfig::default());
    let object = test_object(10_000);
    // one loss in each window; every recovery costs a single retry, so a
    // budget of two is never exceeded as long as progress restores it
    sender.transport.drop_data_once(1);
    sender.transport.drop_data_once(5);
    sender.transport.drop_data_once(9);

    let send_mgr = sender.manager.clone();
    let send_handle = sender.handle;
    let sent = object.clone();
    let send_task = tokio::spawn(async move {
        send_mgr
            .send(
                send_handle,
                sent,
                TransferParams {
                    block_size: Some(1_000),
                    timeout_ms: Some(200),
                    num_retransmission: Some(2),
                    ..Default::default()
                },
            )
            .await
    });

    let (handle, object_size) = wait_for_announce(&mut receiver.events).await;
    let (block_tx, _blocks) = mpsc::unbounded_channel();
    let assembled = receiver
        .manager
        .receive(
            handle,
            BytesMut::with_capacity(object_size as usize),
            block_tx,
            TransferParams {
                window_size: Some(4),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    send_task.await.unwrap().unwrap();
    assert_eq!(assembled, object);

    // each dropped block cost exactly one retransmission
    let sent_log = sender.transport.sent_data();
    for seq in 0..10u64 {
        let count = sent_log.iter().filter(|&&s| s == seq).count();
        let expected = if matches!(seq, 1 | 5 | 9) { 2 } else { 1 };
        assert_eq!(count, expected, "block {seq} sent {count} times");
    }
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_then_resume_from_base() {
    init_tracing();
    let (mut sender, mut receiver) = make_peers(SessionConfig::default());
    let object = test_object(10_000);
    // the receiver's acks disappear until further notice
    receiver.transport.drop_acks.store(true, Ordering::SeqCst);

    let send_mgr = sender.manager.clone();
    let send_handle = sender.handle;
    let sent = object.clone();
    let send_task = tokio::spawn(async move {
        send_mgr
            .send(
                send_handle,
                sent,
                TransferParams {
                    block_size: Some(1_000),
                    timeout_ms: Some(100),
                    num_retransmission: Some(2),
                    ..Default::default()
                },
            )
            .await
    });

    let (handle, object_size) = wait_for_announce(&mut receiver.events).await;
    let recv_mgr = receiver.manager.clone();
    let (block_tx, _blocks) = mpsc::unbounded_channel();
    let recv_task = tokio::spawn(async move {
        recv_mgr
            .receive(
                handle,
                BytesMut::with_capacity(object_size as usize),
                block_tx,
                TransferParams {
                    window_size: Some(4),
                    ..Default::default()
                },
            )
            .await
    });

    assert_eq!(
        send_task.await.unwrap(),
        Err(SessionError::Failed(FailureReason::RetriesExhausted))
    );
    let stats = sender.manager.stats(sender.handle).await.unwrap();
    assert_eq!(stats.phase, SessionPhase::Failed);
    assert!(matches!(
        next_event(&mut sender.events).await,
        SessionEvent::Failed {
            reason: FailureReason::RetriesExhausted,
            ..
        }
    ));

    // the receiver took the first window in silently; its base moved on
    let recv_stats = receiver.manager.stats(receiver.handle).await.unwrap();
    assert_eq!(recv_stats.base, 4);

    let resume_mark = sender.transport.sent_data().len();
    receiver.transport.drop_acks.store(false, Ordering::SeqCst);
    sender.manager.resume(sender.handle).await.unwrap();

    let assembled = recv_task.await.unwrap().unwrap();
    assert_eq!(assembled, object);
    assert!(matches!(
        next_event(&mut sender.events).await,
        SessionEvent::Resumed { .. }
    ));

    // resumption picked up past the acknowledged base, not from block zero
    let after_resume = &sender.transport.sent_data()[resume_mark..];
    assert!(!after_resume.is_empty());
    assert!(after_resume.iter().all(|&seq| seq >= 4));
}

#[tokio::test(start_paused = true)]
async fn test_abort_is_irreversible() {
    init_tracing();
    let (mut sender, mut receiver) = make_peers(SessionConfig::default());
    let object = test_object(10_000);
    // stall the transfer so the abort lands mid-flight
    sender.transport.drop_all_data.store(true, Ordering::SeqCst);

    let send_mgr = sender.manager.clone();
    let send_handle = sender.handle;
    let send_task = tokio::spawn(async move {
        send_mgr
            .send(
                send_handle,
                object,
                TransferParams {
                    block_size: Some(1_000),
                    timeout_ms: Some(1_000),
                    num_retransmission: Some(50),
                    ..Default::default()
                },
            )
            .await
    });

    let (handle, object_size) = wait_for_announce(&mut receiver.events).await;
    let recv_mgr = receiver.manager.clone();
    let (block_tx, _blocks) = mpsc::unbounded_channel();
    let recv_task = tokio::spawn(async move {
        recv_mgr
            .receive(
                handle,
                BytesMut::with_capacity(object_size as usize),
                block_tx,
                TransferParams::default(),
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    // an in-flight session cannot be destroyed, only aborted
    assert_eq!(
        sender.manager.destroy(sender.handle).await,
        Err(SessionError::InternalError)
    );
    sender.manager.abort(sender.handle).await.unwrap();

    assert_eq!(send_task.await.unwrap(), Err(SessionError::Aborted));
    assert_eq!(recv_task.await.unwrap().unwrap_err(), SessionError::Aborted);
    assert!(matches!(
        next_event(&mut sender.events).await,
        SessionEvent::Failed {
            reason: FailureReason::LocalAbort(_),
            ..
        }
    ));
    assert!(matches!(
        next_event(&mut receiver.events).await,
        SessionEvent::Failed {
            reason: FailureReason::PeerAborted(_),
            ..
        }
    ));

    // an aborted session stays dead
    assert_eq!(
        sender.manager.resume(sender.handle).await,
        Err(SessionError::InternalError)
    );
    let stats = sender.manager.stats(sender.handle).await.unwrap();
    assert_eq!(stats.phase, SessionPhase::Aborted);
}

#[tokio::test(start_paused = true)]
async fn test_params_update_reaches_peer() {
    init_tracing();
    let (mut sender, mut receiver) = make_peers(SessionConfig::default());
    let object = test_object(10_000);
    sender.transport.drop_all_data.store(true, Ordering::SeqCst);

    let send_mgr = sender.manager.clone();
    let send_handle = sender.handle;
    let sent = object.clone();
    let send_task = tokio::spawn(async move {
        send_mgr
            .send(
                send_handle,
                sent,
                TransferParams {
                    block_size: Some(1_000),
                    num_retransmission: Some(50),
                    ..Default::default()
                },
            )
            .await
    });

    let (handle, object_size) = wait_for_announce(&mut receiver.events).await;
    let recv_mgr = receiver.manager.clone();
    let (block_tx, _blocks) = mpsc::unbounded_channel();
    let recv_task = tokio::spawn(async move {
        recv_mgr
            .receive(
                handle,
                BytesMut::with_capacity(object_size as usize),
                block_tx,
                TransferParams::default(),
            )
            .await
    });

    // wait until negotiation is done, updates only travel on live sessions
    while sender.manager.stats(sender.handle).await.unwrap().phase != SessionPhase::Transferring {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // frozen fields cannot change mid-session
    assert_eq!(
        sender
            .manager
            .set_params(
                sender.handle,
                TransferParams {
                    block_size: Some(2_000),
                    ..Default::default()
                }
            )
            .await,
        Err(SessionError::InvalidParam)
    );

    sender
        .manager
        .set_params(
            sender.handle,
            TransferParams {
                timeout_ms: Some(500),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // the caller hears about its own change too
    match next_event(&mut sender.events).await {
        SessionEvent::MetadataChanged { params, .. } => {
            assert_eq!(params.timeout_ms, Some(500));
        }
        other => panic!("expected local metadata change, got {other:?}"),
    }

    match next_event(&mut receiver.events).await {
        SessionEvent::MetadataChanged { params, .. } => {
            assert_eq!(params.timeout_ms, Some(500));
        }
        other => panic!("expected metadata change, got {other:?}"),
    }

    sender.transport.drop_all_data.store(false, Ordering::SeqCst);
    send_task.await.unwrap().unwrap();
    assert_eq!(recv_task.await.unwrap().unwrap(), object);
}

#[tokio::test(start_paused = true)]
async fn test_delivery_on_arrival_skips_ordering() {
    init_tracing();
    let config = SessionConfig {
        deliver_on_arrival: true,
        ..Default::default()
    };
    let (sender, mut receiver) = make_peers(config);
    let object = test_object(10_000);
    sender.transport.drop_data_once(1);

    let send_mgr = sender.manager.clone();
    let send_handle = sender.handle;
    let sent = object.clone();
    let send_task = tokio::spawn(async move {
        send_mgr
            .send(
                send_handle,
                sent,
                TransferParams {
                    block_size: Some(1_000),
                    timeout_ms: Some(200),
                    ..Default::default()
                },
            )
            .await
    });

    let (handle, object_size) = wait_for_announce(&mut receiver.events).await;
    let (block_tx, mut blocks) = mpsc::unbounded_channel::<BlockDelivery>();
    let assembled = receiver
        .manager
        .receive(
            handle,
            BytesMut::with_capacity(object_size as usize),
            block_tx,
            TransferParams {
                window_size: Some(4),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    send_task.await.unwrap().unwrap();
    assert_eq!(assembled, object);

    let mut offsets = Vec::new();
    while let Ok(delivery) = blocks.try_recv() {
        offsets.push(delivery.offset);
    }
    let mut sorted = offsets.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted, (0..10u64).map(|b| b * 1_000).collect::<Vec<_>>());

    // the gap block arrived after its successors instead of holding them back
    let pos_1000 = offsets.iter().position(|&o| o == 1_000).unwrap();
    let pos_2000 = offsets.iter().position(|&o| o == 2_000).unwrap();
    assert!(pos_1000 > pos_2000);
}

#[tokio::test(start_paused = true)]
async fn test_inactivity_timeout_fails_the_receiver() {
    init_tracing();
    let (sender, mut receiver) = make_peers(SessionConfig::default());
    let object = test_object(10_000);

    let send_mgr = sender.manager.clone();
    let send_handle = sender.handle;
    let send_task = tokio::spawn(async move {
        send_mgr
            .send(
                send_handle,
                object,
                TransferParams {
                    block_size: Some(1_000),
                    timeout_ms: Some(100),
                    num_retransmission: Some(1),
                    inactivity_timeout_ms: Some(2_000),
                    ..Default::default()
                },
            )
            .await
    });

    let (handle, object_size) = wait_for_announce(&mut receiver.events).await;
    // everything the sender pushes from now on disappears
    sender.transport.drop_all_data.store(true, Ordering::SeqCst);
    sender.transport.drop_acks.store(true, Ordering::SeqCst);
    let result = receiver
        .manager
        .receive(
            handle,
            BytesMut::with_capacity(object_size as usize),
            mpsc::unbounded_channel().0,
            TransferParams::default(),
        )
        .await;

    assert_eq!(result, Err(SessionError::TimedOut));
    assert!(send_task.await.unwrap().is_err());
    assert!(matches!(
        next_event(&mut receiver.events).await,
        SessionEvent::Timedout { .. }
    ));
}
