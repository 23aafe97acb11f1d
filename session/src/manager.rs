//! Session registry, datagram dispatch, and the blocking operations
//!
//! One manager owns one transport. A dispatch task decodes every inbound
//! datagram and routes it to the session registered for its wire id;
//! unknown announcements are parked on an idle session and surfaced as a
//! `Receive` event. Blocking operations start an attempt, hand the lock
//! back, and wait on the session's outcome channel.

use crate::error::SessionError;
use crate::negotiate;
use crate::session::{
    build_echo, build_params_update, merge_params, BlockDelivery, Role, SessionConfig,
    SessionEvent, SessionPhase, SessionRecord, SessionStats,
};
use crate::transport::Transport;
use crate::window::RecvWindow;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use lot_wire::{AbortReason, Flags, Frame, MessageType, Reassembler, TransferParams, HEADER_SIZE};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Smallest transport datagram the engine can work with
///
/// Room for the fixed header plus announcement metadata.
pub const MIN_DATAGRAM_SIZE: usize = 256;

/// Transfer engine over one datagram transport
///
/// Cheap to clone; all clones share the same sessions.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    /// Application handle to session record
    sessions: DashMap<u64, Arc<SessionRecord>>,
    /// Wire session id to application handle
    wire_index: DashMap<u64, u64>,
    next_handle: AtomicU64,
}

impl SessionManager {
    /// Start a manager over the given transport
    ///
    /// Spawns the dispatch task, so this must run inside a tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let inner = Arc::new(ManagerInner {
            transport: transport.clone(),
            config,
            sessions: DashMap::new(),
            wire_index: DashMap::new(),
            next_handle: AtomicU64::new(1),
        });
        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            loop {
                let datagram = match transport.recv().await {
                    Ok(d) => d,
                    Err(e) => {
                        debug!(error = %e, "transport closed, dispatch exiting");
                        break;
                    }
                };
                let Some(strong) = weak.upgrade() else { break };
                SessionManager { inner: strong }.handle_datagram(datagram).await;
            }
        });
        Self { inner }
    }

    /// Register a fresh idle session and return its handle
    ///
    /// Events for the session's whole lifetime arrive on `event_tx`.
    pub fn create(
        &self,
        event_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<u64, SessionError> {
        let max_datagram = self.inner.transport.max_datagram_size();
        if max_datagram < MIN_DATAGRAM_SIZE {
            return Err(SessionError::InvalidParam);
        }
        let handle = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(SessionRecord::new(
            handle,
            event_tx,
            &self.inner.config,
            max_datagram,
        ));
        self.inner.sessions.insert(handle, record);
        debug!(handle, "session created");
        Ok(handle)
    }

    /// Send one object, blocking until the attempt ends
    ///
    /// From `Failed` this resumes the previous transfer; the object must be
    /// the same one. Returns once every block is acknowledged, the retry
    /// budget runs out, or the session is aborted.
    pub async fn send(
        &self,
        handle: u64,
        object: Bytes,
        params: TransferParams,
    ) -> Result<(), SessionError> {
        if object.is_empty() {
            return Err(SessionError::InvalidParam);
        }
        negotiate::validate(&params)?;
        let record = self.lookup(handle)?;
        let out = {
            let mut inner = record.inner.lock().await;
            match inner.phase {
                SessionPhase::Idle => {
                    if inner.pending_announce.is_some() {
                        return Err(SessionError::SessionInProgress);
                    }
                    let wire_id = self.alloc_wire_id(handle);
                    inner.role = Some(Role::Sender);
                    inner.wire_id = wire_id;
                    inner.object_size = object.len() as u64;
                    inner.object = Some(object);
                    merge_params(&mut inner.proposed, &params);
                    info!(handle, session = wire_id, size = inner.object_size, "sending object");
                    record.begin_send_attempt(&mut inner, false)
                }
                SessionPhase::Failed if inner.role == Some(Role::Sender) => {
                    if object.len() as u64 != inner.object_size {
                        return Err(SessionError::InvalidParam);
                    }
                    inner.object = Some(object);
                    info!(handle, session = inner.wire_id, "resuming send after failure");
                    record.begin_send_attempt(&mut inner, true)
                }
                SessionPhase::Negotiating | SessionPhase::Transferring => {
                    return Err(SessionError::SessionInProgress)
                }
                _ => return Err(SessionError::InternalError),
            }
        };
        self.flush(out).await;
        self.ensure_timer_task(record.clone());
        record.timer_notify.notify_one();
        Self::wait_outcome(&record).await.map(|_| ())
    }

    /// Accept an announced object, blocking until it is assembled
    ///
    /// Valid only after a `Receive` event. The object is assembled into
    /// `buffer`, which must have capacity for the announced size; accepted
    /// blocks are also streamed on `block_tx` as they are taken in.
    pub async fn receive(
        &self,
        handle: u64,
        buffer: BytesMut,
        block_tx: mpsc::UnboundedSender<BlockDelivery>,
        params: TransferParams,
    ) -> Result<Bytes, SessionError> {
        negotiate::validate(&params)?;
        let record = self.lookup(handle)?;
        let out = {
            let mut inner = record.inner.lock().await;
            if inner.phase != SessionPhase::Idle {
                return Err(if inner.phase.is_terminal() {
                    SessionError::InternalError
                } else {
                    SessionError::SessionInProgress
                });
            }
            let (wire_id, info) = inner
                .pending_announce
                .take()
                .ok_or(SessionError::InternalError)?;
            if info.object_size == 0 || negotiate::validate(&info.params).is_err() {
                return Err(SessionError::InvalidParam);
            }
            merge_params(&mut inner.proposed, &params);
            let agreed = negotiate::negotiate(&inner.proposed, &info.params);
            if agreed.block_size as usize + HEADER_SIZE > inner.max_datagram {
                return Err(SessionError::InvalidParam);
            }
            let reassembler = Reassembler::new(buffer, info.object_size as usize, agreed.block_size)
                .ok_or(SessionError::BufferTooSmall)?;
            let total = reassembler.block_count();

            inner.role = Some(Role::Receiver);
            inner.wire_id = wire_id;
            self.inner.wire_index.insert(wire_id, handle);
            inner.object_size = info.object_size;
            inner.agreed = Some(agreed);
            inner.reassembler = Some(reassembler);
            inner.recv_window = Some(RecvWindow::new(0, total, agreed.window_size));
            inner.block_tx = Some(block_tx);
            let now = Instant::now();
            inner
                .timers
                .set_budgets(agreed.timeout, agreed.inactivity_timeout);
            inner.timers.touch(now);
            inner.timers.arm_window(now);
            inner.phase = SessionPhase::Transferring;
            record.outcome.send_replace(None);
            info!(
                handle,
                session = wire_id,
                size = info.object_size,
                block_size = agreed.block_size,
                window_size = agreed.window_size,
                "accepting transfer"
            );
            // a fresh session cannot honor resumption, echo without the flag
            vec![build_echo(&inner, false).map_err(|_| SessionError::InternalError)?]
        };
        self.flush(out).await;
        self.ensure_timer_task(record.clone());
        record.timer_notify.notify_one();
        match Self::wait_outcome(&record).await? {
            Some(object) => Ok(object),
            None => Err(SessionError::InternalError),
        }
    }

    /// Change the mutable parameters of a session
    ///
    /// Block and window size are frozen once a transfer starts; updates to
    /// the timing fields apply to the live timers and are pushed to the
    /// peer when a transfer is active.
    pub async fn set_params(&self, handle: u64, params: TransferParams) -> Result<(), SessionError> {
        negotiate::validate_update(&params)?;
        let record = self.lookup(handle)?;
        let out = {
            let mut inner = record.inner.lock().await;
            match inner.phase {
                SessionPhase::Idle => {
                    merge_params(&mut inner.proposed, &params);
                    Vec::new()
                }
                SessionPhase::Negotiating | SessionPhase::Transferring => {
                    merge_params(&mut inner.proposed, &params);
                    if let Some(agreed) = inner.agreed.as_mut() {
                        agreed.apply_update(&params);
                        let (timeout, inactivity) = (agreed.timeout, agreed.inactivity_timeout);
                        inner.timers.set_budgets(timeout, inactivity);
                    }
                    record.emit(SessionEvent::MetadataChanged { handle, params });
                    vec![build_params_update(&inner, &params)
                        .map_err(|_| SessionError::InternalError)?]
                }
                _ => return Err(SessionError::InternalError),
            }
        };
        self.flush(out).await;
        record.timer_notify.notify_one();
        Ok(())
    }

    /// Resume a failed transfer, blocking until the new attempt ends
    ///
    /// A sender re-announces from the last acknowledged base; a receiver
    /// re-arms and waits for the peer's resume announcement.
    pub async fn resume(&self, handle: u64) -> Result<(), SessionError> {
        let record = self.lookup(handle)?;
        let out = {
            let mut inner = record.inner.lock().await;
            if !inner.was_failed {
                return Err(SessionError::InternalError);
            }
            match (inner.role, inner.phase) {
                (Some(Role::Sender), SessionPhase::Failed) => {
                    info!(handle, session = inner.wire_id, "resuming send after failure");
                    record.begin_send_attempt(&mut inner, true)
                }
                (Some(Role::Receiver), SessionPhase::Failed) => {
                    inner.retries = 0;
                    inner.timers.touch(Instant::now());
                    record.outcome.send_replace(None);
                    info!(handle, session = inner.wire_id, "awaiting peer resumption");
                    Vec::new()
                }
                // the peer already restarted the attempt
                (_, SessionPhase::Negotiating)
                | (_, SessionPhase::Transferring)
                | (_, SessionPhase::Completed) => Vec::new(),
                _ => return Err(SessionError::InternalError),
            }
        };
        self.flush(out).await;
        self.ensure_timer_task(record.clone());
        record.timer_notify.notify_one();
        Self::wait_outcome(&record).await.map(|_| ())
    }

    /// Abort a session for good; it cannot be resumed afterwards
    pub async fn abort(&self, handle: u64) -> Result<(), SessionError> {
        let record = self.lookup(handle)?;
        let out = {
            let mut inner = record.inner.lock().await;
            if inner.phase.is_terminal() {
                return Err(SessionError::InternalError);
            }
            info!(handle, session = inner.wire_id, "aborting session");
            record.abort_locally(&mut inner, AbortReason::Application)
        };
        self.flush(out).await;
        record.timer_notify.notify_one();
        Ok(())
    }

    /// Drop a session that is not mid-transfer
    pub async fn destroy(&self, handle: u64) -> Result<(), SessionError> {
        let record = self.lookup(handle)?;
        {
            let inner = record.inner.lock().await;
            if matches!(
                inner.phase,
                SessionPhase::Negotiating | SessionPhase::Transferring
            ) {
                return Err(SessionError::InternalError);
            }
            if inner.wire_id != 0 {
                self.inner.wire_index.remove(&inner.wire_id);
            }
        }
        self.inner.sessions.remove(&handle);
        record.closed.store(true, Ordering::SeqCst);
        record.timer_notify.notify_one();
        debug!(handle, "session destroyed");
        Ok(())
    }

    /// Point-in-time counters for a session
    pub async fn stats(&self, handle: u64) -> Result<SessionStats, SessionError> {
        let record = self.lookup(handle)?;
        let inner = record.inner.lock().await;
        Ok(record.stats(&inner))
    }

    fn lookup(&self, handle: u64) -> Result<Arc<SessionRecord>, SessionError> {
        self.inner
            .sessions
            .get(&handle)
            .map(|e| e.value().clone())
            .ok_or(SessionError::SessionNotFound)
    }

    fn alloc_wire_id(&self, handle: u64) -> u64 {
        loop {
            let id: u64 = rand::random();
            if id != 0 && !self.inner.wire_index.contains_key(&id) {
                self.inner.wire_index.insert(id, handle);
                return id;
            }
        }
    }

    async fn flush(&self, out: Vec<Bytes>) {
        for dgram in out {
            if let Err(e) = self.inner.transport.send(dgram).await {
                warn!(error = %e, "transport send failed");
            }
        }
    }

    async fn wait_outcome(record: &SessionRecord) -> Result<Option<Bytes>, SessionError> {
        let mut rx = record.outcome.subscribe();
        let outcome = {
            let value = rx
                .wait_for(|outcome| outcome.is_some())
                .await
                .map_err(|_| SessionError::InternalError)?;
            value.clone()
        };
        match outcome {
            Some(outcome) => outcome.into_result(),
            None => Err(SessionError::InternalError),
        }
    }

    async fn handle_datagram(&self, datagram: Bytes) {
        let Some(wire_id) = lot_wire::peek_session(&datagram) else {
            debug!(len = datagram.len(), "dropping runt datagram");
            return;
        };
        let frame = match Frame::decode(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(session = wire_id, error = %e, "dropping undecodable datagram");
                return;
            }
        };

        if let Some(handle) = self.inner.wire_index.get(&wire_id).map(|e| *e.value()) {
            if let Some(record) = self.inner.sessions.get(&handle).map(|e| e.value().clone()) {
                let out = {
                    let mut inner = record.inner.lock().await;
                    record.on_frame(&mut inner, &frame)
                };
                self.flush(out).await;
                record.timer_notify.notify_one();
                return;
            }
        }

        if frame.head.typ == MessageType::Announce && !frame.head.flags.contains(Flags::ECHO) {
            self.stash_announce(wire_id, &frame).await;
        } else {
            debug!(session = wire_id, typ = ?frame.head.typ, "frame for unknown session");
        }
    }

    /// Park an announcement for an unknown wire id on an idle session
    async fn stash_announce(&self, wire_id: u64, frame: &Frame) {
        let info = match negotiate::parse_announce(frame) {
            Ok(info) => info,
            Err(e) => {
                debug!(session = wire_id, error = %e, "dropping malformed announcement");
                return;
            }
        };
        let records: Vec<Arc<SessionRecord>> = self
            .inner
            .sessions
            .iter()
            .map(|e| e.value().clone())
            .collect();
        // a retransmitted announcement may already be parked
        for record in &records {
            let inner = record.inner.lock().await;
            if inner.pending_announce.as_ref().map(|(id, _)| *id) == Some(wire_id) {
                return;
            }
        }
        for record in &records {
            let mut inner = record.inner.lock().await;
            if inner.phase == SessionPhase::Idle
                && inner.role.is_none()
                && inner.pending_announce.is_none()
            {
                inner.pending_announce = Some((wire_id, info.clone()));
                record.emit(SessionEvent::Receive {
                    handle: record.handle,
                    object_size: info.object_size,
                    params: info.params,
                });
                info!(
                    handle = record.handle,
                    session = wire_id,
                    size = info.object_size,
                    "inbound transfer announced"
                );
                return;
            }
        }
        debug!(session = wire_id, "no idle session to accept announcement");
    }

    /// Make sure the session's deadline task is running
    fn ensure_timer_task(&self, record: Arc<SessionRecord>) {
        if record.timer_active.swap(true, Ordering::SeqCst) {
            record.timer_notify.notify_one();
            return;
        }
        let transport = self.inner.transport.clone();
        tokio::spawn(async move {
            loop {
                if record.closed.load(Ordering::SeqCst) {
                    break;
                }
                let next = {
                    let inner = record.inner.lock().await;
                    if matches!(
                        inner.phase,
                        SessionPhase::Completed | SessionPhase::Aborted
                    ) {
                        break;
                    }
                    inner.timers.next_deadline()
                };
                match next {
                    Some(deadline) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(deadline) => {
                                let out = {
                                    let mut inner = record.inner.lock().await;
                                    record.on_timer(&mut inner, Instant::now())
                                };
                                for dgram in out {
                                    if let Err(e) = transport.send(dgram).await {
                                        debug!(error = %e, "timer send failed");
                                    }
                                }
                            }
                            _ = record.timer_notify.notified() => {}
                        }
                    }
                    None => record.timer_notify.notified().await,
                }
            }
            record.timer_active.store(false, Ordering::SeqCst);
        });
    }
}
