//! Per-session state machine
//!
//! A session is one half of a large-object transfer. It idles until the
//! application starts sending or accepts an inbound announcement, negotiates
//! parameters, then drives a block window until the object is complete, the
//! retry budget runs out, or one side aborts. A failed attempt keeps its
//! window state so a resumed attempt restarts from the last acknowledged
//! base instead of block zero.

use crate::error::{FailureReason, SessionError};
use crate::negotiate::{self, AgreedParams, AnnounceInfo};
use crate::timer::{TimerKind, TransferTimers};
use crate::window::{Placement, RecvWindow, SendWindow};
use bytes::Bytes;
use lot_wire::{
    AbortReason, CodecError, Flags, Frame, FrameBuilder, Header, MessageType, Reassembler,
    Segmenter, TransferParams,
};
use std::sync::atomic::AtomicBool;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Metadata key carrying the selective-ack bitmap
pub const META_SACK: &str = "sack";

/// Lifecycle phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Created, no transfer started or accepted yet
    Idle,
    /// Announcement sent, waiting for the echoed agreed parameters
    Negotiating,
    /// Blocks and acks in flight
    Transferring,
    /// The object arrived (or was fully acknowledged) intact
    Completed,
    /// The attempt stopped; the session can be resumed
    Failed,
    /// Torn down for good, resumption is not possible
    Aborted,
}

impl SessionPhase {
    /// True for the phases no further transfer activity can leave
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

/// Which end of the transfer this session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Announces and pushes blocks
    Sender,
    /// Accepts, reassembles and acknowledges
    Receiver,
}

/// Final result of one transfer attempt
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The transfer finished; receivers get the assembled object
    Completed(Option<Bytes>),
    /// The attempt failed and may be resumed
    Failed(FailureReason),
    /// The peer went silent past the inactivity timeout
    TimedOut,
    /// The session was aborted by either side
    Aborted,
}

impl Outcome {
    /// Map the outcome onto the result of a blocking operation
    pub fn into_result(self) -> Result<Option<Bytes>, SessionError> {
        match self {
            Outcome::Completed(obj) => Ok(obj),
            Outcome::Failed(reason) => Err(SessionError::Failed(reason)),
            Outcome::TimedOut => Err(SessionError::TimedOut),
            Outcome::Aborted => Err(SessionError::Aborted),
        }
    }
}

/// Asynchronous notifications delivered on the channel given to `create`
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A peer announced an object for this session to receive
    Receive {
        /// Session handle the announcement was routed to
        handle: u64,
        /// Announced object size in bytes
        object_size: u64,
        /// Parameters the sender proposed
        params: TransferParams,
    },
    /// The transfer finished intact
    Complete {
        /// Session handle
        handle: u64,
    },
    /// The attempt failed; the session may be resumed
    Failed {
        /// Session handle
        handle: u64,
        /// What stopped the attempt
        reason: FailureReason,
    },
    /// The peer went silent past the inactivity timeout
    Timedout {
        /// Session handle
        handle: u64,
    },
    /// The peer changed the mutable transfer parameters mid-session
    MetadataChanged {
        /// Session handle
        handle: u64,
        /// The fields the peer changed
        params: TransferParams,
    },
    /// A failed attempt was resumed
    Resumed {
        /// Session handle
        handle: u64,
    },
}

/// One block handed to the receiving application as it is accepted
#[derive(Debug, Clone)]
pub struct BlockDelivery {
    /// Byte offset of the block within the object
    pub offset: u64,
    /// Block payload
    pub data: Bytes,
}

/// Engine-wide tuning applied to every session of a manager
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deliver blocks as they arrive instead of in offset order
    pub deliver_on_arrival: bool,
    /// Parameter preferences used when an operation passes none
    pub params: TransferParams,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            deliver_on_arrival: false,
            params: TransferParams::default(),
        }
    }
}

/// Point-in-time counters for one session
#[derive(Debug, Clone, Copy)]
pub struct SessionStats {
    /// Current lifecycle phase
    pub phase: SessionPhase,
    /// Sender or receiver, once a transfer started
    pub role: Option<Role>,
    /// Cumulative window base
    pub base: u64,
    /// Retries consumed by the current attempt
    pub retries: u32,
    /// Total blocks in the object, zero before negotiation
    pub blocks_total: u64,
}

/// Mutable state behind the session lock
pub(crate) struct SessionInner {
    pub(crate) phase: SessionPhase,
    pub(crate) role: Option<Role>,
    /// Wire session id, zero until a transfer starts
    pub(crate) wire_id: u64,
    pub(crate) object_size: u64,
    /// Local parameter preferences for the next attempt
    pub(crate) proposed: TransferParams,
    pub(crate) agreed: Option<AgreedParams>,
    pub(crate) object: Option<Bytes>,
    pub(crate) segmenter: Option<Segmenter>,
    pub(crate) send_window: Option<SendWindow>,
    pub(crate) reassembler: Option<Reassembler>,
    pub(crate) recv_window: Option<RecvWindow>,
    pub(crate) block_tx: Option<mpsc::UnboundedSender<BlockDelivery>>,
    /// Inbound announcement parked until the application accepts it
    pub(crate) pending_announce: Option<(u64, AnnounceInfo)>,
    pub(crate) retries: u32,
    pub(crate) timers: TransferTimers,
    /// True while a resume announcement awaits its echo
    pub(crate) resume_pending: bool,
    /// True once any attempt on this session has failed
    pub(crate) was_failed: bool,
    pub(crate) deliver_on_arrival: bool,
    pub(crate) max_datagram: usize,
}

/// A registered session: shared handles around the locked state
pub(crate) struct SessionRecord {
    pub(crate) handle: u64,
    pub(crate) inner: Mutex<SessionInner>,
    /// Attempt outcome; `None` while an attempt is in flight
    pub(crate) outcome: watch::Sender<Option<Outcome>>,
    pub(crate) event_tx: mpsc::UnboundedSender<SessionEvent>,
    pub(crate) timer_notify: Notify,
    pub(crate) timer_active: AtomicBool,
    pub(crate) closed: AtomicBool,
}

impl SessionRecord {
    pub(crate) fn new(
        handle: u64,
        event_tx: mpsc::UnboundedSender<SessionEvent>,
        config: &SessionConfig,
        max_datagram: usize,
    ) -> Self {
        let defaults = negotiate::resolve_local(&config.params);
        Self {
            handle,
            inner: Mutex::new(SessionInner {
                phase: SessionPhase::Idle,
                role: None,
                wire_id: 0,
                object_size: 0,
                proposed: config.params,
                agreed: None,
                object: None,
                segmenter: None,
                send_window: None,
                reassembler: None,
                recv_window: None,
                block_tx: None,
                pending_announce: None,
                retries: 0,
                timers: TransferTimers::new(defaults.timeout, defaults.inactivity_timeout),
                resume_pending: false,
                was_failed: false,
                deliver_on_arrival: config.deliver_on_arrival,
                max_datagram,
            }),
            outcome: watch::channel(None).0,
            event_tx,
            timer_notify: Notify::new(),
            timer_active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        self.event_tx.send(event).ok();
    }

    /// Fail the current attempt, leaving the session resumable
    pub(crate) fn fail(&self, inner: &mut SessionInner, reason: FailureReason) {
        inner.phase = SessionPhase::Failed;
        inner.was_failed = true;
        inner.resume_pending = false;
        inner.timers.cancel();
        if reason == FailureReason::InactivityTimeout {
            self.outcome.send_replace(Some(Outcome::TimedOut));
            self.emit(SessionEvent::Timedout {
                handle: self.handle,
            });
        } else {
            self.outcome.send_replace(Some(Outcome::Failed(reason)));
            self.emit(SessionEvent::Failed {
                handle: self.handle,
                reason,
            });
        }
    }

    /// Tear the session down for good
    pub(crate) fn abort_locally(&self, inner: &mut SessionInner, reason: AbortReason) -> Vec<Bytes> {
        let mut out = Vec::new();
        if inner.wire_id != 0 && inner.phase != SessionPhase::Idle {
            let frame = FrameBuilder::new(Header::new(MessageType::Abort, inner.wire_id, 0))
                .reason(reason)
                .build(inner.max_datagram);
            push_or_warn(&mut out, frame);
        }
        inner.phase = SessionPhase::Aborted;
        inner.timers.cancel();
        self.outcome.send_replace(Some(Outcome::Aborted));
        self.emit(SessionEvent::Failed {
            handle: self.handle,
            reason: FailureReason::LocalAbort(reason),
        });
        out
    }

    /// Start or resume a sending attempt by announcing the object
    pub(crate) fn begin_send_attempt(&self, inner: &mut SessionInner, resume: bool) -> Vec<Bytes> {
        let now = Instant::now();
        let budget = inner
            .agreed
            .unwrap_or_else(|| negotiate::resolve_local(&inner.proposed));
        inner.retries = 0;
        inner.resume_pending = resume;
        inner.phase = SessionPhase::Negotiating;
        inner.timers.set_budgets(budget.timeout, budget.inactivity_timeout);
        inner.timers.touch(now);
        inner.timers.arm_window(now);
        self.outcome.send_replace(None);

        let mut out = Vec::new();
        push_or_warn(&mut out, build_announce(inner, resume));
        out
    }

    /// Handle one decoded frame routed to this session
    pub(crate) fn on_frame(&self, inner: &mut SessionInner, frame: &Frame) -> Vec<Bytes> {
        if inner.phase != SessionPhase::Completed {
            inner.timers.touch(Instant::now());
        }
        match frame.head.typ {
            MessageType::Announce => self.on_announce(inner, frame),
            MessageType::Data => self.on_data(inner, frame),
            MessageType::Ack => self.on_ack(inner, frame),
            MessageType::ParamsUpdate => self.on_params_update(inner, frame),
            MessageType::Abort => self.on_abort(inner, frame),
        }
    }

    fn on_announce(&self, inner: &mut SessionInner, frame: &Frame) -> Vec<Bytes> {
        let info = match negotiate::parse_announce(frame) {
            Ok(info) => info,
            Err(e) => {
                warn!(session = inner.wire_id, error = %e, "malformed announcement");
                return Vec::new();
            }
        };
        match inner.role {
            Some(Role::Sender) => self.on_echo(inner, info),
            Some(Role::Receiver) => self.on_peer_announce(inner, info),
            None => Vec::new(),
        }
    }

    /// Sender side: the receiver echoed the agreed parameter set
    fn on_echo(&self, inner: &mut SessionInner, info: AnnounceInfo) -> Vec<Bytes> {
        if !info.echo || inner.phase != SessionPhase::Negotiating {
            return Vec::new();
        }
        if negotiate::validate(&info.params).is_err() {
            warn!(session = inner.wire_id, "peer echoed unusable parameters");
            return self.abort_locally(inner, AbortReason::Protocol);
        }
        let agreed = negotiate::resolve_local(&info.params);
        if agreed.block_size as usize + lot_wire::HEADER_SIZE > inner.max_datagram {
            warn!(
                session = inner.wire_id,
                block_size = agreed.block_size,
                "agreed block size exceeds transport datagram"
            );
            return self.abort_locally(inner, AbortReason::Protocol);
        }

        let resuming = inner.resume_pending && info.resume;
        if inner.resume_pending && !info.resume {
            // the peer lost its state; the transfer restarts from scratch
            debug!(session = inner.wire_id, "peer did not honor resumption");
            inner.send_window = None;
        }
        if resuming {
            let pinned = match inner.agreed {
                Some(p) => p,
                None => return self.abort_locally(inner, AbortReason::Protocol),
            };
            if agreed.block_size != pinned.block_size || agreed.window_size != pinned.window_size {
                warn!(session = inner.wire_id, "frozen parameters changed across resume");
                return self.abort_locally(inner, AbortReason::Protocol);
            }
        }

        let segmenter = Segmenter::new(agreed.block_size);
        let total = segmenter.block_count(inner.object_size as usize);
        inner.agreed = Some(agreed);
        inner.segmenter = Some(segmenter);
        if inner.send_window.is_none() {
            inner.send_window = Some(SendWindow::new(0, total, agreed.window_size));
        }
        inner.phase = SessionPhase::Transferring;
        inner.resume_pending = false;
        inner.retries = 0;
        inner
            .timers
            .set_budgets(agreed.timeout, agreed.inactivity_timeout);
        inner.timers.clear_window();
        if resuming {
            self.emit(SessionEvent::Resumed {
                handle: self.handle,
            });
        }
        debug!(
            session = inner.wire_id,
            block_size = agreed.block_size,
            window_size = agreed.window_size,
            blocks = total,
            resume = resuming,
            "transfer negotiated"
        );
        self.pump_sender(inner, Instant::now())
    }

    /// Receiver side: a routed announcement, either a duplicate or a resume
    fn on_peer_announce(&self, inner: &mut SessionInner, info: AnnounceInfo) -> Vec<Bytes> {
        if info.echo {
            return Vec::new();
        }
        match inner.phase {
            SessionPhase::Transferring => {
                // our echo was lost, repeat it along with the current ack
                let mut out = Vec::new();
                push_or_warn(&mut out, build_echo(inner, info.resume));
                push_or_warn(&mut out, build_ack(inner));
                out
            }
            SessionPhase::Failed if info.resume => self.accept_peer_resume(inner, info),
            _ => {
                debug!(
                    session = inner.wire_id,
                    phase = ?inner.phase,
                    "ignoring announcement in current phase"
                );
                Vec::new()
            }
        }
    }

    fn accept_peer_resume(&self, inner: &mut SessionInner, info: AnnounceInfo) -> Vec<Bytes> {
        let pinned = match inner.agreed {
            Some(p) => p,
            None => return self.abort_locally(inner, AbortReason::Protocol),
        };
        if info.object_size != inner.object_size
            || info.params.block_size != Some(pinned.block_size)
            || info.params.window_size != Some(pinned.window_size)
        {
            warn!(session = inner.wire_id, "resume announcement contradicts session");
            return self.abort_locally(inner, AbortReason::Protocol);
        }

        let now = Instant::now();
        inner.retries = 0;
        inner.phase = SessionPhase::Transferring;
        inner
            .timers
            .set_budgets(pinned.timeout, pinned.inactivity_timeout);
        inner.timers.touch(now);
        inner.timers.arm_window(now);
        self.outcome.send_replace(None);
        self.emit(SessionEvent::Resumed {
            handle: self.handle,
        });
        debug!(
            session = inner.wire_id,
            base = inner.recv_window.as_ref().map(|w| w.base()).unwrap_or(0),
            "peer resumed transfer"
        );

        let mut out = Vec::new();
        push_or_warn(&mut out, build_echo(inner, true));
        push_or_warn(&mut out, build_ack(inner));
        out
    }

    fn on_data(&self, inner: &mut SessionInner, frame: &Frame) -> Vec<Bytes> {
        if inner.role != Some(Role::Receiver) {
            return Vec::new();
        }
        // a lost final ack leaves the sender retransmitting into a finished
        // session; answer with the final ack instead of silence
        if inner.phase == SessionPhase::Completed {
            let mut out = Vec::new();
            push_or_warn(&mut out, build_ack(inner));
            return out;
        }
        if inner.phase != SessionPhase::Transferring {
            return Vec::new();
        }

        let seq = frame.head.seq;
        let placement = match inner.recv_window.as_mut() {
            Some(win) => win.insert(seq),
            None => return Vec::new(),
        };
        let mut out = Vec::new();
        match placement {
            Placement::Duplicate | Placement::OutOfWindow => {
                debug!(session = inner.wire_id, seq, ?placement, "block not stored");
                push_or_warn(&mut out, build_ack(inner));
            }
            Placement::Stored { newly_ordered } => {
                let placed = inner
                    .reassembler
                    .as_mut()
                    .map(|r| r.place(seq, &frame.payload))
                    .unwrap_or(false);
                if !placed {
                    warn!(session = inner.wire_id, seq, "block has the wrong length");
                    return self.abort_locally(inner, AbortReason::Protocol);
                }
                self.deliver(inner, seq, &frame.payload, &newly_ordered);

                let complete = inner
                    .recv_window
                    .as_ref()
                    .map(|w| w.is_complete())
                    .unwrap_or(false);
                push_or_warn(&mut out, build_ack(inner));
                if complete {
                    self.complete_receiver(inner);
                } else {
                    inner.timers.arm_window(Instant::now());
                }
            }
        }
        out
    }

    fn deliver(&self, inner: &mut SessionInner, seq: u64, payload: &Bytes, ordered: &[u64]) {
        let block_size = match inner.agreed {
            Some(p) => p.block_size as u64,
            None => return,
        };
        let tx = match &inner.block_tx {
            Some(tx) => tx,
            None => return,
        };
        if inner.deliver_on_arrival {
            tx.send(BlockDelivery {
                offset: seq * block_size,
                data: payload.clone(),
            })
            .ok();
        } else if let Some(reassembler) = &inner.reassembler {
            for &s in ordered {
                if let Some(block) = reassembler.block(s) {
                    tx.send(BlockDelivery {
                        offset: s * block_size,
                        data: Bytes::copy_from_slice(block),
                    })
                    .ok();
                }
            }
        }
    }

    fn on_ack(&self, inner: &mut SessionInner, frame: &Frame) -> Vec<Bytes> {
        if inner.role != Some(Role::Sender) || inner.phase != SessionPhase::Transferring {
            return Vec::new();
        }
        let sack = lot_wire::parse_meta(&frame.meta_raw)
            .ok()
            .and_then(|meta| lot_wire::get_meta_bytes(&meta, META_SACK))
            .unwrap_or_default();
        let window = match inner.send_window.as_mut() {
            Some(win) => win,
            None => return Vec::new(),
        };
        let advanced = window.apply_ack(frame.head.seq, &sack);
        if window.is_complete() {
            self.complete_sender(inner);
            return Vec::new();
        }
        let now = Instant::now();
        let out = self.pump_sender(inner, now);
        if advanced {
            // progress restores the full retransmission budget for the window
            inner.retries = 0;
            if let Some(win) = &inner.send_window {
                if win.in_flight() > 0 {
                    inner.timers.arm_window(now);
                }
            }
        }
        out
    }

    fn on_params_update(&self, inner: &mut SessionInner, frame: &Frame) -> Vec<Bytes> {
        if !matches!(
            inner.phase,
            SessionPhase::Negotiating | SessionPhase::Transferring
        ) {
            return Vec::new();
        }
        let params = match lot_wire::parse_meta(&frame.meta_raw) {
            Ok(meta) => TransferParams::from_meta(&meta),
            Err(e) => {
                warn!(session = inner.wire_id, error = %e, "malformed parameter update");
                return Vec::new();
            }
        };
        if negotiate::validate_update(&params).is_err() {
            warn!(session = inner.wire_id, "rejecting update to frozen parameters");
            return Vec::new();
        }
        if let Some(agreed) = inner.agreed.as_mut() {
            agreed.apply_update(&params);
            let (timeout, inactivity) = (agreed.timeout, agreed.inactivity_timeout);
            inner.timers.set_budgets(timeout, inactivity);
        } else {
            merge_params(&mut inner.proposed, &params);
        }
        self.emit(SessionEvent::MetadataChanged {
            handle: self.handle,
            params,
        });
        Vec::new()
    }

    fn on_abort(&self, inner: &mut SessionInner, frame: &Frame) -> Vec<Bytes> {
        if inner.phase.is_terminal() {
            return Vec::new();
        }
        debug!(session = inner.wire_id, reason = ?frame.head.reason, "peer aborted");
        inner.phase = SessionPhase::Aborted;
        inner.timers.cancel();
        self.outcome.send_replace(Some(Outcome::Aborted));
        self.emit(SessionEvent::Failed {
            handle: self.handle,
            reason: FailureReason::PeerAborted(frame.head.reason),
        });
        Vec::new()
    }

    /// Push every eligible unsent block and pace the window timer
    fn pump_sender(&self, inner: &mut SessionInner, now: Instant) -> Vec<Bytes> {
        let mut out = Vec::new();
        let (window, segmenter, object) = match (
            inner.send_window.as_mut(),
            inner.segmenter,
            inner.object.as_ref(),
        ) {
            (Some(w), Some(s), Some(o)) => (w, s, o),
            _ => return out,
        };
        for seq in window.unsent() {
            let payload = match segmenter.slice(object, seq) {
                Some(p) => p,
                None => continue,
            };
            let frame = FrameBuilder::new(Header::new(MessageType::Data, inner.wire_id, seq))
                .payload(payload)
                .build(inner.max_datagram);
            if let Ok(dgram) = &frame {
                debug!(session = inner.wire_id, seq, len = dgram.len(), "sending block");
            }
            push_or_warn(&mut out, frame);
            window.mark_sent(seq, now);
        }
        if window.in_flight() > 0 {
            inner.timers.arm_window(now);
        }
        out
    }

    /// One of the armed deadlines fired
    pub(crate) fn on_timer(&self, inner: &mut SessionInner, now: Instant) -> Vec<Bytes> {
        let expired = match inner.timers.expired(now) {
            Some(kind) => kind,
            None => return Vec::new(),
        };
        if expired == TimerKind::Inactivity {
            debug!(session = inner.wire_id, "inactivity timeout");
            self.fail(inner, FailureReason::InactivityTimeout);
            return Vec::new();
        }

        let budget = inner
            .agreed
            .unwrap_or_else(|| negotiate::resolve_local(&inner.proposed));
        match (inner.role, inner.phase) {
            (Some(Role::Sender), SessionPhase::Negotiating) => {
                inner.retries += 1;
                if inner.retries > budget.num_retransmission {
                    self.fail(inner, FailureReason::RetriesExhausted);
                    return Vec::new();
                }
                debug!(session = inner.wire_id, retry = inner.retries, "reannouncing");
                inner.timers.arm_window(now);
                let mut out = Vec::new();
                push_or_warn(&mut out, build_announce(inner, inner.resume_pending));
                out
            }
            (Some(Role::Sender), SessionPhase::Transferring) => {
                inner.retries += 1;
                if inner.retries > budget.num_retransmission {
                    self.fail(inner, FailureReason::RetriesExhausted);
                    return Vec::new();
                }
                let mut out = Vec::new();
                let outstanding = inner
                    .send_window
                    .as_ref()
                    .map(|w| w.outstanding())
                    .unwrap_or_default();
                debug!(
                    session = inner.wire_id,
                    retry = inner.retries,
                    blocks = outstanding.len(),
                    "window timeout, retransmitting"
                );
                if let (Some(segmenter), Some(object)) = (inner.segmenter, inner.object.as_ref()) {
                    for seq in &outstanding {
                        if let Some(payload) = segmenter.slice(object, *seq) {
                            let frame =
                                FrameBuilder::new(Header::new(MessageType::Data, inner.wire_id, *seq))
                                    .payload(payload)
                                    .build(inner.max_datagram);
                            push_or_warn(&mut out, frame);
                        }
                    }
                }
                if let Some(window) = inner.send_window.as_mut() {
                    for seq in outstanding {
                        window.mark_sent(seq, now);
                    }
                }
                inner.timers.arm_window(now);
                out
            }
            (Some(Role::Receiver), SessionPhase::Transferring) => {
                // nudge a stalled sender with the current ack
                inner.timers.arm_window(now);
                let mut out = Vec::new();
                push_or_warn(&mut out, build_ack(inner));
                out
            }
            _ => {
                inner.timers.clear_window();
                Vec::new()
            }
        }
    }

    fn complete_sender(&self, inner: &mut SessionInner) {
        inner.phase = SessionPhase::Completed;
        inner.timers.cancel();
        self.outcome.send_replace(Some(Outcome::Completed(None)));
        self.emit(SessionEvent::Complete {
            handle: self.handle,
        });
        debug!(session = inner.wire_id, "object fully acknowledged");
    }

    fn complete_receiver(&self, inner: &mut SessionInner) {
        inner.phase = SessionPhase::Completed;
        inner.timers.cancel();
        let object = inner.reassembler.take().map(Reassembler::into_object);
        self.outcome.send_replace(Some(Outcome::Completed(object)));
        self.emit(SessionEvent::Complete {
            handle: self.handle,
        });
        debug!(session = inner.wire_id, size = inner.object_size, "object assembled");
    }

    pub(crate) fn stats(&self, inner: &SessionInner) -> SessionStats {
        let base = match inner.role {
            Some(Role::Sender) => inner.send_window.as_ref().map(|w| w.base()).unwrap_or(0),
            Some(Role::Receiver) => inner.recv_window.as_ref().map(|w| w.base()).unwrap_or(0),
            None => 0,
        };
        let blocks_total = inner
            .agreed
            .map(|p| Segmenter::new(p.block_size).block_count(inner.object_size as usize))
            .unwrap_or(0);
        SessionStats {
            phase: inner.phase,
            role: inner.role,
            base,
            retries: inner.retries,
            blocks_total,
        }
    }
}

/// Overwrite the fields `update` explicitly sets
pub(crate) fn merge_params(target: &mut TransferParams, update: &TransferParams) {
    if update.block_size.is_some() {
        target.block_size = update.block_size;
    }
    if update.window_size.is_some() {
        target.window_size = update.window_size;
    }
    if update.timeout_ms.is_some() {
        target.timeout_ms = update.timeout_ms;
    }
    if update.num_retransmission.is_some() {
        target.num_retransmission = update.num_retransmission;
    }
    if update.inactivity_timeout_ms.is_some() {
        target.inactivity_timeout_ms = update.inactivity_timeout_ms;
    }
}

fn push_or_warn(out: &mut Vec<Bytes>, frame: Result<Bytes, CodecError>) {
    match frame {
        Ok(dgram) => out.push(dgram),
        Err(e) => warn!(error = %e, "dropping unencodable frame"),
    }
}

/// Announcement carrying the object size and our parameter position
fn build_announce(inner: &SessionInner, resume: bool) -> Result<Bytes, CodecError> {
    let params = match (resume, inner.agreed) {
        (true, Some(agreed)) => agreed.to_wire(),
        _ => inner.proposed,
    };
    let mut flags = Flags::empty();
    if resume {
        flags |= Flags::RESUME;
    }
    FrameBuilder::new(Header::new(MessageType::Announce, inner.wire_id, 0))
        .flags(flags)
        .meta_insert_u64(negotiate::META_OBJECT_SIZE, inner.object_size)
        .meta_params(&params)
        .build(inner.max_datagram)
}

/// Echoed announcement confirming the agreed parameter set
pub(crate) fn build_echo(inner: &SessionInner, resume: bool) -> Result<Bytes, CodecError> {
    let agreed = inner.agreed.ok_or(CodecError::MetaEncode)?;
    let mut flags = Flags::ECHO;
    if resume {
        flags |= Flags::RESUME;
    }
    FrameBuilder::new(Header::new(MessageType::Announce, inner.wire_id, 0))
        .flags(flags)
        .meta_insert_u64(negotiate::META_OBJECT_SIZE, inner.object_size)
        .meta_params(&agreed.to_wire())
        .build(inner.max_datagram)
}

/// Cumulative ack with the selective bitmap above the base
pub(crate) fn build_ack(inner: &SessionInner) -> Result<Bytes, CodecError> {
    let window = inner.recv_window.as_ref().ok_or(CodecError::MetaEncode)?;
    let mut builder =
        FrameBuilder::new(Header::new(MessageType::Ack, inner.wire_id, window.base()));
    let sack = window.sack_bytes();
    if !sack.is_empty() {
        builder = builder.meta_insert_bytes(META_SACK, &sack);
    }
    builder.build(inner.max_datagram)
}

/// Mid-session update to the mutable parameters
pub(crate) fn build_params_update(
    inner: &SessionInner,
    params: &TransferParams,
) -> Result<Bytes, CodecError> {
    FrameBuilder::new(Header::new(MessageType::ParamsUpdate, inner.wire_id, 0))
        .meta_params(params)
        .build(inner.max_datagram)
}
