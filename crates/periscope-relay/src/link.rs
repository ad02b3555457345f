//! Transport link handles.
//!
//! A [`LinkHandle`] is the registry-facing side of one live connection; the
//! [`LinkReceiver`] is held by the connection's writer task. Control
//! messages travel through a bounded FIFO outbox. Frames go through a
//! single-slot latest-frame gate: when the writer has not yet drained the
//! previous frame, offering a new one overwrites it and bumps the dropped
//! counter, so streaming backpressure can never fill the control outbox or
//! stall command dispatch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Notify};
use uuid::Uuid;

use periscope_proto::{Envelope, EnvelopeBody, Frame};
use periscope_types::{LinkRole, RelayError, UserId};

/// Capacity of the per-link control outbox.
const CONTROL_OUTBOX_CAPACITY: usize = 64;

/// Single-slot frame gate with a drop counter.
///
/// Latest-frame-wins: `offer` replaces any unconsumed frame and counts the
/// replacement as a drop.
#[derive(Debug)]
pub struct FrameGate {
    slot: Mutex<Option<Frame>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl FrameGate {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Place a frame in the slot, overwriting any unconsumed one.
    pub fn offer(&self, frame: Frame) {
        let mut slot = self.slot.lock().expect("frame gate lock");
        if slot.replace(frame).is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        drop(slot);
        self.notify.notify_one();
    }

    /// Take the pending frame, if any.
    pub fn take(&self) -> Option<Frame> {
        self.slot.lock().expect("frame gate lock").take()
    }

    /// Wait until a frame may be pending.
    pub async fn ready(&self) {
        self.notify.notified().await;
    }

    /// Frames overwritten before they could be sent.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The writer-task side of a link: drains control messages and frames.
pub struct LinkReceiver {
    /// FIFO control outbox.
    pub control_rx: mpsc::Receiver<Envelope>,
    /// Latest-frame gate shared with the handle.
    pub frames: Arc<FrameGate>,
    /// Becomes `true` when the link is closed.
    pub closed_rx: watch::Receiver<bool>,
}

/// Registry-facing handle for one live connection.
///
/// Cloneable; all clones refer to the same underlying link.
#[derive(Clone)]
pub struct LinkHandle {
    id: Uuid,
    user: UserId,
    role: LinkRole,
    control_tx: mpsc::Sender<Envelope>,
    frames: Arc<FrameGate>,
    closed_tx: watch::Sender<bool>,
    last_activity: Arc<Mutex<Instant>>,
    next_seq: Arc<AtomicU64>,
}

impl LinkHandle {
    /// Create a link and its writer-side receiver.
    pub fn open(user: UserId, role: LinkRole) -> (Self, LinkReceiver) {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_OUTBOX_CAPACITY);
        let (closed_tx, closed_rx) = watch::channel(false);
        let frames = Arc::new(FrameGate::new());
        let handle = Self {
            id: Uuid::new_v4(),
            user,
            role,
            control_tx,
            frames: Arc::clone(&frames),
            closed_tx,
            last_activity: Arc::new(Mutex::new(Instant::now())),
            next_seq: Arc::new(AtomicU64::new(0)),
        };
        let receiver = LinkReceiver {
            control_rx,
            frames,
            closed_rx,
        };
        (handle, receiver)
    }

    /// Unique identifier of this link instance.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The user this link belongs to.
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// The role of this link within the session.
    pub fn role(&self) -> LinkRole {
        self.role
    }

    /// Fire-and-forget send of a control message, preserving FIFO order.
    ///
    /// Fails if the link is closed or its outbox is saturated; frames must
    /// go through [`offer_frame`](Self::offer_frame) instead so they can
    /// never exhaust this queue.
    pub fn send(&self, body: EnvelopeBody) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::Transport("link is closed".into()));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope::new(self.user.clone(), seq, body);
        self.control_tx
            .try_send(envelope)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    RelayError::Transport("link outbox saturated".into())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    RelayError::Transport("link writer gone".into())
                }
            })
    }

    /// Offer a frame under the latest-frame-wins policy. Never blocks and
    /// never fails; an unconsumed predecessor is dropped and counted.
    pub fn offer_frame(&self, frame: Frame) {
        self.frames.offer(frame);
    }

    /// Frames dropped on this link due to backpressure.
    pub fn frames_dropped(&self) -> u64 {
        self.frames.dropped()
    }

    /// Record inbound traffic for liveness tracking.
    pub fn touch(&self) {
        *self.last_activity.lock().expect("activity lock") = Instant::now();
    }

    /// Time since the last inbound traffic.
    pub fn idle(&self) -> Duration {
        self.last_activity.lock().expect("activity lock").elapsed()
    }

    /// Close the link. Idempotent; wakes the writer task.
    pub fn close(&self) {
        let _ = self.closed_tx.send(true);
    }

    /// Whether the link has been closed.
    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// A watch receiver that flips to `true` when the link closes.
    pub fn closed_watch(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }
}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandle")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("role", &self.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link() -> (LinkHandle, LinkReceiver) {
        LinkHandle::open(UserId::new("u1"), LinkRole::Agent)
    }

    #[tokio::test]
    async fn control_messages_preserve_fifo_order() {
        let (handle, mut rx) = link();
        handle.send(EnvelopeBody::Ping).unwrap();
        handle.send(EnvelopeBody::Pong).unwrap();

        let first = rx.control_rx.recv().await.unwrap();
        let second = rx.control_rx.recv().await.unwrap();
        assert!(matches!(first.body, EnvelopeBody::Ping));
        assert!(matches!(second.body, EnvelopeBody::Pong));
        assert!(first.sequence < second.sequence);
    }

    #[tokio::test]
    async fn frame_gate_keeps_only_the_latest() {
        let (handle, rx) = link();
        for seq in 0..1000 {
            handle.offer_frame(Frame::new(seq, vec![0]));
        }
        let frame = rx.frames.take().unwrap();
        assert_eq!(frame.sequence, 999);
        assert_eq!(handle.frames_dropped(), 999);
        assert!(rx.frames.take().is_none());
    }

    #[tokio::test]
    async fn frames_never_consume_control_capacity() {
        let (handle, mut rx) = link();
        for seq in 0..10_000 {
            handle.offer_frame(Frame::new(seq, vec![0]));
        }
        handle.send(EnvelopeBody::Ping).unwrap();
        let msg = rx.control_rx.recv().await.unwrap();
        assert!(matches!(msg.body, EnvelopeBody::Ping));
    }

    #[tokio::test]
    async fn send_fails_after_close() {
        let (handle, _rx) = link();
        handle.close();
        assert!(handle.is_closed());
        assert!(matches!(
            handle.send(EnvelopeBody::Ping),
            Err(RelayError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn saturated_outbox_is_reported() {
        let (handle, _rx) = link();
        let mut result = Ok(());
        for _ in 0..=CONTROL_OUTBOX_CAPACITY {
            result = handle.send(EnvelopeBody::Ping);
        }
        assert!(matches!(result, Err(RelayError::Transport(_))));
    }
}
