//! Outgoing frame queue
//!
//! A multi-producer, single-consumer ordered sink between the public API
//! plus the read pump on one side and the write pump on the other. The
//! write pump is the only consumer and the only writer to the transport.
//!
//! Header blocks are enqueued as a single [`QueueItem::Block`] so a
//! HEADERS + CONTINUATION run can never be interleaved with frames from
//! another producer.

use crate::frames::Frame;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// One unit of work for the write pump
pub enum QueueItem {
    /// A single frame
    Frame(Frame),
    /// An atomic run of frames (a header block); written back-to-back
    Block(Vec<Frame>),
    /// Wake the consumer to retry flow-gated DATA
    Poke,
    /// Drain request; the consumer acks once everything before it is written
    Flush(Sender<()>),
    /// Stop the consumer
    Shutdown,
}

/// Producer handle to the outgoing queue
#[derive(Clone)]
pub struct OutgoingQueue {
    tx: Sender<QueueItem>,
    disposed: Arc<AtomicBool>,
}

/// Consumer side, owned by the write pump
pub struct QueueConsumer {
    rx: Receiver<QueueItem>,
}

/// Create a connected queue/consumer pair
pub fn channel() -> (OutgoingQueue, QueueConsumer) {
    let (tx, rx) = unbounded();
    (
        OutgoingQueue {
            tx,
            disposed: Arc::new(AtomicBool::new(false)),
        },
        QueueConsumer { rx },
    )
}

impl OutgoingQueue {
    /// Enqueue one frame; non-blocking, order-preserving per producer
    pub fn enqueue(&self, frame: Frame) {
        if self.disposed.load(Ordering::Acquire) {
            trace!(frame = frame.type_name(), "dropping frame, queue disposed");
            return;
        }
        let _ = self.tx.send(QueueItem::Frame(frame));
    }

    /// Enqueue an atomic run of frames
    ///
    /// The consumer writes the run without interleaving any other item,
    /// which keeps header blocks contiguous on the wire.
    pub fn enqueue_block(&self, frames: Vec<Frame>) {
        if self.disposed.load(Ordering::Acquire) {
            trace!("dropping frame block, queue disposed");
            return;
        }
        let _ = self.tx.send(QueueItem::Block(frames));
    }

    /// Wake the consumer to retry flow-gated DATA frames
    pub fn poke(&self) {
        if self.disposed.load(Ordering::Acquire) {
            return;
        }
        let _ = self.tx.send(QueueItem::Poke);
    }

    /// Drain pending frames, waiting up to `timeout` for confirmation
    ///
    /// Returns true once the consumer has written everything enqueued
    /// before this call. Returns false if the consumer is gone or the
    /// timeout expires.
    pub fn flush(&self, timeout: Duration) -> bool {
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        if self.tx.send(QueueItem::Flush(ack_tx)).is_err() {
            return false;
        }
        ack_rx.recv_timeout(timeout).is_ok()
    }

    /// Stop the consumer; idempotent
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(QueueItem::Shutdown);
    }

    /// Whether the queue was disposed
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl QueueConsumer {
    /// Receive the next item, waiting up to `timeout`
    pub fn recv_timeout(&self, timeout: Duration) -> Result<QueueItem, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}
