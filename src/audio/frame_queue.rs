//! Bounded drop-oldest frame queues shared by the capture producer and its consumers.
//!
//! Each queue is a bounded crossbeam channel. The producer keeps a receiver
//! clone of every queue so that a full queue can shed its oldest frame
//! instead of blocking the capture thread.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

/// One captured period, one `Vec` per channel.
pub type Frame = Vec<Vec<i16>>;

/// A frame shared read-only between consumers.
pub type SharedFrame = Arc<Frame>;

/// Producer side of one bounded queue.
pub struct FrameQueue {
    tx: Sender<SharedFrame>,
    evict: Receiver<SharedFrame>,
}

impl FrameQueue {
    pub fn bounded(capacity: usize) -> (Self, Receiver<SharedFrame>) {
        let (tx, rx) = bounded(capacity.max(1));
        let queue = Self {
            tx,
            evict: rx.clone(),
        };
        (queue, rx)
    }

    /// Push `frame`, evicting the oldest entries while the queue is full.
    /// Returns how many frames were dropped.
    ///
    /// A consumer that pops between the full check and the eviction can
    /// still make this drop one frame more than strictly needed.
    pub fn push(&self, frame: SharedFrame) -> usize {
        let mut frame = frame;
        let mut dropped = 0;
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => return dropped,
                Err(TrySendError::Full(f)) => {
                    // the consumer may have made room since the failed send
                    if self.tx.is_full() && self.evict.try_recv().is_ok() {
                        dropped += 1;
                    }
                    frame = f;
                }
                // The producer holds a receiver, so the channel cannot disconnect
                Err(TrySendError::Disconnected(_)) => return dropped,
            }
        }
    }
}

/// The encode and localize queues fed from one producer.
pub struct FrameQueues {
    encode: FrameQueue,
    localize: FrameQueue,
}

/// Consumer ends returned by [`FrameQueues::new`].
pub struct FrameReceivers {
    pub encode: Receiver<SharedFrame>,
    pub localize: Receiver<SharedFrame>,
}

impl FrameQueues {
    pub fn new(capacity: usize) -> (Self, FrameReceivers) {
        let (encode, encode_rx) = FrameQueue::bounded(capacity);
        let (localize, localize_rx) = FrameQueue::bounded(capacity);
        (
            Self { encode, localize },
            FrameReceivers {
                encode: encode_rx,
                localize: localize_rx,
            },
        )
    }

    /// Share one frame with both consumers. Returns the frames evicted from
    /// the (encode, localize) queues.
    pub fn push(&self, frame: Frame) -> (usize, usize) {
        let frame = Arc::new(frame);
        let dropped_encode = self.encode.push(frame.clone());
        let dropped_localize = self.localize.push(frame);
        (dropped_encode, dropped_localize)
    }
}
