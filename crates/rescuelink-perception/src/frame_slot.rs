//! Single-slot, most-recent-wins frame handoff.
//!
//! The frame grabber publishes every captured frame into the slot; the
//! perception loop takes whatever is newest.  A frame that is overwritten
//! before the consumer gets to it is never processed, only counted.  The
//! publisher never waits on the consumer.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug)]
struct Slot<T> {
    seq: u64,
    frame: Option<Arc<T>>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self { seq: 0, frame: None }
    }
}

/// Create a connected publisher/subscriber pair.
pub fn frame_slot<T>() -> (FramePublisher<T>, FrameSubscriber<T>) {
    let (tx, rx) = watch::channel(Slot::default());
    (
        FramePublisher { tx },
        FrameSubscriber {
            rx,
            last_seq: 0,
            skipped: 0,
        },
    )
}

/// Write half of the slot, held by the frame grabber.
pub struct FramePublisher<T> {
    tx: watch::Sender<Slot<T>>,
}

impl<T> FramePublisher<T> {
    /// Overwrite the slot with `frame`, returning its sequence number
    /// (starting at 1).
    pub fn publish(&self, frame: T) -> u64 {
        let mut seq = 0;
        self.tx.send_modify(|slot| {
            slot.seq += 1;
            slot.frame = Some(Arc::new(frame));
            seq = slot.seq;
        });
        seq
    }

    /// `true` once the subscriber has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A frame taken from the slot.
#[derive(Debug)]
pub struct LatestFrame<T> {
    pub seq: u64,
    pub frame: Arc<T>,
    /// Frames overwritten since the previous take.
    pub skipped: u64,
}

/// Read half of the slot, held by the perception loop.
pub struct FrameSubscriber<T> {
    rx: watch::Receiver<Slot<T>>,
    last_seq: u64,
    skipped: u64,
}

impl<T> FrameSubscriber<T> {
    /// Take the newest frame if one arrived since the last take.
    pub fn try_take(&mut self) -> Option<LatestFrame<T>> {
        match self.rx.has_changed() {
            Ok(true) => self.take_current(),
            // Closed: a final frame may still be unread.
            Err(_) => self.take_current(),
            Ok(false) => None,
        }
    }

    /// Wait for the next frame.  Returns `None` once the publisher is gone
    /// and no unread frame remains.
    pub async fn next(&mut self) -> Option<LatestFrame<T>> {
        loop {
            if let Some(frame) = self.take_current() {
                return Some(frame);
            }
            if self.rx.changed().await.is_err() {
                return self.take_current();
            }
        }
    }

    /// Total frames overwritten before they could be taken.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn take_current(&mut self) -> Option<LatestFrame<T>> {
        let (seq, frame) = {
            let slot = self.rx.borrow_and_update();
            (slot.seq, slot.frame.clone())
        };
        if seq <= self.last_seq {
            return None;
        }
        let frame = frame?;
        let skipped = seq - self.last_seq - 1;
        self.last_seq = seq;
        self.skipped += skipped;
        Some(LatestFrame {
            seq,
            frame,
            skipped,
        })
    }
}
