use crate::segmentation::{ColorFrame, Frame};
use parking_lot::{Condvar, Mutex};

/// Inbound frames, newest first
pub type FrameChannel = Mailbox<Frame>;

/// Outbound colorized frames, newest first
pub type ResultChannel = Mailbox<ColorFrame>;

/// Depth-1 latest-wins mailbox
///
/// Posting while an item is still pending replaces it; consumers only ever
/// see the newest item, never a backlog.
pub struct Mailbox<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

struct Slot<T> {
    pending: Option<T>,
    closed: bool,
    dropped: u64,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                pending: None,
                closed: false,
                dropped: 0,
            }),
            ready: Condvar::new(),
        }
    }

    /// Post an item, returning the unconsumed item it replaced
    ///
    /// Items posted after [`Mailbox::close`] are discarded and returned.
    pub fn post(&self, item: T) -> Option<T> {
        let mut slot = self.slot.lock();
        if slot.closed {
            return Some(item);
        }

        let replaced = slot.pending.replace(item);
        if replaced.is_some() {
            slot.dropped += 1;
        }
        drop(slot);

        self.ready.notify_one();
        replaced
    }

    /// Block until an item is available
    ///
    /// Returns `None` once the mailbox is closed and drained.
    pub fn take(&self) -> Option<T> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(item) = slot.pending.take() {
                return Some(item);
            }
            if slot.closed {
                return None;
            }
            self.ready.wait(&mut slot);
        }
    }

    #[cfg(test)]
    pub(crate) fn try_take(&self) -> Option<T> {
        self.slot.lock().pending.take()
    }

    /// Stop accepting items and wake blocked consumers
    ///
    /// A pending item stays available to the next `take`.
    pub fn close(&self) {
        self.slot.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.slot.lock().closed
    }

    /// Number of items replaced before a consumer took them
    pub fn dropped(&self) -> u64 {
        self.slot.lock().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn newer_item_replaces_pending_one() {
        let mailbox = Mailbox::new();

        assert_eq!(mailbox.post(1), None);
        assert_eq!(mailbox.post(2), Some(1));
        assert_eq!(mailbox.dropped(), 1);
        assert_eq!(mailbox.try_take(), Some(2));
        assert_eq!(mailbox.try_take(), None);
    }

    #[test]
    fn close_drains_pending_then_ends() {
        let mailbox = Mailbox::new();
        mailbox.post("last");
        mailbox.close();

        assert_eq!(mailbox.post("late"), Some("late"));
        assert_eq!(mailbox.take(), Some("last"));
        assert_eq!(mailbox.take(), None);
        assert!(mailbox.is_closed());
    }

    #[test]
    fn take_blocks_until_post() {
        let mailbox = Arc::new(Mailbox::new());
        let consumer = {
            let mailbox = mailbox.clone();
            thread::spawn(move || mailbox.take())
        };

        thread::sleep(Duration::from_millis(20));
        mailbox.post(7u32);

        assert_eq!(consumer.join().unwrap(), Some(7));
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let mailbox: Arc<Mailbox<u32>> = Arc::new(Mailbox::new());
        let consumer = {
            let mailbox = mailbox.clone();
            thread::spawn(move || mailbox.take())
        };

        thread::sleep(Duration::from_millis(20));
        mailbox.close();

        assert_eq!(consumer.join().unwrap(), None);
    }
}
