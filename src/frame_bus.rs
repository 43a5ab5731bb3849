//! Single-slot mailbox between the capture and inference loops.
//!
//! `publish` overwrites whatever is in the slot, so a slow reader only ever
//! sees the newest frame. The lock is held for the copy in or out and never
//! across processing.

use parking_lot::Mutex;

use crate::frame::Frame;

#[derive(Debug, Default)]
pub struct FrameBus {
    slot: Mutex<Option<Frame>>,
}

impl FrameBus {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Replaces the slot content. Ownership of `frame` moves into the bus.
    pub fn publish(&self, frame: Frame) {
        let old = self.slot.lock().replace(frame);
        // the previous buffer is released outside the lock
        drop(old);
    }

    /// Independent copy of the most recent frame, `None` before the first publish.
    pub fn take(&self) -> Option<Frame> {
        self.slot.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_take_before_publish_is_none() {
        let bus = FrameBus::new();
        assert!(bus.take().is_none());
    }

    #[test]
    fn test_take_returns_independent_copy() {
        let bus = FrameBus::new();
        let frame = Frame::blank(4, 3, 1);
        bus.publish(frame.clone());

        let mut copy = bus.take().unwrap();
        assert_eq!(copy, frame);

        copy.pixels.fill(255);
        copy.seq = 99;

        let again = bus.take().unwrap();
        assert_eq!(again, frame);
        assert!(again.pixels.iter().all(|&p| p == 0));
    }

    #[test]
    fn test_publish_overwrites() {
        let bus = FrameBus::new();
        bus.publish(Frame::blank(2, 2, 1));
        bus.publish(Frame::blank(2, 2, 2));
        bus.publish(Frame::blank(2, 2, 3));

        assert_eq!(bus.take().unwrap().seq, 3);
    }

    #[test]
    fn test_reader_never_sees_torn_frame() {
        let bus = Arc::new(FrameBus::new());

        let writer = {
            let bus = Arc::clone(&bus);
            thread::spawn(move || {
                for seq in 0..500u64 {
                    let mut frame = Frame::blank(16, 16, seq);
                    frame.pixels.fill((seq % 251) as u8);
                    bus.publish(frame);
                }
            })
        };

        for _ in 0..500 {
            if let Some(frame) = bus.take() {
                let first = frame.pixels[[0, 0, 0]];
                assert!(frame.pixels.iter().all(|&p| p == first));
                assert_eq!(first, (frame.seq % 251) as u8);
            }
        }

        writer.join().unwrap();
    }
}
